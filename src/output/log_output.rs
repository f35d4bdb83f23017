// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/output/log_output.rs - 以日志形式输出诊断结果
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::input::XrayImage;
use crate::output::Render;
use crate::service::DiagnosisReport;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `stdout:`，不落盘
pub struct LogOutput;

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "stdout";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(LogOutput)
  }
}

impl Render<XrayImage, DiagnosisReport> for LogOutput {
  type Error = LogOutputError;

  fn render_result(&self, frame: &XrayImage, result: &DiagnosisReport) -> Result<(), Self::Error> {
    let outcome = &result.outcome;
    info!(
      "{}: {} 置信度 {:.2}% ({}), 原始分数 {:.4}",
      frame.file_name(),
      outcome.label,
      outcome.confidence_percentage(),
      outcome.confidence_level,
      outcome.raw_score
    );
    info!(
      "预处理 {:.3}s, 推理 {:.3}s",
      result.preprocessing_time.as_secs_f64(),
      result.inference_time.as_secs_f64()
    );
    match result.model_source {
      Some(source) => info!("模型来源: {}", source),
      None => warn!("演示模式结果, 仅供界面演示, 不可用于诊断"),
    }
    Ok(())
  }
}
