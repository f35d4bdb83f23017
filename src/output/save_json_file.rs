// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/output/save_json_file.rs - 保存 JSON 诊断报告
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

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::input::XrayImage;
use crate::output::Render;
use crate::service::DiagnosisReport;
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum SaveJsonFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `json:///path/report.json`。
///
/// 每次输出后整个文件重写为目前为止所有报告组成的数组，
/// 中途退出时文件仍是完整的 JSON。
pub struct SaveJsonFileOutput {
  path: PathBuf,
  reports: Mutex<Vec<serde_json::Value>>,
}

impl FromUrlWithScheme for SaveJsonFileOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for SaveJsonFileOutput {
  type Error = SaveJsonFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveJsonFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveJsonFileOutput {
      path: PathBuf::from(url_path(uri)),
      reports: Mutex::new(Vec::new()),
    })
  }
}

impl SaveJsonFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save_reports(&self, reports: &[serde_json::Value]) -> Result<(), SaveJsonFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(reports)?;
    std::fs::write(&self.path, content)?;
    Ok(())
  }
}

impl Render<XrayImage, DiagnosisReport> for SaveJsonFileOutput {
  type Error = SaveJsonFileError;

  fn render_result(&self, _frame: &XrayImage, result: &DiagnosisReport) -> Result<(), Self::Error> {
    let value = serde_json::to_value(result)?;
    let mut reports = self
      .reports
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    reports.push(value);
    self.save_reports(&reports)?;

    info!(
      "保存诊断报告到文件: {} (共 {} 条)",
      self.path.display(),
      reports.len()
    );
    Ok(())
  }
}
