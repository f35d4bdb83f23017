// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/service.rs - 诊断服务
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

//! 单次诊断的完整流程：校验 → 预处理 → 解析模型 → 推理，
//! 模型不可用或推理失败时改用演示预测。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::frame::XrayFrame;
use crate::input::XrayImage;
use crate::model::{
  DemoError, DemoPredictor, DiagnosisOutcome, Model, ModelResolver, OutcomeSource, SourceTag,
  serialize_secs,
};
use crate::pipeline::{self, DEFAULT_MAX_SIZE_MB, PreprocessError, ValidationIssue};
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum DiagnosisConfigError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {actual}")]
  SchemeMismatch { expected: String, actual: String },
  #[error("无效的参数 {key}={value}")]
  InvalidOption { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisConfig {
  pub model_path: PathBuf,
  pub max_size_mb: f64,
  /// 模型不可用时是否改用演示预测
  pub demo_fallback: bool,
}

impl DiagnosisConfig {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      max_size_mb: DEFAULT_MAX_SIZE_MB,
      demo_fallback: true,
    }
  }
}

impl FromUrlWithScheme for DiagnosisConfig {
  const SCHEME: &'static str = "keras";
}

impl FromUrl for DiagnosisConfig {
  type Error = DiagnosisConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DiagnosisConfigError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let mut config = DiagnosisConfig::new(url_path(url));
    for (key, value) in url.query_pairs() {
      let invalid = || DiagnosisConfigError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
      };
      match key.as_ref() {
        "max_size_mb" => {
          config.max_size_mb = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(invalid)?;
        }
        "demo" => {
          config.demo_fallback = match value.as_ref() {
            "on" | "true" | "1" => true,
            "off" | "false" | "0" => false,
            _ => return Err(invalid()),
          };
        }
        _ => warn!("忽略未知的模型参数: {}={}", key, value),
      }
    }
    Ok(config)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisReport {
  pub image: String,
  pub outcome: DiagnosisOutcome,
  #[serde(serialize_with = "serialize_secs")]
  pub preprocessing_time: Duration,
  #[serde(serialize_with = "serialize_secs")]
  pub inference_time: Duration,
  /// 使用真实模型时的加载来源
  pub model_source: Option<SourceTag>,
}

impl DiagnosisReport {
  pub fn is_demo(&self) -> bool {
    self.outcome.is_demo()
  }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
  issues
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

#[derive(Error, Debug)]
pub enum DiagnosisError {
  #[error("图像校验失败: {}", join_issues(.0))]
  Validation(Vec<ValidationIssue>),
  #[error("图像预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("模型不可用且演示模式已关闭")]
  ModelUnavailable,
  #[error("演示预测失败: {0}")]
  Demo(#[from] DemoError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

pub struct DiagnosisService<'a> {
  config: DiagnosisConfig,
  resolver: &'a ModelResolver,
  demo: DemoPredictor,
}

impl DiagnosisService<'static> {
  /// 使用进程内共享的模型解析器
  pub fn new(config: DiagnosisConfig) -> Self {
    Self::with_resolver(config, ModelResolver::global())
  }
}

impl<'a> DiagnosisService<'a> {
  pub fn with_resolver(config: DiagnosisConfig, resolver: &'a ModelResolver) -> Self {
    Self {
      config,
      resolver,
      demo: DemoPredictor,
    }
  }

  pub fn config(&self) -> &DiagnosisConfig {
    &self.config
  }

  pub fn diagnose(&self, path: impl AsRef<Path>) -> Result<DiagnosisReport, DiagnosisError> {
    let path = path.as_ref();
    self.diagnose_keyed(path, &path.to_string_lossy())
  }

  /// 上传的图像先写入系统临时目录，任何返回路径上都会删除。
  /// 演示预测以原始文件名为种子。
  pub fn diagnose_upload(&self, bytes: &[u8], file_name: &str) -> Result<DiagnosisReport, DiagnosisError> {
    self.diagnose_upload_in(&std::env::temp_dir(), bytes, file_name)
  }

  /// 同 [`Self::diagnose_upload`]，临时文件放在 `dir` 下
  pub fn diagnose_upload_in(
    &self,
    dir: &Path,
    bytes: &[u8],
    file_name: &str,
  ) -> Result<DiagnosisReport, DiagnosisError> {
    let suffix = Path::new(file_name)
      .extension()
      .map(|ext| format!(".{}", ext.to_string_lossy()))
      .unwrap_or_default();
    let mut file = tempfile::Builder::new()
      .prefix("xray-")
      .suffix(&suffix)
      .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    info!("上传图像已暂存: {} ({} 字节)", file_name, bytes.len());
    self.diagnose_keyed(file.path(), file_name)
  }

  fn diagnose_keyed(&self, path: &Path, key: &str) -> Result<DiagnosisReport, DiagnosisError> {
    let validation = pipeline::validate(path, self.config.max_size_mb);
    if !validation.valid {
      warn!("图像校验失败: {}: {}", key, join_issues(&validation.errors));
      return Err(DiagnosisError::Validation(validation.errors));
    }

    let start = Instant::now();
    let frame: XrayFrame = pipeline::preprocess(path)?;
    let preprocessing_time = start.elapsed();

    if let Some(resolved) = self.resolver.resolve(&self.config.model_path, false) {
      let start = Instant::now();
      match resolved.model.infer(&frame) {
        Ok(score) => {
          let inference_time = start.elapsed();
          let outcome = DiagnosisOutcome::from_score(score as f64, OutcomeSource::Model, inference_time);
          info!(
            "诊断完成: {} -> {} ({:.2}%, {}), 模型来源: {}",
            key,
            outcome.label,
            outcome.confidence_percentage(),
            outcome.confidence_level,
            resolved.source
          );
          return Ok(DiagnosisReport {
            image: key.to_string(),
            outcome,
            preprocessing_time,
            inference_time,
            model_source: Some(resolved.source),
          });
        }
        Err(e) => warn!("模型推理失败: {}", e),
      }
    }

    if !self.config.demo_fallback {
      return Err(DiagnosisError::ModelUnavailable);
    }

    let outcome = self.demo.predict_keyed(path, key)?;
    Ok(DiagnosisReport {
      image: key.to_string(),
      inference_time: outcome.processing_time,
      outcome,
      preprocessing_time,
      model_source: None,
    })
  }
}

impl Model for DiagnosisService<'_> {
  type Input = XrayImage;
  type Output = DiagnosisReport;
  type Error = DiagnosisError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.diagnose(input.path())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Label;
  use image::{GrayImage, Luma};

  #[test]
  fn config_from_url() {
    let url = Url::parse("keras:///opt/models/pneumonia%20v2.safetensors?max_size_mb=5&demo=off").unwrap();
    let config = DiagnosisConfig::from_url(&url).unwrap();
    assert_eq!(config.model_path, PathBuf::from("/opt/models/pneumonia v2.safetensors"));
    assert_eq!(config.max_size_mb, 5.0);
    assert!(!config.demo_fallback);

    let url = Url::parse("keras:///m.safetensors").unwrap();
    let config = DiagnosisConfig::from_url(&url).unwrap();
    assert_eq!(config.max_size_mb, DEFAULT_MAX_SIZE_MB);
    assert!(config.demo_fallback);

    assert!(DiagnosisConfig::from_url(&Url::parse("keras:///m?max_size_mb=-1").unwrap()).is_err());
    assert!(DiagnosisConfig::from_url(&Url::parse("onnx:///m").unwrap()).is_err());
  }

  #[test]
  fn validation_errors_are_returned() {
    let resolver = ModelResolver::with_strategies(Vec::new());
    let service = DiagnosisService::with_resolver(DiagnosisConfig::new("/no/model"), &resolver);
    match service.diagnose("/no/such/image.png") {
      Err(DiagnosisError::Validation(issues)) => assert_eq!(issues.len(), 1),
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn missing_model_falls_back_to_demo_unless_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.png");
    GrayImage::from_pixel(224, 224, Luma([128])).save(&path).unwrap();

    let resolver = ModelResolver::with_strategies(Vec::new());
    let config = DiagnosisConfig::new(dir.path().join("missing.safetensors"));
    let service = DiagnosisService::with_resolver(config.clone(), &resolver);
    let report = service.diagnose(&path).unwrap();
    assert!(report.is_demo());
    assert!(report.model_source.is_none());

    let strict = DiagnosisService::with_resolver(
      DiagnosisConfig {
        demo_fallback: false,
        ..config
      },
      &resolver,
    );
    assert!(matches!(
      strict.diagnose(&path),
      Err(DiagnosisError::ModelUnavailable)
    ));
  }

  fn is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
  }

  #[test]
  fn uploads_are_seeded_by_file_name_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.png");
    GrayImage::from_pixel(64, 64, Luma([40])).save(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let uploads = tempfile::tempdir().unwrap();

    let resolver = ModelResolver::with_strategies(Vec::new());
    let config = DiagnosisConfig::new("/no/model");
    let service = DiagnosisService::with_resolver(config.clone(), &resolver);
    let first = service
      .diagnose_upload_in(uploads.path(), &bytes, "patient-17.png")
      .unwrap();
    assert!(is_empty(uploads.path()));
    let second = service.diagnose_upload(&bytes, "patient-17.png").unwrap();
    assert_eq!(first.outcome.raw_score, second.outcome.raw_score);
    assert_eq!(first.image, "patient-17.png");
    assert!(matches!(first.outcome.label, Label::Normal | Label::Pneumonia));

    let garbage = service.diagnose_upload_in(uploads.path(), b"not an image", "notes.png");
    assert!(matches!(garbage, Err(DiagnosisError::Validation(_))));
    assert!(is_empty(uploads.path()));

    let strict = DiagnosisService::with_resolver(
      DiagnosisConfig {
        demo_fallback: false,
        ..config
      },
      &resolver,
    );
    let unavailable = strict.diagnose_upload_in(uploads.path(), &bytes, "patient-18.png");
    assert!(matches!(unavailable, Err(DiagnosisError::ModelUnavailable)));
    assert!(is_empty(uploads.path()));
  }

  #[test]
  fn report_serializes_times_in_seconds() {
    let report = DiagnosisReport {
      image: "a.png".to_string(),
      outcome: DiagnosisOutcome::from_score(0.1, OutcomeSource::Demo, Duration::from_millis(5)),
      preprocessing_time: Duration::from_millis(20),
      inference_time: Duration::from_millis(5),
      model_source: None,
    };
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["preprocessing_time"], 0.02);
    assert_eq!(json["outcome"]["label"], "NORMAL");
    assert!(json["model_source"].is_null());
  }
}
