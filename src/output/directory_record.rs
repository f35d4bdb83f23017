// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/output/directory_record.rs - 按日期归档诊断记录
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

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::input::XrayImage;
use crate::output::Render;
use crate::service::DiagnosisReport;
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Serialize)]
struct Record<'a> {
  recorded_at: String,
  source_path: String,
  report: &'a DiagnosisReport,
}

/// `folder:///path/to/records[?always]`。
///
/// 记录写到 `YYYY/MM/DD/HH-MM-SS-NNNN.json`，`NNNN` 为十六进制序号，
/// 文件已存在时换下一个序号，不会覆盖已有记录。
/// 默认只记录真实模型的结果，带 `always` 时演示结果也会记录。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  record_counters: Arc<Mutex<u16>>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_path(uri)),
      record_counters: Arc::new(Mutex::new(0)),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn record_id(&self) -> u16 {
    let mut counter = self
      .record_counters
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  /// 新建记录文件
  fn create_record(&self, now: &DateTime<Utc>) -> Result<(PathBuf, File), DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    // 序号回绕一整圈仍冲突时放弃
    for _ in 0..=u16::MAX {
      let path = directory.join(format!(
        "{}-{:04X}.json",
        now.format("%H-%M-%S"),
        self.record_id()
      ));
      match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => return Ok((path, file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
          debug!("记录文件已存在, 换下一个序号: {}", path.display());
        }
        Err(e) => return Err(e.into()),
      }
    }
    Err(std::io::Error::new(ErrorKind::AlreadyExists, "同一秒内的记录序号已用尽").into())
  }
}

impl Render<XrayImage, DiagnosisReport> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &XrayImage, result: &DiagnosisReport) -> Result<(), Self::Error> {
    if !self.always && result.model_source.is_none() {
      debug!("跳过演示结果的记录: {}", frame.file_name());
      return Ok(());
    }

    let now = Utc::now();
    let record = Record {
      recorded_at: now.to_rfc3339(),
      source_path: frame.path().display().to_string(),
      report: result,
    };
    let content = serde_json::to_string_pretty(&record)?;
    let (path, mut file) = self.create_record(&now)?;
    file.write_all(content.as_bytes())?;
    debug!("诊断记录已写入: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{DiagnosisOutcome, OutcomeSource, SourceTag};
  use std::time::Duration;
  use url::Url;

  fn report(model_source: Option<SourceTag>) -> DiagnosisReport {
    let source = match model_source {
      Some(_) => OutcomeSource::Model,
      None => OutcomeSource::Demo,
    };
    DiagnosisReport {
      image: "scan.png".to_string(),
      outcome: DiagnosisOutcome::from_score(0.7, source, Duration::from_millis(4)),
      preprocessing_time: Duration::from_millis(8),
      inference_time: Duration::from_millis(4),
      model_source,
    }
  }

  fn records(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
      for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          pending.push(path);
        } else {
          found.push(path);
        }
      }
    }
    found.sort();
    found
  }

  #[test]
  fn demo_results_need_always() {
    let dir = tempfile::tempdir().unwrap();
    let frame = XrayImage::new("/data/scan.png");

    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    output.render_result(&frame, &report(None)).unwrap();
    assert!(records(dir.path()).is_empty());

    output
      .render_result(&frame, &report(Some(SourceTag::Direct)))
      .unwrap();
    assert_eq!(records(dir.path()).len(), 1);

    let url = Url::parse(&format!("folder://{}?always", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    output.render_result(&frame, &report(None)).unwrap();
    assert_eq!(records(dir.path()).len(), 2);
  }

  #[test]
  fn records_are_dated_and_numbered() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}?always", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.directory(), dir.path());

    for _ in 0..3 {
      output
        .render_result(&XrayImage::new("/data/scan.png"), &report(Some(SourceTag::ConfigPatch)))
        .unwrap();
    }

    let found = records(dir.path());
    assert_eq!(found.len(), 3);
    let relative = found[0].strip_prefix(dir.path()).unwrap();
    let parts = relative
      .iter()
      .map(|p| p.to_string_lossy().into_owned())
      .collect::<Vec<_>>();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0].len(), 4);
    assert_eq!(parts[1].len(), 2);
    assert_eq!(parts[2].len(), 2);
    assert!(parts[3].ends_with(".json"));

    let mut ids = found
      .iter()
      .map(|p| {
        let stem = p.file_stem().unwrap().to_string_lossy().into_owned();
        stem.rsplit('-').next().unwrap().to_string()
      })
      .collect::<Vec<_>>();
    ids.sort();
    assert_eq!(ids, vec!["0001", "0002", "0003"]);

    let record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&found[0]).unwrap()).unwrap();
    assert_eq!(record["source_path"], "/data/scan.png");
    assert_eq!(record["report"]["model_source"], "config_patch");
  }

  #[test]
  fn outputs_sharing_a_folder_never_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}?always", dir.path().display())).unwrap();
    let first = DirectoryRecordOutput::from_url(&url).unwrap();
    let second = DirectoryRecordOutput::from_url(&url).unwrap();

    // 两个实例的序号都从 1 开始，同一秒内会撞名
    for _ in 0..3 {
      for output in [&first, &second] {
        output
          .render_result(&XrayImage::new("/data/scan.png"), &report(Some(SourceTag::Direct)))
          .unwrap();
      }
    }

    let found = records(dir.path());
    assert_eq!(found.len(), 6);
    for path in found {
      let record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
      assert_eq!(record["report"]["model_source"], "direct");
    }
  }
}
