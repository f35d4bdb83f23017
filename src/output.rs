// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/output.rs - 诊断结果输出
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
use url::Url;

use crate::input::XrayImage;
use crate::service::DiagnosisReport;
use crate::{FromUrl, FromUrlWithScheme};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

mod log_output;
pub use self::log_output::{LogOutput, LogOutputError};

#[cfg(feature = "save_json_file")]
mod save_json_file;
#[cfg(feature = "save_json_file")]
pub use self::save_json_file::{SaveJsonFileError, SaveJsonFileOutput};

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("日志输出错误: {0}")]
  LogOutputError(#[from] LogOutputError),
  #[cfg(feature = "save_json_file")]
  #[error("保存 JSON 文件错误: {0}")]
  SaveJsonFileError(#[from] SaveJsonFileError),
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  LogOutput(LogOutput),
  #[cfg(feature = "save_json_file")]
  SaveJsonFileOutput(SaveJsonFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => {
        let output = LogOutput::from_url(url)?;
        Ok(OutputWrapper::LogOutput(output))
      }
      #[cfg(feature = "save_json_file")]
      SaveJsonFileOutput::SCHEME => {
        let output = SaveJsonFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveJsonFileOutput(output))
      }
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<XrayImage, DiagnosisReport> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &XrayImage, result: &DiagnosisReport) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::LogOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "save_json_file")]
      OutputWrapper::SaveJsonFileOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}
