// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/input.rs - 图像输入
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

use thiserror::Error;

use crate::FromUrl;

/// 待诊断的一张图像。只记录位置，解码交给诊断流程，
/// 校验需要看到原始文件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrayImage {
  path: PathBuf,
}

impl XrayImage {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn file_name(&self) -> String {
    self
      .path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| self.path.display().to_string())
  }
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "read_directory")]
mod read_directory;
#[cfg(feature = "read_directory")]
pub use self::read_directory::{DirectoryInput, DirectoryInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "read_directory")]
  #[error("Directory input error: {0}")]
  DirectoryInputError(#[from] DirectoryInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_directory")]
  ReadDirectory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "read_directory")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == DirectoryInput::SCHEME {
        let input = DirectoryInput::from_url(url)?;
        return Ok(InputWrapper::ReadDirectory(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  /// 剩余图像数量
  pub fn len(&self) -> usize {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.len(),
      #[cfg(feature = "read_directory")]
      InputWrapper::ReadDirectory(input) => input.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Iterator for InputWrapper {
  type Item = XrayImage;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "read_directory")]
      InputWrapper::ReadDirectory(input) => input.next(),
    }
  }
}
