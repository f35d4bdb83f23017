// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/input/read_image_file.rs - 单张图像文件输入
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::error;
use url::Url;

use super::XrayImage;
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Not a regular file: {0}")]
  NotAFile(PathBuf),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
}

/// `image:///path/to/scan.png`，只产出一张图像
pub struct ImageFileInput {
  image: Option<XrayImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = PathBuf::from(url_path(url));
    if !std::fs::metadata(&path)?.is_file() {
      return Err(ImageFileInputError::NotAFile(path));
    }

    Ok(ImageFileInput {
      image: Some(XrayImage::new(path)),
    })
  }
}

impl ImageFileInput {
  pub fn len(&self) -> usize {
    self.image.iter().count()
  }

  pub fn is_empty(&self) -> bool {
    self.image.is_none()
  }
}

impl Iterator for ImageFileInput {
  type Item = XrayImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_the_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("chest scan.jpg");
    std::fs::write(&file, b"jpeg").unwrap();

    let url = Url::parse(&format!("image://{}", dir.path().join("chest%20scan.jpg").display())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.len(), 1);
    assert_eq!(input.next(), Some(XrayImage::new(&file)));
    assert!(input.is_empty());
    assert_eq!(input.next(), None);
  }

  #[test]
  fn missing_or_directory_paths_fail() {
    let dir = tempfile::tempdir().unwrap();
    let missing = Url::parse(&format!("image://{}/none.png", dir.path().display())).unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&missing),
      Err(ImageFileInputError::IoError(_))
    ));

    let folder = Url::parse(&format!("image://{}", dir.path().display())).unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&folder),
      Err(ImageFileInputError::NotAFile(_))
    ));

    let wrong = Url::parse("folder:///tmp").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&wrong),
      Err(ImageFileInputError::SchemaMismatch)
    ));
  }
}
