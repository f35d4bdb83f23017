// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/input/read_directory.rs - 目录批量输入
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

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::XrayImage;
use crate::{FromUrl, FromUrlWithScheme, url_path};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Not a directory: {0}")]
  NotADirectory(PathBuf),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
}

/// `folder:///path/to/scans`，按文件名顺序产出目录下的 JPEG/PNG 文件，不递归
pub struct DirectoryInput {
  images: VecDeque<XrayImage>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(DirectoryInputError::SchemaMismatch);
    }

    let directory = PathBuf::from(url_path(url));
    if !directory.is_dir() {
      return Err(DirectoryInputError::NotADirectory(directory));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
      let path = entry?.path();
      if path.is_file() && has_image_extension(&path) {
        files.push(path);
      } else {
        debug!("跳过非图像条目: {}", path.display());
      }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    info!("目录 {} 中共有 {} 张图像", directory.display(), files.len());
    Ok(DirectoryInput {
      images: files.into_iter().map(XrayImage::new).collect(),
    })
  }
}

impl DirectoryInput {
  pub fn len(&self) -> usize {
    self.images.len()
  }

  pub fn is_empty(&self) -> bool {
    self.images.is_empty()
  }
}

impl Iterator for DirectoryInput {
  type Item = XrayImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.images.pop_front()
  }
}
