// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/pipeline.rs - 图像校验与预处理
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

//! 上传图像的校验与预处理。
//!
//! 预处理顺序是模型训练时的约定：先转为单通道灰度（ITU-R 601-2 亮度），
//! 再用 Lanczos3 缩放到目标尺寸，最后只除以 255。这里不做均值/方差归一化，
//! 与训练不一致的归一化不会报错，只会让预测悄悄变差。

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, Luma, imageops::FilterType};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::{FrameError, GrayNhwcFrame};

/// 默认上传大小上限（MB）
pub const DEFAULT_MAX_SIZE_MB: f64 = 10.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
  NotFound { path: String },
  TooLarge { size_mb: f64, limit_mb: f64 },
  UnsupportedFormat { format: String },
  InvalidImage { reason: String },
}

impl fmt::Display for ValidationIssue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ValidationIssue::NotFound { .. } => write!(f, "Image file not found"),
      ValidationIssue::TooLarge { size_mb, limit_mb } => write!(
        f,
        "File size ({:.2}MB) exceeds limit ({}MB)",
        size_mb, limit_mb
      ),
      ValidationIssue::UnsupportedFormat { format } => write!(f, "Unsupported format: {}", format),
      ValidationIssue::InvalidImage { reason } => write!(f, "Invalid image file: {}", reason),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
  pub valid: bool,
  pub errors: Vec<ValidationIssue>,
  pub file_size_mb: Option<f64>,
}

impl ValidationResult {
  fn from_issues(errors: Vec<ValidationIssue>, file_size_mb: Option<f64>) -> Self {
    Self {
      valid: errors.is_empty(),
      errors,
      file_size_mb,
    }
  }

  pub fn messages(&self) -> Vec<String> {
    self.errors.iter().map(ToString::to_string).collect()
  }
}

/// 校验上传文件：存在性、大小、格式。
///
/// 文件不存在时立即返回；大小与格式问题会一起累积。大小恰好等于上限时视为合法。
pub fn validate(path: impl AsRef<Path>, max_size_mb: f64) -> ValidationResult {
  let path = path.as_ref();

  let metadata = match std::fs::metadata(path) {
    Ok(metadata) if metadata.is_file() => metadata,
    _ => {
      return ValidationResult::from_issues(
        vec![ValidationIssue::NotFound {
          path: path.display().to_string(),
        }],
        None,
      );
    }
  };

  let mut errors = Vec::new();

  let size_bytes = metadata.len();
  let size_mb = size_bytes as f64 / BYTES_PER_MB;
  if size_bytes as f64 > max_size_mb * BYTES_PER_MB {
    errors.push(ValidationIssue::TooLarge {
      size_mb,
      limit_mb: max_size_mb,
    });
  }

  match sniff_format(path) {
    Ok(Some(ImageFormat::Jpeg | ImageFormat::Png)) => {}
    Ok(Some(format)) => errors.push(ValidationIssue::UnsupportedFormat {
      format: format!("{:?}", format).to_uppercase(),
    }),
    Ok(None) => errors.push(ValidationIssue::InvalidImage {
      reason: "unrecognized image data".to_string(),
    }),
    Err(e) => errors.push(ValidationIssue::InvalidImage {
      reason: e.to_string(),
    }),
  }

  debug!(
    "图像校验: {} ({:.2} MB), 问题数: {}",
    path.display(),
    size_mb,
    errors.len()
  );

  ValidationResult::from_issues(errors, Some(size_mb))
}

/// 只根据文件内容判断格式，忽略扩展名
fn sniff_format(path: &Path) -> std::io::Result<Option<ImageFormat>> {
  let reader = BufReader::new(File::open(path)?);
  Ok(ImageReader::new(reader).with_guessed_format()?.format())
}

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("帧构造错误: {0}")]
  FrameError(#[from] FrameError),
}

/// 按 ITU-R 601-2 亮度公式转为灰度，与 PIL 的 `convert("L")` 一致。
/// 原本就是灰度的图像直接使用。
pub fn to_luma_601(image: &DynamicImage) -> GrayImage {
  match image {
    DynamicImage::ImageLuma8(gray) => gray.clone(),
    DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
      image.to_luma8()
    }
    _ => {
      let rgb = image.to_rgb8();
      let (width, height) = rgb.dimensions();
      GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000;
        Luma([(l >> 16) as u8])
      })
    }
  }
}

/// 解码并转为灰度，不缩放
pub fn load_gray(path: impl AsRef<Path>) -> Result<GrayImage, PreprocessError> {
  let image = ImageReader::open(path.as_ref())?
    .with_guessed_format()?
    .decode()?;
  Ok(to_luma_601(&image))
}

/// 预处理为模型输入帧：灰度 → Lanczos3 缩放到 (W, H) → 除以 255 → (1, H, W, 1)
pub fn preprocess<const W: u32, const H: u32>(
  path: impl AsRef<Path>,
) -> Result<GrayNhwcFrame<W, H>, PreprocessError> {
  let path = path.as_ref();
  let gray = load_gray(path)?;
  let (src_w, src_h) = gray.dimensions();

  let resized = if (src_w, src_h) == (W, H) {
    gray
  } else {
    image::imageops::resize(&gray, W, H, FilterType::Lanczos3)
  };

  let frame = GrayNhwcFrame::<W, H>::try_from(&resized)?;
  info!(
    "图像预处理完成: {} ({}x{} -> 1x{}x{}x1)",
    path.display(),
    src_w,
    src_h,
    H,
    W
  );
  Ok(frame)
}
