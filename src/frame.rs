// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/frame.rs - 灰度 NHWC 张量帧定义
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

use image::GrayImage;
use ndarray::{ArrayView4, ShapeError};
use thiserror::Error;

const GRAY_CHANNELS: usize = 1;
const BATCH: usize = 1;

/// 模型输入尺寸
pub const XRAY_INPUT_W: u32 = 224;
pub const XRAY_INPUT_H: u32 = 224;

/// 模型实际使用的输入帧：(1, 224, 224, 1)
pub type XrayFrame = GrayNhwcFrame<XRAY_INPUT_W, XRAY_INPUT_H>;

pub trait AsNhwcTensor {
  /// (batch, height, width, channels)
  fn shape(&self) -> [usize; 4];
  fn as_nhwc(&self) -> &[f32];

  fn view(&self) -> Result<ArrayView4<'_, f32>, ShapeError> {
    let [n, h, w, c] = self.shape();
    ArrayView4::from_shape((n, h, w, c), self.as_nhwc())
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("像素值超出 [0, 1] 范围: 索引 {index}, 值 {value}")]
  OutOfRange { index: usize, value: f32 },
  #[error("图像尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  SizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

/// 单通道、归一化到 [0, 1] 的 NHWC 帧
#[derive(Debug, Clone)]
pub struct GrayNhwcFrame<const W: u32, const H: u32> {
  data: Box<[f32]>,
}

impl<const W: u32, const H: u32> GrayNhwcFrame<W, H> {
  const LEN: usize = BATCH * (H as usize) * (W as usize) * GRAY_CHANNELS;

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    GRAY_CHANNELS
  }

  /// 全零帧，用于模型试跑推理
  pub fn zeros() -> Self {
    Self {
      data: vec![0.0f32; Self::LEN].into_boxed_slice(),
    }
  }

  /// 由已归一化的数据构造，校验长度与取值范围
  pub fn from_normalized(data: Vec<f32>) -> Result<Self, FrameError> {
    if data.len() != Self::LEN {
      return Err(FrameError::LengthMismatch {
        expected: Self::LEN,
        actual: data.len(),
      });
    }
    if let Some((index, &value)) = data
      .iter()
      .enumerate()
      .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
      return Err(FrameError::OutOfRange { index, value });
    }
    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> TryFrom<&GrayImage> for GrayNhwcFrame<W, H> {
  type Error = FrameError;

  fn try_from(image: &GrayImage) -> Result<Self, Self::Error> {
    if image.dimensions() != (W, H) {
      return Err(FrameError::SizeMismatch {
        expected: (W, H),
        actual: image.dimensions(),
      });
    }

    // GrayImage 按行存储，与 NHWC (c = 1) 的内存布局一致
    let data = image
      .as_raw()
      .iter()
      .map(|&p| p as f32 / 255.0)
      .collect::<Vec<_>>();

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> AsNhwcTensor for GrayNhwcFrame<W, H> {
  fn shape(&self) -> [usize; 4] {
    [BATCH, H as usize, W as usize, GRAY_CHANNELS]
  }

  fn as_nhwc(&self) -> &[f32] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Luma;

  #[test]
  fn gray_image_maps_to_unit_interval() {
    let mut image = GrayImage::from_pixel(4, 2, Luma([0]));
    image.put_pixel(3, 1, Luma([255]));
    image.put_pixel(1, 0, Luma([51]));

    let frame = GrayNhwcFrame::<4, 2>::try_from(&image).unwrap();
    assert_eq!(frame.shape(), [1, 2, 4, 1]);

    let view = frame.view().unwrap();
    assert_eq!(view[[0, 1, 3, 0]], 1.0);
    assert!((view[[0, 0, 1, 0]] - 0.2).abs() < 1e-6);
    assert_eq!(view[[0, 0, 0, 0]], 0.0);
  }

  #[test]
  fn wrong_dimensions_are_rejected() {
    let image = GrayImage::new(3, 3);
    let err = GrayNhwcFrame::<4, 4>::try_from(&image).unwrap_err();
    assert!(matches!(err, FrameError::SizeMismatch { .. }));
  }

  #[test]
  fn normalized_data_is_range_checked() {
    assert!(GrayNhwcFrame::<2, 1>::from_normalized(vec![0.0, 1.0]).is_ok());
    assert!(matches!(
      GrayNhwcFrame::<2, 1>::from_normalized(vec![0.0, 1.5]),
      Err(FrameError::OutOfRange { index: 1, .. })
    ));
    assert!(matches!(
      GrayNhwcFrame::<2, 1>::from_normalized(vec![0.0]),
      Err(FrameError::LengthMismatch { .. })
    ));
  }
}
