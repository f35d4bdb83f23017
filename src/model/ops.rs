// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/ops.rs - NHWC 张量算子
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

use ndarray::linalg::general_mat_mul;
use ndarray::{
  Array1, Array2, Array4, ArrayD, ArrayView4, Axis, ErrorKind, Ix1, Ix2, Ix4, ShapeError, s,
};

use super::config::{Activation, Padding, ReluSpec};

/// 单个空间维度的输出长度与前后填充量。
///
/// `same` 与 TensorFlow 一致：总填充量 `max((out - 1) * s + k - in, 0)`，
/// 奇数时多出的一格补在后面。
pub(crate) fn out_extent(input: usize, kernel: usize, stride: usize, padding: Padding) -> (usize, usize, usize) {
  match padding {
    Padding::Valid => {
      let out = if input >= kernel {
        (input - kernel) / stride + 1
      } else {
        0
      };
      (out, 0, 0)
    }
    Padding::Same => {
      let out = input.div_ceil(stride);
      let total = (out.saturating_sub(1) * stride + kernel).saturating_sub(input);
      (out, total / 2, total - total / 2)
    }
  }
}

fn incompatible() -> ShapeError {
  ShapeError::from_kind(ErrorKind::IncompatibleShape)
}

pub(crate) fn pad4(x: ArrayView4<'_, f32>, top: usize, bottom: usize, left: usize, right: usize) -> Array4<f32> {
  let (n, h, w, c) = x.dim();
  if top + bottom + left + right == 0 {
    return x.to_owned();
  }
  let mut out = Array4::zeros((n, h + top + bottom, w + left + right, c));
  out
    .slice_mut(s![.., top..top + h, left..left + w, ..])
    .assign(&x);
  out
}

/// 卷积核在 (ky, kx) 处覆盖的所有输入位置
fn window(
  padded: &Array4<f32>,
  ky: usize,
  kx: usize,
  out: (usize, usize),
  strides: (usize, usize),
) -> ArrayView4<'_, f32> {
  let (ho, wo) = out;
  let (sh, sw) = strides;
  padded.slice(s![
    ..,
    ky..ky + (ho - 1) * sh + 1;sh,
    kx..kx + (wo - 1) * sw + 1;sw,
    ..
  ])
}

fn prepare(
  x: ArrayD<f32>,
  kernel: (usize, usize),
  strides: (usize, usize),
  padding: Padding,
) -> Result<(Array4<f32>, (usize, usize)), ShapeError> {
  let x = x.into_dimensionality::<Ix4>()?;
  let (_, h, w, _) = x.dim();
  let (ho, pt, pb) = out_extent(h, kernel.0, strides.0, padding);
  let (wo, pl, pr) = out_extent(w, kernel.1, strides.1, padding);
  if ho == 0 || wo == 0 {
    return Err(incompatible());
  }
  Ok((pad4(x.view(), pt, pb, pl, pr), (ho, wo)))
}

/// 普通卷积，kernel 形状为 (kh, kw, cin, cout)
pub(crate) fn conv2d(
  x: ArrayD<f32>,
  kernel: &ArrayD<f32>,
  bias: Option<&ArrayD<f32>>,
  strides: (usize, usize),
  padding: Padding,
) -> Result<ArrayD<f32>, ShapeError> {
  let kernel = kernel.view().into_dimensionality::<Ix4>()?;
  let (kh, kw, cin, cout) = kernel.dim();
  let n = x.shape().first().copied().unwrap_or(0);
  let (padded, (ho, wo)) = prepare(x, (kh, kw), strides, padding)?;
  if padded.dim().3 != cin {
    return Err(incompatible());
  }

  // 逐个卷积核位置做一次矩阵乘并累加
  let rows = n * ho * wo;
  let mut acc = Array2::<f32>::zeros((rows, cout));
  for ky in 0..kh {
    for kx in 0..kw {
      let patch = window(&padded, ky, kx, (ho, wo), strides)
        .to_owned()
        .into_shape_with_order((rows, cin))?;
      let tap = kernel.slice(s![ky, kx, .., ..]);
      general_mat_mul(1.0, &patch, &tap, 1.0, &mut acc);
    }
  }

  if let Some(bias) = bias {
    acc += &bias.view().into_dimensionality::<Ix1>()?;
  }
  Ok(acc.into_shape_with_order((n, ho, wo, cout))?.into_dyn())
}

/// 逐通道卷积（depth_multiplier = 1），kernel 形状为 (kh, kw, c, 1)
pub(crate) fn depthwise_conv2d(
  x: ArrayD<f32>,
  kernel: &ArrayD<f32>,
  bias: Option<&ArrayD<f32>>,
  strides: (usize, usize),
  padding: Padding,
) -> Result<ArrayD<f32>, ShapeError> {
  let kernel = kernel.view().into_dimensionality::<Ix4>()?;
  let (kh, kw, c, _) = kernel.dim();
  let (padded, (ho, wo)) = prepare(x, (kh, kw), strides, padding)?;
  let n = padded.dim().0;
  if padded.dim().3 != c {
    return Err(incompatible());
  }

  let mut acc = Array4::<f32>::zeros((n, ho, wo, c));
  for ky in 0..kh {
    for kx in 0..kw {
      let tap = kernel.slice(s![ky, kx, .., 0]);
      acc += &(&window(&padded, ky, kx, (ho, wo), strides) * &tap);
    }
  }

  if let Some(bias) = bias {
    acc += &bias.view().into_dimensionality::<Ix1>()?;
  }
  Ok(acc.into_dyn())
}

pub(crate) struct BatchNormParams<'a> {
  pub gamma: Option<&'a ArrayD<f32>>,
  pub beta: Option<&'a ArrayD<f32>>,
  pub moving_mean: &'a ArrayD<f32>,
  pub moving_variance: &'a ArrayD<f32>,
  pub epsilon: f32,
}

/// 推理模式的批归一化，作用在最后一维
pub(crate) fn batch_norm(mut x: ArrayD<f32>, params: &BatchNormParams<'_>) -> Result<ArrayD<f32>, ShapeError> {
  let mean = params.moving_mean.view().into_dimensionality::<Ix1>()?;
  let variance = params.moving_variance.view().into_dimensionality::<Ix1>()?;
  let gamma = params
    .gamma
    .map(|g| g.view().into_dimensionality::<Ix1>())
    .transpose()?;
  let beta = params
    .beta
    .map(|b| b.view().into_dimensionality::<Ix1>())
    .transpose()?;

  let channels = mean.len();
  if x.shape().last() != Some(&channels) {
    return Err(incompatible());
  }

  let mut scale = Array1::<f32>::zeros(channels);
  let mut shift = Array1::<f32>::zeros(channels);
  for i in 0..channels {
    let g = gamma.as_ref().map_or(1.0, |g| g[i]);
    let b = beta.as_ref().map_or(0.0, |b| b[i]);
    scale[i] = g / (variance[i] + params.epsilon).sqrt();
    shift[i] = b - mean[i] * scale[i];
  }

  x *= &scale;
  x += &shift;
  Ok(x)
}

fn relu_scalar(v: f32, spec: &ReluSpec) -> f32 {
  let y = if v >= spec.threshold {
    v
  } else {
    spec.negative_slope * (v - spec.threshold)
  };
  match spec.max_value {
    Some(max) => y.min(max),
    None => y,
  }
}

pub(crate) fn relu(mut x: ArrayD<f32>, spec: &ReluSpec) -> ArrayD<f32> {
  x.mapv_inplace(|v| relu_scalar(v, spec));
  x
}

fn sigmoid(v: f32) -> f32 {
  1.0 / (1.0 + (-v).exp())
}

pub(crate) fn activate(mut x: ArrayD<f32>, activation: Activation) -> ArrayD<f32> {
  match activation {
    Activation::Linear => {}
    Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
    Activation::Relu6 => x.mapv_inplace(|v| v.clamp(0.0, 6.0)),
    Activation::Sigmoid => x.mapv_inplace(sigmoid),
    Activation::Tanh => x.mapv_inplace(f32::tanh),
    Activation::Softmax => {
      if x.ndim() > 0 {
        let last = Axis(x.ndim() - 1);
        for mut lane in x.lanes_mut(last) {
          let max = lane.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
          lane.mapv_inplace(|v| (v - max).exp());
          let sum = lane.sum();
          lane.mapv_inplace(|v| v / sum);
        }
      }
    }
  }
  x
}

/// (n, h, w, c) -> (n, c)
pub(crate) fn global_average_pool(x: ArrayD<f32>) -> Result<ArrayD<f32>, ShapeError> {
  let x = x.into_dimensionality::<Ix4>()?;
  let (_, h, w, _) = x.dim();
  if h * w == 0 {
    return Err(incompatible());
  }
  let pooled = x.sum_axis(Axis(1)).sum_axis(Axis(1)) / (h * w) as f32;
  Ok(pooled.into_dyn())
}

pub(crate) fn flatten(x: ArrayD<f32>) -> Result<ArrayD<f32>, ShapeError> {
  let n = x.shape().first().copied().unwrap_or(0);
  let rest = x.shape().iter().skip(1).product::<usize>();
  Ok(
    x.as_standard_layout()
      .into_owned()
      .into_shape_with_order((n, rest))?
      .into_dyn(),
  )
}

/// (n, in) x (in, units)
pub(crate) fn dense(
  x: ArrayD<f32>,
  kernel: &ArrayD<f32>,
  bias: Option<&ArrayD<f32>>,
) -> Result<ArrayD<f32>, ShapeError> {
  let x = x.into_dimensionality::<Ix2>()?;
  let kernel = kernel.view().into_dimensionality::<Ix2>()?;
  if x.ncols() != kernel.nrows() {
    return Err(incompatible());
  }
  let mut y = x.dot(&kernel);
  if let Some(bias) = bias {
    y += &bias.view().into_dimensionality::<Ix1>()?;
  }
  Ok(y.into_dyn())
}

pub(crate) fn add(inputs: Vec<ArrayD<f32>>) -> Result<ArrayD<f32>, ShapeError> {
  let mut iter = inputs.into_iter();
  let mut sum = iter.next().ok_or_else(incompatible)?;
  for other in iter {
    if other.shape() != sum.shape() {
      return Err(incompatible());
    }
    sum += &other;
  }
  Ok(sum)
}

pub(crate) fn zero_pad(
  x: ArrayD<f32>,
  top: usize,
  bottom: usize,
  left: usize,
  right: usize,
) -> Result<ArrayD<f32>, ShapeError> {
  let x = x.into_dimensionality::<Ix4>()?;
  Ok(pad4(x.view(), top, bottom, left, right).into_dyn())
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array, IxDyn, array};

  fn nhwc(h: usize, w: usize, c: usize, values: Vec<f32>) -> ArrayD<f32> {
    Array::from_shape_vec(IxDyn(&[1, h, w, c]), values).unwrap()
  }

  #[test]
  fn same_padding_matches_tensorflow() {
    assert_eq!(out_extent(224, 3, 2, Padding::Same), (112, 0, 1));
    assert_eq!(out_extent(7, 3, 1, Padding::Same), (7, 1, 1));
    assert_eq!(out_extent(8, 1, 2, Padding::Same), (4, 0, 0));
    assert_eq!(out_extent(225, 3, 2, Padding::Valid), (112, 0, 0));
    assert_eq!(out_extent(2, 3, 1, Padding::Valid), (0, 0, 0));
  }

  #[test]
  fn conv_sums_the_window() {
    // 3x3 全 1 卷积核作用于 3x3 输入，same 填充
    let x = nhwc(3, 3, 1, (1..=9).map(|v| v as f32).collect());
    let kernel = ArrayD::from_elem(IxDyn(&[3, 3, 1, 1]), 1.0f32);
    let bias = ArrayD::from_elem(IxDyn(&[1]), 0.5f32);

    let y = conv2d(x, &kernel, Some(&bias), (1, 1), Padding::Same).unwrap();
    assert_eq!(y.shape(), &[1, 3, 3, 1]);
    // 中心点覆盖全部像素
    assert_eq!(y[[0, 1, 1, 0]], 45.5);
    // 左上角只覆盖 1, 2, 4, 5
    assert_eq!(y[[0, 0, 0, 0]], 12.5);
  }

  #[test]
  fn pointwise_conv_mixes_channels() {
    let x = nhwc(1, 2, 2, vec![1.0, 2.0, 3.0, 4.0]);
    let kernel = Array::from_shape_vec(IxDyn(&[1, 1, 2, 3]), vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
    let y = conv2d(x, &kernel, None, (1, 1), Padding::Valid).unwrap();
    assert_eq!(y.shape(), &[1, 1, 2, 3]);
    assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);
  }

  #[test]
  fn strided_depthwise_keeps_channels_apart() {
    let mut values = Vec::new();
    for i in 0..16 {
      values.push(i as f32);
      values.push(-(i as f32));
    }
    let x = nhwc(4, 4, 2, values);
    let kernel = ArrayD::from_elem(IxDyn(&[2, 2, 2, 1]), 1.0f32);

    let y = depthwise_conv2d(x, &kernel, None, (2, 2), Padding::Valid).unwrap();
    assert_eq!(y.shape(), &[1, 2, 2, 2]);
    // 左上 2x2 窗口: 0 + 1 + 4 + 5
    assert_eq!(y[[0, 0, 0, 0]], 10.0);
    assert_eq!(y[[0, 0, 0, 1]], -10.0);
    // 右下 2x2 窗口: 10 + 11 + 14 + 15
    assert_eq!(y[[0, 1, 1, 0]], 50.0);
  }

  #[test]
  fn batch_norm_uses_moving_statistics() {
    let x = array![[1.0f32, 10.0], [3.0, 20.0]].into_dyn();
    let gamma = array![2.0f32, 1.0].into_dyn();
    let beta = array![0.5f32, 0.0].into_dyn();
    let mean = array![1.0f32, 10.0].into_dyn();
    let variance = array![4.0f32, 100.0].into_dyn();

    let y = batch_norm(
      x,
      &BatchNormParams {
        gamma: Some(&gamma),
        beta: Some(&beta),
        moving_mean: &mean,
        moving_variance: &variance,
        epsilon: 0.0,
      },
    )
    .unwrap();
    assert_eq!(y[[0, 0]], 0.5);
    assert_eq!(y[[1, 0]], 2.5);
    assert_eq!(y[[1, 1]], 1.0);
  }

  #[test]
  fn relu_variants() {
    let values = |y: ArrayD<f32>| y.iter().copied().collect::<Vec<_>>();
    let x = array![-2.0f32, 0.5, 7.0].into_dyn();
    assert_eq!(values(relu(x.clone(), &ReluSpec::relu6())), vec![0.0, 0.5, 6.0]);

    let leaky = ReluSpec {
      max_value: None,
      negative_slope: 0.1,
      threshold: 0.0,
    };
    let y = relu(x.clone(), &leaky);
    assert!((y[[0]] + 0.2).abs() < 1e-6);
    assert_eq!(y[[2]], 7.0);

    assert_eq!(values(activate(x, Activation::Relu6)), vec![0.0, 0.5, 6.0]);
  }

  #[test]
  fn softmax_rows_sum_to_one() {
    let x = array![[1.0f32, 1.0], [0.0, 1000.0]].into_dyn();
    let y = activate(x, Activation::Softmax);
    assert!((y[[0, 0]] - 0.5).abs() < 1e-6);
    assert!((y[[1, 1]] - 1.0).abs() < 1e-6);
    assert!(y.iter().all(|v| v.is_finite()));
  }

  #[test]
  fn pooling_flatten_and_dense() {
    let x = nhwc(2, 2, 1, vec![1.0, 2.0, 3.0, 6.0]);
    let pooled = global_average_pool(x.clone()).unwrap();
    assert_eq!(pooled.shape(), &[1, 1]);
    assert_eq!(pooled[[0, 0]], 3.0);

    let flat = flatten(x).unwrap();
    assert_eq!(flat.shape(), &[1, 4]);

    let kernel = array![[1.0f32], [1.0], [1.0], [1.0]].into_dyn();
    let bias = array![-12.0f32].into_dyn();
    let y = dense(flat, &kernel, Some(&bias)).unwrap();
    assert_eq!(y[[0, 0]], 0.0);
  }

  #[test]
  fn asymmetric_zero_padding() {
    let x = nhwc(2, 2, 1, vec![1.0; 4]);
    let y = zero_pad(x, 0, 1, 0, 1).unwrap();
    assert_eq!(y.shape(), &[1, 3, 3, 1]);
    assert_eq!(y[[0, 0, 0, 0]], 1.0);
    assert_eq!(y[[0, 2, 2, 0]], 0.0);
    assert_eq!(y.sum(), 4.0);
  }
}
