// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/keras.rs - 二分类模型推理
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

use std::marker::PhantomData;

use ndarray::{ArrayD, IxDyn, ShapeError};
use thiserror::Error;
use tracing::debug;

use super::Model;
use super::graph::{Graph, GraphError};
use crate::frame::AsNhwcTensor;

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("计算图错误: {0}")]
  Graph(#[from] GraphError),
  #[error("输入张量错误: {0}")]
  Input(#[from] ShapeError),
  #[error("模型只有 {0} 个输入时才能推理单张图像")]
  InputCount(usize),
  #[error("模型输出形状不符合预期: {0:?}")]
  UnexpectedOutput(Vec<usize>),
  #[error("模型输出不是有效概率: {0}")]
  InvalidScore(f32),
}

/// 输出单个肺炎概率的模型。
///
/// 输出为 (n, 1) 的 sigmoid 分数，或 (n, 2) 的 [NORMAL, PNEUMONIA] 概率，
/// 后者取第二列。
#[derive(Debug, Clone)]
pub struct KerasModel<Frame> {
  graph: Graph,
  _frame: PhantomData<fn(&Frame)>,
}

impl<Frame> KerasModel<Frame> {
  pub fn new(graph: Graph) -> Self {
    Self {
      graph,
      _frame: PhantomData,
    }
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// 对 (n, ...) 的输入计算每个批次元素的分数
  pub fn scores(&self, input: ArrayD<f32>) -> Result<Vec<f32>, InferenceError> {
    if self.graph.input_count() != 1 {
      return Err(InferenceError::InputCount(self.graph.input_count()));
    }
    let batch = input.shape().first().copied().unwrap_or(0);
    let output = self
      .graph
      .forward(vec![input])?
      .pop()
      .ok_or_else(|| InferenceError::UnexpectedOutput(Vec::new()))?;

    let column = match output.shape() {
      [n, 1] if *n == batch => 0,
      [n, 2] if *n == batch => 1,
      other => return Err(InferenceError::UnexpectedOutput(other.to_vec())),
    };

    (0..batch)
      .map(|i| {
        let score = output[[i, column]];
        if score.is_finite() && (0.0..=1.0).contains(&score) {
          Ok(score)
        } else {
          Err(InferenceError::InvalidScore(score))
        }
      })
      .collect()
  }

  /// 在全零输入上试跑一次，确认模型确实可用
  pub fn trial_run(&self) -> Result<f32, InferenceError> {
    let shape = self
      .graph
      .input_shape()
      .ok_or(InferenceError::InputCount(0))?;
    let mut dims = vec![1usize];
    dims.extend_from_slice(shape);
    let scores = self.scores(ArrayD::zeros(IxDyn(&dims)))?;
    let score = scores
      .first()
      .copied()
      .ok_or_else(|| InferenceError::UnexpectedOutput(dims.clone()))?;
    debug!("试跑推理完成, 分数: {:.4}", score);
    Ok(score)
  }
}

impl<Frame: AsNhwcTensor> Model for KerasModel<Frame> {
  type Input = Frame;
  type Output = f32;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let tensor = input.view()?.to_owned().into_dyn();
    let scores = self.scores(tensor)?;
    scores
      .first()
      .copied()
      .ok_or_else(|| InferenceError::UnexpectedOutput(input.shape().to_vec()))
  }
}
