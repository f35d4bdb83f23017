// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/graph.rs - 层图的构建、权重绑定与前向计算
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

//! 由 [`GraphSpec`] 构建的可执行层图。
//!
//! 构建时做形状推导并用固定种子初始化全部参数（Glorot 均匀分布的卷积核，
//! 偏置为 0，批归一化的 gamma 与方差为 1），之后再按名称绑定制品中的权重。
//! 张量一律为 NHWC 布局的 f32，第一维是批次。

use std::collections::{BTreeSet, HashMap};

use ndarray::{ArrayD, IxDyn, ShapeError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;

use super::artifact::{WeightGroups, WeightTensor};
use super::config::{GraphSpec, LayerSpec};
use super::ops::{self, BatchNormParams};

#[derive(Error, Debug)]
pub enum GraphError {
  #[error("重复的层名: {0}")]
  DuplicateLayer(String),
  #[error("层 {layer} 的输入 {inbound} 未定义")]
  UnknownInbound { layer: String, inbound: String },
  #[error("层 {layer} 形状不兼容: {reason}")]
  IncompatibleShape { layer: String, reason: String },
  #[error("模型 {0} 缺少输入或输出")]
  MissingEndpoint(String),
  #[error("缺少权重 {path}")]
  MissingWeight { path: String },
  #[error("权重 {path} 形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  WeightShapeMismatch {
    path: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("输入数量不匹配: 期望 {expected}, 实际 {actual}")]
  InputCount { expected: usize, actual: usize },
  #[error("输入张量形状不匹配: 期望 (n, {expected:?}), 实际 {actual:?}")]
  InputShape {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("层 {layer} 计算失败: {source}")]
  Execution { layer: String, source: ShapeError },
  #[error("张量形状错误: {0}")]
  Shape(#[from] ShapeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
  /// 每个参数都必须存在且形状一致
  Strict,
  /// 缺失或形状不符的参数保留初始化值
  ByName,
}

/// 权重绑定结果，条目为 `<层路径>/<权重名>`
#[derive(Debug, Clone, Default)]
pub struct BindReport {
  pub bound: BTreeSet<String>,
  pub missing: BTreeSet<String>,
  pub mismatched: BTreeSet<String>,
}

impl BindReport {
  pub fn skipped_count(&self) -> usize {
    self.missing.len() + self.mismatched.len()
  }

  /// 该层至少绑定了一个参数且没有被跳过的参数
  pub fn layer_fully_bound(&self, layer: &str) -> bool {
    let prefix = format!("{}/", layer);
    let under = |set: &BTreeSet<String>| set.iter().any(|p| p.starts_with(&prefix));
    under(&self.bound) && !under(&self.missing) && !under(&self.mismatched)
  }
}

#[derive(Debug, Clone)]
struct Param {
  name: &'static str,
  value: ArrayD<f32>,
}

#[derive(Debug, Clone)]
enum Op {
  Input,
  Layer(LayerSpec),
  Model(Box<Graph>),
}

#[derive(Debug, Clone)]
struct Node {
  name: String,
  op: Op,
  inbound: Vec<usize>,
  /// 不含批次维
  output_shape: Vec<usize>,
  params: Vec<Param>,
}

/// 用于 `inspect-artifact` 之类的展示
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSummary {
  pub path: String,
  pub kind: &'static str,
  pub output_shape: Vec<usize>,
  pub parameters: usize,
}

#[derive(Debug, Clone)]
pub struct Graph {
  name: String,
  nodes: Vec<Node>,
  inputs: Vec<usize>,
  outputs: Vec<usize>,
  /// 每个节点的输出被引用的次数，用于尽早释放中间结果
  uses: Vec<usize>,
}

fn kind_name(layer: &LayerSpec) -> &'static str {
  match layer {
    LayerSpec::Input { .. } => "InputLayer",
    LayerSpec::Conv2D { .. } => "Conv2D",
    LayerSpec::DepthwiseConv2D { .. } => "DepthwiseConv2D",
    LayerSpec::BatchNormalization { .. } => "BatchNormalization",
    LayerSpec::ReLU(_) => "ReLU",
    LayerSpec::Activation(_) => "Activation",
    LayerSpec::ZeroPadding2D { .. } => "ZeroPadding2D",
    LayerSpec::Add => "Add",
    LayerSpec::GlobalAveragePooling2D => "GlobalAveragePooling2D",
    LayerSpec::Flatten => "Flatten",
    LayerSpec::Dense { .. } => "Dense",
    LayerSpec::Dropout { .. } => "Dropout",
    LayerSpec::Model(_) => "Functional",
  }
}

fn glorot_uniform(shape: &[usize], rng: &mut ChaCha8Rng) -> ArrayD<f32> {
  let (fan_in, fan_out) = match shape {
    [rows, cols] => (*rows, *cols),
    [receptive @ .., cin, cout] => {
      let receptive = receptive.iter().product::<usize>();
      (cin * receptive, cout * receptive)
    }
    _ => (1, 1),
  };
  let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
  ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-limit..limit))
}

fn zeros(shape: &[usize]) -> ArrayD<f32> {
  ArrayD::zeros(IxDyn(shape))
}

fn ones(shape: &[usize]) -> ArrayD<f32> {
  ArrayD::ones(IxDyn(shape))
}

impl Node {
  fn build(
    name: &str,
    layer: &LayerSpec,
    inputs: &[&[usize]],
    inbound: Vec<usize>,
    rng: &mut ChaCha8Rng,
  ) -> Result<Self, GraphError> {
    let bad = |reason: String| GraphError::IncompatibleShape {
      layer: name.to_string(),
      reason,
    };
    let single = || match inputs {
      [one] => Ok(*one),
      _ => Err(bad(format!("需要 1 个输入, 实际 {} 个", inputs.len()))),
    };
    let spatial = |shape: &[usize]| match shape {
      [h, w, c] => Ok((*h, *w, *c)),
      _ => Err(bad(format!("需要 (h, w, c) 形状的输入, 实际 {:?}", shape))),
    };
    let conv_extent = |h: usize, w: usize, kernel: (usize, usize), strides: (usize, usize), padding| {
      if strides.0 == 0 || strides.1 == 0 || kernel.0 == 0 || kernel.1 == 0 {
        return Err(bad("卷积核与步长必须大于 0".to_string()));
      }
      let (ho, _, _) = ops::out_extent(h, kernel.0, strides.0, padding);
      let (wo, _, _) = ops::out_extent(w, kernel.1, strides.1, padding);
      if ho == 0 || wo == 0 {
        return Err(bad(format!("输入 {}x{} 小于卷积核 {:?}", h, w, kernel)));
      }
      Ok((ho, wo))
    };

    let mut params = Vec::new();
    let (op, output_shape) = match layer {
      LayerSpec::Input { shape } => {
        if !inputs.is_empty() {
          return Err(bad("输入层不能有上游".to_string()));
        }
        if !(shape.len() == 1 || shape.len() == 3) || shape.contains(&0) {
          return Err(bad(format!("不支持的输入形状 {:?}", shape)));
        }
        (Op::Input, shape.clone())
      }
      LayerSpec::Conv2D {
        filters,
        kernel,
        strides,
        padding,
        use_bias,
        ..
      } => {
        let (h, w, c) = spatial(single()?)?;
        let (ho, wo) = conv_extent(h, w, *kernel, *strides, *padding)?;
        params.push(Param {
          name: "kernel",
          value: glorot_uniform(&[kernel.0, kernel.1, c, *filters], rng),
        });
        if *use_bias {
          params.push(Param {
            name: "bias",
            value: zeros(&[*filters]),
          });
        }
        (Op::Layer(layer.clone()), vec![ho, wo, *filters])
      }
      LayerSpec::DepthwiseConv2D {
        kernel,
        strides,
        padding,
        use_bias,
        ..
      } => {
        let (h, w, c) = spatial(single()?)?;
        let (ho, wo) = conv_extent(h, w, *kernel, *strides, *padding)?;
        params.push(Param {
          name: "depthwise_kernel",
          value: glorot_uniform(&[kernel.0, kernel.1, c, 1], rng),
        });
        if *use_bias {
          params.push(Param {
            name: "bias",
            value: zeros(&[c]),
          });
        }
        (Op::Layer(layer.clone()), vec![ho, wo, c])
      }
      LayerSpec::BatchNormalization { center, scale, .. } => {
        let shape = single()?;
        let c = *shape.last().ok_or_else(|| bad("空形状".to_string()))?;
        if *scale {
          params.push(Param {
            name: "gamma",
            value: ones(&[c]),
          });
        }
        if *center {
          params.push(Param {
            name: "beta",
            value: zeros(&[c]),
          });
        }
        params.push(Param {
          name: "moving_mean",
          value: zeros(&[c]),
        });
        params.push(Param {
          name: "moving_variance",
          value: ones(&[c]),
        });
        (Op::Layer(layer.clone()), shape.to_vec())
      }
      LayerSpec::ReLU(_) | LayerSpec::Activation(_) | LayerSpec::Dropout { .. } => {
        (Op::Layer(layer.clone()), single()?.to_vec())
      }
      LayerSpec::ZeroPadding2D {
        top,
        bottom,
        left,
        right,
      } => {
        let (h, w, c) = spatial(single()?)?;
        (
          Op::Layer(layer.clone()),
          vec![h + top + bottom, w + left + right, c],
        )
      }
      LayerSpec::Add => {
        let first = inputs
          .first()
          .filter(|_| inputs.len() >= 2)
          .ok_or_else(|| bad("Add 至少需要 2 个输入".to_string()))?;
        if inputs.iter().any(|s| s != first) {
          return Err(bad(format!("Add 的输入形状不一致: {:?}", inputs)));
        }
        (Op::Layer(layer.clone()), first.to_vec())
      }
      LayerSpec::GlobalAveragePooling2D => {
        let (_, _, c) = spatial(single()?)?;
        (Op::Layer(layer.clone()), vec![c])
      }
      LayerSpec::Flatten => {
        let size = single()?.iter().product::<usize>();
        (Op::Layer(layer.clone()), vec![size])
      }
      LayerSpec::Dense {
        units, use_bias, ..
      } => {
        let features = match single()? {
          [features] => *features,
          other => return Err(bad(format!("Dense 只支持一维特征输入, 实际 {:?}", other))),
        };
        params.push(Param {
          name: "kernel",
          value: glorot_uniform(&[features, *units], rng),
        });
        if *use_bias {
          params.push(Param {
            name: "bias",
            value: zeros(&[*units]),
          });
        }
        (Op::Layer(layer.clone()), vec![*units])
      }
      LayerSpec::Model(spec) => {
        let input = single()?;
        let nested = Graph::build_with(spec, rng)?;
        let (nested_input, nested_output) = match (nested.inputs.as_slice(), nested.outputs.as_slice()) {
          ([i], [o]) => (&nested.nodes[*i].output_shape, nested.nodes[*o].output_shape.clone()),
          _ => return Err(bad("嵌套模型必须只有一个输入和一个输出".to_string())),
        };
        if nested_input.as_slice() != input {
          return Err(bad(format!(
            "嵌套模型输入 {:?} 与上游输出 {:?} 不一致",
            nested_input, input
          )));
        }
        (Op::Model(Box::new(nested)), nested_output)
      }
    };

    Ok(Self {
      name: name.to_string(),
      op,
      inbound,
      output_shape,
      params,
    })
  }

  fn param(&self, name: &str) -> Result<&ArrayD<f32>, GraphError> {
    self
      .params
      .iter()
      .find(|p| p.name == name)
      .map(|p| &p.value)
      .ok_or_else(|| GraphError::MissingWeight {
        path: format!("{}/{}", self.name, name),
      })
  }

  fn optional_param(&self, name: &str) -> Option<&ArrayD<f32>> {
    self.params.iter().find(|p| p.name == name).map(|p| &p.value)
  }

  fn apply(&self, mut args: Vec<ArrayD<f32>>) -> Result<ArrayD<f32>, GraphError> {
    let spec = match &self.op {
      Op::Input => {
        return args.pop().ok_or_else(|| GraphError::MissingEndpoint(self.name.clone()));
      }
      Op::Model(graph) => {
        return graph
          .forward(args)?
          .pop()
          .ok_or_else(|| GraphError::MissingEndpoint(self.name.clone()));
      }
      Op::Layer(spec) => spec,
    };

    let context = |source: ShapeError| GraphError::Execution {
      layer: self.name.clone(),
      source,
    };

    if matches!(spec, LayerSpec::Add) {
      return ops::add(args).map_err(context);
    }
    let x = args.pop().ok_or_else(|| GraphError::InputCount {
      expected: 1,
      actual: 0,
    })?;

    let y = match spec {
      LayerSpec::Conv2D {
        strides,
        padding,
        activation,
        ..
      } => ops::activate(
        ops::conv2d(
          x,
          self.param("kernel")?,
          self.optional_param("bias"),
          *strides,
          *padding,
        )
        .map_err(context)?,
        *activation,
      ),
      LayerSpec::DepthwiseConv2D {
        strides,
        padding,
        activation,
        ..
      } => ops::activate(
        ops::depthwise_conv2d(
          x,
          self.param("depthwise_kernel")?,
          self.optional_param("bias"),
          *strides,
          *padding,
        )
        .map_err(context)?,
        *activation,
      ),
      LayerSpec::BatchNormalization { epsilon, .. } => {
        let params = BatchNormParams {
          gamma: self.optional_param("gamma"),
          beta: self.optional_param("beta"),
          moving_mean: self.param("moving_mean")?,
          moving_variance: self.param("moving_variance")?,
          epsilon: *epsilon,
        };
        ops::batch_norm(x, &params).map_err(context)?
      }
      LayerSpec::ReLU(relu) => ops::relu(x, relu),
      LayerSpec::Activation(activation) => ops::activate(x, *activation),
      LayerSpec::ZeroPadding2D {
        top,
        bottom,
        left,
        right,
      } => ops::zero_pad(x, *top, *bottom, *left, *right).map_err(context)?,
      LayerSpec::GlobalAveragePooling2D => ops::global_average_pool(x).map_err(context)?,
      LayerSpec::Flatten => ops::flatten(x).map_err(context)?,
      LayerSpec::Dense { activation, .. } => ops::activate(
        ops::dense(x, self.param("kernel")?, self.optional_param("bias")).map_err(context)?,
        *activation,
      ),
      // 推理时 Dropout 是恒等映射
      LayerSpec::Dropout { .. } => x,
      LayerSpec::Input { .. } | LayerSpec::Add | LayerSpec::Model(_) => x,
    };
    Ok(y)
  }
}

fn take_value(
  values: &mut [Option<ArrayD<f32>>],
  uses: &mut [usize],
  index: usize,
  layer: &str,
) -> Result<ArrayD<f32>, GraphError> {
  uses[index] = uses[index].saturating_sub(1);
  let value = if uses[index] == 0 {
    values[index].take()
  } else {
    values[index].clone()
  };
  value.ok_or_else(|| GraphError::UnknownInbound {
    layer: layer.to_string(),
    inbound: format!("#{}", index),
  })
}

impl Graph {
  /// 按拓扑序构建，参数用 `seed` 初始化
  pub fn build(spec: &GraphSpec, seed: u64) -> Result<Self, GraphError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let graph = Self::build_with(spec, &mut rng)?;
    debug!(
      "计算图 {} 构建完成: {} 个节点, {} 个参数",
      graph.name,
      graph.nodes.len(),
      graph.parameter_count()
    );
    Ok(graph)
  }

  fn build_with(spec: &GraphSpec, rng: &mut ChaCha8Rng) -> Result<Self, GraphError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(spec.nodes.len());
    let mut nodes: Vec<Node> = Vec::with_capacity(spec.nodes.len());

    for node_spec in &spec.nodes {
      if index.contains_key(node_spec.name.as_str()) {
        return Err(GraphError::DuplicateLayer(node_spec.name.clone()));
      }
      let inbound = node_spec
        .inbound
        .iter()
        .map(|name| {
          index
            .get(name.as_str())
            .copied()
            .ok_or_else(|| GraphError::UnknownInbound {
              layer: node_spec.name.clone(),
              inbound: name.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
      let input_shapes = inbound
        .iter()
        .map(|&i| nodes[i].output_shape.as_slice())
        .collect::<Vec<_>>();
      let node = Node::build(&node_spec.name, &node_spec.layer, &input_shapes, inbound, rng)?;
      index.insert(node_spec.name.as_str(), nodes.len());
      nodes.push(node);
    }

    let resolve = |names: &[String]| {
      names
        .iter()
        .map(|name| {
          index
            .get(name.as_str())
            .copied()
            .ok_or_else(|| GraphError::UnknownInbound {
              layer: spec.name.clone(),
              inbound: name.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
    };
    let inputs = resolve(&spec.inputs)?;
    let outputs = resolve(&spec.outputs)?;
    if inputs.is_empty()
      || outputs.is_empty()
      || inputs.iter().any(|&i| !matches!(nodes[i].op, Op::Input))
    {
      return Err(GraphError::MissingEndpoint(spec.name.clone()));
    }

    let mut uses = vec![0usize; nodes.len()];
    for node in &nodes {
      for &i in &node.inbound {
        uses[i] += 1;
      }
    }
    for &o in &outputs {
      uses[o] += 1;
    }

    Ok(Self {
      name: spec.name.clone(),
      nodes,
      inputs,
      outputs,
      uses,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// 第一个输入的形状（不含批次维）
  pub fn input_shape(&self) -> Option<&[usize]> {
    self
      .inputs
      .first()
      .map(|&i| self.nodes[i].output_shape.as_slice())
  }

  pub fn output_shape(&self) -> Option<&[usize]> {
    self
      .outputs
      .first()
      .map(|&o| self.nodes[o].output_shape.as_slice())
  }

  pub fn input_count(&self) -> usize {
    self.inputs.len()
  }

  pub fn parameter_count(&self) -> usize {
    self
      .nodes
      .iter()
      .map(|node| match &node.op {
        Op::Model(inner) => inner.parameter_count(),
        _ => node.params.iter().map(|p| p.value.len()).sum(),
      })
      .sum()
  }

  /// 展开嵌套模型后的逐层摘要
  pub fn summary(&self) -> Vec<LayerSummary> {
    let mut layers = Vec::new();
    self.collect_summary("", &mut layers);
    layers
  }

  fn collect_summary(&self, prefix: &str, layers: &mut Vec<LayerSummary>) {
    for node in &self.nodes {
      let path = format!("{}{}", prefix, node.name);
      let (kind, parameters) = match &node.op {
        Op::Input => ("InputLayer", 0),
        Op::Layer(spec) => (kind_name(spec), node.params.iter().map(|p| p.value.len()).sum()),
        Op::Model(inner) => ("Functional", inner.parameter_count()),
      };
      layers.push(LayerSummary {
        path: path.clone(),
        kind,
        output_shape: node.output_shape.clone(),
        parameters,
      });
      if let Op::Model(inner) = &node.op {
        inner.collect_summary(&format!("{}/", path), layers);
      }
    }
  }

  /// 绑定制品中的权重。
  ///
  /// 层路径找不到时退回到只用层名查找，兼容嵌套模型权重被平铺保存的制品。
  pub fn bind(&mut self, weights: &WeightGroups, mode: BindMode) -> Result<BindReport, GraphError> {
    let mut report = BindReport::default();
    self.bind_into("", weights, mode, &mut report)?;
    debug!(
      "权重绑定 ({:?}): 绑定 {}, 缺失 {}, 形状不符 {}",
      mode,
      report.bound.len(),
      report.missing.len(),
      report.mismatched.len()
    );
    Ok(report)
  }

  fn bind_into(
    &mut self,
    prefix: &str,
    weights: &WeightGroups,
    mode: BindMode,
    report: &mut BindReport,
  ) -> Result<(), GraphError> {
    for node in &mut self.nodes {
      let path = format!("{}{}", prefix, node.name);
      if let Op::Model(inner) = &mut node.op {
        inner.bind_into(&format!("{}/", path), weights, mode, report)?;
        continue;
      }
      if node.params.is_empty() {
        continue;
      }

      let group = weights.get(&path).or_else(|| weights.get(&node.name));
      for param in &mut node.params {
        let full = format!("{}/{}", path, param.name);
        match group.and_then(|g| g.get(param.name)) {
          Some(tensor) if tensor.shape.as_slice() == param.value.shape() => {
            param.value = ArrayD::from_shape_vec(IxDyn(&tensor.shape), tensor.data.clone())?;
            report.bound.insert(full);
          }
          Some(tensor) => {
            if mode == BindMode::Strict {
              return Err(GraphError::WeightShapeMismatch {
                path: full,
                expected: param.value.shape().to_vec(),
                actual: tensor.shape.clone(),
              });
            }
            debug!(
              "跳过形状不符的权重 {}: {:?} != {:?}",
              full,
              tensor.shape,
              param.value.shape()
            );
            report.mismatched.insert(full);
          }
          None => {
            if mode == BindMode::Strict {
              return Err(GraphError::MissingWeight { path: full });
            }
            debug!("跳过缺失的权重 {}", full);
            report.missing.insert(full);
          }
        }
      }
    }
    Ok(())
  }

  /// 导出当前全部参数，层路径与 [`Graph::bind`] 使用的一致
  pub fn weights(&self) -> WeightGroups {
    let mut groups = WeightGroups::new();
    self.collect_weights("", &mut groups);
    groups
  }

  fn collect_weights(&self, prefix: &str, groups: &mut WeightGroups) {
    for node in &self.nodes {
      let path = format!("{}{}", prefix, node.name);
      if let Op::Model(inner) = &node.op {
        inner.collect_weights(&format!("{}/", path), groups);
        continue;
      }
      for param in &node.params {
        groups.entry(path.clone()).or_default().insert(
          param.name.to_string(),
          WeightTensor::new(
            param.value.shape().to_vec(),
            param.value.iter().copied().collect(),
          ),
        );
      }
    }
  }

  /// 前向计算。每个输入的形状为 (n, ...输入层形状)
  pub fn forward(&self, inputs: Vec<ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>, GraphError> {
    if inputs.len() != self.inputs.len() {
      return Err(GraphError::InputCount {
        expected: self.inputs.len(),
        actual: inputs.len(),
      });
    }

    let mut values: Vec<Option<ArrayD<f32>>> = vec![None; self.nodes.len()];
    for (&index, input) in self.inputs.iter().zip(inputs) {
      let expected = &self.nodes[index].output_shape;
      if input.ndim() == 0 || input.shape()[1..] != expected[..] {
        return Err(GraphError::InputShape {
          expected: expected.clone(),
          actual: input.shape().to_vec(),
        });
      }
      values[index] = Some(input);
    }

    let mut uses = self.uses.clone();
    for (i, node) in self.nodes.iter().enumerate() {
      if matches!(node.op, Op::Input) {
        continue;
      }
      let mut args = Vec::with_capacity(node.inbound.len());
      for &j in &node.inbound {
        args.push(take_value(&mut values, &mut uses, j, &node.name)?);
      }
      values[i] = Some(node.apply(args)?);
    }

    self
      .outputs
      .iter()
      .map(|&o| {
        values[o]
          .clone()
          .ok_or_else(|| GraphError::MissingEndpoint(self.name.clone()))
      })
      .collect()
  }
}
