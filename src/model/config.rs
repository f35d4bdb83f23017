// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/config.rs - 层配置树解析与兼容性修补
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

//! Keras 风格层配置树的解析。
//!
//! 支持 `Functional`/`Model`（Keras 2 列表形式的 `inbound_nodes` 与 Keras 3 的
//! `keras_history` 形式）和 `Sequential`，以及作为层嵌套的子模型。
//! 严格模式下 `InputLayer` 只接受已知参数，旧版的 `batch_shape` 会被拒绝；
//! 宽松模式忽略未知参数，并直接从 `batch_shape` 推出输入形状。

use std::collections::HashMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
  Strict,
  Permissive,
}

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("层 {layer} 含无法识别的参数 `{keyword}`")]
  UnrecognizedKeyword { layer: String, keyword: String },
  #[error("层 {layer} 的类型 {class_name} 不受支持")]
  UnsupportedLayer { layer: String, class_name: String },
  #[error("层 {layer} 配置无效: {reason}")]
  InvalidLayer { layer: String, reason: String },
  #[error("模型配置无效: {0}")]
  InvalidModel(String),
  #[error("配置 JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
}

impl ConfigError {
  fn invalid(layer: &str, reason: impl Into<String>) -> Self {
    ConfigError::InvalidLayer {
      layer: layer.to_string(),
      reason: reason.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
  Valid,
  Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
  Linear,
  Relu,
  Relu6,
  Sigmoid,
  Softmax,
  Tanh,
}

impl Activation {
  pub fn parse(name: &str) -> Option<Self> {
    match name {
      "linear" | "identity" => Some(Activation::Linear),
      "relu" => Some(Activation::Relu),
      "relu6" => Some(Activation::Relu6),
      "sigmoid" => Some(Activation::Sigmoid),
      "softmax" => Some(Activation::Softmax),
      "tanh" => Some(Activation::Tanh),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReluSpec {
  pub max_value: Option<f32>,
  pub negative_slope: f32,
  pub threshold: f32,
}

impl ReluSpec {
  pub fn relu6() -> Self {
    Self {
      max_value: Some(6.0),
      negative_slope: 0.0,
      threshold: 0.0,
    }
  }
}

/// 不含权重的层描述
#[derive(Debug, Clone, PartialEq)]
pub enum LayerSpec {
  /// 不含批次维的形状
  Input {
    shape: Vec<usize>,
  },
  Conv2D {
    filters: usize,
    kernel: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    use_bias: bool,
    activation: Activation,
  },
  DepthwiseConv2D {
    kernel: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    use_bias: bool,
    activation: Activation,
  },
  BatchNormalization {
    epsilon: f32,
    center: bool,
    scale: bool,
  },
  ReLU(ReluSpec),
  Activation(Activation),
  ZeroPadding2D {
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
  },
  Add,
  GlobalAveragePooling2D,
  Flatten,
  Dense {
    units: usize,
    use_bias: bool,
    activation: Activation,
  },
  Dropout {
    rate: f32,
  },
  Model(GraphSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
  pub name: String,
  pub layer: LayerSpec,
  pub inbound: Vec<String>,
}

/// 有向无环的层图描述，节点按拓扑序排列
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSpec {
  pub name: String,
  pub nodes: Vec<NodeSpec>,
  pub inputs: Vec<String>,
  pub outputs: Vec<String>,
}

impl GraphSpec {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      nodes: Vec::new(),
      inputs: Vec::new(),
      outputs: Vec::new(),
    }
  }

  /// 追加一个节点并返回其名称；输入层自动登记为图输入
  pub fn push(&mut self, name: &str, layer: LayerSpec, inbound: &[&str]) -> String {
    if matches!(layer, LayerSpec::Input { .. }) {
      self.inputs.push(name.to_string());
    }
    self.nodes.push(NodeSpec {
      name: name.to_string(),
      layer,
      inbound: inbound.iter().map(|s| s.to_string()).collect(),
    });
    name.to_string()
  }

  pub fn set_output(&mut self, name: &str) {
    self.outputs = vec![name.to_string()];
  }

  pub fn node(&self, name: &str) -> Option<&NodeSpec> {
    self.nodes.iter().find(|n| n.name == name)
  }
}

/// 解析顶层模型配置
pub fn parse_model_config(value: &Value, mode: ParseMode) -> Result<GraphSpec, ConfigError> {
  let class_name = value
    .get("class_name")
    .and_then(Value::as_str)
    .ok_or_else(|| ConfigError::InvalidModel("缺少 class_name".to_string()))?;
  let config = value
    .get("config")
    .ok_or_else(|| ConfigError::InvalidModel("缺少 config".to_string()))?;

  let spec = match class_name {
    "Functional" | "Model" => parse_functional(config, mode)?,
    "Sequential" => parse_sequential(config, mode)?,
    other => {
      return Err(ConfigError::InvalidModel(format!(
        "不支持的模型类型 {}",
        other
      )));
    }
  };

  debug!(
    "解析模型配置 {} ({:?}): {} 个节点",
    spec.name,
    mode,
    spec.nodes.len()
  );
  Ok(spec)
}

fn model_name(config: &Value, fallback: &str) -> String {
  config
    .get("name")
    .and_then(Value::as_str)
    .unwrap_or(fallback)
    .to_string()
}

fn parse_functional(config: &Value, mode: ParseMode) -> Result<GraphSpec, ConfigError> {
  let name = model_name(config, "functional");
  let layers = config
    .get("layers")
    .and_then(Value::as_array)
    .ok_or_else(|| ConfigError::InvalidModel(format!("模型 {} 缺少 layers", name)))?;

  let mut spec = GraphSpec::new(&name);
  let mut ranks = HashMap::new();
  for entry in layers {
    let (layer_name, class_name, layer_config) = layer_header(entry)?;
    let inbound = match class_name {
      "InputLayer" => Vec::new(),
      _ => entry.get("inbound_nodes").map(node_refs).unwrap_or_default(),
    };
    let rank = input_rank(&ranks, &inbound);
    let layer = parse_layer(&layer_name, class_name, layer_config, mode, rank)?;
    if let Some(rank) = output_rank(&layer, rank) {
      ranks.insert(layer_name.clone(), rank);
    }
    let inbound = inbound.iter().map(String::as_str).collect::<Vec<_>>();
    spec.push(&layer_name, layer, &inbound);
  }

  if let Some(inputs) = config.get("input_layers") {
    spec.inputs = node_refs(inputs);
  }
  spec.outputs = config.get("output_layers").map(node_refs).unwrap_or_default();
  if spec.outputs.is_empty() {
    return Err(ConfigError::InvalidModel(format!(
      "模型 {} 缺少 output_layers",
      name
    )));
  }

  Ok(spec)
}

fn parse_sequential(config: &Value, mode: ParseMode) -> Result<GraphSpec, ConfigError> {
  let name = model_name(config, "sequential");
  // 旧版 Sequential 配置直接是层列表
  let layers = config
    .get("layers")
    .or(Some(config))
    .and_then(Value::as_array)
    .ok_or_else(|| ConfigError::InvalidModel(format!("模型 {} 缺少 layers", name)))?;

  let mut spec = GraphSpec::new(&name);
  let mut previous: Option<String> = None;
  let mut rank = None;

  for entry in layers {
    let (layer_name, class_name, layer_config) = layer_header(entry)?;

    if previous.is_none() && class_name != "InputLayer" {
      let shape = sequential_input_shape(&layer_name, layer_config, mode)?;
      let input_name = format!("{}_input", layer_name);
      rank = Some(shape.len() + 1);
      previous = Some(spec.push(&input_name, LayerSpec::Input { shape }, &[]));
    }

    let layer = parse_layer(&layer_name, class_name, layer_config, mode, rank)?;
    rank = output_rank(&layer, rank);
    let inbound = previous.iter().map(String::as_str).collect::<Vec<_>>();
    previous = Some(spec.push(&layer_name, layer, &inbound));
  }

  let output = previous.ok_or_else(|| ConfigError::InvalidModel(format!("模型 {} 没有层", name)))?;
  spec.set_output(&output);
  Ok(spec)
}

/// Sequential 首层自带的输入形状
fn sequential_input_shape(
  layer: &str,
  config: &Map<String, Value>,
  mode: ParseMode,
) -> Result<Vec<usize>, ConfigError> {
  if let Some(batch) = config.get("batch_input_shape") {
    return batch_dims(layer, batch);
  }
  if let Some(batch) = config.get("batch_shape") {
    return match mode {
      ParseMode::Permissive => batch_dims(layer, batch),
      ParseMode::Strict => Err(ConfigError::UnrecognizedKeyword {
        layer: layer.to_string(),
        keyword: "batch_shape".to_string(),
      }),
    };
  }
  Err(ConfigError::invalid(layer, "Sequential 模型缺少输入形状"))
}

fn layer_header(entry: &Value) -> Result<(String, &str, &Map<String, Value>), ConfigError> {
  let class_name = entry
    .get("class_name")
    .and_then(Value::as_str)
    .ok_or_else(|| ConfigError::InvalidModel("层缺少 class_name".to_string()))?;
  let config = entry
    .get("config")
    .and_then(Value::as_object)
    .ok_or_else(|| ConfigError::InvalidModel(format!("层 {} 缺少 config", class_name)))?;
  let name = entry
    .get("name")
    .and_then(Value::as_str)
    .or_else(|| config.get("name").and_then(Value::as_str))
    .ok_or_else(|| ConfigError::InvalidModel(format!("{} 层缺少名称", class_name)))?;
  Ok((name.to_string(), class_name, config))
}

/// 提取节点引用中的层名。
///
/// Keras 2: `[[["conv2d", 0, 0, {}]]]`；
/// Keras 3: `[{"args": [{"config": {"keras_history": ["conv2d", 0, 0]}}]}]`；
/// 顶层 `input_layers` 可能是 `[["in", 0, 0]]` 或 `["in", 0, 0]`。
pub fn node_refs(value: &Value) -> Vec<String> {
  let mut names = Vec::new();
  collect_node_refs(value, &mut names);
  names
}

fn collect_node_refs(value: &Value, names: &mut Vec<String>) {
  match value {
    Value::Array(items) => {
      if let [Value::String(name), Value::Number(_), ..] = items.as_slice() {
        names.push(name.clone());
      } else {
        items.iter().for_each(|item| collect_node_refs(item, names));
      }
    }
    Value::Object(map) => {
      if let Some(history) = map.get("keras_history") {
        collect_node_refs(history, names);
      } else {
        map.values().for_each(|item| collect_node_refs(item, names));
      }
    }
    _ => {}
  }
}

const INPUT_LAYER_KEYWORDS: &[&str] = &[
  "name",
  "shape",
  "batch_input_shape",
  "batch_size",
  "dtype",
  "sparse",
  "ragged",
];

fn parse_input_layer(
  layer: &str,
  config: &Map<String, Value>,
  mode: ParseMode,
) -> Result<LayerSpec, ConfigError> {
  if mode == ParseMode::Strict
    && let Some(keyword) = config
      .keys()
      .find(|k| !INPUT_LAYER_KEYWORDS.contains(&k.as_str()))
  {
    return Err(ConfigError::UnrecognizedKeyword {
      layer: layer.to_string(),
      keyword: keyword.clone(),
    });
  }

  let shape = if let Some(shape) = config.get("shape").filter(|v| !v.is_null()) {
    dims(layer, shape)?
  } else if let Some(batch) = config.get("batch_input_shape") {
    batch_dims(layer, batch)?
  } else if let Some(batch) = config.get("batch_shape") {
    // 严格模式在上面已经拒绝了 batch_shape
    batch_dims(layer, batch)?
  } else {
    return Err(ConfigError::invalid(layer, "输入层缺少形状"));
  };

  Ok(LayerSpec::Input { shape })
}

fn dims(layer: &str, value: &Value) -> Result<Vec<usize>, ConfigError> {
  let items = value
    .as_array()
    .ok_or_else(|| ConfigError::invalid(layer, "形状必须是数组"))?;
  items
    .iter()
    .map(|v| {
      v.as_u64()
        .map(|d| d as usize)
        .ok_or_else(|| ConfigError::invalid(layer, format!("不支持动态或非法维度 {}", v)))
    })
    .collect()
}

fn batch_dims(layer: &str, value: &Value) -> Result<Vec<usize>, ConfigError> {
  let items = value
    .as_array()
    .filter(|a| a.len() > 1)
    .ok_or_else(|| ConfigError::invalid(layer, "批次形状至少需要两个维度"))?;
  dims(layer, &Value::Array(items[1..].to_vec()))
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(untagged)]
enum IntOrPair {
  Int(usize),
  Pair([usize; 2]),
}

impl IntOrPair {
  fn pair(self) -> (usize, usize) {
    match self {
      IntOrPair::Int(v) => (v, v),
      IntOrPair::Pair([a, b]) => (a, b),
    }
  }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(untagged)]
enum PaddingAmount {
  Int(usize),
  Symmetric([usize; 2]),
  Full([[usize; 2]; 2]),
}

fn default_unit() -> IntOrPair {
  IntOrPair::Int(1)
}

fn default_padding() -> String {
  "valid".to_string()
}

fn default_true() -> bool {
  true
}

#[derive(Deserialize)]
struct ConvConfig {
  #[serde(default)]
  filters: Option<usize>,
  kernel_size: IntOrPair,
  #[serde(default = "default_unit")]
  strides: IntOrPair,
  #[serde(default = "default_padding")]
  padding: String,
  #[serde(default)]
  data_format: Option<String>,
  #[serde(default)]
  dilation_rate: Option<IntOrPair>,
  #[serde(default)]
  groups: Option<usize>,
  #[serde(default)]
  depth_multiplier: Option<usize>,
  #[serde(default = "default_true")]
  use_bias: bool,
  #[serde(default)]
  activation: Option<String>,
}

#[derive(Deserialize)]
struct BatchNormConfig {
  #[serde(default)]
  axis: Option<Value>,
  #[serde(default)]
  epsilon: Option<f32>,
  #[serde(default = "default_true")]
  center: bool,
  #[serde(default = "default_true")]
  scale: bool,
}

#[derive(Deserialize)]
struct ReluConfig {
  #[serde(default)]
  max_value: Option<f32>,
  #[serde(default)]
  negative_slope: Option<f32>,
  #[serde(default)]
  threshold: Option<f32>,
}

#[derive(Deserialize)]
struct ActivationConfig {
  activation: String,
}

#[derive(Deserialize)]
struct ZeroPaddingConfig {
  #[serde(default)]
  padding: Option<PaddingAmount>,
}

#[derive(Deserialize)]
struct PoolingConfig {
  #[serde(default)]
  data_format: Option<String>,
  #[serde(default)]
  keepdims: bool,
}

#[derive(Deserialize)]
struct DenseConfig {
  units: usize,
  #[serde(default = "default_true")]
  use_bias: bool,
  #[serde(default)]
  activation: Option<String>,
}

#[derive(Deserialize)]
struct DropoutConfig {
  #[serde(default)]
  rate: f32,
}

fn typed<T: DeserializeOwned>(layer: &str, config: &Map<String, Value>) -> Result<T, ConfigError> {
  serde_json::from_value(Value::Object(config.clone()))
    .map_err(|e| ConfigError::invalid(layer, e.to_string()))
}

fn activation(layer: &str, name: Option<&str>) -> Result<Activation, ConfigError> {
  let name = name.unwrap_or("linear");
  Activation::parse(name).ok_or_else(|| ConfigError::invalid(layer, format!("不支持的激活函数 {}", name)))
}

fn padding(layer: &str, name: &str) -> Result<Padding, ConfigError> {
  match name.to_ascii_lowercase().as_str() {
    "valid" => Ok(Padding::Valid),
    "same" => Ok(Padding::Same),
    other => Err(ConfigError::invalid(layer, format!("不支持的填充方式 {}", other))),
  }
}

fn check_channels_last(layer: &str, data_format: Option<&str>) -> Result<(), ConfigError> {
  match data_format {
    None | Some("channels_last") => Ok(()),
    Some(other) => Err(ConfigError::invalid(layer, format!("只支持 channels_last, 实际为 {}", other))),
  }
}

fn parse_conv(layer: &str, config: ConvConfig, depthwise: bool) -> Result<LayerSpec, ConfigError> {
  check_channels_last(layer, config.data_format.as_deref())?;
  if config.dilation_rate.map(IntOrPair::pair).unwrap_or((1, 1)) != (1, 1) {
    return Err(ConfigError::invalid(layer, "不支持空洞卷积"));
  }
  if config.groups.unwrap_or(1) != 1 {
    return Err(ConfigError::invalid(layer, "不支持分组卷积"));
  }

  let kernel = config.kernel_size.pair();
  let strides = config.strides.pair();
  let padding = padding(layer, &config.padding)?;
  let activation = activation(layer, config.activation.as_deref())?;

  if depthwise {
    if config.depth_multiplier.unwrap_or(1) != 1 {
      return Err(ConfigError::invalid(layer, "深度卷积只支持 depth_multiplier = 1"));
    }
    Ok(LayerSpec::DepthwiseConv2D {
      kernel,
      strides,
      padding,
      use_bias: config.use_bias,
      activation,
    })
  } else {
    let filters = config
      .filters
      .ok_or_else(|| ConfigError::invalid(layer, "卷积层缺少 filters"))?;
    Ok(LayerSpec::Conv2D {
      filters,
      kernel,
      strides,
      padding,
      use_bias: config.use_bias,
      activation,
    })
  }
}

/// 层输出的秩（含批次维），未知时为 `None`
fn output_rank(layer: &LayerSpec, input: Option<usize>) -> Option<usize> {
  match layer {
    LayerSpec::Input { shape } => Some(shape.len() + 1),
    LayerSpec::GlobalAveragePooling2D | LayerSpec::Flatten => Some(2),
    LayerSpec::Model(nested) => model_output_rank(nested),
    _ => input,
  }
}

fn input_rank(ranks: &HashMap<String, usize>, inbound: &[String]) -> Option<usize> {
  inbound.first().and_then(|name| ranks.get(name)).copied()
}

fn model_output_rank(spec: &GraphSpec) -> Option<usize> {
  let mut ranks = HashMap::new();
  for node in &spec.nodes {
    if let Some(rank) = output_rank(&node.layer, input_rank(&ranks, &node.inbound)) {
      ranks.insert(node.name.clone(), rank);
    }
  }
  spec.outputs.first().and_then(|name| ranks.get(name)).copied()
}

/// 轴必须是最后一维；秩未知时按 NHWC 处理
fn last_axis(axis: Option<&Value>, rank: Option<usize>) -> bool {
  match axis {
    None => true,
    Some(Value::Number(n)) => match (n.as_i64(), rank) {
      (Some(-1), _) => true,
      (Some(axis), Some(rank)) => axis >= 1 && axis as usize + 1 == rank,
      (Some(axis), None) => axis == 3,
      (None, _) => false,
    },
    Some(Value::Array(items)) => items.len() == 1 && last_axis(items.first(), rank),
    Some(_) => false,
  }
}

/// `rank` 为该层输入的秩
fn parse_layer(
  layer: &str,
  class_name: &str,
  config: &Map<String, Value>,
  mode: ParseMode,
  rank: Option<usize>,
) -> Result<LayerSpec, ConfigError> {
  let spec = match class_name {
    "InputLayer" => parse_input_layer(layer, config, mode)?,
    "Conv2D" | "Convolution2D" => parse_conv(layer, typed(layer, config)?, false)?,
    "DepthwiseConv2D" => parse_conv(layer, typed(layer, config)?, true)?,
    "BatchNormalization" => {
      let bn: BatchNormConfig = typed(layer, config)?;
      if !last_axis(bn.axis.as_ref(), rank) {
        return Err(ConfigError::invalid(layer, "批归一化只支持通道轴"));
      }
      LayerSpec::BatchNormalization {
        epsilon: bn.epsilon.unwrap_or(1e-3),
        center: bn.center,
        scale: bn.scale,
      }
    }
    "ReLU" => {
      let relu: ReluConfig = typed(layer, config)?;
      LayerSpec::ReLU(ReluSpec {
        max_value: relu.max_value,
        negative_slope: relu.negative_slope.unwrap_or(0.0),
        threshold: relu.threshold.unwrap_or(0.0),
      })
    }
    "Activation" => {
      let act: ActivationConfig = typed(layer, config)?;
      LayerSpec::Activation(activation(layer, Some(&act.activation))?)
    }
    "ZeroPadding2D" => {
      let zp: ZeroPaddingConfig = typed(layer, config)?;
      let ((top, bottom), (left, right)) = match zp.padding.unwrap_or(PaddingAmount::Int(1)) {
        PaddingAmount::Int(p) => ((p, p), (p, p)),
        PaddingAmount::Symmetric([h, w]) => ((h, h), (w, w)),
        PaddingAmount::Full([[t, b], [l, r]]) => ((t, b), (l, r)),
      };
      LayerSpec::ZeroPadding2D {
        top,
        bottom,
        left,
        right,
      }
    }
    "Add" => LayerSpec::Add,
    "GlobalAveragePooling2D" => {
      let pool: PoolingConfig = typed(layer, config)?;
      check_channels_last(layer, pool.data_format.as_deref())?;
      if pool.keepdims {
        return Err(ConfigError::invalid(layer, "不支持 keepdims"));
      }
      LayerSpec::GlobalAveragePooling2D
    }
    "Flatten" => LayerSpec::Flatten,
    "Dense" => {
      let dense: DenseConfig = typed(layer, config)?;
      LayerSpec::Dense {
        units: dense.units,
        use_bias: dense.use_bias,
        activation: activation(layer, dense.activation.as_deref())?,
      }
    }
    "Dropout" => {
      let dropout: DropoutConfig = typed(layer, config)?;
      LayerSpec::Dropout { rate: dropout.rate }
    }
    "Functional" | "Model" => {
      let mut nested = parse_functional(&Value::Object(config.clone()), mode)?;
      nested.name = layer.to_string();
      LayerSpec::Model(nested)
    }
    "Sequential" => {
      let mut nested = parse_sequential(&Value::Object(config.clone()), mode)?;
      nested.name = layer.to_string();
      LayerSpec::Model(nested)
    }
    other => {
      return Err(ConfigError::UnsupportedLayer {
        layer: layer.to_string(),
        class_name: other.to_string(),
      });
    }
  };
  Ok(spec)
}

/// 递归改写所有 `InputLayer` 节点：去掉 `batch_shape`，
/// 并以去掉批次维后的 `shape` 代替。返回改写的节点数。
pub fn patch_batch_shape(value: &mut Value) -> usize {
  match value {
    Value::Object(map) => {
      let mut patched = 0;
      let is_input = map.get("class_name").and_then(Value::as_str) == Some("InputLayer");
      if is_input
        && let Some(Value::Object(config)) = map.get_mut("config")
        && let Some(batch_shape) = config.remove("batch_shape")
      {
        if let Value::Array(dims) = batch_shape
          && dims.len() > 1
          && !config.contains_key("shape")
        {
          config.insert("shape".to_string(), Value::Array(dims[1..].to_vec()));
        }
        patched += 1;
      }
      patched
        + map
          .values_mut()
          .map(patch_batch_shape)
          .sum::<usize>()
    }
    Value::Array(items) => items.iter_mut().map(patch_batch_shape).sum(),
    _ => 0,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn legacy_functional() -> Value {
    json!({
      "class_name": "Functional",
      "config": {
        "name": "functional",
        "layers": [
          {
            "class_name": "InputLayer",
            "name": "input_layer_1",
            "config": {"batch_shape": [null, 224, 224, 1], "dtype": "float32", "sparse": false, "name": "input_layer_1"},
            "inbound_nodes": []
          },
          {
            "class_name": "Conv2D",
            "name": "conv2d",
            "config": {"name": "conv2d", "filters": 3, "kernel_size": [1, 1], "strides": [1, 1],
                       "padding": "valid", "activation": "linear", "use_bias": true,
                       "kernel_initializer": {"class_name": "GlorotUniform", "config": {"seed": null}}},
            "inbound_nodes": [{"args": [{"class_name": "__keras_tensor__",
                                         "config": {"shape": [null, 224, 224, 1], "keras_history": ["input_layer_1", 0, 0]}}],
                               "kwargs": {}}]
          },
          {
            "class_name": "GlobalAveragePooling2D",
            "name": "global_average_pooling2d",
            "config": {"name": "global_average_pooling2d", "data_format": "channels_last", "keepdims": false},
            "inbound_nodes": [[["conv2d", 0, 0, {}]]]
          },
          {
            "class_name": "Dense",
            "name": "dense_1",
            "config": {"name": "dense_1", "units": 1, "activation": "sigmoid", "use_bias": true},
            "inbound_nodes": [[["global_average_pooling2d", 0, 0, {}]]]
          }
        ],
        "input_layers": [["input_layer_1", 0, 0]],
        "output_layers": ["dense_1", 0, 0]
      }
    })
  }

  #[test]
  fn strict_mode_rejects_batch_shape() {
    let err = parse_model_config(&legacy_functional(), ParseMode::Strict).unwrap_err();
    match err {
      ConfigError::UnrecognizedKeyword { layer, keyword } => {
        assert_eq!(layer, "input_layer_1");
        assert_eq!(keyword, "batch_shape");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn permissive_mode_reads_batch_shape_in_place() {
    let spec = parse_model_config(&legacy_functional(), ParseMode::Permissive).unwrap();
    assert_eq!(spec.inputs, vec!["input_layer_1"]);
    assert_eq!(spec.outputs, vec!["dense_1"]);
    assert_eq!(
      spec.node("input_layer_1").unwrap().layer,
      LayerSpec::Input {
        shape: vec![224, 224, 1]
      }
    );
    assert_eq!(spec.node("conv2d").unwrap().inbound, vec!["input_layer_1"]);
    assert_eq!(
      spec.node("dense_1").unwrap().inbound,
      vec!["global_average_pooling2d"]
    );
  }

  #[test]
  fn patch_rewrites_every_input_layer() {
    let mut config = legacy_functional();
    // 嵌套模型里的输入层也要改写
    config["config"]["layers"]
      .as_array_mut()
      .unwrap()
      .push(json!({
        "class_name": "Functional",
        "name": "backbone",
        "config": {"name": "backbone", "layers": [
          {"class_name": "InputLayer", "name": "inner", "config": {"batch_shape": [null, 8, 8, 3], "name": "inner"}}
        ], "input_layers": [["inner", 0, 0]], "output_layers": [["inner", 0, 0]]}
      }));

    assert_eq!(patch_batch_shape(&mut config), 2);
    let outer = &config["config"]["layers"][0]["config"];
    assert!(outer.get("batch_shape").is_none());
    assert_eq!(outer["shape"], json!([224, 224, 1]));
    let inner = &config["config"]["layers"][4]["config"]["layers"][0]["config"];
    assert_eq!(inner["shape"], json!([8, 8, 3]));

    assert_eq!(patch_batch_shape(&mut config), 0);
    let spec = parse_model_config(&legacy_functional_patched(), ParseMode::Strict).unwrap();
    assert_eq!(spec.nodes.len(), 4);
  }

  fn legacy_functional_patched() -> Value {
    let mut config = legacy_functional();
    patch_batch_shape(&mut config);
    config
  }

  #[test]
  fn sequential_with_batch_input_shape_gets_an_input_node() {
    let config = json!({
      "class_name": "Sequential",
      "config": {"name": "seq", "layers": [
        {"class_name": "Flatten", "config": {"name": "flatten", "batch_input_shape": [null, 2, 2, 1]}},
        {"class_name": "Dense", "config": {"name": "out", "units": 1, "activation": "sigmoid"}}
      ]}
    });
    let spec = parse_model_config(&config, ParseMode::Strict).unwrap();
    assert_eq!(spec.inputs, vec!["flatten_input"]);
    assert_eq!(spec.nodes.len(), 3);
    assert_eq!(spec.outputs, vec!["out"]);
    assert_eq!(spec.node("out").unwrap().inbound, vec!["flatten"]);
  }

  #[test]
  fn unsupported_layers_and_options_are_reported() {
    let config = json!({
      "class_name": "Sequential",
      "config": {"layers": [
        {"class_name": "InputLayer", "config": {"name": "in", "shape": [4]}},
        {"class_name": "LSTM", "config": {"name": "lstm", "units": 4}}
      ]}
    });
    assert!(matches!(
      parse_model_config(&config, ParseMode::Permissive),
      Err(ConfigError::UnsupportedLayer { .. })
    ));

    let config = json!({
      "class_name": "Sequential",
      "config": {"layers": [
        {"class_name": "InputLayer", "config": {"name": "in", "shape": [4, 4, 1]}},
        {"class_name": "Conv2D", "config": {"name": "c", "filters": 1, "kernel_size": 3, "dilation_rate": [2, 2]}}
      ]}
    });
    assert!(matches!(
      parse_model_config(&config, ParseMode::Permissive),
      Err(ConfigError::InvalidLayer { .. })
    ));
  }

  #[test]
  fn zero_padding_forms() {
    let layer = |padding: Value| {
      let config = json!({"name": "pad", "padding": padding});
      parse_layer("pad", "ZeroPadding2D", config.as_object().unwrap(), ParseMode::Strict, Some(4)).unwrap()
    };
    assert_eq!(
      layer(json!([[0, 1], [0, 1]])),
      LayerSpec::ZeroPadding2D {
        top: 0,
        bottom: 1,
        left: 0,
        right: 1
      }
    );
    assert_eq!(
      layer(json!(2)),
      LayerSpec::ZeroPadding2D {
        top: 2,
        bottom: 2,
        left: 2,
        right: 2
      }
    );
  }

  fn with_batch_norm(axis: Value, after_pooling: bool) -> Value {
    let mut layers = vec![
      json!({"class_name": "InputLayer", "config": {"name": "in", "shape": [4, 4, 2]}}),
    ];
    if after_pooling {
      layers.push(json!({"class_name": "GlobalAveragePooling2D", "config": {"name": "gap"}}));
    }
    layers.push(json!({"class_name": "BatchNormalization", "config": {"name": "bn", "axis": axis}}));
    json!({"class_name": "Sequential", "config": {"name": "seq", "layers": layers}})
  }

  #[test]
  fn batch_norm_on_a_spatial_axis_is_rejected() {
    for mode in [ParseMode::Strict, ParseMode::Permissive] {
      for axis in [json!(1), json!([1]), json!(2)] {
        match parse_model_config(&with_batch_norm(axis.clone(), false), mode) {
          Err(ConfigError::InvalidLayer { layer, .. }) => assert_eq!(layer, "bn"),
          other => panic!("axis {axis} in {mode:?}: {other:?}"),
        }
      }
      for axis in [json!(3), json!(-1), json!([3])] {
        assert!(parse_model_config(&with_batch_norm(axis, false), mode).is_ok());
      }
    }
  }

  #[test]
  fn batch_norm_after_pooling_uses_axis_one() {
    for mode in [ParseMode::Strict, ParseMode::Permissive] {
      assert!(parse_model_config(&with_batch_norm(json!(1), true), mode).is_ok());
      assert!(parse_model_config(&with_batch_norm(json!(-1), true), mode).is_ok());
      assert!(parse_model_config(&with_batch_norm(json!(3), true), mode).is_err());
    }
  }
}
