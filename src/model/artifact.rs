// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/artifact.rs - 模型制品容器
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

//! 模型制品：一个 safetensors 文件，同时保存层配置树与权重。
//!
//! - 层配置 JSON 存放在 `__metadata__` 的 `model_config` 键下；
//! - 每个权重张量命名为 `model_weights/<层路径>/<权重名>`，
//!   嵌套模型的层路径为 `<嵌套模型名>/<内部层名>`。
//!
//! 读取时兼容旧的命名习惯：去掉权重名末尾的 `:0`，
//! 并合并重复的首层分组（`conv2d/conv2d/kernel`）。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use thiserror::Error;
use tracing::{debug, info};

pub const MODEL_CONFIG_KEY: &str = "model_config";
pub const MODEL_WEIGHTS_GROUP: &str = "model_weights";

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("容器格式错误: {0}")]
  ContainerError(#[from] safetensors::SafeTensorError),
  #[error("不支持的张量类型 {dtype:?}: {name}")]
  UnsupportedDtype { name: String, dtype: Dtype },
  #[error("张量数据长度与形状不一致: {name}")]
  CorruptTensor { name: String },
  #[error("配置 JSON 错误: {0}")]
  ConfigJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl WeightTensor {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self { shape, data }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// 按层路径、权重名两级索引的权重表
pub type WeightGroups = BTreeMap<String, BTreeMap<String, WeightTensor>>;

#[derive(Debug, Clone, Default)]
pub struct ModelArtifact {
  /// 原始配置字符串，不做任何解析
  model_config: Option<String>,
  weights: WeightGroups,
  extra_metadata: BTreeMap<String, String>,
}

impl ModelArtifact {
  pub fn new(model_config: Option<String>) -> Self {
    Self {
      model_config,
      ..Default::default()
    }
  }

  pub fn open(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
    let path = path.as_ref();
    info!("读取模型制品: {}", path.display());
    let bytes = std::fs::read(path)?;
    debug!(
      "模型制品大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );
    Self::from_bytes(&bytes)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let mut extra_metadata: BTreeMap<String, String> = metadata
      .metadata()
      .as_ref()
      .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      .unwrap_or_default();
    let model_config = extra_metadata.remove(MODEL_CONFIG_KEY);

    let tensors = SafeTensors::deserialize(bytes)?;
    let mut weights = WeightGroups::new();
    for (name, view) in tensors.tensors() {
      let Some((layer, weight)) = split_weight_name(&name) else {
        debug!("忽略权重分组之外的张量: {}", name);
        continue;
      };
      let tensor = decode_tensor(&name, &view)?;
      weights.entry(layer).or_default().insert(weight, tensor);
    }

    debug!(
      "模型制品包含 {} 个权重分组, 配置: {}",
      weights.len(),
      if model_config.is_some() { "有" } else { "无" }
    );

    Ok(Self {
      model_config,
      weights,
      extra_metadata,
    })
  }

  pub fn model_config(&self) -> Option<&str> {
    self.model_config.as_deref()
  }

  pub fn set_model_config(&mut self, config: String) {
    self.model_config = Some(config);
  }

  pub fn config_json(&self) -> Result<Option<serde_json::Value>, ArtifactError> {
    self
      .model_config
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(ArtifactError::from)
  }

  pub fn weights(&self) -> &WeightGroups {
    &self.weights
  }

  pub fn layer_weights(&self, layer: &str) -> Option<&BTreeMap<String, WeightTensor>> {
    self.weights.get(layer)
  }

  pub fn insert_weight(&mut self, layer: &str, weight: &str, tensor: WeightTensor) {
    self
      .weights
      .entry(layer.to_string())
      .or_default()
      .insert(weight.to_string(), tensor);
  }

  pub fn metadata(&self, key: &str) -> Option<&str> {
    self.extra_metadata.get(key).map(String::as_str)
  }

  pub fn set_metadata(&mut self, key: &str, value: &str) {
    self.extra_metadata.insert(key.to_string(), value.to_string());
  }

  pub fn tensor_count(&self) -> usize {
    self.weights.values().map(BTreeMap::len).sum()
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
    let mut names = Vec::with_capacity(self.tensor_count());
    let mut buffers = Vec::with_capacity(self.tensor_count());
    for (layer, group) in &self.weights {
      for (weight, tensor) in group {
        names.push(format!("{}/{}/{}", MODEL_WEIGHTS_GROUP, layer, weight));
        let bytes = tensor
          .data
          .iter()
          .flat_map(|v| v.to_le_bytes())
          .collect::<Vec<u8>>();
        buffers.push((tensor.shape.clone(), bytes));
      }
    }

    let mut views = Vec::with_capacity(names.len());
    for (name, (shape, bytes)) in names.iter().zip(&buffers) {
      let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
      views.push((name.as_str(), view));
    }

    let mut metadata: HashMap<String, String> = self
      .extra_metadata
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    if let Some(config) = &self.model_config {
      metadata.insert(MODEL_CONFIG_KEY.to_string(), config.clone());
    }
    let metadata = (!metadata.is_empty()).then_some(metadata);

    Ok(safetensors::serialize(views, &metadata)?)
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, self.to_bytes()?)?;
    info!("模型制品已写入: {}", path.display());
    Ok(())
  }
}

/// `model_weights/a/b/kernel:0` -> (`a/b`, `kernel`)
fn split_weight_name(name: &str) -> Option<(String, String)> {
  let rest = name.strip_prefix(MODEL_WEIGHTS_GROUP)?.strip_prefix('/')?;
  let mut segments = rest.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
  let weight = segments.pop()?;
  let weight = weight.strip_suffix(":0").unwrap_or(weight);
  segments.dedup();
  if segments.is_empty() {
    return None;
  }
  Some((segments.join("/"), weight.to_string()))
}

fn decode_tensor(name: &str, view: &TensorView<'_>) -> Result<WeightTensor, ArtifactError> {
  let shape = view.shape().to_vec();
  let expected = shape.iter().product::<usize>();
  let data = view.data();
  let values = match view.dtype() {
    Dtype::F32 => data
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect::<Vec<_>>(),
    Dtype::F64 => data
      .chunks_exact(8)
      .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
      .collect::<Vec<_>>(),
    dtype => {
      return Err(ArtifactError::UnsupportedDtype {
        name: name.to_string(),
        dtype,
      });
    }
  };
  if values.len() != expected {
    return Err(ArtifactError::CorruptTensor {
      name: name.to_string(),
    });
  }
  Ok(WeightTensor::new(shape, values))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn legacy_weight_names_are_normalized() {
    assert_eq!(
      split_weight_name("model_weights/conv2d/conv2d/kernel:0"),
      Some(("conv2d".to_string(), "kernel".to_string()))
    );
    assert_eq!(
      split_weight_name("model_weights/mobilenetv2_1.00_224/Conv1/kernel:0"),
      Some(("mobilenetv2_1.00_224/Conv1".to_string(), "kernel".to_string()))
    );
    assert_eq!(
      split_weight_name("model_weights/dense_1/bias"),
      Some(("dense_1".to_string(), "bias".to_string()))
    );
    assert_eq!(split_weight_name("optimizer_weights/dense/bias"), None);
    assert_eq!(split_weight_name("model_weights/bias"), None);
  }

  #[test]
  fn container_keeps_config_and_weights() {
    let mut artifact = ModelArtifact::new(Some(r#"{"class_name":"Sequential"}"#.to_string()));
    artifact.set_metadata("keras_version", "2.15.0");
    artifact.insert_weight("dense", "kernel", WeightTensor::new(vec![2, 1], vec![0.5, -1.5]));
    artifact.insert_weight("dense", "bias", WeightTensor::new(vec![1], vec![0.25]));

    let bytes = artifact.to_bytes().unwrap();
    let loaded = ModelArtifact::from_bytes(&bytes).unwrap();

    assert_eq!(loaded.model_config(), Some(r#"{"class_name":"Sequential"}"#));
    assert_eq!(loaded.metadata("keras_version"), Some("2.15.0"));
    assert_eq!(loaded.tensor_count(), 2);
    let dense = loaded.layer_weights("dense").unwrap();
    assert_eq!(dense["kernel"].shape, vec![2, 1]);
    assert_eq!(dense["kernel"].data, vec![0.5, -1.5]);
    assert_eq!(dense["bias"].data, vec![0.25]);
  }

  #[test]
  fn weights_without_config_are_readable() {
    let mut artifact = ModelArtifact::new(None);
    artifact.insert_weight("conv2d", "bias", WeightTensor::new(vec![3], vec![0.0, 1.0, 2.0]));
    let loaded = ModelArtifact::from_bytes(&artifact.to_bytes().unwrap()).unwrap();
    assert!(loaded.model_config().is_none());
    assert!(loaded.config_json().unwrap().is_none());
    assert_eq!(loaded.layer_weights("conv2d").unwrap()["bias"].len(), 3);
  }

  #[test]
  fn garbage_is_a_container_error() {
    let err = ModelArtifact::from_bytes(b"not a container").unwrap_err();
    assert!(matches!(err, ArtifactError::ContainerError(_)));
  }
}
