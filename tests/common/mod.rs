// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的制品与图像
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use feiyan::model::{ModelArtifact, WeightTensor};
use image::{GrayImage, Luma};
use serde_json::{Value, json};

/// (224, 224, 1) -> 1x1 卷积 -> 全局池化 -> sigmoid
pub fn modern_config() -> Value {
  json!({
    "class_name": "Functional",
    "config": {
      "name": "functional",
      "layers": [
        {"class_name": "InputLayer", "name": "input_layer_1",
         "config": {"shape": [224, 224, 1], "dtype": "float32", "name": "input_layer_1"},
         "inbound_nodes": []},
        {"class_name": "Conv2D", "name": "conv2d",
         "config": {"name": "conv2d", "filters": 3, "kernel_size": [1, 1], "use_bias": true},
         "inbound_nodes": [[["input_layer_1", 0, 0, {}]]]},
        {"class_name": "GlobalAveragePooling2D", "name": "global_average_pooling2d",
         "config": {"name": "global_average_pooling2d"},
         "inbound_nodes": [[["conv2d", 0, 0, {}]]]},
        {"class_name": "Dense", "name": "dense_1",
         "config": {"name": "dense_1", "units": 1, "activation": "sigmoid"},
         "inbound_nodes": [[["global_average_pooling2d", 0, 0, {}]]]}
      ],
      "input_layers": [["input_layer_1", 0, 0]],
      "output_layers": [["dense_1", 0, 0]]
    }
  })
}

/// 旧格式：输入层使用 `batch_shape`
pub fn batch_shape_config() -> Value {
  let mut config = modern_config();
  config["config"]["layers"][0]["config"] = json!({
    "batch_shape": [null, 224, 224, 1], "dtype": "float32", "sparse": false, "name": "input_layer_1"
  });
  config
}

/// 输入层带有严格解析不认识的关键字
pub fn unknown_keyword_config() -> Value {
  let mut config = modern_config();
  config["config"]["layers"][0]["config"]["optional"] = json!(false);
  config
}

pub fn artifact_with(config: Option<&Value>) -> ModelArtifact {
  let mut artifact = ModelArtifact::new(config.map(Value::to_string));
  artifact.insert_weight("conv2d", "kernel", WeightTensor::new(vec![1, 1, 1, 3], vec![1.0, 0.5, -0.5]));
  artifact.insert_weight("conv2d", "bias", WeightTensor::new(vec![3], vec![0.0; 3]));
  artifact.insert_weight("dense_1", "kernel", WeightTensor::new(vec![3, 1], vec![0.2, 0.2, 0.2]));
  artifact.insert_weight("dense_1", "bias", WeightTensor::new(vec![1], vec![0.1]));
  artifact
}

pub fn save_artifact(dir: &Path, name: &str, config: Option<&Value>) -> PathBuf {
  let path = dir.join(name);
  artifact_with(config).save(&path).unwrap();
  path
}

pub fn gray_png(dir: &Path, name: &str, size: u32, value: u8) -> PathBuf {
  let path = dir.join(name);
  GrayImage::from_pixel(size, size, Luma([value])).save(&path).unwrap();
  path
}
