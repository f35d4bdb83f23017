// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/mobilenet_v2.rs - 分类网络结构重建（MobileNetV2 骨干，v1）
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

//! 手工重建训练时使用的分类网络，用于层配置完全无法解析的旧制品。
//!
//! ```text
//! input_layer_1 (224, 224, 1)
//!   -> conv2d          1x1, 1 -> 3, 带偏置
//!   -> mobilenetv2_1.00_224   (alpha = 1.0, 无分类头)
//!   -> global_average_pooling2d
//!   -> dense           256, relu
//!   -> dropout         0.5
//!   -> dense_1         1, sigmoid
//! ```
//!
//! 层名与 Keras 的命名保持一致，这样才能按名称绑定旧制品中的权重。
//! 该结构对应模型的第一版训练脚本，结构变化时应新增版本而不是修改这里。

use super::config::{Activation, GraphSpec, LayerSpec, Padding, ReluSpec};
use super::ops::out_extent;

pub const VERSION: u32 = 1;

pub const BACKBONE_NAME: &str = "mobilenetv2_1.00_224";
/// 重建结果可用的前提：这些层的权重必须完整绑定
pub const HEAD_LAYERS: [&str; 2] = ["dense", "dense_1"];

const BN_EPSILON: f32 = 1e-3;
const FIRST_BLOCK_FILTERS: usize = 32;
const LAST_BLOCK_FILTERS: usize = 1280;
const EXPANSION: usize = 6;

/// (输出通道, 步长, 扩张倍数)
const BLOCKS: [(usize, usize, usize); 17] = [
  (16, 1, 1),
  (24, 2, EXPANSION),
  (24, 1, EXPANSION),
  (32, 2, EXPANSION),
  (32, 1, EXPANSION),
  (32, 1, EXPANSION),
  (64, 2, EXPANSION),
  (64, 1, EXPANSION),
  (64, 1, EXPANSION),
  (64, 1, EXPANSION),
  (96, 1, EXPANSION),
  (96, 1, EXPANSION),
  (96, 1, EXPANSION),
  (160, 2, EXPANSION),
  (160, 1, EXPANSION),
  (160, 1, EXPANSION),
  (320, 1, EXPANSION),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
  /// 输入边长，训练时为 224
  pub input_size: usize,
  pub dense_units: usize,
  pub dropout: f32,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    Self {
      input_size: 224,
      dense_units: 256,
      dropout: 0.5,
    }
  }
}

fn conv(filters: usize, kernel: usize, strides: usize, padding: Padding, use_bias: bool) -> LayerSpec {
  LayerSpec::Conv2D {
    filters,
    kernel: (kernel, kernel),
    strides: (strides, strides),
    padding,
    use_bias,
    activation: Activation::Linear,
  }
}

fn batch_norm() -> LayerSpec {
  LayerSpec::BatchNormalization {
    epsilon: BN_EPSILON,
    center: true,
    scale: true,
  }
}

/// 与 Keras 的 `correct_pad` 一致：偶数边长只在下方和右侧补一格
fn correct_pad(size: usize) -> (usize, usize) {
  let adjust = 1 - size % 2;
  (1 - adjust, 1)
}

struct BackboneBuilder {
  spec: GraphSpec,
  last: String,
  channels: usize,
  size: usize,
}

impl BackboneBuilder {
  fn push(&mut self, name: &str, layer: LayerSpec) {
    let last = std::mem::take(&mut self.last);
    self.last = self.spec.push(name, layer, &[last.as_str()]);
  }

  fn inverted_residual(&mut self, block_id: usize, filters: usize, stride: usize, expansion: usize) {
    let block_input = self.last.clone();
    let in_channels = self.channels;
    let prefix = if block_id == 0 {
      "expanded_conv_".to_string()
    } else {
      format!("block_{}_", block_id)
    };

    if block_id > 0 {
      self.push(
        &format!("{}expand", prefix),
        conv(expansion * in_channels, 1, 1, Padding::Same, false),
      );
      self.push(&format!("{}expand_BN", prefix), batch_norm());
      self.push(&format!("{}expand_relu", prefix), LayerSpec::ReLU(ReluSpec::relu6()));
    }

    let padding = if stride == 2 {
      let (before, after) = correct_pad(self.size);
      self.push(
        &format!("{}pad", prefix),
        LayerSpec::ZeroPadding2D {
          top: before,
          bottom: after,
          left: before,
          right: after,
        },
      );
      self.size += before + after;
      Padding::Valid
    } else {
      Padding::Same
    };

    self.push(
      &format!("{}depthwise", prefix),
      LayerSpec::DepthwiseConv2D {
        kernel: (3, 3),
        strides: (stride, stride),
        padding,
        use_bias: false,
        activation: Activation::Linear,
      },
    );
    self.size = out_extent(self.size, 3, stride, padding).0;
    self.push(&format!("{}depthwise_BN", prefix), batch_norm());
    self.push(
      &format!("{}depthwise_relu", prefix),
      LayerSpec::ReLU(ReluSpec::relu6()),
    );

    self.push(
      &format!("{}project", prefix),
      conv(filters, 1, 1, Padding::Same, false),
    );
    self.push(&format!("{}project_BN", prefix), batch_norm());

    if in_channels == filters && stride == 1 {
      let projected = std::mem::take(&mut self.last);
      self.last = self.spec.push(
        &format!("{}add", prefix),
        LayerSpec::Add,
        &[block_input.as_str(), projected.as_str()],
      );
    }
    self.channels = filters;
  }
}

/// MobileNetV2 骨干（alpha = 1.0，无分类头），输入为 (size, size, 3)
pub fn backbone_spec(input_size: usize) -> GraphSpec {
  let mut builder = BackboneBuilder {
    spec: GraphSpec::new(BACKBONE_NAME),
    last: String::new(),
    channels: 3,
    size: input_size,
  };
  builder.last = builder.spec.push(
    "input_1",
    LayerSpec::Input {
      shape: vec![input_size, input_size, 3],
    },
    &[],
  );

  builder.push("Conv1", conv(FIRST_BLOCK_FILTERS, 3, 2, Padding::Same, false));
  builder.size = out_extent(builder.size, 3, 2, Padding::Same).0;
  builder.channels = FIRST_BLOCK_FILTERS;
  builder.push("bn_Conv1", batch_norm());
  builder.push("Conv1_relu", LayerSpec::ReLU(ReluSpec::relu6()));

  for (block_id, (filters, stride, expansion)) in BLOCKS.into_iter().enumerate() {
    builder.inverted_residual(block_id, filters, stride, expansion);
  }

  builder.push("Conv_1", conv(LAST_BLOCK_FILTERS, 1, 1, Padding::Same, false));
  builder.push("Conv_1_bn", batch_norm());
  builder.push("out_relu", LayerSpec::ReLU(ReluSpec::relu6()));

  let last = builder.last.clone();
  builder.spec.set_output(&last);
  builder.spec
}

/// 完整的分类网络
pub fn classifier_spec(config: &ClassifierConfig) -> GraphSpec {
  let size = config.input_size;
  let mut spec = GraphSpec::new("functional");
  spec.push(
    "input_layer_1",
    LayerSpec::Input {
      shape: vec![size, size, 1],
    },
    &[],
  );
  // 单通道扩展为骨干需要的三通道
  spec.push("conv2d", conv(3, 1, 1, Padding::Valid, true), &["input_layer_1"]);
  spec.push(
    BACKBONE_NAME,
    LayerSpec::Model(backbone_spec(size)),
    &["conv2d"],
  );
  spec.push(
    "global_average_pooling2d",
    LayerSpec::GlobalAveragePooling2D,
    &[BACKBONE_NAME],
  );
  spec.push(
    "dense",
    LayerSpec::Dense {
      units: config.dense_units,
      use_bias: true,
      activation: Activation::Relu,
    },
    &["global_average_pooling2d"],
  );
  spec.push(
    "dropout",
    LayerSpec::Dropout {
      rate: config.dropout,
    },
    &["dense"],
  );
  spec.push(
    "dense_1",
    LayerSpec::Dense {
      units: 1,
      use_bias: true,
      activation: Activation::Sigmoid,
    },
    &["dropout"],
  );
  spec.set_output("dense_1");
  spec
}
