// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/bin/inspect_artifact.rs - 查看模型制品
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use feiyan::{
  FromUrl,
  model::{
    ModelArtifact,
    resolver::{attempt, default_strategies},
  },
  service::DiagnosisConfig,
};
use tracing::{info, warn};

/// Feiyan 模型制品查看参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型制品, 如 keras:///models/pneumonia.safetensors
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 逐个尝试所有加载策略, 而不是在第一个成功处停止
  #[arg(long)]
  pub all_strategies: bool,
  /// 打印每一层的摘要
  #[arg(long)]
  pub layers: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = DiagnosisConfig::from_url(&args.model)?;
  let artifact = ModelArtifact::open(&config.model_path)?;

  info!("模型制品: {}", config.model_path.display());
  info!(
    "权重分组: {}, 张量: {}, 层配置: {}",
    artifact.weights().len(),
    artifact.tensor_count(),
    if artifact.model_config().is_some() { "有" } else { "无" }
  );
  for (layer, group) in artifact.weights() {
    let names = group
      .iter()
      .map(|(name, tensor)| format!("{}{:?}", name, tensor.shape))
      .collect::<Vec<_>>()
      .join(", ");
    info!("  {}: {}", layer, names);
  }

  let mut loaded = None;
  for strategy in default_strategies() {
    let tag = strategy.tag();
    match attempt(strategy.as_ref(), &artifact) {
      Ok((model, score)) => {
        info!("策略 {}: 成功, 零输入试跑分数 {:.4}", tag, score);
        if loaded.is_none() {
          loaded = Some((tag, model));
        }
        if !args.all_strategies {
          break;
        }
      }
      Err(e) => warn!("策略 {}: 失败, {}", tag, e),
    }
  }

  let Some((tag, model)) = loaded else {
    warn!("没有可用的加载策略, 服务将使用演示模式");
    return Ok(());
  };

  let graph = model.graph();
  info!(
    "采用策略 {}: 模型 {}, 输入 {:?}, 输出 {:?}, 参数 {}",
    tag,
    graph.name(),
    graph.input_shape().unwrap_or_default(),
    graph.output_shape().unwrap_or_default(),
    graph.parameter_count()
  );
  if args.layers {
    for layer in graph.summary() {
      info!(
        "  {:<48} {:<24} {:<16} {}",
        layer.path,
        layer.kind,
        format!("{:?}", layer.output_shape),
        layer.parameters
      );
    }
  }

  Ok(())
}
