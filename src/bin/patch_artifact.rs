// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/bin/patch_artifact.rs - 改写模型制品中的输入层配置
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

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use url::Url;

use feiyan::{
  FromUrl,
  model::{ModelArtifact, config::patch_batch_shape},
  service::DiagnosisConfig,
};
use tracing::{info, warn};

/// Feiyan 模型制品改写参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 原模型制品, 如 keras:///models/legacy.safetensors
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 改写后的制品写到这里, 原文件不变
  #[arg(long, value_name = "OUTPUT")]
  pub output: PathBuf,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = DiagnosisConfig::from_url(&args.model)?;
  if config.model_path == args.output {
    return Err(anyhow!("输出路径不能与原制品相同"));
  }

  let mut artifact = ModelArtifact::open(&config.model_path)?;
  let mut value = artifact
    .config_json()?
    .ok_or_else(|| anyhow!("制品中没有层配置: {}", config.model_path.display()))?;

  let patched = patch_batch_shape(&mut value);
  if patched == 0 {
    warn!("没有需要改写的输入层, 仍然写出副本");
  } else {
    info!("改写了 {} 个输入层", patched);
  }

  artifact.set_model_config(serde_json::to_string(&value)?);
  artifact.save(&args.output)?;

  Ok(())
}
