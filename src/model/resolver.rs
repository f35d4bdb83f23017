// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/resolver.rs - 模型加载回退链与进程级缓存
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

//! 从模型制品得到可用的推理句柄。
//!
//! 依次尝试：直接加载、修补配置后加载、宽松解析加载、手工重建结构后按名称绑定。
//! 第一个成功的策略胜出；全部失败时返回 `None`，调用方改用演示预测。
//! 每个策略的产物都要先在全零输入上试跑一次。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactError, ModelArtifact};
use super::config::{self, ConfigError, ParseMode};
use super::graph::{BindMode, BindReport, Graph, GraphError};
use super::keras::{InferenceError, KerasModel};
use super::mobilenet_v2::{self, ClassifierConfig};
use crate::frame::XrayFrame;

/// 未绑定参数的初始化种子
const INIT_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
  Direct,
  ConfigPatch,
  Permissive,
  Reconstructed,
}

impl SourceTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceTag::Direct => "direct",
      SourceTag::ConfigPatch => "config_patch",
      SourceTag::Permissive => "permissive",
      SourceTag::Reconstructed => "reconstructed",
    }
  }
}

impl fmt::Display for SourceTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug)]
pub enum StrategyFailure {
  #[error("制品中没有层配置")]
  MissingConfig,
  #[error("制品不可读: {0}")]
  Artifact(#[from] ArtifactError),
  #[error("配置不兼容: {0}")]
  Config(#[from] ConfigError),
  #[error("计算图不兼容: {0}")]
  Graph(#[from] GraphError),
  #[error("试跑推理失败: {0}")]
  TrialRun(#[from] InferenceError),
  #[error("分类头权重未完整绑定: {0}")]
  HeadNotBound(String),
}

/// 一个加载策略：从制品得到计算图
pub trait LoadStrategy: Send + Sync {
  fn tag(&self) -> SourceTag;
  fn load(&self, artifact: &ModelArtifact) -> Result<Graph, StrategyFailure>;
}

fn config_value(artifact: &ModelArtifact) -> Result<serde_json::Value, StrategyFailure> {
  artifact.config_json()?.ok_or(StrategyFailure::MissingConfig)
}

fn build_and_bind(
  spec: &config::GraphSpec,
  artifact: &ModelArtifact,
  mode: BindMode,
) -> Result<(Graph, BindReport), StrategyFailure> {
  let mut graph = Graph::build(spec, INIT_SEED)?;
  let report = graph.bind(artifact.weights(), mode)?;
  Ok((graph, report))
}

/// 严格解析、严格绑定
pub struct DirectLoad;

impl LoadStrategy for DirectLoad {
  fn tag(&self) -> SourceTag {
    SourceTag::Direct
  }

  fn load(&self, artifact: &ModelArtifact) -> Result<Graph, StrategyFailure> {
    let spec = config::parse_model_config(&config_value(artifact)?, ParseMode::Strict)?;
    let (graph, _) = build_and_bind(&spec, artifact, BindMode::Strict)?;
    Ok(graph)
  }
}

/// 把输入层的 `batch_shape` 改写为 `shape` 后严格解析，按名称绑定
pub struct ConfigPatchLoad;

impl LoadStrategy for ConfigPatchLoad {
  fn tag(&self) -> SourceTag {
    SourceTag::ConfigPatch
  }

  fn load(&self, artifact: &ModelArtifact) -> Result<Graph, StrategyFailure> {
    let mut value = config_value(artifact)?;
    let patched = config::patch_batch_shape(&mut value);
    debug!("配置修补: 改写了 {} 个输入层", patched);
    let spec = config::parse_model_config(&value, ParseMode::Strict)?;
    let (graph, report) = build_and_bind(&spec, artifact, BindMode::ByName)?;
    if report.skipped_count() > 0 {
      warn!(
        "配置修补加载: {} 个权重已绑定, {} 个缺失, {} 个形状不符",
        report.bound.len(),
        report.missing.len(),
        report.mismatched.len()
      );
    }
    Ok(graph)
  }
}

/// 宽松解析（忽略未知参数），严格绑定
pub struct PermissiveLoad;

impl LoadStrategy for PermissiveLoad {
  fn tag(&self) -> SourceTag {
    SourceTag::Permissive
  }

  fn load(&self, artifact: &ModelArtifact) -> Result<Graph, StrategyFailure> {
    let spec = config::parse_model_config(&config_value(artifact)?, ParseMode::Permissive)?;
    let (graph, _) = build_and_bind(&spec, artifact, BindMode::Strict)?;
    Ok(graph)
  }
}

/// 忽略制品中的配置，重建训练时的网络并按名称绑定
#[derive(Default)]
pub struct ReconstructLoad {
  pub config: ClassifierConfig,
}

impl LoadStrategy for ReconstructLoad {
  fn tag(&self) -> SourceTag {
    SourceTag::Reconstructed
  }

  fn load(&self, artifact: &ModelArtifact) -> Result<Graph, StrategyFailure> {
    let spec = mobilenet_v2::classifier_spec(&self.config);
    let (graph, report) = build_and_bind(&spec, artifact, BindMode::ByName)?;
    if let Some(layer) = mobilenet_v2::HEAD_LAYERS
      .iter()
      .find(|layer| !report.layer_fully_bound(layer))
    {
      return Err(StrategyFailure::HeadNotBound(layer.to_string()));
    }
    info!(
      "结构重建 v{}: {} 个权重已绑定, {} 个缺失, {} 个形状不符",
      mobilenet_v2::VERSION,
      report.bound.len(),
      report.missing.len(),
      report.mismatched.len()
    );
    Ok(graph)
  }
}

pub fn default_strategies() -> Vec<Box<dyn LoadStrategy>> {
  vec![
    Box::new(DirectLoad),
    Box::new(ConfigPatchLoad),
    Box::new(PermissiveLoad),
    Box::new(ReconstructLoad::default()),
  ]
}

/// 执行单个策略并在全零输入上试跑，返回模型与试跑分数
pub fn attempt(
  strategy: &dyn LoadStrategy,
  artifact: &ModelArtifact,
) -> Result<(KerasModel<XrayFrame>, f32), StrategyFailure> {
  let model = KerasModel::new(strategy.load(artifact)?);
  let score = model.trial_run()?;
  Ok((model, score))
}

/// 依次尝试，返回第一个通过试跑推理的模型；全部失败时返回每个策略的失败原因
pub fn first_success(
  strategies: &[Box<dyn LoadStrategy>],
  artifact: &ModelArtifact,
) -> Result<(SourceTag, KerasModel<XrayFrame>), Vec<(SourceTag, StrategyFailure)>> {
  let mut failures = Vec::with_capacity(strategies.len());
  for strategy in strategies {
    let tag = strategy.tag();
    info!("尝试加载策略: {}", tag);
    match attempt(strategy.as_ref(), artifact) {
      Ok((model, _)) => {
        info!("加载策略 {} 成功", tag);
        return Ok((tag, model));
      }
      Err(failure) => {
        warn!("加载策略 {} 失败: {}", tag, failure);
        failures.push((tag, failure));
      }
    }
  }
  Err(failures)
}

#[derive(Debug)]
pub struct ResolvedModel {
  pub model: KerasModel<XrayFrame>,
  pub source: SourceTag,
  pub path: PathBuf,
}

/// 加载回退链与已解析模型的缓存。
///
/// 整个回退链在锁内执行，并发的首次调用不会重复加载，也不会看到半成品。
/// 只缓存成功的结果；回退链失败的路径会被记住，直到强制重载前不再重试。
pub struct ModelResolver {
  strategies: Vec<Box<dyn LoadStrategy>>,
  cache: Mutex<ResolverCache>,
}

#[derive(Default)]
struct ResolverCache {
  resolved: Option<Arc<ResolvedModel>>,
  failed: Option<PathBuf>,
}

impl Default for ModelResolver {
  fn default() -> Self {
    Self::new()
  }
}

impl ModelResolver {
  pub fn new() -> Self {
    Self::with_strategies(default_strategies())
  }

  pub fn with_strategies(strategies: Vec<Box<dyn LoadStrategy>>) -> Self {
    Self {
      strategies,
      cache: Mutex::new(ResolverCache::default()),
    }
  }

  /// 进程内共享的实例
  pub fn global() -> &'static ModelResolver {
    static RESOLVER: OnceLock<ModelResolver> = OnceLock::new();
    RESOLVER.get_or_init(ModelResolver::new)
  }

  fn lock(&self) -> MutexGuard<'_, ResolverCache> {
    // 回退链内部不会 panic，中毒时直接沿用内部状态
    self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn cached(&self) -> Option<Arc<ResolvedModel>> {
    self.lock().resolved.clone()
  }

  /// 同时忘记缓存的模型和失败的路径
  pub fn clear(&self) {
    let mut cache = self.lock();
    cache.resolved = None;
    cache.failed = None;
  }

  /// 解析模型制品。
  ///
  /// 同一路径成功一次后直接返回缓存；`force_reload` 跳过缓存并在成功时替换它。
  /// 路径不同视为未命中。制品不存在时不进入回退链。
  /// 制品不可读或回退链全部失败时记下该路径，之后的非强制调用直接返回 `None`。
  pub fn resolve(&self, path: impl AsRef<Path>, force_reload: bool) -> Option<Arc<ResolvedModel>> {
    let path = path.as_ref();
    let mut cache = self.lock();

    if !force_reload {
      if let Some(resolved) = cache.resolved.as_ref()
        && resolved.path == path
      {
        debug!("使用已缓存的模型: {} ({})", path.display(), resolved.source);
        return Some(resolved.clone());
      }
      if cache.failed.as_deref() == Some(path) {
        debug!("模型制品此前加载失败, 跳过回退链: {}", path.display());
        return None;
      }
    }

    if !path.is_file() {
      warn!("模型制品不存在: {}", path.display());
      return None;
    }

    let artifact = match ModelArtifact::open(path) {
      Ok(artifact) => artifact,
      Err(e) => {
        warn!("模型制品不可读, 所有加载策略均不可用: {}", e);
        cache.failed = Some(path.to_path_buf());
        return None;
      }
    };

    match first_success(&self.strategies, &artifact) {
      Ok((source, model)) => {
        info!("模型已就绪: {} (来源: {})", path.display(), source);
        let resolved = Arc::new(ResolvedModel {
          model,
          source,
          path: path.to_path_buf(),
        });
        cache.resolved = Some(resolved.clone());
        cache.failed = None;
        Some(resolved)
      }
      Err(failures) => {
        let reasons = failures
          .iter()
          .map(|(tag, failure)| format!("{}: {}", tag, failure))
          .collect::<Vec<_>>()
          .join("; ");
        warn!("所有加载策略均失败, 将使用演示模式: {}", reasons);
        cache.failed = Some(path.to_path_buf());
        None
      }
    }
  }
}
