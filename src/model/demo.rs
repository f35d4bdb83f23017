// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model/demo.rs - 无模型时的演示预测
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

//! 演示预测不是 AI 结果：分数由图像亮度统计量加上以路径为种子的抖动得到，
//! 结果一律标记为 `demo`。同一路径总是得到同一结果。

use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHasher;
use thiserror::Error;
use tracing::{info, warn};

use super::{DiagnosisOutcome, OutcomeSource};
use crate::pipeline::{self, PreprocessError};

pub const DEMO_MIN_SCORE: f64 = 0.2;
pub const DEMO_MAX_SCORE: f64 = 0.95;
const DEMO_JITTER: f64 = 0.15;

#[derive(Error, Debug)]
pub enum DemoError {
  #[error("演示模式无法读取图像: {0}")]
  Unreadable(#[from] PreprocessError),
}

/// 归一化到 [0, 1] 的亮度均值与标准差
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityStats {
  pub mean: f64,
  pub std: f64,
}

impl IntensityStats {
  pub fn of(pixels: &[u8]) -> Self {
    if pixels.is_empty() {
      return Self { mean: 0.0, std: 0.0 };
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64 / 255.0).sum::<f64>() / n;
    let variance = pixels
      .iter()
      .map(|&p| (p as f64 / 255.0 - mean).powi(2))
      .sum::<f64>()
      / n;
    Self {
      mean,
      std: variance.sqrt(),
    }
  }
}

/// 稳定的字符串种子，跨进程不变
pub fn seed_for(key: &str) -> u64 {
  let mut hasher = FxHasher::default();
  key.hash(&mut hasher);
  hasher.finish()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DemoPredictor;

impl DemoPredictor {
  /// 由统计量和种子得到原始分数
  pub fn score(&self, stats: IntensityStats, seed: u64) -> f64 {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = 0.35 + 0.3 * stats.mean + 0.2 * stats.std;
    let jitter = rng.gen_range(-DEMO_JITTER..=DEMO_JITTER);
    (base + jitter).clamp(DEMO_MIN_SCORE, DEMO_MAX_SCORE)
  }

  pub fn predict(&self, path: impl AsRef<Path>) -> Result<DiagnosisOutcome, DemoError> {
    let path = path.as_ref();
    self.predict_keyed(path, &path.to_string_lossy())
  }

  /// 以 `key` 代替路径作为种子，用于临时文件路径每次都不同的上传图像
  pub fn predict_keyed(&self, path: impl AsRef<Path>, key: &str) -> Result<DiagnosisOutcome, DemoError> {
    let path = path.as_ref();
    let start = Instant::now();
    let gray = pipeline::load_gray(path)?;
    let stats = IntensityStats::of(gray.as_raw());
    let raw_score = self.score(stats, seed_for(key));
    let outcome = DiagnosisOutcome::from_score(raw_score, OutcomeSource::Demo, start.elapsed());

    warn!("演示模式预测, 结果并非 AI 诊断: {}", path.display());
    info!(
      "演示结果: {} (分数 {:.4}, 均值 {:.4}, 标准差 {:.4})",
      outcome.label, raw_score, stats.mean, stats.std
    );
    Ok(outcome)
  }
}
