// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/model.rs - 模型与诊断结果
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

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 判定阈值，严格大于时为肺炎
pub const DECISION_THRESHOLD: f64 = 0.5;
pub const HIGH_CONFIDENCE_PCT: f64 = 95.0;
pub const MODERATE_CONFIDENCE_PCT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
  Normal,
  Pneumonia,
}

impl fmt::Display for Label {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Label::Normal => write!(f, "NORMAL"),
      Label::Pneumonia => write!(f, "PNEUMONIA"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLevel {
  Low,
  Moderate,
  High,
}

impl ConfidenceLevel {
  pub fn from_percentage(confidence_pct: f64) -> Self {
    if confidence_pct >= HIGH_CONFIDENCE_PCT {
      ConfidenceLevel::High
    } else if confidence_pct >= MODERATE_CONFIDENCE_PCT {
      ConfidenceLevel::Moderate
    } else {
      ConfidenceLevel::Low
    }
  }
}

impl fmt::Display for ConfidenceLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConfidenceLevel::Low => write!(f, "LOW"),
      ConfidenceLevel::Moderate => write!(f, "MODERATE"),
      ConfidenceLevel::High => write!(f, "HIGH"),
    }
  }
}

/// 结果来源：真实模型或演示模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
  Model,
  Demo,
}

impl fmt::Display for OutcomeSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OutcomeSource::Model => write!(f, "model"),
      OutcomeSource::Demo => write!(f, "demo"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interpretation {
  pub label: Label,
  pub confidence: f64,
}

/// 将 sigmoid 输出解释为标签与置信度。`s == 0.5` 归为 NORMAL。
pub fn interpret(raw_score: f64) -> Interpretation {
  if raw_score > DECISION_THRESHOLD {
    Interpretation {
      label: Label::Pneumonia,
      confidence: raw_score,
    }
  } else {
    Interpretation {
      label: Label::Normal,
      confidence: 1.0 - raw_score,
    }
  }
}

/// 单次诊断的结果，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisOutcome {
  pub label: Label,
  pub raw_score: f64,
  pub confidence: f64,
  pub confidence_level: ConfidenceLevel,
  pub source: OutcomeSource,
  #[serde(serialize_with = "serialize_secs")]
  pub processing_time: Duration,
}

impl DiagnosisOutcome {
  pub fn from_score(raw_score: f64, source: OutcomeSource, processing_time: Duration) -> Self {
    let Interpretation { label, confidence } = interpret(raw_score);
    Self {
      label,
      raw_score,
      confidence,
      confidence_level: ConfidenceLevel::from_percentage(confidence * 100.0),
      source,
      processing_time,
    }
  }

  pub fn confidence_percentage(&self) -> f64 {
    self.confidence * 100.0
  }

  pub fn is_demo(&self) -> bool {
    self.source == OutcomeSource::Demo
  }
}

pub(crate) fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
  s.serialize_f64(d.as_secs_f64())
}

pub mod artifact;
pub mod config;
pub mod demo;
pub mod graph;
mod keras;
pub mod mobilenet_v2;
mod ops;
pub mod resolver;

pub use self::artifact::{ArtifactError, ModelArtifact, WeightTensor};
pub use self::demo::{DemoError, DemoPredictor};
pub use self::keras::{InferenceError, KerasModel};
pub use self::resolver::{ModelResolver, ResolvedModel, SourceTag};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn threshold_is_strict() {
    assert_eq!(interpret(0.5).label, Label::Normal);
    assert_eq!(interpret(0.5).confidence, 0.5);
    assert_eq!(interpret(0.500_001).label, Label::Pneumonia);

    let p = interpret(0.93);
    assert_eq!(p.label, Label::Pneumonia);
    assert_eq!(p.confidence, 0.93);

    let n = interpret(0.12);
    assert_eq!(n.label, Label::Normal);
    assert!((n.confidence - 0.88).abs() < 1e-12);
  }

  #[test]
  fn confidence_buckets_are_boundary_exact() {
    assert_eq!(ConfidenceLevel::from_percentage(95.0), ConfidenceLevel::High);
    assert_eq!(ConfidenceLevel::from_percentage(94.999), ConfidenceLevel::Moderate);
    assert_eq!(ConfidenceLevel::from_percentage(80.0), ConfidenceLevel::Moderate);
    assert_eq!(ConfidenceLevel::from_percentage(79.999), ConfidenceLevel::Low);
    assert_eq!(ConfidenceLevel::from_percentage(100.0), ConfidenceLevel::High);
    assert_eq!(ConfidenceLevel::from_percentage(50.0), ConfidenceLevel::Low);
  }

  #[test]
  fn buckets_are_monotonic() {
    let mut last = ConfidenceLevel::Low;
    for i in 0..=1000 {
      let level = ConfidenceLevel::from_percentage(i as f64 / 10.0);
      assert!(level >= last);
      last = level;
    }
  }

  #[test]
  fn outcome_serializes_with_upper_case_labels() {
    let outcome = DiagnosisOutcome::from_score(0.97, OutcomeSource::Model, Duration::from_millis(250));
    assert_eq!(outcome.confidence_level, ConfidenceLevel::High);

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["label"], "PNEUMONIA");
    assert_eq!(json["confidence_level"], "HIGH");
    assert_eq!(json["source"], "model");
    assert_eq!(json["processing_time"], 0.25);
  }
}
