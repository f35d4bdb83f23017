// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// tests/diagnosis.rs - 端到端诊断
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

mod common;

use feiyan::{
  FromUrl,
  input::InputWrapper,
  model::{ConfidenceLevel, Label, ModelResolver, OutcomeSource, SourceTag},
  output::OutputWrapper,
  pipeline::ValidationIssue,
  service::{DiagnosisConfig, DiagnosisError, DiagnosisService},
  task::BatchTask,
};
use url::Url;

#[test]
fn uniform_gray_without_a_model_uses_the_demo() {
  let dir = tempfile::tempdir().unwrap();
  let image = common::gray_png(dir.path(), "gray.png", 224, 128);

  let resolver = ModelResolver::new();
  let config = DiagnosisConfig::new(dir.path().join("no-model.safetensors"));
  let service = DiagnosisService::with_resolver(config, &resolver);

  let first = service.diagnose(&image).unwrap();
  assert_eq!(first.outcome.source, OutcomeSource::Demo);
  assert!(first.model_source.is_none());
  assert!((0.2..=0.95).contains(&first.outcome.raw_score));
  assert!((0.5..=0.95).contains(&first.outcome.confidence));

  let second = service.diagnose(&image).unwrap();
  assert_eq!(first.outcome.raw_score, second.outcome.raw_score);
  assert_eq!(first.outcome.label, second.outcome.label);
  assert_eq!(first.outcome.confidence_level, second.outcome.confidence_level);
}

#[test]
fn a_loadable_model_is_used() {
  let dir = tempfile::tempdir().unwrap();
  let image = common::gray_png(dir.path(), "gray.png", 224, 128);
  let model = common::save_artifact(dir.path(), "model.safetensors", Some(&common::batch_shape_config()));

  let resolver = ModelResolver::new();
  let service = DiagnosisService::with_resolver(DiagnosisConfig::new(&model), &resolver);
  let report = service.diagnose(&image).unwrap();

  // 1x1 卷积后三个通道之和为 x，全局池化后经 dense_1 得到 sigmoid(0.2x + 0.1)
  let x = 128.0 / 255.0;
  let expected = 1.0 / (1.0 + (-(0.2 * x + 0.1f64)).exp());
  assert!((report.outcome.raw_score - expected).abs() < 1e-4);
  assert_eq!(report.outcome.label, Label::Pneumonia);
  assert_eq!(report.outcome.confidence_level, ConfidenceLevel::Low);
  assert_eq!(report.outcome.source, OutcomeSource::Model);
  assert_eq!(report.model_source, Some(SourceTag::ConfigPatch));
}

#[test]
fn wrong_input_size_falls_back_to_the_demo() {
  let dir = tempfile::tempdir().unwrap();
  let image = common::gray_png(dir.path(), "gray.png", 224, 90);
  let mut config = common::modern_config();
  config["config"]["layers"][0]["config"]["shape"] = serde_json::json!([64, 64, 1]);
  let model = common::save_artifact(dir.path(), "small.safetensors", Some(&config));

  let resolver = ModelResolver::new();
  let service = DiagnosisService::with_resolver(DiagnosisConfig::new(&model), &resolver);
  let report = service.diagnose(&image).unwrap();
  assert!(report.is_demo());
  assert_eq!(resolver.cached().unwrap().source, SourceTag::Direct);
}

#[test]
fn oversized_and_unsupported_files_fail_validation() {
  let dir = tempfile::tempdir().unwrap();
  let image = common::gray_png(dir.path(), "big.png", 224, 200);

  let resolver = ModelResolver::new();
  let url = Url::parse(&format!("keras://{}/none.safetensors?max_size_mb=0.00001", dir.path().display())).unwrap();
  let service = DiagnosisService::with_resolver(DiagnosisConfig::from_url(&url).unwrap(), &resolver);
  match service.diagnose(&image) {
    Err(DiagnosisError::Validation(issues)) => {
      assert!(matches!(issues.as_slice(), [ValidationIssue::TooLarge { .. }]));
    }
    other => panic!("unexpected result: {other:?}"),
  }

  let gif = dir.path().join("scan.gif");
  std::fs::write(&gif, b"GIF89a\x01\x00\x01\x00\x00\x00\x00;").unwrap();
  let service = DiagnosisService::with_resolver(DiagnosisConfig::new("/none"), &resolver);
  let error = service.diagnose(&gif).unwrap_err();
  assert!(error.to_string().contains("Unsupported format"));
}

#[test]
fn batch_over_a_folder_skips_broken_images() {
  let dir = tempfile::tempdir().unwrap();
  let scans = dir.path().join("scans");
  std::fs::create_dir(&scans).unwrap();
  common::gray_png(&scans, "a.png", 64, 30);
  common::gray_png(&scans, "c.png", 64, 220);
  std::fs::write(scans.join("b.png"), b"broken").unwrap();
  std::fs::write(scans.join("readme.txt"), b"skip me").unwrap();

  let input = InputWrapper::from_url(&Url::parse(&format!("folder://{}", scans.display())).unwrap()).unwrap();
  assert_eq!(input.len(), 3);

  let report_path = dir.path().join("reports.json");
  let output = OutputWrapper::from_url(&Url::parse(&format!("json://{}", report_path.display())).unwrap()).unwrap();

  let resolver = ModelResolver::new();
  let service = DiagnosisService::with_resolver(DiagnosisConfig::new(dir.path().join("none")), &resolver);
  let summary = BatchTask::default()
    .with_interrupt(false)
    .run_batch(input, service, output)
    .unwrap();
  assert_eq!(summary.succeeded, 2);
  assert_eq!(summary.failed, 1);

  let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
  let saved = saved.as_array().unwrap();
  assert_eq!(saved.len(), 2);
  assert!(saved[0]["image"].as_str().unwrap().ends_with("a.png"));
  assert!(saved[1]["image"].as_str().unwrap().ends_with("c.png"));
}
