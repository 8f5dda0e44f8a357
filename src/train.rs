// 该文件是 Pareidolia 项目的一部分。
// src/train.rs - 分类器训练
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

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, ops};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  config::{ImageSpec, TrainConfig},
  dataset::{Dataset, Example},
  model::{Classifier, ModelError, build_classifier, default_device},
  quantize::{QuantizationOutcome, Quantizer},
};

#[derive(Error, Debug)]
pub enum TrainError {
  #[error("没有可用的训练图像")]
  EmptyDataset,
  #[error("训练轮数必须大于 0")]
  InvalidEpochs,
  #[error("批大小必须大于 0")]
  InvalidBatchSize,
  #[error("数据集图像规格 {actual:?} 与模型输入 {expected:?} 不一致")]
  ImageSpecMismatch {
    expected: ImageSpec,
    actual: ImageSpec,
  },
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Candle(#[from] candle_core::Error),
  #[error("无法保存模型到 {path}")]
  Save {
    path: PathBuf,
    source: candle_core::Error,
  },
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// 单轮训练的指标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
  pub epoch: usize,
  pub loss: f32,
  pub accuracy: f32,
  /// 验证集为空时为 NaN
  pub val_loss: f32,
  pub val_accuracy: f32,
}

/// 最后一轮的四项指标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingMetrics {
  pub loss: f32,
  pub accuracy: f32,
  pub val_loss: f32,
  pub val_accuracy: f32,
}

impl From<EpochMetrics> for TrainingMetrics {
  fn from(epoch: EpochMetrics) -> Self {
    TrainingMetrics {
      loss: epoch.loss,
      accuracy: epoch.accuracy,
      val_loss: epoch.val_loss,
      val_accuracy: epoch.val_accuracy,
    }
  }
}

impl TrainingMetrics {
  /// 供调用方逐行解析的 `KEY:value` 输出
  pub fn to_report_lines(&self) -> [String; 4] {
    [
      format!("FINAL_LOSS:{}", self.loss),
      format!("FINAL_ACCURACY:{}", self.accuracy),
      format!("FINAL_VAL_LOSS:{}", self.val_loss),
      format!("FINAL_VAL_ACCURACY:{}", self.val_accuracy),
    ]
  }
}

#[derive(Debug)]
pub struct TrainingReport {
  pub metrics: TrainingMetrics,
  pub history: Vec<EpochMetrics>,
  pub train_examples: usize,
  pub validation_examples: usize,
  pub model_path: PathBuf,
  pub quantization: QuantizationOutcome,
}

#[derive(Default)]
struct Accumulator {
  loss: f64,
  correct: f64,
  seen: usize,
}

impl Accumulator {
  fn add(&mut self, loss: f32, correct: f32, batch: usize) {
    self.loss += loss as f64 * batch as f64;
    self.correct += correct as f64;
    self.seen += batch;
  }

  fn finish(&self) -> (f32, f32) {
    if self.seen == 0 {
      return (f32::NAN, f32::NAN);
    }
    (
      (self.loss / self.seen as f64) as f32,
      (self.correct / self.seen as f64) as f32,
    )
  }
}

/// one-hot 标签上的分类交叉熵
pub fn categorical_cross_entropy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
  let log_probs = ops::log_softmax(logits, D::Minus1)?;
  targets.mul(&log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// 预测类别与 one-hot 标签一致的样本数
pub fn count_correct(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f32> {
  logits
    .argmax(D::Minus1)?
    .eq(&targets.argmax(D::Minus1)?)?
    .to_dtype(DType::F32)?
    .sum_all()?
    .to_scalar::<f32>()
}

/// 按下标组装一个批次，返回 `(输入, one-hot 标签)`
pub fn batch_tensors(
  examples: &[&Example],
  indices: &[usize],
  image: ImageSpec,
  num_classes: usize,
  device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
  let mut pixels = Vec::with_capacity(indices.len() * image.pixel_len());
  let mut labels = Vec::with_capacity(indices.len() * num_classes);
  for &i in indices {
    pixels.extend_from_slice(&examples[i].pixels);
    labels.extend(examples[i].label.one_hot(num_classes));
  }

  let xs = Tensor::from_vec(
    pixels,
    (
      indices.len(),
      image.height as usize,
      image.width as usize,
      image.channels(),
    ),
    device,
  )?;
  let ys = Tensor::from_vec(labels, (indices.len(), num_classes), device)?;
  Ok((xs, ys))
}

pub struct Trainer {
  config: TrainConfig,
  device: Device,
}

impl Trainer {
  pub fn new(config: TrainConfig) -> Self {
    Trainer {
      config,
      device: default_device(),
    }
  }

  pub fn with_device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn train(&self, dataset: &Dataset, model_path: &Path) -> Result<TrainingReport, TrainError> {
    self.train_with_progress(dataset, model_path, |_| {})
  }

  /// 训练、保存模型并尝试量化
  ///
  /// 每轮结束后调用 `progress`。数据集为空时不创建模型直接返回
  /// [`TrainError::EmptyDataset`]。量化失败不影响训练结果，记录在
  /// [`TrainingReport::quantization`] 中。
  pub fn train_with_progress<F>(
    &self,
    dataset: &Dataset,
    model_path: &Path,
    mut progress: F,
  ) -> Result<TrainingReport, TrainError>
  where
    F: FnMut(&EpochMetrics),
  {
    if dataset.is_empty() {
      return Err(TrainError::EmptyDataset);
    }
    if self.config.epochs == 0 {
      return Err(TrainError::InvalidEpochs);
    }
    if self.config.batch_size == 0 {
      return Err(TrainError::InvalidBatchSize);
    }
    if dataset.image() != self.config.image() {
      return Err(TrainError::ImageSpecMismatch {
        expected: self.config.image(),
        actual: dataset.image(),
      });
    }

    let (train_set, val_set) = dataset.split_validation(self.config.validation_split, self.config.seed);
    info!(
      "训练集 {} 个样本，验证集 {} 个样本",
      train_set.len(),
      val_set.len()
    );
    if val_set.is_empty() {
      warn!("样本过少，验证集为空，验证指标将为 NaN");
    }

    let (varmap, model) = build_classifier(self.config.model, &self.device)?;
    let params = ParamsAdamW {
      lr: self.config.learning_rate,
      weight_decay: 0.0,
      ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;
    let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));

    let mut history = Vec::with_capacity(self.config.epochs);
    for epoch in 1..=self.config.epochs {
      let now = Instant::now();
      let mut order: Vec<usize> = (0..train_set.len()).collect();
      order.shuffle(&mut rng);

      let mut stats = Accumulator::default();
      for chunk in order.chunks(self.config.batch_size) {
        let (xs, ys) = batch_tensors(
          &train_set,
          chunk,
          self.config.image(),
          self.config.model.num_classes,
          &self.device,
        )?;
        let logits = model.forward_t(&xs, true)?;
        let loss = categorical_cross_entropy(&logits, &ys)?;
        optimizer.backward_step(&loss)?;

        stats.add(
          loss.to_scalar::<f32>()?,
          count_correct(&logits, &ys)?,
          chunk.len(),
        );
      }

      let (loss, accuracy) = stats.finish();
      let (val_loss, val_accuracy) = self.evaluate(&model, &val_set)?;
      let metrics = EpochMetrics {
        epoch,
        loss,
        accuracy,
        val_loss,
        val_accuracy,
      };
      info!(
        "Epoch {}/{} - {:.2?} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
        epoch,
        self.config.epochs,
        now.elapsed(),
        loss,
        accuracy,
        val_loss,
        val_accuracy
      );
      progress(&metrics);
      history.push(metrics);
    }

    if let Some(parent) = model_path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    varmap.save(model_path).map_err(|source| TrainError::Save {
      path: model_path.to_path_buf(),
      source,
    })?;
    info!("模型已保存: {}", model_path.display());

    let quantization = if self.config.quantize {
      let quantizer = Quantizer::new(self.config.model, self.config.calibration_limit)
        .with_device(self.device.clone());
      match quantizer.quantize(model_path, &train_set) {
        Ok(artifacts) => QuantizationOutcome::Converted(artifacts),
        Err(e) => {
          warn!("量化失败，仅保留全精度模型: {}", e);
          QuantizationOutcome::Failed(e)
        }
      }
    } else {
      QuantizationOutcome::Skipped
    };

    let metrics = history
      .last()
      .copied()
      .map(TrainingMetrics::from)
      .ok_or(TrainError::InvalidEpochs)?;

    Ok(TrainingReport {
      metrics,
      history,
      train_examples: train_set.len(),
      validation_examples: val_set.len(),
      model_path: model_path.to_path_buf(),
      quantization,
    })
  }

  /// 推理模式下的平均损失与准确率
  fn evaluate(&self, model: &Classifier, examples: &[&Example]) -> Result<(f32, f32), TrainError> {
    let mut stats = Accumulator::default();
    let indices: Vec<usize> = (0..examples.len()).collect();
    for chunk in indices.chunks(self.config.batch_size) {
      let (xs, ys) = batch_tensors(
        examples,
        chunk,
        self.config.image(),
        self.config.model.num_classes,
        &self.device,
      )?;
      let logits = model.forward_t(&xs, false)?;
      let loss = categorical_cross_entropy(&logits, &ys)?;
      stats.add(
        loss.to_scalar::<f32>()?,
        count_correct(&logits, &ys)?,
        chunk.len(),
      );
    }
    Ok(stats.finish())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ModelConfig;
  use crate::dataset::Label;

  const SIZE: u32 = 32;

  fn spec() -> ImageSpec {
    ImageSpec::square(SIZE)
  }

  fn config() -> TrainConfig {
    TrainConfig::default()
      .with_model(ModelConfig::default().with_image(spec()))
      .with_epochs(2)
      .with_batch_size(4)
  }

  fn synthetic_dataset(per_class: usize) -> Dataset {
    let mut dataset = Dataset::new(spec());
    for i in 0..per_class {
      for (label, level) in [(Label::Positive, 0.9f32), (Label::Negative, 0.1f32)] {
        dataset.push(Example {
          pixels: vec![level; spec().pixel_len()],
          label,
          source: PathBuf::from(format!("{label:?}_{i}.png")),
        }).unwrap();
      }
    }
    dataset
  }

  fn scratch_model_path() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("pareidolia_train_{}", rand::random::<u64>()));
    let path = dir.join("classifier.safetensors");
    (dir, path)
  }

  #[test]
  fn cross_entropy_matches_manual_value() {
    let device = Device::Cpu;
    let logits = Tensor::new(&[[0f32, 1.0], [2.0, 0.0]], &device).unwrap();
    let targets = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device).unwrap();

    let loss = categorical_cross_entropy(&logits, &targets)
      .unwrap()
      .to_scalar::<f32>()
      .unwrap();
    let expected = ((1.0 + 1f32.exp()).ln() + (1.0 + 2f32.exp()).ln()) / 2.0;
    assert!((loss - expected).abs() < 1e-5);
    assert_eq!(count_correct(&logits, &targets).unwrap(), 0.0);

    let flipped = Tensor::new(&[[0f32, 1.0], [1.0, 0.0]], &device).unwrap();
    assert_eq!(count_correct(&logits, &flipped).unwrap(), 2.0);
  }

  #[test]
  fn report_lines_are_key_value_pairs() {
    let metrics = TrainingMetrics {
      loss: 0.5,
      accuracy: 0.75,
      val_loss: 0.25,
      val_accuracy: 1.0,
    };
    assert_eq!(
      metrics.to_report_lines(),
      [
        "FINAL_LOSS:0.5".to_string(),
        "FINAL_ACCURACY:0.75".to_string(),
        "FINAL_VAL_LOSS:0.25".to_string(),
        "FINAL_VAL_ACCURACY:1".to_string(),
      ]
    );
  }

  #[test]
  fn empty_dataset_fails_without_writing_a_model() {
    let (dir, path) = scratch_model_path();
    let err = Trainer::new(config())
      .with_device(Device::Cpu)
      .train(&Dataset::new(spec()), &path)
      .unwrap_err();
    assert!(matches!(err, TrainError::EmptyDataset));
    assert!(!dir.exists());
  }

  #[test]
  fn zero_epochs_is_rejected() {
    let (_, path) = scratch_model_path();
    let err = Trainer::new(config().with_epochs(0))
      .with_device(Device::Cpu)
      .train(&synthetic_dataset(2), &path)
      .unwrap_err();
    assert!(matches!(err, TrainError::InvalidEpochs));
  }

  #[test]
  fn mismatched_image_spec_is_rejected() {
    let (_, path) = scratch_model_path();
    let err = Trainer::new(TrainConfig::default())
      .with_device(Device::Cpu)
      .train(&synthetic_dataset(2), &path)
      .unwrap_err();
    assert!(matches!(err, TrainError::ImageSpecMismatch { .. }));
  }

  #[test]
  fn trains_saves_and_quantizes() {
    let (dir, path) = scratch_model_path();
    let mut epochs_seen = Vec::new();
    let report = Trainer::new(config())
      .with_device(Device::Cpu)
      .train_with_progress(&synthetic_dataset(5), &path, |m| epochs_seen.push(m.epoch))
      .unwrap();

    assert_eq!(epochs_seen, vec![1, 2]);
    assert_eq!(report.history.len(), 2);
    assert_eq!(report.train_examples, 8);
    assert_eq!(report.validation_examples, 2);
    assert!(path.is_file());

    let metrics = report.metrics;
    assert!(metrics.loss.is_finite() && metrics.val_loss.is_finite());
    assert!((0.0..=1.0).contains(&metrics.accuracy));
    assert!((0.0..=1.0).contains(&metrics.val_accuracy));

    let artifacts = report.quantization.artifacts().expect("quantization should succeed");
    assert!(artifacts.quantized.is_file());
    assert!(artifacts.model_copy.is_file());
    assert_eq!(artifacts.quantized.parent(), Some(dir.as_path()));

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn quantization_failure_does_not_fail_training() {
    let (dir, path) = scratch_model_path();
    let mut config = config().with_epochs(1);
    config.calibration_limit = 0;

    let report = Trainer::new(config)
      .with_device(Device::Cpu)
      .train(&synthetic_dataset(3), &path)
      .unwrap();

    assert!(path.is_file());
    assert!(matches!(report.quantization, QuantizationOutcome::Failed(_)));
    assert!(!dir.join(crate::quantize::QUANTIZED_MODEL_FILE).exists());

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn single_example_reports_nan_validation() {
    let (dir, path) = scratch_model_path();
    let mut dataset = Dataset::new(spec());
    dataset.push(Example {
      pixels: vec![0.5; spec().pixel_len()],
      label: Label::Positive,
      source: PathBuf::from("only.png"),
    }).unwrap();

    let report = Trainer::new(config().with_epochs(1).with_quantize(false))
      .with_device(Device::Cpu)
      .train(&dataset, &path)
      .unwrap();

    assert!(report.metrics.loss.is_finite());
    assert!(report.metrics.val_loss.is_nan());
    assert!(report.metrics.val_accuracy.is_nan());
    assert!(matches!(report.quantization, QuantizationOutcome::Skipped));

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn learns_separable_synthetic_classes() {
    let (dir, path) = scratch_model_path();
    let report = Trainer::new(config().with_epochs(15).with_quantize(false))
      .with_device(Device::Cpu)
      .train(&synthetic_dataset(8), &path)
      .unwrap();

    let first = report.history.first().unwrap().loss;
    assert!(report.metrics.loss < first, "loss should decrease: {first} -> {}", report.metrics.loss);

    std::fs::remove_dir_all(dir).unwrap();
  }
}
