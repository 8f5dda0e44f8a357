// 该文件是 Pareidolia 项目的一部分。
// src/config.rs - 预处理、模型与训练配置
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

pub const DEFAULT_IMAGE_SIZE: u32 = 224;
pub const RGB_CHANNELS: usize = 3;
pub const DEFAULT_NUM_CLASSES: usize = 2;
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_VALIDATION_SPLIT: f64 = 0.2;
pub const DEFAULT_CALIBRATION_LIMIT: usize = 200;
pub const DEFAULT_DROPOUT: f32 = 0.3;
pub const DEFAULT_SEED: u64 = 0x5041_5245;

/// 输入图像规格（HWC，RGB）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
  pub width: u32,
  pub height: u32,
}

impl Default for ImageSpec {
  fn default() -> Self {
    Self::square(DEFAULT_IMAGE_SIZE)
  }
}

impl ImageSpec {
  pub fn square(size: u32) -> Self {
    Self {
      width: size,
      height: size,
    }
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 单张图像展开后的元素个数
  pub fn pixel_len(&self) -> usize {
    self.width as usize * self.height as usize * RGB_CHANNELS
  }
}

/// 分类网络配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelConfig {
  pub image: ImageSpec,
  pub num_classes: usize,
  pub dropout: f32,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      image: ImageSpec::default(),
      num_classes: DEFAULT_NUM_CLASSES,
      dropout: DEFAULT_DROPOUT,
    }
  }
}

impl ModelConfig {
  pub fn with_image(mut self, image: ImageSpec) -> Self {
    self.image = image;
    self
  }
}

/// 训练配置
///
/// 默认 224x224 输入、批大小 32、
/// 20% 验证集、学习率 0.001，量化校准最多使用 200 个样本。
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
  pub model: ModelConfig,
  pub epochs: usize,
  pub learning_rate: f64,
  pub batch_size: usize,
  pub validation_split: f64,
  pub calibration_limit: usize,
  pub seed: u64,
  pub quantize: bool,
}

impl Default for TrainConfig {
  fn default() -> Self {
    Self {
      model: ModelConfig::default(),
      epochs: 1,
      learning_rate: DEFAULT_LEARNING_RATE,
      batch_size: DEFAULT_BATCH_SIZE,
      validation_split: DEFAULT_VALIDATION_SPLIT,
      calibration_limit: DEFAULT_CALIBRATION_LIMIT,
      seed: DEFAULT_SEED,
      quantize: true,
    }
  }
}

impl TrainConfig {
  pub fn with_epochs(mut self, epochs: usize) -> Self {
    self.epochs = epochs;
    self
  }

  pub fn with_model(mut self, model: ModelConfig) -> Self {
    self.model = model;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  pub fn with_quantize(mut self, quantize: bool) -> Self {
    self.quantize = quantize;
    self
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  pub fn image(&self) -> ImageSpec {
    self.model.image
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_training_constants() {
    let config = TrainConfig::default();
    assert_eq!(config.image(), ImageSpec::square(224));
    assert_eq!(config.model.num_classes, 2);
    assert_eq!(config.batch_size, 32);
    assert_eq!(config.calibration_limit, 200);
    assert!((config.validation_split - 0.2).abs() < f64::EPSILON);
    assert!((config.learning_rate - 0.001).abs() < f64::EPSILON);
  }

  #[test]
  fn pixel_len_counts_all_channels() {
    assert_eq!(ImageSpec::square(32).pixel_len(), 32 * 32 * 3);
    let spec = ImageSpec {
      width: 40,
      height: 30,
    };
    assert_eq!(spec.pixel_len(), 40 * 30 * 3);
  }
}
