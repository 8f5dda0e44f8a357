// 该文件是 Pareidolia 项目的一部分。
// src/model.rs - 二分类卷积网络
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder, VarMap, conv2d, linear, ops};
use image::RgbImage;
use thiserror::Error;
use tracing::info;

use crate::{
  config::{ImageSpec, ModelConfig},
  dataset::Label,
  input::read_image_file::preprocess_rgb,
};

const CONV_KERNEL: usize = 3;
const POOL_SIZE: usize = 2;
const CONV_CHANNELS: [usize; 3] = [32, 64, 64];
const HIDDEN_UNITS: usize = 64;
const CONV_STAGES: [&str; 3] = ["conv1", "conv2", "conv3"];

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("图像尺寸 {width}x{height} 过小，无法通过三层卷积与池化")]
  ImageTooSmall { width: u32, height: u32 },
  #[error(transparent)]
  Candle(#[from] candle_core::Error),
}

/// 单张图像的分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
  pub probabilities: Vec<f32>,
  pub label: Label,
}

impl Prediction {
  pub fn from_probabilities(probabilities: Vec<f32>) -> Self {
    let label = if probabilities.get(1).copied().unwrap_or(0.0)
      > probabilities.first().copied().unwrap_or(0.0)
    {
      Label::Positive
    } else {
      Label::Negative
    };
    Prediction {
      probabilities,
      label,
    }
  }
}

/// 有效卷积加 2x2 池化后单个维度的尺寸
fn stage_output(size: usize) -> Option<usize> {
  let conv = size.checked_sub(CONV_KERNEL - 1)?;
  let pooled = conv / POOL_SIZE;
  (pooled > 0).then_some(pooled)
}

impl ModelConfig {
  /// 展平层的特征数
  pub fn flattened_features(&self) -> Result<usize, ModelError> {
    let too_small = || ModelError::ImageTooSmall {
      width: self.image.width,
      height: self.image.height,
    };

    let mut height = self.image.height as usize;
    let mut width = self.image.width as usize;
    for _ in CONV_CHANNELS {
      height = stage_output(height).ok_or_else(too_small)?;
      width = stage_output(width).ok_or_else(too_small)?;
    }
    Ok(height * width * CONV_CHANNELS[CONV_CHANNELS.len() - 1])
  }
}

/// Conv(32) → Pool → Conv(64) → Pool → Conv(64) → Pool → Dense(64) → Dropout → Dense(classes)
///
/// 输入为 NHWC 排列的 `[batch, height, width, 3]` 张量，取值范围 [0, 1]。
pub struct Classifier {
  convs: Vec<Conv2d>,
  fc1: Linear,
  fc2: Linear,
  dropout: Dropout,
  config: ModelConfig,
}

impl Classifier {
  pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self, ModelError> {
    let flattened = config.flattened_features()?;

    let mut convs = Vec::with_capacity(CONV_CHANNELS.len());
    let mut in_channels = config.image.channels();
    for (i, out_channels) in CONV_CHANNELS.iter().enumerate() {
      convs.push(conv2d(
        in_channels,
        *out_channels,
        CONV_KERNEL,
        Conv2dConfig::default(),
        vb.pp(format!("conv{}", i + 1)),
      )?);
      in_channels = *out_channels;
    }

    let fc1 = linear(flattened, HIDDEN_UNITS, vb.pp("fc1"))?;
    let fc2 = linear(HIDDEN_UNITS, config.num_classes, vb.pp("fc2"))?;

    Ok(Classifier {
      convs,
      fc1,
      fc2,
      dropout: Dropout::new(config.dropout),
      config,
    })
  }

  fn features(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
    let mut xs = xs.permute((0, 3, 1, 2))?.contiguous()?;
    for conv in &self.convs {
      xs = conv.forward(&xs)?.relu()?.max_pool2d(POOL_SIZE)?;
    }
    xs.flatten_from(1)
  }

  /// 返回 logits，`train` 为 true 时启用 dropout
  pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
    let xs = self.features(xs)?;
    let xs = self.fc1.forward(&xs)?.relu()?;
    let xs = self.dropout.forward(&xs, train)?;
    self.fc2.forward(&xs)
  }

  /// 推理模式下的 softmax 概率
  pub fn predict_proba(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
    let logits = self.forward_t(xs, false)?;
    ops::softmax(&logits, D::Minus1)
  }

  /// 推理模式前向计算，每一层的输出都先交给 `observe`，再以其返回值继续计算
  ///
  /// 层名依次为 `input`、`conv1`、`conv2`、`conv3`、`fc1`、`logits`。
  pub fn forward_observed<F>(&self, xs: &Tensor, mut observe: F) -> candle_core::Result<Tensor>
  where
    F: FnMut(&'static str, Tensor) -> candle_core::Result<Tensor>,
  {
    let xs = observe("input", xs.clone())?;
    let mut hidden = xs.permute((0, 3, 1, 2))?.contiguous()?;
    for (conv, name) in self.convs.iter().zip(CONV_STAGES) {
      hidden = observe(name, conv.forward(&hidden)?.relu()?.max_pool2d(POOL_SIZE)?)?;
    }
    let hidden = observe("fc1", self.fc1.forward(&hidden.flatten_from(1)?)?.relu()?)?;
    observe("logits", self.fc2.forward(&hidden)?)
  }

  /// 推理模式下各层的输出，用于量化校准
  pub fn activations(&self, xs: &Tensor) -> candle_core::Result<Vec<(&'static str, Tensor)>> {
    let mut stages = Vec::new();
    self.forward_observed(xs, |name, tensor| {
      stages.push((name, tensor.clone()));
      Ok(tensor)
    })?;
    Ok(stages)
  }
}

impl Model for Classifier {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let device = self.fc1.weight().device();
    let xs = preprocess_frame(input, self.config.image, device)?;
    let probabilities = self.predict_proba(&xs)?.squeeze(0)?.to_vec1::<f32>()?;
    Ok(Prediction::from_probabilities(probabilities))
  }
}

/// 将一帧图像转换为 `[1, height, width, 3]` 的输入张量
pub fn preprocess_frame(
  image: &RgbImage,
  spec: ImageSpec,
  device: &Device,
) -> candle_core::Result<Tensor> {
  let pixels = preprocess_rgb(image, spec);
  Tensor::from_vec(
    pixels,
    (1, spec.height as usize, spec.width as usize, spec.channels()),
    device,
  )
}

/// 默认计算设备
pub fn default_device() -> Device {
  #[cfg(feature = "metal")]
  let device = Device::new_metal(0).unwrap_or(Device::Cpu);
  #[cfg(not(feature = "metal"))]
  let device = Device::Cpu;
  device
}

/// 创建随机初始化的网络，权重保存在返回的 `VarMap` 中
pub fn build_classifier(
  config: ModelConfig,
  device: &Device,
) -> Result<(VarMap, Classifier), ModelError> {
  let varmap = VarMap::new();
  let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
  let classifier = Classifier::new(config, vb)?;
  Ok((varmap, classifier))
}

/// 从 safetensors 文件加载训练好的网络
pub fn load_classifier(
  path: &Path,
  config: ModelConfig,
  device: &Device,
) -> Result<(VarMap, Classifier), ModelError> {
  info!("加载模型文件: {}", path.display());
  let (mut varmap, classifier) = build_classifier(config, device)?;
  varmap.load(path)?;
  Ok((varmap, classifier))
}
