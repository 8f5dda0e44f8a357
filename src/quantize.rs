// 该文件是 Pareidolia 项目的一部分。
// src/quantize.rs - 8 位量化导出
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

//! # 量化导出
//!
//! 从保存好的全精度模型重建一个仅用于推理的网络，用最多
//! `calibration_limit` 个训练样本统计各层输出范围，然后把权重量化为
//! GGUF `Q8_0` 格式。元素个数不是块大小整数倍的张量（例如输出层偏置）
//! 以 `F32` 保存。
//!
//! 量化模型的输入为 `u8` RGB 像素，量化参数 `scale = 1/255, zero_point = 0`
//! 写在文件元数据中；输出为 `f32` 概率。加载后的模型在每一层输出处按校准
//! 范围做 8 位量化再反量化，超出范围的激活值被截断。

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::quantized::{GgmlDType, QTensor, gguf_file};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, ops};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  config::{ImageSpec, ModelConfig},
  dataset::Example,
  input::read_image_file::resize_rgb,
  model::{Classifier, Model, ModelError, Prediction, default_device, load_classifier},
  train::batch_tensors,
};

pub const QUANTIZED_MODEL_FILE: &str = "model_quantized.gguf";
pub const MODEL_COPY_FILE: &str = "model.safetensors";

const ARCHITECTURE: &str = "pareidolia-cnn";
const KEY_ARCHITECTURE: &str = "general.architecture";
const KEY_WIDTH: &str = "pareidolia.input.width";
const KEY_HEIGHT: &str = "pareidolia.input.height";
const KEY_CHANNELS: &str = "pareidolia.input.channels";
const KEY_INPUT_DTYPE: &str = "pareidolia.input.dtype";
const KEY_INPUT_SCALE: &str = "pareidolia.input.scale";
const KEY_INPUT_ZERO_POINT: &str = "pareidolia.input.zero_point";
const KEY_OUTPUT_DTYPE: &str = "pareidolia.output.dtype";
const KEY_NUM_CLASSES: &str = "pareidolia.num_classes";
const KEY_CALIBRATION_SAMPLES: &str = "pareidolia.calibration.samples";
const KEY_CALIBRATION_STAGES: &str = "pareidolia.calibration.stages";

const CALIBRATION_BATCH: usize = 32;
const QUANT_LEVELS: f32 = 255.0;

#[derive(Error, Debug)]
pub enum QuantizeError {
  #[error("没有可用于校准的样本")]
  NoCalibrationData,
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Candle(#[from] candle_core::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error("量化模型缺少元数据: {0}")]
  MissingMetadata(String),
  #[error("量化模型输入类型不受支持: {0}")]
  UnsupportedInput(String),
}

/// 量化成功后写出的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedArtifacts {
  /// 量化模型
  pub quantized: PathBuf,
  /// 全精度模型副本
  pub model_copy: PathBuf,
}

/// 训练后量化步骤的结果
#[derive(Debug)]
pub enum QuantizationOutcome {
  Converted(QuantizedArtifacts),
  Failed(QuantizeError),
  Skipped,
}

impl QuantizationOutcome {
  pub fn artifacts(&self) -> Option<&QuantizedArtifacts> {
    match self {
      QuantizationOutcome::Converted(artifacts) => Some(artifacts),
      _ => None,
    }
  }
}

/// 量化产物放在全精度模型所在目录，文件名固定
pub fn quantized_artifact_paths(model_path: &Path) -> QuantizedArtifacts {
  let directory = model_path
    .parent()
    .filter(|parent| !parent.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  QuantizedArtifacts {
    quantized: directory.join(QUANTIZED_MODEL_FILE),
    model_copy: directory.join(MODEL_COPY_FILE),
  }
}

/// 某一层输出在校准样本上的取值范围
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRange {
  pub min: f32,
  pub max: f32,
}

impl CalibrationRange {
  fn merge(self, other: CalibrationRange) -> CalibrationRange {
    CalibrationRange {
      min: self.min.min(other.min),
      max: self.max.max(other.max),
    }
  }

  /// 非对称 `u8` 量化参数 `(scale, zero_point)`，范围总是包含 0
  ///
  /// 范围退化为单点 0 时返回 `None`。
  pub fn quant_params(&self) -> Option<(f32, f32)> {
    let min = self.min.min(0.0);
    let max = self.max.max(0.0);
    let scale = (max - min) / QUANT_LEVELS;
    if !(scale.is_finite() && scale > 0.0) {
      return None;
    }
    let zero_point = (-min / scale).round().clamp(0.0, QUANT_LEVELS);
    Some((scale, zero_point))
  }

  /// 量化到 `u8` 再反量化，超出范围的值被截断到边界
  pub fn fake_quantize(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
    let Some((scale, zero_point)) = self.quant_params() else {
      return tensor.zeros_like();
    };
    tensor
      .affine(1.0 / scale as f64, zero_point as f64)?
      .round()?
      .clamp(0f32, QUANT_LEVELS)?
      .affine(scale as f64, -(zero_point * scale) as f64)
  }

  fn of(tensor: &Tensor) -> candle_core::Result<CalibrationRange> {
    let flat = tensor.flatten_all()?;
    Ok(CalibrationRange {
      min: flat.min(0)?.to_scalar::<f32>()?,
      max: flat.max(0)?.to_scalar::<f32>()?,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
  pub samples: usize,
  pub stages: Vec<(String, CalibrationRange)>,
}

impl Calibration {
  pub fn range(&self, stage: &str) -> Option<CalibrationRange> {
    self
      .stages
      .iter()
      .find(|(name, _)| name == stage)
      .map(|(_, range)| *range)
  }
}

pub struct Quantizer {
  config: ModelConfig,
  calibration_limit: usize,
  device: Device,
}

impl Quantizer {
  pub fn new(config: ModelConfig, calibration_limit: usize) -> Self {
    Quantizer {
      config,
      calibration_limit,
      device: default_device(),
    }
  }

  pub fn with_device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  /// 在推理模式网络上统计各层输出范围
  pub fn calibrate(
    &self,
    classifier: &Classifier,
    examples: &[&Example],
  ) -> Result<Calibration, QuantizeError> {
    let samples = examples.len().min(self.calibration_limit);
    if samples == 0 {
      return Err(QuantizeError::NoCalibrationData);
    }

    let mut stages: Vec<(String, CalibrationRange)> = Vec::new();
    let indices: Vec<usize> = (0..samples).collect();
    for chunk in indices.chunks(CALIBRATION_BATCH) {
      let (xs, _) = batch_tensors(
        examples,
        chunk,
        self.config.image,
        self.config.num_classes,
        &self.device,
      )?;
      for (i, (name, activation)) in classifier.activations(&xs)?.into_iter().enumerate() {
        let range = CalibrationRange::of(&activation)?;
        match stages.get_mut(i) {
          Some((_, seen)) => *seen = seen.merge(range),
          None => stages.push((name.to_string(), range)),
        }
      }
    }

    debug!("校准完成: {} 个样本, {:?}", samples, stages);
    Ok(Calibration { samples, stages })
  }

  /// 由已保存的全精度模型生成量化模型，并在同目录保存一份全精度副本
  pub fn quantize(
    &self,
    model_path: &Path,
    examples: &[&Example],
  ) -> Result<QuantizedArtifacts, QuantizeError> {
    if examples.is_empty() || self.calibration_limit == 0 {
      return Err(QuantizeError::NoCalibrationData);
    }

    info!("开始量化: {}", model_path.display());
    let (_, classifier) = load_classifier(model_path, self.config, &self.device)?;
    let calibration = self.calibrate(&classifier, examples)?;

    let weights = candle_core::safetensors::load(model_path, &self.device)?;
    let mut names: Vec<&String> = weights.keys().collect();
    names.sort();

    let mut metadata = self.header_metadata(&calibration);
    let mut tensors = Vec::with_capacity(names.len());
    for name in names {
      let tensor = &weights[name];
      let dtype = if tensor.elem_count() % GgmlDType::Q8_0.block_size() == 0 {
        GgmlDType::Q8_0
      } else {
        GgmlDType::F32
      };
      debug!("量化 {} {:?} -> {:?}", name, tensor.dims(), dtype);

      let qtensor = QTensor::quantize(&tensor.flatten_all()?, dtype)?;
      let shape = tensor
        .dims()
        .iter()
        .map(|d| gguf_file::Value::U32(*d as u32))
        .collect();
      metadata.push((shape_key(name), gguf_file::Value::Array(shape)));
      tensors.push((name.clone(), qtensor));
    }

    let artifacts = quantized_artifact_paths(model_path);
    {
      let metadata: Vec<(&str, &gguf_file::Value)> =
        metadata.iter().map(|(k, v)| (k.as_str(), v)).collect();
      let tensors: Vec<(&str, &QTensor)> = tensors.iter().map(|(k, v)| (k.as_str(), v)).collect();
      let mut writer = BufWriter::new(File::create(&artifacts.quantized)?);
      gguf_file::write(&mut writer, &metadata, &tensors)?;
      writer.flush()?;
    }

    if !same_file(model_path, &artifacts.model_copy) {
      std::fs::copy(model_path, &artifacts.model_copy)?;
    }

    info!(
      "量化模型已保存: {} (校准样本 {})",
      artifacts.quantized.display(),
      calibration.samples
    );
    Ok(artifacts)
  }

  fn header_metadata(&self, calibration: &Calibration) -> Vec<(String, gguf_file::Value)> {
    use gguf_file::Value;

    let image = self.config.image;
    let mut metadata = vec![
      (KEY_ARCHITECTURE.to_string(), Value::String(ARCHITECTURE.to_string())),
      (KEY_WIDTH.to_string(), Value::U32(image.width)),
      (KEY_HEIGHT.to_string(), Value::U32(image.height)),
      (KEY_CHANNELS.to_string(), Value::U32(image.channels() as u32)),
      (KEY_INPUT_DTYPE.to_string(), Value::String("u8".to_string())),
      (KEY_INPUT_SCALE.to_string(), Value::F32(1.0 / 255.0)),
      (KEY_INPUT_ZERO_POINT.to_string(), Value::U32(0)),
      (KEY_OUTPUT_DTYPE.to_string(), Value::String("f32".to_string())),
      (KEY_NUM_CLASSES.to_string(), Value::U32(self.config.num_classes as u32)),
      (KEY_CALIBRATION_SAMPLES.to_string(), Value::U32(calibration.samples as u32)),
      (
        KEY_CALIBRATION_STAGES.to_string(),
        Value::Array(
          calibration
            .stages
            .iter()
            .map(|(name, _)| Value::String(name.clone()))
            .collect(),
        ),
      ),
    ];
    for (name, range) in &calibration.stages {
      metadata.push((format!("pareidolia.calibration.{}.min", name), Value::F32(range.min)));
      metadata.push((format!("pareidolia.calibration.{}.max", name), Value::F32(range.max)));
    }
    metadata
  }
}

fn shape_key(tensor: &str) -> String {
  format!("pareidolia.shape.{}", tensor)
}

fn same_file(a: &Path, b: &Path) -> bool {
  match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
    (Ok(a), Ok(b)) => a == b,
    _ => false,
  }
}

/// 加载量化模型，接收 `u8` 像素并输出 `f32` 概率
pub struct QuantizedClassifier {
  classifier: Classifier,
  image: ImageSpec,
  input_scale: f32,
  input_zero_point: f32,
  calibration: Calibration,
  device: Device,
}

impl QuantizedClassifier {
  pub fn load(path: &Path, device: &Device) -> Result<Self, QuantizeError> {
    let mut file = File::open(path)?;
    let content = gguf_file::Content::read(&mut file)?;

    let input_dtype = metadata(&content, KEY_INPUT_DTYPE)?.to_string()?.clone();
    if input_dtype != "u8" {
      return Err(QuantizeError::UnsupportedInput(input_dtype));
    }

    let image = ImageSpec {
      width: metadata(&content, KEY_WIDTH)?.to_u32()?,
      height: metadata(&content, KEY_HEIGHT)?.to_u32()?,
    };
    let config = ModelConfig {
      image,
      num_classes: metadata(&content, KEY_NUM_CLASSES)?.to_u32()? as usize,
      ..ModelConfig::default()
    };

    let mut tensors = HashMap::new();
    for name in content.tensor_infos.keys() {
      let shape: Vec<usize> = metadata(&content, &shape_key(name))?
        .to_vec()?
        .iter()
        .map(|d| d.to_u32().map(|d| d as usize))
        .collect::<candle_core::Result<_>>()?;
      let tensor = content
        .tensor(&mut file, name, device)?
        .dequantize(device)?
        .reshape(shape)?;
      tensors.insert(name.clone(), tensor);
    }

    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    let classifier = Classifier::new(config, vb)?;

    let mut stages = Vec::new();
    for stage in metadata(&content, KEY_CALIBRATION_STAGES)?.to_vec()? {
      let stage = stage.to_string()?.clone();
      let range = CalibrationRange {
        min: metadata(&content, &format!("pareidolia.calibration.{}.min", stage))?.to_f32()?,
        max: metadata(&content, &format!("pareidolia.calibration.{}.max", stage))?.to_f32()?,
      };
      stages.push((stage, range));
    }

    Ok(QuantizedClassifier {
      classifier,
      image,
      input_scale: metadata(&content, KEY_INPUT_SCALE)?.to_f32()?,
      input_zero_point: metadata(&content, KEY_INPUT_ZERO_POINT)?.to_u32()? as f32,
      calibration: Calibration {
        samples: metadata(&content, KEY_CALIBRATION_SAMPLES)?.to_u32()? as usize,
        stages,
      },
      device: device.clone(),
    })
  }

  pub fn image(&self) -> ImageSpec {
    self.image
  }

  pub fn calibration(&self) -> &Calibration {
    &self.calibration
  }

  /// 输入为 `[batch, height, width, 3]` 的 `u8` 张量，输出 softmax 概率
  ///
  /// 每一层输出都按该层的校准范围量化；没有校准记录的层保持浮点。
  pub fn predict_u8(&self, pixels: &Tensor) -> Result<Tensor, QuantizeError> {
    let xs = pixels.to_dtype(DType::F32)?.affine(
      self.input_scale as f64,
      -(self.input_zero_point * self.input_scale) as f64,
    )?;
    let logits = self
      .classifier
      .forward_observed(&xs, |stage, tensor| match self.calibration.range(stage) {
        Some(range) => range.fake_quantize(&tensor),
        None => Ok(tensor),
      })?;
    Ok(ops::softmax(&logits, D::Minus1)?)
  }
}

impl Model for QuantizedClassifier {
  type Input = RgbImage;
  type Output = Prediction;
  type Error = QuantizeError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let resized = resize_rgb(input, self.image);
    let pixels = Tensor::from_vec(
      resized.into_raw(),
      (
        1,
        self.image.height as usize,
        self.image.width as usize,
        self.image.channels(),
      ),
      &self.device,
    )?;
    let probabilities = self.predict_u8(&pixels)?.squeeze(0)?.to_vec1::<f32>()?;
    Ok(Prediction::from_probabilities(probabilities))
  }
}

fn metadata<'a>(
  content: &'a gguf_file::Content,
  key: &str,
) -> Result<&'a gguf_file::Value, QuantizeError> {
  content
    .metadata
    .get(key)
    .ok_or_else(|| QuantizeError::MissingMetadata(key.to_string()))
}
