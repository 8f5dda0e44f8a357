// 该文件是 Pareidolia 项目的一部分。
// src/cli.rs - 训练工具命令行
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! `train-model` 的参数解析与运行流程。
//!
//! 所有面向调用方的输出都写入传入的 `Write`，退出码作为返回值，
//! 日志仍通过 `tracing` 写到标准错误。

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, error::ErrorKind};

use crate::{
  config::{DEFAULT_SEED, TrainConfig},
  dataset::DatasetLoader,
  quantize::QuantizationOutcome,
  train::Trainer,
};

pub const TRAIN_MODEL_USAGE: &str =
  "Usage: train-model <positives_path> <negatives_path> <model_path> <epochs>";

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

/// 用正、负样本目录训练二分类模型
#[derive(Parser, Debug)]
#[command(name = "train-model", author, version, about, long_about = None)]
pub struct TrainModelArgs {
  /// 正样本目录
  #[arg(value_name = "POSITIVES_PATH")]
  pub positives_path: PathBuf,
  /// 负样本目录
  #[arg(value_name = "NEGATIVES_PATH")]
  pub negatives_path: PathBuf,
  /// 模型保存路径
  #[arg(value_name = "MODEL_PATH")]
  pub model_path: PathBuf,
  /// 训练轮数
  #[arg(value_name = "EPOCHS", value_parser = clap::value_parser!(u64).range(1..))]
  pub epochs: u64,
  /// 跳过 8 位量化导出
  #[arg(long)]
  pub no_quantize: bool,
  /// 划分验证集与打乱批次使用的随机种子
  #[arg(long, default_value_t = DEFAULT_SEED)]
  pub seed: u64,
}

fn report_usage_error<W: Write>(e: &clap::Error, out: &mut W) -> Result<u8> {
  match e.kind() {
    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
      write!(out, "{}", e.render())?;
      Ok(EXIT_SUCCESS)
    }
    ErrorKind::MissingRequiredArgument => {
      writeln!(out, "Error: Missing required arguments")?;
      writeln!(out, "{}", TRAIN_MODEL_USAGE)?;
      Ok(EXIT_FAILURE)
    }
    _ => {
      write!(out, "{}", e.render())?;
      writeln!(out, "{}", TRAIN_MODEL_USAGE)?;
      Ok(EXIT_FAILURE)
    }
  }
}

/// 解析参数、加载数据集、训练并输出指标，返回退出码
///
/// `argv` 的第一个元素是程序名。参数错误与空数据集在训练前返回
/// [`EXIT_FAILURE`]；训练或保存模型失败返回 `Err`。`base` 提供命令行
/// 未覆盖的训练配置。四行 `FINAL_*` 指标在量化尝试之后输出且只输出一次。
pub fn train_model<I, T, W>(argv: I, base: TrainConfig, out: &mut W) -> Result<u8>
where
  I: IntoIterator<Item = T>,
  T: Into<OsString> + Clone,
  W: Write,
{
  let args = match TrainModelArgs::try_parse_from(argv) {
    Ok(args) => args,
    Err(e) => return report_usage_error(&e, out),
  };

  let config = base
    .with_epochs(args.epochs as usize)
    .with_seed(args.seed)
    .with_quantize(!args.no_quantize);

  writeln!(out, "Loading positive images from: {}", args.positives_path.display())?;
  writeln!(out, "Loading negative images from: {}", args.negatives_path.display())?;
  writeln!(out, "Model will be saved to: {}", args.model_path.display())?;
  writeln!(out, "Training for {} epochs", config.epochs)?;

  let dataset = DatasetLoader::new(config.image()).load(&args.positives_path, &args.negatives_path);
  if dataset.is_empty() {
    writeln!(out, "Error: No images found or failed to load images")?;
    return Ok(EXIT_FAILURE);
  }

  writeln!(
    out,
    "Loaded {} images ({} positive, {} negative)",
    dataset.len(),
    dataset.positives(),
    dataset.negatives()
  )?;
  if !dataset.skipped().is_empty() {
    writeln!(out, "Skipped {} unreadable images", dataset.skipped().len())?;
  }

  writeln!(out, "Starting training for {} epochs...", config.epochs)?;
  let epochs = config.epochs;
  let mut progress_written = Ok(());
  let report = Trainer::new(config)
    .train_with_progress(&dataset, &args.model_path, |m| {
      if progress_written.is_ok() {
        progress_written = writeln!(
          out,
          "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
          m.epoch, epochs, m.loss, m.accuracy, m.val_loss, m.val_accuracy
        );
      }
    })
    .context("训练失败")?;
  progress_written?;

  writeln!(out, "Model saved to: {}", report.model_path.display())?;
  match &report.quantization {
    QuantizationOutcome::Converted(artifacts) => {
      writeln!(out, "Quantized model saved to: {}", artifacts.quantized.display())?;
      writeln!(out, "Model copy saved to: {}", artifacts.model_copy.display())?;
    }
    QuantizationOutcome::Failed(e) => writeln!(out, "Warning: quantization failed: {}", e)?,
    QuantizationOutcome::Skipped => writeln!(out, "Quantization skipped")?,
  }

  for line in report.metrics.to_report_lines() {
    writeln!(out, "{}", line)?;
  }

  Ok(EXIT_SUCCESS)
}
