// 该文件是 Pareidolia 项目的一部分。
// src/bin/extract_frames.rs - 视频抽帧工具
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use pareidolia::{extract::extract_video, utils::init_tracing};

/// 以每秒约 4 帧的间隔从视频中抽取 JPEG 图像
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 视频文件路径
  #[arg(value_name = "VIDEO_PATH")]
  pub video_path: PathBuf,
  /// 输出目录，不存在时自动创建
  #[arg(value_name = "OUTPUT_FOLDER")]
  pub output_folder: PathBuf,
}

fn main() -> Result<()> {
  init_tracing();

  let args = Args::parse();

  info!("视频文件: {}", args.video_path.display());
  info!("输出目录: {}", args.output_folder.display());

  let summary = extract_video(&args.video_path, &args.output_folder)
    .with_context(|| format!("无法从 {} 抽帧", args.video_path.display()))?;

  println!(
    "Created {} images at {}.",
    summary.written,
    args.output_folder.display()
  );

  Ok(())
}
