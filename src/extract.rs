// 该文件是 Pareidolia 项目的一部分。
// src/extract.rs - 视频抽帧
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

//! 按原生帧率的四分之一间隔对视频采样，并把采样帧保存为 JPEG。

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
  input::{Frame, InputError, VideoSource, open_video},
  output::{Render, SaveImageFileError, SaveImageFileOutput},
};

pub use crate::output::frame_file_name;

/// 每秒采样帧数
pub const SAMPLES_PER_SECOND: f64 = 4.0;

#[derive(Error, Debug)]
pub enum ExtractError {
  #[error("视频帧率无效: {0:?}")]
  InvalidFrameRate(Option<f64>),
  #[error("无法从路径获取视频名: {0}")]
  InvalidVideoPath(PathBuf),
  #[error("视频输入错误")]
  Input(#[from] InputError),
  #[error("无法创建输出目录")]
  OutputDirectory(#[from] SaveImageFileError),
  #[error("写入帧失败")]
  Output(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 由原生帧率计算采样步长 `round(fps / 4)`，结果至少为 1
///
/// 帧率为 0、负数、非有限值或缺失时返回错误。
/// 取整规则为四舍六入五成双。
pub fn sampling_stride(fps: Option<f64>) -> Result<u64, ExtractError> {
  match fps {
    Some(rate) if rate.is_finite() && rate > 0.0 => {
      let stride = (rate / SAMPLES_PER_SECOND).round_ties_even() as u64;
      Ok(stride.max(1))
    }
    other => Err(ExtractError::InvalidFrameRate(other)),
  }
}

/// 不含扩展名的视频文件名
pub fn video_stem(path: &Path) -> Result<String, ExtractError> {
  path
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .filter(|stem| !stem.is_empty())
    .ok_or_else(|| ExtractError::InvalidVideoPath(path.to_path_buf()))
}

/// 一次抽帧的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSummary {
  /// 写入的图像数
  pub written: usize,
  /// 解码的帧数
  pub decoded: u64,
  pub stride: u64,
  pub output_dir: PathBuf,
  /// 按帧序号递增排列
  pub files: Vec<PathBuf>,
}

pub struct FrameExtractor<O> {
  output: O,
  output_dir: PathBuf,
}

impl FrameExtractor<SaveImageFileOutput> {
  pub fn new(output_dir: &Path, stem: &str) -> Result<Self, ExtractError> {
    let output = SaveImageFileOutput::new(output_dir, stem)?;
    Ok(Self::with_output(output, output_dir))
  }
}

impl<O> FrameExtractor<O>
where
  O: Render<Frame>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  pub fn with_output(output: O, output_dir: &Path) -> Self {
    FrameExtractor {
      output,
      output_dir: output_dir.to_path_buf(),
    }
  }

  /// 顺序解码并保存序号能被步长整除的帧
  ///
  /// 解码中途失败视为流结束，已写入的帧保留。
  pub fn extract<S>(&mut self, source: &mut S) -> Result<ExtractSummary, ExtractError>
  where
    S: VideoSource + ?Sized,
  {
    let stride = sampling_stride(source.fps())?;
    info!(
      "视频 {}x{}, 帧率 {:?}, 采样步长 {}",
      source.width(),
      source.height(),
      source.fps(),
      stride
    );

    let mut decoded = 0u64;
    let mut files = Vec::new();
    for item in &mut *source {
      let frame = match item {
        Ok(frame) => frame,
        Err(e) => {
          warn!("解码中断，结束抽帧: {}", e);
          break;
        }
      };

      // 以解码顺序计数，与源自带的序号无关
      let index = decoded;
      decoded += 1;
      if index % stride != 0 {
        continue;
      }

      let frame = Frame { index, ..frame };
      let path = self
        .output
        .render_frame(&frame)
        .map_err(|e| ExtractError::Output(Box::new(e)))?;
      files.push(path);
    }

    info!("共解码 {} 帧，写入 {} 张图像", decoded, files.len());
    Ok(ExtractSummary {
      written: files.len(),
      decoded,
      stride,
      output_dir: self.output_dir.clone(),
      files,
    })
  }
}

/// 打开视频并把采样帧写入输出目录
pub fn extract_video(video_path: &Path, output_dir: &Path) -> Result<ExtractSummary, ExtractError> {
  let stem = video_stem(video_path)?;
  let mut source = open_video(video_path)?;
  let mut extractor = FrameExtractor::new(output_dir, &stem)?;

  let summary = extractor.extract(source.as_mut())?;
  drop(source);
  info!("视频资源已释放: {}", video_path.display());

  Ok(summary)
}
