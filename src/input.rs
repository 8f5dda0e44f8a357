// 该文件是 Pareidolia 项目的一部分。
// src/input.rs - 视频/图像输入
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

use image::RgbImage;
use thiserror::Error;

pub mod read_image_file;
pub use self::read_image_file::ImageFileInputError;

#[cfg(feature = "ffmpeg_input")]
mod ffmpeg_input;
#[cfg(feature = "ffmpeg_input")]
pub use self::ffmpeg_input::{FfmpegInput, FfmpegInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("无法打开视频 {path}")]
  Open {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("未启用任何视频解码后端")]
  NoBackend,
  #[cfg(feature = "ffmpeg_input")]
  #[error(transparent)]
  FfmpegInputError(#[from] FfmpegInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error(transparent)]
  GStreamerInputError(#[from] GStreamerInputError),
}

/// 解码后的视频帧
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 从 0 开始的帧序号
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

/// 顺序解码的视频源
///
/// 迭代器按解码顺序产出帧，流结束时返回 `None`。
/// 解码失败时产出一次 `Err`，之后结束。
pub trait VideoSource: Iterator<Item = Result<Frame, InputError>> {
  fn width(&self) -> u32;

  fn height(&self) -> u32;

  /// 原生帧率，容器未提供时为 `None`
  fn fps(&self) -> Option<f64>;
}

/// 打开视频文件
///
/// 默认使用 GStreamer 解码；只启用 `ffmpeg_input` 特性时调用系统中的 ffmpeg。
pub fn open_video(path: &Path) -> Result<Box<dyn VideoSource>, InputError> {
  // 解码器对不存在的文件只报告笼统的错误，先检查一次
  std::fs::metadata(path).map_err(|source| InputError::Open {
    path: path.to_path_buf(),
    source,
  })?;

  #[cfg(feature = "gstreamer_input")]
  {
    let input = GStreamerInput::open(path)?;
    Ok(Box::new(input))
  }
  #[cfg(all(feature = "ffmpeg_input", not(feature = "gstreamer_input")))]
  {
    let input = FfmpegInput::open(path)?;
    Ok(Box::new(input))
  }
  #[cfg(not(any(feature = "ffmpeg_input", feature = "gstreamer_input")))]
  {
    Err(InputError::NoBackend)
  }
}

/// 将形如 `30000/1001` 或 `25` 的帧率字符串解析为浮点数
///
/// 分母为 0 或结果非正时返回 `None`。
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
  let rate = rate.trim();
  let value = match rate.split_once('/') {
    Some((numer, denom)) => {
      let numer: f64 = numer.trim().parse().ok()?;
      let denom: f64 = denom.trim().parse().ok()?;
      if denom == 0.0 {
        return None;
      }
      numer / denom
    }
    None => rate.parse().ok()?,
  };

  (value.is_finite() && value > 0.0).then_some(value)
}
