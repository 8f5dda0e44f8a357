// 该文件是 Pareidolia 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 基于 `decodebin` 顺序解码视频文件，每一帧都会交给调用方，不会丢帧。
//!
//! ## 系统依赖
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! **macOS:**
//! ```bash
//! brew install gstreamer
//! ```
//!
//! ## Cargo 特性
//!
//! ```toml
//! [dependencies]
//! pareidolia = { version = "0.1", features = ["gstreamer_input"] }
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use pareidolia::input::{GStreamerInput, VideoSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = GStreamerInput::open(std::path::Path::new("video.mp4"))?;
//! println!("帧率: {:?}", input.fps());
//! for frame in input {
//!     let frame = frame?;
//!     println!("帧 {}: {}x{}", frame.index, frame.image.width(), frame.image.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};

use super::{Frame, InputError, VideoSource};

const PREROLL_TIMEOUT_SECS: u64 = 30;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// GStreamer 库错误
  #[error(transparent)]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error(transparent)]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error(transparent)]
  StateChangeError(#[from] gst::StateChangeError),
}

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", escape_location(path))
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

fn escape_location(path: &str) -> String {
  path.replace('\\', "\\\\").replace('"', "\\\"")
}

/// GStreamer 输入管道构建器
#[derive(Default)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn file(mut self, path: &Path) -> Self {
    self.items.push(GStreamerInputBuilderItem::FileSource(
      path.to_string_lossy().into_owned(),
    ));
    self
  }

  pub fn target_format(mut self, format: &str) -> Self {
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: format.to_string(),
    });
    self
  }

  /// 生成完整管道描述
  ///
  /// appsink 不丢帧且不按时钟同步，解码速度由下游消费速度决定。
  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink name=sink sync=false max-buffers=4 drop=false",
      basic_pipeline
    )
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    let mut input = GStreamerInput {
      pipeline,
      appsink,
      width: 0,
      height: 0,
      fps: None,
      frame_index: 0,
      finished: false,
    };
    input.preroll()?;
    Ok(input)
  }
}

/// GStreamer 视频输入
///
/// 析构时将管道置为 `Null`，释放解码器与文件句柄。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  fps: Option<f64>,
  frame_index: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn open(path: &Path) -> Result<Self, GStreamerInputError> {
    GStreamerInputPipelineBuilder::new()
      .file(path)
      .target_format("RGB")
      .build()
  }

  /// 暂停状态下预加载首帧，从 caps 中读取尺寸与帧率
  fn preroll(&mut self) -> Result<(), GStreamerInputError> {
    self.pipeline.set_state(gst::State::Paused)?;
    let (result, _, _) = self
      .pipeline
      .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
    if result.is_err() {
      let message = self
        .bus_error()
        .unwrap_or_else(|| "Failed to preroll pipeline".to_string());
      return Err(GStreamerInputError::PipelineError(message));
    }

    let sample = self.appsink.pull_preroll()?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

    self.width = video_info.width();
    self.height = video_info.height();
    let fps = video_info.fps();
    self.fps = (fps.numer() > 0 && fps.denom() > 0)
      .then(|| fps.numer() as f64 / fps.denom() as f64);

    info!(
      "视频流信息: {}x{}, 帧率 {:?}",
      self.width, self.height, self.fps
    );

    // 预加载的样本会作为 pull_sample 的第一帧再次返回
    self.pipeline.set_state(gst::State::Playing)?;
    Ok(())
  }

  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(err.error().to_string()),
      _ => None,
    }
  }

  fn next_frame(&mut self) -> Result<Option<Frame>, GStreamerInputError> {
    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) if self.appsink.is_eos() => return Ok(None),
      Err(e) => {
        return Err(match self.bus_error() {
          Some(message) => GStreamerInputError::PipelineError(message),
          None => e.into(),
        });
      }
    };

    let timestamp_ms = sample
      .buffer()
      .and_then(|buffer| buffer.pts())
      .map(|pts| pts.mseconds());
    let image = convert_sample_to_rgb(sample)?;

    let index = self.frame_index;
    self.frame_index += 1;
    let timestamp_ms = timestamp_ms.unwrap_or_else(|| match self.fps {
      Some(fps) => (index as f64 * 1000.0 / fps) as u64,
      None => 0,
    });

    Ok(Some(Frame {
      image,
      index,
      timestamp_ms,
    }))
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    match self.next_frame() {
      Ok(Some(frame)) => Some(Ok(frame)),
      Ok(None) => {
        self.finished = true;
        None
      }
      Err(e) => {
        self.finished = true;
        Some(Err(e.into()))
      }
    }
  }
}

impl VideoSource for GStreamerInput {
  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }
}

fn convert_sample_to_rgb(sample: gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // Validate buffer size
  let row_len = width * 3;
  let expected_size = stride * (height.saturating_sub(1)) + row_len;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row_len * height);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      // 行首按 stride 对齐，逐行拷贝去掉填充
      for h in 0..height {
        let start = h * stride;
        pixels.extend_from_slice(&data[start..start + row_len]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for h in 0..height {
        let start = h * stride;
        for bgr in data[start..start + row_len].chunks_exact(3) {
          pixels.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }
      }
    }
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  }

  RgbImage::from_raw(width as u32, height as u32, pixels).ok_or(
    GStreamerInputError::BufferSizeMismatch {
      expected: row_len * height,
      actual: data.len(),
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_description_decodes_file_to_rgb_without_dropping() {
    let description = GStreamerInputPipelineBuilder::new()
      .file(Path::new("/videos/clip one.mp4"))
      .target_format("RGB")
      .description();
    assert_eq!(
      description,
      "filesrc location=\"/videos/clip one.mp4\" ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4 drop=false"
    );
  }

  #[test]
  fn location_quotes_are_escaped() {
    assert_eq!(escape_location("a\"b"), "a\\\"b");
  }
}
