// 该文件是 Pareidolia 项目的一部分。
// src/input/ffmpeg_input.rs - 基于 ffmpeg 子进程的视频输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # FFmpeg 视频输入
//!
//! 先用 `ffprobe` 读取视频流的尺寸、旋转角度与帧率，再启动 `ffmpeg` 将视频解码为
//! `rgb24` 原始数据并通过标准输出逐帧读取。ffmpeg 默认按显示矩阵自动旋转，
//! 旋转 90° 或 270° 的视频输出帧的宽高与编码尺寸相反。
//!
//! 运行时需要 `ffmpeg` 与 `ffprobe` 位于 `PATH` 中。

use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use image::RgbImage;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Frame, InputError, VideoSource, parse_frame_rate};

const FFMPEG_PROGRAM: &str = "ffmpeg";
const FFPROBE_PROGRAM: &str = "ffprobe";

#[derive(Error, Debug)]
pub enum FfmpegInputError {
  #[error("无法启动 {program}")]
  Spawn {
    program: &'static str,
    source: std::io::Error,
  },
  #[error("ffprobe 无法读取 {path}: {message}")]
  Ffprobe { path: PathBuf, message: String },
  #[error("无法解析 ffprobe 输出")]
  FfprobeJson(#[from] serde_json::Error),
  #[error("文件中没有视频流: {0}")]
  NoVideoStream(PathBuf),
  #[error("视频尺寸无效: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("ffmpeg 解码失败: {0}")]
  Decode(ExitStatus),
  #[error(transparent)]
  IoError(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
  #[serde(default)]
  streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
  width: Option<u32>,
  height: Option<u32>,
  avg_frame_rate: Option<String>,
  r_frame_rate: Option<String>,
  #[serde(default)]
  tags: FfprobeTags,
  #[serde(default)]
  side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
  rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
  rotation: Option<f64>,
}

impl FfprobeStream {
  /// 显示矩阵中的旋转角度，旧版本 ffprobe 写在 `rotate` 标签中
  fn rotation(&self) -> i64 {
    self
      .side_data_list
      .iter()
      .find_map(|side_data| side_data.rotation)
      .or_else(|| self.tags.rotate.as_deref().and_then(|r| r.trim().parse().ok()))
      .map(|degrees: f64| degrees.round() as i64)
      .unwrap_or(0)
  }
}

/// `ffprobe` 得到的视频流信息
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
  pub width: u32,
  pub height: u32,
  pub fps: Option<f64>,
}

impl StreamInfo {
  fn from_ffprobe_json(path: &Path, json: &[u8]) -> Result<Self, FfmpegInputError> {
    let output: FfprobeOutput = serde_json::from_slice(json)?;
    let stream = output
      .streams
      .into_iter()
      .next()
      .ok_or_else(|| FfmpegInputError::NoVideoStream(path.to_path_buf()))?;

    let coded_width = stream.width.unwrap_or(0);
    let coded_height = stream.height.unwrap_or(0);
    if coded_width == 0 || coded_height == 0 {
      return Err(FfmpegInputError::InvalidDimensions {
        width: coded_width,
        height: coded_height,
      });
    }

    let (width, height) = if stream.rotation().rem_euclid(180) == 90 {
      (coded_height, coded_width)
    } else {
      (coded_width, coded_height)
    };

    // 平均帧率更接近实际播放速率，缺失时退回 r_frame_rate
    let fps = stream
      .avg_frame_rate
      .as_deref()
      .and_then(parse_frame_rate)
      .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

    Ok(StreamInfo { width, height, fps })
  }

  pub fn query(path: &Path) -> Result<Self, FfmpegInputError> {
    let output = Command::new(FFPROBE_PROGRAM)
      .args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_streams",
        "-of",
        "json",
      ])
      .arg(path)
      .stdin(Stdio::null())
      .output()
      .map_err(|source| FfmpegInputError::Spawn {
        program: FFPROBE_PROGRAM,
        source,
      })?;

    if !output.status.success() {
      return Err(FfmpegInputError::Ffprobe {
        path: path.to_path_buf(),
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    Self::from_ffprobe_json(path, &output.stdout)
  }
}

/// ffmpeg 视频输入
pub struct FfmpegInput {
  child: Child,
  reader: BufReader<ChildStdout>,
  info: StreamInfo,
  frame_index: u64,
  finished: bool,
}

impl Drop for FfmpegInput {
  fn drop(&mut self) {
    if let Err(e) = self.child.kill() {
      debug!("ffmpeg 进程已退出: {}", e);
    }
    if let Err(e) = self.child.wait() {
      warn!("无法回收 ffmpeg 进程: {}", e);
    }
  }
}

impl FfmpegInput {
  pub fn open(path: &Path) -> Result<Self, FfmpegInputError> {
    let info = StreamInfo::query(path)?;
    info!(
      "视频流信息: {}x{}, 帧率 {:?}",
      info.width, info.height, info.fps
    );

    let mut child = Command::new(FFMPEG_PROGRAM)
      .args(["-v", "error", "-nostdin", "-i"])
      .arg(path)
      .args([
        "-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-vsync", "0", "pipe:1",
      ])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .spawn()
      .map_err(|source| FfmpegInputError::Spawn {
        program: FFMPEG_PROGRAM,
        source,
      })?;

    let stdout = match child.stdout.take() {
      Some(stdout) => stdout,
      None => {
        let _ = child.kill();
        let _ = child.wait();
        return Err(FfmpegInputError::IoError(std::io::Error::other(
          "ffmpeg 标准输出不可用",
        )));
      }
    };

    Ok(FfmpegInput {
      child,
      reader: BufReader::new(stdout),
      info,
      frame_index: 0,
      finished: false,
    })
  }

  fn frame_len(&self) -> usize {
    self.info.width as usize * self.info.height as usize * 3
  }

  fn timestamp_ms(&self, index: u64) -> u64 {
    match self.info.fps {
      Some(fps) => (index as f64 * 1000.0 / fps) as u64,
      None => 0,
    }
  }

  fn read_frame(&mut self) -> Result<Option<Frame>, FfmpegInputError> {
    let mut data = vec![0u8; self.frame_len()];
    match self.reader.read_exact(&mut data) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
        let status = self.child.wait()?;
        if !status.success() {
          return Err(FfmpegInputError::Decode(status));
        }
        return Ok(None);
      }
      Err(e) => return Err(e.into()),
    }

    let image = RgbImage::from_raw(self.info.width, self.info.height, data).ok_or(
      FfmpegInputError::InvalidDimensions {
        width: self.info.width,
        height: self.info.height,
      },
    )?;

    let index = self.frame_index;
    self.frame_index += 1;
    Ok(Some(Frame {
      image,
      index,
      timestamp_ms: self.timestamp_ms(index),
    }))
  }
}

impl Iterator for FfmpegInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    match self.read_frame() {
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

impl VideoSource for FfmpegInput {
  fn width(&self) -> u32 {
    self.info.width
  }

  fn height(&self) -> u32 {
    self.info.height
  }

  fn fps(&self) -> Option<f64> {
    self.info.fps
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ffprobe_json_prefers_average_frame_rate() {
    let json = br#"{"streams":[{"width":640,"height":360,"avg_frame_rate":"24/1","r_frame_rate":"48/1"}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("a.mp4"), json).unwrap();
    assert_eq!(
      info,
      StreamInfo {
        width: 640,
        height: 360,
        fps: Some(24.0)
      }
    );
  }

  #[test]
  fn ffprobe_json_falls_back_to_real_frame_rate() {
    let json = br#"{"streams":[{"width":320,"height":240,"avg_frame_rate":"0/0","r_frame_rate":"30/1"}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("a.mkv"), json).unwrap();
    assert_eq!(info.fps, Some(30.0));
  }

  #[test]
  fn ffprobe_json_without_rate_reports_none() {
    let json = br#"{"streams":[{"width":320,"height":240,"avg_frame_rate":"0/0","r_frame_rate":"0/0"}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("a.mkv"), json).unwrap();
    assert_eq!(info.fps, None);
  }

  #[test]
  fn portrait_rotation_swaps_frame_size() {
    let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1","side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("phone.mp4"), json).unwrap();
    assert_eq!((info.width, info.height), (1080, 1920));

    let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1","tags":{"rotate":"270"}}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("old_phone.mp4"), json).unwrap();
    assert_eq!((info.width, info.height), (1080, 1920));
  }

  #[test]
  fn upside_down_rotation_keeps_frame_size() {
    let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1","side_data_list":[{"rotation":180}]}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("flipped.mp4"), json).unwrap();
    assert_eq!((info.width, info.height), (1920, 1080));

    let json = br#"{"streams":[{"width":640,"height":480,"avg_frame_rate":"30/1","tags":{"rotate":"0"},"side_data_list":[{"side_data_type":"Other"}]}]}"#;
    let info = StreamInfo::from_ffprobe_json(Path::new("plain.mp4"), json).unwrap();
    assert_eq!((info.width, info.height), (640, 480));
  }

  #[test]
  fn ffprobe_json_without_streams_is_an_error() {
    let err = StreamInfo::from_ffprobe_json(Path::new("audio.mp3"), br#"{"streams":[]}"#).unwrap_err();
    assert!(matches!(err, FfmpegInputError::NoVideoStream(_)));

    let err = StreamInfo::from_ffprobe_json(Path::new("audio.mp3"), br#"{}"#).unwrap_err();
    assert!(matches!(err, FfmpegInputError::NoVideoStream(_)));
  }

  #[test]
  fn ffprobe_json_with_zero_size_is_an_error() {
    let json = br#"{"streams":[{"width":0,"height":240,"avg_frame_rate":"30/1"}]}"#;
    let err = StreamInfo::from_ffprobe_json(Path::new("a.mp4"), json).unwrap_err();
    assert!(matches!(
      err,
      FfmpegInputError::InvalidDimensions {
        width: 0,
        height: 240
      }
    ));
  }
}
