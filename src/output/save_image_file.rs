// 该文件是 Pareidolia 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use thiserror::Error;
use tracing::debug;

use crate::{input::Frame, output::Render};

/// 按视频名与原始帧序号生成文件名，如 `clip_frame_12.jpg`
pub fn frame_file_name(stem: &str, index: u64) -> String {
  format!("{}_frame_{}.jpg", stem, index)
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error(transparent)]
  IoError(#[from] std::io::Error),
  #[error("无法写入图像 {path}")]
  ImageError {
    path: PathBuf,
    source: image::ImageError,
  },
}

/// 将帧保存为目录下的 JPEG 文件
pub struct SaveImageFileOutput {
  directory: PathBuf,
  stem: String,
}

impl SaveImageFileOutput {
  /// 创建输出，目录不存在时自动创建
  pub fn new(directory: &Path, stem: &str) -> Result<Self, SaveImageFileError> {
    std::fs::create_dir_all(directory)?;
    Ok(SaveImageFileOutput {
      directory: directory.to_path_buf(),
      stem: stem.to_string(),
    })
  }

  pub fn frame_path(&self, index: u64) -> PathBuf {
    self.directory.join(frame_file_name(&self.stem, index))
  }
}

impl Render<Frame> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_frame(&mut self, frame: &Frame) -> Result<PathBuf, Self::Error> {
    let path = self.frame_path(frame.index);
    frame
      .image
      .save(&path)
      .map_err(|source| SaveImageFileError::ImageError {
        path: path.clone(),
        source,
      })?;

    debug!("保存图像到文件: {}", path.display());
    Ok(path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  #[test]
  fn file_name_encodes_stem_and_index() {
    assert_eq!(frame_file_name("clip", 0), "clip_frame_0.jpg");
    assert_eq!(frame_file_name("my.video", 120), "my.video_frame_120.jpg");
  }

  #[test]
  fn writes_decodable_jpeg_into_created_directory() {
    let root = std::env::temp_dir().join(format!("pareidolia_save_{}", rand::random::<u64>()));
    let directory = root.join("nested").join("frames");

    let mut output = SaveImageFileOutput::new(&directory, "clip").unwrap();
    let frame = Frame {
      image: RgbImage::from_pixel(8, 6, Rgb([200, 10, 10])),
      index: 42,
      timestamp_ms: 1400,
    };
    let path = output.render_frame(&frame).unwrap();

    assert_eq!(path, directory.join("clip_frame_42.jpg"));
    let decoded = image::open(&path).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (8, 6));

    std::fs::remove_dir_all(root).unwrap();
  }
}
