// 该文件是 Pareidolia 项目的一部分。
// src/input/read_image_file.rs - 图像文件读取与预处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use image::{DynamicImage, ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::config::ImageSpec;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error(transparent)]
  IoError(#[from] std::io::Error),
  #[error(transparent)]
  ImageLoadError(#[from] image::ImageError),
}

/// 读取并解码图像文件
///
/// 格式按文件内容判断，扩展名与内容不符的文件同样可以读取。
pub fn read_image(path: &Path) -> Result<DynamicImage, ImageFileInputError> {
  let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
  Ok(image)
}

/// 读取图像文件并完成训练所需的预处理
pub fn load_image(path: &Path, spec: ImageSpec) -> Result<Vec<f32>, ImageFileInputError> {
  let image = read_image(path)?;
  Ok(preprocess_image(&image, spec))
}

/// 缩放到目标尺寸（双线性插值）
pub fn resize_rgb(image: &RgbImage, spec: ImageSpec) -> RgbImage {
  if image.dimensions() == (spec.width, spec.height) {
    return image.clone();
  }
  image::imageops::resize(image, spec.width, spec.height, FilterType::Triangle)
}

/// 转为 RGB、缩放并归一化到 [0, 1]，输出 HWC 排列
pub fn preprocess_image(image: &DynamicImage, spec: ImageSpec) -> Vec<f32> {
  preprocess_rgb(&image.to_rgb8(), spec)
}

pub fn preprocess_rgb(image: &RgbImage, spec: ImageSpec) -> Vec<f32> {
  resize_rgb(image, spec)
    .into_raw()
    .into_iter()
    .map(|value| value as f32 / 255.0)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn scratch_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("pareidolia_read_{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  #[test]
  fn preprocess_resizes_and_normalizes() {
    let image = RgbImage::from_pixel(64, 48, Rgb([255, 0, 51]));
    let spec = ImageSpec::square(32);
    let pixels = preprocess_rgb(&image, spec);

    assert_eq!(pixels.len(), spec.pixel_len());
    for rgb in pixels.chunks_exact(3) {
      assert!((rgb[0] - 1.0).abs() < 1e-6);
      assert!(rgb[1].abs() < 1e-6);
      assert!((rgb[2] - 0.2).abs() < 1e-6);
    }
  }

  #[test]
  fn channel_order_is_rgb() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([10, 20, 30]));
    image.put_pixel(1, 0, Rgb([40, 50, 60]));
    let spec = ImageSpec {
      width: 2,
      height: 1,
    };

    let pixels = preprocess_rgb(&image, spec);
    let expected: Vec<f32> = [10, 20, 30, 40, 50, 60]
      .iter()
      .map(|v| *v as f32 / 255.0)
      .collect();
    assert_eq!(pixels, expected);
  }

  #[test]
  fn load_image_reads_from_disk() {
    let dir = scratch_dir();
    let path = dir.join("sample.png");
    RgbImage::from_pixel(10, 10, Rgb([0, 255, 0])).save(&path).unwrap();

    let pixels = load_image(&path, ImageSpec::square(4)).unwrap();
    assert_eq!(pixels.len(), 4 * 4 * 3);
    assert!((pixels[1] - 1.0).abs() < 1e-6);

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn undecodable_file_is_an_error() {
    let dir = scratch_dir();
    let path = dir.join("broken.jpg");
    std::fs::write(&path, b"definitely not a jpeg").unwrap();

    assert!(load_image(&path, ImageSpec::square(4)).is_err());

    std::fs::remove_dir_all(dir).unwrap();
  }
}
