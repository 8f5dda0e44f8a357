// 该文件是 Pareidolia 项目的一部分。
// src/dataset.rs - 正负样本目录加载
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

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::ImageSpec, input::read_image_file::load_image};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DatasetError {
  #[error("样本像素长度 {actual} 与图像规格要求的 {expected} 不一致")]
  PixelLength { expected: usize, actual: usize },
}

/// 二分类标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
  /// 目标不存在
  Negative = 0,
  /// 目标存在
  Positive = 1,
}

impl Label {
  pub fn index(self) -> usize {
    self as usize
  }

  pub fn one_hot(self, num_classes: usize) -> Vec<f32> {
    let mut encoded = vec![0.0; num_classes];
    if let Some(slot) = encoded.get_mut(self.index()) {
      *slot = 1.0;
    }
    encoded
  }
}

/// 一个训练样本，像素为 HWC 排列的 [0, 1] 浮点数
#[derive(Debug, Clone)]
pub struct Example {
  pub pixels: Vec<f32>,
  pub label: Label,
  pub source: PathBuf,
}

/// 被跳过的文件及原因
#[derive(Debug, Clone)]
pub struct SkippedFile {
  pub path: PathBuf,
  pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Dataset {
  image: ImageSpec,
  examples: Vec<Example>,
  skipped: Vec<SkippedFile>,
}

impl Dataset {
  pub fn new(image: ImageSpec) -> Self {
    Dataset {
      image,
      examples: Vec::new(),
      skipped: Vec::new(),
    }
  }

  pub fn image(&self) -> ImageSpec {
    self.image
  }

  pub fn len(&self) -> usize {
    self.examples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.examples.is_empty()
  }

  pub fn examples(&self) -> &[Example] {
    &self.examples
  }

  pub fn skipped(&self) -> &[SkippedFile] {
    &self.skipped
  }

  pub fn positives(&self) -> usize {
    self.count(Label::Positive)
  }

  pub fn negatives(&self) -> usize {
    self.count(Label::Negative)
  }

  fn count(&self, label: Label) -> usize {
    self.examples.iter().filter(|e| e.label == label).count()
  }

  /// 所有标签的 one-hot 编码，顺序与样本一致
  pub fn labels_one_hot(&self, num_classes: usize) -> Vec<Vec<f32>> {
    self
      .examples
      .iter()
      .map(|e| e.label.one_hot(num_classes))
      .collect()
  }

  /// 添加一个样本，像素长度必须与图像规格一致
  pub fn push(&mut self, example: Example) -> Result<(), DatasetError> {
    let expected = self.image.pixel_len();
    if example.pixels.len() != expected {
      return Err(DatasetError::PixelLength {
        expected,
        actual: example.pixels.len(),
      });
    }
    self.examples.push(example);
    Ok(())
  }

  /// 用固定种子打乱一次后，将末尾 `floor(n * fraction)` 个样本划为验证集
  ///
  /// 返回 `(训练集, 验证集)`。
  pub fn split_validation(&self, fraction: f64, seed: u64) -> (Vec<&Example>, Vec<&Example>) {
    let mut order: Vec<&Example> = self.examples.iter().collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let fraction = fraction.clamp(0.0, 1.0);
    let held_out = (order.len() as f64 * fraction).floor() as usize;
    let validation = order.split_off(order.len() - held_out);
    (order, validation)
  }
}

/// 扩展名（不区分大小写）是否为 jpg/jpeg/png
pub fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
    .unwrap_or(false)
}

/// 从正、负样本目录构建数据集
pub struct DatasetLoader {
  image: ImageSpec,
}

impl DatasetLoader {
  pub fn new(image: ImageSpec) -> Self {
    DatasetLoader { image }
  }

  /// 先加载负样本（标签 0），再加载正样本（标签 1）
  ///
  /// 不存在的目录不贡献样本；无法解码的文件被跳过并记录在 [`Dataset::skipped`] 中。
  pub fn load(&self, positives: &Path, negatives: &Path) -> Dataset {
    let mut dataset = Dataset::new(self.image);
    self.load_directory(&mut dataset, negatives, Label::Negative);
    self.load_directory(&mut dataset, positives, Label::Positive);

    info!(
      "加载完成: {} 个正样本, {} 个负样本, 跳过 {} 个文件",
      dataset.positives(),
      dataset.negatives(),
      dataset.skipped.len()
    );
    dataset
  }

  fn load_directory(&self, dataset: &mut Dataset, directory: &Path, label: Label) {
    let mut files = match image_files(directory) {
      Ok(files) => files,
      Err(e) => {
        warn!("无法读取目录 {}: {}", directory.display(), e);
        return;
      }
    };
    files.sort();

    for path in files {
      match load_image(&path, self.image) {
        Ok(pixels) => {
          debug!("加载图像 {} ({:?})", path.display(), label);
          let example = Example {
            pixels,
            label,
            source: path.clone(),
          };
          if let Err(e) = dataset.push(example) {
            warn!("跳过图像 {}: {}", path.display(), e);
            dataset.skipped.push(SkippedFile {
              path,
              reason: e.to_string(),
            });
          }
        }
        Err(e) => {
          warn!("跳过无法解码的图像 {}: {}", path.display(), e);
          dataset.skipped.push(SkippedFile {
            path,
            reason: e.to_string(),
          });
        }
      }
    }
  }
}

fn image_files(directory: &Path) -> std::io::Result<Vec<PathBuf>> {
  if !directory.exists() {
    return Ok(Vec::new());
  }

  let mut files = Vec::new();
  for entry in std::fs::read_dir(directory)? {
    let path = entry?.path();
    if path.is_file() && has_image_extension(&path) {
      files.push(path);
    }
  }
  Ok(files)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  struct Scratch(PathBuf);

  impl Scratch {
    fn new() -> Self {
      let dir = std::env::temp_dir().join(format!("pareidolia_dataset_{}", rand::random::<u64>()));
      std::fs::create_dir_all(&dir).unwrap();
      Scratch(dir)
    }

    fn dir(&self, name: &str) -> PathBuf {
      let dir = self.0.join(name);
      std::fs::create_dir_all(&dir).unwrap();
      dir
    }
  }

  impl Drop for Scratch {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn write_image(dir: &Path, name: &str, color: [u8; 3]) {
    RgbImage::from_pixel(12, 9, Rgb(color))
      .save(dir.join(name))
      .unwrap();
  }

  #[test]
  fn extension_filter_is_case_insensitive() {
    assert!(has_image_extension(Path::new("a.jpg")));
    assert!(has_image_extension(Path::new("a.JPEG")));
    assert!(has_image_extension(Path::new("dir/b.Png")));
    assert!(!has_image_extension(Path::new("c.gif")));
    assert!(!has_image_extension(Path::new("notes.txt")));
    assert!(!has_image_extension(Path::new("jpg")));
  }

  #[test]
  fn one_hot_places_single_one() {
    assert_eq!(Label::Negative.one_hot(2), vec![1.0, 0.0]);
    assert_eq!(Label::Positive.one_hot(2), vec![0.0, 1.0]);
  }

  #[test]
  fn counts_and_labels_match_directories() {
    let scratch = Scratch::new();
    let positives = scratch.dir("positives");
    let negatives = scratch.dir("negatives");

    write_image(&positives, "p1.png", [255, 0, 0]);
    write_image(&positives, "p2.JPG", [250, 5, 0]);
    write_image(&positives, "p3.jpeg", [240, 0, 10]);
    std::fs::write(positives.join("broken.png"), b"not an image").unwrap();
    std::fs::write(positives.join("readme.txt"), b"ignored").unwrap();

    write_image(&negatives, "n1.png", [0, 0, 255]);
    write_image(&negatives, "n2.jpg", [0, 10, 250]);
    std::fs::write(negatives.join("truncated.jpg"), [0xFF, 0xD8, 0xFF]).unwrap();

    let dataset = DatasetLoader::new(ImageSpec::square(8)).load(&positives, &negatives);

    assert_eq!(dataset.len(), 5);
    assert_eq!(dataset.positives(), 3);
    assert_eq!(dataset.negatives(), 2);
    assert_eq!(dataset.skipped().len(), 2);

    let labels = dataset.labels_one_hot(2);
    for (example, label) in dataset.examples().iter().zip(&labels) {
      match example.label {
        Label::Positive => assert_eq!(label[1], 1.0),
        Label::Negative => assert_eq!(label[0], 1.0),
      }
      assert_eq!(example.pixels.len(), 8 * 8 * 3);
      assert!(example.pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }
  }

  #[test]
  fn missing_directories_yield_empty_dataset() {
    let scratch = Scratch::new();
    let dataset = DatasetLoader::new(ImageSpec::square(8))
      .load(&scratch.0.join("nope-pos"), &scratch.0.join("nope-neg"));
    assert!(dataset.is_empty());
    assert!(dataset.skipped().is_empty());
  }

  #[test]
  fn empty_directories_yield_empty_dataset() {
    let scratch = Scratch::new();
    let dataset = DatasetLoader::new(ImageSpec::square(8))
      .load(&scratch.dir("pos"), &scratch.dir("neg"));
    assert!(dataset.is_empty());
  }

  #[test]
  fn validation_split_holds_out_floor_of_fraction() {
    let spec = ImageSpec::square(2);
    let mut dataset = Dataset::new(spec);
    for i in 0..11 {
      dataset.push(Example {
        pixels: vec![0.0; spec.pixel_len()],
        label: if i % 2 == 0 {
          Label::Positive
        } else {
          Label::Negative
        },
        source: PathBuf::from(format!("{i}.png")),
      }).unwrap();
    }

    let (train, validation) = dataset.split_validation(0.2, 7);
    assert_eq!(train.len(), 9);
    assert_eq!(validation.len(), 2);

    let (train_again, validation_again) = dataset.split_validation(0.2, 7);
    let sources = |set: &[&Example]| set.iter().map(|e| e.source.clone()).collect::<Vec<_>>();
    assert_eq!(sources(&train), sources(&train_again));
    assert_eq!(sources(&validation), sources(&validation_again));
  }

  #[test]
  fn push_rejects_wrong_pixel_length() {
    let mut dataset = Dataset::new(ImageSpec::square(2));
    let err = dataset
      .push(Example {
        pixels: vec![0.0; 5],
        label: Label::Negative,
        source: PathBuf::from("short.png"),
      })
      .unwrap_err();
    assert_eq!(
      err,
      DatasetError::PixelLength {
        expected: 12,
        actual: 5
      }
    );
    assert!(dataset.is_empty());
  }

  #[test]
  fn single_example_has_no_validation_set() {
    let spec = ImageSpec::square(2);
    let mut dataset = Dataset::new(spec);
    dataset.push(Example {
      pixels: vec![0.5; spec.pixel_len()],
      label: Label::Positive,
      source: PathBuf::from("only.png"),
    }).unwrap();
    let (train, validation) = dataset.split_validation(0.2, 1);
    assert_eq!(train.len(), 1);
    assert!(validation.is_empty());
  }
}
