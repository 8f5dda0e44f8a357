// 该文件是 Pareidolia 项目的一部分。
// src/bin/train_model.rs - 分类模型训练工具
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::process::ExitCode;

use anyhow::Result;

use pareidolia::{cli::train_model, config::TrainConfig, utils::init_tracing};

fn main() -> Result<ExitCode> {
  init_tracing();

  let mut stdout = std::io::stdout().lock();
  let code = train_model(std::env::args_os(), TrainConfig::default(), &mut stdout)?;
  Ok(ExitCode::from(code))
}
