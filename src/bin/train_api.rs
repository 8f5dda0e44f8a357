// 该文件是 Pareidolia 项目的一部分。
// src/bin/train_api.rs - 集成测试接口
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use tracing::debug;

use pareidolia::{api::dispatch, utils::init_tracing};

/// 输出一行 JSON，供宿主进程验证调用链路
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 命令名，目前支持 `random`，缺省时同 `random`
  #[arg(value_name = "COMMAND")]
  pub command: Option<String>,
}

fn main() {
  init_tracing();

  let args = Args::parse();
  debug!("命令: {:?}", args.command);

  println!("{}", dispatch(args.command.as_deref()).to_json());
}
