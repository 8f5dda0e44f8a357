// 该文件是 Pareidolia 项目的一部分。
// src/api.rs - 桌面端集成测试接口
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

//! 供宿主进程验证能否调用外部程序并解析其 JSON 输出。

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const RANDOM_COMMAND: &str = "random";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiResponse {
  Value {
    success: bool,
    value: u32,
    message: String,
  },
  Error {
    error: String,
  },
}

impl ApiResponse {
  pub fn to_json(&self) -> String {
    // 只含字符串、数字与布尔字段，序列化不会失败
    serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
  }
}

/// 返回 1 到 10（含）之间的随机整数
pub fn get_random_value() -> ApiResponse {
  let value = rand::rng().random_range(1..=10);
  ApiResponse::Value {
    success: true,
    value,
    message: format!("Integration works! Random value: {}", value),
  }
}

/// 执行命令，未提供命令时等同于 `random`
pub fn dispatch(command: Option<&str>) -> ApiResponse {
  match command {
    None | Some(RANDOM_COMMAND) => get_random_value(),
    Some(other) => ApiResponse::Error {
      error: format!("Unknown command: {}", other),
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;

  #[test]
  fn random_values_cover_one_to_ten() {
    let mut seen = [0usize; 11];
    for _ in 0..2000 {
      match dispatch(Some("random")) {
        ApiResponse::Value { success, value, .. } => {
          assert!(success);
          assert!((1..=10).contains(&value));
          seen[value as usize] += 1;
        }
        other => panic!("unexpected response: {other:?}"),
      }
    }
    assert_eq!(seen[0], 0);
    assert!(seen[1..].iter().all(|count| *count > 100));
  }

  #[test]
  fn json_has_success_value_and_message() {
    let json: Value = serde_json::from_str(&get_random_value().to_json()).unwrap();
    assert_eq!(json["success"], Value::Bool(true));
    let value = json["value"].as_u64().unwrap();
    assert!((1..=10).contains(&value));
    assert!(json["message"].as_str().unwrap().ends_with(&value.to_string()));
  }

  #[test]
  fn missing_command_defaults_to_random() {
    assert!(matches!(dispatch(None), ApiResponse::Value { .. }));
  }

  #[test]
  fn unknown_command_reports_error_field() {
    let response = dispatch(Some("train"));
    let json: Value = serde_json::from_str(&response.to_json()).unwrap();
    assert_eq!(json["error"], "Unknown command: train");
    assert!(json.get("success").is_none());
  }
}
