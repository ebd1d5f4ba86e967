// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/utils.rs - 通用工具函数
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

use std::path::PathBuf;

use url::Url;

/// 将 URL 的路径部分解码为本地路径（处理 `%20` 等转义字符）
pub fn url_to_path(url: &Url) -> PathBuf {
  let raw = url.path();
  match urlencoding::decode(raw) {
    Ok(decoded) => PathBuf::from(decoded.into_owned()),
    Err(_) => PathBuf::from(raw),
  }
}

/// 卡名/别名的归一化键：小写并去除首尾空白
pub fn normalize_name(name: &str) -> String {
  name.trim().to_lowercase()
}

/// 只保留字母数字字符，用于生成安全的文件名
pub fn safe_file_stem(name: &str) -> String {
  let stem: String = name.chars().filter(|c| c.is_alphanumeric()).collect();
  if stem.is_empty() {
    "card".to_string()
  } else {
    stem
  }
}

/// 从 `YYYY-MM-DD` 形式的日期中取年份
pub fn release_year(date: &str) -> Option<i32> {
  date.split('-').next()?.trim().parse().ok()
}
