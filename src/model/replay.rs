// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/model/replay.rs - 回放已记录的检测结果
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

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::Frame,
  model::{DetectItem, DetectResult, Detector},
  utils::url_to_path,
};

#[derive(Error, Debug)]
pub enum ReplayDetectorError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
}

#[derive(Deserialize)]
struct ReplayLine {
  frame: u64,
  items: Vec<DetectItem>,
}

/// 以 JSON Lines 记录的检测结果作为检测器，每行形如
/// `{"frame": 3, "items": [{"class_id": 73, "score": 0.8, "bbox": {"x1": ..}}]}`。
/// 没有记录的帧返回空结果。
pub struct ReplayDetector {
  frames: HashMap<u64, Vec<DetectItem>>,
}

impl FromUrlWithScheme for ReplayDetector {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayDetector {
  type Error = ReplayDetectorError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayDetectorError::SchemeMismatch);
    }
    let content = std::fs::read_to_string(url_to_path(url))?;
    let detector = Self::parse(&content)?;
    info!("加载检测记录: {} 帧", detector.frames.len());
    Ok(detector)
  }
}

impl ReplayDetector {
  pub fn parse(content: &str) -> Result<Self, ReplayDetectorError> {
    let mut frames: HashMap<u64, Vec<DetectItem>> = HashMap::new();
    for (idx, line) in content.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let parsed: ReplayLine = serde_json::from_str(line)
        .map_err(|source| ReplayDetectorError::ParseError {
          line: idx + 1,
          source,
        })?;
      frames.entry(parsed.frame).or_default().extend(parsed.items);
    }
    Ok(Self { frames })
  }
}

impl Detector for ReplayDetector {
  type Error = ReplayDetectorError;

  fn detect(&self, frame: &Frame) -> Result<DetectResult, Self::Error> {
    let items = self.frames.get(&frame.index).cloned().unwrap_or_default();
    debug!("第 {} 帧回放 {} 个检测框", frame.index, items.len());
    Ok(DetectResult::from(items))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;

  #[test]
  fn replays_recorded_frames() {
    let content = r#"
{"frame": 0, "items": [{"class_id": 73, "score": 0.9, "bbox": {"x1": 1.0, "y1": 2.0, "x2": 3.0, "y2": 4.0}}]}

{"frame": 2, "items": []}
"#;
    let detector = ReplayDetector::parse(content).unwrap();
    let frame = |index| Frame {
      image: RgbImage::new(4, 4),
      index,
      timestamp_ms: 0,
    };
    let first = detector.detect(&frame(0)).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first.items[0].class_id, 73);
    assert!(detector.detect(&frame(1)).unwrap().is_empty());
  }

  #[test]
  fn reports_bad_line_number() {
    let err = ReplayDetector::parse("{\"frame\": 0, \"items\": []}\nnot json").err();
    match err {
      Some(ReplayDetectorError::ParseError { line, .. }) => assert_eq!(line, 2),
      other => panic!("unexpected: {other:?}"),
    }
  }
}
