// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/model.rs - 外部模型接口（检测器与文字识别）
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

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::{geometry::Rect, input::Frame};

/// 原始检测器：每帧输出一组轴对齐边界框
pub trait Detector {
  type Error;

  fn detect(&self, frame: &Frame) -> Result<DetectResult, Self::Error>;
}

/// 文字识别服务：给定卡面标题区域，返回 (文本, 置信度)，置信度范围 [0, 1]
pub trait TextRecognizer {
  fn read(&self, image: &RgbImage) -> (String, f32);
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for &T {
  fn read(&self, image: &RgbImage) -> (String, f32) {
    (**self).read(image)
  }
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for Box<T> {
  fn read(&self, image: &RgbImage) -> (String, f32) {
    (**self).read(image)
  }
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for std::sync::Arc<T> {
  fn read(&self, image: &RgbImage) -> (String, f32) {
    (**self).read(image)
  }
}

/// 没有接入识别引擎时使用，总是读不出文字
#[derive(Debug, Clone, Copy, Default)]
pub struct BlankRecognizer;

impl TextRecognizer for BlankRecognizer {
  fn read(&self, _image: &RgbImage) -> (String, f32) {
    (String::new(), 0.0)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: Rect,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

mod replay;
pub use self::replay::{ReplayDetector, ReplayDetectorError};
