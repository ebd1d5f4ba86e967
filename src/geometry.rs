// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/geometry.rs - 边界框与点
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

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

impl Point {
  pub fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }

  pub fn distance(&self, other: &Point) -> f32 {
    ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
  }
}

/// 像素坐标下的轴对齐边界框 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl Rect {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn width(&self) -> f32 {
    (self.x2 - self.x1).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y2 - self.y1).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn centroid(&self) -> Point {
    Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
  }

  pub fn intersection_area(&self, other: &Rect) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);
    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  pub fn iou(&self, other: &Rect) -> f32 {
    let intersection = self.intersection_area(other);
    let union = self.area() + other.area() - intersection;
    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  /// 本框落在 `other` 内部的面积占本框面积的比例
  pub fn contained_fraction(&self, other: &Rect) -> f32 {
    let area = self.area();
    if area <= 0.0 {
      return 0.0;
    }
    self.intersection_area(other) / area
  }

  /// 向外扩展 `pad` 像素并裁剪到 `width` x `height` 的图像范围内，
  /// 返回整数像素区域 (x, y, w, h)
  pub fn padded_region(&self, pad: f32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x1 = (self.x1 - pad).floor().clamp(0.0, width as f32) as u32;
    let y1 = (self.y1 - pad).floor().clamp(0.0, height as f32) as u32;
    let x2 = (self.x2 + pad).ceil().clamp(0.0, width as f32) as u32;
    let y2 = (self.y2 + pad).ceil().clamp(0.0, height as f32) as u32;
    (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
  }
}
