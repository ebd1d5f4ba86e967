// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/filter.rs - 检测框后处理：边缘/尺寸规则、NMS 与包含关系过滤
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

use tracing::debug;

use crate::model::{DetectItem, DetectResult};

const EDGE_MARGIN: f32 = 50.0;
const MIN_BOX_WIDTH: f32 = 50.0;
const MIN_BOX_HEIGHT: f32 = 70.0;
const NMS_IOU_THRESHOLD: f32 = 0.45;
const CONTAINMENT_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone)]
pub struct FilterConfig {
  /// 距画面边缘小于该距离的框视为不完整拍摄
  pub edge_margin: f32,
  pub min_width: f32,
  pub min_height: f32,
  pub iou_threshold: f32,
  /// 小框与大框的交集超过小框面积的该比例时丢弃小框
  pub containment_threshold: f32,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self {
      edge_margin: EDGE_MARGIN,
      min_width: MIN_BOX_WIDTH,
      min_height: MIN_BOX_HEIGHT,
      iou_threshold: NMS_IOU_THRESHOLD,
      containment_threshold: CONTAINMENT_THRESHOLD,
    }
  }
}

impl FilterConfig {
  pub fn with_edge_margin(mut self, edge_margin: f32) -> Self {
    self.edge_margin = edge_margin;
    self
  }

  pub fn with_min_size(mut self, min_width: f32, min_height: f32) -> Self {
    self.min_width = min_width;
    self.min_height = min_height;
    self
  }

  pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn with_containment_threshold(mut self, containment_threshold: f32) -> Self {
    self.containment_threshold = containment_threshold;
    self
  }
}

/// 把检测器的原始输出整理成干净的候选框集合。无状态，同样输入总是得到同样输出。
#[derive(Debug, Clone, Default)]
pub struct DetectionFilter {
  config: FilterConfig,
}

impl DetectionFilter {
  pub fn new(config: FilterConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &FilterConfig {
    &self.config
  }

  pub fn apply(&self, result: &DetectResult, frame_width: u32, frame_height: u32) -> DetectResult {
    let candidates: Vec<DetectItem> = result
      .items
      .iter()
      .filter(|item| self.is_complete(item, frame_width as f32, frame_height as f32))
      .cloned()
      .collect();
    let rule_kept = candidates.len();

    let survivors = self.nms(candidates);
    let nms_kept = survivors.len();

    let output = self.remove_contained(survivors);
    debug!(
      "检测框过滤: 原始 {} -> 规则 {} -> NMS {} -> 包含过滤 {}",
      result.len(),
      rule_kept,
      nms_kept,
      output.len()
    );

    DetectResult::from(output)
  }

  // 规则 1：边缘缓冲；规则 2：最小尺寸
  fn is_complete(&self, item: &DetectItem, width: f32, height: f32) -> bool {
    let margin = self.config.edge_margin;
    let bbox = &item.bbox;
    if bbox.x1 < margin || bbox.y1 < margin || bbox.x2 > width - margin || bbox.y2 > height - margin {
      return false;
    }
    bbox.width() >= self.config.min_width && bbox.height() >= self.config.min_height
  }

  /// 非极大值抑制，不区分类别
  fn nms(&self, mut detections: Vec<DetectItem>) -> Vec<DetectItem> {
    // 稳定排序：置信度相同则保持输入顺序
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut suppressed = vec![false; detections.len()];
    let mut result = Vec::new();
    for i in 0..detections.len() {
      if suppressed[i] {
        continue;
      }
      for j in (i + 1)..detections.len() {
        if !suppressed[j] && detections[i].bbox.iou(&detections[j].bbox) > self.config.iou_threshold {
          suppressed[j] = true;
        }
      }
      result.push(detections[i].clone());
    }
    result
  }

  fn remove_contained(&self, survivors: Vec<DetectItem>) -> Vec<DetectItem> {
    let threshold = self.config.containment_threshold;
    let keep: Vec<bool> = survivors
      .iter()
      .map(|small| {
        !survivors.iter().any(|large| {
          small.bbox.area() < large.bbox.area()
            && small.bbox.contained_fraction(&large.bbox) > threshold
        })
      })
      .collect();

    survivors
      .into_iter()
      .zip(keep)
      .filter_map(|(item, keep)| keep.then_some(item))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::Rect;

  fn item(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> DetectItem {
    DetectItem {
      class_id: 73,
      score,
      bbox: Rect::new(x1, y1, x2, y2),
    }
  }

  fn run(items: Vec<DetectItem>) -> Vec<DetectItem> {
    DetectionFilter::default()
      .apply(&DetectResult::from(items), 1000, 1000)
      .items
      .into_vec()
  }

  #[test]
  fn contained_box_is_removed() {
    let outer = item(100.0, 100.0, 400.0, 500.0, 0.6);
    let inner = item(150.0, 150.0, 300.0, 350.0, 0.9);
    let out = run(vec![inner, outer.clone()]);
    assert_eq!(out, vec![outer]);
  }

  #[test]
  fn disjoint_boxes_are_kept() {
    let a = item(100.0, 100.0, 300.0, 400.0, 0.5);
    let b = item(500.0, 100.0, 700.0, 400.0, 0.7);
    let out = run(vec![a.clone(), b.clone()]);
    assert_eq!(out, vec![b, a]);
  }

  #[test]
  fn edge_margin_wins_over_confidence() {
    let touching = item(10.0, 100.0, 300.0, 400.0, 0.99);
    let right_edge = item(700.0, 100.0, 990.0, 400.0, 0.99);
    assert!(run(vec![touching, right_edge]).is_empty());
  }

  #[test]
  fn small_boxes_are_dropped() {
    let narrow = item(100.0, 100.0, 140.0, 400.0, 0.9);
    let short = item(300.0, 100.0, 500.0, 160.0, 0.9);
    assert!(run(vec![narrow, short]).is_empty());
  }

  #[test]
  fn nms_keeps_most_confident() {
    let a = item(100.0, 100.0, 300.0, 400.0, 0.4);
    let b = item(105.0, 100.0, 305.0, 400.0, 0.8);
    assert_eq!(run(vec![a, b.clone()]), vec![b]);
  }

  #[test]
  fn nms_ties_keep_input_order() {
    let a = item(100.0, 100.0, 300.0, 400.0, 0.5);
    let b = item(102.0, 100.0, 302.0, 400.0, 0.5);
    assert_eq!(run(vec![a.clone(), b]), vec![a]);
  }

  #[test]
  fn partial_overlap_below_threshold_survives() {
    // 小框只有一半落在大框内
    let large = item(100.0, 100.0, 500.0, 600.0, 0.9);
    let small = item(400.0, 200.0, 600.0, 400.0, 0.9);
    assert_eq!(run(vec![large, small]).len(), 2);
  }
}
