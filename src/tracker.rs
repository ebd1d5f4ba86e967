// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/tracker.rs - 质心多目标跟踪器
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

//! 质心跟踪器
//!
//! 每帧输入一组候选框，按质心欧氏距离把它们关联到已有目标上，
//! 为每张卡片维护一个在整个会话内稳定且不复用的 [`TrackId`]。
//!
//! 关联采用贪心最近邻而不是最优二分匹配：每个已有目标先取离它最近的输入，
//! 再按这个最近距离从小到大依次确认，行或列已被占用的配对直接跳过，
//! 距离超过 `max_distance` 的配对也跳过。结果依赖处理顺序，复杂度 O(n·m)，
//! 适合每帧只有少量卡片的场景。距离相同时按目标注册顺序处理。
//!
//! 跟踪器只允许单个写者（帧处理循环）修改，不做内部同步。

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{Point, Rect};

const MAX_DISAPPEARED_FRAMES: usize = 10;
const MAX_TRACKING_DISTANCE: f32 = 150.0;
const HISTORY_LEN: usize = 10;

/// 跟踪目标标识，单调递增分配。收藏记录以它为键持久化，
/// 新会话应从 [`CardStore::next_track_id`](crate::store::CardStore::next_track_id) 开始分配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "T{:05}", self.0)
  }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
  /// 连续丢失超过该帧数后注销目标
  pub max_disappeared: usize,
  /// 质心移动超过该距离（像素）不再视为同一目标
  pub max_distance: f32,
  /// 轨迹历史最多保留的点数
  pub history_len: usize,
  /// 第一个注册目标的标识
  pub first_id: TrackId,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      max_disappeared: MAX_DISAPPEARED_FRAMES,
      max_distance: MAX_TRACKING_DISTANCE,
      history_len: HISTORY_LEN,
      first_id: TrackId(0),
    }
  }
}

impl TrackerConfig {
  pub fn with_max_disappeared(mut self, max_disappeared: usize) -> Self {
    self.max_disappeared = max_disappeared;
    self
  }

  pub fn with_max_distance(mut self, max_distance: f32) -> Self {
    self.max_distance = max_distance;
    self
  }

  pub fn with_history_len(mut self, history_len: usize) -> Self {
    self.history_len = history_len.max(1);
    self
  }

  pub fn with_first_id(mut self, first_id: TrackId) -> Self {
    self.first_id = first_id;
    self
  }
}

#[derive(Debug, Clone)]
pub struct TrackedObject {
  pub id: TrackId,
  pub centroid: Point,
  pub bbox: Rect,
  pub frames_since_seen: usize,
  history: VecDeque<Point>,
}

impl TrackedObject {
  /// 最近的质心轨迹，最旧的在前
  pub fn history(&self) -> impl Iterator<Item = &Point> {
    self.history.iter()
  }

  pub fn history_len(&self) -> usize {
    self.history.len()
  }
}

pub struct CentroidTracker {
  config: TrackerConfig,
  next_id: u64,
  // TrackId 单调分配，BTreeMap 的迭代顺序即注册顺序
  objects: BTreeMap<TrackId, TrackedObject>,
  deregistered: Vec<TrackId>,
}

impl Default for CentroidTracker {
  fn default() -> Self {
    Self::new(TrackerConfig::default())
  }
}

impl CentroidTracker {
  pub fn new(config: TrackerConfig) -> Self {
    Self {
      next_id: config.first_id.0,
      config,
      objects: BTreeMap::new(),
      deregistered: Vec::new(),
    }
  }

  pub fn config(&self) -> &TrackerConfig {
    &self.config
  }

  pub fn objects(&self) -> &BTreeMap<TrackId, TrackedObject> {
    &self.objects
  }

  pub fn get(&self, id: TrackId) -> Option<&TrackedObject> {
    self.objects.get(&id)
  }

  pub fn len(&self) -> usize {
    self.objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }

  /// 取出自上次调用以来被注销的目标
  pub fn drain_deregistered(&mut self) -> Vec<TrackId> {
    std::mem::take(&mut self.deregistered)
  }

  fn register(&mut self, bbox: Rect) -> TrackId {
    let id = TrackId(self.next_id);
    self.next_id += 1;
    let centroid = bbox.centroid();
    let mut history = VecDeque::with_capacity(self.config.history_len);
    history.push_back(centroid);
    self.objects.insert(
      id,
      TrackedObject {
        id,
        centroid,
        bbox,
        frames_since_seen: 0,
        history,
      },
    );
    debug!("注册目标 {}", id);
    id
  }

  fn deregister(&mut self, id: TrackId) {
    if self.objects.remove(&id).is_some() {
      debug!("注销目标 {}", id);
      self.deregistered.push(id);
    }
  }

  fn mark_missing(&mut self, id: TrackId) {
    let expired = match self.objects.get_mut(&id) {
      Some(object) => {
        object.frames_since_seen += 1;
        object.frames_since_seen > self.config.max_disappeared
      }
      None => false,
    };
    if expired {
      self.deregister(id);
    }
  }

  fn observe(&mut self, id: TrackId, bbox: Rect, centroid: Point) {
    let history_len = self.config.history_len;
    if let Some(object) = self.objects.get_mut(&id) {
      object.centroid = centroid;
      object.bbox = bbox;
      object.frames_since_seen = 0;
      object.history.push_back(centroid);
      while object.history.len() > history_len {
        object.history.pop_front();
      }
    }
  }

  /// 用本帧的候选框更新跟踪状态，返回更新后的全部存活目标
  pub fn update(&mut self, boxes: &[Rect]) -> &BTreeMap<TrackId, TrackedObject> {
    if boxes.is_empty() {
      let ids: Vec<TrackId> = self.objects.keys().copied().collect();
      for id in ids {
        self.mark_missing(id);
      }
      return &self.objects;
    }

    let input_centroids: Vec<Point> = boxes.iter().map(Rect::centroid).collect();

    if self.objects.is_empty() {
      for bbox in boxes {
        self.register(*bbox);
      }
      return &self.objects;
    }

    let object_ids: Vec<TrackId> = self.objects.keys().copied().collect();
    let distances: Vec<Vec<f32>> = self
      .objects
      .values()
      .map(|object| {
        input_centroids
          .iter()
          .map(|c| object.centroid.distance(c))
          .collect()
      })
      .collect();

    // 每个已有目标的最近输入，按最近距离升序处理
    let mut best: Vec<(usize, usize, f32)> = distances
      .iter()
      .enumerate()
      .filter_map(|(row, dists)| {
        dists
          .iter()
          .enumerate()
          .min_by(|a, b| a.1.total_cmp(b.1))
          .map(|(col, d)| (row, col, *d))
      })
      .collect();
    best.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut used_rows = vec![false; object_ids.len()];
    let mut used_cols = vec![false; boxes.len()];
    for (row, col, distance) in best {
      if used_rows[row] || used_cols[col] {
        continue;
      }
      if distance > self.config.max_distance {
        continue;
      }
      self.observe(object_ids[row], boxes[col], input_centroids[col]);
      used_rows[row] = true;
      used_cols[col] = true;
    }

    for (row, id) in object_ids.iter().enumerate() {
      if !used_rows[row] {
        self.mark_missing(*id);
      }
    }

    for (col, bbox) in boxes.iter().enumerate() {
      if !used_cols[col] {
        self.register(*bbox);
      }
    }

    &self.objects
  }
}
