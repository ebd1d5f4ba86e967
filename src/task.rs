// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/task.rs - 扫描主循环：检测、过滤、跟踪、采样、提交识别
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

use std::sync::mpsc::Sender;
use std::{thread, time::Duration};

use tracing::{debug, info, warn};

use crate::{
  filter::{DetectionFilter, FilterConfig},
  input::{Frame, FrameSource},
  model::Detector,
  pipeline::{Command, CommandSink, PipelineEvent, ResolveTask, emit},
  rectify::Rectifier,
  tracker::{CentroidTracker, TrackId, TrackerConfig},
};

const DETECT_EVERY: u64 = 5;
const SAMPLE_EVERY: u64 = 15;

pub trait Task<I, D, O>: Sized {
  type Error;
  fn run_task(self, input: I, detector: D, output: O) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
  /// 每隔多少帧调用一次检测器，其余帧沿用上次的跟踪状态
  pub detect_every: u64,
  /// 每隔多少帧对存活目标采样、校正并提交识别
  pub sample_every: u64,
  /// 处理到该帧数后退出
  pub frame_number: Option<usize>,
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self {
      detect_every: DETECT_EVERY,
      sample_every: SAMPLE_EVERY,
      frame_number: None,
    }
  }
}

impl ScanConfig {
  pub fn with_detect_every(mut self, detect_every: u64) -> Self {
    self.detect_every = detect_every.max(1);
    self
  }

  pub fn with_sample_every(mut self, sample_every: u64) -> Self {
    self.sample_every = sample_every.max(1);
    self
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

/// 帧处理循环。跟踪器只在这里被修改。
pub struct ScanTask {
  config: ScanConfig,
  filter: DetectionFilter,
  tracker: CentroidTracker,
  rectifier: Rectifier,
  events: Option<Sender<PipelineEvent>>,
  pretext: Option<String>,
  live: Vec<TrackId>,
  frame_count: u64,
}

impl Default for ScanTask {
  fn default() -> Self {
    Self::new(ScanConfig::default())
  }
}

impl ScanTask {
  pub fn new(config: ScanConfig) -> Self {
    Self {
      config,
      filter: DetectionFilter::new(FilterConfig::default()),
      tracker: CentroidTracker::default(),
      rectifier: Rectifier::default(),
      events: None,
      pretext: None,
      live: Vec::new(),
      frame_count: 0,
    }
  }

  pub fn with_filter(mut self, config: FilterConfig) -> Self {
    self.filter = DetectionFilter::new(config);
    self
  }

  pub fn with_tracker(mut self, config: TrackerConfig) -> Self {
    self.tracker = CentroidTracker::new(config);
    self
  }

  pub fn with_rectifier(mut self, rectifier: Rectifier) -> Self {
    self.rectifier = rectifier;
    self
  }

  pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
    self.events = Some(events);
    self
  }

  /// 已知卡名时直接随任务提交，识别阶段跳过文字识别
  pub fn with_pretext(mut self, pretext: Option<String>) -> Self {
    self.pretext = pretext;
    self
  }

  pub fn tracker(&self) -> &CentroidTracker {
    &self.tracker
  }

  /// 处理一帧，返回本帧提交的识别任务数
  pub fn step<D, O>(&mut self, frame: &Frame, detector: &D, output: &O) -> anyhow::Result<usize>
  where
    D: Detector,
    D::Error: std::fmt::Display,
    O: CommandSink,
  {
    let count = self.frame_count;
    self.frame_count += 1;

    if count % self.config.detect_every == 0 {
      match detector.detect(frame) {
        Ok(raw) => {
          let filtered = self.filter.apply(&raw, frame.width(), frame.height());
          debug!(
            "第 {} 帧检测 {} 个，过滤后 {} 个",
            frame.index,
            raw.len(),
            filtered.len()
          );
          let boxes: Vec<_> = filtered.items.iter().map(|item| item.bbox).collect();
          self.tracker.update(&boxes);
          for id in self.tracker.drain_deregistered() {
            output.send_command(Command::Forget(id))?;
          }
          self.publish_tracks();
        }
        Err(e) => warn!("第 {} 帧检测失败: {}", frame.index, e),
      }
    }

    if count % self.config.sample_every != 0 {
      return Ok(0);
    }
    let mut submitted = 0;
    // 本轮检测中没有出现的目标框已过时，不采样
    for object in self.tracker.objects().values() {
      if object.frames_since_seen > 0 {
        continue;
      }
      let card = self.rectifier.rectify(&frame.image, &object.bbox);
      output.send_command(Command::Resolve(ResolveTask {
        track_id: object.id,
        pretext: self.pretext.clone(),
        image: card.image,
      }))?;
      submitted += 1;
    }
    if submitted > 0 {
      debug!("第 {} 帧提交 {} 个识别任务", frame.index, submitted);
    }
    Ok(submitted)
  }

  fn publish_tracks(&mut self) {
    let live: Vec<TrackId> = self.tracker.objects().keys().copied().collect();
    if live == self.live {
      return;
    }
    info!("跟踪目标变化: {} 个", live.len());
    self.live = live.clone();
    if let Some(events) = &self.events {
      emit(events, PipelineEvent::TracksChanged(live));
    }
  }
}

impl<I, D, O> Task<I, D, O> for ScanTask
where
  I: FrameSource,
  D: Detector,
  D::Error: std::fmt::Display,
  O: CommandSink,
{
  type Error = anyhow::Error;

  fn run_task(mut self, input: I, detector: D, output: O) -> Result<(), Self::Error> {
    info!("开始扫描...");
    let (tx, rx) = std::sync::mpsc::channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let mut frame_index = 0;
    let mut now = std::time::Instant::now();
    for frame in input {
      frame_index += 1;
      let submitted = self.step(&frame, &detector, &output)?;
      debug!(
        "第 {} 帧处理完成，耗时: {:.2?}，提交 {}",
        frame.index,
        now.elapsed(),
        submitted
      );
      now = std::time::Instant::now();
      if self.config.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出扫描循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出扫描循环");
        break;
      }
    }

    info!("扫描完成，共 {} 帧，跟踪中 {} 个目标", frame_index, self.tracker.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ReplayDetector;
  use image::{Rgb, RgbImage};
  use std::sync::mpsc::channel;

  fn frame(index: u64) -> Frame {
    Frame {
      image: RgbImage::from_pixel(640, 480, Rgb([30, 30, 30])),
      index,
      timestamp_ms: index * 33,
    }
  }

  fn replay(frames: impl IntoIterator<Item = u64>, x: f32) -> ReplayDetector {
    let lines: Vec<String> = frames
      .into_iter()
      .map(|i| {
        format!(
          r#"{{"frame": {}, "items": [{{"class_id": 0, "score": 0.9, "bbox": {{"x1": {}, "y1": 100.0, "x2": {}, "y2": 300.0}}}}]}}"#,
          i,
          x + i as f32,
          x + 150.0 + i as f32
        )
      })
      .collect();
    ReplayDetector::parse(&lines.join("\n")).unwrap()
  }

  #[test]
  fn samples_live_tracks_and_forgets_lost_ones() {
    let (commands, received) = channel::<Command>();
    let (events, observed) = channel();
    let mut task = ScanTask::new(
      ScanConfig::default()
        .with_detect_every(1)
        .with_sample_every(2),
    )
    .with_events(events);
    let detector = replay(0..5, 100.0);

    let submitted: usize = (0..5)
      .map(|i| task.step(&frame(i), &detector, &commands).unwrap())
      .sum();
    assert_eq!(submitted, 3);
    assert_eq!(task.tracker().len(), 1);

    // 连续丢失超过 10 帧后注销
    for i in 5..16 {
      task.step(&frame(i), &detector, &commands).unwrap();
    }
    assert!(task.tracker().is_empty());

    let commands: Vec<Command> = received.try_iter().collect();
    let resolves = commands
      .iter()
      .filter(|c| matches!(c, Command::Resolve(t) if t.track_id == TrackId(0)))
      .count();
    assert_eq!(resolves, 3);
    assert!(matches!(commands.last(), Some(Command::Forget(TrackId(0)))));
    for command in &commands {
      if let Command::Resolve(t) = command {
        assert_eq!(t.image.dimensions(), (630, 880));
      }
    }

    let events: Vec<PipelineEvent> = observed.try_iter().collect();
    assert_eq!(
      events,
      vec![
        PipelineEvent::TracksChanged(vec![TrackId(0)]),
        PipelineEvent::TracksChanged(vec![])
      ]
    );
  }

  #[test]
  fn skipped_frames_reuse_tracker_state() {
    let (commands, received) = channel::<Command>();
    let mut task = ScanTask::new(
      ScanConfig::default()
        .with_detect_every(5)
        .with_sample_every(3),
    );
    // 检测只发生在第 0、5 帧，其余帧的记录不会被读取
    let detector = replay(0..10, 100.0);
    for i in 0..10 {
      task.step(&frame(i), &detector, &commands).unwrap();
    }
    assert_eq!(task.tracker().len(), 1);
    let object = task.tracker().get(TrackId(0)).unwrap();
    assert_eq!(object.history_len(), 2);
    // 采样发生在第 0、3、6、9 帧
    assert_eq!(received.try_iter().count(), 4);
  }

  #[test]
  fn edge_boxes_never_become_tracks() {
    let (commands, received) = channel::<Command>();
    let mut task = ScanTask::new(ScanConfig::default().with_detect_every(1).with_sample_every(1));
    let detector = replay(0..3, 10.0);
    for i in 0..3 {
      task.step(&frame(i), &detector, &commands).unwrap();
    }
    assert!(task.tracker().is_empty());
    assert_eq!(received.try_iter().count(), 0);
  }
}
