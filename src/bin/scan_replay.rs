// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/bin/scan_replay.rs - 用录制的检测结果回放整条识别流水线
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

use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use jianka::{
  FromUrl,
  input::InputWrapper,
  matcher::{LocalThumbnailSource, ThumbnailCache},
  model::{BlankRecognizer, ReplayDetector},
  ocr::{ScoreWeights, TitleReader},
  pipeline::{
    InspectTask, InspectionWorker, Inspector, PipelineEvent, ResolutionWorker, Resolver,
    ScanArchive,
  },
  service::{FixtureService, RateLimited, RateLimiter},
  store::{CardStore, JsonStore},
  task::{ScanConfig, ScanTask, Task},
  tracker::TrackerConfig,
  utils::url_to_path,
};

/// Jianka 扫描回放参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入帧目录，例如 folder:///data/frames?fps=30
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 录制的检测结果（JSON lines），例如 replay:///data/detections.jsonl
  #[arg(long, value_name = "DETECTIONS")]
  pub detections: Url,
  /// 离线卡牌数据，例如 fixture:///data/printings.json
  #[arg(long, value_name = "SERVICE")]
  pub service: Url,
  /// 存储位置（json:///path/db.json 或 memory:）
  #[arg(long, default_value = "memory:", value_name = "STORE")]
  pub store: Url,
  /// 归档目录，例如 folder:///data/scans
  #[arg(long, value_name = "ARCHIVE")]
  pub archive: Url,
  /// 缩略图缓存目录；给出时对识别结果做版本核验
  #[arg(long, value_name = "THUMBNAILS")]
  pub thumbnails: Option<Url>,
  /// 已知卡名，跳过文字识别
  #[arg(long, value_name = "TITLE")]
  pub title: Option<String>,
  /// 给定卡名时的识别质量分
  #[arg(long, default_value = "0.5", value_name = "SCORE")]
  pub pretext_score: f32,
  #[arg(long, default_value = "5", value_name = "N")]
  pub detect_every: u64,
  #[arg(long, default_value = "15", value_name = "N")]
  pub sample_every: u64,
  /// 两次远程调用的最小间隔（毫秒）
  #[arg(long, default_value = "100", value_name = "MS")]
  pub api_delay_ms: u64,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn log_event(event: &PipelineEvent) {
  match event {
    PipelineEvent::TracksChanged(ids) => info!("跟踪目标: {:?}", ids),
    PipelineEvent::Identified {
      track_id,
      name,
      price_usd,
      archive_path,
      confidence,
    } => info!(
      "{} => {} ({:?}) 置信度 {:.2} 归档 {}",
      track_id,
      name,
      price_usd,
      confidence,
      archive_path.display()
    ),
    PipelineEvent::Stats(stats) => info!(
      "收藏 {} 张，总价 ${:.2}，最贵 {:?}",
      stats.total_count, stats.total_value, stats.top_card
    ),
    PipelineEvent::Inspected {
      track_id,
      set_code,
      price_usd,
    } => info!("{} 版本 {} 价格 {:?}", track_id, set_code, price_usd),
    PipelineEvent::Status { track_id, message } => info!("{}: {}", track_id, message),
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("检测记录: {}", args.detections);
  info!("卡牌数据: {}", args.service);
  info!("存储位置: {}", args.store);
  info!("归档目录: {}", args.archive);

  let input = InputWrapper::from_url(&args.input)?;
  let detector = ReplayDetector::from_url(&args.detections)?;
  let store = Arc::new(JsonStore::from_url(&args.store)?);
  let service = Arc::new(FixtureService::from_url(&args.service)?);
  let archive = ScanArchive::from_url(&args.archive)?;
  let limiter = Arc::new(RateLimiter::new(Duration::from_millis(args.api_delay_ms)));

  let (events_tx, events_rx) = mpsc::channel();
  let reader = TitleReader::new(BlankRecognizer)
    .with_weights(ScoreWeights::default().with_pretext_score(args.pretext_score));
  let resolver = Resolver::new(
    reader,
    store.clone(),
    RateLimited::new(service.clone(), limiter.clone()),
    archive,
    events_tx.clone(),
  );
  let resolution = ResolutionWorker::default().spawn(resolver)?;

  let inspection = match &args.thumbnails {
    Some(thumbnails) => {
      let cache = ThumbnailCache::new(url_to_path(thumbnails), Arc::new(LocalThumbnailSource))?;
      let inspector = Inspector::new(
        store.clone(),
        RateLimited::new(service.clone(), limiter.clone()),
        cache,
        events_tx.clone(),
      );
      Some(InspectionWorker::default().spawn(inspector)?)
    }
    None => None,
  };

  // 收藏记录以跟踪号为键，接着已有记录分配，避免覆盖之前会话的收藏
  let first_id = store.next_track_id()?;
  info!("跟踪号从 {} 开始", first_id);

  ScanTask::new(
    ScanConfig::default()
      .with_detect_every(args.detect_every)
      .with_sample_every(args.sample_every)
      .with_frame_number(args.frame_number),
  )
  .with_tracker(TrackerConfig::default().with_first_id(first_id))
  .with_events(events_tx)
  .with_pretext(args.title.clone())
  .run_task(input, detector, &resolution)?;

  resolution.finish()?;
  let events: Vec<PipelineEvent> = events_rx.try_iter().collect();
  events.iter().for_each(log_event);
  if let Some(inspection) = &inspection {
    for task in InspectTask::latest_per_track(&events) {
      if let Err(e) = inspection.submit(task) {
        warn!("提交核验失败: {}", e);
      }
    }
  }

  if let Some(inspection) = inspection {
    inspection.finish()?;
    for event in events_rx.try_iter() {
      log_event(&event);
    }
  }

  let stats = store.stats()?;
  info!(
    "回放结束: 收藏 {} 张，总价 ${:.2}",
    stats.total_count, stats.total_value
  );
  Ok(())
}
