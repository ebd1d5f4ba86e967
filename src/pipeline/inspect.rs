// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/pipeline/inspect.rs - 版本核验：用归档卡面在全部版本中做视觉匹配
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

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use tracing::{error, info};

use crate::{
  matcher::{PrintingMatcher, ReferenceImages},
  pipeline::{PipelineError, PipelineEvent, WorkerHandle, emit},
  service::MetadataService,
  store::{CardStore, CatalogEntry},
  tracker::TrackId,
};

const QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct InspectTask {
  pub track_id: TrackId,
  pub name: String,
  pub image_path: PathBuf,
}

impl InspectTask {
  /// 每个目标只取最后一次识别结果；更早的归档已被替换删除
  pub fn latest_per_track<'a>(events: impl IntoIterator<Item = &'a PipelineEvent>) -> Vec<Self> {
    let mut latest = BTreeMap::new();
    for event in events {
      if let PipelineEvent::Identified {
        track_id,
        name,
        archive_path,
        ..
      } = event
      {
        latest.insert(
          *track_id,
          Self {
            track_id: *track_id,
            name: name.clone(),
            image_path: archive_path.clone(),
          },
        );
      }
    }
    latest.into_values().collect()
  }
}

pub struct Inspector<S, M, R> {
  store: S,
  service: M,
  references: R,
  matcher: PrintingMatcher,
  events: Sender<PipelineEvent>,
}

impl<S, M, R> Inspector<S, M, R>
where
  S: CardStore,
  M: MetadataService,
  R: ReferenceImages,
{
  pub fn new(store: S, service: M, references: R, events: Sender<PipelineEvent>) -> Self {
    Self {
      store,
      service,
      references,
      matcher: PrintingMatcher::default(),
      events,
    }
  }

  pub fn with_matcher(mut self, matcher: PrintingMatcher) -> Self {
    self.matcher = matcher;
    self
  }

  fn status(&self, track_id: TrackId, message: impl Into<String>) {
    emit(
      &self.events,
      PipelineEvent::Status {
        track_id,
        message: message.into(),
      },
    );
  }

  pub fn inspect(&self, task: InspectTask) {
    let InspectTask {
      track_id,
      name,
      image_path,
    } = task;
    info!("核验 {} ({})", name, track_id);
    self.status(track_id, "获取版本列表...");

    let scan = match image::open(&image_path) {
      Ok(image) => image.into_rgb8(),
      Err(e) => {
        error!("无法加载图像 {}: {}", image_path.display(), e);
        self.status(track_id, "图像加载失败");
        return;
      }
    };

    let candidates = match self.service.all_printings(&name) {
      Ok(candidates) if candidates.is_empty() => {
        self.status(track_id, "未找到版本");
        return;
      }
      Ok(candidates) => candidates,
      Err(e) => {
        error!("版本查询失败 {}: {}", name, e);
        self.status(track_id, "版本查询失败");
        return;
      }
    };

    self.status(track_id, format!("比较 {} 个版本...", candidates.len()));
    let Some(best) = self
      .matcher
      .find_best_match(&scan, &candidates, &self.references)
    else {
      self.status(track_id, "匹配失败");
      return;
    };

    let set_code = best.printing.set_code.to_uppercase();
    let price_usd = best.printing.price_usd;
    info!("{} 版本确认: {}", track_id, set_code);
    if let Err(e) = self.persist(track_id, &CatalogEntry::from_printing(best.printing)) {
      error!("保存核验结果失败: {}", e);
      self.status(track_id, "保存失败");
      return;
    }
    emit(
      &self.events,
      PipelineEvent::Inspected {
        track_id,
        set_code,
        price_usd,
      },
    );
  }

  /// 目录换成匹配到的具体版本；该目标的收藏记录仍是同一张卡时同步更新版本与价格
  fn persist(&self, track_id: TrackId, entry: &CatalogEntry) -> Result<(), PipelineError> {
    self.store.upsert_catalog(entry.clone())?;
    // 识别线程可能已把该目标换成另一张卡，由存储在同一次加锁内核对卡名
    let updated = self.store.update_record_printing(
      track_id,
      &entry.normalized_name,
      &entry.set_code,
      entry.price_usd,
    )?;
    if updated {
      emit(&self.events, PipelineEvent::Stats(self.store.stats()?));
    }
    Ok(())
  }
}

pub type InspectionHandle = WorkerHandle<InspectTask>;

/// 核验工作线程的启动参数
#[derive(Debug, Clone)]
pub struct InspectionWorker {
  capacity: usize,
}

impl Default for InspectionWorker {
  fn default() -> Self {
    Self {
      capacity: QUEUE_CAPACITY,
    }
  }
}

impl InspectionWorker {
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn spawn<S, M, R>(self, inspector: Inspector<S, M, R>) -> Result<InspectionHandle, PipelineError>
  where
    S: CardStore + 'static,
    M: MetadataService + Send + 'static,
    R: ReferenceImages + Send + 'static,
  {
    WorkerHandle::spawn("核验线程", self.capacity, move |task| inspector.inspect(task))
  }
}
