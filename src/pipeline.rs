// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/pipeline.rs - 识别流水线：质量门控、卡名解析与入库
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

//! # 识别流水线
//!
//! 单个后台线程按提交顺序逐个处理 [`ResolveTask`]：
//!
//! 1. 读取卡名（或直接使用给定的卡名），计算识别质量分；
//! 2. 质量门控：分数必须严格高于该跟踪目标此前入库的最好分数；
//! 3. 解析卡名：别名缓存 → 本地目录 → 远程服务，查无此卡写入“明确无效”别名；
//! 4. 归档卡面，按跟踪号覆盖收藏记录并删除被替换的旧归档；
//! 5. 发出 [`PipelineEvent::Identified`] 与最新的收藏汇总。
//!
//! 串行处理保证门控状态与目录、别名写入之间没有竞争，不需要额外加锁。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Sender, SyncSender, sync_channel};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  model::TextRecognizer,
  ocr::TitleReader,
  service::{MetadataService, ServiceError},
  store::{AliasLookup, CardStore, CatalogEntry, CollectionRecord, CollectionStats, StoreError},
  tracker::TrackId,
};

pub mod archive;
mod inspect;

pub use self::archive::{ArchiveError, ScanArchive};
pub use self::inspect::{InspectTask, InspectionHandle, InspectionWorker, Inspector};

const QUEUE_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("存储错误: {0}")]
  StoreError(#[from] StoreError),
  #[error("归档错误: {0}")]
  ArchiveError(#[from] ArchiveError),
  #[error("远程服务错误: {0}")]
  ServiceError(#[from] ServiceError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("工作线程已停止")]
  WorkerStopped,
  #[error("工作线程异常退出")]
  WorkerPanicked,
}

/// 一次识别请求，`pretext` 给定时跳过文字识别
#[derive(Debug, Clone)]
pub struct ResolveTask {
  pub track_id: TrackId,
  pub pretext: Option<String>,
  pub image: RgbImage,
}

#[derive(Debug, Clone)]
pub enum Command {
  Resolve(ResolveTask),
  /// 用户删除：收藏记录、归档文件、门控状态一并清除
  Remove(TrackId),
  /// 跟踪目标已注销：只丢弃门控状态，收藏记录保留
  Forget(TrackId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
  TracksChanged(Vec<TrackId>),
  Identified {
    track_id: TrackId,
    name: String,
    price_usd: Option<f64>,
    archive_path: PathBuf,
    confidence: f32,
  },
  Stats(CollectionStats),
  Inspected {
    track_id: TrackId,
    set_code: String,
    price_usd: Option<f64>,
  },
  Status {
    track_id: TrackId,
    message: String,
  },
}

/// 每个跟踪目标的门控记忆
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionState {
  pub best_score: f32,
  pub last_persisted_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct QualityGate {
  states: HashMap<TrackId, ResolutionState>,
}

impl QualityGate {
  /// 分数严格高于已入库的最好分数（没有则为 0）才放行
  pub fn admits(&self, track_id: TrackId, score: f32) -> bool {
    let best = self.states.get(&track_id).map_or(0.0, |s| s.best_score);
    score > best
  }

  pub fn record(&mut self, track_id: TrackId, score: f32, name: &str) {
    let state = self.states.entry(track_id).or_default();
    state.best_score = score;
    state.last_persisted_name = Some(name.to_string());
  }

  pub fn forget(&mut self, track_id: TrackId) -> Option<ResolutionState> {
    self.states.remove(&track_id)
  }

  pub fn state(&self, track_id: TrackId) -> Option<&ResolutionState> {
    self.states.get(&track_id)
  }

  pub fn len(&self) -> usize {
    self.states.len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.is_empty()
  }
}

/// 向事件接收方发送，接收方已关闭时静默丢弃
pub(crate) fn emit(events: &Sender<PipelineEvent>, event: PipelineEvent) {
  if events.send(event).is_err() {
    debug!("事件接收方已关闭");
  }
}

/// 流水线的同步核心，由 [`ResolutionWorker`] 在后台线程中驱动
pub struct Resolver<R, S, M> {
  reader: TitleReader<R>,
  store: S,
  service: M,
  archive: ScanArchive,
  gate: QualityGate,
  events: Sender<PipelineEvent>,
}

impl<R, S, M> Resolver<R, S, M>
where
  R: TextRecognizer,
  S: CardStore,
  M: MetadataService,
{
  pub fn new(
    reader: TitleReader<R>,
    store: S,
    service: M,
    archive: ScanArchive,
    events: Sender<PipelineEvent>,
  ) -> Self {
    Self {
      reader,
      store,
      service,
      archive,
      gate: QualityGate::default(),
      events,
    }
  }

  pub fn gate(&self) -> &QualityGate {
    &self.gate
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  /// 处理一条命令，失败只记录日志，不影响后续命令
  pub fn handle(&mut self, command: Command) {
    match command {
      Command::Resolve(task) => {
        let track_id = task.track_id;
        if let Err(e) = self.resolve(task) {
          error!("识别 {} 失败: {}", track_id, e);
          emit(
            &self.events,
            PipelineEvent::Status {
              track_id,
              message: format!("识别失败: {}", e),
            },
          );
        }
      }
      Command::Remove(track_id) => {
        if let Err(e) = self.remove(track_id) {
          error!("删除 {} 失败: {}", track_id, e);
        }
      }
      Command::Forget(track_id) => {
        if self.gate.forget(track_id).is_some() {
          debug!("丢弃 {} 的门控状态", track_id);
        }
      }
    }
  }

  fn resolve(&mut self, task: ResolveTask) -> Result<(), PipelineError> {
    let ResolveTask {
      track_id,
      pretext,
      image,
    } = task;

    let (text, confidence, score, image) = match pretext {
      Some(text) => {
        let score = self.reader.weights().pretext_score;
        (text, 1.0, score, image)
      }
      None => {
        let reading = self.reader.read(&image);
        (reading.text, reading.confidence, reading.score, reading.image)
      }
    };
    let text = text.trim().to_string();
    if text.is_empty() {
      debug!("{} 未读出卡名，丢弃", track_id);
      return Ok(());
    }

    if !self.gate.admits(track_id, score) {
      debug!(
        "{} 质量 {:.2} 未超过已入库的 {:.2}，丢弃",
        track_id,
        score,
        self.gate.state(track_id).map_or(0.0, |s| s.best_score)
      );
      return Ok(());
    }
    debug!("{} 质量 {:.2} 通过门控: {:?}", track_id, score, text);

    let Some(entry) = self.identify(&text)? else {
      return Ok(());
    };

    let archive_path = self.archive.save(&entry.display_name, track_id, &image)?;
    let previous = self.store.upsert_record(CollectionRecord {
      track_id,
      display_name: entry.display_name.clone(),
      normalized_name: entry.normalized_name.clone(),
      set_code: entry.set_code.clone(),
      price_usd: entry.price_usd,
      image_path: archive_path.clone(),
      confidence,
      scanned_at: chrono::Utc::now().timestamp(),
    })?;
    if let Some(previous) = previous.filter(|p| p.image_path != archive_path) {
      if let Err(e) = self.archive.remove(&previous.image_path) {
        warn!("删除旧归档失败 {}: {}", previous.image_path.display(), e);
      }
    }
    self.gate.record(track_id, score, &entry.display_name);

    info!(
      "{} 识别为 {} ({}) 价格 {}",
      track_id,
      entry.display_name,
      entry.set_code.to_uppercase(),
      entry
        .price_usd
        .map_or_else(|| "N/A".to_string(), |p| format!("${:.2}", p))
    );
    emit(
      &self.events,
      PipelineEvent::Identified {
        track_id,
        name: entry.display_name,
        price_usd: entry.price_usd,
        archive_path,
        confidence,
      },
    );
    emit(&self.events, PipelineEvent::Stats(self.store.stats()?));
    Ok(())
  }

  /// 别名缓存 → 本地目录 → 远程服务。返回 None 表示本次放弃。
  fn identify(&self, text: &str) -> Result<Option<CatalogEntry>, PipelineError> {
    match self.store.alias(text)? {
      AliasLookup::Invalid => {
        info!("跳过已知无效文本: {:?}", text);
        return Ok(None);
      }
      AliasLookup::Resolved(name) => {
        if let Some(entry) = self.store.catalog(&name)? {
          debug!("别名命中 {:?} -> {:?}", text, name);
          return Ok(Some(entry));
        }
        warn!("别名 {:?} 指向的目录条目 {:?} 不存在，重新查询", text, name);
        return self.lookup_remote(text, &name);
      }
      AliasLookup::Unknown => {}
    }

    if let Some(entry) = self.store.catalog(text)? {
      debug!("目录命中 {:?}", text);
      return Ok(Some(entry));
    }
    self.lookup_remote(text, text)
  }

  fn lookup_remote(&self, text: &str, query: &str) -> Result<Option<CatalogEntry>, PipelineError> {
    info!("未知文本 {:?}，查询远程服务", query);
    match self.service.by_name(query) {
      Ok(Some(printing)) => {
        let entry = CatalogEntry::from_printing(&printing);
        self.store.upsert_catalog(entry.clone())?;
        self.store.put_alias(text, Some(&printing.name))?;
        Ok(Some(entry))
      }
      Ok(None) => {
        info!("查无此卡，标记 {:?} 为无效", text);
        self.store.put_alias(text, None)?;
        Ok(None)
      }
      Err(e) => {
        // 传输失败不写负缓存，之后可重新提交
        warn!("远程查询失败 {:?}: {}", query, e);
        Ok(None)
      }
    }
  }

  fn remove(&mut self, track_id: TrackId) -> Result<(), PipelineError> {
    self.gate.forget(track_id);
    if let Some(record) = self.store.remove_record(track_id)? {
      info!("删除收藏 {} ({})", track_id, record.display_name);
      // 记录已删除，归档清理失败不影响汇总
      if let Err(e) = self.archive.remove(&record.image_path) {
        warn!("删除归档失败 {}: {}", record.image_path.display(), e);
      }
    }
    emit(&self.events, PipelineEvent::Stats(self.store.stats()?));
    Ok(())
  }
}

enum Message<T> {
  Task(T),
  Wake,
  /// 排在它之前的任务全部处理完后退出
  Finish,
}

/// 后台工作线程句柄：有界队列 + 单消费者
pub struct WorkerHandle<T> {
  name: &'static str,
  sender: SyncSender<Message<T>>,
  stop: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
  fn spawn<F>(name: &'static str, capacity: usize, mut handler: F) -> Result<Self, PipelineError>
  where
    F: FnMut(T) + Send + 'static,
  {
    let (sender, receiver) = sync_channel::<Message<T>>(capacity.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
      info!("{} 已启动", name);
      for message in receiver.iter() {
        if flag.load(Ordering::SeqCst) {
          break;
        }
        match message {
          Message::Task(task) => handler(task),
          Message::Wake => {}
          Message::Finish => break,
        }
      }
      info!("{} 已退出", name);
    })?;
    Ok(Self {
      name,
      sender,
      stop,
      thread: Some(thread),
    })
  }

  /// 提交任务，队列已满时阻塞
  pub fn submit(&self, task: T) -> Result<(), PipelineError> {
    self
      .sender
      .send(Message::Task(task))
      .map_err(|_| PipelineError::WorkerStopped)
  }

  /// 当前任务完成后停止，队列中剩余的任务被丢弃
  pub fn stop(mut self) -> Result<(), PipelineError> {
    self.shutdown(false)
  }

  /// 处理完已提交的全部任务后停止
  pub fn finish(mut self) -> Result<(), PipelineError> {
    self.shutdown(true)
  }

  fn shutdown(&mut self, drain: bool) -> Result<(), PipelineError> {
    let Some(thread) = self.thread.take() else {
      return Ok(());
    };
    // 线程已退出时发送失败，无需处理
    if drain {
      let _ = self.sender.send(Message::Finish);
    } else {
      self.stop.store(true, Ordering::SeqCst);
      let _ = self.sender.send(Message::Wake);
    }
    thread.join().map_err(|_| PipelineError::WorkerPanicked)?;
    debug!("{} 已停止", self.name);
    Ok(())
  }
}

impl<T> Clone for WorkerHandle<T> {
  /// 克隆出的句柄只能提交任务，停止与回收由原句柄负责
  fn clone(&self) -> Self {
    Self {
      name: self.name,
      sender: self.sender.clone(),
      stop: self.stop.clone(),
      thread: None,
    }
  }
}

impl<T> Drop for WorkerHandle<T> {
  fn drop(&mut self) {
    if let Some(thread) = self.thread.take() {
      self.stop.store(true, Ordering::SeqCst);
      let _ = self.sender.send(Message::Wake);
      if thread.join().is_err() {
        error!("{} 异常退出", self.name);
      }
    }
  }
}

pub type ResolutionHandle = WorkerHandle<Command>;

/// 识别命令的去处：后台线程句柄，或测试中的普通通道
pub trait CommandSink {
  fn send_command(&self, command: Command) -> Result<(), PipelineError>;
}

impl CommandSink for ResolutionHandle {
  fn send_command(&self, command: Command) -> Result<(), PipelineError> {
    self.submit(command)
  }
}

impl CommandSink for Sender<Command> {
  fn send_command(&self, command: Command) -> Result<(), PipelineError> {
    self.send(command).map_err(|_| PipelineError::WorkerStopped)
  }
}

impl<T: CommandSink + ?Sized> CommandSink for &T {
  fn send_command(&self, command: Command) -> Result<(), PipelineError> {
    (**self).send_command(command)
  }
}

/// 识别工作线程的启动参数
#[derive(Debug, Clone)]
pub struct ResolutionWorker {
  capacity: usize,
}

impl Default for ResolutionWorker {
  fn default() -> Self {
    Self {
      capacity: QUEUE_CAPACITY,
    }
  }
}

impl ResolutionWorker {
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn spawn<R, S, M>(self, mut resolver: Resolver<R, S, M>) -> Result<ResolutionHandle, PipelineError>
  where
    R: TextRecognizer + Send + 'static,
    S: CardStore + 'static,
    M: MetadataService + Send + 'static,
  {
    WorkerHandle::spawn("识别线程", self.capacity, move |command| resolver.handle(command))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    FromUrl,
    geometry::Rect,
    model::BlankRecognizer,
    service::{FixtureService, Printing},
    store::JsonStore,
    tracker::{CentroidTracker, TrackerConfig},
  };
  use std::sync::Mutex;
  use std::sync::atomic::AtomicUsize;
  use std::sync::mpsc::{Receiver, channel};
  use std::time::Duration;

  struct ScriptedRecognizer(Mutex<(String, f32)>);

  impl ScriptedRecognizer {
    fn say(&self, text: &str, confidence: f32) {
      *self.0.lock().unwrap() = (text.to_string(), confidence);
    }
  }

  impl TextRecognizer for ScriptedRecognizer {
    fn read(&self, _image: &RgbImage) -> (String, f32) {
      self.0.lock().unwrap().clone()
    }
  }

  struct CountingService {
    inner: FixtureService,
    calls: AtomicUsize,
    broken: bool,
  }

  impl MetadataService for CountingService {
    fn by_name(&self, text: &str) -> Result<Option<Printing>, ServiceError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.broken {
        return Err(ServiceError::Transport("connection refused".to_string()));
      }
      self.inner.by_name(text)
    }

    fn all_printings(&self, name: &str) -> Result<Vec<Printing>, ServiceError> {
      self.inner.all_printings(name)
    }
  }

  fn printing(id: &str, name: &str, price: f64) -> Printing {
    Printing {
      id: id.to_string(),
      name: name.to_string(),
      set_code: "mrd".to_string(),
      set_name: "Mirrodin".to_string(),
      collector_number: "1".to_string(),
      rarity: "common".to_string(),
      release_date: "2003-10-02".to_string(),
      thumbnail: None,
      price_usd: Some(price),
    }
  }

  struct Fixture {
    dir: PathBuf,
    recognizer: Arc<ScriptedRecognizer>,
    service: Arc<CountingService>,
    store: Arc<JsonStore>,
    events: Receiver<PipelineEvent>,
    resolver: Resolver<Arc<ScriptedRecognizer>, Arc<JsonStore>, Arc<CountingService>>,
  }

  fn fixture(tag: &str, broken: bool) -> Fixture {
    let dir = std::env::temp_dir().join(format!("jianka-pipeline-{}-{}", tag, std::process::id()));
    let recognizer = Arc::new(ScriptedRecognizer(Mutex::new((String::new(), 0.0))));
    let service = Arc::new(CountingService {
      inner: FixtureService::new(vec![
        printing("a", "Iron Myr", 0.25),
        printing("b", "Giant Growth", 0.5),
        printing("c", "Shivan Dragon", 4.0),
      ]),
      calls: AtomicUsize::new(0),
      broken,
    });
    let store = Arc::new(JsonStore::in_memory());
    let (tx, rx) = channel();
    let resolver = Resolver::new(
      TitleReader::new(recognizer.clone()),
      store.clone(),
      service.clone(),
      ScanArchive::new(&dir),
      tx,
    );
    Fixture {
      dir,
      recognizer,
      service,
      store,
      events: rx,
      resolver,
    }
  }

  fn card() -> RgbImage {
    RgbImage::from_pixel(63, 88, image::Rgb([90, 120, 40]))
  }

  fn resolve(track_id: u64) -> Command {
    Command::Resolve(ResolveTask {
      track_id: TrackId(track_id),
      pretext: None,
      image: card(),
    })
  }

  fn identified(events: &Receiver<PipelineEvent>) -> Vec<(TrackId, String)> {
    events
      .try_iter()
      .filter_map(|e| match e {
        PipelineEvent::Identified { track_id, name, .. } => Some((track_id, name)),
        _ => None,
      })
      .collect()
  }

  #[test]
  fn lower_score_never_overwrites() {
    let mut f = fixture("gate", false);
    f.recognizer.say("Iron Myr", 0.9);
    f.resolver.handle(resolve(1));
    let first = f.store.record(TrackId(1)).unwrap().unwrap();
    assert_eq!(first.display_name, "Iron Myr");
    assert!(first.image_path.exists());

    // 0.52 < 0.64，被门控丢弃，也不会查询远程服务
    f.recognizer.say("Giant Growth", 0.2);
    f.resolver.handle(resolve(1));
    assert_eq!(f.store.record(TrackId(1)).unwrap().unwrap(), first);
    assert_eq!(f.service.calls.load(Ordering::SeqCst), 1);

    f.recognizer.say("Shivan Dragon", 1.0);
    f.resolver.handle(resolve(1));
    let better = f.store.record(TrackId(1)).unwrap().unwrap();
    assert_eq!(better.display_name, "Shivan Dragon");
    assert!(!first.image_path.exists());
    assert!(better.image_path.exists());
    assert_eq!(f.store.stats().unwrap().total_count, 1);
    assert_eq!(
      f.resolver.gate().state(TrackId(1)).unwrap().last_persisted_name.as_deref(),
      Some("Shivan Dragon")
    );

    assert_eq!(
      identified(&f.events),
      vec![
        (TrackId(1), "Iron Myr".to_string()),
        (TrackId(1), "Shivan Dragon".to_string())
      ]
    );
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn negative_cache_short_circuits_remote_lookup() {
    let mut f = fixture("negative", false);
    f.recognizer.say("Xyzzy Plugh", 0.8);
    f.resolver.handle(resolve(1));
    assert_eq!(f.store.alias("xyzzy plugh").unwrap(), AliasLookup::Invalid);
    assert_eq!(f.service.calls.load(Ordering::SeqCst), 1);

    f.resolver.handle(resolve(2));
    assert_eq!(f.service.calls.load(Ordering::SeqCst), 1);
    assert!(f.store.record(TrackId(2)).unwrap().is_none());
    assert!(identified(&f.events).is_empty());
  }

  #[test]
  fn alias_and_catalog_are_reused() {
    let mut f = fixture("alias", false);
    f.recognizer.say("iron myr", 0.9);
    f.resolver.handle(resolve(1));
    f.resolver.handle(resolve(2));
    assert_eq!(f.service.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
      f.store.alias("Iron Myr").unwrap(),
      AliasLookup::Resolved("iron myr".to_string())
    );
    assert_eq!(f.store.stats().unwrap().total_count, 2);
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn transport_failure_is_not_cached() {
    let mut f = fixture("transport", true);
    f.recognizer.say("Iron Myr", 0.9);
    f.resolver.handle(resolve(1));
    assert_eq!(f.store.alias("Iron Myr").unwrap(), AliasLookup::Unknown);
    assert!(f.store.record(TrackId(1)).unwrap().is_none());
    assert!(f.resolver.gate().is_empty());
  }

  #[test]
  fn pretext_uses_configured_score() {
    let mut f = fixture("pretext", false);
    f.resolver.handle(Command::Resolve(ResolveTask {
      track_id: TrackId(3),
      pretext: Some("Giant Growth".to_string()),
      image: card(),
    }));
    let state = f.resolver.gate().state(TrackId(3)).unwrap();
    assert_eq!(state.best_score, 0.5);
    // 同样的给定卡名不会再次通过门控
    f.resolver.handle(Command::Resolve(ResolveTask {
      track_id: TrackId(3),
      pretext: Some("Iron Myr".to_string()),
      image: card(),
    }));
    assert_eq!(
      f.store.record(TrackId(3)).unwrap().unwrap().display_name,
      "Giant Growth"
    );
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn remove_clears_record_archive_and_gate() {
    let mut f = fixture("remove", false);
    f.recognizer.say("Shivan Dragon", 0.9);
    f.resolver.handle(resolve(4));
    let record = f.store.record(TrackId(4)).unwrap().unwrap();
    let _ = f.events.try_iter().count();

    f.resolver.handle(Command::Remove(TrackId(4)));
    assert!(f.store.record(TrackId(4)).unwrap().is_none());
    assert!(!record.image_path.exists());
    assert!(f.resolver.gate().state(TrackId(4)).is_none());
    assert_eq!(
      f.events.try_recv().unwrap(),
      PipelineEvent::Stats(CollectionStats::default())
    );

    // 删除后同一目标可以用更低的分数重新入库
    f.recognizer.say("Iron Myr", 0.1);
    f.resolver.handle(resolve(4));
    assert!(f.store.record(TrackId(4)).unwrap().is_some());
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn remove_reports_stats_when_archive_cleanup_fails() {
    let mut f = fixture("remove-dir", false);
    // 归档路径是目录，删除文件必然失败
    let stuck = f.dir.join("stuck.png");
    std::fs::create_dir_all(&stuck).unwrap();
    f.store
      .upsert_record(CollectionRecord {
        track_id: TrackId(6),
        display_name: "Iron Myr".to_string(),
        normalized_name: "iron myr".to_string(),
        set_code: "mrd".to_string(),
        price_usd: Some(0.25),
        image_path: stuck.clone(),
        confidence: 0.9,
        scanned_at: 0,
      })
      .unwrap();

    f.resolver.handle(Command::Remove(TrackId(6)));
    assert!(f.store.record(TrackId(6)).unwrap().is_none());
    assert_eq!(
      f.events.try_recv().unwrap(),
      PipelineEvent::Stats(CollectionStats::default())
    );
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn track_ids_continue_across_sessions() {
    let dir = std::env::temp_dir().join(format!("jianka-pipeline-sessions-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let url = url::Url::parse(&format!("json://{}/db.json", dir.display())).unwrap();
    let service = Arc::new(FixtureService::new(vec![
      printing("a", "Iron Myr", 0.25),
      printing("c", "Shivan Dragon", 4.0),
    ]));

    let mut records = Vec::new();
    for name in ["Iron Myr", "Shivan Dragon"] {
      let store = Arc::new(JsonStore::from_url(&url).unwrap());
      let mut tracker = CentroidTracker::new(
        TrackerConfig::default().with_first_id(store.next_track_id().unwrap()),
      );
      tracker.update(&[Rect::new(100.0, 100.0, 250.0, 300.0)]);
      let track_id = *tracker.objects().keys().next().unwrap();

      let (tx, _rx) = channel();
      let mut resolver = Resolver::new(
        TitleReader::new(BlankRecognizer),
        store.clone(),
        service.clone(),
        ScanArchive::new(dir.join("scans")),
        tx,
      );
      resolver.handle(Command::Resolve(ResolveTask {
        track_id,
        pretext: Some(name.to_string()),
        image: card(),
      }));
      records.push(store.record(track_id).unwrap().unwrap());
    }

    assert_eq!(records[0].track_id, TrackId(0));
    assert_eq!(records[1].track_id, TrackId(1));
    let store = JsonStore::from_url(&url).unwrap();
    assert_eq!(store.stats().unwrap().total_count, 2);
    assert_eq!(store.record(TrackId(0)).unwrap().unwrap().display_name, "Iron Myr");
    for record in &records {
      assert!(record.image_path.exists());
    }
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn forget_keeps_collection_record() {
    let mut f = fixture("forget", false);
    f.recognizer.say("Iron Myr", 0.9);
    f.resolver.handle(resolve(5));
    f.resolver.handle(Command::Forget(TrackId(5)));
    assert!(f.resolver.gate().is_empty());
    assert!(f.store.record(TrackId(5)).unwrap().is_some());
    std::fs::remove_dir_all(&f.dir).unwrap();
  }

  #[test]
  fn worker_processes_in_order_and_stops() {
    let f = fixture("worker", false);
    let (recognizer, events, dir) = (f.recognizer.clone(), f.events, f.dir.clone());
    recognizer.say("Iron Myr", 0.9);
    let handle = ResolutionWorker::default()
      .with_capacity(4)
      .spawn(f.resolver)
      .unwrap();
    handle.submit(resolve(1)).unwrap();
    handle
      .submit(Command::Resolve(ResolveTask {
        track_id: TrackId(2),
        pretext: Some("Giant Growth".to_string()),
        image: card(),
      }))
      .unwrap();

    let mut names = Vec::new();
    while names.len() < 2 {
      match events.recv_timeout(Duration::from_secs(10)).unwrap() {
        PipelineEvent::Identified { name, .. } => names.push(name),
        _ => {}
      }
    }
    assert_eq!(names, vec!["Iron Myr", "Giant Growth"]);

    let submitter = handle.clone();
    handle.stop().unwrap();
    assert!(matches!(
      submitter.submit(resolve(3)),
      Err(PipelineError::WorkerStopped)
    ));
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn finish_drains_queued_commands() {
    let f = fixture("finish", false);
    let (store, dir) = (f.store.clone(), f.dir.clone());
    let handle = ResolutionWorker::default().spawn(f.resolver).unwrap();
    for (id, name) in [(1, "Iron Myr"), (2, "Giant Growth"), (3, "Shivan Dragon")] {
      handle
        .submit(Command::Resolve(ResolveTask {
          track_id: TrackId(id),
          pretext: Some(name.to_string()),
          image: card(),
        }))
        .unwrap();
    }
    handle.finish().unwrap();
    assert_eq!(store.stats().unwrap().total_count, 3);
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
