// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/store.rs - 卡牌目录、别名缓存与收藏记录存储
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
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  service::Printing,
  tracker::TrackId,
  utils::{normalize_name, url_to_path},
};

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 别名查询结果：未知 / 明确无效 / 已解析为某个卡名
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasLookup {
  Unknown,
  Invalid,
  Resolved(String),
}

/// 卡名级目录条目，记录当前采用的版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
  pub normalized_name: String,
  pub display_name: String,
  pub printing_id: String,
  pub set_code: String,
  pub set_name: String,
  pub collector_number: String,
  pub rarity: String,
  pub release_date: String,
  pub image_ref: Option<String>,
  pub price_usd: Option<f64>,
  /// Unix 时间戳（秒）
  pub fetched_at: i64,
}

impl CatalogEntry {
  pub fn from_printing(printing: &Printing) -> Self {
    Self {
      normalized_name: normalize_name(&printing.name),
      display_name: printing.name.clone(),
      printing_id: printing.id.clone(),
      set_code: printing.set_code.clone(),
      set_name: printing.set_name.clone(),
      collector_number: printing.collector_number.clone(),
      rarity: printing.rarity.clone(),
      release_date: printing.release_date.clone(),
      image_ref: printing.thumbnail.clone(),
      price_usd: printing.price_usd,
      fetched_at: chrono::Utc::now().timestamp(),
    }
  }
}

/// 以跟踪目标为键的收藏记录，同一目标只保留一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
  pub track_id: TrackId,
  pub display_name: String,
  pub normalized_name: String,
  pub set_code: String,
  pub price_usd: Option<f64>,
  pub image_path: PathBuf,
  pub confidence: f32,
  /// Unix 时间戳（秒）
  pub scanned_at: i64,
}

/// 收藏汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionStats {
  pub total_count: usize,
  pub total_value: f64,
  /// 单价最高的卡 (卡名, 价格)
  pub top_card: Option<(String, f64)>,
}

impl CollectionStats {
  pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CollectionRecord>) -> Self {
    let mut stats = Self::default();
    for record in records {
      stats.total_count += 1;
      if let Some(price) = record.price_usd {
        stats.total_value += price;
        if stats.top_card.as_ref().is_none_or(|(_, top)| price > *top) {
          stats.top_card = Some((record.display_name.clone(), price));
        }
      }
    }
    stats
  }
}

/// 目录 / 别名 / 收藏存储。键均按 [`normalize_name`] 归一化；
/// 写入为幂等的覆盖写，删除不存在的键不报错。
pub trait CardStore: Send + Sync {
  fn alias(&self, text: &str) -> Result<AliasLookup, StoreError>;
  /// `target` 为 None 时写入“明确无效”
  fn put_alias(&self, text: &str, target: Option<&str>) -> Result<(), StoreError>;

  fn catalog(&self, name: &str) -> Result<Option<CatalogEntry>, StoreError>;
  fn upsert_catalog(&self, entry: CatalogEntry) -> Result<(), StoreError>;

  fn record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError>;
  /// 返回被替换掉的旧记录
  fn upsert_record(&self, record: CollectionRecord) -> Result<Option<CollectionRecord>, StoreError>;
  fn remove_record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError>;
  /// 在同一次加锁内更新记录的版本与价格；记录不存在或卡名已变时不修改，返回 false
  fn update_record_printing(
    &self,
    track_id: TrackId,
    name: &str,
    set_code: &str,
    price_usd: Option<f64>,
  ) -> Result<bool, StoreError>;
  /// 比已持久化的所有记录都大的下一个目标标识，跨会话分配时从这里开始
  fn next_track_id(&self) -> Result<TrackId, StoreError>;

  fn stats(&self) -> Result<CollectionStats, StoreError>;
}

impl<T: CardStore + ?Sized> CardStore for Arc<T> {
  fn alias(&self, text: &str) -> Result<AliasLookup, StoreError> {
    (**self).alias(text)
  }

  fn put_alias(&self, text: &str, target: Option<&str>) -> Result<(), StoreError> {
    (**self).put_alias(text, target)
  }

  fn catalog(&self, name: &str) -> Result<Option<CatalogEntry>, StoreError> {
    (**self).catalog(name)
  }

  fn upsert_catalog(&self, entry: CatalogEntry) -> Result<(), StoreError> {
    (**self).upsert_catalog(entry)
  }

  fn record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError> {
    (**self).record(track_id)
  }

  fn upsert_record(&self, record: CollectionRecord) -> Result<Option<CollectionRecord>, StoreError> {
    (**self).upsert_record(record)
  }

  fn remove_record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError> {
    (**self).remove_record(track_id)
  }

  fn update_record_printing(
    &self,
    track_id: TrackId,
    name: &str,
    set_code: &str,
    price_usd: Option<f64>,
  ) -> Result<bool, StoreError> {
    (**self).update_record_printing(track_id, name, set_code, price_usd)
  }

  fn next_track_id(&self) -> Result<TrackId, StoreError> {
    (**self).next_track_id()
  }

  fn stats(&self) -> Result<CollectionStats, StoreError> {
    (**self).stats()
  }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
  /// 值为 None 表示该文本明确无效
  #[serde(default)]
  aliases: BTreeMap<String, Option<String>>,
  #[serde(default)]
  catalog: BTreeMap<String, CatalogEntry>,
  #[serde(default)]
  collection: Vec<CollectionRecord>,
}

/// 整体存为一个 JSON 文件的存储；每次写操作后落盘（先写临时文件再改名）。
/// 不带路径时只保存在内存中。
#[derive(Debug, Default)]
pub struct JsonStore {
  path: Option<PathBuf>,
  data: Mutex<StoreData>,
}

impl FromUrl for JsonStore {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "json" => Self::open(url_to_path(url)),
      "memory" => Ok(Self::in_memory()),
      _ => Err(StoreError::SchemeMismatch),
    }
  }
}

impl JsonStore {
  pub fn in_memory() -> Self {
    Self::default()
  }

  pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let path = path.into();
    let data = if path.exists() {
      let content = std::fs::read_to_string(&path)?;
      let data: StoreData = serde_json::from_str(&content)?;
      info!(
        "加载存储 {}: 目录 {} 条, 别名 {} 条, 收藏 {} 条",
        path.display(),
        data.catalog.len(),
        data.aliases.len(),
        data.collection.len()
      );
      data
    } else {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      StoreData::default()
    };
    Ok(Self {
      path: Some(path),
      data: Mutex::new(data),
    })
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  fn lock(&self) -> MutexGuard<'_, StoreData> {
    match self.data.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
  }
}

impl CardStore for JsonStore {
  fn alias(&self, text: &str) -> Result<AliasLookup, StoreError> {
    let data = self.lock();
    Ok(match data.aliases.get(&normalize_name(text)) {
      None => AliasLookup::Unknown,
      Some(None) => AliasLookup::Invalid,
      Some(Some(name)) => AliasLookup::Resolved(name.clone()),
    })
  }

  fn put_alias(&self, text: &str, target: Option<&str>) -> Result<(), StoreError> {
    let mut data = self.lock();
    data
      .aliases
      .insert(normalize_name(text), target.map(normalize_name));
    debug!("写入别名 {:?} -> {:?}", text, target);
    self.persist(&data)
  }

  fn catalog(&self, name: &str) -> Result<Option<CatalogEntry>, StoreError> {
    Ok(self.lock().catalog.get(&normalize_name(name)).cloned())
  }

  fn upsert_catalog(&self, mut entry: CatalogEntry) -> Result<(), StoreError> {
    let mut data = self.lock();
    entry.normalized_name = normalize_name(&entry.normalized_name);
    debug!("更新目录 {} ({})", entry.display_name, entry.set_code);
    data.catalog.insert(entry.normalized_name.clone(), entry);
    self.persist(&data)
  }

  fn record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError> {
    Ok(
      self
        .lock()
        .collection
        .iter()
        .find(|r| r.track_id == track_id)
        .cloned(),
    )
  }

  fn upsert_record(&self, record: CollectionRecord) -> Result<Option<CollectionRecord>, StoreError> {
    let mut data = self.lock();
    let slot = data.collection.iter().position(|r| r.track_id == record.track_id);
    let previous = match slot {
      Some(index) => Some(std::mem::replace(&mut data.collection[index], record)),
      None => {
        data.collection.push(record);
        None
      }
    };
    self.persist(&data)?;
    Ok(previous)
  }

  fn remove_record(&self, track_id: TrackId) -> Result<Option<CollectionRecord>, StoreError> {
    let mut data = self.lock();
    let Some(index) = data.collection.iter().position(|r| r.track_id == track_id) else {
      return Ok(None);
    };
    let removed = data.collection.remove(index);
    self.persist(&data)?;
    Ok(Some(removed))
  }

  fn update_record_printing(
    &self,
    track_id: TrackId,
    name: &str,
    set_code: &str,
    price_usd: Option<f64>,
  ) -> Result<bool, StoreError> {
    let mut data = self.lock();
    let name = normalize_name(name);
    let Some(record) = data
      .collection
      .iter_mut()
      .find(|r| r.track_id == track_id && normalize_name(&r.normalized_name) == name)
    else {
      debug!("{} 的收藏记录不存在或已改为其他卡，跳过版本更新", track_id);
      return Ok(false);
    };
    record.set_code = set_code.to_string();
    record.price_usd = price_usd;
    self.persist(&data)?;
    Ok(true)
  }

  fn next_track_id(&self) -> Result<TrackId, StoreError> {
    let data = self.lock();
    Ok(
      data
        .collection
        .iter()
        .map(|r| TrackId(r.track_id.0 + 1))
        .max()
        .unwrap_or(TrackId(0)),
    )
  }

  fn stats(&self) -> Result<CollectionStats, StoreError> {
    Ok(CollectionStats::from_records(&self.lock().collection))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  fn record(id: u64, name: &str, price: Option<f64>) -> CollectionRecord {
    CollectionRecord {
      track_id: TrackId(id),
      display_name: name.to_string(),
      normalized_name: normalize_name(name),
      set_code: "mrd".to_string(),
      price_usd: price,
      image_path: PathBuf::from(format!("/tmp/{}.png", id)),
      confidence: 0.9,
      scanned_at: 0,
    }
  }

  #[test]
  fn alias_is_tri_state() {
    let store = JsonStore::in_memory();
    assert_eq!(store.alias("iron myr").unwrap(), AliasLookup::Unknown);
    store.put_alias("Iron Myr ", Some("Iron Myr")).unwrap();
    store.put_alias("lron Mvr", None).unwrap();
    assert_eq!(
      store.alias(" iron myr").unwrap(),
      AliasLookup::Resolved("iron myr".to_string())
    );
    assert_eq!(store.alias("LRON MVR").unwrap(), AliasLookup::Invalid);
  }

  #[test]
  fn records_are_replaced_per_track() {
    let store = JsonStore::in_memory();
    assert!(store.upsert_record(record(1, "Iron Myr", Some(0.5))).unwrap().is_none());
    let previous = store
      .upsert_record(record(1, "Giant Growth", Some(0.25)))
      .unwrap()
      .unwrap();
    assert_eq!(previous.display_name, "Iron Myr");
    store.upsert_record(record(2, "Shivan Dragon", Some(3.0))).unwrap();
    store.upsert_record(record(3, "Forest", None)).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_count, 3);
    assert_abs_diff_eq!(stats.total_value, 3.25);
    assert_eq!(stats.top_card, Some(("Shivan Dragon".to_string(), 3.0)));

    assert!(store.remove_record(TrackId(2)).unwrap().is_some());
    assert!(store.remove_record(TrackId(2)).unwrap().is_none());
    assert_eq!(store.stats().unwrap().total_count, 2);
  }

  #[test]
  fn printing_update_requires_same_card() {
    let store = JsonStore::in_memory();
    store.upsert_record(record(4, "Iron Myr", Some(0.25))).unwrap();
    assert!(store.update_record_printing(TrackId(4), "IRON MYR", "som", Some(1.5)).unwrap());
    let updated = store.record(TrackId(4)).unwrap().unwrap();
    assert_eq!(updated.set_code, "som");
    assert_eq!(updated.price_usd, Some(1.5));

    // 记录已被换成另一张卡，旧卡的版本不能写进去
    store.upsert_record(record(4, "Shivan Dragon", Some(3.0))).unwrap();
    assert!(!store.update_record_printing(TrackId(4), "Iron Myr", "mrd", Some(0.1)).unwrap());
    let current = store.record(TrackId(4)).unwrap().unwrap();
    assert_eq!(current, record(4, "Shivan Dragon", Some(3.0)));
    assert!(!store.update_record_printing(TrackId(5), "Iron Myr", "mrd", None).unwrap());
  }

  #[test]
  fn next_track_id_follows_persisted_records() {
    let store = JsonStore::in_memory();
    assert_eq!(store.next_track_id().unwrap(), TrackId(0));
    store.upsert_record(record(7, "Iron Myr", None)).unwrap();
    store.upsert_record(record(2, "Forest", None)).unwrap();
    assert_eq!(store.next_track_id().unwrap(), TrackId(8));
  }

  #[test]
  fn json_file_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("jianka-store-{}", std::process::id()));
    let url = Url::parse(&format!("json://{}/db.json", dir.display())).unwrap();
    {
      let store = JsonStore::from_url(&url).unwrap();
      store.put_alias("Iron Myr", Some("Iron Myr")).unwrap();
      store.put_alias("garbage", None).unwrap();
      store
        .upsert_catalog(CatalogEntry {
          normalized_name: "Iron Myr".to_string(),
          display_name: "Iron Myr".to_string(),
          printing_id: "abc".to_string(),
          set_code: "mrd".to_string(),
          set_name: "Mirrodin".to_string(),
          collector_number: "235".to_string(),
          rarity: "common".to_string(),
          release_date: "2003-10-02".to_string(),
          image_ref: None,
          price_usd: Some(0.3),
          fetched_at: 0,
        })
        .unwrap();
      store.upsert_record(record(7, "Iron Myr", Some(0.3))).unwrap();
    }

    let store = JsonStore::from_url(&url).unwrap();
    assert_eq!(store.alias("garbage").unwrap(), AliasLookup::Invalid);
    assert_eq!(store.catalog("IRON MYR").unwrap().unwrap().printing_id, "abc");
    assert_eq!(store.record(TrackId(7)).unwrap().unwrap().display_name, "Iron Myr");
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn rejects_unknown_scheme() {
    let url = Url::parse("sqlite:///tmp/db").unwrap();
    assert!(matches!(JsonStore::from_url(&url), Err(StoreError::SchemeMismatch)));
    assert!(JsonStore::from_url(&Url::parse("memory:").unwrap()).is_ok());
  }
}
