// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/service.rs - 远程卡牌元数据服务接口与限速
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

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  utils::{normalize_name, url_to_path},
};

const API_MIN_DELAY: Duration = Duration::from_millis(100);

/// 一个具体版本（系列/印刷）的卡牌记录，获取后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printing {
  pub id: String,
  pub name: String,
  pub set_code: String,
  #[serde(default)]
  pub set_name: String,
  #[serde(default)]
  pub collector_number: String,
  #[serde(default)]
  pub rarity: String,
  /// `YYYY-MM-DD`
  #[serde(default)]
  pub release_date: String,
  /// 缩略图引用（URL 或本地路径）
  #[serde(default)]
  pub thumbnail: Option<String>,
  #[serde(default)]
  pub price_usd: Option<f64>,
}

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("请求失败: {0}")]
  Transport(String),
}

/// 远程元数据服务。`Ok(None)` / 空列表表示查无此卡，`Err` 表示本次调用失败，
/// 调用方不做自动重试。
pub trait MetadataService {
  /// 模糊卡名查询，返回一条规范记录
  fn by_name(&self, text: &str) -> Result<Option<Printing>, ServiceError>;
  /// 某张卡的全部已知版本
  fn all_printings(&self, name: &str) -> Result<Vec<Printing>, ServiceError>;
}

impl<T: MetadataService + ?Sized> MetadataService for Arc<T> {
  fn by_name(&self, text: &str) -> Result<Option<Printing>, ServiceError> {
    (**self).by_name(text)
  }

  fn all_printings(&self, name: &str) -> Result<Vec<Printing>, ServiceError> {
    (**self).all_printings(name)
  }
}

/// 进程内共享的“上次调用时间”，保证两次远程调用之间至少间隔 `min_delay`。
/// 未到间隔时调用方阻塞等待而不是失败。
#[derive(Debug)]
pub struct RateLimiter {
  min_delay: Duration,
  last_call: Mutex<Option<Instant>>,
}

impl Default for RateLimiter {
  fn default() -> Self {
    Self::new(API_MIN_DELAY)
  }
}

impl RateLimiter {
  pub fn new(min_delay: Duration) -> Self {
    Self {
      min_delay,
      last_call: Mutex::new(None),
    }
  }

  pub fn min_delay(&self) -> Duration {
    self.min_delay
  }

  pub fn wait(&self) {
    // 持锁睡眠，多个调用方因此被串行地间隔开
    let mut last_call = match self.last_call.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(last) = *last_call {
      let elapsed = last.elapsed();
      if elapsed < self.min_delay {
        let remaining = self.min_delay - elapsed;
        debug!("限速等待 {:.2?}", remaining);
        std::thread::sleep(remaining);
      }
    }
    *last_call = Some(Instant::now());
  }
}

/// 给任意 [`MetadataService`] 加上共享限速
pub struct RateLimited<S> {
  inner: S,
  limiter: Arc<RateLimiter>,
}

impl<S> RateLimited<S> {
  pub fn new(inner: S, limiter: Arc<RateLimiter>) -> Self {
    Self { inner, limiter }
  }

  pub fn limiter(&self) -> &Arc<RateLimiter> {
    &self.limiter
  }
}

impl<S: MetadataService> MetadataService for RateLimited<S> {
  fn by_name(&self, text: &str) -> Result<Option<Printing>, ServiceError> {
    self.limiter.wait();
    info!("查询卡名: {}", text);
    let result = self.inner.by_name(text);
    match &result {
      Ok(Some(printing)) => debug!("查询成功: {}", printing.name),
      Ok(None) => info!("未找到卡牌: {}", text),
      Err(e) => warn!("查询失败: {}", e),
    }
    result
  }

  fn all_printings(&self, name: &str) -> Result<Vec<Printing>, ServiceError> {
    self.limiter.wait();
    info!("查询全部版本: {}", name);
    let result = self.inner.all_printings(name);
    if let Err(e) = &result {
      warn!("版本查询失败: {}", e);
    }
    result
  }
}

/// 从 JSON 文件（`Printing` 数组）提供数据的元数据服务，用于离线回放和测试。
/// 卡名查询先做归一化精确匹配，再做前缀匹配；每个卡名的规范记录取文件中的第一条。
#[derive(Debug, Clone, Default)]
pub struct FixtureService {
  printings: Vec<Printing>,
}

impl FromUrlWithScheme for FixtureService {
  const SCHEME: &'static str = "fixture";
}

#[derive(Error, Debug)]
pub enum FixtureServiceError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

impl FromUrl for FixtureService {
  type Error = FixtureServiceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FixtureServiceError::SchemeMismatch);
    }
    let content = std::fs::read_to_string(url_to_path(url))?;
    let printings: Vec<Printing> = serde_json::from_str(&content)?;
    info!("加载离线卡牌数据 {} 条", printings.len());
    Ok(Self::new(printings))
  }
}

impl FixtureService {
  pub fn new(printings: Vec<Printing>) -> Self {
    Self { printings }
  }
}

impl MetadataService for FixtureService {
  fn by_name(&self, text: &str) -> Result<Option<Printing>, ServiceError> {
    let query = normalize_name(text);
    if query.is_empty() {
      return Ok(None);
    }
    let exact = self
      .printings
      .iter()
      .find(|p| normalize_name(&p.name) == query);
    let found = exact.or_else(|| {
      self
        .printings
        .iter()
        .find(|p| normalize_name(&p.name).starts_with(&query))
    });
    Ok(found.cloned())
  }

  fn all_printings(&self, name: &str) -> Result<Vec<Printing>, ServiceError> {
    let query = normalize_name(name);
    Ok(
      self
        .printings
        .iter()
        .filter(|p| normalize_name(&p.name) == query)
        .cloned()
        .collect(),
    )
  }
}
