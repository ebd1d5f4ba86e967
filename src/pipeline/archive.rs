// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/pipeline/archive.rs - 已识别卡面的按日期归档
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  FromUrl, FromUrlWithScheme,
  tracker::TrackId,
  utils::{safe_file_stem, url_to_path},
};

#[derive(Error, Debug)]
pub enum ArchiveError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 归档目录，文件位于 `<dir>/YYYY/MM/DD/<卡名>_<时间戳>_<跟踪号>.png`
#[derive(Debug, Clone)]
pub struct ScanArchive {
  directory: PathBuf,
}

impl FromUrlWithScheme for ScanArchive {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ScanArchive {
  type Error = ArchiveError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(ArchiveError::SchemeMismatch);
    }
    Ok(Self::new(url_to_path(uri)))
  }
}

impl ScanArchive {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn card_path(&self, name: &str, track_id: TrackId) -> Result<PathBuf, ArchiveError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}_{}_{}.png",
      safe_file_stem(name),
      now.timestamp(),
      track_id
    )))
  }

  pub fn save(&self, name: &str, track_id: TrackId, image: &RgbImage) -> Result<PathBuf, ArchiveError> {
    let path = self.card_path(name, track_id)?;
    image.save(&path)?;
    debug!("归档卡面 {}", path.display());
    Ok(path)
  }

  /// 删除归档文件，文件不存在视为成功
  pub fn remove(&self, path: &Path) -> Result<(), ArchiveError> {
    match std::fs::remove_file(path) {
      Ok(()) => {
        debug!("删除归档 {}", path.display());
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!("归档文件已不存在 {}", path.display());
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }
}
