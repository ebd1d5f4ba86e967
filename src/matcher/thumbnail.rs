// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/matcher/thumbnail.rs - 参考缩略图磁盘缓存
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
use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{matcher::ReferenceImages, service::Printing};

#[derive(Error, Debug)]
pub enum ThumbnailError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("不支持的缩略图引用: {0}")]
  Unsupported(String),
}

/// 按引用取回缩略图的原始字节（下载、读文件等）
pub trait ThumbnailSource: Send + Sync {
  fn fetch(&self, reference: &str) -> Result<Vec<u8>, ThumbnailError>;
}

/// 引用为本地路径或 `file://` URL 的缩略图来源
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalThumbnailSource;

impl ThumbnailSource for LocalThumbnailSource {
  fn fetch(&self, reference: &str) -> Result<Vec<u8>, ThumbnailError> {
    let path = match url::Url::parse(reference) {
      Ok(url) if url.scheme() == "file" => crate::utils::url_to_path(&url),
      Ok(url) if url.scheme().len() > 1 => {
        return Err(ThumbnailError::Unsupported(reference.to_string()));
      }
      // 解析失败或 Windows 盘符（`C:\..`）按本地路径处理
      _ => PathBuf::from(reference),
    };
    Ok(std::fs::read(path)?)
  }
}

/// 以印刷 id 为键、只追加的磁盘缓存。并发读总是安全；
/// 写入先写临时文件再改名，同一 id 内容确定，竞争时后写者覆盖即可。
#[derive(Clone)]
pub struct ThumbnailCache {
  directory: PathBuf,
  source: Arc<dyn ThumbnailSource>,
}

impl ThumbnailCache {
  pub fn new(directory: impl Into<PathBuf>, source: Arc<dyn ThumbnailSource>) -> Result<Self, ThumbnailError> {
    let directory = directory.into();
    std::fs::create_dir_all(&directory)?;
    Ok(Self { directory, source })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn path_for(&self, id: &str) -> PathBuf {
    let stem: String = id
      .chars()
      .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
      .collect();
    self.directory.join(format!("{}_small.thumb", stem))
  }

  pub fn load(&self, printing: &Printing) -> Result<RgbImage, ThumbnailError> {
    let path = self.path_for(&printing.id);
    if path.exists() {
      match std::fs::read(&path)
        .map_err(ThumbnailError::from)
        .and_then(|bytes| Ok(image::load_from_memory(&bytes)?))
      {
        Ok(image) => return Ok(image.into_rgb8()),
        Err(e) => warn!("缓存缩略图损坏，重新获取 {}: {}", path.display(), e),
      }
    }

    let reference = printing
      .thumbnail
      .as_deref()
      .ok_or_else(|| ThumbnailError::Unsupported(format!("{} 没有缩略图", printing.id)))?;
    let bytes = self.source.fetch(reference)?;
    let image = image::load_from_memory(&bytes)?.into_rgb8();

    let tmp = path.with_extension(format!(
      "tmp-{}-{:?}",
      std::process::id(),
      std::thread::current().id()
    ));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, &path)?;
    debug!("缓存缩略图 {}", path.display());

    Ok(image)
  }
}

impl ReferenceImages for ThumbnailCache {
  fn reference(&self, printing: &Printing) -> Option<RgbImage> {
    match self.load(printing) {
      Ok(image) => Some(image),
      Err(e) => {
        warn!("缩略图不可用 {} ({}): {}", printing.id, printing.set_code, e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingSource {
    bytes: Vec<u8>,
    calls: AtomicUsize,
  }

  impl ThumbnailSource for CountingSource {
    fn fetch(&self, _reference: &str) -> Result<Vec<u8>, ThumbnailError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.bytes.clone())
    }
  }

  fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(6, 4, image::Rgb([10, 200, 30]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
      .unwrap();
    bytes
  }

  fn printing(id: &str, thumbnail: Option<&str>) -> Printing {
    Printing {
      id: id.to_string(),
      name: "Iron Myr".to_string(),
      set_code: "mrd".to_string(),
      set_name: String::new(),
      collector_number: String::new(),
      rarity: String::new(),
      release_date: String::new(),
      thumbnail: thumbnail.map(str::to_string),
      price_usd: None,
    }
  }

  #[test]
  fn fetches_once_then_serves_from_disk() {
    let dir = std::env::temp_dir().join(format!("jianka-thumbs-{}", std::process::id()));
    let source = Arc::new(CountingSource {
      bytes: png_bytes(),
      calls: AtomicUsize::new(0),
    });
    let cache = ThumbnailCache::new(&dir, source.clone()).unwrap();
    let p = printing("abc-123", Some("https://example.invalid/abc.png"));

    assert_eq!(cache.load(&p).unwrap().dimensions(), (6, 4));
    assert_eq!(cache.load(&p).unwrap().dimensions(), (6, 4));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(cache.path_for("abc-123").exists());

    assert!(cache.reference(&printing("no-thumb", None)).is_none());
    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn local_source_reads_paths() {
    let dir = std::env::temp_dir().join(format!("jianka-local-thumb-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ref.png");
    std::fs::write(&path, png_bytes()).unwrap();

    let plain = LocalThumbnailSource.fetch(path.to_str().unwrap()).unwrap();
    let url = LocalThumbnailSource
      .fetch(&format!("file://{}", path.display()))
      .unwrap();
    assert_eq!(plain, url);
    assert!(matches!(
      LocalThumbnailSource.fetch("https://example.invalid/a.png"),
      Err(ThumbnailError::Unsupported(_))
    ));
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
