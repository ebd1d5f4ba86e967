// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/input/read_image_file.rs - 图像目录输入
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

use std::path::PathBuf;

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, input::Frame, utils::url_to_path};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum ImageFolderInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Empty folder: {0}")]
  EmptyFolder(String),
}

/// 按文件名顺序把目录中的图片当作连续视频帧读出。
/// `?fps=N` 查询参数决定时间戳步长（默认 30）。
pub struct ImageFolderInput {
  files: std::vec::IntoIter<PathBuf>,
  index: u64,
  frame_interval_ms: u64,
}

impl FromUrlWithScheme for ImageFolderInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageFolderInput {
  type Error = ImageFolderInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFolderInputError::SchemaMismatch);
    }

    let fps: u64 = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(30);

    let directory = url_to_path(url);
    let mut files: Vec<PathBuf> = std::fs::read_dir(&directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        path
          .extension()
          .and_then(|ext| ext.to_str())
          .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
          .unwrap_or(false)
      })
      .collect();
    files.sort();

    if files.is_empty() {
      return Err(ImageFolderInputError::EmptyFolder(
        directory.display().to_string(),
      ));
    }
    info!("图像目录 {} 共 {} 帧", directory.display(), files.len());

    Ok(ImageFolderInput {
      files: files.into_iter(),
      index: 0,
      frame_interval_ms: 1000 / fps,
    })
  }
}

impl Iterator for ImageFolderInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    for path in self.files.by_ref() {
      let decoded = ImageReader::open(&path)
        .map_err(image::ImageError::IoError)
        .and_then(|reader| reader.decode());
      match decoded {
        Ok(image) => {
          let index = self.index;
          self.index += 1;
          return Some(Frame {
            image: image.into_rgb8(),
            index,
            timestamp_ms: index * self.frame_interval_ms,
          });
        }
        Err(e) => warn!("跳过无法解码的图像 {}: {}", path.display(), e),
      }
    }
    None
  }
}
