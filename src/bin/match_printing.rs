// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/bin/match_printing.rs - 对单张卡面做版本匹配
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
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use jianka::{
  FromUrl,
  matcher::{LocalThumbnailSource, MatcherConfig, PrintingMatcher, ThumbnailCache},
  service::{FixtureService, MetadataService},
  utils::url_to_path,
};

/// Jianka 版本匹配参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 校正后的卡面图像
  #[arg(long, value_name = "FILE")]
  pub scan: PathBuf,
  /// 卡名
  #[arg(long, value_name = "NAME")]
  pub name: String,
  /// 离线卡牌数据，例如 fixture:///data/printings.json
  #[arg(long, value_name = "SERVICE")]
  pub service: Url,
  /// 缩略图缓存目录，例如 folder:///data/thumbs
  #[arg(long, value_name = "THUMBNAILS")]
  pub thumbnails: Url,
  /// 同分时优先的发行年份
  #[arg(long, default_value = "2015", value_name = "YEAR")]
  pub preferred_year: i32,
  /// 颜色相似度权重
  #[arg(long, default_value = "25.0", value_name = "WEIGHT")]
  pub color_weight: f32,
  /// 输出前几名
  #[arg(long, default_value = "3", value_name = "N")]
  pub top: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  info!("卡面图像: {}", args.scan.display());
  info!("卡牌数据: {}", args.service);

  let scan = image::open(&args.scan)?.into_rgb8();
  let service = FixtureService::from_url(&args.service)?;
  let candidates = service.all_printings(&args.name)?;
  if candidates.is_empty() {
    anyhow::bail!("没有找到 {} 的任何版本", args.name);
  }

  let cache = ThumbnailCache::new(url_to_path(&args.thumbnails), Arc::new(LocalThumbnailSource))?;
  let matcher = PrintingMatcher::new(
    MatcherConfig::default()
      .with_preferred_year(args.preferred_year)
      .with_color_weight(args.color_weight),
  );

  let ranked = matcher.rank(&scan, &candidates, &cache);
  if ranked.is_empty() {
    anyhow::bail!("所有版本的缩略图都不可用");
  }
  for (i, candidate) in ranked.iter().take(args.top).enumerate() {
    println!(
      "{}\t{}\t{}\t{:.2}\t{}\t{:.2}\t{}",
      i + 1,
      candidate.printing.set_code.to_uppercase(),
      candidate.printing.id,
      candidate.score,
      candidate.distance,
      candidate.color,
      if candidate.rotated { "180" } else { "0" }
    );
  }
  Ok(())
}
