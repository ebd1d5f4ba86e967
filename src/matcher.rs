// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/matcher.rs - 版本匹配：差值哈希 + 色相/饱和度直方图
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

//! # 版本匹配
//!
//! 同一张卡往往有几十个印刷版本，卡名相同、画面相近。本模块把校正后的卡面
//! 与每个候选版本的参考缩略图逐一比较，选出最接近的那一个。
//!
//! ## 评分
//!
//! - **结构距离**：灰度缩放到 `(n+1) x n` 后比较水平相邻像素得到 `n*n` 位的差值哈希，
//!   取汉明距离。扫描方向未知，因此探针图像按原方向和旋转 180° 各算一次，取较小者。
//! - **颜色相似度**：在选定方向上，把两张图转到 HSV 空间，丢弃亮度，
//!   统计色相 x 饱和度二维直方图，做最小-最大归一化后求相关系数，截断到 [0, 1]。
//! - **综合得分**：`结构距离 - 颜色相似度 * color_weight`，越小越好。
//!   颜色只能缩小结构上难以区分的差距，不能完全推翻结构结论。
//!
//! 排序键为 `(综合得分, |发行年份 - 偏好年份|)`，年份只用于打破平局。
//! 取不到缩略图的候选直接排除，不会被当作匹配。
//!
//! ## 基本用法
//!
//! ```no_run
//! use std::sync::Arc;
//! use jianka::matcher::{PrintingMatcher, ThumbnailCache, LocalThumbnailSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ThumbnailCache::new("data/thumbs", Arc::new(LocalThumbnailSource))?;
//! let scan = image::open("scan.png")?.into_rgb8();
//! let candidates = vec![/* MetadataService::all_printings(...) */];
//! if let Some(best) = PrintingMatcher::default().find_best_match(&scan, &candidates, &cache) {
//!   println!("{} {}", best.printing.set_code, best.score);
//! }
//! # Ok(())
//! # }
//! ```

use image::{GrayImage, RgbImage, imageops};
use tracing::{debug, info};

use crate::{service::Printing, utils::release_year};

mod thumbnail;
pub use self::thumbnail::{LocalThumbnailSource, ThumbnailCache, ThumbnailError, ThumbnailSource};

const HASH_SIZE: u32 = 16;
const HUE_BINS: usize = 30;
const SATURATION_BINS: usize = 32;
const COLOR_WEIGHT: f32 = 25.0;
const PREFERRED_YEAR: i32 = 2015;
const UNKNOWN_YEAR_DELTA: i32 = 999;

/// 按印刷版本取参考图像，取不到返回 None
pub trait ReferenceImages {
  fn reference(&self, printing: &Printing) -> Option<RgbImage>;
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
  pub hash_size: u32,
  pub hue_bins: usize,
  pub saturation_bins: usize,
  pub color_weight: f32,
  pub preferred_year: i32,
}

impl Default for MatcherConfig {
  fn default() -> Self {
    Self {
      hash_size: HASH_SIZE,
      hue_bins: HUE_BINS,
      saturation_bins: SATURATION_BINS,
      color_weight: COLOR_WEIGHT,
      preferred_year: PREFERRED_YEAR,
    }
  }
}

impl MatcherConfig {
  pub fn with_preferred_year(mut self, preferred_year: i32) -> Self {
    self.preferred_year = preferred_year;
    self
  }

  pub fn with_color_weight(mut self, color_weight: f32) -> Self {
    self.color_weight = color_weight;
    self
  }
}

/// 差值哈希，按行展开，第 i 位为 1 表示该行右侧像素比左侧亮
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DHash {
  words: Vec<u64>,
  bits: usize,
}

impl DHash {
  pub fn compute(image: &RgbImage, hash_size: u32) -> Self {
    let gray: GrayImage = imageops::grayscale(image);
    let resized = imageops::resize(
      &gray,
      hash_size + 1,
      hash_size,
      imageops::FilterType::Triangle,
    );

    let bits = (hash_size * hash_size) as usize;
    let mut words = vec![0u64; bits.div_ceil(64)];
    let mut bit = 0usize;
    for y in 0..hash_size {
      for x in 0..hash_size {
        let left = resized.get_pixel(x, y)[0];
        let right = resized.get_pixel(x + 1, y)[0];
        if right > left {
          words[bit / 64] |= 1u64 << (bit % 64);
        }
        bit += 1;
      }
    }
    Self { words, bits }
  }

  pub fn bits(&self) -> usize {
    self.bits
  }

  pub fn hamming(&self, other: &DHash) -> u32 {
    self
      .words
      .iter()
      .zip(other.words.iter())
      .map(|(a, b)| (a ^ b).count_ones())
      .sum()
  }
}

/// 色相 x 饱和度直方图（OpenCV 8 位 HSV 约定：H ∈ [0,180)，S ∈ [0,256)）
#[derive(Debug, Clone)]
pub struct HsHistogram {
  bins: Vec<f32>,
}

impl HsHistogram {
  pub fn compute(image: &RgbImage, hue_bins: usize, saturation_bins: usize) -> Self {
    let mut bins = vec![0f32; hue_bins * saturation_bins];
    for pixel in image.pixels() {
      let (h, s) = hue_saturation(pixel.0);
      let hi = ((h * hue_bins as f32 / 180.0) as usize).min(hue_bins - 1);
      let si = ((s * saturation_bins as f32 / 256.0) as usize).min(saturation_bins - 1);
      bins[hi * saturation_bins + si] += 1.0;
    }

    // 最小-最大归一化到 [0, 1]
    let min = bins.iter().copied().fold(f32::INFINITY, f32::min);
    let max = bins.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > min {
      for v in bins.iter_mut() {
        *v = (*v - min) / (max - min);
      }
    }
    Self { bins }
  }

  /// 相关系数，负相关截断为 0
  pub fn correlation(&self, other: &HsHistogram) -> f32 {
    let n = self.bins.len().min(other.bins.len());
    if n == 0 {
      return 0.0;
    }
    let mean_a = self.bins[..n].iter().map(|v| *v as f64).sum::<f64>() / n as f64;
    let mean_b = other.bins[..n].iter().map(|v| *v as f64).sum::<f64>() / n as f64;

    let (mut num, mut var_a, mut var_b) = (0f64, 0f64, 0f64);
    for (a, b) in self.bins[..n].iter().zip(other.bins[..n].iter()) {
      let da = *a as f64 - mean_a;
      let db = *b as f64 - mean_b;
      num += da * db;
      var_a += da * da;
      var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
      return if self.bins == other.bins { 1.0 } else { 0.0 };
    }
    (num / denom).clamp(0.0, 1.0) as f32
  }
}

fn hue_saturation([r, g, b]: [u8; 3]) -> (f32, f32) {
  let (r, g, b) = (r as f32, g as f32, b as f32);
  let max = r.max(g).max(b);
  let min = r.min(g).min(b);
  let delta = max - min;

  let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
  let hue_degrees = if delta <= 0.0 {
    0.0
  } else if max == r {
    60.0 * ((g - b) / delta)
  } else if max == g {
    60.0 * ((b - r) / delta) + 120.0
  } else {
    60.0 * ((r - g) / delta) + 240.0
  };
  let hue_degrees = if hue_degrees < 0.0 { hue_degrees + 360.0 } else { hue_degrees };

  (hue_degrees / 2.0, saturation)
}

/// 单个候选版本的比较结果
#[derive(Debug, Clone)]
pub struct CandidateScore<'a> {
  pub printing: &'a Printing,
  /// 结构距离（汉明距离，取两个方向中较小者）
  pub distance: u32,
  /// 颜色相似度 [0, 1]
  pub color: f32,
  /// 综合得分，越小越好
  pub score: f32,
  pub year_delta: i32,
  /// 探针图像是否旋转了 180° 才对齐参考图
  pub rotated: bool,
}

/// 探针图像的两个方向及其哈希，对所有候选只算一次
struct Probe {
  upright: RgbImage,
  flipped: RgbImage,
  upright_hash: DHash,
  flipped_hash: DHash,
}

#[derive(Debug, Clone, Default)]
pub struct PrintingMatcher {
  config: MatcherConfig,
}

impl PrintingMatcher {
  pub fn new(config: MatcherConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &MatcherConfig {
    &self.config
  }

  fn probe(&self, scan: &RgbImage) -> Probe {
    let flipped = imageops::rotate180(scan);
    Probe {
      upright_hash: DHash::compute(scan, self.config.hash_size),
      flipped_hash: DHash::compute(&flipped, self.config.hash_size),
      upright: scan.clone(),
      flipped,
    }
  }

  fn year_delta(&self, printing: &Printing) -> i32 {
    release_year(&printing.release_date)
      .map(|year| (year - self.config.preferred_year).abs())
      .unwrap_or(UNKNOWN_YEAR_DELTA)
  }

  fn score_against<'a>(
    &self,
    probe: &Probe,
    printing: &'a Printing,
    reference: &RgbImage,
  ) -> CandidateScore<'a> {
    let reference_hash = DHash::compute(reference, self.config.hash_size);
    let upright = probe.upright_hash.hamming(&reference_hash);
    let flipped = probe.flipped_hash.hamming(&reference_hash);
    let (distance, rotated, aligned) = if upright < flipped {
      (upright, false, &probe.upright)
    } else {
      (flipped, true, &probe.flipped)
    };

    // 先把探针缩放到参考图尺寸，保证直方图可比
    let (w, h) = reference.dimensions();
    let resized;
    let aligned = if aligned.dimensions() == (w, h) {
      aligned
    } else {
      resized = imageops::resize(aligned, w, h, imageops::FilterType::Triangle);
      &resized
    };
    let color = HsHistogram::compute(aligned, self.config.hue_bins, self.config.saturation_bins)
      .correlation(&HsHistogram::compute(
        reference,
        self.config.hue_bins,
        self.config.saturation_bins,
      ));

    CandidateScore {
      printing,
      distance,
      color,
      score: distance as f32 - color * self.config.color_weight,
      year_delta: self.year_delta(printing),
      rotated,
    }
  }

  /// 单独比较一张扫描图与一张参考图
  pub fn compare<'a>(&self, scan: &RgbImage, printing: &'a Printing, reference: &RgbImage) -> CandidateScore<'a> {
    self.score_against(&self.probe(scan), printing, reference)
  }

  /// 对所有取得到参考图的候选打分并排序，最好的在前
  pub fn rank<'a, R: ReferenceImages + ?Sized>(
    &self,
    scan: &RgbImage,
    candidates: &'a [Printing],
    references: &R,
  ) -> Vec<CandidateScore<'a>> {
    if candidates.is_empty() {
      return Vec::new();
    }
    let probe = self.probe(scan);
    info!("开始比较 {} 个版本", candidates.len());

    let mut scored: Vec<CandidateScore<'a>> = candidates
      .iter()
      .filter_map(|printing| {
        let reference = references.reference(printing)?;
        Some(self.score_against(&probe, printing, &reference))
      })
      .collect();
    scored.sort_by(|a, b| {
      a.score
        .total_cmp(&b.score)
        .then(a.year_delta.cmp(&b.year_delta))
    });

    for (i, s) in scored.iter().take(3).enumerate() {
      info!(
        "  #{} {}: 得分 {:.1} (距离 {} | 颜色 {:.2}{})",
        i + 1,
        s.printing.set_code.to_uppercase(),
        s.score,
        s.distance,
        s.color,
        if s.rotated { " | 180°" } else { "" }
      );
    }
    debug!("可比较版本 {}/{}", scored.len(), candidates.len());
    scored
  }

  pub fn find_best_match<'a, R: ReferenceImages + ?Sized>(
    &self,
    scan: &RgbImage,
    candidates: &'a [Printing],
    references: &R,
  ) -> Option<CandidateScore<'a>> {
    self.rank(scan, candidates, references).into_iter().next()
  }
}
