// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/ocr.rs - 卡名读取：方向试探与识别质量评分
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

use image::{RgbImage, imageops};
use tracing::debug;

use crate::model::TextRecognizer;

const ALPHA_NORM: usize = 15;
const LENGTH_WEIGHT: f32 = 0.6;
const CONFIDENCE_WEIGHT: f32 = 0.4;
const PRETEXT_SCORE: f32 = 0.5;
const TITLE_BAND: f32 = 0.15;

/// 识别质量评分权重
#[derive(Debug, Clone)]
pub struct ScoreWeights {
  /// 长度项的归一化字母数
  pub alpha_norm: usize,
  /// 为 true 时字母数超过 `alpha_norm` 按满分计，长标题不会压过置信度；
  /// 为 false 时长度项不封顶
  pub cap_length: bool,
  pub length_weight: f32,
  pub confidence_weight: f32,
  /// 直接给定卡名（跳过识别）时使用的分数
  pub pretext_score: f32,
}

impl Default for ScoreWeights {
  fn default() -> Self {
    Self {
      alpha_norm: ALPHA_NORM,
      cap_length: true,
      length_weight: LENGTH_WEIGHT,
      confidence_weight: CONFIDENCE_WEIGHT,
      pretext_score: PRETEXT_SCORE,
    }
  }
}

impl ScoreWeights {
  pub fn with_pretext_score(mut self, pretext_score: f32) -> Self {
    self.pretext_score = pretext_score;
    self
  }

  pub fn with_length_cap(mut self, cap_length: bool) -> Self {
    self.cap_length = cap_length;
    self
  }

  /// `length_weight · alpha / alpha_norm + confidence_weight · confidence`，
  /// 默认 alpha 封顶于 `alpha_norm`
  pub fn score(&self, text: &str, confidence: f32) -> f32 {
    let mut alpha = text.chars().filter(|c| c.is_alphabetic()).count();
    if self.cap_length {
      alpha = alpha.min(self.alpha_norm);
    }
    let length = alpha as f32 / self.alpha_norm.max(1) as f32;
    length * self.length_weight + confidence * self.confidence_weight
  }
}

/// 一次读取的结果，`image` 为方向已摆正的卡面
#[derive(Debug, Clone)]
pub struct TitleReading {
  pub text: String,
  pub confidence: f32,
  pub score: f32,
  pub image: RgbImage,
}

pub struct TitleReader<R> {
  recognizer: R,
  weights: ScoreWeights,
  band: f32,
}

impl<R: TextRecognizer> TitleReader<R> {
  pub fn new(recognizer: R) -> Self {
    Self {
      recognizer,
      weights: ScoreWeights::default(),
      band: TITLE_BAND,
    }
  }

  pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
    self.weights = weights;
    self
  }

  /// 标题带占图像高度的比例
  pub fn with_band(mut self, band: f32) -> Self {
    self.band = band.clamp(0.01, 1.0);
    self
  }

  pub fn weights(&self) -> &ScoreWeights {
    &self.weights
  }

  fn trial(&self, image: RgbImage) -> TitleReading {
    let band_height = ((image.height() as f32 * self.band) as u32).clamp(1, image.height().max(1));
    let band = imageops::crop_imm(&image, 0, 0, image.width(), band_height).to_image();
    let (text, confidence) = self.recognizer.read(&band);
    let score = self.weights.score(&text, confidence);
    debug!("标题识别: {:?} 置信度 {:.2} 得分 {:.2}", text, confidence, score);
    TitleReading {
      text,
      confidence,
      score,
      image,
    }
  }

  /// 竖版试 0° / 180°，横版试顺时针 / 逆时针 90°，取得分最高者（同分取先试的）
  pub fn read(&self, card: &RgbImage) -> TitleReading {
    let candidates = if card.height() > card.width() {
      [card.clone(), imageops::rotate180(card)]
    } else {
      [imageops::rotate90(card), imageops::rotate270(card)]
    };

    let [first, second] = candidates.map(|image| self.trial(image));
    if second.score > first.score { second } else { first }
  }
}
