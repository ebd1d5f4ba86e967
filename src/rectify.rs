// 该文件是 Jianka （鉴卡） 项目的一部分。
// src/rectify.rs - 透视校正：把检测框内的卡片拉平为标准尺寸
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

use image::{GrayImage, Rgb, RgbImage, imageops};
use imageproc::{
  contours::{BorderType, find_contours},
  edges::canny,
  filter::gaussian_blur_f32,
  geometric_transformations::{Interpolation, Projection, warp_into},
  geometry::{approximate_polygon_dp, arc_length},
  point::Point,
};
use tracing::debug;

use crate::geometry::Rect;

const CARD_SHORT_SIDE: u32 = 630;
const CARD_LONG_SIDE: u32 = 880;
const CROP_PADDING: f32 = 20.0;
const BLUR_SIGMA: f32 = 1.1;
const CANNY_LOW: f32 = 75.0;
const CANNY_HIGH: f32 = 200.0;
const CONTOUR_CANDIDATES: usize = 5;
const APPROX_EPSILON_RATIO: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
  Portrait,
  Landscape,
}

/// 标准卡面尺寸，竖版为 short x long，横版对调
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalSize {
  pub short: u32,
  pub long: u32,
}

impl Default for CanonicalSize {
  fn default() -> Self {
    Self {
      short: CARD_SHORT_SIDE,
      long: CARD_LONG_SIDE,
    }
  }
}

impl CanonicalSize {
  /// (宽, 高)
  pub fn dimensions(&self, orientation: Orientation) -> (u32, u32) {
    match orientation {
      Orientation::Portrait => (self.short, self.long),
      Orientation::Landscape => (self.long, self.short),
    }
  }
}

/// 校正结果，`quad` 为找到的四边形角点（裁剪区域坐标，按 左上/右上/右下/左下），
/// 回退路径下为 None
#[derive(Debug, Clone)]
pub struct RectifiedCard {
  pub image: RgbImage,
  pub orientation: Orientation,
  pub quad: Option<[(f32, f32); 4]>,
}

#[derive(Debug, Clone)]
pub struct Rectifier {
  size: CanonicalSize,
  padding: f32,
}

impl Default for Rectifier {
  fn default() -> Self {
    Self {
      size: CanonicalSize::default(),
      padding: CROP_PADDING,
    }
  }
}

impl Rectifier {
  pub fn new(size: CanonicalSize, padding: f32) -> Self {
    Self { size, padding }
  }

  pub fn canonical_size(&self) -> CanonicalSize {
    self.size
  }

  /// 总能返回一张标准尺寸的图像：找不到四边形时退化为直接缩放
  pub fn rectify(&self, frame: &RgbImage, bbox: &Rect) -> RectifiedCard {
    let (x, y, w, h) = bbox.padded_region(self.padding, frame.width(), frame.height());
    if w == 0 || h == 0 {
      debug!("裁剪区域为空，输出黑色卡面");
      let orientation = orientation_of(bbox.width(), bbox.height());
      let (dw, dh) = self.size.dimensions(orientation);
      return RectifiedCard {
        image: RgbImage::new(dw, dh),
        orientation,
        quad: None,
      };
    }
    let crop = imageops::crop_imm(frame, x, y, w, h).to_image();

    if let Some(quad) = find_card_quad(&crop) {
      let (width, height) = quad_extent(&quad);
      let orientation = orientation_of(width, height);
      let (dw, dh) = self.size.dimensions(orientation);
      let target = [
        (0.0, 0.0),
        ((dw - 1) as f32, 0.0),
        ((dw - 1) as f32, (dh - 1) as f32),
        (0.0, (dh - 1) as f32),
      ];
      if let Some(projection) = Projection::from_control_points(quad, target) {
        let mut out = RgbImage::new(dw, dh);
        warp_into(&crop, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
        debug!("透视校正完成: {:?} {}x{}", orientation, dw, dh);
        return RectifiedCard {
          image: out,
          orientation,
          quad: Some(quad),
        };
      }
      debug!("四边形退化，无法求解透视变换");
    }

    // 回退：按检测框自身的宽高比缩放
    let orientation = orientation_of(w as f32, h as f32);
    let (dw, dh) = self.size.dimensions(orientation);
    debug!("未找到四边形轮廓，回退为直接缩放 {}x{}", dw, dh);
    RectifiedCard {
      image: imageops::resize(&crop, dw, dh, imageops::FilterType::Triangle),
      orientation,
      quad: None,
    }
  }
}

fn orientation_of(width: f32, height: f32) -> Orientation {
  if width > height {
    Orientation::Landscape
  } else {
    Orientation::Portrait
  }
}

fn polygon_area(points: &[Point<i32>]) -> f64 {
  if points.len() < 3 {
    return 0.0;
  }
  let twice: i64 = points
    .iter()
    .zip(points.iter().cycle().skip(1))
    .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
    .sum();
  (twice as f64 / 2.0).abs()
}

/// 边缘 -> 外轮廓 -> 面积最大的若干个中第一个能近似为四边形的
fn find_card_quad(crop: &RgbImage) -> Option<[(f32, f32); 4]> {
  let gray: GrayImage = imageops::grayscale(crop);
  let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
  let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);

  let mut outer: Vec<Vec<Point<i32>>> = find_contours::<i32>(&edges)
    .into_iter()
    .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
    .map(|c| c.points)
    .collect();
  outer.sort_by(|a, b| polygon_area(b).total_cmp(&polygon_area(a)));

  for contour in outer.iter().take(CONTOUR_CANDIDATES) {
    if contour.len() < 4 {
      continue;
    }
    let perimeter = arc_length(contour, true);
    if perimeter <= 0.0 {
      continue;
    }
    let mut approx = approximate_polygon_dp(contour, APPROX_EPSILON_RATIO * perimeter, true);
    if approx.len() > 1 && approx.first() == approx.last() {
      approx.pop();
    }
    if approx.len() == 4 {
      let points = [
        (approx[0].x as f32, approx[0].y as f32),
        (approx[1].x as f32, approx[1].y as f32),
        (approx[2].x as f32, approx[2].y as f32),
        (approx[3].x as f32, approx[3].y as f32),
      ];
      return Some(order_corners(points));
    }
  }
  None
}

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
  ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// 角点排序为 左上、右上、右下、左下：
/// 按 x 分出左右两组，左组按 y 分出上下，右组中离左上更远的是右下
pub fn order_corners(mut points: [(f32, f32); 4]) -> [(f32, f32); 4] {
  points.sort_by(|a, b| a.0.total_cmp(&b.0));
  let (mut left, right) = ([points[0], points[1]], [points[2], points[3]]);
  left.sort_by(|a, b| a.1.total_cmp(&b.1));
  let (tl, bl) = (left[0], left[1]);
  let (br, tr) = if dist(tl, right[0]) >= dist(tl, right[1]) {
    (right[0], right[1])
  } else {
    (right[1], right[0])
  };
  [tl, tr, br, bl]
}

/// 四边形的物理宽高（取对边中较长者）
fn quad_extent(quad: &[(f32, f32); 4]) -> (f32, f32) {
  let [tl, tr, br, bl] = *quad;
  let width = dist(br, bl).max(dist(tr, tl));
  let height = dist(tr, br).max(dist(tl, bl));
  (width, height)
}
