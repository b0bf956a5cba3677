// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;

use crate::{
  frame::LetterboxFrame,
  model::{DetectItem, DetectResult, Labels},
  output::OverlayResolution,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 80;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_vertical_padding: i32,
  thickness: i32,
  colors: Vec<Rgb<u8>>,
  labels: Labels,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(Labels::default())
  }
}

impl Draw {
  pub fn new(labels: Labels) -> Self {
    // 每个类别一种颜色
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();

    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      thickness: BOX_THICKNESS,
      colors,
      labels,
    }
  }

  /// 没有字体时只画框，不画标签
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    Ok(self.with_font(font))
  }

  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  pub fn color(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  // bbox 为相对 image 的归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32; 4], class_id: u32, score: f32) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = ((bbox[0] * w as f32).floor() as i32).clamp(0, w - 1);
    let y_min = ((bbox[1] * h as f32).floor() as i32).clamp(0, h - 1);
    let x_max = ((bbox[2] * w as f32).ceil() as i32).clamp(0, w - 1);
    let y_max = ((bbox[3] * h as f32).ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color(class_id);

    // 由外向内逐像素加粗边框
    for t in 0..self.thickness {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", self.labels.name(class_id), score);
    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &label);
    let tag_h = text_h as i32 + 2 * self.label_text_vertical_padding;

    // 标签放在框上方，放不下时贴着图像顶部
    let label_x = x_min;
    let label_y = (y_min - tag_h).max(0);
    let tag_w = (text_w as i32 + 2).min(w - label_x);

    if tag_w > 0 && tag_h > 0 {
      let rect = Rect::at(label_x, label_y).of_size(tag_w as u32, tag_h as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb(LABEL_TEXT_COLOR),
        label_x + 1,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        &label,
      );
    }
  }

  pub fn draw_detections_on_image(
    &self,
    image: &mut RgbImage,
    result: &DetectResult,
    map_bbox: impl Fn(&[f32; 4]) -> [f32; 4],
  ) {
    for DetectItem {
      class_id,
      score,
      bbox,
    } in result.iter()
    {
      self.draw_bbox_with_label(image, &map_bbox(bbox), *class_id, *score);
    }
  }

  /// 生成叠加了检测框的新图像，不修改帧本身
  pub fn draw_detection<const S: u32>(
    &self,
    frame: &LetterboxFrame<S>,
    result: &DetectResult,
    resolution: OverlayResolution,
  ) -> RgbImage {
    match resolution {
      OverlayResolution::Original => {
        let mut image = frame.original().clone();
        self.draw_detections_on_image(&mut image, result, |bbox| *bbox);
        image
      }
      OverlayResolution::Inference => {
        let mut image = frame.letterboxed().clone();
        let letterbox = *frame.letterbox();
        self.draw_detections_on_image(&mut image, result, |bbox| {
          letterbox.to_frame_normalized(*bbox)
        });
        image
      }
    }
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
