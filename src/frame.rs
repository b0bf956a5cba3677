// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/frame.rs - 推理帧（letterbox）定义
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

use image::{
  ImageBuffer, Rgb, RgbImage,
  imageops::{self, FilterType},
};

const RGB_CHANNELS: usize = 3;
const LETTERBOX_FILL: u8 = 114;

/// 推理使用的固定正方形分辨率
pub const INFERENCE_SIZE: u32 = 640;

pub type InferenceFrame = LetterboxFrame<INFERENCE_SIZE>;

/// 原图与推理画布之间的缩放与填充关系
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: u32,
  pub pad_y: u32,
  pub resized_w: u32,
  pub resized_h: u32,
  pub orig_w: u32,
  pub orig_h: u32,
  pub size: u32,
}

impl Letterbox {
  pub fn compute(orig_w: u32, orig_h: u32, size: u32) -> Self {
    let scale = (size as f32 / orig_w as f32).min(size as f32 / orig_h as f32);
    let resized_w = ((orig_w as f32 * scale).round() as u32).clamp(1, size);
    let resized_h = ((orig_h as f32 * scale).round() as u32).clamp(1, size);

    Self {
      scale,
      pad_x: (size - resized_w) / 2,
      pad_y: (size - resized_h) / 2,
      resized_w,
      resized_h,
      orig_w,
      orig_h,
      size,
    }
  }

  /// 推理画布上的像素坐标 [x_min, y_min, x_max, y_max] 转为原图归一化坐标
  pub fn to_original_normalized(&self, bbox: [f32; 4]) -> [f32; 4] {
    let (w, h) = (self.orig_w as f32, self.orig_h as f32);
    let unmap_x = |x: f32| ((x - self.pad_x as f32) / self.scale).clamp(0.0, w) / w;
    let unmap_y = |y: f32| ((y - self.pad_y as f32) / self.scale).clamp(0.0, h) / h;
    [
      unmap_x(bbox[0]),
      unmap_y(bbox[1]),
      unmap_x(bbox[2]),
      unmap_y(bbox[3]),
    ]
  }

  /// 原图归一化坐标转为推理画布归一化坐标
  pub fn to_frame_normalized(&self, bbox: [f32; 4]) -> [f32; 4] {
    let size = self.size as f32;
    let map_x = |x: f32| (x * self.resized_w as f32 + self.pad_x as f32) / size;
    let map_y = |y: f32| (y * self.resized_h as f32 + self.pad_y as f32) / size;
    [
      map_x(bbox[0]),
      map_y(bbox[1]),
      map_x(bbox[2]),
      map_y(bbox[3]),
    ]
  }
}

/// S×S 的 letterbox 帧，同时保留原图用于叠加绘制
#[derive(Debug, Clone)]
pub struct LetterboxFrame<const S: u32> {
  original: RgbImage,
  letterboxed: RgbImage,
  letterbox: Letterbox,
}

impl<const S: u32> From<RgbImage> for LetterboxFrame<S> {
  fn from(original: RgbImage) -> Self {
    let (orig_w, orig_h) = original.dimensions();
    let letterbox = Letterbox::compute(orig_w, orig_h, S);

    let resized = imageops::resize(
      &original,
      letterbox.resized_w,
      letterbox.resized_h,
      FilterType::Triangle,
    );
    let mut letterboxed: RgbImage = ImageBuffer::from_pixel(S, S, Rgb([LETTERBOX_FILL; 3]));
    imageops::overlay(
      &mut letterboxed,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    Self {
      original,
      letterboxed,
      letterbox,
    }
  }
}

impl<const S: u32> LetterboxFrame<S> {
  pub fn size(&self) -> usize {
    S as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn original(&self) -> &RgbImage {
    &self.original
  }

  pub fn letterboxed(&self) -> &RgbImage {
    &self.letterboxed
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn tensor_shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, S as usize, S as usize]
  }

  /// NCHW 排列、归一化到 [0, 1] 的输入张量
  pub fn to_nchw_f32(&self) -> Vec<f32> {
    let plane = (S as usize) * (S as usize);
    let mut data = vec![0f32; RGB_CHANNELS * plane];

    for (idx, pixel) in self.letterboxed.pixels().enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn approx(a: [f32; 4], b: [f32; 4]) {
    for (x, y) in a.iter().zip(b.iter()) {
      assert!((x - y).abs() < 1e-3, "{a:?} != {b:?}");
    }
  }

  #[test]
  fn wide_image_is_padded_vertically() {
    let lb = Letterbox::compute(1280, 640, 640);
    assert_eq!(lb.resized_w, 640);
    assert_eq!(lb.resized_h, 320);
    assert_eq!(lb.pad_x, 0);
    assert_eq!(lb.pad_y, 160);
    approx(
      lb.to_original_normalized([0.0, 160.0, 640.0, 480.0]),
      [0.0, 0.0, 1.0, 1.0],
    );
  }

  #[test]
  fn frame_and_original_coordinates_agree() {
    let lb = Letterbox::compute(300, 500, 640);
    let original = [0.1, 0.2, 0.6, 0.9];
    let frame = lb.to_frame_normalized(original);
    let pixels = frame.map(|v| v * 640.0);
    approx(lb.to_original_normalized(pixels), original);
  }

  #[test]
  fn boxes_in_padding_clamp_to_image_edge() {
    let lb = Letterbox::compute(1280, 640, 640);
    let bbox = lb.to_original_normalized([-20.0, 0.0, 700.0, 100.0]);
    approx(bbox, [0.0, 0.0, 1.0, 0.0]);
  }

  #[test]
  fn tensor_has_grey_padding_and_scaled_content() {
    let image = RgbImage::from_pixel(64, 32, Rgb([255, 0, 0]));
    let frame = LetterboxFrame::<64>::from(image);
    let tensor = frame.to_nchw_f32();
    let plane = 64 * 64;

    assert_eq!(tensor.len(), 3 * plane);
    assert_eq!(frame.tensor_shape(), [1, 3, 64, 64]);
    // 左上角落在上方填充区
    assert!((tensor[0] - LETTERBOX_FILL as f32 / 255.0).abs() < 1e-6);
    // 中心像素来自原图
    let center = 32 * 64 + 32;
    assert!((tensor[center] - 1.0).abs() < 1e-6);
    assert!(tensor[plane + center].abs() < 1e-6);
  }
}
