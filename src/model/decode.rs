// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/model/decode.rs - YOLO 输出张量解码与 NMS
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

use thiserror::Error;
use tracing::debug;

use crate::{
  frame::Letterbox,
  model::{DetectItem, DetectResult},
};

const BOX_VALUES: usize = 4;
const END_TO_END_VALUES: usize = 6;
const END_TO_END_MAX_ROWS: usize = 1000;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
  #[error("不支持的输出形状: {0:?}")]
  UnsupportedShape(Vec<usize>),
  #[error("输出长度不匹配: 期望 {expected}, 实际 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
  pub confidence: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
  /// 已知类别数时据此判断输出是 [1, 4 + nc, N] 还是 [1, N, 4 + nc]
  pub classes: Option<usize>,
}

impl Default for DecodeParams {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      iou_threshold: 0.7,
      max_detections: 300,
      classes: None,
    }
  }
}

enum Layout {
  /// [1, 4 + nc, N]
  ChannelsFirst { channels: usize, anchors: usize },
  /// [1, N, 4 + nc]
  AnchorsFirst { channels: usize, anchors: usize },
  /// [1, K, 6]：x1, y1, x2, y2, score, class
  EndToEnd { rows: usize },
}

fn layout_of(shape: &[usize], classes: Option<usize>) -> Result<Layout, DecodeError> {
  let unsupported = || DecodeError::UnsupportedShape(shape.to_vec());
  let (d1, d2) = match shape {
    [1, d1, d2] => (*d1, *d2),
    _ => return Err(unsupported()),
  };

  if d2 == END_TO_END_VALUES && d1 <= END_TO_END_MAX_ROWS {
    return Ok(Layout::EndToEnd { rows: d1 });
  }

  let channels_first = Layout::ChannelsFirst {
    channels: d1,
    anchors: d2,
  };
  let anchors_first = Layout::AnchorsFirst {
    channels: d2,
    anchors: d1,
  };

  if let Some(channels) = classes.map(|nc| nc + BOX_VALUES) {
    if d1 == channels {
      return Ok(channels_first);
    }
    if d2 == channels {
      return Ok(anchors_first);
    }
    debug!("类别数 {} 与输出形状 {:?} 不符, 按形状推断", channels - BOX_VALUES, shape);
  }

  // 每个锚点至少有 4 个坐标和 1 个类别分数；都可能时锚点数通常更多
  match (d1 > BOX_VALUES, d2 > BOX_VALUES) {
    (true, false) => Ok(channels_first),
    (false, true) => Ok(anchors_first),
    (true, true) if d1 <= d2 => Ok(channels_first),
    (true, true) => Ok(anchors_first),
    (false, false) => Err(unsupported()),
  }
}

/// 将模型原始输出解码为相对原图归一化的检测结果
pub fn decode_output(
  shape: &[usize],
  data: &[f32],
  params: &DecodeParams,
  letterbox: &Letterbox,
) -> Result<DetectResult, DecodeError> {
  let expected: usize = shape.iter().product();
  if expected != data.len() {
    return Err(DecodeError::LengthMismatch {
      expected,
      actual: data.len(),
    });
  }

  let layout = layout_of(shape, params.classes)?;
  let mut candidates = Vec::new();

  match layout {
    Layout::EndToEnd { rows } => {
      debug!("端到端输出: {} 行", rows);
      for row in data.chunks_exact(END_TO_END_VALUES) {
        let score = row[4];
        if score < params.confidence {
          continue;
        }
        push_candidate(
          &mut candidates,
          letterbox,
          [row[0], row[1], row[2], row[3]],
          row[5].max(0.0) as u32,
          score,
        );
      }
      candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
      candidates.truncate(params.max_detections);
      return Ok(candidates.into());
    }
    Layout::ChannelsFirst { channels, anchors } => {
      debug!("输出布局 [1, {}, {}]", channels, anchors);
      let value = |a: usize, c: usize| data[c * anchors + a];
      collect_anchors(&mut candidates, channels, anchors, value, params, letterbox);
    }
    Layout::AnchorsFirst { channels, anchors } => {
      debug!("输出布局 [1, {}, {}]", anchors, channels);
      let value = |a: usize, c: usize| data[a * channels + c];
      collect_anchors(&mut candidates, channels, anchors, value, params, letterbox);
    }
  }

  debug!("阈值过滤后候选框 {} 个", candidates.len());
  let kept = non_max_suppression(candidates, params.iou_threshold, params.max_detections);
  debug!("NMS 后保留 {} 个", kept.len());
  Ok(kept.into())
}

fn collect_anchors(
  candidates: &mut Vec<DetectItem>,
  channels: usize,
  anchors: usize,
  value: impl Fn(usize, usize) -> f32,
  params: &DecodeParams,
  letterbox: &Letterbox,
) {
  for a in 0..anchors {
    let (class_id, score) = (BOX_VALUES..channels)
      .map(|c| (c - BOX_VALUES, value(a, c)))
      .fold((0usize, f32::MIN), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });

    if score < params.confidence {
      continue;
    }

    let (cx, cy, w, h) = (value(a, 0), value(a, 1), value(a, 2), value(a, 3));
    push_candidate(
      candidates,
      letterbox,
      [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      class_id as u32,
      score,
    );
  }
}

fn push_candidate(
  candidates: &mut Vec<DetectItem>,
  letterbox: &Letterbox,
  pixel_box: [f32; 4],
  class_id: u32,
  score: f32,
) {
  let bbox = letterbox.to_original_normalized(pixel_box);
  if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
    return;
  }
  candidates.push(DetectItem {
    class_id,
    score: score.clamp(0.0, 1.0),
    bbox,
  });
}

/// 按类别做的贪心 NMS，结果按置信度降序
pub fn non_max_suppression(
  mut candidates: Vec<DetectItem>,
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<DetectItem> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem> = Vec::new();
  for candidate in candidates {
    if kept.len() >= max_detections {
      break;
    }
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

#[cfg(test)]
mod tests {
  use super::*;

  const SIZE: u32 = 640;

  fn identity() -> Letterbox {
    Letterbox::compute(SIZE, SIZE, SIZE)
  }

  /// 以 [1, 4 + nc, N] 布局构造输出
  fn channels_first(anchors: &[([f32; 4], Vec<f32>)]) -> (Vec<usize>, Vec<f32>) {
    let nc = anchors[0].1.len();
    let channels = BOX_VALUES + nc;
    let n = anchors.len();
    let mut data = vec![0f32; channels * n];
    for (a, (b, scores)) in anchors.iter().enumerate() {
      for c in 0..BOX_VALUES {
        data[c * n + a] = b[c];
      }
      for (k, s) in scores.iter().enumerate() {
        data[(BOX_VALUES + k) * n + a] = *s;
      }
    }
    (vec![1, channels, n], data)
  }

  #[test]
  fn decodes_channels_first_and_applies_threshold() {
    let (shape, data) = channels_first(&[
      ([320.0, 320.0, 64.0, 128.0], vec![0.1, 0.9]),
      ([100.0, 100.0, 10.0, 10.0], vec![0.2, 0.1]),
    ]);
    let result = decode_output(&shape, &data, &DecodeParams::default(), &identity()).unwrap();

    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.class_id, 1);
    assert!((item.score - 0.9).abs() < 1e-6);
    let expected = [288.0 / 640.0, 256.0 / 640.0, 352.0 / 640.0, 384.0 / 640.0];
    for (a, b) in item.bbox.iter().zip(expected.iter()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn transposed_layout_matches_channels_first() {
    let anchors = [
      ([200.0, 200.0, 50.0, 50.0], vec![0.8, 0.1, 0.0]),
      ([400.0, 300.0, 80.0, 40.0], vec![0.0, 0.3, 0.6]),
      ([10.0, 10.0, 4.0, 4.0], vec![0.0, 0.0, 0.0]),
      ([600.0, 600.0, 20.0, 20.0], vec![0.0, 0.0, 0.05]),
      ([50.0, 500.0, 30.0, 30.0], vec![0.0, 0.4, 0.0]),
      ([320.0, 320.0, 10.0, 10.0], vec![0.0, 0.0, 0.0]),
      ([330.0, 330.0, 10.0, 10.0], vec![0.0, 0.0, 0.0]),
      ([340.0, 340.0, 10.0, 10.0], vec![0.0, 0.0, 0.0]),
    ];
    let (shape, data) = channels_first(&anchors);
    let (channels, n) = (shape[1], shape[2]);
    let mut transposed = vec![0f32; data.len()];
    for c in 0..channels {
      for a in 0..n {
        transposed[a * channels + c] = data[c * n + a];
      }
    }

    let params = DecodeParams::default();
    let a = decode_output(&shape, &data, &params, &identity()).unwrap();
    let b = decode_output(&[1, n, channels], &transposed, &params, &identity()).unwrap();
    assert_eq!(a.items, b.items);
    assert_eq!(a.len(), 3);
    // 按置信度降序
    assert!(a.items.windows(2).all(|w| w[0].score >= w[1].score));
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    let (shape, data) = channels_first(&[
      ([320.0, 320.0, 100.0, 100.0], vec![0.9, 0.0]),
      ([322.0, 322.0, 100.0, 100.0], vec![0.8, 0.0]),
      ([322.0, 322.0, 100.0, 100.0], vec![0.0, 0.7]),
      ([100.0, 100.0, 50.0, 50.0], vec![0.6, 0.0]),
    ]);
    let result = decode_output(&shape, &data, &DecodeParams::default(), &identity()).unwrap();

    let scores: Vec<f32> = result.iter().map(|d| d.score).collect();
    assert_eq!(scores, vec![0.9, 0.7, 0.6]);
    assert_eq!(result.items[1].class_id, 1);
  }

  #[test]
  fn max_detections_caps_output() {
    let (shape, data) = channels_first(&[
      ([100.0, 100.0, 20.0, 20.0], vec![0.9]),
      ([300.0, 300.0, 20.0, 20.0], vec![0.8]),
      ([500.0, 500.0, 20.0, 20.0], vec![0.7]),
      ([500.0, 100.0, 20.0, 20.0], vec![0.6]),
      ([100.0, 500.0, 20.0, 20.0], vec![0.5]),
    ]);
    let params = DecodeParams {
      max_detections: 2,
      ..DecodeParams::default()
    };
    let result = decode_output(&shape, &data, &params, &identity()).unwrap();
    assert_eq!(result.len(), 2);
  }

  #[test]
  fn end_to_end_rows_are_mapped_through_letterbox() {
    // 1280x640 原图，上下各填充 160 像素
    let letterbox = Letterbox::compute(1280, 640, SIZE);
    let mut data = vec![0f32; 300 * 6];
    data[..6].copy_from_slice(&[0.0, 160.0, 320.0, 320.0, 0.88, 2.0]);
    data[6..12].copy_from_slice(&[10.0, 200.0, 20.0, 210.0, 0.1, 0.0]);

    let result = decode_output(&[1, 300, 6], &data, &DecodeParams::default(), &letterbox).unwrap();
    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.class_id, 2);
    let expected = [0.0, 0.0, 0.5, 0.5];
    for (a, b) in item.bbox.iter().zip(expected.iter()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn few_anchors_still_decode_channels_first() {
    // 锚点数不超过通道数时仍是 [1, 4 + nc, N]
    let (shape, data) = channels_first(&[([320.0, 320.0, 64.0, 64.0], vec![0.1, 0.9])]);
    assert_eq!(shape, vec![1, 6, 1]);
    let result = decode_output(&shape, &data, &DecodeParams::default(), &identity()).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].class_id, 1);
  }

  #[test]
  fn known_class_count_resolves_ambiguous_shape() {
    // [1, 6, 5]：2 类 5 个锚点，与 1 类 6 个锚点的转置形状相同
    let anchors: Vec<([f32; 4], Vec<f32>)> = (0..5)
      .map(|i| {
        let scores = if i == 2 { vec![0.0, 0.95] } else { vec![0.0, 0.0] };
        ([100.0 + 100.0 * i as f32, 320.0, 40.0, 40.0], scores)
      })
      .collect();
    let (shape, data) = channels_first(&anchors);
    assert_eq!(shape, vec![1, 6, 5]);

    let params = DecodeParams {
      classes: Some(2),
      ..DecodeParams::default()
    };
    let result = decode_output(&shape, &data, &params, &identity()).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].class_id, 1);
    assert!((result.items[0].score - 0.95).abs() < 1e-6);

    // 类别数与形状不符时退回按形状推断
    let params = DecodeParams {
      classes: Some(80),
      ..DecodeParams::default()
    };
    assert!(decode_output(&shape, &data, &params, &identity()).is_ok());
  }

  #[test]
  fn rejects_bad_shapes() {
    assert_eq!(
      decode_output(&[1, 4, 3], &[0.0; 12], &DecodeParams::default(), &identity()).unwrap_err(),
      DecodeError::UnsupportedShape(vec![1, 4, 3])
    );
    assert_eq!(
      decode_output(&[2, 6, 10], &[0.0; 120], &DecodeParams::default(), &identity()).unwrap_err(),
      DecodeError::UnsupportedShape(vec![2, 6, 10])
    );
    assert_eq!(
      decode_output(&[1, 6, 10], &[0.0; 10], &DecodeParams::default(), &identity()).unwrap_err(),
      DecodeError::LengthMismatch {
        expected: 60,
        actual: 10
      }
    );
  }
}
