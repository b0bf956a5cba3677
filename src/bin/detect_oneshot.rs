// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/bin/detect_oneshot.rs - 命令行单张图像检测
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use mri_lens::{
  FromUrl,
  frame::INFERENCE_SIZE,
  input::ImageFileInput,
  model::{Labels, YoloOnnxBuilder},
  output::{OverlayResolution, SaveImageFileOutput, draw::Draw},
  task::{OneShotTask, Task},
};

/// 单张图像检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct OneShotArgs {
  /// 模型地址，例如 onnx:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/scan.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出图像，编码格式由扩展名决定
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.7, value_name = "THRESHOLD")]
  pub iou_threshold: f32,
  /// 每张图像最多保留的检测框数
  #[arg(long, default_value_t = 300)]
  pub max_detections: usize,
  /// ONNX Runtime 单次推理使用的线程数
  #[arg(long, default_value_t = 4)]
  pub intra_threads: usize,
  /// 逗号分隔的类别名称
  #[arg(long, value_name = "NAMES")]
  pub labels: Option<String>,
  /// 标签字体文件
  #[arg(long, value_name = "FILE")]
  pub label_font: Option<PathBuf>,
  /// 检测框绘制在原图还是推理画布上
  #[arg(long, value_enum, default_value_t = OverlayResolution::Original)]
  pub overlay_resolution: OverlayResolution,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = OneShotArgs::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let model = YoloOnnxBuilder::from_url(&args.model)?
    .confidence(args.confidence)
    .iou_threshold(args.iou_threshold)
    .max_detections(args.max_detections)
    .intra_threads(args.intra_threads)
    .labels(args.labels.as_deref().map(Labels::from_csv))
    .build::<INFERENCE_SIZE>()?;

  let mut draw = Draw::new(model.labels().clone());
  if let Some(font) = &args.label_font {
    draw = draw.with_font_file(font)?;
  }
  let output = SaveImageFileOutput::from_url(&args.output)?
    .with_draw(Arc::new(draw))
    .with_resolution(args.overlay_resolution);

  let result = OneShotTask.run_task(input.into_frames::<INFERENCE_SIZE>(), &model, &output)?;
  info!("检测到 {} 个目标, 结果保存在 {}", result.len(), output.path().display());

  Ok(())
}
