// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/args.rs - 服务参数配置
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

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::{output::OverlayResolution, pipeline::PipelineConfig, store::KeyPolicy};

pub const DEFAULT_MODEL_URL: &str =
  "https://drive.google.com/uc?export=download&id=1B0FfStSYKtdQ8Hh9UfyXWMHLzvbcid41";

/// MRI Lens 服务参数配置，命令行参数优先于环境变量
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
  /// 监听地址
  #[arg(long, env = "HOST", default_value = "0.0.0.0")]
  pub host: String,

  /// 监听端口
  #[arg(long, env = "PORT", default_value_t = 5000)]
  pub port: u16,

  /// 上传文件目录
  #[arg(long, env = "UPLOAD_FOLDER", default_value = "uploads", value_name = "DIR")]
  pub upload_folder: PathBuf,

  /// 结果图像目录
  #[arg(
    long,
    env = "RESULT_FOLDER",
    default_value = "static/results",
    value_name = "DIR"
  )]
  pub result_folder: PathBuf,

  /// ONNX 模型文件路径
  #[arg(long, env = "MODEL_PATH", default_value = "best.onnx", value_name = "FILE")]
  pub model_path: PathBuf,

  /// 模型文件不存在时的下载地址，传空字符串表示不下载
  #[arg(long, env = "MODEL_URL", default_value = DEFAULT_MODEL_URL, value_name = "URL")]
  pub model_url: String,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "CONFIDENCE", default_value_t = 0.25, value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, env = "IOU_THRESHOLD", default_value_t = 0.7, value_name = "THRESHOLD")]
  pub iou_threshold: f32,

  /// 每张图像最多保留的检测框数
  #[arg(long, env = "MAX_DETECTIONS", default_value_t = 300)]
  pub max_detections: usize,

  /// ONNX Runtime 单次推理使用的线程数
  #[arg(long, env = "INTRA_THREADS", default_value_t = 4)]
  pub intra_threads: usize,

  /// 检测工作线程数
  #[arg(long, env = "WORKERS", default_value_t = 2)]
  pub workers: usize,

  /// 等待队列容量，满时拒绝上传
  #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 32)]
  pub queue_capacity: usize,

  /// 单次上传请求体上限（字节）
  #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 64 * 1024 * 1024)]
  pub max_upload_bytes: usize,

  /// 上传文件命名方式
  #[arg(long, env = "KEY_POLICY", value_enum, default_value_t = KeyPolicy::Filename)]
  pub key_policy: KeyPolicy,

  /// 检测框绘制在原图还是推理画布上
  #[arg(
    long,
    env = "OVERLAY_RESOLUTION",
    value_enum,
    default_value_t = OverlayResolution::Original
  )]
  pub overlay_resolution: OverlayResolution,

  /// 逗号分隔的类别名称，缺省时读取模型元数据
  #[arg(long, env = "LABELS", value_name = "NAMES")]
  pub labels: Option<String>,

  /// 标签字体文件，缺省时只画框
  #[arg(long, env = "LABEL_FONT", value_name = "FILE")]
  pub label_font: Option<PathBuf>,
}

impl ServerArgs {
  pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
    let addr = format!("{}:{}", self.host, self.port);
    addr
      .parse()
      .map_err(|e| anyhow::anyhow!("无效的监听地址 {addr}: {e}"))
  }

  pub fn model_url(&self) -> Option<&str> {
    let url = self.model_url.trim();
    (!url.is_empty()).then_some(url)
  }

  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      workers: self.workers,
      queue_capacity: self.queue_capacity,
      resolution: self.overlay_resolution,
    }
  }
}
