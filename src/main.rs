// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/main.rs - Web 服务主程序
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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mri_lens::{
  args::ServerArgs,
  fetch::ensure_model,
  frame::INFERENCE_SIZE,
  model::{Labels, SharedModel, YoloOnnxBuilder},
  output::draw::Draw,
  pipeline::Pipeline,
  server::{AppState, build_router},
  store::Storage,
};

#[tokio::main]
async fn main() -> Result<()> {
  // .env 不存在时忽略
  let _ = dotenvy::dotenv();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mri_lens=info,tower_http=info")),
    )
    .init();

  let args = ServerArgs::parse();

  info!("MRI Lens 检测服务");
  info!("模型文件路径: {}", args.model_path.display());
  info!("上传目录: {}", args.upload_folder.display());
  info!("结果目录: {}", args.result_folder.display());
  info!("置信度阈值: {}", args.confidence);
  info!("NMS 阈值: {}", args.iou_threshold);

  let storage = Arc::new(Storage::new(
    &args.upload_folder,
    &args.result_folder,
    args.key_policy,
  ));
  storage.ensure_dirs()?;

  match args.model_url() {
    Some(url) => {
      ensure_model(&args.model_path, url)
        .await
        .context("下载模型失败")?;
    }
    None if !args.model_path.exists() => {
      warn!("模型文件不存在且未配置下载地址");
    }
    None => {}
  }

  let builder = YoloOnnxBuilder::new(&args.model_path)
    .confidence(args.confidence)
    .iou_threshold(args.iou_threshold)
    .max_detections(args.max_detections)
    .intra_threads(args.intra_threads)
    .labels(args.labels.as_deref().map(Labels::from_csv));
  let model = tokio::task::spawn_blocking(move || builder.build::<INFERENCE_SIZE>())
    .await?
    .context("加载模型失败")?;
  info!("解码参数: {:?}", model.params());

  let mut draw = Draw::new(model.labels().clone());
  if let Some(font) = &args.label_font {
    draw = draw
      .with_font_file(font)
      .with_context(|| format!("加载字体 {} 失败", font.display()))?;
  }

  let model: SharedModel = Arc::new(model);
  let pipeline = Pipeline::start(model, storage, Arc::new(draw), args.pipeline_config());
  let router = build_router(AppState::new(pipeline), args.max_upload_bytes);

  let addr = args.bind_addr()?;
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .with_context(|| format!("无法监听 {addr}"))?;
  info!("服务已启动: http://{}", addr);

  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听 Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到退出信号, 正在关闭...");
}
