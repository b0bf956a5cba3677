// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/server.rs - HTTP 服务
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

use axum::{Router, extract::DefaultBodyLimit, routing::get};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{pipeline::Pipeline, store::Storage};

mod error;
mod handlers;
mod views;

pub use self::error::{AppError, AppResult};

/// 所有处理函数共享的状态
#[derive(Clone)]
pub struct AppState {
  pub pipeline: Pipeline,
  pub storage: Arc<Storage>,
}

impl AppState {
  pub fn new(pipeline: Pipeline) -> Self {
    Self {
      storage: pipeline.storage().clone(),
      pipeline,
    }
  }
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
  let uploads = ServeDir::new(state.storage.uploads_dir());
  let results = ServeDir::new(state.storage.results_dir());

  Router::new()
    .route("/", get(handlers::index).post(handlers::upload))
    .route("/result/{key}", get(handlers::result))
    .route("/status/{key}", get(handlers::status))
    .route("/health", get(handlers::health))
    .nest_service("/uploads", uploads)
    .nest_service("/static/results", results)
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
