// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/server/handlers.rs - 路由处理函数
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

use axum::{
  Json,
  extract::{
    Multipart, Path, State,
    multipart::MultipartRejection,
  },
  response::{Html, IntoResponse, Redirect, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{AppResult, AppState, views};
use crate::pipeline::JobStatus;

const UPLOAD_FIELD: &str = "file";

/// GET /
pub async fn index() -> Html<String> {
  Html(views::index_page())
}

/// POST /
///
/// 保存 `file` 字段并加入检测队列，随后跳转到结果页。
/// 不是 multipart 请求、缺少字段或文件名为空时回到上传页。
pub async fn upload(
  State(state): State<AppState>,
  multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Response> {
  let mut multipart = match multipart {
    Ok(multipart) => multipart,
    Err(rejection) => {
      debug!("不是表单上传: {}", rejection.body_text());
      return Ok(Redirect::to("/").into_response());
    }
  };

  while let Some(field) = multipart.next_field().await? {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }

    let filename = field.file_name().unwrap_or_default().to_string();
    let Some(key) = state.storage.assign_key(&filename) else {
      debug!("文件名不可用: {:?}", filename);
      return Ok(Redirect::to("/").into_response());
    };

    let data = field.bytes().await?;
    // 队列已满时不能覆盖同名的旧上传
    let reservation = state.pipeline.reserve()?;
    let stored = state.storage.save_upload(&key, &data).await?;
    info!("收到上传 {} ({} 字节)", stored.key, stored.bytes);
    reservation.submit(stored.key.as_str());

    let location = format!("/result/{}", urlencoding::encode(&stored.key));
    return Ok(Redirect::to(&location).into_response());
  }

  debug!("请求中没有 {} 字段", UPLOAD_FIELD);
  Ok(Redirect::to("/").into_response())
}

/// GET /result/{key}
pub async fn result(State(state): State<AppState>, Path(key): Path<String>) -> Html<String> {
  let status = state.pipeline.status(&key);
  let record = match status {
    JobStatus::Succeeded { .. } => state.storage.read_record(&key),
    _ => None,
  };
  Html(views::result_page(&key, &status, record.as_ref()))
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
  pub key: String,
  pub state: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detections: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// GET /status/{key}
pub async fn status(State(state): State<AppState>, Path(key): Path<String>) -> Json<StatusBody> {
  let status = state.pipeline.status(&key);
  let state_name = status.state_name();
  let (detections, error) = match status {
    JobStatus::Succeeded { detections } => (Some(detections), None),
    JobStatus::Failed { error } => (None, Some(error)),
    _ => (None, None),
  };

  Json(StatusBody {
    key,
    state: state_name,
    detections,
    error,
  })
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
  Json(json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
  }))
}
