// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/server/error.rs - HTTP 错误响应
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
  extract::multipart::MultipartError,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{pipeline::PipelineError, store::StoreError};

#[derive(Error, Debug)]
pub enum AppError {
  /// 读取表单失败，状态码沿用 axum 的判断（超出上限时为 413）
  #[error("上传读取失败: {0}")]
  Multipart(#[from] MultipartError),
  #[error("检测队列繁忙, 请稍后重试")]
  QueueFull,
  #[error("存储错误: {0}")]
  Storage(#[from] StoreError),
  #[error("内部错误: {0}")]
  Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<PipelineError> for AppError {
  fn from(e: PipelineError) -> Self {
    match e {
      PipelineError::QueueFull => AppError::QueueFull,
      PipelineError::Closed => AppError::Internal(e.to_string()),
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let (status, code, message) = match &self {
      AppError::Multipart(e) => {
        let status = e.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
          "PAYLOAD_TOO_LARGE"
        } else {
          "BAD_REQUEST"
        };
        (status, code, e.body_text())
      }
      AppError::QueueFull => (
        StatusCode::SERVICE_UNAVAILABLE,
        "QUEUE_FULL",
        self.to_string(),
      ),
      // 存储与内部错误只记录日志，不向客户端暴露细节
      AppError::Storage(e) => {
        error!(error = %e, "存储错误");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          "INTERNAL_ERROR",
          "服务器内部错误".to_string(),
        )
      }
      AppError::Internal(msg) => {
        error!(error = %msg, "内部错误");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          "INTERNAL_ERROR",
          "服务器内部错误".to_string(),
        )
      }
    };

    (status, Json(json!({ "error": message, "code": code }))).into_response()
  }
}
