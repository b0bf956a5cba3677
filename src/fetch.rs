// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/fetch.rs - 启动时下载模型文件
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

use std::path::{Path, PathBuf};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum FetchError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("HTTP 请求错误: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("下载 {url} 失败: HTTP {status}")]
  Status { url: String, status: u16 },
  #[error("{0} 返回的不是模型文件")]
  NotAModel(String),
}

enum Attempt {
  Done(u64),
  Html,
}

/// 模型文件不存在时下载，返回是否发生了下载
pub async fn ensure_model(path: &Path, url: &str) -> Result<bool, FetchError> {
  ensure_model_with(&reqwest::Client::new(), path, url).await
}

async fn ensure_model_with(
  client: &reqwest::Client,
  path: &Path,
  url: &str,
) -> Result<bool, FetchError> {
  if tokio::fs::try_exists(path).await? {
    info!("模型文件已存在: {}", path.display());
    return Ok(false);
  }

  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    tokio::fs::create_dir_all(parent).await?;
  }

  info!("模型文件不存在, 开始下载: {}", url);
  let partial = partial_path(path);
  let now = std::time::Instant::now();

  let mut attempt = download(client, url, &partial).await;
  if matches!(attempt, Ok(Attempt::Html)) && !url.contains("confirm=") {
    // 大文件会先返回一张病毒扫描确认页
    let confirmed = with_confirm(url);
    warn!("收到 HTML 页面, 以确认参数重试: {}", confirmed);
    attempt = download(client, &confirmed, &partial).await;
  }

  match attempt {
    Ok(Attempt::Done(bytes)) => {
      tokio::fs::rename(&partial, path).await?;
      info!(
        "模型下载完成: {} ({} 字节, 耗时 {:.2?})",
        path.display(),
        bytes,
        now.elapsed()
      );
      Ok(true)
    }
    Ok(Attempt::Html) => {
      let _ = tokio::fs::remove_file(&partial).await;
      Err(FetchError::NotAModel(url.to_string()))
    }
    Err(e) => {
      let _ = tokio::fs::remove_file(&partial).await;
      Err(e)
    }
  }
}

async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<Attempt, FetchError> {
  let response = client.get(url).send().await?;
  if !response.status().is_success() {
    return Err(FetchError::Status {
      url: url.to_string(),
      status: response.status().as_u16(),
    });
  }

  let is_html = response
    .headers()
    .get(reqwest::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(is_html_content_type);
  if is_html {
    return Ok(Attempt::Html);
  }

  let mut file = tokio::fs::File::create(dest).await?;
  let mut stream = response.bytes_stream();
  let mut downloaded = 0u64;
  let mut first_chunk = true;

  while let Some(chunk) = stream.next().await {
    let chunk = chunk?;
    if first_chunk && looks_like_html(&chunk) {
      return Ok(Attempt::Html);
    }
    first_chunk = false;
    downloaded += chunk.len() as u64;
    file.write_all(&chunk).await?;
  }
  file.flush().await?;

  Ok(Attempt::Done(downloaded))
}

fn partial_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(".part");
  PathBuf::from(name)
}

fn with_confirm(url: &str) -> String {
  let separator = if url.contains('?') { '&' } else { '?' };
  format!("{url}{separator}confirm=t")
}

fn is_html_content_type(content_type: &str) -> bool {
  content_type
    .split(';')
    .next()
    .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}

fn looks_like_html(head: &[u8]) -> bool {
  let text = String::from_utf8_lossy(&head[..head.len().min(64)]);
  let text = text.trim_start().to_ascii_lowercase();
  text.starts_with("<!doctype html") || text.starts_with("<html")
}
