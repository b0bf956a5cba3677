// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/store.rs - 上传与结果目录
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  model::{DetectResult, Labels},
  output::OverlayResolution,
};

const RECORD_EXTENSION: &str = "json";
const MAX_KEY_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录序列化错误: {0}")]
  RecordError(#[from] serde_json::Error),
  #[error("非法的文件名: {0}")]
  InvalidKey(String),
}

/// 上传文件如何命名
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyPolicy {
  /// 使用清理后的客户端文件名，同名上传互相覆盖
  #[default]
  Filename,
  /// UUID v7 加原扩展名，互不冲突
  Unique,
}

/// 只保留最后一个路径分量，去掉控制字符与开头的点，
/// 其余非 `[A-Za-z0-9._-]` 字符替换为 `_`
pub fn sanitize_filename(raw: &str) -> Option<String> {
  let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
  let cleaned: String = base
    .chars()
    .filter(|c| !c.is_control())
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
        c
      } else {
        '_'
      }
    })
    .collect();
  let cleaned = cleaned.trim_start_matches('.');

  if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
    return None;
  }

  let mut key = cleaned.to_string();
  if key.len() > MAX_KEY_LEN {
    // 超长时保留扩展名
    let ext = Path::new(&key)
      .extension()
      .map(|e| format!(".{}", e.to_string_lossy()))
      .filter(|e| e.len() < MAX_KEY_LEN / 2)
      .unwrap_or_default();
    key.truncate(MAX_KEY_LEN - ext.len());
    key.push_str(&ext);
  }
  Some(key)
}

/// 能作为目录内文件名直接使用的 key
pub fn is_valid_key(key: &str) -> bool {
  sanitize_filename(key).as_deref() == Some(key)
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
  pub key: String,
  pub path: PathBuf,
  pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedDetection {
  pub class_id: u32,
  pub label: String,
  pub score: f32,
  pub bbox: [f32; 4],
}

/// 与结果图像并列保存的检测记录，失败的任务只记录错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
  pub key: String,
  pub width: u32,
  pub height: u32,
  pub overlay: OverlayResolution,
  pub completed_at: DateTime<Utc>,
  pub detections: Vec<RecordedDetection>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl DetectionRecord {
  pub fn new(
    key: &str,
    (width, height): (u32, u32),
    overlay: OverlayResolution,
    result: &DetectResult,
    labels: &Labels,
  ) -> Self {
    Self {
      key: key.to_string(),
      width,
      height,
      overlay,
      completed_at: Utc::now(),
      detections: result
        .iter()
        .map(|item| RecordedDetection {
          class_id: item.class_id,
          label: labels.name(item.class_id).into_owned(),
          score: item.score,
          bbox: item.bbox,
        })
        .collect(),
      error: None,
    }
  }

  pub fn failed(key: &str, overlay: OverlayResolution, error: impl Into<String>) -> Self {
    Self {
      key: key.to_string(),
      width: 0,
      height: 0,
      overlay,
      completed_at: Utc::now(),
      detections: Vec::new(),
      error: Some(error.into()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Storage {
  uploads_dir: PathBuf,
  results_dir: PathBuf,
  policy: KeyPolicy,
}

impl Storage {
  pub fn new(
    uploads_dir: impl Into<PathBuf>,
    results_dir: impl Into<PathBuf>,
    policy: KeyPolicy,
  ) -> Self {
    Self {
      uploads_dir: uploads_dir.into(),
      results_dir: results_dir.into(),
      policy,
    }
  }

  pub fn uploads_dir(&self) -> &Path {
    &self.uploads_dir
  }

  pub fn results_dir(&self) -> &Path {
    &self.results_dir
  }

  pub fn ensure_dirs(&self) -> Result<(), StoreError> {
    for dir in [&self.uploads_dir, &self.results_dir] {
      if !dir.exists() {
        info!("创建目录: {}", dir.display());
      }
      std::fs::create_dir_all(dir)?;
    }
    Ok(())
  }

  /// 根据客户端文件名分配 key，文件名不可用时返回 None
  pub fn assign_key(&self, client_filename: &str) -> Option<String> {
    let sanitized = sanitize_filename(client_filename)?;
    match self.policy {
      KeyPolicy::Filename => Some(sanitized),
      KeyPolicy::Unique => {
        let ext = Path::new(&sanitized)
          .extension()
          .map(|e| format!(".{}", e.to_string_lossy()))
          .unwrap_or_default();
        Some(format!("{}{}", uuid::Uuid::now_v7(), ext))
      }
    }
  }

  fn checked(&self, key: &str) -> Result<(), StoreError> {
    if is_valid_key(key) {
      Ok(())
    } else {
      Err(StoreError::InvalidKey(key.to_string()))
    }
  }

  pub fn upload_path(&self, key: &str) -> Result<PathBuf, StoreError> {
    self.checked(key)?;
    Ok(self.uploads_dir.join(key))
  }

  pub fn result_path(&self, key: &str) -> Result<PathBuf, StoreError> {
    self.checked(key)?;
    Ok(self.results_dir.join(key))
  }

  pub fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
    self.checked(key)?;
    Ok(self.results_dir.join(format!("{key}.{RECORD_EXTENSION}")))
  }

  /// 原样写入上传内容，同名文件被覆盖
  pub async fn save_upload(&self, key: &str, bytes: &[u8]) -> Result<StoredUpload, StoreError> {
    let path = self.upload_path(key)?;
    tokio::fs::create_dir_all(&self.uploads_dir).await?;
    let partial = self
      .uploads_dir
      .join(format!(".{key}.{}.partial", uuid::Uuid::now_v7()));
    if let Err(e) = tokio::fs::write(&partial, bytes).await {
      let _ = tokio::fs::remove_file(&partial).await;
      return Err(e.into());
    }
    tokio::fs::rename(&partial, &path).await?;
    debug!("保存上传文件 {} ({} 字节)", path.display(), bytes.len());

    Ok(StoredUpload {
      key: key.to_string(),
      path,
      bytes: bytes.len(),
    })
  }

  /// 先写临时文件再改名，读者只会看到完整的记录
  pub fn write_record(&self, record: &DetectionRecord) -> Result<(), StoreError> {
    let path = self.record_path(&record.key)?;
    std::fs::create_dir_all(&self.results_dir)?;
    let partial = self
      .results_dir
      .join(format!(".{}.{}.partial", record.key, uuid::Uuid::now_v7()));
    if let Err(e) = std::fs::write(&partial, serde_json::to_vec_pretty(record)?) {
      let _ = std::fs::remove_file(&partial);
      return Err(e.into());
    }
    std::fs::rename(&partial, &path)?;
    Ok(())
  }

  pub fn read_record(&self, key: &str) -> Option<DetectionRecord> {
    let path = self.record_path(key).ok()?;
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
  }

  pub fn has_result(&self, key: &str) -> bool {
    self.result_path(key).map(|p| p.is_file()).unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectItem;

  #[test]
  fn sanitize_strips_directories_and_odd_characters() {
    assert_eq!(sanitize_filename("scan1.png").as_deref(), Some("scan1.png"));
    assert_eq!(
      sanitize_filename("../../etc/passwd").as_deref(),
      Some("passwd")
    );
    assert_eq!(
      sanitize_filename(r"C:\scans\brain 01.png").as_deref(),
      Some("brain_01.png")
    );
    assert_eq!(sanitize_filename(".hidden.png").as_deref(), Some("hidden.png"));
    assert_eq!(sanitize_filename("脑部.png").as_deref(), Some("__.png"));
  }

  #[test]
  fn sanitize_rejects_empty_names() {
    for raw in ["", "..", "../", "///", "\u{0}", "???"] {
      assert_eq!(sanitize_filename(raw), None, "{raw:?}");
    }
  }

  #[test]
  fn long_names_keep_extension() {
    let raw = format!("{}.png", "a".repeat(500));
    let key = sanitize_filename(&raw).unwrap();
    assert_eq!(key.len(), MAX_KEY_LEN);
    assert!(key.ends_with(".png"));
    assert!(is_valid_key(&key));
  }

  #[test]
  fn key_validation_blocks_traversal() {
    let storage = Storage::new("u", "r", KeyPolicy::Filename);
    assert!(storage.result_path("scan.png").is_ok());
    assert!(matches!(
      storage.result_path("../scan.png"),
      Err(StoreError::InvalidKey(_))
    ));
    assert!(storage.upload_path(".env").is_err());
  }

  #[test]
  fn unique_policy_keeps_extension() {
    let storage = Storage::new("u", "r", KeyPolicy::Unique);
    let a = storage.assign_key("scan.png").unwrap();
    let b = storage.assign_key("scan.png").unwrap();
    assert_ne!(a, b);
    assert!(a.ends_with(".png"));
    assert!(is_valid_key(&a));
    assert_eq!(storage.assign_key("../"), None);
  }

  #[tokio::test]
  async fn upload_overwrites_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(
      dir.path().join("uploads"),
      dir.path().join("results"),
      KeyPolicy::Filename,
    );

    storage.save_upload("scan.png", b"first").await.unwrap();
    let stored = storage.save_upload("scan.png", b"second!").await.unwrap();

    assert_eq!(stored.bytes, 7);
    assert_eq!(std::fs::read(&stored.path).unwrap(), b"second!");
    assert_eq!(std::fs::read_dir(storage.uploads_dir()).unwrap().count(), 1);
  }

  #[test]
  fn record_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path(), dir.path(), KeyPolicy::Filename);
    let result: DetectResult = vec![DetectItem {
      class_id: 1,
      score: 0.5,
      bbox: [0.1, 0.2, 0.3, 0.4],
    }]
    .into();
    let record = DetectionRecord::new(
      "scan.png",
      (512, 512),
      OverlayResolution::Original,
      &result,
      &Labels::from_csv("glioma,meningioma"),
    );

    storage.write_record(&record).unwrap();
    let loaded = storage.read_record("scan.png").unwrap();
    assert_eq!(loaded, record);
    assert_eq!(loaded.detections[0].label, "meningioma");
    assert!(loaded.error.is_none());
    assert!(storage.read_record("other.png").is_none());
  }

  #[test]
  fn failure_record_keeps_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path(), dir.path(), KeyPolicy::Filename);

    let record = DetectionRecord::failed("scan.png", OverlayResolution::Original, "无法解码");
    storage.write_record(&record).unwrap();

    let loaded = storage.read_record("scan.png").unwrap();
    assert_eq!(loaded.error.as_deref(), Some("无法解码"));
    assert!(loaded.detections.is_empty());
    // 目录里只有最终的记录文件
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
  }
}
