// 该文件是 MRI Lens （脑影） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::{
  sync::{Arc, Mutex, mpsc},
  time::Duration,
};

use axum::{
  Router,
  body::Body,
  http::{Request, Response, header},
};
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use tower::ServiceExt;

use mri_lens::{
  frame::InferenceFrame,
  model::{DetectItem, DetectResult, Model, ModelError, SharedModel},
  output::draw::Draw,
  pipeline::{JobStatus, Pipeline, PipelineConfig},
  server::{AppState, build_router},
  store::{KeyPolicy, Storage},
};

pub const BOUNDARY: &str = "mri-lens-test-boundary";
pub const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// 不加载真实模型，在图像中央报告一个目标
pub struct FakeModel {
  fail: bool,
  gate: Option<Mutex<mpsc::Receiver<()>>>,
  slow_on_bright: bool,
}

impl FakeModel {
  pub fn detecting() -> Self {
    Self {
      fail: false,
      gate: None,
      slow_on_bright: false,
    }
  }

  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::detecting()
    }
  }

  /// 左上角像素偏亮的图像推理时先睡 800 毫秒
  pub fn slow_on_bright() -> Self {
    Self {
      slow_on_bright: true,
      ..Self::detecting()
    }
  }

  /// 每次推理都等待一次放行信号
  pub fn gated() -> (Self, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel();
    (
      Self {
        gate: Some(Mutex::new(rx)),
        ..Self::detecting()
      },
      tx,
    )
  }
}

impl Model for FakeModel {
  type Input = InferenceFrame;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &InferenceFrame) -> Result<DetectResult, ModelError> {
    if self.slow_on_bright && input.original().get_pixel(0, 0)[0] > 200 {
      std::thread::sleep(Duration::from_millis(800));
    }
    if let Some(gate) = &self.gate {
      let _ = gate.lock().unwrap().recv();
    }
    if self.fail {
      return Err(ModelError::Other("fake model failure".to_string()));
    }
    Ok(
      vec![DetectItem {
        class_id: 0,
        score: 0.92,
        bbox: [0.25, 0.25, 0.75, 0.75],
      }]
      .into(),
    )
  }
}

pub struct TestApp {
  pub dir: tempfile::TempDir,
  pub router: Router,
  pub pipeline: Pipeline,
  pub storage: Arc<Storage>,
}

impl TestApp {
  pub fn new(model: FakeModel) -> Self {
    Self::with_options(model, KeyPolicy::Filename, PipelineConfig::default())
  }

  pub fn with_options(model: FakeModel, policy: KeyPolicy, config: PipelineConfig) -> Self {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::new(
      dir.path().join("uploads"),
      dir.path().join("static").join("results"),
      policy,
    ));
    storage.ensure_dirs().unwrap();

    let model: SharedModel = Arc::new(model);
    let pipeline = Pipeline::start(model, storage.clone(), Arc::new(Draw::default()), config);
    let router = build_router(AppState::new(pipeline.clone()), MAX_UPLOAD_BYTES);

    Self {
      dir,
      router,
      pipeline,
      storage,
    }
  }

  pub async fn get(&self, uri: &str) -> Response<Body> {
    self
      .router
      .clone()
      .oneshot(Request::get(uri).body(Body::empty()).unwrap())
      .await
      .unwrap()
  }

  pub async fn post_multipart(&self, body: Vec<u8>) -> Response<Body> {
    let request = Request::post("/")
      .header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={BOUNDARY}"),
      )
      .body(Body::from(body))
      .unwrap();
    self.router.clone().oneshot(request).await.unwrap()
  }

  pub async fn post(&self, content_type: Option<&str>, body: Vec<u8>) -> Response<Body> {
    let mut request = Request::post("/");
    if let Some(content_type) = content_type {
      request = request.header(header::CONTENT_TYPE, content_type);
    }
    let request = request.body(Body::from(body)).unwrap();
    self.router.clone().oneshot(request).await.unwrap()
  }

  pub async fn upload(&self, filename: &str, bytes: &[u8]) -> Response<Body> {
    self
      .post_multipart(multipart_body("file", Some(filename), bytes))
      .await
  }

  /// 轮询直到任务离开排队与处理状态，最多十秒
  pub async fn wait(&self, key: &str) -> JobStatus {
    for _ in 0..500 {
      let status = self.pipeline.status(key);
      if !matches!(status, JobStatus::Queued | JobStatus::Processing) {
        return status;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    self.pipeline.status(key)
  }

  /// 轮询直到任务进入处理状态
  pub async fn wait_processing(&self, key: &str) {
    for _ in 0..500 {
      if self.pipeline.status(key) == JobStatus::Processing {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{key} 没有进入处理状态");
  }

  pub fn upload_count(&self) -> usize {
    std::fs::read_dir(self.storage.uploads_dir()).unwrap().count()
  }

  pub fn result_count(&self) -> usize {
    std::fs::read_dir(self.storage.results_dir()).unwrap().count()
  }
}

pub fn multipart_body(field: &str, filename: Option<&str>, bytes: &[u8]) -> Vec<u8> {
  let disposition = match filename {
    Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
    None => format!("form-data; name=\"{field}\""),
  };

  let mut body = Vec::new();
  body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
  body.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
  body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
  body.extend_from_slice(bytes);
  body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
  body
}

pub fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
  let mut bytes = Vec::new();
  RgbImage::from_pixel(width, height, Rgb(color))
    .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
    .unwrap();
  bytes
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
  response
    .into_body()
    .collect()
    .await
    .unwrap()
    .to_bytes()
    .to_vec()
}

pub async fn body_text(response: Response<Body>) -> String {
  String::from_utf8(body_bytes(response).await).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
  serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn location(response: &Response<Body>) -> &str {
  response
    .headers()
    .get(header::LOCATION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default()
}
