// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/model/yolo.rs - ONNX Runtime YOLO 检测器
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

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Value,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::LetterboxFrame,
  model::{DecodeParams, DetectResult, Labels, Model, ModelError, decode_output},
};

const ULTRALYTICS_NAMES_KEY: &str = "names";
const DEFAULT_INTRA_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型文件不存在: {0}")]
  ModelMissing(PathBuf),
  #[error("会话错误（{context}）: {message}")]
  Session {
    context: &'static str,
    message: String,
  },
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("模型没有输入")]
  NoInput,
  #[error("模型没有输出")]
  NoOutput,
  #[error("会话锁已损坏")]
  Poisoned,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl YoloError {
  fn session<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Self {
    move |e| YoloError::Session {
      context,
      message: e.to_string(),
    }
  }

  fn inference(e: impl std::fmt::Display) -> Self {
    YoloError::Inference(e.to_string())
  }
}

pub struct YoloOnnxBuilder {
  model_path: PathBuf,
  params: DecodeParams,
  labels: Option<Labels>,
  intra_threads: usize,
}

impl FromUrlWithScheme for YoloOnnxBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for YoloOnnxBuilder {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案, 实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(Self::new(url.path()))
  }
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      params: DecodeParams::default(),
      labels: None,
      intra_threads: DEFAULT_INTRA_THREADS,
    }
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.params.confidence = confidence;
    self
  }

  pub fn iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.params.iou_threshold = iou_threshold;
    self
  }

  pub fn max_detections(mut self, max_detections: usize) -> Self {
    self.params.max_detections = max_detections;
    self
  }

  /// 覆盖模型元数据中的类别名称
  pub fn labels(mut self, labels: Option<Labels>) -> Self {
    self.labels = labels;
    self
  }

  pub fn intra_threads(mut self, intra_threads: usize) -> Self {
    self.intra_threads = intra_threads;
    self
  }

  pub fn build<const S: u32>(self) -> Result<YoloOnnx<S>, YoloError> {
    if !self.model_path.exists() {
      return Err(YoloError::ModelMissing(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let session = Session::builder()
      .map_err(YoloError::session("创建会话构建器"))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(YoloError::session("设置优化级别"))?
      .with_intra_threads(self.intra_threads)
      .map_err(YoloError::session("设置线程数"))?
      .commit_from_file(&self.model_path)
      .map_err(YoloError::session("加载 ONNX 模型"))?;

    let input_name = session
      .inputs()
      .first()
      .map(|input| input.name().to_string())
      .ok_or(YoloError::NoInput)?;
    debug!("模型输入: {}", input_name);
    debug!("模型输出数量: {}", session.outputs().len());

    let labels = match self.labels {
      Some(labels) => labels,
      None => match session
        .metadata()
        .ok()
        .and_then(|meta| meta.custom(ULTRALYTICS_NAMES_KEY))
        .as_deref()
        .and_then(Labels::parse_ultralytics)
      {
        Some(labels) => labels,
        None => {
          warn!("模型元数据中没有类别名称, 使用 class_<id>");
          Labels::default()
        }
      },
    };
    info!("模型加载完成, 类别数 {}", labels.len());

    let params = DecodeParams {
      classes: (!labels.is_empty()).then_some(labels.len()),
      ..self.params
    };

    Ok(YoloOnnx {
      session: Mutex::new(session),
      input_name,
      params,
      labels,
    })
  }
}

pub struct YoloOnnx<const S: u32> {
  session: Mutex<Session>,
  input_name: String,
  params: DecodeParams,
  labels: Labels,
}

impl<const S: u32> YoloOnnx<S> {
  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  pub fn params(&self) -> &DecodeParams {
    &self.params
  }

  fn run(&self, input: &LetterboxFrame<S>) -> Result<DetectResult, ModelError> {
    let tensor = Array4::from_shape_vec(
      (1, input.channels(), input.size(), input.size()),
      input.to_nchw_f32(),
    )
    .map_err(YoloError::inference)?;
    let value = Value::from_array(tensor).map_err(YoloError::inference)?;

    let mut session = self.session.lock().map_err(|_| YoloError::Poisoned)?;
    debug!("执行模型推理");
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => value])
      .map_err(YoloError::inference)?;

    let output = outputs.values().next().ok_or(YoloError::NoOutput)?;
    let (shape, data) = output
      .try_extract_tensor::<f32>()
      .map_err(YoloError::inference)?;
    let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    debug!("模型输出形状: {:?}", shape);

    Ok(decode_output(&shape, data, &self.params, input.letterbox())?)
  }
}

impl<const S: u32> Model for YoloOnnx<S> {
  type Input = LetterboxFrame<S>;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let result = self.run(input)?;
    for item in result.iter() {
      debug!(
        "  - {}: {:.2}% at {:?}",
        self.labels.name(item.class_id),
        item.score * 100.0,
        item.bbox
      );
    }
    Ok(result)
  }
}
