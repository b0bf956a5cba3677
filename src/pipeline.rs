// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/pipeline.rs - 检测任务队列与工作线程
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
  collections::HashMap,
  sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
  frame::INFERENCE_SIZE,
  input::ImageFileInput,
  model::{DetectResult, SharedModel},
  output::{OverlayResolution, Render, SaveImageFileOutput, draw::Draw},
  store::{DetectionRecord, Storage},
  task::{OneShotTask, Task},
};

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
  Queued,
  Processing,
  Succeeded { detections: usize },
  Failed { error: String },
  Unknown,
}

impl JobStatus {
  pub fn state_name(&self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Processing => "processing",
      JobStatus::Succeeded { .. } => "succeeded",
      JobStatus::Failed { .. } => "failed",
      JobStatus::Unknown => "unknown",
    }
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum PipelineError {
  #[error("任务队列已满")]
  QueueFull,
  #[error("任务队列已关闭")]
  Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
  pub workers: usize,
  pub queue_capacity: usize,
  pub resolution: OverlayResolution,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      workers: 2,
      queue_capacity: 32,
      resolution: OverlayResolution::Original,
    }
  }
}

struct Job {
  key: String,
  generation: u64,
}

#[derive(Default)]
struct Registry {
  next_generation: u64,
  /// 尚未落盘的任务，结果写入记录后移除
  jobs: HashMap<String, (u64, JobStatus)>,
  /// 同一 key 的任务依次执行
  key_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

struct JobContext {
  model: SharedModel,
  storage: Arc<Storage>,
  draw: Arc<Draw>,
  resolution: OverlayResolution,
}

/// 进程内唯一的检测服务：接收任务、记录状态，推理在阻塞线程池中执行
#[derive(Clone)]
pub struct Pipeline {
  registry: Arc<Mutex<Registry>>,
  sender: mpsc::Sender<Job>,
  storage: Arc<Storage>,
}

/// 已占住的队列位置，提交前不改变任何任务状态
pub struct Reservation {
  permit: mpsc::OwnedPermit<Job>,
  registry: Arc<Mutex<Registry>>,
}

impl Reservation {
  /// 同一 key 重复提交时，旧任务不会再写入结果或状态
  pub fn submit(self, key: impl Into<String>) {
    let key = key.into();
    let generation = {
      let mut registry = lock(&self.registry);
      registry.next_generation += 1;
      let generation = registry.next_generation;
      registry
        .jobs
        .insert(key.clone(), (generation, JobStatus::Queued));
      generation
    };
    info!("任务入队: {}", key);
    self.permit.send(Job { key, generation });
  }
}

impl Pipeline {
  /// 需要在 tokio 运行时内调用
  pub fn start(
    model: SharedModel,
    storage: Arc<Storage>,
    draw: Arc<Draw>,
    config: PipelineConfig,
  ) -> Self {
    let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let registry = Arc::new(Mutex::new(Registry::default()));
    let context = Arc::new(JobContext {
      model,
      storage: storage.clone(),
      draw,
      resolution: config.resolution,
    });

    let workers = config.workers.max(1);
    for worker in 0..workers {
      tokio::spawn(worker_loop(
        worker,
        receiver.clone(),
        registry.clone(),
        context.clone(),
      ));
    }
    info!(
      "检测服务已启动: {} 个工作线程, 队列容量 {}",
      workers,
      config.queue_capacity.max(1)
    );

    Self {
      registry,
      sender,
      storage,
    }
  }

  /// 先占队列位置再写上传文件，队列满时磁盘上的旧文件保持不变
  pub fn reserve(&self) -> Result<Reservation, PipelineError> {
    match self.sender.clone().try_reserve_owned() {
      Ok(permit) => Ok(Reservation {
        permit,
        registry: self.registry.clone(),
      }),
      Err(mpsc::error::TrySendError::Full(_)) => {
        warn!("任务队列已满, 拒绝新任务");
        Err(PipelineError::QueueFull)
      }
      Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Closed),
    }
  }

  pub fn submit(&self, key: impl Into<String>) -> Result<(), PipelineError> {
    self.reserve()?.submit(key);
    Ok(())
  }

  pub fn status(&self, key: &str) -> JobStatus {
    if let Some((_, status)) = lock(&self.registry).jobs.get(key) {
      return status.clone();
    }

    // 已结束的任务以及进程重启后都以磁盘上的记录为准
    match self.storage.read_record(key) {
      Some(DetectionRecord {
        error: Some(error), ..
      }) => JobStatus::Failed { error },
      Some(record) if self.storage.has_result(key) => JobStatus::Succeeded {
        detections: record.detections.len(),
      },
      _ => JobStatus::Unknown,
    }
  }

  pub fn storage(&self) -> &Arc<Storage> {
    &self.storage
  }

  #[cfg(test)]
  fn tracked(&self) -> (usize, usize) {
    let registry = lock(&self.registry);
    (registry.jobs.len(), registry.key_locks.len())
  }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
  registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_current(registry: &Mutex<Registry>, key: &str, generation: u64) -> bool {
  lock(registry).jobs.get(key).map(|(g, _)| *g) == Some(generation)
}

fn update(registry: &Mutex<Registry>, job: &Job, status: JobStatus) -> bool {
  let mut registry = lock(registry);
  match registry.jobs.get_mut(&job.key) {
    Some((generation, current)) if *generation == job.generation => {
      *current = status;
      true
    }
    _ => false,
  }
}

/// 结果已经落盘，之后的查询直接读记录
fn evict(registry: &Mutex<Registry>, job: &Job) {
  let mut registry = lock(registry);
  if registry.jobs.get(&job.key).map(|(g, _)| *g) == Some(job.generation) {
    registry.jobs.remove(&job.key);
  }
}

fn key_lock(registry: &Mutex<Registry>, key: &str) -> Arc<tokio::sync::Mutex<()>> {
  lock(registry)
    .key_locks
    .entry(key.to_string())
    .or_default()
    .clone()
}

fn release_key_lock(registry: &Mutex<Registry>, key: &str, handle: Arc<tokio::sync::Mutex<()>>) {
  drop(handle);
  let mut registry = lock(registry);
  if registry
    .key_locks
    .get(key)
    .is_some_and(|l| Arc::strong_count(l) == 1)
  {
    registry.key_locks.remove(key);
  }
}

async fn worker_loop(
  worker: usize,
  receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
  registry: Arc<Mutex<Registry>>,
  context: Arc<JobContext>,
) {
  loop {
    let job = { receiver.lock().await.recv().await };
    let Some(job) = job else {
      info!("工作线程 {} 退出", worker);
      break;
    };

    let handle = key_lock(&registry, &job.key);
    {
      let _guard = handle.lock().await;
      process(&job, &registry, &context).await;
    }
    release_key_lock(&registry, &job.key, handle);
  }
}

async fn process(job: &Job, registry: &Arc<Mutex<Registry>>, context: &Arc<JobContext>) {
  if !update(registry, job, JobStatus::Processing) {
    info!("任务 {} 已被更新的提交取代, 跳过", job.key);
    return;
  }

  let outcome = {
    let key = job.key.clone();
    let generation = job.generation;
    let registry = registry.clone();
    let ctx = context.clone();
    tokio::task::spawn_blocking(move || {
      run_job(&ctx, &key, || is_current(&registry, &key, generation))
    })
    .await
  };

  let error = match outcome {
    Ok(Ok(Some(result))) => {
      info!("任务 {} 完成: 检测到 {} 个目标", job.key, result.len());
      evict(registry, job);
      return;
    }
    Ok(Ok(None)) => {
      info!("任务 {} 已被更新的提交取代, 丢弃结果", job.key);
      return;
    }
    Ok(Err(e)) => {
      error!("任务 {} 失败: {:#}", job.key, e);
      format!("{e:#}")
    }
    Err(e) => {
      error!("任务 {} 异常终止: {}", job.key, e);
      "检测任务异常终止".to_string()
    }
  };

  if !is_current(registry, &job.key, job.generation) {
    return;
  }
  let record = DetectionRecord::failed(&job.key, context.resolution, error.clone());
  match context.storage.write_record(&record) {
    Ok(()) => evict(registry, job),
    Err(e) => {
      warn!("任务 {} 的失败记录写入失败: {}", job.key, e);
      update(registry, job, JobStatus::Failed { error });
    }
  }
}

/// 任务被取代时不再写图像
struct UnlessSuperseded<'a, O, C> {
  output: &'a O,
  is_current: C,
}

impl<F, D, O: Render<F, D>, C: Fn() -> bool> Render<F, D> for UnlessSuperseded<'_, O, C> {
  type Error = O::Error;

  fn render_result(&self, frame: &F, result: &D) -> Result<(), Self::Error> {
    if !(self.is_current)() {
      debug!("任务已被取代, 不写结果图像");
      return Ok(());
    }
    self.output.render_result(frame, result)
  }
}

/// 任务中途被取代时返回 `None`，结果图像与记录都不写
fn run_job(
  context: &JobContext,
  key: &str,
  is_current: impl Fn() -> bool,
) -> anyhow::Result<Option<DetectResult>> {
  let upload_path = context.storage.upload_path(key)?;
  let result_path = context.storage.result_path(key)?;

  let input = ImageFileInput::open(&upload_path)?;
  let dimensions = input.dimensions();
  let output = SaveImageFileOutput::new(result_path, context.draw.clone(), context.resolution);
  let output = UnlessSuperseded {
    output: &output,
    is_current: &is_current,
  };

  let result = OneShotTask.run_task(
    input.into_frames::<INFERENCE_SIZE>(),
    context.model.as_ref(),
    &output,
  )?;

  if !is_current() {
    return Ok(None);
  }
  let record = DetectionRecord::new(
    key,
    dimensions,
    context.resolution,
    &result,
    context.draw.labels(),
  );
  context.storage.write_record(&record)?;

  Ok(Some(result))
}
