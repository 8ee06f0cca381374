// 该文件是 RealESRGAN Serve 项目的一部分。
// src/worker.rs - 单槽推理执行器
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

//! 单槽推理执行器。
//!
//! 所有推理调用都经过一个容量为 1 的信号量，同一时刻只有一个推理在引擎上执行。
//! 等待槽位的过程可以被取消；进入推理后不可取消，调用会执行到结束。

use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{BackendError, Engine};
use crate::tensor::RgbPlanarTensor;

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("等待推理槽位时请求已取消")]
  Cancelled,
  #[error("推理失败: {0}")]
  Backend(#[from] BackendError),
  #[error("推理执行器已关闭")]
  Closed,
  #[error("推理任务异常退出: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// 一次推理的输入与预先分配好的输出缓冲区
#[derive(Debug)]
pub struct InferenceJob {
  pub input: RgbPlanarTensor,
  pub output: RgbPlanarTensor,
}

impl InferenceJob {
  /// 按输入尺寸分配 `3·4w·4h` 的输出缓冲区
  pub fn new(input: RgbPlanarTensor) -> Self {
    let output = input.upscaled_buffer();
    Self { input, output }
  }
}

#[derive(Clone)]
pub struct InferenceWorker {
  slot: Arc<Semaphore>,
  engine: Arc<Mutex<Engine>>,
}

impl InferenceWorker {
  pub fn new(engine: Engine) -> Self {
    Self {
      slot: Arc::new(Semaphore::new(1)),
      engine: Arc::new(Mutex::new(engine)),
    }
  }

  /// 当前空闲槽位数，0 或 1
  pub fn available_slots(&self) -> usize {
    self.slot.available_permits()
  }

  /// 提交一次推理，返回填好输出的任务。
  ///
  /// 在拿到槽位之前 `cancel` 触发则返回 [`WorkerError::Cancelled`]，不占用槽位。
  pub async fn submit(
    &self,
    job: InferenceJob,
    cancel: &CancellationToken,
  ) -> Result<InferenceJob, WorkerError> {
    let permit = tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        debug!("等待推理槽位时请求被取消");
        return Err(WorkerError::Cancelled);
      }
      permit = self.slot.clone().acquire_owned() => permit.map_err(|_| WorkerError::Closed)?,
    };

    let engine = self.engine.clone();
    let handle = tokio::task::spawn_blocking(move || -> Result<InferenceJob, WorkerError> {
      // 槽位在闭包结束时随 permit 一起释放，包括推理失败的情况
      let _permit = permit;
      let mut job = job;
      let mut engine = engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

      let (width, height) = (job.input.width(), job.input.height());
      let now = Instant::now();
      engine.run(job.input.as_planar(), job.output.as_mut(), width, height)?;
      info!("推理完成 ({}x{}), 耗时: {:.2?}", width, height, now.elapsed());
      Ok(job)
    });

    handle.await?
  }

  /// 关闭执行器并释放引擎；之后的提交返回 [`WorkerError::Closed`] 或 [`BackendError::Released`]
  pub fn shutdown(&self) {
    self.slot.close();
    let mut engine = self
      .engine
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    engine.release();
  }
}
