// 该文件是 RealESRGAN Serve 项目的一部分。
// src/dispatch/local.rs - 本地超分
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

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DispatchError, FilePair, Upscaler, read_input, write_output};
use crate::backend::Engine;
use crate::codec::{self, OutputFormat};
use crate::worker::{InferenceJob, InferenceWorker};

/// 在本进程内加载引擎处理图像
pub struct LocalUpscaler {
  worker: InferenceWorker,
  // 命令行本地模式不会取消推理
  cancel: CancellationToken,
}

impl LocalUpscaler {
  pub fn load(engine_path: &Path, gpu_id: u32) -> Result<Self, DispatchError> {
    let engine = Engine::load(engine_path, gpu_id)?;
    Ok(Self::new(engine))
  }

  pub fn new(engine: Engine) -> Self {
    Self {
      worker: InferenceWorker::new(engine),
      cancel: CancellationToken::new(),
    }
  }

  /// 解码 -> 推理 -> 编码
  pub async fn upscale_bytes(
    &self,
    bytes: Vec<u8>,
    format: OutputFormat,
  ) -> Result<Vec<u8>, DispatchError> {
    let input = tokio::task::spawn_blocking(move || codec::decode_and_preprocess(&bytes)).await??;
    debug!("图像解码完成: {}x{}", input.width(), input.height());

    let job = self
      .worker
      .submit(InferenceJob::new(input), &self.cancel)
      .await?;

    let encoded =
      tokio::task::spawn_blocking(move || codec::postprocess_and_encode(&job.output, format))
        .await??;
    Ok(encoded)
  }

  /// 释放引擎
  pub fn shutdown(&self) {
    self.worker.shutdown();
  }
}

impl Upscaler for LocalUpscaler {
  type Error = DispatchError;

  async fn upscale_file(&self, pair: &FilePair) -> Result<(), Self::Error> {
    info!("处理 {} -> {}", pair.input.display(), pair.output.display());
    let bytes = read_input(&pair.input).await?;

    let format = pair
      .output_extension()
      .map(|ext| OutputFormat::from_extension(&ext))
      .unwrap_or(OutputFormat::Png);
    let encoded = self.upscale_bytes(bytes, format).await?;
    write_output(&pair.output, encoded).await
  }
}
