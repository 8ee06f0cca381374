// 该文件是 RealESRGAN Serve 项目的一部分。
// src/server.rs - HTTP 超分服务
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

//! # HTTP 超分服务
//!
//! | 方法 | 路径 | 说明 |
//! |---|---|---|
//! | GET | `/health` | 返回 200 `OK` |
//! | POST | `/upscale?ext=<ext>` | multipart 表单，`image` 字段为图像文件，返回放大 4 倍后的图像 |
//!
//! 服务启动时加载一次引擎，所有推理经由 [`InferenceWorker`] 串行执行。

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::backend::Engine;
use crate::codec::{self, OutputFormat};
use crate::tensor::RgbPlanarTensor;
use crate::worker::{InferenceJob, InferenceWorker};

mod error;
pub use self::error::ApiError;

/// multipart 表单中图像文件的字段名
pub const IMAGE_FIELD: &str = "image";

/// 默认允许的最大输入像素数 (2048x2048)，输出缓冲区为其 48 倍的 f32
pub const MAX_INPUT_PIXELS: u64 = 2048 * 2048;

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub port: u16,
  /// 从进入处理函数到读完上传图像的总时限
  pub read_timeout: Duration,
  /// 从请求开始到写完响应的时限
  pub write_timeout: Duration,
  pub body_limit: usize,
  pub max_pixels: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      port: 8080,
      read_timeout: Duration::from_secs(30),
      write_timeout: Duration::from_secs(60),
      body_limit: 100 * 1024 * 1024,
      max_pixels: MAX_INPUT_PIXELS,
    }
  }
}

#[derive(Clone)]
pub struct AppState {
  worker: InferenceWorker,
  read_timeout: Duration,
  max_pixels: u64,
}

impl AppState {
  pub fn new(worker: InferenceWorker) -> Self {
    let config = ServerConfig::default();
    Self {
      worker,
      read_timeout: config.read_timeout,
      max_pixels: config.max_pixels,
    }
  }

  pub fn with_limits(mut self, config: &ServerConfig) -> Self {
    self.read_timeout = config.read_timeout;
    self.max_pixels = config.max_pixels;
    self
  }
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/upscale", post(upscale))
    .with_state(state.with_limits(config))
    .layer(DefaultBodyLimit::max(config.body_limit))
    // 单个数据帧的等待时限；整体读取时限在 upscale 中检查
    .layer(RequestBodyTimeoutLayer::new(config.read_timeout))
    .layer(TimeoutLayer::new(config.write_timeout))
    .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
  "OK"
}

#[derive(Debug, Deserialize)]
pub struct UpscaleQuery {
  pub ext: Option<String>,
}

struct Upload {
  file_name: Option<String>,
  bytes: Bytes,
}

impl Upload {
  /// 上传文件名的扩展名（带前导 `.`）
  fn extension(&self) -> Option<String> {
    let name = self.file_name.as_deref()?;
    let ext = Path::new(name).extension()?;
    Some(format!(".{}", ext.to_string_lossy()))
  }
}

fn form_error(err: axum::extract::multipart::MultipartError) -> ApiError {
  if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
    ApiError::PayloadTooLarge(err.body_text())
  } else {
    ApiError::BadForm(err.body_text())
  }
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Upload, ApiError> {
  while let Some(field) = multipart.next_field().await.map_err(form_error)? {
    if field.name() != Some(IMAGE_FIELD) {
      debug!("忽略表单字段: {:?}", field.name());
      continue;
    }
    let file_name = field.file_name().map(str::to_owned);
    let bytes = field.bytes().await.map_err(form_error)?;
    return Ok(Upload { file_name, bytes });
  }

  Err(ApiError::BadForm(format!(
    "表单中缺少 '{}' 字段",
    IMAGE_FIELD
  )))
}

async fn upscale(
  State(state): State<AppState>,
  Query(query): Query<UpscaleQuery>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
  let deadline = Instant::now() + state.read_timeout;
  let mut multipart = multipart.map_err(|e| ApiError::BadForm(e.body_text()))?;
  let upload = tokio::time::timeout_at(deadline, read_image_field(&mut multipart))
    .await
    .map_err(|_| ApiError::ReadTimeout(state.read_timeout))??;

  let ext = query
    .ext
    .filter(|ext| !ext.is_empty())
    .or_else(|| upload.extension())
    .unwrap_or_else(|| OutputFormat::Png.extension().to_string());
  let format = OutputFormat::from_extension(&ext);
  info!(
    "收到图像 {} ({} 字节), 输出格式 {}",
    upload.file_name.as_deref().unwrap_or("<未命名>"),
    upload.bytes.len(),
    ext
  );

  // 客户端断开时 handler 被丢弃，guard 随之触发取消
  let cancel = CancellationToken::new();
  let _guard = cancel.clone().drop_guard();
  let worker = state.worker.clone();
  let max_pixels = state.max_pixels;
  let task = tokio::spawn(async move {
    process(worker, upload.bytes, format, max_pixels, cancel).await
  });
  let encoded = task.await??;

  Ok(([(header::CONTENT_TYPE, format.content_type())], encoded).into_response())
}

/// 解码 -> 推理 -> 编码
async fn process(
  worker: InferenceWorker,
  bytes: Bytes,
  format: OutputFormat,
  max_pixels: u64,
  cancel: CancellationToken,
) -> Result<Vec<u8>, ApiError> {
  let input = tokio::task::spawn_blocking(move || -> Result<RgbPlanarTensor, ApiError> {
    // 先看图像头，超过上限的图像不解码也不分配输出缓冲区
    let (width, height) = codec::image_dimensions(&bytes)?;
    if u64::from(width) * u64::from(height) > max_pixels {
      return Err(ApiError::ImageTooLarge {
        width,
        height,
        max_pixels,
      });
    }
    Ok(codec::decode_and_preprocess(&bytes)?)
  })
  .await??;
  debug!("图像解码完成: {}x{}", input.width(), input.height());

  let job = worker.submit(InferenceJob::new(input), &cancel).await?;
  if cancel.is_cancelled() {
    debug!("推理完成时客户端已断开, 丢弃结果");
    return Err(ApiError::ClientGone);
  }

  let encoded =
    tokio::task::spawn_blocking(move || codec::postprocess_and_encode(&job.output, format))
      .await??;
  debug!("输出编码完成: {} 字节", encoded.len());
  Ok(encoded)
}

/// 在 `listener` 上提供服务，直到 `shutdown` 被触发
pub async fn serve(
  listener: TcpListener,
  app: Router,
  shutdown: CancellationToken,
) -> std::io::Result<()> {
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}

/// 用已加载的引擎启动服务，阻塞直到 `shutdown` 被触发；退出前释放引擎
pub async fn run(
  config: ServerConfig,
  engine: Engine,
  shutdown: CancellationToken,
) -> anyhow::Result<()> {
  let worker = InferenceWorker::new(engine);
  let app = router(AppState::new(worker.clone()), &config);

  let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
  let listener = TcpListener::bind(addr)
    .await
    .with_context(|| format!("无法监听端口 {}", config.port))?;
  info!("REST API 监听于 http://localhost:{}", config.port);

  let result = serve(listener, app, shutdown).await;
  info!("服务已停止, 释放引擎");
  worker.shutdown();
  result.context("服务运行错误")
}
