// 该文件是 RealESRGAN Serve 项目的一部分。
// src/dispatch.rs - 命令行任务分发
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

//! # 命令行任务分发
//!
//! 先探测本机服务的 `/health`：返回 200 时所有图像交给服务处理（远程），
//! 否则在本进程内加载引擎推理（本地）。本地模式必须提供引擎路径。

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::BackendError;
use crate::codec::CodecError;
use crate::task::{BatchReport, BatchTask};
use crate::worker::WorkerError;

mod local;
mod pairing;
mod remote;

pub use self::local::LocalUpscaler;
pub use self::pairing::{
  ELIGIBLE_EXTENSIONS, FilePair, PairingError, Plan, default_output_dir, default_output_file,
  eligible_files, is_eligible, plan,
};
pub use self::remote::RemoteUpscaler;

/// 健康探测的超时时间
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("HTTP 服务未在端口 {port} 运行, 且未提供 --engine, 无法回退到本地推理")]
  NoRoute { port: u16 },
  #[error("无法读取输入文件 {path}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法写入输出文件 {path}: {source}")]
  Write {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("服务地址无效: {0}")]
  Url(#[from] url::ParseError),
  #[error("HTTP 请求失败: {0}")]
  Http(#[from] reqwest::Error),
  #[error("服务返回错误 {status}: {body}")]
  Server {
    status: reqwest::StatusCode,
    body: String,
  },
  #[error("图像处理失败: {0}")]
  Codec(#[from] CodecError),
  #[error("推理失败: {0}")]
  Worker(#[from] WorkerError),
  #[error("引擎错误: {0}")]
  Backend(#[from] BackendError),
  #[error("任务异常退出: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// 对单个文件对执行一次超分并写出结果
pub trait Upscaler {
  type Error;

  fn upscale_file(&self, pair: &FilePair) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// 推理路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  Remote,
  Local(PathBuf),
}

/// 只根据健康探测结果选择路径；本地路径需要引擎文件
pub fn choose_route(
  server_healthy: bool,
  port: u16,
  engine: Option<&Path>,
) -> Result<Route, DispatchError> {
  if server_healthy {
    return Ok(Route::Remote);
  }
  match engine {
    Some(engine) if !engine.as_os_str().is_empty() => Ok(Route::Local(engine.to_path_buf())),
    _ => Err(DispatchError::NoRoute { port }),
  }
}

/// 本机服务的根地址
pub fn server_url(port: u16) -> Result<Url, DispatchError> {
  Ok(Url::parse(&format!("http://localhost:{}/", port))?)
}

/// `GET /health` 返回 200 时视为服务可用
pub async fn probe_health(base: &Url) -> bool {
  let url = match base.join("health") {
    Ok(url) => url,
    Err(_) => return false,
  };
  let client = match reqwest::Client::builder()
    .timeout(HEALTH_PROBE_TIMEOUT)
    .build()
  {
    Ok(client) => client,
    Err(e) => {
      warn!("无法创建 HTTP 客户端: {}", e);
      return false;
    }
  };

  match client.get(url.clone()).send().await {
    Ok(resp) => {
      debug!("健康探测 {} -> {}", url, resp.status());
      resp.status() == reqwest::StatusCode::OK
    }
    Err(e) => {
      debug!("健康探测 {} 失败: {}", url, e);
      false
    }
  }
}

/// 先写入同目录临时文件再改名，失败时不留下残缺输出
pub(crate) async fn write_output(path: &Path, bytes: Vec<u8>) -> Result<(), DispatchError> {
  let path = path.to_path_buf();
  tokio::task::spawn_blocking(move || -> Result<(), DispatchError> {
    let write_err = |source| DispatchError::Write {
      path: path.clone(),
      source,
    };
    let parent = match path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
      _ => PathBuf::from("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(&parent).map_err(write_err)?;
    file.write_all(&bytes).map_err(write_err)?;
    file.persist(&path).map_err(|e| write_err(e.error))?;
    Ok(())
  })
  .await?
}

pub(crate) async fn read_input(path: &Path) -> Result<Vec<u8>, DispatchError> {
  tokio::fs::read(path).await.map_err(|source| DispatchError::Read {
    path: path.to_path_buf(),
    source,
  })
}

/// 按选定路径分发的超分器
pub enum Dispatcher {
  Remote(RemoteUpscaler),
  Local(LocalUpscaler),
}

impl Upscaler for Dispatcher {
  type Error = DispatchError;

  async fn upscale_file(&self, pair: &FilePair) -> Result<(), Self::Error> {
    match self {
      Dispatcher::Remote(remote) => remote.upscale_file(pair).await,
      Dispatcher::Local(local) => local.upscale_file(pair).await,
    }
  }
}

impl Dispatcher {
  pub fn shutdown(&self) {
    if let Dispatcher::Local(local) = self {
      local.shutdown();
    }
  }
}

/// 默认命令的参数
#[derive(Debug, Clone)]
pub struct UpscaleOptions {
  pub input: PathBuf,
  pub output: Option<PathBuf>,
  pub engine: Option<PathBuf>,
  pub gpu_id: u32,
  pub port: u16,
  pub continue_on_error: bool,
}

/// 默认命令：展开输入、选择路径、逐个处理文件
pub async fn run_upscale(options: UpscaleOptions) -> anyhow::Result<BatchReport> {
  info!("本地超分模式 (realesrgan-x4plus)");
  let plan = plan(&options.input, options.output.as_deref())?;

  let base = server_url(options.port)?;
  let healthy = probe_health(&base).await;
  let dispatcher = match choose_route(healthy, options.port, options.engine.as_deref())? {
    Route::Remote => {
      info!("端口 {} 上的 HTTP 服务可用, 推理任务交给服务处理", options.port);
      Dispatcher::Remote(RemoteUpscaler::new(base)?)
    }
    Route::Local(engine) => {
      info!(
        "端口 {} 上没有 HTTP 服务, 回退到本地引擎: {}",
        options.port,
        engine.display()
      );
      Dispatcher::Local(LocalUpscaler::load(&engine, options.gpu_id)?)
    }
  };

  let task = match &plan {
    Plan::Directory { output_dir, pairs } => {
      info!(
        "输入 {} 是目录, 共 {} 个图像",
        options.input.display(),
        pairs.len()
      );
      std::fs::create_dir_all(output_dir)
        .with_context(|| format!("无法创建输出目录 {}", output_dir.display()))?;
      BatchTask::default().with_continue_on_error(options.continue_on_error)
    }
    Plan::Single(_) => {
      info!("输入 {} 是单个文件", options.input.display());
      BatchTask::default()
    }
  };

  let report = task.run_task(plan.pairs(), &dispatcher).await;
  dispatcher.shutdown();
  report
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn route_follows_health_probe_only() {
    let engine = Path::new("model.plan");
    assert_eq!(choose_route(true, 8080, None).unwrap(), Route::Remote);
    assert_eq!(choose_route(true, 8080, Some(engine)).unwrap(), Route::Remote);
    assert_eq!(
      choose_route(false, 8080, Some(engine)).unwrap(),
      Route::Local(engine.to_path_buf())
    );
  }

  #[test]
  fn no_route_names_port_and_engine_flag() {
    let err = choose_route(false, 9123, None).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("9123"));
    assert!(msg.contains("--engine"));
    assert!(matches!(
      choose_route(false, 9123, Some(Path::new(""))),
      Err(DispatchError::NoRoute { port: 9123 })
    ));
  }

  #[tokio::test]
  async fn probe_fails_when_nothing_listens() {
    let port = {
      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };
    assert!(!probe_health(&server_url(port).unwrap()).await);
  }

  #[tokio::test]
  async fn write_output_replaces_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    write_output(&path, b"first".to_vec()).await.unwrap();
    write_output(&path, b"second".to_vec()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"second");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
  }
}
