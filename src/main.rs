// 该文件是 RealESRGAN Serve 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use realesrgan_serve::backend::{self, Engine, MODEL_NAME};
use realesrgan_serve::dispatch::{self, UpscaleOptions};
use realesrgan_serve::pidfile;
use realesrgan_serve::server::{self, ServerConfig};

use args::{BuildArgs, Cli, Command, ServerCommand, StartArgs, UpscaleArgs};

/// 收到终止信号后等待优雅退出的最长时间
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

fn init_tracing(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match cli.command {
    Some(Command::Build(build)) => run_build(build),
    Some(Command::Server(ServerCommand::Start(start))) => start_server(start).await,
    Some(Command::Server(ServerCommand::Stop)) => {
      stop_server();
      Ok(())
    }
    None => run_default(cli.upscale).await,
  }
}

fn run_build(args: BuildArgs) -> Result<()> {
  info!("编译 {} 引擎", MODEL_NAME);
  info!("ONNX 模型: {}", args.onnx.display());
  info!("引擎输出: {}", args.engine.display());
  info!("FP16: {}", args.fp16);
  warn!("输入输出形状固定为 x4plus 模型, 其他模型无法使用");

  let now = Instant::now();
  backend::build_engine(&args.onnx, &args.engine, args.fp16)
    .with_context(|| format!("编译 {} 失败", args.onnx.display()))?;
  info!("编译完成, 耗时: {:.2?}", now.elapsed());
  Ok(())
}

async fn run_default(args: UpscaleArgs) -> Result<()> {
  let Some(input) = args.input else {
    bail!("缺少 --input 参数, 使用 --help 查看用法");
  };

  let report = dispatch::run_upscale(UpscaleOptions {
    input,
    output: args.output,
    engine: args.engine,
    gpu_id: args.gpu_id,
    port: args.port,
    continue_on_error: args.continue_on_error,
  })
  .await?;

  if !report.is_success() {
    warn!("{} 个文件处理失败", report.failed.len());
  }
  Ok(())
}

/// Ctrl-C 与 SIGTERM 都会触发 `shutdown`；超时后强制退出
fn install_shutdown_handler(shutdown: CancellationToken) -> Result<()> {
  ctrlc::set_handler(move || {
    info!("收到终止信号，准备退出...");
    shutdown.cancel();
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置终止信号处理器")
}

async fn start_server(args: StartArgs) -> Result<()> {
  // 先装信号处理器再写 PID 文件，加载引擎期间收到的终止信号同样会清理 PID 文件
  let shutdown = CancellationToken::new();
  install_shutdown_handler(shutdown.clone())?;

  let pid_path = pidfile::pid_file_path();
  let pid = pidfile::write_pid(&pid_path)?;
  info!(
    "启动 HTTP 服务, 端口 {} (PID {}, PID 文件 {})",
    args.port,
    pid,
    pid_path.display()
  );

  let engine = match Engine::load(&args.engine, args.gpu_id) {
    Ok(engine) => engine,
    Err(e) => {
      pidfile::remove_if_owned(&pid_path);
      return Err(e).with_context(|| format!("无法加载引擎 {}", args.engine.display()));
    }
  };

  if shutdown.is_cancelled() {
    info!("加载引擎期间收到终止信号, 不再启动服务");
    drop(engine);
    pidfile::remove_if_owned(&pid_path);
    return Ok(());
  }

  let config = ServerConfig {
    port: args.port,
    ..ServerConfig::default()
  };
  let result = server::run(config, engine, shutdown).await;
  pidfile::remove_if_owned(&pid_path);
  result
}

/// 诊断信息只打印，不影响退出码
fn stop_server() {
  let pid_path = pidfile::pid_file_path();
  match pidfile::stop_server(&pid_path) {
    Ok(pid) => info!("服务已停止 (PID {})", pid),
    Err(e) => warn!("{}", e),
  }
}
