// 该文件是 RealESRGAN Serve 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Real-ESRGAN x4plus 超分服务与命令行工具
///
/// 不带子命令时处理单个图像或目录：本机 HTTP 服务可用时交给服务处理，
/// 否则使用 --engine 指定的引擎在本地推理。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  pub command: Option<Command>,

  /// 输出调试日志
  #[arg(short, long, global = true)]
  pub verbose: bool,

  #[command(flatten)]
  pub upscale: UpscaleArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 把 ONNX 模型编译为引擎文件
  Build(BuildArgs),
  /// HTTP 服务操作
  #[command(subcommand)]
  Server(ServerCommand),
}

#[derive(Args, Debug)]
pub struct UpscaleArgs {
  /// 输入图像文件或目录
  #[arg(short, long, value_name = "PATH")]
  pub input: Option<PathBuf>,

  /// 输出文件或目录，默认为 <输入>_out
  #[arg(short, long, value_name = "PATH")]
  pub output: Option<PathBuf>,

  /// 引擎文件路径，服务不可用时用于本地推理
  #[arg(short, long, value_name = "FILE", env = "REALESRGAN_ENGINE")]
  pub engine: Option<PathBuf>,

  /// 本地推理使用的 GPU 编号
  #[arg(short, long, default_value_t = 0, env = "REALESRGAN_GPU_ID")]
  pub gpu_id: u32,

  /// 本机 HTTP 服务端口
  #[arg(short, long, default_value_t = 8080, env = "REALESRGAN_PORT")]
  pub port: u16,

  /// 目录模式下单个文件失败时继续处理其余文件
  #[arg(short, long)]
  pub continue_on_error: bool,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// ONNX 模型文件路径
  #[arg(short = 'x', long, value_name = "FILE")]
  pub onnx: PathBuf,

  /// 输出引擎文件路径
  #[arg(short, long, value_name = "FILE")]
  pub engine: PathBuf,

  /// 是否启用 FP16 精度
  #[arg(
    long,
    default_value_t = true,
    action = ArgAction::Set,
    num_args = 0..=1,
    default_missing_value = "true",
    value_name = "BOOL"
  )]
  pub fp16: bool,
}

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
  /// 启动 HTTP 服务
  Start(StartArgs),
  /// 停止正在运行的 HTTP 服务
  Stop,
}

#[derive(Args, Debug)]
pub struct StartArgs {
  /// 引擎文件路径
  #[arg(short, long, value_name = "FILE", env = "REALESRGAN_ENGINE")]
  pub engine: PathBuf,

  /// 监听端口
  #[arg(short, long, default_value_t = 8080, env = "REALESRGAN_PORT")]
  pub port: u16,

  /// 推理使用的 GPU 编号
  #[arg(short, long, default_value_t = 0, env = "REALESRGAN_GPU_ID")]
  pub gpu_id: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cli_is_well_formed() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
  }

  #[test]
  fn default_command_flags() {
    let cli = Cli::try_parse_from([
      "real-esrgan-serve",
      "-i",
      "photos",
      "-o",
      "big",
      "-e",
      "model.plan",
      "-g",
      "1",
      "-p",
      "9000",
      "-c",
    ])
    .unwrap();
    assert!(cli.command.is_none());
    let args = cli.upscale;
    assert_eq!(args.input, Some(PathBuf::from("photos")));
    assert_eq!(args.output, Some(PathBuf::from("big")));
    assert_eq!(args.engine, Some(PathBuf::from("model.plan")));
    assert_eq!(args.gpu_id, 1);
    assert_eq!(args.port, 9000);
    assert!(args.continue_on_error);
  }

  #[test]
  fn build_fp16_defaults_to_true() {
    for (extra, expected) in [
      (None, true),
      (Some("--fp16"), true),
      (Some("--fp16=false"), false),
    ] {
      let mut argv = vec!["real-esrgan-serve", "build", "-x", "m.onnx", "-e", "m.plan"];
      argv.extend(extra);
      let cli = Cli::try_parse_from(argv).unwrap();
      match cli.command {
        Some(Command::Build(build)) => {
          assert_eq!(build.onnx, PathBuf::from("m.onnx"));
          assert_eq!(build.fp16, expected);
        }
        other => panic!("unexpected command: {:?}", other),
      }
    }
  }

  #[test]
  fn build_requires_both_paths() {
    assert!(Cli::try_parse_from(["real-esrgan-serve", "build", "-x", "m.onnx"]).is_err());
  }

  #[test]
  fn server_subcommands() {
    let cli = Cli::try_parse_from([
      "real-esrgan-serve",
      "server",
      "start",
      "--engine",
      "m.plan",
      "--port",
      "8181",
    ])
    .unwrap();
    match cli.command {
      Some(Command::Server(ServerCommand::Start(start))) => {
        assert_eq!(start.engine, PathBuf::from("m.plan"));
        assert_eq!(start.port, 8181);
      }
      other => panic!("unexpected command: {:?}", other),
    }

    let cli = Cli::try_parse_from(["real-esrgan-serve", "server", "stop"]).unwrap();
    assert!(matches!(
      cli.command,
      Some(Command::Server(ServerCommand::Stop))
    ));
  }
}
