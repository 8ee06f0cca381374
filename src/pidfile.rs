// 该文件是 RealESRGAN Serve 项目的一部分。
// src/pidfile.rs - 服务进程 PID 文件
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

use thiserror::Error;
use tracing::{debug, info, warn};

pub const PID_FILE_NAME: &str = "realesrgan.pid";
pub const PID_FILE_ENV: &str = "REALESRGAN_PID_FILE";

#[derive(Error, Debug)]
pub enum PidFileError {
  #[error("无法读取 PID 文件 {path} (服务是否在运行?): {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法写入 PID 文件 {path}: {source}")]
  Write {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("PID 文件内容无效: {0:?}")]
  Invalid(String),
  #[error("无法向进程 {pid} 发送终止信号 (进程可能已退出): {source}")]
  Signal { pid: i32, source: std::io::Error },
}

/// PID 文件路径：环境变量 `REALESRGAN_PID_FILE`，否则为系统临时目录下的 `realesrgan.pid`
pub fn pid_file_path() -> PathBuf {
  match std::env::var_os(PID_FILE_ENV) {
    Some(path) if !path.is_empty() => PathBuf::from(path),
    _ => std::env::temp_dir().join(PID_FILE_NAME),
  }
}

/// 写入当前进程的 PID
pub fn write_pid(path: &Path) -> Result<u32, PidFileError> {
  let pid = std::process::id();
  std::fs::write(path, pid.to_string()).map_err(|source| PidFileError::Write {
    path: path.to_path_buf(),
    source,
  })?;
  debug!("PID {} 已写入 {}", pid, path.display());
  Ok(pid)
}

pub fn read_pid(path: &Path) -> Result<i32, PidFileError> {
  let content = std::fs::read_to_string(path).map_err(|source| PidFileError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  match content.trim().parse::<i32>() {
    Ok(pid) if pid > 0 => Ok(pid),
    _ => Err(PidFileError::Invalid(content)),
  }
}

/// 删除 PID 文件，失败时记录警告并返回 `false`
pub fn remove_pid_file(path: &Path) -> bool {
  match std::fs::remove_file(path) {
    Ok(()) => {
      debug!("已删除 PID 文件 {}", path.display());
      true
    }
    Err(e) => {
      warn!("无法删除 PID 文件 {}: {}", path.display(), e);
      false
    }
  }
}

/// 仅当 PID 文件仍属于当前进程时删除
pub fn remove_if_owned(path: &Path) {
  match read_pid(path) {
    Ok(pid) if pid as u32 == std::process::id() => {
      remove_pid_file(path);
    }
    _ => {}
  }
}

#[cfg(unix)]
fn terminate(pid: i32) -> std::io::Result<()> {
  // SAFETY: kill 只读取两个整数参数
  let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
  if ret == 0 {
    Ok(())
  } else {
    Err(std::io::Error::last_os_error())
  }
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> std::io::Result<()> {
  Err(std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "当前平台不支持发送终止信号",
  ))
}

/// 读取 PID 文件并向服务进程发送 SIGTERM，成功后删除 PID 文件
pub fn stop_server(path: &Path) -> Result<i32, PidFileError> {
  let pid = read_pid(path)?;
  terminate(pid).map_err(|source| PidFileError::Signal { pid, source })?;
  info!("已向服务进程 {} 发送终止信号", pid);
  remove_pid_file(path);
  Ok(pid)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_then_read_own_pid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.pid");
    let pid = write_pid(&path).unwrap();
    assert_eq!(read_pid(&path).unwrap() as u32, pid);

    remove_if_owned(&path);
    assert!(!path.exists());
  }

  #[test]
  fn foreign_pid_file_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.pid");
    std::fs::write(&path, "1\n").unwrap();
    assert_eq!(read_pid(&path).unwrap(), 1);
    remove_if_owned(&path);
    assert!(path.exists());
  }

  #[test]
  fn missing_or_garbage_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.pid");
    assert!(matches!(stop_server(&path), Err(PidFileError::Read { .. })));

    std::fs::write(&path, "not-a-pid").unwrap();
    assert!(matches!(stop_server(&path), Err(PidFileError::Invalid(_))));
    std::fs::write(&path, "-5").unwrap();
    assert!(matches!(read_pid(&path), Err(PidFileError::Invalid(_))));
    assert!(path.exists());
  }

  #[test]
  fn remove_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.pid");
    std::fs::write(&path, "42").unwrap();
    assert!(remove_pid_file(&path));
    assert!(!path.exists());
    assert!(!remove_pid_file(&path));
  }

  #[cfg(unix)]
  #[test]
  fn stop_signals_child_and_removes_file() {
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.pid");
    std::fs::write(&path, child.id().to_string()).unwrap();

    assert_eq!(stop_server(&path).unwrap() as u32, child.id());
    assert!(!path.exists());
    let status = child.wait().unwrap();
    assert!(!status.success());
  }
}
