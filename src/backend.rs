// 该文件是 RealESRGAN Serve 项目的一部分。
// src/backend.rs - 推理后端适配层
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

//! # 推理后端适配层
//!
//! 对加速器推理运行时的一层薄封装，只负责四件事：
//! - `build_engine`：把 ONNX 模型编译为序列化引擎文件
//! - `Engine::load`：把引擎加载到指定设备
//! - `Engine::run`：按平面 RGB 张量执行一次推理
//! - `Engine::release`：释放引擎资源（幂等）
//!
//! 启用 `tensorrt` 特性时，引擎通过 ONNX Runtime 的 TensorRT 执行提供器运行；
//! 否则使用 CPU 参考运行时，契约完全一致。

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::tensor::{UPSCALE_FACTOR, planar_len};

mod container;
pub use self::container::{ENGINE_MAGIC, EngineFile, EngineHeader};

#[cfg(not(feature = "tensorrt"))]
mod reference;
#[cfg(not(feature = "tensorrt"))]
pub use self::reference::ReferenceEngine;

#[cfg(feature = "tensorrt")]
mod tensorrt;
#[cfg(feature = "tensorrt")]
pub use self::tensorrt::TensorRtEngine;

/// 模型名称，写入引擎文件头
pub const MODEL_NAME: &str = "realesrgan-x4plus";

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型编译失败: {0}")]
  Compile(String),
  #[error("引擎写入失败: {path}: {source}")]
  Write {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("引擎反序列化失败: {0}")]
  Deserialize(String),
  #[error("设备 {0} 不可用")]
  DeviceUnavailable(u32),
  #[error("{which} 张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    which: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("设备错误: {0}")]
  Device(String),
  #[error("引擎已释放")]
  Released,
}

impl BackendError {
  fn read(path: &Path, err: std::io::Error) -> Self {
    if err.kind() == std::io::ErrorKind::NotFound {
      BackendError::NotFound(path.to_path_buf())
    } else {
      BackendError::Io(err)
    }
  }
}

/// 具体运行时实现的接口。
///
/// 调用方保证传入的缓冲区长度已经通过校验；实现不需要可重入。
pub trait EngineBackend: Send {
  fn run(
    &mut self,
    input: &[f32],
    output: &mut [f32],
    width: u32,
    height: u32,
  ) -> Result<(), BackendError>;

  fn release(&mut self) {}
}

/// 绑定到某个设备上的推理引擎句柄。
///
/// 不可复制；`release` 之后任何推理调用都会返回 [`BackendError::Released`]。
/// 句柄被丢弃时会自动释放。
pub struct Engine {
  inner: Option<Box<dyn EngineBackend>>,
  device: u32,
}

impl std::fmt::Debug for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Engine")
      .field("device", &self.device)
      .field("released", &self.inner.is_none())
      .finish()
  }
}

impl Engine {
  /// 从引擎文件加载，并绑定到 `device` 号设备
  pub fn load(path: impl AsRef<Path>, device: u32) -> Result<Self, BackendError> {
    let path = path.as_ref();
    info!("加载引擎文件: {} (设备 {})", path.display(), device);
    let bytes = std::fs::read(path).map_err(|e| BackendError::read(path, e))?;
    debug!(
      "引擎文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );

    let file = EngineFile::decode(&bytes)?;
    debug!("引擎文件头: {:?}", file.header);

    #[cfg(feature = "tensorrt")]
    let backend: Box<dyn EngineBackend> = Box::new(TensorRtEngine::load(&file, path, device)?);
    #[cfg(not(feature = "tensorrt"))]
    let backend: Box<dyn EngineBackend> = Box::new(ReferenceEngine::load(&file, device)?);

    info!("引擎加载完成");
    Ok(Self::from_backend(backend, device))
  }

  /// 用任意运行时实现构造句柄
  pub fn from_backend(backend: Box<dyn EngineBackend>, device: u32) -> Self {
    Self {
      inner: Some(backend),
      device,
    }
  }

  pub fn device(&self) -> u32 {
    self.device
  }

  pub fn is_released(&self) -> bool {
    self.inner.is_none()
  }

  /// 执行一次推理。
  ///
  /// 要求 `input.len() == 3·w·h`，`output.len() == 3·4w·4h`，返回时输出缓冲区已全部写入。
  pub fn run(
    &mut self,
    input: &[f32],
    output: &mut [f32],
    width: u32,
    height: u32,
  ) -> Result<(), BackendError> {
    let backend = self.inner.as_mut().ok_or(BackendError::Released)?;

    let expected = planar_len(width, height);
    if input.len() != expected || expected == 0 {
      return Err(BackendError::ShapeMismatch {
        which: "输入",
        expected,
        actual: input.len(),
      });
    }
    let expected = planar_len(width * UPSCALE_FACTOR, height * UPSCALE_FACTOR);
    if output.len() != expected {
      return Err(BackendError::ShapeMismatch {
        which: "输出",
        expected,
        actual: output.len(),
      });
    }

    backend.run(input, output, width, height)
  }

  /// 释放引擎，可重复调用
  pub fn release(&mut self) {
    if let Some(mut backend) = self.inner.take() {
      backend.release();
      info!("引擎已释放 (设备 {})", self.device);
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.release();
  }
}

/// 把 ONNX 模型编译成引擎文件。
///
/// 目标输入输出形状由后端固定为 x4plus 模型。失败时不会在目标路径留下新文件。
pub fn build_engine(
  onnx_path: impl AsRef<Path>,
  engine_path: impl AsRef<Path>,
  fp16: bool,
) -> Result<(), BackendError> {
  let onnx_path = onnx_path.as_ref();
  let engine_path = engine_path.as_ref();

  let model = std::fs::read(onnx_path).map_err(|e| BackendError::read(onnx_path, e))?;
  check_onnx(&model)?;
  debug!(
    "ONNX 模型大小: {:.2} MB",
    model.len() as f64 / (1024.0 * 1024.0)
  );

  #[cfg(feature = "tensorrt")]
  self::tensorrt::compile(&model, engine_path, fp16)?;

  let source = onnx_path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  let file = EngineFile {
    header: EngineHeader::new(source, fp16),
    payload: model,
  };

  write_atomically(engine_path, &file.encode()?)?;
  info!("引擎已写入: {}", engine_path.display());
  Ok(())
}

/// ONNX 是 protobuf 编码的 `ModelProto`，首个字段是 `ir_version` (字段 1, varint)
fn check_onnx(model: &[u8]) -> Result<(), BackendError> {
  match model.first() {
    None => Err(BackendError::Compile("ONNX 模型文件为空".to_string())),
    Some(0x08) => Ok(()),
    Some(_) => Err(BackendError::Compile(
      "不是有效的 ONNX 模型文件".to_string(),
    )),
  }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
  let write_err = |source| BackendError::Write {
    path: path.to_path_buf(),
    source,
  };

  let parent = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  };
  let mut file = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
  file.write_all(bytes).map_err(write_err)?;
  file.as_file().sync_all().map_err(write_err)?;
  file.persist(path).map_err(|e| write_err(e.error))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fill(f32);

  impl EngineBackend for Fill {
    fn run(&mut self, _: &[f32], output: &mut [f32], _: u32, _: u32) -> Result<(), BackendError> {
      output.fill(self.0);
      Ok(())
    }
  }

  #[test]
  fn run_checks_shape_contract() {
    let mut engine = Engine::from_backend(Box::new(Fill(0.5)), 0);
    let input = vec![0.0; 3 * 2 * 2];

    let mut short = vec![0.0; 3 * 8 * 8 - 1];
    assert!(matches!(
      engine.run(&input, &mut short, 2, 2),
      Err(BackendError::ShapeMismatch { which: "输出", .. })
    ));
    let mut output = vec![0.0; 3 * 8 * 8];
    assert!(matches!(
      engine.run(&input[1..], &mut output, 2, 2),
      Err(BackendError::ShapeMismatch { which: "输入", .. })
    ));

    engine.run(&input, &mut output, 2, 2).unwrap();
    assert!(output.iter().all(|&v| v == 0.5));
  }

  #[test]
  fn release_is_idempotent() {
    let mut engine = Engine::from_backend(Box::new(Fill(0.0)), 0);
    engine.release();
    engine.release();
    assert!(engine.is_released());

    let input = vec![0.0; 3];
    let mut output = vec![0.0; 3 * 16];
    assert!(matches!(
      engine.run(&input, &mut output, 1, 1),
      Err(BackendError::Released)
    ));
  }

  #[test]
  fn build_missing_onnx_leaves_no_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine_path = dir.path().join("model.plan");
    let err = build_engine(dir.path().join("missing.onnx"), &engine_path, true).unwrap_err();
    assert!(matches!(err, BackendError::NotFound(_)));
    assert!(!engine_path.exists());
  }

  #[test]
  fn build_rejects_non_onnx_and_keeps_existing_engine() {
    let dir = tempfile::tempdir().unwrap();
    let onnx = dir.path().join("model.onnx");
    std::fs::write(&onnx, b"not a model").unwrap();
    let engine_path = dir.path().join("model.plan");
    std::fs::write(&engine_path, b"previous").unwrap();

    let err = build_engine(&onnx, &engine_path, false).unwrap_err();
    assert!(matches!(err, BackendError::Compile(_)));
    assert_eq!(std::fs::read(&engine_path).unwrap(), b"previous");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
  }

  #[cfg(not(feature = "tensorrt"))]
  #[test]
  fn build_then_load_reference_engine() {
    let dir = tempfile::tempdir().unwrap();
    let onnx = dir.path().join("model.onnx");
    std::fs::write(&onnx, [0x08, 0x07, 0x12, 0x00]).unwrap();
    let engine_path = dir.path().join("model.plan");

    build_engine(&onnx, &engine_path, false).unwrap();
    assert!(std::fs::metadata(&engine_path).unwrap().len() > 0);

    let mut engine = Engine::load(&engine_path, 0).unwrap();
    let input = vec![0.25; 3];
    let mut output = vec![0.0; 3 * 16];
    engine.run(&input, &mut output, 1, 1).unwrap();
    assert!(output.iter().all(|&v| v == 0.25));

    assert!(matches!(
      Engine::load(&engine_path, 1),
      Err(BackendError::DeviceUnavailable(1))
    ));
  }

  #[test]
  fn load_missing_engine_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      Engine::load(dir.path().join("none.plan"), 0),
      Err(BackendError::NotFound(_))
    ));
  }
}
