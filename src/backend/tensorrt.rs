// 该文件是 RealESRGAN Serve 项目的一部分。
// src/backend/tensorrt.rs - TensorRT 运行时
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

//! # TensorRT 运行时
//!
//! 通过 ONNX Runtime 的 TensorRT 执行提供器运行引擎文件中的模型。
//! 只允许 TensorRT 执行提供器，注册失败直接报错，不回退到 CPU。
//!
//! TensorRT 编译出的计划缓存在引擎文件旁的 `<engine>.trtcache/` 目录，
//! `build` 时完成首次编译，之后 `load` 直接复用。
//!
//! ## 系统依赖
//!
//! 需要 CUDA 运行时与 TensorRT 动态库在 `LD_LIBRARY_PATH` 中可见。
//! 设备检查直接调用 `libcudart` 的 `cudaGetDeviceCount`，链接时需要能找到该库。

use std::path::{Path, PathBuf};

use ort::execution_providers::TensorRTExecutionProvider;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::{debug, info};

use super::{BackendError, EngineBackend, EngineFile};
use crate::tensor::RGB_CHANNELS;

fn cache_dir(engine_path: &Path) -> PathBuf {
  let mut dir = engine_path.as_os_str().to_os_string();
  dir.push(".trtcache");
  PathBuf::from(dir)
}

#[link(name = "cudart")]
unsafe extern "C" {
  fn cudaGetDeviceCount(count: *mut i32) -> i32;
}

/// 确认 `device` 是可用的 CUDA 设备序号
fn check_device(device: u32) -> Result<(), BackendError> {
  let mut count: i32 = 0;
  // SAFETY: 只写入一个本地整数
  let result = unsafe { cudaGetDeviceCount(&mut count) };
  // cudaSuccess = 0
  if result != 0 {
    debug!("cudaGetDeviceCount 返回错误码 {}", result);
    return Err(BackendError::DeviceUnavailable(device));
  }
  if i64::from(device) >= i64::from(count) {
    debug!("共有 {} 个 CUDA 设备, 请求设备 {}", count, device);
    return Err(BackendError::DeviceUnavailable(device));
  }
  Ok(())
}

fn session(model: &[u8], cache: &Path, device: u32, fp16: bool) -> Result<Session, ort::Error> {
  let mut provider = TensorRTExecutionProvider::default()
    .with_device_id(device as i32)
    .with_engine_cache(true)
    .with_engine_cache_path(cache.to_string_lossy().to_string());
  if fp16 {
    provider = provider.with_fp16(true);
  }

  Session::builder()?
    .with_optimization_level(GraphOptimizationLevel::Level3)?
    .with_execution_providers([provider.build().error_on_failure()])?
    .with_intra_threads(1)?
    .commit_from_memory(model)
}

/// 在设备 0 上预编译 TensorRT 计划，写入缓存目录
pub(super) fn compile(model: &[u8], engine_path: &Path, fp16: bool) -> Result<(), BackendError> {
  check_device(0)?;
  let cache = cache_dir(engine_path);
  std::fs::create_dir_all(&cache).map_err(|source| BackendError::Write {
    path: cache.clone(),
    source,
  })?;

  info!("编译 TensorRT 计划 (FP16={}), 缓存: {}", fp16, cache.display());
  session(model, &cache, 0, fp16).map_err(|e| BackendError::Compile(e.to_string()))?;
  Ok(())
}

pub struct TensorRtEngine {
  session: Option<Session>,
}

impl TensorRtEngine {
  pub fn load(file: &EngineFile, engine_path: &Path, device: u32) -> Result<Self, BackendError> {
    check_device(device)?;
    let cache = cache_dir(engine_path);
    debug!("TensorRT 缓存目录: {}", cache.display());

    let session = session(&file.payload, &cache, device, file.header.fp16)
      .map_err(|e| BackendError::Deserialize(e.to_string()))?;

    info!("TensorRT 会话已创建 (设备 {})", device);
    Ok(Self {
      session: Some(session),
    })
  }
}

impl EngineBackend for TensorRtEngine {
  fn run(
    &mut self,
    input: &[f32],
    output: &mut [f32],
    width: u32,
    height: u32,
  ) -> Result<(), BackendError> {
    let session = self.session.as_mut().ok_or(BackendError::Released)?;
    let device = |e: ort::Error| BackendError::Device(e.to_string());

    let shape = [1usize, RGB_CHANNELS, height as usize, width as usize];
    let tensor = Tensor::from_array((shape, input.to_vec())).map_err(device)?;
    let outputs = session.run(ort::inputs![tensor]).map_err(device)?;
    let (_, data) = outputs[0].try_extract_tensor::<f32>().map_err(device)?;

    if data.len() != output.len() {
      return Err(BackendError::ShapeMismatch {
        which: "引擎输出",
        expected: output.len(),
        actual: data.len(),
      });
    }
    output.copy_from_slice(data);
    Ok(())
  }

  fn release(&mut self) {
    if self.session.take().is_some() {
      debug!("TensorRT 会话已释放");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn out_of_range_device_is_unavailable() {
    assert!(matches!(
      check_device(u32::MAX),
      Err(BackendError::DeviceUnavailable(u32::MAX))
    ));
  }

  #[test]
  fn cache_dir_sits_next_to_engine() {
    assert_eq!(
      cache_dir(Path::new("models/x4.plan")),
      PathBuf::from("models/x4.plan.trtcache")
    );
  }
}
