// 该文件是 RealESRGAN Serve 项目的一部分。
// src/backend/reference.rs - CPU 参考运行时
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

//! 未启用 `tensorrt` 特性时使用的 CPU 参考运行时。
//!
//! 不执行神经网络，只做最近邻 4 倍放大，用于在没有加速器的机器上联调服务与命令行。

use tracing::{debug, warn};

use super::{BackendError, EngineBackend, EngineFile};
use crate::tensor::{RGB_CHANNELS, UPSCALE_FACTOR};

pub struct ReferenceEngine {
  fp16: bool,
}

impl ReferenceEngine {
  pub fn load(file: &EngineFile, device: u32) -> Result<Self, BackendError> {
    if device != 0 {
      return Err(BackendError::DeviceUnavailable(device));
    }
    warn!("未启用 tensorrt 特性, 使用 CPU 参考运行时 (最近邻放大)");
    debug!("模型: {}, 来源: {}", file.header.model, file.header.source);
    Ok(Self {
      fp16: file.header.fp16,
    })
  }
}

impl EngineBackend for ReferenceEngine {
  fn run(
    &mut self,
    input: &[f32],
    output: &mut [f32],
    width: u32,
    height: u32,
  ) -> Result<(), BackendError> {
    let (width, height) = (width as usize, height as usize);
    let scale = UPSCALE_FACTOR as usize;
    let (out_w, out_h) = (width * scale, height * scale);

    for c in 0..RGB_CHANNELS {
      let src = &input[c * width * height..(c + 1) * width * height];
      let dst = &mut output[c * out_w * out_h..(c + 1) * out_w * out_h];
      for y in 0..out_h {
        let row = &src[(y / scale) * width..(y / scale + 1) * width];
        for x in 0..out_w {
          dst[y * out_w + x] = row[x / scale];
        }
      }
    }

    if self.fp16 {
      output
        .iter_mut()
        .for_each(|v| *v = half_precision(*v));
    }
    Ok(())
  }

  fn release(&mut self) {
    debug!("CPU 参考运行时已释放");
  }
}

/// 把数值截断到 fp16 的 10 位尾数，模拟半精度引擎的精度
fn half_precision(v: f32) -> f32 {
  f32::from_bits(v.to_bits() & 0xFFFF_E000)
}
