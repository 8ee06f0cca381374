// 该文件是 RealESRGAN Serve 项目的一部分。
// src/tensor.rs - 平面 RGB 浮点张量
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

use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// x4plus 模型在每个空间维度上的放大倍数
pub const UPSCALE_FACTOR: u32 = 4;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct TensorShapeError {
  pub expected: usize,
  pub actual: usize,
}

/// 计算 `3 x width x height` 平面张量的元素个数
pub fn planar_len(width: u32, height: u32) -> usize {
  RGB_CHANNELS * width as usize * height as usize
}

/// 平面布局的 RGB 浮点张量，布局为 `[3][H][W]`，数值归一化到 `[0, 1]`。
///
/// 通道顺序为 R、G、B，每个通道平面按行优先存放。宽高与数据分开携带。
#[derive(Debug, Clone, PartialEq)]
pub struct RgbPlanarTensor {
  data: Box<[f32]>,
  width: u32,
  height: u32,
}

impl RgbPlanarTensor {
  /// 按给定尺寸分配全零张量
  pub fn with_shape(width: u32, height: u32) -> Self {
    let data = vec![0f32; planar_len(width, height)].into_boxed_slice();
    Self {
      data,
      width,
      height,
    }
  }

  pub fn from_planar(data: Vec<f32>, width: u32, height: u32) -> Result<Self, TensorShapeError> {
    let expected = planar_len(width, height);
    if data.len() != expected {
      return Err(TensorShapeError {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
    })
  }

  /// 为本张量分配对应的放大输出缓冲区，尺寸为 `3 x (4w) x (4h)`
  pub fn upscaled_buffer(&self) -> Self {
    Self::with_shape(self.width * UPSCALE_FACTOR, self.height * UPSCALE_FACTOR)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn plane_len(&self) -> usize {
    self.width as usize * self.height as usize
  }

  /// 取第 `channel` 个通道平面
  pub fn plane(&self, channel: usize) -> &[f32] {
    let size = self.plane_len();
    &self.data[channel * size..(channel + 1) * size]
  }

  pub fn as_planar(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data.into_vec()
  }
}

impl AsMut<[f32]> for RgbPlanarTensor {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}
