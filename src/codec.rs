// 该文件是 RealESRGAN Serve 项目的一部分。
// src/codec.rs - 图像编解码与张量转换
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

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use thiserror::Error;

use crate::tensor::{RgbPlanarTensor, TensorShapeError};

pub const JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("图像解码失败: {0}")]
  Decode(image::ImageError),
  #[error("图像编码失败: {0}")]
  Encode(image::ImageError),
  #[error("张量形状错误: {0}")]
  Shape(#[from] TensorShapeError),
}

/// 输出图像格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
  Png,
  Jpeg,
}

impl OutputFormat {
  /// 按扩展名选择格式，大小写不敏感，可带或不带前导 `.`。
  ///
  /// `jpg`/`jpeg` 为 JPEG，其余一律回退为 PNG。
  pub fn from_extension(ext: &str) -> Self {
    let ext = ext.trim_start_matches('.');
    if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") {
      OutputFormat::Jpeg
    } else {
      OutputFormat::Png
    }
  }

  pub fn content_type(&self) -> &'static str {
    match self {
      OutputFormat::Png => "image/png",
      OutputFormat::Jpeg => "image/jpeg",
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      OutputFormat::Png => ".png",
      OutputFormat::Jpeg => ".jpg",
    }
  }
}

impl From<&RgbImage> for RgbPlanarTensor {
  fn from(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let mut tensor = RgbPlanarTensor::with_shape(width, height);

    let plane = tensor.plane_len();
    let slice = tensor.as_mut();
    for (x, y, pixel) in image.enumerate_pixels() {
      let index = y as usize * width as usize + x as usize;
      for c in 0..3 {
        slice[c * plane + index] = (f32::from(pixel[c]) / 255.0).clamp(0.0, 1.0);
      }
    }
    tensor
  }
}

impl From<&RgbPlanarTensor> for RgbaImage {
  fn from(tensor: &RgbPlanarTensor) -> Self {
    let (width, height) = (tensor.width(), tensor.height());
    let (r, g, b) = (tensor.plane(0), tensor.plane(1), tensor.plane(2));

    RgbaImage::from_fn(width, height, |x, y| {
      let index = y as usize * width as usize + x as usize;
      image::Rgba([
        to_u8(r[index]),
        to_u8(g[index]),
        to_u8(b[index]),
        u8::MAX,
      ])
    })
  }
}

/// 截断到 `[0, 1]` 后乘 255 并向零取整，NaN 视为 0
fn to_u8(v: f32) -> u8 {
  if v.is_nan() {
    return 0;
  }
  (v.clamp(0.0, 1.0) * 255.0) as u8
}

/// 只读取图像头得到 `(宽, 高)`，不解码像素
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), CodecError> {
  image::ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| CodecError::Decode(image::ImageError::IoError(e)))?
    .into_dimensions()
    .map_err(CodecError::Decode)
}

/// 从压缩字节解码并转换为平面归一化张量，丢弃 alpha 通道。
///
/// 格式由内容识别，支持 PNG、JPEG（以及启用 `webp_input` 时的 WebP）。
pub fn decode_and_preprocess(bytes: &[u8]) -> Result<RgbPlanarTensor, CodecError> {
  let image = image::load_from_memory(bytes).map_err(CodecError::Decode)?;
  Ok(RgbPlanarTensor::from(&image.to_rgb8()))
}

/// 把平面张量编码为 `format` 格式的字节，像素 alpha 固定为 255
pub fn postprocess_and_encode(
  tensor: &RgbPlanarTensor,
  format: OutputFormat,
) -> Result<Vec<u8>, CodecError> {
  let image = RgbaImage::from(tensor);
  let mut buf = Cursor::new(Vec::new());

  match format {
    OutputFormat::Jpeg => {
      // JPEG 没有 alpha 通道，且 alpha 恒为 255，直接去掉
      let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
      let encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
      rgb.write_with_encoder(encoder).map_err(CodecError::Encode)?;
    }
    OutputFormat::Png => {
      image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(CodecError::Encode)?;
    }
  }

  Ok(buf.into_inner())
}

/// 按扩展名编码，见 [`OutputFormat::from_extension`]
pub fn postprocess_and_encode_ext(
  tensor: &RgbPlanarTensor,
  ext: &str,
) -> Result<Vec<u8>, CodecError> {
  postprocess_and_encode(tensor, OutputFormat::from_extension(ext))
}
