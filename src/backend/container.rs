// 该文件是 RealESRGAN Serve 项目的一部分。
// src/backend/container.rs - 引擎文件格式
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

//! 引擎文件布局：
//!
//! ```text
//! | magic (8) | header_len: u32 LE | header (JSON) | payload |
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackendError, MODEL_NAME};
use crate::tensor::UPSCALE_FACTOR;

pub const ENGINE_MAGIC: &[u8; 8] = b"RESRGAN\x01";

const HEADER_LEN_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHeader {
  pub model: String,
  pub scale: u32,
  pub fp16: bool,
  pub source: String,
  pub built_at: DateTime<Utc>,
}

impl EngineHeader {
  pub fn new(source: String, fp16: bool) -> Self {
    Self {
      model: MODEL_NAME.to_string(),
      scale: UPSCALE_FACTOR,
      fp16,
      source,
      built_at: Utc::now(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineFile {
  pub header: EngineHeader,
  pub payload: Vec<u8>,
}

impl EngineFile {
  pub fn encode(&self) -> Result<Vec<u8>, BackendError> {
    let header = serde_json::to_vec(&self.header)
      .map_err(|e| BackendError::Compile(format!("无法序列化引擎文件头: {}", e)))?;
    let header_len = u32::try_from(header.len())
      .map_err(|_| BackendError::Compile("引擎文件头过大".to_string()))?;

    let mut bytes =
      Vec::with_capacity(ENGINE_MAGIC.len() + HEADER_LEN_SIZE + header.len() + self.payload.len());
    bytes.extend_from_slice(ENGINE_MAGIC);
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&self.payload);
    Ok(bytes)
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, BackendError> {
    let rest = bytes
      .strip_prefix(ENGINE_MAGIC.as_slice())
      .ok_or_else(|| BackendError::Deserialize("文件标识不匹配".to_string()))?;

    if rest.len() < HEADER_LEN_SIZE {
      return Err(BackendError::Deserialize("文件被截断".to_string()));
    }
    let (len, rest) = rest.split_at(HEADER_LEN_SIZE);
    let header_len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < header_len {
      return Err(BackendError::Deserialize("文件头被截断".to_string()));
    }
    let (header, payload) = rest.split_at(header_len);

    let header: EngineHeader = serde_json::from_slice(header)
      .map_err(|e| BackendError::Deserialize(format!("文件头无效: {}", e)))?;
    if header.scale != UPSCALE_FACTOR {
      return Err(BackendError::Deserialize(format!(
        "放大倍数为 {}, 仅支持 {}",
        header.scale, UPSCALE_FACTOR
      )));
    }
    if payload.is_empty() {
      return Err(BackendError::Deserialize("缺少模型数据".to_string()));
    }

    Ok(Self {
      header,
      payload: payload.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> EngineFile {
    EngineFile {
      header: EngineHeader::new("model.onnx".to_string(), true),
      payload: vec![0x08, 0x07, 0x00],
    }
  }

  #[test]
  fn decode_reads_back_header_and_payload() {
    let file = sample();
    let decoded = EngineFile::decode(&file.encode().unwrap()).unwrap();
    assert_eq!(decoded.header, file.header);
    assert_eq!(decoded.payload, file.payload);
    assert_eq!(decoded.header.model, MODEL_NAME);
  }

  #[test]
  fn decode_rejects_foreign_and_truncated_files() {
    assert!(matches!(
      EngineFile::decode(b"\x08\x07onnx"),
      Err(BackendError::Deserialize(_))
    ));

    let bytes = sample().encode().unwrap();
    assert!(matches!(
      EngineFile::decode(&bytes[..ENGINE_MAGIC.len() + 2]),
      Err(BackendError::Deserialize(_))
    ));
    assert!(matches!(
      EngineFile::decode(&bytes[..ENGINE_MAGIC.len() + 8]),
      Err(BackendError::Deserialize(_))
    ));
  }

  #[test]
  fn decode_rejects_other_scales() {
    let mut file = sample();
    file.header.scale = 2;
    assert!(matches!(
      EngineFile::decode(&file.encode().unwrap()),
      Err(BackendError::Deserialize(_))
    ));
  }
}
