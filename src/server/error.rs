// 该文件是 RealESRGAN Serve 项目的一部分。
// src/server/error.rs - HTTP 错误响应
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

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error};

use crate::codec::CodecError;
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("表单无效: {0}")]
  BadForm(String),
  #[error("客户端已断开")]
  ClientGone,
  #[error("图像处理失败: {0}")]
  Codec(#[from] CodecError),
  #[error("推理失败: {0}")]
  Inference(WorkerError),
  #[error("上传内容过大: {0}")]
  PayloadTooLarge(String),
  #[error("图像尺寸 {width}x{height} 超过上限 {max_pixels} 像素")]
  ImageTooLarge {
    width: u32,
    height: u32,
    max_pixels: u64,
  },
  #[error("读取上传内容超时 ({0:?})")]
  ReadTimeout(std::time::Duration),
  #[error("内部错误: {0}")]
  Internal(#[from] tokio::task::JoinError),
}

impl From<WorkerError> for ApiError {
  fn from(err: WorkerError) -> Self {
    match err {
      WorkerError::Cancelled => ApiError::ClientGone,
      other => ApiError::Inference(other),
    }
  }
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::BadForm(_) => StatusCode::BAD_REQUEST,
      ApiError::PayloadTooLarge(_) | ApiError::ImageTooLarge { .. } => {
        StatusCode::PAYLOAD_TOO_LARGE
      }
      ApiError::ClientGone | ApiError::ReadTimeout(_) => StatusCode::REQUEST_TIMEOUT,
      ApiError::Codec(_) | ApiError::Inference(_) | ApiError::Internal(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    match &self {
      ApiError::ClientGone => debug!("{}", self),
      _ if status.is_server_error() => error!("{}", self),
      _ => debug!("拒绝请求: {}", self),
    }
    (status, self.to_string()).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_mapping() {
    assert_eq!(
      ApiError::BadForm("缺少 image 字段".into()).status(),
      StatusCode::BAD_REQUEST
    );
    assert_eq!(
      ApiError::from(WorkerError::Cancelled).status(),
      StatusCode::REQUEST_TIMEOUT
    );
    assert_eq!(
      ApiError::from(WorkerError::Closed).status(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
      ApiError::ReadTimeout(std::time::Duration::from_secs(30)).status(),
      StatusCode::REQUEST_TIMEOUT
    );
    assert_eq!(
      ApiError::ImageTooLarge {
        width: 4096,
        height: 4096,
        max_pixels: 1024,
      }
      .status(),
      StatusCode::PAYLOAD_TOO_LARGE
    );
  }
}
