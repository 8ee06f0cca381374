// 该文件是 RealESRGAN Serve 项目的一部分。
// src/dispatch/remote.rs - 远程超分
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

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tracing::{debug, info};
use url::Url;

use super::{DispatchError, FilePair, Upscaler, read_input, write_output};
use crate::server::IMAGE_FIELD;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 通过本机 HTTP 服务处理图像
pub struct RemoteUpscaler {
  client: reqwest::Client,
  base: Url,
}

impl RemoteUpscaler {
  pub fn new(base: Url) -> Result<Self, DispatchError> {
    let client = reqwest::Client::builder()
      .connect_timeout(CONNECT_TIMEOUT)
      .build()?;
    Ok(Self { client, base })
  }

  /// `/upscale` 地址，`ext` 为输出扩展名
  pub fn upscale_url(&self, ext: Option<&str>) -> Result<Url, DispatchError> {
    let mut url = self.base.join("upscale")?;
    if let Some(ext) = ext {
      url.query_pairs_mut().append_pair("ext", ext);
    }
    Ok(url)
  }

  /// 上传图像字节，返回服务编码好的输出字节
  pub async fn upscale_bytes(
    &self,
    file_name: String,
    bytes: Vec<u8>,
    ext: Option<&str>,
  ) -> Result<Vec<u8>, DispatchError> {
    let url = self.upscale_url(ext)?;
    let form = Form::new().part(IMAGE_FIELD, Part::bytes(bytes).file_name(file_name));

    debug!("POST {}", url);
    let resp = self.client.post(url).multipart(form).send().await?;
    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(DispatchError::Server {
        status,
        body: body.trim().to_string(),
      });
    }

    Ok(resp.bytes().await?.to_vec())
  }
}

impl Upscaler for RemoteUpscaler {
  type Error = DispatchError;

  async fn upscale_file(&self, pair: &FilePair) -> Result<(), Self::Error> {
    info!("处理 {} -> {}", pair.input.display(), pair.output.display());
    let bytes = read_input(&pair.input).await?;
    let file_name = pair
      .input
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();

    let ext = pair.output_extension();
    let encoded = self.upscale_bytes(file_name, bytes, ext.as_deref()).await?;
    write_output(&pair.output, encoded).await
  }
}
