// 该文件是 RealESRGAN Serve 项目的一部分。
// src/task.rs - 批量超分任务
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
use std::time::Instant;

use tracing::{error, info, warn};

use crate::dispatch::{FilePair, Upscaler};

/// 批量任务的结果汇总
#[derive(Debug, Default)]
pub struct BatchReport {
  pub succeeded: usize,
  pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }
}

/// 逐个处理文件对。
///
/// 默认遇到第一个失败就中止；`continue_on_error` 时记录失败并继续下一个。
#[derive(Default, Debug)]
pub struct BatchTask {
  continue_on_error: bool,
}

impl BatchTask {
  pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
    self.continue_on_error = continue_on_error;
    self
  }

  pub async fn run_task<U>(self, pairs: &[FilePair], upscaler: &U) -> anyhow::Result<BatchReport>
  where
    U: Upscaler,
    U::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始任务, 共 {} 个文件", pairs.len());
    let mut report = BatchReport::default();

    for (index, pair) in pairs.iter().enumerate() {
      let now = Instant::now();
      match upscaler.upscale_file(pair).await {
        Ok(()) => {
          info!(
            "({}/{}) 完成 {}, 耗时: {:.2?}",
            index + 1,
            pairs.len(),
            pair.output.display(),
            now.elapsed()
          );
          report.succeeded += 1;
        }
        Err(e) => {
          error!("处理 {} 失败: {}", pair.input.display(), e);
          if !self.continue_on_error {
            return Err(anyhow::Error::new(e)
              .context(format!("处理 {} 失败", pair.input.display())));
          }
          report.failed.push((pair.input.clone(), e.to_string()));
        }
      }
    }

    if report.is_success() {
      info!("任务完成, 成功 {} 个", report.succeeded);
    } else {
      warn!(
        "任务完成, 成功 {} 个, 失败 {} 个",
        report.succeeded,
        report.failed.len()
      );
      for (path, reason) in &report.failed {
        warn!("  - {}: {}", path.display(), reason);
      }
    }
    Ok(report)
  }
}
