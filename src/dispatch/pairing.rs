// 该文件是 RealESRGAN Serve 项目的一部分。
// src/dispatch/pairing.rs - 输入输出路径配对
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

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// 可处理的图像扩展名
pub const ELIGIBLE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

const OUTPUT_SUFFIX: &str = "_out";
const DEFAULT_EXTENSION: &str = "png";

#[derive(Error, Debug)]
pub enum PairingError {
  #[error("无法访问输入路径 {path}: {source}")]
  Input {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无法读取输入目录 {path}: {source}")]
  ReadDir {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// 一对输入文件与输出文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
  pub input: PathBuf,
  pub output: PathBuf,
}

impl FilePair {
  /// 输出文件扩展名（带前导 `.`）
  pub fn output_extension(&self) -> Option<String> {
    self
      .output
      .extension()
      .map(|ext| format!(".{}", ext.to_string_lossy()))
  }
}

/// 输入展开后的处理计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
  /// 单个文件
  Single(FilePair),
  /// 目录：输出目录与其中的文件对
  Directory {
    output_dir: PathBuf,
    pairs: Vec<FilePair>,
  },
}

impl Plan {
  pub fn pairs(&self) -> &[FilePair] {
    match self {
      Plan::Single(pair) => std::slice::from_ref(pair),
      Plan::Directory { pairs, .. } => pairs,
    }
  }
}

/// 扩展名（大小写不敏感）是否属于可处理的图像
pub fn is_eligible(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| {
      let ext = ext.to_string_lossy();
      ELIGIBLE_EXTENSIONS
        .iter()
        .any(|eligible| ext.eq_ignore_ascii_case(eligible))
    })
    .unwrap_or(false)
}

/// 词法上规范化路径：去掉多余的分隔符和 `.`，`..` 与前一个普通组件抵消。
///
/// `dir/` -> `dir`，`photos/sub/..` -> `photos`，`a/..` -> `.`，`../x` 保持不变
fn clean(path: &Path) -> PathBuf {
  let mut parts: Vec<Component> = Vec::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => match parts.last() {
        Some(Component::Normal(_)) => {
          parts.pop();
        }
        // 根目录的上级仍是根目录
        Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
        _ => parts.push(component),
      },
      other => parts.push(other),
    }
  }

  let cleaned: PathBuf = parts.into_iter().collect();
  if cleaned.as_os_str().is_empty() {
    PathBuf::from(".")
  } else {
    cleaned
  }
}

/// 目录输入的默认输出目录：`<dir>_out`
pub fn default_output_dir(input: &Path) -> PathBuf {
  let mut dir = clean(input).into_os_string();
  dir.push(OUTPUT_SUFFIX);
  PathBuf::from(dir)
}

/// 文件输入的默认输出文件：`a/b.jpg` -> `a/b_out.jpg`，无扩展名时用 `.png`
pub fn default_output_file(input: &Path) -> PathBuf {
  let ext = input
    .extension()
    .map(|ext| ext.to_os_string())
    .unwrap_or_else(|| OsString::from(DEFAULT_EXTENSION));

  let mut name = input.with_extension("").into_os_string();
  name.push(OUTPUT_SUFFIX);
  name.push(".");
  name.push(ext);
  PathBuf::from(name)
}

/// 列出目录下的可处理文件，不递归，按文件名排序
pub fn eligible_files(dir: &Path) -> Result<Vec<PathBuf>, PairingError> {
  let read_err = |source| PairingError::ReadDir {
    path: dir.to_path_buf(),
    source,
  };

  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir).map_err(read_err)? {
    let entry = entry.map_err(read_err)?;
    let path = entry.path();
    if entry.file_type().map_err(read_err)?.is_dir() {
      debug!("跳过子目录: {}", path.display());
      continue;
    }
    if !is_eligible(&path) {
      debug!("跳过不支持的文件: {}", path.display());
      continue;
    }
    files.push(path);
  }
  files.sort();
  Ok(files)
}

/// 根据输入路径与可选输出路径生成处理计划
pub fn plan(input: &Path, output: Option<&Path>) -> Result<Plan, PairingError> {
  let metadata = std::fs::metadata(input).map_err(|source| PairingError::Input {
    path: input.to_path_buf(),
    source,
  })?;
  let output = output.filter(|path| !path.as_os_str().is_empty());

  if metadata.is_dir() {
    let output_dir = output
      .map(Path::to_path_buf)
      .unwrap_or_else(|| default_output_dir(input));
    let pairs = eligible_files(input)?
      .into_iter()
      .filter_map(|file| {
        let name = file.file_name()?.to_os_string();
        Some(FilePair {
          output: output_dir.join(name),
          input: file,
        })
      })
      .collect();
    Ok(Plan::Directory { output_dir, pairs })
  } else {
    let output = output
      .map(Path::to_path_buf)
      .unwrap_or_else(|| default_output_file(input));
    Ok(Plan::Single(FilePair {
      input: input.to_path_buf(),
      output,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn eligibility_is_case_insensitive() {
    assert!(is_eligible(Path::new("a.png")));
    assert!(is_eligible(Path::new("a.JPG")));
    assert!(is_eligible(Path::new("dir/a.Jpeg")));
    assert!(is_eligible(Path::new("a.webp")));
    assert!(!is_eligible(Path::new("a.txt")));
    assert!(!is_eligible(Path::new("png")));
    assert!(!is_eligible(Path::new("a.png.bak")));
  }

  #[test]
  fn default_output_for_files() {
    assert_eq!(
      default_output_file(Path::new("path/to/image.jpg")),
      PathBuf::from("path/to/image_out.jpg")
    );
    assert_eq!(
      default_output_file(Path::new("image.PNG")),
      PathBuf::from("image_out.PNG")
    );
    assert_eq!(
      default_output_file(Path::new("path/image")),
      PathBuf::from("path/image_out.png")
    );
    assert_eq!(
      default_output_file(Path::new("a.b.webp")),
      PathBuf::from("a.b_out.webp")
    );
  }

  #[test]
  fn default_output_for_directories() {
    assert_eq!(default_output_dir(Path::new("dir/")), PathBuf::from("dir_out"));
    assert_eq!(default_output_dir(Path::new("a/b")), PathBuf::from("a/b_out"));
    assert_eq!(default_output_dir(Path::new("a//./b/")), PathBuf::from("a/b_out"));
    assert_eq!(default_output_dir(Path::new(".")), PathBuf::from("._out"));
    assert_eq!(
      default_output_dir(Path::new("photos/sub/..")),
      PathBuf::from("photos_out")
    );
    assert_eq!(default_output_dir(Path::new("a/..")), PathBuf::from("._out"));
    assert_eq!(default_output_dir(Path::new("./a/")), PathBuf::from("a_out"));
    assert_eq!(default_output_dir(Path::new("../x/")), PathBuf::from("../x_out"));
    assert_eq!(default_output_dir(Path::new("a/../..")), PathBuf::from(".._out"));
  }

  #[test]
  fn plan_covers_file_and_directory_inputs() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("dir");
    std::fs::create_dir_all(dir.join("d")).unwrap();
    for name in ["b.jpg", "a.png", "c.txt", "noext"] {
      std::fs::write(dir.join(name), b"x").unwrap();
    }
    std::fs::write(dir.join("d").join("e.png"), b"x").unwrap();

    // 目录, 未指定输出
    let mut input = dir.clone().into_os_string();
    input.push("/");
    let planned = plan(Path::new(&input), None).unwrap();
    let output_dir = root.path().join("dir_out");
    assert_eq!(
      planned,
      Plan::Directory {
        output_dir: output_dir.clone(),
        pairs: vec![
          FilePair {
            input: dir.join("a.png"),
            output: output_dir.join("a.png"),
          },
          FilePair {
            input: dir.join("b.jpg"),
            output: output_dir.join("b.jpg"),
          },
        ],
      }
    );

    // 目录, 指定输出
    let custom = root.path().join("custom");
    let planned = plan(&dir, Some(&custom)).unwrap();
    assert_eq!(planned.pairs()[0].output, custom.join("a.png"));

    // 目录, 输出为空字符串
    let planned = plan(&dir, Some(Path::new(""))).unwrap();
    assert!(matches!(planned, Plan::Directory { output_dir: ref d, .. } if *d == output_dir));

    // 文件, 有扩展名 / 无扩展名 / 指定输出
    let planned = plan(&dir.join("b.jpg"), None).unwrap();
    assert_eq!(planned.pairs()[0].output, dir.join("b_out.jpg"));
    let planned = plan(&dir.join("noext"), None).unwrap();
    assert_eq!(planned.pairs()[0].output, dir.join("noext_out.png"));
    let planned = plan(&dir.join("noext"), Some(&root.path().join("x.jpeg"))).unwrap();
    assert_eq!(planned.pairs()[0].output, root.path().join("x.jpeg"));
    assert_eq!(planned.pairs()[0].output_extension().as_deref(), Some(".jpeg"));
  }

  #[test]
  fn plan_reports_missing_input() {
    let root = tempfile::tempdir().unwrap();
    assert!(matches!(
      plan(&root.path().join("missing"), None),
      Err(PairingError::Input { .. })
    ));
  }
}
