//! Filesystem helpers for staging trees into run directories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Errors from filesystem staging.
#[derive(Debug, Error)]
pub enum FsError {
  #[error("io error at {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("walk error: {0}")]
  Walk(#[from] walkdir::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FsError + '_ {
  move |source| FsError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Copy one file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64, FsError> {
  if let Some(parent) = dst.parent() {
    fs::create_dir_all(parent).map_err(io_err(parent))?;
  }
  fs::copy(src, dst).map_err(io_err(src))
}

/// Mirror the tree at `src` into `dst`, returning the number of files
/// copied. Existing files are overwritten.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize, FsError> {
  let mut copied = 0;
  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry?;
    let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
    if relative.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(relative);
    if entry.file_type().is_dir() {
      fs::create_dir_all(&target).map_err(io_err(&target))?;
    } else if entry.file_type().is_file() {
      copy_file(entry.path(), &target)?;
      copied += 1;
    }
  }
  Ok(copied)
}

/// Write `content` to `path` atomically (write to temp, then rename).
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), FsError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(io_err(parent))?;
  }
  let temp_path = path.with_extension("tmp");
  fs::write(&temp_path, content).map_err(io_err(&temp_path))?;
  fs::rename(&temp_path, path).map_err(io_err(path))
}
