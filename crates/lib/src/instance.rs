//! Run instance storage.
//!
//! Every `fleet up` creates a run instance under the fleetlab home:
//!
//! ```text
//! {fleetlab home}/runs/
//! ├── index.json          # RunIndex: run list + current pointer
//! └── <run id>/
//!     ├── model.json      # model dump, refreshed as phases progress
//!     ├── kit/            # assembled artifact tree
//!     ├── cfg/            # rendered per-host configuration
//!     ├── infra/          # provisioner working directory
//!     └── pki/            # generated identities
//! ```
//!
//! Uses atomic write operations (write to temp, then rename) so a crash
//! mid-write never corrupts the index or the model dump.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Model;
use crate::paths::fleet_home;

/// Directory name for run instances within the fleetlab home.
const RUNS_DIR: &str = "runs";

/// Index file name.
const INDEX_FILENAME: &str = "index.json";

/// Model dump file name within a run directory.
const MODEL_FILENAME: &str = "model.json";

const KIT_DIR: &str = "kit";
const CFG_DIR: &str = "cfg";
const INFRA_DIR: &str = "infra";
const PKI_DIR: &str = "pki";

/// Current run index schema version.
pub const RUN_INDEX_VERSION: u32 = 1;

/// Errors from run instance storage.
#[derive(Debug, Error)]
pub enum InstanceError {
  #[error("failed to create run directory")]
  CreateDir(#[source] io::Error),

  #[error("failed to read run data")]
  Read(#[source] io::Error),

  #[error("failed to write run data")]
  Write(#[source] io::Error),

  #[error("failed to parse run data")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize run data")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported run index version: {0}")]
  UnsupportedVersion(u32),

  #[error("run not found: {0}")]
  NotFound(String),
}

/// Directory layout of one run instance.
#[derive(Debug, Clone)]
pub struct InstancePaths {
  root: PathBuf,
}

impl InstancePaths {
  fn for_run(base: &Path, id: &str) -> Self {
    Self { root: base.join(id) }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Assembled artifact tree, synced verbatim to every host.
  pub fn kit(&self) -> PathBuf {
    self.root.join(KIT_DIR)
  }

  /// Rendered per-host configuration, staged into the kit.
  pub fn cfg(&self) -> PathBuf {
    self.root.join(CFG_DIR)
  }

  /// Provisioner working directory.
  pub fn infra(&self) -> PathBuf {
    self.root.join(INFRA_DIR)
  }

  /// Generated identities.
  pub fn pki(&self) -> PathBuf {
    self.root.join(PKI_DIR)
  }

  pub fn model_file(&self) -> PathBuf {
    self.root.join(MODEL_FILENAME)
  }
}

/// Index entry for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
  pub id: String,
  pub created_at: u64,

  /// Name of the model the run was bound from.
  pub model: String,
}

/// On-disk run index: run list plus current pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndex {
  pub version: u32,
  pub runs: Vec<RunMetadata>,
  pub current: Option<String>,
}

impl RunIndex {
  pub fn new() -> Self {
    Self {
      version: RUN_INDEX_VERSION,
      runs: Vec::new(),
      current: None,
    }
  }

  /// Add a run, keeping the list in chronological order.
  pub fn add(&mut self, metadata: RunMetadata) {
    self.runs.push(metadata);
    self.runs.sort_by_key(|m| m.created_at);
  }

  pub fn is_empty(&self) -> bool {
    self.runs.is_empty()
  }

  pub fn len(&self) -> usize {
    self.runs.len()
  }
}

impl Default for RunIndex {
  fn default() -> Self {
    Self::new()
  }
}

/// Manages run instance storage on disk.
#[derive(Debug, Clone)]
pub struct InstanceStore {
  /// Base path for run storage (e.g., `~/.local/share/fleetlab/runs`).
  base_path: PathBuf,
}

impl InstanceStore {
  /// Create a store at the given base path.
  pub fn new(base_path: PathBuf) -> Self {
    Self { base_path }
  }

  /// Create a store at the default location under the fleetlab home.
  pub fn default_store() -> Self {
    Self::new(fleet_home().join(RUNS_DIR))
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn index_path(&self) -> PathBuf {
    self.base_path.join(INDEX_FILENAME)
  }

  fn ensure_dir(&self) -> Result<(), InstanceError> {
    fs::create_dir_all(&self.base_path).map_err(InstanceError::CreateDir)
  }

  /// Load the run index.
  ///
  /// Returns an empty index if the file doesn't exist yet.
  pub fn load_index(&self) -> Result<RunIndex, InstanceError> {
    let path = self.index_path();

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RunIndex::new()),
      Err(e) => return Err(InstanceError::Read(e)),
    };

    let index: RunIndex = serde_json::from_str(&content).map_err(InstanceError::Parse)?;

    if index.version != RUN_INDEX_VERSION {
      return Err(InstanceError::UnsupportedVersion(index.version));
    }

    Ok(index)
  }

  fn save_index(&self, index: &RunIndex) -> Result<(), InstanceError> {
    self.ensure_dir()?;

    let path = self.index_path();
    let temp_path = self.base_path.join("index.json.tmp");

    let content = serde_json::to_string_pretty(index).map_err(InstanceError::Serialize)?;
    fs::write(&temp_path, &content).map_err(InstanceError::Write)?;
    fs::rename(&temp_path, &path).map_err(InstanceError::Write)?;

    Ok(())
  }

  /// Create a new run instance: directory tree, index entry, and the
  /// current pointer. Returns the run id and its paths.
  pub fn create(&self, model_name: &str) -> Result<(String, InstancePaths), InstanceError> {
    let id = generate_run_id();
    let paths = InstancePaths::for_run(&self.base_path, &id);

    for dir in [paths.root().to_path_buf(), paths.kit(), paths.cfg(), paths.infra(), paths.pki()] {
      fs::create_dir_all(&dir).map_err(InstanceError::CreateDir)?;
    }

    let mut index = self.load_index()?;
    index.add(RunMetadata {
      id: id.clone(),
      created_at: unix_millis(),
      model: model_name.to_string(),
    });
    index.current = Some(id.clone());
    self.save_index(&index)?;

    Ok((id, paths))
  }

  /// Paths of an existing run.
  pub fn paths(&self, id: &str) -> Result<InstancePaths, InstanceError> {
    let paths = InstancePaths::for_run(&self.base_path, id);
    if !paths.root().is_dir() {
      return Err(InstanceError::NotFound(id.to_string()));
    }
    Ok(paths)
  }

  /// Id of the current run, if any.
  pub fn current_id(&self) -> Result<Option<String>, InstanceError> {
    let index = self.load_index()?;
    Ok(index.current)
  }

  /// Clear the current pointer without removing any run artifacts.
  pub fn clear_current(&self) -> Result<(), InstanceError> {
    let mut index = self.load_index()?;
    index.current = None;
    self.save_index(&index)
  }

  /// All runs in chronological order (oldest first).
  pub fn list(&self) -> Result<Vec<RunMetadata>, InstanceError> {
    let index = self.load_index()?;
    Ok(index.runs)
  }

  /// Write the model dump into a run's directory.
  pub fn persist_model(&self, id: &str, model: &Model) -> Result<PathBuf, InstanceError> {
    let paths = self.paths(id)?;
    write_model(&paths, model)
  }

  /// Load a run's model dump as raw JSON.
  pub fn load_model_value(&self, id: &str) -> Result<serde_json::Value, InstanceError> {
    let paths = self.paths(id)?;
    let content = fs::read_to_string(paths.model_file()).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        InstanceError::NotFound(id.to_string())
      } else {
        InstanceError::Read(e)
      }
    })?;
    serde_json::from_str(&content).map_err(InstanceError::Parse)
  }
}

/// Atomically write the model dump into a run directory.
pub fn write_model(paths: &InstancePaths, model: &Model) -> Result<PathBuf, InstanceError> {
  let path = paths.model_file();
  let temp_path = paths.root().join("model.json.tmp");

  let content = serde_json::to_string_pretty(model).map_err(InstanceError::Serialize)?;
  fs::write(&temp_path, &content).map_err(InstanceError::Write)?;
  fs::rename(&temp_path, &path).map_err(InstanceError::Write)?;

  Ok(path)
}

pub(crate) fn unix_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Generate a run id from the current time; millisecond resolution keeps
/// consecutive invocations distinct.
pub fn generate_run_id() -> String {
  format!("run-{}", unix_millis())
}
