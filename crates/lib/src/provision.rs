//! Provisioner boundary.
//!
//! Drives a terraform-compatible binary against the run's infra directory:
//! `apply` to express machines, `output -json` to read their addresses
//! back, `destroy` to dispose of them. The infrastructure stages own what
//! the outputs mean; this module only runs the binary and parses JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from driving the provisioner binary.
#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("failed to spawn provisioner {binary}")]
  Spawn {
    binary: String,
    #[source]
    source: std::io::Error,
  },

  #[error("provisioner {binary} {action} failed (exit code {code:?}): {output}")]
  CommandFailed {
    binary: String,
    action: String,
    code: Option<i32>,
    output: String,
  },

  #[error("invalid provisioner output: {0}")]
  Parse(#[from] serde_json::Error),

  /// An expected per-host output was not produced.
  #[error("provisioner output {key} missing for host {host}")]
  MissingOutput { key: String, host: String },
}

/// Handle on a terraform-compatible binary rooted in a working directory.
#[derive(Debug, Clone)]
pub struct Provisioner {
  binary: String,
  work_dir: PathBuf,
}

impl Provisioner {
  pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
    Self {
      binary: binary.into(),
      work_dir: work_dir.into(),
    }
  }

  /// Express the infrastructure described in the working directory.
  pub async fn apply(&self) -> Result<(), ProvisionError> {
    info!(binary = %self.binary, dir = %self.work_dir.display(), "applying infrastructure");
    self.run("apply", &["-auto-approve", "-input=false"]).await?;
    Ok(())
  }

  /// Tear down everything the working directory describes.
  pub async fn destroy(&self) -> Result<(), ProvisionError> {
    info!(binary = %self.binary, dir = %self.work_dir.display(), "destroying infrastructure");
    self.run("destroy", &["-auto-approve"]).await?;
    Ok(())
  }

  /// Read the string-valued outputs of the last apply.
  ///
  /// The binary prints `{"name": {"value": ...}, ...}`; non-string values
  /// are skipped, the stages only consume addresses.
  pub async fn outputs(&self) -> Result<BTreeMap<String, String>, ProvisionError> {
    let stdout = self.run("output", &["-json"]).await?;
    let parsed: serde_json::Value = serde_json::from_str(&stdout)?;

    let mut outputs = BTreeMap::new();
    if let serde_json::Value::Object(entries) = parsed {
      for (key, entry) in entries {
        if let Some(value) = entry.get("value").and_then(serde_json::Value::as_str) {
          outputs.insert(key, value.to_string());
        }
      }
    }
    Ok(outputs)
  }

  async fn run(&self, action: &str, args: &[&str]) -> Result<String, ProvisionError> {
    let mut cmd = Command::new(&self.binary);
    cmd.arg(action).args(args).current_dir(&self.work_dir);
    debug!(binary = %self.binary, action, "running provisioner");

    let output = cmd.output().await.map_err(|source| ProvisionError::Spawn {
      binary: self.binary.clone(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
      debug!(stderr = %stderr.trim(), "provisioner stderr");
    }

    if !output.status.success() {
      let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
      return Err(ProvisionError::CommandFailed {
        binary: self.binary.clone(),
        action: action.to_string(),
        code: output.status.code(),
        output: detail.to_string(),
      });
    }

    Ok(stdout.trim().to_string())
  }
}
