//! Remote execution boundary.
//!
//! Everything that touches a testbed host goes through the [`Remote`]
//! trait: one-shot commands, process kills, interactive shells, and file
//! tree sync. Production code uses [`SshRemote`]; tests substitute a fake
//! so pipeline behavior can be exercised without machines.

pub mod ssh;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use ssh::SshRemote;

/// Credentials for reaching testbed hosts.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
  pub username: String,

  /// Private key file; omitted when the ssh agent holds the key.
  pub key_path: Option<PathBuf>,
}

/// Errors from remote operations.
#[derive(Debug, Error)]
pub enum RemoteError {
  /// The local client process could not be spawned.
  #[error("failed to spawn {command}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// The remote command exited non-zero.
  #[error("command failed on {host} (exit code {code:?}): {command}: {output}")]
  CommandFailed {
    host: String,
    command: String,
    code: Option<i32>,
    output: String,
  },

  /// File tree sync to the host failed.
  #[error("sync to {host} failed (exit code {code:?}): {src} -> {dst}: {output}")]
  SyncFailed {
    host: String,
    src: PathBuf,
    dst: String,
    code: Option<i32>,
    output: String,
  },
}

/// Executes operations on testbed hosts.
#[async_trait]
pub trait Remote: Send + Sync {
  /// Run `command` on `host`, returning trimmed stdout.
  async fn exec(&self, identity: &RemoteIdentity, host: &str, command: &str) -> Result<String, RemoteError>;

  /// Kill remote processes whose command line matches `pattern`.
  ///
  /// Matching nothing is not an error; teardown must be re-runnable.
  async fn kill(&self, identity: &RemoteIdentity, host: &str, pattern: &str) -> Result<(), RemoteError>;

  /// Open an interactive shell on `host`, returning when it exits.
  async fn shell(&self, identity: &RemoteIdentity, host: &str) -> Result<(), RemoteError>;

  /// Mirror the local tree at `src` into `dst` on `host`.
  async fn sync(&self, identity: &RemoteIdentity, host: &str, src: &Path, dst: &str) -> Result<(), RemoteError>;
}
