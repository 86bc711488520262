//! Ssh-backed [`Remote`] implementation, shelling out to `ssh` and `rsync`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Remote, RemoteError, RemoteIdentity};

/// Options for non-interactive testbed sessions. Hosts are short-lived and
/// their keys churn on every provision, so host key checking is disabled.
const SSH_OPTIONS: &[&str] = &[
  "-o",
  "StrictHostKeyChecking=no",
  "-o",
  "UserKnownHostsFile=/dev/null",
  "-o",
  "LogLevel=ERROR",
];

/// [`Remote`] implementation backed by the system `ssh` and `rsync` binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshRemote;

impl SshRemote {
  pub fn new() -> Self {
    Self
  }

  fn base_command(&self, identity: &RemoteIdentity) -> Command {
    let mut command = Command::new("ssh");
    command.args(SSH_OPTIONS);
    if let Some(key) = &identity.key_path {
      command.arg("-i").arg(key);
    }
    command
  }
}

fn destination(identity: &RemoteIdentity, host: &str) -> String {
  format!("{}@{}", identity.username, host)
}

/// The `-e` argument handed to rsync so it tunnels over the same ssh
/// configuration as direct commands.
fn rsync_rsh(identity: &RemoteIdentity) -> String {
  let mut rsh = format!("ssh {}", SSH_OPTIONS.join(" "));
  if let Some(key) = &identity.key_path {
    rsh.push_str(&format!(" -i {}", key.display()));
  }
  rsh
}

#[async_trait]
impl Remote for SshRemote {
  async fn exec(&self, identity: &RemoteIdentity, host: &str, command: &str) -> Result<String, RemoteError> {
    debug!(host = %host, command = %command, "running remote command");

    let output = self
      .base_command(identity)
      .arg(destination(identity, host))
      .arg(command)
      .output()
      .await
      .map_err(|source| RemoteError::Spawn {
        command: format!("ssh {host}"),
        source,
      })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
      let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "remote command stderr");
      }
      return Err(RemoteError::CommandFailed {
        host: host.to_string(),
        command: command.to_string(),
        code: output.status.code(),
        output: if stderr.is_empty() { stdout } else { stderr },
      });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "remote command output");
    }
    Ok(stdout)
  }

  async fn kill(&self, identity: &RemoteIdentity, host: &str, pattern: &str) -> Result<(), RemoteError> {
    let command = format!("pkill -f '{pattern}'");
    match self.exec(identity, host, &command).await {
      Ok(_) => Ok(()),
      // pkill exits 1 when nothing matched; teardown must be re-runnable.
      Err(RemoteError::CommandFailed { code: Some(1), .. }) => {
        debug!(host = %host, pattern = %pattern, "no matching processes");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  async fn shell(&self, identity: &RemoteIdentity, host: &str) -> Result<(), RemoteError> {
    debug!(host = %host, "opening interactive shell");

    let mut command = self.base_command(identity);
    command
      .arg("-t")
      .arg(destination(identity, host))
      .stdin(Stdio::inherit())
      .stdout(Stdio::inherit())
      .stderr(Stdio::inherit());

    let status = command.status().await.map_err(|source| RemoteError::Spawn {
      command: format!("ssh {host}"),
      source,
    })?;
    if !status.success() {
      // The user ending a session with a non-zero status is unremarkable.
      warn!(host = %host, code = ?status.code(), "shell exited non-zero");
    }
    Ok(())
  }

  async fn sync(&self, identity: &RemoteIdentity, host: &str, src: &Path, dst: &str) -> Result<(), RemoteError> {
    // Trailing slash so rsync mirrors the directory's contents rather than
    // nesting the directory itself under dst.
    let mut src_arg = src.display().to_string();
    if !src_arg.ends_with('/') {
      src_arg.push('/');
    }

    debug!(host = %host, src = %src.display(), dst = %dst, "syncing tree");

    let output = Command::new("rsync")
      .arg("-az")
      .arg("--delete")
      .arg("-e")
      .arg(rsync_rsh(identity))
      .arg(&src_arg)
      .arg(format!("{}:{}", destination(identity, host), dst))
      .output()
      .await
      .map_err(|source| RemoteError::Spawn {
        command: "rsync".to_string(),
        source,
      })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "rsync stderr");
      }
      return Err(RemoteError::SyncFailed {
        host: host.to_string(),
        src: src.to_path_buf(),
        dst: dst.to_string(),
        code: output.status.code(),
        output: stderr,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;

  #[test]
  fn destination_formats_user_at_host() {
    let identity = RemoteIdentity {
      username: "ubuntu".to_string(),
      key_path: None,
    };
    assert_eq!(destination(&identity, "198.51.100.7"), "ubuntu@198.51.100.7");
  }

  #[test]
  fn rsync_rsh_includes_key_when_present() {
    let without_key = RemoteIdentity {
      username: "ubuntu".to_string(),
      key_path: None,
    };
    let rsh = rsync_rsh(&without_key);
    assert!(rsh.starts_with("ssh -o StrictHostKeyChecking=no"));
    assert!(!rsh.contains("-i"));

    let with_key = RemoteIdentity {
      username: "ubuntu".to_string(),
      key_path: Some(PathBuf::from("/tmp/fleet.pem")),
    };
    assert!(rsync_rsh(&with_key).ends_with("-i /tmp/fleet.pem"));
  }
}
