//! Infrastructure stages: express machines, wait for them, destroy them.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::model::VariableValue;
use crate::pipeline::stage::{DisposalStage, InfrastructureStage};
use crate::pipeline::{PipelineError, Run};
use crate::provision::{ProvisionError, Provisioner};

/// Fallback when the model does not set `infra/binary`.
const DEFAULT_BINARY: &str = "terraform";

fn provisioner_for(run: &Run<'_>) -> Result<Provisioner, PipelineError> {
  let binary = run
    .model()
    .var_opt("infra/binary")?
    .and_then(VariableValue::as_str)
    .unwrap_or(DEFAULT_BINARY)
    .to_string();
  Ok(Provisioner::new(binary, run.paths().infra()))
}

/// Applies the run's infra directory and writes the provisioned addresses
/// back into the model.
///
/// Every host must come back with a `<region>_<host>_public_ip` output;
/// `<region>_<host>_private_ip` is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct Provision;

#[async_trait]
impl InfrastructureStage for Provision {
  async fn express(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let provisioner = provisioner_for(run)?;
    provisioner.apply().await?;
    let outputs = provisioner.outputs().await?;

    let ids = run.model().all_hosts();
    let count = ids.len();
    for id in ids {
      let public_key = format!("{}_{}_public_ip", id.region, id.host);
      let public_ip = outputs
        .get(&public_key)
        .ok_or_else(|| ProvisionError::MissingOutput {
          key: public_key.clone(),
          host: id.to_string(),
        })?
        .clone();

      let private_key = format!("{}_{}_private_ip", id.region, id.host);
      let private_ip = outputs.get(&private_key).cloned().unwrap_or_default();

      debug!(host = %id, public_ip = %public_ip, "expressed host");
      let host = run.model_mut().host_mut(&id)?;
      host.public_ip = public_ip;
      host.private_ip = private_ip;
    }

    info!(hosts = count, "expressed infrastructure");
    Ok(())
  }
}

/// Destroys everything the run's infra directory describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Destroy;

#[async_trait]
impl DisposalStage for Destroy {
  async fn dispose(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    provisioner_for(run)?.destroy().await?;
    Ok(())
  }
}

/// Retries a probe command against every host until it answers, so later
/// phases never race freshly booted machines.
#[derive(Debug, Clone)]
pub struct WaitForHosts {
  attempts: usize,
  delay: Duration,
}

impl WaitForHosts {
  pub fn new(attempts: usize, delay: Duration) -> Self {
    Self { attempts, delay }
  }
}

impl Default for WaitForHosts {
  fn default() -> Self {
    Self::new(30, Duration::from_secs(2))
  }
}

#[async_trait]
impl InfrastructureStage for WaitForHosts {
  async fn express(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let identity = run.model().remote_identity()?;
    let remote = run.remote();

    for id in run.model().all_hosts() {
      let address = run.model().address(&id)?;
      let mut last_err = None;
      for attempt in 1..=self.attempts {
        match remote.exec(&identity, &address, "echo ready").await {
          Ok(_) => {
            debug!(host = %id, attempt, "host reachable");
            last_err = None;
            break;
          }
          Err(e) => {
            debug!(host = %id, attempt, error = %e, "host not reachable yet");
            last_err = Some(e);
            if attempt < self.attempts {
              tokio::time::sleep(self.delay).await;
            }
          }
        }
      }
      if let Some(e) = last_err {
        warn!(host = %id, attempts = self.attempts, "host never became reachable");
        return Err(e.into());
      }
    }

    info!("all hosts reachable");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;
  use std::sync::Arc;

  use tempfile::TempDir;

  use super::*;
  use crate::instance::InstanceStore;
  use crate::util::testutil::{FakeRemote, bound_model, expressed_model};

  fn temp_store() -> (TempDir, InstanceStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = InstanceStore::new(temp_dir.path().to_path_buf());
    (temp_dir, store)
  }

  fn fake_binary(dir: &Path, script: &str) -> String {
    let path = dir.join("fake-provisioner");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
  }

  fn use_binary(model: &mut crate::model::Model, binary: String) {
    model
      .scope
      .variables
      .put("infra/binary", VariableValue::String(binary))
      .unwrap();
  }

  #[tokio::test]
  async fn provision_writes_addresses_into_model() {
    let temp_bin = TempDir::new().unwrap();
    let binary = fake_binary(
      temp_bin.path(),
      concat!(
        r#"case "$1" in output) echo '{"#,
        r#""east_svc0_public_ip":{"value":"10.0.0.1"},"east_svc0_private_ip":{"value":"192.168.0.1"},"#,
        r#""east_svc1_public_ip":{"value":"10.0.0.2"},"#,
        r#""west_cli0_public_ip":{"value":"10.0.0.3"}"#,
        r#"}' ;; esac"#,
      ),
    );

    let mut model = bound_model();
    use_binary(&mut model, binary);

    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, Arc::new(FakeRemote::new()), &store).unwrap();
    Provision.express(&mut run).await.unwrap();
    drop(run);

    let svc0 = &model.regions["east"].hosts["svc0"];
    assert_eq!(svc0.public_ip, "10.0.0.1");
    assert_eq!(svc0.private_ip, "192.168.0.1");
    // No private output, so the private address stays empty.
    assert_eq!(model.regions["east"].hosts["svc1"].public_ip, "10.0.0.2");
    assert_eq!(model.regions["east"].hosts["svc1"].private_ip, "");
    assert_eq!(model.regions["west"].hosts["cli0"].public_ip, "10.0.0.3");
  }

  #[tokio::test]
  async fn provision_fails_on_missing_public_output() {
    let temp_bin = TempDir::new().unwrap();
    let binary = fake_binary(
      temp_bin.path(),
      r#"case "$1" in output) echo '{"east_svc0_public_ip":{"value":"10.0.0.1"}}' ;; esac"#,
    );

    let mut model = bound_model();
    use_binary(&mut model, binary);

    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, Arc::new(FakeRemote::new()), &store).unwrap();
    let result = Provision.express(&mut run).await;

    match result {
      Err(PipelineError::Provision(ProvisionError::MissingOutput { key, host })) => {
        assert_eq!(key, "east_svc1_public_ip");
        assert_eq!(host, "east/svc1");
      }
      other => panic!("expected MissingOutput, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn destroy_invokes_provisioner() {
    let temp_bin = TempDir::new().unwrap();
    // The provisioner runs inside the run's infra directory; leave a
    // marker there.
    let binary = fake_binary(temp_bin.path(), r#"echo "$1" >> calls.log"#);

    let mut model = bound_model();
    use_binary(&mut model, binary);

    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, Arc::new(FakeRemote::new()), &store).unwrap();
    Destroy.dispose(&mut run).await.unwrap();

    let calls = std::fs::read_to_string(run.paths().infra().join("calls.log")).unwrap();
    assert_eq!(calls.trim(), "destroy");
  }

  #[tokio::test]
  async fn wait_for_hosts_retries_until_reachable() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_host_times("10.0.0.1", 2);

    let mut model = expressed_model();
    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    WaitForHosts::new(5, Duration::from_millis(1))
      .express(&mut run)
      .await
      .unwrap();

    let probes: Vec<_> = remote.calls_of("exec").into_iter().filter(|c| c.host == "10.0.0.1").collect();
    assert_eq!(probes.len(), 3);
  }

  #[tokio::test]
  async fn wait_for_hosts_gives_up_after_attempts() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_host("10.0.0.2");

    let mut model = expressed_model();
    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    let result = WaitForHosts::new(2, Duration::from_millis(1)).express(&mut run).await;
    assert!(result.is_err());

    let probes: Vec<_> = remote.calls_of("exec").into_iter().filter(|c| c.host == "10.0.0.2").collect();
    assert_eq!(probes.len(), 2);
  }
}
