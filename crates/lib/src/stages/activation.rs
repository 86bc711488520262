//! Activation stages: start and stop components on hosts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::parallel;
use crate::pipeline::stage::{ActivationStage, DisposalStage};
use crate::pipeline::{PipelineError, Run};
use crate::remote::RemoteError;

/// Starts every scripted component on the selected hosts.
///
/// Hosts activate in parallel up to `concurrency`; components on one host
/// start sequentially, in component id order, via
/// `sh scripts/<script> start` inside the deploy directory.
#[derive(Debug, Clone)]
pub struct StartComponents {
  regions: String,
  hosts: String,
  concurrency: usize,
}

impl StartComponents {
  pub fn new(regions: impl Into<String>, hosts: impl Into<String>, concurrency: usize) -> Self {
    Self {
      regions: regions.into(),
      hosts: hosts.into(),
      concurrency,
    }
  }
}

#[async_trait]
impl ActivationStage for StartComponents {
  async fn activate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_nonempty(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let deploy_dir = run.model().var_string("deploy/dir")?;
    let remote = run.remote();

    let mut tasks = Vec::new();
    let mut components = 0usize;
    for id in targets {
      let scripts: Vec<String> = run
        .model()
        .host(&id)?
        .components
        .values()
        .filter_map(|c| c.script_name.clone())
        .collect();
      if scripts.is_empty() {
        debug!(host = %id, "no scripted components");
        continue;
      }
      components += scripts.len();

      let address = run.model().address(&id)?;
      let identity = identity.clone();
      let deploy_dir = deploy_dir.clone();
      let remote = Arc::clone(&remote);
      tasks.push(async move {
        for script in scripts {
          remote
            .exec(&identity, &address, &format!("cd {deploy_dir} && sh scripts/{script} start"))
            .await?;
        }
        Ok::<(), RemoteError>(())
      });
    }

    let hosts = tasks.len();
    parallel::execute(tasks, self.concurrency).await?;
    info!(hosts, components, "components started");
    Ok(())
  }
}

/// Stops components by killing their binaries on the selected hosts.
///
/// Teardown is best effort: hosts without an address are skipped and kill
/// failures are logged, so a half-built testbed can still be disposed of.
#[derive(Debug, Clone)]
pub struct StopComponents {
  regions: String,
  hosts: String,
}

impl StopComponents {
  pub fn new(regions: impl Into<String>, hosts: impl Into<String>) -> Self {
    Self {
      regions: regions.into(),
      hosts: hosts.into(),
    }
  }
}

#[async_trait]
impl DisposalStage for StopComponents {
  async fn dispose(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_nonempty(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let remote = run.remote();

    let mut stopped = 0usize;
    for id in targets {
      let (address, names) = {
        let host = run.model().host(&id)?;
        if host.components.is_empty() {
          continue;
        }
        if host.public_ip.is_empty() {
          debug!(host = %id, "no address, skipping stop");
          continue;
        }
        let names: Vec<String> = host.components.values().map(|c| c.binary_name.clone()).collect();
        (host.public_ip.clone(), names)
      };

      for name in names {
        match remote.kill(&identity, &address, &name).await {
          Ok(()) => stopped += 1,
          Err(e) => warn!(host = %id, process = %name, error = %e, "failed to stop component"),
        }
      }
    }

    info!(components = stopped, "components stopped");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::instance::InstanceStore;
  use crate::util::testutil::{FakeRemote, expressed_model};

  fn temp_store() -> (TempDir, InstanceStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = InstanceStore::new(temp_dir.path().to_path_buf());
    (temp_dir, store)
  }

  #[tokio::test]
  async fn starts_scripted_components_only() {
    let remote = Arc::new(FakeRemote::new());
    let mut model = expressed_model();
    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    StartComponents::new("*", "*", 2).activate(&mut run).await.unwrap();

    // Only svc0's store component carries a control script.
    let execs = remote.calls_of("exec");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].host, "10.0.0.1");
    assert_eq!(execs[0].detail, "cd /opt/fleet && sh scripts/store.sh start");
  }

  #[tokio::test]
  async fn start_failure_fails_the_stage() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_host("10.0.0.1");

    let mut model = expressed_model();
    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    let result = StartComponents::new("*", "*", 2).activate(&mut run).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn stops_every_component_binary() {
    let remote = Arc::new(FakeRemote::new());
    let mut model = expressed_model();
    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    StopComponents::new("*", "*").dispose(&mut run).await.unwrap();

    let kills = remote.calls_of("kill");
    assert_eq!(kills.len(), 2);
    assert!(kills.iter().any(|c| c.host == "10.0.0.1" && c.detail == "fleet-store"));
    assert!(kills.iter().any(|c| c.host == "10.0.0.2" && c.detail == "fleet-cache"));
  }

  #[tokio::test]
  async fn stop_tolerates_failures_and_missing_addresses() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_host("10.0.0.1");

    let mut model = expressed_model();
    // As if infrastructure never expressed this host.
    model
      .regions
      .get_mut("east")
      .unwrap()
      .hosts
      .get_mut("svc1")
      .unwrap()
      .public_ip
      .clear();

    let (_temp, store) = temp_store();
    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();

    StopComponents::new("*", "*").dispose(&mut run).await.unwrap();

    // The kill against svc0 failed but was tolerated; svc1 was skipped.
    let kills = remote.calls_of("kill");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].host, "10.0.0.1");
  }
}
