//! Distribution stage: push the kit onto hosts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::parallel;
use crate::pipeline::stage::DistributionStage;
use crate::pipeline::{PipelineError, Run};
use crate::remote::RemoteError;

/// Mirrors the kit into the deploy directory (`deploy/dir`) on every
/// selected host, with at most `concurrency` hosts syncing at once.
#[derive(Debug, Clone)]
pub struct SyncHosts {
  regions: String,
  hosts: String,
  concurrency: usize,
}

impl SyncHosts {
  pub fn new(regions: impl Into<String>, hosts: impl Into<String>, concurrency: usize) -> Self {
    Self {
      regions: regions.into(),
      hosts: hosts.into(),
      concurrency,
    }
  }

  /// Sync every host in the model.
  pub fn all(concurrency: usize) -> Self {
    Self::new("*", "*", concurrency)
  }
}

#[async_trait]
impl DistributionStage for SyncHosts {
  async fn distribute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_nonempty(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let deploy_dir = run.model().var_string("deploy/dir")?;
    let kit = run.paths().kit();
    let remote = run.remote();
    let count = targets.len();

    let mut tasks = Vec::with_capacity(count);
    for id in targets {
      let address = run.model().address(&id)?;
      let identity = identity.clone();
      let deploy_dir = deploy_dir.clone();
      let kit = kit.clone();
      let remote = Arc::clone(&remote);
      tasks.push(async move {
        remote.exec(&identity, &address, &format!("mkdir -p {deploy_dir}")).await?;
        remote.sync(&identity, &address, &kit, &deploy_dir).await?;
        debug!(host = %address, "kit synced");
        Ok::<(), RemoteError>(())
      });
    }

    parallel::execute(tasks, self.concurrency).await?;
    info!(hosts = count, dir = %deploy_dir, "distributed kit");
    Ok(())
  }
}
