//! Configuration stage: lay component config files out per host.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::pipeline::stage::ConfigurationStage;
use crate::pipeline::{PipelineError, Run};
use crate::util::fs::copy_file;

/// Copies each component's config source into the run's cfg tree at
/// `cfg/<region>/<host>/<config name>`. Components without a config are
/// skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageConfigs;

#[async_trait]
impl ConfigurationStage for StageConfigs {
  async fn configure(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let cfg_root = run.paths().cfg();

    let mut staged = 0usize;
    for id in run.model().all_hosts() {
      let host = run.model().host(&id)?;
      for component in host.components.values() {
        let Some(src) = &component.config_src else { continue };
        let name = match &component.config_name {
          Some(name) => name.clone(),
          None => src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| component.id.clone()),
        };

        let dst = cfg_root.join(&id.region).join(&id.host).join(name);
        copy_file(src, &dst)?;
        debug!(component = %component.id, host = %id, dst = %dst.display(), "staged config");
        staged += 1;
      }
    }

    info!(configs = staged, "staged configuration");
    Ok(())
  }
}
