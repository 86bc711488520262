//! Kitting stage: assemble the artifact tree synced to every host.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::model::VariableValue;
use crate::pipeline::stage::KittingStage;
use crate::pipeline::{PipelineError, Run};
use crate::util::fs::{copy_file, copy_tree};

/// Assembles the kit under the run directory:
///
/// ```text
/// kit/
/// ├── bin/       from the `kit/bin_dir` variable, when set
/// ├── cfg/       the staged per-host configuration
/// ├── scripts/   component control scripts
/// └── pki/       generated identities, when present
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildKit;

#[async_trait]
impl KittingStage for BuildKit {
  async fn kit(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let kit = run.paths().kit();

    let binaries = match run.model().var_opt("kit/bin_dir")?.and_then(VariableValue::as_str) {
      Some(dir) => copy_tree(Path::new(dir), &kit.join("bin"))?,
      None => {
        debug!("kit/bin_dir not set, skipping binaries");
        0
      }
    };

    let configs = copy_tree(&run.paths().cfg(), &kit.join("cfg"))?;

    let mut scripts = 0usize;
    for id in run.model().all_hosts() {
      let host = run.model().host(&id)?;
      for component in host.components.values() {
        let (Some(src), Some(name)) = (&component.script_src, &component.script_name) else {
          continue;
        };
        copy_file(src, &kit.join("scripts").join(name))?;
        scripts += 1;
      }
    }

    let pki = run.paths().pki();
    if pki.is_dir() {
      copy_tree(&pki, &kit.join("pki"))?;
    }

    info!(binaries, configs, scripts, "assembled kit");
    Ok(())
  }
}
