//! Dispatch of named workflows (`fleet bootstrap`, `fleet start`, ...).
//!
//! Every named subcommand resolves the current run, resumes it, and
//! invokes the workflow registered on the model under the same name.

use std::sync::Arc;

use anyhow::{Context, Result};

use fleetlab_lib::instance::InstanceStore;
use fleetlab_lib::model::Model;
use fleetlab_lib::pipeline::Run;
use fleetlab_lib::remote::{Remote, SshRemote};

use crate::cmd::bind_model;
use crate::output::print_success;

pub fn cmd_action(model_name: &str, sets: &[String], action: &str) -> Result<()> {
  let mut model = bind_model(model_name, sets)?;

  let store = InstanceStore::default_store();
  let id = store
    .current_id()
    .context("Failed to read the run index")?
    .context("No active run. Start one with 'fleet up'.")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(invoke(&mut model, &id, action))
    .with_context(|| format!("Action {:?} failed", action))?;

  print_success(&format!("Action {:?} complete", action));
  Ok(())
}

async fn invoke(model: &mut Model, id: &str, action: &str) -> Result<()> {
  let remote: Arc<dyn Remote> = Arc::new(SshRemote::new());
  let mut run = Run::resume(model, remote, id)?;
  run.run_action(action).await?;
  Ok(())
}
