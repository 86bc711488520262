//! Implementation of the `fleet run` command.
//!
//! Resumes the current run and executes the model's operating stages:
//! background runners and listeners first, then the joiner, closer, and
//! persist steps that land accumulated host data in `model.json`.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use fleetlab_lib::instance::InstanceStore;
use fleetlab_lib::model::Model;
use fleetlab_lib::pipeline::Run;
use fleetlab_lib::remote::{Remote, SshRemote};

use crate::cmd::bind_model;
use crate::output::{format_duration, print_stat, print_success};

pub fn cmd_run(model_name: &str, sets: &[String]) -> Result<()> {
  let start = Instant::now();
  let mut model = bind_model(model_name, sets)?;

  let store = InstanceStore::default_store();
  let id = store
    .current_id()
    .context("Failed to read the run index")?
    .context("No active run. Start one with 'fleet up'.")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(operate(&mut model, &id)).context("Operation failed")?;

  println!();
  print_success(&format!("Operation complete for run {}", id));
  if let Ok(paths) = store.paths(&id) {
    print_stat("Model dump", &paths.model_file().display().to_string());
  }
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

async fn operate(model: &mut Model, id: &str) -> Result<()> {
  let remote: Arc<dyn Remote> = Arc::new(SshRemote::new());
  let mut run = Run::resume(model, remote, id)?;
  run.run_operation().await?;
  Ok(())
}
