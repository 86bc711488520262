//! Implementation of the `fleet up` command.
//!
//! Binds the selected model, creates a fresh run instance, and drives the
//! build-out phases: infrastructure, configuration, kitting, distribution,
//! and activation. On success the run is the current run and its hosts
//! are provisioned, synced, and started.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use fleetlab_lib::model::Model;
use fleetlab_lib::pipeline::Run;
use fleetlab_lib::remote::{Remote, SshRemote};

use crate::cmd::bind_model;
use crate::output::{format_duration, print_info, print_stat, print_success};

pub fn cmd_up(model_name: &str, sets: &[String]) -> Result<()> {
  let start = Instant::now();
  let mut model = bind_model(model_name, sets)?;
  info!(model = %model.id, hosts = model.all_hosts().len(), "model bound");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let run_id = rt.block_on(launch(&mut model)).context("Up failed")?;

  println!();
  print_success(&format!("Run {} is up", run_id));
  print_stat("Model", &model.id);
  for id in model.all_hosts() {
    let address = model.address(&id).unwrap_or_else(|_| "-".to_string());
    print_stat(&id.to_string(), &address);
  }
  print_stat("Duration", &format_duration(start.elapsed()));
  println!();
  print_info("Run 'fleet run' to start the operating stages.");

  Ok(())
}

async fn launch(model: &mut Model) -> Result<String> {
  let remote: Arc<dyn Remote> = Arc::new(SshRemote::new());
  let mut run = Run::new(model, remote)?;
  run.run_up().await?;
  Ok(run.id().to_string())
}
