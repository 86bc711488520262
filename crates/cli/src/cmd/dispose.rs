//! Implementation of the `fleet dispose` command.
//!
//! Stops components and tears down infrastructure for the current run,
//! then clears the current-run pointer. Disposal works against a fresh
//! bind, so a failed or half-built run can always be cleaned up.

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use fleetlab_lib::instance::InstanceStore;
use fleetlab_lib::model::Model;
use fleetlab_lib::pipeline::Run;
use fleetlab_lib::remote::{Remote, SshRemote};

use crate::cmd::bind_model;
use crate::output::{print_success, print_warning};

pub fn cmd_dispose(model_name: &str, sets: &[String], force: bool) -> Result<()> {
  let mut model = bind_model(model_name, sets)?;

  let store = InstanceStore::default_store();
  let id = store
    .current_id()
    .context("Failed to read the run index")?
    .context("No active run to dispose.")?;

  if !confirm(&format!("Tear down infrastructure for run {}?", id), force)? {
    print_warning("Disposal aborted.");
    return Ok(());
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(dispose(&mut model, &id)).context("Disposal failed")?;

  store.clear_current().context("Failed to clear the current run pointer")?;
  print_success(&format!("Run {} disposed", id));
  Ok(())
}

async fn dispose(model: &mut Model, id: &str) -> Result<()> {
  let remote: Arc<dyn Remote> = Arc::new(SshRemote::new());
  let mut run = Run::resume(model, remote, id)?;
  run.run_disposal().await?;
  Ok(())
}

fn confirm(message: &str, force: bool) -> Result<bool> {
  if force {
    return Ok(true);
  }

  if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
    bail!("Cannot prompt for confirmation in non-interactive mode. Use --force to proceed.");
  }

  write!(io::stderr(), "{} [y/N] ", message)?;
  io::stderr().flush()?;

  let mut input = String::new();
  io::stdin().read_line(&mut input)?;

  Ok(matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
