//! Status command implementation.
//!
//! Lists the runs under the fleetlab home and, in verbose mode, the host
//! addresses recorded in the current run's model dump.

use anyhow::{Context, Result};

use fleetlab_lib::instance::InstanceStore;

use crate::output::{self, format_age, print_info, print_json, print_stat};

pub fn cmd_status(verbose: bool, json: bool) -> Result<()> {
  let store = InstanceStore::default_store();
  let index = store.load_index().context("Failed to load the run index")?;

  if json {
    let runs: Vec<_> = index
      .runs
      .iter()
      .map(|run| {
        serde_json::json!({
          "id": run.id,
          "model": run.model,
          "created_at": run.created_at,
          "current": Some(&run.id) == index.current.as_ref(),
        })
      })
      .collect();
    return print_json(&serde_json::json!({
      "home": store.base_path().display().to_string(),
      "current": index.current,
      "runs": runs,
    }));
  }

  if index.runs.is_empty() {
    print_info("No runs yet. Create one with 'fleet up'.");
    return Ok(());
  }

  let now = now_ms();
  println!("Runs in {}:", store.base_path().display());
  for run in &index.runs {
    let marker = if Some(&run.id) == index.current.as_ref() {
      output::symbols::CURRENT
    } else {
      " "
    };
    println!("  {} {}  {}  ({})", marker, run.id, run.model, format_age(run.created_at, now));
  }

  if verbose && let Some(id) = &index.current {
    println!();
    match store.load_model_value(id) {
      Ok(dump) => {
        println!("Hosts of run {}:", id);
        print_hosts(&dump);
      }
      Err(_) => print_info("The current run has no model dump yet."),
    }
  }

  Ok(())
}

fn print_hosts(dump: &serde_json::Value) {
  let Some(regions) = dump["regions"].as_object() else {
    return;
  };
  for (region_id, region) in regions {
    let Some(hosts) = region["hosts"].as_object() else {
      continue;
    };
    for (host_id, host) in hosts {
      let address = host["public_ip"].as_str().filter(|ip| !ip.is_empty()).unwrap_or("-");
      print_stat(&format!("{}/{}", region_id, host_id), address);
    }
  }
}

fn now_ms() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}
