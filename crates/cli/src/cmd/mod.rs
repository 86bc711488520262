mod action;
mod dispose;
mod run;
mod status;
mod up;

pub use action::cmd_action;
pub use dispose::cmd_dispose;
pub use run::cmd_run;
pub use status::cmd_status;
pub use up::cmd_up;

use anyhow::{Context, Result};

use fleetlab_lib::model::{Model, VariableValue};

use crate::topology;

/// Parse repeated `--set path=value` arguments into override pairs.
pub(crate) fn parse_overrides(sets: &[String]) -> Result<Vec<(String, VariableValue)>> {
  sets
    .iter()
    .map(|entry| {
      let (path, literal) = entry
        .split_once('=')
        .with_context(|| format!("Invalid --set {:?}: expected PATH=VALUE", entry))?;
      Ok((path.to_string(), VariableValue::parse(literal)))
    })
    .collect()
}

/// Build the registry and bind `name` with the CLI overrides applied.
pub(crate) fn bind_model(name: &str, sets: &[String]) -> Result<Model> {
  let overrides = parse_overrides(sets)?;
  let mut registry = topology::registry().context("Failed to build the model registry")?;
  registry
    .bind(name, &overrides)
    .with_context(|| format!("Failed to bind model {:?}", name))
}
