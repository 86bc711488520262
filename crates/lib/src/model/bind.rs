//! Model registry and bind-time variable resolution.
//!
//! Topology code registers models under names; [`Registry::bind`] takes a
//! model out of the registry and makes it runnable:
//!
//! 1. bootstraps run, in registration order
//! 2. command-line overrides are put into the root scope
//! 3. the root scope resolves (put value, else declared default)
//! 4. every region/host/component scope resolves against the root,
//!    honoring the `scoped` and `global_fallback` flags, and variable
//!    binders fire on the node they resolved at
//!
//! A required variable still unresolved after its node's walk aborts the
//! bind, so no phase ever runs against a half-configured model.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info};

use super::variables::{Variable, VariableError, VariableValue, Variables};
use super::{Component, Host, Model, Region};
use crate::consts::VAR_ENV_PREFIX;

/// Errors from registering and binding models.
#[derive(Debug, Error)]
pub enum BindError {
  /// No model registered under the requested name.
  #[error("unknown model: {0}")]
  UnknownModel(String),

  /// A required variable resolved to nothing.
  #[error("required variable {path} unresolved at {node}")]
  RequiredUnresolved { node: String, path: String },

  /// A bootstrap hook failed.
  #[error("bootstrap {name} failed")]
  Bootstrap {
    name: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// An override or bootstrap wrote an invalid variable path.
  #[error("variable error: {0}")]
  Variable(#[from] VariableError),
}

/// The model node a variable resolved at, handed to its binder.
///
/// The node's own variable tree is detached while binders run; binders
/// mutate node fields (addresses, instance types, component wiring), not
/// the variable store.
pub enum BoundNode<'a> {
  Model(&'a mut Model),
  Region(&'a mut Region),
  Host(&'a mut Host),
  Component(&'a mut Component),
}

/// Bind-time hook that may mutate a model before variable resolution.
///
/// Bootstraps run in registration order and can put variable values or
/// rewrite topology, for example generating hosts from a count.
pub trait Bootstrap: Send + Sync {
  fn name(&self) -> &str {
    "bootstrap"
  }

  fn bootstrap(&mut self, model: &mut Model) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Bootstrap that imports `FLEETLAB_VAR_`-prefixed environment variables
/// into the root scope. Double underscores in the variable name become
/// namespace separators.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvVars;

impl Bootstrap for EnvVars {
  fn name(&self) -> &str {
    "env-vars"
  }

  fn bootstrap(&mut self, model: &mut Model) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for (key, value) in std::env::vars() {
      let Some(rest) = key.strip_prefix(VAR_ENV_PREFIX) else {
        continue;
      };
      if rest.is_empty() {
        continue;
      }
      let path = rest.replace("__", "/");
      debug!(path = %path, "importing variable from environment");
      model.scope.variables.put(&path, VariableValue::parse(&value))?;
    }
    Ok(())
  }
}

/// Named collection of registered models.
#[derive(Default)]
pub struct Registry {
  models: BTreeMap<String, Model>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `model` under `name`, replacing any previous registration.
  pub fn register(&mut self, name: impl Into<String>, model: Model) {
    self.models.insert(name.into(), model);
  }

  /// Registered model names, in order.
  pub fn names(&self) -> Vec<&str> {
    self.models.keys().map(String::as_str).collect()
  }

  /// Take the model registered under `name` and bind it.
  ///
  /// `overrides` are (path, value) pairs put into the root scope before
  /// resolution, so they win over declared defaults everywhere. On success
  /// the returned model is stamped with `name` and marked bound.
  pub fn bind(&mut self, name: &str, overrides: &[(String, VariableValue)]) -> Result<Model, BindError> {
    let mut model = self
      .models
      .remove(name)
      .ok_or_else(|| BindError::UnknownModel(name.to_string()))?;

    // 1. bootstraps
    let mut bootstraps = std::mem::take(&mut model.bootstraps);
    for bootstrap in &mut bootstraps {
      debug!(name = bootstrap.name(), "running bootstrap");
      bootstrap.bootstrap(&mut model).map_err(|source| BindError::Bootstrap {
        name: bootstrap.name().to_string(),
        source,
      })?;
    }

    // 2. overrides
    for (path, value) in overrides {
      debug!(path = %path, "applying override");
      model.scope.variables.put(path, value.clone())?;
    }

    // 3. root scope; at the root there is nothing to fall back to
    let mut vars = std::mem::take(&mut model.scope.variables);
    let result = resolve_node("model", &mut vars, None, &mut BoundNode::Model(&mut model));
    model.scope.variables = vars;
    result?;

    // 4. nested scopes resolve against the root as it stands now
    let globals = model.scope.variables.clone();
    for region in model.regions.values_mut() {
      let region_label = format!("region {}", region.id);
      let mut vars = std::mem::take(&mut region.scope.variables);
      let result = resolve_node(&region_label, &mut vars, Some(&globals), &mut BoundNode::Region(&mut *region));
      region.scope.variables = vars;
      result?;

      let region_id = region.id.clone();
      for host in region.hosts.values_mut() {
        let host_label = format!("host {}/{}", region_id, host.id);
        let mut vars = std::mem::take(&mut host.scope.variables);
        let result = resolve_node(&host_label, &mut vars, Some(&globals), &mut BoundNode::Host(&mut *host));
        host.scope.variables = vars;
        result?;

        let host_id = host.id.clone();
        for component in host.components.values_mut() {
          let label = format!("component {}/{}/{}", region_id, host_id, component.id);
          let mut vars = std::mem::take(&mut component.scope.variables);
          let result = resolve_node(&label, &mut vars, Some(&globals), &mut BoundNode::Component(&mut *component));
          component.scope.variables = vars;
          result?;
        }
      }
    }

    model.id = name.to_string();
    model.mark_bound();
    info!(model = name, hosts = model.all_hosts().len(), "bound model");
    Ok(model)
  }
}

/// Resolve every leaf in `vars` at one node and fire its binder.
///
/// Precedence: a put value wins; otherwise `scoped` leaves take their
/// declared default and then, with `global_fallback`, the root value, while
/// unscoped leaves take the root value and then their declared default.
fn resolve_node(
  label: &str,
  vars: &mut Variables,
  globals: Option<&Variables>,
  node: &mut BoundNode<'_>,
) -> Result<(), BindError> {
  let mut failure: Option<BindError> = None;
  vars.for_each_leaf_mut(&mut |path: &str, var: &mut Variable| {
    if failure.is_some() {
      return;
    }
    if var.value.is_none() {
      var.value = match globals {
        None => var.default.clone(),
        Some(globals) if var.scoped => {
          let mut resolved = var.default.clone();
          if resolved.is_none() && var.global_fallback {
            resolved = globals.get(path).cloned();
          }
          resolved
        }
        Some(globals) => globals.get(path).cloned().or_else(|| var.default.clone()),
      };
    }
    if var.required && var.value.is_none() {
      failure = Some(BindError::RequiredUnresolved {
        node: label.to_string(),
        path: path.to_string(),
      });
      return;
    }
    if let Some(value) = &var.value {
      if let Some(binder) = &var.binder {
        binder(value, node);
      }
      debug!(node = label, path = path, value = %var.render(), "resolved variable");
    }
  });
  match failure {
    Some(err) => Err(err),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use serial_test::serial;

  use super::*;
  use crate::pipeline::InfrastructureStage;
  use crate::stages::infrastructure::Provision;

  fn two_host_model() -> Model {
    Model::new().region(Region::new("east", "east-1a").host(Host::new("a")).host(Host::new("b")))
  }

  #[test]
  fn bind_unknown_model() {
    let mut registry = Registry::new();
    let result = registry.bind("nope", &[]);
    assert!(matches!(result, Err(BindError::UnknownModel(name)) if name == "nope"));
  }

  #[test]
  fn bind_stamps_name_and_marks_bound() {
    let mut registry = Registry::new();
    registry.register("demo", two_host_model());

    let model = registry.bind("demo", &[]).unwrap();
    assert_eq!(model.id, "demo");
    assert!(model.is_bound());
    // The model was taken out of the registry.
    assert!(matches!(registry.bind("demo", &[]), Err(BindError::UnknownModel(_))));
  }

  #[test]
  fn required_without_value_aborts_bind() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("remote/username", Variable::new().required())
      .unwrap();

    // A failed bind must abort before any stage gets constructed.
    let constructions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&constructions);
    model
      .infrastructure
      .push(Arc::new(move |_: &Model| -> Box<dyn InfrastructureStage> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::new(Provision)
      }));

    let mut registry = Registry::new();
    registry.register("demo", model);

    let result = registry.bind("demo", &[]);
    match result {
      Err(BindError::RequiredUnresolved { node, path }) => {
        assert_eq!(node, "model");
        assert_eq!(path, "remote/username");
      }
      other => panic!("expected RequiredUnresolved, got {other:?}"),
    }
    assert_eq!(constructions.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn override_satisfies_required() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("remote/username", Variable::new().required())
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);

    let overrides = vec![("remote/username".to_string(), VariableValue::String("ubuntu".into()))];
    let model = registry.bind("demo", &overrides).unwrap();
    assert_eq!(model.var_string("remote/username").unwrap(), "ubuntu");
  }

  #[test]
  fn defaults_apply_and_overrides_win() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("net/port", Variable::new().default_value(VariableValue::Int(8080)))
      .unwrap();
    model
      .scope
      .variables
      .declare("net/proto", Variable::new().default_value(VariableValue::String("tcp".into())))
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);

    let overrides = vec![("net/port".to_string(), VariableValue::Int(9000))];
    let model = registry.bind("demo", &overrides).unwrap();
    assert_eq!(model.var_int("net/port").unwrap(), 9000);
    assert_eq!(model.var_string("net/proto").unwrap(), "tcp");
  }

  #[test]
  fn scoped_with_global_fallback_prefers_local_put() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("bench/rate", Variable::new().default_value(VariableValue::Int(100)))
      .unwrap();
    for host in ["a", "b"] {
      model
        .regions
        .get_mut("east")
        .unwrap()
        .hosts
        .get_mut(host)
        .unwrap()
        .scope
        .variables
        .declare("bench/rate", Variable::new().global_fallback())
        .unwrap();
    }
    // Host-level override on one host only.
    model
      .regions
      .get_mut("east")
      .unwrap()
      .hosts
      .get_mut("a")
      .unwrap()
      .scope
      .variables
      .put("bench/rate", VariableValue::Int(500))
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);
    let model = registry.bind("demo", &[]).unwrap();

    let host_a = &model.regions["east"].hosts["a"];
    let host_b = &model.regions["east"].hosts["b"];
    assert_eq!(host_a.scope.variables.get("bench/rate"), Some(&VariableValue::Int(500)));
    assert_eq!(host_b.scope.variables.get("bench/rate"), Some(&VariableValue::Int(100)));
  }

  #[test]
  fn scoped_without_fallback_ignores_root() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("bench/rate", Variable::new().default_value(VariableValue::Int(100)))
      .unwrap();
    model
      .regions
      .get_mut("east")
      .unwrap()
      .hosts
      .get_mut("a")
      .unwrap()
      .scope
      .variables
      .declare("bench/rate", Variable::new().default_value(VariableValue::Int(7)))
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);
    let model = registry.bind("demo", &[]).unwrap();

    let host_a = &model.regions["east"].hosts["a"];
    assert_eq!(host_a.scope.variables.get("bench/rate"), Some(&VariableValue::Int(7)));
  }

  #[test]
  fn unscoped_reads_root_over_local_default() {
    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("deploy/dir", Variable::new().default_value(VariableValue::String("/opt/fleet".into())))
      .unwrap();
    model
      .regions
      .get_mut("east")
      .unwrap()
      .hosts
      .get_mut("a")
      .unwrap()
      .scope
      .variables
      .declare(
        "deploy/dir",
        Variable::new()
          .unscoped()
          .default_value(VariableValue::String("/tmp/elsewhere".into())),
      )
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);
    let model = registry.bind("demo", &[]).unwrap();

    let host_a = &model.regions["east"].hosts["a"];
    assert_eq!(
      host_a.scope.variables.get("deploy/dir"),
      Some(&VariableValue::String("/opt/fleet".into()))
    );
  }

  #[test]
  fn binder_mutates_resolved_node() {
    let mut model = two_host_model();
    model
      .regions
      .get_mut("east")
      .unwrap()
      .hosts
      .get_mut("a")
      .unwrap()
      .scope
      .variables
      .declare(
        "host/instance_type",
        Variable::new()
          .default_value(VariableValue::String("t3.large".into()))
          .binder(|value, node| {
            if let BoundNode::Host(host) = node {
              host.instance_type = value.as_str().unwrap_or_default().to_string();
            }
          }),
      )
      .unwrap();

    let mut registry = Registry::new();
    registry.register("demo", model);
    let model = registry.bind("demo", &[]).unwrap();

    assert_eq!(model.regions["east"].hosts["a"].instance_type, "t3.large");
    assert_eq!(model.regions["east"].hosts["b"].instance_type, "");
  }

  #[test]
  fn bootstraps_run_before_resolution() {
    struct SetUsername;

    impl Bootstrap for SetUsername {
      fn name(&self) -> &str {
        "set-username"
      }

      fn bootstrap(&mut self, model: &mut Model) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        model
          .scope
          .variables
          .put("remote/username", VariableValue::String("ec2-user".into()))?;
        Ok(())
      }
    }

    let mut model = two_host_model();
    model
      .scope
      .variables
      .declare("remote/username", Variable::new().required())
      .unwrap();
    model.bootstraps.push(Box::new(SetUsername));

    let mut registry = Registry::new();
    registry.register("demo", model);

    let model = registry.bind("demo", &[]).unwrap();
    assert_eq!(model.var_string("remote/username").unwrap(), "ec2-user");
  }

  #[test]
  fn bootstrap_failure_aborts_bind() {
    struct Broken;

    impl Bootstrap for Broken {
      fn name(&self) -> &str {
        "broken"
      }

      fn bootstrap(&mut self, _model: &mut Model) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("no topology file".into())
      }
    }

    let mut model = two_host_model();
    model.bootstraps.push(Box::new(Broken));

    let mut registry = Registry::new();
    registry.register("demo", model);

    let result = registry.bind("demo", &[]);
    assert!(matches!(result, Err(BindError::Bootstrap { name, .. }) if name == "broken"));
  }

  #[test]
  #[serial]
  fn env_vars_bootstrap_imports_prefixed() {
    temp_env::with_vars(
      [
        ("FLEETLAB_VAR_remote__key_path", Some("/tmp/fleet.pem")),
        ("FLEETLAB_VAR_bench__rate", Some("250")),
      ],
      || {
        let mut model = two_host_model();
        model.bootstraps.push(Box::new(EnvVars));

        let mut registry = Registry::new();
        registry.register("demo", model);
        let model = registry.bind("demo", &[]).unwrap();

        assert_eq!(
          model.var_string("remote/key_path").unwrap(),
          "/tmp/fleet.pem".to_string()
        );
        assert_eq!(model.var_int("bench/rate").unwrap(), 250);
      },
    );
  }
}
