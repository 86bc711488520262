//! Built-in demo topology.
//!
//! One compact two-region testbed: a store/cache pair in `east` and a
//! bench client in `west`, wired with the standard phase stages and the
//! six named workflows the CLI exposes. The root scope declares every
//! knob worth overriding from the command line
//! (`--set deploy/dir=/srv/fleet`) or the environment
//! (`FLEETLAB_VAR_remote__key_path=...`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fleetlab_lib::metrics::TcpMetricsSource;
use fleetlab_lib::model::{
  Component, EnvVars, Host, Model, Region, Registry, Variable, VariableError, VariableValue,
};
use fleetlab_lib::operation::{CloserStage, JoinerStage, MetricsListener, Persist, Poller, RemoteRunner};
use fleetlab_lib::pipeline::action::{Activate, Console, ExecHosts, Report, SampleMetrics, Teardown};
use fleetlab_lib::pipeline::{
  Action, ActivationStage, DistributionStage, OperatingStage, PipelineError, Run, Workflow, configuration_binder,
  disposal_binder, infrastructure_binder, kitting_binder, operating_binder,
};
use fleetlab_lib::stages::activation::{StartComponents, StopComponents};
use fleetlab_lib::stages::configuration::StageConfigs;
use fleetlab_lib::stages::distribution::SyncHosts;
use fleetlab_lib::stages::infrastructure::{Destroy, Provision, WaitForHosts};
use fleetlab_lib::stages::kitting::BuildKit;

const DEFAULT_DEPLOY_DIR: &str = "~/fleetlab";
const DEFAULT_CONCURRENCY: i64 = 4;
const DEFAULT_METRICS_ENDPOINT: &str = "127.0.0.1:9100";

/// All models this binary knows how to bind.
pub fn registry() -> Result<Registry, VariableError> {
  let mut registry = Registry::new();
  registry.register("demo", demo()?);
  Ok(registry)
}

fn demo() -> Result<Model, VariableError> {
  let mut model = Model::new()
    .region(
      Region::new("east", "us-east-1a")
        .host(
          Host::new("svc0")
            .tag("service")
            .instance_type("m5.large")
            .component(
              Component::new("store", "fleet-store")
                .config("./build/cfg/store.toml", "store.toml")
                .script("./build/scripts/store.sh", "store.sh"),
            ),
        )
        .host(
          Host::new("svc1")
            .tag("service")
            .instance_type("m5.large")
            .component(
              Component::new("cache", "fleet-cache")
                .config("./build/cfg/cache.toml", "cache.toml")
                .script("./build/scripts/cache.sh", "cache.sh"),
            ),
        ),
    )
    .region(
      Region::new("west", "us-west-2b").host(
        Host::new("cli0")
          .tag("client")
          .instance_type("c5.xlarge")
          .component(Component::new("bench", "fleet-bench").script("./build/scripts/bench.sh", "bench.sh")),
      ),
    );

  let vars = &mut model.scope.variables;
  vars.declare(
    "remote/username",
    Variable::new().default_value(VariableValue::String("ubuntu".into())),
  )?;
  vars.declare("remote/key_path", Variable::new())?;
  vars.declare(
    "deploy/dir",
    Variable::new().default_value(VariableValue::String(DEFAULT_DEPLOY_DIR.into())),
  )?;
  vars.declare(
    "deploy/concurrency",
    Variable::new().default_value(VariableValue::Int(DEFAULT_CONCURRENCY)),
  )?;
  vars.declare(
    "kit/bin_dir",
    Variable::new().default_value(VariableValue::String("./build/bin".into())),
  )?;
  vars.declare(
    "infra/binary",
    Variable::new().default_value(VariableValue::String("terraform".into())),
  )?;
  vars.declare(
    "metrics/endpoint",
    Variable::new().default_value(VariableValue::String(DEFAULT_METRICS_ENDPOINT.into())),
  )?;
  vars.declare(
    "metrics/window",
    Variable::new().default_value(VariableValue::Duration(Duration::from_secs(15))),
  )?;

  model.bootstraps.push(Box::new(EnvVars));

  wire_phases(&mut model);
  wire_actions(&mut model);
  Ok(model)
}

fn wire_phases(model: &mut Model) {
  model.infrastructure.push(infrastructure_binder(Provision));
  model.infrastructure.push(infrastructure_binder(WaitForHosts::default()));

  model.configuration.push(configuration_binder(StageConfigs));
  model.kitting.push(kitting_binder(BuildKit));

  model.distribution.push(Arc::new(|m: &Model| -> Box<dyn DistributionStage> {
    Box::new(SyncHosts::all(deploy_concurrency(m)))
  }));
  model.activation.push(Arc::new(|m: &Model| -> Box<dyn ActivationStage> {
    Box::new(StartComponents::new("*", "*", deploy_concurrency(m)))
  }));

  // Operating stages, in the order the runtime expects: background work
  // first, then join, close, persist.
  model.operation.push(Arc::new(|m: &Model| -> Box<dyn OperatingStage> {
    let endpoint = m
      .var_string("metrics/endpoint")
      .unwrap_or_else(|_| DEFAULT_METRICS_ENDPOINT.to_string());
    Box::new(MetricsListener::new(Arc::new(TcpMetricsSource::new(endpoint))))
  }));
  model.operation.push(operating_binder(Poller::new(
    "cpu",
    "*",
    "@service",
    "sar -u 1 1 | tail -n 1",
    Duration::from_secs(10),
  )));
  model.operation.push(Arc::new(|m: &Model| -> Box<dyn OperatingStage> {
    let dir = deploy_dir(m);
    Box::new(
      RemoteRunner::new("bench", "west", "@client", format!("cd {dir} && sh scripts/bench.sh run"))
        .kill_pattern("fleet-bench"),
    )
  }));
  model.operation.push(operating_binder(JoinerStage));
  model.operation.push(operating_binder(CloserStage));
  model.operation.push(operating_binder(Persist));

  model.disposal.push(disposal_binder(StopComponents::new("*", "*")));
  model.disposal.push(disposal_binder(Destroy));
}

fn wire_actions(model: &mut Model) {
  model.actions.insert(
    "bootstrap".to_string(),
    Workflow::new().then(ExecHosts::new(
      "east",
      "#svc0",
      format!("cd {DEFAULT_DEPLOY_DIR} && sh scripts/store.sh bootstrap"),
    )),
  );
  model.actions.insert(
    "start".to_string(),
    Workflow::new().then(Activate::new(DEFAULT_CONCURRENCY as usize)),
  );
  model.actions.insert("stop".to_string(), Workflow::new().then(Teardown));
  model
    .actions
    .insert("metrics".to_string(), Workflow::new().then(SampleWindow));
  model
    .actions
    .insert("console".to_string(), Workflow::new().then(Console::new("west", "@client")));
  model.actions.insert("report".to_string(), Workflow::new().then(Report));
}

/// Binder closures must stay infallible; the declared defaults make these
/// lookups total on a bound model.
fn deploy_concurrency(model: &Model) -> usize {
  model.var_int("deploy/concurrency").unwrap_or(DEFAULT_CONCURRENCY).max(1) as usize
}

fn deploy_dir(model: &Model) -> String {
  model
    .var_string("deploy/dir")
    .unwrap_or_else(|_| DEFAULT_DEPLOY_DIR.to_string())
}

/// Demo `metrics` step: sample the configured endpoint for the configured
/// window, then persist what was folded into host data so a later
/// `fleet report` can see it.
struct SampleWindow;

#[async_trait]
impl Action for SampleWindow {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let endpoint = run.model().var_string("metrics/endpoint")?;
    let window = run.model().var_duration("metrics/window")?;
    SampleMetrics::new(Arc::new(TcpMetricsSource::new(endpoint)), window)
      .execute(run)
      .await?;
    run.persist_model()?;
    Ok(())
  }
}
