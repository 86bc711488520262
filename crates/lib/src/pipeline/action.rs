//! Named workflows: sequences of pipeline work invocable by name once a
//! run is up (`fleet start`, `fleet metrics`, ...), plus the standard
//! actions workflows are composed from.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::stage::{ActivationStage, DisposalStage};
use super::{PipelineError, Run};
use crate::metrics::{MetricsSource, fold_event};
use crate::stages::activation::{StartComponents, StopComponents};
use crate::util::fs::write_atomic;

/// Report file name within a run directory.
pub const REPORT_FILENAME: &str = "report.json";

/// One unit of invocable pipeline work.
#[async_trait]
pub trait Action: Send + Sync {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// A named sequence of actions, executed in order, stopping at the first
/// failure.
#[derive(Default)]
pub struct Workflow {
  steps: Vec<Box<dyn Action>>,
}

impl Workflow {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a step.
  pub fn then(mut self, action: impl Action + 'static) -> Self {
    self.steps.push(Box::new(action));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }
}

impl std::fmt::Debug for Workflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workflow").field("steps", &self.steps.len()).finish()
  }
}

#[async_trait]
impl Action for Workflow {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    for step in &self.steps {
      step.execute(run).await?;
    }
    Ok(())
  }
}

/// Run one command on every selected host, logging each host's output.
pub struct ExecHosts {
  regions: String,
  hosts: String,
  command: String,
}

impl ExecHosts {
  pub fn new(regions: impl Into<String>, hosts: impl Into<String>, command: impl Into<String>) -> Self {
    Self {
      regions: regions.into(),
      hosts: hosts.into(),
      command: command.into(),
    }
  }
}

#[async_trait]
impl Action for ExecHosts {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_hosts(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let remote = run.remote();
    for id in targets {
      let address = run.model().address(&id)?;
      let output = remote.exec(&identity, &address, &self.command).await?;
      info!(host = %id, output = %output, "command output");
    }
    Ok(())
  }
}

/// Open an interactive shell on exactly one selected host.
pub struct Console {
  regions: String,
  hosts: String,
}

impl Console {
  pub fn new(regions: impl Into<String>, hosts: impl Into<String>) -> Self {
    Self {
      regions: regions.into(),
      hosts: hosts.into(),
    }
  }
}

#[async_trait]
impl Action for Console {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let id = run.model().select_host(&self.regions, &self.hosts)?;
    let address = run.model().address(&id)?;
    let identity = run.model().remote_identity()?;
    info!(host = %id, "opening console");
    run.remote().shell(&identity, &address).await?;
    Ok(())
  }
}

/// Write a JSON report of accumulated per-host data into the run
/// directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Report;

#[async_trait]
impl Action for Report {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let mut report: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for id in run.model().all_hosts() {
      let host = run.model().host(&id)?;
      if host.data.is_empty() {
        continue;
      }
      let data: serde_json::Map<String, serde_json::Value> = host.data.snapshot().into_iter().collect();
      report.insert(id.to_string(), serde_json::Value::Object(data));
    }

    let path = run.paths().root().join(REPORT_FILENAME);
    let content = serde_json::to_string_pretty(&report).map_err(|e| PipelineError::other(Box::new(e)))?;
    write_atomic(&path, content.as_bytes())?;
    info!(path = %path.display(), hosts = report.len(), "wrote report");
    Ok(())
  }
}

/// Start every component on every host.
pub struct Activate {
  concurrency: usize,
}

impl Activate {
  pub fn new(concurrency: usize) -> Self {
    Self { concurrency }
  }
}

#[async_trait]
impl Action for Activate {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    StartComponents::new("*", "*", self.concurrency).activate(run).await
  }
}

/// Stop every component on every host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Teardown;

#[async_trait]
impl Action for Teardown {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    StopComponents::new("*", "*").dispose(run).await
  }
}

/// Subscribe to a metrics source and fold a short window of samples into
/// host data.
pub struct SampleMetrics {
  source: Arc<dyn MetricsSource>,
  window: Duration,
}

impl SampleMetrics {
  pub fn new(source: Arc<dyn MetricsSource>, window: Duration) -> Self {
    Self { source, window }
  }
}

#[async_trait]
impl Action for SampleMetrics {
  async fn execute(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let mut rx = self.source.subscribe().await?;
    let deadline = tokio::time::Instant::now() + self.window;

    let mut samples = 0usize;
    loop {
      match tokio::time::timeout_at(deadline, rx.recv()).await {
        Ok(Some(event)) => match run.model().host_by_id(&event.source) {
          Ok((_, host)) => {
            fold_event(&host.data, &event);
            samples += 1;
          }
          Err(_) => warn!(source = %event.source, "metrics event from unknown source"),
        },
        // Source closed or the window elapsed.
        Ok(None) | Err(_) => break,
      }
    }
    info!(samples, "sampled metrics");
    Ok(())
  }
}
