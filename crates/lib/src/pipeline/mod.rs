//! Staged pipeline runtime.
//!
//! A bound model runs through seven ordered phases:
//!
//! 1. infrastructure - machines come to exist, addresses land in the model
//! 2. configuration  - per-host configuration is rendered locally
//! 3. kitting        - the kit (binaries, configs, scripts) is assembled
//! 4. distribution   - the kit is synced onto every host
//! 5. activation     - components start
//! 6. operation      - the workload runs, coordinated by close/join signals
//! 7. disposal       - everything is torn down
//!
//! [`Run`] carries the state every stage sees: the bound model, the run
//! instance directory, the remote boundary, and (during operation only)
//! the signal hub. [`Run::run_up`] drives phases 1-5, [`Run::run_operation`]
//! drives 6, and [`Run::run_disposal`] drives 7; disposal works against a
//! fresh bind so a wedged testbed can always be destroyed.

pub mod action;
pub mod stage;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::instance::{InstanceError, InstancePaths, InstanceStore, write_model};
use crate::metrics::MetricsError;
use crate::model::{Model, ModelError, VariableError};
use crate::operation::signal::{CloseSignal, Closer, Joiner, OperationSignals, PendingJoin};
use crate::parallel::ParallelError;
use crate::provision::ProvisionError;
use crate::remote::{Remote, RemoteError};
use crate::util::fs::FsError;

pub use action::{Action, Workflow};
pub use stage::{
  ActivationBinder, ActivationStage, ConfigurationBinder, ConfigurationStage, DisposalBinder, DisposalStage,
  DistributionBinder, DistributionStage, InfrastructureBinder, InfrastructureStage, KittingBinder, KittingStage,
  OperatingBinder, OperatingStage, activation_binder, configuration_binder, disposal_binder, distribution_binder,
  infrastructure_binder, kitting_binder, operating_binder,
};

/// The seven pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Infrastructure,
  Configuration,
  Kitting,
  Distribution,
  Activation,
  Operation,
  Disposal,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Phase::Infrastructure => "infrastructure",
      Phase::Configuration => "configuration",
      Phase::Kitting => "kitting",
      Phase::Distribution => "distribution",
      Phase::Activation => "activation",
      Phase::Operation => "operation",
      Phase::Disposal => "disposal",
    };
    f.write_str(name)
  }
}

/// Errors from pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
  /// Runs require a bound model.
  #[error("model is not bound")]
  NotBound,

  #[error("model error: {0}")]
  Model(#[from] ModelError),

  #[error("variable error: {0}")]
  Variable(#[from] VariableError),

  #[error("remote error: {0}")]
  Remote(#[from] RemoteError),

  #[error("provision error: {0}")]
  Provision(#[from] ProvisionError),

  #[error("metrics error: {0}")]
  Metrics(#[from] MetricsError),

  #[error("instance error: {0}")]
  Instance(#[from] InstanceError),

  #[error("filesystem error: {0}")]
  Fs(#[from] FsError),

  /// A bounded-concurrency batch of remote tasks failed.
  #[error("parallel execution failed: {0}")]
  Parallel(#[from] ParallelError<RemoteError>),

  /// A stage failed; `index` is its position in the phase's stage list.
  #[error("{phase} stage {index} failed")]
  StageFailed {
    phase: Phase,
    index: usize,
    #[source]
    source: Box<PipelineError>,
  },

  /// No workflow registered under the requested name.
  #[error("unknown action: {0}")]
  UnknownAction(String),

  /// Close/join signals exist only while the operation phase runs.
  #[error("operation signals are only available during the operation phase")]
  NotOperating,

  /// Escape hatch for custom stage and action code.
  #[error("{0}")]
  Other(Box<dyn std::error::Error + Send + Sync>),
}

impl PipelineError {
  /// Wrap an arbitrary error from custom stage or action code.
  pub fn other(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
    Self::Other(e.into())
  }
}

fn stage_failed(phase: Phase, index: usize, source: PipelineError) -> PipelineError {
  error!(phase = %phase, index, error = %source, "stage failed");
  PipelineError::StageFailed {
    phase,
    index,
    source: Box::new(source),
  }
}

/// Per-run state shared across all stages of a pipeline run.
pub struct Run<'m> {
  model: &'m mut Model,
  id: String,
  paths: InstancePaths,
  remote: Arc<dyn Remote>,
  signals: Option<OperationSignals>,
}

impl<'m> Run<'m> {
  /// Start a new run for a bound model, creating its instance directory
  /// in the default store.
  pub fn new(model: &'m mut Model, remote: Arc<dyn Remote>) -> Result<Self, PipelineError> {
    Self::new_in(model, remote, &InstanceStore::default_store())
  }

  /// Start a new run with its instance directory in `store`.
  pub fn new_in(model: &'m mut Model, remote: Arc<dyn Remote>, store: &InstanceStore) -> Result<Self, PipelineError> {
    if !model.is_bound() {
      return Err(PipelineError::NotBound);
    }
    let (id, paths) = store.create(&model.id)?;
    info!(run = %id, model = %model.id, "created run instance");
    Ok(Self {
      model,
      id,
      paths,
      remote,
      signals: None,
    })
  }

  /// Attach to an existing run in the default store.
  pub fn resume(model: &'m mut Model, remote: Arc<dyn Remote>, id: &str) -> Result<Self, PipelineError> {
    Self::resume_in(model, remote, id, &InstanceStore::default_store())
  }

  /// Attach to an existing run in `store`.
  ///
  /// When the run has a persisted `model.json`, its expressed host state
  /// (addresses, accumulated data) is absorbed into `model`, so a fresh
  /// bind can pick up where an earlier process left off.
  pub fn resume_in(
    model: &'m mut Model,
    remote: Arc<dyn Remote>,
    id: &str,
    store: &InstanceStore,
  ) -> Result<Self, PipelineError> {
    if !model.is_bound() {
      return Err(PipelineError::NotBound);
    }
    let paths = store.paths(id)?;
    if paths.model_file().is_file() {
      let dump = store.load_model_value(id)?;
      model.absorb_state(&dump);
      debug!(run = %id, "absorbed persisted host state");
    }
    Ok(Self {
      model,
      id: id.to_string(),
      paths,
      remote,
      signals: None,
    })
  }

  pub fn model(&self) -> &Model {
    self.model
  }

  pub fn model_mut(&mut self) -> &mut Model {
    self.model
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn paths(&self) -> &InstancePaths {
    &self.paths
  }

  pub fn remote(&self) -> Arc<dyn Remote> {
    Arc::clone(&self.remote)
  }

  /// Closer for the operation in progress.
  pub fn closer(&self) -> Result<Closer, PipelineError> {
    match &self.signals {
      Some(signals) => Ok(signals.closer()),
      None => Err(PipelineError::NotOperating),
    }
  }

  /// A close signal endpoint for a background task.
  pub fn close_signal(&self) -> Result<CloseSignal, PipelineError> {
    match &self.signals {
      Some(signals) => Ok(signals.close_signal()),
      None => Err(PipelineError::NotOperating),
    }
  }

  /// Register a background task the join stage must wait for.
  pub fn new_joiner(&mut self, label: impl Into<String>) -> Result<Joiner, PipelineError> {
    match &mut self.signals {
      Some(signals) => Ok(signals.new_joiner(label)),
      None => Err(PipelineError::NotOperating),
    }
  }

  /// Take every pending join registered so far.
  pub fn take_joiners(&mut self) -> Result<Vec<PendingJoin>, PipelineError> {
    match &mut self.signals {
      Some(signals) => Ok(signals.take_joiners()),
      None => Err(PipelineError::NotOperating),
    }
  }

  /// Refresh the on-disk model dump.
  pub fn persist_model(&self) -> Result<PathBuf, PipelineError> {
    Ok(write_model(&self.paths, self.model)?)
  }

  /// Drive the five build-out phases in order, stopping at the first
  /// failure.
  pub async fn run_up(&mut self) -> Result<(), PipelineError> {
    self.run_infrastructure().await?;
    // Addresses landed in the model; keep the dump current from here on.
    self.persist_model()?;
    self.run_configuration().await?;
    self.run_kitting().await?;
    self.run_distribution().await?;
    self.run_activation().await?;
    self.persist_model()?;
    Ok(())
  }

  /// Drive the operation phase.
  ///
  /// Installs the signal hub, runs the operating stages in list order, and
  /// fires the close signal on the way out (success or failure) so no
  /// background task outlives the phase.
  pub async fn run_operation(&mut self) -> Result<(), PipelineError> {
    self.signals = Some(OperationSignals::new());
    let result = self.run_operating_stages().await;
    if let Some(signals) = self.signals.take() {
      signals.closer().close();
    }
    result
  }

  /// Drive the disposal phase against the current model.
  pub async fn run_disposal(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.disposal.clone();
    info!(phase = %Phase::Disposal, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .dispose(self)
        .await
        .map_err(|e| stage_failed(Phase::Disposal, index, e))?;
    }
    Ok(())
  }

  /// Run the named workflow.
  pub async fn run_action(&mut self, name: &str) -> Result<(), PipelineError> {
    let Some(workflow) = self.model.actions.remove(name) else {
      return Err(PipelineError::UnknownAction(name.to_string()));
    };
    info!(action = name, "running action");
    let result = workflow.execute(self).await;
    self.model.actions.insert(name.to_string(), workflow);
    result
  }

  async fn run_infrastructure(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.infrastructure.clone();
    info!(phase = %Phase::Infrastructure, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .express(self)
        .await
        .map_err(|e| stage_failed(Phase::Infrastructure, index, e))?;
    }
    Ok(())
  }

  async fn run_configuration(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.configuration.clone();
    info!(phase = %Phase::Configuration, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .configure(self)
        .await
        .map_err(|e| stage_failed(Phase::Configuration, index, e))?;
    }
    Ok(())
  }

  async fn run_kitting(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.kitting.clone();
    info!(phase = %Phase::Kitting, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage.kit(self).await.map_err(|e| stage_failed(Phase::Kitting, index, e))?;
    }
    Ok(())
  }

  async fn run_distribution(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.distribution.clone();
    info!(phase = %Phase::Distribution, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .distribute(self)
        .await
        .map_err(|e| stage_failed(Phase::Distribution, index, e))?;
    }
    Ok(())
  }

  async fn run_activation(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.activation.clone();
    info!(phase = %Phase::Activation, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .activate(self)
        .await
        .map_err(|e| stage_failed(Phase::Activation, index, e))?;
    }
    Ok(())
  }

  async fn run_operating_stages(&mut self) -> Result<(), PipelineError> {
    let binders = self.model.operation.clone();
    info!(phase = %Phase::Operation, stages = binders.len(), "running phase");
    for (index, binder) in binders.into_iter().enumerate() {
      let stage = (*binder)(self.model);
      stage
        .operate(self)
        .await
        .map_err(|e| stage_failed(Phase::Operation, index, e))?;
    }
    Ok(())
  }
}
