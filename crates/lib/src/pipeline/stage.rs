//! Stage traits for each pipeline phase.
//!
//! A model carries *binders* rather than stage instances: a binder is a
//! pure factory producing a fresh stage from the bound model each time a
//! phase runs, so re-running a phase never observes leftover stage state.

use std::sync::Arc;

use async_trait::async_trait;

use super::{PipelineError, Run};
use crate::model::Model;

/// Expresses infrastructure: provisions machines and writes their
/// addresses back into the model.
#[async_trait]
pub trait InfrastructureStage: Send + Sync {
  async fn express(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Renders per-host configuration into the run's cfg tree.
#[async_trait]
pub trait ConfigurationStage: Send + Sync {
  async fn configure(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Assembles the kit: the artifact tree later synced to every host.
#[async_trait]
pub trait KittingStage: Send + Sync {
  async fn kit(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Pushes the kit onto hosts.
#[async_trait]
pub trait DistributionStage: Send + Sync {
  async fn distribute(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Brings components on hosts to life.
#[async_trait]
pub trait ActivationStage: Send + Sync {
  async fn activate(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Runs the workload; may spawn background tasks coordinated through the
/// run's close signal and joiners.
#[async_trait]
pub trait OperatingStage: Send + Sync {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

/// Tears the testbed down. Must work against a freshly bound model, with
/// no earlier phase having run in this process.
#[async_trait]
pub trait DisposalStage: Send + Sync {
  async fn dispose(&self, run: &mut Run<'_>) -> Result<(), PipelineError>;
}

pub type InfrastructureBinder = Arc<dyn Fn(&Model) -> Box<dyn InfrastructureStage> + Send + Sync>;
pub type ConfigurationBinder = Arc<dyn Fn(&Model) -> Box<dyn ConfigurationStage> + Send + Sync>;
pub type KittingBinder = Arc<dyn Fn(&Model) -> Box<dyn KittingStage> + Send + Sync>;
pub type DistributionBinder = Arc<dyn Fn(&Model) -> Box<dyn DistributionStage> + Send + Sync>;
pub type ActivationBinder = Arc<dyn Fn(&Model) -> Box<dyn ActivationStage> + Send + Sync>;
pub type OperatingBinder = Arc<dyn Fn(&Model) -> Box<dyn OperatingStage> + Send + Sync>;
pub type DisposalBinder = Arc<dyn Fn(&Model) -> Box<dyn DisposalStage> + Send + Sync>;

/// Wrap a pre-configured stage as a binder that ignores the model.
pub fn infrastructure_binder<S>(stage: S) -> InfrastructureBinder
where
  S: InfrastructureStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn configuration_binder<S>(stage: S) -> ConfigurationBinder
where
  S: ConfigurationStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn kitting_binder<S>(stage: S) -> KittingBinder
where
  S: KittingStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn distribution_binder<S>(stage: S) -> DistributionBinder
where
  S: DistributionStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn activation_binder<S>(stage: S) -> ActivationBinder
where
  S: ActivationStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn operating_binder<S>(stage: S) -> OperatingBinder
where
  S: OperatingStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}

pub fn disposal_binder<S>(stage: S) -> DisposalBinder
where
  S: DisposalStage + Clone + 'static,
{
  Arc::new(move |_| Box::new(stage.clone()))
}
