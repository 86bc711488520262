//! Standard operating stages: join, close, persist, metrics.
//!
//! An operation list usually reads like a sentence: launch the workload
//! (a `RemoteRunner` or friends), wait for it ([`JoinerStage`]), wind the
//! background tasks down ([`CloserStage`]), and dump what accumulated
//! ([`Persist`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsSource, fold_event};
use crate::model::HostData;
use crate::pipeline::stage::OperatingStage;
use crate::pipeline::{PipelineError, Run};

/// Waits for every joiner registered by earlier stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinerStage;

#[async_trait]
impl OperatingStage for JoinerStage {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let pending = run.take_joiners()?;
    info!(tasks = pending.len(), "waiting for joined tasks");
    for join in pending {
      let label = join.label().to_string();
      join.wait().await;
      debug!(task = %label, "task joined");
    }
    Ok(())
  }
}

/// Fires the close signal, winding down every background task.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloserStage;

#[async_trait]
impl OperatingStage for CloserStage {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    run.closer()?.close();
    Ok(())
  }
}

/// Dumps the model, including accumulated host data, into the run
/// directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Persist;

#[async_trait]
impl OperatingStage for Persist {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let path = run.persist_model()?;
    info!(path = %path.display(), "persisted model");
    Ok(())
  }
}

/// Subscribes to a metrics source and folds events into host data until
/// the close signal fires or the feed ends.
///
/// Events route by their `source` field, which may be a bare host id or
/// the full `region/host` form. Unroutable events are logged and dropped;
/// a feed that cannot be subscribed to fails the stage.
#[derive(Clone)]
pub struct MetricsListener {
  source: Arc<dyn MetricsSource>,
}

impl MetricsListener {
  pub fn new(source: Arc<dyn MetricsSource>) -> Self {
    Self { source }
  }
}

#[async_trait]
impl OperatingStage for MetricsListener {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    // Subscribe before spawning so a dead feed fails the stage.
    let mut rx = self.source.subscribe().await?;
    let mut close = run.close_signal()?;

    let mut routes: BTreeMap<String, HostData> = BTreeMap::new();
    for id in run.model().all_hosts() {
      let data = run.model().host(&id)?.data.clone();
      routes.insert(id.host.clone(), data.clone());
      routes.insert(id.to_string(), data);
    }

    tokio::spawn(async move {
      let mut events = 0usize;
      loop {
        tokio::select! {
          _ = close.wait() => break,
          event = rx.recv() => match event {
            Some(event) => match routes.get(&event.source) {
              Some(data) => {
                fold_event(data, &event);
                events += 1;
              }
              None => warn!(source = %event.source, "metrics event from unknown source"),
            },
            None => {
              debug!("metrics feed ended");
              break;
            }
          },
        }
      }
      info!(events, "metrics listener stopped");
    });

    Ok(())
  }
}
