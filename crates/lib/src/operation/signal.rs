//! Close and join synchronization for the operation phase.
//!
//! Operating stages spawn background tasks against remote hosts. Two
//! primitives coordinate their lifecycle:
//!
//! - [`Closer`] broadcasts a one-way wind-down signal; every background
//!   task holds a [`CloseSignal`] and leaves its loop when it fires.
//! - [`Joiner`] marks a task whose natural completion the run must wait
//!   for; the join stage awaits every registered [`PendingJoin`] before
//!   later stages run.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Broadcasts the wind-down signal to background tasks.
///
/// Cloneable; closing any clone closes them all, and closing twice is a
/// no-op.
#[derive(Debug, Clone)]
pub struct Closer {
  tx: Arc<watch::Sender<bool>>,
}

impl Closer {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  /// Fire the signal. Idempotent.
  pub fn close(&self) {
    let already_closed = self.tx.send_replace(true);
    if !already_closed {
      debug!("close signal fired");
    }
  }

  pub fn is_closed(&self) -> bool {
    *self.tx.borrow()
  }

  /// A new signal endpoint for a background task.
  pub fn signal(&self) -> CloseSignal {
    CloseSignal {
      rx: self.tx.subscribe(),
    }
  }
}

impl Default for Closer {
  fn default() -> Self {
    Self::new()
  }
}

/// Task-side endpoint of a [`Closer`].
#[derive(Debug, Clone)]
pub struct CloseSignal {
  rx: watch::Receiver<bool>,
}

impl CloseSignal {
  /// Wait until the close signal fires; returns immediately if it already
  /// has. A dropped [`Closer`] counts as closed.
  pub async fn wait(&mut self) {
    let _ = self.rx.wait_for(|closed| *closed).await;
  }

  pub fn is_closed(&self) -> bool {
    *self.rx.borrow()
  }
}

/// Completion handle held by a background task the run must wait for.
///
/// Dropping the joiner, including by panic, also releases the waiter, so a
/// crashed task can never hang the join stage.
#[derive(Debug)]
pub struct Joiner {
  label: String,
  tx: oneshot::Sender<()>,
}

impl Joiner {
  /// Mark the task complete.
  pub fn complete(self) {
    debug!(task = %self.label, "task complete");
    let _ = self.tx.send(());
  }
}

/// Waiter side of a [`Joiner`].
#[derive(Debug)]
pub struct PendingJoin {
  label: String,
  rx: oneshot::Receiver<()>,
}

impl PendingJoin {
  pub fn label(&self) -> &str {
    &self.label
  }

  /// Wait for the task to complete or drop its joiner.
  pub async fn wait(self) {
    let _ = self.rx.await;
  }
}

/// Signal hub installed on a run for the duration of the operation phase.
#[derive(Debug, Default)]
pub struct OperationSignals {
  closer: Closer,
  pending: Vec<PendingJoin>,
}

impl OperationSignals {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn closer(&self) -> Closer {
    self.closer.clone()
  }

  pub fn close_signal(&self) -> CloseSignal {
    self.closer.signal()
  }

  /// Register a background task the join stage must wait for.
  pub fn new_joiner(&mut self, label: impl Into<String>) -> Joiner {
    let label = label.into();
    let (tx, rx) = oneshot::channel();
    self.pending.push(PendingJoin {
      label: label.clone(),
      rx,
    });
    Joiner { label, tx }
  }

  /// Take every pending join registered so far.
  pub fn take_joiners(&mut self) -> Vec<PendingJoin> {
    std::mem::take(&mut self.pending)
  }
}
