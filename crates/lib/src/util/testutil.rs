//! Test fixtures for fleetlab-lib.
//!
//! An in-memory [`Remote`] and metrics source plus canned models, so
//! pipeline behavior can be exercised without machines.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::metrics::{MetricsError, MetricsEvent, MetricsSource};
use crate::model::{Component, Host, Model, Region, Registry, Variable, VariableValue};
use crate::remote::{Remote, RemoteError, RemoteIdentity};

/// One recorded interaction with a [`FakeRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
  pub host: String,
  pub op: String,
  pub detail: String,
}

/// In-memory [`Remote`] that records every interaction and can be told to
/// fail for specific hosts.
#[derive(Debug, Default)]
pub struct FakeRemote {
  calls: Mutex<Vec<FakeCall>>,
  fail_counts: Mutex<HashMap<String, usize>>,
  hang_hosts: Mutex<HashSet<String>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every recorded call, in order.
  pub fn calls(&self) -> Vec<FakeCall> {
    self.calls.lock().unwrap().clone()
  }

  /// Calls of one operation kind, in order.
  pub fn calls_of(&self, op: &str) -> Vec<FakeCall> {
    self.calls.lock().unwrap().iter().filter(|c| c.op == op).cloned().collect()
  }

  /// Make every operation against `host` fail.
  pub fn fail_host(&self, host: impl Into<String>) {
    self.fail_counts.lock().unwrap().insert(host.into(), usize::MAX);
  }

  /// Make the next `times` operations against `host` fail.
  pub fn fail_host_times(&self, host: impl Into<String>, times: usize) {
    self.fail_counts.lock().unwrap().insert(host.into(), times);
  }

  /// Make `exec` against `host` record its call and then never return,
  /// standing in for a long-running remote process.
  pub fn hang_host(&self, host: impl Into<String>) {
    self.hang_hosts.lock().unwrap().insert(host.into());
  }

  fn record(&self, host: &str, op: &str, detail: &str) {
    self.calls.lock().unwrap().push(FakeCall {
      host: host.to_string(),
      op: op.to_string(),
      detail: detail.to_string(),
    });
  }

  fn should_fail(&self, host: &str) -> bool {
    let mut counts = self.fail_counts.lock().unwrap();
    match counts.get_mut(host) {
      Some(0) | None => false,
      Some(n) if *n == usize::MAX => true,
      Some(n) => {
        *n -= 1;
        true
      }
    }
  }
}

#[async_trait]
impl Remote for FakeRemote {
  async fn exec(&self, _identity: &RemoteIdentity, host: &str, command: &str) -> Result<String, RemoteError> {
    self.record(host, "exec", command);
    if self.hang_hosts.lock().unwrap().contains(host) {
      std::future::pending::<()>().await;
    }
    if self.should_fail(host) {
      return Err(RemoteError::CommandFailed {
        host: host.to_string(),
        command: command.to_string(),
        code: Some(1),
        output: "boom".to_string(),
      });
    }
    Ok("ok".to_string())
  }

  async fn kill(&self, _identity: &RemoteIdentity, host: &str, pattern: &str) -> Result<(), RemoteError> {
    self.record(host, "kill", pattern);
    if self.should_fail(host) {
      return Err(RemoteError::CommandFailed {
        host: host.to_string(),
        command: format!("kill {pattern}"),
        code: Some(2),
        output: "boom".to_string(),
      });
    }
    Ok(())
  }

  async fn shell(&self, _identity: &RemoteIdentity, host: &str) -> Result<(), RemoteError> {
    self.record(host, "shell", "");
    Ok(())
  }

  async fn sync(&self, _identity: &RemoteIdentity, host: &str, src: &Path, dst: &str) -> Result<(), RemoteError> {
    self.record(host, "sync", &format!("{} -> {}", src.display(), dst));
    if self.should_fail(host) {
      return Err(RemoteError::SyncFailed {
        host: host.to_string(),
        src: src.to_path_buf(),
        dst: dst.to_string(),
        code: Some(23),
        output: "boom".to_string(),
      });
    }
    Ok(())
  }
}

/// Metrics source that replays canned events and then closes.
pub struct FakeMetricsSource {
  events: Mutex<Vec<MetricsEvent>>,
}

impl FakeMetricsSource {
  pub fn new(events: Vec<MetricsEvent>) -> Self {
    Self {
      events: Mutex::new(events),
    }
  }
}

#[async_trait]
impl MetricsSource for FakeMetricsSource {
  async fn subscribe(&self) -> Result<mpsc::Receiver<MetricsEvent>, MetricsError> {
    let events: Vec<MetricsEvent> = self.events.lock().unwrap().clone();
    let (tx, rx) = mpsc::channel(events.len().max(1));
    for event in events {
      let _ = tx.try_send(event);
    }
    // Dropping the sender closes the stream once the events drain.
    Ok(rx)
  }
}

/// Unbound three-host model: two tagged service hosts in east, one client
/// host in west.
pub fn sample_model() -> Model {
  let mut model = Model::new()
    .region(
      Region::new("east", "east-1a")
        .host(
          Host::new("svc0")
            .tag("service")
            .component(Component::new("store", "fleet-store").script("./build/scripts/store.sh", "store.sh")),
        )
        .host(Host::new("svc1").tag("service").component(Component::new("cache", "fleet-cache"))),
    )
    .region(Region::new("west", "west-2b").host(Host::new("cli0").tag("client")));

  model
    .scope
    .variables
    .declare(
      "remote/username",
      Variable::new().default_value(VariableValue::String("test-user".into())),
    )
    .unwrap();
  model
    .scope
    .variables
    .declare(
      "deploy/dir",
      Variable::new().default_value(VariableValue::String("/opt/fleet".into())),
    )
    .unwrap();
  model
    .scope
    .variables
    .declare("deploy/concurrency", Variable::new().default_value(VariableValue::Int(2)))
    .unwrap();
  model
}

/// [`sample_model`] bound under the name "demo".
pub fn bound_model() -> Model {
  let mut registry = Registry::new();
  registry.register("demo", sample_model());
  registry.bind("demo", &[]).unwrap()
}

/// Bound model with addresses already expressed, as if the infrastructure
/// phase had run.
pub fn expressed_model() -> Model {
  let mut model = bound_model();
  for (index, id) in model.all_hosts().into_iter().enumerate() {
    let host = model.host_mut(&id).unwrap();
    host.public_ip = format!("10.0.0.{}", index + 1);
    host.private_ip = format!("192.168.0.{}", index + 1);
  }
  model
}
