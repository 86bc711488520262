//! Operating stages that drive commands on remote hosts.
//!
//! [`RemoteRunner`] launches one command per selected host as a background
//! task. A joined runner registers with the run's join stage and its
//! outcome lands in the host's data; a detached runner lives until the
//! close signal fires. [`Poller`] re-runs a sampling command on an
//! interval, and [`Capture`] wraps a detached runner whose remote process
//! is killed at wind-down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::instance::unix_millis;
use crate::pipeline::stage::OperatingStage;
use crate::pipeline::{PipelineError, Run};

/// Runs one command on every selected host as a background task.
///
/// The task's outcome is recorded in the host's data under the runner's
/// label: `completed` with the command output, `failed` with the error, or
/// `interrupted` when the close signal cut it short.
#[derive(Clone)]
pub struct RemoteRunner {
  label: String,
  regions: String,
  hosts: String,
  command: String,
  joined: bool,
  kill_pattern: Option<String>,
}

impl RemoteRunner {
  pub fn new(
    label: impl Into<String>,
    regions: impl Into<String>,
    hosts: impl Into<String>,
    command: impl Into<String>,
  ) -> Self {
    Self {
      label: label.into(),
      regions: regions.into(),
      hosts: hosts.into(),
      command: command.into(),
      joined: true,
      kill_pattern: None,
    }
  }

  /// Do not register joiners; the task runs until the close signal fires.
  pub fn detached(mut self) -> Self {
    self.joined = false;
    self
  }

  /// Kill matching remote processes when the close signal interrupts the
  /// task.
  pub fn kill_pattern(mut self, pattern: impl Into<String>) -> Self {
    self.kill_pattern = Some(pattern.into());
    self
  }
}

#[async_trait]
impl OperatingStage for RemoteRunner {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_nonempty(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let remote = run.remote();
    let count = targets.len();

    for id in targets {
      let address = run.model().address(&id)?;
      let data = run.model().host(&id)?.data.clone();
      let mut close = run.close_signal()?;
      let joiner = if self.joined {
        Some(run.new_joiner(format!("{}/{}", self.label, address))?)
      } else {
        None
      };

      let label = self.label.clone();
      let command = self.command.clone();
      let kill_pattern = self.kill_pattern.clone();
      let identity = identity.clone();
      let remote = Arc::clone(&remote);

      tokio::spawn(async move {
        tokio::select! {
          _ = close.wait() => {
            if let Some(pattern) = &kill_pattern {
              match remote.kill(&identity, &address, pattern).await {
                Ok(()) => debug!(task = %label, host = %address, "remote process stopped"),
                Err(e) => warn!(task = %label, host = %address, error = %e, "failed to stop remote process"),
              }
            }
            debug!(task = %label, host = %address, "interrupted by close signal");
            data.insert(label.as_str(), serde_json::json!({ "status": "interrupted" }));
          }
          result = remote.exec(&identity, &address, &command) => match result {
            Ok(output) => {
              info!(task = %label, host = %address, "remote command completed");
              data.insert(label.as_str(), serde_json::json!({ "status": "completed", "output": output }));
            }
            Err(e) => {
              error!(task = %label, host = %address, error = %e, "remote command failed");
              data.insert(label.as_str(), serde_json::json!({ "status": "failed", "error": e.to_string() }));
            }
          },
        }
        if let Some(joiner) = joiner {
          joiner.complete();
        }
      });
    }

    info!(task = %self.label, hosts = count, "launched remote tasks");
    Ok(())
  }
}

/// Re-runs a sampling command on every selected host until the close
/// signal fires, appending each sample to the host's data.
#[derive(Clone)]
pub struct Poller {
  label: String,
  regions: String,
  hosts: String,
  command: String,
  interval: Duration,
}

impl Poller {
  pub fn new(
    label: impl Into<String>,
    regions: impl Into<String>,
    hosts: impl Into<String>,
    command: impl Into<String>,
    interval: Duration,
  ) -> Self {
    Self {
      label: label.into(),
      regions: regions.into(),
      hosts: hosts.into(),
      command: command.into(),
      interval,
    }
  }
}

#[async_trait]
impl OperatingStage for Poller {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    let targets = run.model().select_nonempty(&self.regions, &self.hosts)?;
    let identity = run.model().remote_identity()?;
    let remote = run.remote();
    let count = targets.len();

    for id in targets {
      let address = run.model().address(&id)?;
      let data = run.model().host(&id)?.data.clone();
      let mut close = run.close_signal()?;

      let label = self.label.clone();
      let command = self.command.clone();
      let identity = identity.clone();
      let remote = Arc::clone(&remote);
      let period = self.interval;

      tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        loop {
          tokio::select! {
            _ = close.wait() => break,
            _ = ticks.tick() => {
              match remote.exec(&identity, &address, &command).await {
                Ok(output) => data.append(&label, serde_json::json!({
                  "timestamp_ms": unix_millis(),
                  "output": output,
                })),
                Err(e) => error!(task = %label, host = %address, error = %e, "poll failed"),
              }
            }
          }
        }
        debug!(task = %label, host = %address, "poller stopped");
      });
    }

    info!(task = %self.label, hosts = count, interval = ?self.interval, "started pollers");
    Ok(())
  }
}

/// Long-running remote capture (a packet trace, a log tail) stopped at
/// wind-down by killing its process.
#[derive(Clone)]
pub struct Capture {
  label: String,
  regions: String,
  hosts: String,
  command: String,
  kill_pattern: String,
}

impl Capture {
  pub fn new(
    label: impl Into<String>,
    regions: impl Into<String>,
    hosts: impl Into<String>,
    command: impl Into<String>,
    kill_pattern: impl Into<String>,
  ) -> Self {
    Self {
      label: label.into(),
      regions: regions.into(),
      hosts: hosts.into(),
      command: command.into(),
      kill_pattern: kill_pattern.into(),
    }
  }
}

#[async_trait]
impl OperatingStage for Capture {
  async fn operate(&self, run: &mut Run<'_>) -> Result<(), PipelineError> {
    RemoteRunner::new(
      self.label.clone(),
      self.regions.clone(),
      self.hosts.clone(),
      self.command.clone(),
    )
    .detached()
    .kill_pattern(self.kill_pattern.clone())
    .operate(run)
    .await
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;
  use tokio::time::timeout;

  use super::*;
  use crate::instance::InstanceStore;
  use crate::operation::stages::JoinerStage;
  use crate::pipeline::{Phase, operating_binder};
  use crate::util::testutil::{FakeRemote, expressed_model};

  fn temp_store() -> (TempDir, InstanceStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = InstanceStore::new(temp_dir.path().to_path_buf());
    (temp_dir, store)
  }

  async fn wait_until(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(1), async {
      while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
  }

  /// Operating stage that just keeps the phase open for a while.
  #[derive(Clone)]
  struct Dwell(Duration);

  #[async_trait]
  impl OperatingStage for Dwell {
    async fn operate(&self, _run: &mut Run<'_>) -> Result<(), PipelineError> {
      tokio::time::sleep(self.0).await;
      Ok(())
    }
  }

  #[tokio::test]
  async fn joined_runner_records_completion() {
    let (_temp, store) = temp_store();
    let remote = Arc::new(FakeRemote::new());
    let mut model = expressed_model();
    model
      .operation
      .push(operating_binder(RemoteRunner::new("bench", "west", "@client", "run-bench")));
    model.operation.push(operating_binder(JoinerStage));

    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();
    run.run_operation().await.unwrap();
    drop(run);

    let execs = remote.calls_of("exec");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].host, "10.0.0.3");
    assert_eq!(execs[0].detail, "run-bench");

    let data = model.regions["west"].hosts["cli0"].data.get("bench").unwrap();
    assert_eq!(data["status"], serde_json::json!("completed"));
    assert_eq!(data["output"], serde_json::json!("ok"));
  }

  #[tokio::test]
  async fn joined_runner_records_failure() {
    let (_temp, store) = temp_store();
    let remote = Arc::new(FakeRemote::new());
    remote.fail_host("10.0.0.3");

    let mut model = expressed_model();
    model
      .operation
      .push(operating_binder(RemoteRunner::new("bench", "west", "@client", "run-bench")));
    model.operation.push(operating_binder(JoinerStage));

    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();
    // A failed task is recorded, not fatal; the report carries the outcome.
    run.run_operation().await.unwrap();
    drop(run);

    let data = model.regions["west"].hosts["cli0"].data.get("bench").unwrap();
    assert_eq!(data["status"], serde_json::json!("failed"));
    assert!(data["error"].as_str().unwrap().contains("boom"));
  }

  #[tokio::test]
  async fn empty_selection_fails_the_stage() {
    let (_temp, store) = temp_store();
    let mut model = expressed_model();
    model
      .operation
      .push(operating_binder(RemoteRunner::new("bench", "east", "@nothing", "x")));

    let mut run = Run::new_in(&mut model, Arc::new(FakeRemote::new()), &store).unwrap();
    let result = run.run_operation().await;
    match result {
      Err(PipelineError::StageFailed {
        phase: Phase::Operation,
        index: 0,
        ..
      }) => {}
      other => panic!("expected operation stage failure, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn capture_kills_remote_process_on_close() {
    let (_temp, store) = temp_store();
    let remote = Arc::new(FakeRemote::new());
    remote.hang_host("10.0.0.1");

    let mut model = expressed_model();
    model.operation.push(operating_binder(Capture::new(
      "pcap",
      "east",
      "#svc0",
      "tcpdump -i any -w trace.pcap",
      "tcpdump",
    )));

    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();
    run.run_operation().await.unwrap();
    drop(run);

    // The phase fired the close signal on exit; the background task kills
    // the remote process and records the interruption.
    wait_until(|| remote.calls_of("kill").len() == 1).await;
    let kills = remote.calls_of("kill");
    assert_eq!(kills[0].host, "10.0.0.1");
    assert_eq!(kills[0].detail, "tcpdump");

    wait_until(|| {
      model.regions["east"].hosts["svc0"]
        .data
        .get("pcap")
        .is_some_and(|d| d["status"] == serde_json::json!("interrupted"))
    })
    .await;
  }

  #[tokio::test]
  async fn poller_samples_until_close() {
    let (_temp, store) = temp_store();
    let remote = Arc::new(FakeRemote::new());
    let mut model = expressed_model();
    model.operation.push(operating_binder(Poller::new(
      "loadavg",
      "east",
      "#svc0",
      "cat /proc/loadavg",
      Duration::from_millis(10),
    )));
    model.operation.push(operating_binder(Dwell(Duration::from_millis(60))));

    let mut run = Run::new_in(&mut model, remote.clone(), &store).unwrap();
    run.run_operation().await.unwrap();
    drop(run);

    // Let any in-flight poll land, then confirm sampling stopped.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let samples = model.regions["east"].hosts["svc0"].data.get("loadavg").unwrap();
    let count = samples.as_array().unwrap().len();
    assert!(count >= 2, "expected at least two samples, got {count}");
    assert!(samples[0]["timestamp_ms"].is_u64());
    assert_eq!(samples[0]["output"], serde_json::json!("ok"));

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after = model.regions["east"].hosts["svc0"].data.get("loadavg").unwrap();
    assert_eq!(after.as_array().unwrap().len(), count);
  }
}
