//! Bounded-concurrency execution of fallible async tasks.
//!
//! [`execute`] drives a batch of futures with a semaphore capping how many
//! run at once. Every task runs to completion even when others fail;
//! failures are collected and reported together, in task order.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Errors from a bounded-concurrency batch.
#[derive(Debug, Error)]
pub enum ParallelError<E: std::error::Error> {
  /// A concurrency limit of zero would never run anything.
  #[error("concurrency must be at least 1")]
  InvalidConcurrency,

  /// Exactly one task failed.
  #[error(transparent)]
  Task(E),

  /// Several tasks failed; failures are in task order.
  #[error("{} tasks failed: {}", .0.len(), format_failures(.0))]
  Aggregate(Vec<E>),

  /// Tasks panicked without any returning an error.
  #[error("{0} tasks panicked")]
  Panicked(usize),
}

fn format_failures<E: std::error::Error>(failures: &[E]) -> String {
  failures.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Run `tasks` with at most `concurrency` running at once.
///
/// Each task is polled exactly once to completion; results come back in
/// task order. A failing task never cancels its siblings, so a batch of
/// host operations always reports every host's outcome.
pub async fn execute<T, E, F>(tasks: Vec<F>, concurrency: usize) -> Result<Vec<T>, ParallelError<E>>
where
  F: Future<Output = Result<T, E>> + Send + 'static,
  T: Send + 'static,
  E: std::error::Error + Send + 'static,
{
  if concurrency == 0 {
    return Err(ParallelError::InvalidConcurrency);
  }

  let semaphore = Arc::new(Semaphore::new(concurrency));
  let mut join_set: JoinSet<(usize, Result<T, E>)> = JoinSet::new();
  for (index, task) in tasks.into_iter().enumerate() {
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      // The semaphore is never closed, so acquire cannot fail.
      let _permit = semaphore.acquire().await.unwrap();
      (index, task.await)
    });
  }

  let mut completed: Vec<(usize, T)> = Vec::new();
  let mut failed: Vec<(usize, E)> = Vec::new();
  let mut panicked = 0usize;
  while let Some(join_result) = join_set.join_next().await {
    match join_result {
      Ok((index, Ok(value))) => completed.push((index, value)),
      Ok((index, Err(e))) => {
        error!(index, error = %e, "task failed");
        failed.push((index, e));
      }
      Err(e) => {
        error!(error = %e, "task panicked");
        panicked += 1;
      }
    }
  }

  if !failed.is_empty() {
    failed.sort_by_key(|(index, _)| *index);
    let mut failures: Vec<E> = failed.into_iter().map(|(_, e)| e).collect();
    if failures.len() == 1 {
      return Err(ParallelError::Task(failures.remove(0)));
    }
    return Err(ParallelError::Aggregate(failures));
  }
  if panicked > 0 {
    return Err(ParallelError::Panicked(panicked));
  }

  completed.sort_by_key(|(index, _)| *index);
  Ok(completed.into_iter().map(|(_, value)| value).collect())
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use super::*;

  #[derive(Debug, Error)]
  #[error("{0}")]
  struct TestError(String);

  #[tokio::test]
  async fn runs_every_task_exactly_once() {
    for concurrency in [1, 2, 4, 8, 64] {
      let runs = Arc::new(AtomicUsize::new(0));
      let tasks: Vec<_> = (0..32)
        .map(|i| {
          let runs = Arc::clone(&runs);
          async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<usize, TestError>(i)
          }
        })
        .collect();

      let values = execute(tasks, concurrency).await.unwrap();
      assert_eq!(runs.load(Ordering::SeqCst), 32);
      assert_eq!(values, (0..32).collect::<Vec<_>>());
    }
  }

  #[tokio::test]
  async fn zero_concurrency_runs_nothing() {
    let runs = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..4)
      .map(|i| {
        let runs = Arc::clone(&runs);
        async move {
          runs.fetch_add(1, Ordering::SeqCst);
          Ok::<usize, TestError>(i)
        }
      })
      .collect();

    let result = execute(tasks, 0).await;
    assert!(matches!(result, Err(ParallelError::InvalidConcurrency)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn never_exceeds_concurrency() {
    let live = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..12)
      .map(|i| {
        let live = Arc::clone(&live);
        let high_water = Arc::clone(&high_water);
        async move {
          let now = live.fetch_add(1, Ordering::SeqCst) + 1;
          high_water.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(10)).await;
          live.fetch_sub(1, Ordering::SeqCst);
          Ok::<usize, TestError>(i)
        }
      })
      .collect();

    execute(tasks, 3).await.unwrap();
    assert!(high_water.load(Ordering::SeqCst) <= 3);
  }

  #[tokio::test]
  async fn single_failure_is_returned_directly() {
    let tasks: Vec<_> = (0..4)
      .map(|i| async move {
        if i == 2 {
          Err(TestError(format!("boom-{i}")))
        } else {
          Ok(i)
        }
      })
      .collect();

    let result = execute(tasks, 2).await;
    match result {
      Err(ParallelError::Task(e)) => assert_eq!(e.to_string(), "boom-2"),
      other => panic!("expected Task error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn failures_aggregate_in_task_order() {
    let tasks: Vec<_> = (0..6)
      .map(|i| async move {
        if i % 2 == 1 {
          Err(TestError(format!("boom-{i}")))
        } else {
          Ok(i)
        }
      })
      .collect();

    let result = execute(tasks, 3).await;
    match result {
      Err(ParallelError::Aggregate(failures)) => {
        let messages: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
        assert_eq!(messages, vec!["boom-1", "boom-3", "boom-5"]);
      }
      other => panic!("expected Aggregate error, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn aggregate_display_lists_every_failure() {
    let tasks: Vec<_> = (0..3)
      .map(|i| async move {
        if i > 0 {
          Err(TestError(format!("boom-{i}")))
        } else {
          Ok(i)
        }
      })
      .collect();

    let err = execute(tasks, 1).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("2 tasks failed"));
    assert!(message.contains("boom-1"));
    assert!(message.contains("boom-2"));
  }

  #[tokio::test]
  async fn panics_are_counted_not_propagated() {
    let tasks: Vec<_> = (0..3)
      .map(|i| async move {
        if i == 1 {
          panic!("kaboom");
        }
        Ok::<usize, TestError>(i)
      })
      .collect();

    let result = execute(tasks, 2).await;
    assert!(matches!(result, Err(ParallelError::Panicked(1))));
  }
}
