//! Fixed-cadence task scheduler.
//!
//! One loop per registered task: wait out the frequency, run the task under
//! a hard wall-clock timeout, repeat. A task that outlives its timeout is
//! killed (its future dropped) and the loop carries on — tasks must persist
//! enough state to resume after being killed at any point.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct TaskScheduler {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` roughly every `frequency`, killing an invocation that
    /// exceeds `timeout`.
    pub fn schedule_task<F, Fut>(
        &self,
        id: impl Into<String>,
        frequency: Duration,
        timeout: Duration,
        task: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let loop_id = id.clone();
        let handle = tokio::spawn(async move {
            info!(
                task = %loop_id,
                frequency_secs = frequency.as_secs(),
                timeout_secs = timeout.as_secs(),
                "scheduled task started"
            );
            let mut interval = tokio::time::interval(frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                if tokio::time::timeout(timeout, task()).await.is_err() {
                    warn!(task = %loop_id, "task exceeded its timeout and was killed");
                }
            }
        });
        self.handles.lock().unwrap().push((id, handle));
    }

    /// Abort every scheduled loop.
    pub fn shutdown(&self) {
        for (id, handle) in self.handles.lock().unwrap().drain(..) {
            info!(task = %id, "stopping scheduled task");
            handle.abort();
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_runs_on_cadence() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        scheduler.schedule_task(
            "tick-counter",
            Duration::from_millis(10),
            Duration::from_secs(1),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_overrunning_task_is_killed_and_loop_survives() {
        let scheduler = TaskScheduler::new();
        let starts = Arc::new(AtomicU32::new(0));
        let completions = Arc::new(AtomicU32::new(0));
        let starts2 = starts.clone();
        let completions2 = completions.clone();

        scheduler.schedule_task(
            "sleeper",
            Duration::from_millis(10),
            Duration::from_millis(20),
            move || {
                let starts = starts2.clone();
                let completions = completions2.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    completions.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown();
        // Killed every time, but the loop kept re-invoking it.
        assert!(starts.load(Ordering::SeqCst) >= 2);
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }
}
