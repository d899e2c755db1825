// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work run once per period. `cancel` fires when the scheduler is stopped mid-cycle.
#[async_trait]
pub trait CycleJob: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken);
}

/// Time left in the period once a cycle took `elapsed`. Never negative.
pub fn next_delay(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs a [`CycleJob`] every `period`, measured from cycle start to cycle start.
///
/// Cycles never overlap. A cycle that overruns the period is followed immediately by
/// the next one, without trying to catch up on missed periods.
#[derive(Clone)]
pub struct PeriodicScheduler {
    period: Duration,
    job: Arc<dyn CycleJob>,
    state: Arc<Mutex<Option<RunningLoop>>>,
}

impl PeriodicScheduler {
    pub fn new(period: Duration, job: Arc<dyn CycleJob>) -> Self {
        PeriodicScheduler {
            period,
            job,
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Idle to Running. A second call while running leaves the existing loop alone.
    pub async fn start(&self) -> StartOutcome {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("Scheduler already running");
            return StartOutcome::AlreadyRunning;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.period, Arc::clone(&self.job), cancel.clone()));
        *state = Some(RunningLoop { cancel, task });
        info!(period = ?self.period, "Scheduler started");
        StartOutcome::Started
    }

    /// Running to Idle. Cancels the in-flight cycle and waits for the loop to exit.
    pub async fn stop(&self) -> StopOutcome {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            debug!("Scheduler not running");
            return StopOutcome::NotRunning;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            error!("Scheduler loop ended abnormally: {e}");
        }
        info!("Scheduler stopped");
        StopOutcome::Stopped
    }

    pub async fn status(&self) -> SchedulerStatus {
        match *self.state.lock().await {
            Some(_) => SchedulerStatus::Running,
            None => SchedulerStatus::Idle,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == SchedulerStatus::Running
    }
}

async fn run_loop(period: Duration, job: Arc<dyn CycleJob>, cancel: CancellationToken) {
    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        let started = Instant::now();
        let outcome = AssertUnwindSafe(job.run(cancel.child_token()))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!(cycle, "Collection cycle panicked");
        }
        if cancel.is_cancelled() {
            break;
        }

        let elapsed = started.elapsed();
        let delay = next_delay(period, elapsed);
        if delay.is_zero() {
            warn!(cycle, ?elapsed, ?period, "Cycle overran its period");
        } else {
            debug!(cycle, ?elapsed, ?delay, "Sleeping until next cycle");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    debug!(cycles = cycle, "Scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tracing_test::traced_test;

    /// Records cycle start times and takes `busy` to complete.
    struct Timed {
        busy: Duration,
        starts: StdMutex<Vec<Instant>>,
    }

    impl Timed {
        fn new(busy: Duration) -> Arc<Self> {
            Arc::new(Timed {
                busy,
                starts: StdMutex::new(Vec::new()),
            })
        }

        fn gaps(&self) -> Vec<Duration> {
            let starts = self.starts.lock().unwrap();
            starts.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl CycleJob for Timed {
        async fn run(&self, _cancel: CancellationToken) {
            self.starts.lock().unwrap().push(Instant::now());
            sleep(self.busy).await;
        }
    }

    #[test]
    fn test_next_delay() {
        let period = Duration::from_secs(60);
        assert_eq!(next_delay(period, Duration::from_secs(20)), Duration::from_secs(40));
        assert_eq!(next_delay(period, period), Duration::ZERO);
        assert_eq!(next_delay(period, Duration::from_secs(90)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_start_on_period_boundaries() {
        let job = Timed::new(Duration::from_secs(2));
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10), job.clone());
        assert_eq!(scheduler.start().await, StartOutcome::Started);

        sleep(Duration::from_secs(35)).await;
        assert_eq!(scheduler.stop().await, StopOutcome::Stopped);

        let gaps = job.gaps();
        assert_eq!(gaps.len(), 3);
        assert!(gaps.iter().all(|g| *g == Duration::from_secs(10)), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_starts_next_cycle_immediately() {
        let job = Timed::new(Duration::from_secs(15));
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10), job.clone());
        scheduler.start().await;

        sleep(Duration::from_secs(40)).await;
        scheduler.stop().await;

        let gaps = job.gaps();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| *g == Duration::from_secs(15)), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10), Timed::new(Duration::ZERO));
        assert_eq!(scheduler.status().await, SchedulerStatus::Idle);
        assert_eq!(scheduler.stop().await, StopOutcome::NotRunning);

        assert_eq!(scheduler.start().await, StartOutcome::Started);
        assert_eq!(scheduler.start().await, StartOutcome::AlreadyRunning);
        assert!(scheduler.is_running().await);

        assert_eq!(scheduler.stop().await, StopOutcome::Stopped);
        assert_eq!(scheduler.status().await, SchedulerStatus::Idle);
        assert_eq!(scheduler.start().await, StartOutcome::Started);
        scheduler.stop().await;
    }

    struct WaitsForCancel {
        observed: AtomicBool,
    }

    #[async_trait]
    impl CycleJob for WaitsForCancel {
        async fn run(&self, cancel: CancellationToken) {
            cancel.cancelled().await;
            self.observed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_cycle() {
        let job = Arc::new(WaitsForCancel {
            observed: AtomicBool::new(false),
        });
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10), job.clone());
        scheduler.start().await;
        sleep(Duration::from_secs(1)).await;

        scheduler.stop().await;
        assert!(job.observed.load(Ordering::SeqCst));
    }

    struct PanicsOnce {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CycleJob for PanicsOnce {
        async fn run(&self, _cancel: CancellationToken) {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first cycle fails");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_panicking_cycle_does_not_stop_loop() {
        let job = Arc::new(PanicsOnce {
            runs: AtomicUsize::new(0),
        });
        let scheduler = PeriodicScheduler::new(Duration::from_secs(10), job.clone());
        scheduler.start().await;
        sleep(Duration::from_secs(25)).await;
        scheduler.stop().await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert!(logs_contain("Collection cycle panicked"));
    }
}
