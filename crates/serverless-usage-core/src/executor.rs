// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ProbeError;
use crate::probe::{MetricProbe, ProbeResult, Window};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

/// Upper bound on how long aborted probes get to unwind.
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

type ProbeOutcome = (usize, Result<ProbeResult, ProbeError>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

/// Runs a batch of probes concurrently under a shared deadline.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrentFetchExecutor {
    deadline: Duration,
    grace: Duration,
}

impl ConcurrentFetchExecutor {
    pub fn new(deadline: Duration) -> Self {
        ConcurrentFetchExecutor {
            deadline,
            grace: CANCEL_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Launches every probe and returns a handle yielding results in completion order.
    pub fn spawn(
        &self,
        probes: Vec<Arc<dyn MetricProbe>>,
        window: Window,
        cancel: CancellationToken,
    ) -> FetchBatch {
        let mut tasks = JoinSet::new();
        let mut names = Vec::with_capacity(probes.len());

        for (idx, probe) in probes.into_iter().enumerate() {
            let name = probe.descriptor().name.clone();
            let span = debug_span!("probe", probe = %name);
            names.push(name.clone());
            tasks.spawn(
                async move {
                    let outcome = AssertUnwindSafe(probe.execute(window))
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(ProbeError::Panicked { probe: name }));
                    (idx, outcome)
                }
                .instrument(span),
            );
        }

        FetchBatch {
            pending: vec![true; names.len()],
            names,
            tasks,
            deadline: Instant::now() + self.deadline,
            grace: self.grace,
            cancel,
            report: FetchReport::default(),
            closed: false,
        }
    }
}

enum Wake {
    Cancelled,
    TimedOut,
    Joined(Option<Result<ProbeOutcome, tokio::task::JoinError>>),
}

/// In-flight probes of one category. Dropping the batch aborts whatever is still running.
pub struct FetchBatch {
    names: Vec<String>,
    pending: Vec<bool>,
    tasks: JoinSet<ProbeOutcome>,
    deadline: Instant,
    grace: Duration,
    cancel: CancellationToken,
    report: FetchReport,
    closed: bool,
}

impl FetchBatch {
    /// Next successful result, or `None` once every probe finished, the deadline
    /// passed, or the batch was cancelled. Failed probes are logged and skipped.
    pub async fn next(&mut self) -> Option<ProbeResult> {
        loop {
            if self.closed {
                return None;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                joined = timeout_at(self.deadline, self.tasks.join_next()) => match joined {
                    Ok(next) => Wake::Joined(next),
                    Err(_) => Wake::TimedOut,
                },
            };

            match wake {
                Wake::Cancelled => {
                    self.abandon("cancelled").await;
                    return None;
                }
                Wake::TimedOut => {
                    self.abandon("deadline exceeded").await;
                    return None;
                }
                Wake::Joined(None) => {
                    self.closed = true;
                    return None;
                }
                Wake::Joined(Some(Ok((idx, outcome)))) => {
                    if let Some(p) = self.pending.get_mut(idx) {
                        *p = false;
                    }
                    match outcome {
                        Ok(result) => {
                            self.report.completed += 1;
                            debug!(
                                probe = %result.probe,
                                records = result.records.len(),
                                "Probe completed"
                            );
                            return Some(result);
                        }
                        Err(e) => {
                            self.report.failed += 1;
                            warn!("Probe failed: {e}");
                        }
                    }
                }
                Wake::Joined(Some(Err(e))) => {
                    self.report.failed += 1;
                    warn!("Probe task ended abnormally: {e}");
                }
            }
        }
    }

    pub fn report(&self) -> FetchReport {
        self.report
    }

    async fn abandon(&mut self, reason: &str) {
        let unfinished: Vec<&str> = self
            .names
            .iter()
            .zip(&self.pending)
            .filter(|(_, pending)| **pending)
            .map(|(name, _)| name.as_str())
            .collect();
        self.report.abandoned = unfinished.len();
        if !unfinished.is_empty() {
            warn!(reason, probes = ?unfinished, "Abandoning unfinished probes");
        }

        self.tasks.abort_all();
        let tasks = &mut self.tasks;
        let drained = timeout(self.grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborted probes did not unwind within {:?}", self.grace);
        }
        self.closed = true;
    }
}
