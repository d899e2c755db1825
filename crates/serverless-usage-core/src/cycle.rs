// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::executor::{ConcurrentFetchExecutor, FetchReport};
use crate::joiner::Joiner;
use crate::normalizer::Normalizer;
use crate::probe::{Category, Window};
use crate::registry::ProbeRegistry;
use crate::scheduler::CycleJob;
use crate::sink::Sink;
use crate::table::UsageTable;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// How far back each cycle looks.
pub const WINDOW_LENGTH: Duration = Duration::from_secs(300);
/// Resolution of collected series.
pub const STEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub fetch: FetchReport,
    pub rows: usize,
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub window: Window,
    pub categories: Vec<CategoryReport>,
}

/// One full collection: fetch, merge, normalize and write both categories.
pub struct Collector {
    registry: ProbeRegistry,
    executor: ConcurrentFetchExecutor,
    function_usage: Normalizer,
    system_usage: Normalizer,
    sink: Arc<dyn Sink>,
    window_length: Duration,
    step: Duration,
}

impl Collector {
    /// Fails when two probes of a category declare different units for one field.
    pub fn new(
        cluster_name: impl Into<String>,
        registry: ProbeRegistry,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, ConfigError> {
        let cluster_name = cluster_name.into();
        let normalizer = |category| -> Result<Normalizer, ConfigError> {
            Ok(Normalizer::new(
                cluster_name.clone(),
                registry.entity_rule().clone(),
                registry.field_units(category)?,
            ))
        };
        let function_usage = normalizer(Category::FunctionUsage)?;
        let system_usage = normalizer(Category::SystemUsage)?;

        Ok(Collector {
            executor: ConcurrentFetchExecutor::new(registry.deadline()),
            registry,
            function_usage,
            system_usage,
            sink,
            window_length: WINDOW_LENGTH,
            step: STEP,
        })
    }

    pub fn with_executor(mut self, executor: ConcurrentFetchExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    /// Collects the window ending now.
    pub async fn collect(&self, cancel: CancellationToken) -> CycleReport {
        let window = Window::ending_at(Utc::now().timestamp(), self.window_length, self.step);
        self.collect_window(window, cancel).await
    }

    pub async fn collect_window(&self, window: Window, cancel: CancellationToken) -> CycleReport {
        let span = info_span!("cycle", start = window.start, end = window.end);
        async {
            let (functions, systems) = futures::join!(
                self.fetch(Category::FunctionUsage, window, cancel.clone()),
                self.fetch(Category::SystemUsage, window, cancel.clone()),
            );

            let mut categories = Vec::with_capacity(2);
            for (mut report, table) in [functions, systems] {
                if cancel.is_cancelled() {
                    debug!(category = %report.category, "Cycle cancelled, skipping write");
                } else {
                    report.written = self.write(report.category, &table).await;
                }
                categories.push(report);
            }

            for report in &categories {
                info!(
                    category = %report.category,
                    completed = report.fetch.completed,
                    failed = report.fetch.failed,
                    abandoned = report.fetch.abandoned,
                    rows = report.rows,
                    written = report.written,
                    "Collection cycle finished"
                );
            }
            CycleReport { window, categories }
        }
        .instrument(span)
        .await
    }

    async fn fetch(
        &self,
        category: Category,
        window: Window,
        cancel: CancellationToken,
    ) -> (CategoryReport, UsageTable) {
        let span = info_span!("category", category = %category);
        async {
            let probes = self.registry.probes_for(category);
            let mut batch = self.executor.spawn(probes, window, cancel);
            let mut joiner = Joiner::new(category);
            while let Some(result) = batch.next().await {
                joiner.merge(result);
            }

            let table = self.normalizer(category).normalize(joiner.finish());
            let report = CategoryReport {
                category,
                fetch: batch.report(),
                rows: table.len(),
                written: false,
            };
            (report, table)
        }
        .instrument(span)
        .await
    }

    async fn write(&self, category: Category, table: &UsageTable) -> bool {
        if table.is_empty() {
            debug!(category = %category, "No rows collected, nothing to write");
            return false;
        }
        match self.sink.write(category, table).await {
            Ok(()) => true,
            Err(e) => {
                error!(category = %category, "Failed to write usage table: {e}");
                false
            }
        }
    }

    fn normalizer(&self, category: Category) -> &Normalizer {
        match category {
            Category::FunctionUsage => &self.function_usage,
            Category::SystemUsage => &self.system_usage,
        }
    }
}

#[async_trait]
impl CycleJob for Collector {
    async fn run(&self, cancel: CancellationToken) {
        self.collect(cancel).await;
    }
}
