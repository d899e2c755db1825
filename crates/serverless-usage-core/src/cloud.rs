// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Probes over managed cloud-function APIs.
//!
//! The vendor clients are external; each API is reached through a small trait so
//! registries can be built and tested without an SDK.

use crate::error::ProbeError;
use crate::normalizer::{EntityRule, SENTINEL_ENTITY};
use crate::probe::{MetricProbe, MetricRecord, ProbeDescriptor, ProbeResult, Window};
use crate::table::{Aggregation, UsageTable};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Scalar(f64),
    Distribution { count: u64, mean: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudPoint {
    pub timestamp: i64,
    pub value: PointValue,
}

/// One series of a cloud monitoring metric. `labels` holds both resource and metric labels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloudSeries {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<CloudPoint>,
}

/// Cloud Monitoring style time-series listing.
#[async_trait]
pub trait CloudMetricsClient: Send + Sync {
    async fn list_time_series(
        &self,
        probe: &str,
        metric: &str,
        window: Window,
    ) -> Result<Vec<CloudSeries>, ProbeError>;
}

/// What to read out of a point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointField {
    /// Scalar value, or the mean of a distribution.
    Value,
    /// Sample count of a distribution.
    Count,
    /// A numeric series label, e.g. the configured memory of a function.
    Label(String),
}

impl PointField {
    fn read(&self, labels: &BTreeMap<String, String>, value: &PointValue) -> Option<f64> {
        match (self, value) {
            (PointField::Value, PointValue::Scalar(v)) => Some(*v),
            (PointField::Value, PointValue::Distribution { mean, .. }) => Some(*mean),
            (PointField::Count, PointValue::Distribution { count, .. }) => Some(*count as f64),
            (PointField::Count, PointValue::Scalar(_)) => None,
            (PointField::Label(label), _) => labels.get(label)?.parse().ok(),
        }
    }
}

pub struct CloudMetricProbe {
    descriptor: ProbeDescriptor,
    client: Arc<dyn CloudMetricsClient>,
    metric: String,
    entity_label: String,
    rule: EntityRule,
    extract: Vec<(String, PointField)>,
    shift: i64,
    aggregation: Aggregation,
}

impl CloudMetricProbe {
    /// Reads `metric` and emits the descriptor's primary field from each point's value.
    pub fn new(
        descriptor: ProbeDescriptor,
        client: Arc<dyn CloudMetricsClient>,
        metric: impl Into<String>,
        entity_label: impl Into<String>,
        rule: EntityRule,
    ) -> Self {
        let extract = vec![(descriptor.primary_field().to_string(), PointField::Value)];
        CloudMetricProbe {
            descriptor,
            client,
            metric: metric.into(),
            entity_label: entity_label.into(),
            rule,
            extract,
            shift: 0,
            aggregation: Aggregation::Mean,
        }
    }

    /// Replaces the extracted fields.
    pub fn extract(mut self, fields: Vec<(&str, PointField)>) -> Self {
        self.extract = fields
            .into_iter()
            .map(|(name, f)| (name.to_string(), f))
            .collect();
        self
    }

    /// Moves every point by `secs`, for metrics reported at the end of their interval.
    pub fn shift(mut self, secs: i64) -> Self {
        self.shift = secs;
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

#[async_trait]
impl MetricProbe for CloudMetricProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError> {
        let name = self.descriptor.name.as_str();
        let series = self
            .client
            .list_time_series(name, &self.metric, window)
            .await?;
        debug!(series = series.len(), metric = %self.metric, "Cloud metric listed");

        let mut rows = Vec::new();
        for s in &series {
            let entity = match s.labels.get(&self.entity_label) {
                Some(raw) => self.rule.canonicalize(raw),
                None => SENTINEL_ENTITY.to_string(),
            };
            for point in &s.points {
                let mut record =
                    MetricRecord::new(window.align(point.timestamp + self.shift)).entity(&entity);
                for (field, from) in &self.extract {
                    if let Some(v) = from.read(&s.labels, &point.value) {
                        record = record.field(field.as_str(), v);
                    }
                }
                rows.push(record.into_row(name));
            }
        }
        let table = UsageTable::group_rows(
            self.descriptor.category,
            self.descriptor.key.clone(),
            rows,
            self.aggregation,
        );
        Ok(ProbeResult::from_table(&self.descriptor, &table))
    }
}

/// One metric-insights series; `label` ends with the dimension value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsightsSeries {
    pub label: String,
    pub points: Vec<(i64, f64)>,
}

/// CloudWatch Metrics Insights style query.
#[async_trait]
pub trait MetricInsightsClient: Send + Sync {
    async fn query(
        &self,
        probe: &str,
        query: &str,
        window: Window,
    ) -> Result<Vec<InsightsSeries>, ProbeError>;
}

pub struct MetricInsightsProbe {
    descriptor: ProbeDescriptor,
    client: Arc<dyn MetricInsightsClient>,
    query: String,
    rule: EntityRule,
}

impl MetricInsightsProbe {
    pub fn new(
        descriptor: ProbeDescriptor,
        client: Arc<dyn MetricInsightsClient>,
        query: impl Into<String>,
        rule: EntityRule,
    ) -> Self {
        MetricInsightsProbe {
            descriptor,
            client,
            query: query.into(),
            rule,
        }
    }

}

#[async_trait]
impl MetricProbe for MetricInsightsProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError> {
        let name = self.descriptor.name.as_str();
        let field = self.descriptor.primary_field();
        let series = self.client.query(name, &self.query, window).await?;

        let mut rows = Vec::new();
        for s in series {
            let entity = match s.label.split_whitespace().last() {
                Some(raw) => self.rule.canonicalize(raw),
                None => SENTINEL_ENTITY.to_string(),
            };
            for (ts, v) in s.points {
                rows.push(
                    MetricRecord::new(window.align(ts))
                        .entity(&entity)
                        .field(field, v)
                        .into_row(name),
                );
            }
        }
        let table = UsageTable::group_rows(
            self.descriptor.category,
            self.descriptor.key.clone(),
            rows,
            Aggregation::Mean,
        );
        Ok(ProbeResult::from_table(&self.descriptor, &table))
    }
}

/// One invocation report read from function logs.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: i64,
    pub entity: String,
    pub fields: BTreeMap<String, f64>,
}

/// CloudWatch Logs Insights style query.
#[async_trait]
pub trait LogQueryClient: Send + Sync {
    async fn query(
        &self,
        probe: &str,
        query: &str,
        window: Window,
    ) -> Result<Vec<LogRecord>, ProbeError>;
}

/// Resamples invocation logs into step-sized means.
///
/// Always inner: once it returns data, only keys it produced survive the merge.
pub struct InvocationLogProbe {
    descriptor: ProbeDescriptor,
    client: Arc<dyn LogQueryClient>,
    query: String,
    rule: EntityRule,
}

impl InvocationLogProbe {
    pub fn new(
        descriptor: ProbeDescriptor,
        client: Arc<dyn LogQueryClient>,
        query: impl Into<String>,
        rule: EntityRule,
    ) -> Self {
        InvocationLogProbe {
            descriptor: descriptor.inner(),
            client,
            query: query.into(),
            rule,
        }
    }
}

#[async_trait]
impl MetricProbe for InvocationLogProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError> {
        let name = self.descriptor.name.as_str();
        let logs = self.client.query(name, &self.query, window).await?;
        debug!(records = logs.len(), "Log query returned");

        let rows = logs.into_iter().map(|log| {
            let mut record = MetricRecord::new(window.align(log.timestamp))
                .entity(self.rule.canonicalize(&log.entity));
            record.fields = log.fields;
            record.into_row(name)
        });
        let table = UsageTable::group_rows(
            self.descriptor.category,
            self.descriptor.key.clone(),
            rows,
            Aggregation::Mean,
        );
        Ok(ProbeResult::from_table(&self.descriptor, &table))
    }
}
