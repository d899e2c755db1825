// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus HTTP API backend and the probe that queries it.

use crate::error::ProbeError;
use crate::normalizer::{EntityRule, SENTINEL_ENTITY};
use crate::probe::{MetricProbe, MetricRecord, ProbeDescriptor, ProbeResult, Window};
use crate::table::{Aggregation, UsageTable};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One labelled series of `(epoch seconds, value)` samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(i64, f64)>,
}

/// A time-series query API.
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    async fn query_range(
        &self,
        probe: &str,
        expr: &str,
        window: Window,
    ) -> Result<Vec<Series>, ProbeError>;

    async fn query_instant(&self, probe: &str, expr: &str) -> Result<Vec<Series>, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<RawSeries>,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    client: Client,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(PrometheusClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(
        &self,
        probe: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Series>, ProbeError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| ProbeError::from_reqwest(probe, &e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProbeError::from_reqwest(probe, &e))?;
        if !status.is_success() {
            return Err(ProbeError::Transport {
                probe: probe.to_string(),
                status: Some(status.as_u16()),
                message: body,
            });
        }
        parse_response(probe, &body)
    }
}

#[async_trait]
impl TimeSeriesBackend for PrometheusClient {
    async fn query_range(
        &self,
        probe: &str,
        expr: &str,
        window: Window,
    ) -> Result<Vec<Series>, ProbeError> {
        let params = [
            ("query", expr.to_string()),
            ("start", window.start.to_string()),
            ("end", window.end.to_string()),
            ("step", window.step.to_string()),
        ];
        self.get(probe, "/api/v1/query_range", &params).await
    }

    async fn query_instant(&self, probe: &str, expr: &str) -> Result<Vec<Series>, ProbeError> {
        self.get(probe, "/api/v1/query", &[("query", expr.to_string())])
            .await
    }
}

fn parse_response(probe: &str, body: &str) -> Result<Vec<Series>, ProbeError> {
    let parse_err = |message: String| ProbeError::Parse {
        probe: probe.to_string(),
        message,
    };

    let resp: QueryResponse = serde_json::from_str(body).map_err(|e| parse_err(e.to_string()))?;
    if resp.status != "success" {
        return Err(parse_err(format!(
            "status {}: {}",
            resp.status,
            resp.error.unwrap_or_default()
        )));
    }
    let data = resp
        .data
        .ok_or_else(|| parse_err("missing data".to_string()))?;

    data.result
        .into_iter()
        .map(|raw| {
            let samples = raw.values.into_iter().chain(raw.value);
            let mut points = Vec::new();
            for (ts, value) in samples {
                let v: f64 = value
                    .parse()
                    .map_err(|_| parse_err(format!("invalid sample value {value:?}")))?;
                // NaN samples carry no information
                if v.is_nan() {
                    continue;
                }
                points.push((ts as i64, v));
            }
            Ok(Series {
                labels: raw.metric,
                points,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Range,
    Instant,
}

/// Probe backed by one PromQL expression.
///
/// Each sample becomes a record; the entity comes from `entity_label` (canonicalized,
/// or the `none` sentinel when the label is absent) and the node from `node_label`.
/// Records are then aggregated down to the descriptor's key.
pub struct PromQueryProbe {
    descriptor: ProbeDescriptor,
    backend: Arc<dyn TimeSeriesBackend>,
    expr: String,
    mode: QueryMode,
    entity_label: Option<&'static str>,
    node_label: Option<&'static str>,
    rule: EntityRule,
    aggregation: Aggregation,
}

impl PromQueryProbe {
    pub fn range(
        descriptor: ProbeDescriptor,
        backend: Arc<dyn TimeSeriesBackend>,
        expr: impl Into<String>,
    ) -> Self {
        PromQueryProbe {
            descriptor,
            backend,
            expr: expr.into(),
            mode: QueryMode::Range,
            entity_label: None,
            node_label: None,
            rule: EntityRule::Verbatim,
            aggregation: Aggregation::Mean,
        }
    }

    pub fn instant(
        descriptor: ProbeDescriptor,
        backend: Arc<dyn TimeSeriesBackend>,
        expr: impl Into<String>,
    ) -> Self {
        PromQueryProbe {
            mode: QueryMode::Instant,
            ..Self::range(descriptor, backend, expr)
        }
    }

    pub fn entity_from(mut self, label: &'static str, rule: EntityRule) -> Self {
        self.entity_label = Some(label);
        self.rule = rule;
        self
    }

    pub fn node_from(mut self, label: &'static str) -> Self {
        self.node_label = Some(label);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    fn records(&self, series: Vec<Series>, window: Window) -> Vec<MetricRecord> {
        let field = self.descriptor.primary_field().to_string();
        let mut records = Vec::new();
        for s in series {
            let entity = self.entity_label.map(|label| match s.labels.get(label) {
                Some(raw) => self.rule.canonicalize(raw),
                None => SENTINEL_ENTITY.to_string(),
            });
            let node = self
                .node_label
                .and_then(|label| s.labels.get(label).cloned());
            for (ts, value) in s.points {
                let ts = match self.mode {
                    QueryMode::Range => ts,
                    QueryMode::Instant => window.align(ts),
                };
                let mut record = MetricRecord::new(ts).field(field.clone(), value);
                record.entity_id = entity.clone();
                record.node_id = node.clone();
                records.push(record);
            }
        }
        records
    }
}

#[async_trait]
impl MetricProbe for PromQueryProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError> {
        let name = self.descriptor.name.as_str();
        let series = match self.mode {
            QueryMode::Range => self.backend.query_range(name, &self.expr, window).await?,
            QueryMode::Instant => self.backend.query_instant(name, &self.expr).await?,
        };
        debug!(series = series.len(), "Prometheus query returned");
        if series.is_empty() {
            return Ok(ProbeResult::empty(&self.descriptor));
        }

        let rows = self
            .records(series, window)
            .into_iter()
            .map(|r| r.into_row(name));
        let table = UsageTable::group_rows(
            self.descriptor.category,
            self.descriptor.key.clone(),
            rows,
            self.aggregation,
        );
        Ok(ProbeResult::from_table(&self.descriptor, &table))
    }
}
