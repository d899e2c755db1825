// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MergeError, ProbeError};
use crate::normalizer::UnitConversion;
use crate::table::{JoinKey, JoinKind, Row, UsageTable, ENTITY, NODE, TIMESTAMP};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Which of the two output tables a probe feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    FunctionUsage,
    SystemUsage,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::FunctionUsage => "function_usage",
            Category::SystemUsage => "system_usage",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collection window in epoch seconds, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
    pub step: u64,
}

impl Window {
    pub fn ending_at(end: i64, length: Duration, step: Duration) -> Self {
        Window {
            start: end - length.as_secs() as i64,
            end,
            step: step.as_secs().max(1),
        }
    }

    /// Floors `ts` onto the step grid.
    pub fn align(&self, ts: i64) -> i64 {
        let step = self.step as i64;
        ts - ts.rem_euclid(step)
    }
}

/// One sample emitted by a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub timestamp: i64,
    pub entity_id: Option<String>,
    pub node_id: Option<String>,
    pub fields: BTreeMap<String, f64>,
}

impl MetricRecord {
    pub fn new(timestamp: i64) -> Self {
        MetricRecord {
            timestamp,
            entity_id: None,
            node_id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity_id = Some(entity.into());
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node_id = Some(node.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub(crate) fn into_row(self, source: &str) -> Row {
        let mut row = Row::new().with(TIMESTAMP, self.timestamp).with_source(source);
        if let Some(entity) = self.entity_id {
            row.set(ENTITY, entity);
        }
        if let Some(node) = self.node_id {
            row.set(NODE, node);
        }
        for (name, value) in self.fields {
            row.set(&name, value);
        }
        row
    }

    pub(crate) fn from_row(row: &Row) -> Option<Self> {
        let timestamp = match row.get(TIMESTAMP)? {
            crate::table::Value::Int(ts) => *ts,
            _ => return None,
        };
        let mut record = MetricRecord::new(timestamp);
        for (column, value) in row.values() {
            match column {
                TIMESTAMP => {}
                ENTITY => record.entity_id = value.as_str().map(str::to_string),
                NODE => record.node_id = value.as_str().map(str::to_string),
                _ => {
                    if let Some(n) = value.as_f64() {
                        record.fields.insert(column.to_string(), n);
                    }
                }
            }
        }
        Some(record)
    }
}

/// A field a probe produces and the unit conversion it needs downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub unit: UnitConversion,
}

/// Static facts about a probe: what it measures and how its rows are matched.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeDescriptor {
    pub name: String,
    pub category: Category,
    pub key: JoinKey,
    pub join: JoinKind,
    pub fields: Vec<FieldSpec>,
}

impl ProbeDescriptor {
    pub fn new(name: impl Into<String>, category: Category, key: JoinKey) -> Self {
        ProbeDescriptor {
            name: name.into(),
            category,
            key,
            join: JoinKind::Outer,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, unit: UnitConversion) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            unit,
        });
        self
    }

    /// Marks the probe so only keys it produced survive the merge.
    pub fn inner(mut self) -> Self {
        self.join = JoinKind::Inner;
        self
    }

    /// Name of the first declared field, used by single-field probes.
    pub fn primary_field(&self) -> &str {
        self.fields
            .first()
            .map(|f| f.name.as_str())
            .unwrap_or(self.name.as_str())
    }
}

/// Records produced by one probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub probe: String,
    pub category: Category,
    pub key: JoinKey,
    pub join: JoinKind,
    pub records: Vec<MetricRecord>,
}

impl ProbeResult {
    pub fn new(descriptor: &ProbeDescriptor, records: Vec<MetricRecord>) -> Self {
        ProbeResult {
            probe: descriptor.name.clone(),
            category: descriptor.category,
            key: descriptor.key.clone(),
            join: descriptor.join,
            records,
        }
    }

    pub fn empty(descriptor: &ProbeDescriptor) -> Self {
        Self::new(descriptor, Vec::new())
    }

    /// Rebuilds a result from an already keyed table.
    pub fn from_table(descriptor: &ProbeDescriptor, table: &UsageTable) -> Self {
        let records = table.rows().filter_map(MetricRecord::from_row).collect();
        Self::new(descriptor, records)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_table(self) -> (UsageTable, Vec<MergeError>) {
        let probe = self.probe;
        UsageTable::from_rows(
            self.category,
            self.key,
            self.records.into_iter().map(|r| r.into_row(&probe)),
        )
    }
}

/// A single unit of data fetching. Failures stay local to the probe.
#[async_trait]
pub trait MetricProbe: Send + Sync {
    fn descriptor(&self) -> &ProbeDescriptor;

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_ending_at() {
        let w = Window::ending_at(1_000_000, Duration::from_secs(300), Duration::from_secs(60));
        assert_eq!(w.start, 999_700);
        assert_eq!(w.end, 1_000_000);
        assert_eq!(w.step, 60);
        assert_eq!(w.align(1_000_059), 1_000_020);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(Category::FunctionUsage.as_str(), "function_usage");
        assert_eq!(Category::SystemUsage.to_string(), "system_usage");
    }

    #[test]
    fn test_descriptor_defaults_to_outer() {
        let d = ProbeDescriptor::new("cold_starts", Category::FunctionUsage, JoinKey::entity())
            .field("cold_starts", UnitConversion::Identity);
        assert_eq!(d.join, JoinKind::Outer);
        assert_eq!(d.primary_field(), "cold_starts");
        assert_eq!(d.inner().join, JoinKind::Inner);
    }

    #[test]
    fn test_result_into_table_drops_keyless_records() {
        let d = ProbeDescriptor::new("replicas", Category::FunctionUsage, JoinKey::entity());
        let result = ProbeResult::new(
            &d,
            vec![
                MetricRecord::new(60).entity("f1").field("replicas", 2.0),
                MetricRecord::new(60).field("replicas", 1.0),
            ],
        );
        let (table, errors) = result.into_table();
        assert_eq!(table.len(), 1);
        assert_eq!(errors.len(), 1);
        let row = table.rows().next().unwrap();
        assert!(row.sources().contains("replicas"));
    }

    #[test]
    fn test_record_row_round_trip_keeps_key_columns() {
        let record = MetricRecord::new(120)
            .entity("f1")
            .node("n1")
            .field("pods-cpu-sum", 0.25);
        let row = record.clone().into_row("cpu");
        assert_eq!(MetricRecord::from_row(&row), Some(record));
    }
}
