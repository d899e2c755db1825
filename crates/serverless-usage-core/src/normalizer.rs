// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a merged table into its final, sink-ready shape.
//!
//! Entity ids are canonicalized, unit conversions run once per field, epoch seconds
//! become UTC timestamps, sentinel rows are dropped and every row is tagged with the
//! cluster and category it belongs to.

use crate::probe::Category;
use crate::table::{Aggregation, Row, UsageTable, Value, ENTITY, TIMESTAMP};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const CLUSTER_NAME: &str = "cluster_name";
pub const MEASUREMENT_CATEGORY: &str = "measurement_category";

/// Entity id emitted when a series carries no entity label.
pub const SENTINEL_ENTITY: &str = "none";

const MAX_REWRITES: usize = 8;

/// How a platform turns raw pod/action names into a stable function name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRule {
    Verbatim,
    /// Removes every `-`.
    StripSeparators,
    /// Keeps the text before the first occurrence of `marker`.
    BeforeMarker(String),
    /// Keeps the text after the last occurrence of `marker`.
    AfterMarker(String),
    /// Drops the generated `-<replicaset>-<pod>` suffix of a controller-managed pod
    /// and appends `suffix`. Names already ending in `suffix` are left alone.
    ControllerPod { suffix: String },
    Chain(Vec<EntityRule>),
}

impl EntityRule {
    /// Applies the rule until the name stops changing.
    pub fn canonicalize(&self, raw: &str) -> String {
        let mut current = raw.to_string();
        for _ in 0..MAX_REWRITES {
            let next = self.apply_once(&current);
            if next == current {
                return current;
            }
            current = next;
        }
        current
    }

    fn apply_once(&self, name: &str) -> String {
        match self {
            EntityRule::Verbatim => name.to_string(),
            EntityRule::StripSeparators => name.replace('-', ""),
            EntityRule::BeforeMarker(marker) => match name.find(marker.as_str()) {
                Some(idx) if !marker.is_empty() => name[..idx].to_string(),
                _ => name.to_string(),
            },
            EntityRule::AfterMarker(marker) => match name.rfind(marker.as_str()) {
                Some(idx) if !marker.is_empty() => name[idx + marker.len()..].to_string(),
                _ => name.to_string(),
            },
            EntityRule::ControllerPod { suffix } => {
                if name.ends_with(suffix.as_str()) {
                    return name.to_string();
                }
                let base = match controller_pod_pattern().captures(name) {
                    Some(caps) => caps.get(1).map_or(name, |m| m.as_str()),
                    None => name,
                };
                format!("{base}{suffix}")
            }
            EntityRule::Chain(rules) => rules
                .iter()
                .fold(name.to_string(), |acc, rule| rule.apply_once(&acc)),
        }
    }
}

#[allow(clippy::expect_used)]
fn controller_pod_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+)-[0-9a-z]+-[0-9a-z]+$").expect("controller pod pattern is valid")
    })
}

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;

/// Unit conversion declared per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitConversion {
    Identity,
    MillisToSeconds,
    NanosToSeconds,
    BytesToMegabytes,
    MegabytesToBytes,
}

impl UnitConversion {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            UnitConversion::Identity => value,
            UnitConversion::MillisToSeconds => value / 1_000.0,
            UnitConversion::NanosToSeconds => value / 1_000_000_000.0,
            UnitConversion::BytesToMegabytes => value / BYTES_PER_MEGABYTE,
            UnitConversion::MegabytesToBytes => value * BYTES_PER_MEGABYTE,
        }
    }
}

/// What to do with numeric fields a row does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPolicy {
    ZeroFill,
    LeaveUnset,
}

impl NullPolicy {
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::FunctionUsage => NullPolicy::ZeroFill,
            Category::SystemUsage => NullPolicy::LeaveUnset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    cluster_name: String,
    entity_rule: EntityRule,
    units: BTreeMap<String, UnitConversion>,
}

impl Normalizer {
    /// `units` lists every field declared by the category's probes.
    pub fn new(
        cluster_name: impl Into<String>,
        entity_rule: EntityRule,
        units: BTreeMap<String, UnitConversion>,
    ) -> Self {
        Normalizer {
            cluster_name: cluster_name.into(),
            entity_rule,
            units,
        }
    }

    pub fn normalize(&self, table: UsageTable) -> UsageTable {
        let category = table.category();
        let key = table.key().clone();
        let before = table.len();

        let canonical_rows: Vec<Row> = table
            .into_rows()
            .filter(|row| !is_sentinel(row))
            .map(|mut row| {
                if let Some(raw) = row.text(ENTITY) {
                    let canonical = self.entity_rule.canonicalize(raw);
                    row.set(ENTITY, canonical);
                }
                row
            })
            .collect();
        let kept = canonical_rows.len();

        // canonical ids can collide; collapse them instead of losing rows. Rows an
        // outer join left without some key columns are grouped on the ones they have.
        let grouped = UsageTable::group_partial_rows(
            category,
            key.clone(),
            canonical_rows,
            Aggregation::Mean,
        );
        if grouped.len() < kept {
            debug!(
                category = %category,
                collapsed = kept - grouped.len(),
                "Collapsed rows sharing a canonical entity"
            );
        }

        let mut fill: BTreeSet<String> = self.units.keys().cloned().collect();
        for row in grouped.rows() {
            for (column, value) in row.values() {
                if !key.contains(column) && value.as_f64().is_some() {
                    fill.insert(column.to_string());
                }
            }
        }
        let policy = NullPolicy::for_category(category);

        let rows = grouped.into_rows().filter_map(|mut row| {
            let time = match row.get(TIMESTAMP) {
                Some(Value::Int(secs)) => {
                    let secs = *secs;
                    let Some(time) = DateTime::<Utc>::from_timestamp(secs, 0) else {
                        warn!(timestamp = secs, "Dropping row with out of range timestamp");
                        return None;
                    };
                    time
                }
                Some(Value::Time(time)) => *time,
                _ => {
                    warn!(category = %category, "Dropping row without a timestamp");
                    return None;
                }
            };
            row.set(TIMESTAMP, time);

            for (field, unit) in &self.units {
                if let Some(v) = row.number(field) {
                    row.set(field, unit.apply(v));
                }
            }
            if policy == NullPolicy::ZeroFill {
                for field in &fill {
                    if row.get(field).is_none() {
                        row.set(field, 0.0);
                    }
                }
            }
            row.set(CLUSTER_NAME, self.cluster_name.as_str());
            row.set(MEASUREMENT_CATEGORY, category.as_str());
            Some(row)
        });

        let (normalized, errors) = UsageTable::from_partial_rows(category, key, rows);
        for e in errors {
            warn!(category = %category, "Dropping row during normalization: {e}");
        }
        debug!(
            category = %category,
            rows_in = before,
            rows_out = normalized.len(),
            "Normalized table"
        );
        normalized
    }
}

fn is_sentinel(row: &Row) -> bool {
    row.text(ENTITY)
        .is_some_and(|e| e.eq_ignore_ascii_case(SENTINEL_ENTITY))
}
