// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relational table used as the per-cycle accumulator.
//!
//! A [`UsageTable`] holds rows of column name to typed scalar, indexed by a declared
//! [`JoinKey`]. There is never more than one row per distinct key value. Joins match
//! on the intersection of the two key shapes, which must be nested (one a subset of
//! the other). Each row remembers which probes contributed to it so inner-join
//! restrictions can be applied after the fact.

use crate::error::MergeError;
use crate::probe::Category;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Epoch-seconds timestamp column, or UTC timestamp after normalization.
pub const TIMESTAMP: &str = "timestamp";
/// Entity (function) column.
pub const ENTITY: &str = "function_name";
/// Node column.
pub const NODE: &str = "node";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) | Value::Time(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn key_atom(&self) -> Option<KeyAtom> {
        match self {
            Value::Int(i) => Some(KeyAtom::Int(*i)),
            Value::Text(s) => Some(KeyAtom::Text(s.clone())),
            Value::Time(t) => Some(KeyAtom::Time(*t)),
            // floats are never valid key values
            Value::Float(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

/// Hashable, ordered projection of a key column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyAtom {
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

impl fmt::Display for KeyAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAtom::Int(i) => write!(f, "{i}"),
            KeyAtom::Text(s) => write!(f, "{s}"),
            KeyAtom::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

type RowKey = Vec<Option<KeyAtom>>;

/// Whether every key column must be set for a row to be keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMatch {
    Complete,
    Partial,
}

impl KeyMatch {
    fn project(self, key: &JoinKey, row: &Row) -> Result<RowKey, MergeError> {
        match self {
            KeyMatch::Complete => key.project_strict(row),
            KeyMatch::Partial => Ok(key.project(row)),
        }
    }
}

/// Ordered tuple of column names rows are matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinKey(Vec<&'static str>);

impl JoinKey {
    pub fn new(columns: &[&'static str]) -> Self {
        let mut cols: Vec<&'static str> = Vec::with_capacity(columns.len());
        for c in columns {
            if !cols.contains(c) {
                cols.push(c);
            }
        }
        JoinKey(cols)
    }

    /// `(timestamp)`
    pub fn timestamp() -> Self {
        Self::new(&[TIMESTAMP])
    }

    /// `(timestamp, entity)`
    pub fn entity() -> Self {
        Self::new(&[TIMESTAMP, ENTITY])
    }

    /// `(timestamp, node)`
    pub fn node() -> Self {
        Self::new(&[TIMESTAMP, NODE])
    }

    /// `(timestamp, entity, node)`
    pub fn entity_node() -> Self {
        Self::new(&[TIMESTAMP, ENTITY, NODE])
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| *c == column)
    }

    pub fn is_subset_of(&self, other: &JoinKey) -> bool {
        self.0.iter().all(|c| other.contains(c))
    }

    /// Two shapes can be joined when one nests inside the other.
    pub fn is_compatible_with(&self, other: &JoinKey) -> bool {
        self.is_subset_of(other) || other.is_subset_of(self)
    }

    fn project(&self, row: &Row) -> RowKey {
        self.0
            .iter()
            .map(|c| row.get(c).and_then(Value::key_atom))
            .collect()
    }

    fn project_strict(&self, row: &Row) -> Result<RowKey, MergeError> {
        self.0
            .iter()
            .map(|c| {
                row.get(c)
                    .and_then(Value::key_atom)
                    .map(Some)
                    .ok_or_else(|| MergeError::MergeKeyMissing {
                        column: (*c).to_string(),
                    })
            })
            .collect()
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

fn display_key(key: &RowKey) -> String {
    key.iter()
        .map(|a| match a {
            Some(a) => a.to_string(),
            None => "-".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single table row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
    sources: BTreeSet<String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.sources.insert(source.to_string());
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.values.insert(column.to_string(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of the probes whose data is in this row.
    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    /// Overlays `top` onto `self`; values present in both take `top`'s.
    fn overlay(&mut self, top: &Row) {
        for (k, v) in &top.values {
            self.values.insert(k.clone(), v.clone());
        }
        self.sources.extend(top.sources.iter().cloned());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Keep rows from both sides, unmatched fields stay unset.
    Outer,
    /// Keep only rows present on both sides.
    Inner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Mean,
}

/// Per-category table keyed by a [`JoinKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct UsageTable {
    category: Category,
    key: JoinKey,
    rows: BTreeMap<RowKey, Row>,
}

impl UsageTable {
    pub fn new(category: Category, key: JoinKey) -> Self {
        UsageTable {
            category,
            key,
            rows: BTreeMap::new(),
        }
    }

    /// Builds a table, rejecting rows that lack a key column and every row whose key
    /// value appears more than once.
    pub fn from_rows(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
    ) -> (Self, Vec<MergeError>) {
        Self::build(category, key, rows, KeyMatch::Complete)
    }

    /// Like [`UsageTable::from_rows`], but rows lacking some key columns are kept under
    /// the key columns they do have, the way an outer join leaves them.
    pub fn from_partial_rows(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
    ) -> (Self, Vec<MergeError>) {
        Self::build(category, key, rows, KeyMatch::Partial)
    }

    fn build(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
        matching: KeyMatch,
    ) -> (Self, Vec<MergeError>) {
        let mut errors = Vec::new();
        let mut grouped: BTreeMap<RowKey, Vec<Row>> = BTreeMap::new();
        for row in rows {
            match matching.project(&key, &row) {
                Ok(k) => grouped.entry(k).or_default().push(row),
                Err(e) => errors.push(e),
            }
        }

        let mut table = UsageTable::new(category, key);
        for (k, mut group) in grouped {
            if group.len() > 1 {
                let key = display_key(&k);
                errors.extend(group.iter().map(|_| MergeError::DuplicateKey { key: key.clone() }));
                continue;
            }
            if let Some(row) = group.pop() {
                table.rows.insert(k, row);
            }
        }
        (table, errors)
    }

    /// Groups arbitrary rows by `key`, aggregating every numeric non-key column.
    /// Rows missing a key column are skipped; unset values do not count.
    pub fn group_rows(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
        aggregation: Aggregation,
    ) -> Self {
        Self::group(category, key, rows, aggregation, KeyMatch::Complete)
    }

    /// Groups rows on the key columns each row actually carries. Rows an outer join
    /// left without some key columns form their own groups instead of being skipped.
    pub fn group_partial_rows(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
        aggregation: Aggregation,
    ) -> Self {
        Self::group(category, key, rows, aggregation, KeyMatch::Partial)
    }

    fn group(
        category: Category,
        key: JoinKey,
        rows: impl IntoIterator<Item = Row>,
        aggregation: Aggregation,
        matching: KeyMatch,
    ) -> Self {
        #[derive(Default)]
        struct Acc {
            template: Row,
            sums: BTreeMap<String, (f64, usize)>,
        }

        let mut groups: BTreeMap<RowKey, Acc> = BTreeMap::new();
        for row in rows {
            let Ok(k) = matching.project(&key, &row) else {
                continue;
            };
            let acc = groups.entry(k).or_insert_with(|| {
                let mut template = Row::new();
                for column in key.columns() {
                    if let Some(v) = row.get(column) {
                        template.set(column, v.clone());
                    }
                }
                Acc {
                    template,
                    sums: BTreeMap::new(),
                }
            });
            acc.template.sources.extend(row.sources.iter().cloned());
            for (column, value) in &row.values {
                if key.contains(column) {
                    continue;
                }
                if let Some(n) = value.as_f64() {
                    let slot = acc.sums.entry(column.clone()).or_insert((0.0, 0));
                    slot.0 += n;
                    slot.1 += 1;
                }
            }
        }

        let mut table = UsageTable::new(category, key);
        for (k, acc) in groups {
            let mut row = acc.template;
            for (column, (sum, count)) in acc.sums {
                let v = match aggregation {
                    Aggregation::Sum => sum,
                    Aggregation::Mean => sum / count as f64,
                };
                row.set(&column, v);
            }
            table.rows.insert(k, row);
        }
        table
    }

    pub fn group_aggregate(&self, key: JoinKey, aggregation: Aggregation) -> Self {
        Self::group_rows(self.category, key, self.rows.values().cloned(), aggregation)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn key(&self) -> &JoinKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn into_rows(self) -> impl Iterator<Item = Row> {
        self.rows.into_values()
    }

    /// Mutable access to non-key columns. Key columns must not be modified.
    pub fn for_each_row_mut(&mut self, mut f: impl FnMut(&mut Row)) {
        for row in self.rows.values_mut() {
            f(row);
        }
    }

    pub fn retain(&mut self, mut f: impl FnMut(&Row) -> bool) {
        self.rows.retain(|_, row| f(row));
    }

    /// Looks up the row whose key columns equal `values`, in key column order.
    pub fn find(&self, values: &[Value]) -> Option<&Row> {
        let k: RowKey = values.iter().map(Value::key_atom).collect();
        self.rows.get(&k)
    }

    pub fn outer_join(self, other: UsageTable) -> Result<Self, MergeError> {
        self.join(other, JoinKind::Outer)
    }

    pub fn inner_join(self, other: UsageTable) -> Result<Self, MergeError> {
        self.join(other, JoinKind::Inner)
    }

    pub fn join(mut self, other: UsageTable, kind: JoinKind) -> Result<Self, MergeError> {
        self.merge_in(other, kind)?;
        Ok(self)
    }

    /// Joins `other` into `self` on the narrower of the two key shapes. Where both sides
    /// set the same column, `other` wins. The result is keyed by the wider shape.
    /// On error `self` is left untouched.
    pub fn merge_in(&mut self, other: UsageTable, kind: JoinKind) -> Result<(), MergeError> {
        if !self.key.is_compatible_with(&other.key) {
            return Err(MergeError::IncompatibleKeys {
                incoming: other.key.to_string(),
                existing: self.key.to_string(),
            });
        }
        let empty = UsageTable::new(self.category, self.key.clone());
        let current = std::mem::replace(self, empty);
        *self = current.join_nested(other, kind);
        Ok(())
    }

    fn join_nested(self, other: UsageTable, kind: JoinKind) -> Self {
        let self_is_wide = other.key.is_subset_of(&self.key);
        let (wide, narrow) = if self_is_wide {
            (self, other)
        } else {
            (other, self)
        };
        let common = narrow.key.clone();
        let category = wide.category;
        let mut out = UsageTable::new(category, wide.key.clone());
        let mut matched: BTreeSet<RowKey> = BTreeSet::new();

        for (wide_key, wide_row) in wide.rows {
            let probe_key = common.project(&wide_row);
            match narrow.rows.get(&probe_key) {
                Some(narrow_row) => {
                    matched.insert(probe_key);
                    let merged = if self_is_wide {
                        let mut r = wide_row;
                        r.overlay(narrow_row);
                        r
                    } else {
                        let mut r = narrow_row.clone();
                        r.overlay(&wide_row);
                        r
                    };
                    out.rows.insert(wide_key, merged);
                }
                None if kind == JoinKind::Outer => {
                    out.rows.insert(wide_key, wide_row);
                }
                None => {}
            }
        }

        if kind == JoinKind::Outer {
            for (narrow_key, narrow_row) in narrow.rows {
                if matched.contains(&narrow_key) {
                    continue;
                }
                let k = out.key.project(&narrow_row);
                out.rows.insert(k, narrow_row);
            }
        }
        out
    }
}
