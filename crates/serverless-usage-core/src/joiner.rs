// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::probe::{Category, ProbeResult};
use crate::table::{JoinKey, JoinKind, UsageTable};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Accumulates probe results of one category as they arrive.
///
/// Results are merged per key shape and the shapes are combined in `finish`, widest
/// first, so the outcome does not depend on the order probes complete in.
#[derive(Debug)]
pub struct Joiner {
    category: Category,
    layers: BTreeMap<JoinKey, UsageTable>,
    required: BTreeSet<String>,
}

impl Joiner {
    pub fn new(category: Category) -> Self {
        Joiner {
            category,
            layers: BTreeMap::new(),
            required: BTreeSet::new(),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Merges one result. Rows without their key columns, duplicate keys and
    /// unjoinable key shapes are dropped with a warning.
    pub fn merge(&mut self, result: ProbeResult) {
        let probe = result.probe.clone();
        if result.category != self.category {
            warn!(
                probe = %probe,
                expected = %self.category,
                got = %result.category,
                "Ignoring result for another category"
            );
            return;
        }
        if let Some(existing) = self
            .layers
            .keys()
            .find(|k| !k.is_compatible_with(&result.key))
        {
            warn!(
                probe = %probe,
                "Ignoring result: key shape [{}] cannot be joined with [{}]",
                result.key,
                existing
            );
            return;
        }

        let join = result.join;
        let key = result.key.clone();
        let (table, errors) = result.into_table();
        for e in &errors {
            warn!(probe = %probe, "Dropping row: {e}");
        }
        if table.is_empty() {
            debug!(probe = %probe, "Probe returned no usable rows");
            return;
        }
        if join == JoinKind::Inner {
            self.required.insert(probe.clone());
        }

        let rows = table.len();
        match self.layers.get_mut(&key) {
            None => {
                self.layers.insert(key, table);
            }
            Some(layer) => {
                if let Err(e) = layer.merge_in(table, JoinKind::Outer) {
                    warn!(probe = %probe, "Ignoring result: {e}");
                    return;
                }
            }
        }
        debug!(probe = %probe, rows, "Merged probe result");
    }

    /// Combines every key shape into one table and applies inner-join restrictions.
    pub fn finish(self) -> UsageTable {
        let category = self.category;
        let mut layers: Vec<UsageTable> = self.layers.into_values().collect();
        layers.sort_by_key(|t| Reverse(t.key().len()));

        let mut layers = layers.into_iter();
        let Some(mut table) = layers.next() else {
            return UsageTable::new(category, default_key(category));
        };
        for layer in layers {
            if let Err(e) = table.merge_in(layer, JoinKind::Outer) {
                warn!(category = %category, "Skipping key shape: {e}");
            }
        }

        if !self.required.is_empty() {
            let before = table.len();
            table.retain(|row| self.required.iter().all(|p| row.sources().contains(p)));
            debug!(
                category = %category,
                dropped = before - table.len(),
                "Applied inner join restrictions"
            );
        }
        table
    }
}

fn default_key(category: Category) -> JoinKey {
    match category {
        Category::FunctionUsage => JoinKey::entity(),
        Category::SystemUsage => JoinKey::timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{MetricRecord, ProbeDescriptor};
    use crate::table::ENTITY;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn result(name: &str, key: JoinKey, records: Vec<MetricRecord>) -> ProbeResult {
        ProbeResult::new(
            &ProbeDescriptor::new(name, Category::FunctionUsage, key),
            records,
        )
    }

    fn merged(results: Vec<ProbeResult>) -> UsageTable {
        let mut joiner = Joiner::new(Category::FunctionUsage);
        for r in results {
            joiner.merge(r);
        }
        joiner.finish()
    }

    #[test]
    fn test_two_probes_same_key_merge_into_one_row() {
        let table = merged(vec![
            result(
                "a",
                JoinKey::entity(),
                vec![MetricRecord::new(1000).entity("f1").field("duration", 5.0)],
            ),
            result(
                "b",
                JoinKey::entity(),
                vec![MetricRecord::new(1000).entity("f1").field("invocations", 10.0)],
            ),
        ]);
        assert_eq!(table.len(), 1);
        let row = table.rows().next().unwrap();
        assert_eq!(row.number("duration"), Some(5.0));
        assert_eq!(row.number("invocations"), Some(10.0));
        assert_eq!(row.text(ENTITY), Some("f1"));
    }

    #[test]
    fn test_disjoint_entities_are_unioned() {
        let table = merged(vec![
            result(
                "a",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f1").field("duration", 1.0)],
            ),
            result(
                "b",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f2").field("invocations", 2.0)],
            ),
        ]);
        assert_eq!(table.len(), 2);
        let f1 = table.find(&[60_i64.into(), "f1".into()]).unwrap();
        assert_eq!(f1.number("duration"), Some(1.0));
        assert_eq!(f1.get("invocations"), None);
        let f2 = table.find(&[60_i64.into(), "f2".into()]).unwrap();
        assert_eq!(f2.number("invocations"), Some(2.0));
        assert_eq!(f2.get("duration"), None);
    }

    #[test]
    fn test_later_result_wins_on_overlap() {
        let table = merged(vec![
            result(
                "a",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f1").field("replicas", 1.0)],
            ),
            result(
                "b",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f1").field("replicas", 3.0)],
            ),
        ]);
        assert_eq!(table.rows().next().unwrap().number("replicas"), Some(3.0));
    }

    #[test]
    fn test_inner_probe_restricts_rows() {
        let logs = ProbeResult::new(
            &ProbeDescriptor::new("logs", Category::FunctionUsage, JoinKey::entity()).inner(),
            vec![MetricRecord::new(60).entity("f1").field("billed_duration", 12.0)],
        );
        let table = merged(vec![
            result(
                "metrics",
                JoinKey::entity(),
                vec![
                    MetricRecord::new(60).entity("f1").field("invocations", 4.0),
                    MetricRecord::new(60).entity("f2").field("invocations", 8.0),
                ],
            ),
            logs,
        ]);
        assert_eq!(table.len(), 1);
        let row = table.rows().next().unwrap();
        assert_eq!(row.text(ENTITY), Some("f1"));
        assert_eq!(row.number("billed_duration"), Some(12.0));
    }

    #[test]
    fn test_empty_inner_probe_does_not_restrict() {
        let logs = ProbeResult::empty(
            &ProbeDescriptor::new("logs", Category::FunctionUsage, JoinKey::entity()).inner(),
        );
        let table = merged(vec![
            logs,
            result(
                "metrics",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f1").field("invocations", 4.0)],
            ),
        ]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_duplicate_keys_dropped_with_warning() {
        let table = merged(vec![result(
            "a",
            JoinKey::entity(),
            vec![
                MetricRecord::new(60).entity("f1").field("x", 1.0),
                MetricRecord::new(60).entity("f1").field("x", 2.0),
                MetricRecord::new(60).entity("f2").field("x", 3.0),
            ],
        )]);
        assert_eq!(table.len(), 1);
        assert!(logs_contain("duplicate join key"));
    }

    #[test]
    #[traced_test]
    fn test_incompatible_shape_ignored() {
        let table = merged(vec![
            result(
                "by_entity",
                JoinKey::entity(),
                vec![MetricRecord::new(60).entity("f1").field("x", 1.0)],
            ),
            result(
                "by_node",
                JoinKey::node(),
                vec![MetricRecord::new(60).node("n1").field("y", 1.0)],
            ),
        ]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows().next().unwrap().get("y"), None);
        assert!(logs_contain("cannot be joined"));
    }

    #[test]
    fn test_other_category_ignored() {
        let mut joiner = Joiner::new(Category::SystemUsage);
        joiner.merge(result(
            "a",
            JoinKey::entity(),
            vec![MetricRecord::new(60).entity("f1").field("x", 1.0)],
        ));
        let table = joiner.finish();
        assert!(table.is_empty());
        assert_eq!(table.key(), &JoinKey::timestamp());
    }

    #[test]
    fn test_mixed_shapes_independent_of_order() {
        let wide = result(
            "per_node",
            JoinKey::entity_node(),
            vec![
                MetricRecord::new(60).entity("f1").node("n1").field("cpu", 1.0),
                MetricRecord::new(60).entity("f1").node("n2").field("cpu", 2.0),
            ],
        );
        let mid = result(
            "per_fn",
            JoinKey::entity(),
            vec![MetricRecord::new(60).entity("f1").field("replicas", 2.0)],
        );
        let narrow = result(
            "cluster",
            JoinKey::timestamp(),
            vec![MetricRecord::new(60).field("nodes", 2.0)],
        );

        let orders = [
            vec![wide.clone(), mid.clone(), narrow.clone()],
            vec![wide.clone(), narrow.clone(), mid.clone()],
            vec![mid.clone(), wide.clone(), narrow.clone()],
            vec![mid.clone(), narrow.clone(), wide.clone()],
            vec![narrow.clone(), wide.clone(), mid.clone()],
            vec![narrow, mid, wide],
        ];
        let tables: Vec<UsageTable> = orders.into_iter().map(merged).collect();
        for t in &tables[1..] {
            assert_eq!(t, &tables[0]);
        }
        assert_eq!(tables[0].len(), 2);
        for row in tables[0].rows() {
            assert_eq!(row.number("replicas"), Some(2.0));
            assert_eq!(row.number("nodes"), Some(2.0));
        }
    }

    fn probe_strategy(
        name: &'static str,
        field: &'static str,
    ) -> impl Strategy<Value = ProbeResult> {
        prop::collection::vec((0i64..4, 0usize..4, 0.0f64..100.0), 0..10).prop_map(
            move |samples| {
                let records = samples
                    .into_iter()
                    .map(|(ts, entity, v)| {
                        MetricRecord::new(ts * 60)
                            .entity(format!("f{entity}"))
                            .field(field, v)
                    })
                    .collect();
                result(name, JoinKey::entity(), records)
            },
        )
    }

    proptest! {
        #[test]
        fn merge_is_order_independent(
            (results, shuffled) in (
                probe_strategy("a", "duration"),
                probe_strategy("b", "invocations"),
                probe_strategy("c", "replicas"),
            )
                .prop_flat_map(|(a, b, c)| {
                    let results = vec![a, b, c];
                    (Just(results.clone()), Just(results).prop_shuffle())
                })
        ) {
            prop_assert_eq!(merged(results), merged(shuffled));
        }
    }
}
