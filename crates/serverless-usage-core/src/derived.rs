// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ProbeError;
use crate::probe::{MetricProbe, ProbeDescriptor, ProbeResult, Window};
use crate::table::{Aggregation, JoinKind, Row, UsageTable};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes one value from a joined row. `None` leaves the row out.
pub type RowExpr = Arc<dyn Fn(&Row) -> Option<f64> + Send + Sync>;

/// A probe whose value is computed from other probes.
///
/// The inputs run concurrently and are inner-joined on their key columns. `expr` is
/// evaluated on every joined row and the results are aggregated down to the
/// descriptor key. Any failing input fails the probe; any empty input empties it.
pub struct DerivedProbe {
    descriptor: ProbeDescriptor,
    inputs: Vec<Arc<dyn MetricProbe>>,
    expr: RowExpr,
    aggregation: Aggregation,
}

impl DerivedProbe {
    pub fn new(
        descriptor: ProbeDescriptor,
        inputs: Vec<Arc<dyn MetricProbe>>,
        expr: impl Fn(&Row) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        DerivedProbe {
            descriptor,
            inputs,
            expr: Arc::new(expr),
            aggregation: Aggregation::Sum,
        }
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

#[async_trait]
impl MetricProbe for DerivedProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    async fn execute(&self, window: Window) -> Result<ProbeResult, ProbeError> {
        let name = self.descriptor.name.as_str();
        let results = try_join_all(self.inputs.iter().map(|p| p.execute(window))).await?;

        let mut joined: Option<UsageTable> = None;
        for result in results {
            let input = result.probe.clone();
            if result.is_empty() {
                debug!(input = %input, "Input returned no data");
                return Ok(ProbeResult::empty(&self.descriptor));
            }
            let (table, errors) = result.into_table();
            for e in &errors {
                warn!(input = %input, "Dropping row: {e}");
            }
            joined = Some(match joined {
                None => table,
                Some(acc) => acc
                    .join(table, JoinKind::Inner)
                    .map_err(|e| ProbeError::Parse {
                        probe: name.to_string(),
                        message: e.to_string(),
                    })?,
            });
        }
        let Some(joined) = joined else {
            return Ok(ProbeResult::empty(&self.descriptor));
        };

        let field = self.descriptor.primary_field();
        let rows = joined.rows().filter_map(|row| {
            let value = (self.expr)(row).filter(|v| v.is_finite())?;
            let mut out = Row::new().with_source(name).with(field, value);
            for column in joined.key().columns() {
                if let Some(v) = row.get(column) {
                    out.set(column, v.clone());
                }
            }
            Some(out)
        });
        let table = UsageTable::group_rows(
            self.descriptor.category,
            self.descriptor.key.clone(),
            rows,
            self.aggregation,
        );
        Ok(ProbeResult::from_table(&self.descriptor, &table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::UnitConversion;
    use crate::probe::{Category, MetricRecord};
    use crate::table::JoinKey;

    struct Fixed {
        descriptor: ProbeDescriptor,
        records: Vec<MetricRecord>,
    }

    #[async_trait]
    impl MetricProbe for Fixed {
        fn descriptor(&self) -> &ProbeDescriptor {
            &self.descriptor
        }

        async fn execute(&self, _window: Window) -> Result<ProbeResult, ProbeError> {
            Ok(ProbeResult::new(&self.descriptor, self.records.clone()))
        }
    }

    struct Failing(ProbeDescriptor);

    #[async_trait]
    impl MetricProbe for Failing {
        fn descriptor(&self) -> &ProbeDescriptor {
            &self.0
        }

        async fn execute(&self, _window: Window) -> Result<ProbeResult, ProbeError> {
            Err(ProbeError::Timeout {
                probe: self.0.name.clone(),
            })
        }
    }

    fn fixed(name: &str, key: JoinKey, records: Vec<MetricRecord>) -> Arc<dyn MetricProbe> {
        Arc::new(Fixed {
            descriptor: ProbeDescriptor::new(name, Category::FunctionUsage, key)
                .field(name, UnitConversion::Identity),
            records,
        })
    }

    fn window() -> Window {
        Window {
            start: 0,
            end: 300,
            step: 60,
        }
    }

    fn power(inputs: Vec<Arc<dyn MetricProbe>>) -> DerivedProbe {
        DerivedProbe::new(
            ProbeDescriptor::new("power", Category::FunctionUsage, JoinKey::entity())
                .field("power", UnitConversion::Identity),
            inputs,
            |row| {
                Some(
                    row.number("pods-cpu-sum")? / row.number("avg_cpu_user")?
                        * row.number("avg_power_consumption")?,
                )
            },
        )
    }

    #[tokio::test]
    async fn test_power_attribution() {
        let pods = fixed(
            "pods-cpu-sum",
            JoinKey::entity_node(),
            vec![
                MetricRecord::new(60).entity("f1").node("n1").field("pods-cpu-sum", 0.5),
                MetricRecord::new(60).entity("f1").node("n2").field("pods-cpu-sum", 0.25),
                MetricRecord::new(60).entity("f2").node("n1").field("pods-cpu-sum", 0.5),
                MetricRecord::new(60).entity("f3").node("n9").field("pods-cpu-sum", 1.0),
            ],
        );
        let cpu = fixed(
            "avg_cpu_user",
            JoinKey::node(),
            vec![
                MetricRecord::new(60).node("n1").field("avg_cpu_user", 1.0),
                MetricRecord::new(60).node("n2").field("avg_cpu_user", 0.5),
            ],
        );
        let watts = fixed(
            "avg_power_consumption",
            JoinKey::node(),
            vec![
                MetricRecord::new(60).node("n1").field("avg_power_consumption", 10.0),
                MetricRecord::new(60).node("n2").field("avg_power_consumption", 4.0),
            ],
        );

        let result = power(vec![pods, cpu, watts]).execute(window()).await.unwrap();
        let by_entity: Vec<(String, f64)> = result
            .records
            .iter()
            .map(|r| (r.entity_id.clone().unwrap(), r.fields["power"]))
            .collect();
        // f1: 0.5/1*10 + 0.25/0.5*4, f3 has no node metrics
        assert_eq!(
            by_entity,
            vec![("f1".to_string(), 7.0), ("f2".to_string(), 5.0)]
        );
    }

    #[tokio::test]
    async fn test_empty_input_empties_result() {
        let pods = fixed(
            "pods-cpu-sum",
            JoinKey::entity_node(),
            vec![MetricRecord::new(60).entity("f1").node("n1").field("pods-cpu-sum", 0.5)],
        );
        let cpu = fixed("avg_cpu_user", JoinKey::node(), vec![]);
        let result = power(vec![pods, cpu]).execute(window()).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.probe, "power");
    }

    #[tokio::test]
    async fn test_failing_input_fails_probe() {
        let pods = fixed("pods-cpu-sum", JoinKey::entity_node(), vec![]);
        let broken: Arc<dyn MetricProbe> = Arc::new(Failing(ProbeDescriptor::new(
            "avg_cpu_user",
            Category::FunctionUsage,
            JoinKey::node(),
        )));
        let err = power(vec![pods, broken]).execute(window()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_non_finite_values_are_skipped() {
        let pods = fixed(
            "pods-cpu-sum",
            JoinKey::entity_node(),
            vec![MetricRecord::new(60).entity("f1").node("n1").field("pods-cpu-sum", 0.5)],
        );
        let cpu = fixed(
            "avg_cpu_user",
            JoinKey::node(),
            vec![MetricRecord::new(60).node("n1").field("avg_cpu_user", 0.0)],
        );
        let watts = fixed(
            "avg_power_consumption",
            JoinKey::node(),
            vec![MetricRecord::new(60).node("n1").field("avg_power_consumption", 3.0)],
        );
        let result = power(vec![pods, cpu, watts]).execute(window()).await.unwrap();
        assert!(result.is_empty());
    }
}
