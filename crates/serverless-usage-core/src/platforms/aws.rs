// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Platform;
use crate::cloud::{InvocationLogProbe, LogQueryClient, MetricInsightsClient, MetricInsightsProbe};
use crate::normalizer::{EntityRule, UnitConversion};
use crate::probe::{Category, MetricProbe, ProbeDescriptor};
use crate::registry::ProbeRegistry;
use crate::table::JoinKey;
use std::sync::Arc;

const NAMESPACE: &str = "AWS/Lambda";

/// Fields read from each Lambda REPORT line.
pub const INVOCATION_LOG_QUERY: &str =
    "fields @timestamp, @billedDuration, @duration, @ingestionTime, @maxMemoryUsed, @memorySize";

pub fn entity_rule() -> EntityRule {
    EntityRule::StripSeparators
}

/// Metrics Insights statement for `stat(metric)` per function.
pub fn insights_query(stat: &str, metric: &str) -> String {
    format!(
        "SELECT {stat}({metric}) FROM SCHEMA(\"{NAMESPACE}\", FunctionName) \
         GROUP BY FunctionName ORDER BY {stat}() DESC"
    )
}

pub fn registry(
    metrics: Arc<dyn MetricInsightsClient>,
    logs: Arc<dyn LogQueryClient>,
) -> ProbeRegistry {
    let statistic =
        |name: &str, stat: &str, metric: &str, unit: UnitConversion| -> Arc<dyn MetricProbe> {
            Arc::new(MetricInsightsProbe::new(
                ProbeDescriptor::new(name, Category::FunctionUsage, JoinKey::entity())
                    .field(name, unit),
                metrics.clone(),
                insights_query(stat, metric),
                entity_rule(),
            ))
        };

    let invocation_logs = InvocationLogProbe::new(
        ProbeDescriptor::new("invocation_logs", Category::FunctionUsage, JoinKey::entity())
            .field("billed_duration", UnitConversion::Identity)
            .field("pods-mem-sum-bytes", UnitConversion::Identity)
            .field("pods-mem-limits", UnitConversion::Identity),
        logs,
        INVOCATION_LOG_QUERY,
        entity_rule(),
    );

    ProbeRegistry::new(Platform::Aws.as_str(), entity_rule(), Platform::Aws.deadline())
        .with(statistic(
            "average_execution_time",
            "AVG",
            "Duration",
            UnitConversion::MillisToSeconds,
        ))
        .with(statistic(
            "success_invocations",
            "SUM",
            "Invocations",
            UnitConversion::Identity,
        ))
        .with(statistic(
            "replicas",
            "AVG",
            "ConcurrentExecutions",
            UnitConversion::Identity,
        ))
        .with(statistic(
            "post_runtime_duration",
            "AVG",
            "PostRuntimeExtensionsDuration",
            UnitConversion::Identity,
        ))
        .with(Arc::new(invocation_logs))
}
