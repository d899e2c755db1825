// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Platform;
use crate::cloud::{CloudMetricProbe, CloudMetricsClient, PointField};
use crate::normalizer::{EntityRule, UnitConversion};
use crate::probe::{Category, ProbeDescriptor};
use crate::registry::ProbeRegistry;
use crate::table::JoinKey;
use std::sync::Arc;

const METRIC_PREFIX: &str = "cloudfunctions.googleapis.com/function/";
const FUNCTION_LABEL: &str = "function_name";
/// Active instances are reported one interval late.
const ACTIVE_INSTANCES_SHIFT: i64 = -60;

pub fn entity_rule() -> EntityRule {
    EntityRule::StripSeparators
}

fn descriptor(name: &str) -> ProbeDescriptor {
    ProbeDescriptor::new(name, Category::FunctionUsage, JoinKey::entity())
}

pub fn registry(client: Arc<dyn CloudMetricsClient>) -> ProbeRegistry {
    let metric = |name: &str| format!("{METRIC_PREFIX}{name}");

    let execution_times = CloudMetricProbe::new(
        descriptor("execution_times")
            .field("average_execution_time", UnitConversion::NanosToSeconds)
            .field("success_invocations", UnitConversion::Identity)
            .field("pods-mem-limits", UnitConversion::MegabytesToBytes),
        client.clone(),
        metric("execution_times"),
        FUNCTION_LABEL,
        entity_rule(),
    )
    .extract(vec![
        ("average_execution_time", PointField::Value),
        ("success_invocations", PointField::Count),
        ("pods-mem-limits", PointField::Label("memory".to_string())),
    ]);
    let memory = CloudMetricProbe::new(
        descriptor("user_memory_bytes").field("pods-mem-sum-bytes", UnitConversion::Identity),
        client.clone(),
        metric("user_memory_bytes"),
        FUNCTION_LABEL,
        entity_rule(),
    );
    let instances = CloudMetricProbe::new(
        descriptor("active_instances").field("replicas", UnitConversion::Identity),
        client.clone(),
        metric("active_instances"),
        FUNCTION_LABEL,
        entity_rule(),
    )
    .shift(ACTIVE_INSTANCES_SHIFT);
    let egress = CloudMetricProbe::new(
        descriptor("network_egress").field("pods-network-transmit-bytes", UnitConversion::Identity),
        client,
        metric("network_egress"),
        FUNCTION_LABEL,
        entity_rule(),
    );

    ProbeRegistry::new(Platform::Gcf.as_str(), entity_rule(), Platform::Gcf.deadline())
        .with(Arc::new(execution_times))
        .with(Arc::new(memory))
        .with(Arc::new(instances))
        .with(Arc::new(egress))
}
