// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{node_probes, pod_probes, Platform, PromProbes, RATE_INTERVAL};
use crate::derived::DerivedProbe;
use crate::normalizer::{EntityRule, UnitConversion};
use crate::probe::{Category, MetricProbe, ProbeDescriptor};
use crate::prometheus::{PromQueryProbe, TimeSeriesBackend};
use crate::registry::ProbeRegistry;
use crate::table::{Aggregation, JoinKey};
use std::sync::Arc;

/// Namespace suffix the gateway reports function names with.
pub const FUNCTION_NAMESPACE: &str = ".openfaas-fn";

const FUNCTION_LABEL: &str = "function_name";
const POD_SELECTOR: &str = "pod=~\".*.*\", namespace=~\".*openfaas-fn.*\"";

/// Pod names lose their replicaset suffix and gain the namespace, so
/// `figlet-7d9f8b6c4-x2x7k` and the gateway's `figlet.openfaas-fn` agree.
pub fn entity_rule() -> EntityRule {
    EntityRule::ControllerPod {
        suffix: FUNCTION_NAMESPACE.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFaasOptions {
    /// Attribute node power draw to functions by their CPU share.
    pub power_collection: bool,
}

/// `gateway` serves the OpenFaaS gateway metrics, `kube` the cluster metrics.
pub fn registry(
    gateway: Arc<dyn TimeSeriesBackend>,
    kube: Arc<dyn TimeSeriesBackend>,
    options: OpenFaasOptions,
) -> ProbeRegistry {
    let functions = PromProbes::new(gateway, entity_rule());
    let pods = PromProbes::new(kube.clone(), entity_rule());
    let invocations = |code: &str| {
        format!("increase(gateway_function_invocation_total{{code='{code}'}}[{RATE_INTERVAL}])")
    };

    let mut registry = ProbeRegistry::new(
        Platform::OpenFaas.as_str(),
        entity_rule(),
        Platform::OpenFaas.deadline(),
    );
    let gateway_probes = [
        functions.function(
            "average_execution_time",
            FUNCTION_LABEL,
            format!(
                "rate(gateway_functions_seconds_sum[{RATE_INTERVAL}]) / \
                 rate(gateway_functions_seconds_count[{RATE_INTERVAL}])"
            ),
            UnitConversion::Identity,
        ),
        functions.function(
            "percentile_90_exec_time",
            FUNCTION_LABEL,
            format!(
                "histogram_quantile(0.9, rate(gateway_functions_seconds_bucket[{RATE_INTERVAL}]))"
            ),
            UnitConversion::Identity,
        ),
        functions.function(
            "success_invocations",
            FUNCTION_LABEL,
            invocations("200"),
            UnitConversion::Identity,
        ),
        functions.function(
            "500_error_invocations",
            FUNCTION_LABEL,
            invocations("500"),
            UnitConversion::Identity,
        ),
        functions.function(
            "502_error_invocations",
            FUNCTION_LABEL,
            invocations("502"),
            UnitConversion::Identity,
        ),
    ];
    let power_probes = [
        pods.system(
            "avg_power_consumption",
            format!(
                "irate(powerexporter_power_consumption_ampere_seconds_total\
                 {{instance=~\".*.*\"}}[{RATE_INTERVAL}])"
            ),
        ),
        pods.system(
            "avg_current_usage",
            format!("irate(powerexporter_current_ampere{{instance=~\".*.*\"}}[{RATE_INTERVAL}])"),
        ),
    ];

    for probe in gateway_probes
        .into_iter()
        .chain(pod_probes(&pods, POD_SELECTOR))
        .chain(node_probes(&pods))
        .chain(power_probes)
    {
        registry.register(probe);
    }
    if options.power_collection {
        registry.register(power_usage(&pods, kube));
    }
    registry
}

/// `pods-power-usage-sum = pods-cpu-sum / avg_cpu_user * avg_power_consumption`, per node
/// then summed per function.
fn power_usage(pods: &PromProbes, kube: Arc<dyn TimeSeriesBackend>) -> Arc<dyn MetricProbe> {
    let cpu_per_pod = pods.pods_probe(
        "pods-cpu-sum",
        format!(
            "sum(node_namespace_pod_container:container_cpu_usage_seconds_total:sum_irate\
             {{{POD_SELECTOR}}}) by (pod,node)"
        ),
        JoinKey::entity_node(),
        Aggregation::Sum,
    );
    let cpu_per_node = PromQueryProbe::range(
        per_node("avg_cpu_user"),
        kube.clone(),
        format!(
            "irate(node_cpu_seconds_total{{instance=~\".*.*\", mode!=\"idle\"}}[{RATE_INTERVAL}])"
        ),
    )
    .node_from("instance")
    .aggregate(Aggregation::Sum);
    let power_per_node = PromQueryProbe::range(
        per_node("avg_power_consumption"),
        kube,
        "idelta(powerexporter_power_consumption_ampere_seconds_total{instance=~\".*.*\"}[1m:10s])",
    )
    .node_from("instance");

    let inputs: Vec<Arc<dyn MetricProbe>> = vec![
        Arc::new(cpu_per_pod),
        Arc::new(cpu_per_node),
        Arc::new(power_per_node),
    ];
    Arc::new(DerivedProbe::new(
        ProbeDescriptor::new("pods-power-usage-sum", Category::FunctionUsage, JoinKey::entity())
            .field("pods-power-usage-sum", UnitConversion::Identity),
        inputs,
        |row| {
            Some(
                row.number("pods-cpu-sum")? / row.number("avg_cpu_user")?
                    * row.number("avg_power_consumption")?,
            )
        },
    ))
}

fn per_node(field: &str) -> ProbeDescriptor {
    ProbeDescriptor::new(field, Category::FunctionUsage, JoinKey::node())
        .field(field, UnitConversion::Identity)
}
