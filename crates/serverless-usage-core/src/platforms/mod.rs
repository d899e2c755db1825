// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Probe registries, one per supported platform.

pub mod aws;
pub mod gcf;
pub mod openfaas;
pub mod openwhisk;

use crate::error::ConfigError;
use crate::normalizer::{EntityRule, UnitConversion};
use crate::probe::{Category, MetricProbe, ProbeDescriptor};
use crate::prometheus::{PromQueryProbe, TimeSeriesBackend};
use crate::table::{Aggregation, JoinKey};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Collection deadline for platforms scraped through Prometheus.
pub const PROMETHEUS_DEADLINE: Duration = Duration::from_secs(30);
/// Collection deadline for managed cloud APIs.
pub const CLOUD_DEADLINE: Duration = Duration::from_secs(45);

/// Range vector used by rate style queries.
const RATE_INTERVAL: &str = "1m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    OpenWhisk,
    OpenFaas,
    Gcf,
    Aws,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::OpenWhisk => "OPENWHISK",
            Platform::OpenFaas => "OPENFAAS",
            Platform::Gcf => "GCF",
            Platform::Aws => "AWS",
        }
    }

    pub fn deadline(&self) -> Duration {
        match self {
            Platform::OpenWhisk | Platform::OpenFaas => PROMETHEUS_DEADLINE,
            Platform::Gcf | Platform::Aws => CLOUD_DEADLINE,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPENWHISK" => Ok(Platform::OpenWhisk),
            "OPENFAAS" => Ok(Platform::OpenFaas),
            "GCF" => Ok(Platform::Gcf),
            "AWS" => Ok(Platform::Aws),
            _ => Err(ConfigError::UnsupportedPlatform(s.to_string())),
        }
    }
}

/// Builds Prometheus probes sharing one backend and entity rule.
pub(crate) struct PromProbes {
    backend: Arc<dyn TimeSeriesBackend>,
    rule: EntityRule,
}

impl PromProbes {
    pub(crate) fn new(backend: Arc<dyn TimeSeriesBackend>, rule: EntityRule) -> Self {
        PromProbes { backend, rule }
    }

    /// Per-function metric whose entity is read from `label`.
    pub(crate) fn function(
        &self,
        name: &str,
        label: &'static str,
        expr: String,
        unit: UnitConversion,
    ) -> Arc<dyn MetricProbe> {
        Arc::new(
            PromQueryProbe::range(
                self.descriptor(name, Category::FunctionUsage, unit),
                self.backend.clone(),
                expr,
            )
            .entity_from(label, self.rule.clone()),
        )
    }

    /// Per-pod metric folded into its function.
    pub(crate) fn pods(
        &self,
        name: &str,
        expr: String,
        aggregation: Aggregation,
    ) -> Arc<dyn MetricProbe> {
        Arc::new(self.pods_probe(name, expr, JoinKey::entity(), aggregation))
    }

    pub(crate) fn pods_probe(
        &self,
        name: &str,
        expr: String,
        key: JoinKey,
        aggregation: Aggregation,
    ) -> PromQueryProbe {
        let mut descriptor =
            self.descriptor(name, Category::FunctionUsage, UnitConversion::Identity);
        descriptor.key = key;
        PromQueryProbe::range(descriptor, self.backend.clone(), expr)
            .entity_from("pod", self.rule.clone())
            .node_from("node")
            .aggregate(aggregation)
    }

    /// Per-node metric averaged over the cluster.
    pub(crate) fn system(&self, name: &str, expr: String) -> Arc<dyn MetricProbe> {
        Arc::new(
            PromQueryProbe::range(
                self.descriptor(name, Category::SystemUsage, UnitConversion::Identity),
                self.backend.clone(),
                expr,
            )
            .node_from("instance"),
        )
    }

    fn descriptor(&self, name: &str, category: Category, unit: UnitConversion) -> ProbeDescriptor {
        let key = match category {
            Category::FunctionUsage => JoinKey::entity(),
            Category::SystemUsage => JoinKey::timestamp(),
        };
        ProbeDescriptor::new(name, category, key).field(name, unit)
    }
}

/// Node level probes every Kubernetes based platform shares.
pub(crate) fn node_probes(kube: &PromProbes) -> Vec<Arc<dyn MetricProbe>> {
    let cpu = |mode: &str| {
        format!(
            "irate(node_cpu_seconds_total{{instance=~\".*.*\", mode=\"{mode}\"}}[{RATE_INTERVAL}])"
        )
    };
    vec![
        kube.system(
            "network_bytes_transmitted",
            format!("irate(container_network_transmit_bytes_total[{RATE_INTERVAL}])"),
        ),
        kube.system("avg_cpu_system", cpu("system")),
        kube.system("avg_cpu_user", cpu("user")),
        kube.system("avg_cpu_iowait", cpu("iowait")),
        kube.system("avg_cpu_idle", cpu("idle")),
        kube.system(
            "total_avg_mem_per_node",
            "node_memory_MemTotal_bytes{instance=~\".*.*\"}".to_string(),
        ),
        kube.system(
            "avg_memory_usage_percent",
            "(1 - (node_memory_MemAvailable_bytes{instance=~\".*.*\"} / \
             (node_memory_MemTotal_bytes{instance=~\".*.*\"}))) * 100"
                .to_string(),
        ),
        kube.system(
            "disk_writes_bytes",
            format!("irate(node_disk_written_bytes_total[{RATE_INTERVAL}])"),
        ),
        kube.system(
            "disk_read_bytes",
            format!("irate(node_disk_read_bytes_total[{RATE_INTERVAL}])"),
        ),
        kube.system(
            "disk_read_iops",
            format!("irate(node_disk_reads_completed_total[{RATE_INTERVAL}])"),
        ),
        kube.system(
            "disk_write_iops",
            format!("irate(node_disk_writes_completed_total[{RATE_INTERVAL}])"),
        ),
    ]
}

/// Pod resource probes; `selector` picks the function pods.
pub(crate) fn pod_probes(kube: &PromProbes, selector: &str) -> Vec<Arc<dyn MetricProbe>> {
    let cadvisor = format!("job=~\"kubelet\", metrics_path=~\"/metrics/cadvisor\", {selector}");
    let by_pod = |metric: &str, filter: &str| {
        format!("sum(irate({metric}{{{filter}}}[{RATE_INTERVAL}])) by (pod,node)")
    };
    vec![
        kube.pods(
            "replicas",
            format!("count(kube_pod_info{{{selector}}}) by (pod)"),
            Aggregation::Sum,
        ),
        kube.pods(
            "pods-cpu-sum",
            format!(
                "sum(node_namespace_pod_container:container_cpu_usage_seconds_total:sum_irate\
                 {{{selector}}}) by (pod,node)"
            ),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-cpu-requests",
            format!(
                "sum(kube_pod_container_resource_requests{{{selector}, resource=~\"cpu\"}}) \
                 by (pod,node)"
            ),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-cpu-limits",
            format!(
                "sum(kube_pod_container_resource_limits{{{selector}, resource=~\"cpu\"}}) \
                 by (pod,node)"
            ),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-mem-sum-bytes",
            format!(
                "sum(node_namespace_pod_container:container_memory_working_set_bytes\
                 {{{selector}}}) by (pod,node)"
            ),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-file-descp-sum",
            format!("irate(container_file_descriptors{{{selector}}}[{RATE_INTERVAL}])"),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-iops-reads-sum",
            by_pod("container_fs_reads_total", &cadvisor),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-iops-writes-sum",
            by_pod("container_fs_writes_total", &cadvisor),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-network-transmit-bytes",
            by_pod("container_network_transmit_bytes_total", &cadvisor),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-network-receive-bytes",
            by_pod("container_network_receive_bytes_total", &cadvisor),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-fs-write-bytes",
            by_pod("container_fs_writes_bytes_total", &cadvisor),
            Aggregation::Mean,
        ),
        kube.pods(
            "pods-fs-read-bytes",
            by_pod("container_fs_reads_bytes_total", &cadvisor),
            Aggregation::Mean,
        ),
    ]
}
