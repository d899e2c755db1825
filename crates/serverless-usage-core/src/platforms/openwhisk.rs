// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{node_probes, pod_probes, Platform, PromProbes, RATE_INTERVAL};
use crate::normalizer::{EntityRule, UnitConversion};
use crate::prometheus::TimeSeriesBackend;
use crate::registry::ProbeRegistry;
use std::sync::Arc;

/// Separates the invoker prefix from the action name in OpenWhisk pod names.
pub const GUEST_MARKER: &str = "-guest-";

const ACTION_LABEL: &str = "action";
const POD_SELECTOR: &str = "pod=~\".*guest.*\", container=~\".*user-action.*\"";

/// `wskowdev-invoker-00-12-guest-hello-world` and `hello-world` both become `helloworld`.
pub fn entity_rule() -> EntityRule {
    EntityRule::Chain(vec![
        EntityRule::AfterMarker(GUEST_MARKER.to_string()),
        EntityRule::StripSeparators,
    ])
}

/// `platform` serves the OpenWhisk controller metrics, `kube` the cluster metrics.
pub fn registry(
    platform: Arc<dyn TimeSeriesBackend>,
    kube: Arc<dyn TimeSeriesBackend>,
) -> ProbeRegistry {
    let actions = PromProbes::new(platform, entity_rule());
    let kube = PromProbes::new(kube, entity_rule());
    let ratio = |metric: &str| {
        format!(
            "rate(openwhisk_action_{metric}_seconds_sum[{RATE_INTERVAL}]) / \
             rate(openwhisk_action_duration_seconds_count[{RATE_INTERVAL}])"
        )
    };

    let mut registry = ProbeRegistry::new(
        Platform::OpenWhisk.as_str(),
        entity_rule(),
        Platform::OpenWhisk.deadline(),
    );
    let probes = [
        actions.function(
            "cold_starts",
            ACTION_LABEL,
            format!("increase(openwhisk_action_coldStarts_total[{RATE_INTERVAL}])"),
            UnitConversion::Identity,
        ),
        actions.function(
            "success_invocations",
            ACTION_LABEL,
            format!("increase(openwhisk_action_activations_total[{RATE_INTERVAL}])"),
            UnitConversion::Identity,
        ),
        actions.function(
            "pod-mem-limits",
            ACTION_LABEL,
            "openwhisk_action_memory".to_string(),
            UnitConversion::MegabytesToBytes,
        ),
        actions.function(
            "average_execution_time",
            ACTION_LABEL,
            ratio("duration"),
            UnitConversion::Identity,
        ),
        actions.function("init_time", ACTION_LABEL, ratio("initTime"), UnitConversion::Identity),
        actions.function("wait_time", ACTION_LABEL, ratio("waitTime"), UnitConversion::Identity),
    ];
    for probe in probes
        .into_iter()
        .chain(pod_probes(&kube, POD_SELECTOR))
        .chain(node_probes(&kube))
    {
        registry.register(probe);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::probe::{Category, Window};
    use crate::prometheus::Series;
    use async_trait::async_trait;

    struct Unused;

    #[async_trait]
    impl TimeSeriesBackend for Unused {
        async fn query_range(
            &self,
            probe: &str,
            _expr: &str,
            _window: Window,
        ) -> Result<Vec<Series>, ProbeError> {
            Err(ProbeError::Timeout {
                probe: probe.to_string(),
            })
        }

        async fn query_instant(&self, probe: &str, _expr: &str) -> Result<Vec<Series>, ProbeError> {
            Err(ProbeError::Timeout {
                probe: probe.to_string(),
            })
        }
    }

    #[test]
    fn test_entity_rule() {
        let rule = entity_rule();
        assert_eq!(
            rule.canonicalize("wskowdev-invoker-00-12-guest-hello-world"),
            "helloworld"
        );
        assert_eq!(rule.canonicalize("hello-world"), "helloworld");
    }

    #[test]
    fn test_registry_contents() {
        let registry = registry(Arc::new(Unused), Arc::new(Unused));
        assert_eq!(registry.platform(), "OPENWHISK");
        assert_eq!(registry.probes_for(Category::FunctionUsage).len(), 18);
        assert_eq!(registry.probes_for(Category::SystemUsage).len(), 11);

        let units = registry.field_units(Category::FunctionUsage).unwrap();
        assert_eq!(units["pod-mem-limits"], UnitConversion::MegabytesToBytes);
        assert_eq!(units["replicas"], UnitConversion::Identity);
    }
}
