// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::normalizer::{EntityRule, UnitConversion};
use crate::probe::{Category, MetricProbe};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The set of probes a platform contributes, plus how its entity ids are canonicalized.
#[derive(Clone)]
pub struct ProbeRegistry {
    platform: String,
    entity_rule: EntityRule,
    deadline: Duration,
    probes: Vec<Arc<dyn MetricProbe>>,
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("platform", &self.platform)
            .field("entity_rule", &self.entity_rule)
            .field("deadline", &self.deadline)
            .field(
                "probes",
                &self
                    .probes
                    .iter()
                    .map(|p| p.descriptor().name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProbeRegistry {
    pub fn new(platform: impl Into<String>, entity_rule: EntityRule, deadline: Duration) -> Self {
        ProbeRegistry {
            platform: platform.into(),
            entity_rule,
            deadline,
            probes: Vec::new(),
        }
    }

    pub fn register(&mut self, probe: Arc<dyn MetricProbe>) -> &mut Self {
        self.probes.push(probe);
        self
    }

    pub fn with(mut self, probe: Arc<dyn MetricProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn entity_rule(&self) -> &EntityRule {
        &self.entity_rule
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn probes_for(&self, category: Category) -> Vec<Arc<dyn MetricProbe>> {
        self.probes
            .iter()
            .filter(|p| p.descriptor().category == category)
            .cloned()
            .collect()
    }

    /// Unit conversion per declared field of `category`. A field declared twice must
    /// agree on its conversion.
    pub fn field_units(
        &self,
        category: Category,
    ) -> Result<BTreeMap<String, UnitConversion>, ConfigError> {
        let mut units = BTreeMap::new();
        for probe in self.probes_for(category) {
            for field in &probe.descriptor().fields {
                match units.insert(field.name.clone(), field.unit) {
                    Some(previous) if previous != field.unit => {
                        return Err(ConfigError::ConflictingUnits {
                            field: field.name.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeError;
    use crate::probe::{ProbeDescriptor, ProbeResult, Window};
    use crate::table::JoinKey;
    use async_trait::async_trait;

    struct Fixed(ProbeDescriptor);

    #[async_trait]
    impl MetricProbe for Fixed {
        fn descriptor(&self) -> &ProbeDescriptor {
            &self.0
        }

        async fn execute(&self, _window: Window) -> Result<ProbeResult, ProbeError> {
            Ok(ProbeResult::empty(&self.0))
        }
    }

    fn probe(
        name: &str,
        category: Category,
        field: &str,
        unit: UnitConversion,
    ) -> Arc<dyn MetricProbe> {
        let key = match category {
            Category::FunctionUsage => JoinKey::entity(),
            Category::SystemUsage => JoinKey::timestamp(),
        };
        Arc::new(Fixed(ProbeDescriptor::new(name, category, key).field(field, unit)))
    }

    #[test]
    fn test_probes_for_category() {
        let registry = ProbeRegistry::new("test", EntityRule::Verbatim, Duration::from_secs(30))
            .with(probe("a", Category::FunctionUsage, "a", UnitConversion::Identity))
            .with(probe("b", Category::SystemUsage, "b", UnitConversion::Identity))
            .with(probe("c", Category::FunctionUsage, "c", UnitConversion::Identity));
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.probes_for(Category::FunctionUsage).len(), 2);
        assert_eq!(registry.probes_for(Category::SystemUsage).len(), 1);
    }

    #[test]
    fn test_field_units() {
        let registry = ProbeRegistry::new("test", EntityRule::Verbatim, Duration::from_secs(30))
            .with(probe("a", Category::FunctionUsage, "duration", UnitConversion::MillisToSeconds))
            .with(probe("b", Category::FunctionUsage, "memory", UnitConversion::Identity));
        let units = registry.field_units(Category::FunctionUsage).unwrap();
        assert_eq!(units.get("duration"), Some(&UnitConversion::MillisToSeconds));
        assert_eq!(units.len(), 2);
        assert!(registry.field_units(Category::SystemUsage).unwrap().is_empty());
    }

    #[test]
    fn test_conflicting_units_rejected() {
        let registry = ProbeRegistry::new("test", EntityRule::Verbatim, Duration::from_secs(30))
            .with(probe("a", Category::FunctionUsage, "duration", UnitConversion::MillisToSeconds))
            .with(probe("b", Category::FunctionUsage, "duration", UnitConversion::Identity));
        assert!(matches!(
            registry.field_units(Category::FunctionUsage),
            Err(ConfigError::ConflictingUnits { .. })
        ));
    }
}
