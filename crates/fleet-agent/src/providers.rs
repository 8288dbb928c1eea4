use crate::capability::{
    CapabilityError, CapabilityOutput, CapabilityPort, CapabilityRequest, CapabilitySlot,
};
use crate::config::{ProviderConfig, ProviderKind};
use crate::failover::FailoverCapability;
use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Deterministic local provider.
///
/// Generation requests echo the first line of the prompt behind a fixed
/// prefix; scoring requests return a fixed probability. Used for local runs
/// and as a stand-in until a real provider is wired in.
pub struct StaticCapability {
    name: String,
    prefix: String,
    probability: f64,
    latency: Duration,
}

impl StaticCapability {
    /// Provider answering with fixed output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            probability: 0.5,
            latency: Duration::ZERO,
        }
    }

    /// Prefix for generated text.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Score returned by scoring calls.
    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl CapabilityPort for StaticCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match request.slot {
            CapabilitySlot::Generation => {
                let headline = request.prompt.lines().last().unwrap_or_default().trim();
                Ok(CapabilityOutput::Text(format!("{}{headline}", self.prefix)))
            }
            CapabilitySlot::Scoring => Ok(CapabilityOutput::Probability(self.probability)),
        }
    }
}

/// Named providers that agent specs bind to.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    providers: HashMap<String, Arc<dyn CapabilityPort>>,
}

impl CapabilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, port: Arc<dyn CapabilityPort>) {
        self.providers.insert(name.into(), port);
    }

    /// Provider registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityPort>> {
        self.providers.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build a registry from configuration.
    ///
    /// Static providers are registered first so failover pools may reference
    /// them regardless of declaration order. Pools may not reference other
    /// pools.
    pub fn from_configs(configs: &[ProviderConfig]) -> FleetResult<Self> {
        let mut registry = Self::new();

        for config in configs {
            if let ProviderKind::Static {
                prefix,
                probability,
                latency_ms,
            } = &config.kind
            {
                let port = StaticCapability::new(&config.name)
                    .with_prefix(prefix.clone())
                    .with_probability(*probability)
                    .with_latency(Duration::from_millis(*latency_ms));
                registry.register(&config.name, Arc::new(port));
            }
        }

        for config in configs {
            if let ProviderKind::Failover {
                members,
                retry_policy,
            } = &config.kind
            {
                let mut ports = Vec::with_capacity(members.len());
                for member in members {
                    let port = registry.get(member).ok_or_else(|| {
                        FleetError::Config(format!(
                            "provider '{}' references unknown member '{member}'",
                            config.name
                        ))
                    })?;
                    ports.push(port);
                }
                let pool = FailoverCapability::new(&config.name, ports, retry_policy.clone())
                    .ok_or_else(|| {
                        FleetError::Config(format!(
                            "failover provider '{}' has no members",
                            config.name
                        ))
                    })?;
                registry.register(&config.name, Arc::new(pool));
            }
        }

        Ok(registry)
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::failover::RetryPolicy;

    #[tokio::test]
    async fn test_static_generation_and_scoring() {
        let port = StaticCapability::new("local")
            .with_prefix("draft: ")
            .with_probability(0.8);

        let text = port
            .invoke(&CapabilityRequest::new(
                CapabilitySlot::Generation,
                "system line\nWrite a launch teaser",
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        assert_eq!(text.as_text(), Some("draft: Write a launch teaser"));

        let score = port
            .invoke(&CapabilityRequest::new(
                CapabilitySlot::Scoring,
                "price?",
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        assert_eq!(score.as_probability(), Some(0.8));
    }

    #[test]
    fn test_probability_is_clamped() {
        let port = StaticCapability::new("x").with_probability(3.0);
        assert_eq!(port.probability, 1.0);
    }

    #[test]
    fn test_registry_from_configs_resolves_pools_after_statics() {
        let configs = vec![
            ProviderConfig {
                name: "pool".into(),
                kind: ProviderKind::Failover {
                    members: vec!["a".into(), "b".into()],
                    retry_policy: RetryPolicy::default(),
                },
            },
            ProviderConfig {
                name: "a".into(),
                kind: ProviderKind::Static {
                    prefix: String::new(),
                    probability: 0.5,
                    latency_ms: 0,
                },
            },
            ProviderConfig {
                name: "b".into(),
                kind: ProviderKind::Static {
                    prefix: String::new(),
                    probability: 0.5,
                    latency_ms: 0,
                },
            },
        ];
        let registry = CapabilityRegistry::from_configs(&configs).unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "pool"]);
        assert_eq!(registry.get("pool").unwrap().name(), "pool");
    }

    #[test]
    fn test_registry_rejects_unknown_member() {
        let configs = vec![ProviderConfig {
            name: "pool".into(),
            kind: ProviderKind::Failover {
                members: vec!["ghost".into()],
                retry_policy: RetryPolicy::default(),
            },
        }];
        let err = CapabilityRegistry::from_configs(&configs).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
