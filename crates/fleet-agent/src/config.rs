use crate::failover::RetryPolicy;
use serde::{Deserialize, Serialize};

/// A named capability provider as declared in the fleet config.
///
/// ```toml
/// [[providers]]
/// name = "local"
/// kind = "static"
/// probability = 0.6
///
/// [[providers]]
/// name = "pool"
/// kind = "failover"
/// members = ["local"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name agent specs bind to.
    pub name: String,
    /// Backend and its settings.
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Provider backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic in-process provider.
    Static {
        /// Prepended to every generated text.
        #[serde(default)]
        prefix: String,
        /// Score returned for every scoring call.
        #[serde(default = "default_probability")]
        probability: f64,
        /// Simulated call latency.
        #[serde(default)]
        latency_ms: u64,
    },
    /// Ordered pool of other providers with retry and backoff.
    Failover {
        /// Provider names tried in order.
        members: Vec<String>,
        /// Backoff between member attempts.
        #[serde(default)]
        retry_policy: RetryPolicy,
    },
}

fn default_probability() -> f64 {
    0.5
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Doc {
        providers: Vec<ProviderConfig>,
    }

    #[test]
    fn test_provider_config_from_toml() {
        let doc: Doc = toml::from_str(
            r#"
            [[providers]]
            name = "local"
            kind = "static"
            probability = 0.6

            [[providers]]
            name = "pool"
            kind = "failover"
            members = ["local"]
            retry_policy = { max_retries = 2 }
            "#,
        )
        .unwrap();

        assert_eq!(doc.providers.len(), 2);
        match &doc.providers[0].kind {
            ProviderKind::Static {
                probability,
                latency_ms,
                ..
            } => {
                assert_eq!(*probability, 0.6);
                assert_eq!(*latency_ms, 0);
            }
            other => panic!("expected static, got {other:?}"),
        }
        match &doc.providers[1].kind {
            ProviderKind::Failover {
                members,
                retry_policy,
            } => {
                assert_eq!(members, &vec!["local".to_string()]);
                assert_eq!(retry_policy.max_retries, 2);
                assert_eq!(retry_policy.backoff_base_ms, 500);
            }
            other => panic!("expected failover, got {other:?}"),
        }
    }
}
