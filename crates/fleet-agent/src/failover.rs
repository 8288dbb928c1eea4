use crate::capability::{
    invoke_with_deadline, CapabilityError, CapabilityOutput, CapabilityPort, CapabilityRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour: how many attempts, and how long to back off.
///
/// Shared by provider failover and by the agent runtime's recovery delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per provider before moving to the next one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// A `CapabilityPort` that wraps several providers and performs automatic
/// failover with exponential-backoff retries.
///
/// For each request it tries providers in order. Within each provider it
/// retries up to `max_retries` times for transient errors (timeout, rate
/// limit). A provider error moves on to the next provider immediately. If
/// every provider fails, the last error is returned.
pub struct FailoverCapability {
    name: String,
    members: Vec<Arc<dyn CapabilityPort>>,
    policy: RetryPolicy,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverCapability {
    /// Returns `None` when `members` is empty.
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<dyn CapabilityPort>>,
        policy: RetryPolicy,
    ) -> Option<Self> {
        if members.is_empty() {
            return None;
        }
        Some(Self {
            name: name.into(),
            members,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl CapabilityPort for FailoverCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        let mut last_err: Option<CapabilityError> = None;

        for member in &self.members {
            for attempt in 0..=self.policy.max_retries {
                match invoke_with_deadline(member.as_ref(), request).await {
                    Ok(output) => return Ok(output),
                    Err(e) => {
                        if !e.is_transient() {
                            warn!(
                                provider = member.name(),
                                attempt,
                                error = %e,
                                "Provider error, moving to next provider"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = match &e {
                                CapabilityError::RateLimited {
                                    retry_after_ms: Some(after),
                                } => (*after).min(self.policy.backoff_max_ms),
                                _ => compute_backoff(&self.policy, attempt),
                            };
                            info!(
                                provider = member.name(),
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Transient capability error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CapabilityError::Provider(format!("all providers behind '{}' exhausted", self.name))
        }))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
