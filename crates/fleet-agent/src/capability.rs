use async_trait::async_trait;
use fleet_core::{FleetError, Parameters};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The kind of signal an agent needs from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilitySlot {
    /// Free-form text generation (copy, replies, plans).
    Generation,
    /// A probability-like score in `[0, 1]` (pricing, risk, fit).
    Scoring,
}

impl std::fmt::Display for CapabilitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilitySlot::Generation => write!(f, "generation"),
            CapabilitySlot::Scoring => write!(f, "scoring"),
        }
    }
}

/// A single call into a capability provider.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    /// Slot the call is made for.
    pub slot: CapabilitySlot,
    /// Rendered prompt.
    pub prompt: String,
    /// Agent parameters passed through to the provider.
    pub parameters: Parameters,
    /// Per-call deadline, enforced by [`invoke_with_deadline`].
    pub deadline: Duration,
}

impl CapabilityRequest {
    /// Request with no parameters.
    pub fn new(slot: CapabilitySlot, prompt: impl Into<String>, deadline: Duration) -> Self {
        Self {
            slot,
            prompt: prompt.into(),
            parameters: Parameters::new(),
            deadline,
        }
    }

    /// Attach agent parameters.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// What a provider produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum CapabilityOutput {
    /// Generated text.
    Text(String),
    /// Score in `[0, 1]`.
    Probability(f64),
}

impl CapabilityOutput {
    /// The text, when this is a generation result.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CapabilityOutput::Text(t) => Some(t),
            CapabilityOutput::Probability(_) => None,
        }
    }

    /// The score, when this is a scoring result.
    pub fn as_probability(&self) -> Option<f64> {
        match self {
            CapabilityOutput::Probability(p) => Some(*p),
            CapabilityOutput::Text(_) => None,
        }
    }
}

/// Failure modes of a capability call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// The call outlived its deadline.
    #[error("capability call timed out after {after_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        after_ms: u64,
    },

    /// The provider asked callers to slow down.
    #[error("capability rate limited")]
    RateLimited {
        /// Suggested wait, when the provider gave one.
        retry_after_ms: Option<u64>,
    },

    /// Any other provider failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl CapabilityError {
    /// Timeouts and rate limits are worth retrying; provider errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout { .. } | CapabilityError::RateLimited { .. }
        )
    }
}

impl From<CapabilityError> for FleetError {
    fn from(err: CapabilityError) -> Self {
        if err.is_transient() {
            FleetError::TransientExecution(err.to_string())
        } else {
            FleetError::Capability(err.to_string())
        }
    }
}

/// Uniform boundary to an external text/decision provider.
///
/// Implementations must be stateless with respect to callers: the engine may
/// invoke the same port concurrently from many agents and retries freely.
///
/// To plug in a new provider:
/// 1. Implement `CapabilityPort` for your client struct
/// 2. Register it in a [`CapabilityRegistry`](crate::CapabilityRegistry) under a name
/// 3. Bind agents to that name in their spec
#[async_trait]
pub trait CapabilityPort: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    async fn invoke(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError>;
}

/// Invoke `port`, failing with [`CapabilityError::Timeout`] once the request
/// deadline elapses. The in-flight provider future is dropped on timeout.
pub async fn invoke_with_deadline(
    port: &dyn CapabilityPort,
    request: &CapabilityRequest,
) -> Result<CapabilityOutput, CapabilityError> {
    match tokio::time::timeout(request.deadline, port.invoke(request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::debug!(
                provider = port.name(),
                deadline_ms = request.deadline.as_millis() as u64,
                "capability deadline elapsed"
            );
            Err(CapabilityError::Timeout {
                after_ms: request.deadline.as_millis() as u64,
            })
        }
    }
}
