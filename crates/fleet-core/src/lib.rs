//! Core types and error definitions for the agent fleet engine.
//!
//! This crate provides the foundational types shared across all fleet crates:
//! the error taxonomy every subsystem reports through, and the typed parameter
//! values carried by agent specifications and directives.
//!
//! # Main types
//!
//! - [`FleetError`] — Unified error enum for all fleet subsystems.
//! - [`FleetResult`] — Convenience alias for `Result<T, FleetError>`.
//! - [`ParamValue`] — A typed configuration parameter value.
//! - [`Parameters`] — Ordered map of named parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the fleet engine.
///
/// The first group of variants is the operational taxonomy surfaced to the
/// controller and to API callers; the rest are plumbing errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Bad agent creation input, rejected synchronously.
    #[error("Invalid agent spec: {0}")]
    InvalidSpec(String),

    /// A capability binding could not be resolved when the agent initialised.
    #[error("Binding error: {0}")]
    Binding(String),

    /// Timeout or rate limit while executing a task; retried with backoff.
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// The agent exhausted its consecutive failure budget.
    #[error("Agent {agent_id} degraded: {reason}")]
    AgentDegraded {
        /// The degraded agent.
        agent_id: Uuid,
        /// Last error observed before the budget ran out.
        reason: String,
    },

    /// The task exhausted its retry budget and was dropped.
    #[error("Task {task_id} exhausted after {retries} retries")]
    TaskExhausted {
        /// The abandoned task.
        task_id: Uuid,
        /// Retry count at the time it was abandoned.
        retries: u32,
    },

    /// A metric report arrived after its window left the retention horizon.
    #[error("Late report from agent {agent_id} at {timestamp}")]
    LateReport {
        /// Reporting agent.
        agent_id: Uuid,
        /// Timestamp carried by the report.
        timestamp: DateTime<Utc>,
    },

    /// The agent missed its liveness window.
    #[error("Agent {agent_id} unresponsive")]
    Unresponsive {
        /// The silent agent.
        agent_id: Uuid,
    },

    /// A referenced agent, task or directive does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A non-transient failure reported by a capability provider.
    #[error("Capability error: {0}")]
    Capability(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the persistence boundary.
    #[error("Store error: {0}")]
    Store(String),

    /// An error from the orchestration engine itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether this error should be retried locally instead of surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::TransientExecution(_))
    }

    /// Short machine-readable kind, used in health events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::InvalidSpec(_) => "invalid_spec",
            FleetError::Binding(_) => "binding_error",
            FleetError::TransientExecution(_) => "transient_execution_error",
            FleetError::AgentDegraded { .. } => "agent_degraded",
            FleetError::TaskExhausted { .. } => "task_exhausted",
            FleetError::LateReport { .. } => "late_report",
            FleetError::Unresponsive { .. } => "unresponsive",
            FleetError::NotFound(_) => "not_found",
            FleetError::Capability(_) => "capability_error",
            FleetError::Config(_) => "config_error",
            FleetError::Store(_) => "store_error",
            FleetError::Orchestrator(_) => "orchestrator_error",
            FleetError::Json(_) => "json_error",
            FleetError::Io(_) => "io_error",
        }
    }
}

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

// --- Parameter types ---

/// A typed parameter value.
///
/// Serialized untagged so TOML and JSON configs can write plain literals
/// (`target_roi = 0.15`, `channel = "email"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A boolean flag.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// Free-form text.
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of the value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Named parameters, ordered by name so that prompts and logs are stable.
pub type Parameters = BTreeMap<String, ParamValue>;
