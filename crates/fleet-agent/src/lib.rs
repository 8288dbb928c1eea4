//! Capability ports for the agent fleet engine.
//!
//! Every external text/decision provider sits behind [`CapabilityPort`]. The
//! engine treats all providers uniformly: it hands them a prompt, parameters
//! and a deadline, and gets back text, a probability, or a classified error.
//!
//! # Main types
//!
//! - [`CapabilityPort`] — The provider boundary trait.
//! - [`FailoverCapability`] — Ordered provider pool with retry and backoff.
//! - [`StaticCapability`] — Deterministic local provider.
//! - [`CapabilityRegistry`] — Named providers that agent specs bind to.
//! - [`RetryPolicy`] — Exponential backoff settings shared with the runtime.

/// Capability slots, requests and the provider port.
pub mod capability;
/// Provider configuration.
pub mod config;
/// Failover across providers.
pub mod failover;
/// Built-in providers and the provider registry.
pub mod providers;

pub use capability::{
    invoke_with_deadline, CapabilityError, CapabilityOutput, CapabilityPort, CapabilityRequest,
    CapabilitySlot,
};
pub use config::{ProviderConfig, ProviderKind};
pub use failover::{compute_backoff, FailoverCapability, RetryPolicy};
pub use providers::{CapabilityRegistry, StaticCapability};
