//! Agent fleet orchestration with closed-loop KPI control.
//!
//! Agents are created from declarative specs and run as independent tokio
//! tasks that pull work from a shared priority queue, call capability
//! providers, and report metrics and heartbeats. An aggregator folds reports
//! into fixed time windows; a feedback controller evaluates each closed window
//! against KPI policies and issues directives that the engine routes back to
//! agents or turns into corrective tasks.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Engine that owns every component and runs the control loop.
//! - [`AgentFactory`] — Builds agents from [`AgentSpec`]s and keeps the agent registry.
//! - [`AgentRuntime`] — Lifecycle state machine each agent runs inside.
//! - [`SharedQueue`] — Priority task queue with exclusive, at-least-once claims.
//! - [`MetricsAggregator`] — Windowed metric snapshots and agent health.
//! - [`FeedbackController`] — Turns snapshots into [`Directive`]s.
//! - [`Scheduler`] — Cron-based job scheduler for recurring tasks.
//! - [`FleetStore`] — Persistence boundary for reports, directives and agent records.

/// Windowed metric aggregation and agent health.
pub mod aggregator;
/// Fleet configuration loaded from TOML.
pub mod config;
/// KPI policies and the feedback controller.
pub mod controller;
/// The orchestration engine.
pub mod engine;
/// Agent creation, decommissioning and control routing.
pub mod factory;
/// Role handlers that execute tasks.
pub mod handlers;
/// Built-in role profiles.
pub mod profiles;
/// Per-agent lifecycle runtime.
pub mod runtime;
/// Cron-based job scheduler.
pub mod scheduler;
/// Persistence boundary.
pub mod store;
/// Priority task queue.
pub mod task_queue;
/// Shared fleet types (specs, tasks, reports, snapshots, directives).
pub mod types;

pub use aggregator::{AggregationRule, ClosedWindow, MetricsAggregator, RecordOutcome};
pub use config::{AggregatorConfig, ControllerConfig, FleetConfig, QueueConfig, RuntimeConfig};
pub use controller::{Comparator, FeedbackController, KpiPolicy};
pub use engine::{CycleReport, Orchestrator};
pub use factory::{validate_spec, AgentFactory};
pub use handlers::{HandlerTable, ProfileHandler, RoleHandler, TaskContext, TaskOutcome};
pub use profiles::{default_profiles, profile, RoleProfile};
pub use runtime::{AgentRuntime, RuntimeDeps};
pub use scheduler::{ScheduledJob, Scheduler};
pub use store::{open_store, AgentRecord, FileStore, FleetStore, MemoryStore};
pub use task_queue::{RequeueOutcome, SharedQueue, TaskQueue};
pub use types::{
    ActionKind, AgentHealth, AgentInstance, AgentRole, AgentSpec, CapabilityBinding,
    ControlMessage, Directive, DirectiveAction, DirectiveScope, DirectiveStatus, HealthEvent,
    HealthStatus, Heartbeat, LifecycleState, MetricReport, Snapshot, SystemEvent, Task,
    TaskPayload, TaskStatus, TaskTarget, DEFAULT_PRIORITY,
};
