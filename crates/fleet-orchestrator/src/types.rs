use chrono::{DateTime, Utc};
use fleet_agent::CapabilitySlot;
use fleet_core::{FleetError, FleetResult, ParamValue, Parameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Operational role of an agent. The set is closed: every agent is exactly
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Plans launch phases and sequences launch work.
    LaunchStrategist,
    /// Drafts, optimizes and schedules content.
    ContentCreator,
    /// Adjusts pricing and promotions to hit revenue targets.
    RevenueOptimizer,
    /// Answers the community and tracks sentiment.
    CommunityEngagement,
    /// Finds influencers and runs outreach campaigns.
    InfluencerOutreach,
    /// Collects and triages user feedback.
    FeedbackManager,
    /// Handles privacy requests and compliance checks.
    DataPrivacy,
    /// Guides new users through activation.
    UserOnboarding,
    /// Produces reports and insights over fleet data.
    Analytics,
    /// Curates marketplace listings.
    MarketplaceManager,
    /// Tracks return on investment against target.
    RoiOptimization,
}

impl AgentRole {
    /// Every role, in catalogue order.
    pub const ALL: [AgentRole; 11] = [
        AgentRole::LaunchStrategist,
        AgentRole::ContentCreator,
        AgentRole::RevenueOptimizer,
        AgentRole::CommunityEngagement,
        AgentRole::InfluencerOutreach,
        AgentRole::FeedbackManager,
        AgentRole::DataPrivacy,
        AgentRole::UserOnboarding,
        AgentRole::Analytics,
        AgentRole::MarketplaceManager,
        AgentRole::RoiOptimization,
    ];

    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::LaunchStrategist => "launch_strategist",
            AgentRole::ContentCreator => "content_creator",
            AgentRole::RevenueOptimizer => "revenue_optimizer",
            AgentRole::CommunityEngagement => "community_engagement",
            AgentRole::InfluencerOutreach => "influencer_outreach",
            AgentRole::FeedbackManager => "feedback_manager",
            AgentRole::DataPrivacy => "data_privacy",
            AgentRole::UserOnboarding => "user_onboarding",
            AgentRole::Analytics => "analytics",
            AgentRole::MarketplaceManager => "marketplace_manager",
            AgentRole::RoiOptimization => "roi_optimization",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| FleetError::InvalidSpec(format!("unknown agent role '{s}'")))
    }
}

/// Binds one capability slot of an agent to a named provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityBinding {
    /// Slot being bound.
    pub slot: CapabilitySlot,
    /// Registered provider name.
    pub provider: String,
}

/// Immutable, declarative description of an agent.
///
/// Never mutated once handed to the factory; [`AgentSpec::specialize`]
/// produces a new spec instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Role the agent plays.
    pub role: AgentRole,
    /// Human-readable name.
    pub display_name: String,
    /// Overrides of the role defaults.
    #[serde(default)]
    pub parameters: Parameters,
    /// Capability bindings.
    #[serde(default)]
    pub capabilities: Vec<CapabilityBinding>,
}

impl AgentSpec {
    /// Spec with no parameters or bindings.
    pub fn new(role: AgentRole, display_name: impl Into<String>) -> Self {
        Self {
            role,
            display_name: display_name.into(),
            parameters: Parameters::new(),
            capabilities: Vec::new(),
        }
    }

    /// Parse a spec from JSON, reporting any shape or role problem as
    /// [`FleetError::InvalidSpec`].
    pub fn from_json(src: &str) -> FleetResult<Self> {
        serde_json::from_str(src).map_err(|e| FleetError::InvalidSpec(e.to_string()))
    }

    /// Set one parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Bind `slot`, replacing any existing binding.
    pub fn with_binding(mut self, slot: CapabilitySlot, provider: impl Into<String>) -> Self {
        self.capabilities.retain(|b| b.slot != slot);
        self.capabilities.push(CapabilityBinding {
            slot,
            provider: provider.into(),
        });
        self
    }

    /// Provider bound to `slot`, if any.
    pub fn binding_for(&self, slot: CapabilitySlot) -> Option<&str> {
        self.capabilities
            .iter()
            .find(|b| b.slot == slot)
            .map(|b| b.provider.as_str())
    }

    /// A new spec with `overrides` laid over this spec's parameters.
    pub fn specialize(&self, display_name: impl Into<String>, overrides: Parameters) -> Self {
        let mut parameters = self.parameters.clone();
        parameters.extend(overrides);
        Self {
            role: self.role,
            display_name: display_name.into(),
            parameters,
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Lifecycle of an agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Resolving bindings.
    Initializing,
    /// Waiting for work.
    Idle,
    /// Running a task.
    Executing,
    /// Backing off after a transient failure.
    Recovering,
    /// Held by a directive.
    Paused,
    /// Parked until restarted.
    Failed,
    /// Runtime ended.
    Stopped,
}

impl LifecycleState {
    /// Whether the runtime has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Idle => "idle",
            LifecycleState::Executing => "executing",
            LifecycleState::Recovering => "recovering",
            LifecycleState::Paused => "paused",
            LifecycleState::Failed => "failed",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Read-only view of a running agent, published by its runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    /// Agent id.
    pub id: Uuid,
    /// Spec the agent runs.
    pub spec: Arc<AgentSpec>,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Last heartbeat sent.
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently held by this agent.
    pub current_task: Option<Uuid>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Role defaults, spec parameters and applied adjustments, merged.
    pub parameters: Parameters,
    /// Most recent failure.
    pub last_error: Option<String>,
}

/// Where a task should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum TaskTarget {
    /// Any agent with this role.
    Role(AgentRole),
    /// Exactly this agent.
    Agent(Uuid),
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTarget::Role(role) => write!(f, "role:{role}"),
            TaskTarget::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// Task payload, typed by task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskPayload {
    /// Regular role work: a named action with free-form input.
    Work {
        /// Action name.
        action: String,
        /// Action input.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Corrective work spawned by a controller directive.
    Corrective {
        /// Directive that spawned the task.
        directive_id: Uuid,
        /// KPI being corrected.
        kpi: Option<String>,
        /// Action name.
        action: String,
        /// What to do about it.
        instruction: String,
    },
}

impl TaskPayload {
    /// Action name of either payload kind.
    pub fn action(&self) -> &str {
        match self {
            TaskPayload::Work { action, .. } | TaskPayload::Corrective { action, .. } => action,
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a claim.
    Pending,
    /// Held by an agent.
    Claimed {
        /// Holder.
        agent_id: Uuid,
        /// Claim time; the claim timeout runs from here.
        at: DateTime<Utc>,
    },
    /// Done.
    Completed,
    /// Dropped.
    Abandoned {
        /// Why it was dropped.
        reason: String,
    },
}

impl TaskStatus {
    /// Whether the task left the queue for good.
    pub fn is_retired(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned { .. })
    }
}

/// Default priority for submitted tasks; lower numbers are served first.
pub const DEFAULT_PRIORITY: u8 = 5;

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Routing target.
    pub target: TaskTarget,
    /// What to do.
    pub payload: TaskPayload,
    /// Lower is more urgent.
    pub priority: u8,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Past this the task is dropped at claim time.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Requeues so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Queue status.
    pub status: TaskStatus,
    /// Directive that spawned this task, if any.
    #[serde(default)]
    pub origin: Option<Uuid>,
    /// When the task was retired.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Pending task with the default priority.
    pub fn new(target: TaskTarget, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            payload,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            deadline: None,
            retry_count: 0,
            status: TaskStatus::Pending,
            origin: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Role-addressed work item.
    pub fn work(role: AgentRole, action: impl Into<String>, input: serde_json::Value) -> Self {
        Self::new(
            TaskTarget::Role(role),
            TaskPayload::Work {
                action: action.into(),
                input,
            },
        )
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set a deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Override the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark as spawned by a directive.
    pub fn with_origin(mut self, directive_id: Uuid) -> Self {
        self.origin = Some(directive_id);
        self
    }

    /// Whether `agent_id` with `role` may claim this task.
    pub fn routes_to(&self, agent_id: Uuid, role: AgentRole) -> bool {
        match self.target {
            TaskTarget::Role(r) => r == role,
            TaskTarget::Agent(id) => id == agent_id,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}

/// Named KPI values emitted by one agent at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Reporting agent.
    pub agent_id: Uuid,
    /// Its role.
    pub role: AgentRole,
    /// Observation time; selects the window.
    pub timestamp: DateTime<Utc>,
    /// KPI values.
    pub values: BTreeMap<String, f64>,
}

impl MetricReport {
    /// Report with no values.
    pub fn new(agent_id: Uuid, role: AgentRole, timestamp: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            role,
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Add one KPI value.
    pub fn with(mut self, kpi: impl Into<String>, value: f64) -> Self {
        self.values.insert(kpi.into(), value);
        self
    }
}

/// Liveness beacon emitted on every state transition and periodically while
/// an agent is otherwise quiet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Agent beating.
    pub agent_id: Uuid,
    /// Its state.
    pub state: LifecycleState,
    /// When the beat was sent.
    pub at: DateTime<Utc>,
    /// Task held, if any.
    pub current_task: Option<Uuid>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
}

/// Health of an agent as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Resolving bindings.
    Initializing,
    /// Idle or executing.
    Healthy,
    /// Backing off.
    Recovering,
    /// Held by a directive.
    Paused,
    /// Parked in `Failed`: retry budget exhausted or bindings unresolved.
    Degraded,
    /// No heartbeat within the liveness window.
    Unresponsive,
    /// Decommissioned.
    Stopped,
}

/// One surfaced problem in an agent's recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Event kind.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

/// Answer to `get_agent_health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent id.
    pub agent_id: Uuid,
    /// Agent role.
    pub role: AgentRole,
    /// Display name.
    pub display_name: String,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Derived health.
    pub status: HealthStatus,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Task held, if any.
    pub current_task: Option<Uuid>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Most recent first.
    pub recent_events: Vec<HealthEvent>,
}

/// Exhausted or fatal conditions surfaced to the aggregator and controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SystemEvent {
    /// The failure budget ran out.
    AgentDegraded {
        /// Degraded agent.
        agent_id: Uuid,
        /// Last failure.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// Capability bindings could not be resolved.
    BindingFailed {
        /// Agent that failed to bind.
        agent_id: Uuid,
        /// Unresolved bindings.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A task ran out of retries or its claim timed out.
    TaskExhausted {
        /// Dropped task.
        task_id: Uuid,
        /// Last holder, when the task ran out of retries while claimed.
        agent_id: Option<Uuid>,
        /// Retries used.
        retries: u32,
        /// Last failure.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A report older than the retention horizon was dropped.
    LateReport {
        /// Reporting agent.
        agent_id: Uuid,
        /// Report timestamp.
        timestamp: DateTime<Utc>,
        /// When it was dropped.
        at: DateTime<Utc>,
    },
    /// No heartbeat within the liveness window.
    Unresponsive {
        /// Silent agent.
        agent_id: Uuid,
        /// When it was flagged.
        at: DateTime<Utc>,
    },
}

impl SystemEvent {
    /// Agent the event concerns, when it concerns one.
    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            SystemEvent::AgentDegraded { agent_id, .. }
            | SystemEvent::BindingFailed { agent_id, .. }
            | SystemEvent::LateReport { agent_id, .. }
            | SystemEvent::Unresponsive { agent_id, .. } => Some(*agent_id),
            SystemEvent::TaskExhausted { agent_id, .. } => *agent_id,
        }
    }

    /// The error this event surfaces.
    pub fn error(&self) -> FleetError {
        match self {
            SystemEvent::AgentDegraded { agent_id, reason, .. } => FleetError::AgentDegraded {
                agent_id: *agent_id,
                reason: reason.clone(),
            },
            SystemEvent::BindingFailed { reason, .. } => FleetError::Binding(reason.clone()),
            SystemEvent::TaskExhausted { task_id, retries, .. } => FleetError::TaskExhausted {
                task_id: *task_id,
                retries: *retries,
            },
            SystemEvent::LateReport {
                agent_id,
                timestamp,
                ..
            } => FleetError::LateReport {
                agent_id: *agent_id,
                timestamp: *timestamp,
            },
            SystemEvent::Unresponsive { agent_id, .. } => FleetError::Unresponsive {
                agent_id: *agent_id,
            },
        }
    }

    /// Machine-readable kind, shared with [`FleetError::kind`].
    pub fn kind(&self) -> &'static str {
        self.error().kind()
    }

    /// When the condition was observed.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            SystemEvent::AgentDegraded { at, .. }
            | SystemEvent::BindingFailed { at, .. }
            | SystemEvent::TaskExhausted { at, .. }
            | SystemEvent::LateReport { at, .. }
            | SystemEvent::Unresponsive { at, .. } => *at,
        }
    }

    /// Human-readable detail.
    pub fn describe(&self) -> String {
        match self {
            SystemEvent::AgentDegraded { reason, .. } => format!("retry budget exhausted: {reason}"),
            SystemEvent::BindingFailed { reason, .. } => reason.clone(),
            SystemEvent::TaskExhausted {
                task_id,
                retries,
                reason,
                ..
            } => format!("task {task_id} abandoned after {retries} retries: {reason}"),
            SystemEvent::LateReport { timestamp, .. } => {
                format!("report stamped {timestamp} is older than the retention horizon")
            }
            SystemEvent::Unresponsive { .. } => "no heartbeat within the liveness window".into(),
        }
    }
}

/// Aggregated, window-scoped view of the fleet. Superseded, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Window index since the aggregator origin.
    pub window: u64,
    /// Exclusive lower bound.
    pub window_start: DateTime<Utc>,
    /// Inclusive upper bound.
    pub window_end: DateTime<Utc>,
    /// Bumped when a late report inside the retention horizon rebuilds the window.
    pub revision: u32,
    /// Aggregated KPI values.
    pub kpis: BTreeMap<String, f64>,
    /// Agent health at closing.
    pub agents: BTreeMap<Uuid, HealthStatus>,
    /// Events raised during the window.
    pub events: Vec<SystemEvent>,
    /// Reports folded in.
    pub report_count: usize,
}

/// Who a directive addresses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
/// Who a directive addresses.
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum DirectiveScope {
    /// One agent.
    Agent(Uuid),
    /// Every agent of a role.
    Role(AgentRole),
    /// Every agent.
    #[default]
    Global,
}

impl std::fmt::Display for DirectiveScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectiveScope::Agent(id) => write!(f, "agent:{id}"),
            DirectiveScope::Role(role) => write!(f, "role:{role}"),
            DirectiveScope::Global => f.write_str("global"),
        }
    }
}

/// What a directive asks for. Every action is absolute (set, not add) so
/// re-applying it is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DirectiveAction {
    /// Set an agent parameter.
    AdjustParameter {
        /// Parameter name.
        name: String,
        /// New value.
        value: ParamValue,
    },
    /// Enqueue corrective work.
    SpawnTask {
        /// Action of the corrective task. Named `task` on the wire since
        /// `action` is the variant tag.
        #[serde(rename = "task")]
        action: String,
        /// What to do.
        #[serde(default)]
        instruction: String,
        /// Priority of the task.
        #[serde(default = "default_corrective_priority")]
        priority: u8,
        /// Required when the directive scope is global.
        #[serde(default)]
        role: Option<AgentRole>,
    },
    /// Stop claiming work.
    PauseAgent {
        /// Resume on its own after this long.
        #[serde(default)]
        duration_secs: Option<u64>,
    },
    /// Leave a pause.
    ResumeAgent,
    /// Reset the failure budget and return to work.
    RestartAgent,
    /// Alert an operator.
    Escalate {
        /// Alert text.
        message: String,
    },
}

fn default_corrective_priority() -> u8 {
    1
}

/// Discriminant of [`DirectiveAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// See [`DirectiveAction::AdjustParameter`].
    AdjustParameter,
    /// See [`DirectiveAction::SpawnTask`].
    SpawnTask,
    /// See [`DirectiveAction::PauseAgent`].
    PauseAgent,
    /// See [`DirectiveAction::ResumeAgent`].
    ResumeAgent,
    /// See [`DirectiveAction::RestartAgent`].
    RestartAgent,
    /// See [`DirectiveAction::Escalate`].
    Escalate,
}

impl DirectiveAction {
    /// Discriminant of this action.
    pub fn kind(&self) -> ActionKind {
        match self {
            DirectiveAction::AdjustParameter { .. } => ActionKind::AdjustParameter,
            DirectiveAction::SpawnTask { .. } => ActionKind::SpawnTask,
            DirectiveAction::PauseAgent { .. } => ActionKind::PauseAgent,
            DirectiveAction::ResumeAgent => ActionKind::ResumeAgent,
            DirectiveAction::RestartAgent => ActionKind::RestartAgent,
            DirectiveAction::Escalate { .. } => ActionKind::Escalate,
        }
    }
}

/// Lifecycle of a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStatus {
    /// In force.
    Active,
    /// The KPI or agent recovered.
    Resolved,
    /// TTL elapsed.
    Expired,
}

/// A controller-issued, idempotent instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    /// Directive id.
    pub id: Uuid,
    /// Who it addresses.
    pub scope: DirectiveScope,
    /// What it asks for.
    pub action: DirectiveAction,
    /// KPI whose breach produced this directive.
    pub kpi: Option<String>,
    /// 1 for first response, higher after escalation.
    pub severity: u8,
    /// Why it was issued.
    pub reason: String,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// End of its TTL.
    pub expires_at: DateTime<Utc>,
    /// Current status.
    pub status: DirectiveStatus,
}

impl Directive {
    /// Discriminant of the action.
    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    /// Whether the directive is in force.
    pub fn is_active(&self) -> bool {
        self.status == DirectiveStatus::Active
    }
}

/// Control-channel message delivered to an agent runtime.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Apply a directive once.
    Apply(Directive),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_catalogue_is_complete_and_round_trips() {
        assert_eq!(AgentRole::ALL.len(), 11);
        for role in AgentRole::ALL {
            assert_eq!(role.to_string().parse::<AgentRole>().unwrap(), role);
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
    }

    #[test]
    fn test_unknown_role_is_invalid_spec() {
        let err = "growth_hacker".parse::<AgentRole>().unwrap_err();
        assert!(matches!(err, FleetError::InvalidSpec(_)));
    }

    #[test]
    fn test_spec_from_json_rejects_unknown_role() {
        let err = AgentSpec::from_json(r#"{"role": "wizard", "display_name": "x"}"#).unwrap_err();
        assert!(matches!(err, FleetError::InvalidSpec(_)));

        let spec = AgentSpec::from_json(
            r#"{"role": "analytics", "display_name": "a",
                "capabilities": [{"slot": "scoring", "provider": "local"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.binding_for(CapabilitySlot::Scoring), Some("local"));
    }

    #[test]
    fn test_specialize_leaves_original_untouched() {
        let base = AgentSpec::new(AgentRole::RoiOptimization, "roi")
            .with_parameter("target_roi", 0.15)
            .with_binding(CapabilitySlot::Scoring, "local");
        let mut overrides = Parameters::new();
        overrides.insert("target_roi".into(), ParamValue::Float(0.25));

        let special = base.specialize("roi-aggressive", overrides);
        assert_eq!(base.parameters["target_roi"], ParamValue::Float(0.15));
        assert_eq!(special.parameters["target_roi"], ParamValue::Float(0.25));
        assert_eq!(special.capabilities, base.capabilities);
    }

    #[test]
    fn test_with_binding_replaces_same_slot() {
        let spec = AgentSpec::new(AgentRole::Analytics, "a")
            .with_binding(CapabilitySlot::Scoring, "one")
            .with_binding(CapabilitySlot::Scoring, "two");
        assert_eq!(spec.capabilities.len(), 1);
        assert_eq!(spec.binding_for(CapabilitySlot::Scoring), Some("two"));
    }

    #[test]
    fn test_task_routing() {
        let agent = Uuid::new_v4();
        let by_role = Task::work(AgentRole::ContentCreator, "draft", serde_json::Value::Null);
        assert!(by_role.routes_to(agent, AgentRole::ContentCreator));
        assert!(!by_role.routes_to(agent, AgentRole::Analytics));

        let direct = Task::new(
            TaskTarget::Agent(agent),
            TaskPayload::Work {
                action: "x".into(),
                input: serde_json::Value::Null,
            },
        );
        assert!(direct.routes_to(agent, AgentRole::Analytics));
        assert!(!direct.routes_to(Uuid::new_v4(), AgentRole::Analytics));
    }

    #[test]
    fn test_task_expiry() {
        let now = Utc::now();
        let task = Task::work(AgentRole::Analytics, "report", serde_json::Value::Null)
            .with_deadline(now - chrono::Duration::seconds(1));
        assert!(task.is_expired(now));
        assert!(!Task::work(AgentRole::Analytics, "r", serde_json::Value::Null).is_expired(now));
    }

    #[test]
    fn test_directive_action_serialization() {
        let action = DirectiveAction::AdjustParameter {
            name: "discount".into(),
            value: ParamValue::Float(0.1),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "adjust_parameter");
        let parsed: DirectiveAction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, action);
        assert_eq!(parsed.kind(), ActionKind::AdjustParameter);
    }

    #[test]
    fn test_spawn_task_wire_format() {
        let parsed: DirectiveAction = serde_json::from_str(
            r#"{"action": "spawn_task", "task": "optimize_pricing", "role": "revenue_optimizer"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            DirectiveAction::SpawnTask {
                action: "optimize_pricing".into(),
                instruction: String::new(),
                priority: 1,
                role: Some(AgentRole::RevenueOptimizer),
            }
        );
    }

    #[test]
    fn test_system_event_agent_id() {
        let id = Uuid::new_v4();
        let ev = SystemEvent::Unresponsive {
            agent_id: id,
            at: Utc::now(),
        };
        assert_eq!(ev.agent_id(), Some(id));
        assert_eq!(ev.kind(), "unresponsive");
    }

    #[test]
    fn test_system_event_maps_to_error() {
        let task_id = Uuid::new_v4();
        let exhausted = SystemEvent::TaskExhausted {
            task_id,
            agent_id: None,
            retries: 5,
            reason: "claim timeout".into(),
            at: Utc::now(),
        };
        assert_eq!(exhausted.kind(), "task_exhausted");
        assert!(matches!(
            exhausted.error(),
            FleetError::TaskExhausted { task_id: t, retries: 5 } if t == task_id
        ));

        let degraded = SystemEvent::AgentDegraded {
            agent_id: Uuid::new_v4(),
            reason: "timeout".into(),
            at: Utc::now(),
        };
        assert_eq!(degraded.kind(), "agent_degraded");
        assert!(degraded.error().to_string().contains("timeout"));

        let binding = SystemEvent::BindingFailed {
            agent_id: Uuid::new_v4(),
            reason: "no provider".into(),
            at: Utc::now(),
        };
        assert_eq!(binding.kind(), "binding_error");
    }
}
