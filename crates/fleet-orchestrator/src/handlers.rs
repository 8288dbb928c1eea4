use crate::profiles::{profile, RoleProfile};
use crate::types::{AgentRole, Task, TaskPayload};
use async_trait::async_trait;
use fleet_agent::{
    invoke_with_deadline, CapabilityOutput, CapabilityPort, CapabilityRequest, CapabilitySlot,
};
use fleet_core::{FleetError, FleetResult, Parameters};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a handler may use while executing one task.
pub struct TaskContext {
    /// Agent running the task.
    pub agent_id: Uuid,
    /// Role of that agent.
    pub role: AgentRole,
    /// Effective parameters of the executing agent.
    pub parameters: Parameters,
    /// Bound capability ports by slot.
    pub ports: HashMap<CapabilitySlot, Arc<dyn CapabilityPort>>,
    /// Per-call capability deadline.
    pub deadline: Duration,
}

impl TaskContext {
    /// Call the port bound to `slot` under the per-call deadline.
    pub async fn invoke(
        &self,
        slot: CapabilitySlot,
        prompt: impl Into<String>,
    ) -> FleetResult<CapabilityOutput> {
        let port = self
            .ports
            .get(&slot)
            .ok_or_else(|| FleetError::Binding(format!("no provider bound to slot {slot}")))?;
        let request = CapabilityRequest::new(slot, prompt, self.deadline)
            .with_parameters(self.parameters.clone());
        Ok(invoke_with_deadline(port.as_ref(), &request).await?)
    }
}

/// What a successful handler run produced.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    /// Handler output.
    pub output: serde_json::Value,
    /// KPI values to report for this task.
    pub metrics: BTreeMap<String, f64>,
}

/// Role-specific task execution.
///
/// Transient capability failures must come back as
/// [`FleetError::TransientExecution`] so the runtime retries them.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, task: &Task) -> FleetResult<TaskOutcome>;
}

/// Handler driven entirely by a [`RoleProfile`]: generates text when the role
/// has a generation slot, scores when it has a scoring slot.
pub struct ProfileHandler {
    profile: RoleProfile,
}

impl ProfileHandler {
    /// Handler for one profile.
    pub fn new(profile: RoleProfile) -> Self {
        Self { profile }
    }

    fn prompt(&self, ctx: &TaskContext, task: &Task) -> String {
        let mut lines = vec![self.profile.system_prompt.to_string()];
        if !ctx.parameters.is_empty() {
            let params: Vec<String> = ctx
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            lines.push(format!("Parameters: {}", params.join(", ")));
        }
        match &task.payload {
            TaskPayload::Work { input, .. } if !input.is_null() => {
                lines.push(format!("Input: {input}"));
            }
            TaskPayload::Corrective {
                kpi, instruction, ..
            } => {
                let kpi = kpi.as_deref().unwrap_or("fleet health");
                lines.push(format!("Corrective work for {kpi}: {instruction}"));
            }
            TaskPayload::Work { .. } => {}
        }
        lines.push(format!("Action: {}", task.payload.action()));
        lines.join("\n")
    }
}

#[async_trait]
impl RoleHandler for ProfileHandler {
    async fn handle(&self, ctx: &TaskContext, task: &Task) -> FleetResult<TaskOutcome> {
        let action = task.payload.action();
        if action.trim().is_empty() {
            return Err(FleetError::Orchestrator(format!("task {} has no action", task.id)));
        }

        let prompt = self.prompt(ctx, task);
        let mut outcome = TaskOutcome {
            output: json!({ "action": action }),
            metrics: BTreeMap::from([(self.profile.work_metric.to_string(), 1.0)]),
        };

        if self.profile.requires(CapabilitySlot::Generation) {
            let output = ctx.invoke(CapabilitySlot::Generation, prompt.clone()).await?;
            let text = output.as_text().ok_or_else(|| {
                FleetError::Capability("generation provider returned no text".into())
            })?;
            outcome.output["text"] = json!(text);
        }

        if self.profile.requires(CapabilitySlot::Scoring) {
            let output = ctx.invoke(CapabilitySlot::Scoring, prompt).await?;
            let score = output.as_probability().ok_or_else(|| {
                FleetError::Capability("scoring provider returned no probability".into())
            })?;
            outcome.output["score"] = json!(score);
            if let Some(metric) = self.profile.score_metric {
                outcome.metrics.insert(metric.to_string(), score);
            }
        }

        // Observed figures passed along with the work.
        if let TaskPayload::Work { input, .. } = &task.payload {
            if let Some(observed) = input.get("metrics").and_then(|m| m.as_object()) {
                for (name, value) in observed {
                    if let Some(v) = value.as_f64() {
                        outcome.metrics.insert(name.clone(), v);
                    }
                }
            }
        }

        Ok(outcome)
    }
}

/// Handlers keyed by role.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<AgentRole, Arc<dyn RoleHandler>>,
}

impl HandlerTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`ProfileHandler`] for every role.
    pub fn default_handlers() -> Self {
        let mut table = Self::new();
        for role in AgentRole::ALL {
            table.register(role, Arc::new(ProfileHandler::new(profile(role))));
        }
        table
    }

    /// Handle tasks of `role` with `handler`.
    pub fn register(&mut self, role: AgentRole, handler: Arc<dyn RoleHandler>) {
        self.handlers.insert(role, handler);
    }

    /// Handler for `role`.
    pub fn get(&self, role: AgentRole) -> Option<Arc<dyn RoleHandler>> {
        self.handlers.get(&role).cloned()
    }
}
