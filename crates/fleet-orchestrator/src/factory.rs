use crate::profiles::profile;
use crate::runtime::{AgentRuntime, RuntimeDeps};
use crate::types::{
    AgentInstance, AgentRole, AgentSpec, ControlMessage, Directive, DirectiveAction,
    DirectiveScope, LifecycleState,
};
use chrono::Utc;
use fleet_core::{FleetError, FleetResult, Parameters};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONTROL_CAPACITY: usize = 64;

/// Reject specs that can never run: blank names and roles whose required
/// capability slots are not bound.
pub fn validate_spec(spec: &AgentSpec) -> FleetResult<()> {
    if spec.display_name.trim().is_empty() {
        return Err(FleetError::InvalidSpec("display name is empty".into()));
    }
    for binding in &spec.capabilities {
        if binding.provider.trim().is_empty() {
            return Err(FleetError::InvalidSpec(format!(
                "slot {} is bound to an empty provider name",
                binding.slot
            )));
        }
    }
    for slot in profile(spec.role).required_slots {
        if spec.binding_for(slot).is_none() {
            return Err(FleetError::InvalidSpec(format!(
                "role {} requires a {slot} binding",
                spec.role
            )));
        }
    }
    Ok(())
}

struct AgentHandle {
    spec: Arc<AgentSpec>,
    status: watch::Receiver<AgentInstance>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
    join: Option<JoinHandle<LifecycleState>>,
    decommissioned: bool,
}

/// Creates agents from specs and keeps the process-wide registry used for
/// decommissioning, control routing and introspection.
pub struct AgentFactory {
    deps: RuntimeDeps,
    role_defaults: HashMap<AgentRole, Parameters>,
    agents: RwLock<HashMap<Uuid, AgentHandle>>,
    stop_timeout: Duration,
}

impl AgentFactory {
    /// Factory using `role_defaults` as the base parameters of each role.
    pub fn new(deps: RuntimeDeps, role_defaults: HashMap<AgentRole, Parameters>) -> Self {
        Self {
            deps,
            role_defaults,
            agents: RwLock::new(HashMap::new()),
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// How long decommission waits for a runtime to wind down before
    /// aborting it.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Validate `spec`, register the new agent with the queue and the
    /// aggregator, and start its runtime.
    pub async fn create(&self, spec: AgentSpec) -> FleetResult<AgentInstance> {
        validate_spec(&spec)?;
        let id = Uuid::new_v4();
        let spec = Arc::new(spec);

        self.deps.queue.register_consumer(id, spec.role).await;
        self.deps
            .aggregator
            .register_agent(id, spec.role, &spec.display_name, Utc::now())
            .await;

        let handle = self.spawn_runtime(id, spec.clone());
        let instance = handle.status.borrow().clone();
        self.agents.write().await.insert(id, handle);

        info!(agent_id = %id, role = %spec.role, name = %spec.display_name, "agent created");
        Ok(instance)
    }

    fn spawn_runtime(&self, id: Uuid, spec: Arc<AgentSpec>) -> AgentHandle {
        let defaults = self
            .role_defaults
            .get(&spec.role)
            .cloned()
            .unwrap_or_else(|| profile(spec.role).default_parameters());

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let cancel = CancellationToken::new();
        let placeholder = AgentInstance {
            id,
            spec: spec.clone(),
            state: LifecycleState::Initializing,
            last_heartbeat: Utc::now(),
            current_task: None,
            consecutive_failures: 0,
            parameters: Parameters::new(),
            last_error: None,
        };
        let (status_tx, status_rx) = watch::channel(placeholder);
        let runtime = AgentRuntime::new(
            id,
            spec.clone(),
            defaults,
            self.deps.clone(),
            control_rx,
            status_tx,
            cancel.clone(),
        );
        let join = tokio::spawn(runtime.run());

        AgentHandle {
            spec,
            status: status_rx,
            control: control_tx,
            cancel,
            join: Some(join),
            decommissioned: false,
        }
    }

    /// Stop an agent for good. Idempotent: a second call returns the
    /// stopped instance again.
    pub async fn decommission(&self, id: Uuid) -> FleetResult<AgentInstance> {
        let (cancel, join, status) = {
            let mut agents = self.agents.write().await;
            let handle = agents
                .get_mut(&id)
                .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
            if handle.decommissioned {
                let mut instance = handle.status.borrow().clone();
                instance.state = LifecycleState::Stopped;
                return Ok(instance);
            }
            handle.decommissioned = true;
            (handle.cancel.clone(), handle.join.take(), handle.status.clone())
        };

        // Stop claims before the runtime notices the cancellation.
        self.deps.queue.deregister_consumer(id).await;
        cancel.cancel();

        if let Some(mut join) = join {
            match tokio::time::timeout(self.stop_timeout, &mut join).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(agent_id = %id, error = %e, "agent runtime ended abnormally"),
                Err(_) => {
                    warn!(agent_id = %id, "agent runtime did not stop in time, aborting");
                    join.abort();
                }
            }
        }
        self.deps.aggregator.mark_stopped(id, Utc::now()).await;

        let mut instance = status.borrow().clone();
        instance.state = LifecycleState::Stopped;
        instance.current_task = None;
        info!(agent_id = %id, "agent decommissioned");
        Ok(instance)
    }

    /// Published view of one agent.
    pub async fn get(&self, id: Uuid) -> Option<AgentInstance> {
        let agents = self.agents.read().await;
        agents.get(&id).map(|h| {
            let mut instance = h.status.borrow().clone();
            if h.decommissioned {
                instance.state = LifecycleState::Stopped;
            }
            instance
        })
    }

    /// Every agent ever created, ordered by role then name.
    pub async fn list(&self) -> Vec<AgentInstance> {
        let ids: Vec<Uuid> = self.agents.read().await.keys().copied().collect();
        let mut all = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) = self.get(id).await {
                all.push(instance);
            }
        }
        all.sort_by(|a, b| {
            a.spec
                .role
                .cmp(&b.spec.role)
                .then_with(|| a.spec.display_name.cmp(&b.spec.display_name))
        });
        all
    }

    /// Subscribe to an agent's published state.
    pub async fn watch(&self, id: Uuid) -> Option<watch::Receiver<AgentInstance>> {
        self.agents.read().await.get(&id).map(|h| h.status.clone())
    }

    /// Live agents a directive scope addresses.
    pub async fn resolve_scope(&self, scope: DirectiveScope) -> Vec<Uuid> {
        let agents = self.agents.read().await;
        let mut ids: Vec<Uuid> = agents
            .iter()
            .filter(|(_, h)| !h.decommissioned)
            .filter(|(id, h)| match scope {
                DirectiveScope::Agent(target) => **id == target,
                DirectiveScope::Role(role) => h.spec.role == role,
                DirectiveScope::Global => true,
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Deliver a directive to one agent's runtime without waiting. A restart
    /// addressed to a runtime that is gone or not draining its control
    /// channel spawns a fresh one.
    pub async fn deliver(&self, id: Uuid, directive: Directive) -> FleetResult<()> {
        let (control, finished) = {
            let agents = self.agents.read().await;
            let handle = agents
                .get(&id)
                .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
            if handle.decommissioned {
                debug!(agent_id = %id, "directive for decommissioned agent dropped");
                return Ok(());
            }
            let finished = handle.join.as_ref().map_or(true, |j| j.is_finished());
            (handle.control.clone(), finished)
        };

        let is_restart = matches!(directive.action, DirectiveAction::RestartAgent);
        if finished && is_restart {
            return self.respawn(id).await;
        }

        match control.try_send(ControlMessage::Apply(directive)) {
            Ok(()) => Ok(()),
            Err(_) if is_restart => self.respawn(id).await,
            Err(TrySendError::Full(_)) => {
                warn!(agent_id = %id, capacity = CONTROL_CAPACITY, "control channel full, directive dropped");
                Err(FleetError::Orchestrator(format!(
                    "agent {id} control channel is full"
                )))
            }
            Err(TrySendError::Closed(_)) => Err(FleetError::Orchestrator(format!(
                "agent {id} runtime is not accepting directives"
            ))),
        }
    }

    async fn respawn(&self, id: Uuid) -> FleetResult<()> {
        let mut agents = self.agents.write().await;
        let handle = agents
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))?;
        if handle.decommissioned {
            return Ok(());
        }
        warn!(agent_id = %id, "respawning agent runtime");
        handle.cancel.cancel();
        let fresh = self.spawn_runtime(id, handle.spec.clone());
        *handle = fresh;
        Ok(())
    }

    /// Decommission every live agent.
    pub async fn shutdown(&self) {
        let ids = self.resolve_scope(DirectiveScope::Global).await;
        for id in ids {
            if let Err(e) = self.decommission(id).await {
                warn!(agent_id = %id, error = %e, "decommission during shutdown failed");
            }
        }
    }
}
