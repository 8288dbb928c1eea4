use crate::aggregator::MetricsAggregator;
use crate::config::FleetConfig;
use crate::controller::FeedbackController;
use crate::factory::AgentFactory;
use crate::handlers::HandlerTable;
use crate::runtime::RuntimeDeps;
use crate::store::{AgentRecord, FleetStore};
use crate::task_queue::SharedQueue;
use crate::types::{
    AgentHealth, AgentInstance, AgentRole, AgentSpec, Directive, DirectiveAction, DirectiveScope,
    Snapshot, SystemEvent, Task, TaskPayload, TaskStatus, TaskTarget,
};
use chrono::{DateTime, Utc};
use fleet_agent::CapabilityRegistry;
use fleet_core::{FleetError, FleetResult};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const APPLIED_MEMORY: usize = 4_096;
const RETIRED_TASK_RETENTION_SECS: i64 = 3_600;

/// What one engine cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Windows closed during this cycle, oldest first.
    pub windows_closed: Vec<u64>,
    /// Directives the controller issued.
    pub directives: Vec<Directive>,
    /// Tasks dropped by claim-timeout reclamation.
    pub exhausted_tasks: Vec<Uuid>,
}

#[derive(Default)]
struct AppliedSet {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl AppliedSet {
    /// Returns `false` when `id` was already applied.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > APPLIED_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn forget(&mut self, id: Uuid) {
        if self.ids.remove(&id) {
            self.order.retain(|x| *x != id);
        }
    }
}

/// The fleet engine: owns the queue, the aggregator, the agent factory and
/// the feedback controller, and closes the loop between them.
///
/// Each cycle closes due windows, lets the controller evaluate the new
/// snapshots, persists what happened, and applies the resulting directives
/// by enqueueing corrective work or routing control messages to runtimes.
pub struct Orchestrator {
    config: FleetConfig,
    queue: SharedQueue,
    aggregator: Arc<MetricsAggregator>,
    factory: AgentFactory,
    controller: Mutex<FeedbackController>,
    store: Arc<dyn FleetStore>,
    applied: Mutex<AppliedSet>,
    cycle_lock: Mutex<()>,
}

impl Orchestrator {
    /// Engine with the default profile handlers and windows starting now.
    pub fn new(
        config: FleetConfig,
        registry: CapabilityRegistry,
        store: Arc<dyn FleetStore>,
    ) -> FleetResult<Self> {
        Self::with_handlers(
            config,
            registry,
            HandlerTable::default_handlers(),
            store,
            Utc::now(),
        )
    }

    /// Engine with custom handlers and an explicit aggregation origin.
    pub fn with_handlers(
        config: FleetConfig,
        registry: CapabilityRegistry,
        handlers: HandlerTable,
        store: Arc<dyn FleetStore>,
        origin: DateTime<Utc>,
    ) -> FleetResult<Self> {
        config.validate()?;

        let queue = SharedQueue::new(config.queue.clone());
        let aggregator = Arc::new(MetricsAggregator::with_origin(
            config.aggregator.clone(),
            config.liveness_window(),
            origin,
        ));
        let deps = RuntimeDeps {
            queue: queue.clone(),
            aggregator: aggregator.clone(),
            handlers,
            registry,
            config: config.runtime.clone(),
        };
        let role_defaults = AgentRole::ALL
            .into_iter()
            .map(|role| (role, config.role_defaults(role)))
            .collect();
        let factory = AgentFactory::new(deps, role_defaults);
        let controller =
            FeedbackController::new(config.controller.clone(), config.policies.clone());

        info!(
            policies = config.policies.len(),
            window_secs = config.aggregator.window_secs,
            "orchestrator ready"
        );

        Ok(Self {
            config,
            queue,
            aggregator,
            factory,
            controller: Mutex::new(controller),
            store,
            applied: Mutex::new(AppliedSet::default()),
            cycle_lock: Mutex::new(()),
        })
    }

    /// Validated configuration.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Shared task queue.
    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Metrics aggregator.
    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    /// Agent factory.
    pub fn factory(&self) -> &AgentFactory {
        &self.factory
    }

    /// Persistence backend.
    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    // --- Inbound API ---

    /// Create and start an agent, recording it in the store.
    pub async fn create_agent(&self, spec: AgentSpec) -> FleetResult<AgentInstance> {
        let instance = self.factory.create(spec).await?;
        let now = Utc::now();
        let record = AgentRecord {
            id: instance.id,
            role: instance.spec.role,
            display_name: instance.spec.display_name.clone(),
            spec: (*instance.spec).clone(),
            state: instance.state,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.put_agent(&record).await {
            warn!(agent_id = %instance.id, error = %e, "failed to persist agent record");
        }
        Ok(instance)
    }

    /// Stop an agent for good. Idempotent.
    pub async fn decommission_agent(&self, id: Uuid) -> FleetResult<AgentInstance> {
        let instance = self.factory.decommission(id).await?;
        match self.store.get_agent(id).await {
            Ok(Some(mut record)) => {
                record.state = instance.state;
                record.updated_at = Utc::now();
                if let Err(e) = self.store.put_agent(&record).await {
                    warn!(agent_id = %id, error = %e, "failed to persist agent record");
                }
            }
            Ok(None) => debug!(agent_id = %id, "no stored record for decommissioned agent"),
            Err(e) => warn!(agent_id = %id, error = %e, "failed to load agent record"),
        }
        Ok(instance)
    }

    /// Every agent ever created.
    pub async fn list_agents(&self) -> Vec<AgentInstance> {
        self.factory.list().await
    }

    /// One agent by id.
    pub async fn get_agent(&self, id: Uuid) -> FleetResult<AgentInstance> {
        self.factory
            .get(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))
    }

    /// Health of one agent.
    pub async fn get_agent_health(&self, id: Uuid) -> FleetResult<AgentHealth> {
        self.aggregator
            .health_of(id, Utc::now())
            .await
            .ok_or_else(|| FleetError::NotFound(format!("agent {id}")))
    }

    /// Enqueue a task.
    pub async fn submit_task(&self, task: Task) -> FleetResult<Uuid> {
        let task_id = self.queue.enqueue(task).await?;
        debug!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// One task by id.
    pub async fn get_task(&self, id: Uuid) -> FleetResult<Task> {
        self.queue
            .get(id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("task {id}")))
    }

    /// Latest closed snapshot, if any window has closed yet.
    pub async fn get_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.aggregator.current_snapshot().await
    }

    /// Retained snapshots, oldest first.
    pub async fn snapshot_history(&self) -> Vec<Arc<Snapshot>> {
        self.aggregator.snapshot_history().await
    }

    /// Retained directives, oldest first.
    pub async fn list_directives(&self) -> Vec<Directive> {
        self.controller.lock().await.list_directives()
    }

    /// Retained directives still in force.
    pub async fn active_directives(&self) -> Vec<Directive> {
        self.controller.lock().await.active_directives()
    }

    // --- Feedback loop ---

    /// One pass of the control loop at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> FleetResult<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let mut report = CycleReport::default();

        for task in self.queue.reclaim_expired(now).await {
            let reason = match &task.status {
                TaskStatus::Abandoned { reason } => reason.clone(),
                _ => "claim timeout".to_string(),
            };
            report.exhausted_tasks.push(task.id);
            self.aggregator
                .record_event(SystemEvent::TaskExhausted {
                    task_id: task.id,
                    agent_id: None,
                    retries: task.retry_count,
                    reason,
                    at: now,
                })
                .await;
        }

        let closed = self.aggregator.close_due_windows(now).await;
        for window in &closed {
            report.windows_closed.push(window.snapshot.window);
            if let Err(e) = self.store.append_reports(&window.reports).await {
                warn!(window = window.snapshot.window, error = %e, "failed to persist reports");
            }
        }
        let revisions = self.aggregator.take_revisions().await;
        if !revisions.is_empty() {
            if let Err(e) = self.store.append_reports(&revisions).await {
                warn!(count = revisions.len(), error = %e, "failed to persist late reports");
            }
        }

        for window in &closed {
            let issued = self.controller.lock().await.evaluate(&window.snapshot, now);
            for directive in issued {
                if let Err(e) = self.store.append_directive(&directive).await {
                    warn!(directive_id = %directive.id, error = %e, "failed to persist directive");
                }
                if let Err(e) = self.apply_directive(&directive).await {
                    warn!(directive_id = %directive.id, error = %e, "failed to apply directive");
                }
                report.directives.push(directive);
            }
        }

        let purged = self
            .queue
            .purge_retired(now - chrono::Duration::seconds(RETIRED_TASK_RETENTION_SECS))
            .await;
        if !purged.is_empty() {
            self.controller.lock().await.forget_tasks(&purged);
        }

        info!(
            windows = report.windows_closed.len(),
            directives = report.directives.len(),
            exhausted = report.exhausted_tasks.len(),
            purged = purged.len(),
            "engine cycle complete"
        );
        Ok(report)
    }

    /// Apply a directive. Applying the same directive again is a no-op.
    pub async fn apply_directive(&self, directive: &Directive) -> FleetResult<()> {
        if !self.applied.lock().await.insert(directive.id) {
            debug!(directive_id = %directive.id, "directive already applied");
            return Ok(());
        }

        let result = self.dispatch(directive).await;
        if result.is_err() {
            self.applied.lock().await.forget(directive.id);
        }
        result
    }

    async fn dispatch(&self, directive: &Directive) -> FleetResult<()> {
        match &directive.action {
            DirectiveAction::SpawnTask {
                action,
                instruction,
                priority,
                role,
            } => {
                let target = match (directive.scope, role) {
                    (DirectiveScope::Agent(id), _) => TaskTarget::Agent(id),
                    (_, Some(role)) => TaskTarget::Role(*role),
                    (DirectiveScope::Role(role), None) => TaskTarget::Role(role),
                    (DirectiveScope::Global, None) => {
                        return Err(FleetError::Orchestrator(format!(
                            "directive {} spawns a task with no target role",
                            directive.id
                        )));
                    }
                };
                let task = Task::new(
                    target,
                    TaskPayload::Corrective {
                        directive_id: directive.id,
                        kpi: directive.kpi.clone(),
                        action: action.clone(),
                        instruction: instruction.clone(),
                    },
                )
                .with_priority(*priority)
                .with_origin(directive.id);
                let task_id = self.queue.enqueue(task).await?;
                info!(directive_id = %directive.id, task_id = %task_id, task_target = %target, "corrective task enqueued");
                Ok(())
            }
            DirectiveAction::Escalate { message } => {
                error!(
                    directive_id = %directive.id,
                    scope = %directive.scope,
                    severity = directive.severity,
                    kpi = directive.kpi.as_deref().unwrap_or("-"),
                    "ESCALATION: {message}"
                );
                Ok(())
            }
            _ => {
                let targets = self.factory.resolve_scope(directive.scope).await;
                if targets.is_empty() {
                    debug!(directive_id = %directive.id, scope = %directive.scope, "directive matched no live agents");
                }
                for id in targets {
                    if let Err(e) = self.factory.deliver(id, directive.clone()).await {
                        warn!(agent_id = %id, directive_id = %directive.id, error = %e, "directive not delivered");
                    }
                }
                Ok(())
            }
        }
    }

    /// Run [`Self::run_cycle`] every `controller.cycle_secs` until `cancel`
    /// fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.controller.cycle_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(cycle_secs = self.config.controller.cycle_secs, "engine loop started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("engine loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_cycle(Utc::now()).await {
                    error!(error = %e, "engine cycle failed");
                }
            }
        })
    }

    /// Decommission every live agent.
    pub async fn shutdown(&self) {
        for id in self.factory.resolve_scope(DirectiveScope::Global).await {
            if let Err(e) = self.decommission_agent(id).await {
                warn!(agent_id = %id, error = %e, "decommission during shutdown failed");
            }
        }
        info!("orchestrator shut down");
    }
}
