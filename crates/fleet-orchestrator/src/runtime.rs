use crate::aggregator::MetricsAggregator;
use crate::config::RuntimeConfig;
use crate::handlers::{HandlerTable, TaskContext};
use crate::task_queue::{RequeueOutcome, SharedQueue};
use crate::types::{
    AgentInstance, AgentSpec, ControlMessage, Directive, DirectiveAction, Heartbeat,
    LifecycleState, MetricReport, SystemEvent, Task,
};
use chrono::Utc;
use fleet_agent::{compute_backoff, CapabilityPort, CapabilityRegistry, CapabilitySlot};
use fleet_core::{FleetError, Parameters};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reported once per completed task.
pub const METRIC_TASKS_COMPLETED: &str = "tasks_completed";
/// Reported once per permanently failed task.
pub const METRIC_TASKS_FAILED: &str = "tasks_failed";
/// Wall time of a completed task.
pub const METRIC_TASK_LATENCY_MS: &str = "task_latency_ms";

const APPLIED_MEMORY: usize = 256;

/// Shared collaborators every runtime needs.
#[derive(Clone)]
pub struct RuntimeDeps {
    /// Shared task queue.
    pub queue: SharedQueue,
    /// Receives heartbeats, reports and events.
    pub aggregator: Arc<MetricsAggregator>,
    /// Role handlers.
    pub handlers: HandlerTable,
    /// Providers bindings resolve against.
    pub registry: CapabilityRegistry,
    /// Runtime settings.
    pub config: RuntimeConfig,
}

enum Wake {
    Cancelled,
    Control(Option<ControlMessage>),
    Timer,
}

/// Drives one agent through its lifecycle.
///
/// The runtime is the only writer of its [`AgentInstance`]; everyone else
/// sees the copy published on the watch channel.
pub struct AgentRuntime {
    instance: AgentInstance,
    deps: RuntimeDeps,
    control: mpsc::Receiver<ControlMessage>,
    status: watch::Sender<AgentInstance>,
    cancel: CancellationToken,
    ports: HashMap<CapabilitySlot, Arc<dyn CapabilityPort>>,
    applied: HashSet<Uuid>,
    applied_order: VecDeque<Uuid>,
    paused_until: Option<Instant>,
    last_beat: Instant,
}

impl AgentRuntime {
    /// Runtime for agent `id`. Nothing runs until [`Self::run`].
    pub fn new(
        id: Uuid,
        spec: Arc<AgentSpec>,
        role_defaults: Parameters,
        deps: RuntimeDeps,
        control: mpsc::Receiver<ControlMessage>,
        status: watch::Sender<AgentInstance>,
        cancel: CancellationToken,
    ) -> Self {
        let mut parameters = role_defaults;
        parameters.extend(spec.parameters.clone());
        let instance = AgentInstance {
            id,
            spec,
            state: LifecycleState::Initializing,
            last_heartbeat: Utc::now(),
            current_task: None,
            consecutive_failures: 0,
            parameters,
            last_error: None,
        };
        status.send_replace(instance.clone());
        Self {
            instance,
            deps,
            control,
            status,
            cancel,
            ports: HashMap::new(),
            applied: HashSet::new(),
            applied_order: VecDeque::new(),
            paused_until: None,
            last_beat: Instant::now(),
        }
    }

    /// Run until cancelled or the control channel closes. Returns the final
    /// state, which is always `Stopped`.
    pub async fn run(mut self) -> LifecycleState {
        self.initialize().await;

        while !self.cancel.is_cancelled() {
            let keep_going = match self.instance.state {
                LifecycleState::Idle => self.idle_step().await,
                LifecycleState::Recovering => self.recovering_step().await,
                LifecycleState::Paused | LifecycleState::Failed => self.parked_step().await,
                LifecycleState::Initializing | LifecycleState::Executing => {
                    self.transition(LifecycleState::Idle).await;
                    true
                }
                LifecycleState::Stopped => false,
            };
            if !keep_going {
                break;
            }
        }

        self.instance.current_task = None;
        self.transition(LifecycleState::Stopped).await;
        info!(agent_id = %self.instance.id, "agent runtime stopped");
        LifecycleState::Stopped
    }

    /// Resolve capability bindings. Unknown providers park the agent in
    /// `Failed` with a binding error.
    async fn initialize(&mut self) {
        let mut ports = HashMap::new();
        let mut missing = Vec::new();
        for binding in &self.instance.spec.capabilities {
            match self.deps.registry.get(&binding.provider) {
                Some(port) => {
                    ports.insert(binding.slot, port);
                }
                None => missing.push(format!("{} -> '{}'", binding.slot, binding.provider)),
            }
        }

        if missing.is_empty() {
            self.ports = ports;
            self.instance.last_error = None;
            self.transition(LifecycleState::Idle).await;
            return;
        }

        let reason = FleetError::Binding(format!("unresolved providers: {}", missing.join(", ")))
            .to_string();
        warn!(agent_id = %self.instance.id, %reason, "capability binding failed");
        self.instance.last_error = Some(reason.clone());
        self.deps
            .aggregator
            .record_event(SystemEvent::BindingFailed {
                agent_id: self.instance.id,
                reason,
                at: Utc::now(),
            })
            .await;
        self.transition(LifecycleState::Failed).await;
    }

    async fn idle_step(&mut self) -> bool {
        let notify = self.deps.queue.notify_handle();
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(task) = self.deps.queue.claim(self.instance.id, Utc::now()).await {
            self.execute(task).await;
            return true;
        }

        let wait = self.deps.config.poll_interval().min(self.until_next_beat());
        let wake = tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            msg = self.control.recv() => Wake::Control(msg),
            _ = &mut notified => Wake::Timer,
            _ = tokio::time::sleep(wait) => Wake::Timer,
        };
        self.handle_wake(wake).await
    }

    async fn recovering_step(&mut self) -> bool {
        let attempt = self.instance.consecutive_failures.saturating_sub(1);
        let delay = Duration::from_millis(compute_backoff(
            &self.deps.config.retry_policy(),
            attempt,
        ));
        debug!(agent_id = %self.instance.id, delay_ms = delay.as_millis() as u64, "backing off");

        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(self.until_next_beat());
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                msg = self.control.recv() => Wake::Control(msg),
                _ = tokio::time::sleep(wait) => Wake::Timer,
            };
            if !self.handle_wake(wake).await {
                return false;
            }
            if self.instance.state != LifecycleState::Recovering {
                return true;
            }
        }

        self.transition(LifecycleState::Idle).await;
        true
    }

    /// `Paused` and `Failed` both wait for a directive; a timed pause also
    /// ends on its own.
    async fn parked_step(&mut self) -> bool {
        let mut wait = self.until_next_beat();
        if self.instance.state == LifecycleState::Paused {
            if let Some(until) = self.paused_until {
                let remaining = until.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.paused_until = None;
                    info!(agent_id = %self.instance.id, "pause elapsed");
                    self.transition(LifecycleState::Idle).await;
                    return true;
                }
                wait = wait.min(remaining);
            }
        }

        let wake = tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            msg = self.control.recv() => Wake::Control(msg),
            _ = tokio::time::sleep(wait) => Wake::Timer,
        };
        self.handle_wake(wake).await
    }

    async fn handle_wake(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Cancelled => false,
            Wake::Control(None) => {
                debug!(agent_id = %self.instance.id, "control channel closed");
                false
            }
            Wake::Control(Some(ControlMessage::Apply(directive))) => {
                self.apply(directive).await;
                true
            }
            Wake::Timer => {
                if self.until_next_beat().is_zero() {
                    self.beat().await;
                }
                true
            }
        }
    }

    async fn execute(&mut self, task: Task) {
        let task_id = task.id;
        self.instance.current_task = Some(task_id);
        self.transition(LifecycleState::Executing).await;
        info!(
            agent_id = %self.instance.id,
            task_id = %task_id,
            action = task.payload.action(),
            retry = task.retry_count,
            "executing task"
        );

        let role = self.instance.spec.role;
        let Some(handler) = self.deps.handlers.get(role) else {
            self.fail_permanently(&task, &format!("no handler for role {role}"))
                .await;
            return;
        };
        let ctx = TaskContext {
            agent_id: self.instance.id,
            role,
            parameters: self.instance.parameters.clone(),
            ports: self.ports.clone(),
            deadline: self.deps.config.call_deadline(),
        };

        let started = Instant::now();
        let cancel = self.cancel.clone();
        let call = handler.handle(&ctx, &task);
        tokio::pin!(call);
        // Keep heartbeating through long calls so a busy agent stays live.
        let period = self.deps.config.report_interval();
        let mut beats = tokio::time::interval_at(Instant::now() + period, period);
        beats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                r = &mut call => break Some(r),
                _ = beats.tick() => self.beat().await,
            }
        };

        match result {
            None => {
                self.deps.queue.release(task_id, self.instance.id).await;
                self.instance.current_task = None;
                debug!(agent_id = %self.instance.id, task_id = %task_id, "execution cancelled");
            }
            Some(Ok(outcome)) => {
                let latency_ms = started.elapsed().as_millis() as f64;
                let mut report = MetricReport::new(self.instance.id, role, Utc::now())
                    .with(METRIC_TASKS_COMPLETED, 1.0)
                    .with(METRIC_TASK_LATENCY_MS, latency_ms);
                report.values.extend(outcome.metrics);
                self.report(report).await;

                if let Err(e) = self.deps.queue.ack(task_id, self.instance.id).await {
                    warn!(task_id = %task_id, error = %e, "ack rejected");
                }
                self.instance.consecutive_failures = 0;
                self.instance.last_error = None;
                self.instance.current_task = None;
                self.transition(LifecycleState::Idle).await;
            }
            Some(Err(err)) if err.is_transient() => self.fail_transiently(&task, err).await,
            Some(Err(err)) => self.fail_permanently(&task, &err.to_string()).await,
        }
    }

    async fn fail_transiently(&mut self, task: &Task, err: FleetError) {
        let reason = err.to_string();
        self.instance.consecutive_failures += 1;
        self.instance.last_error = Some(reason.clone());
        self.instance.current_task = None;
        warn!(
            agent_id = %self.instance.id,
            task_id = %task.id,
            failures = self.instance.consecutive_failures,
            error = %reason,
            "transient task failure"
        );

        match self
            .deps
            .queue
            .requeue(task.id, self.instance.id, &reason)
            .await
        {
            Ok(RequeueOutcome::Exhausted(exhausted)) => {
                self.deps
                    .aggregator
                    .record_event(SystemEvent::TaskExhausted {
                        task_id: exhausted.id,
                        agent_id: Some(self.instance.id),
                        retries: exhausted.retry_count,
                        reason: reason.clone(),
                        at: Utc::now(),
                    })
                    .await;
            }
            Ok(RequeueOutcome::Requeued { .. }) => {}
            Err(e) => warn!(task_id = %task.id, error = %e, "requeue rejected"),
        }

        if self.instance.consecutive_failures >= self.deps.config.max_consecutive_failures {
            warn!(agent_id = %self.instance.id, "failure budget exhausted, agent degraded");
            self.deps
                .aggregator
                .record_event(SystemEvent::AgentDegraded {
                    agent_id: self.instance.id,
                    reason,
                    at: Utc::now(),
                })
                .await;
            self.transition(LifecycleState::Failed).await;
        } else {
            self.transition(LifecycleState::Recovering).await;
        }
    }

    async fn fail_permanently(&mut self, task: &Task, reason: &str) {
        warn!(agent_id = %self.instance.id, task_id = %task.id, reason, "task failed permanently");
        if let Err(e) = self.deps.queue.abandon(task.id, reason).await {
            warn!(task_id = %task.id, error = %e, "abandon rejected");
        }
        self.instance.last_error = Some(reason.to_string());
        self.instance.current_task = None;
        let report = MetricReport::new(self.instance.id, self.instance.spec.role, Utc::now())
            .with(METRIC_TASKS_FAILED, 1.0);
        self.report(report).await;
        self.transition(LifecycleState::Idle).await;
    }

    async fn report(&self, report: MetricReport) {
        if let Err(e) = self.deps.aggregator.record(report).await {
            debug!(agent_id = %self.instance.id, error = %e, "metric report not recorded");
        }
    }

    /// Apply a directive once. Replays of the same directive id are ignored.
    async fn apply(&mut self, directive: Directive) {
        if !self.applied.insert(directive.id) {
            debug!(directive_id = %directive.id, "directive already applied");
            return;
        }
        self.applied_order.push_back(directive.id);
        while self.applied_order.len() > APPLIED_MEMORY {
            if let Some(old) = self.applied_order.pop_front() {
                self.applied.remove(&old);
            }
        }

        info!(
            agent_id = %self.instance.id,
            directive_id = %directive.id,
            action = ?directive.kind(),
            "applying directive"
        );
        match directive.action {
            DirectiveAction::AdjustParameter { name, value } => {
                self.instance.parameters.insert(name, value);
                self.publish();
            }
            DirectiveAction::PauseAgent { duration_secs } => {
                self.paused_until =
                    duration_secs.map(|s| Instant::now() + Duration::from_secs(s));
                if self.instance.state != LifecycleState::Paused {
                    self.transition(LifecycleState::Paused).await;
                }
            }
            DirectiveAction::ResumeAgent => {
                if self.instance.state == LifecycleState::Paused {
                    self.paused_until = None;
                    self.transition(LifecycleState::Idle).await;
                }
            }
            DirectiveAction::RestartAgent => self.restart().await,
            DirectiveAction::SpawnTask { .. } | DirectiveAction::Escalate { .. } => {
                debug!(directive_id = %directive.id, "directive not addressed to runtimes");
            }
        }
    }

    async fn restart(&mut self) {
        self.instance.consecutive_failures = 0;
        self.paused_until = None;
        match self.instance.state {
            LifecycleState::Failed if self.ports.is_empty() => {
                self.transition(LifecycleState::Initializing).await;
                self.initialize().await;
            }
            LifecycleState::Failed | LifecycleState::Paused | LifecycleState::Recovering => {
                self.instance.last_error = None;
                self.transition(LifecycleState::Idle).await;
            }
            _ => {
                // Still answering the restart proves liveness.
                self.beat().await;
            }
        }
    }

    fn until_next_beat(&self) -> Duration {
        self.deps
            .config
            .report_interval()
            .saturating_sub(self.last_beat.elapsed())
    }

    fn publish(&self) {
        self.status.send_replace(self.instance.clone());
    }

    async fn transition(&mut self, state: LifecycleState) {
        let from = self.instance.state;
        self.instance.state = state;
        if from != state {
            info!(
                agent_id = %self.instance.id,
                role = %self.instance.spec.role,
                from = %from,
                to = %state,
                "agent state transition"
            );
        }
        self.beat().await;
    }

    async fn beat(&mut self) {
        let now = Utc::now();
        self.instance.last_heartbeat = now;
        self.last_beat = Instant::now();
        self.publish();
        self.deps
            .aggregator
            .heartbeat(Heartbeat {
                agent_id: self.instance.id,
                state: self.instance.state,
                at: now,
                current_task: self.instance.current_task,
                consecutive_failures: self.instance.consecutive_failures,
                last_error: self.instance.last_error.clone(),
            })
            .await;
    }
}
