use crate::config::ControllerConfig;
use crate::types::{
    Directive, DirectiveAction, DirectiveScope, DirectiveStatus, HealthStatus, Snapshot,
    SystemEvent,
};
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Comparison a KPI must satisfy to be considered healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Comparator {
    /// Whether `value` satisfies the comparator against `target`.
    pub fn holds(&self, value: f64, target: f64) -> bool {
        match self {
            Comparator::Lt => value < target,
            Comparator::Le => value <= target,
            Comparator::Gt => value > target,
            Comparator::Ge => value >= target,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

/// Threshold policy on one KPI.
///
/// ```toml
/// [[policies]]
/// metric = "conversionRate"
/// comparator = "ge"
/// target = 0.02
/// scope = { type = "role", value = "revenue_optimizer" }
/// actions = [{ action = "adjust_parameter", name = "discount", value = 0.1 }]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiPolicy {
    /// KPI name as reported by agents.
    pub metric: String,
    /// Healthy when `value <comparator> target`.
    pub comparator: Comparator,
    /// Threshold the KPI is compared against.
    pub target: f64,
    /// Who the directives address.
    #[serde(default)]
    pub scope: DirectiveScope,
    /// Issued on the first breached cycle.
    pub actions: Vec<DirectiveAction>,
    /// Issued once the breach has lasted `escalate_after` cycles. Defaults to
    /// pausing the scope for one directive TTL and raising an alert; global
    /// scopes only alert.
    #[serde(default)]
    pub escalation: Option<Vec<DirectiveAction>>,
    /// Overrides the controller-wide setting.
    #[serde(default)]
    pub escalate_after: Option<u32>,
}

impl KpiPolicy {
    /// Reject policies the controller could never act on.
    pub fn validate(&self) -> FleetResult<()> {
        if self.metric.trim().is_empty() {
            return Err(FleetError::Config("policy metric is empty".into()));
        }
        if !self.target.is_finite() {
            return Err(FleetError::Config(format!(
                "policy '{}' target is not a finite number",
                self.metric
            )));
        }
        if self.actions.is_empty() {
            return Err(FleetError::Config(format!(
                "policy '{}' has no actions",
                self.metric
            )));
        }
        if self.escalate_after == Some(0) {
            return Err(FleetError::Config(format!(
                "policy '{}' escalate_after must be > 0",
                self.metric
            )));
        }
        let all = self.actions.iter().chain(self.escalation.iter().flatten());
        for action in all {
            if let DirectiveAction::SpawnTask { role: None, .. } = action {
                if self.scope == DirectiveScope::Global {
                    return Err(FleetError::Config(format!(
                        "policy '{}' spawns a task with global scope but names no role",
                        self.metric
                    )));
                }
            }
        }
        Ok(())
    }

    fn escalation_actions(&self, pause_secs: u64) -> Vec<DirectiveAction> {
        if let Some(actions) = &self.escalation {
            return actions.clone();
        }
        let alert = DirectiveAction::Escalate {
            message: format!(
                "{} still breaching {} {} after escalation window",
                self.metric,
                self.comparator.symbol(),
                self.target
            ),
        };
        match self.scope {
            DirectiveScope::Global => vec![alert],
            _ => vec![
                DirectiveAction::PauseAgent {
                    duration_secs: Some(pause_secs),
                },
                alert,
            ],
        }
    }
}

/// A running breach of one (KPI, scope) pair.
struct Episode {
    consecutive: u32,
    escalated: bool,
    /// Some directive of this episode paused its scope.
    paused: bool,
    /// When the last directive of this episode expires.
    expires_at: DateTime<Utc>,
    directives: Vec<Uuid>,
}

impl Episode {
    fn track(&mut self, directives: &[Directive]) {
        for d in directives {
            self.directives.push(d.id);
            self.paused |= matches!(d.action, DirectiveAction::PauseAgent { .. });
            self.expires_at = self.expires_at.max(d.expires_at);
        }
    }
}

/// Restart directive outstanding for one agent.
struct PendingRestart {
    directive: Uuid,
    expires_at: DateTime<Utc>,
}

/// Turns snapshots into directives. Never touches agent state itself.
pub struct FeedbackController {
    config: ControllerConfig,
    policies: Vec<KpiPolicy>,
    episodes: HashMap<(String, DirectiveScope), Episode>,
    restarts: HashMap<Uuid, PendingRestart>,
    /// Exhausted tasks already escalated. Pruned with [`Self::forget_tasks`].
    exhausted_seen: HashSet<Uuid>,
    history: VecDeque<Directive>,
}

impl FeedbackController {
    /// Controller with no open episodes.
    pub fn new(config: ControllerConfig, policies: Vec<KpiPolicy>) -> Self {
        Self {
            config,
            policies,
            episodes: HashMap::new(),
            restarts: HashMap::new(),
            exhausted_seen: HashSet::new(),
            history: VecDeque::new(),
        }
    }

    /// Configured policies, in evaluation order.
    pub fn policies(&self) -> &[KpiPolicy] {
        &self.policies
    }

    /// Evaluate one snapshot and return the directives it produced.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Directive> {
        let mut issued = self.expire(now);

        let policies = self.policies.clone();
        for policy in &policies {
            let Some(&value) = snapshot.kpis.get(&policy.metric) else {
                continue;
            };
            let key = (policy.metric.clone(), policy.scope);

            if policy.comparator.holds(value, policy.target) {
                if let Some(episode) = self.episodes.remove(&key) {
                    info!(kpi = %policy.metric, scope = %policy.scope, value, "KPI recovered");
                    self.settle(&episode.directives, DirectiveStatus::Resolved);
                    if episode.paused {
                        let reason = format!("{} recovered to {value}", policy.metric);
                        issued.push(self.resume(policy.scope, &policy.metric, &reason, now));
                    }
                }
                continue;
            }

            let reason = format!(
                "{}={value} breaches {} {}",
                policy.metric,
                policy.comparator.symbol(),
                policy.target
            );
            let escalate_after = policy.escalate_after.unwrap_or(self.config.escalate_after);

            match self.episodes.get_mut(&key) {
                None => {
                    warn!(kpi = %policy.metric, scope = %policy.scope, value, "KPI breached");
                    let directives: Vec<Directive> = policy
                        .actions
                        .iter()
                        .map(|a| self.directive(policy.scope, a.clone(), Some(&policy.metric), 1, &reason, now))
                        .collect();
                    let mut episode = Episode {
                        consecutive: 1,
                        escalated: false,
                        paused: false,
                        expires_at: now,
                        directives: Vec::new(),
                    };
                    episode.track(&directives);
                    if escalate_after <= 1 {
                        episode.escalated = true;
                        let escalated = self.escalate(policy, &reason, now);
                        episode.track(&escalated);
                        issued.extend(directives);
                        issued.extend(escalated);
                    } else {
                        issued.extend(directives);
                    }
                    self.episodes.insert(key, episode);
                }
                Some(episode) => {
                    episode.consecutive += 1;
                    if !episode.escalated && episode.consecutive >= escalate_after {
                        episode.escalated = true;
                        let consecutive = episode.consecutive;
                        warn!(
                            kpi = %policy.metric,
                            scope = %policy.scope,
                            cycles = consecutive,
                            "KPI breach persists, escalating"
                        );
                        let escalated = self.escalate(policy, &reason, now);
                        if let Some(episode) = self.episodes.get_mut(&key) {
                            episode.track(&escalated);
                        }
                        issued.extend(escalated);
                    }
                }
            }
        }

        if self.config.restart_unhealthy {
            issued.extend(self.health_rules(snapshot, now));
        }
        issued.extend(self.exhaustion_rules(snapshot, now));

        for directive in &issued {
            info!(
                directive_id = %directive.id,
                scope = %directive.scope,
                action = ?directive.kind(),
                severity = directive.severity,
                "directive issued"
            );
            self.history.push_back(directive.clone());
        }
        while self.history.len() > self.config.max_history.max(1) {
            self.history.pop_front();
        }
        issued
    }

    fn escalate(&self, policy: &KpiPolicy, reason: &str, now: DateTime<Utc>) -> Vec<Directive> {
        policy
            .escalation_actions(self.config.directive_ttl_secs)
            .into_iter()
            .map(|a| self.directive(policy.scope, a, Some(&policy.metric), 2, reason, now))
            .collect()
    }

    fn health_rules(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Directive> {
        let mut issued = Vec::new();
        for (agent_id, status) in &snapshot.agents {
            match status {
                HealthStatus::Unresponsive | HealthStatus::Degraded => {
                    if self.restarts.contains_key(agent_id) {
                        continue;
                    }
                    let reason = format!("agent reported {status:?}");
                    let directive = self.directive(
                        DirectiveScope::Agent(*agent_id),
                        DirectiveAction::RestartAgent,
                        None,
                        1,
                        &reason,
                        now,
                    );
                    self.restarts.insert(
                        *agent_id,
                        PendingRestart {
                            directive: directive.id,
                            expires_at: directive.expires_at,
                        },
                    );
                    issued.push(directive);
                }
                HealthStatus::Healthy => {
                    if let Some(pending) = self.restarts.remove(agent_id) {
                        self.settle(&[pending.directive], DirectiveStatus::Resolved);
                    }
                }
                HealthStatus::Stopped => {
                    if let Some(pending) = self.restarts.remove(agent_id) {
                        self.settle(&[pending.directive], DirectiveStatus::Expired);
                    }
                }
                _ => {}
            }
        }
        issued
    }

    fn exhaustion_rules(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Directive> {
        let mut issued = Vec::new();
        for event in &snapshot.events {
            if let SystemEvent::TaskExhausted {
                task_id,
                agent_id,
                retries,
                reason,
                ..
            } = event
            {
                if !self.exhausted_seen.insert(*task_id) {
                    continue;
                }
                let scope = agent_id.map_or(DirectiveScope::Global, DirectiveScope::Agent);
                let message = format!("task {task_id} dropped after {retries} retries: {reason}");
                issued.push(self.directive(
                    scope,
                    DirectiveAction::Escalate {
                        message: message.clone(),
                    },
                    None,
                    2,
                    &message,
                    now,
                ));
            }
        }
        issued
    }

    fn resume(
        &self,
        scope: DirectiveScope,
        kpi: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Directive {
        self.directive(scope, DirectiveAction::ResumeAgent, Some(kpi), 1, reason, now)
    }

    fn directive(
        &self,
        scope: DirectiveScope,
        action: DirectiveAction,
        kpi: Option<&str>,
        severity: u8,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Directive {
        Directive {
            id: Uuid::new_v4(),
            scope,
            action,
            kpi: kpi.map(str::to_string),
            severity,
            reason: reason.to_string(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.directive_ttl_secs as i64),
            status: DirectiveStatus::Active,
        }
    }

    /// Expire directives past their TTL. An episode whose directives all
    /// expired is forgotten, so a persisting breach is answered afresh; a
    /// scope it paused is resumed.
    fn expire(&mut self, now: DateTime<Utc>) -> Vec<Directive> {
        let mut count = 0;
        for directive in self.history.iter_mut() {
            if directive.is_active() && directive.expires_at <= now {
                directive.status = DirectiveStatus::Expired;
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "directives expired");
        }

        let lapsed: Vec<(String, DirectiveScope)> = self
            .episodes
            .iter()
            .filter(|(_, ep)| ep.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut resumes = Vec::new();
        for key in lapsed {
            let Some(episode) = self.episodes.remove(&key) else {
                continue;
            };
            let (metric, scope) = key;
            debug!(kpi = %metric, scope = %scope, "breach episode lapsed");
            if episode.paused {
                let reason = format!("{metric} escalation expired");
                resumes.push(self.resume(scope, &metric, &reason, now));
            }
        }
        self.restarts.retain(|_, pending| pending.expires_at > now);
        resumes
    }

    /// Drop bookkeeping for tasks the queue no longer holds.
    pub fn forget_tasks(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.exhausted_seen.remove(id);
        }
    }

    fn settle(&mut self, ids: &[Uuid], status: DirectiveStatus) {
        for directive in self.history.iter_mut() {
            if directive.is_active() && ids.contains(&directive.id) {
                directive.status = status;
            }
        }
    }

    /// Every retained directive, oldest first.
    pub fn list_directives(&self) -> Vec<Directive> {
        self.history.iter().cloned().collect()
    }

    /// Retained directives still in force.
    pub fn active_directives(&self) -> Vec<Directive> {
        self.history.iter().filter(|d| d.is_active()).cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, AgentRole};
    use std::collections::BTreeMap;

    fn conversion_policy() -> KpiPolicy {
        KpiPolicy {
            metric: "conversionRate".into(),
            comparator: Comparator::Ge,
            target: 0.02,
            scope: DirectiveScope::Role(AgentRole::RevenueOptimizer),
            actions: vec![DirectiveAction::AdjustParameter {
                name: "discount".into(),
                value: 0.1.into(),
            }],
            escalation: None,
            escalate_after: None,
        }
    }

    fn snapshot(window: u64, kpis: &[(&str, f64)]) -> Snapshot {
        let now = Utc::now();
        Snapshot {
            window,
            window_start: now,
            window_end: now,
            revision: 0,
            kpis: kpis.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            agents: BTreeMap::new(),
            events: Vec::new(),
            report_count: 1,
        }
    }

    fn controller() -> FeedbackController {
        FeedbackController::new(ControllerConfig::default(), vec![conversion_policy()])
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::Ge.holds(0.02, 0.02));
        assert!(!Comparator::Gt.holds(0.02, 0.02));
        assert!(Comparator::Lt.holds(1.0, 2.0));
        assert!(Comparator::Le.holds(2.0, 2.0));
    }

    #[test]
    fn test_breach_dedup_and_escalation() {
        let mut c = controller();
        let now = Utc::now();

        let first = c.evaluate(&snapshot(0, &[("conversionRate", 0.01)]), now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind(), ActionKind::AdjustParameter);
        assert_eq!(first[0].severity, 1);

        let second = c.evaluate(&snapshot(1, &[("conversionRate", 0.012)]), now);
        assert!(second.is_empty());
        assert_eq!(c.active_directives().len(), 1);

        let third = c.evaluate(&snapshot(2, &[("conversionRate", 0.011)]), now);
        let kinds: Vec<ActionKind> = third.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec![ActionKind::PauseAgent, ActionKind::Escalate]);
        assert!(third.iter().all(|d| d.severity == 2));
        assert_eq!(
            third[0].action,
            DirectiveAction::PauseAgent {
                duration_secs: Some(ControllerConfig::default().directive_ttl_secs)
            }
        );

        // Escalates once per episode.
        assert!(c
            .evaluate(&snapshot(3, &[("conversionRate", 0.01)]), now)
            .is_empty());
    }

    #[test]
    fn test_recovery_resolves_and_rearms() {
        let mut c = controller();
        let now = Utc::now();
        c.evaluate(&snapshot(0, &[("conversionRate", 0.01)]), now);
        assert!(c
            .evaluate(&snapshot(1, &[("conversionRate", 0.05)]), now)
            .is_empty());
        assert!(c.active_directives().is_empty());
        assert_eq!(c.list_directives()[0].status, DirectiveStatus::Resolved);

        let again = c.evaluate(&snapshot(2, &[("conversionRate", 0.01)]), now);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_recovery_resumes_paused_scope() {
        let mut c = controller();
        let now = Utc::now();
        for w in 0..3 {
            c.evaluate(&snapshot(w, &[("conversionRate", 0.01)]), now);
        }

        let recovered = c.evaluate(&snapshot(3, &[("conversionRate", 0.5)]), now);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].kind(), ActionKind::ResumeAgent);
        assert_eq!(
            recovered[0].scope,
            DirectiveScope::Role(AgentRole::RevenueOptimizer)
        );
        let paused = c
            .list_directives()
            .into_iter()
            .find(|d| d.kind() == ActionKind::PauseAgent)
            .unwrap();
        assert_eq!(paused.status, DirectiveStatus::Resolved);
    }

    #[test]
    fn test_lapsed_escalation_resumes_without_kpi() {
        let mut c = FeedbackController::new(
            ControllerConfig {
                directive_ttl_secs: 60,
                ..ControllerConfig::default()
            },
            vec![conversion_policy()],
        );
        let now = Utc::now();
        for w in 0..3 {
            c.evaluate(&snapshot(w, &[("conversionRate", 0.01)]), now);
        }

        // The paused role reports nothing, so the KPI is missing.
        let later = now + chrono::Duration::seconds(61);
        let issued = c.evaluate(&snapshot(3, &[]), later);
        let kinds: Vec<ActionKind> = issued.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec![ActionKind::ResumeAgent]);
        assert!(c
            .list_directives()
            .iter()
            .filter(|d| d.kind() != ActionKind::ResumeAgent)
            .all(|d| d.status == DirectiveStatus::Expired));
    }

    #[test]
    fn test_expiry_outlives_bounded_history() {
        let mut c = FeedbackController::new(
            ControllerConfig {
                directive_ttl_secs: 60,
                max_history: 1,
                ..ControllerConfig::default()
            },
            vec![conversion_policy()],
        );
        let now = Utc::now();
        let agent = Uuid::new_v4();
        c.evaluate(&snapshot(0, &[("conversionRate", 0.01)]), now);
        let mut sick = snapshot(1, &[]);
        sick.agents.insert(agent, HealthStatus::Unresponsive);
        c.evaluate(&sick, now);
        // Push both directives out of the retained history.
        for _ in 0..2 {
            let mut other = snapshot(1, &[]);
            other.agents.insert(Uuid::new_v4(), HealthStatus::Degraded);
            c.evaluate(&other, now);
        }
        assert_eq!(c.list_directives().len(), 1);

        let later = now + chrono::Duration::seconds(61);
        let mut again = snapshot(2, &[("conversionRate", 0.01)]);
        again.agents.insert(agent, HealthStatus::Unresponsive);
        let kinds: Vec<ActionKind> = c.evaluate(&again, later).iter().map(|d| d.kind()).collect();
        assert!(kinds.contains(&ActionKind::AdjustParameter));
        assert!(kinds.contains(&ActionKind::RestartAgent));
    }

    #[test]
    fn test_forget_tasks_rearms_exhaustion() {
        let mut c = FeedbackController::new(ControllerConfig::default(), Vec::new());
        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let mut snap = snapshot(0, &[]);
        snap.events.push(SystemEvent::TaskExhausted {
            task_id,
            agent_id: None,
            retries: 5,
            reason: "timeout".into(),
            at: now,
        });
        assert_eq!(c.evaluate(&snap, now).len(), 1);
        assert!(c.evaluate(&snap, now).is_empty());

        c.forget_tasks(&[task_id]);
        assert!(c.exhausted_seen.is_empty());
    }

    #[test]
    fn test_missing_kpi_is_skipped() {
        let mut c = controller();
        let now = Utc::now();
        assert!(c.evaluate(&snapshot(0, &[("other", 1.0)]), now).is_empty());
        c.evaluate(&snapshot(1, &[("conversionRate", 0.01)]), now);
        // A gap neither resolves nor advances the episode.
        assert!(c.evaluate(&snapshot(2, &[]), now).is_empty());
        assert_eq!(c.active_directives().len(), 1);
    }

    #[test]
    fn test_ttl_expiry_reissues() {
        let mut c = FeedbackController::new(
            ControllerConfig {
                directive_ttl_secs: 60,
                ..ControllerConfig::default()
            },
            vec![conversion_policy()],
        );
        let now = Utc::now();
        c.evaluate(&snapshot(0, &[("conversionRate", 0.01)]), now);
        let later = now + chrono::Duration::seconds(61);
        let reissued = c.evaluate(&snapshot(1, &[("conversionRate", 0.01)]), later);
        assert_eq!(reissued.len(), 1);
        assert_eq!(c.list_directives()[0].status, DirectiveStatus::Expired);
    }

    #[test]
    fn test_unhealthy_agent_gets_one_restart() {
        let mut c = FeedbackController::new(ControllerConfig::default(), Vec::new());
        let now = Utc::now();
        let agent = Uuid::new_v4();
        let mut snap = snapshot(0, &[]);
        snap.agents.insert(agent, HealthStatus::Unresponsive);

        let issued = c.evaluate(&snap, now);
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].scope, DirectiveScope::Agent(agent));
        assert_eq!(issued[0].kind(), ActionKind::RestartAgent);
        assert!(c.evaluate(&snap, now).is_empty());

        snap.agents.insert(agent, HealthStatus::Healthy);
        c.evaluate(&snap, now);
        assert!(c.active_directives().is_empty());
    }

    #[test]
    fn test_task_exhausted_escalates_once() {
        let mut c = FeedbackController::new(ControllerConfig::default(), Vec::new());
        let now = Utc::now();
        let mut snap = snapshot(0, &[]);
        snap.events.push(SystemEvent::TaskExhausted {
            task_id: Uuid::new_v4(),
            agent_id: None,
            retries: 5,
            reason: "timeout".into(),
            at: now,
        });
        let issued = c.evaluate(&snap, now);
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].kind(), ActionKind::Escalate);
        assert_eq!(issued[0].scope, DirectiveScope::Global);
        assert!(c.evaluate(&snap, now).is_empty());
    }

    #[test]
    fn test_policy_validation() {
        conversion_policy().validate().unwrap();

        let mut empty = conversion_policy();
        empty.actions.clear();
        assert!(empty.validate().is_err());

        let mut global_spawn = conversion_policy();
        global_spawn.scope = DirectiveScope::Global;
        global_spawn.actions = vec![DirectiveAction::SpawnTask {
            action: "x".into(),
            instruction: String::new(),
            priority: 1,
            role: None,
        }];
        assert!(global_spawn.validate().is_err());
    }

    #[test]
    fn test_global_escalation_only_alerts() {
        let mut policy = conversion_policy();
        policy.scope = DirectiveScope::Global;
        policy.escalate_after = Some(1);
        let mut c = FeedbackController::new(ControllerConfig::default(), vec![policy]);
        let issued = c.evaluate(&snapshot(0, &[("conversionRate", 0.0)]), Utc::now());
        let kinds: Vec<ActionKind> = issued.iter().map(|d| d.kind()).collect();
        assert_eq!(kinds, vec![ActionKind::AdjustParameter, ActionKind::Escalate]);
    }
}
