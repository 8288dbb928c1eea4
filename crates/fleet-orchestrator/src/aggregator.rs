use crate::config::AggregatorConfig;
use crate::types::{
    AgentHealth, AgentRole, HealthEvent, HealthStatus, Heartbeat, LifecycleState, MetricReport,
    Snapshot, SystemEvent,
};
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_AGENT_EVENTS: usize = 20;
const MAX_DIAGNOSTICS: usize = 256;

/// How the values of one KPI inside a window fold into a single number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationRule {
    /// Sum of all values.
    Sum,
    /// Value of the newest report.
    #[default]
    Latest,
    /// Arithmetic mean.
    Average,
    /// Change per second between the latest value of this window and the
    /// latest value of the previous one.
    Rate,
}

/// Where an accepted report landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Buffered for a window that has not closed yet.
    Open {
        /// Window the report landed in.
        window: u64,
    },
    /// Attributed to an already closed window, whose snapshot was rebuilt.
    Revised {
        /// Window the report landed in.
        window: u64,
        /// Revision of the rebuilt snapshot.
        revision: u32,
    },
}

/// A window that just closed, with the reports it was built from.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    /// Snapshot built at closing.
    pub snapshot: Arc<Snapshot>,
    /// Reports the snapshot was built from.
    pub reports: Vec<MetricReport>,
}

#[derive(Default)]
struct WindowData {
    reports: Vec<MetricReport>,
    events: Vec<SystemEvent>,
    snapshot: Option<Arc<Snapshot>>,
}

struct AgentTrack {
    role: AgentRole,
    display_name: String,
    state: LifecycleState,
    last_heartbeat: DateTime<Utc>,
    current_task: Option<Uuid>,
    consecutive_failures: u32,
    last_error: Option<String>,
    events: VecDeque<HealthEvent>,
    flagged_unresponsive: bool,
}

impl AgentTrack {
    fn status(&self, now: DateTime<Utc>, liveness: chrono::Duration) -> HealthStatus {
        if self.state == LifecycleState::Stopped {
            return HealthStatus::Stopped;
        }
        if now - self.last_heartbeat > liveness {
            return HealthStatus::Unresponsive;
        }
        match self.state {
            LifecycleState::Initializing => HealthStatus::Initializing,
            LifecycleState::Idle | LifecycleState::Executing => HealthStatus::Healthy,
            LifecycleState::Recovering => HealthStatus::Recovering,
            LifecycleState::Paused => HealthStatus::Paused,
            LifecycleState::Failed => HealthStatus::Degraded,
            LifecycleState::Stopped => HealthStatus::Stopped,
        }
    }

    fn push_event(&mut self, event: HealthEvent) {
        self.events.push_front(event);
        self.events.truncate(MAX_AGENT_EVENTS);
    }
}

struct AggregatorState {
    next_to_close: u64,
    windows: BTreeMap<u64, WindowData>,
    agents: HashMap<Uuid, AgentTrack>,
    history: VecDeque<Arc<Snapshot>>,
    diagnostics: VecDeque<SystemEvent>,
    /// Late reports accepted into closed windows, not yet persisted.
    revisions: Vec<MetricReport>,
}

/// Collects metric reports and heartbeats, and folds reports into fixed,
/// non-overlapping windows.
///
/// Window `k` covers `(origin + k*W, origin + (k+1)*W]`. A snapshot is built
/// when its window closes; late reports that still fall inside the retention
/// horizon produce a new revision of that snapshot.
pub struct MetricsAggregator {
    config: AggregatorConfig,
    origin: DateTime<Utc>,
    liveness: chrono::Duration,
    state: RwLock<AggregatorState>,
}

impl MetricsAggregator {
    /// Aggregator whose window 0 starts now.
    pub fn new(config: AggregatorConfig, liveness: Duration) -> Self {
        Self::with_origin(config, liveness, Utc::now())
    }

    /// Aggregator whose window 0 starts right after `origin`.
    pub fn with_origin(config: AggregatorConfig, liveness: Duration, origin: DateTime<Utc>) -> Self {
        let liveness =
            chrono::Duration::from_std(liveness).unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            config,
            origin,
            liveness,
            state: RwLock::new(AggregatorState {
                next_to_close: 0,
                windows: BTreeMap::new(),
                agents: HashMap::new(),
                history: VecDeque::new(),
                diagnostics: VecDeque::new(),
                revisions: Vec::new(),
            }),
        }
    }

    /// Instant window 0 starts after.
    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    fn window_ms(&self) -> i64 {
        (self.config.window_secs as i64).saturating_mul(1000).max(1)
    }

    /// Window containing `ts`, or `None` for instants at or before the origin.
    pub fn window_index(&self, ts: DateTime<Utc>) -> Option<u64> {
        let offset = (ts - self.origin).num_milliseconds();
        if offset <= 0 {
            return None;
        }
        Some(((offset - 1) / self.window_ms()) as u64)
    }

    /// Exclusive lower bound of `window`.
    pub fn window_start(&self, window: u64) -> DateTime<Utc> {
        self.origin + chrono::Duration::milliseconds(self.window_ms().saturating_mul(window as i64))
    }

    /// Inclusive upper bound of `window`.
    pub fn window_end(&self, window: u64) -> DateTime<Utc> {
        self.window_start(window + 1)
    }

    /// Start tracking an agent's heartbeats and health.
    pub async fn register_agent(
        &self,
        agent_id: Uuid,
        role: AgentRole,
        display_name: &str,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        state.agents.insert(
            agent_id,
            AgentTrack {
                role,
                display_name: display_name.to_string(),
                state: LifecycleState::Initializing,
                last_heartbeat: now,
                current_task: None,
                consecutive_failures: 0,
                last_error: None,
                events: VecDeque::new(),
                flagged_unresponsive: false,
            },
        );
    }

    /// Record a liveness beat and the state it carries.
    pub async fn heartbeat(&self, beat: Heartbeat) {
        let mut state = self.state.write().await;
        let Some(track) = state.agents.get_mut(&beat.agent_id) else {
            debug!(agent_id = %beat.agent_id, "heartbeat from unregistered agent");
            return;
        };
        track.state = beat.state;
        track.last_heartbeat = beat.at;
        track.current_task = beat.current_task;
        track.consecutive_failures = beat.consecutive_failures;
        track.last_error = beat.last_error;
        track.flagged_unresponsive = false;
    }

    /// Mark an agent as stopped regardless of what its runtime last said.
    pub async fn mark_stopped(&self, agent_id: Uuid, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(track) = state.agents.get_mut(&agent_id) {
            track.state = LifecycleState::Stopped;
            track.current_task = None;
            track.last_heartbeat = now;
        }
    }

    /// Record a metric report.
    ///
    /// Reports for closed windows inside the retention horizon rebuild that
    /// window's snapshot. Anything older is rejected with
    /// [`FleetError::LateReport`] and kept as a diagnostic.
    pub async fn record(&self, report: MetricReport) -> FleetResult<RecordOutcome> {
        let window = self.window_index(report.timestamp);
        let mut state = self.state.write().await;
        let next = state.next_to_close;

        match window {
            Some(k) if k >= next => {
                state.windows.entry(k).or_default().reports.push(report);
                Ok(RecordOutcome::Open { window: k })
            }
            Some(k) if next - k <= self.config.retention_windows => {
                let previous = state
                    .windows
                    .get(&k)
                    .and_then(|w| w.snapshot.clone());
                let Some(previous) = previous else {
                    return Err(self.reject_late(&mut state, report));
                };
                state.revisions.push(report.clone());
                if let Some(data) = state.windows.get_mut(&k) {
                    data.reports.push(report);
                }
                let revised = Arc::new(self.build_snapshot(
                    &state,
                    k,
                    previous.revision + 1,
                    previous.agents.clone(),
                ));
                if let Some(data) = state.windows.get_mut(&k) {
                    data.snapshot = Some(revised.clone());
                }
                for slot in state.history.iter_mut() {
                    if slot.window == k {
                        *slot = revised.clone();
                    }
                }
                info!(window = k, revision = revised.revision, "snapshot revised by late report");
                Ok(RecordOutcome::Revised {
                    window: k,
                    revision: revised.revision,
                })
            }
            _ => Err(self.reject_late(&mut state, report)),
        }
    }

    fn reject_late(&self, state: &mut AggregatorState, report: MetricReport) -> FleetError {
        let now = Utc::now();
        warn!(
            agent_id = %report.agent_id,
            timestamp = %report.timestamp,
            "dropping report older than the retention horizon"
        );
        let event = SystemEvent::LateReport {
            agent_id: report.agent_id,
            timestamp: report.timestamp,
            at: now,
        };
        if let Some(track) = state.agents.get_mut(&report.agent_id) {
            track.push_event(HealthEvent {
                at: now,
                kind: event.kind().to_string(),
                message: event.describe(),
            });
        }
        state.diagnostics.push_back(event);
        while state.diagnostics.len() > MAX_DIAGNOSTICS {
            state.diagnostics.pop_front();
        }
        FleetError::LateReport {
            agent_id: report.agent_id,
            timestamp: report.timestamp,
        }
    }

    /// Late reports accepted since the last call, in arrival order.
    pub async fn take_revisions(&self) -> Vec<MetricReport> {
        std::mem::take(&mut self.state.write().await.revisions)
    }

    /// Attach a surfaced condition to the open window it happened in and to
    /// the concerned agent's health history.
    pub async fn record_event(&self, event: SystemEvent) {
        let mut state = self.state.write().await;
        let next = state.next_to_close;
        let window = self.window_index(event.at()).unwrap_or(0).max(next);

        if let Some(agent_id) = event.agent_id() {
            if let Some(track) = state.agents.get_mut(&agent_id) {
                track.push_event(HealthEvent {
                    at: event.at(),
                    kind: event.kind().to_string(),
                    message: event.describe(),
                });
            }
        }
        info!(kind = event.kind(), window, "system event recorded");
        state.windows.entry(window).or_default().events.push(event);
    }

    /// Close every window that ended at or before `now`, oldest first.
    pub async fn close_due_windows(&self, now: DateTime<Utc>) -> Vec<ClosedWindow> {
        let mut state = self.state.write().await;
        let mut closed = Vec::new();

        let mut due = Vec::new();
        let mut k = state.next_to_close;
        while self.window_end(k) <= now {
            due.push(k);
            k += 1;
        }
        let Some(&last) = due.last() else {
            return closed;
        };

        let mut newly_silent = Vec::new();
        for (id, track) in state.agents.iter_mut() {
            if !track.flagged_unresponsive
                && track.status(now, self.liveness) == HealthStatus::Unresponsive
            {
                track.flagged_unresponsive = true;
                let event = SystemEvent::Unresponsive { agent_id: *id, at: now };
                track.push_event(HealthEvent {
                    at: now,
                    kind: event.kind().to_string(),
                    message: event.describe(),
                });
                newly_silent.push(event);
            }
        }
        for event in &newly_silent {
            warn!(agent_id = ?event.agent_id(), "agent unresponsive");
        }
        state
            .windows
            .entry(last)
            .or_default()
            .events
            .extend(newly_silent);

        let statuses: BTreeMap<Uuid, HealthStatus> = state
            .agents
            .iter()
            .map(|(id, t)| (*id, t.status(now, self.liveness)))
            .collect();
        // A stopped agent shows up in this closing for the last time.
        state.agents.retain(|_, t| t.state != LifecycleState::Stopped);

        for window in due {
            let snapshot = Arc::new(self.build_snapshot(&state, window, 0, statuses.clone()));
            let data = state.windows.entry(window).or_default();
            data.snapshot = Some(snapshot.clone());
            let reports = data.reports.clone();

            state.history.push_back(snapshot.clone());
            while state.history.len() > self.config.history_windows.max(1) {
                state.history.pop_front();
            }
            debug!(
                window,
                reports = snapshot.report_count,
                kpis = snapshot.kpis.len(),
                "window closed"
            );
            closed.push(ClosedWindow { snapshot, reports });
        }

        state.next_to_close = last + 1;
        let horizon = state
            .next_to_close
            .saturating_sub(self.config.retention_windows.max(1) + 1);
        state.windows.retain(|k, _| *k >= horizon);

        closed
    }

    fn build_snapshot(
        &self,
        state: &AggregatorState,
        window: u64,
        revision: u32,
        agents: BTreeMap<Uuid, HealthStatus>,
    ) -> Snapshot {
        let empty = WindowData::default();
        let data = state.windows.get(&window).unwrap_or(&empty);
        let previous = window
            .checked_sub(1)
            .and_then(|p| state.windows.get(&p))
            .map(|w| latest_values(&w.reports));

        let mut grouped: BTreeMap<&str, Vec<(DateTime<Utc>, f64)>> = BTreeMap::new();
        for report in &data.reports {
            for (kpi, value) in &report.values {
                grouped
                    .entry(kpi.as_str())
                    .or_default()
                    .push((report.timestamp, *value));
            }
        }

        let mut kpis = BTreeMap::new();
        for (kpi, mut samples) in grouped {
            samples.sort_by_key(|(ts, _)| *ts);
            let latest = samples.last().map(|(_, v)| *v).unwrap_or_default();
            let value = match self.config.rule_for(kpi) {
                AggregationRule::Sum => Some(samples.iter().map(|(_, v)| v).sum()),
                AggregationRule::Latest => Some(latest),
                AggregationRule::Average => {
                    Some(samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64)
                }
                AggregationRule::Rate => previous
                    .as_ref()
                    .and_then(|prev| prev.get(kpi))
                    .map(|prev| (latest - prev) / self.config.window_secs.max(1) as f64),
            };
            if let Some(value) = value {
                kpis.insert(kpi.to_string(), value);
            }
        }

        Snapshot {
            window,
            window_start: self.window_start(window),
            window_end: self.window_end(window),
            revision,
            kpis,
            agents,
            events: data.events.clone(),
            report_count: data.reports.len(),
        }
    }

    /// Most recently closed snapshot.
    pub async fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.state.read().await.history.back().cloned()
    }

    /// Retained snapshot of `window`, latest revision.
    pub async fn snapshot_for(&self, window: u64) -> Option<Arc<Snapshot>> {
        let state = self.state.read().await;
        state.history.iter().find(|s| s.window == window).cloned()
    }

    /// Closed snapshots, oldest first.
    pub async fn snapshot_history(&self) -> Vec<Arc<Snapshot>> {
        self.state.read().await.history.iter().cloned().collect()
    }

    /// Health of one agent. Stopped agents are forgotten once a window
    /// closes after their stop.
    pub async fn health_of(&self, agent_id: Uuid, now: DateTime<Utc>) -> Option<AgentHealth> {
        let state = self.state.read().await;
        state
            .agents
            .get(&agent_id)
            .map(|track| self.health_view(agent_id, track, now))
    }

    /// Health of every known agent, ordered by role then name.
    pub async fn all_health(&self, now: DateTime<Utc>) -> Vec<AgentHealth> {
        let state = self.state.read().await;
        let mut all: Vec<AgentHealth> = state
            .agents
            .iter()
            .map(|(id, track)| self.health_view(*id, track, now))
            .collect();
        all.sort_by(|a, b| {
            a.role
                .cmp(&b.role)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        all
    }

    fn health_view(&self, agent_id: Uuid, track: &AgentTrack, now: DateTime<Utc>) -> AgentHealth {
        AgentHealth {
            agent_id,
            role: track.role,
            display_name: track.display_name.clone(),
            state: track.state,
            status: track.status(now, self.liveness),
            last_heartbeat: track.last_heartbeat,
            consecutive_failures: track.consecutive_failures,
            current_task: track.current_task,
            last_error: track.last_error.clone(),
            recent_events: track.events.iter().cloned().collect(),
        }
    }

    /// Late-report diagnostics, oldest first.
    pub async fn diagnostics(&self) -> Vec<SystemEvent> {
        self.state.read().await.diagnostics.iter().cloned().collect()
    }
}

fn latest_values(reports: &[MetricReport]) -> BTreeMap<&str, f64> {
    let mut latest: BTreeMap<&str, (DateTime<Utc>, f64)> = BTreeMap::new();
    for report in reports {
        for (kpi, value) in &report.values {
            let entry = latest
                .entry(kpi.as_str())
                .or_insert((report.timestamp, *value));
            if report.timestamp >= entry.0 {
                *entry = (report.timestamp, *value);
            }
        }
    }
    latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn aggregator(origin: DateTime<Utc>) -> MetricsAggregator {
        let mut config = AggregatorConfig::default();
        config.rules.insert("signups".into(), AggregationRule::Sum);
        config.rules.insert("roi".into(), AggregationRule::Average);
        config.rules.insert("revenue".into(), AggregationRule::Rate);
        MetricsAggregator::with_origin(config, Duration::from_secs(60), origin)
    }

    fn report(agent: Uuid, ts: DateTime<Utc>, kpi: &str, value: f64) -> MetricReport {
        MetricReport::new(agent, AgentRole::Analytics, ts).with(kpi, value)
    }

    #[test]
    fn test_window_boundaries() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        assert_eq!(agg.window_index(origin), None);
        assert_eq!(agg.window_index(origin + chrono::Duration::milliseconds(1)), Some(0));
        assert_eq!(agg.window_index(origin + secs(60)), Some(0));
        assert_eq!(agg.window_index(origin + secs(61)), Some(1));
        assert_eq!(agg.window_end(0), origin + secs(60));
    }

    #[tokio::test]
    async fn test_reports_land_in_their_own_window() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();

        agg.record(report(a, origin + secs(10), "signups", 2.0)).await.unwrap();
        agg.record(report(a, origin + secs(50), "signups", 3.0)).await.unwrap();
        agg.record(report(a, origin + secs(70), "signups", 100.0)).await.unwrap();

        let closed = agg.close_due_windows(origin + secs(60)).await;
        assert_eq!(closed.len(), 1);
        let snap = &closed[0].snapshot;
        assert_eq!(snap.window, 0);
        assert_eq!(snap.kpis["signups"], 5.0);
        assert_eq!(snap.report_count, 2);

        let closed = agg.close_due_windows(origin + secs(120)).await;
        assert_eq!(closed[0].snapshot.kpis["signups"], 100.0);
    }

    #[tokio::test]
    async fn test_aggregation_rules() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();

        agg.record(report(a, origin + secs(5), "roi", 0.1)).await.unwrap();
        agg.record(report(a, origin + secs(6), "roi", 0.3)).await.unwrap();
        agg.record(report(a, origin + secs(8), "conversionRate", 0.05)).await.unwrap();
        agg.record(report(a, origin + secs(7), "conversionRate", 0.01)).await.unwrap();
        agg.record(report(a, origin + secs(9), "revenue", 100.0)).await.unwrap();
        agg.record(report(a, origin + secs(90), "revenue", 160.0)).await.unwrap();

        let closed = agg.close_due_windows(origin + secs(120)).await;
        assert_eq!(closed.len(), 2);
        let first = &closed[0].snapshot;
        assert!((first.kpis["roi"] - 0.2).abs() < 1e-9);
        assert_eq!(first.kpis["conversionRate"], 0.05);
        assert!(!first.kpis.contains_key("revenue"));

        let second = &closed[1].snapshot;
        assert_eq!(second.kpis["revenue"], 1.0);
    }

    #[tokio::test]
    async fn test_late_report_revises_snapshot() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();

        agg.record(report(a, origin + secs(10), "signups", 1.0)).await.unwrap();
        agg.close_due_windows(origin + secs(60)).await;
        let before = agg.snapshot_for(0).await.unwrap();

        let outcome = agg
            .record(report(a, origin + secs(20), "signups", 4.0))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Revised { window: 0, revision: 1 });

        let after = agg.snapshot_for(0).await.unwrap();
        assert_eq!(before.kpis["signups"], 1.0);
        assert_eq!(after.kpis["signups"], 5.0);
        assert_eq!(after.revision, 1);

        let pending = agg.take_revisions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].values["signups"], 4.0);
        assert!(agg.take_revisions().await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_agent_is_forgotten_after_closing() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();
        agg.register_agent(a, AgentRole::Analytics, "a", origin).await;
        agg.mark_stopped(a, origin + secs(5)).await;

        let closed = agg.close_due_windows(origin + secs(60)).await;
        assert_eq!(closed[0].snapshot.agents[&a], HealthStatus::Stopped);
        assert!(agg.health_of(a, origin + secs(61)).await.is_none());

        let closed = agg.close_due_windows(origin + secs(120)).await;
        assert!(closed[0].snapshot.agents.is_empty());
    }

    #[tokio::test]
    async fn test_report_past_horizon_is_dropped() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();
        agg.register_agent(a, AgentRole::Analytics, "a", origin).await;

        agg.close_due_windows(origin + secs(60 * 5)).await;
        let err = agg
            .record(report(a, origin + secs(10), "signups", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::LateReport { .. }));
        assert_eq!(agg.diagnostics().await.len(), 1);

        let health = agg.health_of(a, origin + secs(1)).await.unwrap();
        assert_eq!(health.recent_events[0].kind, "late_report");
    }

    #[tokio::test]
    async fn test_silent_agent_becomes_unresponsive() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();
        agg.register_agent(a, AgentRole::Analytics, "a", origin).await;
        agg.heartbeat(Heartbeat {
            agent_id: a,
            state: LifecycleState::Idle,
            at: origin,
            current_task: None,
            consecutive_failures: 0,
            last_error: None,
        })
        .await;

        let health = agg.health_of(a, origin + secs(30)).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);

        let health = agg.health_of(a, origin + secs(61)).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unresponsive);
        assert_eq!(health.state, LifecycleState::Idle);

        let closed = agg.close_due_windows(origin + secs(120)).await;
        let last = &closed.last().unwrap().snapshot;
        assert_eq!(last.agents[&a], HealthStatus::Unresponsive);
        assert!(last
            .events
            .iter()
            .any(|e| matches!(e, SystemEvent::Unresponsive { agent_id, .. } if *agent_id == a)));

        // Flagged once per silence.
        let closed = agg.close_due_windows(origin + secs(180)).await;
        assert!(closed[0].snapshot.events.is_empty());
    }

    #[tokio::test]
    async fn test_events_attach_to_open_window() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        let a = Uuid::new_v4();
        agg.register_agent(a, AgentRole::Analytics, "a", origin).await;
        agg.record_event(SystemEvent::AgentDegraded {
            agent_id: a,
            reason: "timeout".into(),
            at: origin + secs(5),
        })
        .await;

        let closed = agg.close_due_windows(origin + secs(60)).await;
        assert_eq!(closed[0].snapshot.events.len(), 1);
        let health = agg.health_of(a, origin + secs(1)).await.unwrap();
        assert_eq!(health.recent_events[0].kind, "agent_degraded");
    }

    #[tokio::test]
    async fn test_nothing_due_closes_nothing() {
        let origin = Utc::now();
        let agg = aggregator(origin);
        assert!(agg.close_due_windows(origin + secs(59)).await.is_empty());
        assert!(agg.current_snapshot().await.is_none());
    }
}
