use crate::aggregator::AggregationRule;
use crate::controller::KpiPolicy;
use crate::factory::validate_spec;
use crate::profiles::profile;
use crate::scheduler::parse_cron;
use crate::types::{AgentRole, AgentSpec};
use fleet_agent::{ProviderConfig, RetryPolicy};
use fleet_core::{FleetError, FleetResult, Parameters};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level fleet configuration, usually loaded from `fleet.toml`.
///
/// Every section and field has a default, so an empty file is a valid
/// config that boots one agent per role against no providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Per-agent runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Windowing and aggregation rules.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Feedback controller settings.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// KPI threshold policies.
    #[serde(default)]
    pub policies: Vec<KpiPolicy>,
    /// Per-role default parameters, keyed by role name.
    #[serde(default)]
    pub roles: HashMap<String, Parameters>,
    /// Capability providers.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Agents started at boot.
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Recurring tasks.
    #[serde(default)]
    pub schedule: Vec<crate::scheduler::ScheduledJob>,
    /// Directory for the file store. In-memory persistence when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Agent runtime limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Consecutive transient failures before an agent parks in `Failed`.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// First retry delay.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Deadline applied to every capability call.
    #[serde(default = "default_call_deadline_ms")]
    pub call_deadline_ms: u64,
    /// Heartbeat period for otherwise quiet agents.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    /// Fallback queue poll period when no enqueue notification arrives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_call_deadline_ms() -> u64 {
    30_000
}
fn default_report_interval_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_deadline_ms: default_call_deadline_ms(),
            report_interval_ms: default_report_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Backoff settings for the `Recovering` delay.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_consecutive_failures,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    /// Deadline for one capability call.
    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }

    /// Heartbeat period.
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Idle poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry count at which a task is abandoned as exhausted.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// Claims older than this are reclaimed and redelivered.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

fn default_queue_max_retries() -> u32 {
    5
}
fn default_claim_timeout_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

/// Windowing and aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Window length.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Closed windows that still accept late reports.
    #[serde(default = "default_retention_windows")]
    pub retention_windows: u64,
    /// Defaults to twice the runtime report interval.
    #[serde(default)]
    pub liveness_window_secs: Option<u64>,
    /// Closed snapshots kept for `snapshot_history`.
    #[serde(default = "default_history_windows")]
    pub history_windows: usize,
    /// Rule for KPIs with no explicit rule.
    #[serde(default)]
    pub default_rule: AggregationRule,
    /// Aggregation rule per KPI name.
    #[serde(default)]
    pub rules: HashMap<String, AggregationRule>,
}

fn default_window_secs() -> u64 {
    60
}
fn default_retention_windows() -> u64 {
    3
}
fn default_history_windows() -> usize {
    60
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            retention_windows: default_retention_windows(),
            liveness_window_secs: None,
            history_windows: default_history_windows(),
            default_rule: AggregationRule::default(),
            rules: HashMap::new(),
        }
    }
}

impl AggregatorConfig {
    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Rule for `kpi`: configured, then built-in, then the default.
    pub fn rule_for(&self, kpi: &str) -> AggregationRule {
        if let Some(rule) = self.rules.get(kpi) {
            return *rule;
        }
        match kpi {
            crate::runtime::METRIC_TASKS_COMPLETED | crate::runtime::METRIC_TASKS_FAILED => {
                AggregationRule::Sum
            }
            crate::runtime::METRIC_TASK_LATENCY_MS => AggregationRule::Average,
            _ => self.default_rule,
        }
    }
}

/// Feedback controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Engine cycle period. Normally equal to the aggregation window.
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,
    /// Active directives expire after this long.
    #[serde(default = "default_directive_ttl_secs")]
    pub directive_ttl_secs: u64,
    /// Consecutive breached cycles before escalation.
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,
    /// Directives kept for `list_directives`.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Issue restart directives for unresponsive and degraded agents.
    #[serde(default = "default_restart_unhealthy")]
    pub restart_unhealthy: bool,
}

fn default_cycle_secs() -> u64 {
    60
}
fn default_directive_ttl_secs() -> u64 {
    86_400
}
fn default_escalate_after() -> u32 {
    3
}
fn default_max_history() -> usize {
    1_000
}
fn default_restart_unhealthy() -> bool {
    true
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cycle_secs: default_cycle_secs(),
            directive_ttl_secs: default_directive_ttl_secs(),
            escalate_after: default_escalate_after(),
            max_history: default_max_history(),
            restart_unhealthy: default_restart_unhealthy(),
        }
    }
}

impl FleetConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(src: &str) -> FleetResult<Self> {
        toml::from_str(src).map_err(|e| FleetError::Config(e.to_string()))
    }

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> FleetResult<Self> {
        let src = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&src)?;
        config.validate()?;
        Ok(config)
    }

    /// Liveness window, falling back to twice the report interval.
    pub fn liveness_window(&self) -> Duration {
        match self.aggregator.liveness_window_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.runtime.report_interval() * 2,
        }
    }

    /// Profile defaults for `role`, overlaid with the `[roles.<role>]` table.
    pub fn role_defaults(&self, role: AgentRole) -> Parameters {
        let mut params = profile(role).default_parameters();
        if let Some(overrides) = self.roles.get(role.as_str()) {
            params.extend(overrides.clone());
        }
        params
    }

    /// Structural checks that do not need a running engine.
    pub fn validate(&self) -> FleetResult<()> {
        if self.aggregator.window_secs == 0 {
            return Err(FleetError::Config("aggregator.window_secs must be > 0".into()));
        }
        if self.controller.cycle_secs == 0 {
            return Err(FleetError::Config("controller.cycle_secs must be > 0".into()));
        }
        if self.controller.escalate_after == 0 {
            return Err(FleetError::Config("controller.escalate_after must be > 0".into()));
        }
        if self.runtime.max_consecutive_failures == 0 {
            return Err(FleetError::Config(
                "runtime.max_consecutive_failures must be > 0".into(),
            ));
        }
        if self.runtime.backoff_base_ms > self.runtime.backoff_max_ms {
            return Err(FleetError::Config(
                "runtime.backoff_base_ms exceeds runtime.backoff_max_ms".into(),
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(FleetError::Config("queue.max_retries must be > 0".into()));
        }

        for name in self.roles.keys() {
            name.parse::<AgentRole>()
                .map_err(|_| FleetError::Config(format!("unknown role table [roles.{name}]")))?;
        }

        for policy in &self.policies {
            policy.validate()?;
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }

        for spec in &self.agents {
            validate_spec(spec)?;
        }

        for job in &self.schedule {
            parse_cron(&job.cron_expression).map_err(|e| {
                FleetError::Config(format!("schedule '{}': {e}", job.name))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_core::ParamValue;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.runtime.max_consecutive_failures, 5);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.aggregator.window_secs, 60);
        assert_eq!(config.aggregator.retention_windows, 3);
        assert_eq!(config.controller.directive_ttl_secs, 86_400);
        assert_eq!(config.controller.escalate_after, 3);
        assert_eq!(config.liveness_window(), Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = FleetConfig::from_toml_str(
            r#"
            data_dir = "/tmp/fleet"

            [runtime]
            report_interval_ms = 5000

            [aggregator]
            window_secs = 30
            default_rule = "average"
            [aggregator.rules]
            conversionRate = "latest"

            [[policies]]
            metric = "conversionRate"
            comparator = "ge"
            target = 0.02
            scope = { type = "role", value = "revenue_optimizer" }
            actions = [{ action = "adjust_parameter", name = "discount", value = 0.1 }]

            [roles.roi_optimization]
            target_roi = 0.2

            [[providers]]
            name = "local"
            kind = "static"

            [[agents]]
            role = "analytics"
            display_name = "analyst"
            capabilities = [
                { slot = "generation", provider = "local" },
                { slot = "scoring", provider = "local" },
            ]

            [[schedule]]
            name = "daily-report"
            cron_expression = "0 0 9 * * * *"
            role = "analytics"
            action = "generate_report"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.liveness_window(), Duration::from_secs(10));
        assert_eq!(config.aggregator.rule_for("conversionRate"), AggregationRule::Latest);
        assert_eq!(config.aggregator.rule_for("other"), AggregationRule::Average);
        assert_eq!(config.aggregator.rule_for("tasks_completed"), AggregationRule::Sum);
        assert_eq!(
            config.role_defaults(AgentRole::RoiOptimization)["target_roi"],
            ParamValue::Float(0.2)
        );
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.schedule.len(), 1);
    }

    #[test]
    fn test_role_defaults_fall_back_to_profile() {
        let config = FleetConfig::default();
        let params = config.role_defaults(AgentRole::RoiOptimization);
        assert_eq!(params["target_roi"], ParamValue::Float(0.15));
    }

    #[test]
    fn test_validate_rejects_unknown_role_table() {
        let config = FleetConfig::from_toml_str("[roles.wizard]\nlevel = 3\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wizard"));
    }

    #[test]
    fn test_validate_rejects_bad_cron() {
        let config = FleetConfig::from_toml_str(
            r#"
            [[schedule]]
            name = "broken"
            cron_expression = "whenever"
            role = "analytics"
            action = "x"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_agent_missing_binding() {
        let config = FleetConfig::from_toml_str(
            r#"
            [[agents]]
            role = "content_creator"
            display_name = "writer"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, FleetError::InvalidSpec(_)));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[queue]\nmax_retries = 2\n").unwrap();
        let config = FleetConfig::load(&path).unwrap();
        assert_eq!(config.queue.max_retries, 2);

        let missing = FleetConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, FleetError::Config(_)));
    }
}
