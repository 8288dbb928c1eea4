use crate::task_queue::SharedQueue;
use crate::types::{AgentRole, Task, DEFAULT_PRIORITY};
use chrono::{DateTime, Utc};
use cron::Schedule;
use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A recurring job that enqueues role work on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique job name.
    pub name: String,
    /// 7-field cron: sec min hour day-of-month month day-of-week year.
    pub cron_expression: String,
    /// Role the task is routed to.
    pub role: AgentRole,
    /// Task action.
    pub action: String,
    /// Task input.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Task priority.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Disabled jobs never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

impl ScheduledJob {
    /// The task this job enqueues when it fires.
    pub fn task(&self) -> Task {
        Task::work(self.role, self.action.clone(), self.input.clone()).with_priority(self.priority)
    }
}

/// Parse a cron expression into a [`cron::Schedule`].
pub fn parse_cron(cron_expr: &str) -> FleetResult<Schedule> {
    Schedule::from_str(cron_expr)
        .map_err(|e| FleetError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
}

/// First fire time of `cron_expr` strictly after `after`.
pub fn next_fire_time(cron_expr: &str, after: DateTime<Utc>) -> FleetResult<DateTime<Utc>> {
    parse_cron(cron_expr)?.after(&after).next().ok_or_else(|| {
        FleetError::Config(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

/// Fires [`ScheduledJob`]s into the task queue.
#[derive(Debug)]
pub struct Scheduler {
    jobs: Vec<(ScheduledJob, Schedule)>,
}

impl Scheduler {
    /// Build a scheduler, rejecting any job whose expression does not parse.
    pub fn new(jobs: Vec<ScheduledJob>) -> FleetResult<Self> {
        let jobs = jobs
            .into_iter()
            .map(|job| {
                let schedule = parse_cron(&job.cron_expression)?;
                Ok((job, schedule))
            })
            .collect::<FleetResult<Vec<_>>>()?;
        Ok(Self { jobs })
    }

    /// Jobs that fire.
    pub fn enabled_jobs(&self) -> Vec<&ScheduledJob> {
        self.jobs
            .iter()
            .filter(|(j, _)| j.enabled)
            .map(|(j, _)| j)
            .collect()
    }

    /// Number of configured jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Nearest fire time of any enabled job after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .filter(|(j, _)| j.enabled)
            .filter_map(|(_, s)| s.after(&after).next())
            .min()
    }

    /// Enabled jobs with a fire time in `(from, to]`.
    pub fn due_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&ScheduledJob> {
        self.jobs
            .iter()
            .filter(|(j, _)| j.enabled)
            .filter(|(_, s)| s.after(&from).next().is_some_and(|t| t <= to))
            .map(|(j, _)| j)
            .collect()
    }

    /// Enqueue tasks for every job due in `(from, to]`. Returns how many
    /// were enqueued.
    pub async fn fire_due(
        &self,
        queue: &SharedQueue,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> usize {
        let mut fired = 0;
        for job in self.due_between(from, to) {
            match queue.enqueue(job.task()).await {
                Ok(task_id) => {
                    tracing::info!(job = %job.name, task_id = %task_id, role = %job.role, "scheduled job fired");
                    fired += 1;
                }
                Err(e) => tracing::warn!(job = %job.name, error = %e, "scheduled job not enqueued"),
            }
        }
        fired
    }

    /// Run the scheduler loop until `cancel` fires.
    pub fn start(self, queue: SharedQueue, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = Utc::now();
            loop {
                let wait = match self.next_fire(last) {
                    Some(next) => (next - Utc::now()).to_std().unwrap_or_default(),
                    None => {
                        tracing::info!("scheduler has no enabled jobs");
                        cancel.cancelled().await;
                        return;
                    }
                };
                tracing::debug!(wait_ms = wait.as_millis() as u64, "scheduler sleeping");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("scheduler stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                let now = Utc::now();
                self.fire_due(&queue, last, now).await;
                last = now;
                // Never spin on a fire time that is a hair in the future.
                if wait.is_zero() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use serde_json::json;
    use uuid::Uuid;

    fn job(name: &str, cron: &str, enabled: bool) -> ScheduledJob {
        ScheduledJob {
            name: name.into(),
            cron_expression: cron.into(),
            role: AgentRole::Analytics,
            action: "generate_report".into(),
            input: json!({ "timeframe": "last_24h" }),
            priority: 3,
            enabled,
        }
    }

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("0 * * * * * *").is_ok());
        assert!(parse_cron("not a cron expression").is_err());
    }

    #[test]
    fn test_next_fire_time_is_after() {
        let now = Utc::now();
        let next = next_fire_time("0 * * * * * *", now).unwrap();
        assert!(next > now);
        assert!(next - now <= chrono::Duration::seconds(60));
    }

    #[test]
    fn test_new_rejects_invalid_job() {
        let err = Scheduler::new(vec![job("bad", "nope", true)]).unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_enabled_jobs_filter() {
        let scheduler = Scheduler::new(vec![
            job("active", "0 * * * * * *", true),
            job("inactive", "0 * * * * * *", false),
        ])
        .unwrap();
        assert_eq!(scheduler.job_count(), 2);
        assert_eq!(scheduler.enabled_jobs().len(), 1);
        assert_eq!(scheduler.enabled_jobs()[0].name, "active");
    }

    #[test]
    fn test_due_between() {
        let scheduler = Scheduler::new(vec![
            job("every-second", "* * * * * * *", true),
            job("yearly", "0 0 0 1 1 * *", true),
        ])
        .unwrap();
        let now = Utc::now();
        let due = scheduler.due_between(now, now + chrono::Duration::seconds(2));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "every-second");
    }

    #[tokio::test]
    async fn test_fire_due_enqueues_tasks() {
        let scheduler = Scheduler::new(vec![job("tick", "* * * * * * *", true)]).unwrap();
        let queue = SharedQueue::new(QueueConfig::default());
        let agent = Uuid::new_v4();
        queue.register_consumer(agent, AgentRole::Analytics).await;

        let now = Utc::now();
        let fired = scheduler
            .fire_due(&queue, now, now + chrono::Duration::seconds(2))
            .await;
        assert_eq!(fired, 1);

        let task = queue.claim(agent, Utc::now()).await.unwrap();
        assert_eq!(task.payload.action(), "generate_report");
        assert_eq!(task.priority, 3);
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let scheduler = Scheduler::new(vec![job("tick", "0 0 0 1 1 * *", true)]).unwrap();
        let cancel = CancellationToken::new();
        let handle = scheduler.start(SharedQueue::new(QueueConfig::default()), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
