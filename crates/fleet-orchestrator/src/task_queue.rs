use crate::config::QueueConfig;
use crate::types::{AgentRole, Task, TaskStatus, TaskTarget};
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ordering key for pending tasks: priority, then creation time, then
/// insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: u8,
    created_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

/// Result of returning a failed task to the queue.
#[derive(Debug, Clone)]
pub enum RequeueOutcome {
    /// Back in the pending set with this retry count.
    Requeued { retry_count: u32 },
    /// Retry budget spent; the task was abandoned.
    Exhausted(Task),
}

/// Priority task queue with exclusive claims.
///
/// Tasks are routed by role or by agent id. Only registered consumers may
/// claim, and each task is held by at most one consumer at a time.
pub struct TaskQueue {
    config: QueueConfig,
    tasks: HashMap<Uuid, Task>,
    pending: BTreeSet<QueueKey>,
    keys: HashMap<Uuid, QueueKey>,
    consumers: HashMap<Uuid, AgentRole>,
    /// (directive, target) -> corrective task already enqueued for it.
    origins: HashMap<(Uuid, TaskTarget), Uuid>,
    seq: u64,
}

impl TaskQueue {
    /// Empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            pending: BTreeSet::new(),
            keys: HashMap::new(),
            consumers: HashMap::new(),
            origins: HashMap::new(),
            seq: 0,
        }
    }

    /// Let `agent_id` claim tasks for `role`.
    pub fn register_consumer(&mut self, agent_id: Uuid, role: AgentRole) {
        self.consumers.insert(agent_id, role);
    }

    /// Remove a consumer. Tasks it holds go back to pending without a retry
    /// penalty; pending tasks addressed to it are abandoned.
    pub fn deregister_consumer(&mut self, agent_id: Uuid) {
        if self.consumers.remove(&agent_id).is_none() {
            return;
        }

        let held: Vec<Uuid> = self.claimed_by(agent_id);
        for id in held {
            self.make_pending(id);
        }

        let addressed: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.target == TaskTarget::Agent(agent_id) && !t.status.is_retired())
            .map(|t| t.id)
            .collect();
        for id in addressed {
            self.retire(id, TaskStatus::Abandoned {
                reason: format!("agent {agent_id} decommissioned"),
            });
        }
        info!(agent_id = %agent_id, "consumer deregistered");
    }

    /// Whether `agent_id` may claim.
    pub fn is_registered(&self, agent_id: Uuid) -> bool {
        self.consumers.contains_key(&agent_id)
    }

    /// Add a task. A corrective task for a (directive, target) pair that is
    /// already queued returns the existing task id instead.
    pub fn enqueue(&mut self, mut task: Task) -> FleetResult<Uuid> {
        if let TaskTarget::Agent(agent_id) = task.target {
            if !self.consumers.contains_key(&agent_id) {
                return Err(FleetError::NotFound(format!("agent {agent_id}")));
            }
        }
        if let Some(origin) = task.origin {
            if let Some(existing) = self.origins.get(&(origin, task.target)) {
                debug!(task_id = %existing, directive_id = %origin, "duplicate corrective task");
                return Ok(*existing);
            }
            self.origins.insert((origin, task.target), task.id);
        }

        task.status = TaskStatus::Pending;
        let id = task.id;
        debug!(task_id = %id, task_target = %task.target, priority = task.priority, "task enqueued");
        self.tasks.insert(id, task);
        self.make_pending(id);
        Ok(id)
    }

    /// Hand the most urgent task routed to `agent_id` to it exclusively.
    ///
    /// Tasks whose deadline has passed are abandoned on the way.
    pub fn claim(&mut self, agent_id: Uuid, now: DateTime<Utc>) -> Option<Task> {
        let role = *self.consumers.get(&agent_id)?;

        let mut expired = Vec::new();
        let mut chosen = None;
        for key in &self.pending {
            let Some(task) = self.tasks.get(&key.id) else {
                continue;
            };
            if !task.routes_to(agent_id, role) {
                continue;
            }
            if task.is_expired(now) {
                expired.push(key.id);
                continue;
            }
            chosen = Some(key.id);
            break;
        }

        for id in expired {
            warn!(task_id = %id, "task deadline passed before claim");
            self.retire(id, TaskStatus::Abandoned {
                reason: "deadline passed".into(),
            });
        }

        let id = chosen?;
        self.unpend(id);
        let task = self.tasks.get_mut(&id)?;
        task.status = TaskStatus::Claimed { agent_id, at: now };
        debug!(task_id = %id, agent_id = %agent_id, "task claimed");
        Some(task.clone())
    }

    /// Complete a task held by `agent_id`.
    pub fn ack(&mut self, task_id: Uuid, agent_id: Uuid) -> FleetResult<()> {
        self.check_holder(task_id, agent_id)?;
        self.retire(task_id, TaskStatus::Completed);
        Ok(())
    }

    /// Return a failed task with one more retry on its count.
    pub fn requeue(
        &mut self,
        task_id: Uuid,
        agent_id: Uuid,
        reason: &str,
    ) -> FleetResult<RequeueOutcome> {
        self.check_holder(task_id, agent_id)?;
        Ok(self.bump_and_requeue(task_id, reason))
    }

    /// Return a task without a retry penalty.
    ///
    /// Returns `false` when `agent_id` no longer holds the task, which is
    /// the normal case after a decommission already returned it.
    pub fn release(&mut self, task_id: Uuid, agent_id: Uuid) -> bool {
        if self.check_holder(task_id, agent_id).is_err() {
            return false;
        }
        self.make_pending(task_id);
        true
    }

    /// Drop a task permanently.
    pub fn abandon(&mut self, task_id: Uuid, reason: &str) -> FleetResult<Task> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        if task.status.is_retired() {
            return Ok(task.clone());
        }
        warn!(task_id = %task_id, reason, "task abandoned");
        self.retire(task_id, TaskStatus::Abandoned {
            reason: reason.to_string(),
        });
        self.tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))
    }

    /// Redeliver tasks claimed longer than the claim timeout. Each reclaim
    /// counts as a retry; returns the tasks that ran out of retries.
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let timeout = chrono::Duration::seconds(self.config.claim_timeout_secs as i64);
        let stale: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Claimed { at, .. } if now - at > timeout))
            .map(|t| t.id)
            .collect();

        let mut exhausted = Vec::new();
        for id in stale {
            info!(task_id = %id, "reclaiming task past claim timeout");
            if let RequeueOutcome::Exhausted(task) = self.bump_and_requeue(id, "claim timeout") {
                exhausted.push(task);
            }
        }
        exhausted
    }

    /// One task by id.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Tasks waiting for a claim.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ids of tasks currently held by `agent_id`.
    pub fn claimed_by(&self, agent_id: Uuid) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Claimed { agent_id: a, .. } if a == agent_id))
            .map(|t| t.id)
            .collect()
    }

    /// Pending tasks `agent_id` could claim right now, ignoring deadlines.
    pub fn claimable_for(&self, agent_id: Uuid) -> Vec<Uuid> {
        let Some(role) = self.consumers.get(&agent_id) else {
            return Vec::new();
        };
        self.pending
            .iter()
            .filter(|k| {
                self.tasks
                    .get(&k.id)
                    .is_some_and(|t| t.routes_to(agent_id, *role))
            })
            .map(|k| k.id)
            .collect()
    }

    /// Pending tasks addressed to `agent_id` by id or routable to it by role.
    /// Works for deregistered ids too, unlike [`TaskQueue::claimable_for`].
    pub fn routed_to(&self, agent_id: Uuid, role: AgentRole) -> Vec<Uuid> {
        self.pending
            .iter()
            .filter(|k| {
                self.tasks.get(&k.id).is_some_and(|t| match t.target {
                    TaskTarget::Agent(id) => id == agent_id,
                    TaskTarget::Role(r) => r == role && self.consumers.contains_key(&agent_id),
                })
            })
            .map(|k| k.id)
            .collect()
    }

    /// Forget retired tasks completed before `before`. Returns their ids.
    pub fn purge_retired(&mut self, before: DateTime<Utc>) -> Vec<Uuid> {
        let old: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.status.is_retired() && t.completed_at.is_some_and(|at| at < before))
            .map(|t| t.id)
            .collect();
        for id in &old {
            self.tasks.remove(id);
        }
        self.origins.retain(|_, task_id| !old.contains(task_id));
        old
    }

    fn check_holder(&self, task_id: Uuid, agent_id: Uuid) -> FleetResult<()> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Claimed { agent_id: holder, .. } if holder == agent_id => Ok(()),
            _ => Err(FleetError::Orchestrator(format!(
                "task {task_id} is not held by agent {agent_id}"
            ))),
        }
    }

    fn bump_and_requeue(&mut self, task_id: Uuid, reason: &str) -> RequeueOutcome {
        let max_retries = self.config.max_retries;
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return RequeueOutcome::Requeued { retry_count: 0 };
        };
        task.retry_count += 1;
        task.last_error = Some(reason.to_string());
        let retry_count = task.retry_count;

        if retry_count >= max_retries {
            warn!(task_id = %task_id, retry_count, reason, "task exhausted its retries");
            self.retire(task_id, TaskStatus::Abandoned {
                reason: format!("exhausted after {retry_count} retries: {reason}"),
            });
            return match self.tasks.get(&task_id) {
                Some(task) => RequeueOutcome::Exhausted(task.clone()),
                None => RequeueOutcome::Requeued { retry_count },
            };
        }

        self.make_pending(task_id);
        RequeueOutcome::Requeued { retry_count }
    }

    fn make_pending(&mut self, id: Uuid) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.status = TaskStatus::Pending;
        self.seq += 1;
        let key = QueueKey {
            priority: task.priority,
            created_at: task.created_at,
            seq: self.seq,
            id,
        };
        if let Some(old) = self.keys.insert(id, key) {
            self.pending.remove(&old);
        }
        self.pending.insert(key);
    }

    fn unpend(&mut self, id: Uuid) {
        if let Some(key) = self.keys.remove(&id) {
            self.pending.remove(&key);
        }
    }

    fn retire(&mut self, id: Uuid, status: TaskStatus) {
        self.unpend(id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = status;
            task.completed_at = Some(Utc::now());
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

/// Cloneable async handle to a [`TaskQueue`] that wakes idle agents on
/// enqueue.
#[derive(Clone)]
pub struct SharedQueue {
    inner: Arc<RwLock<TaskQueue>>,
    notify: Arc<Notify>,
}

impl SharedQueue {
    /// Empty shared queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TaskQueue::new(config))),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle agents wait on for new work.
    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// See [`TaskQueue::register_consumer`].
    pub async fn register_consumer(&self, agent_id: Uuid, role: AgentRole) {
        self.inner.write().await.register_consumer(agent_id, role);
    }

    /// See [`TaskQueue::deregister_consumer`].
    pub async fn deregister_consumer(&self, agent_id: Uuid) {
        self.inner.write().await.deregister_consumer(agent_id);
        self.notify.notify_waiters();
    }

    /// See [`TaskQueue::enqueue`]. Wakes idle runtimes.
    pub async fn enqueue(&self, task: Task) -> FleetResult<Uuid> {
        let id = self.inner.write().await.enqueue(task)?;
        self.notify.notify_waiters();
        Ok(id)
    }

    /// See [`TaskQueue::claim`].
    pub async fn claim(&self, agent_id: Uuid, now: DateTime<Utc>) -> Option<Task> {
        self.inner.write().await.claim(agent_id, now)
    }

    /// See [`TaskQueue::ack`].
    pub async fn ack(&self, task_id: Uuid, agent_id: Uuid) -> FleetResult<()> {
        self.inner.write().await.ack(task_id, agent_id)
    }

    /// See [`TaskQueue::requeue`].
    pub async fn requeue(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        reason: &str,
    ) -> FleetResult<RequeueOutcome> {
        let outcome = self.inner.write().await.requeue(task_id, agent_id, reason)?;
        if matches!(outcome, RequeueOutcome::Requeued { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// See [`TaskQueue::release`].
    pub async fn release(&self, task_id: Uuid, agent_id: Uuid) -> bool {
        let released = self.inner.write().await.release(task_id, agent_id);
        if released {
            self.notify.notify_waiters();
        }
        released
    }

    /// See [`TaskQueue::abandon`].
    pub async fn abandon(&self, task_id: Uuid, reason: &str) -> FleetResult<Task> {
        self.inner.write().await.abandon(task_id, reason)
    }

    /// See [`TaskQueue::reclaim_expired`].
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<Task> {
        let exhausted = self.inner.write().await.reclaim_expired(now);
        self.notify.notify_waiters();
        exhausted
    }

    /// One task by id.
    pub async fn get(&self, id: Uuid) -> Option<Task> {
        self.inner.read().await.get(id).cloned()
    }

    /// Tasks waiting for a claim.
    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending_count()
    }

    /// See [`TaskQueue::claimable_for`].
    pub async fn claimable_for(&self, agent_id: Uuid) -> Vec<Uuid> {
        self.inner.read().await.claimable_for(agent_id)
    }

    /// See [`TaskQueue::routed_to`].
    pub async fn routed_to(&self, agent_id: Uuid, role: AgentRole) -> Vec<Uuid> {
        self.inner.read().await.routed_to(agent_id, role)
    }

    /// See [`TaskQueue::purge_retired`].
    pub async fn purge_retired(&self, before: DateTime<Utc>) -> Vec<Uuid> {
        self.inner.write().await.purge_retired(before)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskPayload;
    use serde_json::json;

    fn queue_with(agent: Uuid, role: AgentRole) -> TaskQueue {
        let mut queue = TaskQueue::default();
        queue.register_consumer(agent, role);
        queue
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = TaskQueue::default();
        let agent = Uuid::new_v4();
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.claim(agent, Utc::now()).is_none());
    }

    #[test]
    fn test_unregistered_consumer_claims_nothing() {
        let mut queue = TaskQueue::default();
        queue
            .enqueue(Task::work(AgentRole::Analytics, "report", json!({})))
            .unwrap();
        assert!(queue.claim(Uuid::new_v4(), Utc::now()).is_none());
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_priority_then_fifo() {
        let agent = Uuid::new_v4();
        let mut queue = queue_with(agent, AgentRole::RevenueOptimizer);
        let t0 = Utc::now();

        let late_urgent = Task::work(AgentRole::RevenueOptimizer, "b", json!({}))
            .with_priority(1)
            .with_created_at(t0 + chrono::Duration::seconds(2));
        let early_normal = Task::work(AgentRole::RevenueOptimizer, "c", json!({}))
            .with_created_at(t0);
        let early_urgent = Task::work(AgentRole::RevenueOptimizer, "a", json!({}))
            .with_priority(1)
            .with_created_at(t0 + chrono::Duration::seconds(1));

        queue.enqueue(late_urgent).unwrap();
        queue.enqueue(early_normal).unwrap();
        queue.enqueue(early_urgent).unwrap();

        let order: Vec<String> = (0..3)
            .map(|_| {
                let task = queue.claim(agent, Utc::now()).unwrap();
                queue.ack(task.id, agent).unwrap();
                task.payload.action().to_string()
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::ContentCreator);
        queue.register_consumer(b, AgentRole::ContentCreator);
        queue
            .enqueue(Task::work(AgentRole::ContentCreator, "draft", json!({})))
            .unwrap();

        assert!(queue.claim(a, Utc::now()).is_some());
        assert!(queue.claim(b, Utc::now()).is_none());
    }

    #[test]
    fn test_routing_by_role_and_agent() {
        let writer = Uuid::new_v4();
        let analyst = Uuid::new_v4();
        let mut queue = queue_with(writer, AgentRole::ContentCreator);
        queue.register_consumer(analyst, AgentRole::Analytics);

        let direct = Task::new(
            TaskTarget::Agent(analyst),
            TaskPayload::Work {
                action: "report".into(),
                input: json!({}),
            },
        );
        queue.enqueue(direct).unwrap();
        assert!(queue.claim(writer, Utc::now()).is_none());
        assert!(queue.claim(analyst, Utc::now()).is_some());
    }

    #[test]
    fn test_enqueue_rejects_unknown_agent_target() {
        let mut queue = TaskQueue::default();
        let task = Task::new(
            TaskTarget::Agent(Uuid::new_v4()),
            TaskPayload::Work {
                action: "x".into(),
                input: json!({}),
            },
        );
        assert!(matches!(queue.enqueue(task), Err(FleetError::NotFound(_))));
    }

    #[test]
    fn test_requeue_until_exhausted() {
        let agent = Uuid::new_v4();
        let mut queue = TaskQueue::new(QueueConfig {
            max_retries: 3,
            ..QueueConfig::default()
        });
        queue.register_consumer(agent, AgentRole::Analytics);
        let id = queue
            .enqueue(Task::work(AgentRole::Analytics, "report", json!({})).with_priority(2))
            .unwrap();

        for expected in 1..3 {
            let task = queue.claim(agent, Utc::now()).unwrap();
            match queue.requeue(task.id, agent, "timeout").unwrap() {
                RequeueOutcome::Requeued { retry_count } => assert_eq!(retry_count, expected),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(queue.get(id).unwrap().priority, 2);
        }

        let task = queue.claim(agent, Utc::now()).unwrap();
        match queue.requeue(task.id, agent, "timeout").unwrap() {
            RequeueOutcome::Exhausted(task) => {
                assert_eq!(task.retry_count, 3);
                assert!(matches!(task.status, TaskStatus::Abandoned { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(queue.claim(agent, Utc::now()).is_none());
    }

    #[test]
    fn test_ack_by_non_holder_fails() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::Analytics);
        let id = queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .unwrap();
        queue.claim(a, Utc::now()).unwrap();
        assert!(queue.ack(id, Uuid::new_v4()).is_err());
        queue.ack(id, a).unwrap();
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_release_has_no_retry_penalty() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::Analytics);
        let id = queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .unwrap();
        queue.claim(a, Utc::now()).unwrap();
        assert!(queue.release(id, a));
        assert!(!queue.release(id, a));
        assert_eq!(queue.get(id).unwrap().retry_count, 0);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_expired_deadline_abandoned_at_claim() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::Analytics);
        let now = Utc::now();
        let id = queue
            .enqueue(
                Task::work(AgentRole::Analytics, "r", json!({}))
                    .with_deadline(now - chrono::Duration::seconds(1)),
            )
            .unwrap();
        assert!(queue.claim(a, now).is_none());
        assert!(matches!(
            queue.get(id).unwrap().status,
            TaskStatus::Abandoned { .. }
        ));
    }

    #[test]
    fn test_reclaim_after_claim_timeout() {
        let a = Uuid::new_v4();
        let mut queue = TaskQueue::new(QueueConfig {
            max_retries: 5,
            claim_timeout_secs: 10,
        });
        queue.register_consumer(a, AgentRole::Analytics);
        let id = queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .unwrap();
        let now = Utc::now();
        queue.claim(a, now).unwrap();

        assert!(queue.reclaim_expired(now + chrono::Duration::seconds(5)).is_empty());
        assert!(queue.claimed_by(a).contains(&id));

        queue.reclaim_expired(now + chrono::Duration::seconds(11));
        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_deregister_returns_held_and_drops_addressed() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::Analytics);
        let shared = queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .unwrap();
        queue.claim(a, Utc::now()).unwrap();
        let direct = queue
            .enqueue(Task::new(
                TaskTarget::Agent(a),
                TaskPayload::Work {
                    action: "x".into(),
                    input: json!({}),
                },
            ))
            .unwrap();

        queue.deregister_consumer(a);
        assert_eq!(queue.get(shared).unwrap().status, TaskStatus::Pending);
        assert!(queue.get(direct).unwrap().status.is_retired());
        assert!(queue.claimable_for(a).is_empty());
        assert!(queue.routed_to(a, AgentRole::Analytics).is_empty());
    }

    #[test]
    fn test_corrective_task_dedup() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::RevenueOptimizer);
        let directive = Uuid::new_v4();
        let make = || {
            Task::work(AgentRole::RevenueOptimizer, "adjust_pricing", json!({}))
                .with_origin(directive)
        };
        let first = queue.enqueue(make()).unwrap();
        let second = queue.enqueue(make()).unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_purge_retired() {
        let a = Uuid::new_v4();
        let mut queue = queue_with(a, AgentRole::Analytics);
        let id = queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .unwrap();
        queue.claim(a, Utc::now()).unwrap();
        queue.ack(id, a).unwrap();
        assert_eq!(
            queue.purge_retired(Utc::now() + chrono::Duration::seconds(1)),
            vec![id]
        );
        assert!(queue.get(id).is_none());
    }

    #[tokio::test]
    async fn test_shared_queue_wakes_waiters() {
        let queue = SharedQueue::new(QueueConfig::default());
        let agent = Uuid::new_v4();
        queue.register_consumer(agent, AgentRole::Analytics).await;

        let notify = queue.notify_handle();
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        queue
            .enqueue(Task::work(AgentRole::Analytics, "r", json!({})))
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
        assert!(queue.claim(agent, Utc::now()).await.is_some());
    }
}
