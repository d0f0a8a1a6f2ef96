//! Task broker (C5, §4.5): enqueue, atomic claim, and retry/backoff
//! bookkeeping layered on top of `aeth_store`'s `Task` persistence.
//!
//! Durability is the store's job (the `tasks` table already survives a
//! crash); this crate's job is the dispatch semantics around it — picking
//! the next claimable task, scheduling backoff on failure, and deciding
//! when a task has exhausted its retries.

use std::sync::Arc;

use aeth_core::audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink};
use aeth_core::config::{TASK_RETRY_BASE_DELAY, TASK_RETRY_CAP, TASK_RETRY_FACTOR};
use aeth_core::model::{Task, TaskState, TaskType};
use aeth_core::retry::backoff_delay;
use aeth_core::time::now_iso;
use aeth_core::CoreError;
use aeth_core::naming::generate_task_id;
use aeth_store::{Store, TaskRepository};
use serde_json::Value;
use tracing::{info, warn};

/// Durable, at-least-once task broker (§4.5).
///
/// Enqueue is durable before the caller's ack (the store write happens
/// before `enqueue` returns). Handlers are expected to be idempotent,
/// keyed on `Task::id`, since a crash between claim and `complete`/`fail`
/// redelivers the same task to whichever worker claims it next.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, audit: Arc::new(TracingAuditSink) }
    }

    /// Enqueue a new task, defaulting `max_retries` from the §4.5 retry
    /// table unless the caller overrides it.
    pub async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Value,
        priority: i32,
        max_retries: Option<u32>,
    ) -> Result<Task, CoreError> {
        let now = now_iso();
        let (default_retries, _timeout) = task_type.defaults();
        let task = Task {
            id: generate_task_id(),
            task_type,
            payload,
            retry_count: 0,
            max_retries: max_retries.unwrap_or(default_retries),
            priority,
            deadline: None,
            state: TaskState::Pending,
            result: None,
            error: None,
            worker_id: None,
            available_at: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.create_task(&task).await?;
        info!(task_id = %task.id, task_type = ?task.task_type, "enqueued task");
        self.audit.record(AuditEntry::new(AuditAction::TaskEnqueued).with_task(&task.id).with_detail(format!("{:?}", task.task_type)));
        Ok(task)
    }

    /// Atomically claim the next eligible task for `worker_id`, if any.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, CoreError> {
        self.store.claim_next_task(worker_id, &now_iso()).await
    }

    /// Mark a claimed task as completed, recording its result.
    pub async fn complete(&self, task_id: &str, result: Value) -> Result<(), CoreError> {
        let mut task = self.load(task_id).await?;
        task.state = TaskState::Completed;
        task.result = Some(result);
        task.error = None;
        task.updated_at = now_iso();
        self.store.update_task(&task).await?;
        info!(task_id, "task completed");
        self.audit.record(AuditEntry::new(AuditAction::TaskCompleted).with_task(task_id));
        Ok(())
    }

    /// Report a task failure. If the task has retries remaining, it is
    /// rescheduled after an exponential backoff delay (§4.5: base 1s,
    /// factor 2, capped at 5 minutes); otherwise it is terminated in
    /// `failed`.
    pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<(), CoreError> {
        let mut task = self.load(task_id).await?;
        let error = error.into();

        if task.retries_exhausted() {
            task.state = TaskState::Failed;
            task.error = Some(error);
            task.worker_id = None;
            task.updated_at = now_iso();
            warn!(task_id, "task failed, retries exhausted");
            self.store.update_task(&task).await?;
            self.audit.record(AuditEntry::new(AuditAction::TaskDeadLettered).with_task(task_id).with_detail(task.error.clone().unwrap_or_default()));
        } else {
            task.retry_count += 1;
            let delay = backoff_delay(task.retry_count, TASK_RETRY_BASE_DELAY, TASK_RETRY_FACTOR, TASK_RETRY_CAP);
            let available_at = aeth_core::time::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            task.state = TaskState::Retry;
            task.error = Some(error);
            task.worker_id = None;
            task.available_at = available_at.to_rfc3339();
            task.updated_at = now_iso();
            warn!(task_id, retry_count = task.retry_count, delay_secs = delay.as_secs(), "task failed, scheduled for retry");
            self.store.update_task(&task).await?;
            self.audit.record(AuditEntry::new(AuditAction::TaskRetried).with_task(task_id).with_detail(format!("retry_count={}", task.retry_count)));
        }

        Ok(())
    }

    /// A claimed task that ran past its type's timeout is reported exactly
    /// like any other retryable failure (§4.5: "timed-out handler yields a
    /// retry").
    pub async fn timeout(&self, task_id: &str) -> Result<(), CoreError> {
        self.fail(task_id, "task exceeded its execution deadline").await
    }

    async fn load(&self, task_id: &str) -> Result<Task, CoreError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task '{task_id}' not found")))
    }
}
