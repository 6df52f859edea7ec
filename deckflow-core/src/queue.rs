use crate::store::PipelineStore;
use crate::types::*;
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Attempts for store transactions that hit serialization conflicts.
const STORE_RETRY_ATTEMPTS: u32 = 3;

/// True when the error chain bottoms out in a Postgres serialization or
/// deadlock failure (40001 / 40P01), safe to retry the transaction.
fn is_serialization_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|db| db.code())
            .map(|code| code == "40001" || code == "40P01")
            .unwrap_or(false)
    })
}

/// Orchestrator-side façade over the queue store.
///
/// Owns the worker identity and lease/backoff parameters; every write it
/// issues carries the server id so the store can enforce the optimistic
/// lease token.
pub struct QueueManager {
    store: Arc<dyn PipelineStore>,
    server_id: String,
    server_type: ServerType,
    capabilities: serde_json::Value,
    lease: Duration,
    backoff: BackoffPolicy,
    max_concurrent_tasks: usize,
    running: AtomicUsize,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        server_type: ServerType,
        lease: Duration,
        backoff: BackoffPolicy,
        max_concurrent_tasks: usize,
    ) -> Self {
        let server_id = generate_server_id();
        info!(server_id = %server_id, server_type = ?server_type, "queue manager initialized");
        let capabilities = serde_json::json!({
            "pdf_analysis": true,
            "gpu_available": server_type == ServerType::Gpu,
            "max_concurrent": max_concurrent_tasks,
        });
        Self {
            store,
            server_id,
            server_type,
            capabilities,
            lease,
            backoff,
            max_concurrent_tasks,
            running: AtomicUsize::new(0),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn task_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    /// Upsert this worker's liveness row; stale registrations are purged.
    pub async fn register_server(&self) -> Result<()> {
        let registration = ServerRegistration {
            id: self.server_id.clone(),
            server_type: self.server_type,
            status: ServerStatus::Active,
            last_heartbeat: Utc::now(),
            capabilities: self.capabilities.clone(),
            current_load: 0,
            max_concurrent_tasks: self.max_concurrent_tasks as i32,
        };
        self.store.register_server(&registration).await?;
        info!(server_id = %self.server_id, "server registered");
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<bool> {
        self.store
            .heartbeat(&self.server_id, self.running_tasks() as i32)
            .await
    }

    /// Enqueue a task; an active task of the same type for the document is
    /// returned as-is instead of inserting a duplicate.
    pub async fn add_task(&self, new: NewTask) -> Result<EnqueueOutcome> {
        let mut last_err = None;
        for attempt in 1..=STORE_RETRY_ATTEMPTS {
            match self.store.enqueue_task(&new).await {
                Ok(outcome) => {
                    match outcome {
                        EnqueueOutcome::Created(id) => {
                            info!(task_id = id, document_id = new.document_id,
                                task_type = %new.task_type, "task enqueued");
                        }
                        EnqueueOutcome::Existing(id) => {
                            info!(task_id = id, document_id = new.document_id,
                                "task already active for document, reusing");
                        }
                    }
                    return Ok(outcome);
                }
                Err(e) if is_serialization_failure(&e) && attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(document_id = new.document_id, attempt, "enqueue serialization conflict, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store retry attempts exhausted")))
    }

    /// Lease the next eligible task for this worker.
    pub async fn next_task(&self) -> Result<Option<Task>> {
        self.store
            .next_task(&self.server_id, &self.capabilities, self.lease)
            .await
    }

    /// Lease-guarded progress write. A false return means the lease was
    /// lost and the caller must abandon the task.
    pub async fn update_task_progress(
        &self,
        task_id: i64,
        progress_percentage: i32,
        current_step: &str,
        message: &str,
        step_status: StepStatus,
    ) -> Result<bool> {
        self.store
            .update_progress(
                task_id,
                &self.server_id,
                progress_percentage,
                current_step,
                message,
                step_status,
                None,
                self.lease,
            )
            .await
    }

    /// Terminal transition; retry scheduling and document-status sync happen
    /// in the store.
    pub async fn complete_task(
        &self,
        task_id: i64,
        success: bool,
        results_path: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut last_err = None;
        for attempt in 1..=STORE_RETRY_ATTEMPTS {
            match self
                .store
                .complete_task(
                    task_id,
                    &self.server_id,
                    success,
                    results_path,
                    error_message,
                    metadata.clone(),
                    &self.backoff,
                )
                .await
            {
                Ok(completed) => {
                    if completed {
                        info!(task_id, success, "task completed");
                    } else {
                        warn!(task_id, "completion rejected, lease no longer held");
                    }
                    return Ok(completed);
                }
                Err(e) if is_serialization_failure(&e) && attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(task_id, attempt, "completion serialization conflict, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store retry attempts exhausted")))
    }

    /// Complete the main task and, on success, fan out the three specialized
    /// analysis tasks carrying the same file, company, and options. Each
    /// dependent carries a success-only edge on the finished parent.
    pub async fn complete_task_and_create_specialized(
        &self,
        task_id: i64,
        document_id: i64,
        success: bool,
        results_path: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        let completed = self
            .complete_task(task_id, success, results_path, error_message, metadata)
            .await?;

        if !completed || !success {
            return Ok(completed);
        }

        let Some(parent) = self.store.get_task(task_id).await? else {
            warn!(task_id, "completed task not found for specialized fan-out");
            return Ok(completed);
        };

        for task_type in TaskType::specialized_types() {
            let new = NewTask::new(document_id, parent.file_path.clone(), parent.company_id.clone())
                .task_type(task_type)
                .options(parent.processing_options.clone());

            match self.add_task(new).await {
                Ok(EnqueueOutcome::Created(specialized_id)) => {
                    self.store
                        .add_dependency(specialized_id, task_id, DependencyType::SuccessOnly)
                        .await?;
                    info!(task_id = specialized_id, document_id, task_type = %task_type,
                        "specialized analysis task created");
                }
                Ok(EnqueueOutcome::Existing(existing_id)) => {
                    info!(task_id = existing_id, document_id, task_type = %task_type,
                        "specialized analysis task already queued");
                }
                Err(e) => {
                    warn!(document_id, task_type = %task_type, error = %e,
                        "failed to create specialized analysis task");
                }
            }
        }

        Ok(completed)
    }

    /// Reclaim tasks whose lease expired (crashed or stuck worker).
    pub async fn recover_abandoned_tasks(&self) -> Result<u64> {
        let reclaimed = self.store.cleanup_expired_locks().await?;
        if reclaimed > 0 {
            info!(reclaimed, "recovered abandoned processing tasks");
        }
        Ok(reclaimed)
    }

    /// Re-queue failed tasks with retries left, bounded by age.
    pub async fn retry_failed_tasks(&self, max_age_hours: i64) -> Result<usize> {
        let candidates = self.store.failed_retryable_tasks(max_age_hours).await?;
        let mut retried = 0usize;
        for task_id in candidates {
            if self.store.retry_failed_task(task_id).await? {
                retried += 1;
            }
        }
        if retried > 0 {
            info!(retried, "scheduled failed tasks for retry");
        }
        Ok(retried)
    }

    /// Latest progress of a document's active task, for UI polling.
    pub async fn get_task_progress(&self, document_id: i64) -> Result<Option<TaskProgress>> {
        self.store.task_progress(document_id).await
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let by_status = self.store.queue_stats().await?;
        Ok(QueueStats {
            by_status,
            server_id: self.server_id.clone(),
            running_tasks: self.running_tasks(),
            max_concurrent: self.max_concurrent_tasks,
        })
    }
}

/// Unique worker identity: hostname, pid, and a random suffix so restarted
/// processes never collide with their predecessor's registration.
fn generate_server_id() -> String {
    let hostname = gethostname::gethostname();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        hostname.to_string_lossy(),
        std::process::id(),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> QueueManager {
        QueueManager::new(
            store,
            ServerType::Cpu,
            Duration::from_secs(1800),
            BackoffPolicy::default(),
            3,
        )
    }

    fn pdf_task(document_id: i64) -> NewTask {
        NewTask::new(document_id, "p/u/a.pdf", "acme")
    }

    #[test]
    fn server_id_has_hostname_pid_suffix() {
        let id = generate_server_id();
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert!(parts[1].parse::<u32>().is_ok());
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_existing_id() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        let first = queue.add_task(pdf_task(101)).await.unwrap();
        let EnqueueOutcome::Created(t1) = first else {
            panic!("expected Created, got {first:?}");
        };

        // Same document, same type: the existing id comes back, no new row.
        let second = queue.add_task(pdf_task(101)).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Existing(t1));
        assert_eq!(store.active_task_count(101).await, 1);

        // Enqueue marks the document as processing immediately.
        assert_eq!(
            store.document_status(101).await,
            Some(DocumentStatus::Processing)
        );
    }

    #[tokio::test]
    async fn options_round_trip_byte_equal() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store);

        let options = serde_json::json!({
            "use_single_template": false,
            "unknown_key": {"deep": [1, "two", null]},
        });
        let raw = serde_json::to_vec(&options).unwrap();

        queue
            .add_task(pdf_task(7).options(options))
            .await
            .unwrap();

        let task = queue.next_task().await.unwrap().unwrap();
        assert_eq!(serde_json::to_vec(&task.processing_options).unwrap(), raw);
    }

    #[tokio::test]
    async fn dequeue_order_priority_then_fifo() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store);

        let a = queue.add_task(pdf_task(1)).await.unwrap().task_id();
        let b = queue.add_task(pdf_task(2)).await.unwrap().task_id();
        let c = queue
            .add_task(pdf_task(3).priority(TaskPriority::Urgent))
            .await
            .unwrap()
            .task_id();

        assert_eq!(queue.next_task().await.unwrap().unwrap().id, c);
        assert_eq!(queue.next_task().await.unwrap().unwrap().id, a);
        assert_eq!(queue.next_task().await.unwrap().unwrap().id, b);
        assert!(queue.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let w1 = manager(store.clone());
        let w2 = manager(store);

        w1.add_task(pdf_task(11)).await.unwrap();

        let leased = w1.next_task().await.unwrap().unwrap();
        assert_eq!(leased.status, TaskStatus::Processing);
        assert_eq!(leased.locked_by.as_deref(), Some(w1.server_id()));
        assert!(leased.lock_expires_at.unwrap() > leased.locked_at.unwrap());

        // No second lease while w1 holds the only task.
        assert!(w2.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_lease_guarded() {
        let store = Arc::new(MemoryStore::new());
        let w1 = manager(store.clone());
        let w2 = manager(store.clone());

        w1.add_task(pdf_task(21)).await.unwrap();
        let task = w1.next_task().await.unwrap().unwrap();

        assert!(w1
            .update_task_progress(task.id, 50, "Halfway", "half done", StepStatus::Started)
            .await
            .unwrap());

        // An out-of-order lower write never decreases the stored value.
        assert!(w1
            .update_task_progress(task.id, 30, "Earlier", "late arrival", StepStatus::Started)
            .await
            .unwrap());
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress_percentage, 50);

        // A non-owner's write is rejected outright.
        assert!(!w2
            .update_task_progress(task.id, 90, "Hijack", "nope", StepStatus::Started)
            .await
            .unwrap());

        // The step log keeps every accepted write, in order.
        let steps = store.progress_steps(task.id).await;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].progress_percentage, 50);
        assert_eq!(steps[1].progress_percentage, 30);
    }

    #[tokio::test]
    async fn retry_ladder_ends_in_failure_with_document_sync() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        let t = queue.add_task(pdf_task(31)).await.unwrap().task_id();

        // Attempt 1 and 2: retry with doubling backoff.
        for (attempt, nominal_secs) in [(1i32, 60i64), (2, 120)] {
            let task = queue.next_task().await.unwrap().unwrap();
            assert_eq!(task.id, t);
            assert!(queue
                .complete_task(t, false, None, Some("Data extraction failed - OOM"), None)
                .await
                .unwrap());

            let stored = store.get_task(t).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Retry);
            assert_eq!(stored.retry_count, attempt);
            let delay = (stored.next_retry_at.unwrap() - store.current_time().await).num_seconds();
            assert!(
                delay >= (nominal_secs as f64 * 0.8) as i64 - 2
                    && delay <= (nominal_secs as f64 * 1.2) as i64 + 2,
                "attempt {attempt}: delay {delay}s outside jitter window"
            );

            // Not eligible again until the backoff elapses.
            assert!(queue.next_task().await.unwrap().is_none());
            store
                .advance_clock(Duration::from_secs((nominal_secs as u64 * 2).max(300)))
                .await;
        }

        // Attempt 3 reaches the bound: terminal failure.
        let task = queue.next_task().await.unwrap().unwrap();
        assert_eq!(task.id, t);
        assert!(queue
            .complete_task(t, false, None, Some("Data extraction failed - OOM"), None)
            .await
            .unwrap());

        let stored = store.get_task(t).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.last_error.as_deref().unwrap().contains("OOM"));
        assert_eq!(
            store.document_status(31).await,
            Some(DocumentStatus::Failed)
        );
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_without_losing_progress() {
        let store = Arc::new(MemoryStore::new());
        let w1 = manager(store.clone());
        let w2 = manager(store.clone());

        w1.add_task(pdf_task(41)).await.unwrap();
        let task = w1.next_task().await.unwrap().unwrap();
        assert!(w1
            .update_task_progress(task.id, 10, "Visual Analysis", "working", StepStatus::Started)
            .await
            .unwrap());

        // Nothing to reclaim while the lease is live.
        assert_eq!(w2.recover_abandoned_tasks().await.unwrap(), 0);

        store.advance_clock(Duration::from_secs(1801)).await;
        assert_eq!(w2.recover_abandoned_tasks().await.unwrap(), 1);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(stored.locked_by.is_none());
        assert_eq!(store.progress_steps(task.id).await.len(), 1);

        // The stale worker's completion is rejected; the new lease wins.
        assert!(!w1
            .complete_task(task.id, true, None, None, None)
            .await
            .unwrap());

        let retaken = w2.next_task().await.unwrap().unwrap();
        assert_eq!(retaken.id, task.id);
        assert!(w2
            .complete_task(task.id, true, Some("results/41.json"), None, None)
            .await
            .unwrap());

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress_percentage, 100);
        assert_eq!(
            store.document_status(41).await,
            Some(DocumentStatus::Completed)
        );
    }

    #[tokio::test]
    async fn successful_completion_fans_out_specialized_tasks() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        let options = serde_json::json!({"use_single_template": false, "project_id": 9});
        let t = queue
            .add_task(pdf_task(51).options(options.clone()))
            .await
            .unwrap()
            .task_id();
        let task = queue.next_task().await.unwrap().unwrap();
        assert_eq!(task.id, t);

        assert!(queue
            .complete_task_and_create_specialized(t, 51, true, None, None, None)
            .await
            .unwrap());

        // Three dependent specialized tasks, same file/company/options.
        let mut types = Vec::new();
        for id in [t + 1, t + 2, t + 3] {
            let specialized = store.get_task(id).await.unwrap().unwrap();
            assert_eq!(specialized.document_id, 51);
            assert_eq!(specialized.status, TaskStatus::Queued);
            assert_eq!(specialized.file_path, task.file_path);
            assert_eq!(specialized.company_id, task.company_id);
            assert_eq!(specialized.processing_options, options);
            types.push(specialized.task_type);
        }
        assert_eq!(types, TaskType::specialized_types().to_vec());

        // Their success-only dependency on the completed parent is already
        // satisfied, so they are immediately leasable.
        let next = queue.next_task().await.unwrap().unwrap();
        assert!(next.task_type.is_specialized());
    }

    #[tokio::test]
    async fn failed_completion_skips_specialized_fan_out() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        let t = queue.add_task(pdf_task(61)).await.unwrap().task_id();
        queue.next_task().await.unwrap().unwrap();

        assert!(queue
            .complete_task_and_create_specialized(t, 61, false, None, Some("boom"), None)
            .await
            .unwrap());

        assert!(store.get_task(t + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_failed_tasks_requeues_young_failures() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        // Fail a task once (max_retries 1 would terminalize; use operator
        // retry path instead: drive to terminal failure with retries left).
        let t = queue.add_task(pdf_task(71)).await.unwrap().task_id();
        queue.next_task().await.unwrap().unwrap();

        // Drive to terminal failure.
        for _ in 0..3 {
            store.advance_clock(Duration::from_secs(7200)).await;
            queue.recover_abandoned_tasks().await.unwrap();
            if let Some(task) = queue.next_task().await.unwrap() {
                queue
                    .complete_task(task.id, false, None, Some("transient"), None)
                    .await
                    .unwrap();
            }
        }
        assert_eq!(
            store.get_task(t).await.unwrap().unwrap().status,
            TaskStatus::Failed
        );

        // retry_count == max_retries: nothing to requeue.
        assert_eq!(queue.retry_failed_tasks(24).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn heartbeat_and_stats_report_identity() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store.clone());

        queue.register_server().await.unwrap();
        assert!(queue.heartbeat().await.unwrap());

        let row = store.server_row(queue.server_id()).await.unwrap();
        assert_eq!(row.status, ServerStatus::Active);
        assert_eq!(row.max_concurrent_tasks, 3);

        queue.add_task(pdf_task(81)).await.unwrap();
        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.server_id, queue.server_id());
        assert_eq!(stats.by_status.get("queued").unwrap().count, 1);
    }

    #[tokio::test]
    async fn task_progress_reflects_active_row() {
        let store = Arc::new(MemoryStore::new());
        let queue = manager(store);

        assert!(queue.get_task_progress(91).await.unwrap().is_none());

        queue.add_task(pdf_task(91)).await.unwrap();
        let progress = queue.get_task_progress(91).await.unwrap().unwrap();
        assert_eq!(progress.status, TaskStatus::Queued);
        assert_eq!(progress.progress_percentage, 0);
        assert_eq!(progress.current_step, "Queued for processing");

        let task = queue.next_task().await.unwrap().unwrap();
        queue
            .update_task_progress(task.id, 40, "Data Extraction", "extracting", StepStatus::Started)
            .await
            .unwrap();

        let progress = queue.get_task_progress(91).await.unwrap().unwrap();
        assert_eq!(progress.status, TaskStatus::Processing);
        assert_eq!(progress.progress_percentage, 40);
        assert_eq!(progress.current_step, "Data Extraction");
    }
}
