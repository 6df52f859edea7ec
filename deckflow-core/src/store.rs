use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Persistence trait for the processing pipeline.
///
/// The queue manager, pipeline driver, and ingestion endpoints operate
/// exclusively through this trait, enabling pluggable backends (MemoryStore
/// for tests, Postgres for production). Each method is a single atomic
/// operation; the Postgres implementation wraps multi-statement methods in
/// one transaction.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ── Queue ──

    /// Enqueue a task, or return the id of the document's existing active
    /// task of the same type (at most one row per document and task type in
    /// queued/processing/retry). On insert, the external document's
    /// processing status is set to `processing` as an early signal to the UI.
    async fn enqueue_task(&self, new: &NewTask) -> Result<EnqueueOutcome>;

    /// Atomically lease the highest-priority eligible task for `server_id`.
    /// Eligible: status in {queued, retry}, `next_retry_at` elapsed or null,
    /// all dependency edges satisfied, and the work covered by the caller's
    /// capabilities (every current task type requires `pdf_analysis`).
    /// Selection order is priority desc, then created_at asc, then id asc,
    /// with `SKIP LOCKED` semantics so concurrent workers never collide.
    async fn next_task(
        &self,
        server_id: &str,
        capabilities: &serde_json::Value,
        lease: Duration,
    ) -> Result<Option<Task>>;

    /// Lease-guarded progress write: requires the row to be `processing`,
    /// locked by `server_id`, and the lease unexpired. Clamps to [0,100],
    /// never decreases the stored percentage, appends a progress-step row,
    /// and slides the lease forward by `lease`. Returns false when the lease
    /// was lost (the caller must abandon the task).
    #[allow(clippy::too_many_arguments)]
    async fn update_progress(
        &self,
        task_id: i64,
        server_id: &str,
        progress_percentage: i32,
        current_step: &str,
        message: &str,
        step_status: StepStatus,
        step_data: Option<serde_json::Value>,
        lease: Duration,
    ) -> Result<bool>;

    /// Lease-guarded terminal transition. Success: completed at 100% with
    /// the document marked completed. Failure with retries left: status
    /// `retry` with `next_retry_at = now + backoff(retry_count)`. Failure at
    /// the retry bound: status `failed` with the document marked failed.
    /// Returns false when the lease was lost (a reclaimed task's stale
    /// worker must not overwrite the newer state).
    #[allow(clippy::too_many_arguments)]
    async fn complete_task(
        &self,
        task_id: i64,
        server_id: &str,
        success: bool,
        results_path: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
        backoff: &BackoffPolicy,
    ) -> Result<bool>;

    /// Reclaim expired leases: processing rows past `lock_expires_at` go
    /// back to queued (retry when attempts were already made) with lock
    /// fields cleared. The progress log is untouched. Returns the count.
    async fn cleanup_expired_locks(&self) -> Result<u64>;

    /// Re-queue one failed task if it has retries left. Returns false
    /// otherwise.
    async fn retry_failed_task(&self, task_id: i64) -> Result<bool>;

    /// Ids of failed tasks younger than `max_age_hours` with retries left.
    async fn failed_retryable_tasks(&self, max_age_hours: i64) -> Result<Vec<i64>>;

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>>;

    /// Latest active task's progress for a document, for UI polling.
    async fn task_progress(&self, document_id: i64) -> Result<Option<TaskProgress>>;

    /// Per-status counts and average ages over the trailing 24 hours.
    async fn queue_stats(&self) -> Result<BTreeMap<String, StatusStats>>;

    // ── Server registry ──

    /// Upsert this worker's liveness row and purge registrations whose
    /// heartbeat is older than one hour.
    async fn register_server(&self, registration: &ServerRegistration) -> Result<()>;

    /// Refresh the heartbeat and load of a registered worker.
    async fn heartbeat(&self, server_id: &str, current_load: i32) -> Result<bool>;

    // ── Dependencies ──

    async fn add_dependency(
        &self,
        dependent_task_id: i64,
        depends_on_task_id: i64,
        dependency_type: DependencyType,
    ) -> Result<()>;

    // ── External document ──

    async fn set_document_status(&self, document_id: i64, status: DocumentStatus)
        -> Result<bool>;

    /// GPU push path: bump the in-flight task's progress for a document.
    /// Tolerates out-of-order callbacks by keeping `max(existing, incoming)`.
    /// Does not extend the lease and does not append to the step log.
    /// Returns false when the document has no task in `processing`.
    async fn record_progress_callback(
        &self,
        document_id: i64,
        progress_percentage: i32,
        current_step: &str,
        message: &str,
    ) -> Result<bool>;

    /// Legacy sink: update the document row and the in-flight queue row in
    /// one transaction.
    async fn update_deck_results(
        &self,
        document_id: i64,
        results_file_path: &str,
        status: DocumentStatus,
    ) -> Result<()>;

    // ── Phase result caches ──

    /// Most recent visual-analysis blob for a document (written by the GPU).
    async fn latest_visual_analysis(&self, document_id: i64) -> Result<Option<serde_json::Value>>;

    async fn save_slide_feedback(
        &self,
        document_id: i64,
        slide_number: i32,
        slide_filename: &str,
        feedback_text: &str,
    ) -> Result<()>;

    /// Replace-all semantics: delete existing rows for the document, then
    /// insert one row per non-empty analysis text, in one transaction.
    async fn replace_specialized_results(
        &self,
        document_id: i64,
        results: &BTreeMap<String, String>,
    ) -> Result<usize>;

    /// Attach template-processing results to the document's most recent
    /// extraction-experiment row, creating one when absent.
    async fn upsert_template_results(
        &self,
        document_id: i64,
        experiment_name: &str,
        results: &serde_json::Value,
    ) -> Result<()>;

    // ── Model / prompt configuration ──

    async fn active_vision_model(&self) -> Result<Option<String>>;
    async fn active_text_model(&self) -> Result<Option<String>>;
    async fn active_prompt(&self, stage_name: &str) -> Result<Option<String>>;
    async fn default_template_id(&self) -> Result<Option<i64>>;
}
