use crate::store::PipelineStore;
use crate::store_postgres::truncate_error;
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone, Debug, Default)]
struct DocumentRow {
    status: Option<DocumentStatus>,
    results_file_path: Option<String>,
}

#[derive(Clone, Debug)]
struct ExperimentRow {
    experiment_name: String,
    template_results: Option<serde_json::Value>,
    template_completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SlideFeedbackRow {
    pub slide_filename: String,
    pub feedback_text: String,
}

struct Inner {
    next_task_id: i64,
    tasks: BTreeMap<i64, Task>,
    progress: Vec<ProgressStep>,
    servers: HashMap<String, ServerRegistration>,
    dependencies: Vec<TaskDependency>,
    documents: HashMap<i64, DocumentRow>,
    visual_cache: HashMap<i64, Vec<(DateTime<Utc>, serde_json::Value)>>,
    slide_feedback: HashMap<i64, BTreeMap<i32, SlideFeedbackRow>>,
    specialized: HashMap<i64, Vec<(String, String)>>,
    experiments: HashMap<i64, Vec<ExperimentRow>>,
    models: HashMap<String, String>,
    prompts: HashMap<String, String>,
    default_template: Option<i64>,
    clock_offset: chrono::Duration,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

/// In-memory implementation of [`PipelineStore`] for tests.
///
/// Carries a shiftable clock so lease-expiry behavior can be exercised
/// without waiting out real leases.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_task_id: 1,
                tasks: BTreeMap::new(),
                progress: Vec::new(),
                servers: HashMap::new(),
                dependencies: Vec::new(),
                documents: HashMap::new(),
                visual_cache: HashMap::new(),
                slide_feedback: HashMap::new(),
                specialized: HashMap::new(),
                experiments: HashMap::new(),
                models: HashMap::new(),
                prompts: HashMap::new(),
                default_template: None,
                clock_offset: chrono::Duration::zero(),
            }),
        }
    }

    // ── Test support ──

    /// Shift the store's notion of "now" forward.
    pub async fn advance_clock(&self, by: Duration) {
        let mut w = self.inner.write().await;
        w.clock_offset = w.clock_offset
            + chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// The store's current (possibly shifted) time.
    pub async fn current_time(&self) -> DateTime<Utc> {
        self.inner.read().await.now()
    }

    pub async fn set_model(&self, model_type: &str, model_name: &str) {
        let mut w = self.inner.write().await;
        w.models
            .insert(model_type.to_string(), model_name.to_string());
    }

    pub async fn set_prompt(&self, stage_name: &str, prompt_text: &str) {
        let mut w = self.inner.write().await;
        w.prompts
            .insert(stage_name.to_string(), prompt_text.to_string());
    }

    pub async fn set_default_template(&self, template_id: i64) {
        let mut w = self.inner.write().await;
        w.default_template = Some(template_id);
    }

    pub async fn insert_visual_cache(&self, document_id: i64, blob: serde_json::Value) {
        let mut w = self.inner.write().await;
        let at = w.now();
        w.visual_cache.entry(document_id).or_default().push((at, blob));
    }

    pub async fn document_status(&self, document_id: i64) -> Option<DocumentStatus> {
        let r = self.inner.read().await;
        r.documents.get(&document_id).and_then(|d| d.status)
    }

    pub async fn document_results_path(&self, document_id: i64) -> Option<String> {
        let r = self.inner.read().await;
        r.documents
            .get(&document_id)
            .and_then(|d| d.results_file_path.clone())
    }

    pub async fn progress_steps(&self, task_id: i64) -> Vec<ProgressStep> {
        let r = self.inner.read().await;
        r.progress
            .iter()
            .filter(|p| p.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn slide_feedback_rows(&self, document_id: i64) -> Vec<(i32, SlideFeedbackRow)> {
        let r = self.inner.read().await;
        r.slide_feedback
            .get(&document_id)
            .map(|m| m.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn specialized_rows(&self, document_id: i64) -> Vec<(String, String)> {
        let r = self.inner.read().await;
        r.specialized.get(&document_id).cloned().unwrap_or_default()
    }

    pub async fn template_results(&self, document_id: i64) -> Option<serde_json::Value> {
        let r = self.inner.read().await;
        r.experiments
            .get(&document_id)
            .and_then(|rows| rows.last())
            .and_then(|row| row.template_results.clone())
    }

    pub async fn experiment_count(&self, document_id: i64) -> usize {
        let r = self.inner.read().await;
        r.experiments.get(&document_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn latest_experiment(&self, document_id: i64) -> Option<(String, DateTime<Utc>)> {
        let r = self.inner.read().await;
        r.experiments
            .get(&document_id)
            .and_then(|rows| rows.last())
            .map(|row| (row.experiment_name.clone(), row.created_at))
    }

    pub async fn template_completed_at(&self, document_id: i64) -> Option<DateTime<Utc>> {
        let r = self.inner.read().await;
        r.experiments
            .get(&document_id)
            .and_then(|rows| rows.last())
            .and_then(|row| row.template_completed_at)
    }

    pub async fn server_row(&self, server_id: &str) -> Option<ServerRegistration> {
        let r = self.inner.read().await;
        r.servers.get(server_id).cloned()
    }

    pub async fn active_task_count(&self, document_id: i64) -> usize {
        let r = self.inner.read().await;
        r.tasks
            .values()
            .filter(|t| t.document_id == document_id && t.status.is_active())
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn dependencies_satisfied(inner: &Inner, task_id: i64) -> bool {
    inner
        .dependencies
        .iter()
        .filter(|d| d.dependent_task_id == task_id)
        .all(|d| match inner.tasks.get(&d.depends_on_task_id) {
            Some(dep) => d.dependency_type.satisfied_by(dep.status),
            None => true,
        })
}

fn lease_held(task: &Task, server_id: &str, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Processing
        && task.locked_by.as_deref() == Some(server_id)
        && task.lock_expires_at.map(|e| e > now).unwrap_or(false)
}

#[async_trait]
impl PipelineStore for MemoryStore {
    // ── Queue ──

    async fn enqueue_task(&self, new: &NewTask) -> Result<EnqueueOutcome> {
        let mut w = self.inner.write().await;
        let now = w.now();

        if let Some(existing) = w.tasks.values().find(|t| {
            t.document_id == new.document_id
                && t.task_type == new.task_type
                && t.status.is_active()
        }) {
            return Ok(EnqueueOutcome::Existing(existing.id));
        }

        let id = w.next_task_id;
        w.next_task_id += 1;

        w.tasks.insert(
            id,
            Task {
                id,
                document_id: new.document_id,
                task_type: new.task_type,
                status: TaskStatus::Queued,
                priority: new.priority,
                file_path: new.file_path.clone(),
                company_id: new.company_id.clone(),
                processing_options: new.processing_options.clone(),
                progress_percentage: 0,
                current_step: None,
                progress_message: None,
                retry_count: 0,
                max_retries: new.max_retries,
                created_at: now,
                started_at: None,
                completed_at: None,
                next_retry_at: None,
                last_error: None,
                error_count: 0,
                locked_by: None,
                locked_at: None,
                lock_expires_at: None,
                results_file_path: None,
                processing_metadata: None,
            },
        );

        w.documents.entry(new.document_id).or_default().status =
            Some(DocumentStatus::Processing);

        Ok(EnqueueOutcome::Created(id))
    }

    async fn next_task(
        &self,
        server_id: &str,
        capabilities: &serde_json::Value,
        lease: Duration,
    ) -> Result<Option<Task>> {
        let mut w = self.inner.write().await;
        let now = w.now();

        let capable = capabilities
            .get("pdf_analysis")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !capable {
            return Ok(None);
        }

        let mut eligible: Vec<(i32, DateTime<Utc>, i64)> = w
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Queued | TaskStatus::Retry)
                    && t.next_retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|t| (t.priority.as_i32(), t.created_at, t.id))
            .collect();
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let chosen = eligible
            .into_iter()
            .find(|(_, _, id)| dependencies_satisfied(&w, *id));

        let Some((_, _, id)) = chosen else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(lease).context("lease out of range")?;
        let task = w.tasks.get_mut(&id).context("leased task vanished")?;
        task.status = TaskStatus::Processing;
        task.started_at = task.started_at.or(Some(now));
        task.locked_by = Some(server_id.to_string());
        task.locked_at = Some(now);
        task.lock_expires_at = Some(now + lease);
        task.next_retry_at = None;

        Ok(Some(task.clone()))
    }

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
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = w.now();
        let lease = chrono::Duration::from_std(lease).context("lease out of range")?;
        let clamped = progress_percentage.clamp(0, 100);

        let Some(task) = w.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !lease_held(task, server_id, now) {
            return Ok(false);
        }

        task.progress_percentage = task.progress_percentage.max(clamped);
        task.current_step = Some(current_step.to_string());
        task.progress_message = Some(message.to_string());
        task.lock_expires_at = Some(now + lease);

        w.progress.push(ProgressStep {
            task_id,
            step_name: current_step.to_string(),
            step_status,
            progress_percentage: clamped,
            message: Some(message.to_string()),
            step_data,
            created_at: now,
        });

        Ok(true)
    }

    async fn complete_task(
        &self,
        task_id: i64,
        server_id: &str,
        success: bool,
        results_path: Option<&str>,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
        backoff: &BackoffPolicy,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = w.now();

        let Some(task) = w.tasks.get(&task_id) else {
            return Ok(false);
        };
        if !lease_held(task, server_id, now) {
            return Ok(false);
        }
        let document_id = task.document_id;

        if success {
            let task = w.tasks.get_mut(&task_id).context("task vanished")?;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            if results_path.is_some() {
                task.results_file_path = results_path.map(str::to_string);
            }
            task.progress_percentage = 100;
            task.current_step = Some("completed".to_string());
            if metadata.is_some() {
                task.processing_metadata = metadata;
            }
            task.locked_by = None;
            task.locked_at = None;
            task.lock_expires_at = None;

            let doc = w.documents.entry(document_id).or_default();
            doc.status = Some(DocumentStatus::Completed);
            if let Some(path) = results_path {
                doc.results_file_path = Some(path.to_string());
            }

            w.progress.push(ProgressStep {
                task_id,
                step_name: "completed".to_string(),
                step_status: StepStatus::Completed,
                progress_percentage: 100,
                message: None,
                step_data: None,
                created_at: now,
            });
        } else {
            let error = error_message.map(truncate_error);
            let (retry_count, max_retries) = {
                let task = w.tasks.get(&task_id).context("task vanished")?;
                (task.retry_count, task.max_retries)
            };
            let new_retry_count = (retry_count + 1).min(max_retries);

            if new_retry_count < max_retries {
                let delay = chrono::Duration::from_std(backoff.delay_for(new_retry_count))
                    .context("backoff delay out of range")?;
                let task = w.tasks.get_mut(&task_id).context("task vanished")?;
                task.status = TaskStatus::Retry;
                task.retry_count = new_retry_count;
                task.error_count += 1;
                task.next_retry_at = Some(now + delay);
                task.last_error = error.clone();
                if metadata.is_some() {
                    task.processing_metadata = metadata;
                }
                task.locked_by = None;
                task.locked_at = None;
                task.lock_expires_at = None;
            } else {
                let task = w.tasks.get_mut(&task_id).context("task vanished")?;
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.retry_count = new_retry_count;
                task.error_count += 1;
                task.last_error = error.clone();
                if metadata.is_some() {
                    task.processing_metadata = metadata;
                }
                task.locked_by = None;
                task.locked_at = None;
                task.lock_expires_at = None;

                w.documents.entry(document_id).or_default().status =
                    Some(DocumentStatus::Failed);
            }

            w.progress.push(ProgressStep {
                task_id,
                step_name: "failed".to_string(),
                step_status: StepStatus::Failed,
                progress_percentage: 0,
                message: error,
                step_data: None,
                created_at: now,
            });
        }

        Ok(true)
    }

    async fn cleanup_expired_locks(&self) -> Result<u64> {
        let mut w = self.inner.write().await;
        let now = w.now();
        let mut reclaimed = 0u64;

        for task in w.tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.lock_expires_at.map(|e| e < now).unwrap_or(false)
            {
                task.status = if task.retry_count > 0 {
                    TaskStatus::Retry
                } else {
                    TaskStatus::Queued
                };
                task.locked_by = None;
                task.locked_at = None;
                task.lock_expires_at = None;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    async fn retry_failed_task(&self, task_id: i64) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = w.now();

        let Some(task) = w.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Failed || task.retry_count >= task.max_retries {
            return Ok(false);
        }

        task.status = TaskStatus::Retry;
        task.next_retry_at = Some(now);
        task.completed_at = None;
        Ok(true)
    }

    async fn failed_retryable_tasks(&self, max_age_hours: i64) -> Result<Vec<i64>> {
        let r = self.inner.read().await;
        let cutoff = r.now() - chrono::Duration::hours(max_age_hours);
        Ok(r.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Failed
                    && t.retry_count < t.max_retries
                    && t.created_at > cutoff
            })
            .map(|t| t.id)
            .collect())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&task_id).cloned())
    }

    async fn task_progress(&self, document_id: i64) -> Result<Option<TaskProgress>> {
        let r = self.inner.read().await;
        let latest = r
            .tasks
            .values()
            .filter(|t| t.document_id == document_id && t.status.is_active())
            .max_by_key(|t| t.created_at);

        Ok(latest.map(|t| TaskProgress {
            progress_percentage: t.progress_percentage,
            current_step: t
                .current_step
                .clone()
                .unwrap_or_else(|| "Queued for processing".to_string()),
            message: t
                .progress_message
                .clone()
                .unwrap_or_else(|| "Task queued".to_string()),
            status: t.status,
            started_at: t.started_at,
            retry_count: t.retry_count,
        }))
    }

    async fn queue_stats(&self) -> Result<BTreeMap<String, StatusStats>> {
        let r = self.inner.read().await;
        let now = r.now();
        let cutoff = now - chrono::Duration::hours(24);

        let mut stats: BTreeMap<String, (i64, f64)> = BTreeMap::new();
        for task in r.tasks.values().filter(|t| t.created_at > cutoff) {
            let entry = stats.entry(task.status.as_str().to_string()).or_default();
            entry.0 += 1;
            entry.1 += (now - task.created_at).num_seconds() as f64;
        }

        Ok(stats
            .into_iter()
            .map(|(status, (count, total_age))| {
                (
                    status,
                    StatusStats {
                        count,
                        avg_age_seconds: Some(total_age / count as f64),
                    },
                )
            })
            .collect())
    }

    // ── Server registry ──

    async fn register_server(&self, registration: &ServerRegistration) -> Result<()> {
        let mut w = self.inner.write().await;
        let cutoff = w.now() - chrono::Duration::hours(1);
        w.servers.retain(|_, s| s.last_heartbeat >= cutoff);
        w.servers
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str, current_load: i32) -> Result<bool> {
        let mut w = self.inner.write().await;
        let now = w.now();
        match w.servers.get_mut(server_id) {
            Some(server) => {
                server.last_heartbeat = now;
                server.current_load = current_load;
                server.status = ServerStatus::Active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Dependencies ──

    async fn add_dependency(
        &self,
        dependent_task_id: i64,
        depends_on_task_id: i64,
        dependency_type: DependencyType,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let exists = w.dependencies.iter().any(|d| {
            d.dependent_task_id == dependent_task_id
                && d.depends_on_task_id == depends_on_task_id
        });
        if !exists {
            w.dependencies.push(TaskDependency {
                dependent_task_id,
                depends_on_task_id,
                dependency_type,
            });
        }
        Ok(())
    }

    // ── External document ──

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        w.documents.entry(document_id).or_default().status = Some(status);
        Ok(true)
    }

    async fn record_progress_callback(
        &self,
        document_id: i64,
        progress_percentage: i32,
        current_step: &str,
        message: &str,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let clamped = progress_percentage.clamp(0, 100);

        let task = w
            .tasks
            .values_mut()
            .find(|t| t.document_id == document_id && t.status == TaskStatus::Processing);

        match task {
            Some(task) => {
                task.progress_percentage = task.progress_percentage.max(clamped);
                task.current_step = Some(current_step.to_string());
                task.progress_message = Some(message.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_deck_results(
        &self,
        document_id: i64,
        results_file_path: &str,
        status: DocumentStatus,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = w.now();

        let doc = w.documents.entry(document_id).or_default();
        doc.status = Some(status);
        doc.results_file_path = Some(results_file_path.to_string());

        let queue_status = match status {
            DocumentStatus::Completed => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        };

        if let Some(task) = w
            .tasks
            .values_mut()
            .find(|t| t.document_id == document_id && t.status == TaskStatus::Processing)
        {
            task.status = queue_status;
            task.completed_at = Some(now);
            task.results_file_path = Some(results_file_path.to_string());
            task.progress_percentage = 100;
            task.current_step = Some("Analysis Complete".to_string());
            task.progress_message = Some("Document analysis completed".to_string());
            task.locked_by = None;
            task.locked_at = None;
            task.lock_expires_at = None;
        }

        Ok(())
    }

    // ── Phase result caches ──

    async fn latest_visual_analysis(
        &self,
        document_id: i64,
    ) -> Result<Option<serde_json::Value>> {
        let r = self.inner.read().await;
        Ok(r.visual_cache
            .get(&document_id)
            .and_then(|entries| entries.last())
            .map(|(_, blob)| blob.clone()))
    }

    async fn save_slide_feedback(
        &self,
        document_id: i64,
        slide_number: i32,
        slide_filename: &str,
        feedback_text: &str,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.slide_feedback.entry(document_id).or_default().insert(
            slide_number,
            SlideFeedbackRow {
                slide_filename: slide_filename.to_string(),
                feedback_text: feedback_text.to_string(),
            },
        );
        Ok(())
    }

    async fn replace_specialized_results(
        &self,
        document_id: i64,
        results: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let mut w = self.inner.write().await;
        let rows: Vec<(String, String)> = results
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(kind, text)| (kind.clone(), text.clone()))
            .collect();
        let saved = rows.len();
        w.specialized.insert(document_id, rows);
        Ok(saved)
    }

    async fn upsert_template_results(
        &self,
        document_id: i64,
        experiment_name: &str,
        results: &serde_json::Value,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = w.now();
        let rows = w.experiments.entry(document_id).or_default();

        match rows.last_mut() {
            Some(latest) => {
                latest.template_results = Some(results.clone());
                latest.template_completed_at = Some(now);
            }
            None => rows.push(ExperimentRow {
                experiment_name: experiment_name.to_string(),
                template_results: Some(results.clone()),
                template_completed_at: Some(now),
                created_at: now,
            }),
        }
        Ok(())
    }

    // ── Model / prompt configuration ──

    async fn active_vision_model(&self) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.models.get("vision").cloned())
    }

    async fn active_text_model(&self) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.models.get("text").cloned())
    }

    async fn active_prompt(&self, stage_name: &str) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.prompts.get(stage_name).cloned())
    }

    async fn default_template_id(&self) -> Result<Option<i64>> {
        let r = self.inner.read().await;
        Ok(r.default_template)
    }
}
