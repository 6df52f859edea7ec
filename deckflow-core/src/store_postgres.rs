use crate::store::PipelineStore;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Cap stored error messages so a pathological upstream body cannot bloat
/// the queue row.
const MAX_ERROR_LEN: usize = 2048;

pub(crate) fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

fn chrono_lease(lease: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease).context("lease duration out of range")
}

/// Map a full `processing_queue` row to a typed task.
fn task_from_row(row: &PgRow) -> Result<Task> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let priority: i32 = row.try_get("priority")?;

    Ok(Task {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        task_type: TaskType::from_str(&task_type).map_err(|e| anyhow!(e))?,
        status: TaskStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        priority: TaskPriority::from_i32(priority),
        file_path: row.try_get("file_path")?,
        company_id: row.try_get("company_id")?,
        processing_options: row.try_get("processing_options")?,
        progress_percentage: row.try_get("progress_percentage")?,
        current_step: row.try_get("current_step")?,
        progress_message: row.try_get("progress_message")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        error_count: row.try_get("error_count")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        lock_expires_at: row.try_get("lock_expires_at")?,
        results_file_path: row.try_get("results_file_path")?,
        processing_metadata: row.try_get("processing_metadata")?,
    })
}

const TASK_COLUMNS: &str = "id, document_id, task_type, status, priority, file_path, company_id, \
     processing_options, progress_percentage, current_step, progress_message, \
     retry_count, max_retries, created_at, started_at, completed_at, \
     next_retry_at, last_error, error_count, locked_by, locked_at, \
     lock_expires_at, results_file_path, processing_metadata";

/// Qualified column list for the dequeue CTE, where bare `id` would be
/// ambiguous against the CTE's own column.
const TASK_COLUMNS_Q: &str =
    "q.id, q.document_id, q.task_type, q.status, q.priority, q.file_path, q.company_id, \
     q.processing_options, q.progress_percentage, q.current_step, q.progress_message, \
     q.retry_count, q.max_retries, q.created_at, q.started_at, q.completed_at, \
     q.next_retry_at, q.last_error, q.error_count, q.locked_by, q.locked_at, \
     q.lock_expires_at, q.results_file_path, q.processing_metadata";

/// PostgreSQL-backed implementation of [`PipelineStore`].
///
/// All queries are runtime-checked `sqlx::query()` because the tables come from
/// migrations that may not exist at compile time.
pub struct PostgresPipelineStore {
    pool: sqlx::PgPool,
}

impl PostgresPipelineStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run deckflow migrations")?;
        Ok(())
    }

    async fn append_progress_step(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_id: i64,
        step_name: &str,
        step_status: StepStatus,
        progress_percentage: i32,
        message: Option<&str>,
        step_data: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_progress
                (processing_queue_id, step_name, step_status, progress_percentage, message, step_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(task_id)
        .bind(step_name)
        .bind(step_status.as_str())
        .bind(progress_percentage)
        .bind(message)
        .bind(step_data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for PostgresPipelineStore {
    // ── Queue ──

    async fn enqueue_task(&self, new: &NewTask) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id FROM processing_queue
            WHERE document_id = $1
              AND task_type = $2
              AND status IN ('queued', 'processing', 'retry')
            LIMIT 1
            "#,
        )
        .bind(new.document_id)
        .bind(new.task_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(EnqueueOutcome::Existing(row.try_get("id")?));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO processing_queue
                (document_id, task_type, status, priority, file_path, company_id,
                 processing_options, max_retries)
            VALUES ($1, $2, 'queued', $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(new.document_id)
        .bind(new.task_type.as_str())
        .bind(new.priority.as_i32())
        .bind(&new.file_path)
        .bind(&new.company_id)
        .bind(&new.processing_options)
        .bind(new.max_retries)
        .fetch_one(&mut *tx)
        .await?;

        let task_id: i64 = row.try_get("id")?;

        // Early UI signal: the document shows as processing from enqueue.
        sqlx::query("UPDATE project_documents SET processing_status = 'processing' WHERE id = $1")
            .bind(new.document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(EnqueueOutcome::Created(task_id))
    }

    async fn next_task(
        &self,
        server_id: &str,
        capabilities: &serde_json::Value,
        lease: Duration,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let expires = now + chrono_lease(lease)?;

        // CTE form keeps the lock acquisition planner-independent; SKIP
        // LOCKED makes concurrent dequeues collision-free.
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT q.id
                FROM processing_queue q
                WHERE q.status IN ('queued', 'retry')
                  AND (q.next_retry_at IS NULL OR q.next_retry_at <= $1)
                  AND COALESCE(($4 ->> 'pdf_analysis')::boolean, false)
                  AND NOT EXISTS (
                      SELECT 1
                      FROM task_dependencies d
                      JOIN processing_queue dep ON dep.id = d.depends_on_task_id
                      WHERE d.dependent_task_id = q.id
                        AND ((d.dependency_type = 'success_only' AND dep.status <> 'completed')
                          OR (d.dependency_type = 'completion'
                              AND dep.status NOT IN ('completed', 'failed')))
                  )
                ORDER BY q.priority DESC, q.created_at ASC, q.id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE processing_queue q
            SET status = 'processing',
                started_at = COALESCE(q.started_at, $1),
                locked_by = $2,
                locked_at = $1,
                lock_expires_at = $3,
                next_retry_at = NULL
            FROM next
            WHERE q.id = next.id
            RETURNING {TASK_COLUMNS_Q}
            "#
        ))
        .bind(now)
        .bind(server_id)
        .bind(expires)
        .bind(capabilities)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
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
        let now = Utc::now();
        let expires = now + chrono_lease(lease)?;
        let clamped = progress_percentage.clamp(0, 100);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET progress_percentage = GREATEST(progress_percentage, $3),
                current_step = $4,
                progress_message = $5,
                lock_expires_at = $6
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
              AND lock_expires_at > $7
            "#,
        )
        .bind(task_id)
        .bind(server_id)
        .bind(clamped)
        .bind(current_step)
        .bind(message)
        .bind(expires)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::append_progress_step(
            &mut tx,
            task_id,
            current_step,
            step_status,
            clamped,
            Some(message),
            step_data.as_ref(),
        )
        .await?;

        tx.commit().await?;
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
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Lease check under a row lock: a reclaimed task's stale worker
        // matches zero rows here and must not overwrite the newer state.
        let row = sqlx::query(
            r#"
            SELECT document_id, retry_count, max_retries
            FROM processing_queue
            WHERE id = $1
              AND status = 'processing'
              AND locked_by = $2
              AND lock_expires_at > $3
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .bind(server_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let document_id: i64 = row.try_get("document_id")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;

        if success {
            sqlx::query(
                r#"
                UPDATE processing_queue
                SET status = 'completed',
                    completed_at = $2,
                    results_file_path = COALESCE($3, results_file_path),
                    progress_percentage = 100,
                    current_step = 'completed',
                    processing_metadata = COALESCE($4, processing_metadata),
                    locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(now)
            .bind(results_path)
            .bind(&metadata)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE project_documents SET processing_status = 'completed', results_file_path = COALESCE($2, results_file_path) WHERE id = $1",
            )
            .bind(document_id)
            .bind(results_path)
            .execute(&mut *tx)
            .await?;

            Self::append_progress_step(
                &mut tx,
                task_id,
                "completed",
                StepStatus::Completed,
                100,
                None,
                None,
            )
            .await?;
        } else {
            let error = error_message.map(truncate_error);
            let new_retry_count = (retry_count + 1).min(max_retries);

            if new_retry_count < max_retries {
                let delay = backoff.delay_for(new_retry_count);
                let next_retry_at = now + chrono_lease(delay)?;

                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'retry',
                        retry_count = $2,
                        error_count = error_count + 1,
                        next_retry_at = $3,
                        last_error = $4,
                        processing_metadata = COALESCE($5, processing_metadata),
                        locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(new_retry_count)
                .bind(next_retry_at)
                .bind(&error)
                .bind(&metadata)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'failed',
                        completed_at = $2,
                        retry_count = $3,
                        error_count = error_count + 1,
                        last_error = $4,
                        processing_metadata = COALESCE($5, processing_metadata),
                        locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(now)
                .bind(new_retry_count)
                .bind(&error)
                .bind(&metadata)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE project_documents SET processing_status = 'failed' WHERE id = $1",
                )
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
            }

            Self::append_progress_step(
                &mut tx,
                task_id,
                "failed",
                StepStatus::Failed,
                0,
                error.as_deref(),
                None,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn cleanup_expired_locks(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = CASE WHEN retry_count > 0 THEN 'retry' ELSE 'queued' END,
                locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
            WHERE status = 'processing' AND lock_expires_at < $1
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn retry_failed_task(&self, task_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = 'retry', next_retry_at = $2, completed_at = NULL
            WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
            "#,
        )
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn failed_retryable_tasks(&self, max_age_hours: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM processing_queue
            WHERE status = 'failed'
              AND retry_count < max_retries
              AND created_at > $1 - make_interval(hours => $2::int)
            ORDER BY id
            "#,
        )
        .bind(Utc::now())
        .bind(max_age_hours as i32)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Ok(r.try_get::<i64, _>("id")?)).collect()
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM processing_queue WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn task_progress(&self, document_id: i64) -> Result<Option<TaskProgress>> {
        let row = sqlx::query(
            r#"
            SELECT progress_percentage, current_step, progress_message, status,
                   started_at, retry_count
            FROM processing_queue
            WHERE document_id = $1 AND status IN ('queued', 'processing', 'retry')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let status: String = row.try_get("status")?;
        let current_step: Option<String> = row.try_get("current_step")?;
        let message: Option<String> = row.try_get("progress_message")?;

        Ok(Some(TaskProgress {
            progress_percentage: row.try_get("progress_percentage")?,
            current_step: current_step.unwrap_or_else(|| "Queued for processing".to_string()),
            message: message.unwrap_or_else(|| "Task queued".to_string()),
            status: TaskStatus::from_str(&status).map_err(|e| anyhow!(e))?,
            started_at: row.try_get("started_at")?,
            retry_count: row.try_get("retry_count")?,
        }))
    }

    async fn queue_stats(&self) -> Result<BTreeMap<String, StatusStats>> {
        let rows = sqlx::query(
            r#"
            SELECT status,
                   COUNT(*) AS count,
                   AVG(EXTRACT(EPOCH FROM ($1 - created_at)))::double precision AS avg_age_seconds
            FROM processing_queue
            WHERE created_at > $1 - INTERVAL '24 hours'
            GROUP BY status
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            stats.insert(
                status,
                StatusStats {
                    count: row.try_get("count")?,
                    avg_age_seconds: row.try_get("avg_age_seconds")?,
                },
            );
        }
        Ok(stats)
    }

    // ── Server registry ──

    async fn register_server(&self, registration: &ServerRegistration) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM processing_servers WHERE last_heartbeat < $1 - INTERVAL '1 hour'",
        )
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO processing_servers
                (id, server_type, status, last_heartbeat, capabilities,
                 current_load, max_concurrent_tasks)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                server_type = EXCLUDED.server_type,
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                capabilities = EXCLUDED.capabilities,
                current_load = EXCLUDED.current_load,
                max_concurrent_tasks = EXCLUDED.max_concurrent_tasks
            "#,
        )
        .bind(&registration.id)
        .bind(registration.server_type.as_str())
        .bind(registration.status.as_str())
        .bind(registration.last_heartbeat)
        .bind(&registration.capabilities)
        .bind(registration.current_load)
        .bind(registration.max_concurrent_tasks)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn heartbeat(&self, server_id: &str, current_load: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_servers
            SET last_heartbeat = $2, current_load = $3, status = 'active'
            WHERE id = $1
            "#,
        )
        .bind(server_id)
        .bind(Utc::now())
        .bind(current_load)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ── Dependencies ──

    async fn add_dependency(
        &self,
        dependent_task_id: i64,
        depends_on_task_id: i64,
        dependency_type: DependencyType,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_dependencies (dependent_task_id, depends_on_task_id, dependency_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (dependent_task_id, depends_on_task_id) DO NOTHING
            "#,
        )
        .bind(dependent_task_id)
        .bind(depends_on_task_id)
        .bind(dependency_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── External document ──

    async fn set_document_status(
        &self,
        document_id: i64,
        status: DocumentStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE project_documents SET processing_status = $2 WHERE id = $1")
                .bind(document_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_progress_callback(
        &self,
        document_id: i64,
        progress_percentage: i32,
        current_step: &str,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processing_queue
            SET progress_percentage = GREATEST(progress_percentage, $2),
                current_step = $3,
                progress_message = $4
            WHERE document_id = $1 AND status = 'processing'
            "#,
        )
        .bind(document_id)
        .bind(progress_percentage.clamp(0, 100))
        .bind(current_step)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_deck_results(
        &self,
        document_id: i64,
        results_file_path: &str,
        status: DocumentStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let queue_status = match status {
            DocumentStatus::Completed => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE project_documents SET processing_status = $2, results_file_path = $3 WHERE id = $1",
        )
        .bind(document_id)
        .bind(status.as_str())
        .bind(results_file_path)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE processing_queue
            SET status = $2,
                completed_at = $3,
                results_file_path = $4,
                progress_percentage = 100,
                current_step = 'Analysis Complete',
                progress_message = 'Document analysis completed',
                locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
            WHERE document_id = $1 AND status = 'processing'
            "#,
        )
        .bind(document_id)
        .bind(queue_status.as_str())
        .bind(now)
        .bind(results_file_path)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Phase result caches ──

    async fn latest_visual_analysis(
        &self,
        document_id: i64,
    ) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT analysis_result_json FROM visual_analysis_cache
            WHERE document_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<serde_json::Value, _>("analysis_result_json"))
            .transpose()?)
    }

    async fn save_slide_feedback(
        &self,
        document_id: i64,
        slide_number: i32,
        slide_filename: &str,
        feedback_text: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO slide_feedback
                (document_id, slide_number, slide_filename, feedback_text, feedback_type)
            VALUES ($1, $2, $3, $4, 'ai_analysis')
            ON CONFLICT (document_id, slide_number) DO UPDATE SET
                slide_filename = EXCLUDED.slide_filename,
                feedback_text = EXCLUDED.feedback_text,
                created_at = now()
            "#,
        )
        .bind(document_id)
        .bind(slide_number)
        .bind(slide_filename)
        .bind(feedback_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_specialized_results(
        &self,
        document_id: i64,
        results: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM specialized_analysis_results WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let mut saved = 0usize;
        for (analysis_type, analysis_result) in results {
            if analysis_result.trim().is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO specialized_analysis_results
                    (document_id, analysis_type, analysis_result)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(document_id)
            .bind(analysis_type)
            .bind(analysis_result)
            .execute(&mut *tx)
            .await?;
            saved += 1;
        }

        tx.commit().await?;
        Ok(saved)
    }

    async fn upsert_template_results(
        &self,
        document_id: i64,
        experiment_name: &str,
        results: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id FROM extraction_experiments
            WHERE document_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) => {
                let experiment_id: i64 = row.try_get("id")?;
                sqlx::query(
                    r#"
                    UPDATE extraction_experiments
                    SET template_processing_results_json = $2,
                        template_processing_completed_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(experiment_id)
                .bind(results)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO extraction_experiments
                        (document_id, experiment_name, extraction_type, text_model_used,
                         results_json, template_processing_results_json,
                         template_processing_completed_at)
                    VALUES ($1, $2, 'startup_upload', 'auto', '{}'::jsonb, $3, $4)
                    "#,
                )
                .bind(document_id)
                .bind(experiment_name)
                .bind(results)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // ── Model / prompt configuration ──

    async fn active_vision_model(&self) -> Result<Option<String>> {
        self.active_model("vision").await
    }

    async fn active_text_model(&self) -> Result<Option<String>> {
        self.active_model("text").await
    }

    async fn active_prompt(&self, stage_name: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT prompt_text FROM pipeline_prompts
            WHERE stage_name = $1 AND is_active = true
            LIMIT 1
            "#,
        )
        .bind(stage_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<String, _>("prompt_text"))
            .transpose()?)
    }

    async fn default_template_id(&self) -> Result<Option<i64>> {
        let row =
            sqlx::query("SELECT id FROM analysis_templates WHERE is_default = true LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.try_get::<i64, _>("id")).transpose()?)
    }
}

impl PostgresPipelineStore {
    async fn active_model(&self, model_type: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT model_name FROM model_configs
            WHERE model_type = $1 AND is_active = true
            LIMIT 1
            "#,
        )
        .bind(model_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<String, _>("model_name"))
            .transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_caps_at_2kb() {
        let long = "x".repeat(5000);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.len(), 2048);

        let short = "boom";
        assert_eq!(truncate_error(short), "boom");
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let mut s = "a".repeat(2047);
        s.push('ü');
        s.push_str(&"b".repeat(100));
        let truncated = truncate_error(&s);
        assert!(truncated.len() <= 2048);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
