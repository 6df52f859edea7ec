//! Internal ingestion endpoints the GPU worker calls back into.
//!
//! - `POST /api/internal/update-processing-progress` - incremental progress
//! - `POST /api/internal/save-specialized-analysis` - per-analysis results
//! - `POST /api/internal/save-template-processing` - per-chapter results
//! - `POST /api/internal/update-deck-results` - legacy combined sink
//! - `GET  /api/internal/queue-stats` - operator visibility
//!
//! The GPU is a fire-and-forget caller: a callback that references an
//! unknown or no-longer-processing document gets a 200 with a logged
//! warning, never a 5xx.

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use deckflow_core::queue::QueueManager;
use deckflow_core::store::PipelineStore;
use deckflow_core::types::DocumentStatus;

// ============================================================================
// State
// ============================================================================

/// Shared state for the internal routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub queue: Arc<QueueManager>,
}

// ============================================================================
// Progress callback
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ProgressUpdateRequest {
    pub document_id: i64,
    pub progress_percentage: i32,
    pub current_step: String,
    pub progress_message: String,
    /// 'visual_analysis', 'extraction', 'template_analysis', ...
    #[serde(default)]
    pub phase: Option<String>,
}

/// POST /api/internal/update-processing-progress
///
/// Incremental progress pushed by the GPU mid-phase. Out-of-order callbacks
/// are tolerated (the stored percentage never decreases).
async fn update_processing_progress(
    State(state): State<AppState>,
    Json(req): Json<ProgressUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state
        .store
        .record_progress_callback(
            req.document_id,
            req.progress_percentage,
            &req.current_step,
            &req.progress_message,
        )
        .await?;

    if !updated {
        tracing::warn!(
            document_id = req.document_id,
            phase = req.phase.as_deref().unwrap_or("unknown"),
            "progress callback for document with no in-flight task"
        );
        return Ok(Json(serde_json::json!({
            "success": true,
            "warning": "no processing task found for document",
            "document_id": req.document_id,
        })));
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "document_id": req.document_id,
        "progress_percentage": req.progress_percentage,
        "current_step": req.current_step,
    })))
}

// ============================================================================
// Specialized analysis results
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SpecializedAnalysisSaveRequest {
    pub document_id: i64,
    /// analysis_type -> result text, e.g. {"clinical_validation": "..."}
    pub specialized_analysis: BTreeMap<String, String>,
}

/// POST /api/internal/save-specialized-analysis
///
/// Replace-all semantics: existing rows for the document are dropped and one
/// row is inserted per non-empty analysis. Last writer wins.
async fn save_specialized_analysis(
    State(state): State<AppState>,
    Json(req): Json<SpecializedAnalysisSaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let saved = state
        .store
        .replace_specialized_results(req.document_id, &req.specialized_analysis)
        .await?;

    tracing::info!(
        document_id = req.document_id,
        saved,
        "saved specialized analysis results"
    );

    Ok(Json(serde_json::json!({
        "success": true,
        "document_id": req.document_id,
        "saved_analyses": saved,
    })))
}

// ============================================================================
// Template processing results
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TemplateProcessingSaveRequest {
    pub experiment_name: String,
    pub document_id: i64,
    pub template_processing_results: serde_json::Value,
}

/// POST /api/internal/save-template-processing
///
/// Attach template results to the document's most recent extraction
/// experiment, creating one when absent.
async fn save_template_processing(
    State(state): State<AppState>,
    Json(req): Json<TemplateProcessingSaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .upsert_template_results(
            req.document_id,
            &req.experiment_name,
            &req.template_processing_results,
        )
        .await?;

    tracing::info!(
        document_id = req.document_id,
        experiment_name = %req.experiment_name,
        "saved template processing results"
    );

    Ok(Json(serde_json::json!({
        "success": true,
        "document_id": req.document_id,
        "experiment_name": req.experiment_name,
    })))
}

// ============================================================================
// Legacy combined sink
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DeckResultsUpdateRequest {
    pub document_id: i64,
    pub results_file_path: String,
    pub processing_status: String,
}

/// POST /api/internal/update-deck-results
///
/// Updates the document row and the in-flight queue row in one transaction.
async fn update_deck_results(
    State(state): State<AppState>,
    Json(req): Json<DeckResultsUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = DocumentStatus::from_str(&req.processing_status)
        .map_err(ApiError::BadRequest)?;

    state
        .store
        .update_deck_results(req.document_id, &req.results_file_path, status)
        .await?;

    tracing::info!(
        document_id = req.document_id,
        results_file_path = %req.results_file_path,
        status = %req.processing_status,
        "deck results updated"
    );

    Ok(Json(serde_json::json!({
        "success": true,
        "document_id": req.document_id,
        "results_file_path": req.results_file_path,
        "processing_status": req.processing_status,
    })))
}

// ============================================================================
// Queue stats
// ============================================================================

/// GET /api/internal/queue-stats
async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.queue.get_queue_stats().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "queue_stats": stats.by_status,
        "server_id": stats.server_id,
        "running_tasks": stats.running_tasks,
        "max_concurrent": stats.max_concurrent,
    })))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Store(anyhow::Error),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Store(e)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store error in internal endpoint");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (
            status,
            Json(serde_json::json!({ "success": false, "error": message })),
        )
            .into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the internal ingestion router.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/internal/update-processing-progress",
            post(update_processing_progress),
        )
        .route(
            "/api/internal/save-specialized-analysis",
            post(save_specialized_analysis),
        )
        .route(
            "/api/internal/save-template-processing",
            post(save_template_processing),
        )
        .route("/api/internal/update-deck-results", post(update_deck_results))
        .route("/api/internal/queue-stats", get(queue_stats))
        .with_state(state)
}
