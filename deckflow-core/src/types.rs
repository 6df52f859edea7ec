use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ─── Task status / priority / type ────────────────────────────

/// Lifecycle state of a queue row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retry,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Active states count toward the one-active-task-per-document rule.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Retry)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dequeue priority. Higher values are leased first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            3 => Self::Urgent,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Kind of work a task represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PdfAnalysis,
    SpecializedClinical,
    SpecializedRegulatory,
    SpecializedScience,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfAnalysis => "pdf_analysis",
            Self::SpecializedClinical => "specialized_clinical",
            Self::SpecializedRegulatory => "specialized_regulatory",
            Self::SpecializedScience => "specialized_science",
        }
    }

    pub fn is_specialized(&self) -> bool {
        !matches!(self, Self::PdfAnalysis)
    }

    /// The dependent task types fanned out after a successful pdf_analysis.
    pub fn specialized_types() -> [TaskType; 3] {
        [
            Self::SpecializedClinical,
            Self::SpecializedRegulatory,
            Self::SpecializedScience,
        ]
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf_analysis" => Ok(Self::PdfAnalysis),
            "specialized_clinical" => Ok(Self::SpecializedClinical),
            "specialized_regulatory" => Ok(Self::SpecializedRegulatory),
            "specialized_science" => Ok(Self::SpecializedScience),
            _ => Err(format!("unknown task type: {s}")),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Task row ─────────────────────────────────────────────────

/// One unit of document-processing work, as persisted in the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub document_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub file_path: String,
    pub company_id: String,
    /// Opaque JSON bag. Unknown keys pass through untouched; typed access
    /// happens at the boundaries via [`ProcessingOptions`].
    pub processing_options: serde_json::Value,
    pub progress_percentage: i32,
    pub current_step: Option<String>,
    pub progress_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub results_file_path: Option<String>,
    pub processing_metadata: Option<serde_json::Value>,
}

/// Parameters for enqueueing a task.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub document_id: i64,
    pub file_path: String,
    pub company_id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub processing_options: serde_json::Value,
    pub max_retries: i32,
}

impl NewTask {
    pub fn new(
        document_id: i64,
        file_path: impl Into<String>,
        company_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id,
            file_path: file_path.into(),
            company_id: company_id.into(),
            task_type: TaskType::PdfAnalysis,
            priority: TaskPriority::Normal,
            processing_options: serde_json::Value::Object(Default::default()),
            max_retries: 3,
        }
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.processing_options = options;
        self
    }
}

/// Result of an enqueue call. Enqueueing a document that already has an
/// active task returns the existing id instead of inserting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(i64),
    Existing(i64),
}

impl EnqueueOutcome {
    pub fn task_id(&self) -> i64 {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }
}

// ─── Processing options (typed boundary access) ───────────────

/// Typed view over the opaque `processing_options` bag.
pub struct ProcessingOptions<'a>(&'a serde_json::Value);

impl<'a> ProcessingOptions<'a> {
    pub fn new(raw: &'a serde_json::Value) -> Self {
        Self(raw)
    }

    pub fn use_single_template(&self) -> bool {
        self.0
            .get("use_single_template")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn selected_template_id(&self) -> Option<i64> {
        self.0.get("selected_template_id").and_then(|v| v.as_i64())
    }

    pub fn generate_thumbnails(&self) -> bool {
        self.0
            .get("generate_thumbnails")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn user_id(&self) -> Option<i64> {
        self.0.get("user_id").and_then(|v| v.as_i64())
    }

    pub fn project_id(&self) -> Option<i64> {
        self.0.get("project_id").and_then(|v| v.as_i64())
    }
}

// ─── Progress log ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Append-only record of a phase boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressStep {
    pub task_id: i64,
    pub step_name: String,
    pub step_status: StepStatus,
    pub progress_percentage: i32,
    pub message: Option<String>,
    pub step_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ─── Server registry ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Cpu,
    Gpu,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Maintenance => "maintenance",
        }
    }
}

/// Liveness record for one orchestrator/worker process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub id: String,
    pub server_type: ServerType,
    pub status: ServerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: serde_json::Value,
    pub current_load: i32,
    pub max_concurrent_tasks: i32,
}

// ─── Task dependencies ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Satisfied once the dependency is in any terminal state.
    Completion,
    /// Satisfied only by a completed dependency.
    SuccessOnly,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::SuccessOnly => "success_only",
        }
    }

    /// Whether a dependency in `status` releases the dependent task.
    pub fn satisfied_by(&self, status: TaskStatus) -> bool {
        match self {
            Self::Completion => status.is_terminal(),
            Self::SuccessOnly => status == TaskStatus::Completed,
        }
    }
}

/// Directed edge: `dependent_task_id` waits on `depends_on_task_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDependency {
    pub dependent_task_id: i64,
    pub depends_on_task_id: i64,
    pub dependency_type: DependencyType,
}

// ─── External document ────────────────────────────────────────

/// The only field of the external document entity the core touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown document status: {s}")),
        }
    }
}

// ─── UI progress view / queue stats ───────────────────────────

/// Latest progress of a document's active task, for UI polling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskProgress {
    pub progress_percentage: i32,
    pub current_step: String,
    pub message: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusStats {
    pub count: i64,
    pub avg_age_seconds: Option<f64>,
}

/// Per-status counts over the trailing 24 hours, plus worker identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    pub by_status: BTreeMap<String, StatusStats>,
    pub server_id: String,
    pub running_tasks: usize,
    pub max_concurrent: usize,
}

// ─── Retry backoff ────────────────────────────────────────────

/// Exponential backoff schedule: `min(base * 2^(n-1), cap)` with ±20% jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_frac: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
            jitter_frac: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Nominal (unjittered) delay before the nth retry, n >= 1.
    pub fn nominal_delay(&self, retry_count: i32) -> Duration {
        let n = retry_count.max(1) as u32;
        let factor = 2u64.saturating_pow(n - 1);
        let secs = self.base.as_secs().saturating_mul(factor);
        Duration::from_secs(secs.min(self.cap.as_secs()))
    }

    /// Jittered delay before the nth retry.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        use rand::Rng;
        let nominal = self.nominal_delay(retry_count).as_secs_f64();
        let spread = nominal * self.jitter_frac;
        let jittered = rand::thread_rng().gen_range(nominal - spread..=nominal + spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn task_status_round_trip() {
        for s in ["queued", "processing", "completed", "failed", "retry"] {
            assert_eq!(TaskStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::from_str("unknown").is_err());
    }

    #[test]
    fn active_and_terminal_are_disjoint() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Retry,
        ] {
            assert_ne!(status.is_active(), status.is_terminal());
        }
    }

    #[test]
    fn priority_ordering_matches_values() {
        assert!(TaskPriority::Urgent.as_i32() > TaskPriority::High.as_i32());
        assert!(TaskPriority::High.as_i32() > TaskPriority::Normal.as_i32());
        assert_eq!(TaskPriority::from_i32(2), TaskPriority::High);
        assert_eq!(TaskPriority::from_i32(0), TaskPriority::Normal);
    }

    #[test]
    fn options_typed_access_and_passthrough() {
        let raw = serde_json::json!({
            "use_single_template": true,
            "selected_template_id": 12,
            "user_id": 7,
            "custom_future_key": {"nested": [1, 2, 3]}
        });
        let opts = ProcessingOptions::new(&raw);
        assert!(opts.use_single_template());
        assert_eq!(opts.selected_template_id(), Some(12));
        assert_eq!(opts.user_id(), Some(7));
        assert_eq!(opts.project_id(), None);
        // The bag itself is untouched by typed access.
        assert_eq!(raw.get("custom_future_key").unwrap()["nested"][2], 3);
    }

    #[test]
    fn dependency_satisfaction() {
        assert!(DependencyType::Completion.satisfied_by(TaskStatus::Failed));
        assert!(DependencyType::Completion.satisfied_by(TaskStatus::Completed));
        assert!(!DependencyType::Completion.satisfied_by(TaskStatus::Processing));
        assert!(DependencyType::SuccessOnly.satisfied_by(TaskStatus::Completed));
        assert!(!DependencyType::SuccessOnly.satisfied_by(TaskStatus::Failed));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(60));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(120));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(240));
        assert_eq!(policy.nominal_delay(10), Duration::from_secs(3600));
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for n in 1..=4 {
            let nominal = policy.nominal_delay(n).as_secs_f64();
            for _ in 0..50 {
                let d = policy.delay_for(n).as_secs_f64();
                assert!(d >= nominal * 0.8 - 1e-9, "delay {d} below bound for n={n}");
                assert!(d <= nominal * 1.2 + 1e-9, "delay {d} above bound for n={n}");
            }
        }
    }
}
