use crate::gpu::*;
use crate::queue::QueueManager;
use crate::store::PipelineStore;
use crate::types::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Backoff after an unexpected driver error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Driver-internal error. Phase failures carry the operator-facing message;
/// a lost lease means another worker owns the task now and this one must
/// walk away without writing anything further.
#[derive(Debug, thiserror::Error)]
enum DriveError {
    #[error("{message}")]
    Phase { message: String },

    #[error("lease lost for task {task_id}")]
    LeaseLost { task_id: i64 },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn phase_failure(phase: &str, err: &GpuError) -> DriveError {
    DriveError::Phase {
        message: format!("{phase} failed - {err}"),
    }
}

fn config_missing(phase: &str, what: &str) -> DriveError {
    DriveError::Phase {
        message: format!("{phase} failed - no {what} configured"),
    }
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Base URL of this backend, for callback URLs handed to the GPU.
    pub backend_base_url: String,
    /// Mount point shared with the GPU; relative file paths are joined here.
    pub shared_mount_path: String,
    pub poll_interval: Duration,
}

/// Advances one leased task at a time through the analysis phases. A worker
/// process runs several drivers in parallel, each pulling from the shared
/// queue.
pub struct PipelineDriver {
    store: Arc<dyn PipelineStore>,
    queue: Arc<QueueManager>,
    gpu: Arc<dyn GpuAnalysis>,
    config: DriverConfig,
}

impl PipelineDriver {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<QueueManager>,
        gpu: Arc<dyn GpuAnalysis>,
        config: DriverConfig,
    ) -> Self {
        Self {
            store,
            queue,
            gpu,
            config,
        }
    }

    /// Poll-process loop; returns when the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(server_id = %self.queue.server_id(), "pipeline driver started");

        loop {
            if *shutdown.borrow() {
                info!("pipeline driver shutting down");
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("pipeline driver shutting down");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "error in pipeline driver loop");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Lease and fully process one task. Returns Ok(false) when the queue
    /// had nothing eligible.
    pub async fn process_next(&self) -> anyhow::Result<bool> {
        let Some(task) = self.queue.next_task().await? else {
            return Ok(false);
        };

        self.queue.task_started();
        let result = self.process_task(&task).await;
        self.queue.task_finished();
        result?;
        Ok(true)
    }

    async fn process_task(&self, task: &Task) -> anyhow::Result<()> {
        info!(task_id = task.id, document_id = task.document_id,
            task_type = %task.task_type, "processing task");

        let outcome = match task.task_type {
            TaskType::PdfAnalysis => self.run_pdf_analysis(task).await,
            _ => self.run_specialized_task(task).await,
        };

        match outcome {
            Ok(()) => {
                if task.task_type == TaskType::PdfAnalysis {
                    self.queue
                        .complete_task_and_create_specialized(
                            task.id,
                            task.document_id,
                            true,
                            None,
                            None,
                            None,
                        )
                        .await?;
                } else {
                    self.queue
                        .complete_task(task.id, true, None, None, None)
                        .await?;
                }
                Ok(())
            }
            Err(DriveError::Phase { message }) => {
                self.fail_task_with_error(task, &message).await
            }
            Err(DriveError::LeaseLost { task_id }) => {
                warn!(task_id, "lease lost mid-phase, abandoning task to its new owner");
                Ok(())
            }
            Err(DriveError::Store(e)) => Err(e),
        }
    }

    /// Mark the task failed; retry scheduling and document sync happen in
    /// the store.
    async fn fail_task_with_error(&self, task: &Task, message: &str) -> anyhow::Result<()> {
        error!(task_id = task.id, document_id = task.document_id, error = message,
            "failing task");
        self.queue
            .complete_task(task.id, false, None, Some(message), None)
            .await?;
        Ok(())
    }

    /// Lease-guarded progress write; converts a rejected write into
    /// [`DriveError::LeaseLost`].
    async fn progress(
        &self,
        task_id: i64,
        percentage: i32,
        step: &str,
        message: &str,
        step_status: StepStatus,
    ) -> Result<(), DriveError> {
        let held = self
            .queue
            .update_task_progress(task_id, percentage, step, message, step_status)
            .await?;
        if held {
            Ok(())
        } else {
            Err(DriveError::LeaseLost { task_id })
        }
    }

    fn full_file_path(&self, file_path: &str) -> String {
        if file_path.starts_with('/') {
            file_path.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.shared_mount_path.trim_end_matches('/'),
                file_path
            )
        }
    }

    fn callback_url(&self, endpoint: &str) -> String {
        format!("{}/api/internal/{endpoint}", self.config.backend_base_url)
    }

    // ── pdf_analysis: the four-phase ladder ──

    async fn run_pdf_analysis(&self, task: &Task) -> Result<(), DriveError> {
        self.progress(
            task.id,
            5,
            "Sending to GPU",
            "Task picked up by queue processor",
            StepStatus::Started,
        )
        .await?;

        // Phase 1: visual analysis (10 -> 30)
        self.progress(
            task.id,
            10,
            "Visual Analysis",
            "Analyzing slides and extracting content",
            StepStatus::Started,
        )
        .await?;

        self.run_visual_analysis(task).await?;

        self.progress(
            task.id,
            30,
            "Visual Analysis Complete",
            "Slides analyzed, starting extraction",
            StepStatus::Completed,
        )
        .await?;

        // Phase 2: extraction (30 -> 60)
        self.progress(
            task.id,
            40,
            "Data Extraction",
            "Extracting company details and classification",
            StepStatus::Started,
        )
        .await?;

        self.run_extraction(task).await?;

        self.progress(
            task.id,
            60,
            "Extraction Complete",
            "Company data extracted, starting template analysis",
            StepStatus::Completed,
        )
        .await?;

        // Phase 3: template analysis (60 -> 80)
        self.progress(
            task.id,
            70,
            "Template Analysis",
            "Running analysis with review templates",
            StepStatus::Started,
        )
        .await?;

        self.run_template_analysis(task).await?;

        // Phase 4: specialized analysis (80 -> 95). Failures here are logged
        // and recorded, never fatal; the dependent specialized tasks get
        // another run later regardless.
        self.progress(
            task.id,
            80,
            "Specialized Analysis",
            "Running regulatory, clinical, and scientific analysis",
            StepStatus::Started,
        )
        .await?;

        if let Err(e) = self.run_specialized_analysis_call(task).await {
            warn!(task_id = task.id, document_id = task.document_id, error = %e,
                "specialized analysis phase failed, continuing");
            self.progress(
                task.id,
                80,
                "Specialized Analysis Failed",
                &e.to_string(),
                StepStatus::Failed,
            )
            .await?;
        }

        self.progress(
            task.id,
            95,
            "Analysis Complete",
            "Finalizing results",
            StepStatus::Completed,
        )
        .await?;

        Ok(())
    }

    async fn run_visual_analysis(&self, task: &Task) -> Result<(), DriveError> {
        let vision_model = self
            .store
            .active_vision_model()
            .await?
            .ok_or_else(|| config_missing("Visual analysis", "vision model"))?;

        let request = VisualAnalysisBatchRequest {
            deck_ids: vec![task.document_id],
            file_paths: vec![self.full_file_path(&task.file_path)],
            vision_model: vision_model.clone(),
        };

        self.gpu
            .run_visual_analysis_batch(&request)
            .await
            .map_err(|e| phase_failure("Visual analysis", &e))?;

        self.generate_slide_feedback(task, &vision_model).await
    }

    /// Per-slide feedback from the freshly written visual cache. A missing
    /// prompt is an operator problem and fails the phase; a missing cache
    /// blob or a per-slide upstream error is runtime noise and only logged.
    async fn generate_slide_feedback(
        &self,
        task: &Task,
        vision_model: &str,
    ) -> Result<(), DriveError> {
        let prompt = self
            .store
            .active_prompt("slide_feedback")
            .await?
            .ok_or_else(|| config_missing("Visual analysis", "slide_feedback prompt"))?;

        let Some(visual) = self.store.latest_visual_analysis(task.document_id).await? else {
            warn!(document_id = task.document_id,
                "no visual analysis cached, skipping slide feedback");
            return Ok(());
        };

        let slides = visual
            .get("visual_analysis_results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for slide in &slides {
            let slide_number = slide
                .get("page_number")
                .and_then(|v| v.as_i64())
                .unwrap_or(1) as i32;
            let image_path = slide
                .get("slide_image_path")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if image_path.is_empty() {
                warn!(document_id = task.document_id, slide_number,
                    "slide has no image path, skipping feedback");
                continue;
            }

            let request = AnalyzeImagesRequest {
                // The GPU joins relative paths onto the shared mount itself.
                images: vec![image_path.to_string()],
                prompt: prompt.replace("{slide_number}", &slide_number.to_string()),
                model: vision_model.to_string(),
                options: ImageOptions {
                    num_ctx: 32768,
                    temperature: 0.3,
                },
            };

            match self.gpu.analyze_images(&request).await {
                Ok(texts) => match texts.first().filter(|t| !t.is_empty()) {
                    Some(text) => {
                        self.store
                            .save_slide_feedback(task.document_id, slide_number, image_path, text)
                            .await?;
                    }
                    None => warn!(document_id = task.document_id, slide_number,
                        "empty feedback for slide"),
                },
                Err(e) => warn!(document_id = task.document_id, slide_number, error = %e,
                    "slide feedback generation failed"),
            }
        }

        Ok(())
    }

    async fn run_extraction(&self, task: &Task) -> Result<(), DriveError> {
        let text_model = self
            .store
            .active_text_model()
            .await?
            .ok_or_else(|| config_missing("Data extraction", "text model"))?;

        let request = ExtractionExperimentRequest {
            deck_ids: vec![task.document_id],
            experiment_name: format!("extraction_deck_{}", task.document_id),
            extraction_type: "all".to_string(),
            text_model,
            processing_options: ExtractionOptions::default(),
        };

        self.gpu
            .run_extraction_experiment(&request)
            .await
            .map_err(|e| phase_failure("Data extraction", &e))
    }

    async fn run_template_analysis(&self, task: &Task) -> Result<(), DriveError> {
        let options = ProcessingOptions::new(&task.processing_options);

        let template_id = if options.use_single_template() {
            options.selected_template_id()
        } else {
            None
        };
        let template_id = match template_id {
            Some(id) => {
                info!(document_id = task.document_id, template_id = id,
                    "using override template");
                id
            }
            None => self
                .store
                .default_template_id()
                .await?
                .ok_or_else(|| config_missing("Template analysis", "default analysis template"))?,
        };

        let request = TemplateProcessingRequest {
            deck_ids: vec![task.document_id],
            template_id,
            processing_options: CallbackOptions {
                generate_thumbnails: true,
                callback_url: self.callback_url("update-deck-results"),
            },
        };

        self.gpu
            .run_template_processing(&request)
            .await
            .map_err(|e| phase_failure("Template analysis", &e))
    }

    async fn run_specialized_analysis_call(&self, task: &Task) -> Result<(), DriveError> {
        let request = SpecializedAnalysisRequest {
            deck_ids: vec![task.document_id],
            processing_options: CallbackOptions {
                generate_thumbnails: false,
                callback_url: self.callback_url("update-deck-results"),
            },
        };

        self.gpu
            .run_specialized_analysis(&request)
            .await
            .map_err(|e| phase_failure("Specialized analysis", &e))
    }

    // ── specialized_* tasks: one-phase refinement runs ──

    async fn run_specialized_task(&self, task: &Task) -> Result<(), DriveError> {
        self.progress(
            task.id,
            10,
            "Specialized Analysis",
            "Regenerating specialized analysis results",
            StepStatus::Started,
        )
        .await?;

        // Unlike the in-task optional phase, this IS the task; errors fail it.
        self.run_specialized_analysis_call(task).await?;

        self.progress(
            task.id,
            95,
            "Analysis Complete",
            "Finalizing results",
            StepStatus::Completed,
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGpu {
        calls: Mutex<Vec<String>>,
        reject_extraction: AtomicBool,
        http_500_specialized: AtomicBool,
        last_template_request: Mutex<Option<TemplateProcessingRequest>>,
    }

    impl FakeGpu {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl GpuAnalysis for FakeGpu {
        async fn run_visual_analysis_batch(
            &self,
            _request: &VisualAnalysisBatchRequest,
        ) -> Result<(), GpuError> {
            self.record("visual");
            Ok(())
        }

        async fn run_extraction_experiment(
            &self,
            _request: &ExtractionExperimentRequest,
        ) -> Result<(), GpuError> {
            self.record("extraction");
            if self.reject_extraction.load(Ordering::Relaxed) {
                return Err(GpuError::Rejected {
                    message: "OOM".to_string(),
                });
            }
            Ok(())
        }

        async fn run_template_processing(
            &self,
            request: &TemplateProcessingRequest,
        ) -> Result<(), GpuError> {
            self.record("template");
            *self.last_template_request.lock().unwrap() = Some(request.clone());
            Ok(())
        }

        async fn run_specialized_analysis(
            &self,
            _request: &SpecializedAnalysisRequest,
        ) -> Result<(), GpuError> {
            self.record("specialized");
            if self.http_500_specialized.load(Ordering::Relaxed) {
                return Err(GpuError::Status {
                    status: 500,
                    body: "internal".to_string(),
                });
            }
            Ok(())
        }

        async fn analyze_images(
            &self,
            request: &AnalyzeImagesRequest,
        ) -> Result<Vec<String>, GpuError> {
            self.record("analyze_images");
            Ok(vec![format!("Feedback: {}", request.prompt)])
        }

        async fn health(&self) -> bool {
            true
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<QueueManager>,
        gpu: Arc<FakeGpu>,
        driver: PipelineDriver,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            ServerType::Cpu,
            Duration::from_secs(1800),
            BackoffPolicy::default(),
            3,
        ));
        let gpu = Arc::new(FakeGpu::default());
        let driver = PipelineDriver::new(
            store.clone(),
            queue.clone(),
            gpu.clone(),
            DriverConfig {
                backend_base_url: "http://backend:8000".to_string(),
                shared_mount_path: "/mnt/shared".to_string(),
                poll_interval: Duration::from_millis(10),
            },
        );
        Harness {
            store,
            queue,
            gpu,
            driver,
        }
    }

    async fn seed_config(store: &MemoryStore) {
        store.set_model("vision", "vision-model-a").await;
        store.set_model("text", "text-model-b").await;
        store
            .set_prompt("slide_feedback", "Review slide {slide_number}")
            .await;
        store.set_default_template(4).await;
    }

    async fn seed_visual_cache(store: &MemoryStore, document_id: i64) {
        store
            .insert_visual_cache(
                document_id,
                serde_json::json!({
                    "visual_analysis_results": [
                        {"page_number": 1, "slide_image_path": "slides/s1.png"},
                        {"page_number": 2, "slide_image_path": "slides/s2.png"},
                    ]
                }),
            )
            .await;
    }

    #[tokio::test]
    async fn happy_path_runs_all_phases_in_order() {
        let h = harness();
        seed_config(&h.store).await;
        seed_visual_cache(&h.store, 101).await;

        let t1 = h
            .queue
            .add_task(
                NewTask::new(101, "p/u/a.pdf", "acme")
                    .options(serde_json::json!({"use_single_template": false})),
            )
            .await
            .unwrap()
            .task_id();

        assert!(h.driver.process_next().await.unwrap());

        // Phase order as seen by the GPU.
        assert_eq!(
            h.gpu.calls(),
            vec![
                "visual",
                "analyze_images",
                "analyze_images",
                "extraction",
                "template",
                "specialized"
            ]
        );

        // Progress ladder, including the terminal completion step.
        let steps: Vec<(i32, String)> = h
            .store
            .progress_steps(t1)
            .await
            .into_iter()
            .map(|s| (s.progress_percentage, s.step_name))
            .collect();
        let expected: Vec<(i32, String)> = [
            (5, "Sending to GPU"),
            (10, "Visual Analysis"),
            (30, "Visual Analysis Complete"),
            (40, "Data Extraction"),
            (60, "Extraction Complete"),
            (70, "Template Analysis"),
            (80, "Specialized Analysis"),
            (95, "Analysis Complete"),
            (100, "completed"),
        ]
        .iter()
        .map(|(p, s)| (*p, s.to_string()))
        .collect();
        assert_eq!(steps, expected);

        let task = h.store.get_task(t1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_percentage, 100);
        assert_eq!(
            h.store.document_status(101).await,
            Some(DocumentStatus::Completed)
        );

        // Slide feedback persisted per slide.
        let feedback = h.store.slide_feedback_rows(101).await;
        assert_eq!(feedback.len(), 2);
        assert!(feedback[0].1.feedback_text.contains("Review slide 1"));

        // Default template used, callback URL built from the backend base.
        let template_req = h.gpu.last_template_request.lock().unwrap().clone().unwrap();
        assert_eq!(template_req.template_id, 4);
        assert_eq!(
            template_req.processing_options.callback_url,
            "http://backend:8000/api/internal/update-deck-results"
        );

        // The three specialized dependents are enqueued.
        let mut specialized = Vec::new();
        for id in [t1 + 1, t1 + 2, t1 + 3] {
            let task = h.store.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Queued);
            specialized.push(task.task_type);
        }
        assert_eq!(specialized, TaskType::specialized_types().to_vec());
    }

    #[tokio::test]
    async fn extraction_rejection_walks_the_retry_ladder() {
        let h = harness();
        seed_config(&h.store).await;
        seed_visual_cache(&h.store, 102).await;
        h.gpu.reject_extraction.store(true, Ordering::Relaxed);

        let t = h
            .queue
            .add_task(NewTask::new(102, "p/u/b.pdf", "acme"))
            .await
            .unwrap()
            .task_id();

        for expected_retry in 1..=2 {
            assert!(h.driver.process_next().await.unwrap());
            let task = h.store.get_task(t).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Retry);
            assert_eq!(task.retry_count, expected_retry);
            h.store.advance_clock(Duration::from_secs(600)).await;
        }

        assert!(h.driver.process_next().await.unwrap());
        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        let last_error = task.last_error.unwrap();
        assert!(last_error.contains("Data extraction failed"));
        assert!(last_error.contains("OOM"));
        assert_eq!(
            h.store.document_status(102).await,
            Some(DocumentStatus::Failed)
        );
    }

    #[tokio::test]
    async fn specialized_phase_failure_is_swallowed() {
        let h = harness();
        seed_config(&h.store).await;
        seed_visual_cache(&h.store, 103).await;
        h.gpu.http_500_specialized.store(true, Ordering::Relaxed);

        let t = h
            .queue
            .add_task(NewTask::new(103, "p/u/c.pdf", "acme"))
            .await
            .unwrap()
            .task_id();

        assert!(h.driver.process_next().await.unwrap());

        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_percentage, 100);

        // The failure is visible in the step log but nowhere user-facing.
        let steps = h.store.progress_steps(t).await;
        assert!(steps
            .iter()
            .any(|s| s.step_name == "Specialized Analysis Failed"
                && s.step_status == StepStatus::Failed));
        assert!(task.last_error.is_none());
    }

    #[tokio::test]
    async fn missing_vision_model_fails_without_touching_the_gpu() {
        let h = harness();
        // No models, prompts, or templates configured at all.

        let t = h
            .queue
            .add_task(NewTask::new(104, "p/u/d.pdf", "acme"))
            .await
            .unwrap()
            .task_id();

        assert!(h.driver.process_next().await.unwrap());

        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(
            task.last_error.as_deref(),
            Some("Visual analysis failed - no vision model configured")
        );
        assert_eq!(h.gpu.calls(), Vec::<String>::new());

        // Retries cannot succeed until an operator intervenes; the bound
        // eventually moves the task to failed.
        for _ in 0..2 {
            h.store.advance_clock(Duration::from_secs(600)).await;
            assert!(h.driver.process_next().await.unwrap());
        }
        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn template_override_beats_the_default() {
        let h = harness();
        seed_config(&h.store).await;
        seed_visual_cache(&h.store, 105).await;

        h.queue
            .add_task(
                NewTask::new(105, "p/u/e.pdf", "acme").options(serde_json::json!({
                    "use_single_template": true,
                    "selected_template_id": 12,
                })),
            )
            .await
            .unwrap();

        assert!(h.driver.process_next().await.unwrap());
        let template_req = h.gpu.last_template_request.lock().unwrap().clone().unwrap();
        assert_eq!(template_req.template_id, 12);
    }

    #[tokio::test]
    async fn missing_default_template_fails_the_template_phase() {
        let h = harness();
        h.store.set_model("vision", "vision-model-a").await;
        h.store.set_model("text", "text-model-b").await;
        h.store.set_prompt("slide_feedback", "Review {slide_number}").await;
        // No default template and no override.
        seed_visual_cache(&h.store, 106).await;

        let t = h
            .queue
            .add_task(NewTask::new(106, "p/u/f.pdf", "acme"))
            .await
            .unwrap()
            .task_id();

        assert!(h.driver.process_next().await.unwrap());
        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(
            task.last_error.as_deref(),
            Some("Template analysis failed - no default analysis template configured")
        );
    }

    #[tokio::test]
    async fn specialized_task_fails_hard_on_upstream_error() {
        let h = harness();
        seed_config(&h.store).await;
        h.gpu.http_500_specialized.store(true, Ordering::Relaxed);

        let t = h
            .queue
            .add_task(
                NewTask::new(107, "p/u/g.pdf", "acme")
                    .task_type(TaskType::SpecializedClinical),
            )
            .await
            .unwrap()
            .task_id();

        assert!(h.driver.process_next().await.unwrap());
        let task = h.store.get_task(t).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert!(task
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("Specialized analysis failed - HTTP 500"));
    }

    #[tokio::test]
    async fn relative_paths_are_joined_onto_the_shared_mount() {
        let h = harness();
        assert_eq!(
            h.driver.full_file_path("p/u/a.pdf"),
            "/mnt/shared/p/u/a.pdf"
        );
        assert_eq!(h.driver.full_file_path("/abs/a.pdf"), "/abs/a.pdf");
    }
}
