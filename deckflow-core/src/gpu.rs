use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Request shapes ───────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisualAnalysisBatchRequest {
    pub deck_ids: Vec<i64>,
    pub file_paths: Vec<String>,
    pub vision_model: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionOptions {
    pub do_classification: bool,
    pub extract_company_name: bool,
    pub extract_funding_amount: bool,
    pub extract_deck_date: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            do_classification: true,
            extract_company_name: true,
            extract_funding_amount: true,
            extract_deck_date: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionExperimentRequest {
    pub deck_ids: Vec<i64>,
    pub experiment_name: String,
    pub extraction_type: String,
    pub text_model: String,
    pub processing_options: ExtractionOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackOptions {
    pub generate_thumbnails: bool,
    pub callback_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateProcessingRequest {
    pub deck_ids: Vec<i64>,
    pub template_id: i64,
    pub processing_options: CallbackOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpecializedAnalysisRequest {
    pub deck_ids: Vec<i64>,
    pub processing_options: CallbackOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageOptions {
    pub num_ctx: u32,
    pub temperature: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzeImagesRequest {
    pub images: Vec<String>,
    pub prompt: String,
    pub model: String,
    pub options: ImageOptions,
}

// ─── Error normalization ──────────────────────────────────────

/// Upstream failure, normalized. A 2xx carrying `success: false` is an
/// application rejection, distinct from transport trouble.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{message}")]
    Rejected { message: String },
}

// ─── Client seam ──────────────────────────────────────────────

/// The GPU worker's HTTP surface, behind a trait so the pipeline driver is
/// testable against a scripted fake.
#[async_trait]
pub trait GpuAnalysis: Send + Sync {
    async fn run_visual_analysis_batch(
        &self,
        request: &VisualAnalysisBatchRequest,
    ) -> Result<(), GpuError>;

    async fn run_extraction_experiment(
        &self,
        request: &ExtractionExperimentRequest,
    ) -> Result<(), GpuError>;

    async fn run_template_processing(
        &self,
        request: &TemplateProcessingRequest,
    ) -> Result<(), GpuError>;

    async fn run_specialized_analysis(
        &self,
        request: &SpecializedAnalysisRequest,
    ) -> Result<(), GpuError>;

    /// Vision analysis of individual images; returns one text per image.
    async fn analyze_images(&self, request: &AnalyzeImagesRequest)
        -> Result<Vec<String>, GpuError>;

    async fn health(&self) -> bool;
}

// ─── Production client ────────────────────────────────────────

const VISUAL_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(300);
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(120);
const TEMPLATE_TIMEOUT: Duration = Duration::from_secs(600);
const SPECIALIZED_TIMEOUT: Duration = Duration::from_secs(600);
const ANALYZE_IMAGES_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin reqwest wrapper over the GPU service.
pub struct HttpGpuClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGpuClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// POST a JSON body, normalize the `{success, error?}` envelope, and
    /// return the parsed payload.
    async fn post_envelope<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<serde_json::Value, GpuError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GpuError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let success = payload
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !success {
            let message = payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown upstream error")
                .to_string();
            return Err(GpuError::Rejected { message });
        }

        Ok(payload)
    }
}

#[async_trait]
impl GpuAnalysis for HttpGpuClient {
    async fn run_visual_analysis_batch(
        &self,
        request: &VisualAnalysisBatchRequest,
    ) -> Result<(), GpuError> {
        self.post_envelope(
            "/api/run-visual-analysis-batch",
            request,
            VISUAL_ANALYSIS_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn run_extraction_experiment(
        &self,
        request: &ExtractionExperimentRequest,
    ) -> Result<(), GpuError> {
        self.post_envelope("/api/run-extraction-experiment", request, EXTRACTION_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn run_template_processing(
        &self,
        request: &TemplateProcessingRequest,
    ) -> Result<(), GpuError> {
        self.post_envelope(
            "/api/run-template-processing-only",
            request,
            TEMPLATE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn run_specialized_analysis(
        &self,
        request: &SpecializedAnalysisRequest,
    ) -> Result<(), GpuError> {
        self.post_envelope(
            "/api/run-specialized-analysis-only",
            request,
            SPECIALIZED_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn analyze_images(
        &self,
        request: &AnalyzeImagesRequest,
    ) -> Result<Vec<String>, GpuError> {
        let payload = self
            .post_envelope("/analyze-images", request, ANALYZE_IMAGES_TIMEOUT)
            .await?;

        // Two response shapes exist in the wild: a `results` array with one
        // entry per image, or a single top-level `analysis` text.
        if let Some(results) = payload.get("results").and_then(|v| v.as_array()) {
            return Ok(results
                .iter()
                .map(|r| {
                    r.get("analysis")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .trim()
                        .to_string()
                })
                .collect());
        }
        if let Some(analysis) = payload.get("analysis").and_then(|v| v.as_str()) {
            return Ok(vec![analysis.trim().to_string()]);
        }

        Err(GpuError::Rejected {
            message: "unexpected analyze-images response shape".to_string(),
        })
    }

    async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shapes_serialize_with_expected_keys() {
        let req = TemplateProcessingRequest {
            deck_ids: vec![101],
            template_id: 4,
            processing_options: CallbackOptions {
                generate_thumbnails: true,
                callback_url: "http://backend/api/internal/update-deck-results".to_string(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["deck_ids"][0], 101);
        assert_eq!(json["template_id"], 4);
        assert_eq!(json["processing_options"]["generate_thumbnails"], true);

        let req = ExtractionExperimentRequest {
            deck_ids: vec![101],
            experiment_name: "extraction_deck_101".to_string(),
            extraction_type: "all".to_string(),
            text_model: "test-model".to_string(),
            processing_options: ExtractionOptions::default(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["extraction_type"], "all");
        assert_eq!(json["processing_options"]["do_classification"], true);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = HttpGpuClient::new("http://gpu:8001/");
        assert_eq!(client.base_url, "http://gpu:8001");
    }
}
