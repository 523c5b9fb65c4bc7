//! YOLO detector interface
//!
//! Models run behind an inference server; this crate only speaks the
//! request/response contract. Implementations are blocking and meant to be
//! called from worker threads.

use anyhow::{anyhow, Context};
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{DetectionResult, Prediction};

/// YOLO inference endpoint configuration
#[derive(Debug, Clone)]
pub struct YoloConfig {
    /// URL accepting `{"image": <base64>}` and returning a `Prediction`
    pub endpoint: String,
    /// Confidence threshold (0.0-1.0) forwarded to the server
    pub confidence_threshold: f64,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8500/predict/room".to_string(),
            confidence_threshold: 0.25,
            timeout_secs: 120,
        }
    }
}

/// YOLO detector trait - allows for different implementations
pub trait YoloDetector: Send + Sync {
    /// Run the model over an encoded image
    fn predict(&self, image_bytes: &[u8]) -> anyhow::Result<Prediction>;

    /// Get model info
    fn model_info(&self) -> String;
}

/// Detector backed by a remote inference server
pub struct HttpYoloDetector {
    client: reqwest::blocking::Client,
    config: YoloConfig,
}

impl HttpYoloDetector {
    pub fn new(config: YoloConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build inference HTTP client")?;

        Ok(Self { client, config })
    }
}

impl YoloDetector for HttpYoloDetector {
    fn predict(&self, image_bytes: &[u8]) -> anyhow::Result<Prediction> {
        let start = Instant::now();
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "confidence_threshold": self.config.confidence_threshold,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .with_context(|| format!("Inference request to {} failed", self.config.endpoint))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            warn!("Inference server returned {}: {}", status, error_text);
            return Err(anyhow!("Inference server error {}: {}", status, error_text));
        }

        let prediction: Prediction = response
            .json()
            .context("Failed to decode inference response")?;

        info!(
            "Inference at {} returned {} detections in {}ms",
            self.config.endpoint,
            prediction.result.len(),
            start.elapsed().as_millis()
        );

        Ok(prediction)
    }

    fn model_info(&self) -> String {
        format!("HTTP YOLO Detector (endpoint: {})", self.config.endpoint)
    }
}

/// Replays one fixed prediction. Used for fixtures and for running without
/// an inference server.
pub struct StaticDetector {
    name: String,
    prediction: Prediction,
    calls: AtomicUsize,
}

impl StaticDetector {
    pub fn new(name: impl Into<String>, prediction: Prediction) -> Self {
        Self {
            name: name.into(),
            prediction,
            calls: AtomicUsize::new(0),
        }
    }

    /// Detector that never finds anything
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Prediction {
                image_width: 0,
                image_height: 0,
                names: Default::default(),
                result: DetectionResult::Boxes { detections: vec![], probs: None },
            },
        )
    }

    /// Number of `predict` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl YoloDetector for StaticDetector {
    fn predict(&self, _image_bytes: &[u8]) -> anyhow::Result<Prediction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.prediction.clone())
    }

    fn model_info(&self) -> String {
        format!("Static YOLO Detector ({})", self.name)
    }
}
