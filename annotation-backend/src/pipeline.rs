//! Pipeline orchestration
//!
//! Each blueprint image moves through `no_annotations -> room_done ->
//! wall_done -> annotated`. A trigger enqueues the room stage; the dispatcher
//! enqueues the next stage when one succeeds. Every stage re-checks
//! idempotency, so duplicate deliveries degrade to no-ops.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};
use unified_detector::{AnnotationKind, DetectionAdapter, ModelRegistry};
use uuid::Uuid;

use crate::access::authorize;
use crate::error::{PipelineError, PipelineResult};
use crate::materializer::materialize;
use crate::models::{BlueprintImage, PipelineState, User};
use crate::store::{AnnotationStore, BatchOutcome, CalibrationUpdate};

/// Receives verified images for delivery to their owner
pub trait OwnerNotifier: Send + Sync {
    fn image_verified(&self, image: &BlueprintImage, verified_by: &User);
}

/// Default notifier: records the event in the log
pub struct TracingNotifier;

impl OwnerNotifier for TracingNotifier {
    fn image_verified(&self, image: &BlueprintImage, verified_by: &User) {
        info!(
            image_id = %image.id,
            owner_id = %image.owner_id,
            "Blueprint image '{}' verified by {}",
            image.title,
            verified_by.name
        );
    }
}

/// Human name used when reporting a missing annotation family
pub fn annotation_display_name(kind: AnnotationKind) -> &'static str {
    match kind {
        AnnotationKind::Room => "general annotation",
        AnnotationKind::Wall => "wall annotation",
        AnnotationKind::WindowDoor => "window/door annotation",
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn AnnotationStore>,
    models: Arc<ModelRegistry>,
    adapter: DetectionAdapter,
    notifier: Arc<dyn OwnerNotifier>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn AnnotationStore>,
        models: Arc<ModelRegistry>,
        notifier: Arc<dyn OwnerNotifier>,
    ) -> Self {
        Self {
            store,
            models,
            adapter: DetectionAdapter::default(),
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn AnnotationStore> {
        &self.store
    }

    /// Run one stage to completion. Blocking: calls the detector.
    ///
    /// Success advances the persisted pipeline state; failure records the
    /// error on the image and leaves no annotations for this kind.
    pub fn run_stage(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<BatchOutcome> {
        let start = Instant::now();
        let result = self.execute_stage(image_id, kind);

        match &result {
            Ok(outcome) => {
                let state = self.store.advance_pipeline(image_id, kind)?;
                info!(
                    %image_id, %kind, ?state,
                    "Stage finished with {} annotations in {}ms",
                    outcome.count(),
                    start.elapsed().as_millis()
                );
            }
            Err(err) => {
                warn!(%image_id, %kind, "Stage failed: {}", err);
                if !matches!(err, PipelineError::NotFound { .. }) {
                    self.store
                        .record_pipeline_error(image_id, format!("{} stage: {}", kind, err))?;
                }
            }
        }

        result
    }

    fn execute_stage(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<BatchOutcome> {
        let image = self.store.image(image_id)?;

        // Never re-run detection for a kind that is already stored
        let existing = self.store.count_annotations(image_id, kind)?;
        if existing > 0 {
            info!(%image_id, %kind, existing, "Annotations already present, skipping detection");
            return Ok(BatchOutcome::AlreadyPresent(existing));
        }
        image.calibration()?;

        let bytes = self.store.image_bytes(image_id)?;
        let model = self.models.model(kind);
        let prediction = model
            .detector
            .predict(&bytes)
            .map_err(|e| PipelineError::Detection(format!("{:#}", e)))?;

        let shapes = self.adapter.adapt(&prediction, model.label_policy);
        if shapes.is_empty() {
            info!(%image_id, %kind, "Detector produced no shapes");
        }

        materialize(self.store.as_ref(), &image, kind, &shapes)
    }

    /// Run room, wall and window/door in order on the calling thread,
    /// stopping at the first failure.
    pub fn run_chain(&self, image_id: Uuid) -> PipelineResult<Vec<(AnnotationKind, BatchOutcome)>> {
        let mut outcomes = Vec::with_capacity(AnnotationKind::CHAIN.len());
        let mut next = Some(AnnotationKind::Room);

        while let Some(kind) = next {
            outcomes.push((kind, self.run_stage(image_id, kind)?));
            next = kind.next();
        }

        Ok(outcomes)
    }

    /// Permission check done before anything is enqueued
    pub fn authorize_trigger(&self, image_id: Uuid, requester: Uuid) -> PipelineResult<BlueprintImage> {
        let image = self.store.image(image_id)?;
        authorize(self.store.as_ref(), &image, requester)?;
        Ok(image)
    }

    /// Apply a calibration edit. Values left `None` keep the stored value.
    ///
    /// The new values are always stored. Existing annotations are re-derived
    /// in the same write only when dpi or scale moved by more than the
    /// tolerance.
    pub fn update_calibration(
        &self,
        image_id: Uuid,
        requester: Uuid,
        dpi: Option<u32>,
        scale: Option<f64>,
    ) -> PipelineResult<CalibrationUpdate> {
        if dpi == Some(0) {
            return Err(PipelineError::Validation("dpi must be positive".to_string()));
        }
        if let Some(scale) = scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(PipelineError::Validation("scale must be positive".to_string()));
            }
        }

        let image = self.store.image(image_id)?;
        authorize(self.store.as_ref(), &image, requester)?;

        let update = self.store.recalibrate(image_id, dpi, scale)?;

        if update.changed {
            info!(
                %image_id,
                "Calibration edited (dpi={:?} scale={:?}), {} annotations recalculated",
                dpi,
                scale,
                update.recalculated
            );
        } else {
            info!(%image_id, "Calibration edit within tolerance, nothing recalculated");
        }
        Ok(update)
    }

    /// Verification gate: all three annotation families must exist
    pub fn verify(&self, image_id: Uuid, requester: Uuid) -> PipelineResult<BlueprintImage> {
        let image = self.store.image(image_id)?;
        let user = authorize(self.store.as_ref(), &image, requester)?;

        let mut missing = Vec::new();
        for kind in AnnotationKind::CHAIN {
            if self.store.count_annotations(image_id, kind)? == 0 {
                missing.push(annotation_display_name(kind).to_string());
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::MissingAnnotations(missing));
        }

        let image = self.store.set_verified(image_id)?;
        self.notifier.image_verified(&image, &user);
        Ok(image)
    }
}

/// Work item for the stage queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageJob {
    pub image_id: Uuid,
    pub kind: AnnotationKind,
    pub attempt: u32,
}

impl StageJob {
    pub fn first(image_id: Uuid, kind: AnnotationKind) -> Self {
        Self {
            image_id,
            kind,
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Stages running at once across all images
    pub concurrency: usize,
    /// Attempts for a stage failing with a detector error
    pub max_attempts: u32,
    /// Delay before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Cheap handle used by request handlers to start chains
#[derive(Clone)]
pub struct PipelineHandle {
    orchestrator: Orchestrator,
    sender: mpsc::UnboundedSender<StageJob>,
}

impl PipelineHandle {
    /// Check permissions and enqueue the room stage. Returns as soon as the
    /// job is queued.
    pub fn trigger(&self, image_id: Uuid, requester: Uuid) -> PipelineResult<PipelineState> {
        let image = self.orchestrator.authorize_trigger(image_id, requester)?;

        self.sender
            .send(StageJob::first(image_id, AnnotationKind::Room))
            .map_err(|_| PipelineError::Store("stage queue is closed".to_string()))?;

        info!(%image_id, %requester, "Annotation chain enqueued");
        Ok(image.pipeline.state)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// Start the queue consumer on the current runtime.
///
/// Stages run on the blocking pool, bounded by `config.concurrency`.
pub fn spawn_dispatcher(orchestrator: Orchestrator, config: DispatcherConfig) -> PipelineHandle {
    let (sender, mut receiver) = mpsc::unbounded_channel::<StageJob>();
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let requeue = sender.clone();
    let worker = orchestrator.clone();

    tokio::spawn(async move {
        while let Some(job) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let orchestrator = worker.clone();
            let requeue = requeue.clone();

            tokio::spawn(async move {
                let stage = orchestrator.clone();
                let result =
                    tokio::task::spawn_blocking(move || stage.run_stage(job.image_id, job.kind)).await;
                drop(permit);

                let next = match result {
                    Ok(Ok(_)) => job
                        .kind
                        .next()
                        .map(|kind| (StageJob::first(job.image_id, kind), Duration::ZERO)),
                    Ok(Err(err)) if err.is_transient() && job.attempt < config.max_attempts => {
                        let delay = config.retry_backoff * job.attempt;
                        warn!(
                            image_id = %job.image_id, kind = %job.kind,
                            "Retrying stage in {}ms (attempt {} of {})",
                            delay.as_millis(),
                            job.attempt + 1,
                            config.max_attempts
                        );
                        let retry = StageJob {
                            attempt: job.attempt + 1,
                            ..job
                        };
                        Some((retry, delay))
                    }
                    Ok(Err(err)) => {
                        error!(image_id = %job.image_id, kind = %job.kind, "Chain stopped: {}", err);
                        None
                    }
                    Err(join_err) => {
                        error!(image_id = %job.image_id, kind = %job.kind, "Stage task aborted: {}", join_err);
                        None
                    }
                };

                if let Some((next, delay)) = next {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if requeue.send(next).is_err() {
                        error!(image_id = %next.image_id, "Stage queue closed, dropping {}", next.kind);
                    }
                }
            });
        }
    });

    PipelineHandle {
        orchestrator,
        sender,
    }
}
