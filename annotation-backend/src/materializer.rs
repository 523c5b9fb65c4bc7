//! Annotation materializer: measures adapted shapes and persists them

use tracing::{info, warn};
use unified_detector::{AnnotationKind, Shape};

use crate::error::{PipelineError, PipelineResult};
use crate::export::ExportArtifact;
use crate::models::{AnnotationRecord, BlueprintImage};
use crate::store::{AnnotationStore, BatchOutcome};

/// Persist one annotation per shape for `kind`.
///
/// A no-op when the image already has annotations of `kind`. Shapes with bad
/// geometry are skipped one by one; a shape failing field validation rejects
/// the whole batch.
pub fn materialize(
    store: &dyn AnnotationStore,
    image: &BlueprintImage,
    kind: AnnotationKind,
    shapes: &[Shape],
) -> PipelineResult<BatchOutcome> {
    let existing = store.count_annotations(image.id, kind)?;
    if existing > 0 {
        info!(image_id = %image.id, %kind, existing, "Annotations already present, skipping");
        return Ok(BatchOutcome::AlreadyPresent(existing));
    }

    let calibration = image.calibration()?;

    for (idx, shape) in shapes.iter().enumerate() {
        validate_shape(kind, shape).map_err(|e| match e {
            PipelineError::Validation(msg) => PipelineError::Validation(format!("shape {}: {}", idx, msg)),
            other => other,
        })?;
    }

    let mut records = Vec::with_capacity(shapes.len());
    for (idx, shape) in shapes.iter().enumerate() {
        match AnnotationRecord::measure(
            kind,
            image.id,
            shape.label.clone(),
            shape.points.clone(),
            shape.confidence,
            &calibration,
        ) {
            Ok(record) => records.push(record),
            Err(PipelineError::InvalidGeometry(reason)) => {
                warn!(image_id = %image.id, %kind, "Skipping shape {}: {}", idx, reason);
            }
            Err(err) => return Err(err),
        }
    }

    let export = ExportArtifact::render(image, kind, &records)?;
    let outcome = store.insert_batch_if_empty(image.id, kind, records, export, &calibration)?;

    if let BatchOutcome::Created(count) = outcome {
        info!(image_id = %image.id, %kind, "Created {} annotations from {} shapes", count, shapes.len());
    }
    Ok(outcome)
}

fn validate_shape(kind: AnnotationKind, shape: &Shape) -> PipelineResult<()> {
    if shape.label.trim().is_empty() {
        return Err(PipelineError::Validation("label is empty".to_string()));
    }
    if shape.shape_type != kind.shape_type() {
        return Err(PipelineError::Validation(format!(
            "{:?} shape cannot be stored as a {} annotation",
            shape.shape_type, kind
        )));
    }
    if let Some(confidence) = shape.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PipelineError::Validation(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
    }
    Ok(())
}
