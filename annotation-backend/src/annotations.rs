//! Manual annotation editing by owners and estimators

use serde::Deserialize;
use tracing::info;
use unified_detector::{AnnotationKind, PixelPoint};
use uuid::Uuid;

use crate::access::authorize;
use crate::error::{PipelineError, PipelineResult};
use crate::models::AnnotationRecord;
use crate::store::AnnotationStore;

#[derive(Debug, Clone, Deserialize)]
pub struct NewAnnotation {
    pub blueprint_image_id: Uuid,
    pub label: String,
    pub coordinates: Vec<PixelPoint>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotationPatch {
    pub label: Option<String>,
    pub coordinates: Option<Vec<PixelPoint>>,
}

pub fn create_annotation(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    requester: Uuid,
    input: NewAnnotation,
) -> PipelineResult<AnnotationRecord> {
    let image = store.image(input.blueprint_image_id)?;
    authorize(store, &image, requester)?;

    validate_label(&input.label)?;
    validate_coordinates(&input.coordinates)?;
    let confidence = match kind {
        AnnotationKind::Room => input.confidence_score,
        AnnotationKind::Wall | AnnotationKind::WindowDoor => None,
    };

    let calibration = image.calibration()?;
    let record = AnnotationRecord::measure(
        kind,
        image.id,
        input.label,
        input.coordinates,
        confidence,
        &calibration,
    )?;
    let record = store.insert_annotation(record, &calibration)?;

    info!(image_id = %image.id, %kind, annotation_id = %record.id(), "Annotation created manually");
    Ok(record)
}

/// Change label and/or coordinates; measurements are recomputed
pub fn update_annotation(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    id: Uuid,
    requester: Uuid,
    patch: AnnotationPatch,
) -> PipelineResult<AnnotationRecord> {
    let mut record = store.annotation(kind, id)?;
    let image = store.image(record.blueprint_image_id())?;
    authorize(store, &image, requester)?;

    if let Some(label) = &patch.label {
        validate_label(label)?;
    }
    if let Some(coordinates) = &patch.coordinates {
        validate_coordinates(coordinates)?;
    }

    let calibration = image.calibration()?;
    record.edit(patch.label, patch.coordinates, &calibration)?;
    let record = store.replace_annotation(record, &calibration)?;

    info!(image_id = %image.id, %kind, annotation_id = %id, "Annotation updated");
    Ok(record)
}

pub fn delete_annotation(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    id: Uuid,
    requester: Uuid,
) -> PipelineResult<()> {
    let record = store.annotation(kind, id)?;
    let image = store.image(record.blueprint_image_id())?;
    authorize(store, &image, requester)?;

    store.delete_annotation(kind, id)?;
    info!(image_id = %image.id, %kind, annotation_id = %id, "Annotation deleted");
    Ok(())
}

fn validate_label(label: &str) -> PipelineResult<()> {
    if label.trim().is_empty() {
        return Err(PipelineError::Validation("label is required".to_string()));
    }
    Ok(())
}

fn validate_coordinates(coordinates: &[PixelPoint]) -> PipelineResult<()> {
    if coordinates.is_empty() {
        return Err(PipelineError::Validation("coordinates are required".to_string()));
    }
    Ok(())
}
