//! Material linkage for annotations

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use unified_detector::AnnotationKind;
use uuid::Uuid;

use crate::access::authorize;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{AnnotationRecord, MaterialLink};
use crate::store::AnnotationStore;

pub const DEFAULT_QUANTITY: f64 = 1.0;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkRequest {
    pub material_id: Uuid,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkReport {
    pub created: Vec<MaterialLink>,
    pub already_exists: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkPatch {
    pub quantity: Option<f64>,
    pub notes: Option<String>,
    /// Reset quantity to the annotation's area
    #[serde(default)]
    pub sync_with_area: bool,
}

fn load(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    annotation_id: Uuid,
    requester: Uuid,
) -> PipelineResult<AnnotationRecord> {
    let record = store.annotation(kind, annotation_id)?;
    let image = store.image(record.blueprint_image_id())?;
    authorize(store, &image, requester)?;
    Ok(record)
}

fn validate_quantity(quantity: f64) -> PipelineResult<()> {
    if !(quantity.is_finite() && quantity >= 0.0) {
        return Err(PipelineError::Validation(format!("invalid quantity {}", quantity)));
    }
    Ok(())
}

/// Link one or more materials. Pairs that are already linked are reported
/// rather than treated as errors. New links take the annotation's area as
/// quantity when it has one.
pub fn link_materials(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    annotation_id: Uuid,
    requester: Uuid,
    requests: Vec<LinkRequest>,
) -> PipelineResult<LinkReport> {
    let record = load(store, kind, annotation_id, requester)?;
    if requests.is_empty() {
        return Err(PipelineError::Validation("no materials given".to_string()));
    }

    // Resolve everything first so an unknown material links nothing
    for request in &requests {
        store.material(request.material_id)?;
        if let Some(quantity) = request.quantity {
            validate_quantity(quantity)?;
        }
    }

    let mut report = LinkReport::default();
    for request in requests {
        let link = MaterialLink {
            id: Uuid::new_v4(),
            kind,
            annotation_id,
            material_id: request.material_id,
            quantity: record
                .area()
                .or(request.quantity)
                .unwrap_or(DEFAULT_QUANTITY),
            notes: request.notes.unwrap_or_default(),
            created_at: Utc::now(),
        };

        if store.insert_material_link(link.clone())? {
            report.created.push(link);
        } else {
            report.already_exists.push(request.material_id);
        }
    }

    info!(
        %kind, %annotation_id,
        "Linked {} materials ({} already present)",
        report.created.len(),
        report.already_exists.len()
    );
    Ok(report)
}

pub fn update_link(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    annotation_id: Uuid,
    material_id: Uuid,
    requester: Uuid,
    patch: LinkPatch,
) -> PipelineResult<MaterialLink> {
    let record = load(store, kind, annotation_id, requester)?;
    let mut link = store.material_link(kind, annotation_id, material_id)?;

    if patch.sync_with_area {
        link.quantity = record.area().ok_or_else(|| {
            PipelineError::Validation(format!("{} annotations have no area to sync with", kind))
        })?;
    } else if let Some(quantity) = patch.quantity {
        validate_quantity(quantity)?;
        link.quantity = quantity;
    }
    if let Some(notes) = patch.notes {
        link.notes = notes;
    }

    store.replace_material_link(link.clone())?;
    Ok(link)
}

pub fn unlink(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    annotation_id: Uuid,
    material_id: Uuid,
    requester: Uuid,
) -> PipelineResult<()> {
    load(store, kind, annotation_id, requester)?;
    store.delete_material_link(kind, annotation_id, material_id)
}

pub fn list_links(
    store: &dyn AnnotationStore,
    kind: AnnotationKind,
    annotation_id: Uuid,
) -> PipelineResult<Vec<MaterialLink>> {
    store.annotation(kind, annotation_id)?;
    store.material_links(kind, annotation_id)
}
