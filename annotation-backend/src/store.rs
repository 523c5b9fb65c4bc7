//! Persistence boundary
//!
//! The pipeline only talks to [`AnnotationStore`]. [`InMemoryStore`] keeps
//! every table behind one `RwLock`, so each trait call is a transaction.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};
use unified_detector::AnnotationKind;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::export::ExportArtifact;
use crate::models::{
    AnnotationRecord, BlueprintImage, Material, MaterialLink, PipelineState, User,
};
use crate::units::{calibration_changed, Calibration};

/// Result of an idempotent batch insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Records were written
    Created(usize),
    /// The image already had annotations of this kind; nothing was written
    AlreadyPresent(usize),
}

impl BatchOutcome {
    pub fn count(&self) -> usize {
        match self {
            Self::Created(n) | Self::AlreadyPresent(n) => *n,
        }
    }
}

/// Outcome of a calibration write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationUpdate {
    /// Whether dpi or scale moved by more than the tolerance
    pub changed: bool,
    pub recalculated: usize,
}

pub trait AnnotationStore: Send + Sync {
    fn insert_user(&self, user: User) -> PipelineResult<()>;
    fn user(&self, id: Uuid) -> PipelineResult<User>;

    fn insert_material(&self, material: Material) -> PipelineResult<()>;
    fn material(&self, id: Uuid) -> PipelineResult<Material>;

    fn insert_image(&self, image: BlueprintImage, bytes: Vec<u8>) -> PipelineResult<()>;
    fn image(&self, id: Uuid) -> PipelineResult<BlueprintImage>;
    fn image_bytes(&self, id: Uuid) -> PipelineResult<Arc<Vec<u8>>>;
    /// Removes the image with its annotations, material links and exports
    fn delete_image(&self, id: Uuid) -> PipelineResult<()>;

    /// Mark `kind` done. The state never moves backwards.
    fn advance_pipeline(&self, image_id: Uuid, completed: AnnotationKind) -> PipelineResult<PipelineState>;
    fn record_pipeline_error(&self, image_id: Uuid, error: String) -> PipelineResult<()>;
    fn set_verified(&self, image_id: Uuid) -> PipelineResult<BlueprintImage>;

    fn count_annotations(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<usize>;
    fn annotations(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<Vec<AnnotationRecord>>;
    fn annotation(&self, kind: AnnotationKind, id: Uuid) -> PipelineResult<AnnotationRecord>;

    /// Insert all `records` plus the export, unless annotations of `kind`
    /// already exist for the image. All or nothing.
    ///
    /// `measured_with` is the calibration the records were measured under.
    /// If the image has been recalibrated since, the records are re-derived
    /// and the export re-rendered before they are stored.
    fn insert_batch_if_empty(
        &self,
        image_id: Uuid,
        kind: AnnotationKind,
        records: Vec<AnnotationRecord>,
        export: ExportArtifact,
        measured_with: &Calibration,
    ) -> PipelineResult<BatchOutcome>;

    /// Same calibration rule as [`AnnotationStore::insert_batch_if_empty`].
    /// Returns the record as stored.
    fn insert_annotation(&self, record: AnnotationRecord, measured_with: &Calibration) -> PipelineResult<AnnotationRecord>;
    fn replace_annotation(&self, record: AnnotationRecord, measured_with: &Calibration) -> PipelineResult<AnnotationRecord>;
    /// Removes the annotation and its material links
    fn delete_annotation(&self, kind: AnnotationKind, id: Uuid) -> PipelineResult<()>;

    /// Store a new calibration; `None` keeps the stored value. When dpi or
    /// scale moved by more than the tolerance, every annotation of the image
    /// is re-derived from its coordinates in the same write. Any failure
    /// leaves the image and all annotations untouched.
    fn recalibrate(&self, image_id: Uuid, dpi: Option<u32>, scale: Option<f64>) -> PipelineResult<CalibrationUpdate>;

    fn export(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<ExportArtifact>;

    /// Returns false when the pair is already linked
    fn insert_material_link(&self, link: MaterialLink) -> PipelineResult<bool>;
    fn material_links(&self, kind: AnnotationKind, annotation_id: Uuid) -> PipelineResult<Vec<MaterialLink>>;
    fn material_link(&self, kind: AnnotationKind, annotation_id: Uuid, material_id: Uuid) -> PipelineResult<MaterialLink>;
    fn replace_material_link(&self, link: MaterialLink) -> PipelineResult<()>;
    fn delete_material_link(&self, kind: AnnotationKind, annotation_id: Uuid, material_id: Uuid) -> PipelineResult<()>;
}

struct StoredImage {
    record: BlueprintImage,
    bytes: Arc<Vec<u8>>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    materials: HashMap<Uuid, Material>,
    images: HashMap<Uuid, StoredImage>,
    // Insertion order is the listing order
    annotations: Vec<AnnotationRecord>,
    links: Vec<MaterialLink>,
    exports: HashMap<(Uuid, AnnotationKind), ExportArtifact>,
}

impl Tables {
    fn image(&self, id: Uuid) -> PipelineResult<&BlueprintImage> {
        self.images
            .get(&id)
            .map(|stored| &stored.record)
            .ok_or_else(|| PipelineError::not_found("blueprint image", id))
    }

    fn image_mut(&mut self, id: Uuid) -> PipelineResult<&mut BlueprintImage> {
        self.images
            .get_mut(&id)
            .map(|stored| &mut stored.record)
            .ok_or_else(|| PipelineError::not_found("blueprint image", id))
    }

    fn count(&self, image_id: Uuid, kind: AnnotationKind) -> usize {
        self.annotations
            .iter()
            .filter(|a| a.kind() == kind && a.blueprint_image_id() == image_id)
            .count()
    }

    fn position(&self, kind: AnnotationKind, id: Uuid) -> PipelineResult<usize> {
        self.annotations
            .iter()
            .position(|a| a.kind() == kind && a.id() == id)
            .ok_or_else(|| PipelineError::not_found("annotation", id))
    }

    /// The image's calibration if it differs from `measured_with`
    fn drifted(&self, image_id: Uuid, measured_with: &Calibration) -> PipelineResult<Option<Calibration>> {
        let current = self.image(image_id)?.calibration()?;
        Ok((current != *measured_with).then_some(current))
    }
}

fn remeasure_all(records: &mut [AnnotationRecord], calibration: &Calibration) -> PipelineResult<()> {
    for record in records.iter_mut() {
        record.remeasure(calibration)?;
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PipelineResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| PipelineError::Store("store lock poisoned".to_string()))
    }

    fn write(&self) -> PipelineResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| PipelineError::Store("store lock poisoned".to_string()))
    }
}

impl AnnotationStore for InMemoryStore {
    fn insert_user(&self, user: User) -> PipelineResult<()> {
        self.write()?.users.insert(user.id, user);
        Ok(())
    }

    fn user(&self, id: Uuid) -> PipelineResult<User> {
        self.read()?
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("user", id))
    }

    fn insert_material(&self, material: Material) -> PipelineResult<()> {
        self.write()?.materials.insert(material.id, material);
        Ok(())
    }

    fn material(&self, id: Uuid) -> PipelineResult<Material> {
        self.read()?
            .materials
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("material", id))
    }

    fn insert_image(&self, image: BlueprintImage, bytes: Vec<u8>) -> PipelineResult<()> {
        self.write()?.images.insert(
            image.id,
            StoredImage {
                record: image,
                bytes: Arc::new(bytes),
            },
        );
        Ok(())
    }

    fn image(&self, id: Uuid) -> PipelineResult<BlueprintImage> {
        self.read()?
            .images
            .get(&id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| PipelineError::not_found("blueprint image", id))
    }

    fn image_bytes(&self, id: Uuid) -> PipelineResult<Arc<Vec<u8>>> {
        self.read()?
            .images
            .get(&id)
            .map(|stored| Arc::clone(&stored.bytes))
            .ok_or_else(|| PipelineError::not_found("blueprint image", id))
    }

    fn delete_image(&self, id: Uuid) -> PipelineResult<()> {
        let mut tables = self.write()?;
        if tables.images.remove(&id).is_none() {
            return Err(PipelineError::not_found("blueprint image", id));
        }

        let removed: Vec<(AnnotationKind, Uuid)> = tables
            .annotations
            .iter()
            .filter(|a| a.blueprint_image_id() == id)
            .map(|a| (a.kind(), a.id()))
            .collect();

        tables.annotations.retain(|a| a.blueprint_image_id() != id);
        tables
            .links
            .retain(|l| !removed.contains(&(l.kind, l.annotation_id)));
        tables.exports.retain(|(image_id, _), _| *image_id != id);

        info!("Deleted blueprint image {} with {} annotations", id, removed.len());
        Ok(())
    }

    fn advance_pipeline(&self, image_id: Uuid, completed: AnnotationKind) -> PipelineResult<PipelineState> {
        let mut tables = self.write()?;
        let image = tables.image_mut(image_id)?;

        image.pipeline.state = image.pipeline.state.max(PipelineState::after(completed));
        image.pipeline.last_error = None;
        image.updated_at = Utc::now();
        Ok(image.pipeline.state)
    }

    fn record_pipeline_error(&self, image_id: Uuid, error: String) -> PipelineResult<()> {
        let mut tables = self.write()?;
        let image = tables.image_mut(image_id)?;

        image.pipeline.last_error = Some(error);
        image.updated_at = Utc::now();
        Ok(())
    }

    fn set_verified(&self, image_id: Uuid) -> PipelineResult<BlueprintImage> {
        let mut tables = self.write()?;
        let image = tables.image_mut(image_id)?;

        image.is_verified = true;
        image.updated_at = Utc::now();
        Ok(image.clone())
    }

    fn count_annotations(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<usize> {
        Ok(self.read()?.count(image_id, kind))
    }

    fn annotations(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<Vec<AnnotationRecord>> {
        Ok(self
            .read()?
            .annotations
            .iter()
            .filter(|a| a.kind() == kind && a.blueprint_image_id() == image_id)
            .cloned()
            .collect())
    }

    fn annotation(&self, kind: AnnotationKind, id: Uuid) -> PipelineResult<AnnotationRecord> {
        let tables = self.read()?;
        let idx = tables.position(kind, id)?;
        Ok(tables.annotations[idx].clone())
    }

    fn insert_batch_if_empty(
        &self,
        image_id: Uuid,
        kind: AnnotationKind,
        mut records: Vec<AnnotationRecord>,
        mut export: ExportArtifact,
        measured_with: &Calibration,
    ) -> PipelineResult<BatchOutcome> {
        let mut tables = self.write()?;
        tables.image(image_id)?;

        let existing = tables.count(image_id, kind);
        if existing > 0 {
            debug!("Batch for {} on image {} lost the race, {} already stored", kind, image_id, existing);
            return Ok(BatchOutcome::AlreadyPresent(existing));
        }

        if let Some(stray) = records
            .iter()
            .find(|r| r.kind() != kind || r.blueprint_image_id() != image_id)
        {
            return Err(PipelineError::Validation(format!(
                "record {} does not belong to the {} batch of image {}",
                stray.id(),
                kind,
                image_id
            )));
        }

        if let Some(current) = tables.drifted(image_id, measured_with)? {
            info!("Image {} was recalibrated during the {} stage, re-deriving {} records", image_id, kind, records.len());
            remeasure_all(&mut records, &current)?;
            export = ExportArtifact::render(tables.image(image_id)?, kind, &records)?;
        }

        let created = records.len();
        tables.annotations.extend(records);
        tables.exports.insert((image_id, kind), export);
        Ok(BatchOutcome::Created(created))
    }

    fn insert_annotation(&self, mut record: AnnotationRecord, measured_with: &Calibration) -> PipelineResult<AnnotationRecord> {
        let mut tables = self.write()?;
        if let Some(current) = tables.drifted(record.blueprint_image_id(), measured_with)? {
            record.remeasure(&current)?;
        }

        tables.annotations.push(record.clone());
        Ok(record)
    }

    fn replace_annotation(&self, mut record: AnnotationRecord, measured_with: &Calibration) -> PipelineResult<AnnotationRecord> {
        let mut tables = self.write()?;
        let idx = tables.position(record.kind(), record.id())?;
        if let Some(current) = tables.drifted(record.blueprint_image_id(), measured_with)? {
            record.remeasure(&current)?;
        }

        tables.annotations[idx] = record.clone();
        Ok(record)
    }

    fn delete_annotation(&self, kind: AnnotationKind, id: Uuid) -> PipelineResult<()> {
        let mut tables = self.write()?;
        let idx = tables.position(kind, id)?;

        tables.annotations.remove(idx);
        tables.links.retain(|l| !(l.kind == kind && l.annotation_id == id));
        Ok(())
    }

    fn recalibrate(&self, image_id: Uuid, dpi: Option<u32>, scale: Option<f64>) -> PipelineResult<CalibrationUpdate> {
        let mut tables = self.write()?;
        let stored = tables.image(image_id)?;
        let dpi = dpi.or(stored.dpi);
        let scale = scale.or(stored.scale);
        let changed = calibration_changed(stored.dpi.map(f64::from), dpi.map(f64::from))
            || calibration_changed(stored.scale, scale);

        let has_annotations = tables.annotations.iter().any(|a| a.blueprint_image_id() == image_id);

        // Work on copies so a failure part way through commits nothing
        let mut updates: Vec<(usize, AnnotationRecord)> = Vec::new();
        if changed && has_annotations {
            let calibration = Calibration::from_parts(dpi, scale)?;
            for (idx, record) in tables.annotations.iter().enumerate() {
                if record.blueprint_image_id() != image_id {
                    continue;
                }
                let mut updated = record.clone();
                if updated.remeasure(&calibration)? {
                    updates.push((idx, updated));
                }
            }
        }

        let recalculated = updates.len();
        for (idx, record) in updates {
            tables.annotations[idx] = record;
        }

        // Edits inside the tolerance are kept but trigger no recalculation
        let image = tables.image_mut(image_id)?;
        image.dpi = dpi;
        image.scale = scale;
        image.updated_at = Utc::now();

        Ok(CalibrationUpdate { changed, recalculated })
    }

    fn export(&self, image_id: Uuid, kind: AnnotationKind) -> PipelineResult<ExportArtifact> {
        self.read()?
            .exports
            .get(&(image_id, kind))
            .cloned()
            .ok_or_else(|| PipelineError::not_found("export", image_id))
    }

    fn insert_material_link(&self, link: MaterialLink) -> PipelineResult<bool> {
        let mut tables = self.write()?;
        // The annotation may have been deleted since the caller loaded it
        tables.position(link.kind, link.annotation_id)?;

        let exists = tables.links.iter().any(|l| {
            l.kind == link.kind && l.annotation_id == link.annotation_id && l.material_id == link.material_id
        });
        if exists {
            return Ok(false);
        }

        tables.links.push(link);
        Ok(true)
    }

    fn material_links(&self, kind: AnnotationKind, annotation_id: Uuid) -> PipelineResult<Vec<MaterialLink>> {
        Ok(self
            .read()?
            .links
            .iter()
            .filter(|l| l.kind == kind && l.annotation_id == annotation_id)
            .cloned()
            .collect())
    }

    fn material_link(&self, kind: AnnotationKind, annotation_id: Uuid, material_id: Uuid) -> PipelineResult<MaterialLink> {
        self.read()?
            .links
            .iter()
            .find(|l| l.kind == kind && l.annotation_id == annotation_id && l.material_id == material_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("material link", material_id))
    }

    fn replace_material_link(&self, link: MaterialLink) -> PipelineResult<()> {
        let mut tables = self.write()?;
        let slot = tables
            .links
            .iter_mut()
            .find(|l| l.id == link.id)
            .ok_or_else(|| PipelineError::not_found("material link", link.id))?;

        *slot = link;
        Ok(())
    }

    fn delete_material_link(&self, kind: AnnotationKind, annotation_id: Uuid, material_id: Uuid) -> PipelineResult<()> {
        let mut tables = self.write()?;
        let before = tables.links.len();
        tables
            .links
            .retain(|l| !(l.kind == kind && l.annotation_id == annotation_id && l.material_id == material_id));

        if tables.links.len() == before {
            return Err(PipelineError::not_found("material link", material_id));
        }
        Ok(())
    }
}
