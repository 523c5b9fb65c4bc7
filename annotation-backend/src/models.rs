use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unified_detector::{AnnotationKind, PixelPoint, ShapeType};
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::units::{self, Calibration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Estimator,
    Customer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Shared reference data, priced by estimators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub name: String,
    pub unit: String,
    pub created_at: DateTime<Utc>,
}

/// Where an image is in the creation chain. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    NoAnnotations,
    RoomDone,
    WallDone,
    Annotated,
}

impl PipelineState {
    /// State reached once `kind` has been materialized
    pub fn after(kind: AnnotationKind) -> Self {
        match kind {
            AnnotationKind::Room => Self::RoomDone,
            AnnotationKind::Wall => Self::WallDone,
            AnnotationKind::WindowDoor => Self::Annotated,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub last_error: Option<String>,
}

/// One calibrated raster page of an uploaded drawing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintImage {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    pub dpi: Option<u32>,
    pub scale: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub is_verified: bool,
    pub pipeline: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlueprintImage {
    pub fn calibration(&self) -> PipelineResult<Calibration> {
        Calibration::from_parts(self.dpi, self.scale)
    }
}

/// Room / floor annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub blueprint_image_id: Uuid,
    pub label: String,
    pub coordinates: Vec<PixelPoint>,
    pub area: f64,
    pub width: f64,
    pub height: f64,
    pub confidence_score: Option<f64>,
    pub annotation_type: ShapeType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WallAnnotation {
    pub id: Uuid,
    pub blueprint_image_id: Uuid,
    pub label: String,
    pub coordinates: Vec<PixelPoint>,
    pub area: f64,
    pub length: f64,
    pub thickness: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Windows and doors carry dimensions only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAndDoorAnnotation {
    pub id: Uuid,
    pub blueprint_image_id: Uuid,
    pub label: String,
    pub coordinates: Vec<PixelPoint>,
    pub length: f64,
    pub breadth: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Any persisted annotation, tagged by family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationRecord {
    Room(Annotation),
    Wall(WallAnnotation),
    WindowDoor(WindowAndDoorAnnotation),
}

impl AnnotationRecord {
    /// Build a new record of `kind`, computing its measurements.
    pub fn measure(
        kind: AnnotationKind,
        blueprint_image_id: Uuid,
        label: String,
        coordinates: Vec<PixelPoint>,
        confidence: Option<f64>,
        calibration: &Calibration,
    ) -> PipelineResult<Self> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let record = match kind {
            AnnotationKind::Room => {
                let area = units::area_sqft(&coordinates, calibration)?;
                let (width, height) = units::bounding_dimensions(&coordinates, calibration)?;
                Self::Room(Annotation {
                    id,
                    blueprint_image_id,
                    label,
                    coordinates,
                    area,
                    width,
                    height,
                    confidence_score: confidence,
                    annotation_type: ShapeType::Polygon,
                    created_at: now,
                    updated_at: now,
                })
            }
            AnnotationKind::Wall => {
                let area = units::area_sqft(&coordinates, calibration)?;
                let (length, thickness) = units::wall_dimensions(&coordinates, calibration)?;
                Self::Wall(WallAnnotation {
                    id,
                    blueprint_image_id,
                    label,
                    coordinates,
                    area,
                    length,
                    thickness,
                    created_at: now,
                    updated_at: now,
                })
            }
            AnnotationKind::WindowDoor => {
                let (length, breadth) = units::bounding_dimensions(&coordinates, calibration)?;
                Self::WindowDoor(WindowAndDoorAnnotation {
                    id,
                    blueprint_image_id,
                    label,
                    coordinates,
                    length,
                    breadth,
                    created_at: now,
                    updated_at: now,
                })
            }
        };

        Ok(record)
    }

    /// Recompute derived measurements from the stored coordinates.
    ///
    /// Returns whether any measurement changed; `updated_at` only moves when
    /// one did.
    pub fn remeasure(&mut self, calibration: &Calibration) -> PipelineResult<bool> {
        let changed = match self {
            Self::Room(ann) => {
                let area = units::area_sqft(&ann.coordinates, calibration)?;
                let (width, height) = units::bounding_dimensions(&ann.coordinates, calibration)?;
                let changed = (ann.area, ann.width, ann.height) != (area, width, height);
                (ann.area, ann.width, ann.height) = (area, width, height);
                changed
            }
            Self::Wall(ann) => {
                let area = units::area_sqft(&ann.coordinates, calibration)?;
                let (length, thickness) = units::wall_dimensions(&ann.coordinates, calibration)?;
                let changed = (ann.area, ann.length, ann.thickness) != (area, length, thickness);
                (ann.area, ann.length, ann.thickness) = (area, length, thickness);
                changed
            }
            Self::WindowDoor(ann) => {
                let (length, breadth) = units::bounding_dimensions(&ann.coordinates, calibration)?;
                let changed = (ann.length, ann.breadth) != (length, breadth);
                (ann.length, ann.breadth) = (length, breadth);
                changed
            }
        };

        if changed {
            self.touch();
        }
        Ok(changed)
    }

    /// Replace label and/or coordinates, then recompute measurements
    pub fn edit(
        &mut self,
        label: Option<String>,
        coordinates: Option<Vec<PixelPoint>>,
        calibration: &Calibration,
    ) -> PipelineResult<()> {
        let mut edited = self.clone();
        if let Some(label) = label {
            *edited.label_mut() = label;
        }
        if let Some(coordinates) = coordinates {
            *edited.coordinates_mut() = coordinates;
        }
        edited.remeasure(calibration)?;
        edited.touch();

        *self = edited;
        Ok(())
    }

    pub fn kind(&self) -> AnnotationKind {
        match self {
            Self::Room(_) => AnnotationKind::Room,
            Self::Wall(_) => AnnotationKind::Wall,
            Self::WindowDoor(_) => AnnotationKind::WindowDoor,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Room(a) => a.id,
            Self::Wall(a) => a.id,
            Self::WindowDoor(a) => a.id,
        }
    }

    pub fn blueprint_image_id(&self) -> Uuid {
        match self {
            Self::Room(a) => a.blueprint_image_id,
            Self::Wall(a) => a.blueprint_image_id,
            Self::WindowDoor(a) => a.blueprint_image_id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Room(a) => &a.label,
            Self::Wall(a) => &a.label,
            Self::WindowDoor(a) => &a.label,
        }
    }

    pub fn coordinates(&self) -> &[PixelPoint] {
        match self {
            Self::Room(a) => &a.coordinates,
            Self::Wall(a) => &a.coordinates,
            Self::WindowDoor(a) => &a.coordinates,
        }
    }

    /// Square footage, for the families that have one
    pub fn area(&self) -> Option<f64> {
        match self {
            Self::Room(a) => Some(a.area),
            Self::Wall(a) => Some(a.area),
            Self::WindowDoor(_) => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Room(a) => a.created_at,
            Self::Wall(a) => a.created_at,
            Self::WindowDoor(a) => a.created_at,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Room(a) => a.updated_at,
            Self::Wall(a) => a.updated_at,
            Self::WindowDoor(a) => a.updated_at,
        }
    }

    fn label_mut(&mut self) -> &mut String {
        match self {
            Self::Room(a) => &mut a.label,
            Self::Wall(a) => &mut a.label,
            Self::WindowDoor(a) => &mut a.label,
        }
    }

    fn coordinates_mut(&mut self) -> &mut Vec<PixelPoint> {
        match self {
            Self::Room(a) => &mut a.coordinates,
            Self::Wall(a) => &mut a.coordinates,
            Self::WindowDoor(a) => &mut a.coordinates,
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        match self {
            Self::Room(a) => a.updated_at = now,
            Self::Wall(a) => a.updated_at = now,
            Self::WindowDoor(a) => a.updated_at = now,
        }
    }
}

/// Join row between an annotation and a material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialLink {
    pub id: Uuid,
    pub kind: AnnotationKind,
    pub annotation_id: Uuid,
    pub material_id: Uuid,
    pub quantity: f64,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}
