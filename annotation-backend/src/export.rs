//! Labeling-tool compatible JSON export, one document per image and family

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use unified_detector::{AnnotationKind, PixelPoint, ShapeType};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{AnnotationRecord, BlueprintImage};

pub const EXPORT_VERSION: &str = "4.5.6";

#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    pub version: String,
    pub flags: Map<String, Value>,
    pub shapes: Vec<ExportShape>,
    #[serde(rename = "imagePath")]
    pub image_path: String,
    #[serde(rename = "imageData")]
    pub image_data: Option<String>,
    #[serde(rename = "imageHeight")]
    pub image_height: u32,
    #[serde(rename = "imageWidth")]
    pub image_width: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportShape {
    pub label: String,
    pub points: Vec<PixelPoint>,
    pub group_id: Option<u32>,
    pub shape_type: ShapeType,
    pub flags: Map<String, Value>,
    #[serde(flatten)]
    pub measurements: ShapeMeasurements,
}

/// Kind-specific fields written next to the common shape keys
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ShapeMeasurements {
    Room {
        confidence_score: Option<f64>,
        measurement: f64,
        width: f64,
        height: f64,
    },
    Wall {
        length: f64,
        area: f64,
        thickness: f64,
    },
    WindowDoor {
        length: f64,
        breadth: f64,
    },
}

impl From<&AnnotationRecord> for ExportShape {
    fn from(record: &AnnotationRecord) -> Self {
        let (shape_type, measurements) = match record {
            AnnotationRecord::Room(a) => (
                a.annotation_type,
                ShapeMeasurements::Room {
                    confidence_score: a.confidence_score,
                    measurement: a.area,
                    width: a.width,
                    height: a.height,
                },
            ),
            AnnotationRecord::Wall(a) => (
                ShapeType::Rectangle,
                ShapeMeasurements::Wall {
                    length: a.length,
                    area: a.area,
                    thickness: a.thickness,
                },
            ),
            AnnotationRecord::WindowDoor(a) => (
                ShapeType::Rectangle,
                ShapeMeasurements::WindowDoor {
                    length: a.length,
                    breadth: a.breadth,
                },
            ),
        };

        Self {
            label: record.label().to_string(),
            points: record.coordinates().to_vec(),
            group_id: None,
            shape_type,
            flags: Map::new(),
            measurements,
        }
    }
}

impl ExportDocument {
    pub fn new(image: &BlueprintImage, records: &[AnnotationRecord]) -> Self {
        Self {
            version: EXPORT_VERSION.to_string(),
            flags: Map::new(),
            shapes: records.iter().map(ExportShape::from).collect(),
            image_path: image.title.clone(),
            image_data: None,
            image_height: image.height,
            image_width: image.width,
        }
    }

    /// Serialize with four-space indentation
    pub fn to_pretty_json(&self) -> PipelineResult<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)
            .map_err(|e| PipelineError::Store(format!("failed to serialize export: {}", e)))?;

        String::from_utf8(buf).map_err(|e| PipelineError::Store(format!("export is not UTF-8: {}", e)))
    }
}

/// A rendered export attached to an image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub kind: AnnotationKind,
    pub file_name: String,
    pub content: String,
}

impl ExportArtifact {
    pub fn render(image: &BlueprintImage, kind: AnnotationKind, records: &[AnnotationRecord]) -> PipelineResult<Self> {
        Ok(Self {
            kind,
            file_name: export_file_name(&image.title, kind),
            content: ExportDocument::new(image, records).to_pretty_json()?,
        })
    }
}

pub fn export_file_name(title: &str, kind: AnnotationKind) -> String {
    let suffix = match kind {
        AnnotationKind::Room => "floor",
        AnnotationKind::Wall => "wall",
        AnnotationKind::WindowDoor => "window&door",
    };
    format!("{}_{}_annotation.json", title, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineStatus, WallAnnotation};
    use chrono::Utc;
    use uuid::Uuid;

    fn image() -> BlueprintImage {
        BlueprintImage {
            id: Uuid::new_v4(),
            title: "Plan A - Page 1".to_string(),
            owner_id: Uuid::new_v4(),
            dpi: Some(100),
            scale: Some(1.0),
            width: 640,
            height: 480,
            is_verified: false,
            pipeline: PipelineStatus::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_export_document_layout() {
        let image = image();
        let wall = AnnotationRecord::Wall(WallAnnotation {
            id: Uuid::new_v4(),
            blueprint_image_id: image.id,
            label: "wall".to_string(),
            coordinates: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 10.0], [0.0, 10.0]],
            area: 0.1,
            length: 1.0,
            thickness: 0.1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let artifact = ExportArtifact::render(&image, AnnotationKind::Wall, &[wall]).unwrap();
        let doc: Value = serde_json::from_str(&artifact.content).unwrap();

        assert_eq!(artifact.file_name, "Plan A - Page 1_wall_annotation.json");
        assert_eq!(doc["version"], "4.5.6");
        assert_eq!(doc["imagePath"], "Plan A - Page 1");
        assert_eq!(doc["imageData"], Value::Null);
        assert_eq!(doc["imageWidth"], 640);
        assert_eq!(doc["imageHeight"], 480);

        let shape = &doc["shapes"][0];
        assert_eq!(shape["shape_type"], "rectangle");
        assert_eq!(shape["group_id"], Value::Null);
        assert_eq!(shape["flags"], serde_json::json!({}));
        assert_eq!(shape["length"], 1.0);
        assert_eq!(shape["thickness"], 0.1);
        assert!(shape.get("measurement").is_none());

        assert!(artifact.content.contains("\n    \"version\""));
    }

    #[test]
    fn test_export_file_names() {
        assert_eq!(export_file_name("p", AnnotationKind::Room), "p_floor_annotation.json");
        assert_eq!(
            export_file_name("p", AnnotationKind::WindowDoor),
            "p_window&door_annotation.json"
        );
    }
}
