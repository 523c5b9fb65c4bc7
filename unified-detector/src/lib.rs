use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod adapter;
pub mod contour;
pub mod registry;
pub mod yolo;

pub use adapter::{box_to_rectangle, DetectionAdapter, LabelPolicy};
pub use contour::ContourSimplifier;
pub use registry::{ModelRegistry, RegisteredModel};
pub use yolo::{HttpYoloDetector, StaticDetector, YoloConfig, YoloDetector};

/// Pixel coordinate `[x, y]` in source-image space
pub type PixelPoint = [f64; 2];

/// The three annotation families produced by the pipeline, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Room,
    Wall,
    WindowDoor,
}

impl AnnotationKind {
    pub const CHAIN: [AnnotationKind; 3] = [Self::Room, Self::Wall, Self::WindowDoor];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Wall => "wall",
            Self::WindowDoor => "window_door",
        }
    }

    /// Stage that follows this one in the creation chain
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Room => Some(Self::Wall),
            Self::Wall => Some(Self::WindowDoor),
            Self::WindowDoor => None,
        }
    }

    /// Room detectors segment, the others draw boxes
    pub fn shape_type(&self) -> ShapeType {
        match self {
            Self::Room => ShapeType::Polygon,
            Self::Wall | Self::WindowDoor => ShapeType::Rectangle,
        }
    }
}

impl std::fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Polygon,
    Rectangle,
}

/// Normalized detector output, consumed immediately by the materializer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub label: String,
    pub points: Vec<PixelPoint>,
    pub shape_type: ShapeType,
    pub confidence: Option<f64>,
}

/// Box-detector hit in `[x1, y1, x2, y2]` form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
    pub class_id: usize,
    pub xyxy: [f64; 4],
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Segmentation hit; `polygon` is the mask outline in image pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskDetection {
    pub class_id: usize,
    pub polygon: Vec<PixelPoint>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Raw detector output. `probs`, when present, is indexed like `detections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionResult {
    Boxes {
        detections: Vec<BoxDetection>,
        #[serde(default)]
        probs: Option<Vec<f64>>,
    },
    Masks {
        detections: Vec<MaskDetection>,
        #[serde(default)]
        probs: Option<Vec<f64>>,
    },
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        match self {
            Self::Boxes { detections, .. } => detections.len(),
            Self::Masks { detections, .. } => detections.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Confidence for detection `index`: probability vector first, then the
    /// detection's own score, otherwise none.
    pub fn confidence(&self, index: usize) -> Option<f64> {
        let (probs, own) = match self {
            Self::Boxes { detections, probs } => {
                (probs, detections.get(index).and_then(|d| d.confidence))
            }
            Self::Masks { detections, probs } => {
                (probs, detections.get(index).and_then(|d| d.confidence))
            }
        };

        probs
            .as_ref()
            .and_then(|p| p.get(index).copied())
            .or(own)
    }
}

/// One inference call's worth of output plus the model's class table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default)]
    pub names: HashMap<usize, String>,
    pub result: DetectionResult,
}

impl Prediction {
    pub fn class_name(&self, class_id: usize) -> Option<&str> {
        self.names.get(&class_id).map(String::as_str)
    }
}
