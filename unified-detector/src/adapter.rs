//! Detection adapter: normalizes raw detector output into `Shape` records
//!
//! Box results become four-point rectangles, mask results go through the
//! contour simplifier. The adapter never mutates the prediction it reads.

use tracing::{debug, info, warn};

use crate::contour::ContourSimplifier;
use crate::{DetectionResult, PixelPoint, Prediction, Shape, ShapeType};

/// How a model's class name becomes an annotation label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelPolicy {
    /// Use the class name as-is
    #[default]
    FullName,
    /// Keep only the first whitespace-delimited token ("wall exterior" -> "wall")
    FirstToken,
}

impl LabelPolicy {
    pub fn apply(&self, name: &str) -> String {
        match self {
            Self::FullName => name.to_string(),
            Self::FirstToken => name.split_whitespace().next().unwrap_or(name).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionAdapter {
    simplifier: ContourSimplifier,
}

impl DetectionAdapter {
    pub fn new(simplifier: ContourSimplifier) -> Self {
        Self { simplifier }
    }

    /// Convert every detection of `prediction` into a shape.
    ///
    /// Masks with no surviving contour are dropped; an empty result yields an
    /// empty vector.
    pub fn adapt(&self, prediction: &Prediction, policy: LabelPolicy) -> Vec<Shape> {
        if prediction.result.is_empty() {
            info!("Detector returned no detections");
            return Vec::new();
        }

        let shapes: Vec<Shape> = match &prediction.result {
            DetectionResult::Boxes { detections, .. } => detections
                .iter()
                .enumerate()
                .map(|(idx, det)| Shape {
                    label: resolve_label(prediction, det.class_id, policy),
                    points: box_to_rectangle(det.xyxy),
                    shape_type: ShapeType::Rectangle,
                    confidence: prediction.result.confidence(idx),
                })
                .collect(),
            DetectionResult::Masks { detections, .. } => detections
                .iter()
                .enumerate()
                .filter_map(|(idx, det)| {
                    let Some(points) = self.simplifier.simplify(
                        &det.polygon,
                        prediction.image_width,
                        prediction.image_height,
                    ) else {
                        debug!("Mask {} dropped: no contour survived erosion", idx);
                        return None;
                    };

                    Some(Shape {
                        label: resolve_label(prediction, det.class_id, policy),
                        points,
                        shape_type: ShapeType::Polygon,
                        confidence: prediction.result.confidence(idx),
                    })
                })
                .collect(),
        };

        if shapes.is_empty() {
            info!("All {} detections dropped during adaptation", prediction.result.len());
        } else {
            debug!("Adapted {} of {} detections", shapes.len(), prediction.result.len());
        }

        shapes
    }
}

/// Clockwise rectangle for an `[x1, y1, x2, y2]` box
pub fn box_to_rectangle(xyxy: [f64; 4]) -> Vec<PixelPoint> {
    let [x1, y1, x2, y2] = xyxy;
    vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
}

fn resolve_label(prediction: &Prediction, class_id: usize, policy: LabelPolicy) -> String {
    match prediction.class_name(class_id) {
        Some(name) => policy.apply(name),
        None => {
            warn!("Class id {} missing from model class table", class_id);
            format!("class_{}", class_id)
        }
    }
}
