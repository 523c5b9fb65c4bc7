//! Pixel to real-world unit conversion
//!
//! Every function snaps coordinates to the nearest whole pixel (ties to even)
//! before measuring. Dimension results are rounded to two decimals, area is
//! returned unrounded.

use geo::{Area, Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};
use unified_detector::PixelPoint;

use crate::error::{PipelineError, PipelineResult};

/// Drawing-scale ratio assumed when an upload does not supply one
pub const DEFAULT_SCALE: f64 = 2.1;

/// Absolute difference below which a calibration edit is ignored
pub const CALIBRATION_TOLERANCE: f64 = 0.01;

/// Per-image calibration; both values strictly positive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub dpi: f64,
    pub scale: f64,
}

impl Calibration {
    pub fn new(dpi: f64, scale: f64) -> PipelineResult<Self> {
        if !(dpi.is_finite() && dpi > 0.0) {
            return Err(PipelineError::CalibrationMissing(format!("dpi must be positive, got {}", dpi)));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(PipelineError::CalibrationMissing(format!(
                "scale must be positive, got {}",
                scale
            )));
        }
        Ok(Self { dpi, scale })
    }

    /// Calibration from the nullable values stored on an image
    pub fn from_parts(dpi: Option<u32>, scale: Option<f64>) -> PipelineResult<Self> {
        let dpi = dpi.ok_or_else(|| PipelineError::CalibrationMissing("dpi is not set".to_string()))?;
        let scale =
            scale.ok_or_else(|| PipelineError::CalibrationMissing("scale is not set".to_string()))?;
        Self::new(f64::from(dpi), scale)
    }

    pub fn feet_per_pixel(&self) -> f64 {
        (1.0 / self.dpi) / self.scale
    }
}

/// Whether a stored calibration value should be considered edited.
/// Going from unset to set (or back) always counts.
pub fn calibration_changed(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => (old - new).abs() > CALIBRATION_TOLERANCE,
        (None, None) => false,
        _ => true,
    }
}

/// Polygon area in square feet (shoelace over the snapped ring)
pub fn area_sqft(points: &[PixelPoint], calibration: &Calibration) -> PipelineResult<f64> {
    let snapped = snap(points)?;
    if snapped.len() < 3 {
        return Err(PipelineError::InvalidGeometry(format!(
            "area needs at least 3 points, got {}",
            snapped.len()
        )));
    }

    let pixel_area = Polygon::new(LineString::from(snapped), vec![]).unsigned_area();
    Ok(pixel_area * calibration.feet_per_pixel().powi(2))
}

/// Axis-aligned extents in feet as `(x_extent, y_extent)`
pub fn bounding_dimensions(points: &[PixelPoint], calibration: &Calibration) -> PipelineResult<(f64, f64)> {
    let snapped = snap(points)?;
    let (width_px, height_px) = extents(&snapped);
    let fpp = calibration.feet_per_pixel();

    Ok((round2(width_px * fpp), round2(height_px * fpp)))
}

/// Wall `(length, thickness)`: the x extent and the y extent.
///
/// Only meaningful for rectangles aligned with the image axes; a rotated wall
/// reports its bounding box, not its true thickness.
pub fn wall_dimensions(points: &[PixelPoint], calibration: &Calibration) -> PipelineResult<(f64, f64)> {
    bounding_dimensions(points, calibration)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn snap(points: &[PixelPoint]) -> PipelineResult<Vec<Coord>> {
    if points.is_empty() {
        return Err(PipelineError::InvalidGeometry("no points".to_string()));
    }

    points
        .iter()
        .map(|&[x, y]| {
            if x.is_finite() && y.is_finite() {
                Ok(Coord {
                    x: x.round_ties_even(),
                    y: y.round_ties_even(),
                })
            } else {
                Err(PipelineError::InvalidGeometry(format!(
                    "non-numeric coordinate ({}, {})",
                    x, y
                )))
            }
        })
        .collect()
}

fn extents(coords: &[Coord]) -> (f64, f64) {
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);

    for c in coords {
        min_x = min_x.min(c.x);
        max_x = max_x.max(c.x);
        min_y = min_y.min(c.y);
        max_y = max_y.max(c.y);
    }

    (max_x - min_x, max_y - min_y)
}
