//! Contour simplification for segmentation masks
//!
//! A mask outline is rasterized onto a canvas the size of the source image,
//! eroded once with a 3x3 kernel to shave off slivers, traced for external
//! contours only, and the largest one is reduced with Douglas-Peucker at a
//! tolerance proportional to its perimeter.

use geo::{Area, Coord, LineString, Polygon};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::erode;
use imageproc::point::Point;
use ordered_float::OrderedFloat;
use tracing::debug;

use crate::PixelPoint;

/// Douglas-Peucker tolerance as a fraction of the contour perimeter
pub const DEFAULT_EPSILON_RATIO: f64 = 0.01;

/// Erosion radius under the L-infinity norm; 1 is a 3x3 square kernel
pub const DEFAULT_EROSION_RADIUS: u8 = 1;

#[derive(Debug, Clone)]
pub struct ContourSimplifier {
    pub epsilon_ratio: f64,
    pub erosion_radius: u8,
}

impl Default for ContourSimplifier {
    fn default() -> Self {
        Self {
            epsilon_ratio: DEFAULT_EPSILON_RATIO,
            erosion_radius: DEFAULT_EROSION_RADIUS,
        }
    }
}

impl ContourSimplifier {
    /// Reduce a mask outline to a minimal polygon.
    ///
    /// Returns `None` when nothing survives erosion or the result has fewer
    /// than three vertices; callers treat that as a dropped detection.
    pub fn simplify(&self, mask: &[PixelPoint], width: u32, height: u32) -> Option<Vec<PixelPoint>> {
        let canvas = rasterize_mask(mask, width, height)?;
        let eroded = erode(&canvas, Norm::LInf, self.erosion_radius);

        let contour = largest_external_contour(&eroded)?;
        if contour.points.len() < 3 {
            debug!("Contour too small after erosion ({} points)", contour.points.len());
            return None;
        }

        let epsilon = self.epsilon_ratio * arc_length(&contour.points, true);
        if epsilon <= 0.0 {
            return None;
        }

        let simplified = approximate_polygon_dp(&contour.points, epsilon, true);
        if simplified.len() < 3 {
            debug!("Simplified contour collapsed to {} points", simplified.len());
            return None;
        }

        Some(
            simplified
                .iter()
                .map(|p| [round2(p.x as f64), round2(p.y as f64)])
                .collect(),
        )
    }
}

/// Fill a mask outline onto a blank canvas. Coordinates are truncated to
/// whole pixels.
pub fn rasterize_mask(mask: &[PixelPoint], width: u32, height: u32) -> Option<GrayImage> {
    if width == 0 || height == 0 {
        return None;
    }

    let mut vertices: Vec<Point<i32>> = Vec::with_capacity(mask.len());
    for &[x, y] in mask {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let vertex = Point::new(x as i32, y as i32);
        if vertices.last() != Some(&vertex) {
            vertices.push(vertex);
        }
    }

    // draw_polygon_mut rejects an explicitly closed ring
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    if vertices.len() < 3 {
        return None;
    }

    let mut canvas = GrayImage::new(width, height);
    draw_polygon_mut(&mut canvas, &vertices, Luma([255u8]));
    Some(canvas)
}

fn largest_external_contour(mask: &GrayImage) -> Option<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .max_by_key(|c| OrderedFloat(contour_area(&c.points)))
}

fn contour_area(points: &[Point<i32>]) -> f64 {
    let ring: Vec<Coord> = points
        .iter()
        .map(|p| Coord { x: p.x as f64, y: p.y as f64 })
        .collect();

    Polygon::new(LineString::from(ring), vec![]).unsigned_area()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Vec<PixelPoint> {
        vec![[min, min], [max, min], [max, max], [min, max]]
    }

    #[test]
    fn test_square_mask_simplifies_to_four_corners() {
        let simplifier = ContourSimplifier::default();
        let points = simplifier.simplify(&square(10.0, 50.0), 64, 64).unwrap();

        assert_eq!(points.len(), 4);
        for [x, y] in &points {
            // Erosion pulls each edge in by one pixel
            assert!((10.0..=50.0).contains(x), "x out of range: {}", x);
            assert!((10.0..=50.0).contains(y), "y out of range: {}", y);
        }
    }

    #[test]
    fn test_sliver_is_dropped_by_erosion() {
        let simplifier = ContourSimplifier::default();
        let sliver = vec![[5.0, 5.0], [6.0, 5.0], [6.0, 30.0], [5.0, 30.0]];

        assert!(simplifier.simplify(&sliver, 64, 64).is_none());
    }

    #[test]
    fn test_largest_contour_wins_when_erosion_splits_mask() {
        // Big square joined to a small one by a two-pixel corridor
        let mask = vec![
            [2.0, 2.0],
            [40.0, 2.0],
            [40.0, 20.0],
            [50.0, 20.0],
            [50.0, 15.0],
            [60.0, 15.0],
            [60.0, 25.0],
            [50.0, 25.0],
            [50.0, 21.0],
            [40.0, 21.0],
            [40.0, 40.0],
            [2.0, 40.0],
        ];

        let points = ContourSimplifier::default().simplify(&mask, 64, 64).unwrap();
        assert!(points.iter().all(|[x, _]| *x <= 40.0));
    }

    #[test]
    fn test_degenerate_masks() {
        assert!(rasterize_mask(&[], 10, 10).is_none());
        assert!(rasterize_mask(&[[1.0, 1.0], [5.0, 5.0]], 10, 10).is_none());
        assert!(rasterize_mask(&square(1.0, 5.0), 0, 10).is_none());
        assert!(rasterize_mask(&[[f64::NAN, 1.0], [5.0, 5.0], [1.0, 5.0]], 10, 10).is_none());
    }

    #[test]
    fn test_closed_ring_is_accepted() {
        let mut ring = square(2.0, 8.0);
        ring.push([2.0, 2.0]);

        let canvas = rasterize_mask(&ring, 10, 10).unwrap();
        assert_eq!(canvas.get_pixel(5, 5)[0], 255);
        assert_eq!(canvas.get_pixel(0, 0)[0], 0);
    }
}
