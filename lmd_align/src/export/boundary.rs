//! Region boundaries on a plane raster: mask, contour tracing, simplification
//! and polygon checks. All geometry here is in raster pixel units unless noted.

use glam::DVec2;
use hashbrown::HashSet;
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::atlas::PlaneRaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RingKind {
    /// Outer border of one island of the region.
    Outer,
    /// Border of a hole inside an island.
    Hole,
}

/// Binary mask of raster pixels whose label is in `labels`, and its pixel count.
pub fn region_mask(raster: &PlaneRaster<u32>, labels: &HashSet<u32>) -> (GrayImage, usize) {
    let (w, h) = (raster.width(), raster.height());
    let mut mask = GrayImage::new(w as u32, h as u32);
    let mut count = 0;
    for (i, label) in raster.buffer.pixels().iter().enumerate() {
        if labels.contains(label) {
            mask.put_pixel((i % w) as u32, (i / w) as u32, Luma([255]));
            count += 1;
        }
    }
    (mask, count)
}

/// Borders of every foreground component and hole, in pixel coordinates.
///
/// Rings run along pixel edges, so a pixel `(x, y)` is enclosed by the square
/// from `(x - 0.5, y - 0.5)` to `(x + 0.5, y + 0.5)` and a one-pixel-wide
/// region still has a ring with area. The mask is traced at twice the
/// resolution with each pixel covering a 3x3 block whose outer rows and
/// columns coincide with its corners; concave corners come out cut off by
/// a half-pixel diagonal step.
pub fn trace_rings(mask: &GrayImage) -> Vec<(RingKind, Vec<DVec2>)> {
    let (w, h) = mask.dimensions();
    let mut corners = GrayImage::new(2 * w + 1, 2 * h + 1);
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] == 0 {
            continue;
        }
        for dy in 0..3 {
            for dx in 0..3 {
                corners.put_pixel(2 * x + dx, 2 * y + dy, Luma([255]));
            }
        }
    }

    find_contours::<u32>(&corners)
        .into_iter()
        .map(|contour| {
            let kind = match contour.border_type {
                BorderType::Outer => RingKind::Outer,
                BorderType::Hole => RingKind::Hole,
            };
            let points = contour
                .points
                .iter()
                .map(|p| DVec2::new(p.x as f64 * 0.5 - 0.5, p.y as f64 * 0.5 - 0.5))
                .collect();
            (kind, points)
        })
        .collect()
}

// =============================================================================
// Simplification
// =============================================================================

fn point_segment_distance(p: DVec2, a: DVec2, b: DVec2) -> f64 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq == 0.0 {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

/// Douglas-Peucker on an open polyline; keeps both end points.
fn simplify_open(points: &[DVec2], tolerance: f64, keep: &mut [bool]) {
    if points.len() < 3 {
        return;
    }
    let (first, last) = (points[0], points[points.len() - 1]);
    let (index, distance) = points[1..points.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, &p)| (i + 1, point_segment_distance(p, first, last)))
        .fold((0, -1.0), |best, cur| if cur.1 > best.1 { cur } else { best });
    if distance > tolerance {
        keep[index] = true;
        simplify_open(&points[..=index], tolerance, &mut keep[..=index]);
        simplify_open(&points[index..], tolerance, &mut keep[index..]);
    }
}

/// Douglas-Peucker on a closed ring. The ring is split at the first point and
/// the point farthest from it; each half is simplified independently.
pub fn simplify_closed(ring: &[DVec2], tolerance: f64) -> Vec<DVec2> {
    if ring.len() <= 3 {
        return ring.to_vec();
    }
    let anchor = ring[0];
    let split = ring
        .iter()
        .enumerate()
        .skip(1)
        .fold((1, -1.0), |best, (i, p)| {
            let d = p.distance(anchor);
            if d > best.1 { (i, d) } else { best }
        })
        .0;

    let mut closed: Vec<DVec2> = ring.to_vec();
    closed.push(anchor);
    let mut keep = vec![false; closed.len()];
    keep[0] = true;
    keep[split] = true;
    simplify_open(&closed[..=split], tolerance, &mut keep[..=split]);
    simplify_open(&closed[split..], tolerance, &mut keep[split..]);

    closed
        .iter()
        .zip(&keep)
        .take(ring.len())
        .filter_map(|(p, &k)| k.then_some(*p))
        .collect()
}

/// Simplifies with `tolerance`, doubling it until at most `max_vertices` remain.
pub fn simplify_capped(ring: &[DVec2], tolerance: f64, max_vertices: usize) -> Vec<DVec2> {
    let mut tolerance = tolerance.max(0.0);
    let mut simplified = simplify_closed(ring, tolerance);
    while simplified.len() > max_vertices.max(3) {
        tolerance = if tolerance > 0.0 { tolerance * 2.0 } else { 0.5 };
        simplified = simplify_closed(&simplified, tolerance);
    }
    simplified
}

// =============================================================================
// Polygon checks
// =============================================================================

/// Shoelace area; positive for counter-clockwise rings in a y-up frame.
pub fn signed_area(ring: &[DVec2]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| ring[i].perp_dot(ring[(i + 1) % n]))
        .sum::<f64>()
        * 0.5
}

fn orientation(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    (b - a).perp_dot(c - a)
}

fn segments_cross(a: DVec2, b: DVec2, c: DVec2, d: DVec2) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    o1 * o2 < 0.0 && o3 * o4 < 0.0
}

/// True if two non-adjacent edges of the closed ring properly cross.
/// Touching vertices are not counted.
pub fn is_self_intersecting(ring: &[DVec2]) -> bool {
    let n = ring.len();
    if n < 4 {
        return false;
    }
    for i in 0..n {
        let (a, b) = (ring[i], ring[(i + 1) % n]);
        for j in (i + 2)..n {
            if i == 0 && j == n - 1 {
                continue;
            }
            let (c, d) = (ring[j], ring[(j + 1) % n]);
            if segments_cross(a, b, c, d) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer2::Buffer2;

    fn raster(width: usize, height: usize, label: impl Fn(usize, usize) -> u32) -> PlaneRaster<u32> {
        let pixels = (0..width * height)
            .map(|i| label(i % width, i / width))
            .collect();
        PlaneRaster {
            origin: DVec2::ZERO,
            spacing_mm: 0.1,
            buffer: Buffer2::new(width, height, pixels).unwrap(),
        }
    }

    #[test]
    fn test_mask_counts_selected_labels() {
        let raster = raster(10, 10, |x, _| if x < 4 { 1 } else { 2 });
        let labels: HashSet<u32> = [1].into_iter().collect();
        let (mask, count) = region_mask(&raster, &labels);
        assert_eq!(count, 40);
        assert_eq!(mask.get_pixel(0, 0)[0], 255);
        assert_eq!(mask.get_pixel(5, 0)[0], 0);
    }

    #[test]
    fn test_square_with_hole_gives_outer_and_hole() {
        // 12x12 square with a 4x4 hole in the middle.
        let raster = raster(20, 20, |x, y| {
            let inside = (4..16).contains(&x) && (4..16).contains(&y);
            let hole = (8..12).contains(&x) && (8..12).contains(&y);
            u32::from(inside && !hole)
        });
        let labels: HashSet<u32> = [1].into_iter().collect();
        let (mask, _) = region_mask(&raster, &labels);
        let rings = trace_rings(&mask);

        let outers = rings.iter().filter(|r| r.0 == RingKind::Outer).count();
        let holes = rings.iter().filter(|r| r.0 == RingKind::Hole).count();
        assert_eq!(outers, 1);
        assert_eq!(holes, 1);

        let area = |kind: RingKind| {
            let ring = &rings.iter().find(|r| r.0 == kind).unwrap().1;
            signed_area(&simplify_closed(ring, 0.1)).abs()
        };
        assert!((area(RingKind::Outer) - 144.0).abs() < 1e-9);
        // Concave corners are cut off diagonally.
        let hole = area(RingKind::Hole);
        assert!((15.0..=16.0).contains(&hole), "hole area {hole}");
    }

    #[test]
    fn test_single_pixel_wide_strip_keeps_its_area() {
        let raster = raster(10, 30, |x, y| u32::from(x == 4 && (5..25).contains(&y)));
        let labels: HashSet<u32> = [1].into_iter().collect();
        let (mask, count) = region_mask(&raster, &labels);
        assert_eq!(count, 20);

        let rings = trace_rings(&mask);
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].0, RingKind::Outer);

        let simplified = simplify_capped(&rings[0].1, 0.5, 2000);
        assert_eq!(simplified.len(), 4);
        assert!((signed_area(&simplified).abs() - 20.0).abs() < 1e-9);
        for corner in [DVec2::new(3.5, 4.5), DVec2::new(4.5, 24.5)] {
            assert!(simplified.contains(&corner), "missing corner {corner}");
        }
        assert!(!is_self_intersecting(&simplified));
    }

    #[test]
    fn test_single_pixel_ring_is_the_pixel_square() {
        let raster = raster(3, 3, |x, y| u32::from(x == 1 && y == 1));
        let labels: HashSet<u32> = [1].into_iter().collect();
        let (mask, _) = region_mask(&raster, &labels);
        let rings = trace_rings(&mask);
        assert_eq!(rings.len(), 1);
        let simplified = simplify_closed(&rings[0].1, 0.1);
        assert!((signed_area(&simplified).abs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_islands() {
        let raster = raster(20, 10, |x, y| {
            u32::from((2..6).contains(&y) && ((2..6).contains(&x) || (12..18).contains(&x)))
        });
        let labels: HashSet<u32> = [1].into_iter().collect();
        let (mask, count) = region_mask(&raster, &labels);
        assert_eq!(count, 4 * 4 + 6 * 4);
        let rings = trace_rings(&mask);
        assert_eq!(rings.len(), 2);
        assert!(rings.iter().all(|r| r.0 == RingKind::Outer));
    }

    #[test]
    fn test_simplify_square_outline_keeps_corners() {
        // Dense outline of the square (0,0)-(10,10).
        let mut ring = Vec::new();
        for i in 0..10 {
            ring.push(DVec2::new(i as f64, 0.0));
        }
        for i in 0..10 {
            ring.push(DVec2::new(10.0, i as f64));
        }
        for i in 0..10 {
            ring.push(DVec2::new(10.0 - i as f64, 10.0));
        }
        for i in 0..10 {
            ring.push(DVec2::new(0.0, 10.0 - i as f64));
        }
        let simplified = simplify_closed(&ring, 0.1);
        assert_eq!(simplified.len(), 4);
        for corner in [
            DVec2::new(0.0, 0.0),
            DVec2::new(10.0, 0.0),
            DVec2::new(10.0, 10.0),
            DVec2::new(0.0, 10.0),
        ] {
            assert!(simplified.contains(&corner), "missing corner {corner}");
        }
        assert!((signed_area(&simplified).abs() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_vertex_cap_is_enforced() {
        let ring: Vec<DVec2> = (0..400)
            .map(|i| {
                let t = i as f64 / 400.0 * std::f64::consts::TAU;
                DVec2::new(t.cos(), t.sin()) * (50.0 + 3.0 * (7.0 * t).sin())
            })
            .collect();
        let capped = simplify_capped(&ring, 0.01, 20);
        assert!(capped.len() <= 20);
        assert!(capped.len() >= 3);
    }

    #[test]
    fn test_self_intersection() {
        let square = [
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 0.0),
            DVec2::new(1.0, 1.0),
            DVec2::new(0.0, 1.0),
        ];
        assert!(!is_self_intersecting(&square));

        let bow_tie = [
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 1.0),
            DVec2::new(1.0, 0.0),
            DVec2::new(0.0, 1.0),
        ];
        assert!(is_self_intersecting(&bow_tie));
        assert!(signed_area(&bow_tie).abs() < 1e-12);
    }
}
