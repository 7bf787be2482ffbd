//! Synthetic atlases, sections and slides for tests.

#![allow(dead_code)]

use std::sync::Arc;

use glam::{DVec2, DVec3};

use crate::atlas::{Atlas, AtlasGeometry, SliceParams, SlicePlane, Volume};
use crate::buffer2::Buffer2;
use crate::calibration::{CalibrationPoint, StageCalibration};
use crate::deformation::DeformationField;
use crate::frames::CoordinateFrame;
use crate::regions::{RegionId, RegionRecord, RegionTree};
use crate::transform::{AffineTransform, Transform};

pub const ROOT: RegionId = RegionId(1);
pub const CORTEX_A: RegionId = RegionId(2);
pub const CORTEX_B: RegionId = RegionId(3);
/// Only present in the last axis-0 layer, never on the central plane.
pub const HIDDEN: RegionId = RegionId(4);

pub const PIXELS_PER_MM: f64 = 100.0;
pub const SECTION_SIZE: (usize, usize) = (200, 200);
pub const VOXEL_SIZE_MM: f64 = 0.05;
pub const DISC_RADIUS_MM: f64 = 0.8;

/// Initialize tracing subscriber for tests.
/// Safe to call multiple times. Respects RUST_LOG, defaults to "info".
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn geometry() -> AtlasGeometry {
    AtlasGeometry::new([11, 41, 41], DVec3::splat(VOXEL_SIZE_MM)).unwrap()
}

/// Root → {CortexA, CortexB}; Root owns the strip between its children.
pub fn region_records(with_hidden: bool) -> Vec<RegionRecord> {
    let mut records = vec![
        RegionRecord::new(ROOT.0, "Root", None),
        RegionRecord::new(CORTEX_A.0, "CortexA", Some(ROOT.0)),
        RegionRecord::new(CORTEX_B.0, "CortexB", Some(ROOT.0)),
    ];
    if with_hidden {
        records.push(RegionRecord::new(HIDDEN.0, "Hidden", Some(ROOT.0)));
    }
    records
}

pub fn intensity(label: u32) -> f32 {
    match label {
        1 => 0.5,
        2 => 1.0,
        3 => 2.0,
        4 => 3.0,
        _ => 0.0,
    }
}

/// A disc of radius 0.8 mm in every axis-0 layer: `z < -0.1` is CortexA,
/// `z > 0.1` CortexB, the strip in between Root.
pub fn atlas(with_hidden: bool) -> Atlas {
    let geometry = geometry();
    let [nx, ny, nz] = geometry.shape;
    let mut labels = Volume::filled(geometry, 0u32);
    let mut reference = Volume::filled(geometry, 0f32);
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let p = geometry.voxel_to_physical(DVec3::new(i as f64, j as f64, k as f64));
                if p.y * p.y + p.z * p.z > DISC_RADIUS_MM * DISC_RADIUS_MM {
                    continue;
                }
                let label = if with_hidden && i == nx - 1 {
                    HIDDEN.0
                } else if p.z < -0.1 {
                    CORTEX_A.0
                } else if p.z > 0.1 {
                    CORTEX_B.0
                } else {
                    ROOT.0
                };
                labels.set([i, j, k], label);
                reference.set([i, j, k], intensity(label));
            }
        }
    }
    let tree = RegionTree::from_records(region_records(with_hidden)).unwrap();
    Atlas::new(labels, reference, tree).unwrap()
}

pub fn shared_atlas(with_hidden: bool) -> Arc<Atlas> {
    Arc::new(atlas(with_hidden))
}

/// Central coronal plane.
pub fn slice_params() -> SliceParams {
    SliceParams::new(0.0, [0.0, 0.0, 0.0])
}

pub fn plane() -> SlicePlane {
    SlicePlane::from_params(&slice_params())
}

/// `uv ↦ 100·uv + (100, 100)`.
pub fn seed() -> AffineTransform {
    let (w, h) = SECTION_SIZE;
    AffineTransform::new(
        CoordinateFrame::AtlasPhysical,
        CoordinateFrame::SectionPixel,
        Transform::similarity(
            DVec2::new(w as f64 * 0.5, h as f64 * 0.5),
            0.0,
            PIXELS_PER_MM,
        ),
    )
    .unwrap()
}

pub fn affine_field() -> DeformationField {
    DeformationField::from_affine(plane(), seed()).unwrap()
}

/// Section image produced by pulling atlas intensities back through `field`.
pub fn render_section(atlas: &Atlas, field: &DeformationField) -> Buffer2<f32> {
    let (w, h) = SECTION_SIZE;
    let mut image = Buffer2::new_filled(w, h, 0.0f32);
    for y in 0..h {
        for x in 0..w {
            let px = DVec2::new(x as f64, y as f64);
            if let Ok(uv) = field.inverse_map_plane(px) {
                image[(x, y)] = atlas.reference().sample_linear(field.plane().to_physical(uv));
            }
        }
    }
    image
}

/// Calibration marks for `stage = 0.5·pixel + (1000, 2000)`.
pub fn calibration_points() -> Vec<CalibrationPoint> {
    [
        DVec2::new(0.0, 0.0),
        DVec2::new(1000.0, 0.0),
        DVec2::new(0.0, 1000.0),
    ]
    .into_iter()
    .map(|p| CalibrationPoint::new(p, p * 0.5 + DVec2::new(1000.0, 2000.0)))
    .collect()
}

pub fn calibration() -> StageCalibration {
    StageCalibration::from_points(&calibration_points()).unwrap()
}

pub fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() < eps
}

pub fn approx_eq_vec(a: DVec2, b: DVec2, eps: f64) -> bool {
    a.distance(b) < eps
}
