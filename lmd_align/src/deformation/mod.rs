//! Deformation fields mapping atlas plane coordinates to section pixels.
//!
//! A field is an affine seed plus a correction:
//!
//! ```text
//! pixel(uv) = seed(uv) + correction(uv)
//! ```
//!
//! where `uv` are millimetres in the section's cutting plane and the
//! correction is a displacement in section pixels.

pub mod exchange;
mod grid;
pub mod tps;

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::atlas::SlicePlane;
use crate::error::{Error, Result};
use crate::frames::CoordinateFrame;
use crate::transform::AffineTransform;

pub use grid::DisplacementGrid;
pub use tps::{ThinPlateSpline, TpsConfig};

const MAX_INVERSE_ITERATIONS: usize = 100;
const INVERSE_TOLERANCE_PX: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Correction {
    /// Affine-only field.
    #[default]
    None,
    /// Lattice displacements from the non-rigid solver.
    Grid(DisplacementGrid),
    /// Scattered-marker correction from manual adjustment.
    Spline(ThinPlateSpline),
}

impl Correction {
    pub fn displacement(&self, uv: DVec2) -> DVec2 {
        match self {
            Correction::None => DVec2::ZERO,
            Correction::Grid(grid) => grid.sample(uv),
            Correction::Spline(tps) => tps.transform(uv),
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Correction::None => true,
            Correction::Grid(grid) => grid.is_finite(),
            Correction::Spline(tps) => tps.is_finite(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Correction::None)
    }
}

/// Forward/inverse mapping between AtlasPhysical and SectionPixel for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FieldData")]
pub struct DeformationField {
    plane: SlicePlane,
    seed: AffineTransform,
    correction: Correction,
}

#[derive(Deserialize)]
struct FieldData {
    plane: SlicePlane,
    seed: AffineTransform,
    correction: Correction,
}

impl TryFrom<FieldData> for DeformationField {
    type Error = Error;

    fn try_from(data: FieldData) -> Result<Self> {
        Self::new(data.plane, data.seed, data.correction)
    }
}

impl DeformationField {
    /// `seed` must map AtlasPhysical plane coordinates to SectionPixel.
    pub fn new(plane: SlicePlane, seed: AffineTransform, correction: Correction) -> Result<Self> {
        if seed.from != CoordinateFrame::AtlasPhysical {
            return Err(Error::FrameMismatch {
                expected: CoordinateFrame::AtlasPhysical,
                actual: seed.from,
            });
        }
        if seed.to != CoordinateFrame::SectionPixel {
            return Err(Error::FrameMismatch {
                expected: CoordinateFrame::SectionPixel,
                actual: seed.to,
            });
        }
        seed.inverse()?;
        if !correction.is_finite() {
            return Err(Error::DegenerateTransform(
                "correction contains non-finite values".to_string(),
            ));
        }
        Ok(Self {
            plane,
            seed,
            correction,
        })
    }

    pub fn from_affine(plane: SlicePlane, seed: AffineTransform) -> Result<Self> {
        Self::new(plane, seed, Correction::None)
    }

    pub fn plane(&self) -> &SlicePlane {
        &self.plane
    }

    pub fn seed(&self) -> &AffineTransform {
        &self.seed
    }

    pub fn correction(&self) -> &Correction {
        &self.correction
    }

    /// Same seed with the correction dropped.
    pub fn affine_only(&self) -> DeformationField {
        DeformationField {
            plane: self.plane,
            seed: self.seed,
            correction: Correction::None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.seed.transform.matrix.is_finite() && self.correction.is_finite()
    }

    pub fn map_plane(&self, uv: DVec2) -> DVec2 {
        self.seed.apply_xy(uv) + self.correction.displacement(uv)
    }

    /// Plane coordinates that map to `pixel`.
    ///
    /// Fixed-point iteration on the seed inverse; fails with
    /// `DegenerateTransform` if the correction folds the field.
    pub fn inverse_map_plane(&self, pixel: DVec2) -> Result<DVec2> {
        let inverse = self.seed.inverse()?;
        let mut uv = inverse.apply_xy(pixel);
        if self.correction.is_none() {
            return Ok(uv);
        }
        let tolerance = INVERSE_TOLERANCE_PX * pixel.length().max(1.0);
        for _ in 0..MAX_INVERSE_ITERATIONS {
            let error = pixel - self.map_plane(uv);
            if !error.is_finite() {
                break;
            }
            if error.length() < tolerance {
                return Ok(uv);
            }
            uv += inverse.transform.matrix.transform_vector(error);
        }
        Err(Error::DegenerateTransform(format!(
            "inverse mapping of pixel {pixel} did not converge"
        )))
    }

    /// AtlasPhysical point to SectionPixel; `z` of the result is the signed
    /// distance from the cutting plane in mm.
    pub fn map_point(&self, physical: DVec3) -> DVec3 {
        let (uv, depth) = self.plane.project(physical);
        self.map_plane(uv).extend(depth)
    }

    pub fn inverse_map_point(&self, pixel: DVec3) -> Result<DVec3> {
        let uv = self.inverse_map_plane(pixel.truncate())?;
        Ok(self.plane.point_at(uv, pixel.z))
    }

    /// Maps a closed ring of plane coordinates into section pixels, first
    /// inserting points so no input edge is longer than `max_spacing_mm`.
    pub fn map_polygon(&self, ring: &[DVec2], max_spacing_mm: f64) -> Result<Vec<DVec2>> {
        Ok(densify_closed(ring, max_spacing_mm)?
            .into_iter()
            .map(|uv| self.map_plane(uv))
            .collect())
    }

    /// Composes the field with the section's SectionPixel -> DeviceStage transform.
    pub fn to_stage<'a>(&'a self, stage: &'a AffineTransform) -> Result<StageMapping<'a>> {
        if stage.from != CoordinateFrame::SectionPixel || stage.to != CoordinateFrame::DeviceStage
        {
            return Err(Error::FrameMismatch {
                expected: CoordinateFrame::SectionPixel,
                actual: stage.from,
            });
        }
        Ok(StageMapping { field: self, stage })
    }
}

/// Plane coordinates straight to stage coordinates.
#[derive(Debug, Clone, Copy)]
pub struct StageMapping<'a> {
    field: &'a DeformationField,
    stage: &'a AffineTransform,
}

impl StageMapping<'_> {
    pub fn map_plane(&self, uv: DVec2) -> DVec2 {
        self.stage.apply_xy(self.field.map_plane(uv))
    }

    pub fn map_polygon(&self, ring: &[DVec2], max_spacing_mm: f64) -> Result<Vec<DVec2>> {
        Ok(self
            .field
            .map_polygon(ring, max_spacing_mm)?
            .into_iter()
            .map(|p| self.stage.apply_xy(p))
            .collect())
    }
}

/// Inserts evenly spaced points along every edge of a closed ring, closing
/// edge included, so consecutive points are at most `max_spacing` apart.
pub(crate) fn densify_closed(ring: &[DVec2], max_spacing: f64) -> Result<Vec<DVec2>> {
    if !max_spacing.is_finite() || max_spacing <= 0.0 {
        return Err(Error::invalid(
            "max_spacing_mm",
            format!("{max_spacing} must be positive"),
        ));
    }
    let mut out = Vec::with_capacity(ring.len());
    for (i, &start) in ring.iter().enumerate() {
        let end = ring[(i + 1) % ring.len()];
        out.push(start);
        let steps = (start.distance(end) / max_spacing).ceil() as usize;
        for k in 1..steps {
            out.push(start.lerp(end, k as f64 / steps as f64));
        }
    }
    Ok(out)
}
