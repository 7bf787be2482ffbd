use glam::{DMat3 as Rotation, DVec2, DVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::atlas::{AtlasGeometry, Volume};
use crate::buffer2::Buffer2;
use crate::error::{Error, Result};

/// Slice position along axis 0 and three tilt angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SliceParams {
    pub position_mm: f64,
    pub rotation_deg: [f64; 3],
}

impl SliceParams {
    pub fn new(position_mm: f64, rotation_deg: [f64; 3]) -> Self {
        Self {
            position_mm,
            rotation_deg,
        }
    }

    /// The first angle spins the section in its own plane (±180°); the
    /// other two tilt it out of plane (±90°).
    pub fn validate(&self) -> Result<()> {
        if !self.position_mm.is_finite() {
            return Err(Error::invalid("position_mm", "must be finite"));
        }
        let limits = [180.0, 90.0, 90.0];
        for (angle, limit) in self.rotation_deg.iter().zip(limits) {
            if !angle.is_finite() || angle.abs() > limit {
                return Err(Error::invalid(
                    "rotation_deg",
                    format!("{angle} is outside ±{limit}"),
                ));
            }
        }
        Ok(())
    }
}

/// An oriented cutting plane through the atlas.
///
/// Plane coordinates `(u, v)` are millimetres within the plane; the physical
/// point is `origin + R·(0, v, u)` with `R = Rx(θ0)·Ry(θ1)·Rz(θ2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlicePlane {
    pub origin: DVec3,
    pub rotation: Rotation,
}

impl SlicePlane {
    pub fn from_params(params: &SliceParams) -> Self {
        let [a, b, c] = params.rotation_deg.map(f64::to_radians);
        let rotation =
            Rotation::from_rotation_x(a) * Rotation::from_rotation_y(b) * Rotation::from_rotation_z(c);
        Self {
            origin: DVec3::new(params.position_mm, 0.0, 0.0),
            rotation,
        }
    }

    pub fn normal(&self) -> DVec3 {
        self.rotation * DVec3::X
    }

    pub fn to_physical(&self, uv: DVec2) -> DVec3 {
        self.point_at(uv, 0.0)
    }

    /// Physical point at plane coordinates `uv`, `depth` mm along the normal.
    pub fn point_at(&self, uv: DVec2, depth: f64) -> DVec3 {
        self.origin + self.rotation * DVec3::new(depth, uv.y, uv.x)
    }

    /// Plane coordinates of `physical` and its signed distance from the plane.
    pub fn project(&self, physical: DVec3) -> (DVec2, f64) {
        let local = self.rotation.transpose() * (physical - self.origin);
        (DVec2::new(local.z, local.y), local.x)
    }

    pub fn sample_labels(
        &self,
        volume: &Volume<u32>,
        spacing_mm: f64,
    ) -> Result<PlaneRaster<u32>> {
        self.rasterize(volume.geometry(), spacing_mm, |p| volume.sample_nearest(p))
    }

    pub fn sample_reference(
        &self,
        volume: &Volume<f32>,
        spacing_mm: f64,
    ) -> Result<PlaneRaster<f32>> {
        self.rasterize(volume.geometry(), spacing_mm, |p| volume.sample_linear(p))
    }

    /// Samples a square window centred on the projection of the volume centre,
    /// wide enough to hold the whole cross-section.
    fn rasterize<T, F>(
        &self,
        geometry: &AtlasGeometry,
        spacing_mm: f64,
        sample: F,
    ) -> Result<PlaneRaster<T>>
    where
        T: Copy + Default + Send + Sync,
        F: Fn(DVec3) -> T + Sync,
    {
        if !spacing_mm.is_finite() || spacing_mm <= 0.0 {
            return Err(Error::invalid("spacing_mm", format!("{spacing_mm} must be positive")));
        }
        let radius = geometry.bounding_radius_mm();
        let n = (2.0 * radius / spacing_mm).ceil() as usize + 1;
        let (centre, _) = self.project(DVec3::ZERO);
        let origin = centre - DVec2::splat((n - 1) as f64 * 0.5 * spacing_mm);

        let mut pixels = vec![T::default(); n * n];
        pixels.par_chunks_mut(n).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let uv = origin + DVec2::new(x as f64, y as f64) * spacing_mm;
                *out = sample(self.to_physical(uv));
            }
        });

        Ok(PlaneRaster {
            origin,
            spacing_mm,
            buffer: Buffer2::new(n, n, pixels)?,
        })
    }
}

/// A regular raster over plane coordinates. Pixel `(x, y)` sits at
/// `origin + (x, y) * spacing_mm`.
#[derive(Debug, Clone)]
pub struct PlaneRaster<T> {
    pub origin: DVec2,
    pub spacing_mm: f64,
    pub buffer: Buffer2<T>,
}

impl<T> PlaneRaster<T> {
    pub fn pixel_to_plane(&self, pixel: DVec2) -> DVec2 {
        self.origin + pixel * self.spacing_mm
    }

    pub fn plane_to_pixel(&self, uv: DVec2) -> DVec2 {
        (uv - self.origin) / self.spacing_mm
    }

    pub fn width(&self) -> usize {
        self.buffer.width()
    }

    pub fn height(&self) -> usize {
        self.buffer.height()
    }
}
