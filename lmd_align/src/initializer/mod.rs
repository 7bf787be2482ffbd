//! Initial affine estimate from slice parameters and optional landmarks.

mod landmarks;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{info, warn};

use crate::atlas::{SliceParams, SlicePlane};
use crate::error::{Error, Result};
use crate::frames::CoordinateFrame;
use crate::transform::estimate::{
    estimate_affine, estimate_scale_translation, estimate_translation_with, residuals, rms,
};
use crate::transform::{AffineTransform, Transform};

pub use landmarks::{LandmarkPair, LandmarkSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializerConfig {
    /// Section image resolution.
    pub pixels_per_mm: f64,
    /// Section image size in pixels (width, height).
    pub section_size: (usize, usize),
    /// Landmarks further than this from the cutting plane are reported.
    pub off_plane_tolerance_mm: f64,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            pixels_per_mm: 100.0,
            section_size: (1024, 1024),
            off_plane_tolerance_mm: 0.025,
        }
    }
}

impl InitializerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.pixels_per_mm.is_finite() || self.pixels_per_mm <= 0.0 {
            return Err(Error::invalid(
                "pixels_per_mm",
                format!("{} must be positive", self.pixels_per_mm),
            ));
        }
        if self.section_size.0 == 0 || self.section_size.1 == 0 {
            return Err(Error::invalid("section_size", "must not be empty"));
        }
        if self.off_plane_tolerance_mm.is_nan() || self.off_plane_tolerance_mm < 0.0 {
            return Err(Error::invalid("off_plane_tolerance_mm", "must be non-negative"));
        }
        Ok(())
    }
}

/// Which model produced the seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum FitKind {
    /// No landmarks: scale and centring from the configuration only.
    Parametric,
    /// One landmark: translation on top of the parametric scale.
    Translation,
    /// Two landmarks: isotropic scale + translation.
    ScaleTranslation,
    /// Three or more: full affine least squares.
    Affine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Initialization {
    pub plane: SlicePlane,
    /// AtlasPhysical (plane coordinates) -> SectionPixel.
    pub seed: AffineTransform,
    pub fit: FitKind,
    /// Pixel distance between mapped atlas landmark and section landmark.
    pub residuals: Vec<f64>,
    pub rms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AffineInitializer {
    config: InitializerConfig,
}

impl AffineInitializer {
    pub fn new(config: InitializerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InitializerConfig {
        &self.config
    }

    /// Transform taken straight from the slice parameters: uniform
    /// `pixels_per_mm` scale, plane origin at the image centre.
    pub fn parametric(&self) -> Transform {
        let (w, h) = self.config.section_size;
        Transform::similarity(
            DVec2::new(w as f64 * 0.5, h as f64 * 0.5),
            0.0,
            self.config.pixels_per_mm,
        )
    }

    pub fn initialize(
        &self,
        params: &SliceParams,
        landmarks: &LandmarkSet,
    ) -> Result<Initialization> {
        self.config.validate()?;
        params.validate()?;
        let plane = SlicePlane::from_params(params);

        let mut atlas_uv = Vec::with_capacity(landmarks.len());
        let mut section_px = Vec::with_capacity(landmarks.len());
        for (i, pair) in landmarks.iter().enumerate() {
            let (uv, depth) = plane.project(pair.atlas);
            if depth.abs() > self.config.off_plane_tolerance_mm {
                warn!(
                    landmark = i,
                    depth_mm = depth,
                    "atlas landmark lies off the cutting plane"
                );
            }
            atlas_uv.push(uv);
            section_px.push(pair.section);
        }

        let parametric = self.parametric();
        let (transform, fit) = match atlas_uv.len() {
            0 => (parametric, FitKind::Parametric),
            1 => (
                estimate_translation_with(&parametric, &atlas_uv, &section_px)
                    .ok_or(Error::DegenerateLandmarks { count: 1 })?,
                FitKind::Translation,
            ),
            2 => match estimate_scale_translation(&atlas_uv, &section_px) {
                Some(t) => (t, FitKind::ScaleTranslation),
                None => {
                    warn!("two landmarks give no usable scale, solving translation only");
                    (
                        estimate_translation_with(&parametric, &atlas_uv, &section_px)
                            .ok_or(Error::DegenerateLandmarks { count: 2 })?,
                        FitKind::Translation,
                    )
                }
            },
            n => (
                estimate_affine(&atlas_uv, &section_px)
                    .ok_or(Error::DegenerateLandmarks { count: n })?,
                FitKind::Affine,
            ),
        };

        let seed = AffineTransform::new(
            CoordinateFrame::AtlasPhysical,
            CoordinateFrame::SectionPixel,
            transform,
        )?;
        let residuals = residuals(&transform, &atlas_uv, &section_px);
        let rms = rms(&residuals);

        info!(
            fit = %fit,
            landmarks = atlas_uv.len(),
            rms_px = rms,
            transform = %transform,
            "affine initialization"
        );

        Ok(Initialization {
            plane,
            seed,
            fit,
            residuals,
            rms,
        })
    }
}
