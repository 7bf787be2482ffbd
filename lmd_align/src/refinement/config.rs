//! Configuration for landmark-guided refinement.
//!
//! A [`RefinementConfig`] is built from a named [`RefinementPreset`] and
//! optionally adjusted with [`RefinementOverrides`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::error::{Error, Result};

/// Rough wall-clock cost of one solver iteration, used for time estimates.
pub const SECONDS_PER_ITERATION: f64 = 3.0;

/// Upper bound accepted for explicit iteration counts.
pub const MAX_ITERATIONS: usize = 100_000;

// =============================================================================
// Presets
// =============================================================================

/// Speed/accuracy presets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumIter,
)]
pub enum RefinementPreset {
    /// 2000 iterations, finest grid
    VerySlow,
    /// 500 iterations
    Slow,
    /// 100 iterations, default
    #[default]
    Medium,
    /// 10 iterations, coarse grid
    Fast,
    /// No non-rigid refinement; the affine seed is used as is
    Skip,
    /// Medium iterations with landmark agreement weighted up; needs landmarks
    Landmark,
}

impl RefinementPreset {
    pub fn iterations(&self) -> usize {
        match self {
            RefinementPreset::VerySlow => 2000,
            RefinementPreset::Slow => 500,
            RefinementPreset::Medium | RefinementPreset::Landmark => 100,
            RefinementPreset::Fast => 10,
            RefinementPreset::Skip => 0,
        }
    }

    /// Control-point spacing of the displacement grid in mm.
    pub fn grid_spacing_mm(&self) -> f64 {
        match self {
            RefinementPreset::VerySlow => 0.1,
            RefinementPreset::Slow => 0.2,
            RefinementPreset::Medium | RefinementPreset::Landmark => 0.25,
            RefinementPreset::Fast | RefinementPreset::Skip => 0.5,
        }
    }

    pub fn requires_landmarks(&self) -> bool {
        matches!(self, RefinementPreset::Landmark)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Explicit numeric overrides on top of a preset. `None` keeps the preset value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementOverrides {
    pub iterations: Option<usize>,
    pub regularization: Option<f64>,
    pub grid_spacing_mm: Option<f64>,
    pub landmark_weight: Option<f64>,
    pub image_weight: Option<f64>,
    pub step_size: Option<f64>,
}

/// Parameters of one refinement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Preset this configuration started from.
    pub preset: RefinementPreset,
    /// Maximum solver iterations. 0 skips refinement.
    pub iterations: usize,
    /// Weight of the smoothness (bending) term.
    pub regularization: f64,
    /// Spacing of the displacement grid in mm.
    pub grid_spacing_mm: f64,
    /// Weight of landmark agreement.
    pub landmark_weight: f64,
    /// Weight of image similarity.
    pub image_weight: f64,
    /// Initial gradient step.
    pub step_size: f64,
    /// Iterations without improvement before the run is declared stalled.
    pub stall_window: usize,
    /// Minimum relative improvement that counts as progress.
    pub stall_tolerance: f64,
    /// Minimum image side length in pixels, for both rasters.
    pub min_image_size: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self::from_preset(RefinementPreset::default())
    }
}

impl RefinementConfig {
    pub fn from_preset(preset: RefinementPreset) -> Self {
        Self {
            preset,
            iterations: preset.iterations(),
            regularization: 0.5,
            grid_spacing_mm: preset.grid_spacing_mm(),
            landmark_weight: if preset.requires_landmarks() { 10.0 } else { 1.0 },
            image_weight: 1.0,
            step_size: 0.5,
            stall_window: 10,
            stall_tolerance: 1e-4,
            min_image_size: 8,
        }
    }

    pub fn with_overrides(mut self, overrides: &RefinementOverrides) -> Self {
        if let Some(v) = overrides.iterations {
            self.iterations = v;
        }
        if let Some(v) = overrides.regularization {
            self.regularization = v;
        }
        if let Some(v) = overrides.grid_spacing_mm {
            self.grid_spacing_mm = v;
        }
        if let Some(v) = overrides.landmark_weight {
            self.landmark_weight = v;
        }
        if let Some(v) = overrides.image_weight {
            self.image_weight = v;
        }
        if let Some(v) = overrides.step_size {
            self.step_size = v;
        }
        self
    }

    /// Checks numeric ranges. Image sizes and landmark requirements are
    /// checked against the actual inputs by [`validate_inputs`](Self::validate_inputs).
    pub fn validate(&self) -> Result<()> {
        if self.iterations > MAX_ITERATIONS {
            return Err(Error::invalid(
                "iterations",
                format!("{} exceeds {MAX_ITERATIONS}", self.iterations),
            ));
        }
        check_non_negative("regularization", self.regularization)?;
        check_positive("grid_spacing_mm", self.grid_spacing_mm)?;
        check_non_negative("landmark_weight", self.landmark_weight)?;
        check_non_negative("image_weight", self.image_weight)?;
        check_positive("step_size", self.step_size)?;
        if self.iterations > 0 && self.landmark_weight == 0.0 && self.image_weight == 0.0 {
            return Err(Error::invalid(
                "image_weight",
                "landmark and image weights cannot both be zero",
            ));
        }
        if self.stall_window == 0 {
            return Err(Error::invalid("stall_window", "must be at least 1"));
        }
        check_non_negative("stall_tolerance", self.stall_tolerance)?;
        Ok(())
    }

    pub fn validate_inputs(
        &self,
        landmark_count: usize,
        section_size: (usize, usize),
        atlas_size: (usize, usize),
    ) -> Result<()> {
        self.validate()?;
        self.validate_landmarks(landmark_count)?;
        for (name, (w, h)) in [("section image", section_size), ("atlas raster", atlas_size)] {
            if w < self.min_image_size || h < self.min_image_size {
                return Err(Error::invalid(
                    "min_image_size",
                    format!(
                        "{name} is {w}x{h}, smaller than {0}x{0}",
                        self.min_image_size
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_landmarks(&self, landmark_count: usize) -> Result<()> {
        if self.preset.requires_landmarks() && landmark_count == 0 {
            return Err(Error::invalid(
                "landmarks",
                format!("preset {} needs at least one landmark", self.preset),
            ));
        }
        Ok(())
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs_f64(self.iterations as f64 * SECONDS_PER_ITERATION)
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid(name, format!("{value} must be positive")))
    }
}

fn check_non_negative(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::invalid(name, format!("{value} must be non-negative")))
    }
}

/// Verbose duration, e.g. `"1 hour(s) 5 second(s)"`. Zero units are omitted.
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, u64); 4] = [("day", 86_400), ("hour", 3_600), ("minute", 60), ("second", 1)];

    let mut remaining = duration.as_secs();
    let mut parts = Vec::new();
    for (unit, size) in UNITS {
        let value = remaining / size;
        remaining %= size;
        if value != 0 {
            parts.push(format!("{value} {unit}(s)"));
        }
    }
    parts.join(" ")
}
