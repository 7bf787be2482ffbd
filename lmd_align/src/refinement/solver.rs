//! The non-rigid registration collaborator and its built-in implementation.
//!
//! Refinement orchestration only talks to [`NonRigidSolver`] and [`SolverRun`];
//! any solver that produces a displacement grid over plane coordinates and a
//! scalar metric per iteration can be plugged in.

use glam::DVec2;
use rayon::prelude::*;

use crate::atlas::PlaneRaster;
use crate::buffer2::Buffer2;
use crate::deformation::DisplacementGrid;
use crate::refinement::RefinementConfig;
use crate::transform::AffineTransform;

/// Upper bound on image samples per axis used by the image term.
const MAX_SAMPLES_PER_AXIS: usize = 96;
const MAX_BACKTRACKS: usize = 10;
const STEP_GROWTH: f64 = 1.2;
const STEP_SHRINK: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("invalid problem: {0}")]
    InvalidProblem(String),
    #[error("solver diverged: {0}")]
    Diverged(String),
}

/// Everything a solver needs for one section.
#[derive(Debug, Clone)]
pub struct RefinementProblem {
    /// Atlas reference intensities sampled on the section's cutting plane.
    pub atlas: PlaneRaster<f32>,
    /// Section image, one value per section pixel.
    pub section: Buffer2<f32>,
    /// Plane coordinates (mm) to section pixels.
    pub seed: AffineTransform,
    /// Landmarks as (plane coordinates, section pixel).
    pub landmarks: Vec<(DVec2, DVec2)>,
    pub config: RefinementConfig,
}

impl RefinementProblem {
    /// Plane-coordinate extent of the atlas raster as `(min, max)`.
    pub fn plane_extent(&self) -> (DVec2, DVec2) {
        let min = self.atlas.origin;
        let size = DVec2::new(
            self.atlas.width().saturating_sub(1) as f64,
            self.atlas.height().saturating_sub(1) as f64,
        );
        (min, min + size * self.atlas.spacing_mm)
    }
}

pub trait NonRigidSolver: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, problem: &RefinementProblem) -> Result<Box<dyn SolverRun>, SolverError>;
}

/// One in-flight optimization.
pub trait SolverRun {
    /// Performs one iteration and returns the convergence metric (lower is better).
    fn step(&mut self) -> Result<f64, SolverError>;

    /// Current correction in section pixels.
    fn correction(&self) -> DisplacementGrid;
}

// =============================================================================
// Built-in solver
// =============================================================================

/// Gradient descent on a regular displacement grid.
///
/// Energy is a weighted sum of squared landmark mismatch (pixels), squared
/// difference of standardized intensities, and a membrane smoothness term
/// over neighbouring grid nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LandmarkGridSolver;

impl NonRigidSolver for LandmarkGridSolver {
    fn name(&self) -> &str {
        "landmark-grid"
    }

    fn start(&self, problem: &RefinementProblem) -> Result<Box<dyn SolverRun>, SolverError> {
        let (min, max) = problem.plane_extent();
        let grid = DisplacementGrid::covering(min, max, problem.config.grid_spacing_mm)
            .map_err(|e| SolverError::InvalidProblem(e.to_string()))?;

        let section = problem.section.standardized();
        let atlas = problem.atlas.buffer.standardized();
        let stride_x = problem.atlas.width().div_ceil(MAX_SAMPLES_PER_AXIS).max(1);
        let stride_y = problem.atlas.height().div_ceil(MAX_SAMPLES_PER_AXIS).max(1);

        let mut samples = Vec::new();
        for y in (0..problem.atlas.height()).step_by(stride_y) {
            for x in (0..problem.atlas.width()).step_by(stride_x) {
                let uv = problem.atlas.pixel_to_plane(DVec2::new(x as f64, y as f64));
                samples.push(ImageSample {
                    weights: grid.bilinear_weights(uv),
                    seed_px: problem.seed.apply_xy(uv),
                    atlas_value: atlas[(x, y)],
                });
            }
        }

        let landmarks = problem
            .landmarks
            .iter()
            .map(|&(uv, px)| LandmarkTerm {
                weights: grid.bilinear_weights(uv),
                seed_px: problem.seed.apply_xy(uv),
                target_px: px,
            })
            .collect();

        let mut run = GridRun {
            grid,
            section,
            samples,
            landmarks,
            landmark_weight: problem.config.landmark_weight,
            image_weight: problem.config.image_weight,
            regularization: problem.config.regularization,
            step_size: problem.config.step_size,
            energy: 0.0,
        };
        run.energy = run.energy_of(run.grid.values());
        if !run.energy.is_finite() {
            return Err(SolverError::InvalidProblem(
                "initial energy is not finite".to_string(),
            ));
        }
        Ok(Box::new(run))
    }
}

struct ImageSample {
    weights: [(usize, f64); 4],
    seed_px: DVec2,
    atlas_value: f32,
}

struct LandmarkTerm {
    weights: [(usize, f64); 4],
    seed_px: DVec2,
    target_px: DVec2,
}

fn interpolate(values: &[DVec2], weights: &[(usize, f64); 4]) -> DVec2 {
    weights.iter().map(|&(i, w)| values[i] * w).sum()
}

struct GridRun {
    grid: DisplacementGrid,
    section: Buffer2<f32>,
    samples: Vec<ImageSample>,
    landmarks: Vec<LandmarkTerm>,
    landmark_weight: f64,
    image_weight: f64,
    regularization: f64,
    step_size: f64,
    energy: f64,
}

impl GridRun {
    fn energy_of(&self, values: &[DVec2]) -> f64 {
        self.landmark_energy(values, None)
            + self.image_energy(values, None)
            + self.smoothness_energy(values, None)
    }

    fn gradient(&self, values: &[DVec2]) -> Vec<DVec2> {
        let mut grad = vec![DVec2::ZERO; values.len()];
        self.landmark_energy(values, Some(&mut grad));
        self.image_energy(values, Some(&mut grad));
        self.smoothness_energy(values, Some(&mut grad));
        grad
    }

    fn landmark_energy(&self, values: &[DVec2], grad: Option<&mut Vec<DVec2>>) -> f64 {
        if self.landmarks.is_empty() || self.landmark_weight == 0.0 {
            return 0.0;
        }
        let scale = self.landmark_weight / self.landmarks.len() as f64;
        let mut energy = 0.0;
        let mut grad = grad;
        for term in &self.landmarks {
            let residual = term.seed_px + interpolate(values, &term.weights) - term.target_px;
            energy += scale * residual.length_squared();
            if let Some(g) = grad.as_deref_mut() {
                for &(i, w) in &term.weights {
                    g[i] += 2.0 * scale * w * residual;
                }
            }
        }
        energy
    }

    fn image_energy(&self, values: &[DVec2], grad: Option<&mut Vec<DVec2>>) -> f64 {
        if self.samples.is_empty() || self.image_weight == 0.0 {
            return 0.0;
        }
        let want_grad = grad.is_some();
        let section = &self.section;
        let terms: Vec<(f64, DVec2, usize)> = self
            .samples
            .par_iter()
            .enumerate()
            .filter_map(|(idx, s)| {
                let p = s.seed_px + interpolate(values, &s.weights);
                let value = section.sample_bilinear(p)?;
                let diff = (s.atlas_value - value) as f64;
                let d_section = if want_grad {
                    image_gradient(section, p)?
                } else {
                    DVec2::ZERO
                };
                // d(diff²)/dp = -2·diff·∇S
                Some((diff * diff, -2.0 * diff * d_section, idx))
            })
            .collect();

        if terms.is_empty() {
            return 0.0;
        }
        let scale = self.image_weight / terms.len() as f64;
        if let Some(g) = grad {
            for (_, d_p, idx) in &terms {
                for &(i, w) in &self.samples[*idx].weights {
                    g[i] += scale * w * *d_p;
                }
            }
        }
        scale * terms.iter().map(|t| t.0).sum::<f64>()
    }

    fn smoothness_energy(&self, values: &[DVec2], grad: Option<&mut Vec<DVec2>>) -> f64 {
        if self.regularization == 0.0 {
            return 0.0;
        }
        let (cols, rows) = (self.grid.cols(), self.grid.rows());
        let edges = (cols - 1) * rows + cols * (rows - 1);
        let scale = self.regularization / edges as f64;
        let mut energy = 0.0;
        let mut grad = grad;
        let mut edge = |a: usize, b: usize| {
            let d = values[a] - values[b];
            energy += scale * d.length_squared();
            if let Some(g) = grad.as_deref_mut() {
                g[a] += 2.0 * scale * d;
                g[b] -= 2.0 * scale * d;
            }
        };
        for row in 0..rows {
            for col in 0..cols {
                let i = self.grid.node_index(col, row);
                if col + 1 < cols {
                    edge(i, self.grid.node_index(col + 1, row));
                }
                if row + 1 < rows {
                    edge(i, self.grid.node_index(col, row + 1));
                }
            }
        }
        energy
    }
}

/// Central-difference intensity gradient; `None` near the border.
fn image_gradient(image: &Buffer2<f32>, p: DVec2) -> Option<DVec2> {
    let dx = image.sample_bilinear(p + DVec2::X)? - image.sample_bilinear(p - DVec2::X)?;
    let dy = image.sample_bilinear(p + DVec2::Y)? - image.sample_bilinear(p - DVec2::Y)?;
    Some(DVec2::new(dx as f64, dy as f64) * 0.5)
}

impl SolverRun for GridRun {
    fn step(&mut self) -> Result<f64, SolverError> {
        let grad = self.gradient(self.grid.values());
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(SolverError::Diverged("gradient is not finite".to_string()));
        }
        if grad.iter().all(|g| *g == DVec2::ZERO) {
            return Ok(self.energy);
        }

        let mut step = self.step_size;
        for _ in 0..MAX_BACKTRACKS {
            let candidate: Vec<DVec2> = self
                .grid
                .values()
                .iter()
                .zip(&grad)
                .map(|(v, g)| *v - step * *g)
                .collect();
            let energy = self.energy_of(&candidate);
            if energy.is_finite() && energy < self.energy {
                self.grid.values_mut().copy_from_slice(&candidate);
                self.energy = energy;
                self.step_size = step * STEP_GROWTH;
                return Ok(energy);
            }
            step *= STEP_SHRINK;
        }
        self.step_size = step;
        Ok(self.energy)
    }

    fn correction(&self) -> DisplacementGrid {
        self.grid.clone()
    }
}
