//! Thin-plate spline over plane coordinates.
//!
//! ```text
//! f(x,y) = a₀ + a₁x + a₂y + Σᵢ wᵢ U(||(x,y) - (xᵢ,yᵢ)||)
//! ```
//!
//! where U(r) = r² log(r). Used for correction fields read back from the
//! manual-adjustment tool, where markers are scattered rather than on a lattice.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::solve_linear_system;

#[derive(Debug, Clone, Default)]
pub struct TpsConfig {
    /// Smoothing (lambda). 0.0 interpolates control points exactly.
    pub regularization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SplineData")]
pub struct ThinPlateSpline {
    control_points: Vec<DVec2>,
    weights_x: Vec<f64>,
    weights_y: Vec<f64>,
    /// a0 + a1*x + a2*y
    affine_x: [f64; 3],
    /// b0 + b1*x + b2*y
    affine_y: [f64; 3],
}

/// Serialized form, checked before it becomes a spline.
#[derive(Deserialize)]
struct SplineData {
    control_points: Vec<DVec2>,
    weights_x: Vec<f64>,
    weights_y: Vec<f64>,
    affine_x: [f64; 3],
    affine_y: [f64; 3],
}

impl TryFrom<SplineData> for ThinPlateSpline {
    type Error = Error;

    fn try_from(data: SplineData) -> Result<Self> {
        let n = data.control_points.len();
        if n < 3 {
            return Err(Error::invalid(
                "control_points",
                format!("{n} control points, at least 3 required"),
            ));
        }
        if data.weights_x.len() != n || data.weights_y.len() != n {
            return Err(Error::invalid(
                "weights",
                format!(
                    "{}/{} weights for {n} control points",
                    data.weights_x.len(),
                    data.weights_y.len()
                ),
            ));
        }
        Ok(Self {
            control_points: data.control_points,
            weights_x: data.weights_x,
            weights_y: data.weights_y,
            affine_x: data.affine_x,
            affine_y: data.affine_y,
        })
    }
}

impl ThinPlateSpline {
    /// Fits the spline through `source -> target`.
    ///
    /// Returns `None` with fewer than 3 points, mismatched lengths, or a
    /// singular system (collinear control points).
    pub fn fit(source_points: &[DVec2], target_points: &[DVec2], config: TpsConfig) -> Option<Self> {
        let n = source_points.len();
        if n < 3 || n != target_points.len() {
            return None;
        }

        // [K + λI  P] [w]   [v]
        // [P^T     0] [a] = [0]
        let matrix_size = n + 3;
        let mut matrix = vec![vec![0.0; matrix_size]; matrix_size];

        for i in 0..n {
            for j in 0..n {
                matrix[i][j] = if i == j {
                    config.regularization
                } else {
                    tps_kernel(source_points[i].distance(source_points[j]))
                };
            }
        }

        for (i, p) in source_points.iter().enumerate() {
            matrix[i][n] = 1.0;
            matrix[i][n + 1] = p.x;
            matrix[i][n + 2] = p.y;

            matrix[n][i] = 1.0;
            matrix[n + 1][i] = p.x;
            matrix[n + 2][i] = p.y;
        }

        let mut rhs_x = vec![0.0; matrix_size];
        let mut rhs_y = vec![0.0; matrix_size];
        for (i, t) in target_points.iter().enumerate() {
            rhs_x[i] = t.x;
            rhs_y[i] = t.y;
        }

        let solution_x = solve_linear_system(&matrix, &rhs_x)?;
        let solution_y = solve_linear_system(&matrix, &rhs_y)?;

        Some(Self {
            control_points: source_points.to_vec(),
            weights_x: solution_x[..n].to_vec(),
            weights_y: solution_y[..n].to_vec(),
            affine_x: [solution_x[n], solution_x[n + 1], solution_x[n + 2]],
            affine_y: [solution_y[n], solution_y[n + 1], solution_y[n + 2]],
        })
    }

    pub fn transform(&self, p: DVec2) -> DVec2 {
        let mut tx = self.affine_x[0] + DVec2::new(self.affine_x[1], self.affine_x[2]).dot(p);
        let mut ty = self.affine_y[0] + DVec2::new(self.affine_y[1], self.affine_y[2]).dot(p);

        for (i, &cp) in self.control_points.iter().enumerate() {
            let u = tps_kernel(p.distance(cp));
            tx += self.weights_x[i] * u;
            ty += self.weights_y[i] * u;
        }

        DVec2::new(tx, ty)
    }

    pub fn transform_points(&self, points: &[DVec2]) -> Vec<DVec2> {
        points.iter().map(|&p| self.transform(p)).collect()
    }

    /// Lower is smoother; zero for a purely affine fit.
    pub fn bending_energy(&self) -> f64 {
        let n = self.control_points.len();
        let mut energy = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    let u = tps_kernel(self.control_points[i].distance(self.control_points[j]));
                    energy += self.weights_x[i] * self.weights_x[j] * u;
                    energy += self.weights_y[i] * self.weights_y[j] * u;
                }
            }
        }
        energy
    }

    pub fn control_points(&self) -> &[DVec2] {
        &self.control_points
    }

    pub fn compute_residuals(&self, target_points: &[DVec2]) -> Vec<f64> {
        self.control_points
            .iter()
            .zip(target_points.iter())
            .map(|(&src, &tgt)| self.transform(src).distance(tgt))
            .collect()
    }

    pub fn is_finite(&self) -> bool {
        self.weights_x
            .iter()
            .chain(&self.weights_y)
            .chain(&self.affine_x)
            .chain(&self.affine_y)
            .all(|v| v.is_finite())
    }
}

/// U(r) = r² ln r, with U(0) = 0.
#[inline]
pub(crate) fn tps_kernel(r: f64) -> f64 {
    if r < 1e-10 { 0.0 } else { r * r * r.ln() }
}

#[cfg(test)]
mod tests;
