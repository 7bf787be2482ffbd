use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Displacements (section pixels) on a regular lattice over plane coordinates (mm).
///
/// Sampling is bilinear; queries outside the lattice take the nearest border value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridData")]
pub struct DisplacementGrid {
    origin: DVec2,
    spacing_mm: f64,
    cols: usize,
    rows: usize,
    values: Vec<DVec2>,
}

/// Serialized form, checked before it becomes a grid.
#[derive(Deserialize)]
struct GridData {
    origin: DVec2,
    spacing_mm: f64,
    cols: usize,
    rows: usize,
    values: Vec<DVec2>,
}

impl TryFrom<GridData> for DisplacementGrid {
    type Error = Error;

    fn try_from(data: GridData) -> Result<Self> {
        if data.cols.checked_mul(data.rows) != Some(data.values.len()) {
            return Err(Error::invalid(
                "values",
                format!(
                    "{} values do not fill a {}x{} grid",
                    data.values.len(),
                    data.cols,
                    data.rows
                ),
            ));
        }
        let mut grid = Self::zeros(data.origin, data.spacing_mm, data.cols, data.rows)?;
        grid.values = data.values;
        Ok(grid)
    }
}

impl DisplacementGrid {
    pub fn zeros(origin: DVec2, spacing_mm: f64, cols: usize, rows: usize) -> Result<Self> {
        if !spacing_mm.is_finite() || spacing_mm <= 0.0 {
            return Err(Error::invalid(
                "grid_spacing_mm",
                format!("{spacing_mm} must be positive"),
            ));
        }
        if cols < 2 || rows < 2 {
            return Err(Error::invalid(
                "grid_spacing_mm",
                format!("grid of {cols}x{rows} nodes is too coarse"),
            ));
        }
        Ok(Self {
            origin,
            spacing_mm,
            cols,
            rows,
            values: vec![DVec2::ZERO; cols * rows],
        })
    }

    /// Smallest lattice with the given spacing covering `[min, max]`.
    pub fn covering(min: DVec2, max: DVec2, spacing_mm: f64) -> Result<Self> {
        if !spacing_mm.is_finite() || spacing_mm <= 0.0 {
            return Err(Error::invalid(
                "grid_spacing_mm",
                format!("{spacing_mm} must be positive"),
            ));
        }
        let extent = (max - min).max(DVec2::ZERO);
        let cols = ((extent.x / spacing_mm).ceil() as usize + 1).max(2);
        let rows = ((extent.y / spacing_mm).ceil() as usize + 1).max(2);
        Self::zeros(min, spacing_mm, cols, rows)
    }

    pub fn origin(&self) -> DVec2 {
        self.origin
    }

    pub fn spacing_mm(&self) -> f64 {
        self.spacing_mm
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn node_position(&self, col: usize, row: usize) -> DVec2 {
        self.origin + DVec2::new(col as f64, row as f64) * self.spacing_mm
    }

    #[inline]
    pub fn node_index(&self, col: usize, row: usize) -> usize {
        row * self.cols + col
    }

    pub fn get(&self, col: usize, row: usize) -> DVec2 {
        self.values[self.node_index(col, row)]
    }

    pub fn set(&mut self, col: usize, row: usize, value: DVec2) {
        let idx = self.node_index(col, row);
        self.values[idx] = value;
    }

    pub fn values(&self) -> &[DVec2] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [DVec2] {
        &mut self.values
    }

    /// Node indices and bilinear weights contributing to `uv`.
    pub fn bilinear_weights(&self, uv: DVec2) -> [(usize, f64); 4] {
        let g = (uv - self.origin) / self.spacing_mm;
        let gx = g.x.clamp(0.0, (self.cols - 1) as f64);
        let gy = g.y.clamp(0.0, (self.rows - 1) as f64);
        let c0 = (gx.floor() as usize).min(self.cols - 2);
        let r0 = (gy.floor() as usize).min(self.rows - 2);
        let fx = gx - c0 as f64;
        let fy = gy - r0 as f64;
        [
            (self.node_index(c0, r0), (1.0 - fx) * (1.0 - fy)),
            (self.node_index(c0 + 1, r0), fx * (1.0 - fy)),
            (self.node_index(c0, r0 + 1), (1.0 - fx) * fy),
            (self.node_index(c0 + 1, r0 + 1), fx * fy),
        ]
    }

    pub fn sample(&self, uv: DVec2) -> DVec2 {
        self.bilinear_weights(uv)
            .iter()
            .map(|&(i, w)| self.values[i] * w)
            .sum()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn max_magnitude(&self) -> f64 {
        self.values.iter().map(|v| v.length()).fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_spans_extent() {
        let grid =
            DisplacementGrid::covering(DVec2::new(-1.0, -1.0), DVec2::new(1.0, 0.5), 0.5).unwrap();
        assert_eq!(grid.cols(), 5);
        assert_eq!(grid.rows(), 4);
        assert_eq!(grid.node_position(4, 3), DVec2::new(1.0, 0.5));
    }

    #[test]
    fn sample_is_bilinear_and_clamped() {
        let mut grid = DisplacementGrid::zeros(DVec2::ZERO, 1.0, 2, 2).unwrap();
        grid.set(1, 0, DVec2::new(2.0, 0.0));
        grid.set(1, 1, DVec2::new(2.0, 4.0));

        let mid = grid.sample(DVec2::new(0.5, 0.5));
        assert!((mid - DVec2::new(1.0, 1.0)).length() < 1e-12);
        // Beyond the right edge the border value holds.
        assert_eq!(grid.sample(DVec2::new(5.0, 1.0)), DVec2::new(2.0, 4.0));

        let weights: f64 = grid.bilinear_weights(DVec2::new(0.3, 0.9)).iter().map(|w| w.1).sum();
        assert!((weights - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_spacing() {
        assert!(DisplacementGrid::zeros(DVec2::ZERO, 0.0, 4, 4).is_err());
        assert!(DisplacementGrid::zeros(DVec2::ZERO, 1.0, 1, 4).is_err());
    }

    #[test]
    fn deserialize_checks_shape() {
        let mut grid = DisplacementGrid::zeros(DVec2::ZERO, 0.5, 3, 2).unwrap();
        grid.set(2, 1, DVec2::new(1.5, -2.0));
        let json = serde_json::to_string(&grid).unwrap();
        let back: DisplacementGrid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, grid);

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["values"] = serde_json::json!([[0.0, 0.0]]);
        assert!(serde_json::from_value::<DisplacementGrid>(value.clone()).is_err());

        value["values"] = serde_json::json!([[0.0, 0.0]]);
        value["cols"] = serde_json::json!(1);
        value["rows"] = serde_json::json!(1);
        assert!(serde_json::from_value::<DisplacementGrid>(value.clone()).is_err());

        value["cols"] = serde_json::json!(usize::MAX);
        value["rows"] = serde_json::json!(2);
        assert!(serde_json::from_value::<DisplacementGrid>(value).is_err());
    }

    #[test]
    fn finiteness() {
        let mut grid = DisplacementGrid::zeros(DVec2::ZERO, 1.0, 3, 3).unwrap();
        assert!(grid.is_finite());
        assert_eq!(grid.max_magnitude(), 0.0);
        grid.set(2, 2, DVec2::new(f64::NAN, 0.0));
        assert!(!grid.is_finite());
    }
}
