use std::ops::{Index, IndexMut};

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Row-major 2D raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Result<Self> {
        if pixels.len() != width * height {
            return Err(Error::InvalidParameter {
                name: "pixels",
                message: format!(
                    "length {} does not match {}x{}",
                    pixels.len(),
                    width,
                    height
                ),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<&T> {
        if x < self.width && y < self.height {
            Some(&self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Buffer2<U> {
        Buffer2 {
            pixels: self.pixels.iter().map(f).collect(),
            width: self.width,
            height: self.height,
        }
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }
}

impl Buffer2<f32> {
    /// Bilinear sample at a continuous pixel position; pixel centres sit on integers.
    /// Returns `None` outside the raster.
    pub fn sample_bilinear(&self, p: DVec2) -> Option<f32> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        if !(p.x >= 0.0 && p.y >= 0.0 && p.x <= max_x && p.y <= max_y) {
            return None;
        }
        let x0 = (p.x.floor() as usize).min(self.width - 1);
        let y0 = (p.y.floor() as usize).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = (p.x - x0 as f64) as f32;
        let fy = (p.y - y0 as f64) as f32;

        let v00 = self[(x0, y0)];
        let v10 = self[(x1, y0)];
        let v01 = self[(x0, y1)];
        let v11 = self[(x1, y1)];
        Some(
            (1.0 - fx) * (1.0 - fy) * v00
                + fx * (1.0 - fy) * v10
                + (1.0 - fx) * fy * v01
                + fx * fy * v11,
        )
    }

    /// Rescales values to zero mean and unit standard deviation.
    /// Constant rasters become all zeros.
    pub fn standardized(&self) -> Buffer2<f32> {
        let n = self.pixels.len().max(1) as f64;
        let mean = self.pixels.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = self
            .pixels
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = var.sqrt();
        if std < 1e-12 {
            return Buffer2::new_filled(self.width, self.height, 0.0);
        }
        self.map(|&v| ((v as f64 - mean) / std) as f32)
    }

    pub fn max_value(&self) -> f32 {
        self.pixels.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_length() {
        assert!(Buffer2::new(2, 2, vec![0u8; 4]).is_ok());
        assert!(matches!(
            Buffer2::new(2, 2, vec![0u8; 3]),
            Err(Error::InvalidParameter { name: "pixels", .. })
        ));
    }

    #[test]
    fn index_is_row_major() {
        let mut buf = Buffer2::new_filled(3, 2, 0u32);
        buf[(2, 1)] = 7;
        assert_eq!(buf.pixels()[5], 7);
        assert_eq!(buf.get(2, 1), Some(&7));
        assert_eq!(buf.get(3, 0), None);
    }

    #[test]
    fn bilinear_interpolates_between_centres() {
        let buf = Buffer2::new(2, 2, vec![0.0f32, 1.0, 2.0, 3.0]).unwrap();
        assert_eq!(buf.sample_bilinear(DVec2::new(0.0, 0.0)), Some(0.0));
        assert_eq!(buf.sample_bilinear(DVec2::new(1.0, 1.0)), Some(3.0));
        let mid = buf.sample_bilinear(DVec2::new(0.5, 0.5)).unwrap();
        assert!((mid - 1.5).abs() < 1e-6);
        assert_eq!(buf.sample_bilinear(DVec2::new(-0.1, 0.0)), None);
        assert_eq!(buf.sample_bilinear(DVec2::new(0.0, 1.5)), None);
    }

    #[test]
    fn standardized_has_zero_mean() {
        let buf = Buffer2::new(4, 1, vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let std = buf.standardized();
        let mean: f32 = std.pixels().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);

        let flat = Buffer2::new_filled(3, 3, 5.0f32).standardized();
        assert!(flat.pixels().iter().all(|&v| v == 0.0));
    }
}
