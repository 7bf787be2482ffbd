//! 2D affine transforms and frame-tagged wrappers.

pub(crate) mod estimate;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frames::{CoordinateFrame, Point};
use crate::math::DMat3;

/// Transformation models with increasing degrees of freedom.
///
/// Variants are ordered by complexity; `compose()` keeps the more complex one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransformType {
    /// Translation only (2 DOF)
    Translation,
    /// Translation + rotation (3 DOF)
    Euclidean,
    /// Translation + rotation + uniform scale (4 DOF)
    Similarity,
    /// Full affine with shear and differential scale (6 DOF)
    #[default]
    Affine,
}

impl TransformType {
    /// Minimum number of point correspondences needed to estimate this model.
    pub fn min_points(&self) -> usize {
        match self {
            TransformType::Translation => 1,
            TransformType::Euclidean => 2,
            TransformType::Similarity => 2,
            TransformType::Affine => 3,
        }
    }
}

/// 3x3 homogeneous affine matrix, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub matrix: DMat3,
    pub transform_type: TransformType,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.translation_components();
        match self.transform_type {
            TransformType::Translation => {
                write!(f, "Translation(dx={:.3}, dy={:.3})", t.x, t.y)
            }
            TransformType::Euclidean => write!(
                f,
                "Euclidean(dx={:.3}, dy={:.3}, rot={:.3}°)",
                t.x,
                t.y,
                self.rotation_angle().to_degrees()
            ),
            TransformType::Similarity | TransformType::Affine => write!(
                f,
                "{:?}(dx={:.3}, dy={:.3}, rot={:.3}°, scale={:.4})",
                self.transform_type,
                t.x,
                t.y,
                self.rotation_angle().to_degrees(),
                self.scale_factor()
            ),
        }
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            matrix: DMat3::identity(),
            transform_type: TransformType::Translation,
        }
    }

    pub fn translation(t: DVec2) -> Self {
        Self {
            matrix: DMat3::from_array([1.0, 0.0, t.x, 0.0, 1.0, t.y, 0.0, 0.0, 1.0]),
            transform_type: TransformType::Translation,
        }
    }

    /// Translation + rotation + uniform scale.
    pub fn similarity(t: DVec2, angle: f64, scale: f64) -> Self {
        let cos_a = angle.cos() * scale;
        let sin_a = angle.sin() * scale;
        Self {
            matrix: DMat3::from_array([cos_a, -sin_a, t.x, sin_a, cos_a, t.y, 0.0, 0.0, 1.0]),
            transform_type: TransformType::Similarity,
        }
    }

    /// Affine transform from 6 parameters `[a, b, tx, c, d, ty]`.
    pub fn affine(params: [f64; 6]) -> Self {
        Self {
            matrix: DMat3::from_array([
                params[0], params[1], params[2], params[3], params[4], params[5], 0.0, 0.0, 1.0,
            ]),
            transform_type: TransformType::Affine,
        }
    }

    pub fn from_matrix(matrix: DMat3, transform_type: TransformType) -> Self {
        Self {
            matrix,
            transform_type,
        }
    }

    #[inline]
    pub fn apply(&self, p: DVec2) -> DVec2 {
        self.matrix.transform_point(p)
    }

    /// Inverse, or `None` for singular matrices.
    pub fn try_inverse(&self) -> Option<Self> {
        self.matrix.inverse().map(|matrix| Self {
            matrix,
            transform_type: self.transform_type,
        })
    }

    /// Compose two transforms: self * other (apply other first, then self).
    pub fn compose(&self, other: &Self) -> Self {
        let transform_type = if self.transform_type as u8 > other.transform_type as u8 {
            self.transform_type
        } else {
            other.transform_type
        };

        Self {
            matrix: self.matrix.mul_mat(&other.matrix),
            transform_type,
        }
    }

    pub fn translation_components(&self) -> DVec2 {
        DVec2::new(self.matrix[2], self.matrix[5])
    }

    /// Rotation angle in radians (exact for Euclidean/Similarity).
    pub fn rotation_angle(&self) -> f64 {
        self.matrix[3].atan2(self.matrix[0])
    }

    /// Scale factor (exact for Similarity).
    pub fn scale_factor(&self) -> f64 {
        let a = self.matrix[0];
        let c = self.matrix[3];
        (a * a + c * c).sqrt()
    }

    pub fn is_valid(&self) -> bool {
        self.matrix.is_finite() && self.matrix.inverse().is_some()
    }
}

/// An affine map between two named frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub from: CoordinateFrame,
    pub to: CoordinateFrame,
    pub transform: Transform,
}

impl AffineTransform {
    /// Fails with `DegenerateTransform` for singular or non-finite matrices.
    pub fn new(from: CoordinateFrame, to: CoordinateFrame, transform: Transform) -> Result<Self> {
        if !transform.is_valid() {
            return Err(Error::DegenerateTransform(format!(
                "{from} -> {to} transform is singular: {transform}"
            )));
        }
        Ok(Self {
            from,
            to,
            transform,
        })
    }

    pub fn identity(from: CoordinateFrame, to: CoordinateFrame) -> Self {
        Self {
            from,
            to,
            transform: Transform::identity(),
        }
    }

    /// Maps a point of frame `from` into frame `to`; `z` is carried through.
    pub fn apply(&self, p: &Point) -> Result<Point> {
        p.ensure_frame(self.from)?;
        Ok(Point::new(
            self.to,
            self.transform.apply(p.xy()).extend(p.pos.z),
        ))
    }

    #[inline]
    pub fn apply_xy(&self, p: DVec2) -> DVec2 {
        self.transform.apply(p)
    }

    pub fn inverse(&self) -> Result<AffineTransform> {
        let transform = self.transform.try_inverse().ok_or_else(|| {
            Error::DegenerateTransform(format!(
                "{} -> {} transform is not invertible",
                self.from, self.to
            ))
        })?;
        Ok(AffineTransform {
            from: self.to,
            to: self.from,
            transform,
        })
    }

    /// Applies `self` first, then `next`. `next` must start where `self` ends.
    pub fn then(&self, next: &AffineTransform) -> Result<AffineTransform> {
        if self.to != next.from {
            return Err(Error::FrameMismatch {
                expected: self.to,
                actual: next.from,
            });
        }
        Ok(AffineTransform {
            from: self.from,
            to: next.to,
            transform: next.transform.compose(&self.transform),
        })
    }
}
