//! Least-squares transform estimation from point correspondences.

use glam::DVec2;
use nalgebra::DMatrix;

use crate::transform::{Transform, TransformType};

/// Relative singular-value threshold below which a point set counts as collinear.
const COLLINEAR_RATIO: f64 = 1e-9;

pub(crate) fn centroid(points: &[DVec2]) -> DVec2 {
    if points.is_empty() {
        return DVec2::ZERO;
    }
    points.iter().copied().sum::<DVec2>() / points.len() as f64
}

/// True when the points are coincident or lie on one line.
pub(crate) fn is_degenerate(points: &[DVec2]) -> bool {
    if points.len() < 3 {
        return true;
    }
    let c = centroid(points);
    let centered = DMatrix::from_fn(points.len(), 2, |r, col| {
        let d = points[r] - c;
        if col == 0 { d.x } else { d.y }
    });
    let singular = centered.singular_values();
    let (hi, lo) = if singular[0] >= singular[1] {
        (singular[0], singular[1])
    } else {
        (singular[1], singular[0])
    };
    hi < 1e-12 || lo / hi < COLLINEAR_RATIO
}

/// Translation that best moves `linear(src)` onto `dst`, keeping the linear part.
pub(crate) fn estimate_translation_with(
    linear: &Transform,
    src: &[DVec2],
    dst: &[DVec2],
) -> Option<Transform> {
    if src.is_empty() || src.len() != dst.len() {
        return None;
    }
    let mapped: Vec<DVec2> = src.iter().map(|&p| linear.apply(p)).collect();
    let shift = centroid(dst) - centroid(&mapped);
    Some(Transform::translation(shift).compose(linear))
}

/// Isotropic scale + translation, no rotation.
///
/// Returns `None` when the source points are coincident or the best scale
/// is not positive.
pub(crate) fn estimate_scale_translation(src: &[DVec2], dst: &[DVec2]) -> Option<Transform> {
    if src.is_empty() || src.len() != dst.len() {
        return None;
    }
    let src_c = centroid(src);
    let dst_c = centroid(dst);

    let mut num = 0.0;
    let mut den = 0.0;
    for (&s, &d) in src.iter().zip(dst.iter()) {
        let s = s - src_c;
        let d = d - dst_c;
        num += s.dot(d);
        den += s.length_squared();
    }
    if den < 1e-18 {
        return None;
    }
    let scale = num / den;
    if !scale.is_finite() || scale <= 1e-12 {
        return None;
    }

    let t = dst_c - src_c * scale;
    Some(Transform::from_matrix(
        crate::math::DMat3::from_array([scale, 0.0, t.x, 0.0, scale, t.y, 0.0, 0.0, 1.0]),
        TransformType::Similarity,
    ))
}

/// Full affine least squares on centred coordinates.
///
/// `A = (Σ d̃ s̃ᵀ)(Σ s̃ s̃ᵀ)⁻¹`, `t = d̄ - A s̄`. Returns `None` when either point
/// set is degenerate.
pub(crate) fn estimate_affine(src: &[DVec2], dst: &[DVec2]) -> Option<Transform> {
    if src.len() < 3 || src.len() != dst.len() {
        return None;
    }
    if is_degenerate(src) || is_degenerate(dst) {
        return None;
    }

    let src_c = centroid(src);
    let dst_c = centroid(dst);

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    let mut dx_sx = 0.0;
    let mut dx_sy = 0.0;
    let mut dy_sx = 0.0;
    let mut dy_sy = 0.0;
    for (&s, &d) in src.iter().zip(dst.iter()) {
        let s = s - src_c;
        let d = d - dst_c;
        sxx += s.x * s.x;
        sxy += s.x * s.y;
        syy += s.y * s.y;
        dx_sx += d.x * s.x;
        dx_sy += d.x * s.y;
        dy_sx += d.y * s.x;
        dy_sy += d.y * s.y;
    }

    let det = sxx * syy - sxy * sxy;
    if det.abs() < 1e-18 {
        return None;
    }
    let inv = [syy / det, -sxy / det, -sxy / det, sxx / det];

    let a = dx_sx * inv[0] + dx_sy * inv[2];
    let b = dx_sx * inv[1] + dx_sy * inv[3];
    let c = dy_sx * inv[0] + dy_sy * inv[2];
    let d = dy_sx * inv[1] + dy_sy * inv[3];

    let tx = dst_c.x - (a * src_c.x + b * src_c.y);
    let ty = dst_c.y - (c * src_c.x + d * src_c.y);

    let transform = Transform::affine([a, b, tx, c, d, ty]);
    if transform.is_valid() {
        Some(transform)
    } else {
        None
    }
}

/// Euclidean distance between `transform(src[i])` and `dst[i]`.
pub(crate) fn residuals(transform: &Transform, src: &[DVec2], dst: &[DVec2]) -> Vec<f64> {
    src.iter()
        .zip(dst.iter())
        .map(|(&s, &d)| transform.apply(s).distance(d))
        .collect()
}

pub(crate) fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}
