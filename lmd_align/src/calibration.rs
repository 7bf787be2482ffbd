//! Slide calibration: section pixels to instrument stage coordinates.

use glam::DVec2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frames::CoordinateFrame;
use crate::transform::estimate::{estimate_affine, is_degenerate};
use crate::transform::{AffineTransform, Transform};

/// A slide-image pixel paired with the stage position the instrument
/// reports for the same mark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub pixel: DVec2,
    pub stage: DVec2,
}

impl CalibrationPoint {
    pub fn new(pixel: DVec2, stage: DVec2) -> Self {
        Self { pixel, stage }
    }
}

/// Placement of one section inside the slide image, in slide pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionBounds {
    pub x_offset: f64,
    pub y_offset: f64,
    pub width: usize,
    pub height: usize,
}

impl SectionBounds {
    pub fn new(x_offset: f64, y_offset: f64, width: usize, height: usize) -> Self {
        Self {
            x_offset,
            y_offset,
            width,
            height,
        }
    }

    pub fn offset(&self) -> DVec2 {
        DVec2::new(self.x_offset, self.y_offset)
    }
}

/// Three calibration marks and the slide-pixel -> stage affine they define.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCalibration {
    points: [CalibrationPoint; 3],
    pixel_to_stage: Transform,
}

impl StageCalibration {
    /// Requires exactly three non-collinear points. They are stored
    /// top-left, top-right, bottom-left (image orientation), which is the
    /// order the instrument file header expects.
    pub fn from_points(points: &[CalibrationPoint]) -> Result<Self> {
        let [a, b, c] = <[CalibrationPoint; 3]>::try_from(points).map_err(|_| {
            Error::InsufficientCalibrationPoints {
                found: points.len(),
            }
        })?;

        let pixels = [a.pixel, b.pixel, c.pixel];
        let stages = [a.stage, b.stage, c.stage];
        if is_degenerate(&pixels) || is_degenerate(&stages) {
            return Err(Error::DegenerateTransform(
                "calibration points are collinear".to_string(),
            ));
        }

        let ordered = order_marks([a, b, c]);
        let src: Vec<DVec2> = ordered.iter().map(|p| p.pixel).collect();
        let dst: Vec<DVec2> = ordered.iter().map(|p| p.stage).collect();
        let pixel_to_stage = estimate_affine(&src, &dst).ok_or_else(|| {
            Error::DegenerateTransform("calibration transform is singular".to_string())
        })?;

        debug!(transform = %pixel_to_stage, "stage calibration");
        Ok(Self {
            points: ordered,
            pixel_to_stage,
        })
    }

    /// Points in header order: top-left, top-right, bottom-left.
    pub fn points(&self) -> &[CalibrationPoint; 3] {
        &self.points
    }

    pub fn slide_to_stage(&self, slide_pixel: DVec2) -> DVec2 {
        self.pixel_to_stage.apply(slide_pixel)
    }

    /// SectionPixel -> DeviceStage for a section placed at `bounds`.
    pub fn section_transform(&self, bounds: &SectionBounds) -> Result<AffineTransform> {
        let to_slide = Transform::translation(bounds.offset());
        AffineTransform::new(
            CoordinateFrame::SectionPixel,
            CoordinateFrame::DeviceStage,
            self.pixel_to_stage.compose(&to_slide),
        )
    }
}

/// Top-left has the smallest `x + y`; of the other two, top-right leans
/// furthest towards `+x, -y`.
fn order_marks(points: [CalibrationPoint; 3]) -> [CalibrationPoint; 3] {
    let mut rest = points.to_vec();
    let tl_index = rest
        .iter()
        .enumerate()
        .min_by(|(_, p), (_, q)| {
            (p.pixel.x + p.pixel.y).total_cmp(&(q.pixel.x + q.pixel.y))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let top_left = rest.remove(tl_index);
    let (top_right, bottom_left) =
        if rest[0].pixel.x - rest[0].pixel.y >= rest[1].pixel.x - rest[1].pixel.y {
            (rest[0], rest[1])
        } else {
            (rest[1], rest[0])
        };
    [top_left, top_right, bottom_left]
}
