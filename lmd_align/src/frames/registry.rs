use tracing::trace;

use crate::atlas::AtlasGeometry;
use crate::deformation::DeformationField;
use crate::error::{Error, Result};
use crate::frames::{CoordinateFrame, Point};
use crate::transform::AffineTransform;

/// Conversion bridges known for one section.
///
/// Each edge of the frame chain needs its own bridge. Converting across an
/// edge whose bridge was never registered fails with `UnreachableFrame`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRegistry<'a> {
    geometry: Option<&'a AtlasGeometry>,
    field: Option<&'a DeformationField>,
    stage: Option<&'a AffineTransform>,
}

impl<'a> FrameRegistry<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_atlas(mut self, geometry: &'a AtlasGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_field(mut self, field: &'a DeformationField) -> Self {
        self.field = Some(field);
        self
    }

    /// Registers the SectionPixel -> DeviceStage transform of the section.
    pub fn with_stage(mut self, stage: &'a AffineTransform) -> Result<Self> {
        if stage.from != CoordinateFrame::SectionPixel || stage.to != CoordinateFrame::DeviceStage
        {
            return Err(Error::FrameMismatch {
                expected: CoordinateFrame::SectionPixel,
                actual: stage.from,
            });
        }
        self.stage = Some(stage);
        Ok(self)
    }

    /// Converts `point` from `from` to `to`, one chain edge at a time.
    pub fn convert(
        &self,
        point: &Point,
        from: CoordinateFrame,
        to: CoordinateFrame,
    ) -> Result<Point> {
        point.ensure_frame(from)?;
        self.check_path(from, to)?;

        let mut current = *point;
        while let Some(next) = current.frame.step_towards(to) {
            current = self.step(&current, next)?;
        }
        trace!(%from, %to, "converted point");
        Ok(current)
    }

    fn check_path(&self, from: CoordinateFrame, to: CoordinateFrame) -> Result<()> {
        let mut frame = from;
        while let Some(next) = frame.step_towards(to) {
            if let Some(missing) = self.missing_bridge(frame, next) {
                return Err(Error::UnreachableFrame { from, to, missing });
            }
            frame = next;
        }
        Ok(())
    }

    fn missing_bridge(&self, a: CoordinateFrame, b: CoordinateFrame) -> Option<&'static str> {
        let edge = a.chain_index().min(b.chain_index());
        match edge {
            0 if self.geometry.is_none() => Some("atlas geometry"),
            1 if self.field.is_none() => Some("deformation field"),
            2 if self.stage.is_none() => Some("stage calibration"),
            _ => None,
        }
    }

    fn step(&self, point: &Point, next: CoordinateFrame) -> Result<Point> {
        use CoordinateFrame::*;

        let unreachable = |missing| Error::UnreachableFrame {
            from: point.frame,
            to: next,
            missing,
        };

        let pos = match (point.frame, next) {
            (AtlasVoxel, AtlasPhysical) => self
                .geometry
                .ok_or_else(|| unreachable("atlas geometry"))?
                .voxel_to_physical(point.pos),
            (AtlasPhysical, AtlasVoxel) => self
                .geometry
                .ok_or_else(|| unreachable("atlas geometry"))?
                .physical_to_voxel(point.pos),
            (AtlasPhysical, SectionPixel) => self
                .field
                .ok_or_else(|| unreachable("deformation field"))?
                .map_point(point.pos),
            (SectionPixel, AtlasPhysical) => self
                .field
                .ok_or_else(|| unreachable("deformation field"))?
                .inverse_map_point(point.pos)?,
            (SectionPixel, DeviceStage) => {
                let stage = self.stage.ok_or_else(|| unreachable("stage calibration"))?;
                stage.apply_xy(point.xy()).extend(point.pos.z)
            }
            (DeviceStage, SectionPixel) => {
                let stage = self.stage.ok_or_else(|| unreachable("stage calibration"))?;
                stage.inverse()?.apply_xy(point.xy()).extend(point.pos.z)
            }
            (from, to) => {
                return Err(Error::UnreachableFrame {
                    from,
                    to,
                    missing: "adjacent frame",
                });
            }
        };
        Ok(Point::new(next, pos))
    }
}
