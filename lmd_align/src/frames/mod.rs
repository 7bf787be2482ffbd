//! Coordinate frames and frame-tagged points.
//!
//! The four frames form a fixed chain:
//!
//! ```text
//! AtlasVoxel <-> AtlasPhysical <-> SectionPixel <-> DeviceStage
//!   voxel size      deformation field    stage calibration
//! ```
//!
//! Every [`Point`] carries its frame. Arithmetic between points of different
//! frames is rejected; crossing frames goes through [`FrameRegistry::convert`].

mod registry;

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::error::{Error, Result};

pub use registry::FrameRegistry;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum CoordinateFrame {
    /// Voxel indices of the atlas volumes.
    AtlasVoxel,
    /// Millimetres, atlas volume centred on the origin.
    AtlasPhysical,
    /// Pixels of one section image.
    SectionPixel,
    /// Stage coordinates of the cutting instrument.
    DeviceStage,
}

impl CoordinateFrame {
    /// Position along the conversion chain.
    pub fn chain_index(self) -> usize {
        match self {
            CoordinateFrame::AtlasVoxel => 0,
            CoordinateFrame::AtlasPhysical => 1,
            CoordinateFrame::SectionPixel => 2,
            CoordinateFrame::DeviceStage => 3,
        }
    }

    fn from_chain_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(CoordinateFrame::AtlasVoxel),
            1 => Some(CoordinateFrame::AtlasPhysical),
            2 => Some(CoordinateFrame::SectionPixel),
            3 => Some(CoordinateFrame::DeviceStage),
            _ => None,
        }
    }

    /// Neighbouring frame one step towards `target`, or `None` when already there.
    pub(crate) fn step_towards(self, target: CoordinateFrame) -> Option<CoordinateFrame> {
        let here = self.chain_index();
        let there = target.chain_index();
        if here < there {
            Self::from_chain_index(here + 1)
        } else if here > there {
            Self::from_chain_index(here - 1)
        } else {
            None
        }
    }
}

/// A position tagged with its coordinate frame.
///
/// Section and stage points keep `z` as the signed out-of-plane distance in mm
/// from the section's cutting plane; it is zero for anything lying in the section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub frame: CoordinateFrame,
    pub pos: DVec3,
}

impl Point {
    pub fn new(frame: CoordinateFrame, pos: DVec3) -> Self {
        Self { frame, pos }
    }

    /// In-plane point with `z = 0`.
    pub fn planar(frame: CoordinateFrame, xy: DVec2) -> Self {
        Self {
            frame,
            pos: xy.extend(0.0),
        }
    }

    pub fn xy(&self) -> DVec2 {
        self.pos.truncate()
    }

    pub fn ensure_frame(&self, expected: CoordinateFrame) -> Result<()> {
        if self.frame == expected {
            Ok(())
        } else {
            Err(Error::FrameMismatch {
                expected,
                actual: self.frame,
            })
        }
    }

    /// Vector from `self` to `other`. Both must share a frame.
    pub fn offset_to(&self, other: &Point) -> Result<DVec3> {
        other.ensure_frame(self.frame)?;
        Ok(other.pos - self.pos)
    }

    pub fn distance(&self, other: &Point) -> Result<f64> {
        Ok(self.offset_to(other)?.length())
    }

    pub fn translated(&self, delta: DVec3) -> Point {
        Point::new(self.frame, self.pos + delta)
    }
}
