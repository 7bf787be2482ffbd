//! LMD Align - atlas-to-section registration and laser-microdissection export.
//!
//! This library maps a reference brain atlas onto tissue section images and
//! turns selected atlas regions into cutting shapes for a laser
//! microdissection instrument:
//! - Frame-tagged points and conversion along the atlas, section and stage chain
//! - Affine initialization from slice parameters and landmarks
//! - Cancellable non-rigid refinement behind a pluggable solver
//! - Tristate region selection over the atlas taxonomy
//! - Boundary extraction, well assignment and instrument file export
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lmd_align::prelude::*;
//!
//! let mut slide = Slide::new("slide 1");
//! slide.set_calibration(&marks)?;
//! let id = slide.add_section(Section::new("s1", bounds, image)?);
//! slide.section(id).unwrap().initialize()?;
//!
//! let mut selection = Selection::new(atlas.regions().clone());
//! selection.toggle(RegionId(2))?;
//!
//! let report = export_batch(&slide, &atlas, &selection, &[id], &ExportConfig::default())?;
//! save_lmd_xml(&report, Path::new(LMD_FILE_NAME))?;
//! ```

pub mod artifacts;
pub mod atlas;
pub mod buffer2;
pub mod calibration;
pub mod deformation;
mod error;
pub mod export;
pub mod frames;
pub mod initializer;
pub(crate) mod math;
pub mod refinement;
pub mod regions;
pub mod section;
pub mod slide;
pub mod transform;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod tests;

pub mod prelude;

// ============================================================================
// Errors and logging
// ============================================================================

pub use common::log_setup::{LogSetupError, setup_logging};
pub use error::{Error, Result};

// ============================================================================
// Atlas and frames
// ============================================================================

pub use atlas::{Atlas, AtlasGeometry, PlaneRaster, SliceParams, SlicePlane, Volume};
pub use buffer2::Buffer2;
pub use frames::{CoordinateFrame, FrameRegistry, Point};
pub use math::DMat3;
pub use transform::{AffineTransform, Transform, TransformType};

// ============================================================================
// Slides and calibration
// ============================================================================

pub use calibration::{CalibrationPoint, SectionBounds, StageCalibration};
pub use section::{RefinementHandle, Section, SectionId};
pub use slide::{Slide, SlideId};

// ============================================================================
// Alignment
// ============================================================================

pub use deformation::exchange::{ExchangeDocument, ExchangeSlice};
pub use deformation::{
    Correction, DeformationField, DisplacementGrid, StageMapping, ThinPlateSpline, TpsConfig,
};
pub use initializer::{
    AffineInitializer, FitKind, Initialization, InitializerConfig, LandmarkPair, LandmarkSet,
};
pub use refinement::{
    CancelToken, EventLog, LandmarkGridSolver, NonRigidSolver, ProgressCallback,
    RefinementConfig, RefinementEvent, RefinementOutcome, RefinementOverrides, RefinementPreset,
    RefinementProblem, RefinementStalled, SolverError, SolverRun, refine,
};

// ============================================================================
// Regions and export
// ============================================================================

pub use artifacts::SectionArtifacts;
pub use export::{
    ExportConfig, ExportReport, ExportShape, LMD_FILE_NAME, OVERLAY_FILE_NAME, RingKind,
    ShapeIssue, ShapeRing, Well, WellPlate, export_batch, save_lmd_xml, save_overlay, to_lmd_xml,
};
pub use regions::{RegionId, RegionNode, RegionRecord, RegionTree, Selection, SelectionState};
