//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lmd_align::prelude::*;
//! ```

// Errors
pub use crate::{Error, Result};

// Atlas, frames and slides
pub use crate::{
    Atlas, CalibrationPoint, CoordinateFrame, FrameRegistry, Point, Section, SectionBounds,
    SectionId, SliceParams, Slide,
};

// Alignment
pub use crate::{
    CancelToken, DeformationField, InitializerConfig, LandmarkGridSolver, LandmarkPair,
    NonRigidSolver, RefinementConfig, RefinementEvent, RefinementPreset,
};

// Selection and export
pub use crate::{
    ExportConfig, ExportReport, LMD_FILE_NAME, RegionId, Selection, SelectionState, export_batch,
    save_lmd_xml,
};
