//! Error types for registration and export.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::frames::CoordinateFrame;
use crate::regions::RegionId;
use crate::section::SectionId;

/// Fatal errors. Per-shape export problems are reported as
/// [`ShapeIssue`](crate::export::ShapeIssue) values instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Degenerate transform: {0}")]
    DegenerateTransform(String),

    #[error("Exactly 3 calibration points are required, found {found}")]
    InsufficientCalibrationPoints { found: usize },

    #[error("{count} landmarks are collinear or coincident, an affine fit is impossible")]
    DegenerateLandmarks { count: usize },

    #[error("No conversion path from {from} to {to}: missing {missing}")]
    UnreachableFrame {
        from: CoordinateFrame,
        to: CoordinateFrame,
        missing: &'static str,
    },

    #[error("Expected a point in {expected}, got one in {actual}")]
    FrameMismatch {
        expected: CoordinateFrame,
        actual: CoordinateFrame,
    },

    #[error("Refinement failed: {reason}")]
    RefinementFailed { reason: String },

    #[error("Refinement cancelled")]
    RefinementCancelled,

    #[error("Refinement already running for section {section}")]
    RefinementInProgress { section: SectionId },

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error("Section {section} has no transform, run the initializer first")]
    NotInitialized { section: SectionId },

    #[error("Unknown region {0}")]
    UnknownRegion(RegionId),

    #[error("Invalid region table: {0}")]
    InvalidRegionTable(String),

    #[error("Invalid exchange document: {0}")]
    Exchange(String),

    #[error("I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Format(#[from] common::SerdeFormatError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}
