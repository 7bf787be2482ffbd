//! Hand-off documents for the external manual-adjustment tool.
//!
//! A section is described by its `anchoring`: the atlas voxel position of
//! the image's top-left corner followed by the voxel-space vectors spanning
//! its width and height. Non-rigid corrections travel as markers
//! `[x, y, nx, ny]`: a pixel predicted by the affine seed and where the user
//! moved it.

use std::path::{Path, PathBuf};

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::atlas::{AtlasGeometry, SlicePlane};
use crate::deformation::{Correction, DeformationField, ThinPlateSpline, TpsConfig};
use crate::error::{Error, Result};
use crate::frames::CoordinateFrame;
use crate::transform::estimate::{centroid, estimate_affine, is_degenerate};
use crate::transform::{AffineTransform, Transform};

/// Document the adjustment tool opens.
pub const EXCHANGE_FILE_NAME: &str = "CLICK_ME.json";
/// Folder the adjustment tool exports into.
pub const ADJUSTED_FOLDER_NAME: &str = "EXPORT_VISUALIGN_HERE";

pub const DEFAULT_TARGET: &str = "custom_atlas.cutlas";
pub const DEFAULT_ALIGNER: &str = "prerelease_1.0.0";

/// Markers written per image axis for a corrected field.
const MARKERS_PER_AXIS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDocument {
    #[serde(default)]
    pub name: String,
    pub target: String,
    pub aligner: String,
    pub slices: Vec<ExchangeSlice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSlice {
    pub filename: String,
    pub anchoring: [f64; 9],
    pub height: usize,
    pub width: usize,
    pub nr: usize,
    #[serde(default)]
    pub markers: Vec<[f64; 4]>,
}

impl ExchangeDocument {
    pub fn new(slices: Vec<ExchangeSlice>) -> Self {
        Self {
            name: String::new(),
            target: DEFAULT_TARGET.to_string(),
            aligner: DEFAULT_ALIGNER.to_string(),
            slices,
        }
    }

    pub fn slice(&self, filename: &str) -> Option<&ExchangeSlice> {
        self.slices.iter().find(|s| s.filename == filename)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        common::save_to_file(self, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(common::load_from_file(path)?)
    }
}

impl ExchangeSlice {
    /// Describes `field` for an image of `size` pixels (width, height).
    ///
    /// The anchoring comes from the affine seed alone; a correction, if any,
    /// is sampled into a lattice of markers.
    pub fn from_field(
        filename: impl Into<String>,
        nr: usize,
        field: &DeformationField,
        geometry: &AtlasGeometry,
        size: (usize, usize),
    ) -> Result<Self> {
        let (width, height) = size;
        if width == 0 || height == 0 {
            return Err(Error::invalid("size", "image must not be empty"));
        }
        let (w, h) = (width as f64, height as f64);
        let inverse = field.seed().inverse()?;
        let plane = field.plane();
        let voxel_at = |pixel: DVec2| {
            geometry.physical_to_voxel(plane.to_physical(inverse.apply_xy(pixel)))
        };

        let origin = voxel_at(DVec2::ZERO);
        let u = voxel_at(DVec2::new(w, 0.0)) - origin;
        let v = voxel_at(DVec2::new(0.0, h)) - origin;

        let mut markers = Vec::new();
        if !field.correction().is_none() {
            for j in 0..MARKERS_PER_AXIS {
                for i in 0..MARKERS_PER_AXIS {
                    let p = DVec2::new(
                        (i as f64 + 0.5) / MARKERS_PER_AXIS as f64 * w,
                        (j as f64 + 0.5) / MARKERS_PER_AXIS as f64 * h,
                    );
                    let moved = p + field.correction().displacement(inverse.apply_xy(p));
                    markers.push([p.x, p.y, moved.x, moved.y]);
                }
            }
        }

        Ok(Self {
            filename: filename.into(),
            anchoring: [
                origin.x, origin.y, origin.z, u.x, u.y, u.z, v.x, v.y, v.z,
            ],
            height,
            width,
            nr,
            markers,
        })
    }

    fn anchor_vectors(&self) -> (DVec3, DVec3, DVec3) {
        let a = &self.anchoring;
        (
            DVec3::new(a[0], a[1], a[2]),
            DVec3::new(a[3], a[4], a[5]),
            DVec3::new(a[6], a[7], a[8]),
        )
    }

    /// Rebuilds a field on `plane` for a section image of `section_size`.
    ///
    /// The anchoring corners are projected onto the plane to recover the
    /// seed. Three or more non-collinear markers become a thin-plate spline
    /// correction; fewer are folded into the seed as their mean shift.
    pub fn to_field(
        &self,
        plane: SlicePlane,
        geometry: &AtlasGeometry,
        section_size: (usize, usize),
    ) -> Result<DeformationField> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Exchange(format!(
                "slice '{}' has an empty image",
                self.filename
            )));
        }
        if self.anchoring.iter().any(|a| !a.is_finite()) {
            return Err(Error::Exchange(format!(
                "slice '{}' has a non-finite anchoring",
                self.filename
            )));
        }
        let scale = DVec2::new(
            section_size.0 as f64 / self.width as f64,
            section_size.1 as f64 / self.height as f64,
        );

        let (origin, u, v) = self.anchor_vectors();
        let tolerance = geometry.voxel_size_mm.max_element();
        let mut corners_uv = Vec::with_capacity(3);
        for corner in [origin, origin + u, origin + v] {
            let (uv, depth) = plane.project(geometry.voxel_to_physical(corner));
            if depth.abs() > tolerance {
                warn!(
                    slice = %self.filename,
                    depth_mm = depth,
                    "anchoring corner lies off the section plane"
                );
            }
            corners_uv.push(uv);
        }
        let corners_px = [
            DVec2::ZERO,
            DVec2::new(section_size.0 as f64, 0.0),
            DVec2::new(0.0, section_size.1 as f64),
        ];
        let transform = estimate_affine(&corners_uv, &corners_px).ok_or_else(|| {
            Error::Exchange(format!(
                "anchoring of slice '{}' is degenerate on this plane",
                self.filename
            ))
        })?;
        let seed = AffineTransform::new(
            CoordinateFrame::AtlasPhysical,
            CoordinateFrame::SectionPixel,
            transform,
        )?;

        if self.markers.is_empty() {
            return DeformationField::from_affine(plane, seed);
        }

        let inverse = seed.inverse()?;
        let mut sources = Vec::with_capacity(self.markers.len());
        let mut shifts = Vec::with_capacity(self.markers.len());
        for &[x, y, nx, ny] in &self.markers {
            let from = DVec2::new(x, y) * scale;
            let to = DVec2::new(nx, ny) * scale;
            sources.push(inverse.apply_xy(from));
            shifts.push(to - from);
        }

        if sources.len() >= 3 && !is_degenerate(&sources) {
            let tps = ThinPlateSpline::fit(&sources, &shifts, TpsConfig::default()).ok_or_else(
                || Error::Exchange(format!("markers of slice '{}' cannot be fitted", self.filename)),
            )?;
            info!(slice = %self.filename, markers = sources.len(), "marker correction imported");
            return DeformationField::new(plane, seed, Correction::Spline(tps));
        }

        let shift = centroid(&shifts);
        warn!(
            slice = %self.filename,
            markers = sources.len(),
            "too few independent markers for a spline, applying their mean shift"
        );
        let shifted = AffineTransform::new(
            seed.from,
            seed.to,
            Transform::translation(shift).compose(&seed.transform),
        )?;
        DeformationField::from_affine(plane, shifted)
    }
}

/// Writes `document` as the tool's input in `project_dir` and makes sure the
/// export folder exists. Returns the document path.
pub fn write_exchange(project_dir: &Path, document: &ExchangeDocument) -> Result<PathBuf> {
    let folder = project_dir.join(ADJUSTED_FOLDER_NAME);
    std::fs::create_dir_all(&folder).map_err(|e| Error::io(&folder, e))?;
    let path = project_dir.join(EXCHANGE_FILE_NAME);
    document.save(&path)?;
    info!(path = %path.display(), slices = document.slices.len(), "exchange document written");
    Ok(path)
}

/// Reads a document the tool exported under `project_dir`.
pub fn read_adjusted(project_dir: &Path, file_name: &str) -> Result<ExchangeDocument> {
    ExchangeDocument::load(&project_dir.join(ADJUSTED_FOLDER_NAME).join(file_name))
}
