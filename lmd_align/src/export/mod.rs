//! Boundary extraction and shape export.
//!
//! For each resolved region the labels of its subtree are rasterized on the
//! section's cutting plane, traced into rings, simplified, checked, and mapped
//! through the section's deformation field into section pixels and then into
//! stage coordinates. Problems with single regions or sections are reported
//! as [`ShapeIssue`]s; the batch always completes.

mod boundary;
mod lmd_xml;
mod overlay;
mod wells;

use glam::DVec2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atlas::{Atlas, PlaneRaster};
use crate::calibration::StageCalibration;
use crate::deformation::{DeformationField, StageMapping};
use crate::error::{Error, Result};
use crate::regions::{RegionId, Selection};
use crate::section::SectionId;
use crate::slide::Slide;
use crate::transform::AffineTransform;

pub use boundary::{
    RingKind, is_self_intersecting, region_mask, signed_area, simplify_capped, simplify_closed,
    trace_rings,
};
pub use lmd_xml::{LMD_FILE_NAME, save_lmd_xml, to_lmd_xml};
pub use overlay::{OVERLAY_FILE_NAME, render_overlay, save_overlay};
pub use wells::{Well, WellAllocator, WellPlate};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Objective magnification passed to the instrument with every shape.
    pub magnification: u32,
    /// Douglas-Peucker tolerance in mm. `None` uses half a raster pixel.
    pub simplify_tolerance_mm: Option<f64>,
    /// Vertex cap per ring; the tolerance is doubled until it holds.
    pub max_vertices: usize,
    /// Maximum distance between consecutive ring points before warping, in mm.
    pub max_spacing_mm: f64,
    /// Label raster spacing in mm. `None` uses the smallest voxel size.
    pub raster_spacing_mm: Option<f64>,
    pub plate: WellPlate,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            magnification: 10,
            simplify_tolerance_mm: None,
            max_vertices: 2000,
            max_spacing_mm: 0.02,
            raster_spacing_mm: None,
            plate: WellPlate::default(),
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.magnification == 0 {
            return Err(Error::invalid("magnification", "must be positive"));
        }
        if let Some(t) = self.simplify_tolerance_mm {
            if !t.is_finite() || t < 0.0 {
                return Err(Error::invalid(
                    "simplify_tolerance_mm",
                    format!("{t} must be non-negative"),
                ));
            }
        }
        if self.max_vertices < 3 {
            return Err(Error::invalid("max_vertices", "a ring needs at least 3 vertices"));
        }
        if !self.max_spacing_mm.is_finite() || self.max_spacing_mm <= 0.0 {
            return Err(Error::invalid(
                "max_spacing_mm",
                format!("{} must be positive", self.max_spacing_mm),
            ));
        }
        if let Some(s) = self.raster_spacing_mm {
            if !s.is_finite() || s <= 0.0 {
                return Err(Error::invalid(
                    "raster_spacing_mm",
                    format!("{s} must be positive"),
                ));
            }
        }
        self.plate.validate()
    }
}

// =============================================================================
// Shapes and issues
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRing {
    pub kind: RingKind,
    /// Simplified ring on the cutting plane, mm.
    pub plane_mm: Vec<DVec2>,
    pub section_pixels: Vec<DVec2>,
    /// DeviceStage coordinates.
    pub stage: Vec<DVec2>,
}

/// One exported region of one section. Islands and holes are separate rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportShape {
    pub section: SectionId,
    pub section_name: String,
    pub region: RegionId,
    pub region_name: String,
    /// `region` followed by its descendants, all merged into this shape.
    pub merged_regions: Vec<RegionId>,
    pub rings: Vec<ShapeRing>,
    pub well: Option<Well>,
    pub magnification: u32,
}

impl ExportShape {
    pub fn outer_rings(&self) -> impl Iterator<Item = &ShapeRing> {
        self.rings.iter().filter(|r| r.kind == RingKind::Outer)
    }

    pub fn transfer_id(&self) -> String {
        format!("{}_{}", self.region_name, self.section_name)
    }
}

/// Per-item outcome of an export: an item that produced no shape, or a shape
/// that was exported with parts left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ShapeIssue {
    #[error("region {region} has no voxels on section {section}")]
    EmptyRegionMask {
        section: SectionId,
        region: RegionId,
    },
    #[error("region {region} on section {section} has voxels but no boundary ring")]
    BoundaryCollapsed {
        section: SectionId,
        region: RegionId,
    },
    #[error("boundary ring {ring} of region {region} on section {section} intersects itself")]
    SelfIntersectingBoundary {
        section: SectionId,
        region: RegionId,
        ring: usize,
    },
    /// The shape was exported as its outer rings; the instrument format has
    /// no way to cut out the holes.
    #[error("{holes} hole(s) of region {region} on section {section} are not cut out")]
    HolesNotCut {
        section: SectionId,
        region: RegionId,
        holes: usize,
    },
    #[error("no well left for region {region} on section {section}")]
    WellCapacityExceeded {
        section: SectionId,
        region: RegionId,
    },
    #[error("section {section} is being refined")]
    SectionBusy { section: SectionId },
    #[error("section {section} has no transform")]
    SectionNotReady { section: SectionId },
    #[error("export of section {section} failed: {reason}")]
    ExtractionFailed {
        section: SectionId,
        region: Option<RegionId>,
        reason: String,
    },
}

impl ShapeIssue {
    /// Whether the item was lost because of an error, as opposed to having
    /// nothing to export or being exported in part.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ShapeIssue::EmptyRegionMask { .. } | ShapeIssue::HolesNotCut { .. }
        )
    }

    pub fn section(&self) -> SectionId {
        match self {
            ShapeIssue::EmptyRegionMask { section, .. }
            | ShapeIssue::BoundaryCollapsed { section, .. }
            | ShapeIssue::HolesNotCut { section, .. }
            | ShapeIssue::SelfIntersectingBoundary { section, .. }
            | ShapeIssue::WellCapacityExceeded { section, .. }
            | ShapeIssue::SectionBusy { section }
            | ShapeIssue::SectionNotReady { section }
            | ShapeIssue::ExtractionFailed { section, .. } => *section,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub calibration: StageCalibration,
    pub shapes: Vec<ExportShape>,
    pub issues: Vec<ShapeIssue>,
}

impl ExportReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn skipped_regions(&self) -> Vec<(SectionId, RegionId)> {
        self.issues
            .iter()
            .filter_map(|issue| match issue {
                ShapeIssue::EmptyRegionMask { section, region } => Some((*section, *region)),
                _ => None,
            })
            .collect()
    }

    pub fn fatal_issues(&self) -> impl Iterator<Item = &ShapeIssue> {
        self.issues.iter().filter(|i| i.is_fatal())
    }

    pub fn shapes_for(&self, section: SectionId) -> impl Iterator<Item = &ExportShape> {
        self.shapes.iter().filter(move |s| s.section == section)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Section identity and transforms used for extraction.
#[derive(Debug, Clone, Copy)]
pub struct SectionTarget<'a> {
    pub id: SectionId,
    pub name: &'a str,
    pub field: &'a DeformationField,
    /// SectionPixel -> DeviceStage.
    pub stage: &'a AffineTransform,
}

/// Extracts one shape per region. Wells are not assigned.
pub fn extract_section_shapes(
    target: SectionTarget<'_>,
    atlas: &Atlas,
    regions: &[RegionId],
    config: &ExportConfig,
) -> Result<(Vec<ExportShape>, Vec<ShapeIssue>)> {
    config.validate()?;
    let stage_map = target.field.to_stage(target.stage)?;
    let spacing = config
        .raster_spacing_mm
        .unwrap_or_else(|| atlas.geometry().min_voxel_size());
    let raster = target
        .field
        .plane()
        .sample_labels(atlas.labels(), spacing)?;
    let tolerance_px = config.simplify_tolerance_mm.map_or(0.5, |t| t / spacing);

    let results: Vec<std::result::Result<ExportShape, ShapeIssue>> = regions
        .par_iter()
        .map(|&region| {
            extract_region(target, stage_map, atlas, &raster, region, tolerance_px, config)
                .unwrap_or_else(|e| {
                    Err(ShapeIssue::ExtractionFailed {
                        section: target.id,
                        region: Some(region),
                        reason: e.to_string(),
                    })
                })
        })
        .collect();

    let mut shapes = Vec::new();
    let mut issues = Vec::new();
    for result in results {
        match result {
            Ok(shape) => {
                let holes = shape.rings.len() - shape.outer_rings().count();
                if holes > 0 {
                    let issue = ShapeIssue::HolesNotCut {
                        section: shape.section,
                        region: shape.region,
                        holes,
                    };
                    warn!(%issue, "shape exported without holes");
                    issues.push(issue);
                }
                shapes.push(shape);
            }
            Err(issue) => {
                warn!(%issue, "region skipped");
                issues.push(issue);
            }
        }
    }
    Ok((shapes, issues))
}

/// Outer `Result` for errors, inner for reportable issues.
fn extract_region(
    target: SectionTarget<'_>,
    stage_map: StageMapping<'_>,
    atlas: &Atlas,
    raster: &PlaneRaster<u32>,
    region: RegionId,
    tolerance_px: f64,
    config: &ExportConfig,
) -> Result<std::result::Result<ExportShape, ShapeIssue>> {
    let tree = atlas.regions();
    let node = tree.get(region)?;
    let labels = tree.subtree_labels(region)?;
    let (mask, count) = region_mask(raster, &labels);
    if count == 0 {
        return Ok(Err(ShapeIssue::EmptyRegionMask {
            section: target.id,
            region,
        }));
    }

    let mut rings = Vec::new();
    for (index, (kind, points)) in trace_rings(&mask).into_iter().enumerate() {
        let simplified = simplify_capped(&points, tolerance_px, config.max_vertices);
        if simplified.len() < 3 {
            debug!(%region, ring = index, "degenerate ring dropped");
            continue;
        }
        if is_self_intersecting(&simplified) {
            return Ok(Err(ShapeIssue::SelfIntersectingBoundary {
                section: target.id,
                region,
                ring: index,
            }));
        }
        let plane_mm: Vec<DVec2> = simplified
            .iter()
            .map(|&p| raster.pixel_to_plane(p))
            .collect();
        let section_pixels = target.field.map_polygon(&plane_mm, config.max_spacing_mm)?;
        let stage = stage_map.map_polygon(&plane_mm, config.max_spacing_mm)?;
        rings.push(ShapeRing {
            kind,
            plane_mm,
            section_pixels,
            stage,
        });
    }
    if !rings.iter().any(|r| r.kind == RingKind::Outer) {
        return Ok(Err(ShapeIssue::BoundaryCollapsed {
            section: target.id,
            region,
        }));
    }

    let mut merged_regions = vec![region];
    merged_regions.extend(tree.descendants(region)?);
    Ok(Ok(ExportShape {
        section: target.id,
        section_name: target.name.to_string(),
        region,
        region_name: node.name.clone(),
        merged_regions,
        rings,
        well: None,
        magnification: config.magnification,
    }))
}

// =============================================================================
// Batch
// =============================================================================

/// Exports the selection for the given sections of `slide` in order, then
/// assigns wells in shape order.
pub fn export_batch(
    slide: &Slide,
    atlas: &Atlas,
    selection: &Selection,
    sections: &[SectionId],
    config: &ExportConfig,
) -> Result<ExportReport> {
    config.validate()?;
    let calibration = slide
        .calibration()
        .ok_or(Error::InsufficientCalibrationPoints { found: 0 })?
        .clone();
    let regions = selection.resolve_export();

    let mut shapes = Vec::new();
    let mut issues = Vec::new();
    for &id in sections {
        let section = slide.section(id).ok_or_else(|| {
            Error::invalid("sections", format!("section {id} is not on slide {}", slide.id()))
        })?;

        let field = match section.export_snapshot() {
            Ok(field) => field,
            Err(Error::RefinementInProgress { .. }) => {
                warn!(section = %id, "section is being refined, skipped");
                issues.push(ShapeIssue::SectionBusy { section: id });
                continue;
            }
            Err(Error::NotInitialized { .. }) => {
                warn!(section = %id, "section has no transform, skipped");
                issues.push(ShapeIssue::SectionNotReady { section: id });
                continue;
            }
            Err(e) => return Err(e),
        };

        let extracted = section.stage_transform(&calibration).and_then(|stage| {
            let target = SectionTarget {
                id,
                name: section.name(),
                field: &field,
                stage: &stage,
            };
            extract_section_shapes(target, atlas, &regions, config)
        });
        match extracted {
            Ok((mut section_shapes, section_issues)) => {
                shapes.append(&mut section_shapes);
                issues.extend(section_issues);
            }
            Err(e) => {
                warn!(section = %id, error = %e, "section export failed");
                issues.push(ShapeIssue::ExtractionFailed {
                    section: id,
                    region: None,
                    reason: e.to_string(),
                });
            }
        }
    }

    let mut wells = WellAllocator::new(config.plate);
    let mut assigned = Vec::with_capacity(shapes.len());
    for mut shape in shapes {
        match wells.allocate() {
            Some(well) => {
                shape.well = Some(well);
                assigned.push(shape);
            }
            None => {
                let issue = ShapeIssue::WellCapacityExceeded {
                    section: shape.section,
                    region: shape.region,
                };
                warn!(%issue, "shape dropped");
                issues.push(issue);
            }
        }
    }

    info!(
        slide = %slide.id(),
        sections = sections.len(),
        shapes = assigned.len(),
        issues = issues.len(),
        "export batch finished"
    );
    Ok(ExportReport {
        calibration,
        shapes: assigned,
        issues,
    })
}

#[cfg(test)]
mod tests;
