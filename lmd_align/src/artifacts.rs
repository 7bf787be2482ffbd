//! Saved alignment inputs and results, as YAML or JSON by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atlas::SliceParams;
use crate::deformation::DeformationField;
use crate::error::{Error, Result};
use crate::initializer::LandmarkSet;
use crate::refinement::RefinementConfig;
use crate::regions::{RegionId, Selection};
use crate::section::{Section, SectionId};

/// Everything needed to bring a section back to its aligned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionArtifacts {
    pub section: SectionId,
    pub name: String,
    pub slice_params: SliceParams,
    pub landmarks: LandmarkSet,
    pub refinement: RefinementConfig,
    /// Active field; `None` for sections that were never initialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<DeformationField>,
}

impl SectionArtifacts {
    /// Fails while a refinement is running, since the active field is then
    /// only the affine stand-in.
    pub fn capture(section: &Section) -> Result<Self> {
        let field = match section.export_snapshot() {
            Ok(field) => Some(field),
            Err(Error::NotInitialized { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            section: section.id(),
            name: section.name().to_string(),
            slice_params: *section.slice_params(),
            landmarks: section.landmarks().clone(),
            refinement: section.refinement_config().clone(),
            field,
        })
    }

    /// Restores inputs onto `section`, re-runs the affine initialization and
    /// installs the saved field on top of it.
    pub fn apply_to(&self, section: &mut Section) -> Result<()> {
        section.set_slice_params(self.slice_params)?;
        section.set_landmarks(self.landmarks.clone());
        section.set_refinement_config(self.refinement.clone())?;
        if let Some(field) = &self.field {
            section.initialize()?;
            section.apply_manual_adjustment(field.clone())?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        common::save_to_file(self, path)?;
        info!(section = %self.section, path = %path.display(), "section artifacts saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(common::load_from_file(path)?)
    }
}

/// Writes the resolved export list of `selection`.
pub fn save_selection(selection: &Selection, path: &Path) -> Result<()> {
    let regions = selection.resolve_export();
    common::save_to_file(&regions, path)?;
    info!(regions = regions.len(), path = %path.display(), "selection saved");
    Ok(())
}

/// Replaces `selection` with the regions stored at `path`. Returns them.
pub fn load_selection(selection: &mut Selection, path: &Path) -> Result<Vec<RegionId>> {
    let regions: Vec<RegionId> = common::load_from_file(path)?;
    selection.restore(&regions)?;
    Ok(regions)
}
