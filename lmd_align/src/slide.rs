use common::id_type;
use tracing::info;

use crate::calibration::{CalibrationPoint, StageCalibration};
use crate::error::Result;
use crate::section::{Section, SectionId};

id_type!(SlideId);

/// A physical slide: one stage calibration shared by all of its sections.
#[derive(Debug)]
pub struct Slide {
    id: SlideId,
    name: String,
    calibration: Option<StageCalibration>,
    sections: Vec<Section>,
}

impl Slide {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SlideId::unique(),
            name: name.into(),
            calibration: None,
            sections: Vec::new(),
        }
    }

    pub fn id(&self) -> SlideId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the calibration. On error the previous one is kept.
    pub fn set_calibration(&mut self, points: &[CalibrationPoint]) -> Result<&StageCalibration> {
        let calibration = StageCalibration::from_points(points)?;
        info!(slide = %self.id, "stage calibration set");
        Ok(self.calibration.insert(calibration))
    }

    pub fn calibration(&self) -> Option<&StageCalibration> {
        self.calibration.as_ref()
    }

    pub fn add_section(&mut self, section: Section) -> SectionId {
        let id = section.id();
        self.sections.push(section);
        id
    }

    pub fn remove_section(&mut self, id: SectionId) -> Option<Section> {
        let index = self.sections.iter().position(|s| s.id() == id)?;
        Some(self.sections.remove(index))
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id() == id)
    }

    pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id() == id)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.sections.iter().map(Section::id).collect()
    }
}
