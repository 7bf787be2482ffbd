use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::frames::{CoordinateFrame, Point};

const DUPLICATE_TOLERANCE: f64 = 1e-9;

/// An atlas point (AtlasPhysical, mm) and where it appears in the section (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPair {
    pub atlas: DVec3,
    pub section: DVec2,
}

impl LandmarkPair {
    pub fn new(atlas: DVec3, section: DVec2) -> Self {
        Self { atlas, section }
    }

    pub fn from_points(atlas: &Point, section: &Point) -> Result<Self> {
        atlas.ensure_frame(CoordinateFrame::AtlasPhysical)?;
        section.ensure_frame(CoordinateFrame::SectionPixel)?;
        Ok(Self::new(atlas.pos, section.xy()))
    }

    fn same_as(&self, other: &LandmarkPair) -> bool {
        self.atlas.distance(other.atlas) < DUPLICATE_TOLERANCE
            && self.section.distance(other.section) < DUPLICATE_TOLERANCE
    }
}

/// Ordered landmark annotations of one section. Duplicates are kept but reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    pairs: Vec<LandmarkPair>,
}

impl LandmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pair: LandmarkPair) {
        if let Some(existing) = self.pairs.iter().position(|p| p.same_as(&pair)) {
            warn!(
                existing,
                new = self.pairs.len(),
                "duplicate landmark pair"
            );
        }
        self.pairs.push(pair);
    }

    pub fn remove_last(&mut self) -> Option<LandmarkPair> {
        self.pairs.pop()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LandmarkPair> {
        self.pairs.iter()
    }

    pub fn as_slice(&self) -> &[LandmarkPair] {
        &self.pairs
    }

    /// Index pairs `(first, later)` of identical annotations.
    pub fn duplicates(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (j, later) in self.pairs.iter().enumerate() {
            for (i, earlier) in self.pairs[..j].iter().enumerate() {
                if earlier.same_as(later) {
                    out.push((i, j));
                    break;
                }
            }
        }
        out
    }
}

impl FromIterator<LandmarkPair> for LandmarkSet {
    fn from_iter<I: IntoIterator<Item = LandmarkPair>>(iter: I) -> Self {
        let mut set = LandmarkSet::new();
        for pair in iter {
            set.push(pair);
        }
        set
    }
}
