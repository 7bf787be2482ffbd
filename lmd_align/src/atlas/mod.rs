//! Reference atlas: label and intensity volumes plus the region table.

mod plane;

use std::sync::Arc;

use glam::DVec3;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::regions::RegionTree;

pub use plane::{PlaneRaster, SliceParams, SlicePlane};

/// Shape and voxel size of the atlas volumes.
///
/// Voxel centres are placed so the volume is centred on the physical origin:
/// `physical = (index - (n - 1) / 2) * voxel_size` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtlasGeometry {
    pub shape: [usize; 3],
    pub voxel_size_mm: DVec3,
}

impl AtlasGeometry {
    pub fn new(shape: [usize; 3], voxel_size_mm: DVec3) -> Result<Self> {
        if shape.iter().any(|&n| n == 0) {
            return Err(Error::invalid("shape", format!("{shape:?} has an empty axis")));
        }
        if !voxel_size_mm.is_finite() || voxel_size_mm.min_element() <= 0.0 {
            return Err(Error::invalid(
                "voxel_size_mm",
                format!("{voxel_size_mm} must be positive"),
            ));
        }
        Ok(Self {
            shape,
            voxel_size_mm,
        })
    }

    fn center_index(&self) -> DVec3 {
        DVec3::new(
            (self.shape[0] - 1) as f64,
            (self.shape[1] - 1) as f64,
            (self.shape[2] - 1) as f64,
        ) * 0.5
    }

    pub fn voxel_to_physical(&self, voxel: DVec3) -> DVec3 {
        (voxel - self.center_index()) * self.voxel_size_mm
    }

    pub fn physical_to_voxel(&self, physical: DVec3) -> DVec3 {
        physical / self.voxel_size_mm + self.center_index()
    }

    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Radius of a sphere around the origin enclosing every voxel.
    pub fn bounding_radius_mm(&self) -> f64 {
        (self.center_index() * self.voxel_size_mm).length() + self.voxel_size_mm.max_element()
    }

    pub fn min_voxel_size(&self) -> f64 {
        self.voxel_size_mm.min_element()
    }

    /// Nearest voxel index, or `None` outside the volume.
    fn nearest_index(&self, physical: DVec3) -> Option<[usize; 3]> {
        let v = self.physical_to_voxel(physical).round();
        let mut out = [0usize; 3];
        for (axis, slot) in out.iter_mut().enumerate() {
            let c = v[axis];
            if !(c >= 0.0 && c < self.shape[axis] as f64) {
                return None;
            }
            *slot = c as usize;
        }
        Some(out)
    }

    #[inline]
    fn flat_index(&self, [i, j, k]: [usize; 3]) -> usize {
        (i * self.shape[1] + j) * self.shape[2] + k
    }
}

/// Dense 3D volume stored axis-0 major.
#[derive(Debug, Clone)]
pub struct Volume<T> {
    geometry: AtlasGeometry,
    data: Vec<T>,
}

impl<T> Volume<T> {
    pub fn new(geometry: AtlasGeometry, data: Vec<T>) -> Result<Self> {
        if data.len() != geometry.voxel_count() {
            return Err(Error::invalid(
                "data",
                format!(
                    "{} values for a {:?} volume",
                    data.len(),
                    geometry.shape
                ),
            ));
        }
        Ok(Self { geometry, data })
    }

    pub fn geometry(&self) -> &AtlasGeometry {
        &self.geometry
    }

    pub fn get(&self, index: [usize; 3]) -> Option<&T> {
        if index
            .iter()
            .zip(self.geometry.shape.iter())
            .all(|(&i, &n)| i < n)
        {
            Some(&self.data[self.geometry.flat_index(index)])
        } else {
            None
        }
    }

    pub fn set(&mut self, index: [usize; 3], value: T) -> bool {
        if index
            .iter()
            .zip(self.geometry.shape.iter())
            .all(|(&i, &n)| i < n)
        {
            let flat = self.geometry.flat_index(index);
            self.data[flat] = value;
            true
        } else {
            false
        }
    }

    pub fn values(&self) -> &[T] {
        &self.data
    }
}

impl<T: Clone> Volume<T> {
    pub fn filled(geometry: AtlasGeometry, value: T) -> Self {
        Self {
            data: vec![value; geometry.voxel_count()],
            geometry,
        }
    }
}

impl<T: Copy + Default> Volume<T> {
    /// Nearest-voxel sample; `T::default()` outside the volume.
    pub fn sample_nearest(&self, physical: DVec3) -> T {
        self.geometry
            .nearest_index(physical)
            .map(|idx| self.data[self.geometry.flat_index(idx)])
            .unwrap_or_default()
    }
}

impl Volume<f32> {
    /// Trilinear sample; voxels outside the volume count as zero.
    pub fn sample_linear(&self, physical: DVec3) -> f32 {
        let v = self.geometry.physical_to_voxel(physical);
        let base = v.floor();
        let frac = v - base;

        let mut acc = 0.0f64;
        for corner in 0..8 {
            let offset = DVec3::new(
                (corner & 1) as f64,
                ((corner >> 1) & 1) as f64,
                ((corner >> 2) & 1) as f64,
            );
            let weight = (0..3)
                .map(|axis| {
                    if offset[axis] > 0.0 {
                        frac[axis]
                    } else {
                        1.0 - frac[axis]
                    }
                })
                .product::<f64>();
            if weight == 0.0 {
                continue;
            }
            let c = base + offset;
            if (0..3).any(|axis| c[axis] < 0.0 || c[axis] >= self.geometry.shape[axis] as f64) {
                continue;
            }
            let idx = [c.x as usize, c.y as usize, c.z as usize];
            acc += weight * self.data[self.geometry.flat_index(idx)] as f64;
        }
        acc as f32
    }
}

/// Label volume, reference intensity volume and region tree of one atlas.
#[derive(Debug, Clone)]
pub struct Atlas {
    labels: Volume<u32>,
    reference: Volume<f32>,
    regions: Arc<RegionTree>,
}

impl Atlas {
    pub fn new(labels: Volume<u32>, reference: Volume<f32>, regions: RegionTree) -> Result<Self> {
        if labels.geometry() != reference.geometry() {
            return Err(Error::invalid(
                "reference",
                format!(
                    "geometry {:?} does not match label volume {:?}",
                    reference.geometry(),
                    labels.geometry()
                ),
            ));
        }

        let known = regions.all_labels();
        let unknown: HashSet<u32> = labels
            .values()
            .iter()
            .copied()
            .filter(|&l| l != 0 && !known.contains(&l))
            .collect();
        if !unknown.is_empty() {
            warn!(
                count = unknown.len(),
                "label volume holds labels that no region claims"
            );
        }

        info!(
            shape = ?labels.geometry().shape,
            regions = regions.len(),
            "atlas loaded"
        );

        Ok(Self {
            labels,
            reference,
            regions: Arc::new(regions),
        })
    }

    pub fn geometry(&self) -> &AtlasGeometry {
        self.labels.geometry()
    }

    pub fn labels(&self) -> &Volume<u32> {
        &self.labels
    }

    pub fn reference(&self) -> &Volume<f32> {
        &self.reference
    }

    pub fn regions(&self) -> &Arc<RegionTree> {
        &self.regions
    }
}
