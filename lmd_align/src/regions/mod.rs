//! Region taxonomy of the atlas and the tristate selection over it.
//!
//! The tree is an id-indexed table with explicit child lists; nodes refer to
//! each other only by [`RegionId`].

mod selection;

use std::path::Path;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub use selection::{Selection, SelectionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub u32);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One taxonomy entry. Immutable once the tree is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionNode {
    pub id: RegionId,
    pub name: String,
    pub parent: Option<RegionId>,
    pub children: Vec<RegionId>,
    /// Voxel labels painted with this region itself, excluding descendants.
    pub labels: Vec<u32>,
}

impl RegionNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the node covers tissue of its own beyond its children.
    /// Leaves always count as their own part.
    pub fn has_own_part(&self) -> bool {
        self.is_leaf() || !self.labels.is_empty()
    }
}

/// Region table row as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    /// Explicit child order. Defaults to table order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<u32>>,
    /// Defaults to `[id]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<u32>>,
}

impl RegionRecord {
    pub fn new(id: u32, name: impl Into<String>, parent_id: Option<u32>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
            children: None,
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<u32>) -> Self {
        self.labels = Some(labels);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegionTree {
    nodes: Vec<RegionNode>,
    index: HashMap<RegionId, usize>,
    roots: Vec<RegionId>,
}

impl RegionTree {
    /// Builds and validates the tree.
    ///
    /// Rejects duplicate ids, unknown parents, explicit child lists that
    /// disagree with the parent links, and cycles.
    pub fn from_records(records: Vec<RegionRecord>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if index.insert(RegionId(record.id), i).is_some() {
                return Err(Error::InvalidRegionTable(format!(
                    "duplicate region id {}",
                    record.id
                )));
            }
        }

        let mut implied_children: HashMap<RegionId, Vec<RegionId>> = HashMap::new();
        let mut roots = Vec::new();
        for record in &records {
            match record.parent_id {
                Some(parent) => {
                    if !index.contains_key(&RegionId(parent)) {
                        return Err(Error::InvalidRegionTable(format!(
                            "region {} has unknown parent {}",
                            record.id, parent
                        )));
                    }
                    implied_children
                        .entry(RegionId(parent))
                        .or_default()
                        .push(RegionId(record.id));
                }
                None => roots.push(RegionId(record.id)),
            }
        }

        let mut nodes = Vec::with_capacity(records.len());
        for record in records {
            let id = RegionId(record.id);
            let implied = implied_children.remove(&id).unwrap_or_default();
            let children = match record.children {
                Some(explicit) => {
                    let explicit: Vec<RegionId> = explicit.into_iter().map(RegionId).collect();
                    let a: HashSet<RegionId> = explicit.iter().copied().collect();
                    let b: HashSet<RegionId> = implied.iter().copied().collect();
                    if a != b || a.len() != explicit.len() {
                        return Err(Error::InvalidRegionTable(format!(
                            "children of region {} disagree with parent links",
                            record.id
                        )));
                    }
                    explicit
                }
                None => implied,
            };
            nodes.push(RegionNode {
                id,
                name: record.name,
                parent: record.parent_id.map(RegionId),
                children,
                labels: record.labels.unwrap_or_else(|| vec![record.id]),
            });
        }

        let tree = Self {
            nodes,
            index,
            roots,
        };
        tree.check_acyclic()?;
        debug!(regions = tree.len(), roots = tree.roots.len(), "region tree built");
        Ok(tree)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let records: Vec<RegionRecord> = serde_json::from_str(json)?;
        Self::from_records(records)
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&text)
    }

    /// Every node must be reachable from a root exactly once.
    fn check_acyclic(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut stack: Vec<RegionId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(Error::InvalidRegionTable(format!(
                    "region {} is reachable twice",
                    id.0
                )));
            }
            stack.extend(self.nodes[self.index[&id]].children.iter().copied());
        }
        if seen.len() != self.nodes.len() {
            return Err(Error::InvalidRegionTable(
                "parent links form a cycle".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: RegionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: RegionId) -> Result<&RegionNode> {
        self.index
            .get(&id)
            .map(|&i| &self.nodes[i])
            .ok_or(Error::UnknownRegion(id))
    }

    pub fn roots(&self) -> &[RegionId] {
        &self.roots
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RegionNode> {
        self.nodes.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RegionNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: RegionId) -> Result<Vec<RegionId>> {
        let mut out = Vec::new();
        let mut current = self.get(id)?.parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.get(parent)?.parent;
        }
        Ok(out)
    }

    /// Descendants of `id` in preorder, excluding `id`.
    pub fn descendants(&self, id: RegionId) -> Result<Vec<RegionId>> {
        let mut out = Vec::new();
        let mut stack: Vec<RegionId> = self.get(id)?.children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.get(next)?.children.iter().rev().copied());
        }
        Ok(out)
    }

    pub fn is_ancestor(&self, ancestor: RegionId, of: RegionId) -> Result<bool> {
        Ok(self.ancestors(of)?.contains(&ancestor))
    }

    /// Every node in preorder, roots in table order.
    pub fn preorder(&self) -> Vec<RegionId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<RegionId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(&i) = self.index.get(&id) {
                stack.extend(self.nodes[i].children.iter().rev().copied());
            }
        }
        out
    }

    /// Union of voxel labels of `id` and all its descendants.
    pub fn subtree_labels(&self, id: RegionId) -> Result<HashSet<u32>> {
        let mut labels: HashSet<u32> = self.get(id)?.labels.iter().copied().collect();
        for d in self.descendants(id)? {
            labels.extend(self.get(d)?.labels.iter().copied());
        }
        Ok(labels)
    }

    pub fn all_labels(&self) -> HashSet<u32> {
        self.nodes
            .iter()
            .flat_map(|n| n.labels.iter().copied())
            .collect()
    }
}
