use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::debug;

use crate::error::Result;
use crate::regions::{RegionId, RegionTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SelectionState {
    Unchecked,
    Checked,
    Tristate,
}

/// Tristate selection over a [`RegionTree`].
///
/// The only stored state is the set of checked "own parts": every leaf, and
/// every internal node that carries voxel labels of its own. Node states are
/// recomputed from that set after each change:
///
/// - a node is Checked iff its own part (if any) and all children are Checked,
/// - Unchecked iff all of them are Unchecked,
/// - Tristate otherwise. Leaves therefore never become Tristate.
///
/// An internal node's own part is only checked by toggling that node itself,
/// so checking every child of a labelled parent leaves the parent Tristate.
#[derive(Debug, Clone)]
pub struct Selection {
    tree: Arc<RegionTree>,
    checked: HashSet<RegionId>,
    states: HashMap<RegionId, SelectionState>,
}

impl Selection {
    pub fn new(tree: Arc<RegionTree>) -> Self {
        let checked = HashSet::new();
        let states = derive_states(&tree, &checked);
        Self {
            tree,
            checked,
            states,
        }
    }

    pub fn tree(&self) -> &Arc<RegionTree> {
        &self.tree
    }

    pub fn state(&self, id: RegionId) -> Result<SelectionState> {
        self.tree.get(id)?;
        Ok(self
            .states
            .get(&id)
            .copied()
            .unwrap_or(SelectionState::Unchecked))
    }

    pub fn states(&self) -> &HashMap<RegionId, SelectionState> {
        &self.states
    }

    /// User toggle. Checked nodes become Unchecked; Unchecked and Tristate
    /// nodes become Checked. The whole subtree follows.
    pub fn toggle(&mut self, id: RegionId) -> Result<SelectionState> {
        let check = self.state(id)? != SelectionState::Checked;
        self.set_checked(id, check)?;
        self.state(id)
    }

    /// Sets `id` and all its descendants to Checked or Unchecked.
    pub fn set_checked(&mut self, id: RegionId, checked: bool) -> Result<()> {
        let mut subtree = self.tree.descendants(id)?;
        subtree.push(id);
        for node_id in subtree {
            if !self.tree.get(node_id)?.has_own_part() {
                continue;
            }
            if checked {
                self.checked.insert(node_id);
            } else {
                self.checked.remove(&node_id);
            }
        }
        self.states = derive_states(&self.tree, &self.checked);
        debug!(region = %id, checked, "selection changed");
        Ok(())
    }

    pub fn clear(&mut self) {
        self.checked.clear();
        self.states = derive_states(&self.tree, &self.checked);
    }

    /// Topmost Checked nodes in preorder. No returned node is a descendant
    /// of another; Tristate nodes contribute only their Checked descendants.
    pub fn resolve_export(&self) -> Vec<RegionId> {
        let mut out = Vec::new();
        let mut stack: Vec<RegionId> = self.tree.roots().iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            match self.states.get(&id) {
                Some(SelectionState::Checked) => out.push(id),
                Some(SelectionState::Tristate) => {
                    if let Ok(node) = self.tree.get(id) {
                        stack.extend(node.children.iter().rev().copied());
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Replaces the selection with the given exported regions' subtrees.
    pub fn restore(&mut self, regions: &[RegionId]) -> Result<()> {
        for &id in regions {
            self.tree.get(id)?;
        }
        self.checked.clear();
        for &id in regions {
            self.set_checked(id, true)?;
        }
        Ok(())
    }
}

fn derive_states(
    tree: &RegionTree,
    checked: &HashSet<RegionId>,
) -> HashMap<RegionId, SelectionState> {
    let mut states = HashMap::with_capacity(tree.len());
    for &root in tree.roots() {
        derive_node(tree, root, checked, &mut states);
    }
    states
}

fn derive_node(
    tree: &RegionTree,
    id: RegionId,
    checked: &HashSet<RegionId>,
    states: &mut HashMap<RegionId, SelectionState>,
) -> SelectionState {
    let Ok(node) = tree.get(id) else {
        return SelectionState::Unchecked;
    };

    let mut any_checked = false;
    let mut any_unchecked = false;
    let mut any_tristate = false;

    if node.has_own_part() {
        if checked.contains(&id) {
            any_checked = true;
        } else {
            any_unchecked = true;
        }
    }
    for &child in &node.children {
        match derive_node(tree, child, checked, states) {
            SelectionState::Checked => any_checked = true,
            SelectionState::Unchecked => any_unchecked = true,
            SelectionState::Tristate => any_tristate = true,
        }
    }

    let state = if any_tristate || (any_checked && any_unchecked) {
        SelectionState::Tristate
    } else if any_checked {
        SelectionState::Checked
    } else {
        SelectionState::Unchecked
    };
    states.insert(id, state);
    state
}
