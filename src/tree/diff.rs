//! Structural diff between two trees of the same lineage.
//!
//! Old nodes are indexed by `ecs_id`; new nodes match by `ecs_id` and
//! compare user-defined fields with deep equality, nested entities by
//! `ecs_id` only — a structural change inside a child is the child's own
//! modification, not the parent's. The resulting [`ModificationSet`]
//! drives the greedy fork path used by versioning.

use std::collections::BTreeSet;

use crate::entity::{EcsId, Entity};
use crate::error::{KhepriResult, TreeError};

use super::EntityTree;

/// Outcome of diffing an old stored tree against a new candidate.
#[derive(Debug, Clone, Default)]
pub struct ModificationSet {
    /// Nodes present in both trees whose payload fields changed.
    pub changed: BTreeSet<EcsId>,
    /// Nodes present only in the new tree.
    pub added: BTreeSet<EcsId>,
    /// Nodes present only in the old tree.
    pub removed: BTreeSet<EcsId>,
    /// Nodes whose payload is intact but whose parent or edge changed.
    pub moved: BTreeSet<EcsId>,
    /// Nodes untouched in payload and position.
    pub unchanged: BTreeSet<EcsId>,
}

impl ModificationSet {
    /// Whether the two trees are identical.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
    }

    /// The greedy fork path: every changed node plus every node on the
    /// path from a changed node to the root. Nodes off any changed path
    /// keep their identity.
    ///
    /// Added nodes already carry fresh identities and are not part of the
    /// path; their parents are, because a parent's field value changed.
    pub fn fork_path(&self, new_tree: &EntityTree) -> BTreeSet<EcsId> {
        let mut path = BTreeSet::new();
        for changed in &self.changed {
            if let Some(ancestors) = new_tree.ancestry(*changed) {
                path.extend(ancestors.iter().copied());
            }
        }
        path
    }
}

impl std::fmt::Display for ModificationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} changed, {} added, {} removed, {} moved, {} unchanged",
            self.changed.len(),
            self.added.len(),
            self.removed.len(),
            self.moved.len(),
            self.unchanged.len()
        )
    }
}

fn user_fields_eq_by_entity_id(a: &Entity, b: &Entity) -> bool {
    let mut lhs = a.fields();
    let mut rhs = b.fields();
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return true,
            (Some((ka, va)), Some((kb, vb))) => {
                if ka != kb || !va.eq_by_entity_id(vb) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Diff `new` against `old`. Both trees must share a lineage.
pub fn diff_trees(old: &EntityTree, new: &EntityTree) -> KhepriResult<ModificationSet> {
    if old.lineage_id() != new.lineage_id() {
        return Err(TreeError::LineageMismatch {
            old_lineage: old.lineage_id().to_string(),
            new_lineage: new.lineage_id().to_string(),
        }
        .into());
    }

    let mut mods = ModificationSet::default();

    for node in new.nodes() {
        let ecs = node.ecs_id();
        match old.node(ecs) {
            Some(old_node) => {
                if !user_fields_eq_by_entity_id(old_node, node) {
                    mods.changed.insert(ecs);
                } else if old.parent_of(ecs) != new.parent_of(ecs)
                    || old.incoming_edge(ecs) != new.incoming_edge(ecs)
                {
                    mods.moved.insert(ecs);
                } else {
                    mods.unchanged.insert(ecs);
                }
            }
            None => {
                mods.added.insert(ecs);
            }
        }
    }

    for ecs in old.node_ids() {
        if !new.contains(ecs) {
            mods.removed.insert(ecs);
        }
    }

    tracing::debug!(
        lineage = %new.lineage_id(),
        summary = %mods,
        "diffed entity trees"
    );

    Ok(mods)
}
