//! Deep-copy visitors: copy-on-read and whole-tree forking.
//!
//! Both operations walk the user-defined fields of an entity tree in
//! depth-first pre-order. Copy-on-read refreshes every `live_id` while
//! preserving `ecs_id`s, and records an [`IdentityMap`] from each copy
//! instance back to the instance and version it was copied from; the
//! semantic classifier consumes that map after execution. Whole-tree
//! forking additionally assigns fresh `ecs_id`s to every node.
//!
//! Both operations are bounded by [`TreeLimits`]: the walk refuses trees
//! past the configured depth or node count before any unbounded recursion
//! can happen, so a pathological input fails with a typed error instead
//! of overflowing the stack.

use std::collections::HashMap;

use crate::error::{EntityError, KhepriError, KhepriResult};
use crate::tree::TreeLimits;

use super::Entity;
use super::id::{EcsId, LiveId};
use super::value::Value;

/// The identities a copy was made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalIdentity {
    /// Instance the copy was taken from.
    pub live_id: LiveId,
    /// Version the copy carries (preserved by copy-on-read).
    pub ecs_id: EcsId,
}

/// Table from each copy's `live_id` back to its original identities,
/// in depth-first insertion order.
///
/// Insertion order is significant: when the classifier falls back to
/// field-equality matching, the first match in depth-first order wins.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<LiveId, OriginalIdentity>,
    order: Vec<LiveId>,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a copy's original identity.
    pub fn insert(&mut self, copy_live_id: LiveId, original: OriginalIdentity) {
        if self.entries.insert(copy_live_id, original).is_none() {
            self.order.push(copy_live_id);
        }
    }

    /// Look up the original identity behind a copy instance.
    pub fn lookup(&self, copy_live_id: LiveId) -> Option<OriginalIdentity> {
        self.entries.get(&copy_live_id).copied()
    }

    /// Copy `live_id`s in depth-first insertion order.
    pub fn in_order(&self) -> impl Iterator<Item = (LiveId, OriginalIdentity)> + '_ {
        self.order.iter().map(|id| (*id, self.entries[id]))
    }

    /// Absorb another map (multi-record input preparation).
    pub fn merge(&mut self, other: IdentityMap) {
        for (live, original) in other.order.iter().map(|id| (*id, other.entries[id])) {
            self.insert(live, original);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Visitors
// ---------------------------------------------------------------------------

fn visit_value_mut(value: &mut Value, f: &mut impl FnMut(&mut Entity)) {
    match value {
        Value::Entity(e) => visit_entity_mut(e, f),
        Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
            for v in vs {
                visit_value_mut(v, f);
            }
        }
        Value::Map(m) => {
            for v in m.values_mut() {
                visit_value_mut(v, f);
            }
        }
        _ => {}
    }
}

/// Depth-first pre-order walk over every entity in a tree, mutably.
pub(crate) fn visit_entity_mut(entity: &mut Entity, f: &mut impl FnMut(&mut Entity)) {
    f(entity);
    for value in entity.fields_mut().values_mut() {
        visit_value_mut(value, f);
    }
}

fn visit_value<'a>(value: &'a Value, f: &mut impl FnMut(&'a Entity)) {
    match value {
        Value::Entity(e) => visit_entity(e, f),
        Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
            for v in vs {
                visit_value(v, f);
            }
        }
        Value::Map(m) => {
            for v in m.values() {
                visit_value(v, f);
            }
        }
        _ => {}
    }
}

/// Depth-first pre-order walk over every entity in a tree.
pub(crate) fn visit_entity<'a>(entity: &'a Entity, f: &mut impl FnMut(&'a Entity)) {
    f(entity);
    for (_, value) in entity.fields() {
        visit_value(value, f);
    }
}

/// All entities of a tree in depth-first pre-order (root first).
pub(crate) fn collect_nodes(entity: &Entity) -> Vec<&Entity> {
    let mut nodes = Vec::new();
    visit_entity(entity, &mut |e| nodes.push(e));
    nodes
}

// ---------------------------------------------------------------------------
// Limit enforcement
// ---------------------------------------------------------------------------

/// Which bound a tree walk exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitBreach {
    Depth(usize),
    Nodes(usize),
}

impl LimitBreach {
    pub(crate) fn message(self) -> String {
        match self {
            LimitBreach::Depth(max) => {
                format!("nesting depth exceeds the limit of {max}")
            }
            LimitBreach::Nodes(max) => {
                format!("node count exceeds the limit of {max}")
            }
        }
    }
}

/// Bounded pre-check over a tree. Container nesting counts toward the
/// depth bound, so the check itself never recurses past `max_depth` and
/// is safe on arbitrary input.
pub(crate) fn find_limit_breach(entity: &Entity, limits: &TreeLimits) -> Option<LimitBreach> {
    let mut nodes = 0usize;
    breach_in_entity(entity, 1, &mut nodes, limits)
}

fn breach_in_entity(
    entity: &Entity,
    depth: usize,
    nodes: &mut usize,
    limits: &TreeLimits,
) -> Option<LimitBreach> {
    if depth > limits.max_depth {
        return Some(LimitBreach::Depth(limits.max_depth));
    }
    *nodes += 1;
    if *nodes > limits.max_nodes {
        return Some(LimitBreach::Nodes(limits.max_nodes));
    }
    for (_, value) in entity.fields() {
        if let Some(breach) = breach_in_value(value, depth, nodes, limits) {
            return Some(breach);
        }
    }
    None
}

fn breach_in_value(
    value: &Value,
    depth: usize,
    nodes: &mut usize,
    limits: &TreeLimits,
) -> Option<LimitBreach> {
    match value {
        Value::Entity(e) => breach_in_entity(e, depth + 1, nodes, limits),
        Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
            if depth + 1 > limits.max_depth {
                return Some(LimitBreach::Depth(limits.max_depth));
            }
            for v in vs {
                if let Some(breach) = breach_in_value(v, depth + 1, nodes, limits) {
                    return Some(breach);
                }
            }
            None
        }
        Value::Map(m) => {
            if depth + 1 > limits.max_depth {
                return Some(LimitBreach::Depth(limits.max_depth));
            }
            for v in m.values() {
                if let Some(breach) = breach_in_value(v, depth + 1, nodes, limits) {
                    return Some(breach);
                }
            }
            None
        }
        _ => None,
    }
}

fn copy_error(breach: LimitBreach) -> KhepriError {
    EntityError::Copy {
        message: breach.message(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Copy operations
// ---------------------------------------------------------------------------

/// Copy-on-read: deep-copy a tree with fresh `live_id`s and preserved
/// `ecs_id`s, returning the copy together with the identity map.
///
/// If the source is a root, every node's `root_live_id` is re-pointed at
/// the fresh root instance. Fails with [`EntityError::Copy`] when the
/// tree exceeds the given limits.
pub fn copy_for_read(source: &Entity, limits: &TreeLimits) -> KhepriResult<(Entity, IdentityMap)> {
    if let Some(breach) = find_limit_breach(source, limits) {
        return Err(copy_error(breach));
    }

    let mut copy = source.clone();
    let mut map = IdentityMap::new();

    visit_entity_mut(&mut copy, &mut |node| {
        let original = OriginalIdentity {
            live_id: node.live_id(),
            ecs_id: node.ecs_id(),
        };
        node.refresh_live_id();
        map.insert(node.live_id(), original);
    });

    if source.is_root() {
        let root_ecs = copy.ecs_id();
        let root_live = copy.live_id();
        visit_entity_mut(&mut copy, &mut |node| node.set_root(root_ecs, root_live));
    }

    Ok((copy, map))
}

/// Versioning copy: deep-copy a tree forking every node's `ecs_id`
/// (lineages preserved, predecessors recorded) with fresh `live_id`s.
/// Fails with [`EntityError::Copy`] when the tree exceeds the given
/// limits.
pub fn fork_all(source: &Entity, limits: &TreeLimits) -> KhepriResult<Entity> {
    if let Some(breach) = find_limit_breach(source, limits) {
        return Err(copy_error(breach));
    }

    let mut copy = source.clone();
    visit_entity_mut(&mut copy, &mut |node| {
        node.fork_identity();
        node.refresh_live_id();
    });

    if source.is_root() {
        let root_ecs = copy.ecs_id();
        let root_live = copy.live_id();
        visit_entity_mut(&mut copy, &mut |node| node.set_root(root_ecs, root_live));
    }

    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TreeLimits {
        TreeLimits::default()
    }

    fn nested_tree() -> Entity {
        let grandchild = Entity::new("Leaf").with_field("v", 1i64);
        let child = Entity::new("Branch").with_field("leaf", grandchild);
        let mut root = Entity::new("Root");
        root.set_field("branch", child);
        root.set_field(
            "extras",
            Value::List(vec![Entity::new("Extra").with_field("n", 9i64).into()]),
        );
        root.mark_root();
        root
    }

    #[test]
    fn copy_preserves_ecs_ids_and_refreshes_live_ids() {
        let root = nested_tree();
        let (copy, map) = copy_for_read(&root, &limits()).unwrap();

        assert_eq!(copy.ecs_id(), root.ecs_id());
        assert_ne!(copy.live_id(), root.live_id());
        assert_eq!(map.len(), 4);

        let original = map.lookup(copy.live_id()).unwrap();
        assert_eq!(original.live_id, root.live_id());
        assert_eq!(original.ecs_id, root.ecs_id());
    }

    #[test]
    fn copy_repoints_root_live_id_everywhere() {
        let root = nested_tree();
        let (copy, _) = copy_for_read(&root, &limits()).unwrap();

        let root_live = copy.live_id();
        for node in collect_nodes(&copy) {
            assert_eq!(node.root_live_id(), Some(root_live));
            assert_eq!(node.root_ecs_id(), Some(copy.ecs_id()));
        }
    }

    #[test]
    fn identity_map_is_in_depth_first_order() {
        let root = nested_tree();
        let (copy, map) = copy_for_read(&root, &limits()).unwrap();

        let first = map.in_order().next().unwrap();
        assert_eq!(first.0, copy.live_id());
    }

    #[test]
    fn mutating_copy_leaves_original_untouched() {
        let root = nested_tree();
        let (mut copy, _) = copy_for_read(&root, &limits()).unwrap();

        copy.set_field("mutated", true);
        let branch = copy.fields_mut().get_mut("branch").unwrap();
        branch.as_entity_mut().unwrap().set_field("added", 5i64);

        assert!(root.field("mutated").is_none());
        assert!(root.get_entity("branch").unwrap().field("added").is_none());
    }

    #[test]
    fn fork_all_forks_every_node() {
        let root = nested_tree();
        let before: Vec<_> = collect_nodes(&root).iter().map(|e| e.ecs_id()).collect();
        let forked = fork_all(&root, &limits()).unwrap();
        let after: Vec<_> = collect_nodes(&forked).iter().map(|e| e.ecs_id()).collect();

        assert_eq!(before.len(), after.len());
        for (old, new) in before.iter().zip(&after) {
            assert_ne!(old, new);
        }
        for (node, old) in collect_nodes(&forked).iter().zip(&before) {
            assert_eq!(node.previous_ecs_id(), Some(*old));
        }
        assert_eq!(forked.lineage_id(), root.lineage_id());
        assert!(forked.is_root());
    }

    #[test]
    fn copy_rejects_trees_past_the_depth_limit() {
        let mut e = Entity::new("N").with_field("v", 0i64);
        for _ in 0..5 {
            e = Entity::new("N").with_field("child", e);
        }

        let tight = TreeLimits {
            max_depth: 3,
            max_nodes: 100,
        };
        let err = copy_for_read(&e, &tight).unwrap_err();
        assert!(err.to_string().contains("deep copy failed"));
        assert!(err.to_string().contains("depth"));
        assert!(fork_all(&e, &tight).is_err());
    }

    #[test]
    fn copy_rejects_trees_past_the_node_limit() {
        let mut root = Entity::new("Root");
        root.set_field(
            "items",
            Value::List(
                (0..10i64)
                    .map(|i| Entity::new("Item").with_field("n", i).into())
                    .collect(),
            ),
        );

        let tight = TreeLimits {
            max_depth: 64,
            max_nodes: 5,
        };
        let err = copy_for_read(&root, &tight).unwrap_err();
        assert!(err.to_string().contains("node count"));
    }

    #[test]
    fn container_nesting_counts_toward_the_depth_bound() {
        let mut deep = Value::Int(0);
        for _ in 0..10 {
            deep = Value::List(vec![deep]);
        }
        let mut e = Entity::new("N");
        e.set_field("deep", deep);

        let tight = TreeLimits {
            max_depth: 4,
            max_nodes: 100,
        };
        assert!(copy_for_read(&e, &tight).is_err());
        assert!(copy_for_read(&e, &limits()).is_ok());
    }
}
