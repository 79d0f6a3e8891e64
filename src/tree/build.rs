//! Tree builder: DFS over user-defined fields.
//!
//! Walks a root entity's fields (including entities embedded anywhere in
//! containers; an entity inside nested containers is labeled by the
//! container that directly holds it), producing the node set, edge set,
//! and ancestry map. The walk fails fast on identity back-edges, stale
//! root pointers, and configured depth/node limits.

use std::collections::HashSet;

use crate::entity::{EcsId, Entity, Value};
use crate::error::{KhepriResult, TreeError};

use super::{EdgeKind, EntityTree, TreeEdge};

/// Limits applied while building a tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeLimits {
    /// Maximum entity nesting depth (root counts as 1).
    pub max_depth: usize,
    /// Maximum number of entities in one tree.
    pub max_nodes: usize,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_nodes: 100_000,
        }
    }
}

/// Build the [`EntityTree`] rooted at `root`.
///
/// Fails with [`TreeError::CyclicReference`] when an `ecs_id` is reached
/// twice, [`TreeError::DetachedChild`] when a non-root node carries a
/// `root_ecs_id` other than `root`'s, and the corresponding limit errors
/// when `limits` are exceeded.
pub fn build_tree(root: &Entity, limits: &TreeLimits) -> KhepriResult<EntityTree> {
    let mut tree = EntityTree::new_empty(root);
    let mut seen = HashSet::new();
    let mut ancestors: Vec<EcsId> = Vec::new();
    walk(root, root.ecs_id(), &mut ancestors, &mut seen, &mut tree, limits)?;
    Ok(tree)
}

fn walk(
    node: &Entity,
    root_ecs_id: EcsId,
    ancestors: &mut Vec<EcsId>,
    seen: &mut HashSet<EcsId>,
    tree: &mut EntityTree,
    limits: &TreeLimits,
) -> KhepriResult<()> {
    let ecs = node.ecs_id();

    if !seen.insert(ecs) {
        return Err(TreeError::CyclicReference {
            ecs_id: ecs.to_string(),
        }
        .into());
    }
    if ecs != root_ecs_id {
        if let Some(found_root) = node.root_ecs_id() {
            if found_root != root_ecs_id {
                return Err(TreeError::DetachedChild {
                    ecs_id: ecs.to_string(),
                    found_root: found_root.to_string(),
                    expected_root: root_ecs_id.to_string(),
                }
                .into());
            }
        }
    }
    if ancestors.len() + 1 > limits.max_depth {
        return Err(TreeError::DepthExceeded {
            max_depth: limits.max_depth,
        }
        .into());
    }
    if tree.node_count() + 1 > limits.max_nodes {
        return Err(TreeError::NodeLimit {
            max_nodes: limits.max_nodes,
        }
        .into());
    }

    // Path to the root, node first.
    let mut path = Vec::with_capacity(ancestors.len() + 1);
    path.push(ecs);
    path.extend(ancestors.iter().rev().copied());
    tree.insert_node(node.clone(), path);

    let mut children = Vec::new();
    for (field, value) in node.fields() {
        collect_children(field, value, None, &mut children);
    }

    ancestors.push(ecs);
    for (edge, child) in children {
        walk(child, root_ecs_id, ancestors, seen, tree, limits)?;
        tree.insert_edge(ecs, child.ecs_id(), edge);
    }
    ancestors.pop();

    Ok(())
}

/// Collect the entities directly owned by one field value, labeled by the
/// container that holds each one.
fn collect_children<'a>(
    field: &str,
    value: &'a Value,
    position: Option<EdgeKind>,
    out: &mut Vec<(TreeEdge, &'a Entity)>,
) {
    match value {
        Value::Entity(e) => out.push((
            TreeEdge {
                field: field.to_string(),
                kind: position.unwrap_or(EdgeKind::Direct),
            },
            e,
        )),
        Value::List(vs) => {
            for (i, v) in vs.iter().enumerate() {
                collect_children(field, v, Some(EdgeKind::ListElem(i)), out);
            }
        }
        Value::Tuple(vs) => {
            for (i, v) in vs.iter().enumerate() {
                collect_children(field, v, Some(EdgeKind::TupleSlot(i)), out);
            }
        }
        Value::Set(vs) => {
            for (i, v) in vs.iter().enumerate() {
                collect_children(field, v, Some(EdgeKind::SetMember(i)), out);
            }
        }
        Value::Map(m) => {
            for (k, v) in m {
                collect_children(field, v, Some(EdgeKind::MapValue(k.clone())), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_single_node_tree() {
        let mut root = Entity::new("Root");
        root.set_field("v", 1i64);
        root.mark_root();

        let tree = build_tree(&root, &TreeLimits::default()).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root().ecs_id(), root.ecs_id());
    }

    #[test]
    fn finds_entities_inside_nested_containers() {
        let inner = Entity::new("Inner").with_field("v", 1i64);
        let inner_id = inner.ecs_id();
        let mut root = Entity::new("Root");
        root.set_field(
            "grid",
            Value::Map(
                [(
                    "row0".to_string(),
                    Value::List(vec![Value::Int(0), inner.into()]),
                )]
                .into(),
            ),
        );
        root.mark_root();

        let tree = build_tree(&root, &TreeLimits::default()).unwrap();
        assert!(tree.contains(inner_id));
        // Labeled by the container that directly holds the entity.
        assert_eq!(
            tree.incoming_edge(inner_id).unwrap().kind,
            EdgeKind::ListElem(1)
        );
    }

    #[test]
    fn duplicate_identity_is_a_cycle() {
        let shared = Entity::new("Shared").with_field("v", 1i64);
        let mut root = Entity::new("Root");
        root.set_field("a", shared.clone());
        root.set_field("b", shared);
        root.mark_root();

        let err = build_tree(&root, &TreeLimits::default()).unwrap_err();
        assert!(err.to_string().contains("cyclic reference"));
    }

    #[test]
    fn stale_root_pointer_is_detached_child() {
        let mut stray = Entity::new("Stray");
        stray.mark_root(); // now points at itself, not at the new root
        let mut root = Entity::new("Root");
        root.set_field("child", stray);
        root.mark_root();

        let err = build_tree(&root, &TreeLimits::default()).unwrap_err();
        assert!(err.to_string().contains("detached child"));
    }

    #[test]
    fn depth_limit_fails_fast() {
        let mut e = Entity::new("N").with_field("v", 0i64);
        for _ in 0..5 {
            e = Entity::new("N").with_field("child", e);
        }
        e.mark_root();

        let limits = TreeLimits {
            max_depth: 3,
            max_nodes: 100,
        };
        let err = build_tree(&e, &limits).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn node_limit_fails_fast() {
        let mut root = Entity::new("Root");
        root.set_field(
            "items",
            Value::List(
                (0..10i64)
                    .map(|i| Entity::new("Item").with_field("n", i).into())
                    .collect(),
            ),
        );
        root.mark_root();

        let limits = TreeLimits {
            max_depth: 64,
            max_nodes: 5,
        };
        let err = build_tree(&root, &limits).unwrap_err();
        assert!(err.to_string().contains("node count"));
    }
}
