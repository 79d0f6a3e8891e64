//! Entity trees: the node/edge structure derived from a root entity.
//!
//! Uses `petgraph` for the graph structure with a side `HashMap` for O(1)
//! node lookups by `EcsId`, plus an ancestry map from every node to its
//! path to the root. Trees are built on demand by [`build::build_tree`]
//! and diffed by [`diff::diff_trees`].

pub mod build;
pub mod diff;

use std::collections::{BTreeMap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::entity::{EcsId, Entity, LineageId, LiveId};

pub use build::{TreeLimits, build_tree};
pub use diff::{ModificationSet, diff_trees};

/// How a child entity is owned by its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Plain entity-valued field.
    Direct,
    /// Element of a list-valued field.
    ListElem(usize),
    /// Slot of a tuple-valued field.
    TupleSlot(usize),
    /// Member of a set-valued field (insertion position).
    SetMember(usize),
    /// Value of a map-valued field.
    MapValue(String),
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Direct => write!(f, "direct"),
            EdgeKind::ListElem(i) => write!(f, "list[{i}]"),
            EdgeKind::TupleSlot(i) => write!(f, "tuple[{i}]"),
            EdgeKind::SetMember(i) => write!(f, "set[{i}]"),
            EdgeKind::MapValue(k) => write!(f, "map[{k}]"),
        }
    }
}

/// Label on a parent → child edge: the field name plus the ownership kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEdge {
    /// Name of the field on the parent that owns the child.
    pub field: String,
    /// Position of the child within that field's value.
    pub kind: EdgeKind,
}

impl std::fmt::Display for TreeEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.kind)
    }
}

/// The node/edge structure rooted at one entity, with ancestry paths.
///
/// A tree is a snapshot: node payloads are clones taken at build time, and
/// the registry hands out deep copies rather than references into it.
#[derive(Debug, Clone)]
pub struct EntityTree {
    root_ecs_id: EcsId,
    root_live_id: LiveId,
    lineage_id: LineageId,
    graph: DiGraph<EcsId, TreeEdge>,
    node_index: HashMap<EcsId, NodeIndex>,
    nodes: BTreeMap<EcsId, Entity>,
    ancestry: HashMap<EcsId, Vec<EcsId>>,
    built_at: u64,
}

impl EntityTree {
    pub(crate) fn new_empty(root: &Entity) -> Self {
        Self {
            root_ecs_id: root.ecs_id(),
            root_live_id: root.live_id(),
            lineage_id: root.lineage_id(),
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            nodes: BTreeMap::new(),
            ancestry: HashMap::new(),
            built_at: crate::entity::now_ms(),
        }
    }

    pub(crate) fn insert_node(&mut self, node: Entity, path_to_root: Vec<EcsId>) {
        let ecs = node.ecs_id();
        let idx = self.graph.add_node(ecs);
        self.node_index.insert(ecs, idx);
        self.ancestry.insert(ecs, path_to_root);
        self.nodes.insert(ecs, node);
    }

    pub(crate) fn insert_edge(&mut self, parent: EcsId, child: EcsId, edge: TreeEdge) {
        let (p, c) = (self.node_index[&parent], self.node_index[&child]);
        self.graph.add_edge(p, c, edge);
    }

    /// Identity of the root version this tree was built from.
    pub fn root_ecs_id(&self) -> EcsId {
        self.root_ecs_id
    }

    /// Instance identity of the root at build time.
    pub fn root_live_id(&self) -> LiveId {
        self.root_live_id
    }

    /// Lineage of the root.
    pub fn lineage_id(&self) -> LineageId {
        self.lineage_id
    }

    /// When this tree was built (ms since the UNIX epoch).
    pub fn built_at(&self) -> u64 {
        self.built_at
    }

    /// Number of entities in the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree contains a node with this version identity.
    pub fn contains(&self, ecs_id: EcsId) -> bool {
        self.nodes.contains_key(&ecs_id)
    }

    /// Borrow a node's snapshot.
    pub fn node(&self, ecs_id: EcsId) -> Option<&Entity> {
        self.nodes.get(&ecs_id)
    }

    /// Borrow the root node's snapshot.
    pub fn root(&self) -> &Entity {
        &self.nodes[&self.root_ecs_id]
    }

    /// Iterate all node snapshots in `EcsId` order.
    pub fn nodes(&self) -> impl Iterator<Item = &Entity> {
        self.nodes.values()
    }

    /// All node identities in `EcsId` order.
    pub fn node_ids(&self) -> impl Iterator<Item = EcsId> + '_ {
        self.nodes.keys().copied()
    }

    /// Find the node carrying a given lineage, if any.
    pub fn node_by_lineage(&self, lineage_id: LineageId) -> Option<&Entity> {
        self.nodes.values().find(|e| e.lineage_id() == lineage_id)
    }

    /// Path from a node to the root, inclusive on both ends.
    pub fn ancestry(&self, ecs_id: EcsId) -> Option<&[EcsId]> {
        self.ancestry.get(&ecs_id).map(Vec::as_slice)
    }

    /// The node's parent, if it is not the root.
    pub fn parent_of(&self, ecs_id: EcsId) -> Option<EcsId> {
        let idx = self.node_index.get(&ecs_id)?;
        self.graph
            .edges_directed(*idx, Direction::Incoming)
            .next()
            .map(|e| self.graph[e.source()])
    }

    /// The edge label under which a node hangs off its parent.
    pub fn incoming_edge(&self, ecs_id: EcsId) -> Option<&TreeEdge> {
        let idx = self.node_index.get(&ecs_id)?;
        self.graph
            .edges_directed(*idx, Direction::Incoming)
            .next()
            .map(|e| e.weight())
    }

    /// Outgoing edges of a node: (edge label, child identity).
    pub fn edges_from(&self, ecs_id: EcsId) -> Vec<(&TreeEdge, EcsId)> {
        match self.node_index.get(&ecs_id) {
            Some(idx) => self
                .graph
                .edges_directed(*idx, Direction::Outgoing)
                .map(|e| (e.weight(), self.graph[e.target()]))
                .collect(),
            None => Vec::new(),
        }
    }
}
