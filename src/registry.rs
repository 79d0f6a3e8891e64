//! Entity registry: the process-wide, scoped index of root-entity versions.
//!
//! Four `DashMap` indexes provide O(1) lookups: tree snapshots by root
//! version, version chains by lineage, lineages by entity kind, and the
//! ephemeral live-instance index. Versioning is serialized by a
//! registry-wide mutex; readers never take it and always receive deep
//! copies, so stored state cannot be mutated from outside.
//!
//! Registries are plain constructable values: a process may hold any
//! number of isolated instances.

use std::collections::BTreeSet;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::entity::copy::{
    LimitBreach, collect_nodes, copy_for_read, find_limit_breach, visit_entity_mut,
};
use crate::entity::{EcsId, Entity, LineageId, LiveId};
use crate::error::{EntityError, KhepriError, KhepriResult, RegistryError, TreeError};
use crate::tree::{EntityTree, TreeLimits, build_tree, diff_trees};

/// Process-wide index of root-entity versions, lineage chains, and kinds.
pub struct EntityRegistry {
    limits: TreeLimits,
    /// Root version → tree snapshot taken at registration. Historical
    /// versions are retained indefinitely.
    trees: DashMap<EcsId, EntityTree>,
    /// Lineage → chronological chain of root versions.
    lineages: DashMap<LineageId, Vec<EcsId>>,
    /// Entity kind → lineages whose trees ever contained a node of that kind.
    by_kind: DashMap<String, BTreeSet<LineageId>>,
    /// Ephemeral: instance identity → the version it carries.
    live_index: DashMap<LiveId, EcsId>,
    /// Any stored node version → root version of the newest snapshot
    /// containing it.
    node_to_root: DashMap<EcsId, EcsId>,
    /// Serializes versioning; never held by readers.
    version_lock: Mutex<()>,
}

impl EntityRegistry {
    /// Create an empty registry with the given tree limits.
    pub fn new(limits: TreeLimits) -> Self {
        Self {
            limits,
            trees: DashMap::new(),
            lineages: DashMap::new(),
            by_kind: DashMap::new(),
            live_index: DashMap::new(),
            node_to_root: DashMap::new(),
            version_lock: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Promote an entity to a root and insert its tree into the registry.
    ///
    /// Sets root pointers on the entity and every descendant that has none,
    /// builds the tree, and updates all indexes. Fails with
    /// [`RegistryError::AlreadyExists`] if the root version already
    /// exists; tree construction failures pass through.
    pub fn register_root(&self, entity: &mut Entity) -> KhepriResult<EcsId> {
        if self.trees.contains_key(&entity.ecs_id()) {
            return Err(RegistryError::AlreadyExists {
                ecs_id: entity.ecs_id().to_string(),
            }
            .into());
        }
        // Bounded pre-check before any recursive walk touches the tree.
        if let Some(breach) = find_limit_breach(entity, &self.limits) {
            return Err(tree_limit_error(breach));
        }

        claim_root_pointers(entity);
        let tree = build_tree(entity, &self.limits)?;
        let root_ecs = tree.root_ecs_id();
        self.index_tree(&tree);
        self.lineages
            .entry(tree.lineage_id())
            .or_default()
            .push(root_ecs);

        tracing::info!(
            root = %root_ecs,
            lineage = %tree.lineage_id(),
            nodes = tree.node_count(),
            "registered root entity"
        );
        Ok(root_ecs)
    }

    /// Fork a live root believed newer than its stored version.
    ///
    /// Root-only: a non-root entity fails with [`EntityError::NotARoot`]
    /// (detach it first, or version its root instead).
    ///
    /// Builds the new tree, diffs against the stored base, forks identities
    /// on the greedy modified path, updates the indexes, and returns the
    /// old → new identity mapping (empty when nothing changed). Concurrent
    /// versioning of the same lineage is serialized under the registry
    /// mutex: both writers succeed from their own base, and the chain
    /// records them in acquisition order. A caller that wants to rebase on
    /// the winner fetches the chain head and retries against it.
    pub fn version_root(&self, entity: &mut Entity) -> KhepriResult<Vec<(EcsId, EcsId)>> {
        if !entity.is_root() {
            return Err(not_a_root(entity));
        }
        // Bounded pre-check before any recursive walk touches the tree.
        if let Some(breach) = find_limit_breach(entity, &self.limits) {
            return Err(tree_limit_error(breach));
        }

        let _guard = self.version_lock.lock().expect("version lock poisoned");

        let base_ecs = entity.ecs_id();
        let base_tree = self
            .trees
            .get(&base_ecs)
            .map(|t| t.clone())
            .ok_or_else(|| RegistryError::NotFound {
                ecs_id: base_ecs.to_string(),
            })?;

        claim_root_pointers(entity);
        let candidate = build_tree(entity, &self.limits)?;
        let mods = diff_trees(&base_tree, &candidate)?;
        if mods.is_empty() {
            return Ok(Vec::new());
        }

        let mut fork_set = mods.fork_path(&candidate);
        fork_set.insert(base_ecs);

        let mut mapping = Vec::with_capacity(fork_set.len());
        visit_entity_mut(entity, &mut |node| {
            if fork_set.contains(&node.ecs_id()) {
                let old = node.ecs_id();
                node.fork_identity();
                mapping.push((old, node.ecs_id()));
            }
        });

        let lineage = entity.lineage_id();
        claim_root_pointers(entity);
        let new_tree = build_tree(entity, &self.limits)?;
        let new_root = new_tree.root_ecs_id();
        self.index_tree(&new_tree);
        self.lineages.entry(lineage).or_default().push(new_root);

        tracing::info!(
            lineage = %lineage,
            old_root = %base_ecs,
            new_root = %new_root,
            forked = mapping.len(),
            "versioned root entity"
        );
        Ok(mapping)
    }

    fn index_tree(&self, tree: &EntityTree) {
        let root_ecs = tree.root_ecs_id();
        for node in tree.nodes() {
            self.node_to_root.insert(node.ecs_id(), root_ecs);
            self.live_index.insert(node.live_id(), node.ecs_id());
            self.by_kind
                .entry(node.kind().to_string())
                .or_default()
                .insert(tree.lineage_id());
        }
        self.trees.insert(root_ecs, tree.clone());
    }

    // -----------------------------------------------------------------------
    // Fetching (always copies)
    // -----------------------------------------------------------------------

    /// Fetch a stored entity by version identity, as a fresh deep copy.
    ///
    /// The copy carries fresh `live_id`s throughout and is flagged
    /// `from_storage`. Mutating it cannot affect stored state.
    pub fn fetch_entity(&self, ecs_id: EcsId) -> KhepriResult<Entity> {
        let root = self
            .node_to_root
            .get(&ecs_id)
            .map(|r| *r.value())
            .ok_or_else(|| RegistryError::NotFound {
                ecs_id: ecs_id.to_string(),
            })?;
        let tree = self.trees.get(&root).ok_or_else(|| RegistryError::NotFound {
            ecs_id: root.to_string(),
        })?;
        let node = tree.node(ecs_id).ok_or_else(|| RegistryError::NotFound {
            ecs_id: ecs_id.to_string(),
        })?;
        self.copy_out(node)
    }

    /// Fetch the stored tree snapshot for a root version, as a deep copy.
    pub fn fetch_tree(&self, root_ecs_id: EcsId) -> KhepriResult<EntityTree> {
        self.trees
            .get(&root_ecs_id)
            .map(|t| t.clone())
            .ok_or_else(|| {
                RegistryError::NotFound {
                    ecs_id: root_ecs_id.to_string(),
                }
                .into()
            })
    }

    /// Resolve a (possibly historical) version identity to the current
    /// version of the same logical entity, as a fresh deep copy.
    ///
    /// The stored node's root lineage is followed to its newest tree; the
    /// node sharing the target's lineage is the current version. If the
    /// current tree no longer contains that lineage (the node was removed),
    /// the historical snapshot is returned — versions are retained
    /// indefinitely.
    pub fn current_version_of(&self, ecs_id: EcsId) -> KhepriResult<Entity> {
        let root = self
            .node_to_root
            .get(&ecs_id)
            .map(|r| *r.value())
            .ok_or_else(|| RegistryError::NotFound {
                ecs_id: ecs_id.to_string(),
            })?;
        // Clone out of the first tree before touching the map again:
        // holding a ref across a second lookup on the same shard can
        // deadlock against a writer.
        let (node, root_lineage) = {
            let tree = self.trees.get(&root).ok_or_else(|| RegistryError::NotFound {
                ecs_id: root.to_string(),
            })?;
            let node = tree.node(ecs_id).ok_or_else(|| RegistryError::NotFound {
                ecs_id: ecs_id.to_string(),
            })?;
            (node.clone(), tree.lineage_id())
        };

        let target_lineage = node.lineage_id();
        let head = self
            .lineages
            .get(&root_lineage)
            .and_then(|chain| chain.last().copied());

        if let Some(head) = head {
            let current = self
                .trees
                .get(&head)
                .and_then(|tree| tree.node_by_lineage(target_lineage).cloned());
            if let Some(current) = current {
                return self.copy_out(&current);
            }
        }
        self.copy_out(&node)
    }

    /// The newest root version of a lineage, as a fresh deep copy.
    pub fn latest_root(&self, lineage_id: LineageId) -> KhepriResult<Entity> {
        let head = self
            .lineages
            .get(&lineage_id)
            .and_then(|chain| chain.last().copied())
            .ok_or_else(|| RegistryError::LineageNotFound {
                lineage_id: lineage_id.to_string(),
            })?;
        self.fetch_entity(head)
    }

    fn copy_out(&self, node: &Entity) -> KhepriResult<Entity> {
        let (mut copy, _) = copy_for_read(node, &self.limits)?;
        visit_entity_mut(&mut copy, &mut |n| n.set_from_storage(true));
        for n in collect_nodes(&copy) {
            self.live_index.insert(n.live_id(), n.ecs_id());
        }
        Ok(copy)
    }

    // -----------------------------------------------------------------------
    // Detach / attach
    // -----------------------------------------------------------------------

    /// Remove an attached entity from its current tree and promote it to
    /// its own root. The old tree is versioned without it.
    pub fn detach(&self, entity: &mut Entity) -> KhepriResult<()> {
        if entity.is_root() {
            return Ok(());
        }
        let Some(root_ecs) = entity.root_ecs_id() else {
            return Err(EntityError::Unattached {
                ecs_id: entity.ecs_id().to_string(),
            }
            .into());
        };

        let mut root = self.current_version_of(root_ecs)?;
        let removed = remove_descendant(&mut root, entity.lineage_id());
        if removed {
            self.version_root(&mut root)?;
        }

        entity.clear_root();
        entity.mark_root();
        self.register_root(entity)?;
        Ok(())
    }

    /// Reparent an entity under a new root, placing it in `field` on that
    /// root. The entity's current tree (if any) is versioned without it,
    /// the target tree is versioned with it, and the entity joins the
    /// target root's lineage chain (its own `lineage_id` stays stable).
    ///
    /// The target must resolve to a root entity; attaching under a nested
    /// node fails with [`EntityError::NotARoot`].
    pub fn attach(
        &self,
        entity: &mut Entity,
        new_root_ecs: EcsId,
        field: &str,
    ) -> KhepriResult<()> {
        if entity.is_attached() {
            self.detach(entity)?;
        }

        let mut root = self.current_version_of(new_root_ecs)?;
        if !root.is_root() {
            return Err(not_a_root(&root));
        }
        entity.clear_root();
        root.set_field(field, entity.clone());
        self.version_root(&mut root)?;

        entity.set_root(root.ecs_id(), root.live_id());
        // Versioning may have forked the attached node itself.
        let stored = root.get_entity(field)?;
        if stored.lineage_id() == entity.lineage_id() && stored.ecs_id() != entity.ecs_id() {
            *entity = stored.clone();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether a root version is registered.
    pub fn contains_root(&self, root_ecs_id: EcsId) -> bool {
        self.trees.contains_key(&root_ecs_id)
    }

    /// The chronological chain of root versions for a lineage.
    pub fn lineage_history(&self, lineage_id: LineageId) -> Vec<EcsId> {
        self.lineages
            .get(&lineage_id)
            .map(|chain| chain.clone())
            .unwrap_or_default()
    }

    /// Lineages whose trees ever contained a node of the given kind.
    pub fn lineages_of_kind(&self, kind: &str) -> Vec<LineageId> {
        self.by_kind
            .get(kind)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The version currently associated with a live instance, if any.
    pub fn resolve_live(&self, live_id: LiveId) -> Option<EcsId> {
        self.live_index.get(&live_id).map(|e| *e.value())
    }

    /// Number of stored tree snapshots (every root version counts).
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Number of distinct lineages.
    pub fn lineage_count(&self) -> usize {
        self.lineages.len()
    }

    /// Number of distinct entity kinds seen.
    pub fn kind_count(&self) -> usize {
        self.by_kind.len()
    }

    /// Tree limits this registry builds with.
    pub fn limits(&self) -> &TreeLimits {
        &self.limits
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new(TreeLimits::default())
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("trees", &self.trees.len())
            .field("lineages", &self.lineages.len())
            .field("kinds", &self.by_kind.len())
            .finish()
    }
}

fn tree_limit_error(breach: LimitBreach) -> KhepriError {
    match breach {
        LimitBreach::Depth(max_depth) => TreeError::DepthExceeded { max_depth }.into(),
        LimitBreach::Nodes(max_nodes) => TreeError::NodeLimit { max_nodes }.into(),
    }
}

fn not_a_root(entity: &Entity) -> KhepriError {
    EntityError::NotARoot {
        ecs_id: entity.ecs_id().to_string(),
        root_ecs_id: entity
            .root_ecs_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".into()),
    }
    .into()
}

/// Mark the entity as root and claim every descendant. Pointers left over
/// from a pre-fork version of the same tree are reclaimed; genuinely
/// foreign trees are rejected later when their own registration sees the
/// node again.
fn claim_root_pointers(entity: &mut Entity) {
    entity.mark_root();
    let root_ecs = entity.ecs_id();
    let root_live = entity.live_id();
    visit_entity_mut(entity, &mut |node| {
        if node.ecs_id() != root_ecs {
            node.set_root(root_ecs, root_live);
        }
    });
}

/// Remove the first descendant carrying `lineage` from the entity's
/// fields. Returns whether a node was removed.
fn remove_descendant(root: &mut Entity, lineage: LineageId) -> bool {
    use crate::entity::Value;

    fn prune_value(value: &mut Value, lineage: LineageId) -> (bool, bool) {
        // (drop this value, a removal happened somewhere below)
        match value {
            Value::Entity(e) => {
                if e.lineage_id() == lineage {
                    return (true, true);
                }
                (false, prune_entity(e, lineage))
            }
            Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
                let mut removed = false;
                let mut keep = Vec::with_capacity(vs.len());
                for mut v in std::mem::take(vs) {
                    if removed {
                        keep.push(v);
                        continue;
                    }
                    let (drop_it, hit) = prune_value(&mut v, lineage);
                    removed |= hit;
                    if !drop_it {
                        keep.push(v);
                    }
                }
                *vs = keep;
                (false, removed)
            }
            Value::Map(m) => {
                let mut removed = false;
                let mut drop_key = None;
                for (k, v) in m.iter_mut() {
                    let (drop_it, hit) = prune_value(v, lineage);
                    if hit {
                        removed = true;
                        if drop_it {
                            drop_key = Some(k.clone());
                        }
                        break;
                    }
                }
                if let Some(k) = drop_key {
                    m.remove(&k);
                }
                (false, removed)
            }
            _ => (false, false),
        }
    }

    fn prune_entity(e: &mut Entity, lineage: LineageId) -> bool {
        let mut drop_field = None;
        let mut removed = false;
        for (name, value) in e.fields_mut().iter_mut() {
            let (drop_it, hit) = prune_value(value, lineage);
            if hit {
                removed = true;
                if drop_it {
                    drop_field = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = drop_field {
            e.remove_field(&name);
        }
        removed
    }

    prune_entity(root, lineage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EntityRegistry {
        EntityRegistry::default()
    }

    fn promoted(reg: &EntityRegistry, mut entity: Entity) -> Entity {
        reg.register_root(&mut entity).unwrap();
        entity
    }

    #[test]
    fn register_and_fetch_round_trip() {
        let reg = registry();
        let e = promoted(&reg, Entity::new("Student").with_field("v", 3i64));

        let fetched = reg.fetch_entity(e.ecs_id()).unwrap();
        assert_eq!(fetched.ecs_id(), e.ecs_id());
        assert_ne!(fetched.live_id(), e.live_id());
        assert!(fetched.from_storage());
        assert_eq!(fetched.get_int("v").unwrap(), 3);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = registry();
        let mut e = Entity::new("Student");
        reg.register_root(&mut e).unwrap();
        let err = reg.register_root(&mut e).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn fetch_unknown_id_fails() {
        let reg = registry();
        assert!(reg.fetch_entity(EcsId::fresh()).is_err());
    }

    #[test]
    fn versioning_forks_root_and_extends_chain() {
        let reg = registry();
        let e = promoted(&reg, Entity::new("Student").with_field("v", 3i64));
        let lineage = e.lineage_id();

        let mut working = reg.fetch_entity(e.ecs_id()).unwrap();
        working.set_field("v", 4i64);
        let mapping = reg.version_root(&mut working).unwrap();

        assert_eq!(mapping.len(), 1);
        assert_ne!(working.ecs_id(), e.ecs_id());
        assert_eq!(working.previous_ecs_id(), Some(e.ecs_id()));
        assert_eq!(working.lineage_id(), lineage);
        assert_eq!(
            reg.lineage_history(lineage),
            vec![e.ecs_id(), working.ecs_id()]
        );
    }

    #[test]
    fn versioning_without_changes_is_a_no_op() {
        let reg = registry();
        let e = promoted(&reg, Entity::new("Student").with_field("v", 3i64));

        let mut working = reg.fetch_entity(e.ecs_id()).unwrap();
        let mapping = reg.version_root(&mut working).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(working.ecs_id(), e.ecs_id());
        assert_eq!(reg.lineage_history(e.lineage_id()).len(), 1);
    }

    #[test]
    fn greedy_fork_leaves_untouched_branch_alone() {
        let reg = registry();
        let mut root = Entity::new("Root");
        root.set_field("hot", Entity::new("Child").with_field("v", 1i64));
        root.set_field("cold", Entity::new("Child").with_field("v", 2i64));
        let root = promoted(&reg, root);
        let cold_id = root.get_entity("cold").unwrap().ecs_id();
        let hot_id = root.get_entity("hot").unwrap().ecs_id();

        let mut working = reg.fetch_entity(root.ecs_id()).unwrap();
        working
            .fields_mut()
            .get_mut("hot")
            .unwrap()
            .as_entity_mut()
            .unwrap()
            .set_field("v", 100i64);
        let mapping = reg.version_root(&mut working).unwrap();

        let forked: Vec<EcsId> = mapping.iter().map(|(old, _)| *old).collect();
        assert!(forked.contains(&hot_id));
        assert!(forked.contains(&root.ecs_id()));
        assert!(!forked.contains(&cold_id));
        assert_eq!(working.get_entity("cold").unwrap().ecs_id(), cold_id);
    }

    #[test]
    fn stored_snapshot_immune_to_caller_mutation() {
        let reg = registry();
        let e = promoted(&reg, Entity::new("Student").with_field("v", 3i64));

        let mut fetched = reg.fetch_entity(e.ecs_id()).unwrap();
        fetched.set_field("v", 99i64);

        let again = reg.fetch_entity(e.ecs_id()).unwrap();
        assert_eq!(again.get_int("v").unwrap(), 3);
    }

    #[test]
    fn current_version_follows_the_chain() {
        let reg = registry();
        let e = promoted(&reg, Entity::new("Student").with_field("v", 3i64));

        let mut working = reg.fetch_entity(e.ecs_id()).unwrap();
        working.set_field("v", 4i64);
        reg.version_root(&mut working).unwrap();

        // Resolving the historical id lands on the new version.
        let current = reg.current_version_of(e.ecs_id()).unwrap();
        assert_eq!(current.ecs_id(), working.ecs_id());
        assert_eq!(current.get_int("v").unwrap(), 4);
    }

    #[test]
    fn nested_node_is_fetchable_by_its_own_id() {
        let reg = registry();
        let child = Entity::new("Child").with_field("v", 7i64);
        let child_id = child.ecs_id();
        let mut root = Entity::new("Root");
        root.set_field("child", child);
        promoted(&reg, root);

        let fetched = reg.fetch_entity(child_id).unwrap();
        assert_eq!(fetched.ecs_id(), child_id);
        assert_eq!(fetched.get_int("v").unwrap(), 7);
    }

    #[test]
    fn kind_index_tracks_lineages() {
        let reg = registry();
        let mut root = Entity::new("Root");
        root.set_field("child", Entity::new("Child"));
        let root = promoted(&reg, root);

        assert_eq!(reg.lineages_of_kind("Root"), vec![root.lineage_id()]);
        assert_eq!(reg.lineages_of_kind("Child"), vec![root.lineage_id()]);
        assert!(reg.lineages_of_kind("Absent").is_empty());
    }

    #[test]
    fn detach_promotes_child_and_versions_old_tree() {
        let reg = registry();
        let mut root = Entity::new("Root");
        root.set_field("child", Entity::new("Child").with_field("v", 1i64));
        let root = promoted(&reg, root);

        let mut child = reg
            .fetch_entity(root.get_entity("child").unwrap().ecs_id())
            .unwrap();
        reg.detach(&mut child).unwrap();

        assert!(child.is_root());
        assert!(reg.contains_root(child.ecs_id()));
        // The old tree was versioned without the child.
        let new_root = reg.latest_root(root.lineage_id()).unwrap();
        assert_ne!(new_root.ecs_id(), root.ecs_id());
        assert!(new_root.field("child").is_none());
    }

    #[test]
    fn attach_reparents_under_new_root() {
        let reg = registry();
        let target = promoted(&reg, Entity::new("Root").with_field("label", "t"));
        let mut orphan = Entity::new("Child").with_field("v", 5i64);
        reg.register_root(&mut orphan).unwrap();

        reg.attach(&mut orphan, target.ecs_id(), "adopted").unwrap();

        assert_eq!(orphan.root_ecs_id(), reg.lineage_history(target.lineage_id()).last().copied());
        let new_root = reg.latest_root(target.lineage_id()).unwrap();
        assert_eq!(
            new_root.get_entity("adopted").unwrap().get_int("v").unwrap(),
            5
        );
    }

    #[test]
    fn versioning_a_non_root_is_rejected() {
        let reg = registry();
        let mut root = Entity::new("Root");
        root.set_field("child", Entity::new("Child").with_field("v", 1i64));
        let root = promoted(&reg, root);

        let mut child = reg
            .fetch_entity(root.get_entity("child").unwrap().ecs_id())
            .unwrap();
        let err = reg.version_root(&mut child).unwrap_err();
        assert!(err.to_string().contains("not a root"));
    }

    #[test]
    fn attach_requires_a_root_target() {
        let reg = registry();
        let mut root = Entity::new("Root");
        root.set_field("child", Entity::new("Child").with_field("v", 1i64));
        let root = promoted(&reg, root);
        let child_id = root.get_entity("child").unwrap().ecs_id();

        let mut orphan = Entity::new("Doc").with_field("v", 2i64);
        reg.register_root(&mut orphan).unwrap();

        let err = reg.attach(&mut orphan, child_id, "doc").unwrap_err();
        assert!(err.to_string().contains("not a root"));
    }

    #[test]
    fn register_rejects_trees_past_the_limits() {
        let reg = EntityRegistry::new(TreeLimits {
            max_depth: 2,
            max_nodes: 10,
        });
        let mut deep = Entity::new("N").with_field("v", 0i64);
        for _ in 0..4 {
            deep = Entity::new("N").with_field("child", deep);
        }

        let err = reg.register_root(&mut deep).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn concurrent_versioning_serializes_on_the_same_lineage() {
        use std::sync::Arc;

        let reg = Arc::new(registry());
        let e = promoted(&reg, Entity::new("Student").with_field("v", 0i64));
        let base = e.ecs_id();

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let mut working = reg.fetch_entity(base).unwrap();
                    working.set_field("v", (i + 1) as i64);
                    reg.version_root(&mut working).unwrap();
                    working.ecs_id()
                })
            })
            .collect();
        let new_ids: Vec<EcsId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let chain = reg.lineage_history(e.lineage_id());
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], base);
        assert!(new_ids.contains(&chain[1]));
        assert!(new_ids.contains(&chain[2]));
    }
}
