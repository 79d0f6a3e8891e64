//! Semantic classification: what did the function do to each output?
//!
//! Every returned entity is matched against the input copies by ephemeral
//! id first, then by field equality (first match in depth-first order, and
//! only for the same version identity). An identity match with equal
//! fields is a pass-through, an identity match with changed fields is a
//! mutation, and no match is a creation.

use std::collections::BTreeMap;

use crate::entity::{EcsId, Entity, IdentityMap, LiveId};
use crate::error::{ExecError, KhepriResult};

/// Outcome of classifying one output entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The output *is* an input: same instance, untouched payload. No new
    /// version is produced.
    PassThrough { ecs_id: EcsId },
    /// The output is an input whose payload changed in place; versioning
    /// forks the modified path.
    Mutation { old_ecs_id: EcsId, new_ecs_id: EcsId },
    /// The output is a brand-new entity with its own lineage.
    Creation { ecs_id: EcsId },
}

impl Classification {
    /// The identity the output carries after processing.
    pub fn final_ecs_id(&self) -> EcsId {
        match self {
            Classification::PassThrough { ecs_id } => *ecs_id,
            Classification::Mutation { new_ecs_id, .. } => *new_ecs_id,
            Classification::Creation { ecs_id } => *ecs_id,
        }
    }

    /// Short label recorded in the execution record.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::PassThrough { .. } => "pass-through",
            Classification::Mutation { .. } => "mutation",
            Classification::Creation { .. } => "creation",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Pre-processing verdict, before versioning/registration assigns final
/// identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawVerdict {
    PassThrough { ecs_id: EcsId },
    Mutation,
    Creation,
}

/// What the classifier needs: the identity map from input preparation and
/// a pristine snapshot of every input copy node, keyed by copy `live_id`.
pub struct Classifier<'a> {
    identity_map: &'a IdentityMap,
    snapshots: &'a BTreeMap<LiveId, Entity>,
    function: &'a str,
}

impl<'a> Classifier<'a> {
    pub fn new(
        identity_map: &'a IdentityMap,
        snapshots: &'a BTreeMap<LiveId, Entity>,
        function: &'a str,
    ) -> Self {
        Self {
            identity_map,
            snapshots,
            function,
        }
    }

    /// Classify one returned entity against the input copies.
    pub fn classify(&self, output: &Entity) -> KhepriResult<RawVerdict> {
        if let Some(original) = self.identity_map.lookup(output.live_id()) {
            let snapshot = self.snapshots.get(&output.live_id()).ok_or_else(|| {
                ExecError::Classification {
                    function: self.function.to_string(),
                    message: format!(
                        "identity map knows live instance {} but no snapshot was taken",
                        output.live_id()
                    ),
                }
            })?;
            if output.user_fields_equal(snapshot) {
                return Ok(RawVerdict::PassThrough {
                    ecs_id: original.ecs_id,
                });
            }
            return Ok(RawVerdict::Mutation);
        }

        // Ephemeral id unknown: the body may have moved the copy into a
        // fresh allocation. Fall back to field equality against the
        // snapshots in depth-first order, but only for the same version
        // identity; a new entity that merely looks like an input is a
        // creation.
        for (live, _) in self.identity_map.in_order() {
            if let Some(snapshot) = self.snapshots.get(&live) {
                if snapshot.ecs_id() == output.ecs_id()
                    && output.user_fields_equal(snapshot)
                {
                    return Ok(RawVerdict::PassThrough {
                        ecs_id: snapshot.ecs_id(),
                    });
                }
            }
        }
        Ok(RawVerdict::Creation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::copy::{collect_nodes, copy_for_read};
    use crate::tree::TreeLimits;

    fn prepared(entity: &Entity) -> (Entity, IdentityMap, BTreeMap<LiveId, Entity>) {
        let (copy, map) = copy_for_read(entity, &TreeLimits::default()).unwrap();
        let snapshots = collect_nodes(&copy)
            .into_iter()
            .map(|n| (n.live_id(), n.clone()))
            .collect();
        (copy, map, snapshots)
    }

    #[test]
    fn untouched_copy_is_pass_through() {
        let mut e = Entity::new("Student").with_field("v", 3i64);
        e.mark_root();
        let (copy, map, snaps) = prepared(&e);
        let classifier = Classifier::new(&map, &snaps, "f");

        assert_eq!(
            classifier.classify(&copy).unwrap(),
            RawVerdict::PassThrough { ecs_id: e.ecs_id() }
        );
    }

    #[test]
    fn mutated_copy_is_mutation() {
        let mut e = Entity::new("Student").with_field("v", 3i64);
        e.mark_root();
        let (mut copy, map, snaps) = prepared(&e);
        copy.set_field("v", 4i64);
        let classifier = Classifier::new(&map, &snaps, "f");

        assert_eq!(classifier.classify(&copy).unwrap(), RawVerdict::Mutation);
    }

    #[test]
    fn fresh_entity_is_creation() {
        let mut e = Entity::new("Student").with_field("v", 3i64);
        e.mark_root();
        let (_copy, map, snaps) = prepared(&e);
        let classifier = Classifier::new(&map, &snaps, "f");

        let fresh = Entity::new("Report").with_field("v", 3i64);
        assert_eq!(classifier.classify(&fresh).unwrap(), RawVerdict::Creation);
    }

    #[test]
    fn lookalike_with_fresh_identity_is_still_creation() {
        let mut e = Entity::new("Student").with_field("v", 3i64);
        e.mark_root();
        let (_copy, map, snaps) = prepared(&e);
        let classifier = Classifier::new(&map, &snaps, "f");

        // Same kind and fields, but a brand-new identity.
        let lookalike = Entity::new("Student").with_field("v", 3i64);
        assert_eq!(
            classifier.classify(&lookalike).unwrap(),
            RawVerdict::Creation
        );
    }

    #[test]
    fn relocated_copy_matches_by_field_equality() {
        let mut e = Entity::new("Student").with_field("v", 3i64);
        e.mark_root();
        let (copy, map, snaps) = prepared(&e);
        let classifier = Classifier::new(&map, &snaps, "f");

        // Simulate a body that rebuilt the instance: same version, same
        // payload, fresh live id.
        let (relocated, _) = copy_for_read(&copy, &TreeLimits::default()).unwrap();
        assert_eq!(
            classifier.classify(&relocated).unwrap(),
            RawVerdict::PassThrough { ecs_id: e.ecs_id() }
        );
    }
}
