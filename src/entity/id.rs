//! Identity newtypes for the entity model.
//!
//! Every entity carries three identities with different lifetimes:
//! [`EcsId`] names one immutable *version*, [`LiveId`] names one in-memory
//! *instance* of a version, and [`LineageId`] names the logical entity
//! across all of its versions. Keeping them as distinct newtypes makes it
//! a type error to hand a version id to an API expecting an instance id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one specific entity version.
///
/// Fresh on creation and on every forking change. Renders as the canonical
/// hyphenated lowercase UUID so it can be spliced directly into an address
/// string (`@{ecs_id}.field`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EcsId(Uuid);

impl EcsId {
    /// Allocate a fresh version identity.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    /// The underlying UUID.
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for EcsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Ephemeral identity of one in-memory instance.
///
/// Regenerated on every copy; two copies of the same version share an
/// `EcsId` but never a `LiveId`. Used to tell copies apart during semantic
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LiveId(Uuid);

impl LiveId {
    /// Allocate a fresh instance identity.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for LiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Stable identity of the logical entity across all versions.
///
/// Shared by every version in the same ancestry chain; never changes on
/// fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LineageId(Uuid);

impl LineageId {
    /// Allocate a fresh lineage identity.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for LineageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
