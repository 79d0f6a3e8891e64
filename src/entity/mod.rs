//! Entity record model: identity, user-defined fields, provenance.
//!
//! An [`Entity`] is a structured record with three identities ([`EcsId`]
//! per version, [`LiveId`] per in-memory instance, [`LineageId`] per
//! logical entity), root pointers tying it into a tree, and a map of
//! user-defined [`Value`] fields with a parallel [`Provenance`] map.
//!
//! All identity mutations go through methods on this type (or crate-internal
//! helpers used by the registry); intrinsic fields are never written
//! directly from outside this module.

pub mod copy;
pub mod id;
pub mod value;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use copy::{IdentityMap, OriginalIdentity};
pub use id::{EcsId, LineageId, LiveId};
pub use value::{Provenance, Value};

use crate::error::{EntityError, KhepriResult};

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A structured record with identity, versioning, and provenance intrinsics
/// plus user-defined fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    ecs_id: EcsId,
    live_id: LiveId,
    lineage_id: LineageId,
    root_ecs_id: Option<EcsId>,
    root_live_id: Option<LiveId>,
    created_at: u64,
    forked_at: Option<u64>,
    previous_ecs_id: Option<EcsId>,
    from_storage: bool,
    kind: String,
    fields: BTreeMap<String, Value>,
    attribute_source: BTreeMap<String, Provenance>,
    sibling_output_ids: Vec<EcsId>,
}

impl Entity {
    /// Create a new unattached entity of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            ecs_id: EcsId::fresh(),
            live_id: LiveId::fresh(),
            lineage_id: LineageId::fresh(),
            root_ecs_id: None,
            root_live_id: None,
            created_at: now_ms(),
            forked_at: None,
            previous_ecs_id: None,
            from_storage: false,
            kind: kind.into(),
            fields: BTreeMap::new(),
            attribute_source: BTreeMap::new(),
            sibling_output_ids: Vec::new(),
        }
    }

    /// Builder-style field initialization.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    // -----------------------------------------------------------------------
    // Intrinsic accessors
    // -----------------------------------------------------------------------

    pub fn ecs_id(&self) -> EcsId {
        self.ecs_id
    }

    pub fn live_id(&self) -> LiveId {
        self.live_id
    }

    pub fn lineage_id(&self) -> LineageId {
        self.lineage_id
    }

    pub fn root_ecs_id(&self) -> Option<EcsId> {
        self.root_ecs_id
    }

    pub fn root_live_id(&self) -> Option<LiveId> {
        self.root_live_id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn forked_at(&self) -> Option<u64> {
        self.forked_at
    }

    pub fn previous_ecs_id(&self) -> Option<EcsId> {
        self.previous_ecs_id
    }

    pub fn from_storage(&self) -> bool {
        self.from_storage
    }

    /// Consumer-defined entity type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Cross-links to the other positional outputs of the same call.
    pub fn sibling_output_ids(&self) -> &[EcsId] {
        &self.sibling_output_ids
    }

    /// A root entity is its own root; an attached entity points at another
    /// root; an orphan points at none.
    pub fn is_root(&self) -> bool {
        self.root_ecs_id == Some(self.ecs_id)
    }

    pub fn is_orphan(&self) -> bool {
        self.root_ecs_id.is_none()
    }

    pub fn is_attached(&self) -> bool {
        !self.is_orphan() && !self.is_root()
    }

    // -----------------------------------------------------------------------
    // User fields
    // -----------------------------------------------------------------------

    /// Borrow a user-defined field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All user-defined field names, in sorted order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// Iterate user-defined fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Field names with the kind of value each currently holds.
    pub fn field_kinds(&self) -> Vec<(&str, &'static str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.kind_name()))
            .collect()
    }

    /// Write a user-defined field. The field's provenance resets to the
    /// all-local mirror of the new value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        self.attribute_source
            .insert(name.clone(), Provenance::local_for(&value));
        self.fields.insert(name, value);
    }

    /// Remove a user-defined field (and its provenance entry).
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.attribute_source.remove(name);
        self.fields.remove(name)
    }

    /// Provenance descriptor for a field.
    pub fn attribute_source(&self, name: &str) -> Option<&Provenance> {
        self.attribute_source.get(name)
    }

    /// Copy a field value from another entity, recording the borrow in
    /// this entity's provenance map.
    pub fn borrow_field_from(
        &mut self,
        source: &Entity,
        source_field: &str,
        target_field: impl Into<String>,
    ) -> KhepriResult<()> {
        let value = source.field(source_field).ok_or_else(|| EntityError::FieldNotFound {
            kind: source.kind.clone(),
            field: source_field.to_string(),
        })?;
        let target_field = target_field.into();
        let prov = match value {
            Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => Provenance::List(
                vs.iter().map(|_| Provenance::Borrowed(source.ecs_id)).collect(),
            ),
            Value::Map(m) => Provenance::Map(
                m.keys()
                    .map(|k| (k.clone(), Provenance::Borrowed(source.ecs_id)))
                    .collect(),
            ),
            _ => Provenance::Borrowed(source.ecs_id),
        };
        self.fields.insert(target_field.clone(), value.clone());
        self.attribute_source.insert(target_field, prov);
        Ok(())
    }

    /// Deep equality over user-defined fields only (intrinsics ignored).
    pub fn user_fields_equal(&self, other: &Entity) -> bool {
        self.fields == other.fields
    }

    // -----------------------------------------------------------------------
    // Typed getters
    // -----------------------------------------------------------------------

    fn typed_field(&self, name: &str) -> KhepriResult<&Value> {
        self.field(name)
            .ok_or_else(|| {
                EntityError::FieldNotFound {
                    kind: self.kind.clone(),
                    field: name.to_string(),
                }
                .into()
            })
    }

    /// Read an integer field.
    pub fn get_int(&self, name: &str) -> KhepriResult<i64> {
        match self.typed_field(name)? {
            Value::Int(i) => Ok(*i),
            other => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "int",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    /// Read a boolean field.
    pub fn get_bool(&self, name: &str) -> KhepriResult<bool> {
        match self.typed_field(name)? {
            Value::Bool(b) => Ok(*b),
            other => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "bool",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    /// Read a float field.
    pub fn get_float(&self, name: &str) -> KhepriResult<f64> {
        match self.typed_field(name)? {
            Value::Float(f) => Ok(*f),
            other => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "float",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    /// Read a string field.
    pub fn get_str(&self, name: &str) -> KhepriResult<&str> {
        match self.typed_field(name)? {
            Value::Str(s) => Ok(s),
            other => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "str",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    /// Read a nested entity field.
    pub fn get_entity(&self, name: &str) -> KhepriResult<&Entity> {
        match self.typed_field(name)? {
            Value::Entity(e) => Ok(e),
            other => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "entity",
                actual: other.kind_name(),
            }
            .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Identity operations (crate-internal)
    // -----------------------------------------------------------------------

    /// Fork the version identity: fresh `ecs_id`, predecessor recorded,
    /// lineage untouched.
    pub(crate) fn fork_identity(&mut self) {
        self.previous_ecs_id = Some(self.ecs_id);
        self.ecs_id = EcsId::fresh();
        self.forked_at = Some(now_ms());
    }

    /// Regenerate the instance identity (every copy gets its own).
    pub(crate) fn refresh_live_id(&mut self) {
        self.live_id = LiveId::fresh();
    }

    /// Point this entity at itself as root.
    pub(crate) fn mark_root(&mut self) {
        self.root_ecs_id = Some(self.ecs_id);
        self.root_live_id = Some(self.live_id);
    }

    /// Point this entity at another root.
    pub(crate) fn set_root(&mut self, root_ecs_id: EcsId, root_live_id: LiveId) {
        self.root_ecs_id = Some(root_ecs_id);
        self.root_live_id = Some(root_live_id);
    }

    /// Detach from any tree (orphan).
    pub(crate) fn clear_root(&mut self) {
        self.root_ecs_id = None;
        self.root_live_id = None;
    }

    pub(crate) fn set_from_storage(&mut self, from_storage: bool) {
        self.from_storage = from_storage;
    }

    pub(crate) fn set_sibling_output_ids(&mut self, siblings: Vec<EcsId>) {
        self.sibling_output_ids = siblings;
    }

    /// Overwrite one field's provenance entry (execution-engine stitching).
    pub(crate) fn set_attribute_source_entry(&mut self, field: &str, prov: Provenance) {
        if self.fields.contains_key(field) {
            self.attribute_source.insert(field.to_string(), prov);
        }
    }

    /// Mutable access to user fields for crate-internal visitors.
    pub(crate) fn fields_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.fields
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{} ({} field{})",
            self.kind,
            self.ecs_id,
            self.fields.len(),
            if self.fields.len() == 1 { "" } else { "s" }
        )
    }
}
