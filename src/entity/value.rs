//! Tagged-union value model for user-defined entity fields.
//!
//! [`Value`] is the closed set of shapes a field can hold: scalars,
//! ordered and keyed containers, and nested entities. [`Provenance`]
//! mirrors a value's structure to record, per field and per element,
//! which entity the data was borrowed from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::id::EcsId;
use super::Entity;

/// A user-defined field value.
///
/// Containers may nest arbitrarily, and entities may appear at any depth.
/// `Set` keeps deduplicated, insertion-ordered elements (float-bearing
/// values cannot be `Ord`, so a sorted set is not an option here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Entity(Box<Entity>),
}

impl Value {
    /// Human-readable kind label for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Entity(_) => "entity",
        }
    }

    /// Whether this value is a scalar (no nested structure).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_)
        )
    }

    /// Whether this value is a nested entity.
    pub fn is_entity(&self) -> bool {
        matches!(self, Self::Entity(_))
    }

    /// Borrow the nested entity, if this value holds one.
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Mutably borrow the nested entity, if this value holds one.
    pub fn as_entity_mut(&mut self) -> Option<&mut Entity> {
        match self {
            Self::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Build a set value, deduplicating by content equality and keeping
    /// first-insertion order.
    pub fn set_from(elems: Vec<Value>) -> Self {
        let mut out: Vec<Value> = Vec::with_capacity(elems.len());
        for v in elems {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        Self::Set(out)
    }

    /// Whether any entity appears in this value, at any depth.
    pub fn contains_entities(&self) -> bool {
        match self {
            Self::Entity(_) => true,
            Self::List(vs) | Self::Tuple(vs) | Self::Set(vs) => {
                vs.iter().any(Value::contains_entities)
            }
            Self::Map(m) => m.values().any(Value::contains_entities),
            _ => false,
        }
    }

    /// Deep equality where nested entities compare by `ecs_id` only.
    ///
    /// This is the comparison the diff uses: a structural change inside a
    /// child entity is the child's own modification, not the parent's.
    pub fn eq_by_entity_id(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Entity(a), Self::Entity(b)) => a.ecs_id() == b.ecs_id(),
            (Self::List(a), Self::List(b))
            | (Self::Tuple(a), Self::Tuple(b))
            | (Self::Set(a), Self::Set(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_by_entity_id(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, va), (kb, vb))| {
                        ka == kb && va.eq_by_entity_id(vb)
                    })
            }
            _ => self == other,
        }
    }

    /// Convert to a `serde_json::Value` at the consumer boundary.
    ///
    /// Nested entities render as their address string (`@<ecs_id>`); the
    /// payload itself stays inside the runtime.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(vs) | Self::Tuple(vs) | Self::Set(vs) => {
                serde_json::Value::Array(vs.iter().map(Value::to_json).collect())
            }
            Self::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Entity(e) => serde_json::Value::String(format!("@{}", e.ecs_id())),
        }
    }

    /// Convert from a `serde_json::Value`. Arrays become lists, objects
    /// become maps; entities are never produced.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(vs) => Self::List(vs.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(m) => Self::Map(
                m.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Self::Entity(Box::new(v))
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Per-field provenance descriptor.
///
/// `Local` marks a value written by the owning entity itself; `Borrowed`
/// names the source entity a scalar was taken from; `List`/`Map` mirror a
/// container field's structure with per-element provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Provenance {
    Local,
    Borrowed(EcsId),
    List(Vec<Provenance>),
    Map(BTreeMap<String, Provenance>),
}

impl Provenance {
    /// The all-local mirror for a freshly written value: containers get a
    /// parallel structure of `Local` leaves, everything else plain `Local`.
    pub fn local_for(value: &Value) -> Self {
        match value {
            Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
                Self::List(vs.iter().map(Provenance::local_for).collect())
            }
            Value::Map(m) => Self::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), Provenance::local_for(v)))
                    .collect(),
            ),
            _ => Self::Local,
        }
    }

    /// The source entity id, if this is a scalar borrow.
    pub fn borrowed_from(&self) -> Option<EcsId> {
        match self {
            Self::Borrowed(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether the descriptor's structure mirrors the value's structure.
    pub fn mirrors(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::List(ps), Value::List(vs) | Value::Tuple(vs) | Value::Set(vs)) => {
                ps.len() == vs.len() && ps.iter().zip(vs).all(|(p, v)| p.mirrors(v))
            }
            (Self::Map(pm), Value::Map(vm)) => {
                pm.len() == vm.len()
                    && pm
                        .iter()
                        .zip(vm)
                        .all(|((pk, p), (vk, v))| pk == vk && p.mirrors(v))
            }
            (Self::List(_) | Self::Map(_), _) => false,
            _ => true,
        }
    }
}
