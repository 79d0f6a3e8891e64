//! Callable model: typed transform signatures and synthesized shapes.
//!
//! Rust has no runtime signature introspection, so registration is
//! declarative: a [`CallableSpec`] names the ordered, typed parameters
//! (with optional defaults) and the declared [`OutputShape`]. The
//! registrar synthesizes the input/output record shapes and derives the
//! execution metadata the engine dispatches on (`output_pattern`,
//! `expected_output_count`, `supports_unpacking`, `uses_config_entity`,
//! `is_async`).

pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Value};
use crate::error::{CallableError, EntityError, KhepriResult};

pub use registry::CallableRegistry;

/// Declared type of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    Str,
    /// An entity, optionally constrained to a kind.
    Entity(Option<String>),
    List(Box<TypeTag>),
    Tuple(Vec<TypeTag>),
    Map(Box<TypeTag>),
    /// A configuration entity of the given kind; loose primitives at the
    /// call site are bundled into one.
    Config(String),
    Union(Vec<TypeTag>),
}

impl TypeTag {
    /// Whether a runtime value satisfies this tag.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (TypeTag::Bool, Value::Bool(_)) => true,
            (TypeTag::Int, Value::Int(_)) => true,
            (TypeTag::Float, Value::Float(_)) => true,
            (TypeTag::Str, Value::Str(_)) => true,
            (TypeTag::Entity(None), Value::Entity(_)) => true,
            (TypeTag::Entity(Some(kind)), Value::Entity(e)) => e.kind() == kind,
            (TypeTag::Config(kind), Value::Entity(e)) => e.kind() == kind,
            (TypeTag::List(elem), Value::List(vs)) => vs.iter().all(|v| elem.matches(v)),
            (TypeTag::Tuple(tags), Value::Tuple(vs)) => {
                tags.len() == vs.len() && tags.iter().zip(vs).all(|(t, v)| t.matches(v))
            }
            (TypeTag::Map(elem), Value::Map(m)) => m.values().all(|v| elem.matches(v)),
            (TypeTag::Union(tags), v) => tags.iter().any(|t| t.matches(v)),
            _ => false,
        }
    }

    /// Whether this tag names an entity-valued parameter.
    pub fn is_record(&self) -> bool {
        matches!(self, TypeTag::Entity(_) | TypeTag::Config(_))
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::Str => write!(f, "str"),
            TypeTag::Entity(None) => write!(f, "entity"),
            TypeTag::Entity(Some(kind)) => write!(f, "entity<{kind}>"),
            TypeTag::List(elem) => write!(f, "list<{elem}>"),
            TypeTag::Tuple(tags) => {
                write!(f, "tuple<")?;
                for (i, t) in tags.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ">")
            }
            TypeTag::Map(elem) => write!(f, "map<{elem}>"),
            TypeTag::Config(kind) => write!(f, "config<{kind}>"),
            TypeTag::Union(tags) => {
                for (i, t) in tags.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub tag: TypeTag,
    pub default: Option<Value>,
}

/// Declared output shape of a callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputShape {
    /// A single entity, optionally constrained to a kind.
    Entity(Option<String>),
    /// Fixed-arity positional entity outputs.
    Tuple(Vec<Option<String>>),
    /// Unbounded list of entities.
    List(Option<String>),
    /// String-keyed map of entities.
    Map(Option<String>),
    /// Arbitrarily nested containers holding entities.
    Nested,
    /// A non-entity value; always wrapped.
    Value(TypeTag),
    /// One of several shapes; always wrapped.
    Union(Vec<OutputShape>),
}

/// Derived dispatch pattern, one per output shape family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputPattern {
    Single,
    Tuple,
    List,
    Map,
    Nested,
    Wrapper,
    Union,
}

impl std::fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputPattern::Single => "single",
            OutputPattern::Tuple => "tuple",
            OutputPattern::List => "list",
            OutputPattern::Map => "map",
            OutputPattern::Nested => "nested",
            OutputPattern::Wrapper => "wrapper",
            OutputPattern::Union => "union",
        };
        write!(f, "{name}")
    }
}

/// Synthesized anonymous record shape (input or config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordShape {
    pub type_name: String,
    pub fields: Vec<(String, TypeTag)>,
}

/// Everything the engine knows about one registered callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableMeta {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub output: OutputShape,
    /// Synthesized `<name>:Input` shape.
    pub input_shape: RecordShape,
    /// Synthesized `<name>:Output` wrapper kind name.
    pub output_shape_name: String,
    /// Declared config entity kind, if a config parameter exists.
    pub config_kind: Option<String>,
    pub uses_config_entity: bool,
    pub is_async: bool,
    pub output_pattern: OutputPattern,
    /// Known output arity for fixed shapes.
    pub expected_output_count: Option<usize>,
    /// Positional unpacking: on by default only for fixed-arity outputs.
    pub supports_unpacking: bool,
}

// ---------------------------------------------------------------------------
// Invocation: what a callable body receives
// ---------------------------------------------------------------------------

/// Resolved, copy-isolated arguments handed to a callable body.
///
/// Every entity in here is a deep copy; mutating it cannot touch stored
/// state or the caller's instances.
#[derive(Debug)]
pub struct Invocation {
    args: BTreeMap<String, Value>,
}

impl Invocation {
    pub(crate) fn new(args: BTreeMap<String, Value>) -> Self {
        Self { args }
    }

    /// Borrow an argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Take an argument by value.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.args.remove(name)
    }

    /// Take an entity argument.
    pub fn take_entity(&mut self, name: &str) -> KhepriResult<Entity> {
        match self.args.remove(name) {
            Some(Value::Entity(e)) => Ok(*e),
            Some(other) => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "entity",
                actual: other.kind_name(),
            }
            .into()),
            None => Err(EntityError::FieldNotFound {
                kind: "Invocation".to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    /// Read an integer argument.
    pub fn int(&self, name: &str) -> KhepriResult<i64> {
        match self.args.get(name) {
            Some(Value::Int(i)) => Ok(*i),
            Some(other) => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "int",
                actual: other.kind_name(),
            }
            .into()),
            None => Err(EntityError::FieldNotFound {
                kind: "Invocation".to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    /// Read a string argument.
    pub fn str(&self, name: &str) -> KhepriResult<&str> {
        match self.args.get(name) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(EntityError::WrongType {
                field: name.to_string(),
                expected: "str",
                actual: other.kind_name(),
            }
            .into()),
            None => Err(EntityError::FieldNotFound {
                kind: "Invocation".to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    /// Argument names present.
    pub fn names(&self) -> Vec<&str> {
        self.args.keys().map(String::as_str).collect()
    }
}

/// A registered transform body.
#[derive(Clone)]
pub enum CallableFn {
    Sync(Arc<dyn Fn(Invocation) -> KhepriResult<Value> + Send + Sync>),
    Async(Arc<dyn Fn(Invocation) -> BoxFuture<'static, KhepriResult<Value>> + Send + Sync>),
}

impl CallableFn {
    pub fn is_async(&self) -> bool {
        matches!(self, CallableFn::Async(_))
    }
}

impl std::fmt::Debug for CallableFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallableFn::Sync(_) => write!(f, "CallableFn::Sync(..)"),
            CallableFn::Async(_) => write!(f, "CallableFn::Async(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Spec builder
// ---------------------------------------------------------------------------

/// Declarative signature for one callable, built at registration time.
#[derive(Debug, Clone)]
pub struct CallableSpec {
    name: String,
    params: Vec<ParamSpec>,
    output: OutputShape,
    unpacking_override: Option<bool>,
}

impl CallableSpec {
    /// Start a spec for a callable of the given name. The output shape
    /// defaults to a single entity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            output: OutputShape::Entity(None),
            unpacking_override: None,
        }
    }

    /// Declare the next positional parameter.
    pub fn param(mut self, name: impl Into<String>, tag: TypeTag) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            tag,
            default: None,
        });
        self
    }

    /// Declare a parameter with a default value.
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        tag: TypeTag,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            tag,
            default: Some(default.into()),
        });
        self
    }

    /// Declare the output shape.
    pub fn returns(mut self, output: OutputShape) -> Self {
        self.output = output;
        self
    }

    /// Override the unpacking default (restores positional semantics for
    /// lists and maps).
    pub fn with_unpacking(mut self, unpack: bool) -> Self {
        self.unpacking_override = Some(unpack);
        self
    }

    /// Validate and derive the full metadata.
    pub fn build(self, is_async: bool) -> KhepriResult<CallableMeta> {
        let name = self.name;
        let fail = |message: &str| -> KhepriResult<CallableMeta> {
            Err(CallableError::UnsupportedSignature {
                name: name.clone(),
                message: message.to_string(),
            }
            .into())
        };

        if name.is_empty() {
            return fail("callable name must be non-empty");
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut config_kind = None;
        for p in &self.params {
            if p.name.is_empty() {
                return fail("parameter names must be non-empty");
            }
            if !seen.insert(p.name.clone()) {
                return fail(&format!("duplicate parameter '{}'", p.name));
            }
            if let Some(default) = &p.default {
                if !p.tag.matches(default) {
                    return fail(&format!(
                        "default for '{}' does not match its declared type",
                        p.name
                    ));
                }
            }
            if let TypeTag::Config(kind) = &p.tag {
                if config_kind.is_some() {
                    return fail("at most one configuration parameter is supported");
                }
                config_kind = Some(kind.clone());
            }
        }
        if let OutputShape::Tuple(kinds) = &self.output {
            if kinds.is_empty() {
                return fail("tuple outputs must have at least one slot");
            }
        }

        let output_pattern = match &self.output {
            OutputShape::Entity(_) => OutputPattern::Single,
            OutputShape::Tuple(_) => OutputPattern::Tuple,
            OutputShape::List(_) => OutputPattern::List,
            OutputShape::Map(_) => OutputPattern::Map,
            OutputShape::Nested => OutputPattern::Nested,
            OutputShape::Value(_) => OutputPattern::Wrapper,
            OutputShape::Union(_) => OutputPattern::Union,
        };
        let expected_output_count = match &self.output {
            OutputShape::Entity(_) => Some(1),
            OutputShape::Tuple(kinds) => Some(kinds.len()),
            _ => None,
        };
        // Fixed-arity positional outputs unpack; variable-arity containers
        // wrap unless explicitly overridden.
        let supports_unpacking = match output_pattern {
            OutputPattern::Tuple => self.unpacking_override.unwrap_or(true),
            OutputPattern::List | OutputPattern::Map => {
                self.unpacking_override.unwrap_or(false)
            }
            _ => false,
        };

        let input_shape = RecordShape {
            type_name: format!("{name}:Input"),
            fields: self
                .params
                .iter()
                .map(|p| (p.name.clone(), p.tag.clone()))
                .collect(),
        };

        Ok(CallableMeta {
            output_shape_name: format!("{name}:Output"),
            uses_config_entity: config_kind.is_some(),
            config_kind,
            is_async,
            output_pattern,
            expected_output_count,
            supports_unpacking,
            input_shape,
            params: self.params,
            output: self.output,
            name,
        })
    }
}
