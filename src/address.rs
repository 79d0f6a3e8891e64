//! Addressable references: `@<uuid>` strings with field projection.
//!
//! An address names the current version of an entity and optionally
//! projects into its fields: `@<uuid>.items.0.name`. Addresses parse once
//! into an [`Address`] AST and resolve late against a registry — at
//! execution time, never at construction time. Resolved entities are
//! always fresh copies.
//!
//! Grammar (bit-exact):
//!
//! ```text
//! address  ::= '@' uuid ('.' segment)*
//! uuid     ::= 8-4-4-4-12 lowercase hex, hyphenated
//! segment  ::= identifier | integer | '"' escaped-string '"'
//! ```
//!
//! Map keys that look like integers or contain separators must be quoted;
//! a bare integer segment always means positional indexing.

use uuid::Uuid;

use crate::entity::{EcsId, Value};
use crate::error::{AddressError, KhepriError, KhepriResult};
use crate::registry::EntityRegistry;

/// One projection step of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Record field or map key named by a bare identifier.
    Field(String),
    /// Positional index into a list, tuple, or set.
    Index(usize),
    /// Quoted map key (for keys that look like integers or contain
    /// separators).
    Key(String),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Field(name) => write!(f, "{name}"),
            Segment::Index(i) => write!(f, "{i}"),
            Segment::Key(k) => {
                write!(f, "\"")?;
                for c in k.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
        }
    }
}

/// A parsed address: target entity version plus projection path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The referenced entity version (resolution follows its lineage to
    /// the current version).
    pub ecs_id: EcsId,
    /// Projection path, outermost first.
    pub segments: Vec<Segment>,
}

impl Address {
    /// Cheap syntactic check: does this string even claim to be an address?
    pub fn looks_like(input: &str) -> bool {
        input.starts_with('@')
    }

    /// Parse an address string into its AST.
    pub fn parse(input: &str) -> KhepriResult<Self> {
        let bytes = input.as_bytes();
        if bytes.first() != Some(&b'@') {
            return Err(syntax(0, "address must start with '@'"));
        }
        if input.len() < 1 + 36 {
            return Err(syntax(input.len(), "truncated UUID"));
        }

        let uuid_str = &input[1..37];
        for (i, c) in uuid_str.char_indices() {
            let expected_hyphen = matches!(i, 8 | 13 | 18 | 23);
            if expected_hyphen {
                if c != '-' {
                    return Err(syntax(1 + i, "expected '-' in UUID"));
                }
            } else if !c.is_ascii_hexdigit() || c.is_ascii_uppercase() {
                return Err(syntax(1 + i, "expected lowercase hex digit"));
            }
        }
        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|e| syntax(1, &format!("invalid UUID: {e}")))?;

        let mut segments = Vec::new();
        let mut pos = 37;
        while pos < bytes.len() {
            if bytes[pos] != b'.' {
                return Err(syntax(pos, "expected '.' before segment"));
            }
            pos += 1;
            let (segment, next) = parse_segment(input, pos)?;
            segments.push(segment);
            pos = next;
        }

        Ok(Self {
            ecs_id: EcsId::from_uuid(uuid),
            segments,
        })
    }

    /// Resolve against a registry: fetch the current version of the target
    /// and project through the path. The result is a fresh copy if it is
    /// an entity (or contains entities).
    pub fn resolve(&self, registry: &EntityRegistry) -> KhepriResult<Value> {
        let entity = registry.current_version_of(self.ecs_id).map_err(|e| match e {
            KhepriError::Registry(_) => AddressError::NotFound {
                ecs_id: self.ecs_id.to_string(),
            }
            .into(),
            other => other,
        })?;

        let mut value = Value::from(entity);
        for segment in &self.segments {
            value = project(value, segment)?;
        }
        Ok(value)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.ecs_id)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Parse-and-resolve convenience for callers holding a raw string.
pub fn resolve_address(registry: &EntityRegistry, input: &str) -> KhepriResult<Value> {
    Address::parse(input)?.resolve(registry)
}

fn syntax(position: usize, message: &str) -> KhepriError {
    AddressError::Syntax {
        position,
        message: message.to_string(),
    }
    .into()
}

fn parse_segment(input: &str, start: usize) -> KhepriResult<(Segment, usize)> {
    let bytes = input.as_bytes();
    let Some(&first) = bytes.get(start) else {
        return Err(syntax(start, "empty segment"));
    };

    if first == b'"' {
        let mut key = String::new();
        let mut pos = start + 1;
        loop {
            match bytes.get(pos) {
                None => return Err(syntax(pos, "unterminated quoted key")),
                Some(b'"') => return Ok((Segment::Key(key), pos + 1)),
                Some(b'\\') => {
                    match bytes.get(pos + 1) {
                        Some(b'"') => key.push('"'),
                        Some(b'\\') => key.push('\\'),
                        _ => return Err(syntax(pos, "invalid escape in quoted key")),
                    }
                    pos += 2;
                }
                Some(_) => {
                    // Track char boundaries, not bytes, for multi-byte keys.
                    let c = input[pos..].chars().next().expect("in-bounds char");
                    key.push(c);
                    pos += c.len_utf8();
                }
            }
        }
    }

    if first.is_ascii_digit() {
        let mut pos = start;
        while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        if bytes.get(pos).is_some_and(|b| *b != b'.') {
            return Err(syntax(pos, "invalid character in integer segment"));
        }
        let index: usize = input[start..pos]
            .parse()
            .map_err(|_| syntax(start, "integer segment out of range"))?;
        return Ok((Segment::Index(index), pos));
    }

    if first == b'_' || first.is_ascii_alphabetic() {
        let mut pos = start;
        while bytes
            .get(pos)
            .is_some_and(|b| *b == b'_' || b.is_ascii_alphanumeric())
        {
            pos += 1;
        }
        if bytes.get(pos).is_some_and(|b| *b != b'.') {
            return Err(syntax(pos, "invalid character in identifier segment"));
        }
        return Ok((Segment::Field(input[start..pos].to_string()), pos));
    }

    Err(syntax(start, "segment must be an identifier, integer, or quoted string"))
}

fn project(value: Value, segment: &Segment) -> KhepriResult<Value> {
    let value_kind = value.kind_name();
    let fail = || -> KhepriError {
        AddressError::Field {
            segment: segment.to_string(),
            value_kind: value_kind.to_string(),
        }
        .into()
    };

    match (value, segment) {
        (Value::Entity(e), Segment::Field(name)) => {
            e.field(name).cloned().ok_or_else(fail)
        }
        (Value::Map(mut m), Segment::Field(name)) => m.remove(name).ok_or_else(fail),
        (Value::Map(mut m), Segment::Key(key)) => m.remove(key).ok_or_else(fail),
        (Value::List(mut vs), Segment::Index(i))
        | (Value::Tuple(mut vs), Segment::Index(i))
        | (Value::Set(mut vs), Segment::Index(i)) => {
            if *i < vs.len() {
                Ok(vs.swap_remove(*i))
            } else {
                Err(fail())
            }
        }
        _ => Err(fail()),
    }
}
