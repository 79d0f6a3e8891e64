// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # khepri
//!
//! An entity-native functional data processing runtime: a versioned,
//! in-memory store of structured records through which registered
//! functions transform data while the runtime tracks lineage, provenance,
//! versioning, and relationships.
//!
//! ## Architecture
//!
//! - **Entity model** (`entity`): records with version / instance / lineage identities,
//!   tagged-union values, per-field provenance, deep-copy visitors
//! - **Trees & diff** (`tree`): petgraph-backed node/edge structure with ancestry,
//!   structural diff, greedy fork paths
//! - **Registry** (`registry`): DashMap-indexed root versions, lineage chains, kind index
//! - **Addresses** (`address`): `@<uuid>.field` references with late resolution
//! - **Callables & execution** (`callable`, `exec`): typed registration, copy-on-read
//!   isolation, semantic classification, multi-output unpacking
//! - **Events** (`event`): identifier-only signals with scoped parent context and
//!   concurrent fan-out
//!
//! ## Library usage
//!
//! ```no_run
//! use khepri::callable::{CallableSpec, TypeTag};
//! use khepri::runtime::Runtime;
//!
//! let rt = Runtime::default();
//! rt.register(
//!     CallableSpec::new("update_field").param("x", TypeTag::Entity(None)),
//!     |mut inv| {
//!         let mut x = inv.take_entity("x")?;
//!         let v = x.get_int("v")?;
//!         x.set_field("v", v + 1);
//!         Ok(x.into())
//!     },
//! )
//! .unwrap();
//!
//! let mut e = rt.create("Counter").with_field("v", 3i64);
//! rt.promote(&mut e).unwrap();
//! let outcome = rt
//!     .execute("update_field", vec![("x".into(), format!("@{}", e.ecs_id()).as_str().into())])
//!     .unwrap();
//! assert_eq!(outcome.single().get_int("v").unwrap(), 4);
//! ```

pub mod address;
pub mod callable;
pub mod entity;
pub mod error;
pub mod event;
pub mod exec;
pub mod registry;
pub mod runtime;
pub mod tree;
