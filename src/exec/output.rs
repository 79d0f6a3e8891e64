//! Result shaping: output validation, wrapper synthesis, sibling links,
//! and provenance stitching.
//!
//! Every value leaving the engine is an entity. Fixed-arity outputs are
//! registered positionally and cross-linked; variable-arity containers and
//! non-entity returns are wrapped in a synthesized entity whose `payload`
//! field holds the structure.

use std::collections::BTreeMap;

use crate::callable::{CallableMeta, OutputShape};
use crate::entity::{Entity, IdentityMap, LiveId, Provenance, Value};
use crate::error::{ExecError, KhepriResult};

/// Field name under which a wrapper entity carries the returned structure.
pub const WRAPPER_PAYLOAD_FIELD: &str = "payload";

/// Check the returned value against the declared output shape.
pub fn validate_output(meta: &CallableMeta, value: &Value) -> KhepriResult<()> {
    match check_shape(&meta.output, value) {
        Ok(()) => Ok(()),
        Err(message) => Err(ExecError::OutputShape {
            function: meta.name.clone(),
            message,
        }
        .into()),
    }
}

fn check_entity(kind: &Option<String>, value: &Value) -> Result<(), String> {
    match value {
        Value::Entity(e) => match kind {
            Some(k) if e.kind() != k => {
                Err(format!("expected entity of kind '{k}', got '{}'", e.kind()))
            }
            _ => Ok(()),
        },
        other => Err(format!("expected an entity, got {}", other.kind_name())),
    }
}

fn check_shape(shape: &OutputShape, value: &Value) -> Result<(), String> {
    match shape {
        OutputShape::Entity(kind) => check_entity(kind, value),
        OutputShape::Tuple(kinds) => match value {
            Value::Tuple(vs) | Value::List(vs) => {
                if vs.len() != kinds.len() {
                    return Err(format!(
                        "expected {} positional outputs, got {}",
                        kinds.len(),
                        vs.len()
                    ));
                }
                for (i, (kind, v)) in kinds.iter().zip(vs).enumerate() {
                    check_entity(kind, v).map_err(|e| format!("slot {i}: {e}"))?;
                }
                Ok(())
            }
            other => Err(format!("expected a tuple, got {}", other.kind_name())),
        },
        OutputShape::List(kind) => match value {
            Value::List(vs) => {
                for (i, v) in vs.iter().enumerate() {
                    check_entity(kind, v).map_err(|e| format!("element {i}: {e}"))?;
                }
                Ok(())
            }
            other => Err(format!("expected a list, got {}", other.kind_name())),
        },
        OutputShape::Map(kind) => match value {
            Value::Map(m) => {
                for (k, v) in m {
                    check_entity(kind, v).map_err(|e| format!("key '{k}': {e}"))?;
                }
                Ok(())
            }
            other => Err(format!("expected a map, got {}", other.kind_name())),
        },
        OutputShape::Nested => match value {
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::Map(_) => Ok(()),
            other => Err(format!(
                "expected a nested container, got {}",
                other.kind_name()
            )),
        },
        OutputShape::Value(tag) => {
            if tag.matches(value) {
                Ok(())
            } else {
                Err(format!(
                    "expected {tag}, got {}",
                    value.kind_name()
                ))
            }
        }
        OutputShape::Union(shapes) => {
            for s in shapes {
                if check_shape(s, value).is_ok() {
                    return Ok(());
                }
            }
            Err("value matches no member of the declared union".to_string())
        }
    }
}

/// Synthesize the wrapper entity for a non-positional return.
pub fn wrap_output(meta: &CallableMeta, value: Value) -> Entity {
    let mut wrapper = Entity::new(meta.output_shape_name.clone());
    wrapper.set_field(WRAPPER_PAYLOAD_FIELD, value);
    wrapper
}

/// Cross-link positional outputs: each one learns the final identities of
/// its siblings (not itself).
pub fn link_siblings(outputs: &mut [Entity]) {
    let ids: Vec<_> = outputs.iter().map(Entity::ecs_id).collect();
    for entity in outputs.iter_mut() {
        let own = entity.ecs_id();
        entity.set_sibling_output_ids(ids.iter().copied().filter(|id| *id != own).collect());
    }
}

// ---------------------------------------------------------------------------
// Provenance stitching
// ---------------------------------------------------------------------------

/// Record borrows on an output entity: any field (or container element)
/// equal to an input copy's field value takes that input's identity as its
/// source; locally computed values stay local. Inputs are searched in
/// depth-first order, fields in name order; the first match wins.
pub fn stitch_provenance(
    output: &mut Entity,
    identity_map: &IdentityMap,
    snapshots: &BTreeMap<LiveId, Entity>,
) {
    let fields: Vec<String> = output.field_names().iter().map(|s| s.to_string()).collect();
    for name in fields {
        // Borrows recorded explicitly by the body stay as they are.
        if matches!(output.attribute_source(&name), Some(Provenance::Borrowed(_))) {
            continue;
        }
        let Some(value) = output.field(&name).cloned() else {
            continue;
        };
        let prov = stitch_value(&value, identity_map, snapshots);
        output.set_attribute_source_entry(&name, prov);
    }
}

fn stitch_value(
    value: &Value,
    identity_map: &IdentityMap,
    snapshots: &BTreeMap<LiveId, Entity>,
) -> Provenance {
    if let Some(source) = find_source(value, identity_map, snapshots) {
        return borrowed_mirror(value, source);
    }
    match value {
        Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => Provenance::List(
            vs.iter()
                .map(|v| stitch_value(v, identity_map, snapshots))
                .collect(),
        ),
        Value::Map(m) => Provenance::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), stitch_value(v, identity_map, snapshots)))
                .collect(),
        ),
        _ => Provenance::Local,
    }
}

fn find_source(
    value: &Value,
    identity_map: &IdentityMap,
    snapshots: &BTreeMap<LiveId, Entity>,
) -> Option<crate::entity::EcsId> {
    // Null carries no information and entities are edges, not borrows.
    if matches!(value, Value::Null | Value::Entity(_)) {
        return None;
    }
    for (live, _) in identity_map.in_order() {
        let Some(snapshot) = snapshots.get(&live) else {
            continue;
        };
        for (_, field_value) in snapshot.fields() {
            if field_value == value {
                return Some(snapshot.ecs_id());
            }
        }
    }
    None
}

fn borrowed_mirror(value: &Value, source: crate::entity::EcsId) -> Provenance {
    match value {
        Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
            Provenance::List(vs.iter().map(|v| borrowed_mirror(v, source)).collect())
        }
        Value::Map(m) => Provenance::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), borrowed_mirror(v, source)))
                .collect(),
        ),
        _ => Provenance::Borrowed(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::{CallableSpec, TypeTag};
    use crate::entity::copy::{collect_nodes, copy_for_read};
    use crate::tree::TreeLimits;

    fn prepared(entity: &Entity) -> (IdentityMap, BTreeMap<LiveId, Entity>) {
        let (copy, map) = copy_for_read(entity, &TreeLimits::default()).unwrap();
        let snapshots = collect_nodes(&copy)
            .into_iter()
            .map(|n| (n.live_id(), n.clone()))
            .collect();
        (map, snapshots)
    }

    fn single_meta() -> CallableMeta {
        CallableSpec::new("f")
            .param("x", TypeTag::Entity(None))
            .build(false)
            .unwrap()
    }

    #[test]
    fn single_shape_accepts_entity_only() {
        let meta = single_meta();
        assert!(validate_output(&meta, &Entity::new("Out").into()).is_ok());
        assert!(validate_output(&meta, &Value::Int(1)).is_err());
    }

    #[test]
    fn tuple_shape_checks_arity_and_entity_ness() {
        let meta = CallableSpec::new("split")
            .param("r", TypeTag::Entity(None))
            .returns(OutputShape::Tuple(vec![None, None]))
            .build(false)
            .unwrap();

        let good = Value::Tuple(vec![Entity::new("A").into(), Entity::new("B").into()]);
        assert!(validate_output(&meta, &good).is_ok());

        let short = Value::Tuple(vec![Entity::new("A").into()]);
        assert!(validate_output(&meta, &short).is_err());

        let non_entity = Value::Tuple(vec![Entity::new("A").into(), Value::Int(2)]);
        assert!(validate_output(&meta, &non_entity).is_err());
    }

    #[test]
    fn kind_constrained_output_enforced() {
        let meta = CallableSpec::new("mk")
            .returns(OutputShape::Entity(Some("Report".into())))
            .build(false)
            .unwrap();
        assert!(validate_output(&meta, &Entity::new("Report").into()).is_ok());
        assert!(validate_output(&meta, &Entity::new("Other").into()).is_err());
    }

    #[test]
    fn wrapper_holds_payload() {
        let meta = CallableSpec::new("dup")
            .returns(OutputShape::List(None))
            .build(false)
            .unwrap();
        let wrapper = wrap_output(&meta, Value::List(vec![Entity::new("Item").into()]));
        assert_eq!(wrapper.kind(), "dup:Output");
        assert!(matches!(
            wrapper.field(WRAPPER_PAYLOAD_FIELD),
            Some(Value::List(_))
        ));
    }

    #[test]
    fn sibling_links_exclude_self() {
        let mut outputs = vec![Entity::new("A"), Entity::new("B"), Entity::new("C")];
        link_siblings(&mut outputs);
        for (i, e) in outputs.iter().enumerate() {
            assert_eq!(e.sibling_output_ids().len(), 2);
            assert!(!e.sibling_output_ids().contains(&outputs[i].ecs_id()));
        }
    }

    #[test]
    fn borrowed_field_takes_source_identity() {
        let mut src = Entity::new("Student").with_field("score", 42i64);
        src.mark_root();
        let (map, snaps) = prepared(&src);

        let mut out = Entity::new("Report");
        out.set_field("copied", 42i64);
        out.set_field("fresh", 7i64);
        stitch_provenance(&mut out, &map, &snaps);

        assert_eq!(
            out.attribute_source("copied"),
            Some(&Provenance::Borrowed(src.ecs_id()))
        );
        assert_eq!(out.attribute_source("fresh"), Some(&Provenance::Local));
    }

    #[test]
    fn borrowed_container_mirrors_per_element() {
        let mut src = Entity::new("Student");
        src.set_field("scores", Value::List(vec![Value::Int(1), Value::Int(2)]));
        src.mark_root();
        let (map, snaps) = prepared(&src);

        let mut out = Entity::new("Report");
        out.set_field("scores", Value::List(vec![Value::Int(1), Value::Int(2)]));
        stitch_provenance(&mut out, &map, &snaps);

        match out.attribute_source("scores").unwrap() {
            Provenance::List(ps) => {
                assert!(ps.iter().all(|p| p.borrowed_from() == Some(src.ecs_id())));
            }
            other => panic!("expected per-element provenance, got {other:?}"),
        }
    }

    #[test]
    fn explicit_borrow_not_overwritten() {
        let mut src = Entity::new("Student").with_field("score", 42i64);
        src.mark_root();
        let other_source = crate::entity::EcsId::fresh();
        let (map, snaps) = prepared(&src);

        let mut out = Entity::new("Report");
        out.set_field("copied", 42i64);
        out.set_attribute_source_entry("copied", Provenance::Borrowed(other_source));
        stitch_provenance(&mut out, &map, &snaps);

        assert_eq!(
            out.attribute_source("copied"),
            Some(&Provenance::Borrowed(other_source))
        );
    }
}
