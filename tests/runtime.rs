//! End-to-end scenarios for the khepri runtime.
//!
//! These tests exercise the full pipeline from entity promotion through
//! address resolution, execution, classification, and event linkage,
//! validating that the registries, the engine, and the bus all work
//! together.

use std::sync::Arc;

use khepri::callable::{CallableSpec, OutputShape, TypeTag};
use khepri::entity::{Entity, Provenance, Value};
use khepri::event::EventKind;
use khepri::exec::{Classification, EXECUTION_RECORD_KIND, WRAPPER_PAYLOAD_FIELD};
use khepri::runtime::Runtime;

fn runtime() -> Runtime {
    init_tracing();
    Runtime::default()
}

/// Opt-in log output for debugging: `RUST_LOG=khepri=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn register_update_field(rt: &Runtime) {
    rt.register(
        CallableSpec::new("update_field").param("x", TypeTag::Entity(None)),
        |mut inv| {
            let mut x = inv.take_entity("x")?;
            let v = x.get_int("v")?;
            x.set_field("v", v + 1);
            Ok(x.into())
        },
    )
    .unwrap();
}

fn promoted(rt: &Runtime, mut entity: Entity) -> Entity {
    rt.promote(&mut entity).unwrap();
    entity
}

#[test]
fn single_entity_mutation_forks_a_version() {
    let rt = runtime();
    register_update_field(&rt);
    let e = promoted(&rt, rt.create("Counter").with_field("v", 3i64));

    let outcome = rt
        .execute(
            "update_field",
            vec![("x".into(), format!("@{}", e.ecs_id()).as_str().into())],
        )
        .unwrap();

    let out = outcome.single();
    assert_eq!(out.get_int("v").unwrap(), 4);
    assert_ne!(out.ecs_id(), e.ecs_id());
    assert_eq!(out.lineage_id(), e.lineage_id());
    assert_eq!(e.get_int("v").unwrap(), 3);
}

#[test]
fn address_based_composition_is_locally_computed() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("add")
            .param("x", TypeTag::Int)
            .param("y", TypeTag::Int)
            .returns(OutputShape::Entity(Some("Sum".into()))),
        |inv| {
            let s = inv.int("x")? + inv.int("y")?;
            Ok(Entity::new("Sum").with_field("s", s).into())
        },
    )
    .unwrap();
    let a = promoted(&rt, rt.create("Num").with_field("v", 10i64));
    let b = promoted(&rt, rt.create("Num").with_field("v", 20i64));

    let outcome = rt
        .execute(
            "add",
            vec![
                ("x".into(), format!("@{}.v", a.ecs_id()).as_str().into()),
                ("y".into(), format!("@{}.v", b.ecs_id()).as_str().into()),
            ],
        )
        .unwrap();

    let out = outcome.single();
    assert_eq!(out.get_int("s").unwrap(), 30);
    assert_eq!(out.attribute_source("s"), Some(&Provenance::Local));
}

#[test]
fn tuple_outputs_unpack_with_sibling_links() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("split")
            .param("r", TypeTag::Entity(None))
            .returns(OutputShape::Tuple(vec![None, None])),
        |mut inv| {
            let r = inv.take_entity("r")?;
            let v = r.get_int("v")?;
            Ok(Value::Tuple(vec![
                Entity::new("A").with_field("a", v).into(),
                Entity::new("B").with_field("b", -v).into(),
            ]))
        },
    )
    .unwrap();
    let e = promoted(&rt, rt.create("Counter").with_field("v", 5i64));

    let outcome = rt
        .execute("split", vec![("r".into(), e.into())])
        .unwrap();

    assert_eq!(outcome.outputs.len(), 2);
    let (a, b) = (&outcome.outputs[0], &outcome.outputs[1]);
    assert_eq!(a.get_int("a").unwrap(), 5);
    assert_eq!(b.get_int("b").unwrap(), -5);
    assert_eq!(a.sibling_output_ids(), [b.ecs_id()]);
    assert_eq!(b.sibling_output_ids(), [a.ecs_id()]);
    assert!(rt.entities().contains_root(a.ecs_id()));
    assert!(rt.entities().contains_root(b.ecs_id()));
}

#[test]
fn list_output_is_wrapped_in_one_entity() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("duplicate")
            .param("n", TypeTag::Int)
            .returns(OutputShape::List(None)),
        |inv| {
            let n = inv.int("n")?;
            Ok(Value::List(
                (0..n)
                    .map(|i| Entity::new("Item").with_field("i", i).into())
                    .collect(),
            ))
        },
    )
    .unwrap();

    assert!(!rt.callable_metadata("duplicate").unwrap().supports_unpacking);

    let outcome = rt
        .execute("duplicate", vec![("n".into(), 3i64.into())])
        .unwrap();

    assert_eq!(outcome.outputs.len(), 1);
    let wrapper = outcome.single();
    match wrapper.field(WRAPPER_PAYLOAD_FIELD).unwrap() {
        Value::List(items) => {
            assert_eq!(items.len(), 3);
            assert!(items.iter().all(Value::is_entity));
        }
        other => panic!("expected list payload, got {}", other.kind_name()),
    }
    assert!(rt.entities().contains_root(wrapper.ecs_id()));
}

#[test]
fn pass_through_returns_the_same_version() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("identity").param("x", TypeTag::Entity(None)),
        |mut inv| Ok(inv.take_entity("x")?.into()),
    )
    .unwrap();
    let e = promoted(&rt, rt.create("Counter").with_field("v", 5i64));

    let outcome = rt
        .execute("identity", vec![("x".into(), e.clone().into())])
        .unwrap();

    let out = outcome.single();
    assert_eq!(out.ecs_id(), e.ecs_id());
    assert_ne!(out.live_id(), e.live_id());
    assert!(matches!(
        outcome.classifications[0],
        Classification::PassThrough { .. }
    ));
    // No new version was minted.
    assert_eq!(rt.lineage_history(e.lineage_id()).len(), 1);
}

#[test]
fn nested_call_links_events_to_the_outer_scope() {
    let rt = Arc::new(Runtime::default());
    rt.register(
        CallableSpec::new("inner").param("x", TypeTag::Entity(None)),
        |mut inv| Ok(inv.take_entity("x")?.into()),
    )
    .unwrap();
    let inner_rt = Arc::clone(&rt);
    rt.register(
        CallableSpec::new("outer").param("x", TypeTag::Entity(None)),
        move |mut inv| {
            let x = inv.take_entity("x")?;
            let outcome = inner_rt.execute("inner", vec![("x".into(), x.into())])?;
            Ok(outcome.into_outputs().remove(0).into())
        },
    )
    .unwrap();
    let e = promoted(&rt, rt.create("Counter").with_field("v", 1i64));

    rt.execute("outer", vec![("x".into(), e.into())]).unwrap();

    let processing: Vec<_> = rt
        .recent_events(64)
        .into_iter()
        .filter(|e| e.kind == EventKind::Processing)
        .collect();
    assert_eq!(processing.len(), 2);
    let (outer, inner) = (&processing[0], &processing[1]);
    assert_eq!(inner.parent_id, Some(outer.id));
    assert_eq!(inner.root_id, Some(outer.id));
    assert_eq!(outer.root_id, Some(outer.id));
    // Scopes balanced once the runtime is idle.
    assert!(rt.current_parent().is_none());
}

#[test]
fn address_round_trip_for_scalar_fields() {
    let rt = runtime();
    let e = promoted(
        &rt,
        rt.create("Student")
            .with_field("name", "ada")
            .with_field("score", 42i64),
    );

    assert_eq!(
        rt.resolve(&format!("@{}.score", e.ecs_id())).unwrap(),
        Value::Int(42)
    );
    assert_eq!(
        rt.resolve(&format!("@{}.name", e.ecs_id())).unwrap(),
        Value::Str("ada".into())
    );
}

#[test]
fn fetched_state_is_immune_to_caller_mutation() {
    let rt = runtime();
    let e = promoted(&rt, rt.create("Counter").with_field("v", 3i64));

    let mut fetched = rt.fetch(e.ecs_id()).unwrap();
    fetched.set_field("v", 99i64);

    let tree = rt.fetch_tree(e.ecs_id()).unwrap();
    assert_eq!(tree.root().get_int("v").unwrap(), 3);
    assert_eq!(rt.fetch(e.ecs_id()).unwrap().get_int("v").unwrap(), 3);
}

#[test]
fn borrowed_output_field_carries_provenance() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("report")
            .param("x", TypeTag::Entity(None))
            .returns(OutputShape::Entity(Some("Report".into()))),
        |mut inv| {
            let x = inv.take_entity("x")?;
            let score = x.field("score").cloned().unwrap_or(Value::Null);
            Ok(Entity::new("Report").with_field("copied", score).into())
        },
    )
    .unwrap();
    let e = promoted(&rt, rt.create("Student").with_field("score", 42i64));

    let outcome = rt
        .execute("report", vec![("x".into(), e.clone().into())])
        .unwrap();

    assert_eq!(
        outcome.single().attribute_source("copied"),
        Some(&Provenance::Borrowed(e.ecs_id()))
    );
}

#[test]
fn execution_record_audits_the_call() {
    let rt = runtime();
    register_update_field(&rt);
    let e = promoted(&rt, rt.create("Counter").with_field("v", 3i64));

    let outcome = rt
        .execute("update_field", vec![("x".into(), e.into())])
        .unwrap();

    let record = rt.fetch(outcome.record_id).unwrap();
    assert_eq!(record.kind(), EXECUTION_RECORD_KIND);
    assert_eq!(record.get_str("function").unwrap(), "update_field");
    assert_eq!(record.get_str("strategy").unwrap(), "single-record");
    assert!(record.get_bool("success").unwrap());
    match record.field("classifications").unwrap() {
        Value::List(cs) => assert_eq!(cs[0], Value::Str("mutation".into())),
        other => panic!("expected classification list, got {}", other.kind_name()),
    }
}

#[test]
fn failed_call_surfaces_after_failed_event() {
    let rt = runtime();
    rt.register(
        CallableSpec::new("fail").param("x", TypeTag::Entity(None)),
        |_| {
            Err(khepri::error::ExecError::ExecutionFailure {
                function: "fail".into(),
                message: "boom".into(),
            }
            .into())
        },
    )
    .unwrap();
    let e = promoted(&rt, rt.create("Counter").with_field("v", 1i64));

    let err = rt.execute("fail", vec![("x".into(), e.into())]).unwrap_err();
    assert!(err.to_string().contains("boom"));

    let events = rt.recent_events(16);
    assert_eq!(events.last().unwrap().kind, EventKind::Failed);
    // The failed call still left an execution record.
    let records = rt.lineages_of_kind(EXECUTION_RECORD_KIND);
    assert_eq!(records.len(), 1);
    let record = rt.latest_root(records[0]).unwrap();
    assert!(!record.get_bool("success").unwrap());
}

#[test]
fn detach_and_attach_move_entities_between_trees() {
    let rt = runtime();
    let mut root = rt.create("Folder");
    root.set_field("doc", rt.create("Doc").with_field("title", "draft"));
    let root = promoted(&rt, root);
    let target = promoted(&rt, rt.create("Folder").with_field("name", "archive"));

    let mut doc = rt
        .fetch(root.get_entity("doc").unwrap().ecs_id())
        .unwrap();
    rt.detach(&mut doc).unwrap();
    assert!(doc.is_root());

    rt.attach(&mut doc, target.ecs_id(), "doc").unwrap();
    let archived = rt.latest_root(target.lineage_id()).unwrap();
    assert_eq!(
        archived.get_entity("doc").unwrap().get_str("title").unwrap(),
        "draft"
    );
}

#[test]
fn borrow_field_from_tracks_the_source() {
    let rt = runtime();
    let src = promoted(&rt, rt.create("Student").with_field("score", 42i64));

    let mut report = rt.create("Report");
    report.borrow_field_from(&src, "score", "score").unwrap();
    assert_eq!(
        report.attribute_source("score"),
        Some(&Provenance::Borrowed(src.ecs_id()))
    );
}

#[test]
fn list_and_metadata_expose_registrations() {
    let rt = runtime();
    register_update_field(&rt);

    assert_eq!(rt.list_callables(), vec!["update_field"]);
    let meta = rt.callable_metadata("update_field").unwrap();
    assert_eq!(meta.input_shape.type_name, "update_field:Input");
    assert_eq!(meta.expected_output_count, Some(1));
}
