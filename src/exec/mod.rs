//! Execution engine: dispatching registered transforms over entities.
//!
//! A call flows through five stages: address resolution, strategy
//! selection, input preparation (copy-on-read with an identity map),
//! the function body (sync, or async with timeout and cancellation), and
//! finalization (output validation, semantic classification, result
//! shaping, provenance stitching, execution record, lifecycle events).
//!
//! Every failure after the callable lookup still produces an execution
//! record and a `failed` event before surfacing to the caller.

pub mod classify;
pub mod output;
pub mod record;

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::address::Address;
use crate::callable::{
    CallableFn, CallableMeta, CallableRegistry, Invocation, OutputPattern, TypeTag,
};
use crate::entity::copy::{collect_nodes, copy_for_read};
use crate::entity::{EcsId, Entity, IdentityMap, LiveId, Value};
use crate::error::{ExecError, KhepriResult};
use crate::event::{Event, EventBus, EventContext, EventKind};
use crate::registry::EntityRegistry;
use crate::tree::TreeLimits;

pub use classify::{Classification, Classifier, RawVerdict};
pub use output::WRAPPER_PAYLOAD_FIELD;
pub use record::{EXECUTION_RECORD_KIND, ExecutionRecord};

/// One argument at the call site: a direct value, a direct record, or a
/// late-resolved address string.
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    Entity(Entity),
    Address(String),
}

impl From<Value> for CallArg {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Entity> for CallArg {
    fn from(e: Entity) -> Self {
        Self::Entity(e)
    }
}

impl From<i64> for CallArg {
    fn from(v: i64) -> Self {
        Self::Value(Value::Int(v))
    }
}

impl From<bool> for CallArg {
    fn from(v: bool) -> Self {
        Self::Value(Value::Bool(v))
    }
}

impl From<f64> for CallArg {
    fn from(v: f64) -> Self {
        Self::Value(Value::Float(v))
    }
}

impl From<&str> for CallArg {
    fn from(v: &str) -> Self {
        // String arguments that look like addresses resolve late; plain
        // strings stay values.
        if Address::looks_like(v) {
            Self::Address(v.to_string())
        } else {
            Self::Value(Value::Str(v.to_string()))
        }
    }
}

/// Named arguments for one call.
pub type CallArgs = Vec<(String, CallArg)>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Force positional unpacking of list/map outputs for this call.
    pub force_unpack: Option<bool>,
    /// Per-call timeout override (async only).
    pub timeout: Option<Duration>,
}

/// How the engine runs one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStrategy {
    /// Exactly one record parameter, no config.
    SingleRecord,
    /// One record plus a (possibly synthesized) configuration entity.
    RecordWithConfig,
    /// Multiple record parameters, each copy-isolated.
    MultiRecordTransactional,
    /// Scalar parameters only, typically sourced from records via
    /// addresses.
    Borrow,
}

impl std::fmt::Display for ExecStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecStrategy::SingleRecord => "single-record",
            ExecStrategy::RecordWithConfig => "record-with-config",
            ExecStrategy::MultiRecordTransactional => "multi-record-transactional",
            ExecStrategy::Borrow => "borrow",
        };
        write!(f, "{name}")
    }
}

/// Engine tunables, sourced from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// Unpack list/map outputs positionally unless the call says otherwise.
    pub default_force_unpack: bool,
    /// Default async call budget; `None` means unbounded.
    pub call_timeout: Option<Duration>,
    /// Maximum concurrent async invocations.
    pub max_in_flight: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            default_force_unpack: false,
            call_timeout: None,
            max_in_flight: 64,
        }
    }
}

/// What a completed call hands back: the output entities (every value
/// leaving the engine is an entity), their classifications, and the
/// promoted execution record.
#[derive(Debug)]
pub struct ExecOutcome {
    pub outputs: Vec<Entity>,
    pub classifications: Vec<Classification>,
    pub record_id: EcsId,
    pub strategy: ExecStrategy,
}

impl ExecOutcome {
    /// The single output of a single-output call.
    pub fn single(&self) -> &Entity {
        &self.outputs[0]
    }

    /// Move the outputs out.
    pub fn into_outputs(self) -> Vec<Entity> {
        self.outputs
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The execution engine. Owns nothing exclusively; all state lives in the
/// shared registries and the bus.
pub struct ExecutionEngine {
    entities: Arc<EntityRegistry>,
    callables: Arc<CallableRegistry>,
    bus: Arc<EventBus>,
    settings: ExecSettings,
    in_flight: Arc<Semaphore>,
}

/// Everything input preparation produces.
struct Prepared {
    invocation: Invocation,
    identity_map: IdentityMap,
    snapshots: BTreeMap<LiveId, Entity>,
    input_ids: Vec<EcsId>,
    strategy: ExecStrategy,
}

impl ExecutionEngine {
    /// Create an engine over shared registries and a bus.
    pub fn new(
        entities: Arc<EntityRegistry>,
        callables: Arc<CallableRegistry>,
        bus: Arc<EventBus>,
        settings: ExecSettings,
    ) -> Self {
        let max_in_flight = settings.max_in_flight.max(1);
        Self {
            entities,
            callables,
            bus,
            settings,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// Execute a registered function synchronously.
    pub fn execute(
        &self,
        ctx: &EventContext,
        name: &str,
        args: CallArgs,
        opts: CallOptions,
    ) -> KhepriResult<ExecOutcome> {
        let callable = self.callables.get(name)?;
        let meta = callable.meta.clone();
        let force_unpack = opts
            .force_unpack
            .unwrap_or(self.settings.default_force_unpack);
        let started = Instant::now();

        let mut opening = Event::new(EventKind::Processing, meta.name.clone())
            .with_metadata("function", meta.name.as_str());
        ctx.link(&mut opening);
        ctx.push(&opening)?;
        self.bus.emit(opening);

        let (result, strategy, input_ids) =
            self.run_sync(&meta, &callable.body, args, force_unpack);
        let outcome = self.seal(
            ctx,
            &meta,
            result,
            strategy,
            input_ids,
            started.elapsed().as_millis() as u64,
        );
        ctx.pop()?;
        outcome
    }

    /// Execute a registered function asynchronously, with timeout and
    /// cancellation semantics. Dropping the returned future mid-flight
    /// discards the input copies, creates no execution record for the
    /// body, and emits the `failed` event (`reason=cancelled`) as the
    /// scope closes.
    pub async fn execute_async(
        &self,
        ctx: &EventContext,
        name: &str,
        args: CallArgs,
        opts: CallOptions,
    ) -> KhepriResult<ExecOutcome> {
        let callable = self.callables.get(name)?;
        let meta = callable.meta.clone();
        let force_unpack = opts
            .force_unpack
            .unwrap_or(self.settings.default_force_unpack);
        let budget = opts.timeout.or(self.settings.call_timeout);

        let _permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecError::InFlightLimit {
                max_in_flight: self.settings.max_in_flight,
            })?;
        let started = Instant::now();

        let mut opening = Event::new(EventKind::Processing, meta.name.clone())
            .with_metadata("function", meta.name.as_str());
        ctx.link(&mut opening);
        ctx.push(&opening)?;
        self.bus.emit(opening);

        let mut guard = CancelGuard {
            bus: self.bus.as_ref(),
            ctx,
            function: meta.name.clone(),
            armed: true,
        };

        // Suspension point before address resolution begins.
        tokio::task::yield_now().await;
        let (result, strategy, input_ids) = self
            .run_async(&meta, &callable.body, args, force_unpack, budget)
            .await;
        // Suspension point before finalization.
        tokio::task::yield_now().await;

        guard.armed = false;
        let outcome = self.seal(
            ctx,
            &meta,
            result,
            strategy,
            input_ids,
            started.elapsed().as_millis() as u64,
        );
        ctx.pop()?;
        outcome
    }

    // -----------------------------------------------------------------------
    // Call body paths
    // -----------------------------------------------------------------------

    fn run_sync(
        &self,
        meta: &CallableMeta,
        body: &CallableFn,
        args: CallArgs,
        force_unpack: bool,
    ) -> (
        KhepriResult<(Vec<Entity>, Vec<Classification>)>,
        Option<ExecStrategy>,
        Vec<EcsId>,
    ) {
        let prepared = match self.prepare(meta, args) {
            Ok(p) => p,
            Err(e) => return (Err(e), None, Vec::new()),
        };
        let strategy = prepared.strategy;
        let input_ids = prepared.input_ids.clone();

        let returned = match body {
            CallableFn::Sync(f) => run_body_sync(&meta.name, f, prepared.invocation),
            CallableFn::Async(_) => Err(ExecError::ExecutionFailure {
                function: meta.name.clone(),
                message: "async callable requires execute_async".to_string(),
            }
            .into()),
        };

        let result = returned.and_then(|value| {
            self.finalize(
                meta,
                force_unpack,
                &prepared.identity_map,
                &prepared.snapshots,
                value,
            )
        });
        (result, Some(strategy), input_ids)
    }

    async fn run_async(
        &self,
        meta: &CallableMeta,
        body: &CallableFn,
        args: CallArgs,
        force_unpack: bool,
        budget: Option<Duration>,
    ) -> (
        KhepriResult<(Vec<Entity>, Vec<Classification>)>,
        Option<ExecStrategy>,
        Vec<EcsId>,
    ) {
        let prepared = match self.prepare(meta, args) {
            Ok(p) => p,
            Err(e) => return (Err(e), None, Vec::new()),
        };
        let strategy = prepared.strategy;
        let input_ids = prepared.input_ids.clone();

        let returned = match body {
            CallableFn::Sync(f) => run_body_sync(&meta.name, f, prepared.invocation),
            CallableFn::Async(f) => {
                let fut = f(prepared.invocation);
                match budget {
                    Some(d) => match tokio::time::timeout(d, fut).await {
                        Ok(r) => r.map_err(|e| {
                            ExecError::ExecutionFailure {
                                function: meta.name.clone(),
                                message: e.to_string(),
                            }
                            .into()
                        }),
                        Err(_) => Err(ExecError::Timeout {
                            function: meta.name.clone(),
                            budget_ms: d.as_millis() as u64,
                        }
                        .into()),
                    },
                    None => fut.await.map_err(|e| {
                        ExecError::ExecutionFailure {
                            function: meta.name.clone(),
                            message: e.to_string(),
                        }
                        .into()
                    }),
                }
            }
        };

        let result = returned.and_then(|value| {
            self.finalize(
                meta,
                force_unpack,
                &prepared.identity_map,
                &prepared.snapshots,
                value,
            )
        });
        (result, Some(strategy), input_ids)
    }

    // -----------------------------------------------------------------------
    // Preparation
    // -----------------------------------------------------------------------

    fn prepare(&self, meta: &CallableMeta, args: CallArgs) -> KhepriResult<Prepared> {
        let limits = *self.entities.limits();
        let mut identity_map = IdentityMap::new();
        let mut snapshots: BTreeMap<LiveId, Entity> = BTreeMap::new();
        let mut input_ids = Vec::new();

        // 1. Resolve addresses. Record arguments are bound-checked and
        //    copy-isolated the moment they enter: a direct entity from the
        //    caller has never been through tree construction, so nothing
        //    may recurse over it before the bounded copy accepts it.
        let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
        for (name, arg) in args {
            let value = match arg {
                CallArg::Address(addr) => Address::parse(&addr)?.resolve(&self.entities)?,
                CallArg::Value(Value::Str(s)) if Address::looks_like(&s) => {
                    Address::parse(&s)?.resolve(&self.entities)?
                }
                CallArg::Value(v) => v,
                CallArg::Entity(e) => Value::from(e),
            };
            let value = match value {
                Value::Entity(e) => self.isolate_record(
                    &meta.name,
                    &e,
                    &limits,
                    &mut identity_map,
                    &mut snapshots,
                    &mut input_ids,
                )?,
                v => v,
            };
            resolved.insert(name, value);
        }

        // 2. Bundle loose primitives into a configuration entity when the
        //    callable declares a config parameter.
        if let Some(config_kind) = &meta.config_kind {
            let config_param = meta
                .params
                .iter()
                .find(|p| matches!(p.tag, TypeTag::Config(_)))
                .map(|p| p.name.clone())
                .expect("config kind implies a config parameter");

            let has_explicit = matches!(resolved.get(&config_param), Some(Value::Entity(_)));
            if !has_explicit {
                let declared: std::collections::BTreeSet<&str> =
                    meta.params.iter().map(|p| p.name.as_str()).collect();
                let loose: Vec<String> = resolved
                    .keys()
                    .filter(|k| !declared.contains(k.as_str()))
                    .cloned()
                    .collect();
                let mut config = Entity::new(config_kind.clone());
                for key in loose {
                    let value = resolved.remove(&key).expect("key listed above");
                    config.set_field(key, value);
                }
                self.entities.register_root(&mut config)?;
                let value = self.isolate_record(
                    &meta.name,
                    &config,
                    &limits,
                    &mut identity_map,
                    &mut snapshots,
                    &mut input_ids,
                )?;
                resolved.insert(config_param, value);
            }
        }

        // 3. Bind declared parameters, applying defaults and type checks.
        //    An entity-valued default goes through the same isolation as a
        //    passed argument.
        let mut bound: BTreeMap<String, Value> = BTreeMap::new();
        for param in &meta.params {
            let value = match resolved.remove(&param.name) {
                Some(v) => v,
                None => match &param.default {
                    Some(Value::Entity(e)) => self.isolate_record(
                        &meta.name,
                        e,
                        &limits,
                        &mut identity_map,
                        &mut snapshots,
                        &mut input_ids,
                    )?,
                    Some(d) => d.clone(),
                    None => {
                        return Err(ExecError::MissingArgument {
                            function: meta.name.clone(),
                            name: param.name.clone(),
                        }
                        .into());
                    }
                },
            };
            if !param.tag.matches(&value) {
                return Err(ExecError::ArgumentType {
                    name: param.name.clone(),
                    declared: param.tag.to_string(),
                    actual: value.kind_name().to_string(),
                }
                .into());
            }
            bound.insert(param.name.clone(), value);
        }
        if let Some((name, value)) = resolved.into_iter().next() {
            return Err(ExecError::ArgumentType {
                name,
                declared: "(not a declared parameter)".to_string(),
                actual: value.kind_name().to_string(),
            }
            .into());
        }

        // 4. Strategy selection.
        let record_count = meta
            .params
            .iter()
            .filter(|p| matches!(p.tag, TypeTag::Entity(_)))
            .filter(|p| matches!(bound.get(&p.name), Some(Value::Entity(_))))
            .count();
        let strategy = if record_count == 0 {
            ExecStrategy::Borrow
        } else if record_count > 1 {
            ExecStrategy::MultiRecordTransactional
        } else if meta.uses_config_entity {
            ExecStrategy::RecordWithConfig
        } else {
            ExecStrategy::SingleRecord
        };

        tracing::debug!(
            function = %meta.name,
            strategy = %strategy,
            inputs = input_ids.len(),
            "prepared invocation"
        );

        Ok(Prepared {
            invocation: Invocation::new(bound),
            identity_map,
            snapshots,
            input_ids,
            strategy,
        })
    }

    /// Copy-isolate one record argument: the bounded copy-on-read runs
    /// first, its identity map and pristine snapshots are recorded, and
    /// the body only ever sees the copy. A tree past the configured
    /// limits fails with [`ExecError::CopyFailure`].
    fn isolate_record(
        &self,
        function: &str,
        entity: &Entity,
        limits: &TreeLimits,
        identity_map: &mut IdentityMap,
        snapshots: &mut BTreeMap<LiveId, Entity>,
        input_ids: &mut Vec<EcsId>,
    ) -> KhepriResult<Value> {
        input_ids.push(entity.ecs_id());
        let (copy, map) = copy_for_read(entity, limits).map_err(|e| ExecError::CopyFailure {
            function: function.to_string(),
            message: e.to_string(),
        })?;
        identity_map.merge(map);
        for node in collect_nodes(&copy) {
            snapshots.insert(node.live_id(), node.clone());
        }
        Ok(Value::from(copy))
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    fn finalize(
        &self,
        meta: &CallableMeta,
        force_unpack: bool,
        identity_map: &IdentityMap,
        snapshots: &BTreeMap<LiveId, Entity>,
        returned: Value,
    ) -> KhepriResult<(Vec<Entity>, Vec<Classification>)> {
        output::validate_output(meta, &returned)?;
        let classifier = Classifier::new(identity_map, snapshots, &meta.name);

        let unpack = match meta.output_pattern {
            OutputPattern::Single => {
                let Value::Entity(entity) = returned else {
                    unreachable!("validated as single entity");
                };
                let (entity, classification) =
                    self.process_output(*entity, &classifier, identity_map, snapshots)?;
                return Ok((vec![entity], vec![classification]));
            }
            OutputPattern::Tuple => meta.supports_unpacking,
            OutputPattern::List | OutputPattern::Map => {
                meta.supports_unpacking || force_unpack
            }
            _ => false,
        };

        if unpack {
            let elements: Vec<Entity> = match returned {
                Value::Tuple(vs) | Value::List(vs) => vs
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Entity(e) => Some(*e),
                        _ => None,
                    })
                    .collect(),
                Value::Map(m) => m
                    .into_values()
                    .filter_map(|v| match v {
                        Value::Entity(e) => Some(*e),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };

            // Classify and apply mutations first so sibling links use
            // final identities; creations register after linking.
            let mut processed: Vec<(Entity, Classification, bool)> = Vec::new();
            for entity in elements {
                let verdict = classifier.classify(&entity)?;
                match verdict {
                    RawVerdict::Mutation => {
                        let mut entity = entity;
                        output::stitch_provenance(&mut entity, identity_map, snapshots);
                        let classification = self.apply_mutation(&mut entity)?;
                        processed.push((entity, classification, false));
                    }
                    RawVerdict::PassThrough { ecs_id } => {
                        processed.push((entity, Classification::PassThrough { ecs_id }, false));
                    }
                    RawVerdict::Creation => {
                        let mut e = entity;
                        output::stitch_provenance(&mut e, identity_map, snapshots);
                        let ecs_id = e.ecs_id();
                        processed.push((e, Classification::Creation { ecs_id }, true));
                    }
                }
            }

            let mut outputs: Vec<Entity> = processed.iter().map(|(e, _, _)| e.clone()).collect();
            output::link_siblings(&mut outputs);
            let mut classifications = Vec::with_capacity(processed.len());
            for (output, (_, classification, needs_registration)) in
                outputs.iter_mut().zip(processed)
            {
                if needs_registration {
                    self.entities.register_root(output)?;
                }
                classifications.push(classification);
            }
            return Ok((outputs, classifications));
        }

        // Wrapper path: mutations inside the returned structure still
        // version their lineages; creations stay embedded in the wrapper.
        let mut returned = returned;
        let mut classifications = self.process_embedded(&mut returned, &classifier)?;
        let mut wrapper = output::wrap_output(meta, returned);
        output::stitch_provenance(&mut wrapper, identity_map, snapshots);
        let wrapper_id = self.entities.register_root(&mut wrapper)?;
        classifications.push(Classification::Creation { ecs_id: wrapper_id });
        Ok((vec![wrapper], classifications))
    }

    /// Classify-and-apply one top-level output entity.
    fn process_output(
        &self,
        entity: Entity,
        classifier: &Classifier<'_>,
        identity_map: &IdentityMap,
        snapshots: &BTreeMap<LiveId, Entity>,
    ) -> KhepriResult<(Entity, Classification)> {
        let verdict = classifier.classify(&entity)?;
        match verdict {
            RawVerdict::PassThrough { ecs_id } => {
                Ok((entity, Classification::PassThrough { ecs_id }))
            }
            RawVerdict::Mutation => {
                let mut entity = entity;
                output::stitch_provenance(&mut entity, identity_map, snapshots);
                let classification = self.apply_mutation(&mut entity)?;
                Ok((entity, classification))
            }
            RawVerdict::Creation => {
                let mut entity = entity;
                output::stitch_provenance(&mut entity, identity_map, snapshots);
                let ecs_id = self.entities.register_root(&mut entity)?;
                Ok((entity, Classification::Creation { ecs_id }))
            }
        }
    }

    /// Version a mutated input: fork through the registry when its base is
    /// a registered root, otherwise promote the fork as a new root of the
    /// same lineage.
    fn apply_mutation(&self, entity: &mut Entity) -> KhepriResult<Classification> {
        let old_ecs_id = entity.ecs_id();
        if self.entities.contains_root(old_ecs_id) {
            self.entities.version_root(entity)?;
        } else {
            entity.clear_root();
            entity.fork_identity();
            entity.mark_root();
            self.entities.register_root(entity)?;
        }
        Ok(Classification::Mutation {
            old_ecs_id,
            new_ecs_id: entity.ecs_id(),
        })
    }

    /// Classify entities embedded in a to-be-wrapped container (without
    /// descending into other entities). Mutations version in place;
    /// creations become part of the wrapper's tree.
    fn process_embedded(
        &self,
        value: &mut Value,
        classifier: &Classifier<'_>,
    ) -> KhepriResult<Vec<Classification>> {
        let mut classifications = Vec::new();
        self.process_embedded_inner(value, classifier, &mut classifications)?;
        Ok(classifications)
    }

    fn process_embedded_inner(
        &self,
        value: &mut Value,
        classifier: &Classifier<'_>,
        out: &mut Vec<Classification>,
    ) -> KhepriResult<()> {
        match value {
            Value::Entity(entity) => {
                let verdict = classifier.classify(entity)?;
                match verdict {
                    RawVerdict::PassThrough { ecs_id } => {
                        out.push(Classification::PassThrough { ecs_id });
                    }
                    RawVerdict::Mutation => {
                        out.push(self.apply_mutation(entity)?);
                    }
                    RawVerdict::Creation => {
                        out.push(Classification::Creation {
                            ecs_id: entity.ecs_id(),
                        });
                    }
                }
            }
            Value::List(vs) | Value::Tuple(vs) | Value::Set(vs) => {
                for v in vs {
                    self.process_embedded_inner(v, classifier, out)?;
                }
            }
            Value::Map(m) => {
                for v in m.values_mut() {
                    self.process_embedded_inner(v, classifier, out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sealing: record + closing event
    // -----------------------------------------------------------------------

    fn seal(
        &self,
        ctx: &EventContext,
        meta: &CallableMeta,
        result: KhepriResult<(Vec<Entity>, Vec<Classification>)>,
        strategy: Option<ExecStrategy>,
        input_ids: Vec<EcsId>,
        duration_ms: u64,
    ) -> KhepriResult<ExecOutcome> {
        let strategy = strategy.unwrap_or(ExecStrategy::Borrow);
        let mut record = ExecutionRecord::started(&meta.name, strategy);
        record.input_ids = input_ids;
        record.duration_ms = duration_ms;

        match result {
            Ok((outputs, classifications)) => {
                let output_ids: Vec<EcsId> = outputs.iter().map(Entity::ecs_id).collect();
                record.output_ids = output_ids.clone();
                record.classifications = classifications.clone();
                record.success = true;
                let record_id = record.promote(&self.entities)?;

                let processed = Event::new(EventKind::Processed, meta.name.clone())
                    .with_metadata("function", meta.name.as_str())
                    .with_metadata("strategy", strategy.to_string())
                    .with_context_ids(output_ids)
                    .with_duration_ms(duration_ms);
                self.bus.emit_in(ctx, processed);

                Ok(ExecOutcome {
                    outputs,
                    classifications,
                    record_id,
                    strategy,
                })
            }
            Err(err) => {
                record.success = false;
                record.error = Some(err.to_string());
                if let Err(record_err) = record.promote(&self.entities) {
                    tracing::warn!(
                        function = %meta.name,
                        error = %record_err,
                        "failed to promote execution record for failed call"
                    );
                }

                let failed = Event::new(EventKind::Failed, meta.name.clone())
                    .with_metadata("function", meta.name.as_str())
                    .with_metadata("error", err.to_string())
                    .with_duration_ms(duration_ms);
                self.bus.emit_in(ctx, failed);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

fn run_body_sync(
    function: &str,
    f: &Arc<dyn Fn(Invocation) -> KhepriResult<Value> + Send + Sync>,
    invocation: Invocation,
) -> KhepriResult<Value> {
    match catch_unwind(AssertUnwindSafe(|| f(invocation))) {
        Ok(result) => result.map_err(|e| {
            ExecError::ExecutionFailure {
                function: function.to_string(),
                message: e.to_string(),
            }
            .into()
        }),
        Err(_) => Err(ExecError::ExecutionFailure {
            function: function.to_string(),
            message: "function body panicked".to_string(),
        }
        .into()),
    }
}

/// Emits the cancellation `failed` event and closes the scope if the
/// owning future is dropped before finalization.
struct CancelGuard<'a> {
    bus: &'a EventBus,
    ctx: &'a EventContext,
    function: String,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let failed = Event::new(EventKind::Failed, self.function.clone())
            .with_metadata("function", self.function.as_str())
            .with_metadata("reason", "cancelled");
        self.bus.emit_in(self.ctx, failed);
        let _ = self.ctx.pop();
    }
}
