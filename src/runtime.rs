//! Runtime facade: top-level API for the khepri system.
//!
//! The `Runtime` owns all subsystems (entity registry, callable registry,
//! event bus, execution engine) behind `Arc` handles and provides the
//! public interface for entity lifecycle, function execution, and event
//! subscription. Runtimes are ordinary values: construct as many isolated
//! instances per process as tests or tenants need.

use std::sync::Arc;
use std::time::Duration;

use crate::address;
use crate::callable::{CallableMeta, CallableRegistry, CallableSpec, Invocation};
use crate::entity::{EcsId, Entity, LineageId, Value};
use crate::error::{ConfigError, KhepriResult};
use crate::event::bus::{Handler, Matcher, SubscriptionHandle};
use crate::event::{Event, EventBus, EventContext, EventId, EventKind, ScopeEntry};
use crate::exec::{CallArgs, CallOptions, ExecOutcome, ExecSettings, ExecutionEngine};
use crate::registry::EntityRegistry;
use crate::tree::{EntityTree, TreeLimits};

use futures_util::future::BoxFuture;

/// Configuration for a khepri runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum entity nesting depth per tree.
    pub max_tree_depth: usize,
    /// Maximum entities per tree.
    pub max_tree_nodes: usize,
    /// Maximum concurrent async invocations.
    pub max_in_flight: usize,
    /// Maximum event-scope nesting depth.
    pub max_context_depth: usize,
    /// Unpack list/map outputs positionally unless the call overrides.
    pub default_force_unpack: bool,
    /// Default async call budget; `None` means unbounded.
    pub call_timeout: Option<Duration>,
    /// Event-log retention window (number of events).
    pub event_log_capacity: usize,
    /// Concurrency bound for async subscriber fan-out.
    pub fanout_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tree_depth: 64,
            max_tree_nodes: 100_000,
            max_in_flight: 64,
            max_context_depth: 256,
            default_force_unpack: false,
            call_timeout: None,
            event_log_capacity: 4096,
            fanout_concurrency: 16,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> KhepriResult<()> {
        let nonzero = [
            ("max_tree_depth", self.max_tree_depth),
            ("max_tree_nodes", self.max_tree_nodes),
            ("max_in_flight", self.max_in_flight),
            ("max_context_depth", self.max_context_depth),
            ("event_log_capacity", self.event_log_capacity),
            ("fanout_concurrency", self.fanout_concurrency),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    message: format!("{name} must be > 0"),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// The khepri entity-native runtime.
///
/// Owns all subsystems: entity registry, callable registry, event bus,
/// and execution engine.
pub struct Runtime {
    config: RuntimeConfig,
    entities: Arc<EntityRegistry>,
    callables: Arc<CallableRegistry>,
    bus: Arc<EventBus>,
    engine: ExecutionEngine,
    ctx: EventContext,
}

impl Runtime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> KhepriResult<Self> {
        config.validate()?;

        tracing::info!(
            max_tree_depth = config.max_tree_depth,
            max_tree_nodes = config.max_tree_nodes,
            max_in_flight = config.max_in_flight,
            "initializing khepri runtime"
        );

        let entities = Arc::new(EntityRegistry::new(TreeLimits {
            max_depth: config.max_tree_depth,
            max_nodes: config.max_tree_nodes,
        }));
        let callables = Arc::new(CallableRegistry::new());
        let bus = Arc::new(EventBus::new(
            config.event_log_capacity,
            config.fanout_concurrency,
        ));
        let engine = ExecutionEngine::new(
            Arc::clone(&entities),
            Arc::clone(&callables),
            Arc::clone(&bus),
            ExecSettings {
                default_force_unpack: config.default_force_unpack,
                call_timeout: config.call_timeout,
                max_in_flight: config.max_in_flight,
            },
        );
        let ctx = EventContext::new(config.max_context_depth);

        Ok(Self {
            config,
            entities,
            callables,
            bus,
            engine,
            ctx,
        })
    }

    // -----------------------------------------------------------------------
    // Entity operations
    // -----------------------------------------------------------------------

    /// Create a local (unattached) entity. Nothing is registered until
    /// [`Runtime::promote`].
    pub fn create(&self, kind: impl Into<String>) -> Entity {
        Entity::new(kind)
    }

    /// Promote an entity to a root: register its tree and emit `created`.
    pub fn promote(&self, entity: &mut Entity) -> KhepriResult<EcsId> {
        let root = self.entities.register_root(entity)?;
        let event = Event::new(EventKind::Created, entity.kind().to_string())
            .with_subject(root, entity.lineage_id());
        self.bus.emit_in(&self.ctx, event);
        Ok(root)
    }

    /// Version a live root: fork the modified path and emit `modified`
    /// when anything changed. Returns the old → new identity mapping.
    pub fn version(&self, entity: &mut Entity) -> KhepriResult<Vec<(EcsId, EcsId)>> {
        let mapping = self.entities.version_root(entity)?;
        if !mapping.is_empty() {
            let event = Event::new(EventKind::Modified, entity.kind().to_string())
                .with_subject(entity.ecs_id(), entity.lineage_id())
                .with_metadata("forked", mapping.len() as i64);
            self.bus.emit_in(&self.ctx, event);
        }
        Ok(mapping)
    }

    /// Fetch a stored entity by id (always a fresh deep copy).
    pub fn fetch(&self, ecs_id: EcsId) -> KhepriResult<Entity> {
        self.entities.fetch_entity(ecs_id)
    }

    /// Fetch a stored tree snapshot by root id (always a deep copy).
    pub fn fetch_tree(&self, root_ecs_id: EcsId) -> KhepriResult<EntityTree> {
        self.entities.fetch_tree(root_ecs_id)
    }

    /// Resolve a (possibly historical) id to the current version.
    pub fn current_version_of(&self, ecs_id: EcsId) -> KhepriResult<Entity> {
        self.entities.current_version_of(ecs_id)
    }

    /// The newest root version of a lineage.
    pub fn latest_root(&self, lineage_id: LineageId) -> KhepriResult<Entity> {
        self.entities.latest_root(lineage_id)
    }

    /// Chronological root-version chain of a lineage.
    pub fn lineage_history(&self, lineage_id: LineageId) -> Vec<EcsId> {
        self.entities.lineage_history(lineage_id)
    }

    /// Lineages whose trees ever contained the given kind.
    pub fn lineages_of_kind(&self, kind: &str) -> Vec<LineageId> {
        self.entities.lineages_of_kind(kind)
    }

    /// Remove an attached entity from its tree and promote it to a root.
    /// Emits `state-transition`.
    pub fn detach(&self, entity: &mut Entity) -> KhepriResult<()> {
        self.entities.detach(entity)?;
        let event = Event::new(EventKind::StateTransition, entity.kind().to_string())
            .with_subject(entity.ecs_id(), entity.lineage_id())
            .with_metadata("transition", "detached");
        self.bus.emit_in(&self.ctx, event);
        Ok(())
    }

    /// Reparent an entity under a new root in the given field. Emits
    /// `state-transition`.
    pub fn attach(
        &self,
        entity: &mut Entity,
        new_root_ecs: EcsId,
        field: &str,
    ) -> KhepriResult<()> {
        self.entities.attach(entity, new_root_ecs, field)?;
        let event = Event::new(EventKind::StateTransition, entity.kind().to_string())
            .with_subject(entity.ecs_id(), entity.lineage_id())
            .with_metadata("transition", "attached")
            .with_context_ids(vec![new_root_ecs]);
        self.bus.emit_in(&self.ctx, event);
        Ok(())
    }

    /// Resolve an address string against the registry.
    pub fn resolve(&self, address: &str) -> KhepriResult<Value> {
        address::resolve_address(&self.entities, address)
    }

    // -----------------------------------------------------------------------
    // Callable operations
    // -----------------------------------------------------------------------

    /// Register a synchronous transform.
    pub fn register(
        &self,
        spec: CallableSpec,
        body: impl Fn(Invocation) -> KhepriResult<Value> + Send + Sync + 'static,
    ) -> KhepriResult<CallableMeta> {
        self.callables.register(spec, body)
    }

    /// Register an asynchronous transform.
    pub fn register_async(
        &self,
        spec: CallableSpec,
        body: impl Fn(Invocation) -> BoxFuture<'static, KhepriResult<Value>>
        + Send
        + Sync
        + 'static,
    ) -> KhepriResult<CallableMeta> {
        self.callables.register_async(spec, body)
    }

    /// Execute a registered function synchronously on the runtime's own
    /// context (nested calls made from function bodies through the same
    /// runtime link under the caller's scope).
    pub fn execute(&self, name: &str, args: CallArgs) -> KhepriResult<ExecOutcome> {
        self.engine.execute(&self.ctx, name, args, CallOptions::default())
    }

    /// Synchronous execution with per-call options.
    pub fn execute_with(
        &self,
        name: &str,
        args: CallArgs,
        opts: CallOptions,
    ) -> KhepriResult<ExecOutcome> {
        self.engine.execute(&self.ctx, name, args, opts)
    }

    /// Execute asynchronously. Each call gets a fork of the current
    /// context, so concurrent invocations cannot leak parentage into one
    /// another.
    pub async fn execute_async(&self, name: &str, args: CallArgs) -> KhepriResult<ExecOutcome> {
        let ctx = self.ctx.fork();
        self.engine
            .execute_async(&ctx, name, args, CallOptions::default())
            .await
    }

    /// Async execution with per-call options.
    pub async fn execute_async_with(
        &self,
        name: &str,
        args: CallArgs,
        opts: CallOptions,
    ) -> KhepriResult<ExecOutcome> {
        let ctx = self.ctx.fork();
        self.engine.execute_async(&ctx, name, args, opts).await
    }

    /// Async execution on an explicit context (for nested async scopes).
    pub async fn execute_async_in(
        &self,
        ctx: &EventContext,
        name: &str,
        args: CallArgs,
        opts: CallOptions,
    ) -> KhepriResult<ExecOutcome> {
        self.engine.execute_async(ctx, name, args, opts).await
    }

    /// Names of all registered callables.
    pub fn list_callables(&self) -> Vec<String> {
        self.callables.list()
    }

    /// Metadata for one registered callable.
    pub fn callable_metadata(&self, name: &str) -> KhepriResult<CallableMeta> {
        self.callables.metadata(name)
    }

    // -----------------------------------------------------------------------
    // Event operations
    // -----------------------------------------------------------------------

    /// Subscribe to events.
    pub fn subscribe(&self, matcher: Matcher, handler: Handler) -> SubscriptionHandle {
        self.bus.subscribe(matcher, handler)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Emit an event with parent linkage from the runtime context.
    pub fn emit(&self, event: Event) -> EventId {
        self.bus.emit_in(&self.ctx, event)
    }

    /// The currently active parent scope, if any.
    pub fn current_parent(&self) -> Option<ScopeEntry> {
        self.ctx.current_parent()
    }

    /// Manually open a scope (prefer the scoped wrappers in
    /// [`crate::event::context`]).
    pub fn push_context(&self, event: &Event) -> KhepriResult<()> {
        self.ctx.push(event)
    }

    /// Manually close the active scope.
    pub fn pop_context(&self) -> KhepriResult<ScopeEntry> {
        self.ctx.pop()
    }

    /// The most recent `n` events in the retention window.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.bus.recent(n)
    }

    /// Retained events about one subject entity.
    pub fn events_for_subject(&self, subject_id: EcsId) -> Vec<Event> {
        self.bus.events_for_subject(subject_id)
    }

    // -----------------------------------------------------------------------
    // Handles & introspection
    // -----------------------------------------------------------------------

    /// The entity registry handle.
    pub fn entities(&self) -> &Arc<EntityRegistry> {
        &self.entities
    }

    /// The callable registry handle.
    pub fn callables(&self) -> &Arc<CallableRegistry> {
        &self.callables
    }

    /// The event bus handle.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The runtime's root event context.
    pub fn context(&self) -> &EventContext {
        &self.ctx
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Summary of the runtime state.
    pub fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            tree_count: self.entities.tree_count(),
            lineage_count: self.entities.lineage_count(),
            kind_count: self.entities.kind_count(),
            callable_count: self.callables.len(),
            subscription_count: self.bus.subscription_count(),
            event_log_len: self.bus.log_len(),
            context_depth: self.ctx.depth(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default()).expect("default configuration is valid")
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("entities", &self.entities)
            .field("callables", &self.callables)
            .finish()
    }
}

/// Summary information about a runtime's state.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub tree_count: usize,
    pub lineage_count: usize,
    pub kind_count: usize,
    pub callable_count: usize,
    pub subscription_count: usize,
    pub event_log_len: usize,
    pub context_depth: usize,
}

impl std::fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "khepri runtime info")?;
        writeln!(f, "  tree snapshots:  {}", self.tree_count)?;
        writeln!(f, "  lineages:        {}", self.lineage_count)?;
        writeln!(f, "  entity kinds:    {}", self.kind_count)?;
        writeln!(f, "  callables:       {}", self.callable_count)?;
        writeln!(f, "  subscriptions:   {}", self.subscription_count)?;
        writeln!(f, "  retained events: {}", self.event_log_len)?;
        writeln!(f, "  context depth:   {}", self.context_depth)?;
        Ok(())
    }
}
