//! Callable registry: named transforms with their metadata and bodies.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;

use crate::entity::Value;
use crate::error::{CallableError, KhepriResult};

use super::{CallableFn, CallableMeta, CallableSpec, Invocation};

/// One registered transform: derived metadata plus the executable body.
#[derive(Debug, Clone)]
pub struct RegisteredCallable {
    pub meta: CallableMeta,
    pub body: CallableFn,
}

/// Registry of named transforms. Names are unique per registry; a process
/// may hold any number of isolated registries.
pub struct CallableRegistry {
    callables: DashMap<String, Arc<RegisteredCallable>>,
}

impl CallableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            callables: DashMap::new(),
        }
    }

    /// Register a synchronous transform.
    pub fn register(
        &self,
        spec: CallableSpec,
        body: impl Fn(Invocation) -> KhepriResult<Value> + Send + Sync + 'static,
    ) -> KhepriResult<CallableMeta> {
        self.insert(spec.build(false)?, CallableFn::Sync(Arc::new(body)))
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
        self.insert(spec.build(true)?, CallableFn::Async(Arc::new(body)))
    }

    fn insert(&self, meta: CallableMeta, body: CallableFn) -> KhepriResult<CallableMeta> {
        let name = meta.name.clone();
        // Entry-based insertion keeps check-and-insert atomic.
        match self.callables.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CallableError::AlreadyExists { name }.into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    name = %meta.name,
                    pattern = %meta.output_pattern,
                    is_async = meta.is_async,
                    "registered callable"
                );
                slot.insert(Arc::new(RegisteredCallable {
                    meta: meta.clone(),
                    body,
                }));
                Ok(meta)
            }
        }
    }

    /// Look up a callable by name.
    pub fn get(&self, name: &str) -> KhepriResult<Arc<RegisteredCallable>> {
        self.callables
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| {
                CallableError::UnknownFunction {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Metadata for a registered callable.
    pub fn metadata(&self, name: &str) -> KhepriResult<CallableMeta> {
        Ok(self.get(name)?.meta.clone())
    }

    /// Names of all registered callables, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered callables.
    pub fn len(&self) -> usize {
        self.callables.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

impl Default for CallableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::TypeTag;

    #[test]
    fn register_and_get() {
        let reg = CallableRegistry::new();
        reg.register(
            CallableSpec::new("touch").param("x", TypeTag::Entity(None)),
            |mut inv| {
                let e = inv.take_entity("x")?;
                Ok(e.into())
            },
        )
        .unwrap();

        let callable = reg.get("touch").unwrap();
        assert_eq!(callable.meta.name, "touch");
        assert!(!callable.meta.is_async);
        assert_eq!(reg.list(), vec!["touch"]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let reg = CallableRegistry::new();
        let spec = || CallableSpec::new("touch").param("x", TypeTag::Entity(None));
        reg.register(spec(), |mut inv| Ok(inv.take_entity("x")?.into()))
            .unwrap();
        let err = reg
            .register(spec(), |mut inv| Ok(inv.take_entity("x")?.into()))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate registration"));
    }

    #[test]
    fn unknown_name_fails() {
        let reg = CallableRegistry::new();
        assert!(reg.get("absent").is_err());
        assert!(reg.metadata("absent").is_err());
    }

    #[test]
    fn async_registration_sets_flag() {
        let reg = CallableRegistry::new();
        reg.register_async(
            CallableSpec::new("touch_async").param("x", TypeTag::Entity(None)),
            |mut inv| {
                Box::pin(async move {
                    let e = inv.take_entity("x")?;
                    Ok(Value::from(e))
                })
            },
        )
        .unwrap();
        assert!(reg.metadata("touch_async").unwrap().is_async);
    }
}
