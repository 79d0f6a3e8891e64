//! Execution records: one first-class entity per completed call.
//!
//! A record is an ordinary [`Entity`] of kind `ExecutionRecord`, promoted
//! to a root like any other, so executions are auditable and addressable
//! through the same registry as the data they produced.

use crate::entity::{EcsId, Entity, Value};
use crate::error::KhepriResult;
use crate::registry::EntityRegistry;

use super::classify::Classification;
use super::ExecStrategy;

/// Entity kind carried by all execution records.
pub const EXECUTION_RECORD_KIND: &str = "ExecutionRecord";

/// Accumulates one call's audit data and promotes it as an entity.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub function: String,
    pub strategy: ExecStrategy,
    pub input_ids: Vec<EcsId>,
    pub output_ids: Vec<EcsId>,
    pub classifications: Vec<Classification>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Start a record for a call that has not finished yet.
    pub fn started(function: impl Into<String>, strategy: ExecStrategy) -> Self {
        Self {
            function: function.into(),
            strategy,
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            classifications: Vec::new(),
            duration_ms: 0,
            success: false,
            error: None,
        }
    }

    /// Materialize as an entity and promote it to a root.
    pub fn promote(self, registry: &EntityRegistry) -> KhepriResult<EcsId> {
        let ids_value = |ids: &[EcsId]| {
            Value::List(ids.iter().map(|id| Value::Str(id.to_string())).collect())
        };

        let mut entity = Entity::new(EXECUTION_RECORD_KIND);
        entity.set_field("function", self.function.as_str());
        entity.set_field("strategy", self.strategy.to_string());
        entity.set_field("input_ids", ids_value(&self.input_ids));
        entity.set_field("output_ids", ids_value(&self.output_ids));
        entity.set_field(
            "classifications",
            Value::List(
                self.classifications
                    .iter()
                    .map(|c| Value::Str(c.label().to_string()))
                    .collect(),
            ),
        );
        entity.set_field("duration_ms", self.duration_ms as i64);
        entity.set_field("success", self.success);
        entity.set_field(
            "error",
            self.error
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Null),
        );

        registry.register_root(&mut entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promoted_record_is_queryable() {
        let registry = EntityRegistry::default();
        let mut record = ExecutionRecord::started("update_field", ExecStrategy::SingleRecord);
        record.input_ids.push(EcsId::fresh());
        record.duration_ms = 12;
        record.success = true;

        let id = record.promote(&registry).unwrap();
        let stored = registry.fetch_entity(id).unwrap();
        assert_eq!(stored.kind(), EXECUTION_RECORD_KIND);
        assert_eq!(stored.get_str("function").unwrap(), "update_field");
        assert_eq!(stored.get_int("duration_ms").unwrap(), 12);
        assert!(stored.get_bool("success").unwrap());
        assert_eq!(stored.field("error"), Some(&Value::Null));
    }

    #[test]
    fn failed_record_carries_error() {
        let registry = EntityRegistry::default();
        let mut record = ExecutionRecord::started("broken", ExecStrategy::Borrow);
        record.error = Some("division by zero".into());

        let id = record.promote(&registry).unwrap();
        let stored = registry.fetch_entity(id).unwrap();
        assert!(!stored.get_bool("success").unwrap());
        assert_eq!(stored.get_str("error").unwrap(), "division by zero");
    }
}
