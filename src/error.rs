//! Rich diagnostic error types for the khepri runtime.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the khepri runtime.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum KhepriError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Callable(#[from] CallableError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Entity errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EntityError {
    #[error("field not found: {field} on entity kind '{kind}'")]
    #[diagnostic(
        code(khepri::entity::field_not_found),
        help(
            "The entity has no user-defined field with this name. \
             Check the field name, or inspect the entity with `field_names()`."
        )
    )]
    FieldNotFound { kind: String, field: String },

    #[error("field '{field}' holds {actual}, expected {expected}")]
    #[diagnostic(
        code(khepri::entity::wrong_type),
        help(
            "The field exists but holds a different value kind than the one \
             requested. Use the accessor matching the stored kind, or rewrite \
             the field first."
        )
    )]
    WrongType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("deep copy failed: {message}")]
    #[diagnostic(
        code(khepri::entity::copy),
        help(
            "The copy visitor refused to reproduce the entity tree within \
             the configured bounds. Raise `max_tree_depth` or \
             `max_tree_nodes` in RuntimeConfig if the input is legitimately \
             this large."
        )
    )]
    Copy { message: String },

    #[error("entity {ecs_id} is not a root (root_ecs_id = {root_ecs_id})")]
    #[diagnostic(
        code(khepri::entity::not_a_root),
        help(
            "This operation requires a root entity (ecs_id == root_ecs_id). \
             Detach the entity first, or operate on its root instead."
        )
    )]
    NotARoot { ecs_id: String, root_ecs_id: String },

    #[error("entity {ecs_id} is unattached (no root)")]
    #[diagnostic(
        code(khepri::entity::unattached),
        help(
            "The entity has no root pointers and therefore belongs to no tree. \
             Promote it to a root first."
        )
    )]
    Unattached { ecs_id: String },
}

// ---------------------------------------------------------------------------
// Tree errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TreeError {
    #[error("cyclic reference: entity {ecs_id} reached twice while building the tree")]
    #[diagnostic(
        code(khepri::tree::cyclic_reference),
        help(
            "An ecs_id appeared more than once during the walk, either beneath \
             itself or duplicated across branches. Entity trees must contain \
             each identity exactly once; remove the duplicate reference."
        )
    )]
    CyclicReference { ecs_id: String },

    #[error("detached child: entity {ecs_id} carries root {found_root}, expected {expected_root}")]
    #[diagnostic(
        code(khepri::tree::detached_child),
        help(
            "A non-root node points at a different root than the one being \
             built. Re-attach the child with `attach_to`, or detach it into \
             its own root before rebuilding."
        )
    )]
    DetachedChild {
        ecs_id: String,
        found_root: String,
        expected_root: String,
    },

    #[error("tree depth exceeded maximum of {max_depth}")]
    #[diagnostic(
        code(khepri::tree::depth_exceeded),
        help(
            "The walk descended deeper than the configured limit. Raise \
             `max_tree_depth` in RuntimeConfig if trees of this depth are \
             expected."
        )
    )]
    DepthExceeded { max_depth: usize },

    #[error("tree node count exceeded maximum of {max_nodes}")]
    #[diagnostic(
        code(khepri::tree::node_limit),
        help(
            "The tree holds more entities than the configured limit. Raise \
             `max_tree_nodes` in RuntimeConfig, or split the tree."
        )
    )]
    NodeLimit { max_nodes: usize },

    #[error("lineage mismatch: diffing {old_lineage} against {new_lineage}")]
    #[diagnostic(
        code(khepri::tree::lineage_mismatch),
        help(
            "Diff only applies to two trees of the same lineage. Fetch the \
             stored tree for this lineage and diff against that."
        )
    )]
    LineageMismatch {
        old_lineage: String,
        new_lineage: String,
    },
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("entity not found: {ecs_id}")]
    #[diagnostic(
        code(khepri::registry::not_found),
        help(
            "No stored entity carries this ecs_id. Verify the id, or check \
             that the entity was promoted to a root before lookup."
        )
    )]
    NotFound { ecs_id: String },

    #[error("lineage not found: {lineage_id}")]
    #[diagnostic(
        code(khepri::registry::lineage_not_found),
        help("No registered root belongs to this lineage.")
    )]
    LineageNotFound { lineage_id: String },

    #[error("already registered: root {ecs_id}")]
    #[diagnostic(
        code(khepri::registry::already_exists),
        help(
            "A tree snapshot for this root ecs_id already exists. Roots are \
             immutable once registered; fork a new version instead of \
             re-registering."
        )
    )]
    AlreadyExists { ecs_id: String },
}

// ---------------------------------------------------------------------------
// Address errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AddressError {
    #[error("address syntax error at byte {position}: {message}")]
    #[diagnostic(
        code(khepri::address::syntax),
        help(
            "Addresses are `@` + hyphenated lowercase UUID, then zero or more \
             `.segment` where a segment is an identifier, an integer, or a \
             double-quoted string. Example: @1c4e9b2a-5f7d-4c3e-9b1a-2d8f6e0a7c51.items.0"
        )
    )]
    Syntax { position: usize, message: String },

    #[error("address target not found: {ecs_id}")]
    #[diagnostic(
        code(khepri::address::not_found),
        help("The UUID in the address matches no stored entity.")
    )]
    NotFound { ecs_id: String },

    #[error("cannot project '{segment}' into {value_kind}")]
    #[diagnostic(
        code(khepri::address::field),
        help(
            "The segment does not apply to the value at this point in the \
             path: records take field names, lists and tuples take integer \
             indexes, maps take string keys."
        )
    )]
    Field { segment: String, value_kind: String },
}

// ---------------------------------------------------------------------------
// Callable errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CallableError {
    #[error("unknown function: {name}")]
    #[diagnostic(
        code(khepri::callable::unknown_function),
        help("No callable is registered under this name. Check `list()` for the registered names.")
    )]
    UnknownFunction { name: String },

    #[error("duplicate registration: {name}")]
    #[diagnostic(
        code(khepri::callable::already_exists),
        help(
            "A callable with this name is already registered. Names are \
             unique per registry; pick another name or construct a second \
             registry."
        )
    )]
    AlreadyExists { name: String },

    #[error("unsupported signature for '{name}': {message}")]
    #[diagnostic(
        code(khepri::callable::unsupported_signature),
        help(
            "The declared parameter or output shape cannot be executed. \
             Check that every parameter has a concrete type tag and the \
             output shape is one of the supported patterns."
        )
    )]
    UnsupportedSignature { name: String, message: String },
}

// ---------------------------------------------------------------------------
// Execution errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    #[error("argument '{name}' has type {actual}, declared {declared}")]
    #[diagnostic(
        code(khepri::exec::argument_type),
        help(
            "The resolved argument does not match the declared parameter \
             type. Check the call site, or the address if the argument was \
             passed by reference."
        )
    )]
    ArgumentType {
        name: String,
        declared: String,
        actual: String,
    },

    #[error("missing argument '{name}' for function '{function}'")]
    #[diagnostic(
        code(khepri::exec::missing_argument),
        help("The parameter has no default; pass a value, an entity, or an address for it.")
    )]
    MissingArgument { function: String, name: String },

    #[error("function '{function}' failed: {message}")]
    #[diagnostic(
        code(khepri::exec::execution_failure),
        help(
            "The function body returned an error. The execution record and \
             the `failed` event carry the same message."
        )
    )]
    ExecutionFailure { function: String, message: String },

    #[error("copy-on-read failed for '{function}': {message}")]
    #[diagnostic(
        code(khepri::exec::copy_failure),
        help(
            "Input preparation could not deep-copy a record argument. The \
             message names the bound that was hit; raise the tree limits in \
             RuntimeConfig if the input is legitimately this large."
        )
    )]
    CopyFailure { function: String, message: String },

    #[error("output of '{function}' does not match declared shape: {message}")]
    #[diagnostic(
        code(khepri::exec::output_shape),
        help(
            "The returned value disagrees with the output shape declared at \
             registration (arity, container kind, or entity-ness). Fix the \
             declaration or the function body."
        )
    )]
    OutputShape { function: String, message: String },

    #[error("classification failed for output of '{function}': {message}")]
    #[diagnostic(
        code(khepri::exec::classification),
        help(
            "The semantic classifier could not reconcile a returned entity \
             with the object-identity map built at input preparation. This \
             indicates identity tampering inside the function body."
        )
    )]
    Classification { function: String, message: String },

    #[error("function '{function}' exceeded its budget of {budget_ms}ms")]
    #[diagnostic(
        code(khepri::exec::timeout),
        help("Raise `call_timeout` in RuntimeConfig, or make the function cheaper.")
    )]
    Timeout { function: String, budget_ms: u64 },

    #[error("function '{function}' was cancelled")]
    #[diagnostic(
        code(khepri::exec::cancelled),
        help(
            "The in-flight invocation was cancelled. Input copies were \
             discarded; events already emitted remain in the log."
        )
    )]
    Cancelled { function: String },

    #[error("in-flight invocation limit of {max_in_flight} reached")]
    #[diagnostic(
        code(khepri::exec::in_flight_limit),
        help(
            "Too many concurrent invocations. Await completions before \
             issuing more calls, or raise `max_in_flight` in RuntimeConfig."
        )
    )]
    InFlightLimit { max_in_flight: usize },
}

// ---------------------------------------------------------------------------
// Event errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EventError {
    #[error("event context stack exceeded maximum depth of {max_depth}")]
    #[diagnostic(
        code(khepri::event::context_depth),
        help(
            "Scopes nested deeper than the configured limit. Raise \
             `max_context_depth` in RuntimeConfig, or check for a scope \
             that is pushed but never popped."
        )
    )]
    ContextDepthExceeded { max_depth: usize },

    #[error("pop on empty event context stack")]
    #[diagnostic(
        code(khepri::event::context_underflow),
        help(
            "`pop_context` was called more often than `push_context`. Use \
             the scoped emission wrapper, which balances pushes and pops \
             automatically."
        )
    )]
    ContextUnderflow,

    #[error("invalid subscription pattern '{pattern}': {message}")]
    #[diagnostic(
        code(khepri::event::bad_pattern),
        help("Glob patterns may contain literals and `*` wildcards, e.g. `entity.*`.")
    )]
    BadPattern { pattern: String, message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(khepri::config::invalid),
        help("Check the RuntimeConfig fields. {message}")
    )]
    Invalid { message: String },
}

/// Convenience alias for functions returning khepri results.
pub type KhepriResult<T> = std::result::Result<T, KhepriError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_error_converts_to_khepri_error() {
        let err = TreeError::DepthExceeded { max_depth: 32 };
        let top: KhepriError = err.into();
        assert!(matches!(top, KhepriError::Tree(TreeError::DepthExceeded { .. })));
    }

    #[test]
    fn registry_error_converts_to_khepri_error() {
        let err = RegistryError::NotFound { ecs_id: "0".into() };
        let top: KhepriError = err.into();
        assert!(matches!(top, KhepriError::Registry(RegistryError::NotFound { .. })));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = ExecError::Timeout {
            function: "slow".into(),
            budget_ms: 250,
        };
        let msg = format!("{err}");
        assert!(msg.contains("slow"));
        assert!(msg.contains("250"));
    }

    #[test]
    fn address_syntax_reports_position() {
        let err = AddressError::Syntax {
            position: 7,
            message: "expected hex digit".into(),
        };
        assert!(format!("{err}").contains("byte 7"));
    }
}
