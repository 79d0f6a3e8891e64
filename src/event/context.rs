//! Scoped parent context: the per-task stack of active parent events.
//!
//! The stack belongs to the *execution context*, not the event bus: it is
//! passed explicitly wherever work happens and forked (not shared) when a
//! task is spawned, so parentage never leaks across tasks. Every emission
//! observes the top of stack to set `parent_id`/`root_id`; an opening
//! event is pushed before emission and popped on scope exit regardless of
//! the outcome.

use std::future::Future;
use std::sync::Mutex;

use crate::error::{EventError, KhepriError, KhepriResult};

use super::bus::EventBus;
use super::{Event, EventId};

/// One active scope: the opening event and the root of its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeEntry {
    pub event_id: EventId,
    pub root_id: EventId,
}

/// Task-local stack of active parent events.
///
/// Interior mutability keeps the type `Send + Sync` so it can cross await
/// points; it is still *logically* task-local — spawn child tasks with
/// [`EventContext::fork`], never by sharing.
#[derive(Debug)]
pub struct EventContext {
    stack: Mutex<Vec<ScopeEntry>>,
    max_depth: usize,
}

impl EventContext {
    /// Create an empty context with the given depth limit.
    pub fn new(max_depth: usize) -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            max_depth,
        }
    }

    /// Snapshot this context for a spawned task. The child sees the
    /// current parents but pushes and pops independently.
    pub fn fork(&self) -> Self {
        Self {
            stack: Mutex::new(self.stack.lock().expect("context lock poisoned").clone()),
            max_depth: self.max_depth,
        }
    }

    /// The scope currently on top of the stack, if any.
    pub fn current_parent(&self) -> Option<ScopeEntry> {
        self.stack
            .lock()
            .expect("context lock poisoned")
            .last()
            .copied()
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.lock().expect("context lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Push an emitted opening event as the active scope.
    pub fn push(&self, event: &Event) -> KhepriResult<()> {
        let mut stack = self.stack.lock().expect("context lock poisoned");
        if stack.len() >= self.max_depth {
            return Err(EventError::ContextDepthExceeded {
                max_depth: self.max_depth,
            }
            .into());
        }
        stack.push(ScopeEntry {
            event_id: event.id,
            root_id: event.root_id.unwrap_or(event.id),
        });
        Ok(())
    }

    /// Pop the active scope.
    pub fn pop(&self) -> KhepriResult<ScopeEntry> {
        self.stack
            .lock()
            .expect("context lock poisoned")
            .pop()
            .ok_or_else(|| EventError::ContextUnderflow.into())
    }

    /// Apply parent/root linkage to an event about to be emitted: the top
    /// of stack becomes the parent, its root propagates, and an event with
    /// no parent roots its own family.
    pub fn link(&self, event: &mut Event) {
        match self.current_parent() {
            Some(parent) => {
                event.parent_id = Some(parent.event_id);
                event.root_id = Some(parent.root_id);
            }
            None => {
                event.parent_id = None;
                event.root_id = Some(event.id);
            }
        }
    }
}

impl Default for EventContext {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Decorated emission
// ---------------------------------------------------------------------------

/// Run an operation inside an event scope.
///
/// Links and emits `opening`, pushes the scope, runs `op`, emits the
/// created event on success or the failed event on error (both linked
/// while the scope is still active, so they parent to the opening event),
/// and always pops the scope. The operation's result passes through
/// unchanged.
pub fn with_scope<T>(
    bus: &EventBus,
    ctx: &EventContext,
    mut opening: Event,
    op: impl FnOnce() -> KhepriResult<T>,
    created: impl FnOnce(&T) -> Event,
    failed: impl FnOnce(&KhepriError) -> Event,
) -> KhepriResult<T> {
    ctx.link(&mut opening);
    ctx.push(&opening)?;
    bus.emit(opening);

    let result = op();
    let closing = match &result {
        Ok(value) => created(value),
        Err(err) => failed(err),
    };
    bus.emit_in(ctx, closing);
    ctx.pop()?;
    result
}

/// Async twin of [`with_scope`]; suspension may occur anywhere inside the
/// guarded operation.
pub async fn with_scope_async<T, Fut>(
    bus: &EventBus,
    ctx: &EventContext,
    mut opening: Event,
    op: impl FnOnce() -> Fut,
    created: impl FnOnce(&T) -> Event,
    failed: impl FnOnce(&KhepriError) -> Event,
) -> KhepriResult<T>
where
    Fut: Future<Output = KhepriResult<T>>,
{
    ctx.link(&mut opening);
    ctx.push(&opening)?;
    bus.emit(opening);

    let result = op().await;
    let closing = match &result {
        Ok(value) => created(value),
        Err(err) => failed(err),
    };
    bus.emit_in(ctx, closing);
    ctx.pop()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::event::EventKind;

    fn bus() -> EventBus {
        EventBus::new(1024, 8)
    }

    #[test]
    fn link_without_parent_roots_itself() {
        let ctx = EventContext::default();
        let mut e = Event::new(EventKind::Created, "Student");
        ctx.link(&mut e);
        assert_eq!(e.parent_id, None);
        assert_eq!(e.root_id, Some(e.id));
    }

    #[test]
    fn link_under_parent_propagates_root() {
        let ctx = EventContext::default();
        let mut outer = Event::new(EventKind::Processing, "Outer");
        ctx.link(&mut outer);
        ctx.push(&outer).unwrap();

        let mut inner = Event::new(EventKind::Processing, "Inner");
        ctx.link(&mut inner);
        assert_eq!(inner.parent_id, Some(outer.id));
        assert_eq!(inner.root_id, Some(outer.id));
    }

    #[test]
    fn depth_limit_enforced() {
        let ctx = EventContext::new(2);
        for _ in 0..2 {
            let mut e = Event::new(EventKind::Processing, "S");
            ctx.link(&mut e);
            ctx.push(&e).unwrap();
        }
        let mut e = Event::new(EventKind::Processing, "S");
        ctx.link(&mut e);
        assert!(ctx.push(&e).is_err());
    }

    #[test]
    fn pop_on_empty_underflows() {
        let ctx = EventContext::default();
        assert!(ctx.pop().is_err());
    }

    #[test]
    fn fork_isolates_child_pushes() {
        let ctx = EventContext::default();
        let mut outer = Event::new(EventKind::Processing, "Outer");
        ctx.link(&mut outer);
        ctx.push(&outer).unwrap();

        let child = ctx.fork();
        assert_eq!(child.current_parent(), ctx.current_parent());

        let mut inner = Event::new(EventKind::Processing, "Inner");
        child.link(&mut inner);
        child.push(&inner).unwrap();
        // Parent stack unaffected by the child's push.
        assert_eq!(ctx.depth(), 1);
        assert_eq!(child.depth(), 2);
    }

    #[test]
    fn with_scope_balances_on_success() {
        let bus = bus();
        let ctx = EventContext::default();
        let out = with_scope(
            &bus,
            &ctx,
            Event::new(EventKind::Processing, "Job"),
            || Ok(41 + 1),
            |_| Event::new(EventKind::Processed, "Job"),
            |_| Event::new(EventKind::Failed, "Job"),
        )
        .unwrap();
        assert_eq!(out, 42);
        assert!(ctx.is_empty());

        let log = bus.recent(10);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, EventKind::Processing);
        assert_eq!(log[1].kind, EventKind::Processed);
        // The closing event parents to the opening event.
        assert_eq!(log[1].parent_id, Some(log[0].id));
    }

    #[test]
    fn with_scope_pops_once_on_failure() {
        let bus = bus();
        let ctx = EventContext::default();
        let result: KhepriResult<()> = with_scope(
            &bus,
            &ctx,
            Event::new(EventKind::Processing, "Job"),
            || {
                Err(RegistryError::NotFound {
                    ecs_id: "missing".into(),
                }
                .into())
            },
            |_| Event::new(EventKind::Processed, "Job"),
            |e| Event::new(EventKind::Failed, "Job").with_metadata("error", e.to_string()),
        );
        assert!(result.is_err());
        assert!(ctx.is_empty());

        let log = bus.recent(10);
        assert_eq!(log[1].kind, EventKind::Failed);
        assert_eq!(log[1].parent_id, Some(log[0].id));
    }

    #[tokio::test]
    async fn with_scope_async_links_like_sync() {
        let bus = bus();
        let ctx = EventContext::default();
        let out = with_scope_async(
            &bus,
            &ctx,
            Event::new(EventKind::Processing, "Job"),
            || async {
                tokio::task::yield_now().await;
                Ok(7)
            },
            |_| Event::new(EventKind::Processed, "Job"),
            |_| Event::new(EventKind::Failed, "Job"),
        )
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert!(ctx.is_empty());
        assert_eq!(bus.recent(10).len(), 2);
    }
}
