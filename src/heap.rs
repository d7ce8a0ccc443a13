//! # Managed-Heap Collaborator Surface
//!
//! The parallel core does not own the managed heap; it only needs a narrow
//! set of primitives from it: allocating placeholder blackholes, building
//! list cells around received stream elements, testing for blackholes, and
//! atomically replacing a blackhole with a value while waking every thread
//! suspended on it.
//!
//! This module provides those primitives over a small reference-counted
//! closure graph. A closure is a mutable cell plus a wake-up bell; consumers
//! suspend with [`demand`] and are released by [`update_thunk`]. Placeholders
//! generated by the communication layer are owned by a distinguished
//! *system* pseudo-thread ([`SYSTEM_OWNER`]) so that wake-ups are never
//! attributed to an arbitrary user thread.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Identifier of a runtime thread, used for ownership attribution.
pub type ThreadId = u64;

/// Pseudo-thread that owns blackholes generated by the communication layer.
///
/// It holds a blocking-queue slot but is never scheduled; real thread ids
/// start at 1.
pub const SYSTEM_OWNER: ThreadId = 0;

/// Shared handle to a heap closure.
pub type ClosureRef = Arc<Closure>;

/// The possible shapes of a heap node.
///
/// `MutCell` stands in for runtime-internal mutable objects that must never
/// cross a PE boundary; the packer rejects it.
#[derive(Debug)]
pub enum Node {
    /// Machine integer.
    Int(i64),
    /// Saturated constructor application.
    Con { tag: u32, fields: Vec<ClosureRef> },
    /// List cell; kept distinct from `Con` because the communication layer
    /// builds these directly for stream messages.
    Cons { head: ClosureRef, tail: ClosureRef },
    /// Mutable box; unpackable by construction.
    MutCell(ClosureRef),
    /// Unevaluated placeholder. Any thread demanding it suspends until the
    /// node is updated.
    Blackhole,
    /// Forwarding pointer left behind by an update.
    Ind(ClosureRef),
}

/// A heap closure: a node cell plus the bell rung when the cell is updated.
pub struct Closure {
    cell: Mutex<Node>,
    updated: Notify,
}

impl Closure {
    fn alloc(node: Node) -> ClosureRef {
        Arc::new(Closure {
            cell: Mutex::new(node),
            updated: Notify::new(),
        })
    }

    /// Run `f` on the current node shape.
    pub fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> R {
        f(&self.cell.lock())
    }

    /// Replace the node shape without waking anyone. Used by the unpacker
    /// to patch shell nodes while reconstructing shared structure; never
    /// valid on a closure that may already have waiters.
    pub(crate) fn patch(&self, node: Node) {
        *self.cell.lock() = node;
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.cell.lock() {
            Node::Int(v) => write!(f, "Int({})", v),
            Node::Con { tag, fields } => write!(f, "Con(tag={}, arity={})", tag, fields.len()),
            Node::Cons { .. } => write!(f, "Cons"),
            Node::MutCell(_) => write!(f, "MutCell"),
            Node::Blackhole => write!(f, "Blackhole"),
            Node::Ind(_) => write!(f, "Ind"),
        }
    }
}

/// Allocate a fresh blackhole.
pub fn create_bh() -> ClosureRef {
    Closure::alloc(Node::Blackhole)
}

/// Allocate an integer node.
pub fn create_int(value: i64) -> ClosureRef {
    Closure::alloc(Node::Int(value))
}

/// Allocate a constructor node.
pub fn create_con(tag: u32, fields: Vec<ClosureRef>) -> ClosureRef {
    Closure::alloc(Node::Con { tag, fields })
}

/// Allocate a list cell.
pub fn create_list_node(head: ClosureRef, tail: ClosureRef) -> ClosureRef {
    Closure::alloc(Node::Cons { head, tail })
}

/// Allocate a mutable box.
pub fn create_mut_cell(contents: ClosureRef) -> ClosureRef {
    Closure::alloc(Node::MutCell(contents))
}

/// Is this closure (itself, not through indirections) a blackhole?
pub fn is_blackhole(closure: &ClosureRef) -> bool {
    closure.with_node(|n| matches!(n, Node::Blackhole))
}

/// Follow indirections to the current representative of a closure.
pub fn dereference(closure: &ClosureRef) -> ClosureRef {
    let mut current = closure.clone();
    loop {
        let next = current.with_node(|n| match n {
            Node::Ind(target) => Some(target.clone()),
            _ => None,
        });
        match next {
            Some(target) => current = target,
            None => return current,
        }
    }
}

/// Atomically replace the blackhole at `placeholder` with `value`, waking
/// every thread suspended on it.
///
/// `owner` is recorded for diagnostics only; the communication layer passes
/// [`SYSTEM_OWNER`] so wake-ups are not attributed to a user thread. An
/// update of a non-blackhole is ignored with an error line, since a
/// placeholder must be replaced at most once.
pub fn update_thunk(owner: ThreadId, placeholder: &ClosureRef, value: ClosureRef) {
    {
        let mut cell = placeholder.cell.lock();
        match *cell {
            Node::Blackhole => *cell = Node::Ind(value),
            _ => {
                tracing::error!("update of a non-blackhole closure ignored");
                return;
            }
        }
    }
    trace!(owner, "blackhole updated, waking blocked threads");
    placeholder.updated.notify_waiters();
}

/// Demand a closure: follow indirections, suspending on blackholes until
/// they are updated, and return the evaluated representative.
pub async fn demand(closure: &ClosureRef) -> ClosureRef {
    let mut current = closure.clone();
    loop {
        let this = current.clone();
        let wakeup = this.updated.notified();
        enum Step {
            Done,
            Follow(ClosureRef),
            Wait,
        }
        let step = this.with_node(|n| match n {
            Node::Ind(target) => Step::Follow(target.clone()),
            Node::Blackhole => Step::Wait,
            _ => Step::Done,
        });
        match step {
            Step::Done => return this.clone(),
            Step::Follow(target) => current = target,
            Step::Wait => wakeup.await,
        }
    }
}

/// Demand a closure and read it as an integer, if it is one.
pub async fn demand_int(closure: &ClosureRef) -> Option<i64> {
    demand(closure).await.with_node(|n| match n {
        Node::Int(v) => Some(*v),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_placeholder_is_blackhole() {
        let bh = create_bh();
        assert!(is_blackhole(&bh));
        assert!(!is_blackhole(&create_int(5)));
    }

    #[test]
    fn update_replaces_exactly_once() {
        let bh = create_bh();
        update_thunk(SYSTEM_OWNER, &bh, create_int(42));
        assert!(!is_blackhole(&bh));
        // A second update must leave the first value in place.
        update_thunk(SYSTEM_OWNER, &bh, create_int(7));
        let value = dereference(&bh);
        assert!(value.with_node(|n| matches!(n, Node::Int(42))));
    }

    #[tokio::test]
    async fn demand_suspends_until_update() {
        let bh = create_bh();
        let consumer = {
            let bh = bh.clone();
            tokio::spawn(async move { demand_int(&bh).await })
        };
        // Give the consumer a chance to suspend on the blackhole.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        update_thunk(SYSTEM_OWNER, &bh, create_int(42));
        let observed = consumer.await.unwrap();
        assert_eq!(observed, Some(42));
    }

    #[tokio::test]
    async fn all_waiters_wake_on_update() {
        let bh = create_bh();
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let bh = bh.clone();
            consumers.push(tokio::spawn(async move { demand_int(&bh).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        update_thunk(SYSTEM_OWNER, &bh, create_int(9));
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), Some(9));
        }
    }

    #[tokio::test]
    async fn demand_follows_indirection_chains() {
        let inner = create_bh();
        let outer = create_bh();
        update_thunk(SYSTEM_OWNER, &outer, inner.clone());
        update_thunk(SYSTEM_OWNER, &inner, create_int(3));
        assert_eq!(demand_int(&outer).await, Some(3));
    }
}
