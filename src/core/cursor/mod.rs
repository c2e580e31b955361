//! Pending cursors: ordered, resettable iteration over the part of a
//! queue's backlog that has not been paged into the working set yet.
//!
//! A cursor is not internally synchronized; the queue keeps it behind its
//! own mutex (the innermost lock of the destination) and iterates while
//! holding that guard.
//!
//! Ownership of holds: a reference handed to [`PendingCursor::add_message_last`]
//! carries one reference count. The cursor keeps it while it caches the
//! reference and releases it when it declines to (duplicate, or spooled to
//! the store). References returned by [`PendingCursor::next`] and then
//! [`PendingCursor::remove`]d transfer that count to the caller.

pub mod store;
pub mod vm;

pub use store::StorePendingCursor;
pub use vm::VmPendingCursor;

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::message::MessageId;
use crate::core::reference::MessageReference;

pub trait PendingCursor: Send + Debug {
    /// Append a reference. Returns `false` when the id was recently seen.
    fn add_message_last(&mut self, reference: Arc<MessageReference>) -> bool;

    /// Rewind iteration to the oldest pending reference.
    fn reset(&mut self);

    fn has_next(&mut self) -> bool;

    fn next(&mut self) -> Option<Arc<MessageReference>>;

    /// Remove the reference most recently returned by [`PendingCursor::next`].
    fn remove(&mut self);

    /// Forget `id` in the duplicate audit so it may be added again.
    fn rollback(&mut self, id: MessageId);

    /// End the current iteration and drop any scan-time state.
    fn release(&mut self);

    fn set_max_batch_size(&mut self, size: usize);

    fn max_batch_size(&self) -> usize;

    /// Number of references not yet removed from the cursor.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn is_store_backed(&self) -> bool;
}

/// Bounded window of recently added ids.
#[derive(Debug)]
pub struct MessageAudit {
    depth: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl MessageAudit {
    /// `depth == 0` disables the audit.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            seen: HashSet::with_capacity(depth.min(4096)),
            order: VecDeque::with_capacity(depth.min(4096)),
        }
    }

    /// Record `id`; true if it was already in the window.
    pub fn is_duplicate(&mut self, id: MessageId) -> bool {
        if self.depth == 0 {
            return false;
        }
        if !self.seen.insert(id) {
            return true;
        }
        self.order.push_back(id);
        while self.order.len() > self.depth {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        false
    }

    pub fn rollback(&mut self, id: MessageId) {
        if self.seen.remove(&id) {
            self.order.retain(|seen| *seen != id);
        }
    }
}
