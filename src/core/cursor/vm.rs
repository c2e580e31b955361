use std::collections::VecDeque;
use std::sync::Arc;

use super::{MessageAudit, PendingCursor};
use crate::core::message::MessageId;
use crate::core::reference::MessageReference;

/// Purely in-memory cursor: every pending reference stays resident.
#[derive(Debug)]
pub struct VmPendingCursor {
    list: VecDeque<Arc<MessageReference>>,
    position: usize,
    last_returned: Option<usize>,
    audit: MessageAudit,
    max_batch_size: usize,
}

impl VmPendingCursor {
    pub fn new(audit_depth: usize) -> Self {
        Self {
            list: VecDeque::new(),
            position: 0,
            last_returned: None,
            audit: MessageAudit::new(audit_depth),
            max_batch_size: 200,
        }
    }
}

impl PendingCursor for VmPendingCursor {
    fn add_message_last(&mut self, reference: Arc<MessageReference>) -> bool {
        if self.audit.is_duplicate(reference.id()) {
            reference.decrement_reference_count();
            return false;
        }
        self.list.push_back(reference);
        true
    }

    fn reset(&mut self) {
        self.position = 0;
        self.last_returned = None;
    }

    fn has_next(&mut self) -> bool {
        self.position < self.list.len()
    }

    fn next(&mut self) -> Option<Arc<MessageReference>> {
        let reference = self.list.get(self.position)?.clone();
        self.last_returned = Some(self.position);
        self.position += 1;
        Some(reference)
    }

    fn remove(&mut self) {
        if let Some(index) = self.last_returned.take() {
            self.list.remove(index);
            self.position = index;
        }
    }

    fn rollback(&mut self, id: MessageId) {
        self.audit.rollback(id);
    }

    fn release(&mut self) {
        self.reset();
    }

    fn set_max_batch_size(&mut self, size: usize) {
        self.max_batch_size = size.max(1);
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn size(&self) -> usize {
        self.list.len()
    }

    fn is_store_backed(&self) -> bool {
        false
    }
}
