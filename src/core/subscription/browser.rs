use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ConsumerInfo, Delivery, Subscription};
use crate::core::error::BlipError;
use crate::core::message::MessageId;
use crate::core::reference::MessageReference;

#[derive(Debug, Clone)]
pub enum BrowseEvent {
    Message(Delivery),
    /// The subscribe-time snapshot has been fully delivered.
    Done,
}

/// Non-destructive reader. Never counts toward dispatch, never holds a
/// message past delivery and never appears in redelivery.
#[derive(Debug)]
pub struct BrowserSubscription {
    info: ConsumerInfo,
    browsed: Mutex<HashSet<MessageId>>,
    sender: flume::Sender<BrowseEvent>,
    done: AtomicBool,
}

impl BrowserSubscription {
    pub fn new(consumer_id: impl Into<String>) -> (Arc<Self>, flume::Receiver<BrowseEvent>) {
        Self::with_info(ConsumerInfo::browser(consumer_id))
    }

    pub fn with_info(mut info: ConsumerInfo) -> (Arc<Self>, flume::Receiver<BrowseEvent>) {
        info.browser = true;
        let (tx, rx) = flume::unbounded();
        let sub = Arc::new(Self {
            info,
            browsed: Mutex::new(HashSet::new()),
            sender: tx,
            done: AtomicBool::new(false),
        });
        (sub, rx)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn browsed_count(&self) -> usize {
        self.browsed.lock().len()
    }
}

impl Subscription for BrowserSubscription {
    fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    fn add(&self, reference: Arc<MessageReference>) -> Result<(), BlipError> {
        if !self.browsed.lock().insert(reference.id()) {
            return Ok(());
        }
        let delivery = Delivery::from_reference(&self.info.consumer_id, &reference)?;
        self.sender
            .send(BrowseEvent::Message(delivery))
            .map_err(|_| BlipError::Subscription(format!("browser {} receiver dropped", self.info.consumer_id)))
    }

    fn is_full(&self) -> bool {
        false
    }

    fn count_before_full(&self) -> usize {
        0
    }

    fn remove(&self) -> Vec<Arc<MessageReference>> {
        Vec::new()
    }

    fn in_flight(&self) -> usize {
        0
    }

    fn browse_done(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(BrowseEvent::Done);
        }
    }
}
