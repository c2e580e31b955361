//! Consumer side of the queue.
//!
//! The queue dispatches into anything implementing [`Subscription`]. Two
//! implementations ship with the crate: [`PrefetchSubscription`] for
//! competing consumers and [`BrowserSubscription`] for non-destructive
//! browsing. Both hand messages out over `flume` channels.

pub mod browser;
pub mod prefetch;

pub use browser::{BrowseEvent, BrowserSubscription};
pub use prefetch::PrefetchSubscription;

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use crate::core::error::BlipError;
use crate::core::filter::MessageFilter;
use crate::core::message::{Message, MessageId};
use crate::core::reference::MessageReference;

/// Unique identifier for a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        ConsumerId(s.to_owned())
    }
}

impl Deref for ConsumerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub prefetch_size: usize,
    /// Higher wins, both for list ordering and exclusive election.
    pub priority: u8,
    pub exclusive: bool,
    pub browser: bool,
    pub durable: bool,
    pub selector: Option<MessageFilter>,
}

impl ConsumerInfo {
    pub fn new(consumer_id: impl Into<String>, prefetch_size: usize) -> Self {
        Self {
            consumer_id: ConsumerId::new(consumer_id),
            prefetch_size,
            priority: 0,
            exclusive: false,
            browser: false,
            durable: false,
            selector: None,
        }
    }

    pub fn browser(consumer_id: impl Into<String>) -> Self {
        Self {
            browser: true,
            ..Self::new(consumer_id, 0)
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_selector(mut self, selector: MessageFilter) -> Self {
        self.selector = Some(selector);
        self
    }
}

/// What a consumer actually receives.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_id: ConsumerId,
    pub message_id: MessageId,
    pub message: Arc<Message>,
    pub redelivery_counter: u32,
    pub group_first_for_consumer: bool,
}

impl Delivery {
    pub(crate) fn from_reference(
        consumer_id: &ConsumerId,
        reference: &MessageReference,
    ) -> Result<Self, BlipError> {
        let message = reference.message().ok_or_else(|| {
            BlipError::Subscription(format!("body of {} is unavailable", reference.id()))
        })?;
        Ok(Self {
            consumer_id: consumer_id.clone(),
            message_id: reference.id(),
            message,
            redelivery_counter: reference.redelivery_counter(),
            group_first_for_consumer: reference.is_group_first_for_consumer(),
        })
    }
}

/// A consumer attached to a queue, as seen by the dispatcher.
pub trait Subscription: Send + Sync + Debug {
    fn info(&self) -> &ConsumerInfo;

    fn consumer_id(&self) -> &ConsumerId {
        &self.info().consumer_id
    }

    fn is_browser(&self) -> bool {
        self.info().browser
    }

    /// Selector match. References whose body cannot be loaded never match.
    fn matches(&self, reference: &MessageReference) -> bool {
        match &self.info().selector {
            None => true,
            Some(selector) => reference
                .message()
                .map(|m| selector.matches(&m))
                .unwrap_or(false),
        }
    }

    /// Push a dispatched message into the consumer's buffer.
    fn add(&self, reference: Arc<MessageReference>) -> Result<(), BlipError>;

    fn is_full(&self) -> bool;

    /// Room left before [`Subscription::is_full`] turns true.
    fn count_before_full(&self) -> usize;

    /// Detach, handing back every in-flight reference for redelivery.
    fn remove(&self) -> Vec<Arc<MessageReference>>;

    /// Number of dispatched but unacknowledged messages.
    fn in_flight(&self) -> usize;

    /// Signals a browser that its snapshot has been fully delivered.
    fn browse_done(&self) {}
}
