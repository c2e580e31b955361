use std::fmt;
use std::sync::Arc;

use crate::core::message::Message;

/// Predicate over messages, used for consumer selectors and for the bulk
/// remove/copy/move operations.
#[derive(Clone)]
pub struct MessageFilter(Arc<dyn Fn(&Message) -> bool + Send + Sync>);

impl MessageFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        MessageFilter(Arc::new(predicate))
    }

    pub fn all() -> Self {
        Self::new(|_| true)
    }

    pub fn property_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        Self::new(move |m| m.property(&key) == Some(value.as_str()))
    }

    #[inline]
    pub fn matches(&self, message: &Message) -> bool {
        (self.0)(message)
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageFilter(..)")
    }
}
