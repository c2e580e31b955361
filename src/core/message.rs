use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::core::subscription::ConsumerId;

/// Fixed per-message accounting overhead charged to the usage gates on top of
/// the payload and property bytes.
const MESSAGE_OVERHEAD_BYTES: usize = 64;

/// Broker-assigned message identity. Ids are handed out from a monotonic
/// sequence, so ordering by id is ordering by arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub fn from_raw(value: u64) -> Self {
        MessageId(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID:{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    /// `None` until the broker assigns one on send. Replicated and recovered
    /// messages arrive with their id already set.
    pub id: Option<MessageId>,
    pub destination: String,
    pub payload: Bytes,
    pub properties: HashMap<String, String>,
    pub persistent: bool,
    pub priority: u8,
    pub timestamp: u64,
    /// Absolute expiry in milliseconds since the epoch, `0` = never.
    pub expiration: u64,
    pub group_id: Option<String>,
    /// Position inside the group; `-1` closes the group.
    pub group_sequence: i32,
    pub group_first_for_consumer: bool,
    pub redelivery_counter: u32,
    pub original_destination: Option<String>,
    pub dead_letter_cause: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            destination: String::new(),
            payload: payload.into(),
            properties: HashMap::new(),
            persistent: true,
            priority: 4,
            timestamp: current_timestamp(),
            expiration: 0,
            group_id: None,
            group_sequence: 0,
            group_first_for_consumer: false,
            redelivery_counter: 0,
            original_destination: None,
            dead_letter_cause: None,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn non_persistent(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    /// Expire `ttl_ms` after the message timestamp.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.expiration = if ttl_ms == 0 { 0 } else { self.timestamp + ttl_ms };
        self
    }

    pub fn with_expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>, sequence: i32) -> Self {
        self.group_id = Some(group_id.into());
        self.group_sequence = sequence;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    #[inline]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expiration != 0 && now_ms >= self.expiration
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    /// Bytes charged against memory/store usage while this message is held.
    pub fn size(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        MESSAGE_OVERHEAD_BYTES + self.payload.len() + props
    }

    /// A fresh copy for another destination. The id is cleared so the target
    /// assigns one from its own sequence.
    pub fn copy_for(&self, destination: &str) -> Message {
        let mut copy = self.clone();
        copy.id = None;
        copy.original_destination = Some(
            self.original_destination
                .clone()
                .unwrap_or_else(|| self.destination.clone()),
        );
        copy.destination = destination.to_string();
        copy.group_first_for_consumer = false;
        copy
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Acknowledges every message in `first..=last`.
    Standard,
    /// Acknowledges exactly one message.
    Individual,
    /// The consumer gave up on the message; it goes to the dead-letter path.
    Poison,
}

#[derive(Debug, Clone)]
pub struct MessageAck {
    pub kind: AckKind,
    pub destination: String,
    pub consumer_id: ConsumerId,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: MessageId,
    pub message_count: usize,
    pub poison_cause: Option<String>,
}

impl MessageAck {
    pub fn individual(destination: &str, consumer_id: ConsumerId, id: MessageId) -> Self {
        Self {
            kind: AckKind::Individual,
            destination: destination.to_string(),
            consumer_id,
            first_message_id: None,
            last_message_id: id,
            message_count: 1,
            poison_cause: None,
        }
    }

    pub fn range(
        destination: &str,
        consumer_id: ConsumerId,
        first: MessageId,
        last: MessageId,
        message_count: usize,
    ) -> Self {
        Self {
            kind: AckKind::Standard,
            destination: destination.to_string(),
            consumer_id,
            first_message_id: Some(first),
            last_message_id: last,
            message_count,
            poison_cause: None,
        }
    }

    pub fn poison(
        destination: &str,
        consumer_id: ConsumerId,
        id: MessageId,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            kind: AckKind::Poison,
            destination: destination.to_string(),
            consumer_id,
            first_message_id: None,
            last_message_id: id,
            message_count: 1,
            poison_cause: Some(cause.into()),
        }
    }

    pub fn is_poison(&self) -> bool {
        self.kind == AckKind::Poison
    }

    /// Whether `id` falls inside the acknowledged range.
    pub fn covers(&self, id: MessageId) -> bool {
        match self.first_message_id {
            Some(first) => first <= id && id <= self.last_message_id,
            None => id == self.last_message_id,
        }
    }

    /// Narrow a (possibly ranged) ack down to the single message being
    /// removed, which is what the store understands.
    pub fn for_single(&self, id: MessageId) -> MessageAck {
        MessageAck {
            kind: if self.is_poison() {
                AckKind::Poison
            } else {
                AckKind::Individual
            },
            destination: self.destination.clone(),
            consumer_id: self.consumer_id.clone(),
            first_message_id: None,
            last_message_id: id,
            message_count: 1,
            poison_cause: self.poison_cause.clone(),
        }
    }
}
