//! Dispatch eligibility.
//!
//! Everything here is a pure decision over a subscription, a reference and
//! the group table; the queue owns the state and the locking.

use std::sync::Arc;

use tracing::trace;

use crate::core::group::MessageGroupMap;
use crate::core::reference::MessageReference;
use crate::core::subscription::{ConsumerId, Subscription};

/// Group sequence that closes a message group.
pub const GROUP_CLOSE_SEQUENCE: i32 = -1;

#[derive(Debug, Default, Clone)]
pub struct DispatchSelector {
    exclusive_consumer: Option<ConsumerId>,
}

impl DispatchSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive_consumer(&self) -> Option<&ConsumerId> {
        self.exclusive_consumer.as_ref()
    }

    pub fn set_exclusive_consumer(&mut self, consumer: Option<ConsumerId>) {
        self.exclusive_consumer = consumer;
    }

    pub fn is_exclusive_consumer(&self, consumer: &ConsumerId) -> bool {
        self.exclusive_consumer.as_ref() == Some(consumer)
    }

    /// Selector match plus exclusivity. Browsers only need the selector.
    pub fn can_select(&self, sub: &dyn Subscription, reference: &MessageReference) -> bool {
        if !sub.matches(reference) {
            return false;
        }
        if sub.is_browser() {
            return true;
        }
        match &self.exclusive_consumer {
            None => true,
            Some(owner) => owner == sub.consumer_id(),
        }
    }

    /// Re-run the exclusive election over `consumers`.
    ///
    /// Candidates are consumers asking for exclusivity (every consumer when
    /// `all_exclusive` is set). Highest priority wins; on a tie the current
    /// owner keeps it, otherwise the earliest in list order.
    pub fn elect_exclusive(&mut self, consumers: &[Arc<dyn Subscription>], all_exclusive: bool) -> Option<ConsumerId> {
        let mut winner: Option<&Arc<dyn Subscription>> = None;
        for sub in consumers {
            if sub.is_browser() || !(all_exclusive || sub.info().exclusive) {
                continue;
            }
            winner = match winner {
                None => Some(sub),
                Some(best) => {
                    let p = sub.info().priority;
                    let best_p = best.info().priority;
                    if p > best_p || (p == best_p && self.is_exclusive_consumer(sub.consumer_id())) {
                        Some(sub)
                    } else {
                        Some(best)
                    }
                }
            };
        }
        let elected = winner.map(|s| s.consumer_id().clone());
        if elected != self.exclusive_consumer {
            trace!(?elected, previous = ?self.exclusive_consumer, "exclusive consumer changed");
        }
        self.exclusive_consumer = elected.clone();
        elected
    }
}

/// Apply group ownership for dispatching `reference` to `consumer`.
///
/// Ungrouped messages always pass. The first message of a group claims it
/// for the consumer; later ones only go to the owner. A close
/// ([`GROUP_CLOSE_SEQUENCE`]) goes to the owner (or anyone, if unowned) and
/// releases the group.
pub fn assign_message_group(
    groups: &mut MessageGroupMap,
    consumer: &ConsumerId,
    reference: &MessageReference,
) -> bool {
    let Some(group) = reference.group_id() else {
        return true;
    };

    if reference.group_sequence() == GROUP_CLOSE_SEQUENCE {
        return match groups.get(group) {
            Some(owner) if owner != consumer => false,
            _ => {
                groups.remove_group(group);
                true
            }
        };
    }

    match groups.get(group) {
        Some(owner) => owner == consumer,
        None => {
            groups.put(group, consumer.clone());
            reference.set_group_first_for_consumer(true);
            true
        }
    }
}
