use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{insert_consumer, Consumers, DispatchState, Queue};
use crate::core::reference::{LockOwner, MessageReference};
use crate::core::selector::assign_message_group;
use crate::core::statistics::DestinationStatistics;
use crate::core::subscription::ConsumerId;

pub(super) struct DispatchOutcome {
    pub dispatched: usize,
    /// Another pass is worthwhile right away.
    pub wake_again: bool,
}

impl Queue {
    /// How many references a normal (unforced) page-in may pull.
    fn page_in_budget(&self, consumers: &Consumers, pending: usize, cursor_size: usize, max: usize) -> usize {
        let mut to_page = max.min(cursor_size);

        if self.policy.lazy_dispatch {
            let room: usize = consumers
                .list
                .iter()
                .map(|s| s.count_before_full())
                .sum();
            let room = if room == 0 && consumers.list.iter().any(|s| s.info().prefetch_size == 0) {
                1
            } else {
                room
            };
            to_page = to_page.min(room);
        }

        to_page.min(self.policy.max_page_size.saturating_sub(pending))
    }

    /// Move up to `max` references out of the cursor.
    ///
    /// Unforced page-ins only run while there are consumers and the
    /// pending-dispatch list has room. Expired references are settled on the
    /// spot; ones already resident are discarded. Returns the paged
    /// references and how many expired.
    pub(super) fn page_in(
        &self,
        force: bool,
        max: usize,
        consumers: &Consumers,
    ) -> (Vec<Arc<MessageReference>>, usize) {
        let pending = self.dispatch.lock().pending.len();
        if !force && (consumers.list.is_empty() || pending >= self.policy.max_page_size) {
            return (Vec::new(), 0);
        }

        let mut paged = Vec::new();
        let mut expired = Vec::new();
        {
            let mut cursor = self.cursor.lock();
            let to_page = if force {
                max.min(cursor.size())
            } else {
                self.page_in_budget(consumers, pending, cursor.size(), max)
            };
            if to_page == 0 {
                return (Vec::new(), 0);
            }

            cursor.reset();
            while paged.len() < to_page && cursor.has_next() {
                let Some(reference) = cursor.next() else {
                    break;
                };
                cursor.remove();
                if reference.is_expired() {
                    expired.push(reference);
                } else {
                    paged.push(reference);
                }
            }
            cursor.release();
        }

        for reference in &expired {
            self.expire_reference(reference);
        }

        if !paged.is_empty() {
            let state = self.dispatch.lock();
            paged.retain(|reference| {
                if state.is_resident(reference.id()) {
                    reference.decrement_reference_count();
                    false
                } else {
                    true
                }
            });
        }

        if !paged.is_empty() || !expired.is_empty() {
            debug!(
                queue = %self.name,
                paged = paged.len(),
                expired = expired.len(),
                force,
                "paged in"
            );
        }
        (paged, expired.len())
    }

    /// Retry the pending-dispatch list, then dispatch `list`. While older
    /// work is still stuck, new references queue up behind it undispatched.
    pub(super) fn do_dispatch(
        &self,
        consumers: &mut Consumers,
        list: Vec<Arc<MessageReference>>,
    ) -> DispatchOutcome {
        let mut state = self.dispatch.lock();
        let mut dispatched = 0;
        let mut wake_again = false;

        let mut pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            let (left, n) = self.do_actual_dispatch(consumers, &mut state, pending);
            pending = left;
            dispatched += n;
        }

        if !list.is_empty() {
            if pending.is_empty() {
                let (left, n) = self.do_actual_dispatch(consumers, &mut state, list.into());
                pending = left;
                dispatched += n;
            } else {
                for reference in list {
                    if !pending.iter().any(|r| r.id() == reference.id()) {
                        pending.push_back(reference);
                    }
                }
                wake_again = true;
            }
        }
        state.pending = pending;

        if dispatched > 0 {
            let backlog = !state.pending.is_empty();
            drop(state);
            let more = backlog || !self.cursor.lock().is_empty();
            let room = consumers.list.iter().any(|s| !s.is_full());
            wake_again |= more && room;
        }

        DispatchOutcome {
            dispatched,
            wake_again,
        }
    }

    /// One pass of the dispatch decision over `list`. Returns what could
    /// not be placed, in order, and how many were dispatched.
    fn do_actual_dispatch(
        &self,
        consumers: &mut Consumers,
        state: &mut DispatchState,
        list: VecDeque<Arc<MessageReference>>,
    ) -> (VecDeque<Arc<MessageReference>>, usize) {
        let mut leftover = VecDeque::new();
        let mut full: HashSet<ConsumerId> = HashSet::new();
        let mut dispatched = 0;
        let strict_order = self.policy.strict_order_dispatch;

        for reference in list {
            if reference.is_dropped() {
                continue;
            }
            if reference.is_acked() || full.len() >= consumers.list.len() {
                leftover.push_back(reference);
                continue;
            }

            let mut target = None;
            for (index, sub) in consumers.list.iter().enumerate() {
                if sub.is_browser() || full.contains(sub.consumer_id()) {
                    continue;
                }
                if sub.is_full() {
                    full.insert(sub.consumer_id().clone());
                    continue;
                }
                if !consumers.selector.can_select(sub.as_ref(), &reference) {
                    continue;
                }
                if !assign_message_group(&mut consumers.groups, sub.consumer_id(), &reference) {
                    continue;
                }
                if reference.is_acked() || !reference.lock(LockOwner::Consumer(sub.consumer_id().clone())) {
                    continue;
                }
                match sub.add(reference.clone()) {
                    Ok(()) => {
                        target = Some(index);
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %self.name, consumer = %sub.consumer_id(), message_id = %reference.id(), error = %e, "dispatch rejected");
                        reference.unlock();
                        if reference.is_group_first_for_consumer() {
                            if let Some(group) = reference.group_id() {
                                consumers.groups.remove_group(group);
                            }
                            reference.set_group_first_for_consumer(false);
                        }
                    }
                }
            }

            let Some(index) = target else {
                leftover.push_back(reference);
                continue;
            };

            dispatched += 1;
            DestinationStatistics::increment(&self.stats.dispatched);
            DestinationStatistics::increment(&self.stats.inflight);
            trace!(
                queue = %self.name,
                message_id = %reference.id(),
                consumer = %consumers.list[index].consumer_id(),
                redelivery = reference.redelivery_counter(),
                "dispatched"
            );
            state.working_set.insert(reference.id(), reference);

            let rotate = !strict_order
                && consumers.list.len() > 1
                && !consumers
                    .selector
                    .is_exclusive_consumer(consumers.list[index].consumer_id());
            if rotate {
                let sub = consumers.list.remove(index);
                insert_consumer(&mut consumers.list, sub, self.policy.prioritized_consumers);
            }
        }

        (leftover, dispatched)
    }

    /// Resident references followed by up to `limit` more from a cursor
    /// scan, in id order. Nothing is removed from the cursor.
    pub(super) fn collect_references(&self, limit: usize) -> Vec<Arc<MessageReference>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        {
            let state = self.dispatch.lock();
            for reference in state.working_set.values().chain(state.pending.iter()) {
                if !reference.is_dropped() && !reference.is_acked() && seen.insert(reference.id()) {
                    out.push(reference.clone());
                }
            }
            let mut cursor = self.cursor.lock();
            cursor.reset();
            let mut scanned = 0;
            while scanned < limit && cursor.has_next() {
                let Some(reference) = cursor.next() else {
                    break;
                };
                scanned += 1;
                if seen.insert(reference.id()) {
                    out.push(reference);
                }
            }
            cursor.release();
        }
        out.sort_by_key(|r| r.id());
        out
    }
}
