//! The queue delivery engine.
//!
//! A [`Queue`] owns one destination's backlog and moves messages from the
//! pending cursor into consumers:
//!
//! ```text
//! send ─► flow control ─► store + cursor ─► page-in ─► pending ─► dispatch ─► consumer
//!                                                                   ▲              │
//!                                          redelivery on detach ────┴──────────────┤
//!                                                                 ack / expiry ◄───┘
//! ```
//!
//! Locks are always taken in this order and never held across an `.await`:
//! iteration lock, consumer (writer) lock, dispatch state, cursor. Nothing
//! wakes its own queue while holding any of them.
//!
//! A message id lives in at most one of: the cursor, the pending-dispatch
//! list, the in-flight working set.

mod ack;
mod admin;
mod dispatch;
mod expiry;
mod replication;
mod send;

pub use replication::MessageDispatchNotification;
pub use send::{SendOutcome, SendReceipt};

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CursorKind, QueuePolicy};
use crate::core::context::ConnectionContext;
use crate::core::cursor::{PendingCursor, StorePendingCursor, VmPendingCursor};
use crate::core::error::BlipError;
use crate::core::group::MessageGroupMap;
use crate::core::message::{Message, MessageAck, MessageId};
use crate::core::reference::MessageReference;
use crate::core::region::MessageIdGenerator;
use crate::core::selector::DispatchSelector;
use crate::core::statistics::{DestinationStatistics, DestinationStatisticsSnapshot};
use crate::core::store::{MessageRecoveryListener, MessageStore};
use crate::core::subscription::{ConsumerId, Subscription};
use crate::core::task::{SyncTaskRunnerFactory, Task, TaskRunner, TaskRunnerFactory};
use crate::core::usage::{SystemUsage, Usage};

use send::DeferredSend;

/// Everything guarded by the writer lock.
struct Consumers {
    /// Dispatch order. Browsers are kept apart in `browsers`.
    list: Vec<Arc<dyn Subscription>>,
    selector: DispatchSelector,
    groups: MessageGroupMap,
    browsers: Vec<BrowserDispatch>,
    dispatch_started: bool,
    first_consumer_at: Option<Instant>,
    start_timer_armed: bool,
}

impl Consumers {
    fn find(&self, id: &ConsumerId) -> Option<&Arc<dyn Subscription>> {
        self.list.iter().find(|s| s.consumer_id() == id)
    }
}

/// A browser waiting for its subscribe-time snapshot. Each reference in
/// `snapshot` carries one hold until it is delivered or discarded.
struct BrowserDispatch {
    sub: Arc<dyn Subscription>,
    snapshot: Vec<Arc<MessageReference>>,
}

impl BrowserDispatch {
    fn release(self) {
        for reference in &self.snapshot {
            reference.decrement_reference_count();
        }
    }
}

#[derive(Default)]
struct DispatchState {
    /// Dispatched and not yet settled, by id.
    working_set: BTreeMap<MessageId, Arc<MessageReference>>,
    /// Paged in or handed back, waiting for a consumer.
    pending: VecDeque<Arc<MessageReference>>,
}

impl DispatchState {
    fn is_resident(&self, id: MessageId) -> bool {
        self.working_set.contains_key(&id) || self.pending.iter().any(|r| r.id() == id)
    }
}

pub struct Queue {
    name: String,
    policy: QueuePolicy,
    usage: SystemUsage,
    store: Option<Arc<dyn MessageStore>>,
    store_cursor: bool,
    ids: Arc<MessageIdGenerator>,
    stats: DestinationStatistics,
    self_ref: Weak<Queue>,

    iteration: Mutex<()>,
    consumers: RwLock<Consumers>,
    dispatch: Mutex<DispatchState>,
    cursor: Mutex<Box<dyn PendingCursor>>,

    deferred: Mutex<VecDeque<DeferredSend>>,
    space_callback_armed: AtomicBool,
    last_blocked_warning: Mutex<Option<Instant>>,

    runner: Box<dyn TaskRunner>,
    dead_letter: Mutex<Option<Arc<Queue>>>,
    slave: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("slave", &self.is_slave())
            .field("stopped", &self.is_stopped())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

pub struct QueueBuilder {
    name: String,
    policy: QueuePolicy,
    usage: SystemUsage,
    store: Option<Arc<dyn MessageStore>>,
    ids: Option<Arc<MessageIdGenerator>>,
    runners: Option<Arc<dyn TaskRunnerFactory>>,
}

impl QueueBuilder {
    pub fn policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn usage(mut self, usage: SystemUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ids(mut self, ids: Arc<MessageIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Runner factory for the dispatch loop. Defaults to running inline;
    /// `optimized_dispatch` always runs inline.
    pub fn task_runners(mut self, runners: Arc<dyn TaskRunnerFactory>) -> Self {
        self.runners = Some(runners);
        self
    }

    pub fn build(self) -> Result<Arc<Queue>, BlipError> {
        let QueueBuilder {
            name,
            policy,
            usage,
            store,
            ids,
            runners,
        } = self;

        let store_cursor = policy.cursor == CursorKind::Store && store.is_some();
        let cursor: Box<dyn PendingCursor> = match (&store, store_cursor) {
            (Some(store), true) => Box::new(StorePendingCursor::new(
                store.clone(),
                usage.memory.clone(),
                usage.temp.clone(),
                policy.max_page_size,
                policy.max_audit_depth,
            )?),
            _ => {
                if policy.cursor == CursorKind::Store {
                    warn!(queue = %name, "store cursor requested without a store, using vm cursor");
                }
                Box::new(VmPendingCursor::new(policy.max_audit_depth))
            }
        };

        let runners: Arc<dyn TaskRunnerFactory> = match runners {
            Some(runners) if !policy.optimized_dispatch => runners,
            _ => Arc::new(SyncTaskRunnerFactory),
        };

        let queue = Arc::new_cyclic(|weak: &Weak<Queue>| {
            let task: Weak<dyn Task> = weak.clone();
            let runner = runners.create(task, &name);
            Queue {
                policy,
                usage,
                store,
                store_cursor,
                ids: ids.unwrap_or_default(),
                stats: DestinationStatistics::default(),
                self_ref: weak.clone(),
                iteration: Mutex::new(()),
                consumers: RwLock::new(Consumers {
                    list: Vec::new(),
                    selector: DispatchSelector::new(),
                    groups: MessageGroupMap::new(),
                    browsers: Vec::new(),
                    dispatch_started: false,
                    first_consumer_at: None,
                    start_timer_armed: false,
                }),
                dispatch: Mutex::new(DispatchState::default()),
                cursor: Mutex::new(cursor),
                deferred: Mutex::new(VecDeque::new()),
                space_callback_armed: AtomicBool::new(false),
                last_blocked_warning: Mutex::new(None),
                runner,
                dead_letter: Mutex::new(None),
                slave: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                timers: Mutex::new(Vec::new()),
                name,
            }
        });
        Ok(queue)
    }
}

impl Queue {
    pub fn builder(name: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            name: name.into(),
            policy: QueuePolicy::default(),
            usage: SystemUsage::default(),
            store: None,
            ids: None,
            runners: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn usage(&self) -> &SystemUsage {
        &self.usage
    }

    pub fn stats(&self) -> DestinationStatisticsSnapshot {
        self.stats.snapshot()
    }

    /// A strong handle to this queue, if it is still alive.
    pub fn handle(&self) -> Option<Arc<Queue>> {
        self.self_ref.upgrade()
    }

    pub fn is_slave(&self) -> bool {
        self.slave.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_dead_letter_queue(&self, queue: Option<Arc<Queue>>) {
        if queue.as_ref().is_some_and(|q| q.name == self.name) {
            warn!(queue = %self.name, "a queue cannot be its own dead-letter queue");
            return;
        }
        *self.dead_letter.lock() = queue;
    }

    pub fn dead_letter_queue(&self) -> Option<Arc<Queue>> {
        self.dead_letter.lock().clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().list.len()
    }

    pub fn exclusive_consumer(&self) -> Option<ConsumerId> {
        self.consumers.read().selector.exclusive_consumer().cloned()
    }

    /// Groups currently owned by `consumer`, sorted.
    pub fn groups_of(&self, consumer: &ConsumerId) -> Vec<String> {
        self.consumers.read().groups.groups_of(consumer)
    }

    /// Messages waiting in the cursor or the pending-dispatch list.
    pub fn pending_count(&self) -> usize {
        let pending = self.dispatch.lock().pending.len();
        pending + self.cursor.lock().size()
    }

    /// References paged out of the cursor that no consumer has taken yet.
    pub fn paged_in_pending_count(&self) -> usize {
        self.dispatch.lock().pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.dispatch.lock().working_set.len()
    }

    /// Recover stored messages and start background timers. Idempotent.
    pub fn start(&self) -> Result<(), BlipError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.recover()?;

        if let Some(period) = self.policy.expire_messages_period() {
            match Handle::try_current() {
                Ok(runtime) => {
                    let weak = self.self_ref.clone();
                    let handle = runtime.spawn(async move {
                        let mut interval = tokio::time::interval(period);
                        interval.tick().await;
                        loop {
                            interval.tick().await;
                            let Some(queue) = weak.upgrade() else {
                                break;
                            };
                            if queue.is_stopped() {
                                break;
                            }
                            queue.expire_messages();
                        }
                    });
                    self.timers.lock().push(handle);
                }
                Err(_) => debug!(queue = %self.name, "no runtime, periodic expiry disabled"),
            }
        }

        info!(queue = %self.name, cursor = ?self.policy.cursor, "queue started");
        self.wakeup();
        Ok(())
    }

    /// Stop dispatching, cancel timers and fail parked sends.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runner.shutdown();
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        let parked: Vec<DeferredSend> = self.deferred.lock().drain(..).collect();
        for send in parked {
            send.complete(Err(BlipError::QueueStopped(self.name.clone())));
        }
        info!(queue = %self.name, "queue stopped");
    }

    pub fn wakeup(&self) {
        self.runner.wakeup();
    }

    /// Wake-up for callers that may be running under this queue's locks
    /// (usage callbacks, timers). Hops onto the runtime when there is one,
    /// otherwise onto a short-lived thread.
    fn wakeup_detached(&self) {
        let weak = self.self_ref.clone();
        let wake = move || {
            if let Some(queue) = weak.upgrade() {
                queue.wakeup();
            }
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { wake() });
            }
            Err(_) => {
                std::thread::spawn(wake);
            }
        }
    }

    fn schedule_wakeup(&self, delay: Duration) {
        if let Ok(runtime) = Handle::try_current() {
            let weak = self.self_ref.clone();
            let handle = runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(queue) = weak.upgrade() {
                    queue.wakeup();
                }
            });
            self.timers.lock().push(handle);
        }
    }

    /// Switch between normal dispatch and replaying a master's dispatch
    /// decisions.
    pub fn set_slave(&self, slave: bool) {
        let was = self.slave.swap(slave, Ordering::AcqRel);
        if was != slave {
            info!(queue = %self.name, slave, "dispatch mode changed");
            if !slave {
                self.wakeup();
            }
        }
    }

    pub fn add_subscription(
        &self,
        context: &ConnectionContext,
        sub: Arc<dyn Subscription>,
    ) -> Result<(), BlipError> {
        if self.is_stopped() {
            return Err(BlipError::QueueStopped(self.name.clone()));
        }
        {
            let mut consumers = self.consumers.write();
            if sub.is_browser() {
                let snapshot = self.snapshot_for_browser();
                debug!(
                    queue = %self.name,
                    browser = %sub.consumer_id(),
                    snapshot = snapshot.len(),
                    "browser attached"
                );
                consumers.browsers.push(BrowserDispatch { sub, snapshot });
            } else {
                if consumers.find(sub.consumer_id()).is_some() {
                    return Err(BlipError::Subscription(format!(
                        "consumer {} already subscribed to {}",
                        sub.consumer_id(),
                        self.name
                    )));
                }
                debug!(
                    queue = %self.name,
                    consumer = %sub.consumer_id(),
                    client = context.client_id(),
                    prefetch = sub.info().prefetch_size,
                    "consumer attached"
                );
                insert_consumer(&mut consumers.list, sub, self.policy.prioritized_consumers);
                consumers.first_consumer_at.get_or_insert_with(Instant::now);
                let Consumers { list, selector, .. } = &mut *consumers;
                selector.elect_exclusive(list.as_slice(), self.policy.all_consumers_exclusive_by_default);
                DestinationStatistics::increment(&self.stats.consumers);
            }
        }
        self.wakeup();
        Ok(())
    }

    /// Detach a consumer and hand its in-flight messages back for
    /// redelivery. Messages at or below `last_delivered` (every message
    /// when `None`) are counted as redelivered.
    pub fn remove_subscription(
        &self,
        context: &ConnectionContext,
        consumer: &ConsumerId,
        last_delivered: Option<MessageId>,
    ) -> Result<(), BlipError> {
        {
            let mut consumers = self.consumers.write();

            if let Some(pos) = consumers
                .browsers
                .iter()
                .position(|b| b.sub.consumer_id() == consumer)
            {
                consumers.browsers.remove(pos).release();
                return Ok(());
            }

            let Some(pos) = consumers
                .list
                .iter()
                .position(|s| s.consumer_id() == consumer)
            else {
                debug!(queue = %self.name, %consumer, "remove for unknown consumer ignored");
                return Ok(());
            };
            let sub = consumers.list.remove(pos);
            DestinationStatistics::decrement(&self.stats.consumers);

            let Consumers {
                list,
                selector,
                groups,
                ..
            } = &mut *consumers;
            selector.elect_exclusive(list.as_slice(), self.policy.all_consumers_exclusive_by_default);
            let released = groups.remove_consumer(consumer);

            let in_flight = sub.remove();
            let mut redeliver = Vec::with_capacity(in_flight.len());
            {
                let mut state = self.dispatch.lock();
                for reference in in_flight {
                    reference.unlock();
                    if state.working_set.remove(&reference.id()).is_some() {
                        DestinationStatistics::decrement(&self.stats.inflight);
                    }
                    if reference.is_dropped() {
                        continue;
                    }
                    if last_delivered.map_or(true, |seq| reference.id() <= seq) {
                        reference.increment_redelivery_counter();
                        DestinationStatistics::increment(&self.stats.redelivered);
                    }
                    redeliver.push(reference);
                }
                redeliver.sort_by_key(|r| r.id());
                for reference in redeliver.iter().rev() {
                    state.pending.push_front(reference.clone());
                }
            }

            info!(
                queue = %self.name,
                %consumer,
                client = context.client_id(),
                redelivered = redeliver.len(),
                released_groups = released.len(),
                "consumer detached"
            );

            if !self.is_slave() && consumers.dispatch_started {
                self.do_dispatch(&mut consumers, Vec::new());
            }
        }
        self.wakeup();
        Ok(())
    }

    /// Load persisted messages into a memory cursor. A store cursor pages
    /// them in itself, so its backlog is only counted and charged to the
    /// store gate.
    fn recover(&self) -> Result<(), BlipError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if let Some(last) = store.last_message_id()? {
            self.ids.advance_past(last);
        }
        let mut cursor = self.cursor.lock();
        let recovered = if cursor.is_store_backed() {
            let mut scan = StoredBytes::default();
            store.recover(&mut scan)?;
            self.usage.store.increase_usage(scan.bytes);
            cursor.size()
        } else {
            let mut listener = CursorRecovery {
                store: store.clone(),
                memory: self.usage.memory.clone(),
                store_usage: self.usage.store.clone(),
                cursor: cursor.as_mut(),
                recovered: 0,
            };
            store.recover(&mut listener)?;
            let remaining = store.message_count()?.saturating_sub(listener.recovered);
            if remaining > 0 {
                warn!(queue = %self.name, remaining, "memory limit reached during recovery");
            }
            listener.recovered
        };
        drop(cursor);

        if recovered > 0 {
            self.stats
                .enqueues
                .fetch_add(recovered as u64, Ordering::Relaxed);
            self.stats
                .messages
                .fetch_add(recovered as u64, Ordering::Relaxed);
            info!(queue = %self.name, recovered, "recovered stored messages");
        }
        Ok(())
    }

    fn snapshot_for_browser(&self) -> Vec<Arc<MessageReference>> {
        let snapshot = self.collect_references(self.policy.max_browse_page_size);
        for reference in &snapshot {
            reference.increment_reference_count();
        }
        snapshot
    }

    fn dispatch_browsers(&self, consumers: &mut Consumers) {
        for browser in std::mem::take(&mut consumers.browsers) {
            for reference in &browser.snapshot {
                if reference.is_dropped() || reference.is_acked() || reference.is_expired() {
                    continue;
                }
                if !consumers.selector.can_select(browser.sub.as_ref(), reference) {
                    continue;
                }
                if let Err(e) = browser.sub.add(reference.clone()) {
                    debug!(queue = %self.name, browser = %browser.sub.consumer_id(), error = %e, "browse delivery failed");
                    break;
                }
            }
            browser.sub.browse_done();
            browser.release();
        }
    }

    /// Opens once enough consumers joined or the start delay elapsed.
    fn dispatch_gate_open(&self, consumers: &mut Consumers) -> bool {
        if consumers.dispatch_started {
            return true;
        }
        let needed = self.policy.consumers_before_dispatch_starts;
        let delay = self.policy.time_before_dispatch_starts();
        let joined = consumers.list.len();

        let open = match (needed, delay) {
            (0, None) => true,
            _ if joined == 0 => false,
            _ => {
                let by_count = needed > 0 && joined >= needed;
                let by_time = match (delay, consumers.first_consumer_at) {
                    (Some(delay), Some(first)) => first.elapsed() >= delay,
                    _ => false,
                };
                by_count || by_time
            }
        };

        if open {
            consumers.dispatch_started = true;
            debug!(queue = %self.name, consumers = joined, "dispatch started");
        } else if let (Some(delay), Some(first), false) =
            (delay, consumers.first_consumer_at, consumers.start_timer_armed)
        {
            consumers.start_timer_armed = true;
            self.schedule_wakeup(delay.saturating_sub(first.elapsed()));
        }
        open
    }

    /// Take the queue's hold off a settled reference and forget it.
    fn drop_message(&self, reference: &Arc<MessageReference>) {
        {
            let mut state = self.dispatch.lock();
            if state.working_set.remove(&reference.id()).is_some() {
                DestinationStatistics::decrement(&self.stats.inflight);
            } else {
                state.pending.retain(|r| r.id() != reference.id());
            }
        }
        if reference.drop_reference() {
            DestinationStatistics::decrement(&self.stats.messages);
        }
    }

    fn remove_from_store(&self, reference: &MessageReference, id: MessageId) -> Result<(), BlipError> {
        if !reference.is_persistent() {
            return Ok(());
        }
        if let Some(store) = &self.store {
            let ack = MessageAck::individual(&self.name, ConsumerId::new("broker"), id);
            store.remove_message(&ack)?;
            self.usage.store.decrease_usage(reference.size() as u64);
        }
        Ok(())
    }

    /// Copy `reference` into the dead-letter queue, if one is configured.
    fn dead_letter(&self, reference: &MessageReference, cause: &str) -> bool {
        let Some(dlq) = self.dead_letter_queue() else {
            debug!(queue = %self.name, message_id = %reference.id(), cause, "no dead-letter queue, discarding");
            return false;
        };
        let Some(message) = reference.message() else {
            warn!(queue = %self.name, message_id = %reference.id(), "cannot dead-letter message without body");
            return false;
        };
        let mut copy: Message = message.copy_for(dlq.name());
        copy.dead_letter_cause = Some(cause.to_string());
        copy.redelivery_counter = reference.redelivery_counter();
        copy.expiration = 0;
        match dlq.enqueue_internal(copy) {
            Ok(id) => {
                DestinationStatistics::increment(&self.stats.dead_lettered);
                debug!(queue = %self.name, message_id = %reference.id(), dlq = dlq.name(), dlq_id = %id, cause, "dead-lettered");
                dlq.wakeup();
                true
            }
            Err(e) => {
                warn!(queue = %self.name, message_id = %reference.id(), error = %e, "dead-letter forward failed");
                false
            }
        }
    }
}

impl Task for Queue {
    fn iterate(&self) -> bool {
        let _iteration = self.iteration.lock();
        if self.is_stopped() {
            return false;
        }

        self.drain_deferred_sends();

        let mut consumers = self.consumers.write();
        if !consumers.browsers.is_empty() {
            self.dispatch_browsers(&mut consumers);
        }
        if self.is_slave() || !self.dispatch_gate_open(&mut consumers) {
            return false;
        }

        let (paged, expired) = self.page_in(false, self.policy.max_page_size, &consumers);
        let outcome = self.do_dispatch(&mut consumers, paged);
        outcome.wake_again || expired > 0
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

/// Insert keeping higher priorities first; a consumer lands at the end of
/// its priority band.
fn insert_consumer(list: &mut Vec<Arc<dyn Subscription>>, sub: Arc<dyn Subscription>, prioritized: bool) {
    if !prioritized {
        list.push(sub);
        return;
    }
    let priority = sub.info().priority;
    let index = list
        .iter()
        .position(|s| s.info().priority < priority)
        .unwrap_or(list.len());
    list.insert(index, sub);
}

/// Sums the size of every stored message without keeping any of them.
#[derive(Default)]
struct StoredBytes {
    bytes: u64,
}

impl MessageRecoveryListener for StoredBytes {
    fn recover_message(&mut self, message: Arc<Message>) -> bool {
        self.bytes += message.size() as u64;
        true
    }

    fn has_space(&self) -> bool {
        true
    }
}

struct CursorRecovery<'a> {
    store: Arc<dyn MessageStore>,
    memory: Arc<Usage>,
    store_usage: Arc<Usage>,
    cursor: &'a mut dyn PendingCursor,
    recovered: usize,
}

impl MessageRecoveryListener for CursorRecovery<'_> {
    fn recover_message(&mut self, message: Arc<Message>) -> bool {
        let Some(id) = message.id else {
            warn!(destination = self.store.destination(), "skipping stored message without id");
            return true;
        };
        self.store_usage.increase_usage(message.size() as u64);
        let reference = MessageReference::new(
            id,
            message,
            Some(self.store.clone()),
            Some(self.memory.clone()),
        );
        reference.increment_reference_count();
        if self.cursor.add_message_last(reference) {
            self.recovered += 1;
        }
        true
    }

    fn has_space(&self) -> bool {
        !self.memory.is_full()
    }
}
