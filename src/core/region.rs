//! Registry of queues sharing one id sequence, one set of usage gates and
//! one persistence adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{Config, QueuePolicy};
use crate::core::error::BlipError;
use crate::core::message::MessageId;
use crate::core::queue::Queue;
use crate::core::store::PersistenceAdapter;
use crate::core::task::{SyncTaskRunnerFactory, TaskRunnerFactory};
use crate::core::usage::SystemUsage;

/// Monotonic broker-wide message id sequence.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId::from_raw(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure ids handed out from now on are above `id`.
    pub fn advance_past(&self, id: MessageId) {
        self.next.fetch_max(id.value() + 1, Ordering::Relaxed);
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// [`QueueRegion`] creates queues on first use and keeps them by name.
#[derive(Debug)]
pub struct QueueRegion {
    config: Config,
    usage: SystemUsage,
    ids: Arc<MessageIdGenerator>,
    runners: Arc<dyn TaskRunnerFactory>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    queues: DashMap<String, Arc<Queue>>,
}

impl QueueRegion {
    pub fn new(config: Config) -> Self {
        let usage = SystemUsage::from_config(&config.usage);
        Self {
            config,
            usage,
            ids: Arc::new(MessageIdGenerator::default()),
            runners: Arc::new(SyncTaskRunnerFactory),
            persistence: None,
            queues: DashMap::new(),
        }
    }

    pub fn with_task_runners(mut self, runners: Arc<dyn TaskRunnerFactory>) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn usage(&self) -> &SystemUsage {
        &self.usage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Existing queue by name, or a new started one using the region's
    /// default policy.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Queue>, BlipError> {
        self.get_or_create_with_policy(name, self.config.queue.clone())
    }

    /// Like [`get_or_create`](Self::get_or_create) but with an explicit
    /// policy for a queue that does not exist yet. The dead-letter queue the
    /// policy names is created first, with default policy and no
    /// dead-letter queue of its own.
    pub fn get_or_create_with_policy(
        &self,
        name: &str,
        policy: QueuePolicy,
    ) -> Result<Arc<Queue>, BlipError> {
        if let Some(queue) = self.lookup(name) {
            return Ok(queue);
        }

        let dead_letter = match policy.dead_letter_queue.as_deref() {
            Some(dlq) if dlq != name => {
                let dlq_policy = QueuePolicy {
                    dead_letter_queue: None,
                    ..self.config.queue.clone()
                };
                Some(self.get_or_create_with_policy(dlq, dlq_policy)?)
            }
            _ => None,
        };

        let queue = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let mut builder = Queue::builder(name)
                    .policy(policy)
                    .usage(self.usage.clone())
                    .ids(self.ids.clone())
                    .task_runners(self.runners.clone());
                if let Some(persistence) = &self.persistence {
                    builder = builder.store(persistence.create_queue_store(name)?);
                }
                let queue = builder.build()?;
                queue.set_dead_letter_queue(dead_letter);
                debug!(queue = name, "queue not found; creating new");
                entry.insert(queue.clone());
                queue
            }
        };
        queue.start()?;
        Ok(queue)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    /// Stop and forget a queue.
    pub fn remove(&self, name: &str) -> Option<Arc<Queue>> {
        let (_, queue) = self.queues.remove(name)?;
        queue.stop();
        info!(queue = name, "queue removed");
        Some(queue)
    }

    /// Sorted names of every registered queue.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stop_all(&self) {
        for entry in self.queues.iter() {
            entry.value().stop();
        }
    }
}
