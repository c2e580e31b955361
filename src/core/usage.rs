//! Capacity gates used for producer flow control.
//!
//! A [`Usage`] tracks bytes against a limit. Producers consult
//! [`Usage::is_full`] before sending and either fail, wait with
//! [`Usage::wait_for_space`], or park a callback with
//! [`Usage::notify_when_not_full`] that runs once the gate reopens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::UsageConfig;

type NotFullCallback = Box<dyn FnOnce() + Send>;

pub struct Usage {
    name: String,
    /// `0` means unlimited.
    limit: u64,
    used: AtomicU64,
    notify: Notify,
    callbacks: Mutex<Vec<NotFullCallback>>,
}

impl fmt::Debug for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Usage")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("used", &self.usage())
            .finish()
    }
}

impl Usage {
    pub fn new(name: impl Into<String>, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit,
            used: AtomicU64::new(0),
            notify: Notify::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn usage(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn percent_usage(&self) -> u32 {
        if self.limit == 0 {
            return 0;
        }
        ((self.usage().saturating_mul(100)) / self.limit) as u32
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.limit != 0 && self.usage() >= self.limit
    }

    pub fn increase_usage(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn decrease_usage(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
        if !self.is_full() {
            self.fire_not_full();
        }
    }

    fn fire_not_full(&self) {
        self.notify.notify_waiters();
        let pending: Vec<NotFullCallback> = std::mem::take(&mut *self.callbacks.lock());
        for callback in pending {
            callback();
        }
    }

    /// Wait until the gate has room or `timeout` elapses. Returns whether
    /// there is room.
    pub async fn wait_for_space(&self, timeout: Duration) -> bool {
        if !self.is_full() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_full() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_full();
            }
        }
    }

    /// Register `callback` to run the next time usage drops below the limit.
    ///
    /// Returns `false` (and drops the callback unrun) when the gate already
    /// has room; the caller should proceed immediately in that case.
    pub fn notify_when_not_full(&self, callback: NotFullCallback) -> bool {
        let mut callbacks = self.callbacks.lock();
        if !self.is_full() {
            return false;
        }
        callbacks.push(callback);
        true
    }
}

/// The three gates a queue consults.
#[derive(Debug, Clone)]
pub struct SystemUsage {
    pub memory: Arc<Usage>,
    pub store: Arc<Usage>,
    pub temp: Arc<Usage>,
}

impl SystemUsage {
    pub fn from_config(config: &UsageConfig) -> Self {
        Self {
            memory: Usage::new("memory", config.memory_limit_bytes),
            store: Usage::new("store", config.store_limit_bytes),
            temp: Usage::new("temp", config.temp_limit_bytes),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            memory: Usage::unlimited("memory"),
            store: Usage::unlimited("store"),
            temp: Usage::unlimited("temp"),
        }
    }
}

impl Default for SystemUsage {
    fn default() -> Self {
        Self::unlimited()
    }
}
