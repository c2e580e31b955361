//! Wake-up driven execution of a destination's dispatch loop.
//!
//! A [`Task`] does a bounded slice of work per [`Task::iterate`] call and
//! reports whether more is pending. A [`TaskRunner`] turns any number of
//! [`TaskRunner::wakeup`] calls into iterations, coalescing wake-ups that
//! arrive while the task is already scheduled. Runners hold the task
//! weakly so a destination can be dropped while its runner is alive.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub trait Task: Send + Sync {
    /// Run one slice of work. Returns `true` if another iteration should
    /// follow immediately.
    fn iterate(&self) -> bool;
}

pub trait TaskRunner: Send + Sync + Debug {
    fn wakeup(&self);

    /// Stop scheduling iterations. Idempotent.
    fn shutdown(&self);
}

pub trait TaskRunnerFactory: Send + Sync + Debug {
    fn create(&self, task: Weak<dyn Task>, name: &str) -> Box<dyn TaskRunner>;
}

/// Runs the task on its own tokio task, parked on a [`Notify`] between
/// bursts of work.
#[derive(Debug)]
pub struct DedicatedTaskRunner {
    name: String,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DedicatedTaskRunner {
    pub fn spawn(runtime: &Handle, task: Weak<dyn Task>, name: &str) -> Self {
        let notify = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_notify = notify.clone();
        let loop_shutdown = shutdown.clone();
        let loop_name = name.to_string();
        let handle = runtime.spawn(async move {
            loop {
                loop_notify.notified().await;
                if loop_shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(task) = task.upgrade() else {
                    break;
                };
                while task.iterate() {
                    if loop_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            trace!(runner = %loop_name, "task runner exited");
        });

        Self {
            name: name.to_string(),
            notify,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }
}

impl TaskRunner for DedicatedTaskRunner {
    fn wakeup(&self) {
        if !self.shutdown.load(Ordering::Acquire) {
            // notify_one stores a permit, so wake-ups during an iteration
            // collapse into one follow-up pass.
            self.notify.notify_one();
        }
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_one();
        self.handle.lock().take();
        debug!(runner = %self.name, "task runner shut down");
    }
}

impl Drop for DedicatedTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns a [`DedicatedTaskRunner`] per destination on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTaskRunnerFactory {
    runtime: Handle,
}

impl TokioTaskRunnerFactory {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Factory bound to the runtime the caller is running on.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl TaskRunnerFactory for TokioTaskRunnerFactory {
    fn create(&self, task: Weak<dyn Task>, name: &str) -> Box<dyn TaskRunner> {
        Box::new(DedicatedTaskRunner::spawn(&self.runtime, task, name))
    }
}

/// Runs iterations inline on the thread that calls [`TaskRunner::wakeup`].
///
/// A wake-up that arrives while an iteration is in progress (from another
/// thread or re-entrantly from the task itself) is recorded and served by
/// the thread already running, never by a nested call. Callers must not
/// hold any lock the task takes when they call `wakeup`.
#[derive(Debug)]
pub struct SyncTaskRunner {
    name: String,
    task: Weak<dyn Task>,
    running: AtomicBool,
    pending: AtomicBool,
    shutdown: AtomicBool,
}

impl SyncTaskRunner {
    pub fn new(task: Weak<dyn Task>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            task,
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl TaskRunner for SyncTaskRunner {
    fn wakeup(&self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.pending.store(true, Ordering::Release);
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while self.pending.swap(false, Ordering::AcqRel) {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(task) = self.task.upgrade() else {
                    break;
                };
                while task.iterate() {}
            }
            self.running.store(false, Ordering::Release);
            // A wake-up may have landed between the last swap and the store.
            if !self.pending.load(Ordering::Acquire) {
                break;
            }
        }
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!(runner = %self.name, "task runner shut down");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTaskRunnerFactory;

impl TaskRunnerFactory for SyncTaskRunnerFactory {
    fn create(&self, task: Weak<dyn Task>, name: &str) -> Box<dyn TaskRunner> {
        Box::new(SyncTaskRunner::new(task, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Runs `budget` iterations per wake-up burst.
    struct Counter {
        iterations: AtomicUsize,
        remaining: AtomicUsize,
    }

    impl Counter {
        fn new(remaining: usize) -> Arc<Self> {
            Arc::new(Self {
                iterations: AtomicUsize::new(0),
                remaining: AtomicUsize::new(remaining),
            })
        }
    }

    impl Task for Counter {
        fn iterate(&self) -> bool {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            let left = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
                .unwrap_or(0);
            left > 1
        }
    }

    fn weak(task: &Arc<Counter>) -> Weak<dyn Task> {
        let task: Arc<dyn Task> = task.clone();
        Arc::downgrade(&task)
    }

    #[test]
    fn sync_runner_iterates_until_idle() {
        let task = Counter::new(3);
        let runner = SyncTaskRunnerFactory.create(weak(&task), "q");
        runner.wakeup();
        assert_eq!(task.iterations.load(Ordering::SeqCst), 3);

        runner.wakeup();
        assert_eq!(task.iterations.load(Ordering::SeqCst), 4);

        runner.shutdown();
        runner.wakeup();
        assert_eq!(task.iterations.load(Ordering::SeqCst), 4);
    }

    struct Reentrant {
        runner: Mutex<Option<Arc<SyncTaskRunner>>>,
        calls: AtomicUsize,
    }

    impl Task for Reentrant {
        fn iterate(&self) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                let runner = self.runner.lock().clone();
                if let Some(runner) = runner {
                    runner.wakeup();
                }
            }
            false
        }
    }

    #[test]
    fn sync_runner_defers_reentrant_wakeup() {
        let task = Arc::new(Reentrant {
            runner: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let dyn_task: Arc<dyn Task> = task.clone();
        let runner = Arc::new(SyncTaskRunner::new(Arc::downgrade(&dyn_task), "q"));
        *task.runner.lock() = Some(runner.clone());

        runner.wakeup();
        assert_eq!(task.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dedicated_runner_serves_wakeups() {
        let task = Counter::new(5);
        let factory = TokioTaskRunnerFactory::current().unwrap();
        let runner = factory.create(weak(&task), "orders");

        runner.wakeup();
        tokio::time::timeout(Duration::from_secs(5), async {
            while task.iterations.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        runner.shutdown();
    }
}
