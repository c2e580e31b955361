//! Local transactions.
//!
//! Queue operations enlisted in a transaction register a
//! [`Synchronization`]; exactly one of its callbacks runs when the
//! transaction completes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::error::BlipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn from_raw(value: u64) -> Self {
        TransactionId(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}", self.0)
    }
}

pub trait Synchronization: Send {
    fn after_commit(self: Box<Self>) -> Result<(), BlipError>;
    fn after_rollback(self: Box<Self>) -> Result<(), BlipError>;
}

type CommitFn = Box<dyn FnOnce() -> Result<(), BlipError> + Send>;
type RollbackFn = Box<dyn FnOnce() + Send>;

/// Closure-backed [`Synchronization`].
pub struct TransactionCallbacks {
    on_commit: CommitFn,
    on_rollback: RollbackFn,
}

impl TransactionCallbacks {
    pub fn new<C, R>(on_commit: C, on_rollback: R) -> Box<Self>
    where
        C: FnOnce() -> Result<(), BlipError> + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        Box::new(Self {
            on_commit: Box::new(on_commit),
            on_rollback: Box::new(on_rollback),
        })
    }
}

impl Synchronization for TransactionCallbacks {
    fn after_commit(self: Box<Self>) -> Result<(), BlipError> {
        (self.on_commit)()
    }

    fn after_rollback(self: Box<Self>) -> Result<(), BlipError> {
        (self.on_rollback)();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    id: TransactionId,
    state: Mutex<TransactionState>,
    synchronizations: Mutex<Vec<Box<dyn Synchronization>>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("synchronizations", &self.synchronizations.lock().len())
            .finish()
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

impl Transaction {
    pub fn begin() -> Arc<Self> {
        Self::with_id(TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn with_id(id: TransactionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(TransactionState::Active),
            synchronizations: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn add_synchronization(&self, sync: Box<dyn Synchronization>) -> Result<(), BlipError> {
        let state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(BlipError::TransactionNotActive(self.id));
        }
        self.synchronizations.lock().push(sync);
        Ok(())
    }

    fn finish(&self, next: TransactionState) -> Result<Vec<Box<dyn Synchronization>>, BlipError> {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(BlipError::TransactionNotActive(self.id));
        }
        *state = next;
        Ok(std::mem::take(&mut *self.synchronizations.lock()))
    }

    /// Run every commit callback in registration order. All callbacks run even
    /// if one fails; the first failure is returned.
    pub fn commit(&self) -> Result<(), BlipError> {
        let syncs = self.finish(TransactionState::Committed)?;
        let mut first_error = None;
        for sync in syncs {
            if let Err(e) = sync.after_commit() {
                warn!(transaction = %self.id, error = %e, "commit callback failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn rollback(&self) -> Result<(), BlipError> {
        let syncs = self.finish(TransactionState::RolledBack)?;
        for sync in syncs {
            if let Err(e) = sync.after_rollback() {
                warn!(transaction = %self.id, error = %e, "rollback callback failed");
            }
        }
        Ok(())
    }
}
