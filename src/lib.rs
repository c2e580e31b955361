//! BlipQ – the queue delivery engine behind BlipMQ.
//!
//! This crate exports
//!  * `core`    – message references, cursors, dispatch, flow control, the
//!    queue orchestrator and the region that owns queues
//!  * `config`  – TOML-driven queue policy and usage limits
//!  * `logging` – tracing subscriber setup
//!
//! Embedders create a [`QueueRegion`], attach [`Subscription`]s to its
//! queues and drive sends through [`Queue::send`]. The `blipq-sim` binary
//! under `src/bin/` does exactly that.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config, QueuePolicy};
pub use core::error::BlipError;
pub use core::queue::{Queue, SendOutcome};
pub use core::region::QueueRegion;
pub use core::subscription::Subscription;
