pub mod context;
pub mod cursor;
pub mod error;
pub mod filter;
pub mod group;
pub mod message;
pub mod queue;
pub mod reference;
pub mod region;
pub mod selector;
pub mod statistics;
pub mod store;
pub mod subscription;
pub mod task;
pub mod transaction;
pub mod usage;
