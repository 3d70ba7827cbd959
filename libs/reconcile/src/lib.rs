//! Reconciliation loop primitives.
//!
//! This library provides a generic, watch-driven control loop that converges
//! cluster objects towards their desired state. Key concepts:
//!
//! - **Store**: local cache mirrored from a watch stream by a reflector.
//! - **Work queue**: per-key FIFO with single-flight dispatch and parked retries.
//! - **Handler**: resource-specific logic (`on_create`, `on_update`, `on_delete`).
//! - **Engine**: wires the above together with a bounded worker pool.
//!
//! # Invariants
//!
//! - Nothing is dispatched before the cache has completed its initial listing
//! - A key is never processed by two workers at once
//! - Handlers see the cached object, never a stale event payload
//! - A failing or panicking handler only affects its own key

mod engine;
mod error;
mod event;
mod handler;
mod hash;
mod key;
mod ownership;
mod queue;
mod ratelimit;
mod store;

pub use engine::{
    Engine, EngineConfig, EngineStats, EventHook, StatsSnapshot, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_WORKERS,
};
pub use error::EngineError;
pub use event::{ChangeSet, Operation, ReconcileEvent, WatchEvent};
pub use handler::{Handler, HandlerError};
pub use hash::SpecHash;
pub use key::ObjectKey;
pub use ownership::OwnershipGraph;
pub use queue::{QueueHandle, WorkItem, WorkQueue};
pub use ratelimit::{BackoffPolicy, RateLimiter, TokenBucket};
pub use store::{Reader, Store, StoreChange};
