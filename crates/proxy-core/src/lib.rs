//! Shared primitives for the airlock sync/backfill engine.
//!
//! This crate defines the fetch-task data model, the durable task-store
//! contract, the backfill work queue and its throttle, the coordination
//! pulses the engine exposes to observers, and the common error/backoff
//! types.

/// Engine tuning values and their production defaults.
pub mod config;
/// Stable engine error types and HTTP classification helpers.
pub mod error;
/// Level-triggered coordination pulses.
pub mod pulse;
/// Unbounded backfill work queue.
pub mod queue;
/// Backoff policy used by retry loops.
pub mod retry;
/// Fetch-task persistence contract and in-memory implementation.
pub mod store;
/// Fetch-task and session-identity data model.
pub mod task;
/// Admission control for automatically discovered gap tasks.
pub mod throttle;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorCategory, classify_http_status};
pub use pulse::{Pulse, PulseListener};
pub use queue::{FetchTaskQueue, FetchTaskReceiver, QueueError};
pub use retry::BackoffPolicy;
pub use store::{FetchTaskStore, MemoryTaskStore, StoreError};
pub use task::{FetchTask, SessionIdentity};
pub use throttle::GapThrottle;
