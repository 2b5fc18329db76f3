//! Sync loop and history backfill engine for the airlock proxy.
//!
//! The engine drives an authenticated homeserver session: it runs the
//! long-poll sync loop, detects rooms whose visible timeline has a gap, and
//! backfills the missing history in bounded, resumable, deduplicated units
//! of work persisted through the task store.

/// The `SyncEngine` session object and its lifecycle.
pub mod engine;
mod fetcher;
/// The homeserver-session collaborator contract.
pub mod homeserver;
mod sync_loop;

pub use engine::{EngineState, SyncEngine};
pub use homeserver::{HistoryPage, HomeserverSession, RoomTimelineGap, SyncUpdate};
