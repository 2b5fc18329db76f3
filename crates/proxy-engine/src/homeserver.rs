use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use proxy_core::EngineError;

/// Per-room view of one applied sync response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomTimelineGap {
    /// Opaque room identifier.
    pub room_id: String,
    /// Whether the returned timeline window is limited, i.e. has a gap.
    pub limited: bool,
    /// Cursor bounding the gap, present when older history can be
    /// requested.
    pub prev_batch: Option<String>,
}

/// The engine-visible distillation of one applied sync response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncUpdate {
    /// Server-side position reached by this response.
    pub next_batch: String,
    /// Known rooms with their gap state, in response order.
    pub rooms: Vec<RoomTimelineGap>,
}

/// One bounded backward page of room history.
///
/// Events are opaque to the engine; the session collaborator decrypts and
/// stores them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryPage {
    /// The cursor this page was requested from.
    pub start: String,
    /// Cursor for the next older page, when the server supplied one.
    pub end: Option<String>,
    /// Raw events in the chunk.
    pub events: Vec<serde_json::Value>,
}

impl HistoryPage {
    /// The cursor to chain the next fetch from, if this page has one.
    ///
    /// An empty chunk is the server's canonical "no more history" signal; a
    /// missing `end`, or one equal to `start`, means the same thing.
    pub fn continuation(&self) -> Option<&str> {
        if self.events.is_empty() {
            return None;
        }
        self.end.as_deref().filter(|end| *end != self.start)
    }
}

/// The authenticated, encrypted protocol session the engine drives.
///
/// Implementations own the wire protocol and all cryptography: `sync` and
/// `apply_history_page` are expected to have already applied membership,
/// decryption, and device-list changes before returning. Implementations
/// must be safe for concurrent use by the sync loop and the history
/// fetcher.
#[async_trait]
pub trait HomeserverSession: Send + Sync {
    /// Long-poll for the next sync response and apply it, returning the
    /// per-room gap summary.
    ///
    /// `timeout` is the server-side bound on how long the call may block
    /// waiting for new data.
    async fn sync(
        &self,
        since: Option<String>,
        timeout: Duration,
    ) -> Result<SyncUpdate, EngineError>;

    /// Request one page of older history, backward from `from`.
    async fn room_history(
        &self,
        room_id: &str,
        from: &str,
        limit: u16,
    ) -> Result<HistoryPage, EngineError>;

    /// Hand a fetched page to the session for decryption and storage.
    async fn apply_history_page(
        &self,
        room_id: &str,
        page: &HistoryPage,
    ) -> Result<(), EngineError>;

    /// Send any outstanding device-key upload/query requests.
    async fn flush_key_requests(&self) -> Result<(), EngineError>;
}
