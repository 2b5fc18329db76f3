use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use thiserror::Error;

use crate::task::FetchTask;

/// Errors surfaced by fetch-task persistence backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The (server, user) pair has not been registered with
    /// `save_server_user`.
    #[error("unknown account {0}")]
    UnknownAccount(String),
    /// The underlying storage backend failed.
    #[error("task store backend failure: {0}")]
    Backend(String),
    /// Stored data could not be interpreted.
    #[error("task store data is corrupt: {0}")]
    Corrupt(String),
}

/// Durable bookkeeping for pending backfill work.
///
/// The store copy of a task is the source of truth: the in-memory queue is
/// rebuilt from it on startup, so a task interrupted mid-fetch resumes with
/// its pre-fetch token. Implementations must be safe for concurrent use by
/// the sync loop and the history fetcher.
pub trait FetchTaskStore: Send + Sync {
    /// Register the (server, user) identity that keys every fetch task of a
    /// session. Idempotent.
    fn save_server_user(&self, server: &str, user: &str) -> Result<(), StoreError>;

    /// Durably upsert a task keyed by (server, user, room_id), replacing any
    /// existing entry for that room.
    fn save_fetch_task(&self, server: &str, user: &str, task: &FetchTask)
    -> Result<(), StoreError>;

    /// All currently pending tasks for the session, ordered by room id.
    fn load_fetch_tasks(&self, server: &str, user: &str) -> Result<Vec<FetchTask>, StoreError>;

    /// Remove the persisted task for a room; a no-op when absent.
    fn delete_fetch_task(&self, server: &str, user: &str, room_id: &str)
    -> Result<(), StoreError>;
}

fn account_label(server: &str, user: &str) -> String {
    format!("{server}/{user}")
}

/// Ephemeral task store for tests and sessions that do not need to survive
/// a restart.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    accounts: Arc<RwLock<HashMap<(String, String), BTreeMap<String, String>>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FetchTaskStore for MemoryTaskStore {
    fn save_server_user(&self, server: &str, user: &str) -> Result<(), StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        accounts
            .entry((server.to_owned(), user.to_owned()))
            .or_default();
        Ok(())
    }

    fn save_fetch_task(
        &self,
        server: &str,
        user: &str,
        task: &FetchTask,
    ) -> Result<(), StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let tasks = accounts
            .get_mut(&(server.to_owned(), user.to_owned()))
            .ok_or_else(|| StoreError::UnknownAccount(account_label(server, user)))?;
        tasks.insert(task.room_id.clone(), task.token.clone());
        Ok(())
    }

    fn load_fetch_tasks(&self, server: &str, user: &str) -> Result<Vec<FetchTask>, StoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let Some(tasks) = accounts.get(&(server.to_owned(), user.to_owned())) else {
            return Ok(Vec::new());
        };
        Ok(tasks
            .iter()
            .map(|(room_id, token)| FetchTask::new(room_id.clone(), token.clone()))
            .collect())
    }

    fn delete_fetch_task(
        &self,
        server: &str,
        user: &str,
        room_id: &str,
    ) -> Result<(), StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if let Some(tasks) = accounts.get_mut(&(server.to_owned(), user.to_owned())) {
            tasks.remove(room_id);
        }
        Ok(())
    }
}
