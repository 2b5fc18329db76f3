//! SQLite-backed implementation of the fetch-task persistence contract.
//!
//! The engine cannot make forward progress without durable backfill
//! bookkeeping, so every failure here propagates as a [`StoreError`] instead
//! of being swallowed. Connections run with foreign keys enforced; deleting
//! an account cascades to its tasks.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use proxy_core::{FetchTask, FetchTaskStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    server_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    UNIQUE (server_name, user_id)
);

CREATE TABLE IF NOT EXISTS fetch_tasks (
    account_id INTEGER NOT NULL REFERENCES accounts (id) ON DELETE CASCADE,
    room_id TEXT NOT NULL,
    token TEXT NOT NULL,
    PRIMARY KEY (account_id, room_id)
);
";

/// Durable task store keeping one row per pending (account, room) backfill.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) the store at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::from_connection(conn)
    }

    /// Fully in-memory store, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("poisoned connection lock".to_owned()))
    }

    fn account_id(conn: &Connection, server: &str, user: &str) -> Result<i64, StoreError> {
        conn.query_row(
            "SELECT id FROM accounts WHERE server_name = ?1 AND user_id = ?2",
            params![server, user],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::UnknownAccount(format!("{server}/{user}")))
    }
}

impl FetchTaskStore for SqliteTaskStore {
    fn save_server_user(&self, server: &str, user: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (server_name, user_id) VALUES (?1, ?2)
             ON CONFLICT (server_name, user_id) DO NOTHING",
            params![server, user],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn save_fetch_task(
        &self,
        server: &str,
        user: &str,
        task: &FetchTask,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let account_id = Self::account_id(&conn, server, user)?;
        conn.execute(
            "INSERT INTO fetch_tasks (account_id, room_id, token) VALUES (?1, ?2, ?3)
             ON CONFLICT (account_id, room_id) DO UPDATE SET token = excluded.token",
            params![account_id, task.room_id, task.token],
        )
        .map_err(backend)?;
        debug!(room_id = %task.room_id, "saved fetch task");
        Ok(())
    }

    fn load_fetch_tasks(&self, server: &str, user: &str) -> Result<Vec<FetchTask>, StoreError> {
        let conn = self.lock()?;
        let Ok(account_id) = Self::account_id(&conn, server, user) else {
            return Ok(Vec::new());
        };

        let mut statement = conn
            .prepare(
                "SELECT room_id, token FROM fetch_tasks
                 WHERE account_id = ?1 ORDER BY room_id",
            )
            .map_err(backend)?;
        let rows = statement
            .query_map(params![account_id], |row| {
                Ok(FetchTask {
                    room_id: row.get(0)?,
                    token: row.get(1)?,
                })
            })
            .map_err(backend)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(backend)?);
        }
        Ok(tasks)
    }

    fn delete_fetch_task(
        &self,
        server: &str,
        user: &str,
        room_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let Ok(account_id) = Self::account_id(&conn, server, user) else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM fetch_tasks WHERE account_id = ?1 AND room_id = ?2",
            params![account_id, room_id],
        )
        .map_err(backend)?;
        debug!(%room_id, "deleted fetch task");
        Ok(())
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
