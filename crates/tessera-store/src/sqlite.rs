use std::path::Path;
use std::sync::Mutex;

use chrono::SecondsFormat;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::debug;

use tessera_core::act::Act;
use tessera_core::error::{Result, TesseraError};
use tessera_core::generation::Generation;
use tessera_core::types::{ActId, GenerationId, WorkspaceId};
use tessera_graph::Blueprint;

use crate::traits::RunStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blueprints (
        id TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS acts (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_acts_workspace
        ON acts(workspace_id, started_at DESC);

    CREATE TABLE IF NOT EXISTS generations (
        id TEXT PRIMARY KEY,
        act_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        queued_at TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_generations_act
        ON generations(act_id, queued_at);";

/// SQLite-backed run store. Records are stored as JSON bodies with the
/// columns needed for lookups alongside.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> TesseraError {
    TesseraError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(db_err)?;
        f(&conn)
    }

    fn load_one<T: DeserializeOwned>(&self, sql: &str, id: &str) -> Result<Option<T>> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(sql, params![id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(TesseraError::from))
                .transpose()
        })
    }

    fn load_many<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Vec<T>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(db_err)?;
            let bodies = stmt
                .query_map(params![key], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(db_err)?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(TesseraError::from))
                .collect()
        })
    }
}

impl RunStore for SqliteStore {
    fn put_blueprint(&self, blueprint: &Blueprint) -> BoxFuture<'_, Result<()>> {
        let id = blueprint.id.to_string();
        let version = blueprint.version as i64;
        let body = serde_json::to_string(blueprint);
        Box::pin(async move {
            let body = body?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO blueprints (id, version, body) VALUES (?1, ?2, ?3)",
                    params![id, version, body],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn get_blueprint(&self, id: &WorkspaceId) -> BoxFuture<'_, Result<Option<Blueprint>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_one("SELECT body FROM blueprints WHERE id = ?1", &id) })
    }

    fn put_act(&self, act: &Act) -> BoxFuture<'_, Result<()>> {
        let id = act.id.to_string();
        let workspace_id = act.workspace_id.to_string();
        let status = act.status.as_str();
        let started_at = act.started_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let body = serde_json::to_string(act);
        Box::pin(async move {
            let body = body?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO acts (id, workspace_id, status, started_at, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, workspace_id, status, started_at, body],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn get_act(&self, id: &ActId) -> BoxFuture<'_, Result<Option<Act>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_one("SELECT body FROM acts WHERE id = ?1", &id) })
    }

    fn list_acts(&self, workspace_id: &WorkspaceId) -> BoxFuture<'_, Result<Vec<Act>>> {
        let workspace_id = workspace_id.to_string();
        Box::pin(async move {
            self.load_many(
                "SELECT body FROM acts WHERE workspace_id = ?1 ORDER BY started_at DESC",
                &workspace_id,
            )
        })
    }

    fn put_generation(&self, generation: &Generation) -> BoxFuture<'_, Result<()>> {
        let id = generation.id.to_string();
        let act_id = generation.origin.act_id.to_string();
        let node_id = generation.node_id.to_string();
        let status = generation.status.as_str();
        let queued_at = generation.queued_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let body = serde_json::to_string(generation);
        Box::pin(async move {
            let body = body?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO generations (id, act_id, node_id, status, queued_at, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, act_id, node_id, status, queued_at, body],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn get_generation(&self, id: &GenerationId) -> BoxFuture<'_, Result<Option<Generation>>> {
        let id = id.to_string();
        Box::pin(async move { self.load_one("SELECT body FROM generations WHERE id = ?1", &id) })
    }

    fn list_generations(&self, act_id: &ActId) -> BoxFuture<'_, Result<Vec<Generation>>> {
        let act_id = act_id.to_string();
        Box::pin(async move {
            self.load_many(
                "SELECT body FROM generations WHERE act_id = ?1 ORDER BY queued_at ASC",
                &act_id,
            )
        })
    }
}
