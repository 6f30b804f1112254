use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use parley_core::error::{ParleyError, Result};
use parley_core::flow::FlowDocument;
use parley_core::state::ConversationState;
use parley_core::traits::{FlowStore, StateStore};
use parley_core::types::FlowSummary;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT,
        version INTEGER NOT NULL,
        document TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS conversation_states (
        flow_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        turn_id INTEGER NOT NULL,
        document TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (flow_id, contact_id)
    );";

/// SQLite-backed store for flow documents and conversation states.
///
/// Each conversation state is one row holding the whole JSON document, so a
/// save is a single atomic replace.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> ParleyError {
    ParleyError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ParleyError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
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
}

impl FlowStore for SqliteStore {
    fn load_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDocument>>> {
        let flow_id = flow_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM flows WHERE id = ?1",
                    params![flow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match document {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn save_flow(&self, document: &FlowDocument) -> BoxFuture<'_, Result<()>> {
        let document = document.clone();

        Box::pin(async move {
            let id = document
                .id
                .clone()
                .ok_or_else(|| ParleyError::invalid_flow("<unnamed>", "missing flow id"))?;
            let json = serde_json::to_string(&document)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO flows (id, name, version, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    version = excluded.version,
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                params![id, document.name, document.version, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT id, name, version, updated_at FROM flows ORDER BY id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(db_err)?;

            let mut flows = Vec::new();
            for row in rows {
                let (id, name, version, updated_at) = row.map_err(db_err)?;
                flows.push(FlowSummary {
                    id,
                    name,
                    version,
                    updated_at: parse_timestamp(&updated_at),
                });
            }
            Ok(flows)
        })
    }
}

impl StateStore for SqliteStore {
    fn load_state(
        &self,
        flow_id: &str,
        contact_id: &str,
    ) -> BoxFuture<'_, Result<Option<ConversationState>>> {
        let flow_id = flow_id.to_string();
        let contact_id = contact_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM conversation_states WHERE flow_id = ?1 AND contact_id = ?2",
                    params![flow_id, contact_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match document {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn save_state(&self, state: &ConversationState) -> BoxFuture<'_, Result<()>> {
        let serialized = serde_json::to_string(state);
        let flow_id = state.flow_id.clone();
        let contact_id = state.contact_id.clone();
        let turn_id = state.turn_id as i64;
        let updated_at = state.last_updated.to_rfc3339();

        Box::pin(async move {
            let json = serialized?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO conversation_states (flow_id, contact_id, turn_id, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(flow_id, contact_id) DO UPDATE SET
                    turn_id = excluded.turn_id,
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                params![flow_id, contact_id, turn_id, json, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn delete_state(&self, flow_id: &str, contact_id: &str) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        let contact_id = contact_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let deleted = conn
                .execute(
                    "DELETE FROM conversation_states WHERE flow_id = ?1 AND contact_id = ?2",
                    params![flow_id, contact_id],
                )
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    fn list_states(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ConversationState>>> {
        let flow_id = flow_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT document FROM conversation_states
                     WHERE flow_id = ?1
                     ORDER BY updated_at DESC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![flow_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut states = Vec::new();
            for row in rows {
                let json = row.map_err(db_err)?;
                states.push(serde_json::from_str(&json)?);
            }
            Ok(states)
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::state::NodeStatus;
    use serde_json::json;

    fn flow_doc(id: &str, version: u32) -> FlowDocument {
        serde_json::from_value(json!({
            "id": id,
            "name": "Librería",
            "version": version,
            "nodes": [{"id": "start", "type": "trigger"}],
            "edges": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_flow_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.load_flow("books").await.unwrap().is_none());

        store.save_flow(&flow_doc("books", 1)).await.unwrap();
        store.save_flow(&flow_doc("books", 2)).await.unwrap();

        let loaded = store.load_flow("books").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        let listed = store.list_flows().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_deref(), Some("Librería"));
    }

    #[tokio::test]
    async fn test_state_replace_and_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let mut state = ConversationState::new("books", "5491122334455");
        state.begin_turn("evt-1");
        state.mark("send", NodeStatus::Done);
        state.variables.insert("titulo".into(), json!("dune"));
        store.save_state(&state).await.unwrap();

        state.begin_turn("evt-2");
        store.save_state(&state).await.unwrap();

        let loaded = store
            .load_state("books", "5491122334455")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.turn_id, 2);
        assert_eq!(loaded.variables["titulo"], json!("dune"));
        assert_eq!(loaded.node_status("send"), NodeStatus::Pending);
        assert_eq!(store.list_states("books").await.unwrap().len(), 1);

        assert!(store.delete_state("books", "5491122334455").await.unwrap());
        assert!(!store.delete_state("books", "5491122334455").await.unwrap());
        assert!(store.load_state("books", "5491122334455").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_state(&ConversationState::new("books", "c1"))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.load_state("books", "c1").await.unwrap().is_some());
    }
}
