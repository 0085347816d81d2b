//! Component B: the state store.
//!
//! Key-value persistence of typed state data, keyed by agent ID, surviving
//! process restart. Shaped like `SqliteStateStore` elsewhere in this
//! codebase: same `SqlitePool` + `create_if_missing` + migration-table
//! setup, narrowed from a wide event/task schema down to the flat typed
//! key-value contract this agent actually needs, plus its current state
//! and transition history.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;

use crate::error::{StateStoreError, StateStoreResult};
use crate::state::AgentState;

/// A typed value stored under a state-data key. Mismatched type assertions
/// on read fail loudly with `StateStoreError::TypeMismatch`, never silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StateValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Timestamp(i64),
    List(Vec<StateValue>),
    Map(HashMap<String, StateValue>),
}

impl StateValue {
    fn type_name(&self) -> &'static str {
        match self {
            StateValue::Str(_) => "str",
            StateValue::Int(_) => "int",
            StateValue::Bool(_) => "bool",
            StateValue::Timestamp(_) => "timestamp",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> StateStoreResult<&str> {
        match self {
            StateValue::Str(s) => Ok(s),
            other => Err(type_mismatch("<unknown>", "str", other.type_name())),
        }
    }

    pub fn as_int(&self) -> StateStoreResult<i64> {
        match self {
            StateValue::Int(i) => Ok(*i),
            other => Err(type_mismatch("<unknown>", "int", other.type_name())),
        }
    }

    pub fn as_bool(&self) -> StateStoreResult<bool> {
        match self {
            StateValue::Bool(b) => Ok(*b),
            other => Err(type_mismatch("<unknown>", "bool", other.type_name())),
        }
    }
}

fn type_mismatch(key: &str, expected: &str, stored: &str) -> StateStoreError {
    StateStoreError::TypeMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        stored: stored.to_string(),
    }
}

/// Contract for the state store: `get`/`set`/`delete` are O(1) amortised,
/// `persist` flushes durably, and the store survives restart when reopened
/// with the same agent ID.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StateStoreResult<Option<StateValue>>;
    async fn set(&self, key: &str, value: StateValue) -> StateStoreResult<()>;
    async fn delete(&self, key: &str) -> StateStoreResult<()>;
    async fn persist(&self) -> StateStoreResult<()>;

    async fn current_state(&self) -> StateStoreResult<AgentState>;
    async fn transition(&self, to: AgentState) -> StateStoreResult<()>;
    async fn history(&self) -> StateStoreResult<Vec<(AgentState, AgentState, i64)>>;
}

/// In-memory state store guarded by an `RwLock`, used by the test harness
/// and as a reference implementation. Reads never block on writers for long
/// since the lock is held only for the map access itself.
pub struct MemoryStateStore {
    agent_id: String,
    data: RwLock<HashMap<String, StateValue>>,
    state: RwLock<AgentState>,
    history: RwLock<Vec<(AgentState, AgentState, i64)>>,
}

impl MemoryStateStore {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            data: RwLock::new(HashMap::new()),
            state: RwLock::new(AgentState::Waiting),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StateStoreResult<Option<StateValue>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: StateValue) -> StateStoreResult<()> {
        self.data.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateStoreResult<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn persist(&self) -> StateStoreResult<()> {
        // In-memory store has nothing further to flush.
        Ok(())
    }

    async fn current_state(&self) -> StateStoreResult<AgentState> {
        Ok(*self.state.read().unwrap())
    }

    async fn transition(&self, to: AgentState) -> StateStoreResult<()> {
        let from = {
            let mut s = self.state.write().unwrap();
            let from = *s;
            *s = to;
            from
        };
        self.history
            .write()
            .unwrap()
            .push((from, to, Utc::now().timestamp()));
        Ok(())
    }

    async fn history(&self) -> StateStoreResult<Vec<(AgentState, AgentState, i64)>> {
        Ok(self.history.read().unwrap().clone())
    }
}

/// SQLite-backed implementation. One database per agent ID (or a shared
/// database with the key prefixed by agent ID), matching the
/// `SqliteStateStore::with_prefix` pattern elsewhere in this codebase.
pub struct SqliteStateStore {
    pool: SqlitePool,
    agent_id: String,
}

impl SqliteStateStore {
    pub async fn new<P: AsRef<Path>>(db_path: P, agent_id: impl Into<String>) -> StateStoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StateStoreError::Database(format!("mkdir failed: {e}")))?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(&db_path.to_string_lossy())
            .map_err(|e| StateStoreError::Database(format!("bad db path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| StateStoreError::Database(format!("pool creation failed: {e}")))?;

        let store = Self {
            pool,
            agent_id: agent_id.into(),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> StateStoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_data (
                agent_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (agent_id, key)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("create state_data failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_current_state (
                agent_id TEXT PRIMARY KEY NOT NULL,
                state TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("create agent_current_state failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_transitions (
                agent_id TEXT NOT NULL,
                state_before TEXT NOT NULL,
                state_after TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("create state_transitions failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> StateStoreResult<Option<StateValue>> {
        let row = sqlx::query("SELECT value FROM state_data WHERE agent_id = ? AND key = ?")
            .bind(&self.agent_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateStoreError::Database(format!("get failed: {e}")))?;

        match row {
            Some(r) => {
                let raw: String = r.get("value");
                let value: StateValue = serde_json::from_str(&raw)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: StateValue) -> StateStoreResult<()> {
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO state_data (agent_id, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(agent_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(&self.agent_id)
        .bind(key)
        .bind(raw)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("set failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StateStoreResult<()> {
        sqlx::query("DELETE FROM state_data WHERE agent_id = ? AND key = ?")
            .bind(&self.agent_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StateStoreError::Database(format!("delete failed: {e}")))?;
        Ok(())
    }

    async fn persist(&self) -> StateStoreResult<()> {
        // Every write above already commits through sqlx; nothing buffered.
        Ok(())
    }

    async fn current_state(&self) -> StateStoreResult<AgentState> {
        let row = sqlx::query("SELECT state FROM agent_current_state WHERE agent_id = ?")
            .bind(&self.agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateStoreError::Database(format!("current_state failed: {e}")))?;

        match row {
            Some(r) => {
                let raw: String = r.get("state");
                serde_json::from_str(&format!("\"{raw}\""))
                    .map_err(|e| StateStoreError::Database(format!("corrupt stored state: {e}")))
            }
            None => Ok(AgentState::Waiting),
        }
    }

    async fn transition(&self, to: AgentState) -> StateStoreResult<()> {
        let from = self.current_state().await?;
        let to_str = format!("{to:?}");

        sqlx::query(
            "INSERT INTO agent_current_state (agent_id, state) VALUES (?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET state = excluded.state",
        )
        .bind(&self.agent_id)
        .bind(&to_str)
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("transition failed: {e}")))?;

        sqlx::query(
            "INSERT INTO state_transitions (agent_id, state_before, state_after, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.agent_id)
        .bind(format!("{from:?}"))
        .bind(&to_str)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("record transition failed: {e}")))?;

        Ok(())
    }

    async fn history(&self) -> StateStoreResult<Vec<(AgentState, AgentState, i64)>> {
        let rows = sqlx::query(
            "SELECT state_before, state_after, timestamp FROM state_transitions WHERE agent_id = ? ORDER BY timestamp ASC",
        )
        .bind(&self.agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StateStoreError::Database(format!("history failed: {e}")))?;

        rows.iter()
            .map(|r| {
                let before: String = r.get("state_before");
                let after: String = r.get("state_after");
                let ts: i64 = r.get("timestamp");
                let before: AgentState = serde_json::from_str(&format!("\"{before}\""))
                    .map_err(|e| StateStoreError::Database(format!("corrupt history: {e}")))?;
                let after: AgentState = serde_json::from_str(&format!("\"{after}\""))
                    .map_err(|e| StateStoreError::Database(format!("corrupt history: {e}")))?;
                Ok((before, after, ts))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_get_set_roundtrips() {
        let store = MemoryStateStore::new("agent-1");
        store.set("story_id", StateValue::Str("s-1".into())).await.unwrap();
        let v = store.get("story_id").await.unwrap().unwrap();
        assert_eq!(v.as_str().unwrap(), "s-1");
    }

    #[tokio::test]
    async fn memory_store_missing_key_is_none() {
        let store = MemoryStateStore::new("agent-1");
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_transition_updates_current_state_and_history() {
        let store = MemoryStateStore::new("agent-1");
        assert_eq!(store.current_state().await.unwrap(), AgentState::Waiting);
        store.transition(AgentState::Setup).await.unwrap();
        assert_eq!(store.current_state().await.unwrap(), AgentState::Setup);
        let hist = store.history().await.unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].0, AgentState::Waiting);
        assert_eq!(hist[0].1, AgentState::Setup);
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen_with_same_agent_id() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");

        {
            let store = SqliteStateStore::new(&db_path, "agent-1").await.unwrap();
            store.set("plan", StateValue::Str("do the thing".into())).await.unwrap();
            store.transition(AgentState::Setup).await.unwrap();
        }

        let reopened = SqliteStateStore::new(&db_path, "agent-1").await.unwrap();
        let v = reopened.get("plan").await.unwrap().unwrap();
        assert_eq!(v.as_str().unwrap(), "do the thing");
        assert_eq!(reopened.current_state().await.unwrap(), AgentState::Setup);
    }

    #[tokio::test]
    async fn sqlite_store_type_mismatch_is_caller_responsibility() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        let store = SqliteStateStore::new(&db_path, "agent-1").await.unwrap();
        store.set("count", StateValue::Int(3)).await.unwrap();
        let v = store.get("count").await.unwrap().unwrap();
        let err = v.as_str().unwrap_err();
        assert!(matches!(err, StateStoreError::TypeMismatch { .. }));
    }
}
