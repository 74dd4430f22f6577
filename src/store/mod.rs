//! Persistent store for snapshots, custom configs and instances
//!
//! The store is a narrow external contract: the control plane saves
//! what it computed and reads back what it persisted, nothing more.
//! Callers must treat [`Error::StoreUnavailable`] as transient and
//! retry with backoff; an uninitialized store blocks the current pass
//! only.
//!
//! Uses `Mutex` to ensure thread-safety for the SQLite connection.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::merger::ConfigSnapshot;
use crate::models::{CustomConfig, Instance};

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence contract consumed by the reconciliation loop
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether the schema exists and the store accepts writes
    async fn is_initialized(&self) -> bool;

    /// Persist the full snapshot, wholesale replacement
    async fn save_config(&self, snapshot: &ConfigSnapshot, source: &str) -> Result<()>;

    /// Persist the custom config blobs, wholesale replacement
    async fn save_custom_configs(&self, configs: &[CustomConfig], source: &str) -> Result<()>;

    /// Persist the current instance list, wholesale replacement
    async fn update_instances(&self, instances: &[Instance]) -> Result<()>;

    /// Read back the persisted instance list
    async fn get_instances(&self) -> Result<Vec<Instance>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create store dir", e))?;
        }
        let conn = Connection::open(path).map_err(|e| Error::StoreUnavailable {
            reason: format!("cannot open database: {e}"),
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::StoreUnavailable {
            reason: format!("cannot open in-memory database: {e}"),
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                 key     TEXT PRIMARY KEY,
                 value   TEXT NOT NULL,
                 source  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS custom_configs (
                 service  TEXT,
                 type     TEXT NOT NULL,
                 name     TEXT NOT NULL,
                 data     TEXT NOT NULL,
                 source   TEXT NOT NULL,
                 PRIMARY KEY (service, type, name)
             );
             CREATE TABLE IF NOT EXISTS instances (
                 hostname  TEXT PRIMARY KEY,
                 record    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                 key    TEXT PRIMARY KEY,
                 value  TEXT NOT NULL
             );
             INSERT OR REPLACE INTO meta (key, value) VALUES ('initialized', '1');",
        )
        .map_err(|e| Error::StoreUnavailable {
            reason: format!("cannot initialize schema: {e}"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::StoreUnavailable {
            reason: "store mutex poisoned".to_string(),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn is_initialized(&self) -> bool {
        let Ok(conn) = self.lock() else { return false };
        conn.query_row(
            "SELECT value FROM meta WHERE key = 'initialized'",
            [],
            |row| row.get::<_, String>(0),
        )
        .map(|v| v == "1")
        .unwrap_or(false)
    }

    async fn save_config(&self, snapshot: &ConfigSnapshot, source: &str) -> Result<()> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM config", []).map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO config (key, value, source) VALUES (?1, ?2, ?3)")
                .map_err(store_err)?;
            for (key, value) in &snapshot.entries {
                stmt.execute(params![key, value, source]).map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    async fn save_custom_configs(&self, configs: &[CustomConfig], source: &str) -> Result<()> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM custom_configs", [])
            .map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO custom_configs (service, type, name, data, source)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(store_err)?;
            for config in configs {
                stmt.execute(params![
                    config.service,
                    config.config_type.as_str(),
                    config.name,
                    config.data,
                    source
                ])
                .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    async fn update_instances(&self, instances: &[Instance]) -> Result<()> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM instances", []).map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO instances (hostname, record) VALUES (?1, ?2)")
                .map_err(store_err)?;
            for instance in instances {
                let record = serde_json::to_string(instance)?;
                stmt.execute(params![instance.hostname, record])
                    .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)
    }

    async fn get_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT record FROM instances ORDER BY hostname")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;

        let mut instances = Vec::new();
        for record in rows {
            let record = record.map_err(store_err)?;
            instances.push(serde_json::from_str(&record)?);
        }
        Ok(instances)
    }
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::StoreUnavailable {
        reason: e.to_string(),
    }
}

// ============================================================================
// In-Memory Implementation (tests)
// ============================================================================

/// Memory-backed store used by unit and integration tests
#[derive(Default)]
pub struct MemoryStore {
    initialized: std::sync::atomic::AtomicBool,
    pub saved_config: Mutex<Option<BTreeMap<String, String>>>,
    pub saved_custom_configs: Mutex<Vec<CustomConfig>>,
    pub saved_instances: Mutex<Vec<Instance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store
            .initialized
            .store(true, std::sync::atomic::Ordering::SeqCst);
        store
    }

    /// A store that reports uninitialized until told otherwise
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized
            .store(value, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn is_initialized(&self) -> bool {
        self.initialized.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn save_config(&self, snapshot: &ConfigSnapshot, _source: &str) -> Result<()> {
        *self.saved_config.lock().expect("lock") = Some(snapshot.entries.clone());
        Ok(())
    }

    async fn save_custom_configs(&self, configs: &[CustomConfig], _source: &str) -> Result<()> {
        *self.saved_custom_configs.lock().expect("lock") = configs.to_vec();
        Ok(())
    }

    async fn update_instances(&self, instances: &[Instance]) -> Result<()> {
        *self.saved_instances.lock().expect("lock") = instances.to_vec();
        Ok(())
    }

    async fn get_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.saved_instances.lock().expect("lock").clone())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigType, RegistrationMethod};
    use chrono::Utc;

    fn snapshot(pairs: &[(&str, &str)]) -> ConfigSnapshot {
        ConfigSnapshot {
            entries: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_initializes() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.is_initialized().await);
    }

    #[tokio::test]
    async fn test_save_config_is_wholesale_replace() {
        let store = SqliteStore::open_in_memory().unwrap();

        store
            .save_config(&snapshot(&[("A", "1"), ("B", "2")]), "autoconf")
            .await
            .unwrap();
        store
            .save_config(&snapshot(&[("C", "3")]), "autoconf")
            .await
            .unwrap();

        let conn = store.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM config", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_instances_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();

        let instance = Instance::new("bw-1", 5000, RegistrationMethod::Discovered);
        store.update_instances(&[instance.clone()]).await.unwrap();

        let loaded = store.get_instances().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hostname, "bw-1");
        assert_eq!(loaded[0].port, 5000);
    }

    #[tokio::test]
    async fn test_custom_configs_persisted() {
        let store = SqliteStore::open_in_memory().unwrap();

        let config = CustomConfig {
            service: Some("a.test".to_string()),
            config_type: ConfigType::ServerHttp,
            name: "extra".to_string(),
            data: "location /x {}".to_string(),
        };
        store
            .save_custom_configs(&[config], "autoconf")
            .await
            .unwrap();

        let conn = store.lock().unwrap();
        let (service, kind): (String, String) = conn
            .query_row(
                "SELECT service, type FROM custom_configs",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(service, "a.test");
        assert_eq!(kind, "server-http");
    }

    #[tokio::test]
    async fn test_memory_store_initialization_toggle() {
        let store = MemoryStore::uninitialized();
        assert!(!store.is_initialized().await);
        store.set_initialized(true);
        assert!(store.is_initialized().await);
    }
}
