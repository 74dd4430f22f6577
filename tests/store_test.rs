//! Tests for SQLite persistence

use std::collections::BTreeMap;

use chrono::Utc;
use fleetward::merger::ConfigSnapshot;
use fleetward::models::{Instance, RegistrationMethod};
use fleetward::store::{SqliteStore, Store};
use tempfile::TempDir;

fn snapshot(pairs: &[(&str, &str)]) -> ConfigSnapshot {
    ConfigSnapshot {
        entries: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        computed_at: Utc::now(),
    }
}

#[tokio::test]
async fn reopening_the_database_keeps_instances() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("fleet.db");

    {
        let store = SqliteStore::open(&db_path).expect("open");
        let mut instance = Instance::new("bw-1", 5000, RegistrationMethod::Discovered);
        instance.healthy = true;
        store.update_instances(&[instance]).await.expect("save");
    }

    let reopened = SqliteStore::open(&db_path).expect("reopen");
    assert!(reopened.is_initialized().await);
    let instances = reopened.get_instances().await.expect("load");
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].hostname, "bw-1");
    assert!(instances[0].healthy);
}

#[tokio::test]
async fn missing_parent_directory_is_created() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested/deeper/fleet.db");

    let store = SqliteStore::open(&db_path).expect("open with nested path");
    assert!(store.is_initialized().await);
    assert!(db_path.exists());
}

#[tokio::test]
async fn config_save_then_instance_save_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("fleet.db")).expect("open");

    store
        .save_config(&snapshot(&[("SERVER_NAME", "a.test")]), "autoconf")
        .await
        .expect("config");
    store
        .update_instances(&[Instance::new("bw-1", 5000, RegistrationMethod::Manual)])
        .await
        .expect("instances");

    // replacing config wholesale must not disturb the instance table
    store
        .save_config(&snapshot(&[("SERVER_NAME", "b.test")]), "autoconf")
        .await
        .expect("config again");
    assert_eq!(store.get_instances().await.expect("load").len(), 1);
}
