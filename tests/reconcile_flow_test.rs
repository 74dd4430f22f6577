//! End-to-end reconciliation flow: variables file in, reload out

use std::sync::Arc;

use fleetward::config::FanoutConfig;
use fleetward::directory::InstanceDirectory;
use fleetward::fanout::ApiFanout;
use fleetward::reconcile::Reconciler;
use fleetward::schema::{Setting, SettingCatalog, SettingScope};
use fleetward::store::MemoryStore;
use fleetward::watcher::{static_file::StaticWatcher, Backend};
use serde_json::json;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn catalog() -> SettingCatalog {
    SettingCatalog::from_settings(vec![
        Setting {
            key: "SERVER_NAME".to_string(),
            default: String::new(),
            regex: ".*".to_string(),
            scope: SettingScope::Multisite,
            multiple: false,
        },
        Setting {
            key: "USE_X".to_string(),
            default: "no".to_string(),
            regex: "yes|no".to_string(),
            scope: SettingScope::Multisite,
            multiple: false,
        },
    ])
    .expect("catalog must build")
}

fn ok_reply() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"status": "success", "msg": "ok"}))
}

#[tokio::test]
async fn static_fleet_is_configured_and_reloaded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/config"))
        .respond_with(ok_reply())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reload"))
        .respond_with(ok_reply())
        .expect(1)
        .mount(&server)
        .await;

    let address = server.address();
    let dir = tempfile::tempdir().unwrap();
    let variables = dir.path().join("vars.env");
    std::fs::write(
        &variables,
        format!(
            "FLEETWARD_INSTANCES={}:{}\nSERVER_NAME=a.test\na.test_USE_X=yes\n",
            address.ip(),
            address.port()
        ),
    )
    .unwrap();

    let watcher = StaticWatcher::new(&variables, 5000);
    let observation = watcher.observe().await.expect("observation");
    assert_eq!(observation.instances.len(), 1);

    let store = Arc::new(MemoryStore::new());
    let fanout = ApiFanout::new(FanoutConfig {
        request_timeout_secs: 2,
        ..FanoutConfig::default()
    })
    .expect("client");
    let mut reconciler = Reconciler::new(
        Arc::new(InstanceDirectory::new()),
        Arc::new(fanout),
        catalog(),
        store.clone(),
        Arc::new(Mutex::new(())),
        None,
        dir.path().join("cache"),
    );

    let report = reconciler.apply(observation, true).await.expect("pass");
    assert!(report.changed);
    assert!(report.published());
    assert!(report.reload.expect("reload attempted").all_succeeded());

    // persisted snapshot carries the merged per-service override
    let saved = store.saved_config.lock().unwrap();
    let entries = saved.as_ref().expect("snapshot saved");
    assert_eq!(entries.get("SERVER_NAME").map(String::as_str), Some("a.test"));
    assert_eq!(
        entries.get("a.test_USE_X").map(String::as_str),
        Some("yes")
    );
}

#[tokio::test]
async fn second_identical_observation_is_a_no_op() {
    let server = MockServer::start().await;
    // exactly one config push and one reload across both passes
    Mock::given(method("POST"))
        .and(path("/config"))
        .respond_with(ok_reply())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reload"))
        .respond_with(ok_reply())
        .expect(1)
        .mount(&server)
        .await;

    let address = server.address();
    let dir = tempfile::tempdir().unwrap();
    let variables = dir.path().join("vars.env");
    std::fs::write(
        &variables,
        format!(
            "FLEETWARD_INSTANCES={}:{}\nSERVER_NAME=a.test\n",
            address.ip(),
            address.port()
        ),
    )
    .unwrap();

    let watcher = StaticWatcher::new(&variables, 5000);
    let fanout = ApiFanout::new(FanoutConfig {
        request_timeout_secs: 2,
        ..FanoutConfig::default()
    })
    .expect("client");
    let mut reconciler = Reconciler::new(
        Arc::new(InstanceDirectory::new()),
        Arc::new(fanout),
        catalog(),
        Arc::new(MemoryStore::new()),
        Arc::new(Mutex::new(())),
        None,
        dir.path().join("cache"),
    );

    let first = reconciler
        .apply(watcher.observe().await.unwrap(), true)
        .await
        .unwrap();
    assert!(first.published());

    let second = reconciler
        .apply(watcher.observe().await.unwrap(), false)
        .await
        .unwrap();
    assert!(!second.changed);
    assert!(second.config.is_none());
}
