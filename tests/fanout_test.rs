//! Tests for the control protocol fanout

use std::time::Duration;

use fleetward::config::FanoutConfig;
use fleetward::fanout::ApiFanout;
use fleetward::models::{Instance, RegistrationMethod};
use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fanout(timeout_secs: u64) -> ApiFanout {
    ApiFanout::new(FanoutConfig {
        request_timeout_secs: timeout_secs,
        ..FanoutConfig::default()
    })
    .expect("client must build")
}

fn instance_for(server: &MockServer) -> Instance {
    let url = url::Url::parse(&server.uri()).expect("mock server uri");
    Instance::new(
        url.host_str().expect("host"),
        url.port().expect("port"),
        RegistrationMethod::Discovered,
    )
}

fn ok_reply() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"status": "success", "msg": "ok"}))
}

#[tokio::test]
async fn every_instance_is_attempted_despite_failures() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("POST")).respond_with(ok_reply()).mount(&a).await;
    // b stalls past the client timeout
    Mock::given(method("POST"))
        .respond_with(ok_reply().set_delay(Duration::from_secs(5)))
        .mount(&b)
        .await;
    Mock::given(method("POST")).respond_with(ok_reply()).mount(&c).await;

    let instances = [instance_for(&a), instance_for(&b), instance_for(&c)];
    let report = fanout(1)
        .send(&instances, Method::POST, "/reload", None)
        .await;

    assert_eq!(report.attempted(), 3);
    assert_eq!(report.failed, vec![instances[1].endpoint()]);
    assert!(report.succeeded(&instances[0].endpoint()));
    assert!(report.succeeded(&instances[2].endpoint()));
}

#[tokio::test]
async fn caller_identity_and_host_headers_are_sent() {
    let server = MockServer::start().await;
    let config = FanoutConfig::default();
    Mock::given(method("POST"))
        .and(path("/config"))
        .and(header("User-Agent", config.caller_identity.as_str()))
        .and(header("Host", config.api_server_name.as_str()))
        .respond_with(ok_reply())
        .expect(1)
        .mount(&server)
        .await;

    let instances = [instance_for(&server)];
    let report = fanout(2)
        .send(
            &instances,
            Method::POST,
            "/config",
            Some(&json!({"env": {}})),
        )
        .await;

    assert!(report.all_succeeded());
}

#[tokio::test]
async fn api_level_failure_is_a_failed_instance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "error", "msg": "reload failed"})),
        )
        .mount(&server)
        .await;

    let instances = [instance_for(&server)];
    let report = fanout(2)
        .send(&instances, Method::POST, "/reload", None)
        .await;

    assert!(!report.all_succeeded());
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
async fn unreachable_instance_is_reported_not_raised() {
    // closed port: nothing listens after the server drops
    let server = MockServer::start().await;
    let instance = instance_for(&server);
    drop(server);

    let report = fanout(1)
        .send(&[instance.clone()], Method::POST, "/reload", None)
        .await;

    assert_eq!(report.failed, vec![instance.endpoint()]);
}

#[tokio::test]
async fn ping_reflects_instance_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ok_reply())
        .mount(&server)
        .await;

    let client = fanout(2);
    assert!(client.ping(&instance_for(&server)).await);

    let gone = MockServer::start().await;
    let dead = instance_for(&gone);
    drop(gone);
    assert!(!client.ping(&dead).await);
}
