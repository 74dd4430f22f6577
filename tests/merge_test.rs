//! Tests for the configuration merge pipeline

use std::collections::BTreeMap;

use fleetward::merger::{merge, ConfigSnapshot};
use fleetward::models::{Instance, ManagedService, RegistrationMethod, ServiceSource};
use fleetward::schema::{Setting, SettingCatalog, SettingScope};

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
        Setting {
            key: "GLOBAL_MODE".to_string(),
            default: "off".to_string(),
            regex: "on|off".to_string(),
            scope: SettingScope::Global,
            multiple: false,
        },
        Setting {
            key: "REVERSE_PROXY_URL".to_string(),
            default: String::new(),
            regex: ".*".to_string(),
            scope: SettingScope::Multisite,
            multiple: true,
        },
    ])
    .expect("catalog must build")
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn instance(hostname: &str, pairs: &[(&str, &str)]) -> Instance {
    Instance::new(hostname, 5000, RegistrationMethod::Discovered).with_env(env(pairs))
}

fn service(primary: &str, pairs: &[(&str, &str)]) -> ManagedService {
    let mut settings = env(pairs);
    settings.insert("SERVER_NAME".to_string(), primary.to_string());
    ManagedService::from_settings(settings, ServiceSource::Discovered)
}

#[test]
fn defaults_fill_unset_keys() {
    let outcome = merge(&catalog(), &[], &[], &ConfigSnapshot::empty());
    assert_eq!(outcome.snapshot.get("USE_X"), Some("no"));
    assert_eq!(outcome.snapshot.get("GLOBAL_MODE"), Some("off"));
}

#[test]
fn service_settings_override_instance_env() {
    let instances = [instance("bw-1", &[("USE_X", "no")])];
    let services = [service("a.test", &[("USE_X", "yes")])];

    let outcome = merge(&catalog(), &instances, &services, &ConfigSnapshot::empty());

    assert_eq!(outcome.snapshot.get("SERVER_NAME"), Some("a.test"));
    assert_eq!(outcome.snapshot.get("USE_X"), Some("yes"));
    assert_eq!(outcome.snapshot.get("a.test_USE_X"), Some("yes"));
}

#[test]
fn rejected_pairs_never_abort_the_merge() {
    let services = [service("a.test", &[("USE_X", "maybe"), ("NOT_A_KEY", "1")])];

    let outcome = merge(&catalog(), &[], &services, &ConfigSnapshot::empty());

    assert_eq!(outcome.report.rejected.len(), 2);
    // the invalid value never lands; the default survives
    assert_eq!(outcome.snapshot.get("USE_X"), Some("no"));
    assert_eq!(outcome.snapshot.get("SERVER_NAME"), Some("a.test"));
}

#[test]
fn merge_is_deterministic_over_input_order() {
    let a = instance("bw-a", &[("GLOBAL_MODE", "on")]);
    let b = instance("bw-b", &[]);
    let s1 = service("one.test", &[("USE_X", "yes")]);
    let s2 = service("two.test", &[("USE_X", "no")]);

    let forward = merge(
        &catalog(),
        &[a.clone(), b.clone()],
        &[s1.clone(), s2.clone()],
        &ConfigSnapshot::empty(),
    );
    let reversed = merge(&catalog(), &[b, a], &[s2, s1], &ConfigSnapshot::empty());

    assert_eq!(forward.snapshot.entries, reversed.snapshot.entries);
}

#[test]
fn unchanged_snapshot_reports_no_change() {
    let instances = [instance("bw-1", &[])];
    let services = [service("a.test", &[("USE_X", "yes")])];

    let first = merge(&catalog(), &instances, &services, &ConfigSnapshot::empty());
    assert!(first.changed);

    let second = merge(&catalog(), &instances, &services, &first.snapshot);
    assert!(!second.changed);
}

#[test]
fn numbered_suffix_accepted_only_for_multiple_settings() {
    let services = [service(
        "a.test",
        &[
            ("REVERSE_PROXY_URL_1", "/one"),
            ("REVERSE_PROXY_URL_2", "/two"),
            ("USE_X_1", "yes"),
        ],
    )];

    let outcome = merge(&catalog(), &[], &services, &ConfigSnapshot::empty());

    assert_eq!(outcome.snapshot.get("REVERSE_PROXY_URL_1"), Some("/one"));
    assert_eq!(outcome.snapshot.get("REVERSE_PROXY_URL_2"), Some("/two"));
    assert!(outcome
        .report
        .rejected
        .iter()
        .any(|r| r.key == "USE_X_1"));
}

#[test]
fn server_name_is_union_of_services() {
    let instances = [instance("bw-1", &[])];
    let services = [service("a.test", &[]), service("b.test", &[])];

    let outcome = merge(&catalog(), &instances, &services, &ConfigSnapshot::empty());
    assert_eq!(outcome.snapshot.get("SERVER_NAME"), Some("a.test b.test"));
}
