use std::collections::BTreeMap;

use serde_json::json;
use unitvisor_core::model::{PermissionSpec, UNIT_ACCESS_PERMISSION, UNIT_IDS_CAVEAT};
use unitvisor_core::test_support::{
    manifest_for, rpc_permissions, Harness, CRASH_ON_START,
};
use unitvisor_core::{
    ApprovalKind, ErrorKind, HandlerType, OrchestratorConfig, PermissionMap, RegistryStatus,
    RegistryVerdict, UnitError, UnitStatus,
};
use unitvisor_events::topics;

const ORIGIN: &str = "https://dapp.example";

fn request(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(id, range)| (id.to_string(), range.to_string()))
        .collect()
}

async fn install_one(harness: &Harness, id: &str, range: &str) -> Result<(), UnitError> {
    harness
        .orchestrator
        .install(ORIGIN, &request(&[(id, range)]))
        .await
        .map(|_| ())
}

#[tokio::test(start_paused = true)]
async fn install_grants_approved_permissions_and_starts_the_unit() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:wallet", "1.2.0", "export const a = 1;", rpc_permissions());
    let mut events = harness.bus.subscribe();

    let installed = harness
        .orchestrator
        .install(ORIGIN, &request(&[("npm:wallet", "^1.0.0")]))
        .await
        .expect("install");

    let unit = &installed["npm:wallet"];
    assert_eq!(unit.version.to_string(), "1.2.0");
    assert!(unit.enabled);
    assert!(harness.orchestrator.is_running("npm:wallet"));
    assert!(harness.execution.is_running("npm:wallet"));
    assert!(harness
        .permissions
        .permissions("npm:wallet")
        .contains_key("endowment:rpc"));

    let history = harness
        .orchestrator
        .get("npm:wallet")
        .expect("record")
        .version_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].origin, ORIGIN);

    let mut kinds = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        kinds.push(envelope.kind);
    }
    assert!(kinds.contains(&topics::TOPIC_UNIT_INSTALL_STARTED.to_string()));
    assert!(kinds.contains(&topics::TOPIC_UNIT_STARTED.to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some(topics::TOPIC_UNIT_INSTALLED));

    let results = harness.approvals.records_of(ApprovalKind::Result);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].last_update().expect("closed")["loading"], false);
}

#[tokio::test(start_paused = true)]
async fn reinstalling_a_satisfied_range_is_a_no_op() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:a", "1.0.0", "export {};", PermissionMap::new());
    install_one(&harness, "npm:a", "*").await.expect("first install");
    install_one(&harness, "npm:a", "^1.0.0").await.expect("second install");

    assert_eq!(harness.execution.execute_count("npm:a"), 1);
    assert_eq!(harness.approvals.records_of(ApprovalKind::Install).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_batch_removes_new_units_and_rolls_back_updates() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:b", "1.0.0", "// b v1", rpc_permissions());
    install_one(&harness, "npm:b", "^1.0.0").await.expect("install b");

    let mut v2_permissions = rpc_permissions();
    v2_permissions.insert("endowment:network-access".into(), PermissionSpec::default());
    harness
        .locations
        .publish("npm:a", "1.0.0", "// a", PermissionMap::new());
    harness
        .locations
        .publish("npm:b", "2.0.0", "// b v2", v2_permissions);
    harness.locations.publish(
        "npm:c",
        "1.0.0",
        &format!("{CRASH_ON_START}\nthrow new Error();"),
        PermissionMap::new(),
    );

    let err = harness
        .orchestrator
        .install(
            ORIGIN,
            &request(&[("npm:a", "*"), ("npm:b", "^2.0.0"), ("npm:c", "*")]),
        )
        .await
        .expect_err("batch must fail");
    assert!(matches!(err, UnitError::Execution(_)), "{err:?}");

    assert!(!harness.orchestrator.has("npm:a"));
    assert!(!harness.orchestrator.has("npm:c"));
    assert!(!harness.execution.is_running("npm:a"));

    let b = harness.orchestrator.get("npm:b").expect("b kept");
    assert_eq!(b.version.to_string(), "1.0.0");
    assert_eq!(b.status, UnitStatus::Running);
    assert!(harness.execution.is_running("npm:b"));
    assert!(!harness
        .permissions
        .permissions("npm:b")
        .contains_key("endowment:network-access"));
    assert!(!harness.orchestrator.has_snapshot("npm:b"));

    let updated = harness
        .orchestrator
        .persisted_state()
        .units
        .remove("npm:b")
        .expect("b persisted");
    assert_eq!(updated.source_code.as_deref(), Some("// b v1"));
}

#[tokio::test(start_paused = true)]
async fn no_satisfying_version_leaves_the_installed_unit_untouched() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:x", "1.0.0", "// x", PermissionMap::new());
    install_one(&harness, "npm:x", "*").await.expect("install x");

    let err = install_one(&harness, "npm:x", "^2.0.0")
        .await
        .expect_err("nothing satisfies ^2");
    assert!(matches!(err, UnitError::NoSatisfyingVersion { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let x = harness.orchestrator.get("npm:x").expect("x kept");
    assert_eq!(x.version.to_string(), "1.0.0");
    assert_eq!(x.status, UnitStatus::Running);
    assert_eq!(harness.execution.execute_count("npm:x"), 1);
    assert!(!harness.orchestrator.has_snapshot("npm:x"));
}

#[tokio::test(start_paused = true)]
async fn update_shows_the_permission_diff_and_swaps_source() {
    let harness = Harness::new();
    let mut v1 = rpc_permissions();
    v1.insert("manage_state".into(), PermissionSpec::default());
    harness.locations.publish("npm:u", "1.0.0", "// v1", v1);
    install_one(&harness, "npm:u", "*").await.expect("install");

    let mut v2 = rpc_permissions();
    v2.insert("endowment:network-access".into(), PermissionSpec::default());
    harness.locations.publish("npm:u", "1.1.0", "// v2", v2);
    let mut events = harness.bus.subscribe();

    let location = harness.location("npm:u", "*");
    let updated = harness
        .orchestrator
        .update(ORIGIN, "npm:u", location, None)
        .await
        .expect("update")
        .expect("newer version applied");
    assert_eq!(updated.version.to_string(), "1.1.0");
    assert!(harness.orchestrator.is_running("npm:u"));

    let granted = harness.permissions.permissions("npm:u");
    assert!(granted.contains_key("endowment:network-access"));
    assert!(granted.contains_key("endowment:rpc"));
    assert!(!granted.contains_key("manage_state"));

    let update = harness
        .approvals
        .records_of(ApprovalKind::Update)
        .pop()
        .expect("update approval");
    let shown = &update.updates[0];
    assert!(shown["new_permissions"]
        .get("endowment:network-access")
        .is_some());
    assert!(shown["unused_permissions"].get("manage_state").is_some());
    assert!(shown["approved_permissions"].get("endowment:rpc").is_some());

    let mut saw_update = false;
    while let Ok(envelope) = events.try_recv() {
        if envelope.kind == topics::TOPIC_UNIT_UPDATED {
            assert_eq!(envelope.payload["previous_version"], "1.0.0");
            saw_update = true;
        }
    }
    assert!(saw_update);

    let history = harness.orchestrator.get("npm:u").expect("unit").version_history;
    assert_eq!(history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn update_to_an_older_or_equal_version_is_skipped() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:u", "1.0.0", "// v1", PermissionMap::new());
    install_one(&harness, "npm:u", "*").await.expect("install");

    let location = harness.location("npm:u", "*");
    let outcome = harness
        .orchestrator
        .update(ORIGIN, "npm:u", location, Some("*"))
        .await
        .expect("no error");
    assert!(outcome.is_none());
    assert!(harness.approvals.records_of(ApprovalKind::Update).is_empty());
}

#[tokio::test(start_paused = true)]
async fn update_that_crashes_on_start_reports_updated_source() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:u", "1.0.0", "// v1", rpc_permissions());
    install_one(&harness, "npm:u", "*").await.expect("install");
    harness.locations.publish(
        "npm:u",
        "2.0.0",
        &format!("{CRASH_ON_START}\n// v2"),
        rpc_permissions(),
    );

    let location = harness.location("npm:u", "*");
    let err = harness
        .orchestrator
        .update(ORIGIN, "npm:u", location, None)
        .await
        .expect_err("start fails");
    assert!(matches!(err, UnitError::CrashedWithUpdatedSource(_)), "{err:?}");
    assert_eq!(
        harness.orchestrator.get("npm:u").expect("unit").version.to_string(),
        "2.0.0"
    );
    assert_eq!(harness.orchestrator.status("npm:u"), Some(UnitStatus::Crashed));
    assert!(!harness.execution.is_running("npm:u"));
    assert_eq!(harness.execution.execute_count("npm:u"), 2);

    // The unit stays installed and the next request tries to start it.
    let err = harness
        .orchestrator
        .handle_request("npm:u", ORIGIN, HandlerType::Rpc, json!({"method": "m"}))
        .await
        .expect_err("new source still crashes");
    assert!(!matches!(err, UnitError::Installing(_)), "{err:?}");
    assert_eq!(harness.execution.execute_count("npm:u"), 3);
}

#[tokio::test(start_paused = true)]
async fn checksum_mismatch_fails_the_install() {
    let harness = Harness::new();
    let mut manifest = manifest_for("1.0.0", "// real", PermissionMap::new());
    manifest.checksum = "0".repeat(64);
    harness
        .locations
        .publish_manifest("npm:bad", manifest, "// real");
    let mut events = harness.bus.subscribe();

    let err = install_one(&harness, "npm:bad", "*")
        .await
        .expect_err("checksum mismatch");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("checksum"));
    assert!(!harness.orchestrator.has("npm:bad"));

    let mut failed = false;
    while let Ok(envelope) = events.try_recv() {
        failed |= envelope.kind == topics::TOPIC_UNIT_INSTALL_FAILED;
    }
    assert!(failed);
    let install = harness
        .approvals
        .records_of(ApprovalKind::Install)
        .pop()
        .expect("install approval");
    assert!(install.last_update().expect("closed")["error"]
        .as_str()
        .is_some_and(|message| message.contains("checksum")));
}

#[tokio::test(start_paused = true)]
async fn excluded_permissions_are_refused() {
    let mut config = OrchestratorConfig::default();
    config
        .excluded_permissions
        .insert("endowment:keyring".into(), "keyrings are disabled".into());
    let harness = Harness::with_config(config);
    let permissions = PermissionMap::from([(
        "endowment:keyring".to_string(),
        PermissionSpec::default(),
    )]);
    harness
        .locations
        .publish("npm:keys", "1.0.0", "// keys", permissions);

    let err = install_one(&harness, "npm:keys", "*")
        .await
        .expect_err("excluded");
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(err.to_string().contains("keyrings are disabled"));
}

#[tokio::test(start_paused = true)]
async fn allowlist_requires_a_verified_registry_entry() {
    let config = OrchestratorConfig {
        require_allowlist: true,
        ..OrchestratorConfig::default()
    };
    let harness = Harness::with_config(config);
    let permissions = PermissionMap::from([(
        "endowment:network-access".to_string(),
        PermissionSpec::default(),
    )]);
    harness
        .locations
        .publish("npm:net", "1.0.0", "// net", permissions.clone());
    harness
        .registry
        .set_verdict("npm:net", RegistryVerdict::new(RegistryStatus::Unverified));

    let err = install_one(&harness, "npm:net", "*")
        .await
        .expect_err("not allow-listed");
    assert_eq!(err.kind(), ErrorKind::Registry);
    assert!(err.to_string().contains("allow-list"));

    harness
        .locations
        .publish("npm:exempt", "1.0.0", "// exempt", rpc_permissions());
    harness
        .registry
        .set_verdict("npm:exempt", RegistryVerdict::new(RegistryStatus::Unverified));
    install_one(&harness, "npm:exempt", "*")
        .await
        .expect("exempt permissions skip the allow-list");
}

#[tokio::test(start_paused = true)]
async fn blocked_versions_cannot_be_installed() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:evil", "1.0.0", "// evil", PermissionMap::new());
    harness.registry.block("npm:evil", "drains wallets");

    let err = install_one(&harness, "npm:evil", "*")
        .await
        .expect_err("blocked");
    assert_eq!(err.kind(), ErrorKind::Registry);
    assert!(err.to_string().contains("drains wallets"));
}

#[tokio::test(start_paused = true)]
async fn rejected_approval_leaves_nothing_behind() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:a", "1.0.0", "// a", rpc_permissions());
    harness.approvals.reject("npm:a");

    let err = install_one(&harness, "npm:a", "*")
        .await
        .expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::ApprovalRejected);
    assert!(!harness.orchestrator.has("npm:a"));
    assert!(harness.permissions.permissions("npm:a").is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_ids_and_ranges_are_rejected_up_front() {
    let harness = Harness::new();
    let err = install_one(&harness, "no-scheme", "*")
        .await
        .expect_err("bad id");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = install_one(&harness, "npm:a", "not a range")
        .await
        .expect_err("bad range");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test(start_paused = true)]
async fn always_reload_locations_reinstall_every_time() {
    let harness = Harness::new();
    harness
        .locations
        .publish("local:dev", "1.0.0", "// dev", rpc_permissions());
    harness.locations.set_always_reload("local:dev");
    install_one(&harness, "local:dev", "*").await.expect("first");
    install_one(&harness, "local:dev", "*").await.expect("second");

    assert_eq!(harness.execution.execute_count("local:dev"), 2);
    assert_eq!(harness.approvals.records_of(ApprovalKind::Install).len(), 2);
    assert!(harness.orchestrator.is_running("local:dev"));
}

#[tokio::test(start_paused = true)]
async fn failed_batch_removes_units_it_force_reinstalled() {
    let harness = Harness::new();
    harness
        .locations
        .publish("local:dev", "1.0.0", "// dev", rpc_permissions());
    harness.locations.set_always_reload("local:dev");
    install_one(&harness, "local:dev", "*").await.expect("first");
    harness.locations.publish(
        "npm:z",
        "1.0.0",
        &format!("{CRASH_ON_START}\n// z"),
        PermissionMap::new(),
    );

    let err = harness
        .orchestrator
        .install(ORIGIN, &request(&[("local:dev", "*"), ("npm:z", "*")]))
        .await
        .expect_err("npm:z fails to start");
    assert!(!matches!(err, UnitError::Validation(_)), "{err:?}");

    assert!(!harness.orchestrator.has("local:dev"));
    assert!(!harness.orchestrator.has("npm:z"));
    assert!(!harness.execution.is_running("local:dev"));
    assert!(harness.permissions.permissions("local:dev").is_empty());
}

#[tokio::test(start_paused = true)]
async fn remove_cleans_up_unit_access_caveats() {
    let harness = Harness::new();
    for id in ["npm:a", "npm:b"] {
        harness
            .locations
            .publish(id, "1.0.0", &format!("// {id}"), PermissionMap::new());
        install_one(&harness, id, "*").await.expect("install");
    }
    harness.permissions.set(
        "https://both.example",
        UNIT_ACCESS_PERMISSION,
        PermissionSpec::with_caveat(UNIT_IDS_CAVEAT, json!({"npm:a": {}, "npm:b": {}})),
    );
    harness.permissions.set(
        "https://only-a.example",
        UNIT_ACCESS_PERMISSION,
        PermissionSpec::with_caveat(UNIT_IDS_CAVEAT, json!({"npm:a": {}})),
    );
    let mut events = harness.bus.subscribe();

    harness
        .orchestrator
        .remove(&["npm:a".to_string()])
        .await
        .expect("remove");

    assert!(!harness.orchestrator.has("npm:a"));
    assert!(!harness.execution.is_running("npm:a"));
    let both = harness.permissions.permissions("https://both.example");
    let remaining = &both[UNIT_ACCESS_PERMISSION]
        .caveat(UNIT_IDS_CAVEAT)
        .expect("caveat")
        .value;
    assert_eq!(remaining, &json!({"npm:b": {}}));
    assert!(harness
        .permissions
        .permissions("https://only-a.example")
        .is_empty());

    let mut kinds = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        kinds.push(envelope.kind);
    }
    assert!(kinds.contains(&topics::TOPIC_UNIT_UNINSTALLED.to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some(topics::TOPIC_UNIT_REMOVED));
}

#[tokio::test(start_paused = true)]
async fn remove_reports_missing_units_but_removes_the_rest() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:a", "1.0.0", "// a", PermissionMap::new());
    install_one(&harness, "npm:a", "*").await.expect("install");

    let err = harness
        .orchestrator
        .remove(&["npm:ghost".to_string(), "npm:a".to_string()])
        .await
        .expect_err("ghost is missing");
    assert!(matches!(err, UnitError::NotFound(_)));
    assert!(!harness.orchestrator.has("npm:a"));
}

#[tokio::test(start_paused = true)]
async fn registry_verdicts_block_and_unblock_units() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:a", "1.0.0", "// a", PermissionMap::new());
    install_one(&harness, "npm:a", "*").await.expect("install");

    harness.registry.block("npm:a", "compromised");
    harness
        .orchestrator
        .update_blocked_units()
        .await
        .expect("refresh");
    let unit = harness.orchestrator.get("npm:a").expect("unit");
    assert!(unit.blocked);
    assert!(!unit.enabled);
    assert_eq!(unit.status, UnitStatus::Stopped);
    assert_eq!(
        unit.block_reason.and_then(|reason| reason.explanation).as_deref(),
        Some("compromised")
    );
    assert!(matches!(
        harness.orchestrator.enable("npm:a"),
        Err(UnitError::Blocked(_))
    ));
    assert!(harness.orchestrator.runnable_units().is_empty());

    harness
        .registry
        .set_verdict("npm:a", RegistryVerdict::new(RegistryStatus::Verified));
    harness
        .orchestrator
        .update_blocked_units()
        .await
        .expect("refresh");
    let unit = harness.orchestrator.get("npm:a").expect("unit");
    assert!(!unit.blocked);
    assert!(unit.block_reason.is_none());
    assert!(!unit.enabled);
    harness.orchestrator.enable("npm:a").expect("enable");
    assert_eq!(harness.orchestrator.runnable_units().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn registry_outage_surfaces_as_a_registry_error() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:a", "1.0.0", "// a", PermissionMap::new());
    install_one(&harness, "npm:a", "*").await.expect("install");
    harness.registry.set_unavailable(true);

    let err = harness
        .orchestrator
        .update_blocked_units()
        .await
        .expect_err("offline");
    assert_eq!(err.kind(), ErrorKind::Registry);
}

#[tokio::test(start_paused = true)]
async fn successful_batch_reports_updates_after_every_unit_is_done() {
    let harness = Harness::new();
    harness
        .locations
        .publish("npm:old", "1.0.0", "// old v1", PermissionMap::new());
    install_one(&harness, "npm:old", "*").await.expect("install");
    harness
        .locations
        .publish("npm:old", "1.5.0", "// old v1.5", PermissionMap::new());
    harness
        .locations
        .publish("npm:new", "0.1.0", "// new", PermissionMap::new());
    let mut events = harness.bus.subscribe();

    let results = harness
        .orchestrator
        .install(ORIGIN, &request(&[("npm:new", "*"), ("npm:old", "^1.5.0")]))
        .await
        .expect("batch");
    assert_eq!(results["npm:old"].version.to_string(), "1.5.0");
    assert!(!harness.orchestrator.has_snapshot("npm:old"));

    let mut kinds = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if envelope.kind == topics::TOPIC_UNIT_UPDATED {
            assert_eq!(envelope.payload["previous_version"], "1.0.0");
        }
        kinds.push(envelope.kind);
    }
    let tail: Vec<&str> = kinds.iter().rev().take(2).map(String::as_str).collect();
    assert_eq!(tail, [topics::TOPIC_UNIT_UPDATED, topics::TOPIC_UNIT_INSTALLED]);
}
