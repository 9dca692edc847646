//! Load, unload, reload, rollback and error threshold behavior.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::Harness;
use plexus_plugins::{
    ActivityKind, LoadOptions, PluginError, PluginName, PluginState, RollbackOutcome,
};

#[tokio::test]
async fn load_admits_registers_and_publishes() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);

    h.runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    assert!(h.runtime.is_loaded("billing"));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
    assert!(record.loaded_at.is_some());
    assert!(record.checksum.is_some());
    assert_eq!(h.host.routes_for("billing").len(), 1);
    assert!(h.host.instances().contains_key("billing"));
    assert_eq!(h.count("billing", ActivityKind::PluginLoaded).await, 1);
}

#[tokio::test]
async fn loading_an_active_plugin_is_a_noop() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);

    let first = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();
    let before = h.runtime.registry().require("billing").await.unwrap();

    let second = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.probe.instances(), 1);
    assert_eq!(h.runtime.registry().require("billing").await.unwrap(), before);
    assert_eq!(h.count("billing", ActivityKind::PluginLoaded).await, 1);
}

#[tokio::test]
async fn load_refuses_when_dependency_inactive() {
    let h = Harness::new();
    h.add_recorder("licensing", &[]);
    h.add_recorder("billing", &["licensing"]);
    h.runtime.registry().sync_with_filesystem().await.unwrap();

    let err = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PluginError::DependencyNotSatisfied { ref dependency, .. } if dependency == "licensing"
    ));
    assert!(!h.runtime.is_loaded("billing"));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Disabled);
    assert_eq!(record.error_count, 0);
}

#[tokio::test]
async fn failed_first_load_marks_plugin_failed() {
    let h = Harness::new();
    h.add_recorder("broken", &[]);
    h.probe.fail_register.store(true, Ordering::SeqCst);

    let err = h
        .runtime
        .load_plugin("broken", LoadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::EntryPointFailed { .. }));

    assert!(!h.runtime.is_loaded("broken"));
    let record = h.runtime.registry().require("broken").await.unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.error_count, 1);
    assert!(h.host.routes_for("broken").is_empty());
    assert_eq!(h.count("broken", ActivityKind::PluginFailed).await, 1);
    assert_eq!(h.count("broken", ActivityKind::PluginHotReloaded).await, 0);
}

#[tokio::test]
async fn missing_backend_fails_load() {
    let h = Harness::new();
    common::write_plugin(h.plugins_dir(), "theme", "version = \"0.1.0\"\n");

    let err = h
        .runtime
        .load_plugin("theme", LoadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::MissingEntryPoint(_)));
    let record = h.runtime.registry().require("theme").await.unwrap();
    assert_eq!(record.state, PluginState::Failed);
}

#[tokio::test]
async fn slow_registration_times_out() {
    let h = Harness::with_settings(|s| s.entry_timeout = Duration::from_millis(100));
    h.add_recorder("sluggish", &[]);
    *h.probe.register_delay.lock().unwrap() = Some(Duration::from_secs(5));

    let err = h
        .runtime
        .load_plugin("sluggish", LoadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::Timeout { operation: "register", .. }));
    assert!(!h.runtime.is_loaded("sluggish"));
    let record = h.runtime.registry().require("sluggish").await.unwrap();
    assert_eq!(record.state, PluginState::Failed);
}

#[tokio::test]
async fn unload_clears_surfaces_and_intent() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    h.runtime.unload_plugin("billing").await.unwrap();

    assert!(!h.runtime.is_loaded("billing"));
    assert!(h.host.routes_for("billing").is_empty());
    assert!(!h.host.instances().contains_key("billing"));
    assert_eq!(h.probe.cleanups.load(Ordering::SeqCst), 1);
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Disabled);
    assert!(!record.enabled);
}

#[tokio::test]
async fn reload_replaces_instance_and_keeps_enabled() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    let first = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    let second = h.runtime.reload_plugin("billing").await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(h.probe.instances(), 2);
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
    assert_eq!(h.host.routes_for("billing").len(), 1);
    assert_eq!(h.count("billing", ActivityKind::PluginHotReloaded).await, 1);
}

#[tokio::test]
async fn failed_reload_rolls_back_to_previous_instance() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    let original = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    h.probe.fail_register.store(true, Ordering::SeqCst);
    h.runtime.reload_plugin("billing").await.unwrap_err();

    let current = h.runtime.instance("billing").unwrap();
    assert!(Arc::ptr_eq(&current, &original));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
    assert_eq!(h.host.routes_for("billing").len(), 1);
    assert_eq!(h.count("billing", ActivityKind::PluginRecovered).await, 1);
    assert_eq!(h.count("billing", ActivityKind::PluginFailed).await, 1);
    assert_eq!(h.count("billing", ActivityKind::PluginHotReloaded).await, 0);
}

#[tokio::test]
async fn rollback_restores_point_without_touching_enabled() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    let original = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();
    assert!(h.runtime.create_rollback_point("billing").await);

    let name = PluginName::new("billing").unwrap();
    let outcome = h.runtime.rollback(&name, "bad deploy").await;

    assert!(matches!(outcome, RollbackOutcome::Restored { .. }));
    let current = h.runtime.instance("billing").unwrap();
    assert!(Arc::ptr_eq(&current, &original));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
    assert_eq!(h.count("billing", ActivityKind::PluginRecovered).await, 1);
}

#[tokio::test]
async fn rollback_without_point_fails_plugin() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    let name = PluginName::new("billing").unwrap();
    let outcome = h.runtime.rollback(&name, "corrupted state").await;

    assert_eq!(outcome, RollbackOutcome::Failed);
    assert!(!h.runtime.is_loaded("billing"));
    assert!(h.host.routes_for("billing").is_empty());
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert_eq!(record.last_error.unwrap().message, "corrupted state");
}

#[tokio::test]
async fn fifth_error_disables_and_stops_plugin() {
    let h = Harness::new();
    h.add_recorder("flaky", &[]);
    h.runtime
        .load_plugin("flaky", LoadOptions::default())
        .await
        .unwrap();

    for i in 1..=4 {
        let outcome = h.runtime.report_error("flaky", &format!("error {i}")).await.unwrap();
        assert!(!outcome.auto_disabled);
        assert!(h.runtime.is_loaded("flaky"));
    }
    let outcome = h.runtime.report_error("flaky", "error 5").await.unwrap();

    assert!(outcome.auto_disabled);
    assert!(!h.runtime.is_loaded("flaky"));
    let record = h.runtime.registry().require("flaky").await.unwrap();
    assert_eq!(record.state, PluginState::Failed);
    assert!(!record.enabled);
    assert_eq!(record.error_count, 5);
    assert_eq!(h.count("flaky", ActivityKind::PluginDisabled).await, 1);

    // Further errors only count.
    let outcome = h.runtime.report_error("flaky", "error 6").await.unwrap();
    assert!(!outcome.auto_disabled);
    assert_eq!(outcome.record.error_count, 6);
}

#[tokio::test]
async fn disabling_a_loaded_plugin_unloads_it() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();

    h.runtime.set_enabled("billing", false).await.unwrap();

    assert!(!h.runtime.is_loaded("billing"));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert!(!record.enabled);
    assert_eq!(record.state, PluginState::Disabled);
}

#[tokio::test]
async fn shutdown_cleans_up_and_keeps_intent() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.add_recorder("seo", &[]);
    h.runtime.registry().sync_with_filesystem().await.unwrap();
    h.runtime.load_all_enabled().await.unwrap();

    h.runtime.shutdown().await;

    assert!(h.runtime.loaded_names().is_empty());
    assert_eq!(h.probe.cleanups.load(Ordering::SeqCst), 2);
    for name in ["billing", "seo"] {
        let record = h.runtime.registry().require(name).await.unwrap();
        assert_eq!(record.state, PluginState::Disabled);
        assert!(record.enabled);
    }
}

#[tokio::test]
async fn parked_plugin_without_directory_is_not_loaded() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.runtime.registry().sync_with_filesystem().await.unwrap();
    std::fs::remove_dir_all(h.plugins_dir().join("billing")).unwrap();
    h.runtime.registry().sync_with_filesystem().await.unwrap();

    let err = h
        .runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PluginError::NotFound(ref n) if n == "billing"));
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Maintenance);
    assert_eq!(record.error_count, 0);
    assert_eq!(h.probe.instances(), 0);
    assert_eq!(h.count("billing", ActivityKind::PluginFailed).await, 0);
}

#[tokio::test]
async fn concurrent_reloads_of_one_plugin_do_not_interleave() {
    let h = Harness::new();
    h.add_recorder("billing", &[]);
    h.runtime
        .load_plugin("billing", LoadOptions::default())
        .await
        .unwrap();
    *h.probe.register_delay.lock().unwrap() = Some(Duration::from_millis(100));

    let (first, second) = tokio::join!(
        h.runtime.reload_plugin("billing"),
        h.runtime.reload_plugin("billing"),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.probe.instances(), 3);
    assert_eq!(h.probe.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(h.host.routes_for("billing").len(), 1);
    assert_eq!(h.count("billing", ActivityKind::PluginHotReloaded).await, 2);
    let record = h.runtime.registry().require("billing").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
}
