//! Health sweeps: classification, failing checks and corrective reloads.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::Harness;
use plexus_plugins::{
    ActivityKind, HealthLevel, HealthMonitor, LoadOptions, PluginState, ResourceSample,
    ResourceSampler,
};

/// Reports the same sample for every process.
struct FixedSampler(ResourceSample);

impl ResourceSampler for FixedSampler {
    fn sample(&self, _pid: Option<u32>) -> ResourceSample {
        self.0
    }
}

fn monitor(h: &Harness, memory_mb: f64, cpu_percent: f64) -> HealthMonitor {
    HealthMonitor::new(
        Arc::clone(&h.runtime),
        Arc::new(FixedSampler(ResourceSample {
            memory_mb,
            cpu_percent,
        })),
    )
}

#[tokio::test]
async fn sweep_stores_classified_sample() {
    let h = Harness::new();
    h.add_recorder("seo", &[]);
    h.runtime
        .load_plugin("seo", LoadOptions::default())
        .await
        .unwrap();

    let report = monitor(&h, 250.0, 10.0).sweep().await;

    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.samples[0].level, HealthLevel::Warning);
    assert!(report.reloaded.is_empty());
    let record = h.runtime.registry().require("seo").await.unwrap();
    assert_eq!(record.health.status, HealthLevel::Warning);
    assert!((record.health.metrics.memory_mb - 250.0).abs() < f64::EPSILON);
    assert!(record.health.last_check.is_some());
}

#[tokio::test]
async fn memory_pressure_triggers_exactly_one_reload() {
    let h = Harness::new();
    h.add_recorder("leaky", &[]);
    h.runtime
        .load_plugin("leaky", LoadOptions::default())
        .await
        .unwrap();

    let report = monitor(&h, 1200.0, 5.0).sweep().await;

    assert_eq!(report.samples[0].level, HealthLevel::Critical);
    assert_eq!(report.reloaded.len(), 1);
    assert_eq!(h.probe.instances(), 2);
    assert_eq!(h.count("leaky", ActivityKind::PluginHotReloaded).await, 1);
    let record = h.runtime.registry().require("leaky").await.unwrap();
    assert_eq!(record.state, PluginState::Active);
    assert!(record.enabled);
}

#[tokio::test]
async fn failing_health_check_counts_as_error() {
    let h = Harness::new();
    h.add_recorder("seo", &[]);
    h.runtime
        .load_plugin("seo", LoadOptions::default())
        .await
        .unwrap();
    h.probe.fail_health.store(true, Ordering::SeqCst);

    let report = monitor(&h, 10.0, 1.0).sweep().await;

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.samples[0].level, HealthLevel::Healthy);
    let record = h.runtime.registry().require("seo").await.unwrap();
    assert_eq!(record.error_count, 1);
    assert!(record.last_error.unwrap().message.contains("not ready"));
}

#[tokio::test]
async fn unloaded_plugins_are_not_sampled() {
    let h = Harness::new();
    h.add_recorder("seo", &[]);
    h.runtime.registry().sync_with_filesystem().await.unwrap();

    let report = monitor(&h, 10.0, 1.0).sweep().await;

    assert!(report.samples.is_empty());
    let record = h.runtime.registry().require("seo").await.unwrap();
    assert_eq!(record.health.status, HealthLevel::Unknown);
}
