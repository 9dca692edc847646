//! Periodic health monitoring.
//!
//! Every sweep samples each loaded plugin, times its optional health check,
//! stores the result in the registry and reloads plugins whose memory use
//! crossed the reload threshold. A failing plugin never stops the sweep.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::name::PluginName;
use crate::record::{HealthLevel, HealthMetrics};
use crate::runtime::PluginRuntime;

/// Memory and CPU of one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    /// Resident memory in MiB.
    pub memory_mb: f64,
    /// CPU usage in percent.
    pub cpu_percent: f64,
}

/// Source of resource samples.
pub trait ResourceSampler: Send + Sync {
    /// Sample `pid`, or the host process when `None`.
    fn sample(&self, pid: Option<u32>) -> ResourceSample;
}

/// Samples processes through `sysinfo`.
///
/// The `System` is kept between sweeps; CPU usage is computed from the
/// difference between two refreshes, so the first sample of a process
/// reports 0%.
pub struct SysinfoSampler {
    system: Mutex<System>,
    host_pid: Option<Pid>,
}

impl std::fmt::Debug for SysinfoSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoSampler")
            .field("host_pid", &self.host_pid)
            .finish_non_exhaustive()
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSampler {
    /// Create a sampler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            host_pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self, pid: Option<u32>) -> ResourceSample {
        let Some(pid) = pid.map(Pid::from_u32).or(self.host_pid) else {
            return ResourceSample::default();
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process(pid) {
            debug!(pid = %pid, "Process not found while sampling");
            return ResourceSample::default();
        }
        system
            .process(pid)
            .map(|p| ResourceSample {
                memory_mb: bytes_to_mb(p.memory()),
                cpu_percent: f64::from(p.cpu_usage()),
            })
            .unwrap_or_default()
    }
}

#[allow(clippy::cast_precision_loss, clippy::arithmetic_side_effects)]
fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[allow(clippy::arithmetic_side_effects)]
fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// One plugin's result in a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSample {
    /// The plugin.
    pub name: PluginName,
    /// What was measured.
    pub metrics: HealthMetrics,
    /// How it was classified.
    pub level: HealthLevel,
}

/// Outcome of [`HealthMonitor::sweep`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    /// Stored samples.
    pub samples: Vec<PluginSample>,
    /// Plugins reloaded for memory pressure.
    pub reloaded: Vec<PluginName>,
    /// Plugins whose health check failed, with the error.
    pub errors: Vec<(PluginName, String)>,
}

/// The health monitor.
pub struct HealthMonitor {
    runtime: Arc<PluginRuntime>,
    sampler: Arc<dyn ResourceSampler>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<PluginRuntime>, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self { runtime, sampler }
    }

    /// Check every loaded plugin once.
    pub async fn sweep(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let thresholds = *self.runtime.registry().thresholds();
        let check_timeout = self.runtime.settings().health_check_timeout;

        for name in self.runtime.loaded_names() {
            let Some(instance) = self.runtime.instance(name.as_str()) else {
                continue;
            };

            let mut response_time_ms = 0.0;
            if instance.supports_health_check() {
                let started = Instant::now();
                let outcome = tokio::time::timeout(check_timeout, instance.health_check()).await;
                response_time_ms = millis(started.elapsed());
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!(
                        "health check timed out after {}s",
                        check_timeout.as_secs()
                    )),
                };
                if let Some(message) = failure {
                    warn!(plugin = %name, error = %message, "Health check failed");
                    if let Err(e) = self.runtime.report_error(name.as_str(), &message).await {
                        warn!(plugin = %name, error = %e, "Failed to record health check error");
                    }
                    report.errors.push((name.clone(), message));
                }
            }

            let resources = self.sampler.sample(instance.process_id());
            let metrics = HealthMetrics {
                memory_mb: resources.memory_mb,
                cpu_percent: resources.cpu_percent,
                response_time_ms,
            };
            let level = match self.runtime.registry().update_health(name.as_str(), metrics).await {
                Ok(level) => level,
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to store health sample");
                    continue;
                },
            };
            report.samples.push(PluginSample {
                name: name.clone(),
                metrics,
                level,
            });

            if thresholds.needs_reload(&metrics) && self.runtime.is_loaded(name.as_str()) {
                warn!(
                    plugin = %name,
                    memory_mb = metrics.memory_mb,
                    limit_mb = thresholds.reload_memory_mb,
                    "Memory limit exceeded, reloading plugin"
                );
                match self.runtime.reload_plugin(name.as_str()).await {
                    Ok(_) => report.reloaded.push(name),
                    Err(e) => warn!(plugin = %name, error = %e, "Corrective reload failed"),
                }
            }
        }

        debug!(
            sampled = report.samples.len(),
            reloaded = report.reloaded.len(),
            errors = report.errors.len(),
            "Health sweep complete"
        );
        report
    }

    /// Run [`sweep`](Self::sweep) on the configured interval.
    ///
    /// The first sweep happens one interval after the call.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let period = self.runtime.settings().health_interval;
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Health monitor started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_samples_host_process() {
        let sampler = SysinfoSampler::new();
        let sample = sampler.sample(None);
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);
    }

    #[test]
    fn unknown_pid_samples_as_zero() {
        let sampler = SysinfoSampler::new();
        assert_eq!(sampler.sample(Some(u32::MAX)), ResourceSample::default());
    }

    #[test]
    fn unit_conversions() {
        assert!((bytes_to_mb(3 * 1024 * 1024) - 3.0).abs() < f64::EPSILON);
        assert!((millis(Duration::from_millis(250)) - 250.0).abs() < 1e-9);
    }
}
