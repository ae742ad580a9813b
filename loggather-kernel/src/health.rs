use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::task;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::gateway::AnalysisGateway;
use crate::jobs::JobStore;
use crate::transport::Transports;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Connected,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub memory_pct: f32,
    pub cpu_pct: f32,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub memory_pct: f32,
    pub cpu_pct: f32,
    pub active_analyses: usize,
    pub cache_size: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub connected_clients: usize,
    pub active_clients: usize,
    pub llm_status: BackendStatus,
    pub system_metrics: SystemMetrics,
}

#[derive(Clone)]
pub struct HealthMonitor {
    start_time: Instant,
    llm_status: Arc<Mutex<BackendStatus>>,
    resources: Arc<Mutex<ResourceSample>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            llm_status: Arc::new(Mutex::new(BackendStatus::Unknown)),
            resources: Arc::new(Mutex::new(ResourceSample::default())),
        }
    }

    pub fn mark_backend(&self, reachable: bool) {
        let next = if reachable { BackendStatus::Connected } else { BackendStatus::Offline };
        let previous = std::mem::replace(&mut *self.llm_status.lock(), next);
        if previous != next {
            info!("[health] analysis backend {:?} -> {:?}", previous, next);
        }
    }

    pub fn backend_status(&self) -> BackendStatus {
        *self.llm_status.lock()
    }

    pub fn record_resources(&self, sample: ResourceSample) {
        *self.resources.lock() = sample;
    }

    /// Lit uniquement l'état déjà en mémoire, aucune I/O
    pub fn snapshot(&self, jobs: &JobStore, transports: &Transports, cache: &ResultCache) -> HealthSnapshot {
        let stats = transports.stats();
        let llm_status = self.backend_status();
        let resources = *self.resources.lock();

        HealthSnapshot {
            status: if llm_status == BackendStatus::Offline { "degraded" } else { "healthy" },
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connected_clients: stats.connected.len(),
            active_clients: stats.active(),
            llm_status,
            system_metrics: SystemMetrics {
                memory_pct: resources.memory_pct,
                cpu_pct: resources.cpu_pct,
                active_analyses: jobs.active_count(),
                cache_size: cache.len(),
            },
        }
    }

    /// Démarre la sonde périodique du backend et l'échantillonnage CPU/mémoire
    pub fn spawn_probes(&self, gateway: Arc<AnalysisGateway>, every: Duration) {
        let monitor = self.clone();
        info!("[health] starting probes (every {:?})", every);

        task::spawn(async move {
            let mut sys = System::new();
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;

                let reachable = gateway.probe().await;
                if !reachable {
                    warn!("[health] analysis backend unreachable");
                }
                monitor.mark_backend(reachable);

                let sample = sample_resources(&mut sys);
                debug!("[health] memory {:.1}%, cpu {:.1}%", sample.memory_pct, sample.cpu_pct);
                monitor.record_resources(sample);
            }
        });
    }
}

fn sample_resources(sys: &mut System) -> ResourceSample {
    sys.refresh_memory();
    sys.refresh_cpu_usage();
    let total = sys.total_memory();
    let memory_pct = if total > 0 { (sys.used_memory() as f64 / total as f64 * 100.0) as f32 } else { 0.0 };
    ResourceSample { memory_pct, cpu_pct: sys.global_cpu_info().cpu_usage() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BackendError, CommandBackend, ResiliencePolicy, ShareBackend};
    use crate::registry::ClientConfig;
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl CommandBackend for Nothing {
        async fn fetch_command(&self, _t: &ClientConfig, _c: &str) -> Result<String, BackendError> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl ShareBackend for Nothing {
        async fn fetch_share_tail(&self, _t: &ClientConfig, _p: &str, _m: usize) -> Result<String, BackendError> {
            Ok(String::new())
        }
    }

    fn transports() -> Transports {
        let backend = Arc::new(Nothing);
        Transports::build(backend.clone(), backend, ResiliencePolicy::default())
    }

    #[test]
    fn test_snapshot_starts_unknown_and_healthy() {
        let monitor = HealthMonitor::new();
        let snap = monitor.snapshot(&JobStore::new(), &transports(), &ResultCache::new(8, Duration::from_secs(60)));
        assert_eq!(snap.status, "healthy");
        assert_eq!(snap.llm_status, BackendStatus::Unknown);
        assert_eq!(snap.connected_clients, 0);
        assert_eq!(snap.system_metrics.active_analyses, 0);
    }

    #[test]
    fn test_offline_backend_degrades_status() {
        let monitor = HealthMonitor::new();
        monitor.mark_backend(false);
        let snap = monitor.snapshot(&JobStore::new(), &transports(), &ResultCache::new(8, Duration::from_secs(60)));
        assert_eq!(snap.status, "degraded");
        assert_eq!(snap.llm_status, BackendStatus::Offline);

        monitor.mark_backend(true);
        assert_eq!(monitor.backend_status(), BackendStatus::Connected);
    }

    #[test]
    fn test_resource_sample_in_range() {
        let mut sys = System::new();
        let sample = sample_resources(&mut sys);
        assert!((0.0..=100.0).contains(&sample.memory_pct));
    }
}
