use std::sync::Arc;
use std::time::Duration;

use crate::cache::{spawn_cache_janitor, ResultCache};
use crate::config::KernelConfig;
use crate::gateway::{AnalysisBackend, AnalysisGateway, GatewayConfig};
use crate::health::HealthMonitor;
use crate::jobs::{spawn_retention_sweeper, JobStore};
use crate::orchestrator::Orchestrator;
use crate::registry::ClientRegistry;
use crate::transport::{CommandBackend, ResiliencePolicy, ShareBackend, Transports};

/// Services partagés du kernel, assemblés une fois au démarrage
#[derive(Clone)]
pub struct Kernel {
    pub registry: Arc<ClientRegistry>,
    pub jobs: Arc<JobStore>,
    pub cache: Arc<ResultCache>,
    pub transports: Transports,
    pub gateway: Arc<AnalysisGateway>,
    pub orchestrator: Arc<Orchestrator>,
    pub health: HealthMonitor,
}

impl Kernel {
    pub fn assemble(
        cfg: &KernelConfig,
        command_backend: Arc<dyn CommandBackend>,
        share_backend: Arc<dyn ShareBackend>,
        analysis_backend: Arc<dyn AnalysisBackend>,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new(cfg.clients.clone(), cfg.orchestrator.tail_lines));

        let mut jobs = JobStore::new();
        if let Some(path) = &cfg.jobs.snapshot_file {
            jobs = jobs.with_snapshot(path);
        }
        let jobs = Arc::new(jobs);

        let cache = Arc::new(ResultCache::new(cfg.cache.capacity, Duration::from_secs(cfg.cache.ttl_secs)));
        let transports = Transports::build(
            command_backend,
            share_backend,
            ResiliencePolicy::from_config(&cfg.transport),
        );
        let gateway = Arc::new(AnalysisGateway::new(analysis_backend, GatewayConfig::from_llm(&cfg.llm)));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&jobs),
            transports.clone(),
            Arc::clone(&cache),
            Arc::clone(&gateway),
            cfg.orchestrator.max_concurrency,
        ));

        Self { registry, jobs, cache, transports, gateway, orchestrator, health: HealthMonitor::new() }
    }

    /// Tâches de fond : sonde santé, purge du cache, rétention des requêtes
    pub fn spawn_background(&self, cfg: &KernelConfig) {
        self.health
            .spawn_probes(Arc::clone(&self.gateway), Duration::from_secs(cfg.health.probe_interval_secs.max(1)));
        spawn_cache_janitor(Arc::clone(&self.cache), Duration::from_secs(cfg.cache.ttl_secs.max(1)));
        if let Some(retention) = cfg.orchestrator.retention_secs {
            spawn_retention_sweeper(
                Arc::clone(&self.jobs),
                Duration::from_secs(retention),
                Duration::from_secs(cfg.orchestrator.sweep_interval_secs.max(1)),
            );
        }
    }
}
