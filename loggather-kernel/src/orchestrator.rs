/**
 * ORCHESTRATOR - Cœur du moteur : d'une liste de cibles à un job d'analyse suivi
 *
 * RÔLE :
 * Accepte un lot de cibles, crée ou réutilise une requête dans le JobStore,
 * répartit le travail par cible sous une limite de concurrence globale,
 * agrège les résultats (y compris les échecs partiels) et finalise la requête.
 *
 * FONCTIONNEMENT :
 * - submit() ne fait aucune I/O : validation, claim, puis tâche de fond
 * - Une tâche par cible ; les collectes prennent un permis du sémaphore global,
 *   les slots rattachés attendent la collecte existante sans permis
 * - Par source : fetch → empreinte → cache (sauf force_refresh) → gateway
 * - Barrière de jointure sur toutes les tâches avant l'état terminal ;
 *   une tâche qui panique devient un résultat d'erreur
 *
 * HORS JOBS :
 * - collect_raw() : contenu brut d'une cible, sans analyse ni cache, sous permis
 *   du sémaphore ; refusée si une requête collecte déjà la cible
 * - client_overview() : cibles + statut et date de leur dernière analyse
 */

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, ResultCache};
use crate::gateway::{AnalysisGateway, LogType};
use crate::jobs::{Assignment, Claim, Finalization, JobStore, TargetOutcome};
use crate::models::{
    distinct_items, AnalysisRequest, ClientAnalysis, JobStatus, LogAnalysisResult, OverallStatus, RawCollection,
    RawLogResult, SlotState,
};
use crate::registry::{ClientRegistry, Target};
use crate::transport::Transports;

/// Plafond d'actions dans la synthèse de repli
const MAX_SUMMARY_ITEMS: usize = 50;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown target(s): {}", .0.join(", "))]
    TargetNotFound(Vec<String>),
    #[error("no targets configured")]
    NoTargets,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollectError {
    #[error("unknown target: {0}")]
    TargetNotFound(String),
    #[error("target {target} is being collected by request {request_id}")]
    TargetBusy { target: String, request_id: String },
}

/// Ligne de GET /clients
#[derive(Debug, Clone, Serialize)]
pub struct ClientOverview {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    /// Statut de la dernière analyse terminée, "unknown" sinon
    pub status: &'static str,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_analyzed: Option<OffsetDateTime>,
}

pub struct Orchestrator {
    registry: Arc<ClientRegistry>,
    jobs: Arc<JobStore>,
    transports: Transports,
    cache: Arc<ResultCache>,
    gateway: Arc<AnalysisGateway>,
    limiter: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ClientRegistry>,
        jobs: Arc<JobStore>,
        transports: Transports,
        cache: Arc<ResultCache>,
        gateway: Arc<AnalysisGateway>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            jobs,
            transports,
            cache,
            gateway,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    pub fn gateway(&self) -> &Arc<AnalysisGateway> {
        &self.gateway
    }

    /// Soumet un lot ; renvoie l'identifiant sans attendre aucune I/O.
    /// Doit être appelé depuis un runtime tokio.
    pub fn submit(
        self: &Arc<Self>,
        target_names: &[String],
        force_refresh: bool,
        include_summary: bool,
    ) -> Result<String, SubmitError> {
        let names = self.normalize(target_names);
        if names.is_empty() {
            return Err(SubmitError::NoTargets);
        }
        let targets = self.registry.resolve(&names).map_err(SubmitError::TargetNotFound)?;

        match self.jobs.claim(&names, force_refresh, include_summary) {
            Claim::Existing(request_id) => {
                info!("[orchestrator] reusing in-flight request {} for {:?}", request_id, names);
                Ok(request_id)
            }
            Claim::Created { request_id, assignments } => {
                if let Err(e) = self.jobs.transition(&request_id, JobStatus::Running) {
                    error!("[orchestrator] cannot start request {}: {}", request_id, e);
                }
                info!(
                    "[orchestrator] request {} started for {} target(s) (force_refresh: {})",
                    request_id,
                    targets.len(),
                    force_refresh
                );
                let this = Arc::clone(self);
                let id = request_id.clone();
                tokio::spawn(async move {
                    this.drive(id, targets, assignments, force_refresh, include_summary).await;
                });
                Ok(request_id)
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<AnalysisRequest> {
        self.jobs.get(request_id)
    }

    /// Analyses des cibles déjà terminées ; la requête complète si elle est terminale
    pub fn analyses_so_far(&self, request: &AnalysisRequest) -> Vec<ClientAnalysis> {
        if request.status.is_terminal() {
            return request.analyses.clone();
        }
        request
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Done)
            .map(|slot| {
                let hostname = self.registry.get(&slot.target).map(|t| t.config.hostname.clone()).unwrap_or_default();
                ClientAnalysis::build(&slot.target, &hostname, slot.results.clone())
            })
            .collect()
    }

    pub fn latest_for_target(&self, name: &str) -> Option<ClientAnalysis> {
        self.jobs.latest_for_target(name)
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    pub fn client_overview(&self) -> Vec<ClientOverview> {
        self.registry
            .list()
            .into_iter()
            .map(|info| {
                let last = self.jobs.last_analysis(&info.name);
                ClientOverview {
                    status: last.as_ref().map(|(_, a)| a.overall_status.as_str()).unwrap_or("unknown"),
                    last_analyzed: last.map(|(done, _)| done),
                    name: info.name,
                    hostname: info.hostname,
                    ip: info.ip,
                }
            })
            .collect()
    }

    /// Récupère le contenu brut de chaque source d'une cible, sans analyse
    pub async fn collect_raw(&self, name: &str) -> Result<RawCollection, CollectError> {
        let target = self
            .registry
            .get(name)
            .ok_or_else(|| CollectError::TargetNotFound(name.to_string()))?;
        if let Some(request_id) = self.jobs.collecting(name) {
            return Err(CollectError::TargetBusy { target: name.to_string(), request_id });
        }

        let _permit = Arc::clone(&self.limiter).acquire_owned().await.ok();
        info!("[orchestrator] raw collection on {} ({} source(s))", name, target.sources.len());

        let mut log_results = Vec::with_capacity(target.sources.len());
        for source in &target.sources {
            let source_id = source.id();
            let result = match self.transports.fetch(&target.config, source).await {
                Ok(content) => RawLogResult::fetched(&source_id, content),
                Err(e) => {
                    warn!("[orchestrator] raw fetch {} on {} failed: {}", source_id, name, e);
                    RawLogResult::failed(&source_id, e.to_string())
                }
            };
            log_results.push(result);
        }
        Ok(RawCollection::build(name, &target.config.hostname, log_results))
    }

    /// Vide → toutes les cibles ; doublons retirés en gardant le premier
    fn normalize(&self, target_names: &[String]) -> Vec<String> {
        if target_names.is_empty() {
            return self.registry.names();
        }
        let mut names: Vec<String> = Vec::with_capacity(target_names.len());
        for name in target_names {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    async fn drive(
        self: Arc<Self>,
        request_id: String,
        targets: Vec<Arc<Target>>,
        assignments: Vec<Assignment>,
        force_refresh: bool,
        include_summary: bool,
    ) {
        let mut handles = Vec::with_capacity(assignments.len());
        for (target, assignment) in targets.iter().cloned().zip(assignments) {
            let this = Arc::clone(&self);
            let id = request_id.clone();
            let name = target.name().to_string();
            let handle = tokio::spawn(async move {
                let outcome = match assignment {
                    Assignment::Collect { .. } => this.collect_target(&id, &target, force_refresh).await,
                    Assignment::Attach { owner, outcome, .. } => {
                        this.jobs.start_target(&id, target.name());
                        debug!("[orchestrator] {} attached to collection of {} by {}", id, target.name(), owner);
                        await_shared(outcome, &owner).await
                    }
                };
                this.jobs.complete_target(&id, target.name(), outcome);
            });
            handles.push((name, handle));
        }

        // barrière : toutes les cibles terminées avant l'état final
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!("[orchestrator] task for {} in {} aborted: {}", name, request_id, e);
                self.jobs
                    .complete_target(&request_id, &name, TargetOutcome::failed(format!("collection task aborted: {e}")));
            }
        }

        self.finish(&request_id, &targets, include_summary).await;
    }

    async fn collect_target(&self, request_id: &str, target: &Target, force_refresh: bool) -> TargetOutcome {
        let _permit = match Arc::clone(&self.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return TargetOutcome::failed("worker pool closed"),
        };
        self.jobs.start_target(request_id, target.name());

        if target.sources.is_empty() {
            return TargetOutcome {
                results: vec![LogAnalysisResult::failure("config", "no log sources configured")],
                failure: Some("no log sources configured".into()),
            };
        }

        let mut results = Vec::with_capacity(target.sources.len());
        let mut fetch_failures = 0;
        for source in &target.sources {
            let source_id = source.id();
            match self.transports.fetch(&target.config, source).await {
                Ok(content) => {
                    results.push(self.analyze_source(target.name(), &source_id, &content, force_refresh).await)
                }
                Err(e) => {
                    warn!("[orchestrator] fetch {} on {} failed: {}", source_id, target.name(), e);
                    fetch_failures += 1;
                    results.push(LogAnalysisResult::failure(&source_id, e.to_string()));
                }
            }
        }

        let failure = (fetch_failures == target.sources.len())
            .then(|| format!("all {} log source(s) failed to fetch", fetch_failures));
        TargetOutcome { results, failure }
    }

    async fn analyze_source(&self, target: &str, source_id: &str, content: &str, force_refresh: bool) -> LogAnalysisResult {
        if content.trim().is_empty() {
            return LogAnalysisResult::empty_source(source_id);
        }

        let fp = fingerprint(content);
        if !force_refresh {
            if let Some(mut hit) = self.cache.get(target, &fp) {
                debug!("[orchestrator] cache hit for {} on {}", source_id, target);
                hit.source = source_id.to_string();
                return hit;
            }
        }

        match self.gateway.analyze(source_id, content, LogType::classify(source_id)).await {
            Ok(result) => {
                self.cache.put(target, &fp, result.clone());
                result
            }
            Err(e) => {
                warn!("[orchestrator] analysis of {} on {} degraded: {}", source_id, target, e);
                LogAnalysisResult::minimal(source_id, format!("Analysis unavailable: {e}"))
            }
        }
    }

    async fn finish(&self, request_id: &str, targets: &[Arc<Target>], include_summary: bool) {
        let Some(request) = self.jobs.get(request_id) else {
            error!("[orchestrator] request {} vanished before finalization", request_id);
            return;
        };

        let analyses: Vec<ClientAnalysis> = request
            .slots
            .iter()
            .map(|slot| {
                let hostname = targets
                    .iter()
                    .find(|t| t.name() == slot.target)
                    .map(|t| t.config.hostname.as_str())
                    .unwrap_or_default();
                ClientAnalysis::build(&slot.target, hostname, slot.results.clone())
            })
            .collect();

        let action_items = distinct_items(analyses.iter().flat_map(|a| a.action_items.iter()), MAX_SUMMARY_ITEMS);
        let failed_targets = request.slots.iter().filter(|s| s.failure.is_some()).count();
        let all_failed = failed_targets == request.slots.len();

        let summary = if include_summary {
            Some(match self.gateway.summarize(&analyses).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("[orchestrator] batch summary for {} fell back to action items: {}", request_id, e);
                    fallback_summary(&analyses, &action_items)
                }
            })
        } else {
            None
        };

        let (status, overall_status, error) = if all_failed {
            (
                JobStatus::Failed,
                OverallStatus::Error,
                Some(format!("all {} target(s) failed", request.slots.len())),
            )
        } else {
            (JobStatus::Completed, OverallStatus::from_analyses(&analyses), None)
        };

        let fin = Finalization { status, analyses, summary, action_items, overall_status, error };
        match self.jobs.finalize(request_id, fin) {
            Ok(()) => info!(
                "[orchestrator] request {} {:?} ({} of {} target(s) failed)",
                request_id,
                status,
                failed_targets,
                request.slots.len()
            ),
            Err(e) => error!("[orchestrator] cannot finalize {}: {}", request_id, e),
        }

        if let Err(e) = self.jobs.save_snapshot().await {
            warn!("[orchestrator] failed to save job snapshot: {}", e);
        }
    }
}

async fn await_shared(
    mut outcome: tokio::sync::watch::Receiver<Option<TargetOutcome>>,
    owner: &str,
) -> TargetOutcome {
    let shared = match outcome.wait_for(|o| o.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    shared.unwrap_or_else(|| TargetOutcome::failed(format!("shared collection by request {owner} ended without a result")))
}

/// Synthèse déterministe quand le backend ne répond pas
pub fn fallback_summary(analyses: &[ClientAnalysis], action_items: &[String]) -> String {
    let with_issues = analyses
        .iter()
        .filter(|a| a.overall_status >= crate::models::TargetStatus::Warning)
        .count();
    let mut text = format!(
        "Analysis completed for {} target(s), {} with issues.",
        analyses.len(),
        with_issues
    );
    if action_items.is_empty() {
        text.push_str(" No action items.");
    } else {
        text.push_str(" Action items:");
        for item in action_items {
            text.push_str(&format!("\n- {item}"));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_summary_lists_every_item() {
        let analyses = vec![ClientAnalysis::build("M1", "m1", vec![])];
        let items = vec!["Run DISM".to_string(), "Reboot".to_string()];
        let text = fallback_summary(&analyses, &items);
        assert!(text.starts_with("Analysis completed for 1 target(s), 0 with issues."));
        assert!(text.contains("- Run DISM"));
        assert!(text.contains("- Reboot"));
        assert!(fallback_summary(&analyses, &[]).ends_with("No action items."));
    }
}
