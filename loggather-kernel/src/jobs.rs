/**
 * JOB STORE - Table des requêtes d'analyse et autorité de déduplication
 *
 * RÔLE :
 * Conserve chaque AnalysisRequest avec son cycle de vie et garantit qu'une cible
 * n'est collectée que par une seule requête à la fois.
 *
 * FONCTIONNEMENT :
 * - claim() : réutilise une requête non terminée couvrant toutes les cibles,
 *   sinon crée une requête ; les cibles déjà en cours de collecte sont rattachées
 *   (Attach) à la collecte existante via un canal watch
 * - Sections critiques courtes (parking_lot), jamais tenues à travers un await
 * - Statut monotone, requête terminée immuable
 * - Snapshot JSON optionnel (chargé au démarrage, réécrit après chaque fin de requête)
 */

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    AnalysisRequest, ClientAnalysis, JobStatus, LogAnalysisResult, OverallStatus, SlotState, TargetSlot,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("request not found: {0}")]
    RequestNotFound(String),
    #[error("invalid transition for request {request_id}: {from:?} -> {to:?}")]
    InvalidTransition { request_id: String, from: JobStatus, to: JobStatus },
    #[error("request {0} is still running")]
    StillRunning(String),
}

/// Résultat de la collecte d'une cible
#[derive(Debug, Clone, PartialEq)]
pub struct TargetOutcome {
    pub results: Vec<LogAnalysisResult>,
    /// Renseigné quand la cible entière a échoué
    pub failure: Option<String>,
}

impl TargetOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            results: vec![LogAnalysisResult::failure("collection", reason.clone())],
            failure: Some(reason),
        }
    }
}

/// Travail confié à une requête pour une cible
#[derive(Debug)]
pub enum Assignment {
    /// La requête collecte la cible elle-même
    Collect { target: String },
    /// Une autre requête collecte déjà la cible : on attend son résultat
    Attach {
        target: String,
        owner: String,
        outcome: watch::Receiver<Option<TargetOutcome>>,
    },
}

impl Assignment {
    pub fn target(&self) -> &str {
        match self {
            Assignment::Collect { target } | Assignment::Attach { target, .. } => target,
        }
    }
}

#[derive(Debug)]
pub enum Claim {
    /// Une requête non terminée couvre déjà toutes les cibles
    Existing(String),
    Created { request_id: String, assignments: Vec<Assignment> },
}

/// Contenu final d'une requête
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: JobStatus,
    pub analyses: Vec<ClientAnalysis>,
    pub summary: Option<String>,
    pub action_items: Vec<String>,
    pub overall_status: OverallStatus,
    pub error: Option<String>,
}

struct InFlight {
    request_id: String,
    outcome: watch::Sender<Option<TargetOutcome>>,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<String, AnalysisRequest>,
    /// cible → collecte en cours
    in_flight: HashMap<String, InFlight>,
}

#[derive(Default)]
pub struct JobStore {
    inner: RwLock<Inner>,
    snapshot_file: Option<PathBuf>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, path: impl AsRef<Path>) -> Self {
        self.snapshot_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn claim(&self, targets: &[String], force_refresh: bool, include_summary: bool) -> Claim {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let covering = inner
            .requests
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| targets.iter().all(|t| r.targets.contains(t)))
            .min_by_key(|r| r.created_at)
            .map(|r| r.request_id.clone());
        if let Some(existing) = covering {
            debug!("[jobs] request {} already covers {:?}", existing, targets);
            return Claim::Existing(existing);
        }

        let request_id = Uuid::new_v4().to_string();
        let mut slots = Vec::with_capacity(targets.len());
        let mut assignments = Vec::with_capacity(targets.len());
        for target in targets {
            match inner.in_flight.get(target) {
                Some(flight) => {
                    slots.push(TargetSlot::new(target, Some(flight.request_id.clone())));
                    assignments.push(Assignment::Attach {
                        target: target.clone(),
                        owner: flight.request_id.clone(),
                        outcome: flight.outcome.subscribe(),
                    });
                }
                None => {
                    let (tx, _rx) = watch::channel(None);
                    inner.in_flight.insert(
                        target.clone(),
                        InFlight { request_id: request_id.clone(), outcome: tx },
                    );
                    slots.push(TargetSlot::new(target, None));
                    assignments.push(Assignment::Collect { target: target.clone() });
                }
            }
        }

        let request = AnalysisRequest::new(request_id.clone(), slots, force_refresh, include_summary);
        inner.requests.insert(request_id.clone(), request);
        Claim::Created { request_id, assignments }
    }

    pub fn transition(&self, request_id: &str, to: JobStatus) -> Result<(), JobError> {
        let mut inner = self.inner.write();
        let request = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| JobError::RequestNotFound(request_id.to_string()))?;
        if !request.status.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                request_id: request_id.to_string(),
                from: request.status,
                to,
            });
        }
        request.status = to;
        if to.is_terminal() {
            request.completed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    pub fn start_target(&self, request_id: &str, target: &str) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner
            .requests
            .get_mut(request_id)
            .filter(|r| !r.status.is_terminal())
            .and_then(|r| r.slots.iter_mut().find(|s| s.target == target))
        {
            if slot.state == SlotState::Pending {
                slot.state = SlotState::Running;
            }
        }
    }

    /// Enregistre le résultat d'une cible ; si la requête possédait la collecte,
    /// libère la cible et publie le résultat aux requêtes rattachées.
    pub fn complete_target(&self, request_id: &str, target: &str, outcome: TargetOutcome) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(request) = inner.requests.get_mut(request_id).filter(|r| !r.status.is_terminal()) {
            if let Some(slot) = request.slots.iter_mut().find(|s| s.target == target) {
                slot.state = SlotState::Done;
                slot.results = outcome.results.clone();
                slot.failure = outcome.failure.clone();
            }
        }

        let owned = inner
            .in_flight
            .get(target)
            .map(|f| f.request_id == request_id)
            .unwrap_or(false);
        if owned {
            if let Some(flight) = inner.in_flight.remove(target) {
                flight.outcome.send_replace(Some(outcome));
            }
        }
    }

    pub fn finalize(&self, request_id: &str, fin: Finalization) -> Result<(), JobError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let request = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| JobError::RequestNotFound(request_id.to_string()))?;
        if !fin.status.is_terminal() || !request.status.can_transition_to(fin.status) {
            return Err(JobError::InvalidTransition {
                request_id: request_id.to_string(),
                from: request.status,
                to: fin.status,
            });
        }
        request.status = fin.status;
        request.completed_at = Some(OffsetDateTime::now_utc());
        request.analyses = fin.analyses;
        request.summary = fin.summary;
        request.action_items = fin.action_items;
        request.overall_status = Some(fin.overall_status);
        request.error = fin.error;

        // les collectes orphelines sont libérées : les rattachés voient le canal fermé
        inner.in_flight.retain(|_, f| f.request_id != request_id);
        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Option<AnalysisRequest> {
        self.inner.read().requests.get(request_id).cloned()
    }

    pub fn delete(&self, request_id: &str) -> Result<AnalysisRequest, JobError> {
        let mut inner = self.inner.write();
        let status = inner
            .requests
            .get(request_id)
            .map(|r| r.status)
            .ok_or_else(|| JobError::RequestNotFound(request_id.to_string()))?;
        if !status.is_terminal() {
            return Err(JobError::StillRunning(request_id.to_string()));
        }
        inner
            .requests
            .remove(request_id)
            .ok_or_else(|| JobError::RequestNotFound(request_id.to_string()))
    }

    /// Supprime les requêtes terminées depuis plus de `age`
    pub fn expire_older_than(&self, age: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - age;
        let mut inner = self.inner.write();
        let before = inner.requests.len();
        inner.requests.retain(|_, r| match r.completed_at {
            Some(done) if r.status.is_terminal() => done >= cutoff,
            _ => true,
        });
        before - inner.requests.len()
    }

    /// Nombre de requêtes non terminées
    pub fn active_count(&self) -> usize {
        self.inner.read().requests.values().filter(|r| !r.status.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cibles en cours de collecte et requête propriétaire
    pub fn in_flight_targets(&self) -> HashMap<String, String> {
        self.inner
            .read()
            .in_flight
            .iter()
            .map(|(target, f)| (target.clone(), f.request_id.clone()))
            .collect()
    }

    /// Requête qui collecte actuellement la cible, s'il y en a une
    pub fn collecting(&self, target: &str) -> Option<String> {
        self.inner.read().in_flight.get(target).map(|f| f.request_id.clone())
    }

    /// Analyse la plus récente d'une cible parmi les requêtes terminées
    pub fn latest_for_target(&self, target: &str) -> Option<ClientAnalysis> {
        self.last_analysis(target).map(|(_, analysis)| analysis)
    }

    /// Comme latest_for_target, avec l'instant de fin de la requête
    pub fn last_analysis(&self, target: &str) -> Option<(OffsetDateTime, ClientAnalysis)> {
        let inner = self.inner.read();
        inner
            .requests
            .values()
            .filter(|r| r.status == JobStatus::Completed)
            .filter_map(|r| {
                let done = r.completed_at?;
                let analysis = r.analyses.iter().find(|a| a.target == target)?;
                Some((done, analysis))
            })
            .max_by_key(|(done, _)| *done)
            .map(|(done, analysis)| (done, analysis.clone()))
    }

    /// Charge le snapshot JSON ; les requêtes non terminées y deviennent failed
    pub async fn load_snapshot(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.snapshot_file else { return Ok(0) };
        if !path.exists() {
            info!("[jobs] no existing snapshot at {}, starting fresh", path.display());
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let requests: Vec<AnalysisRequest> = serde_json::from_str(&content)?;
        let now = OffsetDateTime::now_utc();

        let mut inner = self.inner.write();
        let mut interrupted = 0;
        for mut request in requests {
            if !request.status.is_terminal() {
                request.status = JobStatus::Failed;
                request.completed_at = Some(now);
                request.overall_status = Some(OverallStatus::Error);
                request.error = Some("interrupted by restart".into());
                interrupted += 1;
            }
            inner.requests.insert(request.request_id.clone(), request);
        }
        info!(
            "[jobs] loaded {} requests from {} ({} interrupted)",
            inner.requests.len(),
            path.display(),
            interrupted
        );
        Ok(inner.requests.len())
    }

    pub async fn save_snapshot(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot_file else { return Ok(()) };
        let content = {
            let inner = self.inner.read();
            let mut requests: Vec<&AnalysisRequest> = inner.requests.values().collect();
            requests.sort_by_key(|r| r.created_at);
            serde_json::to_string_pretty(&requests)?
        };
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Balayage périodique des requêtes terminées au-delà de la rétention
pub fn spawn_retention_sweeper(store: Arc<JobStore>, retention: Duration, every: Duration) {
    info!("[jobs] starting retention sweeper (retention: {:?}, every {:?})", retention, every);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = store.expire_older_than(retention);
            if removed > 0 {
                info!("[jobs] expired {} finished requests", removed);
                if let Err(e) = store.save_snapshot().await {
                    warn!("[jobs] failed to save snapshot after sweep: {}", e);
                }
            }
        }
    });
}
