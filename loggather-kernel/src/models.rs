/**
 * MODÈLES LOGGATHER - Types partagés entre orchestrateur, jobs, cache et API
 *
 * RÔLE :
 * Définit les résultats d'analyse (par source, par cible) et l'enregistrement
 * d'une requête d'analyse avec son cycle de vie.
 *
 * INVARIANTS :
 * - Statut de requête monotone : pending → running → completed | failed
 * - Statut d'une cible = plafond de sévérité de ses résultats (vide → ok)
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Nombre maximum d'actions retenues par cible
pub const MAX_ACTION_ITEMS: usize = 10;

/// Sévérité d'un résultat d'analyse, ordonnée du moins au plus grave
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Statut agrégé d'une cible
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Ok,
    Info,
    Warning,
    Error,
    Critical,
}

impl TargetStatus {
    /// Plafond de sévérité : critical > error > warning > info, vide → ok
    pub fn ceiling(results: &[LogAnalysisResult]) -> Self {
        results
            .iter()
            .map(|r| r.severity)
            .max()
            .map(TargetStatus::from)
            .unwrap_or(TargetStatus::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Ok => "ok",
            TargetStatus::Info => "info",
            TargetStatus::Warning => "warning",
            TargetStatus::Error => "error",
            TargetStatus::Critical => "critical",
        }
    }
}

impl From<Severity> for TargetStatus {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => TargetStatus::Info,
            Severity::Warning => TargetStatus::Warning,
            Severity::Error => TargetStatus::Error,
            Severity::Critical => TargetStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Seules les transitions vers l'avant sont autorisées
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// Statut global d'une requête terminée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Issues,
    Error,
}

impl OverallStatus {
    pub fn from_analyses(analyses: &[ClientAnalysis]) -> Self {
        if analyses.iter().any(|a| a.overall_status >= TargetStatus::Warning) {
            OverallStatus::Issues
        } else {
            OverallStatus::Ok
        }
    }
}

/// Résultat d'analyse d'une source de logs (un fichier ou une commande)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogAnalysisResult {
    /// Identifiant de source : "share:{path}" ou "command:{command}"
    pub source: String,
    pub severity: Severity,
    #[serde(default)]
    pub analysis: String,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub analyzed_at: OffsetDateTime,
}

impl LogAnalysisResult {
    /// Résultat dégradé : l'échec devient l'unique problème remonté
    pub fn failure(source: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            source: source.to_string(),
            severity: Severity::Error,
            analysis: format!("Collection or analysis failed: {reason}"),
            issues: vec![reason],
            recommendations: Vec::new(),
            confidence: 1.0,
            analyzed_at: OffsetDateTime::now_utc(),
        }
    }

    /// Résultat minimal quand le backend d'analyse n'a rien d'exploitable
    pub fn minimal(source: &str, note: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            severity: Severity::Info,
            analysis: note.into(),
            issues: Vec::new(),
            recommendations: Vec::new(),
            confidence: 0.0,
            analyzed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn empty_source(source: &str) -> Self {
        let mut result = Self::minimal(source, "Log source returned no content");
        result.confidence = 1.0;
        result
    }
}

/// Analyse agrégée d'une cible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAnalysis {
    pub target: String,
    pub hostname: String,
    pub overall_status: TargetStatus,
    pub summary: String,
    pub action_items: Vec<String>,
    pub results: Vec<LogAnalysisResult>,
}

impl ClientAnalysis {
    pub fn build(target: &str, hostname: &str, results: Vec<LogAnalysisResult>) -> Self {
        let overall_status = TargetStatus::ceiling(&results);
        let action_items = distinct_items(
            results.iter().flat_map(|r| r.recommendations.iter()),
            MAX_ACTION_ITEMS,
        );
        let summary = target_summary(&results);
        Self {
            target: target.to_string(),
            hostname: hostname.to_string(),
            overall_status,
            summary,
            action_items,
            results,
        }
    }
}

/// Déduplique en conservant l'ordre de première apparition
pub fn distinct_items<'a, I>(items: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if out.len() >= limit {
            break;
        }
        let trimmed = item.trim();
        if trimmed.is_empty() || out.iter().any(|seen| seen == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn target_summary(results: &[LogAnalysisResult]) -> String {
    if results.is_empty() {
        return "No log sources analysed.".to_string();
    }
    let count = |s: Severity| results.iter().filter(|r| r.severity == s).count();
    let issues: usize = results.iter().map(|r| r.issues.len()).sum();
    format!(
        "Analysed {} log source(s): {} critical, {} error, {} warning, {} info; {} issue(s) found.",
        results.len(),
        count(Severity::Critical),
        count(Severity::Error),
        count(Severity::Warning),
        count(Severity::Info),
        issues
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Pending,
    Running,
    Done,
}

/// Emplacement de résultats d'une cible dans une requête
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSlot {
    pub target: String,
    pub state: SlotState,
    pub results: Vec<LogAnalysisResult>,
    /// Renseigné quand toute la collecte de la cible a échoué
    pub failure: Option<String>,
    /// Requête propriétaire de la collecte quand ce slot y est rattaché
    pub shared_from: Option<String>,
}

impl TargetSlot {
    pub fn new(target: &str, shared_from: Option<String>) -> Self {
        Self {
            target: target.to_string(),
            state: SlotState::Pending,
            results: Vec::new(),
            failure: None,
            shared_from,
        }
    }
}

/// Requête d'analyse suivie par le JobStore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub request_id: String,
    pub targets: Vec<String>,
    pub status: JobStatus,
    pub force_refresh: bool,
    pub include_summary: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub slots: Vec<TargetSlot>,
    pub analyses: Vec<ClientAnalysis>,
    pub summary: Option<String>,
    pub action_items: Vec<String>,
    pub overall_status: Option<OverallStatus>,
    pub error: Option<String>,
}

impl AnalysisRequest {
    pub fn new(request_id: String, slots: Vec<TargetSlot>, force_refresh: bool, include_summary: bool) -> Self {
        Self {
            request_id,
            targets: slots.iter().map(|s| s.target.clone()).collect(),
            status: JobStatus::Pending,
            force_refresh,
            include_summary,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            slots,
            analyses: Vec::new(),
            summary: None,
            action_items: Vec::new(),
            overall_status: None,
            error: None,
        }
    }

    pub fn slot(&self, target: &str) -> Option<&TargetSlot> {
        self.slots.iter().find(|s| s.target == target)
    }

    pub fn targets_done(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::Done).count()
    }
}

/// Contenu brut d'une source, sans analyse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogResult {
    pub source: String,
    pub success: bool,
    /// Vide quand la récupération a échoué
    pub content: String,
    pub error: Option<String>,
    pub lines_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

impl RawLogResult {
    pub fn fetched(source: &str, content: String) -> Self {
        Self {
            source: source.to_string(),
            success: true,
            lines_count: content.lines().count(),
            content,
            error: None,
            collected_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn failed(source: &str, error: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            success: false,
            content: String::new(),
            error: Some(error.into()),
            lines_count: 0,
            collected_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Collecte brute d'une cible ; réussie si au moins une source a répondu
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCollection {
    pub target: String,
    pub hostname: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub log_results: Vec<RawLogResult>,
    pub errors: Vec<String>,
}

impl RawCollection {
    pub fn build(target: &str, hostname: &str, log_results: Vec<RawLogResult>) -> Self {
        let errors = log_results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.source, e)))
            .collect();
        Self {
            target: target.to_string(),
            hostname: hostname.to_string(),
            success: log_results.iter().any(|r| r.success),
            collected_at: OffsetDateTime::now_utc(),
            log_results,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(severity: Severity, recs: &[&str]) -> LogAnalysisResult {
        LogAnalysisResult {
            source: "share:C$/Windows/Logs/CBS/CBS.log".into(),
            severity,
            analysis: String::new(),
            issues: vec!["something".into()],
            recommendations: recs.iter().map(|s| s.to_string()).collect(),
            confidence: 0.8,
            analyzed_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_ceiling_picks_worst_severity() {
        let results = vec![
            result(Severity::Info, &[]),
            result(Severity::Critical, &[]),
            result(Severity::Warning, &[]),
        ];
        assert_eq!(TargetStatus::ceiling(&results), TargetStatus::Critical);
        assert_eq!(TargetStatus::ceiling(&[]), TargetStatus::Ok);
    }

    #[test]
    fn test_job_status_is_monotonic() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_action_items_deduplicated_and_capped() {
        let many: Vec<String> = (0..15).map(|i| format!("step {i}")).collect();
        let refs: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
        let results = vec![
            result(Severity::Warning, &["restart service", "restart service", " "]),
            result(Severity::Error, &refs),
        ];
        let analysis = ClientAnalysis::build("M1", "m1.lan", results);
        assert_eq!(analysis.action_items.len(), MAX_ACTION_ITEMS);
        assert_eq!(analysis.action_items[0], "restart service");
        assert_eq!(analysis.action_items[1], "step 0");
        assert_eq!(analysis.overall_status, TargetStatus::Error);
    }

    #[test]
    fn test_failure_result_carries_reason_as_sole_issue() {
        let r = LogAnalysisResult::failure("command:Get-Service", "circuit open");
        assert_eq!(r.severity, Severity::Error);
        assert_eq!(r.issues, vec!["circuit open".to_string()]);
    }

    #[test]
    fn test_request_roundtrips_through_json() {
        let slots = vec![TargetSlot::new("M1", None)];
        let req = AnalysisRequest::new("id-1".into(), slots, false, true);
        let json = serde_json::to_string(&req).unwrap();
        let back: AnalysisRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.targets, vec!["M1".to_string()]);
        assert_eq!(back.status, JobStatus::Pending);
        assert!(back.completed_at.is_none());
    }

    #[test]
    fn test_raw_collection_success_and_errors() {
        let ok = RawLogResult::fetched("command:hostname", "a\nb\nc\n".into());
        assert_eq!(ok.lines_count, 3);
        let ko = RawLogResult::failed("share:C$/x.log", "not found");
        assert!(ko.content.is_empty());

        let mixed = RawCollection::build("M1", "m1", vec![ok, ko.clone()]);
        assert!(mixed.success);
        assert_eq!(mixed.errors, vec!["share:C$/x.log: not found"]);

        let dead = RawCollection::build("M1", "m1", vec![ko]);
        assert!(!dead.success);
    }
}
