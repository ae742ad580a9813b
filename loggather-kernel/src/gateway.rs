/**
 * ANALYSIS GATEWAY - Interface entre l'orchestrateur et le backend d'analyse
 *
 * RÔLE :
 * Construit un prompt spécialisé par type de log autour d'un extrait borné,
 * appelle le backend (AnalysisBackend) et valide la réponse structurée.
 *
 * FONCTIONNEMENT :
 * - Extrait : fin du contenu, bornée en lignes puis en caractères
 * - Réponse : objet JSON (nu ou dans un bloc ```), schéma vérifié strictement
 * - Erreur réseau/timeout : un seul nouvel essai avec un timeout réduit
 *
 * ERREURS :
 * - MalformedResponse : réponse inexploitable (l'appelant se replie sur un résultat minimal)
 * - BackendUnavailable : backend injoignable après le nouvel essai
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::models::{ClientAnalysis, LogAnalysisResult, Severity};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("malformed analysis response: {0}")]
    MalformedResponse(String),
    #[error("analysis backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Échec d'appel au backend (réseau, timeout, statut HTTP)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct InferError(pub String);

/// Backend d'analyse de texte (modèle distant ou stub de test)
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn infer(&self, prompt: &str, content: &str, timeout: Duration) -> Result<String, InferError>;

    /// Joignabilité du backend, utilisée par le monitoring santé
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    ComponentServicing,
    UpdateAgent,
    ContentAccess,
    EventLog,
    Unstructured,
}

impl LogType {
    pub fn classify(source: &str) -> Self {
        let s = source.to_ascii_lowercase();
        if s.contains("cbs.log") {
            LogType::ComponentServicing
        } else if s.contains("wuahandler") || s.contains("windowsupdate") || s.contains("get-windowsupdatelog") {
            LogType::UpdateAgent
        } else if s.contains("cas.log") {
            LogType::ContentAccess
        } else if s.contains("get-winevent") || s.contains("get-eventlog") {
            LogType::EventLog
        } else {
            LogType::Unstructured
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LogType::ComponentServicing => "a Windows component-based servicing (CBS) log",
            LogType::UpdateAgent => "a Windows Update agent log",
            LogType::ContentAccess => "a content access (CAS) log",
            LogType::EventLog => "Windows event log entries",
            LogType::Unstructured => "a diagnostic log",
        }
    }

    fn focus(&self) -> &'static [&'static str] {
        match self {
            LogType::ComponentServicing => &[
                "package installation failures with package names, versions and error codes",
                "TrustedInstaller and servicing stack errors",
                "component store corruption and WinSxS problems, with file paths",
                "DISM failures and dependency resolution issues",
                "access denied errors on files or registry keys",
            ],
            LogType::UpdateAgent => &[
                "update download and installation errors",
                "agent communication problems with the update service",
                "pending or failed reboots",
                "update rollbacks",
            ],
            LogType::ContentAccess => &[
                "content download failures",
                "distribution point connectivity",
                "content hash or validation errors",
                "cache management problems",
            ],
            LogType::EventLog => &[
                "critical system events",
                "application and service crashes",
                "security-relevant events",
                "hardware and driver faults",
            ],
            LogType::Unstructured => &[
                "error and warning messages",
                "failing system components",
                "configuration problems",
                "performance degradation",
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub system_prompt: String,
    pub max_content_chars: usize,
    pub max_content_lines: usize,
    pub request_timeout: Duration,
    pub retry_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_llm(cfg: &LlmConfig) -> Self {
        Self {
            system_prompt: cfg.system_prompt.clone(),
            max_content_chars: cfg.max_content_chars,
            max_content_lines: cfg.max_content_lines,
            request_timeout: cfg.request_timeout(),
            retry_timeout: cfg.retry_timeout(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_llm(&LlmConfig::default())
    }
}

pub struct AnalysisGateway {
    backend: Arc<dyn AnalysisBackend>,
    config: GatewayConfig,
}

impl AnalysisGateway {
    pub fn new(backend: Arc<dyn AnalysisBackend>, config: GatewayConfig) -> Self {
        Self { backend, config }
    }

    pub async fn analyze(
        &self,
        source: &str,
        content: &str,
        hint: LogType,
    ) -> Result<LogAnalysisResult, AnalysisError> {
        let excerpt = excerpt(content, self.config.max_content_chars, self.config.max_content_lines);
        let prompt = self.analysis_prompt(source, hint);
        debug!(
            "[gateway] analysing {} as {:?} ({} of {} chars)",
            source,
            hint,
            excerpt.len(),
            content.len()
        );
        let raw = self.infer_with_retry(&prompt, &excerpt).await?;
        parse_analysis(source, &raw)
    }

    /// Synthèse multi-cibles en texte libre
    pub async fn summarize(&self, analyses: &[ClientAnalysis]) -> Result<String, AnalysisError> {
        let mut digest = String::new();
        for analysis in analyses {
            digest.push_str(&format!(
                "{} ({}): status {:?}; {}\n",
                analysis.target, analysis.hostname, analysis.overall_status, analysis.summary
            ));
            for item in analysis.action_items.iter().take(3) {
                digest.push_str(&format!("  - {item}\n"));
            }
        }
        let prompt = format!(
            "{}\n\nWrite a short executive summary (3 to 5 sentences) of the health of the machines \
             below. Mention the most critical problems first and how many machines are affected. \
             Answer with plain text only.",
            self.config.system_prompt
        );
        let digest = excerpt(&digest, self.config.max_content_chars, self.config.max_content_lines);
        let text = self.infer_with_retry(&prompt, &digest).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AnalysisError::MalformedResponse("empty summary".into()));
        }
        Ok(text.to_string())
    }

    pub async fn probe(&self) -> bool {
        self.backend.probe().await
    }

    async fn infer_with_retry(&self, prompt: &str, content: &str) -> Result<String, AnalysisError> {
        match self.backend.infer(prompt, content, self.config.request_timeout).await {
            Ok(text) => Ok(text),
            Err(first) => {
                warn!("[gateway] backend call failed ({}), retrying once", first);
                self.backend
                    .infer(prompt, content, self.config.retry_timeout)
                    .await
                    .map_err(|e| AnalysisError::BackendUnavailable(e.0))
            }
        }
    }

    fn analysis_prompt(&self, source: &str, hint: LogType) -> String {
        let focus: String = hint.focus().iter().map(|f| format!("- {f}\n")).collect();
        format!(
            "{system}\n\nAnalyse the following excerpt of {label} (source: {source}).\n\
             Focus on:\n{focus}\n\
             Respond with ONLY a JSON object of this shape:\n\
             {{\"analysis\": \"technical narrative\", \"issues_found\": [\"...\"], \
             \"recommendations\": [\"...\"], \"severity\": \"info|warning|error|critical\", \
             \"confidence\": 0.0}}\n\
             confidence is a number between 0 and 1.",
            system = self.config.system_prompt,
            label = hint.label(),
        )
    }
}

/// Fin du contenu bornée en lignes puis en caractères (frontière UTF-8 respectée)
pub fn excerpt(content: &str, max_chars: usize, max_lines: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let tail = lines[start..].join("\n");
    let total = tail.chars().count();
    if total <= max_chars {
        return tail;
    }
    tail.chars().skip(total - max_chars).collect()
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    analysis: String,
    #[serde(alias = "issues")]
    issues_found: Vec<String>,
    recommendations: Vec<String>,
    severity: String,
    confidence: f64,
}

/// Valide la réponse du backend contre la forme LogAnalysisResult
pub fn parse_analysis(source: &str, raw: &str) -> Result<LogAnalysisResult, AnalysisError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| AnalysisError::MalformedResponse("no JSON object in response".into()))?;
    let parsed: RawAnalysis =
        serde_json::from_str(json).map_err(|e| AnalysisError::MalformedResponse(e.to_string()))?;
    let severity = Severity::parse(&parsed.severity)
        .ok_or_else(|| AnalysisError::MalformedResponse(format!("unknown severity '{}'", parsed.severity)))?;
    if !parsed.confidence.is_finite() || !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(AnalysisError::MalformedResponse(format!(
            "confidence {} outside [0, 1]",
            parsed.confidence
        )));
    }
    Ok(LogAnalysisResult {
        source: source.to_string(),
        severity,
        analysis: parsed.analysis,
        issues: parsed.issues_found,
        recommendations: parsed.recommendations,
        confidence: parsed.confidence as f32,
        analyzed_at: OffsetDateTime::now_utc(),
    })
}

/// Premier objet JSON équilibré, en priorité dans un bloc de code
fn extract_json_object(raw: &str) -> Option<&str> {
    let body = fenced_block(raw).unwrap_or(raw);
    let start = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&body[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    // saute l'étiquette de langage éventuelle ("json")
    let body_start = after.find('\n').map(|n| n + 1).unwrap_or(0);
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
