/*!
Backend d'analyse scripté

Remplace le modèle distant : réponses JSON par défaut ou par marqueur de contenu,
file de réponses ponctuelles, mode hors-ligne et compteurs d'appels.
*/

use async_trait::async_trait;
use loggather_kernel::gateway::{AnalysisBackend, InferError};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Réponse JSON au format attendu par le gateway
pub fn analysis_json(severity: &str, issues: &[&str], recommendations: &[&str], confidence: f64) -> String {
    json!({
        "analysis": format!("{} finding(s) in excerpt", issues.len()),
        "issues_found": issues,
        "recommendations": recommendations,
        "severity": severity,
        "confidence": confidence,
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub struct InferCall {
    pub prompt: String,
    pub content: String,
}

impl InferCall {
    pub fn is_summary(&self) -> bool {
        self.prompt.contains("executive summary")
    }
}

#[derive(Clone)]
pub struct ScriptedAnalysis {
    default_reply: Arc<Mutex<String>>,
    markers: Arc<Mutex<Vec<(String, String)>>>,
    queue: Arc<Mutex<VecDeque<Result<String, String>>>>,
    summary_reply: Arc<Mutex<Option<String>>>,
    offline: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<InferCall>>>,
}

impl Default for ScriptedAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAnalysis {
    pub fn new() -> Self {
        Self {
            default_reply: Arc::new(Mutex::new(analysis_json("info", &[], &[], 0.9))),
            markers: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            summary_reply: Arc::new(Mutex::new(None)),
            offline: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_default(&self, reply: impl Into<String>) {
        *self.default_reply.lock().unwrap() = reply.into();
    }

    /// Réponse utilisée quand le contenu analysé contient `marker`
    pub fn when_content_contains(&self, marker: &str, reply: impl Into<String>) {
        self.markers.lock().unwrap().push((marker.to_string(), reply.into()));
    }

    /// Réponses consommées une par une avant les règles ci-dessus
    pub fn enqueue(&self, reply: Result<String, String>) {
        self.queue.lock().unwrap().push_back(reply);
    }

    pub fn set_summary(&self, text: impl Into<String>) {
        *self.summary_reply.lock().unwrap() = Some(text.into());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<InferCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn analysis_calls(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| !c.is_summary()).count()
    }

    pub fn summary_calls(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.is_summary()).count()
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedAnalysis {
    async fn infer(&self, prompt: &str, content: &str, _timeout: Duration) -> Result<String, InferError> {
        let call = InferCall { prompt: prompt.to_string(), content: content.to_string() };
        let summary = call.is_summary();
        self.calls.lock().unwrap().push(call);

        if self.offline.load(Ordering::SeqCst) {
            return Err(InferError("backend offline".into()));
        }
        if summary {
            let text = self.summary_reply.lock().unwrap().clone();
            return Ok(text.unwrap_or_else(|| "Fleet reviewed, see action items.".into()));
        }
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next.map_err(InferError);
        }
        let marked = self
            .markers
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| content.contains(marker.as_str()))
            .map(|(_, reply)| reply.clone());
        Ok(marked.unwrap_or_else(|| self.default_reply.lock().unwrap().clone()))
    }

    async fn probe(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
