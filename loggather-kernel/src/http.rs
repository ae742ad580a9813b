/**
 * API REST LOGGATHER - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose la soumission et le suivi des requêtes d'analyse, la liste des cibles
 * et l'état de santé. Couche mince au-dessus de l'orchestrateur.
 *
 * ROUTES :
 * - POST   /analyze                   soumission d'un lot (202 + request_id)
 * - GET    /analyze/{request_id}      suivi (404 + status "not_found" si inconnu),
 *                                     analyses partielles tant que la requête tourne
 * - DELETE /analyze/{request_id}      suppression d'une requête terminée
 * - GET    /clients                   cibles configurées + statut de la dernière analyse
 * - GET    /clients/{name}/analysis   dernière analyse d'une cible
 * - POST   /clients/{name}/analyze    analyse d'une seule cible (force_refresh, synthèse)
 * - POST   /collect/{name}            contenu brut des sources, sans analyse
 * - GET    /health                    santé agrégée
 *
 * SÉCURITÉ :
 * - Header x-api-key vérifié sur toutes les routes sauf /health quand une clé est configurée
 */

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::jobs::JobError;
use crate::models::{AnalysisRequest, ClientAnalysis, JobStatus, OverallStatus};
use crate::orchestrator::{CollectError, SubmitError};
use crate::state::Kernel;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Kernel,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(kernel: Kernel, api_key: Option<String>) -> Self {
        Self { kernel, api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from) }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default, alias = "client_names")]
    target_names: Vec<String>,
    #[serde(default)]
    force_refresh: bool,
    #[serde(default = "default_true")]
    include_summary: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct AnalysisView {
    targets: Vec<ClientAnalysis>,
}

#[derive(Serialize)]
struct PollView {
    request_id: String,
    status: JobStatus,
    targets: Vec<String>,
    targets_done: usize,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action_items: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overall_status: Option<OverallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn to_view(r: AnalysisRequest, analyses: Vec<ClientAnalysis>) -> PollView {
    let terminal = r.status.is_terminal();
    let targets_done = r.targets_done();
    PollView {
        request_id: r.request_id,
        status: r.status,
        targets: r.targets,
        targets_done,
        created_at: r.created_at.format(&Rfc3339).unwrap_or_default(),
        completed_at: r.completed_at.and_then(|t| t.format(&Rfc3339).ok()),
        summary: r.summary,
        action_items: terminal.then_some(r.action_items),
        overall_status: r.overall_status,
        analysis: Some(AnalysisView { targets: analyses }),
        error: r.error,
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected request on {} without a valid x-api-key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/clients", get(list_clients))
        .route("/clients/{name}/analysis", get(get_client_analysis))
        .route("/clients/{name}/analyze", post(analyze_client))
        .route("/collect/{name}", post(collect_client))
        .route("/analyze", post(submit_analysis))
        .route("/analyze/{request_id}", get(poll_analysis).delete(delete_analysis))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> impl IntoResponse {
    let k = &app.kernel;
    Json(k.health.snapshot(&k.jobs, &k.transports, &k.cache))
}

// GET /clients
async fn list_clients(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.kernel.orchestrator.client_overview())
}

// GET /clients/{name}/analysis
async fn get_client_analysis(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    let orchestrator = &app.kernel.orchestrator;
    if !orchestrator.has_target(&name) {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown client: {name}") }))).into_response();
    }
    match orchestrator.latest_for_target(&name) {
        Some(analysis) => Json(analysis).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "target": name, "status": "no_analysis" }))).into_response(),
    }
}

// POST /clients/{name}/analyze
async fn analyze_client(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.kernel.orchestrator.submit(std::slice::from_ref(&name), true, true) {
        Ok(request_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "request_id": request_id, "target": name, "status": "started" })),
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

// POST /collect/{name}
async fn collect_client(State(app): State<AppState>, Path(name): Path<String>) -> Response {
    match app.kernel.orchestrator.collect_raw(&name).await {
        Ok(raw) => Json(raw).into_response(),
        Err(e @ CollectError::TargetNotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(CollectError::TargetBusy { target, request_id }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "TargetBusy",
                "target": target,
                "request_id": request_id,
            })),
        )
            .into_response(),
    }
}

// POST /analyze
async fn submit_analysis(State(app): State<AppState>, Json(body): Json<SubmitBody>) -> Response {
    match app
        .kernel
        .orchestrator
        .submit(&body.target_names, body.force_refresh, body.include_summary)
    {
        Ok(request_id) => (StatusCode::ACCEPTED, Json(json!({ "request_id": request_id }))).into_response(),
        Err(SubmitError::TargetNotFound(unknown)) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "TargetNotFound",
                "detail": format!("unknown target(s): {}", unknown.join(", ")),
                "unknown_targets": unknown,
            })),
        )
            .into_response(),
        Err(e @ SubmitError::NoTargets) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// GET /analyze/{request_id}
async fn poll_analysis(State(app): State<AppState>, Path(request_id): Path<String>) -> Response {
    match app.kernel.orchestrator.get(&request_id) {
        Some(request) => {
            let analyses = app.kernel.orchestrator.analyses_so_far(&request);
            Json(to_view(request, analyses)).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "request_id": request_id, "status": "not_found" })),
        )
            .into_response(),
    }
}

// DELETE /analyze/{request_id}
async fn delete_analysis(State(app): State<AppState>, Path(request_id): Path<String>) -> Response {
    match app.kernel.jobs.delete(&request_id) {
        Ok(_) => Json(json!({ "request_id": request_id, "deleted": true })).into_response(),
        Err(JobError::StillRunning(_)) => (
            StatusCode::CONFLICT,
            Json(json!({ "request_id": request_id, "error": "request is still running" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "request_id": request_id, "status": "not_found", "error": e.to_string() })),
        )
            .into_response(),
    }
}
