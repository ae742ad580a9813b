/**
 * LOGGATHER KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Charge la configuration, assemble les services (registry, transports,
 * cache, gateway, jobs, orchestrateur, santé), démarre les tâches de fond
 * puis sert l'API REST.
 *
 * UTILITÉ : Collecte et analyse de logs sur un parc de machines, pilotée par HTTP.
 */

use std::sync::Arc;

use anyhow::Context;
use loggather_kernel::config::load_config;
use loggather_kernel::http::{build_router, AppState};
use loggather_kernel::llm::HttpAnalysisBackend;
use loggather_kernel::transport::LocalBackend;
use loggather_kernel::Kernel;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    cfg.validate().context("invalid configuration")?;
    info!("[kernel] {} client(s) configured", cfg.clients.len());

    // Backends : local pour les transports, HTTP compatible OpenAI pour l'analyse
    let local = Arc::new(LocalBackend::from_config(&cfg.transport));
    let llm = Arc::new(HttpAnalysisBackend::new(&cfg.llm).context("cannot build analysis HTTP client")?);
    let kernel = Kernel::assemble(&cfg, local.clone(), local, llm);

    if let Err(e) = kernel.jobs.load_snapshot().await {
        warn!("[kernel] failed to load job snapshot: {}", e);
    }
    kernel.spawn_background(&cfg);

    let app = build_router(AppState::new(kernel, cfg.server.api_key.clone()));
    if cfg.server.api_key.is_none() {
        warn!("[kernel] no API key configured, HTTP API is open");
    }

    let listener = TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.server.bind))?;
    info!("[kernel] HTTP listening on http://{}", cfg.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
