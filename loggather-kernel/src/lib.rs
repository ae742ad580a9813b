//! loggather-kernel : moteur d'orchestration de collecte et d'analyse de logs distants.
//!
//! Flux : `Orchestrator` → `ClientRegistry` → `Transports` → `ResultCache`
//! → `AnalysisGateway` → `JobStore`, lu par `HealthMonitor` et l'API HTTP.

pub mod cache;
pub mod config;
pub mod gateway;
pub mod health;
pub mod http;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod transport;

pub use orchestrator::{ClientOverview, CollectError, Orchestrator, SubmitError};
pub use state::Kernel;
