/*!
Test Harness pour le kernel LogGather

Assemble un kernel complet sur les stubs de transport et d'analyse :
- Soumission de lots comme le ferait l'API
- Attente de l'état terminal d'une requête avec timeout
- Accès direct aux stubs pour scripter réponses et pannes
*/

use anyhow::Result;
use loggather_kernel::config::KernelConfig;
use loggather_kernel::models::{AnalysisRequest, ClientAnalysis};
use loggather_kernel::registry::ClientConfig;
use loggather_kernel::{Kernel, SubmitError};
use std::sync::Arc;
use std::time::Duration;

use crate::analysis_stub::ScriptedAnalysis;
use crate::fixtures::test_config;
use crate::transport_stub::ScriptedTransport;

pub struct TestHarness {
    pub transport: ScriptedTransport,
    pub analysis: ScriptedAnalysis,
    pub config: KernelConfig,
    pub kernel: Kernel,
}

impl TestHarness {
    pub fn new(clients: Vec<ClientConfig>) -> Self {
        Self::with_config(test_config(clients))
    }

    pub fn with_config(config: KernelConfig) -> Self {
        env_logger::try_init().ok();

        let transport = ScriptedTransport::new();
        let analysis = ScriptedAnalysis::new();
        let kernel = Kernel::assemble(
            &config,
            Arc::new(transport.clone()),
            Arc::new(transport.clone()),
            Arc::new(analysis.clone()),
        );
        Self { transport, analysis, config, kernel }
    }

    /// Soumission directe à l'orchestrateur (doit tourner dans un runtime tokio)
    pub fn submit(&self, targets: &[&str], force_refresh: bool, include_summary: bool) -> Result<String, SubmitError> {
        let names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        self.kernel.orchestrator.submit(&names, force_refresh, include_summary)
    }

    /// Attend que la requête soit Completed ou Failed
    pub async fn wait_for_terminal(&self, request_id: &str, timeout_ms: u64) -> Result<AnalysisRequest> {
        let waiting = async {
            loop {
                match self.kernel.orchestrator.get(request_id) {
                    Some(request) if request.status.is_terminal() => return Ok(request),
                    Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    None => anyhow::bail!("request {} not found", request_id),
                }
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), waiting).await {
            Ok(result) => {
                if let Ok(request) = &result {
                    log::info!("✅ Request {} reached {:?}", request_id, request.status);
                }
                result
            }
            Err(_) => anyhow::bail!("request {} not terminal after {}ms", request_id, timeout_ms),
        }
    }

    /// Analyse d'une cible dans une requête terminée
    pub fn analysis_for<'a>(request: &'a AnalysisRequest, target: &str) -> Option<&'a ClientAnalysis> {
        request.analyses.iter().find(|a| a.target == target)
    }
}
