use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

use crate::registry::ClientConfig;

/// Erreurs de chargement/validation de la configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConfig,
    /// Références d'identifiants, transmises telles quelles aux transports
    pub credentials: BTreeMap<String, serde_yaml::Value>,
    pub clients: Vec<ClientConfig>,
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub transport: TransportConfig,
    pub health: HealthConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Clé attendue dans le header x-api-key (désactivé si absent)
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8000".into(), api_key: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
    /// Timeout réduit pour l'unique nouvel essai
    pub retry_timeout_secs: u64,
    pub max_content_chars: usize,
    pub max_content_lines: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1234".into(),
            model: "local-model".into(),
            api_key: None,
            max_tokens: 4000,
            temperature: 0.1,
            system_prompt: "You are an expert Windows systems administrator analysing diagnostic logs. \
                            Answer with a single JSON object and nothing else."
                .into(),
            request_timeout_secs: 120,
            retry_timeout_secs: 30,
            max_content_chars: 8000,
            max_content_lines: 2000,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    /// Lignes conservées en fin de fichier pour les sources de type partage
    pub tail_lines: usize,
    /// Rétention des requêtes terminées (pas de balayage si absent)
    pub retention_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_concurrency: 10, tail_lines: 2000, retention_secs: None, sweep_interval_secs: 300 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 600, capacity: 1024 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction aléatoire ajoutée/retirée au délai (0.0 = aucune)
    pub jitter: f64,
    pub failure_threshold: u32,
    pub cool_down_secs: u64,
    pub session_ttl_secs: u64,
    /// Borne de chaque tentative backend, toutes variantes confondues
    pub attempt_timeout_ms: u64,
    pub command_timeout_secs: u64,
    /// Préfixe d'exécution locale, ex: ["powershell", "-Command"]
    pub local_shell: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: 0.2,
            failure_threshold: 3,
            cool_down_secs: 60,
            session_ttl_secs: 300,
            attempt_timeout_ms: 90_000,
            command_timeout_secs: 60,
            local_shell: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { probe_interval_secs: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct JobsConfig {
    /// Fichier JSON de snapshot des requêtes terminées
    pub snapshot_file: Option<String>,
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        Self::from_yaml_str(&txt)
    }

    /// Surcharges par variables d'environnement (LOGGATHER_*)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("LOGGATHER_BIND") {
            self.server.bind = bind;
        }
        if let Ok(key) = std::env::var("LOGGATHER_API_KEY") {
            self.server.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(endpoint) = std::env::var("LOGGATHER_LLM_ENDPOINT") {
            self.llm.endpoint = endpoint;
        }
        if let Ok(raw) = std::env::var("LOGGATHER_MAX_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(n) => self.orchestrator.max_concurrency = n,
                Err(e) => warn!("[config] ignoring LOGGATHER_MAX_CONCURRENCY={raw}: {e}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if client.name.trim().is_empty() {
                return Err(ConfigError::Invalid("client with empty name".into()));
            }
            if !seen.insert(client.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate client name: {}", client.name)));
            }
            if !client.credentials.is_empty() && !self.credentials.contains_key(&client.credentials) {
                return Err(ConfigError::Invalid(format!(
                    "client {} references unknown credentials '{}'",
                    client.name, client.credentials
                )));
            }
        }
        if self.orchestrator.max_concurrency == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_concurrency must be > 0".into()));
        }
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Invalid("transport.max_attempts must be > 0".into()));
        }
        if self.transport.failure_threshold == 0 {
            return Err(ConfigError::Invalid("transport.failure_threshold must be > 0".into()));
        }
        if self.transport.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transport.attempt_timeout_ms must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.transport.jitter) {
            return Err(ConfigError::Invalid("transport.jitter must be within [0, 1]".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.llm.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.endpoint must not be empty".into()));
        }
        Ok(())
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("LOGGATHER_CONFIG").unwrap_or_else(|_| "loggather.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match KernelConfig::from_file(&path).await {
            Ok(cfg) => {
                info!("[config] loaded {} client(s) from {}", cfg.clients.len(), path);
                cfg
            }
            Err(e) => {
                warn!("[config] invalid config {}: {e}", path);
                KernelConfig::default()
            }
        }
    } else {
        warn!("[config] no {} found, using default config", path);
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
