/*!
Builders de configuration pour les tests
*/

use loggather_kernel::config::KernelConfig;
use loggather_kernel::registry::ClientConfig;

pub const CBS_LOG: &str = "C$/Windows/Logs/CBS/CBS.log";
pub const HOTFIX_COMMAND: &str = "Get-HotFix | Sort-Object InstalledOn -Descending";

pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: ClientConfig {
                name: name.to_string(),
                hostname: format!("{}.test.local", name.to_ascii_lowercase()),
                ip: "10.0.0.10".into(),
                credentials: String::new(),
                log_paths: Default::default(),
                commands: Vec::new(),
            },
        }
    }

    /// Client avec un log CBS et une commande hotfix
    pub fn standard(name: &str) -> Self {
        Self::new(name).share("cbs", CBS_LOG).command(HOTFIX_COMMAND)
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.config.hostname = hostname.to_string();
        self
    }

    pub fn share(mut self, category: &str, path: &str) -> Self {
        self.config.log_paths.entry(category.to_string()).or_default().push(path.to_string());
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.config.commands.push(command.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Configuration kernel avec retries rapides et sans jitter
pub fn test_config(clients: Vec<ClientConfig>) -> KernelConfig {
    let mut cfg = KernelConfig { clients, ..Default::default() };
    cfg.transport.max_attempts = 2;
    cfg.transport.base_delay_ms = 1;
    cfg.transport.max_delay_ms = 5;
    cfg.transport.jitter = 0.0;
    cfg.transport.attempt_timeout_ms = 2_000;
    cfg.orchestrator.max_concurrency = 4;
    cfg
}
