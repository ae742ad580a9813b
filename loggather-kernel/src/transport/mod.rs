/**
 * TRANSPORTS - Récupération du contenu brut des logs sur les cibles
 *
 * RÔLE :
 * Un contrat unique (TransportCapability) et deux variantes : exécution de commande
 * distante (CommandTransport) et lecture de fin de fichier sur partage (ShareTransport).
 *
 * FONCTIONNEMENT :
 * - Le protocole réseau est délégué à un backend (CommandBackend / ShareBackend)
 * - Chaque variante garde par cible : session, compteur de retry, circuit breaker
 * - Les erreurs backend sont classées (timeout, injoignable, auth, refus) puis
 *   converties en FetchError après la politique de résilience
 *
 * Le dispatch se fait sur LogSource, choisi une fois au chargement de la configuration.
 */

pub mod command;
pub mod local;
pub mod resilience;
pub mod share;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::registry::ClientConfig;

pub use command::CommandTransport;
pub use local::LocalBackend;
pub use resilience::{BreakerConfig, CircuitState, ResiliencePolicy, RetryPolicy};
pub use share::ShareTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Command,
    Share,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Command => write!(f, "command"),
            TransportKind::Share => write!(f, "share"),
        }
    }
}

/// Classe d'échec remontée par un backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    Unreachable,
    Auth,
    /// Hôte joint mais commande ou fichier refusé
    Rejected,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub class: FailureClass,
    pub message: String,
}

impl BackendError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Unreachable, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Auth, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Rejected, message)
    }
}

/// Erreurs de récupération, absorbées par l'orchestrateur en résultats dégradés
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("transport timeout on {target} after {attempts} attempt(s): {reason}")]
    TransportTimeout { target: String, attempts: u32, reason: String },
    #[error("authentication failed on {target}: {reason}")]
    TransportAuthFailure { target: String, reason: String },
    #[error("circuit open for {target} ({kind} transport), retry in {retry_in_secs}s")]
    CircuitOpen { target: String, kind: TransportKind, retry_in_secs: u64 },
    #[error("{target} rejected the request: {reason}")]
    Rejected { target: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSelector {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSelector {
    pub category: String,
    pub path: String,
    pub max_lines: usize,
}

/// Source de logs d'une cible, variante choisie au chargement de la configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    Command(CommandSelector),
    Share(ShareSelector),
}

impl LogSource {
    pub fn kind(&self) -> TransportKind {
        match self {
            LogSource::Command(_) => TransportKind::Command,
            LogSource::Share(_) => TransportKind::Share,
        }
    }

    /// Identifiant stable : "command:{command}" ou "share:{path}"
    pub fn id(&self) -> String {
        match self {
            LogSource::Command(sel) => format!("command:{}", sel.command),
            LogSource::Share(sel) => format!("share:{}", sel.path),
        }
    }
}

/// Backend d'exécution de commandes distantes
#[async_trait]
pub trait CommandBackend: Send + Sync {
    async fn open_session(&self, _target: &ClientConfig) -> Result<(), BackendError> {
        Ok(())
    }

    async fn fetch_command(&self, target: &ClientConfig, command: &str) -> Result<String, BackendError>;
}

/// Backend de lecture de fichiers sur partage distant
#[async_trait]
pub trait ShareBackend: Send + Sync {
    async fn open_session(&self, _target: &ClientConfig) -> Result<(), BackendError> {
        Ok(())
    }

    async fn fetch_share_tail(
        &self,
        target: &ClientConfig,
        path: &str,
        max_lines: usize,
    ) -> Result<String, BackendError>;
}

/// Contrat commun aux deux variantes de transport
#[async_trait]
pub trait TransportCapability: Send + Sync {
    type Selector: Send + Sync;

    fn kind(&self) -> TransportKind;

    async fn fetch(&self, target: &ClientConfig, selector: &Self::Selector) -> Result<String, FetchError>;

    fn stats(&self) -> TransportStats;
}

/// Vue santé d'un transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    /// Cibles ayant réussi au moins une récupération
    pub connected: BTreeSet<String>,
    /// Cibles dont le circuit n'est pas fermé
    pub open: BTreeSet<String>,
}

impl TransportStats {
    pub fn merge(mut self, other: TransportStats) -> Self {
        self.connected.extend(other.connected);
        self.open.extend(other.open);
        self
    }

    pub fn active(&self) -> usize {
        self.connected.difference(&self.open).count()
    }
}

/// Dispatch des sources vers les deux transports
#[derive(Clone)]
pub struct Transports {
    pub command: Arc<CommandTransport>,
    pub share: Arc<ShareTransport>,
}

impl Transports {
    pub fn new(command: Arc<CommandTransport>, share: Arc<ShareTransport>) -> Self {
        Self { command, share }
    }

    pub fn build(
        command_backend: Arc<dyn CommandBackend>,
        share_backend: Arc<dyn ShareBackend>,
        policy: ResiliencePolicy,
    ) -> Self {
        Self::new(
            Arc::new(CommandTransport::new(command_backend, policy.clone())),
            Arc::new(ShareTransport::new(share_backend, policy)),
        )
    }

    pub async fn fetch(&self, target: &ClientConfig, source: &LogSource) -> Result<String, FetchError> {
        match source {
            LogSource::Command(sel) => self.command.fetch(target, sel).await,
            LogSource::Share(sel) => self.share.fetch(target, sel).await,
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.command.stats().merge(self.share.stats())
    }
}
