//! Transport par exécution de commande distante.

use async_trait::async_trait;
use std::sync::Arc;

use super::resilience::{CircuitState, GuardTable, ResiliencePolicy};
use super::{CommandBackend, CommandSelector, FetchError, TransportCapability, TransportKind, TransportStats};
use crate::registry::ClientConfig;

pub struct CommandTransport {
    backend: Arc<dyn CommandBackend>,
    guards: GuardTable,
}

impl CommandTransport {
    pub fn new(backend: Arc<dyn CommandBackend>, policy: ResiliencePolicy) -> Self {
        Self { backend, guards: GuardTable::new(TransportKind::Command, policy) }
    }

    pub fn circuit_state(&self, target: &str) -> CircuitState {
        self.guards.circuit_state(target)
    }

    pub fn retry_count(&self, target: &str) -> u64 {
        self.guards.retry_count(target)
    }
}

#[async_trait]
impl TransportCapability for CommandTransport {
    type Selector = CommandSelector;

    fn kind(&self) -> TransportKind {
        TransportKind::Command
    }

    async fn fetch(&self, target: &ClientConfig, selector: &CommandSelector) -> Result<String, FetchError> {
        self.guards
            .run(&target.name, |open_session| {
                let backend = Arc::clone(&self.backend);
                async move {
                    if open_session {
                        backend.open_session(target).await?;
                    }
                    backend.fetch_command(target, &selector.command).await
                }
            })
            .await
    }

    fn stats(&self) -> TransportStats {
        self.guards.stats()
    }
}
