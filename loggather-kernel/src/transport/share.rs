//! Transport par lecture de fichier sur partage distant (fin de fichier uniquement).

use async_trait::async_trait;
use std::sync::Arc;

use super::resilience::{CircuitState, GuardTable, ResiliencePolicy};
use super::{FetchError, ShareBackend, ShareSelector, TransportCapability, TransportKind, TransportStats};
use crate::registry::ClientConfig;

pub struct ShareTransport {
    backend: Arc<dyn ShareBackend>,
    guards: GuardTable,
}

impl ShareTransport {
    pub fn new(backend: Arc<dyn ShareBackend>, policy: ResiliencePolicy) -> Self {
        Self { backend, guards: GuardTable::new(TransportKind::Share, policy) }
    }

    pub fn circuit_state(&self, target: &str) -> CircuitState {
        self.guards.circuit_state(target)
    }
}

#[async_trait]
impl TransportCapability for ShareTransport {
    type Selector = ShareSelector;

    fn kind(&self) -> TransportKind {
        TransportKind::Share
    }

    async fn fetch(&self, target: &ClientConfig, selector: &ShareSelector) -> Result<String, FetchError> {
        let text = self
            .guards
            .run(&target.name, |open_session| {
                let backend = Arc::clone(&self.backend);
                async move {
                    if open_session {
                        backend.open_session(target).await?;
                    }
                    backend.fetch_share_tail(target, &selector.path, selector.max_lines).await
                }
            })
            .await?;
        // le backend n'est pas tenu de respecter la borne
        Ok(tail_lines(&text, selector.max_lines))
    }

    fn stats(&self) -> TransportStats {
        self.guards.stats()
    }
}

/// Conserve les `max_lines` dernières lignes
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    lines[lines.len() - max_lines..].join("\n")
}
