/*!
Backends de transport scriptés pour tests sans machine distante

Implémente CommandBackend et ShareBackend : chaque appel est enregistré, la réponse
vient d'un script par (cible, sélecteur) ou d'une réponse par défaut par cible.
Une cible peut être bloquée (hold) jusqu'à release pour simuler une collecte longue.
*/

use async_trait::async_trait;
use loggather_kernel::registry::ClientConfig;
use loggather_kernel::transport::{BackendError, CommandBackend, FailureClass, ShareBackend, TransportKind};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(FailureClass, String),
    /// Fait paniquer la tâche de collecte
    Panic,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    pub fn timeout() -> Self {
        Reply::Fail(FailureClass::Timeout, "scripted timeout".into())
    }

    pub fn unreachable() -> Self {
        Reply::Fail(FailureClass::Unreachable, "scripted host unreachable".into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFetch {
    pub target: String,
    pub kind: TransportKind,
    /// Commande ou chemin demandé
    pub selector: String,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<HashMap<(String, String), VecDeque<Reply>>>>,
    defaults: Arc<Mutex<HashMap<String, Reply>>>,
    calls: Arc<Mutex<Vec<RecordedFetch>>>,
    sessions: Arc<Mutex<Vec<String>>>,
    gates: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Réponse par défaut pour toutes les sources d'une cible
    pub fn respond_all(&self, target: &str, reply: Reply) -> &Self {
        self.defaults.lock().unwrap().insert(target.to_string(), reply);
        self
    }

    /// Séquence de réponses pour une source ; la dernière est répétée
    pub fn script(&self, target: &str, selector: &str, replies: Vec<Reply>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .insert((target.to_string(), selector.to_string()), replies.into());
        self
    }

    /// Bloque les récupérations de la cible jusqu'à `release`
    pub fn hold(&self, target: &str) {
        let (tx, _rx) = watch::channel(false);
        self.gates.lock().unwrap().insert(target.to_string(), tx);
    }

    pub fn release(&self, target: &str) {
        if let Some(tx) = self.gates.lock().unwrap().get(target) {
            tx.send_replace(true);
        }
    }

    pub fn calls(&self) -> Vec<RecordedFetch> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, target: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.target == target).count()
    }

    pub fn session_opens(&self, target: &str) -> usize {
        self.sessions.lock().unwrap().iter().filter(|t| *t == target).count()
    }

    fn next_reply(&self, target: &str, selector: &str) -> Reply {
        let key = (target.to_string(), selector.to_string());
        if let Some(queue) = self.scripts.lock().unwrap().get_mut(&key) {
            let reply = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            if let Some(reply) = reply {
                return reply;
            }
        }
        self.defaults
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_else(|| Reply::Fail(FailureClass::Rejected, format!("no scripted reply for {selector}")))
    }

    async fn reply(&self, target: &str, kind: TransportKind, selector: &str) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(RecordedFetch {
            target: target.to_string(),
            kind,
            selector: selector.to_string(),
        });

        let gate = self.gates.lock().unwrap().get(target).map(|tx| tx.subscribe());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }

        match self.next_reply(target, selector) {
            Reply::Text(text) => Ok(text),
            Reply::Fail(class, message) => Err(BackendError::new(class, message)),
            Reply::Panic => panic!("scripted panic while fetching {selector} on {target}"),
        }
    }
}

#[async_trait]
impl CommandBackend for ScriptedTransport {
    async fn open_session(&self, target: &ClientConfig) -> Result<(), BackendError> {
        self.sessions.lock().unwrap().push(target.name.clone());
        Ok(())
    }

    async fn fetch_command(&self, target: &ClientConfig, command: &str) -> Result<String, BackendError> {
        self.reply(&target.name, TransportKind::Command, command).await
    }
}

#[async_trait]
impl ShareBackend for ScriptedTransport {
    async fn open_session(&self, target: &ClientConfig) -> Result<(), BackendError> {
        self.sessions.lock().unwrap().push(target.name.clone());
        Ok(())
    }

    async fn fetch_share_tail(
        &self,
        target: &ClientConfig,
        path: &str,
        _max_lines: usize,
    ) -> Result<String, BackendError> {
        self.reply(&target.name, TransportKind::Share, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ClientBuilder;

    #[tokio::test]
    async fn test_script_then_sticky_last_reply() {
        let stub = ScriptedTransport::new();
        stub.script("M1", "Get-HotFix", vec![Reply::timeout(), Reply::text("KB1")]);
        let client = ClientBuilder::new("M1").build();

        assert!(stub.fetch_command(&client, "Get-HotFix").await.is_err());
        assert_eq!(stub.fetch_command(&client, "Get-HotFix").await.unwrap(), "KB1");
        assert_eq!(stub.fetch_command(&client, "Get-HotFix").await.unwrap(), "KB1");
        assert_eq!(stub.fetch_count("M1"), 3);
    }

    #[tokio::test]
    async fn test_default_and_missing_replies() {
        let stub = ScriptedTransport::new();
        stub.respond_all("M1", Reply::text("log"));
        let m1 = ClientBuilder::new("M1").build();
        let m2 = ClientBuilder::new("M2").build();
        assert_eq!(stub.fetch_share_tail(&m1, "C$/a.log", 10).await.unwrap(), "log");
        let err = stub.fetch_share_tail(&m2, "C$/a.log", 10).await.unwrap_err();
        assert_eq!(err.class, FailureClass::Rejected);
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let stub = ScriptedTransport::new();
        stub.respond_all("M1", Reply::text("late"));
        stub.hold("M1");
        let s = stub.clone();
        let task = tokio::spawn(async move {
            let client = ClientBuilder::new("M1").build();
            s.fetch_command(&client, "x").await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        stub.release("M1");
        assert_eq!(task.await.unwrap().unwrap(), "late");
    }
}
