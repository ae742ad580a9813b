/**
 * LOCAL BACKEND - Exécution de commandes et lecture de fichiers sur la machine locale
 *
 * RÔLE : Implémente CommandBackend et ShareBackend pour les cibles localhost,
 * ce qui rend le binaire utilisable de bout en bout sans protocole distant.
 *
 * FONCTIONNEMENT :
 * - Commandes : découpage shell-words (ou préfixe shell configuré), tokio::process
 *   avec timeout, kill_on_drop
 * - Partages : chemin admin "C$/..." converti en "C:/...", lecture tokio::fs + tail
 * - Toute cible non locale est refusée (Rejected)
 */

use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::share::tail_lines;
use super::{BackendError, CommandBackend, ShareBackend};
use crate::config::TransportConfig;
use crate::registry::ClientConfig;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    command_timeout: Duration,
    /// Préfixe optionnel, la commande lui est passée en dernier argument
    shell: Vec<String>,
}

impl LocalBackend {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout, shell: Vec::new() }
    }

    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self::new(Duration::from_secs(cfg.command_timeout_secs)).with_shell(cfg.local_shell.clone())
    }

    fn ensure_local(target: &ClientConfig) -> Result<(), BackendError> {
        if target.is_local() {
            Ok(())
        } else {
            Err(BackendError::rejected(format!(
                "no remote backend configured for host {}",
                target.hostname
            )))
        }
    }

    fn argv(&self, command: &str) -> Result<Vec<String>, BackendError> {
        if !self.shell.is_empty() {
            let mut argv = self.shell.clone();
            argv.push(command.to_string());
            return Ok(argv);
        }
        let argv = shell_words::split(command)
            .map_err(|e| BackendError::rejected(format!("invalid command line: {e}")))?;
        if argv.is_empty() {
            return Err(BackendError::rejected("empty command"));
        }
        Ok(argv)
    }
}

/// "C$/Windows/Logs/x.log" → "C:/Windows/Logs/x.log", autres chemins inchangés
pub fn share_to_local_path(path: &str) -> String {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some('$')) if drive.is_ascii_alphabetic() => {
            format!("{}:{}", drive, &path[2..])
        }
        _ => path.to_string(),
    }
}

fn io_error(context: &str, e: std::io::Error) -> BackendError {
    match e.kind() {
        ErrorKind::NotFound => BackendError::rejected(format!("{context}: not found")),
        ErrorKind::PermissionDenied => BackendError::auth(format!("{context}: permission denied")),
        ErrorKind::TimedOut => BackendError::timeout(format!("{context}: {e}")),
        _ => BackendError::unreachable(format!("{context}: {e}")),
    }
}

#[async_trait]
impl CommandBackend for LocalBackend {
    async fn fetch_command(&self, target: &ClientConfig, command: &str) -> Result<String, BackendError> {
        Self::ensure_local(target)?;
        let argv = self.argv(command)?;
        debug!("[local] running {:?}", argv);

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_error(&argv[0], e))?;

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::timeout(format!("command timed out after {:?}", self.command_timeout)))?
            .map_err(|e| io_error(&argv[0], e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::rejected(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ShareBackend for LocalBackend {
    async fn fetch_share_tail(
        &self,
        target: &ClientConfig,
        path: &str,
        max_lines: usize,
    ) -> Result<String, BackendError> {
        Self::ensure_local(target)?;
        let local_path = share_to_local_path(path);
        let bytes = tokio::time::timeout(self.command_timeout, tokio::fs::read(&local_path))
            .await
            .map_err(|_| BackendError::timeout(format!("{local_path}: read timed out after {:?}", self.command_timeout)))?
            .map_err(|e| io_error(&local_path, e))?;
        Ok(tail_lines(&String::from_utf8_lossy(&bytes), max_lines))
    }
}
