/**
 * CLIENT REGISTRY - Configuration des machines cibles
 *
 * RÔLE : Identité, adresse, référence d'identifiants et sources de logs de chaque cible.
 * Chargé une fois depuis la configuration, en lecture seule ensuite.
 *
 * Les sources (partages puis commandes) sont calculées au chargement et partagées
 * via Arc avec les transports et l'orchestrateur.
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::transport::{CommandSelector, LogSource, ShareSelector};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    /// Référence opaque vers la section credentials
    #[serde(default)]
    pub credentials: String,
    /// Chemins de partage groupés par catégorie (cbs, windows_update, ...)
    #[serde(default)]
    pub log_paths: BTreeMap<String, Vec<String>>,
    #[serde(default, alias = "powershell_commands")]
    pub commands: Vec<String>,
}

impl ClientConfig {
    pub fn is_local(&self) -> bool {
        matches!(self.hostname.as_str(), "localhost" | "127.0.0.1" | "::1")
            || matches!(self.ip.as_str(), "127.0.0.1" | "::1")
    }

    pub fn log_sources(&self, tail_lines: usize) -> Vec<LogSource> {
        let shares = self.log_paths.iter().flat_map(|(category, paths)| {
            paths.iter().map(move |path| {
                LogSource::Share(ShareSelector {
                    category: category.clone(),
                    path: path.clone(),
                    max_lines: tail_lines,
                })
            })
        });
        let commands = self
            .commands
            .iter()
            .map(|command| LogSource::Command(CommandSelector { command: command.clone() }));
        shares.chain(commands).collect()
    }
}

/// Cible enregistrée : configuration + sources de logs résolues
#[derive(Debug)]
pub struct Target {
    pub config: ClientConfig,
    pub sources: Vec<LogSource>,
}

impl Target {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Debug, Serialize)]
pub struct TargetInfo {
    pub name: String,
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    targets: Vec<Arc<Target>>,
    index: HashMap<String, usize>,
}

impl ClientRegistry {
    /// Les doublons de nom sont refusés en amont par KernelConfig::validate ; ici le premier gagne.
    pub fn new(clients: Vec<ClientConfig>, tail_lines: usize) -> Self {
        let mut registry = Self::default();
        for config in clients {
            if registry.index.contains_key(&config.name) {
                continue;
            }
            let sources = config.log_sources(tail_lines);
            registry.index.insert(config.name.clone(), registry.targets.len());
            registry.targets.push(Arc::new(Target { config, sources }));
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<Arc<Target>> {
        self.index.get(name).map(|&i| Arc::clone(&self.targets[i]))
    }

    /// Résout tous les noms ou renvoie la liste des noms inconnus
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<Target>>, Vec<String>> {
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| !self.index.contains_key(n.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(unknown);
        }
        Ok(names.iter().filter_map(|n| self.get(n)).collect())
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.config.name.clone()).collect()
    }

    pub fn list(&self) -> Vec<TargetInfo> {
        self.targets
            .iter()
            .map(|t| TargetInfo {
                name: t.config.name.clone(),
                hostname: t.config.hostname.clone(),
                ip: t.config.ip.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientConfig {
        let mut log_paths = BTreeMap::new();
        log_paths.insert("cbs".to_string(), vec!["C$/Windows/Logs/CBS/CBS.log".to_string()]);
        ClientConfig {
            name: name.into(),
            hostname: format!("{}.corp.local", name.to_lowercase()),
            ip: "10.0.0.5".into(),
            credentials: String::new(),
            log_paths,
            commands: vec!["Get-HotFix".into()],
        }
    }

    #[test]
    fn test_sources_shares_then_commands() {
        let sources = client("WS-01").log_sources(500);
        assert_eq!(sources.len(), 2);
        match &sources[0] {
            LogSource::Share(sel) => {
                assert_eq!(sel.category, "cbs");
                assert_eq!(sel.max_lines, 500);
            }
            other => panic!("expected share source, got {other:?}"),
        }
        assert!(matches!(&sources[1], LogSource::Command(c) if c.command == "Get-HotFix"));
    }

    #[test]
    fn test_resolve_reports_unknown_names() {
        let registry = ClientRegistry::new(vec![client("A"), client("B")], 100);
        let found = registry.resolve(&["B".into(), "A".into()]).unwrap();
        assert_eq!(found[0].name(), "B");
        let err = registry.resolve(&["A".into(), "X".into(), "Y".into()]).unwrap_err();
        assert_eq!(err, vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn test_registry_order_and_duplicates() {
        let registry = ClientRegistry::new(vec![client("B"), client("A"), client("B")], 100);
        assert_eq!(registry.names(), vec!["B".to_string(), "A".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_is_local() {
        let mut c = client("L");
        assert!(!c.is_local());
        c.hostname = "localhost".into();
        assert!(c.is_local());
    }
}
