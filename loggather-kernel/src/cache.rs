/**
 * RESULT CACHE - Résultats d'analyse indexés par (cible, empreinte du contenu)
 *
 * FONCTIONNEMENT :
 * - Empreinte = SHA-256 hex du texte brut récupéré
 * - TTL : une entrée plus vieille que le TTL est absente (purge paresseuse à l'accès)
 * - Capacité bornée, éviction LRU
 * - Seules les analyses réussies sont insérées (choix de l'orchestrateur)
 */

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::models::LogAnalysisResult;

pub fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: LogAnalysisResult,
    inserted_at: Instant,
}

pub struct ResultCache {
    entries: Mutex<LruCache<(String, String), CacheEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, target: &str, fingerprint: &str) -> Option<LogAnalysisResult> {
        let key = (target.to_string(), fingerprint.to_string());
        let mut entries = self.entries.lock();
        let expired = match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => return Some(entry.result.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&key);
            debug!("[cache] expired entry for {} purged", target);
        }
        None
    }

    pub fn put(&self, target: &str, fingerprint: &str, result: LogAnalysisResult) {
        let entry = CacheEntry { result, inserted_at: Instant::now() };
        self.entries.lock().put((target.to_string(), fingerprint.to_string()), entry);
    }

    /// Purge toutes les entrées expirées, renvoie le nombre supprimé
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Balayage périodique des entrées expirées
pub fn spawn_cache_janitor(cache: Arc<ResultCache>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                debug!("[cache] purged {} expired entries ({} left)", purged, cache.len());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn result(source: &str) -> LogAnalysisResult {
        let mut r = LogAnalysisResult::minimal(source, "fine");
        r.severity = Severity::Warning;
        r
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ResultCache::new(16, Duration::from_secs(60));
        let fp = fingerprint("log text");
        cache.put("M1", &fp, result("share:a.log"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("M1", &fp).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("M1", &fp).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_key_includes_target() {
        let cache = ResultCache::new(16, Duration::from_secs(60));
        let fp = fingerprint("same content");
        cache.put("M1", &fp, result("share:a.log"));
        assert!(cache.get("M1", &fp).is_some());
        assert!(cache.get("M2", &fp).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        cache.put("M1", "a", result("a"));
        cache.put("M1", "b", result("b"));
        assert!(cache.get("M1", "a").is_some()); // "a" devient le plus récent
        cache.put("M1", "c", result("c"));
        assert!(cache.get("M1", "b").is_none());
        assert!(cache.get("M1", "a").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResultCache::new(16, Duration::from_secs(10));
        cache.put("M1", "old", result("old"));
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.put("M1", "new", result("new"));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
