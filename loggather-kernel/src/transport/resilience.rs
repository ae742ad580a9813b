/**
 * RÉSILIENCE TRANSPORTS - Retry exponentiel + circuit breaker par cible
 *
 * FONCTIONNEMENT :
 * - RetryPolicy : délai de base doublé à chaque tentative, plafonné, avec jitter
 * - CircuitBreaker : closed → open (après N échecs consécutifs) → half-open
 *   (après cool-down, un seul essai) → closed | open
 * - GuardTable : état par cible (breaker, session, compteur de retry), une table
 *   par variante de transport
 *
 * Un échec compte pour le breaker par appel fetch, une fois les retries épuisés.
 * Les erreurs d'authentification ne sont pas retentées. Un refus (Rejected) prouve
 * que l'hôte répond : il remet à zéro la série d'échecs.
 * Chaque tentative est bornée par attempt_timeout (expiration = Timeout).
 * Un essai half-open abandonné sans résultat (panic, annulation) rouvre le circuit.
 */

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BackendError, FailureClass, FetchError, TransportKind, TransportStats};
use crate::config::TransportConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Délai sans jitter avant la tentative `attempt + 1` (attempt commence à 0)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cool_down: Duration::from_secs(60) }
    }
}

/// Politique unique, paramétrée par variante de transport
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub session_ttl: Duration,
    /// Durée maximale d'une tentative backend
    pub attempt_timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            session_ttl: Duration::from_secs(300),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl ResiliencePolicy {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: cfg.max_attempts.max(1),
                base_delay: Duration::from_millis(cfg.base_delay_ms),
                max_delay: Duration::from_millis(cfg.max_delay_ms),
                jitter: cfg.jitter,
            },
            breaker: BreakerConfig {
                failure_threshold: cfg.failure_threshold.max(1),
                cool_down: Duration::from_secs(cfg.cool_down_secs),
            },
            session_ttl: Duration::from_secs(cfg.session_ttl_secs),
            attempt_timeout: Duration::from_millis(cfg.attempt_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Fonctionnement normal
    Closed,
    /// Appels refusés jusqu'à la fin du cool-down
    Open,
    /// Un seul appel d'essai autorisé
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Autorise ou refuse un appel ; en cas de refus, renvoie le temps restant
    pub fn admit(&mut self, now: Instant) -> Result<Admission, Duration> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cool_down {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(self.config.cool_down - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => self.open(now),
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
    }
}

#[derive(Debug)]
struct TargetGuard {
    breaker: CircuitBreaker,
    session_opened_at: Option<Instant>,
    retries: u64,
    ever_succeeded: bool,
}

impl TargetGuard {
    fn new(config: BreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(config),
            session_opened_at: None,
            retries: 0,
            ever_succeeded: false,
        }
    }

    fn needs_session(&self, now: Instant, ttl: Duration) -> bool {
        match self.session_opened_at {
            Some(opened) => now.saturating_duration_since(opened) >= ttl,
            None => true,
        }
    }
}

/// Essai half-open en cours ; s'il est abandonné sans résultat, le circuit rouvre
struct TrialGuard<'a> {
    table: &'a GuardTable,
    target: &'a str,
    settled: bool,
}

impl TrialGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("[transport] {} trial call for {} abandoned, reopening circuit", self.table.kind, self.target);
            self.table.record_failure(self.target);
        }
    }
}

/// État de résilience par cible pour une variante de transport
pub struct GuardTable {
    kind: TransportKind,
    policy: ResiliencePolicy,
    guards: Mutex<HashMap<String, TargetGuard>>,
}

impl GuardTable {
    pub fn new(kind: TransportKind, policy: ResiliencePolicy) -> Self {
        Self { kind, policy, guards: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    fn with_guard<R>(&self, target: &str, f: impl FnOnce(&mut TargetGuard) -> R) -> R {
        let mut guards = self.guards.lock();
        let guard = guards
            .entry(target.to_string())
            .or_insert_with(|| TargetGuard::new(self.policy.breaker.clone()));
        f(guard)
    }

    /// Exécute `op` sous la politique de résilience.
    /// `op(true)` doit ouvrir une session avant de récupérer le contenu.
    pub async fn run<F, Fut>(&self, target: &str, mut op: F) -> Result<String, FetchError>
    where
        F: FnMut(bool) -> Fut,
        Fut: Future<Output = Result<String, BackendError>>,
    {
        let admission = self
            .with_guard(target, |g| g.breaker.admit(Instant::now()))
            .map_err(|remaining| FetchError::CircuitOpen {
                target: target.to_string(),
                kind: self.kind,
                retry_in_secs: remaining.as_secs(),
            })?;

        let (max_attempts, mut trial) = match admission {
            Admission::Trial => {
                info!("[transport] {} circuit half-open for {}, sending trial call", self.kind, target);
                (1, Some(TrialGuard { table: self, target, settled: false }))
            }
            Admission::Normal => (self.policy.retry.max_attempts, None),
        };

        let mut attempt: u32 = 0;
        loop {
            let open_session = self.with_guard(target, |g| g.needs_session(Instant::now(), self.policy.session_ttl));
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, op(open_session)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::timeout(format!(
                    "no answer within {:?}",
                    self.policy.attempt_timeout
                ))),
            };
            attempt += 1;
            // un essai a toujours une seule tentative : son résultat est enregistré ci-dessous
            if let Some(trial) = trial.as_mut() {
                trial.settle();
            }

            let err = match outcome {
                Ok(text) => {
                    self.with_guard(target, |g| {
                        if open_session {
                            g.session_opened_at = Some(Instant::now());
                        }
                        if g.breaker.state() != CircuitState::Closed {
                            info!("[transport] {} circuit closed for {}", self.kind, target);
                        }
                        g.breaker.record_success();
                        g.ever_succeeded = true;
                    });
                    return Ok(text);
                }
                Err(err) => err,
            };

            match err.class {
                FailureClass::Rejected => {
                    self.with_guard(target, |g| g.breaker.record_success());
                    return Err(FetchError::Rejected { target: target.to_string(), reason: err.message });
                }
                FailureClass::Auth => {
                    self.record_failure(target);
                    return Err(FetchError::TransportAuthFailure {
                        target: target.to_string(),
                        reason: err.message,
                    });
                }
                FailureClass::Timeout | FailureClass::Unreachable => {
                    self.with_guard(target, |g| g.session_opened_at = None);
                    if attempt >= max_attempts {
                        self.record_failure(target);
                        return Err(FetchError::TransportTimeout {
                            target: target.to_string(),
                            attempts: attempt,
                            reason: err.message,
                        });
                    }
                    self.with_guard(target, |g| g.retries += 1);
                    let delay = self.policy.retry.jittered_delay(attempt - 1);
                    debug!(
                        "[transport] {} attempt {}/{} on {} failed ({}), retrying in {:?}",
                        self.kind, attempt, max_attempts, target, err.message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record_failure(&self, target: &str) {
        self.with_guard(target, |g| {
            g.breaker.record_failure(Instant::now());
            if g.breaker.state() == CircuitState::Open {
                warn!(
                    "[transport] {} circuit open for {} (cool-down {:?})",
                    self.kind, target, self.policy.breaker.cool_down
                );
            }
        });
    }

    pub fn circuit_state(&self, target: &str) -> CircuitState {
        self.guards
            .lock()
            .get(target)
            .map(|g| g.breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn retry_count(&self, target: &str) -> u64 {
        self.guards.lock().get(target).map(|g| g.retries).unwrap_or(0)
    }

    pub fn stats(&self) -> TransportStats {
        let guards = self.guards.lock();
        let mut stats = TransportStats::default();
        for (name, guard) in guards.iter() {
            if guard.ever_succeeded {
                stats.connected.insert(name.clone());
            }
            if guard.breaker.state() != CircuitState::Closed {
                stats.open.insert(name.clone());
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, cool_down_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cool_down: Duration::from_secs(cool_down_secs),
        })
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let mut cb = breaker(3, 60);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.admit(Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_single_trial_after_cool_down() {
        let mut cb = breaker(1, 60);
        cb.record_failure(Instant::now());

        tokio::time::advance(Duration::from_secs(59)).await;
        let remaining = cb.admit(Instant::now()).unwrap_err();
        assert_eq!(remaining, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.admit(Instant::now()), Ok(Admission::Trial));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // un seul essai à la fois
        assert!(cb.admit(Instant::now()).is_err());

        cb.record_failure(Instant::now());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.admit(Instant::now()).is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.admit(Instant::now()), Ok(Admission::Trial));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(Instant::now()), Ok(Admission::Normal));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut cb = breaker(3, 60);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    fn table(max_attempts: u32) -> GuardTable {
        GuardTable::new(
            TransportKind::Command,
            ResiliencePolicy {
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(100),
                    jitter: 0.0,
                },
                breaker: BreakerConfig { failure_threshold: 2, cool_down: Duration::from_secs(60) },
                session_ttl: Duration::from_secs(300),
                attempt_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn crashing_backend() -> Result<String, BackendError> {
        panic!("backend crashed during trial call")
    }

    async fn trip(guards: &GuardTable) {
        for _ in 0..2 {
            let _ = guards.run("M1", |_| async { Err::<String, _>(BackendError::timeout("down")) }).await;
        }
        assert_eq!(guards.circuit_state("M1"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_trial_reopens_circuit() {
        let guards = Arc::new(table(1));
        trip(&guards).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let g = Arc::clone(&guards);
        let crashed = tokio::spawn(async move { g.run("M1", |_| crashing_backend()).await }).await;
        assert!(crashed.unwrap_err().is_panic());
        assert_eq!(guards.circuit_state("M1"), CircuitState::Open);

        // nouveau cool-down, puis un nouvel essai est accordé
        let out = guards.run("M1", |_| async { Ok::<_, BackendError>("x".to_string()) }).await;
        assert!(matches!(out, Err(FetchError::CircuitOpen { .. })));
        tokio::time::advance(Duration::from_secs(61)).await;
        let out = guards.run("M1", |_| async { Ok::<_, BackendError>("back".to_string()) }).await;
        assert_eq!(out.unwrap(), "back");
        assert_eq!(guards.circuit_state("M1"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_reopens_circuit() {
        let guards = table(1);
        trip(&guards).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let stalled = guards.run("M1", |_| std::future::pending::<Result<String, BackendError>>());
        let cut = tokio::time::timeout(Duration::from_secs(1), stalled).await;
        assert!(cut.is_err());
        assert_eq!(guards.circuit_state("M1"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out_and_retries() {
        let guards = table(2);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = guards
            .run("M1", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<String, BackendError>>()
            })
            .await;
        match out {
            Err(FetchError::TransportTimeout { attempts, reason, .. }) => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("no answer within"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_then_succeeds() {
        let guards = table(3);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = guards
            .run("M1", move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::timeout("slow"))
                    } else {
                        Ok("content".to_string())
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), "content");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guards.retry_count("M1"), 2);
        assert!(guards.stats().connected.contains("M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_not_retried() {
        let guards = table(3);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = guards
            .run("M1", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(BackendError::auth("bad password")) }
            })
            .await;
        assert!(matches!(out, Err(FetchError::TransportAuthFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_neutral_for_breaker() {
        let guards = table(1);
        for _ in 0..5 {
            let out = guards
                .run("M1", |_| async { Err::<String, _>(BackendError::rejected("file not found")) })
                .await;
            assert!(matches!(out, Err(FetchError::Rejected { .. })));
        }
        assert_eq!(guards.circuit_state("M1"), CircuitState::Closed);
        assert!(guards.stats().connected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_opened_once_within_ttl() {
        let guards = table(1);
        let opens = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let o = opens.clone();
            guards
                .run("M1", move |open| {
                    if open {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    async { Ok("x".to_string()) }
                })
                .await
                .unwrap();
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let o = opens.clone();
        guards
            .run("M1", move |open| {
                if open {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                async { Ok("x".to_string()) }
            })
            .await
            .unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }
}
