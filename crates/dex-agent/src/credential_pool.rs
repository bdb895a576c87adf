//! Upstream credential pool with health tracking and quota cooldowns.
//!
//! All bookkeeping sits behind one mutex so every report is a single
//! read-modify-write. Two concurrent requests can never both "revive" a
//! cooling credential.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Tunables for cooldown and health decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Cooldown applied after a quota error without a server hint.
    pub quota_cooldown: Duration,
    /// Upper bound for server-provided `Retry-After` hints.
    pub max_quota_cooldown: Duration,
    /// Consecutive non-quota failures before a credential is unhealthy.
    pub failure_threshold: u32,
    /// How long an unhealthy credential sits out before one test request
    /// is let through again.
    pub half_open_after: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            quota_cooldown: Duration::from_secs(60),
            max_quota_cooldown: Duration::from_secs(600),
            failure_threshold: 3,
            half_open_after: Duration::from_secs(60),
        }
    }
}

/// What went wrong with a credential, as reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Quota { retry_after: Option<Duration> },
    Transient,
    /// Rejected credential. Removed from rotation for the life of the pool.
    Auth,
}

/// Observability events broadcast by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Rotated { from: Option<String>, to: String },
    CoolingDown { id: String, cooldown: Duration },
    Unhealthy { id: String, consecutive_failures: u32 },
    /// An unhealthy credential was handed out as a single test request.
    HalfOpen { id: String },
    Revoked { id: String },
    Recovered { id: String },
}

/// Point-in-time counts for `dex check` and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub cooling: usize,
    pub unhealthy: usize,
    pub revoked: usize,
}

/// A credential handed out for one attempt. The secret never leaves the
/// crate except through the backend call.
#[derive(Clone)]
pub struct Lease {
    id: String,
    secret: String,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish_non_exhaustive()
    }
}

struct Credential {
    id: String,
    secret: String,
    healthy: bool,
    revoked: bool,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Set while unhealthy: when the next test request may go out.
    half_open_at: Option<Instant>,
}

impl Credential {
    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.healthy && !self.revoked && !self.is_cooling(now)
    }

    /// Unhealthy, but due for a test request.
    fn is_half_open(&self, now: Instant) -> bool {
        !self.healthy
            && !self.revoked
            && !self.is_cooling(now)
            && self.half_open_at.is_some_and(|at| at <= now)
    }
}

struct PoolState {
    credentials: Vec<Credential>,
    cursor: usize,
    last_issued: Option<usize>,
}

pub struct CredentialPool {
    state: Mutex<PoolState>,
    settings: PoolSettings,
    events: broadcast::Sender<PoolEvent>,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credential_count", &self.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CredentialPool {
    /// Build a pool from resolved secrets. Ids are positional labels
    /// (`cred-0`, `cred-1`, ...) so logs never carry secret material.
    pub fn new(secrets: Vec<String>, settings: PoolSettings) -> Self {
        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(i, secret)| Credential {
                id: format!("cred-{i}"),
                secret,
                healthy: true,
                revoked: false,
                cooldown_until: None,
                consecutive_failures: 0,
                last_failure: None,
                half_open_at: None,
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
                last_issued: None,
            }),
            settings,
            events,
        }
    }

    /// Resolve `env:` references and build a pool from them.
    pub fn from_refs(refs: &[String], settings: PoolSettings) -> anyhow::Result<Self> {
        let secrets = resolve_credential_refs(refs)?;
        if secrets.is_empty() {
            anyhow::bail!("no credentials configured");
        }
        Ok(Self::new(secrets, settings))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is the normal case outside tests.
        let _ = self.events.send(event);
    }

    /// Select the next credential.
    ///
    /// Round-robin over healthy, uncooled credentials. An unhealthy
    /// credential whose `half_open_after` wait has elapsed joins the
    /// rotation for a single test request, after which it waits again
    /// until a report settles it. When nothing is eligible, falls back to
    /// the least-recently-failed unhealthy one that is not cooling.
    /// Returns `None` when every credential is cooling or revoked.
    pub fn acquire(&self) -> Option<Lease> {
        let now = Instant::now();
        let mut state = self.lock();
        let count = state.credentials.len();
        if count == 0 {
            return None;
        }

        let start = state.cursor % count;
        let chosen = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&idx| {
                let credential = &state.credentials[idx];
                credential.is_eligible(now) || credential.is_half_open(now)
            })
            .or_else(|| {
                state
                    .credentials
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.revoked && !c.is_cooling(now))
                    .min_by_key(|(_, c)| c.last_failure)
                    .map(|(idx, _)| idx)
            })?;

        state.cursor = chosen + 1;
        let previous = state.last_issued.replace(chosen);
        let half_open_after = self.settings.half_open_after;
        let credential = &mut state.credentials[chosen];
        let half_open = credential.is_half_open(now);
        if !credential.healthy {
            credential.half_open_at = Some(now + half_open_after);
        }
        let credential = &state.credentials[chosen];
        let lease = Lease {
            id: credential.id.clone(),
            secret: credential.secret.clone(),
        };
        let degraded = !credential.healthy;
        let from = previous
            .filter(|&prev| prev != chosen)
            .map(|prev| state.credentials[prev].id.clone());
        let rotated = previous != Some(chosen);
        drop(state);

        if half_open {
            info!(credential = %lease.id, "unhealthy credential due for a test request");
            self.emit(PoolEvent::HalfOpen { id: lease.id.clone() });
        } else if degraded {
            debug!(
                credential = %lease.id,
                "no healthy credential, falling back to an unhealthy one"
            );
        }
        if rotated {
            debug!(from = ?from, to = %lease.id, "credential rotation");
            self.emit(PoolEvent::Rotated {
                from,
                to: lease.id.clone(),
            });
        }
        Some(lease)
    }

    /// Reset failure tracking and mark the credential healthy.
    pub fn report_success(&self, id: &str) {
        let mut state = self.lock();
        let Some(credential) = state.credentials.iter_mut().find(|c| c.id == id) else {
            return;
        };
        let recovered = !credential.healthy;
        credential.healthy = !credential.revoked;
        credential.consecutive_failures = 0;
        credential.cooldown_until = None;
        credential.half_open_at = None;
        drop(state);

        if recovered {
            info!(credential = id, "credential recovered");
            self.emit(PoolEvent::Recovered { id: id.to_owned() });
        }
    }

    pub fn report_failure(&self, id: &str, kind: FailureKind) {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(credential) = state.credentials.iter_mut().find(|c| c.id == id) else {
            return;
        };
        credential.last_failure = Some(now);

        let event = match kind {
            FailureKind::Quota { retry_after } => {
                let cooldown = retry_after.map_or(self.settings.quota_cooldown, |hint| {
                    hint.min(self.settings.max_quota_cooldown)
                });
                credential.cooldown_until = Some(now + cooldown);
                Some(PoolEvent::CoolingDown {
                    id: id.to_owned(),
                    cooldown,
                })
            }
            FailureKind::Transient => {
                credential.consecutive_failures += 1;
                let failures = credential.consecutive_failures;
                if !credential.healthy {
                    // Failed test request: wait a full interval again.
                    credential.half_open_at = Some(now + self.settings.half_open_after);
                    None
                } else if failures >= self.settings.failure_threshold {
                    credential.healthy = false;
                    credential.half_open_at = Some(now + self.settings.half_open_after);
                    Some(PoolEvent::Unhealthy {
                        id: id.to_owned(),
                        consecutive_failures: failures,
                    })
                } else {
                    None
                }
            }
            FailureKind::Auth => {
                credential.revoked = true;
                credential.healthy = false;
                Some(PoolEvent::Revoked { id: id.to_owned() })
            }
        };
        drop(state);

        match &event {
            Some(PoolEvent::CoolingDown { cooldown, .. }) => {
                info!(
                    credential = id,
                    cooldown_ms = cooldown.as_millis(),
                    "credential cooling down"
                );
            }
            Some(PoolEvent::Unhealthy {
                consecutive_failures,
                ..
            }) => {
                warn!(credential = id, consecutive_failures, "credential marked unhealthy");
            }
            Some(PoolEvent::Revoked { .. }) => {
                warn!(credential = id, "credential rejected upstream, removed from rotation");
            }
            _ => {}
        }
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// True once every credential has been rejected as invalid.
    pub fn all_revoked(&self) -> bool {
        self.lock().credentials.iter().all(|c| c.revoked)
    }

    pub fn is_cooling(&self, id: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .credentials
            .iter()
            .any(|c| c.id == id && c.is_cooling(now))
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.lock();
        let mut stats = PoolStats {
            total: state.credentials.len(),
            ..PoolStats::default()
        };
        for credential in &state.credentials {
            if credential.revoked {
                stats.revoked += 1;
            } else if credential.is_cooling(now) {
                stats.cooling += 1;
            } else if credential.healthy {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
        }
        drop(state);
        stats
    }
}

/// Resolve `env:VAR_NAME` credential references.
///
/// A variable may hold several comma-separated secrets. Blank entries are
/// skipped and duplicates keep their first position.
pub fn resolve_credential_refs(refs: &[String]) -> anyhow::Result<Vec<String>> {
    let mut secrets: Vec<String> = Vec::with_capacity(refs.len());
    for entry in refs {
        let Some(var_name) = entry.strip_prefix("env:") else {
            anyhow::bail!(
                "credential entry '{entry}' must use 'env:' prefix (e.g. env:DEX_API_KEY)"
            );
        };
        let value = std::env::var(var_name).map_err(|_env_err| {
            anyhow::anyhow!(
                "environment variable '{var_name}' not set (from credential entry '{entry}')"
            )
        })?;
        push_secrets(&value, &mut secrets);
    }
    Ok(secrets)
}

fn push_secrets(value: &str, secrets: &mut Vec<String>) {
    for secret in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !secrets.iter().any(|existing| existing == secret) {
            secrets.push(secret.to_owned());
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool_with(n: usize) -> CredentialPool {
        let secrets = (0..n).map(|i| format!("secret-{i}")).collect();
        CredentialPool::new(secrets, PoolSettings::default())
    }

    fn quota() -> FailureKind {
        FailureKind::Quota { retry_after: None }
    }

    #[test]
    fn round_robin_over_healthy_credentials() {
        let pool = pool_with(3);
        let ids: Vec<String> = (0..4).map(|_| pool.acquire().unwrap().id().to_owned()).collect();
        assert_eq!(ids, ["cred-0", "cred-1", "cred-2", "cred-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_credential_is_never_selected() {
        let pool = pool_with(2);
        pool.report_failure("cred-0", quota());

        for _ in 0..5 {
            assert_eq!(pool.acquire().unwrap().id(), "cred-1");
        }
        assert!(pool.is_cooling("cred-0"));

        tokio::time::advance(PoolSettings::default().quota_cooldown + Duration::from_millis(1))
            .await;
        assert!(!pool.is_cooling("cred-0"));
        let ids: Vec<String> = (0..2).map(|_| pool.acquire().unwrap().id().to_owned()).collect();
        assert!(ids.contains(&"cred-0".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn all_cooling_yields_no_lease() {
        let pool = pool_with(2);
        pool.report_failure("cred-0", quota());
        pool.report_failure("cred-1", quota());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.stats().cooling, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_capped() {
        let pool = pool_with(1);
        pool.report_failure(
            "cred-0",
            FailureKind::Quota {
                retry_after: Some(Duration::from_secs(86_400)),
            },
        );
        tokio::time::advance(PoolSettings::default().max_quota_cooldown + Duration::from_secs(1))
            .await;
        assert!(!pool.is_cooling("cred-0"));
    }

    #[test]
    fn quota_error_does_not_mark_unhealthy() {
        let pool = pool_with(1);
        for _ in 0..10 {
            pool.report_failure("cred-0", quota());
        }
        let stats = pool.stats();
        assert_eq!(stats.unhealthy, 0);
        assert_eq!(stats.cooling, 1);
    }

    #[test]
    fn repeated_transient_failures_mark_unhealthy() {
        let pool = pool_with(2);
        pool.report_failure("cred-0", FailureKind::Transient);
        pool.report_failure("cred-0", FailureKind::Transient);
        assert_eq!(pool.stats().healthy, 2);

        pool.report_failure("cred-0", FailureKind::Transient);
        let stats = pool.stats();
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);

        for _ in 0..3 {
            assert_eq!(pool.acquire().unwrap().id(), "cred-1");
        }
    }

    #[test]
    fn unhealthy_pool_degrades_to_least_recently_failed() {
        let pool = pool_with(2);
        for id in ["cred-1", "cred-0"] {
            for _ in 0..3 {
                pool.report_failure(id, FailureKind::Transient);
            }
        }
        // cred-1 failed first, so it gets tried first.
        assert_eq!(pool.acquire().unwrap().id(), "cred-1");
    }

    fn times_picked(pool: &CredentialPool, id: &str, acquisitions: usize) -> usize {
        (0..acquisitions)
            .filter(|_| pool.acquire().unwrap().id() == id)
            .count()
    }

    fn drain(events: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_credential_gets_one_test_request_per_interval() {
        let pool = pool_with(3);
        let mut events = pool.subscribe();
        let wait = PoolSettings::default().half_open_after;
        let mut seen = Vec::new();
        for _ in 0..3 {
            pool.report_failure("cred-0", FailureKind::Transient);
        }
        assert_eq!(times_picked(&pool, "cred-0", 30), 0);
        seen.extend(drain(&mut events));

        tokio::time::advance(wait).await;
        assert_eq!(times_picked(&pool, "cred-0", 30), 1);
        seen.extend(drain(&mut events));

        // The test request failed: back to waiting a full interval.
        pool.report_failure("cred-0", FailureKind::Transient);
        assert_eq!(times_picked(&pool, "cred-0", 30), 0);
        assert_eq!(pool.stats().unhealthy, 1);
        seen.extend(drain(&mut events));

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(times_picked(&pool, "cred-0", 30), 1);
        pool.report_success("cred-0");
        seen.extend(drain(&mut events));
        assert_eq!(pool.stats().healthy, 3);
        assert_eq!(times_picked(&pool, "cred-0", 30), 10);

        let test_requests = seen
            .iter()
            .filter(|e| matches!(e, PoolEvent::HalfOpen { id } if id == "cred-0"))
            .count();
        assert_eq!(test_requests, 2);
        assert!(seen.contains(&PoolEvent::Recovered {
            id: "cred-0".to_owned()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_beats_half_open() {
        let pool = pool_with(2);
        for _ in 0..3 {
            pool.report_failure("cred-0", FailureKind::Transient);
        }
        pool.report_failure(
            "cred-0",
            FailureKind::Quota {
                retry_after: Some(Duration::from_secs(300)),
            },
        );
        tokio::time::advance(PoolSettings::default().half_open_after).await;
        assert_eq!(times_picked(&pool, "cred-0", 10), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_never_hand_out_a_cooling_credential() {
        let pool = Arc::new(pool_with(4));
        let long = FailureKind::Quota {
            retry_after: Some(Duration::from_secs(600)),
        };
        pool.report_failure("cred-0", long);

        let mut tasks = Vec::new();
        for worker in 0..8usize {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for round in 0..500usize {
                    let lease = pool.acquire().unwrap();
                    assert_ne!(lease.id(), "cred-0", "cooling credential handed out");
                    match (worker + round) % 4 {
                        0 => pool.report_failure(lease.id(), FailureKind::Transient),
                        1 => pool.report_failure("cred-0", long),
                        _ => pool.report_success(lease.id()),
                    }
                    let stats = pool.stats();
                    assert_eq!(
                        stats.healthy + stats.cooling + stats.unhealthy + stats.revoked,
                        stats.total
                    );
                    if round % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.cooling, 1);
        assert!(pool.is_cooling("cred-0"));
    }

    #[test]
    fn success_resets_health() {
        let pool = pool_with(1);
        let mut events = pool.subscribe();
        for _ in 0..3 {
            pool.report_failure("cred-0", FailureKind::Transient);
        }
        pool.report_success("cred-0");
        assert_eq!(pool.stats().healthy, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&PoolEvent::Recovered {
            id: "cred-0".to_owned()
        }));
    }

    #[test]
    fn auth_failure_revokes_permanently() {
        let pool = pool_with(2);
        pool.report_failure("cred-0", FailureKind::Auth);
        pool.report_success("cred-0");

        for _ in 0..3 {
            assert_eq!(pool.acquire().unwrap().id(), "cred-1");
        }
        assert!(!pool.all_revoked());

        pool.report_failure("cred-1", FailureKind::Auth);
        assert!(pool.all_revoked());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn rotation_events_are_broadcast() {
        let pool = pool_with(2);
        let mut events = pool.subscribe();
        pool.acquire().unwrap();
        pool.acquire().unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            PoolEvent::Rotated {
                from: None,
                to: "cred-0".to_owned()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PoolEvent::Rotated {
                from: Some("cred-0".to_owned()),
                to: "cred-1".to_owned()
            }
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let pool = pool_with(1);
        let lease = pool.acquire().unwrap();
        assert!(!format!("{lease:?}").contains("secret-0"));
        assert!(!format!("{pool:?}").contains("secret-0"));
    }

    #[test]
    fn resolve_rejects_plain_values() {
        let err = resolve_credential_refs(&["sk-raw".to_owned()]).unwrap_err();
        assert!(err.to_string().contains("env:"));
    }

    #[test]
    fn resolve_reports_missing_variable() {
        let err =
            resolve_credential_refs(&["env:DEX_TEST_SURELY_UNSET_VAR".to_owned()]).unwrap_err();
        assert!(err.to_string().contains("DEX_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn comma_separated_values_are_split_and_deduped() {
        let mut secrets = vec!["a".to_owned()];
        push_secrets(" b, a ,,c,b ", &mut secrets);
        assert_eq!(secrets, ["a", "b", "c"]);
    }
}
