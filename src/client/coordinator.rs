//! Per-session single-flight token rotation.
//!
//! The first caller that needs a rotation moves the session to `Refreshing`
//! and spawns the upstream call as its own task; everyone else who arrives
//! before it finishes is queued and resumed, in arrival order, with the same
//! outcome. No caller ever triggers a second upstream call for a rotation
//! already in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::upstream::{AuthUpstream, Credentials};
use crate::auth::AuthError;
use crate::config::{RefreshSettings, CLIENT_EXPIRY_SKEW_SECONDS};
use crate::tokens::TokenPair;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Tokens this close to expiry are treated as expired
    pub expiry_skew: chrono::Duration,
    pub max_attempts: u32,
    /// Base delay between transient retries; attempt `n` waits `n` times this
    pub retry_backoff: Duration,
    pub upstream_timeout: Duration,
    pub waiter_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self::from(&RefreshSettings::default())
    }
}

impl From<&RefreshSettings> for RefreshConfig {
    fn from(settings: &RefreshSettings) -> Self {
        Self {
            expiry_skew: chrono::Duration::seconds(CLIENT_EXPIRY_SKEW_SECONDS as i64),
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: Duration::from_millis(250),
            upstream_timeout: Duration::from_millis(settings.retry_timeout_ms),
            waiter_timeout: Duration::from_millis(settings.wait_timeout_ms),
        }
    }
}

/// Lifecycle notifications, one per transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedOut { reason: AuthError, session: String },
    Refreshed { session: String },
}

/// Observable phase of a session slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    LoggedOut(AuthError),
    Refreshing { waiters: usize },
    Unknown,
}

type Outcome = Result<Credentials, AuthError>;

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Outcome>,
}

enum Phase {
    Active,
    LoggedOut(AuthError),
    /// `epoch` identifies the rotation task that owns this cycle
    Refreshing {
        epoch: u64,
        waiters: VecDeque<Waiter>,
    },
}

struct SlotState {
    credentials: Option<Credentials>,
    epoch: u64,
    next_ticket: u64,
    phase: Phase,
}

impl SlotState {
    /// Enter a new refresh cycle and return its epoch.
    fn begin_refresh(&mut self) -> u64 {
        self.epoch += 1;
        self.phase = Phase::Refreshing {
            epoch: self.epoch,
            waiters: VecDeque::new(),
        };
        self.epoch
    }

    /// Leave the current phase for `next`. Any result still in flight from
    /// the previous cycle is discarded when it lands.
    fn transition(&mut self, next: Phase) -> Phase {
        self.epoch += 1;
        std::mem::replace(&mut self.phase, next)
    }

    fn enqueue(&mut self) -> Option<(u64, oneshot::Receiver<Outcome>)> {
        let Phase::Refreshing { waiters, .. } = &mut self.phase else {
            return None;
        };
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        waiters.push_back(Waiter { ticket, tx });
        Some((ticket, rx))
    }
}

struct SessionSlot {
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn new(credentials: Option<Credentials>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                credentials,
                epoch: 0,
                next_ticket: 0,
                phase: Phase::Active,
            }),
        }
    }
}

struct Inner {
    config: RefreshConfig,
    events: broadcast::Sender<SessionEvent>,
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
    upstream: Arc<dyn AuthUpstream>,
    upstream_calls: AtomicU64,
}

/// What a caller wants out of the gate once it holds the slot lock
enum Want {
    /// A token that is not about to expire
    Valid,
    /// Anything newer than the rejected access token
    Replacing(String),
    /// Rotation of this specific refresh token
    Rotation(String),
}

/// Single-flight refresh gate shared by every caller of a client.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(upstream: Arc<dyn AuthUpstream>, config: RefreshConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                slots: Mutex::new(HashMap::new()),
                upstream,
                upstream_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Number of upstream refresh attempts made so far
    pub fn upstream_calls(&self) -> u64 {
        self.inner.upstream_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Store fresh credentials for a session, resetting any logged-out state.
    ///
    /// Callers queued behind an in-flight rotation are resumed with them.
    pub async fn install(&self, session: &str, credentials: Credentials) {
        let slot = self.slot_or_create(session).await;
        let mut state = slot.state.lock().await;
        let previous = state.transition(Phase::Active);
        state.credentials = Some(credentials.clone());
        if let Phase::Refreshing { waiters, .. } = previous {
            for waiter in waiters {
                let _ = waiter.tx.send(Ok(credentials.clone()));
            }
        }
        debug!(session_id = %session, "Credentials installed");
    }

    /// Drop all local knowledge of a session.
    pub async fn forget(&self, session: &str) {
        self.inner.slots.lock().await.remove(session);
    }

    pub async fn credentials(&self, session: &str) -> Option<Credentials> {
        let slot = self.slot(session).await?;
        let state = slot.state.lock().await;
        state.credentials.clone()
    }

    pub async fn state(&self, session: &str) -> SessionPhase {
        let Some(slot) = self.slot(session).await else {
            return SessionPhase::Unknown;
        };
        let state = slot.state.lock().await;
        match &state.phase {
            Phase::Active => SessionPhase::Active,
            Phase::LoggedOut(reason) => SessionPhase::LoggedOut(reason.clone()),
            Phase::Refreshing { waiters, .. } => SessionPhase::Refreshing {
                waiters: waiters.len(),
            },
        }
    }

    /// Current access token, rotating first if it is expired or about to be.
    pub async fn acquire_valid_access_token(&self, session: &str) -> Result<String, AuthError> {
        let slot = self
            .slot(session)
            .await
            .ok_or(AuthError::InvalidCredentials)?;
        self.gate(session, slot, Want::Valid)
            .await
            .map(|c| c.access_token)
    }

    /// Rotate `presented_refresh_token` through the gate.
    ///
    /// A token other than the one the session currently holds has been
    /// rotated out already. It still goes to the upstream, which treats the
    /// replay as reuse and revokes the session; the terminal outcome then
    /// logs the session out here too.
    pub async fn rotate(
        &self,
        session: &str,
        presented_refresh_token: &str,
    ) -> Result<Credentials, AuthError> {
        let slot = self.slot_or_create(session).await;
        self.gate(
            session,
            slot,
            Want::Rotation(presented_refresh_token.to_string()),
        )
        .await
    }

    /// Replacement for an access token the server just rejected.
    pub async fn refresh_after_rejection(
        &self,
        session: &str,
        rejected_access_token: &str,
    ) -> Result<String, AuthError> {
        let slot = self
            .slot(session)
            .await
            .ok_or(AuthError::InvalidCredentials)?;
        self.gate(
            session,
            slot,
            Want::Replacing(rejected_access_token.to_string()),
        )
        .await
        .map(|c| c.access_token)
    }

    /// Move a session to `LoggedOut`, failing anyone still queued.
    ///
    /// Returns false if it was already logged out; the logout event is only
    /// broadcast by the call that performs the transition.
    pub async fn force_logout(&self, session: &str, reason: AuthError) -> bool {
        let Some(slot) = self.slot(session).await else {
            return false;
        };
        let mut state = slot.state.lock().await;
        if matches!(state.phase, Phase::LoggedOut(_)) {
            return false;
        }
        let previous = state.transition(Phase::LoggedOut(reason.clone()));
        state.credentials = None;
        if let Phase::Refreshing { waiters, .. } = previous {
            for waiter in waiters {
                let _ = waiter.tx.send(Err(reason.clone()));
            }
        }
        drop(state);

        self.inner.announce_logout(session, reason);
        true
    }

    async fn slot(&self, session: &str) -> Option<Arc<SessionSlot>> {
        self.inner.slots.lock().await.get(session).cloned()
    }

    async fn slot_or_create(&self, session: &str) -> Arc<SessionSlot> {
        let mut slots = self.inner.slots.lock().await;
        Arc::clone(
            slots
                .entry(session.to_string())
                .or_insert_with(|| Arc::new(SessionSlot::new(None))),
        )
    }

    async fn gate(&self, session: &str, slot: Arc<SessionSlot>, want: Want) -> Outcome {
        let (ticket, rx) = {
            let mut state = slot.state.lock().await;
            let idle = match &state.phase {
                Phase::LoggedOut(reason) => return Err(reason.clone()),
                Phase::Refreshing { .. } => false,
                Phase::Active => true,
            };
            let superseded = match (&want, &state.credentials) {
                (Want::Rotation(presented), Some(current)) if &current.refresh_token != presented => {
                    Some(presented.clone())
                }
                _ => None,
            };
            if let Some(presented) = superseded {
                drop(state);
                return self.rotate_superseded(session, presented).await;
            }
            if idle {
                let refresh_token = match (&want, &state.credentials) {
                    (Want::Valid, Some(current)) => {
                        if current.access_expires_at - self.inner.config.expiry_skew > Utc::now()
                        {
                            return Ok(current.clone());
                        }
                        current.refresh_token.clone()
                    }
                    (Want::Replacing(rejected), Some(current)) => {
                        if &current.access_token != rejected {
                            return Ok(current.clone());
                        }
                        current.refresh_token.clone()
                    }
                    (Want::Rotation(presented), _) => presented.clone(),
                    (_, None) => return Err(AuthError::InvalidCredentials),
                };
                let epoch = state.begin_refresh();
                self.spawn_rotation(session, Arc::clone(&slot), epoch, refresh_token);
            }
            match state.enqueue() {
                Some(entry) => entry,
                None => return Err(AuthError::Internal("refresh gate out of phase".to_string())),
            }
        };

        self.wait(&slot, ticket, rx).await
    }

    async fn wait(
        &self,
        slot: &SessionSlot,
        ticket: u64,
        rx: oneshot::Receiver<Outcome>,
    ) -> Outcome {
        match tokio::time::timeout(self.inner.config.waiter_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AuthError::TransientUpstreamFailure(
                "refresh was abandoned".to_string(),
            )),
            Err(_) => {
                let mut state = slot.state.lock().await;
                if let Phase::Refreshing { waiters, .. } = &mut state.phase {
                    waiters.retain(|w| w.ticket != ticket);
                }
                debug!(ticket, "Gave up waiting for token refresh");
                Err(AuthError::TransientUpstreamFailure(
                    "timed out waiting for token refresh".to_string(),
                ))
            }
        }
    }

    fn spawn_rotation(&self, session: &str, slot: Arc<SessionSlot>, epoch: u64, refresh_token: String) {
        let inner = Arc::clone(&self.inner);
        let session = session.to_string();
        debug!(session_id = %session, epoch, "Starting token rotation");

        // Detached so a cancelled caller cannot abort a rotation the server
        // may already have committed.
        tokio::spawn(async move {
            let outcome = inner.call_upstream(&session, &refresh_token).await;
            inner.complete(&session, &slot, epoch, outcome).await;
        });
    }

    /// Present a refresh token the session has already moved past.
    async fn rotate_superseded(&self, session: &str, presented: String) -> Outcome {
        warn!(session_id = %session, "Rotation requested with a superseded refresh token");
        let coordinator = self.clone();
        let session = session.to_string();

        let task = tokio::spawn(async move {
            match coordinator.inner.call_upstream(&session, &presented).await {
                // Upstream still honoured it, so local state was the stale side
                Ok(pair) => {
                    let credentials = Credentials::from_pair(pair, Utc::now());
                    coordinator.install(&session, credentials.clone()).await;
                    Ok(credentials)
                }
                Err(e) if e.is_terminal_for_refresh() => {
                    coordinator.force_logout(&session, e.clone()).await;
                    Err(e)
                }
                Err(e) => Err(e),
            }
        });
        task.await
            .unwrap_or_else(|e| Err(AuthError::Internal(format!("rotation task failed: {e}"))))
    }
}

impl Inner {
    async fn call_upstream(&self, session: &str, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.upstream_calls.fetch_add(1, Ordering::SeqCst);

            let result =
                tokio::time::timeout(self.config.upstream_timeout, self.upstream.refresh(refresh_token))
                    .await;
            match result {
                Ok(Ok(pair)) => return Ok(pair),
                Ok(Err(AuthError::TransientUpstreamFailure(msg))) if attempt < self.config.max_attempts => {
                    warn!(session_id = %session, attempt, error = %msg, "Token refresh failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Ok(Err(e)) => return Err(e),
                // The server may have rotated already; replaying the old
                // token would read as reuse.
                Err(_) => {
                    warn!(session_id = %session, attempt, "Token refresh timed out");
                    return Err(AuthError::TransientUpstreamFailure(
                        "refresh timed out".to_string(),
                    ));
                }
            }
        }
    }

    async fn complete(
        &self,
        session: &str,
        slot: &SessionSlot,
        epoch: u64,
        outcome: Result<TokenPair, AuthError>,
    ) {
        let mut state = slot.state.lock().await;
        let waiters = match &mut state.phase {
            Phase::Refreshing { epoch: current, waiters } if *current == epoch => {
                std::mem::take(waiters)
            }
            _ => {
                debug!(session_id = %session, epoch, "Discarding result of a superseded rotation");
                return;
            }
        };

        let result: Outcome = match outcome {
            Ok(pair) => {
                let credentials = Credentials::from_pair(pair, Utc::now());
                state.credentials = Some(credentials.clone());
                state.transition(Phase::Active);
                info!(session_id = %session, waiters = waiters.len(), "Token rotated");
                let _ = self.events.send(SessionEvent::Refreshed {
                    session: session.to_string(),
                });
                Ok(credentials)
            }
            Err(e) if e.is_terminal_for_refresh() => {
                state.credentials = None;
                state.transition(Phase::LoggedOut(e.clone()));
                self.announce_logout(session, e.clone());
                Err(e)
            }
            Err(e) => {
                state.transition(Phase::Active);
                Err(e)
            }
        };

        for waiter in waiters {
            let _ = waiter.tx.send(result.clone());
        }
    }

    fn announce_logout(&self, session: &str, reason: AuthError) {
        warn!(session_id = %session, reason = %reason, "Session logged out");
        let _ = self.events.send(SessionEvent::LoggedOut {
            reason,
            session: session.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;

    /// Scripted upstream: answers refreshes in order, after an optional delay
    struct ScriptedUpstream {
        calls: AtomicUsize,
        delay: Duration,
        script: std::sync::Mutex<VecDeque<Result<TokenPair, AuthError>>>,
    }

    impl ScriptedUpstream {
        fn new(delay: Duration, script: Vec<Result<TokenPair, AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                script: std::sync::Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl AuthUpstream for ScriptedUpstream {
        async fn login(&self, _: &str, _: &str) -> Result<TokenPair, AuthError> {
            Err(AuthError::InvalidCredentials)
        }

        async fn refresh(&self, _: &str) -> Result<TokenPair, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AuthError::Internal("script exhausted".into())))
        }

        async fn logout(&self, _: &str, _: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn pair(n: u32) -> TokenPair {
        TokenPair {
            access_token: format!("access-{n}"),
            expires_in: 900,
            refresh_token: format!("rt_{n}"),
            session_id: "s1".to_string(),
            token_type: "bearer".to_string(),
        }
    }

    fn expired() -> Credentials {
        Credentials {
            access_expires_at: Utc::now() - chrono::Duration::minutes(1),
            access_token: "access-0".to_string(),
            refresh_token: "rt_0".to_string(),
            session_id: "s1".to_string(),
        }
    }

    fn config() -> RefreshConfig {
        RefreshConfig {
            expiry_skew: chrono::Duration::zero(),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            upstream_timeout: Duration::from_secs(2),
            waiter_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_rotation() {
        let upstream = ScriptedUpstream::new(Duration::from_millis(100), vec![Ok(pair(1))]);
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        coordinator.install("s1", expired()).await;

        let calls = (0..16).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_valid_access_token("s1").await }
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("access-1")));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.upstream_calls(), 1);
        assert_eq!(coordinator.state("s1").await, SessionPhase::Active);

        // Fresh token now: no further rotation
        assert_eq!(
            coordinator.acquire_valid_access_token("s1").await.unwrap(),
            "access-1"
        );
        assert_eq!(coordinator.upstream_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminal_failure_logs_out_once() {
        let upstream = ScriptedUpstream::new(
            Duration::from_millis(50),
            vec![Err(AuthError::RefreshTokenReuse)],
        );
        let coordinator = RefreshCoordinator::new(upstream, config());
        coordinator.install("s1", expired()).await;
        let mut events = coordinator.subscribe();

        let calls = (0..8).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_valid_access_token("s1").await }
        });
        let results = join_all(calls).await;
        assert!(results
            .iter()
            .all(|r| r == &Err(AuthError::RefreshTokenReuse)));

        // Later callers fail fast with the same reason
        assert_eq!(
            coordinator.acquire_valid_access_token("s1").await,
            Err(AuthError::RefreshTokenReuse)
        );
        assert!(!coordinator.force_logout("s1", AuthError::SessionRevoked).await);

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LoggedOut {
                reason: AuthError::RefreshTokenReuse,
                session: "s1".to_string(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_session() {
        let upstream = ScriptedUpstream::new(
            Duration::ZERO,
            vec![
                Err(AuthError::TransientUpstreamFailure("503".into())),
                Err(AuthError::TransientUpstreamFailure("503".into())),
                Err(AuthError::TransientUpstreamFailure("503".into())),
                Ok(pair(1)),
            ],
        );
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        coordinator.install("s1", expired()).await;

        // Three attempts, all transient: surfaced, session still usable
        assert!(matches!(
            coordinator.acquire_valid_access_token("s1").await,
            Err(AuthError::TransientUpstreamFailure(_))
        ));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.state("s1").await, SessionPhase::Active);

        assert_eq!(
            coordinator.acquire_valid_access_token("s1").await.unwrap(),
            "access-1"
        );
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_not_retried() {
        let upstream = ScriptedUpstream::new(Duration::from_millis(200), vec![Ok(pair(1)), Ok(pair(2))]);
        let coordinator = RefreshCoordinator::new(
            upstream.clone(),
            RefreshConfig {
                upstream_timeout: Duration::from_millis(20),
                ..config()
            },
        );
        coordinator.install("s1", expired()).await;

        assert!(matches!(
            coordinator.acquire_valid_access_token("s1").await,
            Err(AuthError::TransientUpstreamFailure(_))
        ));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_gives_up_after_timeout() {
        let upstream = ScriptedUpstream::new(Duration::from_millis(300), vec![Ok(pair(1))]);
        let coordinator = RefreshCoordinator::new(
            upstream,
            RefreshConfig {
                waiter_timeout: Duration::from_millis(30),
                ..config()
            },
        );
        coordinator.install("s1", expired()).await;

        assert!(matches!(
            coordinator.acquire_valid_access_token("s1").await,
            Err(AuthError::TransientUpstreamFailure(_))
        ));
        assert_eq!(
            coordinator.state("s1").await,
            SessionPhase::Refreshing { waiters: 0 }
        );

        // The rotation still lands
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(coordinator.state("s1").await, SessionPhase::Active);
        assert_eq!(
            coordinator.credentials("s1").await.unwrap().access_token,
            "access-1"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timed_out_waiter_only_removes_itself() {
        let upstream = ScriptedUpstream::new(Duration::from_millis(300), vec![Ok(pair(1))]);
        let coordinator = RefreshCoordinator::new(
            upstream.clone(),
            RefreshConfig {
                waiter_timeout: Duration::from_millis(100),
                ..config()
            },
        );
        coordinator.install("s1", expired()).await;

        let spawn_caller = |coordinator: RefreshCoordinator| {
            tokio::spawn(async move { coordinator.acquire_valid_access_token("s1").await })
        };
        let first = spawn_caller(coordinator.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = spawn_caller(coordinator.clone());

        // First has given up, second is still queued
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(
            coordinator.state("s1").await,
            SessionPhase::Refreshing { waiters: 1 }
        );

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(coordinator.state("s1").await, SessionPhase::Active);
        assert_eq!(
            coordinator.acquire_valid_access_token("s1").await.unwrap(),
            "access-1"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_caller_does_not_disturb_others() {
        let upstream = ScriptedUpstream::new(Duration::from_millis(100), vec![Ok(pair(1))]);
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        coordinator.install("s1", expired()).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.acquire_valid_access_token("s1"),
        )
        .await;
        assert!(cancelled.is_err());

        // Joins the rotation the cancelled caller started
        assert_eq!(
            coordinator.acquire_valid_access_token("s1").await.unwrap(),
            "access-1"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_with_newer_token_skips_upstream() {
        let upstream = ScriptedUpstream::new(Duration::ZERO, vec![Ok(pair(1))]);
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        coordinator.install("s1", expired()).await;

        let fresh = coordinator
            .refresh_after_rejection("s1", "access-0")
            .await
            .unwrap();
        assert_eq!(fresh, "access-1");

        // A straggler holding the old token gets the new one for free
        assert_eq!(
            coordinator
                .refresh_after_rejection("s1", "access-0")
                .await
                .unwrap(),
            "access-1"
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotating_superseded_token_logs_out() {
        let upstream = ScriptedUpstream::new(
            Duration::ZERO,
            vec![Ok(pair(1)), Err(AuthError::RefreshTokenReuse)],
        );
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        let mut events = coordinator.subscribe();

        let rotated = coordinator.rotate("s1", "rt_0").await.unwrap();
        assert_eq!(rotated.refresh_token, "rt_1");

        // rt_0 was rotated out; presenting it again is reuse, not a race
        assert_eq!(
            coordinator.rotate("s1", "rt_0").await,
            Err(AuthError::RefreshTokenReuse)
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            coordinator.state("s1").await,
            SessionPhase::LoggedOut(AuthError::RefreshTokenReuse)
        );
        assert!(coordinator.credentials("s1").await.is_none());

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Refreshed {
                session: "s1".to_string()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LoggedOut {
                reason: AuthError::RefreshTokenReuse,
                session: "s1".to_string(),
            }
        );
        assert!(events.try_recv().is_err());

        // Current token is gone with the session
        assert_eq!(
            coordinator.rotate("s1", "rt_1").await,
            Err(AuthError::RefreshTokenReuse)
        );
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    /// Answers each refresh with a pair derived from the presented token,
    /// taking longer for some tokens than others
    struct EchoUpstream {
        calls: AtomicUsize,
        slow: Duration,
        slow_token: &'static str,
        fast: Duration,
    }

    #[async_trait]
    impl AuthUpstream for EchoUpstream {
        async fn login(&self, _: &str, _: &str) -> Result<TokenPair, AuthError> {
            Err(AuthError::InvalidCredentials)
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = if refresh_token == self.slow_token {
                self.slow
            } else {
                self.fast
            };
            tokio::time::sleep(delay).await;
            Ok(TokenPair {
                access_token: format!("access-from-{refresh_token}"),
                expires_in: 900,
                refresh_token: format!("{refresh_token}-next"),
                session_id: "s1".to_string(),
                token_type: "bearer".to_string(),
            })
        }

        async fn logout(&self, _: &str, _: &str) -> Result<(), AuthError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_result_of_replaced_rotation_is_discarded() {
        let upstream = Arc::new(EchoUpstream {
            calls: AtomicUsize::new(0),
            slow: Duration::from_millis(200),
            slow_token: "rt_0",
            fast: Duration::from_millis(400),
        });
        let coordinator = RefreshCoordinator::new(upstream.clone(), config());
        coordinator.install("s1", expired()).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.acquire_valid_access_token("s1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // New credentials arrive out of band while rt_0 is still rotating
        let replacement = Credentials {
            access_token: "access-x".to_string(),
            refresh_token: "rt_x".to_string(),
            ..expired()
        };
        coordinator.install("s1", replacement).await;
        assert_eq!(first.await.unwrap().unwrap(), "access-x");

        // A second cycle starts before the rt_0 rotation lands
        let second = coordinator.rotate("s1", "rt_x").await.unwrap();
        assert_eq!(second.access_token, "access-from-rt_x");
        assert_eq!(second.refresh_token, "rt_x-next");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = coordinator.credentials("s1").await.unwrap();
        assert_eq!(current.access_token, "access-from-rt_x");
        assert_eq!(coordinator.state("s1").await, SessionPhase::Active);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let upstream = ScriptedUpstream::new(Duration::ZERO, vec![]);
        let coordinator = RefreshCoordinator::new(upstream, config());

        assert_eq!(coordinator.state("nope").await, SessionPhase::Unknown);
        assert_eq!(
            coordinator.acquire_valid_access_token("nope").await,
            Err(AuthError::InvalidCredentials)
        );
        assert!(!coordinator.force_logout("nope", AuthError::SessionRevoked).await);
    }
}
