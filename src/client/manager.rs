use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::coordinator::{RefreshCoordinator, SessionPhase};
use super::upstream::{AuthUpstream, Credentials};
use crate::auth::AuthError;

/// Client-side view of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Anonymous,
    Active,
    LoggedOut(AuthError),
    Refreshing,
}

/// Owns the current session of one client and drives it through the
/// refresh gate.
pub struct SessionManager {
    coordinator: RefreshCoordinator,
    current: RwLock<Option<String>>,
    upstream: Arc<dyn AuthUpstream>,
}

impl SessionManager {
    pub fn new(upstream: Arc<dyn AuthUpstream>, coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            current: RwLock::new(None),
            upstream,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Resume from persisted credentials, if any.
    ///
    /// Credentials whose access token has lapsed are rotated right away so
    /// that a dead session is discovered before the first real request.
    pub async fn initialize(&self, persisted: Option<Credentials>) -> ClientState {
        let Some(credentials) = persisted else {
            return ClientState::Anonymous;
        };
        let session = credentials.session_id.clone();
        let lapsed = credentials.access_expires_at <= Utc::now();

        self.coordinator.install(&session, credentials).await;
        *self.current.write().await = Some(session.clone());

        if lapsed {
            if let Err(e) = self.coordinator.acquire_valid_access_token(&session).await {
                warn!(session_id = %session, error = %e, "Could not resume persisted session");
            }
        }
        self.state().await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Credentials, AuthError> {
        let pair = self.upstream.login(email, password).await?;
        let credentials = Credentials::from_pair(pair, Utc::now());
        let session = credentials.session_id.clone();

        let previous = self.current.write().await.replace(session.clone());
        if let Some(previous) = previous.filter(|p| p != &session) {
            self.coordinator.forget(&previous).await;
        }
        self.coordinator.install(&session, credentials.clone()).await;

        info!(session_id = %session, "Logged in");
        Ok(credentials)
    }

    async fn current_session(&self) -> Result<String, AuthError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(AuthError::InvalidCredentials)
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        let session = self.current_session().await?;
        self.coordinator.acquire_valid_access_token(&session).await
    }

    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String, AuthError> {
        let session = self.current_session().await?;
        self.coordinator
            .refresh_after_rejection(&session, rejected)
            .await
    }

    pub async fn force_logout(&self, reason: AuthError) -> bool {
        match self.current.read().await.as_deref() {
            Some(session) => self.coordinator.force_logout(session, reason).await,
            None => false,
        }
    }

    /// Log out on the server (best effort) and locally.
    pub async fn teardown(&self) {
        let Some(session) = self.current.read().await.clone() else {
            return;
        };
        if let Some(credentials) = self.coordinator.credentials(&session).await {
            if let Err(e) = self
                .upstream
                .logout(&credentials.access_token, &credentials.refresh_token)
                .await
            {
                warn!(session_id = %session, error = %e, "Server-side logout failed");
            }
        }
        self.coordinator
            .force_logout(&session, AuthError::SessionRevoked)
            .await;
    }

    /// Credentials worth persisting, if the session is still usable.
    pub async fn snapshot(&self) -> Option<Credentials> {
        let session = self.current.read().await.clone()?;
        self.coordinator.credentials(&session).await
    }

    pub async fn state(&self) -> ClientState {
        let Some(session) = self.current.read().await.clone() else {
            return ClientState::Anonymous;
        };
        match self.coordinator.state(&session).await {
            SessionPhase::Active => ClientState::Active,
            SessionPhase::LoggedOut(reason) => ClientState::LoggedOut(reason),
            SessionPhase::Refreshing { .. } => ClientState::Refreshing,
            SessionPhase::Unknown => ClientState::Anonymous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::coordinator::RefreshConfig;
    use crate::client::upstream::LocalUpstream;
    use crate::storage::models::Role;
    use crate::testutil::{seed_user, setup_db, test_store, TEST_PASSWORD};

    fn manager(upstream: Arc<dyn AuthUpstream>) -> SessionManager {
        let coordinator = RefreshCoordinator::new(Arc::clone(&upstream), RefreshConfig::default());
        SessionManager::new(upstream, coordinator)
    }

    #[tokio::test]
    async fn test_login_and_teardown() {
        let (db, _temp) = setup_db();
        let store = Arc::new(test_store(db));
        let user = seed_user(&store, "agent@example.com", Role::Agent, Some("org-1"));
        let sessions = manager(Arc::new(LocalUpstream::new(Arc::clone(&store))));

        assert_eq!(sessions.state().await, ClientState::Anonymous);
        assert_eq!(sessions.access_token().await, Err(AuthError::InvalidCredentials));

        let credentials = sessions.login(&user.email, TEST_PASSWORD).await.unwrap();
        assert_eq!(sessions.state().await, ClientState::Active);
        assert_eq!(sessions.access_token().await.unwrap(), credentials.access_token);

        sessions.teardown().await;
        assert_eq!(
            sessions.state().await,
            ClientState::LoggedOut(AuthError::SessionRevoked)
        );
        assert!(sessions.snapshot().await.is_none());

        let session = store
            .database()
            .get_session(&credentials.session_id)
            .unwrap()
            .unwrap();
        assert!(session.is_revoked());
    }

    #[tokio::test]
    async fn test_initialize_rotates_lapsed_credentials() {
        let (db, _temp) = setup_db();
        let store = Arc::new(test_store(db));
        let user = seed_user(&store, "agent@example.com", Role::Agent, Some("org-1"));
        let upstream: Arc<dyn AuthUpstream> = Arc::new(LocalUpstream::new(Arc::clone(&store)));

        let first = manager(Arc::clone(&upstream));
        let mut persisted = first.login(&user.email, TEST_PASSWORD).await.unwrap();
        persisted.access_expires_at = Utc::now() - chrono::Duration::seconds(5);

        let resumed = manager(upstream);
        assert_eq!(resumed.initialize(Some(persisted.clone())).await, ClientState::Active);
        let current = resumed.snapshot().await.unwrap();
        assert_ne!(current.refresh_token, persisted.refresh_token);
        assert_eq!(resumed.coordinator().upstream_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_with_revoked_session() {
        let (db, _temp) = setup_db();
        let store = Arc::new(test_store(db));
        let user = seed_user(&store, "agent@example.com", Role::Agent, Some("org-1"));
        let upstream: Arc<dyn AuthUpstream> = Arc::new(LocalUpstream::new(Arc::clone(&store)));

        let first = manager(Arc::clone(&upstream));
        let mut persisted = first.login(&user.email, TEST_PASSWORD).await.unwrap();
        first.teardown().await;
        persisted.access_expires_at = Utc::now() - chrono::Duration::seconds(5);

        let resumed = manager(upstream);
        assert_eq!(
            resumed.initialize(Some(persisted)).await,
            ClientState::LoggedOut(AuthError::SessionRevoked)
        );
    }
}
