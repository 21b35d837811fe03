use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::codec::{DecodedClaims, TokenCodec, UserClaims};
use super::refresh::RefreshCoordinator;
use super::store::{StoredSession, TokenStore};
use super::SessionError;
use crate::api::{build_http_client, ApiClient, HttpIdentityClient, IdentityProvider, LoginCredentials};
use crate::config::SessionConfig;

/// Buffer size for the session event channel.
/// Events are rare (login, refresh, logout), 16 leaves plenty of headroom for slow observers.
const EVENT_CHANNEL_SIZE: usize = 16;

/// Session lifecycle notifications, e.g. for sending the UI back to a login screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    LoggedOut,
    /// The session ended without the user asking (refresh failed or the server kept refusing it)
    Expired,
}

/// Result of a login attempt. Login never returns `Err`; callers branch on this.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(UserClaims),
    Rejected(SessionError),
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoginOutcome::Authenticated(_))
    }

    pub fn user(&self) -> Option<&UserClaims> {
        match self {
            LoginOutcome::Authenticated(user) => Some(user),
            LoginOutcome::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            LoginOutcome::Authenticated(_) => None,
            LoginOutcome::Rejected(e) => Some(e),
        }
    }
}

/// The application's entry point to the session: login, logout, status, tokens
/// and the authenticated API client.
pub struct SessionManager {
    store: Arc<dyn TokenStore>,
    identity: Arc<dyn IdentityProvider>,
    coordinator: RefreshCoordinator,
    api: ApiClient,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        store: Arc<dyn TokenStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let client = build_http_client(config)?;
        Ok(Self::with_http_client(config, store, identity, client))
    }

    /// Wire everything from configuration: HTTP identity client and the configured store.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let client = build_http_client(config)?;
        let identity = Arc::new(HttpIdentityClient::new(
            client.clone(),
            config.token_url.clone(),
            config.refresh_url.clone(),
        ));
        let store = config.open_store()?;
        Ok(Self::with_http_client(config, store, identity, client))
    }

    fn with_http_client(
        config: &SessionConfig,
        store: Arc<dyn TokenStore>,
        identity: Arc<dyn IdentityProvider>,
        client: reqwest::Client,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let coordinator = RefreshCoordinator::new(store.clone(), identity.clone(), config, events.clone());
        let api = ApiClient::new(client, config, coordinator.clone());
        Self {
            store,
            identity,
            coordinator,
            api,
            events,
        }
    }

    /// Log in with the identity service and persist the new session.
    pub async fn login(&self, credentials: &LoginCredentials) -> LoginOutcome {
        match self.try_login(credentials).await {
            Ok(user) => {
                info!(subject = %user.subject, "Logged in");
                let _ = self.events.send(SessionEvent::LoggedIn);
                LoginOutcome::Authenticated(user)
            }
            Err(e) => {
                warn!(identifier = %credentials.identifier, error = %e, "Login failed");
                LoginOutcome::Rejected(e)
            }
        }
    }

    async fn try_login(&self, credentials: &LoginCredentials) -> Result<UserClaims, SessionError> {
        let pair = self.identity.authenticate(credentials).await.map_err(|e| {
            if e.is_credential_rejection() {
                SessionError::InvalidCredentials
            } else {
                SessionError::Api(e)
            }
        })?;

        let session = StoredSession::new(pair)?;
        self.coordinator.install(&session)?;
        Ok(session.user)
    }

    /// End the session. Safe to call when already logged out.
    pub fn logout(&self) -> Result<(), SessionError> {
        if self.coordinator.clear()? {
            info!("Logged out");
            let _ = self.events.send(SessionEvent::LoggedOut);
        } else {
            debug!("Logout with no active session");
        }
        Ok(())
    }

    /// True when a session is stored and its refresh token can still be used.
    /// An expired access token does not matter here, a refresh will replace it.
    pub fn is_authenticated(&self) -> bool {
        match self.load() {
            Some(session) => match TokenCodec::decode(&session.refresh_token) {
                Ok(claims) => !TokenCodec::is_expired(&claims, 0),
                // Opaque refresh token: only the server can judge it
                Err(_) => true,
            },
            None => false,
        }
    }

    /// The logged-in user, if any.
    pub fn user(&self) -> Option<UserClaims> {
        let session = self.load()?;
        match TokenCodec::decode(&session.access_token) {
            Ok(claims) => Some(claims.user()),
            Err(_) => Some(session.user),
        }
    }

    /// Claims of the stored access token as-is (possibly expired), without refreshing.
    pub fn access_claims(&self) -> Option<DecodedClaims> {
        TokenCodec::decode(&self.load()?.access_token).ok()
    }

    /// A valid access token, refreshed first if it is about to expire.
    pub async fn access_token(&self) -> Result<String, SessionError> {
        self.coordinator.ensure_valid_token().await
    }

    /// Authenticated API client sharing this session.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn load(&self) -> Option<StoredSession> {
        match self.store.load() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to load session");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::auth::MemoryTokenStore;
    use crate::testing::{session_for, token_expiring_at, wait_until, FakeIdentity};

    fn manager(identity: FakeIdentity) -> (SessionManager, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let manager = SessionManager::new(&SessionConfig::default(), store.clone(), Arc::new(identity))
            .expect("manager should build");
        (manager, store)
    }

    #[tokio::test]
    async fn test_login_success_stores_session() {
        let (manager, store) = manager(FakeIdentity::refreshing());
        let mut events = manager.subscribe();

        let outcome = manager
            .login(&LoginCredentials::new("alice", FakeIdentity::PASSWORD))
            .await;

        assert!(outcome.is_success());
        let user = outcome.user().expect("user present");
        assert_eq!(user.subject, "alice");
        assert_eq!(user.role.as_deref(), Some("member"));

        let stored = store.load().unwrap().expect("session persisted");
        assert_eq!(&stored.user, user);
        assert!(manager.is_authenticated());
        assert_eq!(manager.user().as_ref(), Some(user));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedIn);
    }

    #[tokio::test]
    async fn test_login_failure_stores_nothing() {
        let (manager, store) = manager(FakeIdentity::refreshing());

        let outcome = manager.login(&LoginCredentials::new("alice", "wrong")).await;

        assert!(!outcome.is_success());
        assert!(matches!(outcome.error(), Some(SessionError::InvalidCredentials)));
        assert!(store.load().unwrap().is_none());
        assert!(!manager.is_authenticated());
        assert!(manager.user().is_none());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (manager, store) = manager(FakeIdentity::refreshing());
        store.save(&session_for("alice", "r1", 3600)).unwrap();
        let mut events = manager.subscribe();

        manager.logout().unwrap();
        manager.logout().unwrap();

        assert!(store.load().unwrap().is_none());
        assert!(manager.user().is_none());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        // Second logout announced nothing
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_authenticated_with_expired_access_token() {
        let (manager, store) = manager(FakeIdentity::refreshing());
        store.save(&session_for("alice", "opaque-refresh", -60)).unwrap();

        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_not_authenticated_with_expired_refresh_token() {
        let (manager, store) = manager(FakeIdentity::refreshing());
        let expired_refresh = token_expiring_at("alice", None, Utc::now().timestamp() - 1);
        store.save(&session_for("alice", &expired_refresh, 3600)).unwrap();

        assert!(!manager.is_authenticated());

        let live_refresh = token_expiring_at("alice", None, Utc::now().timestamp() + 86_400);
        store.save(&session_for("alice", &live_refresh, -60)).unwrap();
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_user_falls_back_to_snapshot() {
        let (manager, store) = manager(FakeIdentity::refreshing());
        let mut session = session_for("alice", "r1", 3600);
        session.access_token = "unreadable".to_string();
        store.save(&session).unwrap();

        assert_eq!(manager.user().unwrap().subject, "alice");
    }

    #[tokio::test]
    async fn test_access_token_refreshes_expired_session() {
        let identity = FakeIdentity::refreshing();
        let (manager, store) = manager(identity);
        let stale = session_for("alice", "r1", -60);
        store.save(&stale).unwrap();

        let token = manager.access_token().await.unwrap();

        assert_ne!(token, stale.access_token);
        assert!(!TokenCodec::token_expired(&token, 10));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_stays_logged_out() {
        let store = Arc::new(MemoryTokenStore::new());
        let identity = Arc::new(FakeIdentity::refreshing().gated());
        let manager = Arc::new(
            SessionManager::new(&SessionConfig::default(), store.clone(), identity.clone()).unwrap(),
        );
        store.save(&session_for("alice", "r1", -60)).unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.access_token().await })
        };
        wait_until(|| manager.coordinator.pending_waiters() == 1).await;

        manager.logout().unwrap();
        identity.release();

        assert!(matches!(waiter.await.unwrap(), Err(SessionError::SessionExpired)));
        assert!(store.load().unwrap().is_none());
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_during_refresh_is_kept() {
        let store = Arc::new(MemoryTokenStore::new());
        let identity = Arc::new(FakeIdentity::refreshing().gated());
        let manager = Arc::new(
            SessionManager::new(&SessionConfig::default(), store.clone(), identity.clone()).unwrap(),
        );
        store.save(&session_for("alice", "r1", -60)).unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.access_token().await })
        };
        wait_until(|| manager.coordinator.pending_waiters() == 1).await;

        let outcome = manager
            .login(&LoginCredentials::new("bob", FakeIdentity::PASSWORD))
            .await;
        identity.release();

        let token = waiter.await.unwrap().unwrap();
        let stored = store.load().unwrap().unwrap();
        assert!(outcome.is_success());
        assert_eq!(stored.user.subject, "bob");
        assert_eq!(token, stored.access_token);
    }

    #[tokio::test]
    async fn test_access_token_without_session() {
        let (manager, _store) = manager(FakeIdentity::refreshing());
        let err = manager.access_token().await.unwrap_err();
        assert!(err.requires_login());
    }
}
