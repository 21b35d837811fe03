//! Single-flight access token refresh.
//!
//! The coordinator is either `Idle` or `Refreshing`. The first caller that
//! finds an expired access token flips the state to `Refreshing`, spawns the one
//! refresh call and waits like everybody else; later callers join the FIFO
//! waiter queue. When the call finishes, the outcome is persisted, the state
//! goes back to `Idle` and every waiter is resolved in the order it arrived.
//!
//! The refresh runs on its own task so a caller giving up (dropping its
//! future) never cancels a refresh other callers are waiting on.
//!
//! Every store write (login, logout, refresh result, expiry) goes through the
//! coordinator's write lock, so checking which session a refresh belongs to and
//! replacing it happen as one step.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::codec::TokenCodec;
use super::session::SessionEvent;
use super::store::{CredentialPair, StoredSession, TokenStore};
use super::SessionError;
use crate::api::{IdentityProvider, TokenGrant};
use crate::config::SessionConfig;

/// What a waiter is told when the in-flight refresh finishes.
#[derive(Debug, Clone)]
enum RefreshOutcome {
    Token(String),
    Expired,
}

enum RefreshState {
    Idle,
    Refreshing {
        waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
    },
}

struct Inner {
    store: Arc<dyn TokenStore>,
    identity: Arc<dyn IdentityProvider>,
    events: broadcast::Sender<SessionEvent>,
    skew_seconds: i64,
    rotate_refresh_tokens: bool,
    state: Mutex<RefreshState>,
    /// Serializes store writes. Never taken while `state` is held.
    writes: Mutex<()>,
}

/// Hands out valid access tokens, refreshing at most once at a time.
/// Clone is cheap - all clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        identity: Arc<dyn IdentityProvider>,
        config: &SessionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                identity,
                events,
                skew_seconds: config.skew_seconds,
                rotate_refresh_tokens: config.rotate_refresh_tokens,
                state: Mutex::new(RefreshState::Idle),
                writes: Mutex::new(()),
            }),
        }
    }

    /// Return a currently valid access token, refreshing it first if needed.
    ///
    /// Fails with `Unauthenticated` when there is no session and with
    /// `SessionExpired` when the refresh this call waited on failed.
    pub async fn ensure_valid_token(&self) -> Result<String, SessionError> {
        let session = self.inner.load()?.ok_or(SessionError::Unauthenticated)?;
        if !TokenCodec::token_expired(&session.access_token, self.inner.skew_seconds) {
            return Ok(session.access_token);
        }
        self.join_refresh(None).await
    }

    /// Get a replacement for an access token the server just refused.
    ///
    /// The token may look valid locally (server clock skew, revocation), so
    /// expiry is not consulted: if it is still the stored token a refresh is
    /// started or joined; if someone already replaced it, the stored token is returned.
    pub async fn refresh_rejected(&self, rejected_token: &str) -> Result<String, SessionError> {
        self.join_refresh(Some(rejected_token)).await
    }

    /// Persist a freshly issued session, replacing whatever was stored.
    /// A refresh still in flight for the old session will not overwrite it.
    pub fn install(&self, session: &StoredSession) -> Result<(), SessionError> {
        let _writes = self.inner.lock_writes();
        self.inner.store.save(session).map_err(SessionError::storage)
    }

    /// Remove the stored session. Returns whether one was stored.
    pub fn clear(&self) -> Result<bool, SessionError> {
        let _writes = self.inner.lock_writes();
        let had_session = matches!(self.inner.store.load(), Ok(Some(_)));
        // Clear even when the record is unreadable
        self.inner.store.clear().map_err(SessionError::storage)?;
        Ok(had_session)
    }

    /// End the session the server refused `rejected_token` for: clear the
    /// store and tell observers. A session that has been replaced since
    /// (new login, another refresh) is left alone.
    pub fn expire(&self, rejected_token: &str) {
        {
            let _writes = self.inner.lock_writes();
            match self.inner.store.load() {
                Ok(Some(current)) if current.access_token != rejected_token => {
                    debug!("Session replaced since the rejected request, not expiring");
                    return;
                }
                Ok(None) => return,
                _ => {}
            }
            info!("Session expired, clearing stored credentials");
            if let Err(e) = self.inner.store.clear() {
                error!(error = %e, "Failed to clear session store");
            }
        }
        let _ = self.inner.events.send(SessionEvent::Expired);
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Number of callers waiting on the in-flight refresh
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }

    async fn join_refresh(&self, rejected_token: Option<&str>) -> Result<String, SessionError> {
        let receiver = {
            let mut state = self.inner.lock_state();
            let (sender, receiver) = oneshot::channel();

            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push_back(sender);
                    debug!(waiters = waiters.len(), "Joined in-flight token refresh");
                }
                RefreshState::Idle => {
                    // A refresh may have finished between the caller's check and this lock
                    let session = self.inner.load()?.ok_or(SessionError::Unauthenticated)?;
                    let expired = TokenCodec::token_expired(&session.access_token, self.inner.skew_seconds);
                    let needs_refresh = match rejected_token {
                        Some(token) => expired || session.access_token == token,
                        None => expired,
                    };
                    if !needs_refresh {
                        return Ok(session.access_token);
                    }

                    let mut waiters = VecDeque::new();
                    waiters.push_back(sender);
                    *state = RefreshState::Refreshing { waiters };

                    let inner = self.inner.clone();
                    tokio::spawn(async move { inner.run_refresh(session.refresh_token).await });
                }
            }
            receiver
        };

        match receiver.await {
            Ok(RefreshOutcome::Token(token)) => Ok(token),
            Ok(RefreshOutcome::Expired) | Err(_) => Err(SessionError::SessionExpired),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Option<StoredSession>, SessionError> {
        self.store.load().map_err(SessionError::storage)
    }

    async fn run_refresh(&self, refresh_token: String) {
        debug!("Refreshing access token");
        let result = AssertUnwindSafe(self.identity.refresh(&refresh_token))
            .catch_unwind()
            .await;

        let (outcome, event) = {
            let _writes = self.lock_writes();
            match result {
                Ok(Ok(grant)) => self.apply_grant(&refresh_token, grant),
                Ok(Err(e)) => {
                    warn!(error = %e, "Token refresh failed");
                    self.discard_session(&refresh_token)
                }
                Err(_) => {
                    error!("Token refresh panicked");
                    self.discard_session(&refresh_token)
                }
            }
        };

        let resolved = {
            let mut state = self.lock_state();
            let waiters = match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => VecDeque::new(),
            };
            let resolved = waiters.len();
            for waiter in waiters {
                // A waiter that gave up has dropped its receiver
                let _ = waiter.send(outcome.clone());
            }
            resolved
        };

        match outcome {
            RefreshOutcome::Token(_) => info!(waiters = resolved, "Access token refreshed"),
            RefreshOutcome::Expired => warn!(waiters = resolved, "Session expired during refresh"),
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Persist a successful refresh, unless the session it belonged to is gone.
    /// Caller holds the write lock.
    fn apply_grant(&self, used_refresh_token: &str, grant: TokenGrant) -> (RefreshOutcome, Option<SessionEvent>) {
        if let Some(outcome) = self.superseded(used_refresh_token) {
            return (outcome, None);
        }

        let refresh_token = match grant.refresh_token {
            Some(rotated) if self.rotate_refresh_tokens => rotated,
            _ => used_refresh_token.to_string(),
        };
        let access_token = grant.access_token.clone();

        let session = match StoredSession::new(CredentialPair {
            access_token: grant.access_token,
            refresh_token,
        }) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Refresh returned an unusable access token");
                return self.discard_session(used_refresh_token);
            }
        };

        if let Err(e) = self.store.save(&session) {
            error!(error = %e, "Failed to persist refreshed session");
            return self.discard_session(used_refresh_token);
        }

        (RefreshOutcome::Token(access_token), Some(SessionEvent::Refreshed))
    }

    /// Clear the session a failed refresh belonged to. Caller holds the write lock.
    fn discard_session(&self, used_refresh_token: &str) -> (RefreshOutcome, Option<SessionEvent>) {
        if let Some(outcome) = self.superseded(used_refresh_token) {
            return (outcome, None);
        }
        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear session store");
        }
        (RefreshOutcome::Expired, Some(SessionEvent::Expired))
    }

    /// If the stored session no longer uses `used_refresh_token` (a login or
    /// logout happened mid-refresh), the refresh result is stale: hand waiters
    /// whatever is stored now instead.
    fn superseded(&self, used_refresh_token: &str) -> Option<RefreshOutcome> {
        match self.store.load() {
            Ok(Some(current)) if current.refresh_token == used_refresh_token => None,
            Ok(Some(current)) => {
                debug!("Session replaced during refresh, discarding refresh result");
                Some(RefreshOutcome::Token(current.access_token))
            }
            Ok(None) => {
                debug!("Session cleared during refresh, discarding refresh result");
                Some(RefreshOutcome::Expired)
            }
            // Unreadable store: fall through and overwrite/clear it
            Err(e) => {
                warn!(error = %e, "Failed to read session store during refresh");
                None
            }
        }
    }
}
