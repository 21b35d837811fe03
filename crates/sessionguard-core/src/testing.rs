//! Helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::api::{ApiError, IdentityProvider, LoginCredentials, TokenGrant};
use crate::auth::{CredentialPair, StoredSession};

static TOKEN_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// Unsigned JWT-shaped token. Every call yields a distinct token.
pub(crate) fn token_expiring_at(subject: &str, role: Option<&str>, expires_at: i64) -> String {
    let serial = TOKEN_SERIAL.fetch_add(1, Ordering::Relaxed);
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({"sub": subject, "role": role, "exp": expires_at, "jti": serial}).to_string(),
    );
    format!("{}.{}.signature", header, payload)
}

/// Session whose access token expires `ttl_secs` from now (negative = already expired).
pub(crate) fn session_for(subject: &str, refresh_token: &str, ttl_secs: i64) -> StoredSession {
    StoredSession::new(CredentialPair {
        access_token: token_expiring_at(subject, Some("member"), Utc::now().timestamp() + ttl_secs),
        refresh_token: refresh_token.to_string(),
    })
    .expect("test token should decode")
}

/// Poll `condition` until it holds, yielding to other tasks in between.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

/// In-process identity service with call counting and an optional gate that
/// holds refresh calls until the test releases them.
pub(crate) struct FakeIdentity {
    refresh_calls: AtomicUsize,
    gate: Option<Semaphore>,
    reject_refresh: bool,
    rotated_refresh: Option<String>,
    issued_access: Option<String>,
}

impl FakeIdentity {
    pub const PASSWORD: &'static str = "correct-password";

    pub fn refreshing() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            gate: None,
            reject_refresh: false,
            rotated_refresh: None,
            issued_access: None,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_refresh: true,
            ..Self::refreshing()
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn rotating(mut self, refresh_token: &str) -> Self {
        self.rotated_refresh = Some(refresh_token.to_string());
        self
    }

    /// Always hand out this access token on refresh.
    pub fn issuing(mut self, access_token: &str) -> Self {
        self.issued_access = Some(access_token.to_string());
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn fresh_access_token() -> String {
        token_expiring_at("alice", Some("member"), Utc::now().timestamp() + 3600)
    }
}

impl IdentityProvider for FakeIdentity {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> BoxFuture<'a, Result<CredentialPair, ApiError>> {
        async move {
            if credentials.secret != Self::PASSWORD {
                return Err(ApiError::Unauthorized);
            }
            Ok(CredentialPair {
                access_token: token_expiring_at(
                    &credentials.identifier,
                    Some("member"),
                    Utc::now().timestamp() + 3600,
                ),
                refresh_token: format!("refresh-{}", credentials.identifier),
            })
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.expect("gate closed");
            }
            if self.reject_refresh {
                return Err(ApiError::Unauthorized);
            }
            Ok(TokenGrant {
                access_token: self
                    .issued_access
                    .clone()
                    .unwrap_or_else(Self::fresh_access_token),
                refresh_token: self.rotated_refresh.clone(),
            })
        }
        .boxed()
    }
}
