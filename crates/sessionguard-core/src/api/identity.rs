//! Client for the identity service's token and refresh endpoints.

use std::fmt;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ApiError;
use crate::auth::CredentialPair;

/// What the user types into the login prompt.
#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub identifier: String,
    pub secret: String,
}

impl LoginCredentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Result of a refresh call. The server may or may not rotate the refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// The external identity service.
///
/// Boxed futures keep the trait object-safe so a `SessionManager` can hold
/// `Arc<dyn IdentityProvider>` and hand it to a spawned refresh task.
pub trait IdentityProvider: Send + Sync {
    /// Exchange login credentials for a full credential pair.
    fn authenticate<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> BoxFuture<'a, Result<CredentialPair, ApiError>>;

    /// Exchange a refresh token for a new access token.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>>;
}

/// `IdentityProvider` over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpIdentityClient {
    client: Client,
    token_url: String,
    refresh_url: String,
}

impl HttpIdentityClient {
    /// `client` should be the same one the API pipeline uses, so refresh calls
    /// share its timeout policy.
    pub fn new(client: Client, token_url: impl Into<String>, refresh_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            refresh_url: refresh_url.into(),
        }
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<TokenGrant, ApiError> {
        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(url = url, status = %status, "Identity service rejected request");
            return Err(ApiError::from_status(status, &body));
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))
    }

    async fn authenticate_inner(&self, credentials: &LoginCredentials) -> Result<CredentialPair, ApiError> {
        let grant = self.post_json(&self.token_url, credentials).await?;
        let refresh_token = grant
            .refresh_token
            .ok_or_else(|| ApiError::InvalidResponse("Token response has no refreshToken".to_string()))?;

        Ok(CredentialPair {
            access_token: grant.access_token,
            refresh_token,
        })
    }
}

impl IdentityProvider for HttpIdentityClient {
    fn authenticate<'a>(
        &'a self,
        credentials: &'a LoginCredentials,
    ) -> BoxFuture<'a, Result<CredentialPair, ApiError>> {
        self.authenticate_inner(credentials).boxed()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, ApiError>> {
        async move {
            self.post_json(&self.refresh_url, &RefreshRequest { refresh_token })
                .await
        }
        .boxed()
    }
}
