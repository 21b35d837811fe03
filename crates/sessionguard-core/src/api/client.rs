//! Authenticated API client.
//!
//! Every call goes out with a valid bearer token from the `RefreshCoordinator`
//! (waiting for an in-flight refresh if there is one). A 401 gets exactly one
//! replay with a refreshed token; a second 401 ends the session.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{RefreshCoordinator, SessionError};
use crate::config::SessionConfig;

/// Build the HTTP client shared by API and identity calls.
pub fn build_http_client(config: &SessionConfig) -> Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;
    Ok(client)
}

/// API client bound to a session.
/// Clone is cheap - reqwest::Client and the coordinator are both Arc-backed.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    coordinator: RefreshCoordinator,
    max_rate_limit_retries: u32,
    initial_backoff_ms: u64,
}

impl ApiClient {
    pub fn new(client: Client, config: &SessionConfig, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            coordinator,
            max_rate_limit_retries: config.max_rate_limit_retries,
            initial_backoff_ms: config.initial_backoff_ms,
        }
    }

    /// Run `call` with a valid access token.
    ///
    /// If the server answers `Unauthorized`, the token is refreshed (or the
    /// refresh another caller started is awaited) and `call` is replayed once.
    /// A second `Unauthorized` expires the session.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, SessionError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.coordinator.ensure_valid_token().await?;
        match call(token.clone()).await {
            Err(ApiError::Unauthorized) => {}
            other => return other.map_err(SessionError::from),
        }

        debug!("Request unauthorized, retrying once with a refreshed token");
        let token = self.coordinator.refresh_rejected(&token).await?;
        match call(token.clone()).await {
            Err(ApiError::Unauthorized) => {
                warn!("Request unauthorized again after refresh");
                self.coordinator.expire(&token);
                Err(SessionError::SessionExpired)
            }
            other => other.map_err(SessionError::from),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        self.request_json(Method::GET, path, None::<&()>).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, SessionError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_json(Method::POST, path, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, SessionError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_json(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), SessionError> {
        let url = self.url(path);
        let url = url.as_str();
        self.execute(move |token| async move {
            self.send_with_backoff(Method::DELETE, url, None::<&()>, &token)
                .await
                .map(|_| ())
        })
        .await
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn request_json<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, SessionError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let url = url.as_str();
        self.execute(move |token| {
            let method = method.clone();
            async move {
                let response = self.send_with_backoff(method, url, body, &token).await?;
                let text = response.text().await?;
                let parsed: T = serde_json::from_str(&text).map_err(|e| {
                    ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
                })?;
                Ok::<T, ApiError>(parsed)
            }
        })
        .await
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            // Rate limited - signal to retry
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send_with_backoff<B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        token: &str,
    ) -> Result<Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let mut retries = 0;
        let mut backoff_ms = self.initial_backoff_ms;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .bearer_auth(token)
                .header(header::ACCEPT, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > self.max_rate_limit_retries {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }
}
