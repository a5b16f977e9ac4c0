//! Credential lifecycle against the D&B token endpoint.
//!
//! `Authenticator` performs the key/secret exchange; `TokenStore` caches the
//! resulting bearer token and refreshes it single-flight.

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backoff::{parse_retry_after, BackoffPolicy};
use crate::config::Config;
use crate::errors::{classify_transport, AppError};
use crate::models::Credential;

/// Token lifetime assumed when the provider omits `expiresIn`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 86_400;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "expiresIn", alias = "expires_in")]
    expires_in: Option<i64>,
}

/// Exchanges the API key and secret for a bearer token.
#[derive(Clone)]
pub struct Authenticator {
    client: Client,
    token_url: String,
    api_key: String,
    api_secret: String,
    backoff: BackoffPolicy,
}

impl Authenticator {
    /// Creates an authenticator with its own HTTP client.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                AppError::TransientNetworkError(format!("Failed to create auth client: {}", e))
            })?;
        Ok(Self::with_client(config, client))
    }

    /// Creates an authenticator sharing an existing HTTP client.
    pub fn with_client(config: &Config, client: Client) -> Self {
        Self {
            client,
            token_url: format!("{}/v3/token", config.api_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            backoff: BackoffPolicy::from_config(config),
        }
    }

    /// Fetches a fresh credential, retrying transient failures.
    ///
    /// Rejected credentials fail immediately. Once the retry budget is spent
    /// on transient failures the last cause is surfaced as an `AuthError`.
    pub async fn authenticate(&self) -> Result<Credential, AppError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_token().await {
                Ok(credential) => {
                    tracing::info!(
                        "Obtained D&B access token (expires at {})",
                        credential.expires_at
                    );
                    return Ok(credential);
                }
                Err(err) if self.backoff.should_retry(&err, attempt) => {
                    let delay = self.backoff.retry_delay(&err, attempt);
                    tracing::warn!(
                        "Token request failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt,
                        self.backoff.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    tracing::error!("Token endpoint unavailable after {} attempts: {}", attempt, err);
                    return Err(AppError::AuthError(format!(
                        "token endpoint unavailable after {} attempts: {}",
                        attempt, err
                    )));
                }
                Err(err) => {
                    tracing::error!("Authentication failed. Check your API credentials: {}", err);
                    return Err(err);
                }
            }
        }
    }

    async fn request_token(&self) -> Result<Credential, AppError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded { retry_after },
                s if s.is_server_error() => AppError::TransientNetworkError(format!(
                    "token endpoint returned {}: {}",
                    s, error_text
                )),
                s => AppError::AuthError(format!(
                    "token endpoint returned {}: {}",
                    s, error_text
                )),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            AppError::AuthError(format!("Failed to parse token response: {}", e))
        })?;

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::AuthError("token response missing access_token".to_string()))?;
        let ttl = body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(0);

        Ok(Credential {
            token,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        })
    }
}

#[derive(Default)]
struct TokenSlot {
    credential: Option<Credential>,
    last_failure: Option<AppError>,
}

/// Owns the live bearer credential.
///
/// Refresh is single-flight: the caller holding the lock performs the
/// network exchange, callers queued behind it receive its outcome.
pub struct TokenStore {
    authenticator: Authenticator,
    safety_margin: Duration,
    slot: Mutex<TokenSlot>,
    refreshes: AtomicU64,
}

impl TokenStore {
    pub fn new(authenticator: Authenticator, safety_margin: Duration) -> Self {
        Self {
            authenticator,
            safety_margin,
            slot: Mutex::new(TokenSlot::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Returns a credential valid for at least the safety margin from now.
    ///
    /// Callers that queued behind a refresh get its credential even when the
    /// provider granted less than the margin.
    pub async fn get_valid_credential(&self) -> Result<Credential, AppError> {
        let seen = self.refreshes.load(Ordering::Acquire);
        let mut slot = self.slot.lock().await;

        if let Some(credential) = slot
            .credential
            .as_ref()
            .filter(|c| c.is_valid_at(Utc::now(), self.safety_margin))
        {
            return Ok(credential.clone());
        }

        // A refresh finished while we were queued: share its outcome. A token
        // shorter-lived than the margin is still handed out until it expires.
        if self.refreshes.load(Ordering::Acquire) != seen {
            if let Some(failure) = &slot.last_failure {
                return Err(failure.clone());
            }
            if let Some(credential) = slot
                .credential
                .as_ref()
                .filter(|c| c.expires_at > Utc::now())
            {
                return Ok(credential.clone());
            }
        }

        tracing::debug!("Refreshing D&B access token");
        let outcome = self.authenticator.authenticate().await;
        self.refreshes.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(credential) => {
                slot.credential = Some(credential.clone());
                slot.last_failure = None;
                Ok(credential)
            }
            Err(err) => {
                slot.credential = None;
                slot.last_failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Number of completed refresh exchanges, successful or not.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }
}
