//! Company matching against the cleanseMatch endpoint.
//!
//! A `Matcher` owns the HTTP client, the shared token store and rate limiter,
//! and optionally the staging store every provider response is written to
//! before it is reported.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use moka::future::Cache;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::TokenStore;
use crate::backoff::{parse_retry_after, BackoffPolicy};
use crate::config::Config;
use crate::errors::{classify_transport, AppError};
use crate::extract::{candidates_from_body, is_no_match_body};
use crate::models::{CompanyQuery, MatchResult, StagedPayload};
use crate::rate_limiter::RateLimiter;
use crate::response_store::ResponseStore;

const MATCH_PATH: &str = "/v1/match/cleanseMatch";
const RESULT_TTL: Duration = Duration::from_secs(600);
const RESULT_CAPACITY: u64 = 10_000;

/// Failure of a single query. Never aborts the rest of a batch.
#[derive(Debug, Clone)]
pub struct MatchError {
    /// The query as submitted by the caller.
    pub query: CompanyQuery,
    pub cause: AppError,
    /// Network attempts spent; 0 when rejected pre-flight or cancelled.
    pub attempts: u32,
    /// Absent when the query never got past validation.
    pub request_id: Option<String>,
}

impl MatchError {
    pub fn cancelled(query: CompanyQuery) -> Self {
        Self {
            query,
            cause: AppError::Cancelled,
            attempts: 0,
            request_id: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause.root(), AppError::Cancelled)
    }
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "match for '{}' failed after {} attempt(s): {}",
            self.query.name, self.attempts, self.cause
        )
    }
}

impl std::error::Error for MatchError {}

/// Per-query outcomes of a batch, in input order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<Result<MatchResult, MatchError>>,
    /// Set when the batch was cancelled before every query completed.
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn matched(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    /// First query that failed on credentials, if any.
    pub fn auth_failure(&self) -> Option<&MatchError> {
        self.results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| matches!(e.cause.root(), AppError::AuthError(_)))
    }
}

pub struct Matcher {
    client: Client,
    match_url: String,
    tokens: Arc<TokenStore>,
    backoff: BackoffPolicy,
    limiter: Arc<RateLimiter>,
    store: Option<Arc<ResponseStore>>,
    stage_failures: bool,
    run_id: Uuid,
    results: Cache<String, MatchResult>,
}

impl Matcher {
    pub fn new(config: &Config, tokens: Arc<TokenStore>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                AppError::TransientNetworkError(format!("Failed to create match client: {}", e))
            })?;

        Ok(Self {
            client,
            match_url: format!("{}{}", config.api_url.trim_end_matches('/'), MATCH_PATH),
            tokens,
            backoff: BackoffPolicy::from_config(config),
            limiter: Arc::new(RateLimiter::per_second(config.requests_per_second)),
            store: None,
            stage_failures: config.stage_failures,
            run_id: Uuid::new_v4(),
            results: Cache::builder()
                .max_capacity(RESULT_CAPACITY)
                .time_to_live(RESULT_TTL)
                .build(),
        })
    }

    /// Stages every provider response in `store` before reporting it.
    pub fn with_store(mut self, store: Arc<ResponseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Matches one company.
    ///
    /// Identical concurrent queries share a single network exchange, and a
    /// successful result is reused for later identical queries.
    pub async fn match_one(&self, query: &CompanyQuery) -> Result<MatchResult, MatchError> {
        let normalized = query.normalized().map_err(|cause| {
            tracing::warn!("Rejected query '{}': {}", query.name, cause);
            MatchError {
                query: query.clone(),
                cause,
                attempts: 0,
                request_id: None,
            }
        })?;
        let request_id = normalized.request_id(&self.run_id);

        self.results
            .try_get_with(
                request_id.clone(),
                self.fetch(query, normalized, request_id),
            )
            .await
            .map_err(|shared| MatchError {
                query: query.clone(),
                ..(*shared).clone()
            })
    }

    async fn fetch(
        &self,
        original: &CompanyQuery,
        query: CompanyQuery,
        request_id: String,
    ) -> Result<MatchResult, MatchError> {
        let fail = |cause: AppError, attempts: u32| MatchError {
            query: original.clone(),
            cause,
            attempts,
            request_id: Some(request_id.clone()),
        };

        let mut attempt = 0;
        let (http_status, body) = loop {
            attempt += 1;
            match self.send(&query).await {
                Ok(response) => break response,
                Err(err) if self.backoff.should_retry(&err, attempt) => {
                    let delay = self.backoff.retry_delay(&err, attempt);
                    tracing::warn!(
                        "Match request for '{}' failed (attempt {}/{}): {}, retrying in {:?}",
                        query.name,
                        attempt,
                        self.backoff.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        "Match request for '{}' failed after {} attempt(s): {}",
                        query.name,
                        attempt,
                        err
                    );
                    self.stage_failure(&request_id, &query, &err, attempt).await;
                    return Err(fail(err, attempt));
                }
            }
        };

        if let Some(store) = &self.store {
            let payload = StagedPayload::Matched {
                http_status,
                body: body.clone(),
            };
            let staged = store
                .save(&request_id, &query, payload)
                .await
                .map_err(|e| fail(e, attempt))?;
            if !matches!(staged.raw_payload, StagedPayload::Matched { .. }) {
                let cause = AppError::StorageError(format!(
                    "response {} could not replace the staged record",
                    request_id
                ));
                return Err(fail(cause, attempt));
            }
        }

        let candidates = candidates_from_body(&body)
            .map_err(|e| fail(AppError::InvalidResponse(e.to_string()), attempt))?;

        tracing::info!(
            "Matched '{}': {} candidate(s) in {} attempt(s)",
            query.name,
            candidates.len(),
            attempt
        );

        Ok(MatchResult {
            query,
            candidates,
            request_id,
            timestamp: Utc::now(),
            attempts: attempt,
        })
    }

    /// One authenticated request. Returns the status and body of a usable
    /// answer, which includes the provider's 404 "no match" body.
    async fn send(&self, query: &CompanyQuery) -> Result<(u16, Value), AppError> {
        self.limiter.acquire().await;
        let credential = self.tokens.get_valid_credential().await?;

        let language = match query.country.as_deref() {
            Some("CN") => "zh-hans-CN",
            _ => "auto",
        };
        let mut params: Vec<(&str, &str)> =
            vec![("name", query.name.as_str()), ("inLanguage", language)];
        if let Some(country) = &query.country {
            params.push(("countryISOAlpha2Code", country.as_str()));
        }
        if let Some(address) = &query.address {
            params.push(("streetAddressLine1", address.as_str()));
        }

        let response = self
            .client
            .get(&self.match_url)
            .bearer_auth(&credential.token)
            .header(ACCEPT, "application/json")
            .query(&params)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            let body: Value = response.json().await.map_err(|e| {
                AppError::InvalidResponse(format!("Failed to parse match response: {}", e))
            })?;
            return Ok((status.as_u16(), body));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status {
            StatusCode::NOT_FOUND => match serde_json::from_str::<Value>(&error_text) {
                Ok(body) if is_no_match_body(&body) => {
                    tracing::debug!("No match found for '{}'", query.name);
                    Ok((status.as_u16(), body))
                }
                _ => Err(AppError::RequestRejected {
                    status: status.as_u16(),
                    body: error_text,
                }),
            },
            StatusCode::UNAUTHORIZED => Err(AppError::AuthError(format!(
                "match endpoint rejected the access token: {}",
                error_text
            ))),
            StatusCode::TOO_MANY_REQUESTS => Err(AppError::RateLimitExceeded { retry_after }),
            s if s.is_server_error() => Err(AppError::TransientNetworkError(format!(
                "match endpoint returned {}: {}",
                s, error_text
            ))),
            s => Err(AppError::RequestRejected {
                status: s.as_u16(),
                body: error_text,
            }),
        }
    }

    async fn stage_failure(
        &self,
        request_id: &str,
        query: &CompanyQuery,
        err: &AppError,
        attempts: u32,
    ) {
        let Some(store) = self.store.as_ref().filter(|_| self.stage_failures) else {
            return;
        };
        let payload = StagedPayload::Failed {
            error: err.to_string(),
            attempts,
        };
        if let Err(e) = store.save(request_id, query, payload).await {
            tracing::error!("Could not stage failure for '{}': {}", query.name, e);
        }
    }

    /// Matches every query with at most `concurrency` requests in flight.
    ///
    /// Results come back in input order. Cancelling `cancel` abandons
    /// in-flight work; queries without an outcome yet are reported as
    /// cancelled and the outcome is flagged.
    pub async fn match_batch(
        &self,
        queries: &[CompanyQuery],
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        if queries.is_empty() {
            return BatchOutcome {
                results: Vec::new(),
                cancelled: false,
            };
        }

        tracing::info!(
            "Matching batch of {} queries with {} workers",
            queries.len(),
            concurrency.max(1)
        );

        let mut slots: Vec<Option<Result<MatchResult, MatchError>>> =
            queries.iter().map(|_| None).collect();
        let mut completions = stream::iter(queries.iter().enumerate())
            .map(|(idx, query)| async move { (idx, self.match_one(query).await) })
            .buffer_unordered(concurrency.max(1));

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("Batch cancelled, abandoning in-flight requests");
                    cancelled = true;
                    break;
                }
                next = completions.next() => match next {
                    Some((idx, outcome)) => slots[idx] = Some(outcome),
                    None => break,
                },
            }
        }
        drop(completions);

        let results: Vec<_> = slots
            .into_iter()
            .zip(queries)
            .map(|(slot, query)| slot.unwrap_or_else(|| Err(MatchError::cancelled(query.clone()))))
            .collect();
        let outcome = BatchOutcome { results, cancelled };

        tracing::info!(
            "Batch finished: {} matched, {} failed{}",
            outcome.matched(),
            outcome.failed(),
            if cancelled { " (cancelled)" } else { "" }
        );
        outcome
    }
}
