use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{Authenticator, TokenStore};
use crate::config::Config;
use crate::db_storage::DatabaseManager;
use crate::errors::{AppError, ResultExt};
use crate::matcher::{BatchOutcome, Matcher};
use crate::models::{staging_now, CompanyQuery, IngestSummary, WorkflowSummary};
use crate::rate_limiter::RateLimiter;
use crate::response_store::ResponseStore;

/// Match, stage and ingest in one call.
///
/// Credentials and the rate limiter outlive individual runs; each run gets
/// its own matcher and run id.
pub struct MatchWorkflow {
    config: Config,
    tokens: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    store: Arc<ResponseStore>,
}

impl MatchWorkflow {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let authenticator = Authenticator::new(&config)?;
        let tokens = Arc::new(TokenStore::new(authenticator, config.token_safety_margin));
        let limiter = Arc::new(RateLimiter::per_second(config.requests_per_second));
        let store = Arc::new(ResponseStore::open(&config.staging_dir).await?);

        tracing::info!(
            "Match workflow ready (staging at {}, {} req/s, {} workers)",
            config.staging_dir.display(),
            config.requests_per_second,
            config.batch_concurrency
        );

        Ok(Self {
            config,
            tokens,
            limiter,
            store,
        })
    }

    pub fn store(&self) -> &ResponseStore {
        &self.store
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Runs the whole pipeline over `queries`.
    ///
    /// Returns `Err` only for workflow-fatal failures: an unusable schema or
    /// rejected credentials. Responses staged before an auth failure stay on
    /// disk and are picked up by [`ingest_pending`](Self::ingest_pending).
    pub async fn run_full_workflow(
        &self,
        queries: &[CompanyQuery],
        db: &DatabaseManager,
        cancel: &CancellationToken,
    ) -> Result<WorkflowSummary, AppError> {
        db.ensure_initialized().await?;

        let run_id = Uuid::new_v4();
        let since = staging_now();
        tracing::info!("Starting run {} with {} queries", run_id, queries.len());

        let matcher = Matcher::new(&self.config, self.tokens.clone())?
            .with_store(self.store.clone())
            .with_limiter(self.limiter.clone())
            .with_run_id(run_id);

        let outcome = matcher
            .match_batch(queries, self.config.batch_concurrency, cancel)
            .await;

        if let Some(failure) = outcome.auth_failure() {
            tracing::error!("Run {} aborted on authentication failure: {}", run_id, failure);
            return Err(failure.cause.clone());
        }

        let staged = self.count_staged(&outcome).await?;
        let ingest = db
            .populate_from_store(&self.store, Some(since))
            .await
            .with_context(|| format!("ingesting run {}", run_id))?;

        let summary = WorkflowSummary {
            run_id,
            matched: outcome.matched(),
            staged,
            ingested: ingest.ingested,
            failed: outcome.failed(),
            cancelled: outcome.cancelled,
            ingest,
        };
        tracing::info!(
            "Run {} complete: {} matched, {} staged, {} ingested, {} failed, {} companies created, {} updated",
            run_id,
            summary.matched,
            summary.staged,
            summary.ingested,
            summary.failed,
            summary.ingest.created,
            summary.ingest.updated
        );
        Ok(summary)
    }

    /// Ingests staged responses without matching anything.
    pub async fn ingest_pending(
        &self,
        db: &DatabaseManager,
        since: Option<DateTime<Utc>>,
    ) -> Result<IngestSummary, AppError> {
        db.populate_from_store(&self.store, since).await
    }

    async fn count_staged(&self, outcome: &BatchOutcome) -> Result<usize, AppError> {
        let mut staged = 0;
        for result in &outcome.results {
            let request_id = match result {
                Ok(matched) => Some(matched.request_id.as_str()),
                Err(failed) => failed.request_id.as_deref(),
            };
            if let Some(id) = request_id {
                if self.store.contains(id).await? {
                    staged += 1;
                }
            }
        }
        Ok(staged)
    }
}
