use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::errors::{AppError, ResultExt};
use crate::extract::candidates_from_body;
use crate::models::{
    CompanyRecord, IngestFailure, IngestSummary, MatchCandidate, MatchQueryRecord, StagedPayload,
    StagedResponse,
};
use crate::response_store::ResponseStore;

const CREATE_COMPANIES: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    duns TEXT PRIMARY KEY NOT NULL,
    primary_name TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    match_grade TEXT,
    operating_status TEXT,
    operating_status_code INTEGER,
    is_mail_undeliverable INTEGER,
    country_iso_alpha2_code TEXT,
    country_name TEXT,
    region_name TEXT,
    postal_code TEXT,
    street_line1 TEXT,
    street_line2 TEXT,
    website_addresses TEXT NOT NULL,
    telephone_numbers TEXT NOT NULL,
    trade_style_names TEXT NOT NULL,
    input_company_name TEXT NOT NULL,
    input_country TEXT,
    input_address TEXT,
    source_request_id TEXT NOT NULL,
    raw_fields TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL
)
"#;

const CREATE_MATCH_QUERIES: &str = r#"
CREATE TABLE IF NOT EXISTS match_queries (
    request_id TEXT PRIMARY KEY NOT NULL,
    company_name TEXT NOT NULL,
    country TEXT,
    address TEXT,
    total_matches INTEGER NOT NULL,
    best_match_duns TEXT,
    best_match_confidence REAL,
    saved_at TEXT NOT NULL,
    ingested_at TEXT NOT NULL
)
"#;

const COMPANY_COLUMNS: &[&str] = &[
    "duns",
    "primary_name",
    "confidence_score",
    "match_grade",
    "operating_status",
    "operating_status_code",
    "is_mail_undeliverable",
    "country_iso_alpha2_code",
    "country_name",
    "region_name",
    "postal_code",
    "street_line1",
    "street_line2",
    "website_addresses",
    "telephone_numbers",
    "trade_style_names",
    "input_company_name",
    "input_country",
    "input_address",
    "source_request_id",
    "raw_fields",
    "created_at",
    "last_updated",
];

const MATCH_QUERY_COLUMNS: &[&str] = &[
    "request_id",
    "company_name",
    "country",
    "address",
    "total_matches",
    "best_match_duns",
    "best_match_confidence",
    "saved_at",
    "ingested_at",
];

/// Counts for one staged response, merged into the summary only on commit.
#[derive(Default)]
struct ResponseCounts {
    committed: bool,
    created: usize,
    updated: usize,
    skipped: usize,
}

/// Turns staged responses into `companies` rows, one per DUNS.
///
/// Ingestion is an explicit read-compare-write upsert: a row is only
/// overwritten by a staged response saved after the one that last wrote it,
/// which makes replaying the same staged data a no-op.
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the schema if absent and checks an existing one is usable.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        for ddl in [CREATE_COMPANIES, CREATE_MATCH_QUERIES] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::SchemaError(format!("could not create schema: {}", e)))?;
        }

        self.verify_columns("companies", COMPANY_COLUMNS).await?;
        self.verify_columns("match_queries", MATCH_QUERY_COLUMNS).await?;

        tracing::info!("Database tables initialized");
        Ok(())
    }

    async fn verify_columns(&self, table: &str, required: &[&str]) -> Result<(), AppError> {
        let present: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("inspecting table {}", table))?;

        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|column| !present.iter().any(|p| p == column))
            .collect();

        if !missing.is_empty() {
            tracing::error!("Table {} is incompatible, missing {:?}", table, missing);
            return Err(AppError::SchemaError(format!(
                "table {} exists but lacks columns: {}",
                table,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Upserts every candidate of every staged response.
    ///
    /// Per-response failures are recorded in the summary; only schema
    /// initialisation failures are returned as errors.
    pub async fn populate_from<I>(&self, staged: I) -> Result<IngestSummary, AppError>
    where
        I: IntoIterator<Item = StagedResponse>,
    {
        self.ensure_initialized().await?;

        let mut summary = IngestSummary::default();
        for response in staged {
            self.ingest_into_summary(&response, &mut summary).await;
        }

        tracing::info!(
            "Populated database from {} staged responses ({} created, {} updated, {} skipped, {} errors)",
            summary.processed,
            summary.created,
            summary.updated,
            summary.skipped,
            summary.errors.len()
        );
        Ok(summary)
    }

    /// Ingests straight from the staging store, counting unreadable files as errors.
    pub async fn populate_from_store(
        &self,
        store: &ResponseStore,
        since: Option<DateTime<Utc>>,
    ) -> Result<IngestSummary, AppError> {
        self.ensure_initialized().await?;

        let mut summary = IngestSummary::default();
        let pending = store.list_pending(since);
        futures::pin_mut!(pending);

        while let Some(item) = pending.next().await {
            match item {
                Ok(response) => self.ingest_into_summary(&response, &mut summary).await,
                Err(e) => {
                    tracing::error!("Skipping unreadable staged response: {}", e);
                    summary.processed += 1;
                    summary.errors.push(IngestFailure {
                        request_id: String::new(),
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Populated database from staging ({} processed, {} created, {} updated, {} skipped, {} errors)",
            summary.processed,
            summary.created,
            summary.updated,
            summary.skipped,
            summary.errors.len()
        );
        Ok(summary)
    }

    async fn ingest_into_summary(&self, response: &StagedResponse, summary: &mut IngestSummary) {
        summary.processed += 1;
        match self.ingest_one(response).await {
            Ok(counts) => {
                if counts.committed {
                    summary.ingested += 1;
                }
                summary.created += counts.created;
                summary.updated += counts.updated;
                summary.skipped += counts.skipped;
            }
            Err(e) => {
                tracing::error!("Error processing staged response {}: {}", response.request_id, e);
                summary.errors.push(IngestFailure {
                    request_id: response.request_id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Applies one staged response inside a single transaction.
    async fn ingest_one(&self, staged: &StagedResponse) -> Result<ResponseCounts, AppError> {
        let mut counts = ResponseCounts::default();

        let candidates = match &staged.raw_payload {
            StagedPayload::Failed { error, .. } => {
                tracing::info!("Skipping failed response {}: {}", staged.request_id, error);
                counts.skipped += 1;
                return Ok(counts);
            }
            StagedPayload::Matched { body, .. } => candidates_from_body(body)?,
        };

        let mut tx = self.pool.begin().await.context("starting transaction")?;

        for candidate in &candidates {
            let stored: Option<DateTime<Utc>> =
                sqlx::query_scalar("SELECT last_updated FROM companies WHERE duns = ?")
                    .bind(&candidate.duns)
                    .fetch_optional(&mut *tx)
                    .await
                    .with_context(|| format!("looking up DUNS {}", candidate.duns))?;

            let row = company_row(candidate, staged);
            match stored {
                None => {
                    insert_company(&mut tx, &row).await?;
                    tracing::debug!("Created company {}", row.duns);
                    counts.created += 1;
                }
                Some(last_updated) if staged.saved_at > last_updated => {
                    update_company(&mut tx, &row).await?;
                    tracing::debug!("Updated company {}", row.duns);
                    counts.updated += 1;
                }
                Some(_) => {
                    counts.skipped += 1;
                }
            }
        }

        let best = candidates.first();
        sqlx::query(
            r#"
            INSERT INTO match_queries (
                request_id, company_name, country, address, total_matches,
                best_match_duns, best_match_confidence, saved_at, ingested_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(&staged.request_id)
        .bind(&staged.source_query.name)
        .bind(&staged.source_query.country)
        .bind(&staged.source_query.address)
        .bind(candidates.len() as i64)
        .bind(best.map(|c| c.duns.clone()))
        .bind(best.map(|c| c.confidence_score))
        .bind(staged.saved_at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("recording match query")?;

        tx.commit().await.context("committing staged response")?;
        counts.committed = true;
        Ok(counts)
    }

    pub async fn company(&self, duns: &str) -> Result<Option<CompanyRecord>, AppError> {
        let row = sqlx::query_as::<_, CompanyRecord>("SELECT * FROM companies WHERE duns = ?")
            .bind(duns)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn companies(&self) -> Result<Vec<CompanyRecord>, AppError> {
        let rows = sqlx::query_as::<_, CompanyRecord>("SELECT * FROM companies ORDER BY duns")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn match_queries(&self) -> Result<Vec<MatchQueryRecord>, AppError> {
        let rows = sqlx::query_as::<_, MatchQueryRecord>(
            "SELECT * FROM match_queries ORDER BY request_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn company_row(candidate: &MatchCandidate, staged: &StagedResponse) -> CompanyRecord {
    let json_text = |pointer: &str| {
        candidate
            .field(pointer)
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| "[]".to_string())
    };
    let owned = |pointer: &str| candidate.field_str(pointer).map(str::to_string);

    CompanyRecord {
        duns: candidate.duns.clone(),
        primary_name: candidate.matched_name.clone(),
        confidence_score: candidate.confidence_score,
        match_grade: candidate.match_grade.clone(),
        operating_status: owned("/operating_status/description"),
        operating_status_code: candidate.field("/operating_status/dnb_code").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        }),
        is_mail_undeliverable: candidate
            .field("/is_mail_undeliverable")
            .and_then(Value::as_bool),
        country_iso_alpha2_code: owned("/address/country/iso_alpha2_code"),
        country_name: owned("/address/country/name"),
        region_name: owned("/address/region/name"),
        postal_code: owned("/address/postal_code"),
        street_line1: owned("/address/street/line1"),
        street_line2: owned("/address/street/line2"),
        website_addresses: json_text("/website_address"),
        telephone_numbers: json_text("/telephone"),
        trade_style_names: json_text("/trade_style_names"),
        input_company_name: staged.source_query.name.clone(),
        input_country: staged.source_query.country.clone(),
        input_address: staged.source_query.address.clone(),
        source_request_id: staged.request_id.clone(),
        raw_fields: Value::Object(candidate.raw_fields.clone()).to_string(),
        created_at: staged.saved_at,
        last_updated: staged.saved_at,
    }
}

async fn insert_company(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &CompanyRecord,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO companies (
            duns, primary_name, confidence_score, match_grade, operating_status,
            operating_status_code, is_mail_undeliverable, country_iso_alpha2_code,
            country_name, region_name, postal_code, street_line1, street_line2,
            website_addresses, telephone_numbers, trade_style_names,
            input_company_name, input_country, input_address, source_request_id,
            raw_fields, created_at, last_updated
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.duns)
    .bind(&row.primary_name)
    .bind(row.confidence_score)
    .bind(&row.match_grade)
    .bind(&row.operating_status)
    .bind(row.operating_status_code)
    .bind(row.is_mail_undeliverable)
    .bind(&row.country_iso_alpha2_code)
    .bind(&row.country_name)
    .bind(&row.region_name)
    .bind(&row.postal_code)
    .bind(&row.street_line1)
    .bind(&row.street_line2)
    .bind(&row.website_addresses)
    .bind(&row.telephone_numbers)
    .bind(&row.trade_style_names)
    .bind(&row.input_company_name)
    .bind(&row.input_country)
    .bind(&row.input_address)
    .bind(&row.source_request_id)
    .bind(&row.raw_fields)
    .bind(row.created_at)
    .bind(row.last_updated)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("inserting DUNS {}", row.duns))?;
    Ok(())
}

/// Overwrites every match field; `created_at` keeps the first sighting.
async fn update_company(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &CompanyRecord,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE companies
        SET primary_name = ?,
            confidence_score = ?,
            match_grade = ?,
            operating_status = ?,
            operating_status_code = ?,
            is_mail_undeliverable = ?,
            country_iso_alpha2_code = ?,
            country_name = ?,
            region_name = ?,
            postal_code = ?,
            street_line1 = ?,
            street_line2 = ?,
            website_addresses = ?,
            telephone_numbers = ?,
            trade_style_names = ?,
            input_company_name = ?,
            input_country = ?,
            input_address = ?,
            source_request_id = ?,
            raw_fields = ?,
            last_updated = ?
        WHERE duns = ?
        "#,
    )
    .bind(&row.primary_name)
    .bind(row.confidence_score)
    .bind(&row.match_grade)
    .bind(&row.operating_status)
    .bind(row.operating_status_code)
    .bind(row.is_mail_undeliverable)
    .bind(&row.country_iso_alpha2_code)
    .bind(&row.country_name)
    .bind(&row.region_name)
    .bind(&row.postal_code)
    .bind(&row.street_line1)
    .bind(&row.street_line2)
    .bind(&row.website_addresses)
    .bind(&row.telephone_numbers)
    .bind(&row.trade_style_names)
    .bind(&row.input_company_name)
    .bind(&row.input_country)
    .bind(&row.input_address)
    .bind(&row.source_request_id)
    .bind(&row.raw_fields)
    .bind(row.last_updated)
    .bind(&row.duns)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("updating DUNS {}", row.duns))?;
    Ok(())
}
