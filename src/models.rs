use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::AppError;

// ============ Input ============

/// One company to resolve. Only `name` is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyQuery {
    pub name: String,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl CompanyQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            country: None,
            address: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Trims every field, drops empty optionals and upper-cases the country.
    ///
    /// Fails with `ValidationError` for an empty name or a country that is
    /// not two ASCII letters.
    pub fn normalized(&self) -> Result<CompanyQuery, AppError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(AppError::ValidationError(
                "company name is required".to_string(),
            ));
        }

        let country = match self.country.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => {
                if c.len() != 2 || !c.chars().all(|ch| ch.is_ascii_alphabetic()) {
                    return Err(AppError::ValidationError(format!(
                        "country must be a 2-letter ISO alpha-2 code, got '{}'",
                        c
                    )));
                }
                Some(c.to_ascii_uppercase())
            }
            _ => None,
        };

        let address = self
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        Ok(CompanyQuery {
            name: name.to_string(),
            country,
            address,
        })
    }

    /// Stable identifier of this query within one workflow run.
    ///
    /// Hex SHA-256 over the run id and the query fields, so saving the same
    /// query twice in a run lands on the same staged record.
    pub fn request_id(&self, run_id: &Uuid) -> String {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_bytes());
        for part in [
            self.name.as_str(),
            self.country.as_deref().unwrap_or(""),
            self.address.as_deref().unwrap_or(""),
        ] {
            hasher.update([0x1f]);
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// ============ Credentials ============

/// Bearer token issued by the provider. Never written to disk.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True if the token is still valid `margin` after `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        let Ok(margin) = chrono::Duration::from_std(margin) else {
            return false;
        };
        match now.checked_add_signed(margin) {
            Some(deadline) => self.expires_at > deadline,
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============ Match output ============

/// One ranked candidate returned by the match endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub duns: String,
    pub confidence_score: f64,
    pub matched_name: String,
    pub match_grade: Option<String>,
    /// Flattened provider fields (address, status, phones, ...).
    pub raw_fields: Map<String, Value>,
}

impl MatchCandidate {
    /// Looks up a nested raw field by JSON pointer, e.g. `/address/postal_code`.
    pub fn field(&self, pointer: &str) -> Option<&Value> {
        let mut parts = pointer.trim_start_matches('/').split('/');
        let first = parts.next()?;
        parts.try_fold(self.raw_fields.get(first)?, |value, key| value.get(key))
    }

    /// String-valued raw field, with empty strings treated as absent.
    pub fn field_str(&self, pointer: &str) -> Option<&str> {
        self.field(pointer)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Outcome of a successful match for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub query: CompanyQuery,
    /// Ranked by confidence, highest first.
    pub candidates: Vec<MatchCandidate>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Network attempts it took, retries included.
    pub attempts: u32,
}

impl MatchResult {
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

// ============ Staging ============

/// Raw provider outcome as written to the staging store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StagedPayload {
    #[serde(rename_all = "camelCase")]
    Matched { http_status: u16, body: Value },
    #[serde(rename_all = "camelCase")]
    Failed { error: String, attempts: u32 },
}

/// Append-only audit record of one provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedResponse {
    pub request_id: String,
    pub source_query: CompanyQuery,
    pub raw_payload: StagedPayload,
    pub saved_at: DateTime<Utc>,
}

/// Current time at the millisecond precision used for staging timestamps.
pub fn staging_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ============ Database Models ============

/// Normalised company row, one per DUNS.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub duns: String,
    pub primary_name: String,
    pub confidence_score: f64,
    pub match_grade: Option<String>,
    pub operating_status: Option<String>,
    pub operating_status_code: Option<i64>,
    pub is_mail_undeliverable: Option<bool>,
    pub country_iso_alpha2_code: Option<String>,
    pub country_name: Option<String>,
    pub region_name: Option<String>,
    pub postal_code: Option<String>,
    pub street_line1: Option<String>,
    pub street_line2: Option<String>,
    /// JSON array text.
    pub website_addresses: String,
    /// JSON array text.
    pub telephone_numbers: String,
    /// JSON array text.
    pub trade_style_names: String,
    pub input_company_name: String,
    pub input_country: Option<String>,
    pub input_address: Option<String>,
    pub source_request_id: String,
    /// JSON object text of the candidate's raw fields.
    pub raw_fields: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Ledger row describing one ingested staged response.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MatchQueryRecord {
    pub request_id: String,
    pub company_name: String,
    pub country: Option<String>,
    pub address: Option<String>,
    pub total_matches: i64,
    pub best_match_duns: Option<String>,
    pub best_match_confidence: Option<f64>,
    pub saved_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

// ============ Summaries ============

/// Per-response ingestion failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestFailure {
    /// Empty when the staging file itself could not be read.
    pub request_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// Staged responses examined.
    pub processed: usize,
    /// Matched responses committed without error.
    pub ingested: usize,
    pub created: usize,
    pub updated: usize,
    /// Stale candidates plus staged failure payloads.
    pub skipped: usize,
    pub errors: Vec<IngestFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub run_id: Uuid,
    pub matched: usize,
    pub staged: usize,
    /// Staged responses of this run committed to the database.
    pub ingested: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub ingest: IngestSummary,
}
