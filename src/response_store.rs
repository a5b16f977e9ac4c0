//! Durable staging of raw provider responses, one JSON file per request id.
//!
//! Files are written once and never modified, making the directory an
//! append-only audit log the ingestor can replay after a crash. The one
//! exception is a staged failure, which a later successful response for the
//! same id replaces atomically.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{staging_now, CompanyQuery, StagedPayload, StagedResponse};

const STAGED_EXTENSION: &str = "json";

pub struct ResponseStore {
    dir: PathBuf,
}

impl ResponseStore {
    /// Opens (creating if needed) a staging directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(AppError::from)
            .with_context(|| format!("creating staging directory {}", dir.display()))?;
        tracing::debug!("Response store opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", request_id, STAGED_EXTENSION))
    }

    /// Stages a response. Saving an id that already exists returns the stored
    /// record untouched, unless the stored record is a failure and the new
    /// payload is a match, in which case the match replaces it.
    pub async fn save(
        &self,
        request_id: &str,
        query: &CompanyQuery,
        payload: StagedPayload,
    ) -> Result<StagedResponse, AppError> {
        if request_id.is_empty()
            || !request_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::ValidationError(format!(
                "request id '{}' is not file-name safe",
                request_id
            )));
        }

        let target = self.path_for(request_id);
        if fs::try_exists(&target).await? {
            let existing = self.read(&target).await?;
            if !supersedes(&payload, &existing.raw_payload) {
                tracing::debug!("Response {} already staged", request_id);
                return Ok(existing);
            }
        }

        let staged = StagedResponse {
            request_id: request_id.to_string(),
            source_query: query.clone(),
            raw_payload: payload,
            saved_at: staging_now(),
        };
        let bytes = serde_json::to_vec_pretty(&staged)
            .map_err(|e| AppError::StorageError(format!("Failed to encode staged response: {}", e)))?;

        // Write aside, then link into place: the link fails if the id was
        // staged concurrently, and readers never see a half-written file.
        let temp = self
            .dir
            .join(format!(".{}.{}.tmp", request_id, Uuid::new_v4().simple()));
        fs::write(&temp, &bytes)
            .await
            .map_err(AppError::from)
            .with_context(|| format!("writing {}", temp.display()))?;

        let outcome = match fs::hard_link(&temp, &target).await {
            Ok(()) => {
                tracing::info!("Staged response {}", request_id);
                Ok(staged)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.replace_failure(&temp, &target, staged).await
            }
            Err(e) => Err(AppError::from(e))
                .with_context(|| format!("publishing {}", target.display())),
        };
        let _ = fs::remove_file(&temp).await;
        outcome
    }

    /// Renames `temp` over a staged failure at `target`. Any other stored
    /// record is kept and returned.
    async fn replace_failure(
        &self,
        temp: &Path,
        target: &Path,
        staged: StagedResponse,
    ) -> Result<StagedResponse, AppError> {
        let existing = self.read(target).await?;
        if !supersedes(&staged.raw_payload, &existing.raw_payload) {
            tracing::debug!("Response {} already staged, keeping first", staged.request_id);
            return Ok(existing);
        }

        fs::rename(temp, target)
            .await
            .map_err(AppError::from)
            .with_context(|| format!("replacing {}", target.display()))?;
        tracing::info!("Staged response {} over an earlier failure", staged.request_id);
        Ok(staged)
    }

    /// Reads one staged response by id.
    pub async fn load(&self, request_id: &str) -> Result<Option<StagedResponse>, AppError> {
        let path = self.path_for(request_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        self.read(&path).await.map(Some)
    }

    pub async fn contains(&self, request_id: &str) -> Result<bool, AppError> {
        Ok(fs::try_exists(self.path_for(request_id)).await?)
    }

    async fn read(&self, path: &Path) -> Result<StagedResponse, AppError> {
        let content = fs::read(path)
            .await
            .map_err(AppError::from)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&content).map_err(|e| {
            AppError::StorageError(format!("{} is not a staged response: {}", path.display(), e))
        })
    }

    /// Lazily lists staged responses, optionally only those saved at or after `since`.
    ///
    /// Unreadable files are yielded as errors so callers can count them
    /// without aborting the listing.
    pub fn list_pending(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Stream<Item = Result<StagedResponse, AppError>> + '_ {
        stream::unfold(Cursor::Unopened, move |cursor| async move {
            let mut entries = match cursor {
                Cursor::Done => return None,
                Cursor::Open(entries) => entries,
                Cursor::Unopened => match fs::read_dir(&self.dir).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        let err = AppError::WithContext {
                            source: Box::new(AppError::from(e)),
                            context: format!("listing {}", self.dir.display()),
                        };
                        return Some((Err(err), Cursor::Done));
                    }
                },
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(AppError::from(e)), Cursor::Done)),
                };

                let path = entry.path();
                let is_staged = path.extension().and_then(|e| e.to_str()) == Some(STAGED_EXTENSION)
                    && !entry.file_name().to_string_lossy().starts_with('.');
                if !is_staged {
                    continue;
                }

                match self.read(&path).await {
                    Ok(staged) if since.map_or(true, |t| staged.saved_at >= t) => {
                        return Some((Ok(staged), Cursor::Open(entries)));
                    }
                    Ok(_) => continue,
                    Err(e) => return Some((Err(e), Cursor::Open(entries))),
                }
            }
        })
    }
}

fn supersedes(new: &StagedPayload, existing: &StagedPayload) -> bool {
    matches!(
        (new, existing),
        (StagedPayload::Matched { .. }, StagedPayload::Failed { .. })
    )
}

enum Cursor {
    Unopened,
    Open(fs::ReadDir),
    Done,
}
