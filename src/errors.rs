use std::fmt;
use std::time::Duration;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// The identity provider rejected our credentials. Never retried.
    AuthError(String),
    /// Timeout, connection reset or a 5xx from the provider.
    TransientNetworkError(String),
    /// The input was rejected before any network attempt.
    ValidationError(String),
    /// HTTP 429, optionally carrying the server's `Retry-After`.
    RateLimitExceeded {
        /// Delay requested by the server, if any.
        retry_after: Option<Duration>,
    },
    /// A 4xx (other than 401/429) that retrying cannot fix.
    RequestRejected {
        /// HTTP status returned by the provider.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// The provider answered 2xx with a body we could not read.
    InvalidResponse(String),
    /// A staged payload could not be turned into candidates.
    IngestParseError(String),
    /// The relational schema is missing or incompatible.
    SchemaError(String),
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Staging directory I/O or (de)serialization failure.
    StorageError(String),
    /// The operation was abandoned because its batch was cancelled.
    Cancelled,
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Whether another attempt may succeed (network hiccups, 429, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TransientNetworkError(_) | AppError::RateLimitExceeded { .. } => true,
            AppError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the error must abort the whole workflow rather than one record.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::AuthError(_) | AppError::SchemaError(_) => true,
            AppError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Server-requested delay for rate-limit responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimitExceeded { retry_after } => *retry_after,
            AppError::WithContext { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Strips context layers and returns the root error.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::AuthError(msg) => write!(f, "Authentication failed: {}", msg),
            AppError::TransientNetworkError(msg) => write!(f, "Transient network error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::RateLimitExceeded { retry_after } => match retry_after {
                Some(delay) => write!(f, "Rate limit exceeded, retry after {:?}", delay),
                None => write!(f, "Rate limit exceeded"),
            },
            AppError::RequestRejected { status, body } => {
                write!(f, "Request rejected with status {}: {}", status, body)
            }
            AppError::InvalidResponse(msg) => write!(f, "Invalid provider response: {}", msg),
            AppError::IngestParseError(msg) => write!(f, "Could not parse staged payload: {}", msg),
            AppError::SchemaError(msg) => write!(f, "Schema error: {}", msg),
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            AppError::Cancelled => write!(f, "Cancelled"),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

// Make AppError cloneable so a single auth failure can be handed to every waiter
impl Clone for AppError {
    /// Clones the error.
    ///
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` keeps only its message.
    fn clone(&self) -> Self {
        match self {
            AppError::AuthError(msg) => AppError::AuthError(msg.clone()),
            AppError::TransientNetworkError(msg) => AppError::TransientNetworkError(msg.clone()),
            AppError::ValidationError(msg) => AppError::ValidationError(msg.clone()),
            AppError::RateLimitExceeded { retry_after } => AppError::RateLimitExceeded {
                retry_after: *retry_after,
            },
            AppError::RequestRejected { status, body } => AppError::RequestRejected {
                status: *status,
                body: body.clone(),
            },
            AppError::InvalidResponse(msg) => AppError::InvalidResponse(msg.clone()),
            AppError::IngestParseError(msg) => AppError::IngestParseError(msg.clone()),
            AppError::SchemaError(msg) => AppError::SchemaError(msg.clone()),
            AppError::DatabaseError(e) => AppError::DatabaseError(sqlx::Error::Protocol(e.to_string())),
            AppError::StorageError(msg) => AppError::StorageError(msg.clone()),
            AppError::Cancelled => AppError::Cancelled,
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<std::io::Error> for AppError {
    /// Converts a staging I/O failure into an `AppError`.
    fn from(err: std::io::Error) -> Self {
        AppError::StorageError(err.to_string())
    }
}

/// Classifies a transport-level `reqwest` failure (no HTTP status available).
///
/// Timeouts, refused connections and resets are worth another attempt;
/// failures to even build the request are not.
pub fn classify_transport(err: &reqwest::Error) -> AppError {
    if err.is_builder() {
        AppError::ValidationError(format!("could not build request: {}", err))
    } else if err.is_decode() {
        AppError::InvalidResponse(err.to_string())
    } else {
        AppError::TransientNetworkError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Arguments
    ///
    /// * `context` - The context message to add.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Arguments
    ///
    /// * `f` - A closure that produces the context message.
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}
