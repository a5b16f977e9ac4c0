use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default D&B Direct+ base URL.
pub const DEFAULT_API_URL: &str = "https://plus.dnb.com";

/// Resolved configuration consumed by the matching and ingestion core.
#[derive(Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    /// Shared ceiling across all workers; 0 disables the limiter.
    pub requests_per_second: u32,
    pub batch_concurrency: usize,
    pub request_timeout: Duration,
    /// A cached token this close to expiry is refreshed before use.
    pub token_safety_margin: Duration,
    pub database_url: String,
    pub staging_dir: PathBuf,
    /// Stage failed-after-network outcomes alongside successful responses.
    pub stage_failures: bool,
}

impl Config {
    /// Builds a configuration with the default retry, rate and storage settings.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
            requests_per_second: 5,
            batch_concurrency: 5,
            request_timeout: Duration::from_secs(30),
            token_safety_margin: Duration::from_secs(60),
            database_url: "sqlite://duns_match.db".to_string(),
            staging_dir: PathBuf::from("responses"),
            stage_failures: true,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let api_url = std::env::var("DNB_API_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            anyhow::bail!("DNB_API_URL must start with http:// or https://");
        }
        url::Url::parse(&api_url)
            .map_err(|e| anyhow::anyhow!("DNB_API_URL is not a valid URL: {}", e))?;

        let api_key = std::env::var("DNB_API_KEY")
            .map_err(|_| anyhow::anyhow!("DNB_API_KEY environment variable required"))
            .and_then(|key| {
                if key.trim().is_empty() {
                    anyhow::bail!("DNB_API_KEY cannot be empty");
                }
                Ok(key)
            })?;
        let api_secret = std::env::var("DNB_API_SECRET")
            .map_err(|_| anyhow::anyhow!("DNB_API_SECRET environment variable required"))
            .and_then(|secret| {
                if secret.trim().is_empty() {
                    anyhow::bail!("DNB_API_SECRET cannot be empty");
                }
                Ok(secret)
            })?;

        let mut config = Self::new(api_url, api_key, api_secret);

        if let Some(attempts) = parse_var::<u32>("DNB_MAX_ATTEMPTS")? {
            if attempts == 0 {
                anyhow::bail!("DNB_MAX_ATTEMPTS must be at least 1");
            }
            config.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>("DNB_BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("DNB_MAX_DELAY_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }
        if config.max_delay < config.base_delay {
            anyhow::bail!("DNB_MAX_DELAY_MS must not be smaller than DNB_BASE_DELAY_MS");
        }
        if let Some(jitter) = parse_var::<f64>("DNB_JITTER_FRACTION")? {
            if !(0.0..1.0).contains(&jitter) {
                anyhow::bail!("DNB_JITTER_FRACTION must be in [0, 1)");
            }
            config.jitter_fraction = jitter;
        }
        if let Some(rps) = parse_var::<u32>("DNB_REQUESTS_PER_SECOND")? {
            config.requests_per_second = rps;
        }
        if let Some(workers) = parse_var::<usize>("DNB_BATCH_CONCURRENCY")? {
            if workers == 0 {
                anyhow::bail!("DNB_BATCH_CONCURRENCY must be at least 1");
            }
            config.batch_concurrency = workers;
        }
        if let Some(secs) = parse_var::<u64>("DNB_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                if !url.starts_with("sqlite:") {
                    anyhow::bail!("DATABASE_URL must start with sqlite:");
                }
                config.database_url = url;
            }
        }
        if let Ok(dir) = std::env::var("DNB_STAGING_DIR") {
            if !dir.trim().is_empty() {
                config.staging_dir = PathBuf::from(dir);
            }
        }
        if let Some(stage) = parse_var::<bool>("DNB_STAGE_FAILURES")? {
            config.stage_failures = stage;
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("D&B API URL: {}", config.api_url);
        tracing::debug!(
            "Retry policy: {} attempts, base {:?}, cap {:?}, jitter {}",
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.jitter_fraction
        );
        tracing::debug!(
            "Rate: {} req/s across {} workers",
            config.requests_per_second,
            config.batch_concurrency
        );
        tracing::debug!("Staging directory: {}", config.staging_dir.display());

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(None),
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("requests_per_second", &self.requests_per_second)
            .field("batch_concurrency", &self.batch_concurrency)
            .field("request_timeout", &self.request_timeout)
            .field("token_safety_margin", &self.token_safety_margin)
            .field("database_url", &self.database_url)
            .field("staging_dir", &self.staging_dir)
            .field("stage_failures", &self.stage_failures)
            .finish()
    }
}
