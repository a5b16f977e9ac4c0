use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duns_match_api::config::Config;
use duns_match_api::db::Database;
use duns_match_api::db_storage::DatabaseManager;
use duns_match_api::models::CompanyQuery;
use duns_match_api::workflow::MatchWorkflow;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duns_match_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let input = std::env::args()
        .nth(1)
        .context("usage: duns-match-api <queries.json>")?;
    let raw = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input))?;
    let queries: Vec<CompanyQuery> = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not a JSON array of company queries", input))?;
    tracing::info!("Loaded {} queries from {}", queries.len(), input);

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let db = Database::new(&config.database_url).await?;
    let manager = DatabaseManager::new(db.pool.clone());
    let workflow = MatchWorkflow::new(config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling batch");
            on_signal.cancel();
        }
    });

    let summary = workflow.run_full_workflow(&queries, &manager, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
