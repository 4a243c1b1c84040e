use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use transaction_engine::audit::{AuditLog, HttpAuditTransport};
use transaction_engine::clock::SystemClock;
use transaction_engine::config::Config;
use transaction_engine::database::{self, PostgresStore};
use transaction_engine::engine::Engine;
use transaction_engine::http;
use transaction_engine::quote::HttpQuoteOracle;
use transaction_engine::store::BalanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env();
    config.log_effective();

    // Both external collaborators must answer before the engine serves
    // commands; a silent start against a dead store would corrupt recovery.
    let database_url = config.database_url.clone();
    let pool = connect_with_retry("postgres", move || {
        let url = database_url.clone();
        async move { database::create_pool(&url).await }
    })
    .await?;
    database::init_schema(&pool).await?;

    let transport = Arc::new(HttpAuditTransport::new(&config.audit_url));
    let audit = Arc::new(AuditLog::new(&config.server_name, transport));
    let audit_for_ping = Arc::clone(&audit);
    connect_with_retry("audit collaborator", move || {
        let audit = Arc::clone(&audit_for_ping);
        async move { audit.ping().await }
    })
    .await?;
    audit.spawn_workers();

    let store = BalanceStore::new(Arc::new(PostgresStore::new(pool)));
    store
        .recover()
        .await
        .context("could not hydrate the balance cache from the durable store")?;

    let oracle = Arc::new(HttpQuoteOracle::new(&config.quote_url));
    let engine = Engine::new(store, oracle, audit, Arc::new(SystemClock));

    engine.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
    engine.spawn_trigger_evaluators();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    info!(%addr, "transaction engine listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(engine)).await?;

    Ok(())
}

/// Startup connect with bounded retry: five attempts backed off by
/// 0, 1, 2, 3 and 4 seconds, then a fatal error.
async fn connect_with_retry<T, E, F, Fut>(what: &str, mut connect: F) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut last_error = String::new();
    for attempt in 0..5u64 {
        tokio::time::sleep(Duration::from_secs(attempt)).await;
        match connect().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(what, attempt = attempt + 1, error = %err, "startup connect failed");
                last_error = err.to_string();
            }
        }
    }
    anyhow::bail!("could not reach {what} after 5 attempts: {last_error}")
}
