//! feedhub — Binary Entrypoint
//! Boots the realtime hub, the ingestion scheduler and the Axum HTTP server.

use std::sync::Arc;

use feedhub::api::{self, AppState, StaticTokenAuthenticator};
use feedhub::ingest::fetch::HttpFetcher;
use feedhub::metrics::Metrics;
use feedhub::{Hub, MemoryRepository, Scheduler, Settings, TokenBucket};
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default, JSON when FEEDHUB_LOG_FORMAT=json.
/// A subscriber installed by the runtime wins; ours is then skipped.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedhub=info,warn"));

    let json = std::env::var("FEEDHUB_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::load_default()?;

    let repo = Arc::new(MemoryRepository::from_seed(
        &settings.sources,
        &settings.subscriptions,
    ));
    let (hub, _hub_task) = Hub::spawn();

    let fetcher = Arc::new(HttpFetcher::new(settings.fetch_timeout()).map_err(anyhow::Error::from)?);
    let scheduler = Scheduler::new(
        repo,
        fetcher,
        hub.clone(),
        settings.scheduler_config(),
        settings.fetch_timeout(),
    );
    // Never cancelled: the scheduler lives as long as the process.
    let _scheduler_task = scheduler.spawn(CancellationToken::new());

    let state = AppState {
        hub,
        session: settings.realtime.session_config(),
        auth: Arc::new(StaticTokenAuthenticator::new(settings.tokens.clone())),
        limiter: Arc::new(TokenBucket::per_minute(
            settings.rate_limit.requests_per_minute,
            settings.rate_limit.burst_size,
        )),
    };
    tracing::info!(
        rpm = settings.rate_limit.requests_per_minute,
        burst = settings.rate_limit.burst_size,
        sources = settings.sources.len(),
        "feedhub configured"
    );

    let mut router = api::router(state);
    match Metrics::init() {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => tracing::warn!(error = ?e, "metrics endpoint disabled"),
    }

    Ok(router.into())
}
