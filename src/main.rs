mod app_state;
mod config;
mod event_filter;
mod fetcher;
mod handlers;
mod health;
mod models;
mod morning_summary;
mod parser;
mod pipeline;
mod precompute;
mod query;
mod refresher;
mod response_cache;
mod rrule;
mod skipped;
mod speech;
mod stages;
mod timezone;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use tokio::signal;

use app_state::AppState;
use config::Settings;
use event_filter::EventWindow;
use fetcher::IcsFetcher;
use health::HealthTracker;
use precompute::PrecomputedResponses;
use refresher::Refresher;
use response_cache::ResponseCache;
use rrule::RruleExpander;
use skipped::{SkippedStore, SledSkippedStore};
use speech::PlainTextPresenter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Calendarbot calendar ingestion and serving core")]
struct Args {
    /// HTTP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path for the persisted skipped-event store (overrides config)
    #[arg(long)]
    skipped_store: Option<PathBuf>,

    /// Enable debug logs
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut settings = Settings::new()?;
    if let Some(port) = args.port {
        settings.server.http_port = port;
    }
    if args.debug {
        settings.logging.level = "debug".to_string();
    }

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&settings.logging.level));

    log::info!("Starting Calendarbot Server");
    log::info!("HTTP: http://{}", settings.http_addr());
    log::info!("Sources: {}", settings.sources.len());
    if settings.sources.is_empty() {
        log::warn!(
            "No ICS sources configured; set CALENDARBOT_ICS_URL or sources in the config file"
        );
    }

    let server_tz = timezone::resolve_server_timezone(
        Some(settings.alexa.default_timezone.as_str()).filter(|s| !s.trim().is_empty()),
    );
    log::info!("Server timezone: {}", server_tz.name());

    let bearer_token = settings.bearer_token();
    if bearer_token.is_none() {
        log::warn!("No bearer token configured; /api/alexa endpoints run unauthenticated");
    }

    // Try to open the persisted skipped store, but continue without it.
    let skipped_path = args.skipped_store.or_else(|| {
        let configured = settings.skipped_store_path.trim();
        if configured.is_empty() {
            None
        } else {
            Some(PathBuf::from(configured))
        }
    });
    let skipped_store: Option<Arc<dyn SkippedStore>> = match SledSkippedStore::open(skipped_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            log::warn!(
                "Failed to open skipped-event store: {}. Running without skipped filtering.",
                e
            );
            None
        }
    };

    // Shared state
    let time_provider = pipeline::system_time_provider();
    let started_at = (time_provider)();
    let window = Arc::new(EventWindow::new());
    let response_cache = Arc::new(ResponseCache::new());
    let health = Arc::new(HealthTracker::new(started_at));
    let precomputed = Arc::new(PrecomputedResponses::new());
    let presenter = Arc::new(PlainTextPresenter);
    let expander = Arc::new(RruleExpander::new(settings.expansion.clone()));

    let app_state = AppState {
        settings: settings.clone(),
        window: window.clone(),
        response_cache: response_cache.clone(),
        health: health.clone(),
        precomputed: precomputed.clone(),
        skipped_store: skipped_store.clone(),
        presenter: presenter.clone(),
        time_provider: time_provider.clone(),
        bearer_token,
        server_tz,
    };

    // Start the background refresher
    let fetcher = IcsFetcher::new(&settings.fetch)?;
    let refresher = Arc::new(Refresher::new(
        settings.clone(),
        fetcher,
        expander.clone(),
        window.clone(),
        response_cache.clone(),
        health.clone(),
        precomputed.clone(),
        skipped_store.clone(),
        presenter.clone(),
        time_provider.clone(),
        server_tz,
    ));
    let (refresher_shutdown_tx, refresher_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let refresher_task = tokio::spawn(refresher.run(refresher_shutdown_rx));

    // Start HTTP server within the current Tokio runtime
    let http_state = app_state.clone();
    let http_addr = settings.http_addr();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(middleware::Logger::default())
            .service(web::resource("/health").route(web::get().to(handlers::health_check)))
            .service(
                web::resource("/api/alexa/next-meeting")
                    .route(web::get().to(handlers::next_meeting)),
            )
            .service(
                web::resource("/api/alexa/time-until-next")
                    .route(web::get().to(handlers::time_until_next)),
            )
            .service(
                web::resource("/api/alexa/done-for-day")
                    .route(web::get().to(handlers::done_for_day)),
            )
            .service(
                web::resource("/api/alexa/launch-summary")
                    .route(web::get().to(handlers::launch_summary)),
            )
            .service(
                web::resource("/api/alexa/morning-summary")
                    .route(web::get().to(handlers::morning_summary)),
            )
    })
    .bind(&http_addr)?
    .shutdown_timeout(5)
    .run();

    let http_handle: ServerHandle = http_server.handle();
    let http_task = tokio::spawn(http_server);

    // Wait for Ctrl-C
    log::info!("Press Ctrl-C to stop");
    match signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Shutdown signal received, stopping server...");
        }
        Err(e) => {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // Stop the refresher, drain HTTP handlers, then cancel in-flight
    // expansions.
    let _ = refresher_shutdown_tx.send(());
    let stop_fut = http_handle.stop(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), stop_fut).await;
    expander.shutdown().await;

    if let Err(e) = refresher_task.await {
        log::error!("Refresher task error: {:?}", e);
    }
    if let Err(e) = http_task.await {
        log::error!("HTTP server task error: {:?}", e);
    }

    Ok(())
}
