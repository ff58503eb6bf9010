use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use tokio::sync::{oneshot, Mutex, Semaphore};

use crate::config::Settings;
use crate::event_filter::{EventWindow, EventWindowManager};
use crate::fetcher::IcsFetcher;
use crate::health::HealthTracker;
use crate::models::CalendarEvent;
use crate::parser::IcsParser;
use crate::pipeline::{EventPipeline, ProcessingContext, TimeProvider};
use crate::precompute::{create_precompute_pipeline, PrecomputedResponses};
use crate::response_cache::ResponseCache;
use crate::rrule::RruleExpander;
use crate::skipped::SkippedStore;
use crate::speech::Presenter;
use crate::stages::{
    DeduplicationStage, ParseStage, RruleExpansionStage, SortStage, TimeWindowStage,
};

/// Fetch fan-out is clamped to this range regardless of configuration.
const MIN_FETCH_CONCURRENCY: usize = 1;
const MAX_FETCH_CONCURRENCY: usize = 3;

/// Per-source state carried between ticks for conditional requests and
/// 304 reuse.
#[derive(Debug, Default, Clone)]
struct SourceState {
    etag: Option<String>,
    last_modified: Option<String>,
    last_events: Vec<CalendarEvent>,
}

/// Supervised background task: periodically fetches all sources, feeds them
/// through the processing pipeline, and publishes the merged event window.
pub struct Refresher {
    settings: Settings,
    fetcher: IcsFetcher,
    parser: Arc<IcsParser>,
    expander: Arc<RruleExpander>,
    window: Arc<EventWindow>,
    window_manager: EventWindowManager,
    response_cache: Arc<ResponseCache>,
    health: Arc<HealthTracker>,
    precomputed: Arc<PrecomputedResponses>,
    skipped_store: Option<Arc<dyn SkippedStore>>,
    presenter: Arc<dyn Presenter>,
    time_provider: TimeProvider,
    server_tz: Tz,
    fetch_semaphore: Arc<Semaphore>,
    source_states: Mutex<HashMap<String, SourceState>>,
}

impl Refresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        fetcher: IcsFetcher,
        expander: Arc<RruleExpander>,
        window: Arc<EventWindow>,
        response_cache: Arc<ResponseCache>,
        health: Arc<HealthTracker>,
        precomputed: Arc<PrecomputedResponses>,
        skipped_store: Option<Arc<dyn SkippedStore>>,
        presenter: Arc<dyn Presenter>,
        time_provider: TimeProvider,
        server_tz: Tz,
    ) -> Self {
        let concurrency = settings
            .refresh
            .fetch_concurrency
            .clamp(MIN_FETCH_CONCURRENCY, MAX_FETCH_CONCURRENCY);
        Refresher {
            window_manager: EventWindowManager::new(server_tz),
            fetch_semaphore: Arc::new(Semaphore::new(concurrency)),
            settings,
            fetcher,
            parser: Arc::new(IcsParser::new()),
            expander,
            window,
            response_cache,
            health,
            precomputed,
            skipped_store,
            presenter,
            time_provider,
            server_tz,
            source_states: Mutex::new(HashMap::new()),
        }
    }

    /// Run until the shutdown signal fires. Each tick is isolated: whatever
    /// goes wrong is logged and the loop continues.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.refresh.interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "Refresher started: {} sources, every {}s",
            self.settings.sources.len(),
            self.settings.refresh.interval_seconds
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_once().await;
                }
                _ = &mut shutdown_rx => {
                    info!("Refresher shutting down");
                    break;
                }
            }
        }
    }

    /// One refresh tick.
    pub async fn refresh_once(&self) {
        self.health.record_refresh_attempt();
        self.health.record_background_heartbeat();

        let sources = self.settings.sources.clone();
        if sources.is_empty() {
            debug!("No ICS sources configured, skipping refresh");
            return;
        }

        let fetches = sources.iter().map(|url| self.fetch_and_process(url));
        let results = futures::future::join_all(fetches).await;

        let mut merged: Vec<CalendarEvent> = Vec::new();
        for events in results.into_iter().flatten() {
            merged.extend(events);
        }

        self.apply_merged(merged, sources.len()).await;
    }

    /// Fetch one source under the fan-out semaphore and run it through the
    /// per-source pipeline. Returns `None` when the source contributed
    /// nothing this tick.
    async fn fetch_and_process(&self, url: &str) -> Option<Vec<CalendarEvent>> {
        let _permit = self.fetch_semaphore.acquire().await.ok()?;

        let (etag, last_modified) = {
            let states = self.source_states.lock().await;
            let state = states.get(url).cloned().unwrap_or_default();
            (state.etag, state.last_modified)
        };

        let response = self
            .fetcher
            .fetch(url, etag.as_deref(), last_modified.as_deref())
            .await;
        if !response.success {
            warn!(
                "Source fetch failed url={} error={}",
                url,
                response.error_message.as_deref().unwrap_or("unknown")
            );
            return None;
        }

        let body = match response.content {
            Some(body) => body,
            None => {
                // 304 Not Modified: reuse the previous successful parse.
                let states = self.source_states.lock().await;
                let cached = states.get(url).map(|s| s.last_events.clone());
                debug!(
                    "Source not modified, reusing {} cached events url={}",
                    cached.as_ref().map(Vec::len).unwrap_or(0),
                    url
                );
                return cached;
            }
        };

        let events = self.process_body(body.to_vec(), url).await?;
        let mut states = self.source_states.lock().await;
        states.insert(
            url.to_string(),
            SourceState {
                etag: response.etag,
                last_modified: response.last_modified,
                last_events: events.clone(),
            },
        );
        Some(events)
    }

    /// Parse, expand, dedupe, sort and horizon-bound one source body.
    async fn process_body(&self, body: Vec<u8>, url: &str) -> Option<Vec<CalendarEvent>> {
        let pipeline = EventPipeline::new()
            .add_stage(ParseStage::new(self.parser.clone()))
            .add_stage(RruleExpansionStage::new(
                self.expander.clone(),
                self.time_provider.clone(),
            ))
            .add_stage(DeduplicationStage)
            .add_stage(SortStage)
            .add_stage(TimeWindowStage);

        let mut context = ProcessingContext::with_raw_content(body, url);
        context.window_end = Some(
            (self.time_provider)() + ChronoDuration::days(self.settings.refresh.window_days),
        );
        let outcome = pipeline.process(&mut context).await;
        if !outcome.success {
            let stage = outcome
                .failed_stage()
                .map(|r| r.stage_name.clone())
                .unwrap_or_default();
            error!("Source pipeline failed url={} stage={}", url, stage);
            return None;
        }
        for warning in &outcome.warnings {
            warn!("Source pipeline warning url={}: {}", url, warning);
        }
        Some(std::mem::take(&mut context.events))
    }

    /// Publish the merged event list, honoring smart fallback, then refresh
    /// the response cache and precomputed answers.
    async fn apply_merged(&self, merged: Vec<CalendarEvent>, sources_count: usize) {
        let now = (self.time_provider)();
        let update = self
            .window_manager
            .update_window(
                &self.window,
                merged,
                now,
                self.skipped_store.as_ref(),
                self.settings.refresh.event_window_size,
                sources_count,
            )
            .await;

        if update.updated {
            // Invalidate before precompute so new entries key to the fresh
            // window version.
            self.response_cache.invalidate_all();
            self.run_precompute().await;
            info!(
                "Refresh complete: {} events published (cache version {})",
                update.count,
                self.response_cache.window_version()
            );
        } else {
            info!("Refresh finished without publication: {}", update.message);
        }

        if update.updated || update.count > 0 {
            self.health.record_refresh_success(update.count);
        }
    }

    async fn run_precompute(&self) {
        let snapshot = self.window.snapshot().await;
        let pipeline = create_precompute_pipeline(
            self.server_tz,
            self.time_provider.clone(),
            self.skipped_store.clone(),
            self.presenter.clone(),
        );
        let mut context = ProcessingContext::with_events(snapshot.as_ref().clone());
        let outcome = pipeline.process(&mut context).await;
        if outcome.success {
            self.precomputed
                .replace_all(PrecomputedResponses::from_context(&context));
        } else {
            warn!("Precompute pipeline failed; serving on-demand answers only");
        }
    }
}
