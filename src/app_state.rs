use std::sync::Arc;

use chrono_tz::Tz;

use crate::config::Settings;
use crate::event_filter::EventWindow;
use crate::health::HealthTracker;
use crate::pipeline::TimeProvider;
use crate::precompute::PrecomputedResponses;
use crate::response_cache::ResponseCache;
use crate::skipped::SkippedStore;
use crate::speech::Presenter;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub window: Arc<EventWindow>,
    pub response_cache: Arc<ResponseCache>,
    pub health: Arc<HealthTracker>,
    pub precomputed: Arc<PrecomputedResponses>,
    pub skipped_store: Option<Arc<dyn SkippedStore>>,
    pub presenter: Arc<dyn Presenter>,
    pub time_provider: TimeProvider,
    pub bearer_token: Option<String>,
    pub server_tz: Tz,
}
