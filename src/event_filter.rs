use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::models::CalendarEvent;
use crate::skipped::SkippedStore;

/// Predicate filters applied before events are published to the window.
pub struct EventFilter {
    server_tz: Tz,
}

impl EventFilter {
    pub fn new(server_tz: Tz) -> Self {
        EventFilter { server_tz }
    }

    /// Keep events starting after `now`, or all-day events whose calendar
    /// date is today or later in the server timezone. Events whose end
    /// precedes their start are malformed and dropped with a warning.
    pub fn filter_upcoming(
        &self,
        events: Vec<CalendarEvent>,
        now: DateTime<Utc>,
    ) -> Vec<CalendarEvent> {
        let today = now.with_timezone(&self.server_tz).date_naive();
        events
            .into_iter()
            .filter(|event| {
                if event.end.date_time < event.start.date_time {
                    warn!(
                        "Dropping event {} with end before start",
                        event.id
                    );
                    return false;
                }
                if event.is_all_day {
                    // All-day events sit at midnight UTC of their calendar date.
                    event.start.date_time.date_naive() >= today
                } else {
                    event.start.date_time > now
                }
            })
            .collect()
    }

    /// Drop events the skipped store marks. A missing store is the identity;
    /// store errors are logged and treated as "not skipped".
    pub async fn filter_skipped(
        &self,
        events: Vec<CalendarEvent>,
        store: Option<&Arc<dyn SkippedStore>>,
    ) -> Vec<CalendarEvent> {
        let Some(store) = store else {
            return events;
        };
        let skipped = match store.active_list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipped store access failed, treating all events as not skipped: {e}");
                return events;
            }
        };
        if skipped.is_empty() {
            return events;
        }
        let before = events.len();
        let kept: Vec<CalendarEvent> = events
            .into_iter()
            .filter(|event| !skipped.contains_key(&event.id))
            .collect();
        if kept.len() != before {
            info!("Filtered out {} skipped events", before - kept.len());
        }
        kept
    }
}

/// Decides whether a refresh result should replace the current window.
pub struct SmartFallbackHandler;

impl SmartFallbackHandler {
    /// The window is preserved only when every source failed (no parsed
    /// events) and there is existing state worth keeping.
    pub fn should_preserve_existing_window(
        parsed_count: usize,
        existing_count: usize,
        sources_count: usize,
    ) -> (bool, String) {
        if parsed_count == 0 {
            if existing_count > 0 {
                return (
                    true,
                    format!(
                        "all {} sources failed, preserving {} existing events",
                        sources_count, existing_count
                    ),
                );
            }
            return (
                false,
                format!("all {} sources failed, no cached events", sources_count),
            );
        }
        (false, "processing new events normally".to_string())
    }
}

/// The authoritative rolling window: an immutable event sequence behind a
/// mutex-guarded slot. Readers lock only to clone the Arc; iteration happens
/// lock-free on the immutable snapshot. The version counter bumps on every
/// replacement and never on fallback preservation.
pub struct EventWindow {
    slot: Mutex<Arc<Vec<CalendarEvent>>>,
    version: AtomicU64,
}

impl EventWindow {
    pub fn new() -> Self {
        EventWindow {
            slot: Mutex::new(Arc::new(Vec::new())),
            version: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> Arc<Vec<CalendarEvent>> {
        self.slot.lock().await.clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    async fn replace(&self, events: Vec<CalendarEvent>) -> u64 {
        let mut slot = self.slot.lock().await;
        *slot = Arc::new(events);
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a window update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    pub updated: bool,
    pub count: usize,
    pub message: String,
}

/// Applies the publish path: upcoming filter, skipped filter, sort, size cap,
/// fallback decision, atomic swap.
pub struct EventWindowManager {
    filter: EventFilter,
}

impl EventWindowManager {
    pub fn new(server_tz: Tz) -> Self {
        EventWindowManager {
            filter: EventFilter::new(server_tz),
        }
    }

    pub async fn update_window(
        &self,
        window: &EventWindow,
        parsed_events: Vec<CalendarEvent>,
        now: DateTime<Utc>,
        skipped_store: Option<&Arc<dyn SkippedStore>>,
        event_window_size: usize,
        sources_count: usize,
    ) -> WindowUpdate {
        let parsed_count = parsed_events.len();

        let upcoming = self.filter.filter_upcoming(parsed_events, now);
        let mut candidate = self.filter.filter_skipped(upcoming, skipped_store).await;
        candidate.sort_by(|a, b| {
            a.start
                .date_time
                .cmp(&b.start.date_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidate.truncate(event_window_size);

        let existing_count = window.snapshot().await.len();
        let (preserve, message) = SmartFallbackHandler::should_preserve_existing_window(
            parsed_count,
            existing_count,
            sources_count,
        );
        if parsed_count == 0 {
            // Both empty-refresh branches leave the slot untouched; `preserve`
            // only distinguishes whether anything was worth keeping.
            if preserve {
                info!("Window preserved: {}", message);
            } else {
                warn!("Window left empty: {}", message);
            }
            return WindowUpdate {
                updated: false,
                count: existing_count,
                message,
            };
        }

        let count = candidate.len();
        let version = window.replace(candidate).await;
        debug!(
            "Window replaced: {} events, version {} ({})",
            count, version, message
        );
        WindowUpdate {
            updated: true,
            count,
            message,
        }
    }
}
