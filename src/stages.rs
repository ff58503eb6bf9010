use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::models::CalendarEvent;
use crate::parser::IcsParser;
use crate::pipeline::{PipelineStage, ProcessingContext, ProcessingResult, TimeProvider};
use crate::rrule::RruleExpander;

/// Parse raw ICS bytes from the context into events.
pub struct ParseStage {
    parser: Arc<IcsParser>,
}

impl ParseStage {
    pub fn new(parser: Arc<IcsParser>) -> Self {
        ParseStage { parser }
    }
}

#[async_trait]
impl PipelineStage for ParseStage {
    fn name(&self) -> &str {
        "Parse"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), 0);

        let Some(raw) = context.raw_content.as_deref() else {
            result.add_error("No raw ICS content to parse");
            return result;
        };

        let content_len = raw.len();
        let parse_result = self.parser.parse_bytes(raw, &context.source_url).await;
        if !parse_result.success {
            result.add_error(format!(
                "ICS parsing failed: {}",
                parse_result
                    .error_message
                    .as_deref()
                    .unwrap_or("Unknown error")
            ));
            return result;
        }

        for warning in &parse_result.warnings {
            result.add_warning(warning.clone());
        }
        context.events = parse_result.events;
        context.raw_components = parse_result.raw_components;
        context.calendar_metadata = parse_result.metadata;

        info!(
            "Parsed {} events from ICS content ({} bytes)",
            context.events.len(),
            content_len
        );
        result.complete(context.events.len());
        result
    }
}

/// Expand recurring events via the bounded worker pool.
pub struct RruleExpansionStage {
    expander: Arc<RruleExpander>,
    time_provider: TimeProvider,
}

impl RruleExpansionStage {
    pub fn new(expander: Arc<RruleExpander>, time_provider: TimeProvider) -> Self {
        RruleExpansionStage {
            expander,
            time_provider,
        }
    }
}

#[async_trait]
impl PipelineStage for RruleExpansionStage {
    fn name(&self) -> &str {
        "RRULEExpansion"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());

        if context.events.is_empty() {
            result.complete(0);
            return result;
        }

        let anchor = (self.time_provider)();
        let events = std::mem::take(&mut context.events);
        let (expanded, warnings) = self
            .expander
            .expand_events(events, &context.raw_components, anchor)
            .await;
        for warning in warnings {
            result.add_warning(warning);
        }
        context.events = expanded;

        let generated = context.events.len().saturating_sub(result.events_in);
        if generated > 0 {
            info!(
                "RRULE expansion: {} -> {} events ({} instances generated)",
                result.events_in,
                context.events.len(),
                generated
            );
        }
        result.complete(context.events.len());
        result
    }
}

/// Keep one event per id, preferring the one carrying more information.
pub struct DeduplicationStage;

#[async_trait]
impl PipelineStage for DeduplicationStage {
    fn name(&self) -> &str {
        "Deduplication"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());

        let mut unique: HashMap<String, CalendarEvent> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for event in context.events.drain(..) {
            match unique.get(&event.id) {
                None => {
                    order.push(event.id.clone());
                    unique.insert(event.id.clone(), event);
                }
                Some(existing) => {
                    if event.info_score() > existing.info_score() {
                        unique.insert(event.id.clone(), event);
                    }
                }
            }
        }
        context.events = order
            .into_iter()
            .filter_map(|id| unique.remove(&id))
            .collect();

        result.complete(context.events.len());
        if result.events_filtered > 0 {
            debug!(
                "Deduplication: {} -> {} events ({} duplicates removed)",
                result.events_in, result.events_out, result.events_filtered
            );
        }
        result
    }
}

/// Sort ascending by start instant; ties break on id so ordering is total.
pub struct SortStage;

#[async_trait]
impl PipelineStage for SortStage {
    fn name(&self) -> &str {
        "Sort"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());
        context
            .events
            .sort_by(|a, b| {
                a.start
                    .date_time
                    .cmp(&b.start.date_time)
                    .then_with(|| a.id.cmp(&b.id))
            });
        result.complete(context.events.len());
        result
    }
}

/// Drop events whose id is in the context's skipped set.
pub struct SkippedEventsFilterStage;

#[async_trait]
impl PipelineStage for SkippedEventsFilterStage {
    fn name(&self) -> &str {
        "SkippedEventsFilter"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());

        if !context.skipped_event_ids.is_empty() {
            let skipped = &context.skipped_event_ids;
            context.events.retain(|event| !skipped.contains(&event.id));
        }

        result.complete(context.events.len());
        if result.events_filtered > 0 {
            info!("Filtered out {} skipped events", result.events_filtered);
        }
        result
    }
}

/// Keep events inside [window_start, window_end]; either bound is optional.
pub struct TimeWindowStage;

#[async_trait]
impl PipelineStage for TimeWindowStage {
    fn name(&self) -> &str {
        "TimeWindow"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());

        if context.window_start.is_some() || context.window_end.is_some() {
            let start = context.window_start;
            let end = context.window_end;
            context.events.retain(|event| {
                let at = event.start.date_time;
                if let Some(s) = start {
                    if at < s {
                        return false;
                    }
                }
                if let Some(e) = end {
                    if at > e {
                        return false;
                    }
                }
                true
            });
        }

        result.complete(context.events.len());
        debug!(
            "Time window: {} -> {} events (window: {:?} to {:?})",
            result.events_in, result.events_out, context.window_start, context.window_end
        );
        result
    }
}

/// Truncate to the first N events; assumes an earlier sort stage.
pub struct EventLimitStage;

#[async_trait]
impl PipelineStage for EventLimitStage {
    fn name(&self) -> &str {
        "EventLimit"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());

        if let Some(limit) = context.event_window_size {
            if context.events.len() > limit {
                context.events.truncate(limit);
                debug!(
                    "Event limit: {} -> {} events (limit={})",
                    result.events_in,
                    context.events.len(),
                    limit
                );
            }
        }

        result.complete(context.events.len());
        result
    }
}
