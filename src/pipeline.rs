use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::models::{CalendarEvent, CalendarMetadata, RawComponent};

/// Source of "now", injectable so tests can pin the clock.
pub type TimeProvider = std::sync::Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock, for production wiring.
pub fn system_time_provider() -> TimeProvider {
    std::sync::Arc::new(Utc::now)
}

/// Shared mutable state flowing through pipeline stages. Each stage replaces
/// `events` in place and reports what it did via a `ProcessingResult`.
#[derive(Debug, Default)]
pub struct ProcessingContext {
    pub events: Vec<CalendarEvent>,
    pub raw_content: Option<Vec<u8>>,
    pub raw_components: Vec<RawComponent>,
    pub source_url: String,
    pub skipped_event_ids: HashSet<String>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub event_window_size: Option<usize>,
    pub calendar_metadata: CalendarMetadata,
    /// Free-form side channel; precompute stages stash canned responses here.
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw_content(content: Vec<u8>, source_url: impl Into<String>) -> Self {
        ProcessingContext {
            raw_content: Some(content),
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    pub fn with_events(events: Vec<CalendarEvent>) -> Self {
        ProcessingContext {
            events,
            ..Default::default()
        }
    }
}

/// Per-stage outcome. Adding an error marks the stage failed.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub stage_name: String,
    pub success: bool,
    pub events_in: usize,
    pub events_out: usize,
    pub events_filtered: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ProcessingResult {
    pub fn new(stage_name: impl Into<String>, events_in: usize) -> Self {
        ProcessingResult {
            stage_name: stage_name.into(),
            success: false,
            events_in,
            events_out: 0,
            events_filtered: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }

    /// Mark the stage successful with the given output count.
    pub fn complete(&mut self, events_out: usize) {
        self.events_out = events_out;
        self.events_filtered = self.events_in.saturating_sub(events_out);
        self.success = true;
    }
}

/// One step of the event processing pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult;
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub success: bool,
    pub stage_results: Vec<ProcessingResult>,
    pub warnings: Vec<String>,
}

impl PipelineOutcome {
    pub fn failed_stage(&self) -> Option<&ProcessingResult> {
        self.stage_results.iter().find(|r| !r.success)
    }
}

/// Ordered list of stages run over a shared context. A stage failure
/// short-circuits the run; warnings accumulate across stages.
#[derive(Default)]
pub struct EventPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl EventPipeline {
    pub fn new() -> Self {
        EventPipeline { stages: Vec::new() }
    }

    pub fn add_stage(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub async fn process(&self, context: &mut ProcessingContext) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            success: true,
            ..Default::default()
        };

        for stage in &self.stages {
            let result = stage.process(context).await;
            debug!(
                "Stage {}: {} -> {} events ({} filtered, success={})",
                result.stage_name,
                result.events_in,
                result.events_out,
                result.events_filtered,
                result.success
            );
            outcome.warnings.extend(result.warnings.iter().cloned());
            let failed = !result.success;
            if failed {
                for error in &result.errors {
                    warn!("Stage {} failed: {}", result.stage_name, error);
                }
            }
            outcome.stage_results.push(result);
            if failed {
                outcome.success = false;
                break;
            }
        }

        outcome
    }
}
