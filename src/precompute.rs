use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono_tz::Tz;
use log::debug;
use serde_json::{Map, Value};

use crate::pipeline::{
    EventPipeline, PipelineStage, ProcessingContext, ProcessingResult, TimeProvider,
};
use crate::query;
use crate::skipped::SkippedStore;
use crate::speech::Presenter;

/// Context slot the precompute stages write into.
pub const PRECOMPUTED_RESPONSES_KEY: &str = "precomputed_responses";

/// Shared map of precomputed responses, keyed `<HandlerName>:<timezone>`.
/// Handlers consult it after a cache miss, before computing on demand.
#[derive(Default)]
pub struct PrecomputedResponses {
    inner: Mutex<HashMap<String, Value>>,
}

impl PrecomputedResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Swap in the results of a fresh precompute run.
    pub fn replace_all(&self, entries: HashMap<String, Value>) {
        *self.inner.lock().unwrap() = entries;
    }

    /// Extract the entries a precompute pipeline left on the context.
    pub fn from_context(context: &ProcessingContext) -> HashMap<String, Value> {
        context
            .extra
            .get(PRECOMPUTED_RESPONSES_KEY)
            .and_then(Value::as_object)
            .map(|object| {
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn store_response(context: &mut ProcessingContext, key: String, response: Value) {
    let slot = context
        .extra
        .entry(PRECOMPUTED_RESPONSES_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(object) = slot.as_object_mut() {
        object.insert(key, response);
    }
}

/// Shared wiring for the three precompute stages.
struct PrecomputeParts {
    tz: Tz,
    time_provider: TimeProvider,
    skipped_store: Option<Arc<dyn SkippedStore>>,
    presenter: Arc<dyn Presenter>,
}

impl PrecomputeParts {
    fn key(&self, handler: &str) -> String {
        format!("{handler}:{}", self.tz.name())
    }
}

pub struct NextMeetingPrecomputeStage {
    parts: PrecomputeParts,
}

impl NextMeetingPrecomputeStage {
    pub fn new(
        tz: Tz,
        time_provider: TimeProvider,
        skipped_store: Option<Arc<dyn SkippedStore>>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        NextMeetingPrecomputeStage {
            parts: PrecomputeParts {
                tz,
                time_provider,
                skipped_store,
                presenter,
            },
        }
    }
}

#[async_trait]
impl PipelineStage for NextMeetingPrecomputeStage {
    fn name(&self) -> &str {
        "NextMeetingPrecompute"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());
        let now = (self.parts.time_provider)();
        let skipped = query::skipped_ids(self.parts.skipped_store.as_ref()).await;
        let response = query::next_meeting_response(
            &context.events,
            now,
            &skipped,
            self.parts.presenter.as_ref(),
        );
        let key = self.parts.key("NextMeetingHandler");
        debug!("Precomputed {}", key);
        store_response(context, key, response);
        result.complete(context.events.len());
        result
    }
}

pub struct TimeUntilPrecomputeStage {
    parts: PrecomputeParts,
}

impl TimeUntilPrecomputeStage {
    pub fn new(
        tz: Tz,
        time_provider: TimeProvider,
        skipped_store: Option<Arc<dyn SkippedStore>>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        TimeUntilPrecomputeStage {
            parts: PrecomputeParts {
                tz,
                time_provider,
                skipped_store,
                presenter,
            },
        }
    }
}

#[async_trait]
impl PipelineStage for TimeUntilPrecomputeStage {
    fn name(&self) -> &str {
        "TimeUntilPrecompute"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());
        let now = (self.parts.time_provider)();
        let skipped = query::skipped_ids(self.parts.skipped_store.as_ref()).await;
        let response = query::time_until_response(
            &context.events,
            now,
            &skipped,
            self.parts.presenter.as_ref(),
        );
        let key = self.parts.key("TimeUntilHandler");
        debug!("Precomputed {}", key);
        store_response(context, key, response);
        result.complete(context.events.len());
        result
    }
}

pub struct DoneForDayPrecomputeStage {
    parts: PrecomputeParts,
}

impl DoneForDayPrecomputeStage {
    pub fn new(
        tz: Tz,
        time_provider: TimeProvider,
        skipped_store: Option<Arc<dyn SkippedStore>>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        DoneForDayPrecomputeStage {
            parts: PrecomputeParts {
                tz,
                time_provider,
                skipped_store,
                presenter,
            },
        }
    }
}

#[async_trait]
impl PipelineStage for DoneForDayPrecomputeStage {
    fn name(&self) -> &str {
        "DoneForDayPrecompute"
    }

    async fn process(&self, context: &mut ProcessingContext) -> ProcessingResult {
        let mut result = ProcessingResult::new(self.name(), context.events.len());
        let now = (self.parts.time_provider)();
        let skipped = query::skipped_ids(self.parts.skipped_store.as_ref()).await;
        let response = query::done_for_day_response(
            &context.events,
            now,
            &self.parts.tz,
            Some(self.parts.tz.name()),
            &skipped,
            self.parts.presenter.as_ref(),
        );
        let key = self.parts.key("DoneForDayHandler");
        debug!("Precomputed {}", key);
        store_response(context, key, response);
        result.complete(context.events.len());
        result
    }
}

/// The side-pipeline run after each successful refresh, for the server
/// default timezone.
pub fn create_precompute_pipeline(
    tz: Tz,
    time_provider: TimeProvider,
    skipped_store: Option<Arc<dyn SkippedStore>>,
    presenter: Arc<dyn Presenter>,
) -> EventPipeline {
    EventPipeline::new()
        .add_stage(NextMeetingPrecomputeStage::new(
            tz,
            time_provider.clone(),
            skipped_store.clone(),
            presenter.clone(),
        ))
        .add_stage(TimeUntilPrecomputeStage::new(
            tz,
            time_provider.clone(),
            skipped_store.clone(),
            presenter.clone(),
        ))
        .add_stage(DoneForDayPrecomputeStage::new(
            tz,
            time_provider,
            skipped_store,
            presenter,
        ))
}
