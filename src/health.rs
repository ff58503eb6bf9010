use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A refresh success older than this degrades overall status.
const REFRESH_OK_THRESHOLD_SECONDS: i64 = 15 * 60;
/// A background heartbeat older than this marks the task stale.
const HEARTBEAT_STALE_THRESHOLD_SECONDS: i64 = 10 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTaskInfo {
    pub name: String,
    pub last_heartbeat_age_s: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub server_time_iso: String,
    pub uptime_seconds: i64,
    pub pid: u32,
    pub event_count: usize,
    pub last_refresh_success_age_seconds: Option<i64>,
    pub background_tasks: Vec<BackgroundTaskInfo>,
}

#[derive(Debug)]
struct HealthState {
    started_at: DateTime<Utc>,
    last_refresh_attempt: Option<DateTime<Utc>>,
    last_refresh_success: Option<DateTime<Utc>>,
    event_count: usize,
    background_heartbeat: Option<DateTime<Utc>>,
}

/// Thread-safe, timestamp-based health state for the refresher and the
/// `/health` endpoint. All reads come from a single lock acquisition so the
/// exposed snapshot is never torn.
pub struct HealthTracker {
    inner: Mutex<HealthState>,
}

impl HealthTracker {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        HealthTracker {
            inner: Mutex::new(HealthState {
                started_at,
                last_refresh_attempt: None,
                last_refresh_success: None,
                event_count: 0,
                background_heartbeat: None,
            }),
        }
    }

    pub fn record_refresh_attempt(&self) {
        self.inner.lock().unwrap().last_refresh_attempt = Some(Utc::now());
    }

    pub fn record_refresh_success(&self, event_count: usize) {
        let mut state = self.inner.lock().unwrap();
        state.last_refresh_success = Some(Utc::now());
        state.event_count = event_count;
    }

    pub fn record_background_heartbeat(&self) {
        self.inner.lock().unwrap().background_heartbeat = Some(Utc::now());
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().event_count
    }

    pub fn get_health_status(&self, now: DateTime<Utc>) -> HealthStatus {
        let state = self.inner.lock().unwrap();

        let last_refresh_success_age_seconds = state
            .last_refresh_success
            .map(|at| (now - at).num_seconds());
        let status = match last_refresh_success_age_seconds {
            Some(age) if age <= REFRESH_OK_THRESHOLD_SECONDS => "ok",
            _ => "degraded",
        };

        let background_tasks = state
            .background_heartbeat
            .map(|at| {
                let age = (now - at).num_seconds();
                let task_status = if age <= HEARTBEAT_STALE_THRESHOLD_SECONDS {
                    "running"
                } else {
                    "stale"
                };
                vec![BackgroundTaskInfo {
                    name: "refresher_task".to_string(),
                    last_heartbeat_age_s: age,
                    status: task_status.to_string(),
                }]
            })
            .unwrap_or_default();

        HealthStatus {
            status: status.to_string(),
            server_time_iso: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            uptime_seconds: (now - state.started_at).num_seconds(),
            pid: std::process::id(),
            event_count: state.event_count,
            last_refresh_success_age_seconds,
            background_tasks,
        }
    }

    #[cfg(test)]
    fn backdate_refresh_success(&self, seconds: i64) {
        let mut state = self.inner.lock().unwrap();
        state.last_refresh_success = Some(Utc::now() - chrono::Duration::seconds(seconds));
    }

    #[cfg(test)]
    fn backdate_heartbeat(&self, seconds: i64) {
        let mut state = self.inner.lock().unwrap();
        state.background_heartbeat = Some(Utc::now() - chrono::Duration::seconds(seconds));
    }
}
