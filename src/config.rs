use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub refresh: RefreshConfig,
    pub fetch: FetchConfig,
    pub expansion: ExpansionConfig,
    pub alexa: AlexaConfig,
    /// ICS source URLs, fetched concurrently on each refresh tick.
    pub sources: Vec<String>,
    /// Path for the persisted skipped-event store. Empty = default location.
    pub skipped_store_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub http_host: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RefreshConfig {
    pub interval_seconds: u64,
    /// Concurrent source fetches; clamped to [1, 3] at the point of use.
    pub fetch_concurrency: usize,
    pub event_window_size: usize,
    /// How far ahead of `now` the event window extends.
    pub window_days: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FetchConfig {
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExpansionConfig {
    pub concurrency: usize,
    pub max_occurrences_per_rule: usize,
    pub expansion_days_window: i64,
    pub time_budget_ms_per_rule: u64,
    pub yield_frequency: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlexaConfig {
    /// Bearer token required on /api/alexa/* endpoints. Empty = auth disabled.
    pub bearer_token: String,
    pub default_timezone: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.http_port", 8080)?
            .set_default("server.http_host", "127.0.0.1")?
            .set_default("logging.level", "info")?
            .set_default("refresh.interval_seconds", 300)?
            .set_default("refresh.fetch_concurrency", 2)?
            .set_default("refresh.event_window_size", 50)?
            .set_default("refresh.window_days", 30)?
            .set_default("fetch.request_timeout_seconds", 30)?
            .set_default("fetch.max_retries", 3)?
            .set_default("fetch.retry_backoff_factor", 2.0)?
            .set_default("expansion.concurrency", 1)?
            .set_default("expansion.max_occurrences_per_rule", 250)?
            .set_default("expansion.expansion_days_window", 365)?
            .set_default("expansion.time_budget_ms_per_rule", 200)?
            .set_default("expansion.yield_frequency", 50)?
            .set_default("alexa.bearer_token", "")?
            .set_default("alexa.default_timezone", "")?
            .set_default("sources", Vec::<String>::new())?
            .set_default("skipped_store_path", "")?
            // Add config file if it exists
            .add_source(File::with_name("config").required(false))
            // Add environment variables with prefix CALENDARBOT_
            // e.g., CALENDARBOT_SERVER__HTTP_PORT=8081
            .add_source(Environment::with_prefix("CALENDARBOT").separator("__"))
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_simple_env_overrides();
        Ok(settings)
    }

    /// Flat environment variables consumed by the embedding process. These
    /// predate the structured CALENDARBOT_SECTION__KEY form and win over it.
    fn apply_simple_env_overrides(&mut self) {
        if let Some(url) = std::env::var("CALENDARBOT_ICS_URL")
            .ok()
            .or_else(|| std::env::var("ICS_SOURCE").ok())
        {
            if !url.trim().is_empty() {
                self.sources = url
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
        if let Ok(token) = std::env::var("CALENDARBOT_ALEXA_BEARER_TOKEN") {
            self.alexa.bearer_token = token;
        }
        if let Ok(tz) = std::env::var("CALENDARBOT_DEFAULT_TIMEZONE") {
            self.alexa.default_timezone = tz;
        }
        if let Ok(level) = std::env::var("CALENDARBOT_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.logging.level = level;
            }
        }
        if is_truthy(std::env::var("CALENDARBOT_DEBUG").ok().as_deref()) {
            self.logging.level = "debug".to_string();
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.http_host, self.server.http_port)
    }

    /// Bearer token as an Option; empty string means auth is disabled.
    pub fn bearer_token(&self) -> Option<String> {
        let token = self.alexa.bearer_token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}
