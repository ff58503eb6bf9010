use std::panic::AssertUnwindSafe;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse, Result};
use chrono_tz::Tz;
use futures::FutureExt;
use log::{info, warn};
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::morning_summary::{DetailLevel, MorningSummaryRequest, MorningSummaryService};
use crate::query;
use crate::speech::serialize_datetime_utc;
use crate::timezone::parse_request_timezone;

/// Upper bound for the morning-summary max_events parameter.
const MAX_EVENTS_LIMIT: usize = 200;

enum EnvelopeError {
    Unauthorized,
    BadRequest(String),
}

impl EnvelopeError {
    fn status(&self) -> u16 {
        match self {
            EnvelopeError::Unauthorized => 401,
            EnvelopeError::BadRequest(_) => 400,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            EnvelopeError::Unauthorized => "AuthenticationError",
            EnvelopeError::BadRequest(_) => "ValidationError",
        }
    }

    fn response(&self) -> HttpResponse {
        match self {
            EnvelopeError::Unauthorized => {
                HttpResponse::Unauthorized().json(json!({"error": "Unauthorized"}))
            }
            EnvelopeError::BadRequest(message) => HttpResponse::BadRequest()
                .json(json!({"error": "Bad request", "message": scrub_error_text(message)})),
        }
    }
}

/// Error text is user-facing; strip anything that looks like a leaked path
/// or address, including such fragments echoed back from request input.
fn scrub_error_text(message: &str) -> String {
    let mut out = message.to_string();
    for needle in ["0x", "File \"", "/home/", "C:\\", "/usr/"] {
        out = out.replace(needle, "");
    }
    out
}

fn check_auth(req: &HttpRequest, bearer_token: Option<&str>) -> std::result::Result<(), EnvelopeError> {
    let Some(expected) = bearer_token else {
        return Ok(());
    };
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match header.strip_prefix("Bearer ") {
        Some(token) if token == expected => Ok(()),
        _ => Err(EnvelopeError::Unauthorized),
    }
}

fn parse_query_params(req: &HttpRequest) -> std::result::Result<Vec<(String, String)>, EnvelopeError> {
    web::Query::<Vec<(String, String)>>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .map_err(|_| EnvelopeError::BadRequest("Malformed query string".to_string()))
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn effective_timezone(
    params: &[(String, String)],
    key: &str,
    state: &AppState,
) -> std::result::Result<Tz, EnvelopeError> {
    parse_request_timezone(param(params, key), &state.server_tz)
        .map_err(EnvelopeError::BadRequest)
}

fn log_completed(handler: &str, started: Instant, cache_hit: bool) {
    info!(
        "alexa.request.completed handler={} latency_ms={:.2} cache_hit={} status=200",
        handler,
        started.elapsed().as_secs_f64() * 1000.0,
        cache_hit
    );
}

fn log_failed(handler: &str, started: Instant, error: &EnvelopeError) {
    warn!(
        "alexa.request.failed handler={} latency_ms={:.2} error_type={} status={}",
        handler,
        started.elapsed().as_secs_f64() * 1000.0,
        error.error_type(),
        error.status()
    );
}

/// Envelope shared by every query handler: auth, validated params, cache
/// lookup, precomputed lookup, on-demand compute, cache store, telemetry.
async fn run_envelope<F>(
    handler_name: &'static str,
    req: &HttpRequest,
    state: &AppState,
    precompute_key: Option<String>,
    compute: F,
) -> HttpResponse
where
    F: std::future::Future<Output = std::result::Result<Value, EnvelopeError>>,
{
    let started = Instant::now();

    if let Err(error) = check_auth(req, state.bearer_token.as_deref()) {
        log_failed(handler_name, started, &error);
        return error.response();
    }
    let params = match parse_query_params(req) {
        Ok(params) => params,
        Err(error) => {
            log_failed(handler_name, started, &error);
            return error.response();
        }
    };

    let cache_key = state.response_cache.generate_key(handler_name, &params);
    if let Some(cached) = state.response_cache.get(&cache_key) {
        log_completed(handler_name, started, true);
        return HttpResponse::Ok().json(cached);
    }

    if let Some(key) = precompute_key {
        if let Some(body) = state.precomputed.get(&key) {
            state.response_cache.set(cache_key, body.clone());
            log_completed(handler_name, started, false);
            return HttpResponse::Ok().json(body);
        }
    }

    // A panic in handler logic must never leak details to the client.
    match AssertUnwindSafe(compute).catch_unwind().await {
        Ok(Ok(body)) => {
            state.response_cache.set(cache_key, body.clone());
            log_completed(handler_name, started, false);
            HttpResponse::Ok().json(body)
        }
        Ok(Err(error)) => {
            log_failed(handler_name, started, &error);
            error.response()
        }
        Err(_) => {
            warn!(
                "alexa.request.failed handler={} latency_ms={:.2} error_type=HandlerInternalError status=500",
                handler_name,
                started.elapsed().as_secs_f64() * 1000.0
            );
            HttpResponse::InternalServerError().json(json!({
                "error": "Internal server error",
                "message": "An unexpected error occurred"
            }))
        }
    }
}

pub async fn health_check(data: web::Data<AppState>) -> Result<HttpResponse> {
    let now = (data.time_provider)();
    let status = data.health.get_health_status(now);
    Ok(HttpResponse::Ok().json(status))
}

pub async fn next_meeting(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let state = data.get_ref().clone();
    let req_clone = req.clone();
    let response = run_envelope(
        "NextMeetingHandler",
        &req,
        &state,
        precompute_key_for(&req, &state, "NextMeetingHandler"),
        async {
            let params = parse_query_params(&req_clone)?;
            // Validates tz even though the answer is timezone-independent.
            effective_timezone(&params, "tz", &state)?;
            let now = (state.time_provider)();
            let window = state.window.snapshot().await;
            let skipped = query::skipped_ids(state.skipped_store.as_ref()).await;
            Ok(query::next_meeting_response(
                &window,
                now,
                &skipped,
                state.presenter.as_ref(),
            ))
        },
    )
    .await;
    Ok(response)
}

pub async fn time_until_next(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let state = data.get_ref().clone();
    let req_clone = req.clone();
    let response = run_envelope(
        "TimeUntilHandler",
        &req,
        &state,
        precompute_key_for(&req, &state, "TimeUntilHandler"),
        async {
            let params = parse_query_params(&req_clone)?;
            effective_timezone(&params, "tz", &state)?;
            let now = (state.time_provider)();
            let window = state.window.snapshot().await;
            let skipped = query::skipped_ids(state.skipped_store.as_ref()).await;
            Ok(query::time_until_response(
                &window,
                now,
                &skipped,
                state.presenter.as_ref(),
            ))
        },
    )
    .await;
    Ok(response)
}

pub async fn done_for_day(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let state = data.get_ref().clone();
    let req_clone = req.clone();
    let response = run_envelope(
        "DoneForDayHandler",
        &req,
        &state,
        precompute_key_for(&req, &state, "DoneForDayHandler"),
        async {
            let params = parse_query_params(&req_clone)?;
            let tz = effective_timezone(&params, "tz", &state)?;
            let tz_label = param(&params, "tz");
            let now = (state.time_provider)();
            let window = state.window.snapshot().await;
            let skipped = query::skipped_ids(state.skipped_store.as_ref()).await;
            Ok(query::done_for_day_response(
                &window,
                now,
                &tz,
                tz_label,
                &skipped,
                state.presenter.as_ref(),
            ))
        },
    )
    .await;
    Ok(response)
}

pub async fn launch_summary(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let state = data.get_ref().clone();
    let req_clone = req.clone();
    let response = run_envelope(
        "LaunchSummaryHandler",
        &req,
        &state,
        None,
        async {
            let params = parse_query_params(&req_clone)?;
            let tz = effective_timezone(&params, "tz", &state)?;
            let now = (state.time_provider)();
            let today_date = now.with_timezone(&tz).date_naive();
            let window = state.window.snapshot().await;
            let skipped = query::skipped_ids(state.skipped_store.as_ref()).await;

            let done_info = query::compute_done_for_day(&window, &tz, today_date, &skipped);
            let current = query::find_current_meeting(&window, now, &tz, today_date, &skipped);
            let next = query::find_next_meeting_for_day(
                &window,
                now,
                &tz,
                today_date,
                done_info.has_meetings_today,
                &skipped,
            );

            let launch_data = crate::speech::LaunchSpeechData {
                has_meetings_today: done_info.has_meetings_today,
                current_meeting: current.map(|(event, _)| crate::speech::MeetingSpeechData {
                    subject: event.subject.clone(),
                    ..Default::default()
                }),
                next_meeting: next.map(|(event, seconds)| crate::speech::MeetingSpeechData {
                    subject: event.subject.clone(),
                    duration_spoken: crate::speech::format_duration_spoken(seconds),
                    location: event.location.as_ref().map(|l| l.display_name.clone()),
                    is_online_meeting: event.is_online_meeting,
                }),
                done_speech: query::done_for_day_speech(&done_info, now, &tz),
            };
            let (speech_text, ssml) = state.presenter.format_launch_summary(&launch_data);

            let next_meeting = next.map(|(event, seconds)| {
                json!({
                    "subject": event.subject,
                    "start_iso": serialize_datetime_utc(event.start.date_time),
                    "seconds_until_start": seconds,
                    "duration_spoken": crate::speech::format_duration_spoken(seconds),
                    "speech_text": speech_text,
                })
            });

            let mut body = json!({
                "speech_text": speech_text,
                "has_meetings_today": done_info.has_meetings_today,
                "next_meeting": next_meeting,
                "done_for_day": {
                    "has_meetings_today": done_info.has_meetings_today,
                    "last_meeting_start_iso": done_info.last_meeting_start.map(serialize_datetime_utc),
                    "last_meeting_end_iso": done_info.last_meeting_end.map(serialize_datetime_utc),
                    "last_meeting_end_local_iso": done_info
                        .last_meeting_end
                        .map(|end| end.with_timezone(&tz).format("%Y-%m-%dT%H:%M:%S%:z").to_string()),
                },
            });
            if let (Some(object), Some(ssml)) = (body.as_object_mut(), ssml) {
                object.insert("ssml".to_string(), Value::String(ssml));
            }
            Ok(body)
        },
    )
    .await;
    Ok(response)
}

pub async fn morning_summary(req: HttpRequest, data: web::Data<AppState>) -> Result<HttpResponse> {
    let state = data.get_ref().clone();
    let req_clone = req.clone();
    let response = run_envelope(
        "MorningSummaryHandler",
        &req,
        &state,
        None,
        async {
            let params = parse_query_params(&req_clone)?;
            let tz = effective_timezone(&params, "timezone", &state)?;
            let detail_level = match param(&params, "detail_level") {
                None => DetailLevel::Normal,
                Some(raw) => DetailLevel::parse(raw).map_err(EnvelopeError::BadRequest)?,
            };
            let prefer_ssml = match param(&params, "prefer_ssml") {
                None => false,
                Some("true") => true,
                Some("false") => false,
                Some(other) => {
                    return Err(EnvelopeError::BadRequest(format!(
                        "prefer_ssml must be true or false, got {other:?}"
                    )))
                }
            };
            let max_events = match param(&params, "max_events") {
                None => 50,
                Some(raw) => raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| (1..=MAX_EVENTS_LIMIT).contains(n))
                    .ok_or_else(|| {
                        EnvelopeError::BadRequest(format!(
                            "max_events must be an integer in 1..={MAX_EVENTS_LIMIT}"
                        ))
                    })?,
            };

            let summary_request = MorningSummaryRequest {
                date: param(&params, "date").map(str::to_string),
                timezone: tz,
                detail_level,
                max_events,
            };

            let now = (state.time_provider)();
            let window = state.window.snapshot().await;
            let summary =
                MorningSummaryService::generate_summary(&window, &summary_request, now)
                    .map_err(EnvelopeError::BadRequest)?;

            let (_, ssml) = state.presenter.format_morning_summary(&summary.speech_text);
            let mut body = json!({
                "speech_text": summary.speech_text,
                "summary": {
                    "preview_for": summary.preview_for,
                    "total_meetings_equivalent": summary.total_meetings_equivalent,
                    "early_start_flag": summary.early_start_flag,
                    "density": summary.density,
                    "back_to_back_count": summary.back_to_back_count,
                    "timeframe_start": serialize_datetime_utc(summary.timeframe_start),
                    "timeframe_end": serialize_datetime_utc(summary.timeframe_end),
                    "wake_up_recommendation": summary
                        .wake_up_recommendation
                        .map(serialize_datetime_utc),
                },
            });
            if prefer_ssml {
                if let (Some(object), Some(ssml)) = (body.as_object_mut(), ssml) {
                    object.insert("ssml".to_string(), Value::String(ssml));
                }
            }
            Ok(body)
        },
    )
    .await;
    Ok(response)
}

/// Precomputed entries only answer requests whose effective timezone matches
/// the key and that carry no other parameters; anything else computes fresh.
/// The done-for-day body echoes the requested zone name, so its precomputed
/// entry is only valid when the request named that zone explicitly.
fn precompute_key_for(req: &HttpRequest, state: &AppState, handler: &str) -> Option<String> {
    let params = parse_query_params(req).ok()?;
    if params.iter().any(|(key, _)| key != "tz") {
        return None;
    }
    let echoes_tz = handler == "DoneForDayHandler";
    match param(&params, "tz") {
        None if !echoes_tz => Some(format!("{handler}:{}", state.server_tz.name())),
        Some(name) if name == state.server_tz.name() => Some(format!("{handler}:{name}")),
        _ => None,
    }
}
