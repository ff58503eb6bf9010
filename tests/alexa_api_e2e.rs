#![allow(non_snake_case)]

use std::sync::Arc;

use actix_web::{test, web, App};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use CalendarbotServer::app_state::AppState;
use CalendarbotServer::config::Settings;
use CalendarbotServer::event_filter::{EventWindow, EventWindowManager};
use CalendarbotServer::handlers;
use CalendarbotServer::health::HealthTracker;
use CalendarbotServer::models::CalendarEvent;
use CalendarbotServer::pipeline::TimeProvider;
use CalendarbotServer::precompute::PrecomputedResponses;
use CalendarbotServer::response_cache::ResponseCache;
use CalendarbotServer::speech::PlainTextPresenter;

fn now() -> DateTime<Utc> {
    // A fixed Saturday noon UTC.
    Utc.with_ymd_and_hms(2025, 11, 1, 12, 0, 0).unwrap()
}

fn event(id: &str, subject: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> CalendarEvent {
    CalendarEvent::new(id, subject, start, end)
}

fn state_with(bearer_token: Option<&str>) -> AppState {
    let mut settings = Settings::new().unwrap();
    settings.alexa.bearer_token = bearer_token.unwrap_or("").to_string();
    let time_provider: TimeProvider = Arc::new(now);
    AppState {
        settings: settings.clone(),
        window: Arc::new(EventWindow::new()),
        response_cache: Arc::new(ResponseCache::new()),
        health: Arc::new(HealthTracker::new(now())),
        precomputed: Arc::new(PrecomputedResponses::new()),
        skipped_store: None,
        presenter: Arc::new(PlainTextPresenter),
        time_provider,
        bearer_token: bearer_token.map(str::to_string),
        server_tz: chrono_tz::UTC,
    }
}

/// Publish events into the state's window as a refresh would, with
/// publication time set in the past so in-progress events stay visible.
async fn publish(state: &AppState, events: Vec<CalendarEvent>, published_at: DateTime<Utc>) {
    let manager = EventWindowManager::new(state.server_tz);
    let update = manager
        .update_window(&state.window, events, published_at, None, 50, 1)
        .await;
    assert!(update.updated);
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
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
                ),
        )
        .await
    };
}

#[actix_web::test]
async fn test_next_meeting_empty_window() {
    let state = state_with(None);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["meeting"].is_null());
    assert_eq!(body["speech_text"], "No upcoming meetings");
}

#[actix_web::test]
async fn test_next_meeting_simple() {
    let state = state_with(None);
    publish(
        &state,
        vec![event(
            "e1",
            "Standup",
            now() + Duration::seconds(900),
            now() + Duration::seconds(1800),
        )],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["meeting"]["subject"], "Standup");
    assert_eq!(body["meeting"]["seconds_until_start"], 900);
    assert_eq!(body["meeting"]["duration_spoken"], "in 15 minutes");
}

#[actix_web::test]
async fn test_time_until_next() {
    let state = state_with(None);
    publish(
        &state,
        vec![event(
            "e1",
            "Planning",
            now() + Duration::hours(2),
            now() + Duration::hours(3),
        )],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/time-until-next")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["seconds_until_start"], 7200);
    assert_eq!(body["duration_spoken"], "in 2 hours");
}

#[actix_web::test]
async fn test_done_for_day_in_progress() {
    let state = state_with(None);
    // One meeting in progress, one later today.
    publish(
        &state,
        vec![
            event(
                "in-progress",
                "Design sync",
                now() - Duration::seconds(600),
                now() + Duration::seconds(600),
            ),
            event(
                "later",
                "Retro",
                now() + Duration::seconds(7200),
                now() + Duration::seconds(10800),
            ),
        ],
        now() - Duration::hours(2),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/done-for-day?tz=America/Los_Angeles")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["has_meetings_today"], true);
    assert_eq!(body["tz"], "America/Los_Angeles");
    assert_eq!(body["last_meeting_end_iso"], "2025-11-01T15:00:00Z");
    assert!(body["speech_text"]
        .as_str()
        .unwrap()
        .starts_with("You'll be done at"));
}

#[actix_web::test]
async fn test_done_for_day_all_done() {
    let state = state_with(None);
    publish(
        &state,
        vec![event(
            "earlier",
            "Morning sync",
            now() - Duration::hours(3),
            now() - Duration::hours(2),
        )],
        now() - Duration::hours(5),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/done-for-day?tz=UTC")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["has_meetings_today"], true);
    assert_eq!(body["speech_text"], "You're all done for today!");
}

#[actix_web::test]
async fn test_auth_required_and_accepted() {
    let state = state_with(Some("s3cret"));
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Unauthorized");

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .insert_header(("Authorization", "Bearer wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .insert_header(("Authorization", "Bearer s3cret"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_web::test]
async fn test_invalid_timezone_is_bad_request() {
    let state = state_with(None);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/done-for-day?tz=Mars/Olympus_Mons")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Bad request");
    // Error text never leaks paths or addresses.
    let text = body.to_string();
    for needle in ["0x", "File \"", "/home/", "C:\\", "/usr/"] {
        assert!(!text.contains(needle), "response leaked {needle:?}");
    }

    // Even when the request itself tries to smuggle such fragments into the
    // echoed validation message.
    let req = test::TestRequest::get()
        .uri("/api/alexa/done-for-day?tz=%2Fhome%2Fsecret")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert!(!body.to_string().contains("/home/"));
}

#[actix_web::test]
async fn test_launch_summary_with_current_and_next() {
    let state = state_with(None);
    publish(
        &state,
        vec![
            event(
                "current",
                "Design review",
                now() - Duration::minutes(10),
                now() + Duration::minutes(20),
            ),
            event(
                "next",
                "1:1",
                now() + Duration::hours(2),
                now() + Duration::hours(3),
            ),
        ],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/launch-summary?tz=UTC")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["has_meetings_today"], true);
    assert_eq!(body["next_meeting"]["subject"], "1:1");
    let speech = body["speech_text"].as_str().unwrap();
    assert!(speech.contains("You're currently in Design review."));
    assert!(speech.contains("Your next meeting is 1:1"));
    assert_eq!(body["done_for_day"]["has_meetings_today"], true);
}

#[actix_web::test]
async fn test_launch_summary_free_day() {
    let state = state_with(None);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/launch-summary")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["has_meetings_today"], false);
    assert!(body["next_meeting"].is_null());
    assert_eq!(
        body["speech_text"],
        "You have no meetings today. Enjoy your free day!"
    );
}

#[actix_web::test]
async fn test_morning_summary_for_date() {
    let state = state_with(None);
    publish(
        &state,
        vec![
            event(
                "a",
                "Kickoff",
                Utc.with_ymd_and_hms(2025, 11, 2, 8, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 11, 2, 8, 30, 0).unwrap(),
            ),
            event(
                "b",
                "Budget review",
                Utc.with_ymd_and_hms(2025, 11, 2, 8, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 11, 2, 9, 0, 0).unwrap(),
            ),
        ],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/morning-summary?date=2025-11-02&timezone=UTC")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let summary = &body["summary"];
    assert_eq!(summary["preview_for"], "tomorrow_morning");
    assert_eq!(summary["total_meetings_equivalent"], 2.0);
    assert_eq!(summary["early_start_flag"], true);
    assert_eq!(summary["density"], "medium");
    assert_eq!(summary["back_to_back_count"], 1);
    assert_eq!(summary["wake_up_recommendation"], "2025-11-02T06:30:00Z");
    assert!(body["speech_text"].as_str().unwrap().contains("2 meetings"));
}

#[actix_web::test]
async fn test_morning_summary_rejects_bad_params() {
    let state = state_with(None);
    let app = app!(state);

    for uri in [
        "/api/alexa/morning-summary?detail_level=chatty",
        "/api/alexa/morning-summary?max_events=0",
        "/api/alexa/morning-summary?max_events=notanumber",
        "/api/alexa/morning-summary?prefer_ssml=maybe",
        "/api/alexa/morning-summary?date=yesterday",
        "/api/alexa/morning-summary?timezone=Nowhere/Zone",
    ] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{uri} should be rejected");
    }
}

#[actix_web::test]
async fn test_response_cache_serves_repeat_requests() {
    let state = state_with(None);
    publish(
        &state,
        vec![event(
            "e1",
            "Standup",
            now() + Duration::minutes(15),
            now() + Duration::minutes(30),
        )],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    for _ in 0..2 {
        let req = test::TestRequest::get()
            .uri("/api/alexa/next-meeting")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["meeting"]["subject"], "Standup");
    }
    let stats = state.response_cache.get_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[actix_web::test]
async fn test_cache_invalidation_after_window_swap() {
    let state = state_with(None);
    publish(
        &state,
        vec![event(
            "e1",
            "Standup",
            now() + Duration::minutes(15),
            now() + Duration::minutes(30),
        )],
        now() - Duration::hours(1),
    )
    .await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["meeting"]["subject"], "Standup");

    // New refresh publishes different content and invalidates the cache.
    publish(
        &state,
        vec![event(
            "e2",
            "Replanning",
            now() + Duration::minutes(45),
            now() + Duration::minutes(75),
        )],
        now() - Duration::minutes(30),
    )
    .await;
    state.response_cache.invalidate_all();

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["meeting"]["subject"], "Replanning");
}

#[actix_web::test]
async fn test_precomputed_answer_served_on_cache_miss() {
    let state = state_with(None);
    let canned = serde_json::json!({
        "meeting": {"subject": "Precomputed standup"},
        "speech_text": "Your next meeting is Precomputed standup in 10 minutes.",
    });
    let mut entries = std::collections::HashMap::new();
    entries.insert("NextMeetingHandler:UTC".to_string(), canned.clone());
    state.precomputed.replace_all(entries);
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/alexa/next-meeting")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, canned);
}

#[actix_web::test]
async fn test_health_endpoint() {
    let state = state_with(Some("s3cret"));
    state.health.record_refresh_success(7);
    let app = app!(state);

    // No auth needed on /health.
    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["event_count"], 7);
    assert!(body["pid"].as_u64().is_some());
    assert_eq!(body["server_time_iso"], "2025-11-01T12:00:00Z");
}
