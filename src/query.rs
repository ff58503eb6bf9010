use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::warn;
use serde_json::{json, Value};

use crate::models::CalendarEvent;
use crate::skipped::SkippedStore;
use crate::speech::{
    format_duration_spoken, format_time_spoken, serialize_datetime_utc, MeetingSpeechData,
    Presenter,
};

/// Resolve the active skipped-id set once per computation. Store failures
/// degrade to "nothing skipped".
pub async fn skipped_ids(store: Option<&Arc<dyn SkippedStore>>) -> HashMap<String, String> {
    match store {
        None => HashMap::new(),
        Some(store) => match store.active_list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipped store access failed, treating events as not skipped: {e}");
                HashMap::new()
            }
        },
    }
}

/// First upcoming non-skipped meeting in the window with the seconds until it
/// starts. All-day events count as active for their whole day; timed events
/// that ended or are in progress are passed over.
pub fn find_next_meeting<'a>(
    window: &'a [CalendarEvent],
    now: DateTime<Utc>,
    skipped: &HashMap<String, String>,
) -> Option<(&'a CalendarEvent, i64)> {
    for event in window {
        let start = event.start.date_time;
        let seconds_until = (start - now).num_seconds();
        if !event.is_all_day {
            let end = event.end.date_time;
            if end <= now || (start <= now && now < end) {
                continue;
            }
        }
        if skipped.contains_key(&event.id) {
            continue;
        }
        return Some((event, seconds_until));
    }
    None
}

/// A meeting currently in progress on `today_date` (start <= now < end).
pub fn find_current_meeting<'a>(
    window: &'a [CalendarEvent],
    now: DateTime<Utc>,
    tz: &Tz,
    today_date: NaiveDate,
    skipped: &HashMap<String, String>,
) -> Option<(&'a CalendarEvent, i64)> {
    for event in window {
        if event.is_all_day {
            continue;
        }
        let start = event.start.date_time;
        let end = event.end.date_time;
        if start.with_timezone(tz).date_naive() != today_date {
            continue;
        }
        if start <= now && now < end {
            if skipped.contains_key(&event.id) {
                continue;
            }
            return Some((event, (end - now).num_seconds()));
        }
    }
    None
}

/// Next upcoming meeting constrained to `today_date` (`include_today`) or to
/// strictly later days.
pub fn find_next_meeting_for_day<'a>(
    window: &'a [CalendarEvent],
    now: DateTime<Utc>,
    tz: &Tz,
    today_date: NaiveDate,
    include_today: bool,
    skipped: &HashMap<String, String>,
) -> Option<(&'a CalendarEvent, i64)> {
    for event in window {
        let start = event.start.date_time;
        // All-day events carry their calendar date at midnight UTC.
        let event_date = if event.is_all_day {
            start.date_naive()
        } else {
            start.with_timezone(tz).date_naive()
        };
        if include_today {
            if event_date != today_date {
                continue;
            }
        } else if event_date <= today_date {
            continue;
        }
        if !event.is_all_day {
            let end = event.end.date_time;
            if end <= now || (start <= now && now < end) {
                continue;
            }
        }
        if skipped.contains_key(&event.id) {
            continue;
        }
        return Some((event, (start - now).num_seconds()));
    }
    None
}

#[derive(Debug, Clone, Default)]
pub struct DoneForDayInfo {
    pub has_meetings_today: bool,
    pub last_meeting_start: Option<DateTime<Utc>>,
    pub last_meeting_end: Option<DateTime<Utc>>,
    pub meetings_count: usize,
}

/// Scan today's meetings (in `tz`) for the latest end instant.
pub fn compute_done_for_day(
    window: &[CalendarEvent],
    tz: &Tz,
    today_date: NaiveDate,
    skipped: &HashMap<String, String>,
) -> DoneForDayInfo {
    let mut info = DoneForDayInfo::default();
    for event in window {
        let event_date = if event.is_all_day {
            event.start.date_time.date_naive()
        } else {
            event.start.date_time.with_timezone(tz).date_naive()
        };
        if event_date != today_date || skipped.contains_key(&event.id) {
            continue;
        }
        info.has_meetings_today = true;
        info.meetings_count += 1;
        if info
            .last_meeting_end
            .map(|current| event.end.date_time > current)
            .unwrap_or(true)
        {
            info.last_meeting_end = Some(event.end.date_time);
            info.last_meeting_start = Some(event.start.date_time);
        }
    }
    info
}

fn speech_data_for(event: &CalendarEvent, seconds_until: i64) -> MeetingSpeechData {
    MeetingSpeechData {
        subject: event.subject.clone(),
        duration_spoken: format_duration_spoken(seconds_until),
        location: event.location.as_ref().map(|l| l.display_name.clone()),
        is_online_meeting: event.is_online_meeting,
    }
}

fn with_optional_ssml(mut body: Value, ssml: Option<String>) -> Value {
    if let (Some(object), Some(ssml)) = (body.as_object_mut(), ssml) {
        object.insert("ssml".to_string(), Value::String(ssml));
    }
    body
}

/// Response body for the next-meeting query. The same function backs the
/// handler and the precompute stage so both produce identical answers.
pub fn next_meeting_response(
    window: &[CalendarEvent],
    now: DateTime<Utc>,
    skipped: &HashMap<String, String>,
    presenter: &dyn Presenter,
) -> Value {
    match find_next_meeting(window, now, skipped) {
        None => {
            let (speech_text, ssml) = presenter.format_next_meeting(None);
            with_optional_ssml(
                json!({
                    "meeting": Value::Null,
                    "speech_text": speech_text,
                }),
                ssml,
            )
        }
        Some((event, seconds_until)) => {
            let data = speech_data_for(event, seconds_until);
            let (speech_text, ssml) = presenter.format_next_meeting(Some(&data));
            with_optional_ssml(
                json!({
                    "meeting": {
                        "subject": event.subject,
                        "start_iso": serialize_datetime_utc(event.start.date_time),
                        "seconds_until_start": seconds_until,
                        "duration_spoken": data.duration_spoken,
                        "speech_text": speech_text,
                    },
                    "speech_text": speech_text,
                }),
                ssml,
            )
        }
    }
}

/// Response body for the time-until query.
pub fn time_until_response(
    window: &[CalendarEvent],
    now: DateTime<Utc>,
    skipped: &HashMap<String, String>,
    presenter: &dyn Presenter,
) -> Value {
    match find_next_meeting(window, now, skipped) {
        None => {
            let (speech_text, ssml) = presenter.format_time_until(None, None);
            with_optional_ssml(
                json!({
                    "seconds_until_start": Value::Null,
                    "duration_spoken": "",
                    "speech_text": speech_text,
                }),
                ssml,
            )
        }
        Some((event, seconds_until)) => {
            let data = speech_data_for(event, seconds_until);
            let (speech_text, ssml) =
                presenter.format_time_until(Some(seconds_until), Some(&data));
            with_optional_ssml(
                json!({
                    "seconds_until_start": seconds_until,
                    "duration_spoken": data.duration_spoken,
                    "speech_text": speech_text,
                }),
                ssml,
            )
        }
    }
}

/// Speech for done-for-day, matching the assistant's phrasing exactly.
pub fn done_for_day_speech(info: &DoneForDayInfo, now: DateTime<Utc>, tz: &Tz) -> String {
    if !info.has_meetings_today {
        return "You have no meetings today. Enjoy your free day!".to_string();
    }
    match info.last_meeting_end {
        Some(end) if now >= end => "You're all done for today!".to_string(),
        Some(end) => format!("You'll be done at {}.", format_time_spoken(end, tz)),
        None => {
            "You have meetings today, but I couldn't determine when your last one ends."
                .to_string()
        }
    }
}

/// Response body for the done-for-day query. `tz_label` echoes what the
/// caller asked for (null when the server default was used implicitly).
pub fn done_for_day_response(
    window: &[CalendarEvent],
    now: DateTime<Utc>,
    tz: &Tz,
    tz_label: Option<&str>,
    skipped: &HashMap<String, String>,
    presenter: &dyn Presenter,
) -> Value {
    let today_date = now.with_timezone(tz).date_naive();
    let info = compute_done_for_day(window, tz, today_date, skipped);
    let speech = done_for_day_speech(&info, now, tz);
    let (speech_text, ssml) = presenter.format_done_for_day(&speech);

    with_optional_ssml(
        json!({
            "now_iso": serialize_datetime_utc(now),
            "tz": tz_label,
            "has_meetings_today": info.has_meetings_today,
            "last_meeting_start_iso": info.last_meeting_start.map(serialize_datetime_utc),
            "last_meeting_end_iso": info.last_meeting_end.map(serialize_datetime_utc),
            "last_meeting_end_local_iso": info
                .last_meeting_end
                .map(|end| end.with_timezone(tz).format("%Y-%m-%dT%H:%M:%S%:z").to_string()),
            "speech_text": speech_text,
        }),
        ssml,
    )
}
