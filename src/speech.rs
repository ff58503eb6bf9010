use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Spoken duration phrasing: seconds under a minute, minutes under an hour,
/// hours and minutes beyond that. Negative deltas read as "in the past".
pub fn format_duration_spoken(seconds: i64) -> String {
    if seconds < 0 {
        return "in the past".to_string();
    }
    if seconds < 60 {
        return format!("in {} second{}", seconds, plural(seconds));
    }
    if seconds < 3600 {
        let minutes = seconds / 60;
        return format!("in {} minute{}", minutes, plural(minutes));
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if minutes == 0 {
        format!("in {} hour{}", hours, plural(hours))
    } else {
        format!(
            "in {} hour{} and {} minute{}",
            hours,
            plural(hours),
            minutes,
            plural(minutes)
        )
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// UTC instant serialized as `YYYY-MM-DDThh:mm:ssZ`.
pub fn serialize_datetime_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Local wall-clock time for speech, e.g. "3:30 PM".
pub fn format_time_spoken(dt: DateTime<Utc>, tz: &Tz) -> String {
    dt.with_timezone(tz).format("%-I:%M %p").to_string()
}

/// Data a presenter needs about one meeting.
#[derive(Debug, Clone, Default)]
pub struct MeetingSpeechData {
    pub subject: String,
    pub duration_spoken: String,
    pub location: Option<String>,
    pub is_online_meeting: bool,
}

/// Summary inputs for the launch intent.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpeechData {
    pub has_meetings_today: bool,
    pub current_meeting: Option<MeetingSpeechData>,
    pub next_meeting: Option<MeetingSpeechData>,
    pub done_speech: String,
}

/// Pluggable speech formatter. Implementations return plain speech text and
/// optionally an SSML rendering of the same content.
pub trait Presenter: Send + Sync {
    fn format_next_meeting(&self, meeting: Option<&MeetingSpeechData>) -> (String, Option<String>);
    fn format_time_until(
        &self,
        seconds_until: Option<i64>,
        meeting: Option<&MeetingSpeechData>,
    ) -> (String, Option<String>);
    fn format_done_for_day(&self, speech_text: &str) -> (String, Option<String>);
    fn format_launch_summary(&self, data: &LaunchSpeechData) -> (String, Option<String>);
    fn format_morning_summary(&self, speech_text: &str) -> (String, Option<String>);
}

/// Default presenter: plain text only, no SSML.
pub struct PlainTextPresenter;

impl Presenter for PlainTextPresenter {
    fn format_next_meeting(&self, meeting: Option<&MeetingSpeechData>) -> (String, Option<String>) {
        match meeting {
            None => ("No upcoming meetings".to_string(), None),
            Some(m) => (
                format!("Your next meeting is {} {}.", m.subject, m.duration_spoken),
                None,
            ),
        }
    }

    fn format_time_until(
        &self,
        seconds_until: Option<i64>,
        meeting: Option<&MeetingSpeechData>,
    ) -> (String, Option<String>) {
        match (seconds_until, meeting) {
            (Some(_), Some(m)) => (
                format!("Your next meeting starts {}.", m.duration_spoken),
                None,
            ),
            _ => ("No upcoming meetings".to_string(), None),
        }
    }

    fn format_done_for_day(&self, speech_text: &str) -> (String, Option<String>) {
        (speech_text.to_string(), None)
    }

    fn format_launch_summary(&self, data: &LaunchSpeechData) -> (String, Option<String>) {
        let mut parts: Vec<String> = Vec::new();
        if let Some(current) = &data.current_meeting {
            parts.push(format!("You're currently in {}.", current.subject));
        }
        match &data.next_meeting {
            Some(next) if data.has_meetings_today => {
                parts.push(format!(
                    "Your next meeting is {} {}.",
                    next.subject, next.duration_spoken
                ));
            }
            Some(next) => {
                parts.push(format!(
                    "You have no more meetings today. Your next meeting is {} {}.",
                    next.subject, next.duration_spoken
                ));
            }
            None if data.current_meeting.is_none() && !data.has_meetings_today => {
                parts.push("You have no meetings today. Enjoy your free day!".to_string());
            }
            None => {}
        }
        if data.has_meetings_today && !data.done_speech.is_empty() {
            parts.push(data.done_speech.clone());
        }
        (parts.join(" "), None)
    }

    fn format_morning_summary(&self, speech_text: &str) -> (String, Option<String>) {
        (speech_text.to_string(), None)
    }
}

/// Presenter that additionally wraps speech text in minimal SSML.
pub struct SsmlPresenter;

impl SsmlPresenter {
    fn wrap(text: &str) -> Option<String> {
        Some(format!("<speak>{}</speak>", escape_ssml(text)))
    }
}

fn escape_ssml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl Presenter for SsmlPresenter {
    fn format_next_meeting(&self, meeting: Option<&MeetingSpeechData>) -> (String, Option<String>) {
        let (text, _) = PlainTextPresenter.format_next_meeting(meeting);
        let ssml = Self::wrap(&text);
        (text, ssml)
    }

    fn format_time_until(
        &self,
        seconds_until: Option<i64>,
        meeting: Option<&MeetingSpeechData>,
    ) -> (String, Option<String>) {
        let (text, _) = PlainTextPresenter.format_time_until(seconds_until, meeting);
        let ssml = Self::wrap(&text);
        (text, ssml)
    }

    fn format_done_for_day(&self, speech_text: &str) -> (String, Option<String>) {
        (speech_text.to_string(), Self::wrap(speech_text))
    }

    fn format_launch_summary(&self, data: &LaunchSpeechData) -> (String, Option<String>) {
        let (text, _) = PlainTextPresenter.format_launch_summary(data);
        let ssml = Self::wrap(&text);
        (text, ssml)
    }

    fn format_morning_summary(&self, speech_text: &str) -> (String, Option<String>) {
        (speech_text.to_string(), Self::wrap(speech_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_duration_buckets() {
        assert_eq!(format_duration_spoken(-5), "in the past");
        assert_eq!(format_duration_spoken(0), "in 0 seconds");
        assert_eq!(format_duration_spoken(1), "in 1 second");
        assert_eq!(format_duration_spoken(45), "in 45 seconds");
        assert_eq!(format_duration_spoken(60), "in 1 minute");
        assert_eq!(format_duration_spoken(900), "in 15 minutes");
        assert_eq!(format_duration_spoken(3599), "in 59 minutes");
        assert_eq!(format_duration_spoken(3600), "in 1 hour");
        assert_eq!(format_duration_spoken(7200), "in 2 hours");
        assert_eq!(format_duration_spoken(5400), "in 1 hour and 30 minutes");
    }

    #[test]
    fn test_serialize_datetime_utc() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 1, 9, 5, 0).unwrap();
        assert_eq!(serialize_datetime_utc(dt), "2025-06-01T09:05:00Z");
    }

    #[test]
    fn test_format_time_spoken() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 1, 22, 30, 0).unwrap();
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        assert_eq!(format_time_spoken(dt, &tz), "3:30 PM");
    }

    #[test]
    fn test_plain_presenter_next_meeting() {
        let presenter = PlainTextPresenter;
        let (text, ssml) = presenter.format_next_meeting(None);
        assert_eq!(text, "No upcoming meetings");
        assert!(ssml.is_none());

        let data = MeetingSpeechData {
            subject: "Standup".to_string(),
            duration_spoken: "in 15 minutes".to_string(),
            ..Default::default()
        };
        let (text, _) = presenter.format_next_meeting(Some(&data));
        assert_eq!(text, "Your next meeting is Standup in 15 minutes.");
    }

    #[test]
    fn test_launch_summary_composition() {
        let presenter = PlainTextPresenter;
        let data = LaunchSpeechData {
            has_meetings_today: true,
            current_meeting: Some(MeetingSpeechData {
                subject: "Design review".to_string(),
                ..Default::default()
            }),
            next_meeting: Some(MeetingSpeechData {
                subject: "1:1".to_string(),
                duration_spoken: "in 2 hours".to_string(),
                ..Default::default()
            }),
            done_speech: "You'll be done at 5:00 PM.".to_string(),
        };
        let (text, _) = presenter.format_launch_summary(&data);
        assert!(text.starts_with("You're currently in Design review."));
        assert!(text.contains("Your next meeting is 1:1 in 2 hours."));
        assert!(text.ends_with("You'll be done at 5:00 PM."));
    }

    #[test]
    fn test_launch_summary_free_day() {
        let presenter = PlainTextPresenter;
        let (text, _) = presenter.format_launch_summary(&LaunchSpeechData::default());
        assert_eq!(text, "You have no meetings today. Enjoy your free day!");
    }

    #[test]
    fn test_ssml_presenter_wraps_and_escapes() {
        let presenter = SsmlPresenter;
        let data = MeetingSpeechData {
            subject: "Q&A".to_string(),
            duration_spoken: "in 1 hour".to_string(),
            ..Default::default()
        };
        let (text, ssml) = presenter.format_next_meeting(Some(&data));
        assert!(text.contains("Q&A"));
        let ssml = ssml.unwrap();
        assert!(ssml.starts_with("<speak>"));
        assert!(ssml.contains("Q&amp;A"));
    }
}
