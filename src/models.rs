use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An absolute instant paired with the IANA timezone name it was declared in.
/// The instant is always UTC; the zone name is kept for display purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTimeInfo {
    pub date_time: DateTime<Utc>,
    pub time_zone: String,
}

impl DateTimeInfo {
    pub fn utc(date_time: DateTime<Utc>) -> Self {
        DateTimeInfo {
            date_time,
            time_zone: "UTC".to_string(),
        }
    }

    pub fn new(date_time: DateTime<Utc>, time_zone: impl Into<String>) -> Self {
        DateTimeInfo {
            date_time,
            time_zone: time_zone.into(),
        }
    }
}

/// Free/busy status of an event, from STATUS/TRANSP/X-MICROSOFT-CDO-BUSYSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Free,
    Tentative,
    Busy,
    Oof,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLocation {
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    pub start: DateTimeInfo,
    pub end: DateTimeInfo,
    pub is_all_day: bool,
    pub show_as: EventStatus,
    pub is_cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<EventLocation>,
    pub is_online_meeting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_meeting_url: Option<String>,
    pub is_recurring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrule_master_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendees: Option<Vec<Attendee>>,
}

impl CalendarEvent {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        CalendarEvent {
            id: id.into(),
            subject: subject.into(),
            body_preview: None,
            start: DateTimeInfo::utc(start),
            end: DateTimeInfo::utc(end),
            is_all_day: false,
            show_as: EventStatus::Busy,
            is_cancelled: false,
            location: None,
            is_online_meeting: false,
            online_meeting_url: None,
            is_recurring: false,
            rrule_master_uid: None,
            last_modified: None,
            attendees: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end.date_time - self.start.date_time
    }

    /// Completeness score used by the deduplication stage to pick the
    /// richer of two events sharing an id.
    pub fn info_score(&self) -> u32 {
        let mut score = 0;
        if self.body_preview.as_deref().is_some_and(|b| !b.is_empty()) {
            score += 1;
        }
        if self.attendees.as_ref().is_some_and(|a| !a.is_empty()) {
            score += 2;
        }
        if self
            .location
            .as_ref()
            .is_some_and(|l| !l.display_name.is_empty())
        {
            score += 1;
        }
        if self.online_meeting_url.is_some() {
            score += 1;
        }
        score
    }
}

/// Calendar-level metadata captured during parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prodid: Option<String>,
}

/// Outcome of parsing one ICS source.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub success: bool,
    pub event_count: usize,
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub metadata: CalendarMetadata,
    pub source_url: String,
    /// Raw VEVENT recurrence data, kept so the expansion stage can read
    /// RRULE/EXDATE lines the typed model does not carry.
    pub raw_components: Vec<RawComponent>,
}

/// Recurrence-relevant raw properties of one VEVENT as they appeared on the wire.
#[derive(Debug, Clone, Default)]
pub struct RawComponent {
    pub uid: String,
    pub rrule: Option<String>,
    pub exdates: Vec<String>,
}

/// Recurrence frequency from an RRULE FREQ part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RruleFreq {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Parsed RRULE structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrule {
    pub freq: RruleFreq,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub byday: Vec<chrono::Weekday>,
    pub bymonth: Vec<u32>,
    pub bymonthday: Vec<i32>,
}
