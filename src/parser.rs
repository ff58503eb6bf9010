use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::{Stream, StreamExt};
use log::{debug, error, warn};

use crate::models::{
    Attendee, CalendarEvent, CalendarMetadata, DateTimeInfo, EventLocation, EventStatus,
    ParseResult, RawComponent,
};
use crate::timezone::resolve_tzid;

/// Hard ceiling on parser loop iterations for a single source (CWE-835).
pub const MAX_PARSER_ITERATIONS: usize = 10_000;
/// Wall-clock ceiling on a single parse.
pub const MAX_PARSER_TIMEOUT_SECONDS: u64 = 30;

/// Streaming RFC 5545 parser. Consumes byte chunks incrementally so a large
/// or hostile feed never has to be buffered whole, and enforces iteration and
/// wall-clock limits on every loop pass.
pub struct IcsParser;

impl IcsParser {
    pub fn new() -> Self {
        IcsParser
    }

    /// Parse an async chunk stream into events. `source_url` only tags logs
    /// and the result.
    pub async fn parse_stream<S>(&self, mut stream: S, source_url: &str) -> ParseResult
    where
        S: Stream<Item = Bytes> + Unpin,
    {
        let started = Instant::now();
        let mut iterations: usize = 0;
        let mut state = ParserState::new(source_url);

        // Byte buffer carrying data across chunk boundaries. Lines are split
        // on raw 0x0A before decoding, so multi-byte UTF-8 sequences broken
        // across chunks reassemble before the lossy decode sees them.
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            if chunk.is_empty() {
                // Empty chunks make no progress; only the wall clock bounds them.
                if let Err(msg) = check_timeout(&started, source_url) {
                    return state.fail(msg);
                }
                continue;
            }
            if let Err(msg) = check_limits(&mut iterations, &started, source_url) {
                return state.fail(msg);
            }
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                if let Err(msg) = check_limits(&mut iterations, &started, source_url) {
                    return state.fail(msg);
                }
                let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                let line = decode_line(&line_bytes);
                state.feed_physical_line(&line);
            }
        }

        // Flush any trailing line without a newline, then the unfold buffer.
        if !buf.is_empty() {
            let line = decode_line(&buf);
            state.feed_physical_line(&line);
        }
        state.flush();

        state.finalize()
    }

    /// Parse a fully buffered body. Used for cached content and in tests.
    pub async fn parse_bytes(&self, content: &[u8], source_url: &str) -> ParseResult {
        let chunk = Bytes::copy_from_slice(content);
        self.parse_stream(futures::stream::iter(vec![chunk]), source_url)
            .await
    }
}

impl Default for IcsParser {
    fn default() -> Self {
        Self::new()
    }
}

fn check_limits(iterations: &mut usize, started: &Instant, source_url: &str) -> Result<(), String> {
    *iterations += 1;
    if *iterations > MAX_PARSER_ITERATIONS {
        error!(
            "SECURITY: ICS parser iteration limit exceeded source_url={} iterations={}",
            source_url, *iterations
        );
        return Err(format!(
            "Parser iteration limit exceeded ({} iterations)",
            MAX_PARSER_ITERATIONS
        ));
    }
    check_timeout(started, source_url)
}

fn check_timeout(started: &Instant, source_url: &str) -> Result<(), String> {
    let elapsed = started.elapsed().as_secs();
    if elapsed >= MAX_PARSER_TIMEOUT_SECONDS {
        error!(
            "SECURITY: ICS parser timeout exceeded source_url={} elapsed_s={}",
            source_url, elapsed
        );
        return Err(format!(
            "Parser timeout exceeded ({} seconds)",
            MAX_PARSER_TIMEOUT_SECONDS
        ));
    }
    Ok(())
}

/// Decode one physical line leniently: invalid byte sequences become U+FFFD so
/// a valid event surrounded by corrupt bytes still parses. Trailing CR/LF is
/// stripped here.
fn decode_line(bytes: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(bytes).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// One property line after unfolding: `NAME;PARAM=V;PARAM2=V2:value`.
#[derive(Debug)]
struct Property {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl Property {
    fn parse(line: &str) -> Option<Property> {
        let colon = line.find(':')?;
        let (head, value) = line.split_at(colon);
        let value = &value[1..];
        let mut parts = head.split(';');
        let name = parts.next()?.trim().to_ascii_uppercase();
        if name.is_empty() {
            return None;
        }
        let params = parts
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((k.trim().to_ascii_uppercase(), v.trim().to_string()))
            })
            .collect();
        Some(Property {
            name,
            params,
            value: value.to_string(),
        })
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Unescape TEXT values per RFC 5545 §3.3.11.
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(',') => out.push(','),
            Some(';') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parsed DTSTART/DTEND value.
#[derive(Debug, Clone)]
struct ParsedDateTime {
    instant: DateTime<Utc>,
    time_zone: String,
    date_only: bool,
}

fn parse_datetime_property(prop: &Property, calendar_tz: Option<&str>) -> Option<ParsedDateTime> {
    let raw = prop.value.trim();
    if prop.param("VALUE") == Some("DATE") || (raw.len() == 8 && !raw.contains('T')) {
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        let instant = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        return Some(ParsedDateTime {
            instant,
            time_zone: "UTC".to_string(),
            date_only: true,
        });
    }

    if let Some(stripped) = raw.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(ParsedDateTime {
            instant: Utc.from_utc_datetime(&naive),
            time_zone: "UTC".to_string(),
            date_only: false,
        });
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S").ok()?;
    let tzid = prop.param("TZID").or(calendar_tz);
    if let Some(name) = tzid {
        if let Some(tz) = resolve_tzid(name) {
            let local = tz.from_local_datetime(&naive).earliest()?;
            return Some(ParsedDateTime {
                instant: local.with_timezone(&Utc),
                time_zone: name.to_string(),
                date_only: false,
            });
        }
        warn!("Unresolvable TZID {:?}, treating {} as UTC", name, prop.name);
    }
    // Floating time: treated as UTC.
    Some(ParsedDateTime {
        instant: Utc.from_utc_datetime(&naive),
        time_zone: "UTC".to_string(),
        date_only: false,
    })
}

fn detect_meeting_url(text: &str) -> Option<String> {
    const HOSTS: [&str; 4] = [
        "teams.microsoft.com",
        "zoom.us",
        "meet.google.com",
        "webex.com",
    ];
    for token in text.split_whitespace() {
        if token.starts_with("http://") || token.starts_with("https://") {
            let trimmed = token.trim_end_matches(['>', ')', ',', '.']);
            if HOSTS.iter().any(|h| trimmed.contains(h)) {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Accumulated properties of the VEVENT currently being read.
#[derive(Debug, Default)]
struct EventBuilder {
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    dtstart: Option<ParsedDateTime>,
    dtend: Option<ParsedDateTime>,
    status: Option<String>,
    transp: Option<String>,
    busystatus: Option<String>,
    rrule: Option<String>,
    exdates: Vec<String>,
    last_modified: Option<DateTime<Utc>>,
    attendees: Vec<Attendee>,
}

impl EventBuilder {
    fn build(self, warnings: &mut Vec<String>) -> Option<(CalendarEvent, RawComponent)> {
        let start = match self.dtstart {
            Some(s) => s,
            None => {
                warnings.push(format!(
                    "VEVENT {:?} has no DTSTART, dropped",
                    self.uid.as_deref().unwrap_or("<no uid>")
                ));
                return None;
            }
        };
        let is_all_day = start.date_only;
        let end = match self.dtend {
            Some(e) => e,
            // Default durations: 30 minutes for timed events, one day for all-day.
            None => ParsedDateTime {
                instant: if is_all_day {
                    start.instant + Duration::days(1)
                } else {
                    start.instant + Duration::minutes(30)
                },
                time_zone: start.time_zone.clone(),
                date_only: is_all_day,
            },
        };

        let id = self
            .uid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let is_cancelled = self
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("CANCELLED"));
        let show_as = match (
            self.busystatus.as_deref().map(str::to_ascii_uppercase),
            self.transp.as_deref().map(str::to_ascii_uppercase),
        ) {
            (Some(b), _) => match b.as_str() {
                "FREE" => EventStatus::Free,
                "TENTATIVE" => EventStatus::Tentative,
                "BUSY" => EventStatus::Busy,
                "OOF" => EventStatus::Oof,
                _ => EventStatus::Unknown,
            },
            (None, Some(t)) if t == "TRANSPARENT" => EventStatus::Free,
            (None, Some(t)) if t == "OPAQUE" => EventStatus::Busy,
            (None, Some(_)) => EventStatus::Unknown,
            (None, None) => EventStatus::Busy,
        };

        let online_meeting_url = self
            .location
            .as_deref()
            .and_then(detect_meeting_url)
            .or_else(|| self.description.as_deref().and_then(detect_meeting_url));

        let raw = RawComponent {
            uid: id.clone(),
            rrule: self.rrule.clone(),
            exdates: self.exdates.clone(),
        };

        let event = CalendarEvent {
            id,
            subject: self.summary.unwrap_or_default(),
            body_preview: self.description.filter(|d| !d.is_empty()),
            start: DateTimeInfo::new(start.instant, start.time_zone),
            end: DateTimeInfo::new(end.instant, end.time_zone),
            is_all_day,
            show_as,
            is_cancelled,
            location: self
                .location
                .filter(|l| !l.is_empty())
                .map(|display_name| EventLocation { display_name }),
            is_online_meeting: online_meeting_url.is_some(),
            online_meeting_url,
            is_recurring: self.rrule.is_some(),
            rrule_master_uid: None,
            last_modified: self.last_modified,
            attendees: if self.attendees.is_empty() {
                None
            } else {
                Some(self.attendees)
            },
        };
        Some((event, raw))
    }
}

struct ParserState {
    source_url: String,
    unfold: Option<String>,
    current: Option<EventBuilder>,
    events: Vec<CalendarEvent>,
    raw_components: Vec<RawComponent>,
    metadata: CalendarMetadata,
    warnings: Vec<String>,
    saw_content: bool,
    dropped_free_or_cancelled: usize,
}

impl ParserState {
    fn new(source_url: &str) -> Self {
        ParserState {
            source_url: source_url.to_string(),
            unfold: None,
            current: None,
            events: Vec::new(),
            raw_components: Vec::new(),
            metadata: CalendarMetadata::default(),
            warnings: Vec::new(),
            saw_content: false,
            dropped_free_or_cancelled: 0,
        }
    }

    /// Feed one physical line; continuation lines (leading space/tab) are
    /// folded back onto the previous logical line per RFC 5545 §3.1.
    fn feed_physical_line(&mut self, line: &str) {
        if !line.trim().is_empty() {
            self.saw_content = true;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(prev) = self.unfold.as_mut() {
                prev.push_str(&line[1..]);
            }
            return;
        }
        let finished = self.unfold.replace(line.to_string());
        if let Some(logical) = finished {
            self.process_logical_line(&logical);
        }
    }

    fn flush(&mut self) {
        if let Some(logical) = self.unfold.take() {
            self.process_logical_line(&logical);
        }
    }

    fn process_logical_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(prop) = Property::parse(line) else {
            debug!("Skipping unparseable ICS line from {}", self.source_url);
            return;
        };

        match prop.name.as_str() {
            "BEGIN" if prop.value.eq_ignore_ascii_case("VEVENT") => {
                if self.current.is_some() {
                    self.warnings
                        .push("Nested BEGIN:VEVENT without END:VEVENT".to_string());
                }
                self.current = Some(EventBuilder::default());
            }
            "END" if prop.value.eq_ignore_ascii_case("VEVENT") => {
                if let Some(builder) = self.current.take() {
                    if let Some((event, raw)) = builder.build(&mut self.warnings) {
                        if event.show_as == EventStatus::Free || event.is_cancelled {
                            self.dropped_free_or_cancelled += 1;
                        } else {
                            self.events.push(event);
                            self.raw_components.push(raw);
                        }
                    }
                } else {
                    self.warnings
                        .push("END:VEVENT without matching BEGIN:VEVENT".to_string());
                }
            }
            _ => {
                if self.current.is_some() {
                    self.event_property(prop);
                } else {
                    self.calendar_property(prop);
                }
            }
        }
    }

    fn calendar_property(&mut self, prop: Property) {
        match prop.name.as_str() {
            "X-WR-CALNAME" => self.metadata.calendar_name = Some(unescape_text(&prop.value)),
            "X-WR-CALDESC" => self.metadata.calendar_description = Some(unescape_text(&prop.value)),
            "X-WR-TIMEZONE" => self.metadata.timezone = Some(prop.value.trim().to_string()),
            "PRODID" => self.metadata.prodid = Some(prop.value.trim().to_string()),
            _ => {}
        }
    }

    fn event_property(&mut self, prop: Property) {
        let calendar_tz = self.metadata.timezone.clone();
        let Some(builder) = self.current.as_mut() else {
            return;
        };
        match prop.name.as_str() {
            "UID" => builder.uid = Some(prop.value.trim().to_string()),
            "SUMMARY" => builder.summary = Some(unescape_text(&prop.value)),
            "DESCRIPTION" => builder.description = Some(unescape_text(&prop.value)),
            "LOCATION" => builder.location = Some(unescape_text(&prop.value)),
            "STATUS" => builder.status = Some(prop.value.trim().to_string()),
            "TRANSP" => builder.transp = Some(prop.value.trim().to_string()),
            "X-MICROSOFT-CDO-BUSYSTATUS" => {
                builder.busystatus = Some(prop.value.trim().to_string())
            }
            "RRULE" => builder.rrule = Some(prop.value.trim().to_string()),
            "EXDATE" => {
                // EXDATE may carry several comma-separated values; preserve the
                // TZID prefix on each so the expander can resolve them.
                let tzid = prop.param("TZID").map(str::to_string);
                for value in prop.value.split(',') {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    match &tzid {
                        Some(tz) => builder.exdates.push(format!("TZID={}:{}", tz, value)),
                        None => builder.exdates.push(value.to_string()),
                    }
                }
            }
            "DTSTART" => match parse_datetime_property(&prop, calendar_tz.as_deref()) {
                Some(parsed) => builder.dtstart = Some(parsed),
                None => self
                    .warnings
                    .push(format!("Unparseable DTSTART value {:?}", prop.value)),
            },
            "DTEND" => match parse_datetime_property(&prop, calendar_tz.as_deref()) {
                Some(parsed) => builder.dtend = Some(parsed),
                None => self
                    .warnings
                    .push(format!("Unparseable DTEND value {:?}", prop.value)),
            },
            "LAST-MODIFIED" => {
                if let Some(stripped) = prop.value.trim().strip_suffix('Z') {
                    if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S") {
                        builder.last_modified = Some(Utc.from_utc_datetime(&naive));
                    }
                }
            }
            "ATTENDEE" => {
                let email = prop
                    .value
                    .trim()
                    .strip_prefix("mailto:")
                    .map(str::to_string);
                let name = prop.param("CN").map(str::to_string);
                if name.is_some() || email.is_some() {
                    builder.attendees.push(Attendee { name, email });
                }
            }
            _ => {}
        }
    }

    fn fail(mut self, message: String) -> ParseResult {
        // Events completed before the limit tripped are reported for
        // diagnostics, but success=false means callers must not trust them.
        self.warnings.push(message.clone());
        ParseResult {
            success: false,
            event_count: self.events.len(),
            events: self.events,
            warnings: self.warnings,
            error_message: Some(message),
            metadata: self.metadata,
            source_url: self.source_url,
            raw_components: self.raw_components,
        }
    }

    fn finalize(mut self) -> ParseResult {
        if !self.saw_content {
            return ParseResult {
                success: false,
                event_count: 0,
                events: Vec::new(),
                warnings: self.warnings,
                error_message: Some("Empty content".to_string()),
                metadata: self.metadata,
                source_url: self.source_url,
                raw_components: Vec::new(),
            };
        }
        if self.current.is_some() {
            self.warnings
                .push("Unterminated VEVENT at end of input".to_string());
        }
        if self.dropped_free_or_cancelled > 0 {
            debug!(
                "Dropped {} free/cancelled events from {}",
                self.dropped_free_or_cancelled, self.source_url
            );
        }
        debug!(
            "Parsed {} events from {}",
            self.events.len(),
            self.source_url
        );
        ParseResult {
            success: true,
            event_count: self.events.len(),
            events: self.events,
            warnings: self.warnings,
            error_message: None,
            metadata: self.metadata,
            source_url: self.source_url,
            raw_components: self.raw_components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn parse(content: &str) -> ParseResult {
        let parser = IcsParser::new();
        futures::executor::block_on(parser.parse_bytes(content.as_bytes(), "test://local"))
    }

    const SIMPLE: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//EN\r\nX-WR-CALNAME:Work\r\nBEGIN:VEVENT\r\nUID:ev-1\r\nDTSTART:20250601T090000Z\r\nDTEND:20250601T093000Z\r\nSUMMARY:Standup\r\nLOCATION:Room 4\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_parse_simple_event() {
        let result = parse(SIMPLE);
        assert!(result.success);
        assert_eq!(result.event_count, 1);
        let ev = &result.events[0];
        assert_eq!(ev.id, "ev-1");
        assert_eq!(ev.subject, "Standup");
        assert_eq!(ev.location.as_ref().unwrap().display_name, "Room 4");
        assert_eq!(ev.start.date_time.hour(), 9);
        assert_eq!(result.metadata.calendar_name.as_deref(), Some("Work"));
        assert_eq!(result.metadata.prodid.as_deref(), Some("-//Test//EN"));
    }

    #[test]
    fn test_empty_content_fails() {
        let result = parse("   \r\n  \r\n");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Empty content"));
    }

    #[test]
    fn test_line_unfolding() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:fold-1\r\nDTSTART:20250601T090000Z\r\nSUMMARY:A very long su\r\n mmary split over lines\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let result = parse(ics);
        assert!(result.success);
        assert_eq!(result.events[0].subject, "A very long summary split over lines");
    }

    #[test]
    fn test_tzid_datetime_converted_to_utc() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:tz-1\nDTSTART;TZID=America/New_York:20250601T090000\nDTEND;TZID=America/New_York:20250601T100000\nSUMMARY:NY call\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        let ev = &result.events[0];
        // 09:00 EDT == 13:00 UTC
        assert_eq!(ev.start.date_time.hour(), 13);
        assert_eq!(ev.start.time_zone, "America/New_York");
    }

    #[test]
    fn test_all_day_event() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:ad-1\nDTSTART;VALUE=DATE:20250601\nSUMMARY:Holiday\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        let ev = &result.events[0];
        assert!(ev.is_all_day);
        assert_eq!(ev.duration(), Duration::days(1));
        assert_eq!(ev.start.date_time.hour(), 0);
    }

    #[test]
    fn test_missing_dtend_defaults_to_thirty_minutes() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:nd-1\nDTSTART:20250601T090000Z\nSUMMARY:Quick sync\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        assert_eq!(result.events[0].duration(), Duration::minutes(30));
    }

    #[test]
    fn test_transparent_and_cancelled_events_dropped() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:f-1\nDTSTART:20250601T090000Z\nTRANSP:TRANSPARENT\nSUMMARY:Blocked time\nEND:VEVENT\nBEGIN:VEVENT\nUID:c-1\nDTSTART:20250601T100000Z\nSTATUS:CANCELLED\nSUMMARY:Cancelled\nEND:VEVENT\nBEGIN:VEVENT\nUID:k-1\nDTSTART:20250601T110000Z\nSUMMARY:Kept\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        assert_eq!(result.event_count, 1);
        assert_eq!(result.events[0].id, "k-1");
    }

    #[test]
    fn test_rrule_and_exdate_captured_raw() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:r-1\nDTSTART:20250602T090000Z\nRRULE:FREQ=WEEKLY;BYDAY=MO\nEXDATE:20250609T090000Z,20250616T090000Z\nEXDATE;TZID=America/Los_Angeles:20250623T020000\nSUMMARY:Weekly\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        assert!(result.events[0].is_recurring);
        let raw = &result.raw_components[0];
        assert_eq!(raw.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
        assert_eq!(
            raw.exdates,
            vec![
                "20250609T090000Z",
                "20250616T090000Z",
                "TZID=America/Los_Angeles:20250623T020000"
            ]
        );
    }

    #[test]
    fn test_text_unescaping() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:esc-1\nDTSTART:20250601T090000Z\nSUMMARY:Lunch\\, then sync\\nnotes\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        assert_eq!(result.events[0].subject, "Lunch, then sync\nnotes");
    }

    #[test]
    fn test_online_meeting_detection() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:om-1\nDTSTART:20250601T090000Z\nSUMMARY:Remote\nLOCATION:https://teams.microsoft.com/l/meetup-join/abc\nEND:VEVENT\nEND:VCALENDAR\n";
        let result = parse(ics);
        let ev = &result.events[0];
        assert!(ev.is_online_meeting);
        assert!(ev
            .online_meeting_url
            .as_deref()
            .unwrap()
            .contains("teams.microsoft.com"));
    }

    #[test]
    fn test_invalid_utf8_replaced_not_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BEGIN:VCALENDAR\nX-JUNK:\xff\xfe\xfd\nBEGIN:VEVENT\nUID:u-1\nDTSTART:20250601T090000Z\nSUMMARY:Survives\nEND:VEVENT\nEND:VCALENDAR\n");
        let parser = IcsParser::new();
        let result =
            futures::executor::block_on(parser.parse_bytes(&bytes, "test://corrupt"));
        assert!(result.success);
        assert_eq!(result.events[0].subject, "Survives");
    }

    #[tokio::test]
    async fn test_chunked_stream_with_split_lines() {
        // Split mid-line and mid-multibyte-character across chunks.
        let body = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:ch-1\nDTSTART:20250601T090000Z\nSUMMARY:Caf\u{00e9} sync\nEND:VEVENT\nEND:VCALENDAR\n";
        let raw = body.as_bytes();
        // U+00E9 is two bytes; cut inside it.
        let cut = body.find("Caf").unwrap() + 4;
        let chunks = vec![
            Bytes::copy_from_slice(&raw[..20]),
            Bytes::new(),
            Bytes::copy_from_slice(&raw[20..cut]),
            Bytes::copy_from_slice(&raw[cut..]),
        ];
        let parser = IcsParser::new();
        let result = parser
            .parse_stream(futures::stream::iter(chunks), "test://chunks")
            .await;
        assert!(result.success);
        assert_eq!(result.events[0].subject, "Caf\u{00e9} sync");
    }

    #[tokio::test]
    async fn test_iteration_limit_enforced() {
        let mut ics = String::from("BEGIN:VCALENDAR\nVERSION:2.0\n");
        let blocks = MAX_PARSER_ITERATIONS + 1000;
        for i in 0..blocks {
            ics.push_str(&format!(
                "BEGIN:VEVENT\nUID:dos-{i}\nDTSTART:20251201T100000Z\nSUMMARY:Flood {i}\nEND:VEVENT\n"
            ));
        }
        ics.push_str("END:VCALENDAR\n");

        let parser = IcsParser::new();
        let started = Instant::now();
        let result = parser.parse_bytes(ics.as_bytes(), "test://dos").await;
        assert!(!result.success);
        let message = result.error_message.unwrap();
        assert!(message.contains("iteration limit exceeded"));
        assert!(message.contains(&MAX_PARSER_ITERATIONS.to_string()));
        // Must stop near the bound, not after consuming the whole flood.
        assert!(result.event_count > 0);
        assert!(result.event_count < blocks);
        assert!(started.elapsed().as_secs() < MAX_PARSER_TIMEOUT_SECONDS);
    }
}
