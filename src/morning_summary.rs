use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::debug;

use crate::models::CalendarEvent;
use crate::speech::format_time_spoken;

/// Meetings within this gap of each other count as back-to-back.
const BACK_TO_BACK_GAP_MINUTES: i64 = 15;
/// A first meeting before this local hour sets the early-start flag.
const EARLY_START_HOUR: u32 = 9;
/// Wake-up recommendations only apply to first meetings before this hour.
const WAKE_UP_LATEST_HOUR: u32 = 10;
/// Recommended lead time before the first meeting.
const WAKE_UP_LEAD_MINUTES: i64 = 90;

#[derive(Debug, Clone)]
pub struct MorningSummaryRequest {
    /// ISO date (YYYY-MM-DD) the summary previews; defaults to tomorrow.
    pub date: Option<String>,
    pub timezone: Tz,
    pub detail_level: DetailLevel,
    pub max_events: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Minimal,
    Normal,
    Detailed,
}

impl DetailLevel {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "minimal" => Ok(DetailLevel::Minimal),
            "normal" => Ok(DetailLevel::Normal),
            "detailed" => Ok(DetailLevel::Detailed),
            other => Err(format!("Unknown detail_level: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MorningSummary {
    pub preview_for: String,
    pub total_meetings_equivalent: f64,
    pub early_start_flag: bool,
    pub density: String,
    pub back_to_back_count: usize,
    pub timeframe_start: DateTime<Utc>,
    pub timeframe_end: DateTime<Utc>,
    pub wake_up_recommendation: Option<DateTime<Utc>>,
    pub speech_text: String,
}

/// Computes the morning-preview metrics over the event window.
pub struct MorningSummaryService;

impl MorningSummaryService {
    /// Density classification in meeting-equivalents: an all-day event
    /// weighs half a meeting since it rarely occupies the whole morning.
    fn density_for(equivalent: f64) -> &'static str {
        if equivalent < 2.0 {
            "light"
        } else if equivalent < 4.0 {
            "medium"
        } else {
            "heavy"
        }
    }

    pub fn generate_summary(
        events: &[CalendarEvent],
        request: &MorningSummaryRequest,
        now: DateTime<Utc>,
    ) -> Result<MorningSummary, String> {
        let tz = request.timezone;
        let target_date: NaiveDate = match &request.date {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| format!("Invalid date: {raw}"))?,
            None => (now.with_timezone(&tz) + Duration::days(1)).date_naive(),
        };

        let timeframe_start = local_instant(&tz, target_date, 6, 0)?;
        let timeframe_end = local_instant(&tz, target_date, 12, 0)?;

        // Events on the target local date, earliest first. All-day events
        // carry their calendar date at midnight UTC.
        let mut day_events: Vec<&CalendarEvent> = events
            .iter()
            .filter(|event| {
                if event.is_all_day {
                    event.start.date_time.date_naive() == target_date
                } else {
                    event.start.date_time.with_timezone(&tz).date_naive() == target_date
                }
            })
            .take(request.max_events)
            .collect();
        day_events.sort_by_key(|e| e.start.date_time);

        let timed: Vec<&&CalendarEvent> =
            day_events.iter().filter(|e| !e.is_all_day).collect();
        let all_day_count = day_events.len() - timed.len();
        let total_meetings_equivalent = timed.len() as f64 + all_day_count as f64 * 0.5;
        let density = Self::density_for(total_meetings_equivalent).to_string();

        let first_timed = timed.first().map(|e| e.start.date_time);
        let early_start_flag = first_timed
            .map(|start| start.with_timezone(&tz).time().hour() < EARLY_START_HOUR)
            .unwrap_or(false);

        let back_to_back_count = timed
            .windows(2)
            .filter(|pair| {
                let gap = pair[1].start.date_time - pair[0].end.date_time;
                gap >= Duration::zero() && gap <= Duration::minutes(BACK_TO_BACK_GAP_MINUTES)
            })
            .count();

        let wake_up_recommendation = first_timed.and_then(|start| {
            if start.with_timezone(&tz).time().hour() < WAKE_UP_LATEST_HOUR {
                Some(start - Duration::minutes(WAKE_UP_LEAD_MINUTES))
            } else {
                None
            }
        });

        let speech_text = Self::speech_text(&day_events, &tz, target_date, request.detail_level);
        debug!(
            "Morning summary for {}: {} events, density {}",
            target_date,
            day_events.len(),
            density
        );

        Ok(MorningSummary {
            preview_for: "tomorrow_morning".to_string(),
            total_meetings_equivalent,
            early_start_flag,
            density,
            back_to_back_count,
            timeframe_start,
            timeframe_end,
            wake_up_recommendation,
            speech_text,
        })
    }

    fn speech_text(
        day_events: &[&CalendarEvent],
        tz: &Tz,
        target_date: NaiveDate,
        detail_level: DetailLevel,
    ) -> String {
        if day_events.is_empty() {
            return format!(
                "You have no meetings on {}. Enjoy your free day!",
                target_date.format("%A")
            );
        }

        let count = day_events.len();
        let noun = if count == 1 { "meeting" } else { "meetings" };
        let mut text = format!(
            "You have {} {} on {}.",
            count,
            noun,
            target_date.format("%A")
        );

        if detail_level == DetailLevel::Minimal {
            return text;
        }

        if let Some(first) = day_events.iter().find(|e| !e.is_all_day) {
            text.push_str(&format!(
                " Your first meeting is {} at {}.",
                first.subject,
                format_time_spoken(first.start.date_time, tz)
            ));
        }

        if detail_level == DetailLevel::Detailed && count > 1 {
            let rest: Vec<String> = day_events
                .iter()
                .skip(1)
                .map(|e| {
                    if e.is_all_day {
                        format!("{} (all day)", e.subject)
                    } else {
                        format!(
                            "{} at {}",
                            e.subject,
                            format_time_spoken(e.start.date_time, tz)
                        )
                    }
                })
                .collect();
            text.push_str(&format!(" Then: {}.", rest.join(", ")));
        }

        text
    }
}

fn local_instant(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>, String> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| "Invalid time of day".to_string())?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| format!("Nonexistent local time on {date}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn event(id: &str, start: DateTime<Utc>, minutes: i64) -> CalendarEvent {
        CalendarEvent::new(id, format!("Meeting {id}"), start, start + Duration::minutes(minutes))
    }

    fn request(date: &str) -> MorningSummaryRequest {
        MorningSummaryRequest {
            date: Some(date.to_string()),
            timezone: chrono_tz::UTC,
            detail_level: DetailLevel::Normal,
            max_events: 50,
        }
    }

    // 2025-06-02 is a Monday.
    fn fixed_now() -> DateTime<Utc> {
        utc(2025, 6, 1, 12, 0)
    }

    #[test]
    fn test_empty_day_is_light() {
        let summary =
            MorningSummaryService::generate_summary(&[], &request("2025-06-02"), fixed_now()).unwrap();
        assert_eq!(summary.total_meetings_equivalent, 0.0);
        assert_eq!(summary.density, "light");
        assert!(!summary.early_start_flag);
        assert_eq!(summary.back_to_back_count, 0);
        assert!(summary.wake_up_recommendation.is_none());
        assert!(summary.speech_text.contains("no meetings"));
    }

    #[test]
    fn test_density_and_back_to_back() {
        let events = vec![
            event("a", utc(2025, 6, 2, 9, 0), 30),
            event("b", utc(2025, 6, 2, 9, 30), 30), // back-to-back with a
            event("c", utc(2025, 6, 2, 11, 0), 60),
            event("d", utc(2025, 6, 2, 13, 0), 30),
            event("e", utc(2025, 6, 2, 15, 0), 30),
        ];
        let summary =
            MorningSummaryService::generate_summary(&events, &request("2025-06-02"), fixed_now())
                .unwrap();
        assert_eq!(summary.total_meetings_equivalent, 5.0);
        assert_eq!(summary.density, "heavy");
        assert_eq!(summary.back_to_back_count, 1);
    }

    #[test]
    fn test_early_start_and_wake_up() {
        let events = vec![event("early", utc(2025, 6, 2, 8, 0), 30)];
        let summary =
            MorningSummaryService::generate_summary(&events, &request("2025-06-02"), fixed_now())
                .unwrap();
        assert!(summary.early_start_flag);
        assert_eq!(
            summary.wake_up_recommendation,
            Some(utc(2025, 6, 2, 6, 30))
        );
    }

    #[test]
    fn test_late_first_meeting_has_no_wake_up() {
        let events = vec![event("late", utc(2025, 6, 2, 14, 0), 30)];
        let summary =
            MorningSummaryService::generate_summary(&events, &request("2025-06-02"), fixed_now())
                .unwrap();
        assert!(!summary.early_start_flag);
        assert!(summary.wake_up_recommendation.is_none());
    }

    #[test]
    fn test_all_day_counts_half() {
        let mut holiday = event("h", utc(2025, 6, 2, 0, 0), 24 * 60);
        holiday.is_all_day = true;
        let events = vec![holiday, event("a", utc(2025, 6, 2, 10, 0), 30)];
        let summary =
            MorningSummaryService::generate_summary(&events, &request("2025-06-02"), fixed_now())
                .unwrap();
        assert_eq!(summary.total_meetings_equivalent, 1.5);
    }

    #[test]
    fn test_other_days_excluded() {
        let events = vec![
            event("target", utc(2025, 6, 2, 9, 0), 30),
            event("next-week", utc(2025, 6, 9, 9, 0), 30),
        ];
        let summary =
            MorningSummaryService::generate_summary(&events, &request("2025-06-02"), fixed_now())
                .unwrap();
        assert_eq!(summary.total_meetings_equivalent, 1.0);
    }

    #[test]
    fn test_default_date_is_tomorrow() {
        let mut req = request("ignored");
        req.date = None;
        let events = vec![event("tomorrow", utc(2025, 6, 2, 9, 0), 30)];
        let summary = MorningSummaryService::generate_summary(&events, &req, fixed_now()).unwrap();
        assert_eq!(summary.total_meetings_equivalent, 1.0);
        assert!(summary.speech_text.contains("Monday"));
    }

    #[test]
    fn test_invalid_date_rejected() {
        let result =
            MorningSummaryService::generate_summary(&[], &request("junk-date"), fixed_now());
        assert!(result.is_err());
    }

    #[test]
    fn test_detailed_speech_lists_rest() {
        let events = vec![
            event("a", utc(2025, 6, 2, 9, 0), 30),
            event("b", utc(2025, 6, 2, 10, 0), 30),
        ];
        let mut req = request("2025-06-02");
        req.detail_level = DetailLevel::Detailed;
        let summary = MorningSummaryService::generate_summary(&events, &req, fixed_now()).unwrap();
        assert!(summary.speech_text.contains("Then:"));
        assert!(summary.speech_text.contains("Meeting b at 10:00 AM"));
    }

    #[test]
    fn test_timeframe_covers_morning() {
        let summary =
            MorningSummaryService::generate_summary(&[], &request("2025-06-02"), fixed_now()).unwrap();
        assert_eq!(summary.timeframe_start, utc(2025, 6, 2, 6, 0));
        assert_eq!(summary.timeframe_end, utc(2025, 6, 2, 12, 0));
    }
}
