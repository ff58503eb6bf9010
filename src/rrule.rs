use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use log::{debug, warn};
use tokio::sync::{watch, Notify, Semaphore};

use crate::config::ExpansionConfig;
use crate::models::{CalendarEvent, DateTimeInfo, RawComponent, Rrule, RruleFreq};
use crate::timezone::resolve_tzid;

/// EXDATE matching tolerance.
const EXDATE_TOLERANCE_SECONDS: i64 = 1;
/// Hard cap on period steps per rule, behind the time budget as a second net.
const MAX_PERIOD_STEPS: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RruleParseError {
    Empty,
    MissingFreq,
    InvalidFreq(String),
    InvalidInteger { field: &'static str, value: String },
    InvalidUntil(String),
    InvalidByday(String),
}

impl fmt::Display for RruleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RruleParseError::Empty => write!(f, "RRULE string is empty"),
            RruleParseError::MissingFreq => write!(f, "RRULE has no FREQ part"),
            RruleParseError::InvalidFreq(v) => write!(f, "Unsupported FREQ value {v:?}"),
            RruleParseError::InvalidInteger { field, value } => {
                write!(f, "RRULE {field} is not a positive integer: {value:?}")
            }
            RruleParseError::InvalidUntil(v) => write!(f, "Unparseable UNTIL value {v:?}"),
            RruleParseError::InvalidByday(v) => write!(f, "Unparseable BYDAY value {v:?}"),
        }
    }
}

impl std::error::Error for RruleParseError {}

/// Parse an RRULE property value like
/// `FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE;UNTIL=20251028T120000Z`.
pub fn parse_rrule_string(rrule: &str) -> Result<Rrule, RruleParseError> {
    if rrule.trim().is_empty() {
        return Err(RruleParseError::Empty);
    }

    let mut freq = None;
    let mut interval: u32 = 1;
    let mut count = None;
    let mut until = None;
    let mut byday = Vec::new();
    let mut bymonth = Vec::new();
    let mut bymonthday = Vec::new();

    for part in rrule.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();
        match key.as_str() {
            "FREQ" => {
                freq = Some(match value.to_ascii_uppercase().as_str() {
                    "DAILY" => RruleFreq::Daily,
                    "WEEKLY" => RruleFreq::Weekly,
                    "MONTHLY" => RruleFreq::Monthly,
                    "YEARLY" => RruleFreq::Yearly,
                    _ => return Err(RruleParseError::InvalidFreq(value.to_string())),
                });
            }
            "INTERVAL" => {
                interval = parse_positive_int(value, "INTERVAL")?;
            }
            "COUNT" => {
                count = Some(parse_positive_int(value, "COUNT")?);
            }
            "UNTIL" => {
                until = Some(parse_until(value)?);
            }
            "BYDAY" => {
                for day in value.split(',') {
                    byday.push(parse_weekday(day.trim())?);
                }
            }
            "BYMONTH" => {
                for month in value.split(',') {
                    let m: u32 = month.trim().parse().map_err(|_| {
                        RruleParseError::InvalidInteger {
                            field: "BYMONTH",
                            value: month.to_string(),
                        }
                    })?;
                    bymonth.push(m);
                }
            }
            "BYMONTHDAY" => {
                for day in value.split(',') {
                    let d: i32 = day.trim().parse().map_err(|_| {
                        RruleParseError::InvalidInteger {
                            field: "BYMONTHDAY",
                            value: day.to_string(),
                        }
                    })?;
                    bymonthday.push(d);
                }
            }
            // WKST, BYSETPOS and friends are rare in meeting feeds; ignored.
            _ => {}
        }
    }

    let freq = freq.ok_or(RruleParseError::MissingFreq)?;
    Ok(Rrule {
        freq,
        interval,
        count,
        until,
        byday,
        bymonth,
        bymonthday,
    })
}

fn parse_positive_int(value: &str, field: &'static str) -> Result<u32, RruleParseError> {
    match value.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(RruleParseError::InvalidInteger {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_until(value: &str) -> Result<DateTime<Utc>, RruleParseError> {
    if let Some(stripped) = value.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S") {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    // Date-form UNTIL covers the whole final day.
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        if let Some(naive) = date.and_hms_opt(23, 59, 59) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(RruleParseError::InvalidUntil(value.to_string()))
}

fn parse_weekday(token: &str) -> Result<Weekday, RruleParseError> {
    match token.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        _ => Err(RruleParseError::InvalidByday(token.to_string())),
    }
}

/// Parse one EXDATE string: `YYYYMMDDThhmmssZ` or `TZID=<name>:YYYYMMDDThhmmss`.
fn parse_exdate(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix("TZID=") {
        let (tz_name, local) = rest.split_once(':')?;
        let tz = resolve_tzid(tz_name)?;
        let naive = NaiveDateTime::parse_from_str(local.trim(), "%Y%m%dT%H%M%S").ok()?;
        return Some(tz.from_local_datetime(&naive).earliest()?.with_timezone(&Utc));
    }
    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

/// Remove occurrences matching any EXDATE within a one-second tolerance.
/// Unparseable EXDATE strings are logged and skipped.
pub fn apply_exdates(
    occurrences: &[DateTime<Utc>],
    exdates: &[String],
) -> Vec<DateTime<Utc>> {
    if exdates.is_empty() {
        return occurrences.to_vec();
    }
    let parsed: Vec<DateTime<Utc>> = exdates
        .iter()
        .filter_map(|raw| match parse_exdate(raw) {
            Some(dt) => Some(dt),
            None => {
                warn!("Skipping unparseable EXDATE {:?}", raw);
                None
            }
        })
        .collect();

    occurrences
        .iter()
        .copied()
        .filter(|occ| {
            !parsed
                .iter()
                .any(|ex| (*occ - *ex).num_seconds().abs() <= EXDATE_TOLERANCE_SECONDS)
        })
        .collect()
}

/// Materialize concrete instances from a master event and its occurrence
/// starts. Duration is preserved; ids are `master_id:occurrence_timestamp`
/// and link back via `rrule_master_uid`.
pub fn generate_event_instances(
    master: &CalendarEvent,
    occurrences: &[DateTime<Utc>],
) -> Vec<CalendarEvent> {
    let duration = master.duration();
    occurrences
        .iter()
        .map(|occ| {
            let mut instance = master.clone();
            instance.id = format!("{}:{}", master.id, occ.format("%Y%m%dT%H%M%SZ"));
            instance.start = DateTimeInfo::new(*occ, master.start.time_zone.clone());
            instance.end = DateTimeInfo::new(*occ + duration, master.end.time_zone.clone());
            instance.rrule_master_uid = Some(master.id.clone());
            instance
        })
        .collect()
}

/// Bounded worker pool for recurring-event expansion. Concurrency is limited
/// by a semaphore, each rule runs under a time budget and occurrence cap, and
/// `shutdown` cancels in-flight expansions and waits for them to drain.
pub struct RruleExpander {
    config: ExpansionConfig,
    semaphore: Arc<Semaphore>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl RruleExpander {
    pub fn new(config: ExpansionConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let concurrency = config.concurrency.max(1);
        RruleExpander {
            config,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            cancel_tx,
            cancel_rx,
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Expand every recurring event in `events`, anchored at `anchor` (only
    /// occurrences within the configured day window are produced). Events
    /// without an RRULE pass through unchanged; a rule that fails to parse
    /// leaves its master unexpanded with a warning.
    pub async fn expand_events(
        &self,
        events: Vec<CalendarEvent>,
        raw_components: &[RawComponent],
        anchor: DateTime<Utc>,
    ) -> (Vec<CalendarEvent>, Vec<String>) {
        let mut out = Vec::with_capacity(events.len());
        let mut warnings = Vec::new();

        for event in events {
            if !event.is_recurring {
                out.push(event);
                continue;
            }
            let raw = raw_components.iter().find(|c| c.uid == event.id);
            let Some(rrule_str) = raw.and_then(|c| c.rrule.as_deref()) else {
                out.push(event);
                continue;
            };
            let rule = match parse_rrule_string(rrule_str) {
                Ok(rule) => rule,
                Err(e) => {
                    warnings.push(format!("RRULE for {} not expanded: {}", event.id, e));
                    out.push(event);
                    continue;
                }
            };
            let exdates = raw.map(|c| c.exdates.as_slice()).unwrap_or(&[]);
            let instances = self.expand_one(&event, &rule, exdates, anchor).await;
            debug!(
                "Expanded {} into {} instances",
                event.id,
                instances.len()
            );
            out.extend(instances);
        }

        (out, warnings)
    }

    async fn expand_one(
        &self,
        master: &CalendarEvent,
        rule: &Rrule,
        exdates: &[String],
        anchor: DateTime<Utc>,
    ) -> Vec<CalendarEvent> {
        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        let deadline =
            Instant::now() + StdDuration::from_millis(self.config.time_budget_ms_per_rule);

        let occurrences = self
            .generate_occurrences(rule, master.start.date_time, anchor, deadline)
            .await;
        let kept = apply_exdates(&occurrences, exdates);
        let instances = generate_event_instances(master, &kept);

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        instances
    }

    /// Produce occurrence starts for one rule. Stops at the first of: UNTIL,
    /// COUNT, the expansion window end, the per-rule occurrence cap, the time
    /// budget, or cancellation. Yields to the scheduler every
    /// `yield_frequency` candidates.
    async fn generate_occurrences(
        &self,
        rule: &Rrule,
        dtstart: DateTime<Utc>,
        anchor: DateTime<Utc>,
        deadline: Instant,
    ) -> Vec<DateTime<Utc>> {
        let window_end = anchor + Duration::days(self.config.expansion_days_window);
        // Instances starting shortly before the anchor stay visible so an
        // in-progress occurrence is not lost.
        let horizon_start = anchor - Duration::days(1);

        let mut out = Vec::new();
        let mut counted: u32 = 0;
        let mut candidates_seen: usize = 0;

        'periods: for step in 0..MAX_PERIOD_STEPS {
            if *self.cancel_rx.borrow() {
                debug!("Expansion cancelled mid-rule");
                break;
            }
            if Instant::now() >= deadline {
                debug!("Expansion time budget exhausted after {} occurrences", out.len());
                break;
            }

            for candidate in period_candidates(rule, dtstart, step) {
                candidates_seen += 1;
                if candidates_seen % self.config.yield_frequency.max(1) == 0 {
                    tokio::task::yield_now().await;
                    if *self.cancel_rx.borrow() || Instant::now() >= deadline {
                        break 'periods;
                    }
                }

                // Occurrences before the series start do not exist.
                if candidate < dtstart {
                    continue;
                }
                if let Some(until) = rule.until {
                    if candidate > until {
                        break 'periods;
                    }
                }
                counted += 1;
                if let Some(count) = rule.count {
                    if counted > count {
                        break 'periods;
                    }
                }
                // Candidates are monotonic across and within periods, so the
                // first one past the window ends the rule.
                if candidate > window_end {
                    break 'periods;
                }
                if candidate >= horizon_start {
                    out.push(candidate);
                    if out.len() >= self.config.max_occurrences_per_rule {
                        break 'periods;
                    }
                }
            }

            // A period whose candidates were all filtered out (e.g. BYMONTH
            // mismatch) never reaches the window check above; the seven-day
            // margin covers weekly candidates landing before the period base.
            if period_start(rule, dtstart, step) > window_end + Duration::days(7) {
                break;
            }
        }

        out
    }

    /// Cancel in-flight expansions and wait for them to finish tearing down.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        loop {
            // Register for the notification before checking the counter so a
            // drain landing in between is not lost.
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }
    }
}

/// First instant of period `step` for window-overrun checks.
fn period_start(rule: &Rrule, dtstart: DateTime<Utc>, step: u64) -> DateTime<Utc> {
    let interval = rule.interval as i64 * step as i64;
    match rule.freq {
        RruleFreq::Daily => dtstart + Duration::days(interval),
        RruleFreq::Weekly => dtstart + Duration::weeks(interval),
        RruleFreq::Monthly => add_months(dtstart, interval).unwrap_or(dtstart + Duration::days(31 * interval)),
        RruleFreq::Yearly => add_months(dtstart, interval * 12).unwrap_or(dtstart + Duration::days(366 * interval)),
    }
}

/// Candidate occurrences within period `step`, ascending.
fn period_candidates(rule: &Rrule, dtstart: DateTime<Utc>, step: u64) -> Vec<DateTime<Utc>> {
    let interval = rule.interval as i64 * step as i64;
    let time = dtstart.time();

    let passes_bymonth = |d: NaiveDate| rule.bymonth.is_empty() || rule.bymonth.contains(&d.month());

    match rule.freq {
        RruleFreq::Daily => {
            let date = (dtstart + Duration::days(interval)).date_naive();
            if passes_bymonth(date) && passes_bymonthday(&rule.bymonthday, date) {
                vec![Utc.from_utc_datetime(&date.and_time(time))]
            } else {
                Vec::new()
            }
        }
        RruleFreq::Weekly => {
            let base = dtstart + Duration::weeks(interval);
            if rule.byday.is_empty() {
                return vec![base];
            }
            // Candidates land in the Monday-anchored week containing `base`.
            let monday = base.date_naive()
                - Duration::days(base.date_naive().weekday().num_days_from_monday() as i64);
            let mut days: Vec<DateTime<Utc>> = rule
                .byday
                .iter()
                .map(|wd| {
                    let date = monday + Duration::days(wd.num_days_from_monday() as i64);
                    Utc.from_utc_datetime(&date.and_time(time))
                })
                .filter(|dt| passes_bymonth(dt.date_naive()))
                .collect();
            days.sort();
            days
        }
        RruleFreq::Monthly => {
            let Some(base) = add_months(dtstart, interval) else {
                return Vec::new();
            };
            let year = base.year();
            let month = base.month();
            let days: Vec<u32> = if rule.bymonthday.is_empty() {
                vec![dtstart.day()]
            } else {
                resolve_monthdays(&rule.bymonthday, year, month)
            };
            let mut out: Vec<DateTime<Utc>> = days
                .into_iter()
                .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
                .filter(|d| passes_bymonth(*d))
                .map(|d| Utc.from_utc_datetime(&d.and_time(time)))
                .collect();
            out.sort();
            out
        }
        RruleFreq::Yearly => {
            let year = dtstart.year() + (rule.interval as i32 * step as i32);
            let months: Vec<u32> = if rule.bymonth.is_empty() {
                vec![dtstart.month()]
            } else {
                let mut m = rule.bymonth.clone();
                m.sort_unstable();
                m
            };
            let mut out = Vec::new();
            for month in months {
                let days: Vec<u32> = if rule.bymonthday.is_empty() {
                    vec![dtstart.day()]
                } else {
                    resolve_monthdays(&rule.bymonthday, year, month)
                };
                for day in days {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                        out.push(Utc.from_utc_datetime(&date.and_time(time)));
                    }
                }
            }
            out.sort();
            out
        }
    }
}

fn passes_bymonthday(bymonthday: &[i32], date: NaiveDate) -> bool {
    if bymonthday.is_empty() {
        return true;
    }
    let dim = days_in_month(date.year(), date.month());
    bymonthday.iter().any(|&d| {
        if d > 0 {
            date.day() == d as u32
        } else {
            // Negative values count from the end of the month.
            (dim as i32 + d + 1) == date.day() as i32
        }
    })
}

fn resolve_monthdays(bymonthday: &[i32], year: i32, month: u32) -> Vec<u32> {
    let dim = days_in_month(year, month) as i32;
    let mut days: Vec<u32> = bymonthday
        .iter()
        .filter_map(|&d| {
            let resolved = if d > 0 { d } else { dim + d + 1 };
            if (1..=dim).contains(&resolved) {
                Some(resolved as u32)
            } else {
                None
            }
        })
        .collect();
    days.sort_unstable();
    days.dedup();
    days
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default();
    let next = NaiveDate::from_ymd_opt(next_y, next_m, 1).unwrap_or_default();
    (next - first).num_days() as u32
}

fn add_months(dt: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let total = dt.year() as i64 * 12 + dt.month() as i64 - 1 + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let day = dt.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_time(dt.time())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander() -> RruleExpander {
        RruleExpander::new(ExpansionConfig {
            concurrency: 1,
            max_occurrences_per_rule: 250,
            expansion_days_window: 365,
            time_budget_ms_per_rule: 200,
            yield_frequency: 50,
        })
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn master(start: DateTime<Utc>, end: DateTime<Utc>) -> CalendarEvent {
        let mut ev = CalendarEvent::new("master-1", "Test event", start, end);
        ev.is_recurring = true;
        ev
    }

    #[test]
    fn test_parse_rrule_variants() {
        let cases = [
            ("FREQ=DAILY;INTERVAL=1", RruleFreq::Daily, 1),
            ("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE", RruleFreq::Weekly, 2),
            ("FREQ=MONTHLY;COUNT=3", RruleFreq::Monthly, 1),
            ("FREQ=YEARLY;INTERVAL=5", RruleFreq::Yearly, 5),
        ];
        for (s, freq, interval) in cases {
            let rule = parse_rrule_string(s).unwrap();
            assert_eq!(rule.freq, freq, "{s}");
            assert_eq!(rule.interval, interval, "{s}");
        }
    }

    #[test]
    fn test_parse_rrule_until_and_count() {
        let rule = parse_rrule_string("FREQ=DAILY;UNTIL=20251028T120000Z;COUNT=10").unwrap();
        assert_eq!(rule.count, Some(10));
        assert_eq!(rule.until, Some(utc(2025, 10, 28, 12, 0)));
    }

    #[test]
    fn test_parse_rrule_invalid_inputs() {
        for bad in ["", "   ", "INTERVAL=2", "FREQ=;COUNT=2", "FREQ=DAILY;INTERVAL=bad", "FREQ=HOURLY", "FREQ=DAILY;COUNT=0"] {
            assert!(parse_rrule_string(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_apply_exdates_removes_matching_day() {
        let base = utc(2025, 1, 1, 9, 0);
        let occurrences: Vec<_> = (0..5).map(|i| base + Duration::days(i)).collect();
        let filtered = apply_exdates(&occurrences, &["20250103T090000Z".to_string()]);
        assert_eq!(filtered.len(), 4);
        assert!(filtered.iter().all(|dt| dt.day() != 3));
    }

    #[test]
    fn test_apply_exdates_tzid_form() {
        // 2025-06-23 08:30 Pacific == 15:30 UTC.
        let occ = utc(2025, 6, 23, 15, 30);
        let filtered = apply_exdates(
            &[occ],
            &["TZID=Pacific Standard Time:20250623T083000".to_string()],
        );
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_apply_exdates_empty_is_identity() {
        let occ = vec![utc(2025, 2, 1, 10, 0)];
        assert_eq!(apply_exdates(&occ, &[]), occ);
    }

    #[test]
    fn test_apply_exdates_skips_unparseable() {
        let occ = vec![utc(2025, 2, 1, 10, 0)];
        let filtered = apply_exdates(&occ, &["definitely-not-a-date".to_string()]);
        assert_eq!(filtered, occ);
    }

    #[test]
    fn test_generate_event_instances_preserves_duration_and_links_master() {
        let start = utc(2025, 3, 1, 9, 0);
        let ev = master(start, start + Duration::hours(1));
        let occ1 = utc(2025, 3, 2, 9, 0);
        let occ2 = utc(2025, 3, 3, 9, 0);
        let instances = generate_event_instances(&ev, &[occ1, occ2]);
        assert_eq!(instances.len(), 2);
        for (inst, occ) in instances.iter().zip([occ1, occ2]) {
            assert_eq!(inst.duration(), Duration::hours(1));
            assert_eq!(inst.rrule_master_uid.as_deref(), Some("master-1"));
            assert!(inst.id.starts_with("master-1:"));
            assert_eq!(inst.start.date_time, occ);
        }
        // Distinct ids per instance.
        assert_ne!(instances[0].id, instances[1].id);
    }

    #[tokio::test]
    async fn test_daily_count_terminates() {
        let exp = expander();
        let anchor = utc(2025, 5, 1, 0, 0);
        let rule = parse_rrule_string("FREQ=DAILY;COUNT=4").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 5, 2, 8, 0), anchor, far_deadline())
            .await;
        assert_eq!(occ.len(), 4);
        assert_eq!(occ[0], utc(2025, 5, 2, 8, 0));
        assert_eq!(occ[3], utc(2025, 5, 5, 8, 0));
    }

    #[tokio::test]
    async fn test_weekly_byday_occurrences() {
        let exp = expander();
        let anchor = utc(2025, 5, 1, 0, 0);
        // 2025-05-05 is a Monday.
        let rule = parse_rrule_string("FREQ=WEEKLY;INTERVAL=1;BYDAY=MO,WE;COUNT=4").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 5, 5, 8, 0), anchor, far_deadline())
            .await;
        assert_eq!(
            occ,
            vec![
                utc(2025, 5, 5, 8, 0),
                utc(2025, 5, 7, 8, 0),
                utc(2025, 5, 12, 8, 0),
                utc(2025, 5, 14, 8, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_until_bounds_expansion() {
        let exp = expander();
        let anchor = utc(2025, 5, 1, 0, 0);
        let rule = parse_rrule_string("FREQ=DAILY;UNTIL=20250504T090000Z").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 5, 2, 9, 0), anchor, far_deadline())
            .await;
        assert_eq!(occ.len(), 3); // 2nd, 3rd, 4th
    }

    #[tokio::test]
    async fn test_monthly_day_31_skips_short_months() {
        let exp = expander();
        let anchor = utc(2025, 1, 1, 0, 0);
        let rule = parse_rrule_string("FREQ=MONTHLY;COUNT=3").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 1, 31, 12, 0), anchor, far_deadline())
            .await;
        // Months without a 31st produce no occurrence.
        assert_eq!(
            occ,
            vec![
                utc(2025, 1, 31, 12, 0),
                utc(2025, 3, 31, 12, 0),
                utc(2025, 5, 31, 12, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_max_occurrences_cap() {
        let exp = RruleExpander::new(ExpansionConfig {
            concurrency: 1,
            max_occurrences_per_rule: 10,
            expansion_days_window: 3650,
            time_budget_ms_per_rule: 5000,
            yield_frequency: 50,
        });
        let anchor = utc(2025, 5, 1, 0, 0);
        let rule = parse_rrule_string("FREQ=DAILY").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 5, 1, 9, 0), anchor, far_deadline())
            .await;
        assert_eq!(occ.len(), 10);
    }

    #[tokio::test]
    async fn test_window_bounds_unbounded_rule() {
        let exp = RruleExpander::new(ExpansionConfig {
            concurrency: 1,
            max_occurrences_per_rule: 100_000,
            expansion_days_window: 14,
            time_budget_ms_per_rule: 5000,
            yield_frequency: 50,
        });
        let anchor = utc(2025, 5, 1, 0, 0);
        let rule = parse_rrule_string("FREQ=DAILY").unwrap();
        let occ = exp
            .generate_occurrences(&rule, utc(2025, 5, 1, 9, 0), anchor, far_deadline())
            .await;
        // Only occurrences within 14 days of the anchor.
        assert!(occ.len() <= 15);
        assert!(occ.iter().all(|o| *o <= anchor + Duration::days(14)));
    }

    #[tokio::test]
    async fn test_expand_events_invalid_rrule_keeps_master() {
        let exp = expander();
        let start = utc(2025, 6, 2, 9, 0);
        let ev = master(start, start + Duration::hours(1));
        let raw = vec![RawComponent {
            uid: "master-1".to_string(),
            rrule: Some("FREQ=SOMETIMES".to_string()),
            exdates: Vec::new(),
        }];
        let (events, warnings) = exp.expand_events(vec![ev], &raw, utc(2025, 6, 1, 0, 0)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "master-1");
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_expand_events_applies_exdates() {
        let exp = expander();
        let start = utc(2025, 6, 2, 9, 0);
        let ev = master(start, start + Duration::hours(1));
        let raw = vec![RawComponent {
            uid: "master-1".to_string(),
            rrule: Some("FREQ=DAILY;COUNT=3".to_string()),
            exdates: vec!["20250603T090000Z".to_string()],
        }];
        let (events, warnings) = exp.expand_events(vec![ev], &raw, utc(2025, 6, 1, 0, 0)).await;
        assert!(warnings.is_empty());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.start.date_time.day() != 3));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_drains() {
        let exp = Arc::new(expander());
        exp.shutdown().await;
        // After shutdown, expansion still returns (cancelled early, may be partial).
        let start = utc(2025, 6, 2, 9, 0);
        let ev = master(start, start + Duration::hours(1));
        let raw = vec![RawComponent {
            uid: "master-1".to_string(),
            rrule: Some("FREQ=DAILY;COUNT=5".to_string()),
            exdates: Vec::new(),
        }];
        let (events, _) = exp.expand_events(vec![ev], &raw, utc(2025, 6, 1, 0, 0)).await;
        assert!(events.len() <= 5);
    }

    fn far_deadline() -> Instant {
        Instant::now() + StdDuration::from_secs(30)
    }
}
