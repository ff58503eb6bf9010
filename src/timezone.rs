use chrono_tz::Tz;

/// Fallback zone used when the configured default is missing or invalid.
const FALLBACK_TIMEZONE: &str = "America/Los_Angeles";

/// Parse a timezone supplied on a request. `None` falls back to the server
/// default; an invalid name is a caller error.
pub fn parse_request_timezone(requested: Option<&str>, server_default: &Tz) -> Result<Tz, String> {
    match requested {
        None => Ok(*server_default),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| format!("Unknown timezone: {}", name)),
    }
}

/// Resolve a TZID parameter value to a timezone. Accepts IANA names directly
/// and maps the Windows zone names Outlook feeds embed.
pub fn resolve_tzid(name: &str) -> Option<Tz> {
    if let Ok(tz) = name.parse::<Tz>() {
        return Some(tz);
    }
    let iana = match name {
        "Pacific Standard Time" => "America/Los_Angeles",
        "Mountain Standard Time" => "America/Denver",
        "Central Standard Time" => "America/Chicago",
        "Eastern Standard Time" => "America/New_York",
        "GMT Standard Time" => "Europe/London",
        "W. Europe Standard Time" => "Europe/Berlin",
        "Romance Standard Time" => "Europe/Paris",
        "Tokyo Standard Time" => "Asia/Tokyo",
        "AUS Eastern Standard Time" => "Australia/Sydney",
        "UTC" | "Coordinated Universal Time" => "UTC",
        _ => return None,
    };
    iana.parse::<Tz>().ok()
}

/// Resolve the server default timezone from configuration. Invalid or missing
/// values fall back to America/Los_Angeles, then UTC.
pub fn resolve_server_timezone(configured: Option<&str>) -> Tz {
    if let Some(name) = configured {
        if let Ok(tz) = name.parse::<Tz>() {
            return tz;
        }
        log::warn!(
            "Configured default timezone {:?} is not a valid IANA name, falling back to {}",
            name,
            FALLBACK_TIMEZONE
        );
    }
    FALLBACK_TIMEZONE.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}
