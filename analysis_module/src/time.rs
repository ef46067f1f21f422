//! Free-form time handling: a fallback parser for confirmed-time strings
//! that fail strict ISO parsing, and sender-timezone derivation from the
//! RFC 2822 `Date` header.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use tracing::warn;

/// Parse a human time expression relative to `base`, preferring future
/// resolutions. Returns `None` for anything unparsable; never panics.
///
/// Three passes: a natural-language parse of the normalized text, a retry
/// with explicit separators inserted between digit runs and am/pm markers,
/// and a bare time-of-day mapped to its nearest future occurrence.
pub fn parse_human_time(text: &str, base: DateTime<Tz>) -> Option<DateTime<Tz>> {
    if text.trim().is_empty() {
        return None;
    }

    let text1 = normalize_time_text(text);
    if let Some(found) = parse_natural(&text1, base) {
        return Some(found);
    }

    let text2 = insert_meridiem_separators(&text1);
    if let Some(found) = parse_natural(&text2, base) {
        return Some(found);
    }

    nearest_future_time_of_day(&text1, base)
}

/// Derive the sender's timezone from a `Date` header offset, mapped to the
/// fixed-offset `Etc/GMT` family (whose sign convention is inverted:
/// UTC+8 is `Etc/GMT-8`). Falls back to `default` when the header is
/// missing or unparsable.
pub fn sender_timezone(date_header: Option<&str>, default: Tz) -> Tz {
    let Some(header) = date_header else {
        warn!("no Date header found; using default timezone");
        return default;
    };
    let parsed = match DateTime::parse_from_rfc2822(header.trim()) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("failed to parse Date header '{}': {}", header, err);
            return default;
        }
    };
    let hours = parsed.offset().local_minus_utc() / 3600;
    let name = if hours == 0 {
        "Etc/GMT".to_string()
    } else if hours > 0 {
        format!("Etc/GMT-{hours}")
    } else {
        format!("Etc/GMT+{}", -hours)
    };
    name.parse::<Tz>().unwrap_or(default)
}

fn normalize_time_text(raw: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static COMMAS: OnceLock<Regex> = OnceLock::new();

    let commas = COMMAS.get_or_init(|| Regex::new(r"[,\u{3001}]+").unwrap());
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());

    let mut text = commas.replace_all(raw.trim(), " ").into_owned();
    text = spaces.replace_all(&text, " ").into_owned();
    text = text.to_lowercase();

    for (from, to) in [
        ("mon.", "monday"),
        ("tues.", "tuesday"),
        ("wed.", "wednesday"),
        ("thur.", "thursday"),
        ("fri.", "friday"),
        ("sat.", "saturday"),
        ("sun.", "sunday"),
        ("next tues", "next tuesday"),
        ("pm.", "pm"),
        ("am.", "am"),
        ("@", " at "),
    ] {
        text = text.replace(from, to);
    }
    text
}

fn insert_meridiem_separators(text: &str) -> String {
    static GLUED_HOUR: OnceLock<Regex> = OnceLock::new();
    static GLUED_MINUTE: OnceLock<Regex> = OnceLock::new();

    let glued_hour = GLUED_HOUR.get_or_init(|| Regex::new(r"\b(\d{1,2})(am|pm)\b").unwrap());
    let glued_minute =
        GLUED_MINUTE.get_or_init(|| Regex::new(r"\b(\d{1,2}):(\d{2})(am|pm)\b").unwrap());

    let text = glued_hour.replace_all(text, |caps: &Captures<'_>| {
        format!("{} {}", &caps[1], &caps[2])
    });
    glued_minute
        .replace_all(&text, |caps: &Captures<'_>| {
            format!("{}:{} {}", &caps[1], &caps[2], &caps[3])
        })
        .into_owned()
}

/// Date + optional time. Only fires when a date component (explicit,
/// relative word, or weekday) is present; time-only input is left to the
/// nearest-future pass.
fn parse_natural(text: &str, base: DateTime<Tz>) -> Option<DateTime<Tz>> {
    let date = find_explicit_date(text)
        .or_else(|| find_relative_date(text, base))
        .or_else(|| find_weekday_date(text, base))?;
    let time = find_time_of_day(text).unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    localize(base, NaiveDateTime::new(date, time))
}

fn find_explicit_date(text: &str) -> Option<NaiveDate> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(\d{4})[/-](\d{1,2})[/-](\d{1,2})\b").unwrap());
    let caps = re.captures(text)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

fn find_relative_date(text: &str, base: DateTime<Tz>) -> Option<NaiveDate> {
    let today = base.date_naive();
    for (token, days) in [
        ("day after tomorrow", 2i64),
        ("tomorrow", 1),
        ("today", 0),
        ("\u{540e}\u{5929}", 2), // 后天
        ("\u{660e}\u{5929}", 1), // 明天
        ("\u{4eca}\u{5929}", 0), // 今天
    ] {
        if text.contains(token) {
            return Some(today + Duration::days(days));
        }
    }
    None
}

fn find_weekday_date(text: &str, base: DateTime<Tz>) -> Option<NaiveDate> {
    static EN: OnceLock<Regex> = OnceLock::new();
    static ZH: OnceLock<Regex> = OnceLock::new();

    let en = EN.get_or_init(|| {
        Regex::new(r"\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b").unwrap()
    });
    let zh = ZH.get_or_init(|| {
        Regex::new(
            "(?:\u{5468}|\u{661f}\u{671f}|\u{793c}\u{62dc})([\u{4e00}\u{4e8c}\u{4e09}\u{56db}\u{4e94}\u{516d}\u{65e5}\u{5929}])",
        )
        .unwrap()
    });

    let weekday = if let Some(caps) = en.captures(text) {
        match &caps[1] {
            "monday" => Weekday::Mon,
            "tuesday" => Weekday::Tue,
            "wednesday" => Weekday::Wed,
            "thursday" => Weekday::Thu,
            "friday" => Weekday::Fri,
            "saturday" => Weekday::Sat,
            _ => Weekday::Sun,
        }
    } else if let Some(caps) = zh.captures(text) {
        match &caps[1] {
            "\u{4e00}" => Weekday::Mon,
            "\u{4e8c}" => Weekday::Tue,
            "\u{4e09}" => Weekday::Wed,
            "\u{56db}" => Weekday::Thu,
            "\u{4e94}" => Weekday::Fri,
            "\u{516d}" => Weekday::Sat,
            _ => Weekday::Sun,
        }
    } else {
        return None;
    };

    // next future occurrence; a bare or "next" weekday never resolves to
    // the base date itself
    let today = base.date_naive();
    let mut ahead = (weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    Some(today + Duration::days(ahead))
}

fn find_time_of_day(text: &str) -> Option<NaiveTime> {
    static CLOCK: OnceLock<Regex> = OnceLock::new();
    static HOUR: OnceLock<Regex> = OnceLock::new();
    static ZH: OnceLock<Regex> = OnceLock::new();

    let clock = CLOCK.get_or_init(|| Regex::new(r"\b(\d{1,2}):(\d{2})\s*(am|pm)?\b").unwrap());
    let hour = HOUR.get_or_init(|| Regex::new(r"\b(\d{1,2})\s*(am|pm)\b").unwrap());
    let zh = ZH.get_or_init(|| {
        Regex::new("(\u{4e0a}\u{5348}|\u{4e0b}\u{5348})\\s*(\\d{1,2})(?:[\u{70b9}:\u{ff1a}](\\d{1,2}))?")
            .unwrap()
    });

    if let Some(caps) = clock.captures(text) {
        let h: u32 = caps[1].parse().ok()?;
        let m: u32 = caps[2].parse().ok()?;
        let marker = caps.get(3).map(|m| m.as_str());
        return NaiveTime::from_hms_opt(apply_meridiem(h, marker)?, m, 0);
    }
    if let Some(caps) = hour.captures(text) {
        let h: u32 = caps[1].parse().ok()?;
        return NaiveTime::from_hms_opt(apply_meridiem(h, Some(&caps[2]))?, 0, 0);
    }
    if let Some(caps) = zh.captures(text) {
        let marker = if &caps[1] == "\u{4e0b}\u{5348}" { "pm" } else { "am" };
        let h: u32 = caps[2].parse().ok()?;
        let m: u32 = caps
            .get(3)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);
        return NaiveTime::from_hms_opt(apply_meridiem(h, Some(marker))?, m, 0);
    }
    None
}

fn apply_meridiem(hour: u32, marker: Option<&str>) -> Option<u32> {
    let hour = match marker {
        Some("pm") if hour < 12 => hour + 12,
        Some("am") if hour == 12 => 0,
        _ => hour,
    };
    (hour <= 23).then_some(hour)
}

fn nearest_future_time_of_day(text: &str, base: DateTime<Tz>) -> Option<DateTime<Tz>> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b").unwrap());
    let caps = re.captures(text)?;

    let h: u32 = caps[1].parse().ok()?;
    let m: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    let marker = caps.get(3).map(|m| m.as_str());
    let time = NaiveTime::from_hms_opt(apply_meridiem(h, marker)?, m, 0)?;

    let mut naive = NaiveDateTime::new(base.date_naive(), time);
    let mut candidate = localize(base, naive)?;
    if candidate <= base {
        naive = naive + Duration::days(1);
        candidate = localize(base, naive)?;
    }
    Some(candidate)
}

fn localize(base: DateTime<Tz>, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    base.timezone().from_local_datetime(&naive).earliest()
}
