//! Delivery-time calculation with timezone-aware quiet hours.

use chrono::{DateTime, Days, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::db::UserPreferences;
use crate::error::{AppError, AppResult};

/// Parse an `HH:MM` wall-clock time.
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// IANA timezone by name, falling back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    name.trim().parse::<Tz>().unwrap_or_else(|_| {
        tracing::warn!("Unknown timezone '{}', using UTC", name);
        Tz::UTC
    })
}

/// A quiet-hours window at minute resolution. `start > end` means the window
/// spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    /// `None` when the preferences have no window or it cannot be parsed.
    pub fn from_preferences(prefs: &UserPreferences) -> Option<Self> {
        let (start, end) = match (&prefs.quiet_hours_start, &prefs.quiet_hours_end) {
            (Some(s), Some(e)) => (s, e),
            _ => return None,
        };
        match (parse_hhmm(start), parse_hhmm(end)) {
            (Some(start), Some(end)) => Some(Self { start, end }),
            _ => {
                tracing::warn!(
                    "User {} has malformed quiet hours '{}'-'{}', ignoring them",
                    prefs.user_id,
                    start,
                    end
                );
                None
            }
        }
    }

    pub fn contains(&self, local: NaiveTime) -> bool {
        let current = minutes_of_day(local);
        let start = minutes_of_day(self.start);
        let end = minutes_of_day(self.end);
        if start > end {
            current >= start || current <= end
        } else {
            start <= current && current <= end
        }
    }
}

fn minutes_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Resolve a local wall-clock time to an instant. Ambiguous times take the
/// earlier instant; times inside a DST gap move forward until they exist.
fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = local;
    for _ in 0..4 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => match candidate.checked_add_signed(Duration::minutes(30)) {
                Some(next) => candidate = next,
                None => break,
            },
        }
    }
    // No real zone has a gap this long.
    Utc.from_utc_datetime(&local)
}

pub fn is_within_quiet_hours(time: DateTime<Utc>, prefs: &UserPreferences, timezone: &str) -> bool {
    let Some(window) = QuietWindow::from_preferences(prefs) else {
        return false;
    };
    let tz = resolve_timezone(timezone);
    window.contains(time.with_timezone(&tz).time())
}

/// The soonest occurrence of the window's end, in the user's timezone, at or
/// after `time`. Returns `time` unchanged when there is no usable window.
pub fn move_out_of_quiet_hours(
    time: DateTime<Utc>,
    prefs: &UserPreferences,
    timezone: &str,
) -> DateTime<Utc> {
    let Some(window) = QuietWindow::from_preferences(prefs) else {
        return time;
    };
    let tz = resolve_timezone(timezone);
    let local = time.with_timezone(&tz);

    // Already in the final minute of the window.
    if minutes_of_day(local.time()) == minutes_of_day(window.end) {
        return time;
    }

    let today = local.date_naive();
    for offset in 0..=2u64 {
        let Some(day) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        let end = local_to_utc(&tz, day.and_time(window.end));
        if end >= time {
            return end;
        }
    }
    time
}

pub fn calculate_scheduled_time(
    delay_minutes: i64,
    timezone: &str,
    prefs: Option<&UserPreferences>,
) -> AppResult<DateTime<Utc>> {
    calculate_scheduled_time_at(Utc::now(), delay_minutes, timezone, prefs)
}

/// `now + delay`, pushed past quiet hours. Negative delays count as
/// immediate. Immediate notifications and users without preferences are
/// never deferred. Fails when the delay does not fit in a timestamp.
pub fn calculate_scheduled_time_at(
    now: DateTime<Utc>,
    delay_minutes: i64,
    timezone: &str,
    prefs: Option<&UserPreferences>,
) -> AppResult<DateTime<Utc>> {
    let delay_minutes = delay_minutes.max(0);
    let candidate = Duration::try_minutes(delay_minutes)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| {
            AppError::Validation(format!(
                "delay of {} minutes is out of range",
                delay_minutes
            ))
        })?;
    let prefs = match prefs {
        Some(p) if delay_minutes != 0 => p,
        _ => return Ok(candidate),
    };

    if is_within_quiet_hours(candidate, prefs, timezone) {
        let moved = move_out_of_quiet_hours(candidate, prefs, timezone);
        tracing::debug!(
            "Deferred notification for user {} from {} to {} (quiet hours)",
            prefs.user_id,
            candidate,
            moved
        );
        Ok(moved)
    } else {
        Ok(candidate)
    }
}
