//! Calendar-month windows.
//!
//! All arithmetic happens in the time zone of the `now` value handed in, so
//! the service uses the server's local zone while tests can pin a fixed one.

use chrono::{DateTime, Datelike, Local, LocalResult, TimeZone, Utc};

use crate::error::{PeakError, Result};
use crate::models::Window;

/// Resolves an optional 1-based month selector into the window of that month.
///
/// `None` and `Some(0)` select the previous calendar month. Selectors above 12
/// are clamped to 12. A month that lies after the current month refers to
/// last year, so asking for December in March yields last December.
pub fn resolve_window<Tz: TimeZone>(selector: Option<u32>, now: &DateTime<Tz>) -> Result<Window> {
    let current = now.month0();
    let month0 = match selector {
        Some(m) if m >= 1 => m.min(12) - 1,
        _ => (current + 11) % 12,
    };
    let year = if month0 > current { now.year() - 1 } else { now.year() };

    month_window(&now.timezone(), year, month0)
}

/// Window spanning the whole of `month0` (zero-based) of `year`, up to and
/// including its last millisecond.
pub fn month_window<Tz: TimeZone>(tz: &Tz, year: i32, month0: u32) -> Result<Window> {
    if month0 > 11 {
        return Err(PeakError::InvalidWindow(format!(
            "month must be 0-11 inclusive, got {}",
            month0
        )));
    }

    let start = month_start(tz, year, month0)?;
    let (next_year, next_month0) = if month0 == 11 {
        (year + 1, 0)
    } else {
        (year, month0 + 1)
    };
    let end = month_start(tz, next_year, next_month0)? - 1;

    Ok(Window::new(start, end))
}

/// Last millisecond that retention pruning may delete: the end of the month
/// `keep_months + 1` months before the current one.
pub fn retention_cutoff<Tz: TimeZone>(now: &DateTime<Tz>, keep_months: u32) -> Result<i64> {
    let index = i64::from(now.year()) * 12 + i64::from(now.month0()) - 1 - i64::from(keep_months);
    let year = i32::try_from(index.div_euclid(12))
        .map_err(|_| PeakError::InvalidWindow(format!("year out of range for month index {}", index)))?;
    let month0 = index.rem_euclid(12) as u32;

    Ok(month_window(&now.timezone(), year, month0)?.end)
}

fn month_start<Tz: TimeZone>(tz: &Tz, year: i32, month0: u32) -> Result<i64> {
    // Zones that jump at midnight have no 00:00 on some days.
    for hour in 0..3 {
        match tz.with_ymd_and_hms(year, month0 + 1, 1, hour, 0, 0) {
            LocalResult::Single(dt) => return Ok(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.timestamp_millis()),
            LocalResult::None => continue,
        }
    }

    Err(PeakError::InvalidWindow(format!(
        "no start instant for {}-{:02}",
        year,
        month0 + 1
    )))
}

/// Epoch milliseconds in the local zone.
pub fn local_time(millis: i64) -> Result<DateTime<Local>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|utc| utc.with_timezone(&Local))
        .ok_or_else(|| PeakError::InvalidWindow(format!("timestamp out of range: {}", millis)))
}

/// Formats epoch milliseconds as `YYYY/MM/DD HH:MM:SS.mmm` in the local zone.
pub fn format_timestamp(millis: i64) -> String {
    format_timestamp_in(&Local, millis)
}

pub fn format_timestamp_in<Tz: TimeZone>(tz: &Tz, millis: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match tz.timestamp_millis_opt(millis) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
            dt.format("%Y/%m/%d %H:%M:%S%.3f").to_string()
        }
        LocalResult::None => millis.to_string(),
    }
}
