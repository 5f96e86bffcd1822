//! Time bucket arithmetic and identifier helpers.
//!
//! Archived directory documents are filed by period: consensuses by hour,
//! server descriptors by month. The helpers here compute those buckets and
//! enumerate them over closed ranges. They also convert the compact base64
//! identifiers used in consensus `r` lines into the hex form used everywhere
//! else.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use relay_history::util::{floor_to_month, hours_between};
//!
//! let start = Utc.with_ymd_and_hms(2024, 1, 31, 22, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap();
//!
//! assert_eq!(hours_between(start, end).len(), 4);
//! assert_eq!(
//!     floor_to_month(end),
//!     Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
//! );
//! ```

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Datelike, Months, TimeDelta, Timelike, Utc};

/// Brings a fingerprint into the form relays are keyed by: 40 uppercase
/// hex digits.
///
/// Either case is accepted, as is the `$` prefix used in family lines and
/// relay specifiers. Anything else yields `None`.
///
/// ```rust
/// use relay_history::util::normalize_fingerprint;
///
/// assert_eq!(
///     normalize_fingerprint("$9695dfc35ffeb861329b9f1ab04c46397020ce31").as_deref(),
///     Some("9695DFC35FFEB861329B9F1AB04C46397020CE31"),
/// );
/// assert!(normalize_fingerprint("caerSidi").is_none());
/// ```
pub fn normalize_fingerprint(input: &str) -> Option<String> {
    let hex = input.trim();
    let hex = hex.strip_prefix('$').unwrap_or(hex);
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(hex.to_ascii_uppercase())
}

/// Decodes an unpadded base64 identifier into hexadecimal.
///
/// Consensus `r` lines carry both the relay identity and the descriptor
/// digest as base64 without padding. Trailing `=` characters are tolerated.
///
/// Returns `None` if the input is not valid base64.
///
/// ```rust
/// use relay_history::util::base64_to_hex;
///
/// assert_eq!(
///     base64_to_hex("p1aag7VwarGxqctS7/fS0y5FU+s", true).as_deref(),
///     Some("A7569A83B5706AB1B1A9CB52EFF7D2D32E4553EB")
/// );
/// ```
pub fn base64_to_hex(input: &str, uppercase: bool) -> Option<String> {
    let decoded = STANDARD_NO_PAD.decode(input.trim_end_matches('=')).ok()?;
    if decoded.is_empty() {
        return None;
    }
    Some(
        decoded
            .iter()
            .map(|b| {
                if uppercase {
                    format!("{:02X}", b)
                } else {
                    format!("{:02x}", b)
                }
            })
            .collect(),
    )
}

/// Truncates a timestamp to the start of its hour.
pub fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t - TimeDelta::seconds(i64::from(t.minute() * 60 + t.second()))
        - TimeDelta::nanoseconds(i64::from(t.nanosecond()))
}

/// Truncates a timestamp to midnight of its day.
pub fn floor_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_hour(t) - TimeDelta::hours(i64::from(t.hour()))
}

/// Truncates a timestamp to midnight of the first day of its month.
pub fn floor_to_month(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_day(t) - TimeDelta::days(i64::from(t.day() - 1))
}

/// Start of the month `months` months before the month containing `t`.
///
/// Returns `None` only when the result is not representable.
pub fn months_back(t: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    floor_to_month(t).checked_sub_months(Months::new(months))
}

/// Every hour from `start` (truncated to its hour) up to and including `end`.
///
/// Returns an empty list when `start > end`.
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    step_between(floor_to_hour(start), end, TimeDelta::hours(1))
}

/// Every midnight from `start`'s day up to and including `end`.
pub fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    step_between(floor_to_day(start), end, TimeDelta::days(1))
}

/// Every month start from `start`'s month up to and including `end`, ascending.
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use relay_history::util::months_between;
///
/// let start = Utc.with_ymd_and_hms(2023, 11, 20, 5, 0, 0).unwrap();
/// let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
/// assert_eq!(months_between(start, end).len(), 3);
/// ```
pub fn months_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut months = Vec::new();
    let mut month = floor_to_month(start);
    while month <= end {
        months.push(month);
        match month.checked_add_months(Months::new(1)) {
            Some(next) => month = next,
            None => break,
        }
    }
    months
}

fn step_between(
    mut current: DateTime<Utc>,
    end: DateTime<Utc>,
    step: TimeDelta,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    while current <= end {
        out.push(current);
        current += step;
    }
    out
}
