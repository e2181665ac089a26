//! Reading rate-limit budgets out of response headers.
//!
//! Repository servers advertise their remaining request budget but do not
//! block callers that overrun it, so the client has to slow itself down:
//!
//! ```text
//! ratelimit-remaining: 0
//! ratelimit-reset: 1717243200      (unix seconds)
//! ```
//!
//! When the remaining budget is at or below [`REMAINING_THRESHOLD`], the next
//! request must wait until the reset time plus a safety margin.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const REMAINING_HEADER: &str = "ratelimit-remaining";
pub const RESET_HEADER: &str = "ratelimit-reset";

/// Budget at or below which the client pauses until the reset time.
pub const REMAINING_THRESHOLD: i64 = 1;

/// How long to hold off the next request, if the budget is spent.
///
/// Returns `None` when the headers are absent or the budget is still above
/// the threshold.
pub fn rate_limit_delay(headers: &HeaderMap, now: SystemTime, margin: Duration) -> Option<Duration> {
    let remaining = header_number(headers, REMAINING_HEADER)?;
    if remaining > REMAINING_THRESHOLD {
        return None;
    }
    let reset_secs = u64::try_from(header_number(headers, RESET_HEADER)?).ok()?;
    let reset = UNIX_EPOCH + Duration::from_secs(reset_secs);

    let until_reset = reset.duration_since(now).unwrap_or(Duration::ZERO);
    Some(until_reset + margin)
}

/// Parse a `Retry-After` header, either delta-seconds or an HTTP date.
pub fn retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
