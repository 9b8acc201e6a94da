//! Rate-limit signal normalization
//!
//! Upstream capacity shows up in two places: response headers on live
//! traffic, and usage-accounting entries appended to session logs after a
//! probe. Both are normalized here into the two-window model (`five_hour`,
//! `weekly`). Everything in this module is a pure function of its inputs.
//!
//! Numeric conventions:
//! - all timestamps out of this module are absolute unix milliseconds
//! - percentages are clamped to `[0, 100]`
//! - an ambiguous reset number above 1e12 is milliseconds, above 1e9 is
//!   seconds since the epoch, anything smaller is seconds from now

use account_auth::{RateLimitWindow, RateLimits, now_millis};
use chrono::DateTime;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

/// Header-name fragments that place a signal in the long window.
const WEEKLY_TOKENS: &[&str] = &["weekly", "week", "7d", "7-day", "168h", "secondary"];

/// Windows at least this long are the weekly budget.
const WEEKLY_MIN_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    FiveHour,
    Weekly,
}

fn bucket_for(header_name: &str) -> Bucket {
    if WEEKLY_TOKENS.iter().any(|t| header_name.contains(t)) {
        Bucket::Weekly
    } else {
        Bucket::FiveHour
    }
}

fn window_mut(limits: &mut RateLimits, bucket: Bucket) -> &mut RateLimitWindow {
    let slot = match bucket {
        Bucket::FiveHour => &mut limits.five_hour,
        Bucket::Weekly => &mut limits.weekly,
    };
    slot.get_or_insert_with(RateLimitWindow::default)
}

/// Clamp a percentage into `[0, 100]`.
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) }
}

/// Interpret a bare reset number by magnitude.
pub fn normalize_reset(value: f64, now: u64) -> u64 {
    if value > 1e12 {
        value as u64
    } else if value > 1e9 {
        (value * 1000.0) as u64
    } else {
        now.saturating_add((value.max(0.0) * 1000.0) as u64)
    }
}

/// Parse a reset header value: a bare number, a duration such as `120s`,
/// `1m30s` or `250ms`, or an RFC 3339 timestamp.
pub fn parse_reset(raw: &str, now: u64) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<f64>() {
        return number.is_finite().then(|| normalize_reset(number, now));
    }
    if let Some(ms) = parse_duration_ms(raw) {
        return Some(now.saturating_add(ms as u64));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
}

/// `1h2m3s`, `120s`, `250ms` style durations, in milliseconds.
fn parse_duration_ms(raw: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    let mut saw_unit = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit_ms = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'h' => 3_600_000.0,
            'm' => 60_000.0,
            's' => 1_000.0,
            _ => return None,
        };
        let value: f64 = number.parse().ok()?;
        number.clear();
        total += value * unit_ms;
        saw_unit = true;
    }

    (saw_unit && number.is_empty()).then_some(total)
}

/// Rate-limit windows from response headers, or `None` when no
/// recognizable header is present.
pub fn extract_from_headers(headers: &HeaderMap) -> Option<RateLimits> {
    extract_from_headers_at(headers, now_millis())
}

/// `extract_from_headers` with an explicit clock.
///
/// Two header families are recognized:
/// - generic `*ratelimit*-{limit,remaining,reset}*` headers, bucketed by the
///   window token in the name (no token means the short window);
/// - the percent-used family (`*-primary-used-percent`,
///   `*-secondary-reset-after-seconds`, ...), where `limit` is 100 and
///   `remaining` is `100 - used`.
///
/// Token-count variants of the generic family are ignored; accounts are
/// budgeted by request windows.
pub fn extract_from_headers_at(headers: &HeaderMap, now: u64) -> Option<RateLimits> {
    let mut limits = RateLimits::default();

    for (name, value) in headers {
        let name = name.as_str();
        let Ok(value) = value.to_str() else {
            continue;
        };
        let value = value.trim();

        if name.contains("used-percent") || name.contains("used_percent") {
            if let Ok(used) = value.parse::<f64>() {
                let window = window_mut(&mut limits, bucket_for(name));
                window.limit = Some(100.0);
                window.remaining = Some(100.0 - clamp_percent(used));
                window.updated_at = Some(now);
            }
            continue;
        }

        if name.contains("-primary-") || name.contains("-secondary-") {
            let reset = if name.contains("reset-after") {
                value
                    .parse::<f64>()
                    .ok()
                    .map(|secs| now.saturating_add((secs.max(0.0) * 1000.0) as u64))
            } else if name.contains("reset-at") {
                parse_reset(value, now)
            } else {
                None
            };
            if let Some(reset_at) = reset {
                let window = window_mut(&mut limits, bucket_for(name));
                window.reset_at = Some(reset_at);
                window.updated_at = Some(now);
            }
            continue;
        }

        if !(name.contains("ratelimit") || name.contains("rate-limit")) || name.contains("token")
        {
            continue;
        }
        let field = name.replace("ratelimit", "").replace("rate-limit", "");
        let bucket = bucket_for(&field);

        if field.contains("remaining") {
            if let Ok(remaining) = value.parse::<f64>() {
                let window = window_mut(&mut limits, bucket);
                window.remaining = Some(remaining.max(0.0));
                window.updated_at = Some(now);
            }
        } else if field.contains("reset") {
            if let Some(reset_at) = parse_reset(value, now) {
                let window = window_mut(&mut limits, bucket);
                window.reset_at = Some(reset_at);
                window.updated_at = Some(now);
            }
        } else if field.contains("limit")
            && let Ok(limit) = value.parse::<f64>()
        {
            let window = window_mut(&mut limits, bucket);
            window.limit = Some(limit.max(0.0));
            window.updated_at = Some(now);
        }
    }

    (!limits.is_empty()).then_some(limits)
}

/// One sub-window reported in a usage-accounting entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionWindow {
    pub used_percent: f64,
    #[serde(default)]
    pub window_minutes: Option<u64>,
    #[serde(default)]
    pub resets_in_seconds: Option<f64>,
    #[serde(default)]
    pub resets_at: Option<f64>,
}

impl SessionWindow {
    /// Normalized window, anchoring relative resets at `base` (the entry's
    /// own timestamp, not the time of parsing).
    fn to_window(&self, base: u64) -> RateLimitWindow {
        let reset_at = self
            .resets_in_seconds
            .map(|secs| base.saturating_add((secs.max(0.0) * 1000.0) as u64))
            .or_else(|| self.resets_at.map(|v| normalize_reset(v, base)));
        RateLimitWindow {
            limit: Some(100.0),
            remaining: Some(100.0 - clamp_percent(self.used_percent)),
            reset_at,
            updated_at: Some(base),
        }
    }
}

/// A usage-accounting entry from an append-only session log.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLogEntry {
    /// Unix ms at which the entry was written.
    pub timestamp: u64,
    pub primary: Option<SessionWindow>,
    pub secondary: Option<SessionWindow>,
}

impl SessionLogEntry {
    fn has_windows(&self) -> bool {
        self.primary.is_some() || self.secondary.is_some()
    }
}

#[derive(Deserialize)]
struct RawRateLimits {
    #[serde(default)]
    primary: Option<SessionWindow>,
    #[serde(default)]
    secondary: Option<SessionWindow>,
}

/// Parse one JSONL line. Lines without rate-limit data yield `None`.
///
/// Accepts the limits either at `payload.rate_limits` or top-level
/// `rate_limits`, and a `timestamp` as RFC 3339 or epoch number.
pub fn parse_session_line(line: &str) -> Option<SessionLogEntry> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let timestamp = match value.get("timestamp")? {
        Value::String(s) => u64::try_from(DateTime::parse_from_rfc3339(s).ok()?.timestamp_millis()).ok()?,
        Value::Number(n) => normalize_reset(n.as_f64()?, 0),
        _ => return None,
    };
    let raw = value
        .get("payload")
        .and_then(|p| p.get("rate_limits"))
        .or_else(|| value.get("rate_limits"))?;
    let limits: RawRateLimits = serde_json::from_value(raw.clone()).ok()?;

    let entry = SessionLogEntry {
        timestamp,
        primary: limits.primary,
        secondary: limits.secondary,
    };
    entry.has_windows().then_some(entry)
}

/// Windows from the newest entry written at or after `since_ts`.
///
/// The two sub-windows are classified by their stated lengths: the longer
/// one is weekly. A lone window is weekly when it spans at least a day.
/// Without stated lengths, primary is the short window.
pub fn extract_from_session_log(entries: &[SessionLogEntry], since_ts: u64) -> Option<RateLimits> {
    let entry = entries
        .iter()
        .rev()
        .filter(|e| e.timestamp >= since_ts && e.has_windows())
        .max_by_key(|e| e.timestamp)?;
    let base = entry.timestamp;

    let (short, long) = match (&entry.primary, &entry.secondary) {
        (Some(p), Some(s)) => match (p.window_minutes, s.window_minutes) {
            (Some(pm), Some(sm)) if pm > sm => (Some(s), Some(p)),
            _ => (Some(p), Some(s)),
        },
        (Some(only), None) | (None, Some(only)) => {
            let weekly = match only.window_minutes {
                Some(minutes) => minutes >= WEEKLY_MIN_MINUTES,
                None => entry.secondary.is_some(),
            };
            if weekly { (None, Some(only)) } else { (Some(only), None) }
        }
        (None, None) => return None,
    };

    Some(RateLimits {
        five_hour: short.map(|w| w.to_window(base)),
        weekly: long.map(|w| w.to_window(base)),
    })
}

/// Shallow per-window merge: fields present in `update` overwrite the same
/// window's fields; windows absent from `update` are untouched.
pub fn merge(existing: &RateLimits, update: &RateLimits) -> RateLimits {
    RateLimits {
        five_hour: merge_window(existing.five_hour.as_ref(), update.five_hour.as_ref()),
        weekly: merge_window(existing.weekly.as_ref(), update.weekly.as_ref()),
    }
}

fn merge_window(
    existing: Option<&RateLimitWindow>,
    update: Option<&RateLimitWindow>,
) -> Option<RateLimitWindow> {
    let Some(update) = update else {
        return existing.cloned();
    };
    let mut merged = existing.cloned().unwrap_or_default();
    if update.limit.is_some() {
        merged.limit = update.limit;
    }
    if update.remaining.is_some() {
        merged.remaining = update.remaining;
    }
    if update.reset_at.is_some() {
        merged.reset_at = update.reset_at;
    }
    if update.updated_at.is_some() {
        merged.updated_at = update.updated_at;
    }
    (!merged.is_blank()).then_some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    const NOW: u64 = 1_750_000_000_000;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    #[test]
    fn percent_family_converts_used_to_remaining() {
        let limits = extract_from_headers_at(
            &headers(&[("x-codex-primary-used-percent", "25")]),
            NOW,
        )
        .unwrap();
        let window = limits.five_hour.unwrap();
        assert_eq!(window.remaining, Some(75.0));
        assert_eq!(window.limit, Some(100.0));
        assert!(limits.weekly.is_none());
    }

    #[test]
    fn percent_family_secondary_is_weekly_and_clamped() {
        let limits = extract_from_headers_at(
            &headers(&[
                ("x-codex-secondary-used-percent", "140"),
                ("x-codex-secondary-reset-after-seconds", "3600"),
            ]),
            NOW,
        )
        .unwrap();
        let weekly = limits.weekly.unwrap();
        assert_eq!(weekly.remaining, Some(0.0));
        assert_eq!(weekly.reset_at, Some(NOW + 3_600_000));
    }

    #[test]
    fn generic_family_reads_limit_remaining_reset() {
        let limits = extract_from_headers_at(
            &headers(&[
                ("x-ratelimit-limit", "1000"),
                ("x-ratelimit-remaining", "400"),
                ("x-ratelimit-reset", "120s"),
            ]),
            NOW,
        )
        .unwrap();
        let window = limits.five_hour.unwrap();
        assert_eq!(window.limit, Some(1000.0));
        assert_eq!(window.remaining, Some(400.0));
        assert_eq!(window.reset_at, Some(NOW + 120_000));
        assert_eq!(window.updated_at, Some(NOW));
    }

    #[test]
    fn generic_family_buckets_by_window_token() {
        let limits = extract_from_headers_at(
            &headers(&[
                ("x-ratelimit-remaining-5h", "10"),
                ("x-ratelimit-remaining-weekly", "90"),
                ("x-ratelimit-limit-tokens", "999999"),
            ]),
            NOW,
        )
        .unwrap();
        assert_eq!(limits.five_hour.unwrap().remaining, Some(10.0));
        let weekly = limits.weekly.unwrap();
        assert_eq!(weekly.remaining, Some(90.0));
        assert!(weekly.limit.is_none());
    }

    #[test]
    fn unrelated_headers_yield_none() {
        let map = headers(&[("content-type", "application/json"), ("retry-after", "30")]);
        assert!(extract_from_headers_at(&map, NOW).is_none());
    }

    #[test]
    fn reset_values_classified_by_magnitude() {
        assert_eq!(normalize_reset(1_750_000_123_456.0, NOW), 1_750_000_123_456);
        assert_eq!(normalize_reset(1_750_000_123.0, NOW), 1_750_000_123_000);
        assert_eq!(normalize_reset(90.0, NOW), NOW + 90_000);
        assert_eq!(normalize_reset(-5.0, NOW), NOW);
    }

    #[test]
    fn reset_accepts_durations_and_dates() {
        assert_eq!(parse_reset("1m30s", NOW), Some(NOW + 90_000));
        assert_eq!(parse_reset("250ms", NOW), Some(NOW + 250));
        assert_eq!(parse_reset("2h", NOW), Some(NOW + 7_200_000));
        assert_eq!(
            parse_reset("2025-06-15T16:26:40Z", NOW),
            Some(1_750_004_800_000)
        );
        assert_eq!(parse_reset("soon", NOW), None);
        assert_eq!(parse_reset("12x", NOW), None);
        assert_eq!(parse_reset("inf", NOW), None);
        assert_eq!(parse_reset("-Infinity", NOW), None);
        assert_eq!(parse_reset("NaN", NOW), None);
    }

    fn window(used: f64, minutes: u64, resets_in: f64) -> SessionWindow {
        SessionWindow {
            used_percent: used,
            window_minutes: Some(minutes),
            resets_in_seconds: Some(resets_in),
            resets_at: None,
        }
    }

    #[test]
    fn session_log_picks_newest_entry_since_timestamp() {
        let entries = vec![
            SessionLogEntry {
                timestamp: NOW - 10_000,
                primary: Some(window(90.0, 300, 60.0)),
                secondary: None,
            },
            SessionLogEntry {
                timestamp: NOW + 5_000,
                primary: Some(window(20.0, 300, 600.0)),
                secondary: Some(window(55.0, 10_080, 86_400.0)),
            },
        ];

        let limits = extract_from_session_log(&entries, NOW).unwrap();
        let short = limits.five_hour.unwrap();
        assert_eq!(short.remaining, Some(80.0));
        // Relative reset anchored at the entry's own timestamp
        assert_eq!(short.reset_at, Some(NOW + 5_000 + 600_000));
        assert_eq!(limits.weekly.unwrap().remaining, Some(45.0));
    }

    #[test]
    fn session_log_classifies_by_window_length_not_position() {
        let entries = vec![SessionLogEntry {
            timestamp: NOW,
            primary: Some(window(70.0, 10_080, 100.0)),
            secondary: Some(window(10.0, 300, 100.0)),
        }];
        let limits = extract_from_session_log(&entries, 0).unwrap();
        assert_eq!(limits.weekly.unwrap().remaining, Some(30.0));
        assert_eq!(limits.five_hour.unwrap().remaining, Some(90.0));
    }

    #[test]
    fn session_log_ignores_entries_before_cutoff() {
        let entries = vec![SessionLogEntry {
            timestamp: NOW - 1,
            primary: Some(window(5.0, 300, 1.0)),
            secondary: None,
        }];
        assert!(extract_from_session_log(&entries, NOW).is_none());
    }

    #[test]
    fn parses_session_log_line() {
        let line = r#"{"timestamp":"2025-06-15T16:26:40.000Z","type":"event_msg","payload":{"type":"token_count","rate_limits":{"primary":{"used_percent":12.5,"window_minutes":300,"resets_in_seconds":1200},"secondary":{"used_percent":40,"window_minutes":10080,"resets_at":1750600000}}}}"#;
        let entry = parse_session_line(line).unwrap();
        assert_eq!(entry.timestamp, 1_750_004_800_000);

        let limits = extract_from_session_log(&[entry], 0).unwrap();
        assert_eq!(limits.five_hour.unwrap().remaining, Some(87.5));
        assert_eq!(limits.weekly.unwrap().reset_at, Some(1_750_600_000_000));
    }

    #[test]
    fn session_line_without_limits_is_skipped() {
        assert!(parse_session_line(r#"{"timestamp":"2025-06-15T16:26:40Z","payload":{}}"#).is_none());
        assert!(parse_session_line("not json").is_none());
    }

    #[test]
    fn merge_leaves_absent_window_untouched() {
        let existing = RateLimits {
            five_hour: Some(RateLimitWindow {
                limit: Some(100.0),
                remaining: Some(50.0),
                reset_at: Some(1),
                updated_at: Some(1),
            }),
            weekly: Some(RateLimitWindow {
                limit: Some(100.0),
                remaining: Some(80.0),
                reset_at: Some(2),
                updated_at: Some(2),
            }),
        };
        let update = RateLimits {
            five_hour: Some(RateLimitWindow {
                remaining: Some(10.0),
                updated_at: Some(3),
                ..Default::default()
            }),
            weekly: None,
        };

        let merged = merge(&existing, &update);
        assert_eq!(merged.weekly, existing.weekly);
        let short = merged.five_hour.unwrap();
        assert_eq!(short.remaining, Some(10.0));
        assert_eq!(short.limit, Some(100.0));
        assert_eq!(short.reset_at, Some(1));
        assert_eq!(short.updated_at, Some(3));
    }

    #[test]
    fn merge_into_empty_adopts_update() {
        let update = RateLimits {
            five_hour: None,
            weekly: Some(RateLimitWindow {
                remaining: Some(5.0),
                ..Default::default()
            }),
        };
        assert_eq!(merge(&RateLimits::default(), &update), update);
    }
}
