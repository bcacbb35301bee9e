//! Rate-limit response headers.
//!
//! Parsing is lenient: a missing or malformed header yields `None` and the
//! caller treats the route as having no known bucket.

use std::time::Duration;

use {
    chrono::{DateTime, Utc},
    http::HeaderMap,
};

use ferrule_ratelimit::{RateLimitHeader, Scope};

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";
pub const DATE: &str = "date";

/// Headers that may carry a request correlation ID, most specific first.
const CORRELATION: [&str; 3] = ["x-request-id", "x-audit-id", "cf-ray"];

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Non-negative, finite seconds (fractional allowed).
fn seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Route bucket state, or `None` when the response names no bucket or
/// its numbers cannot be trusted.
///
/// The limit must be a positive integer and the remaining count a
/// non-negative one. A missing `Reset-After` reads as zero; a malformed one
/// rejects the whole set.
pub fn rate_limit(headers: &HeaderMap) -> Option<RateLimitHeader> {
    let bucket = text(headers, BUCKET)?.to_string();
    let limit = text(headers, LIMIT)?
        .parse::<i64>()
        .ok()
        .filter(|limit| *limit > 0)?;
    let remaining = text(headers, REMAINING)?
        .parse::<i64>()
        .ok()
        .filter(|remaining| *remaining >= 0)?;
    let reset_after = match text(headers, RESET_AFTER) {
        Some(raw) => seconds(raw)?,
        None => Duration::ZERO,
    };
    Some(RateLimitHeader {
        limit,
        remaining,
        reset_after,
        bucket,
        global: is_global(headers),
        scope: scope(headers),
    })
}

pub fn scope(headers: &HeaderMap) -> Option<Scope> {
    text(headers, SCOPE).and_then(Scope::parse)
}

pub fn is_global(headers: &HeaderMap) -> bool {
    text(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// `Retry-After` in (possibly fractional) seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    text(headers, RETRY_AFTER).and_then(seconds)
}

/// The server's `Date`, truncated to whole seconds by the format itself.
pub fn date(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = text(headers, DATE)?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn correlation(headers: &HeaderMap) -> Option<String> {
    CORRELATION
        .iter()
        .find_map(|name| text(headers, name))
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        chrono::{Datelike, Timelike},
        http::HeaderValue,
        rstest::rstest,
    };

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn full_header_set() {
        let headers = map(&[
            (LIMIT, "5"),
            (REMAINING, "4"),
            (RESET, "1470173023.123"),
            (RESET_AFTER, "1.5"),
            (BUCKET, "abcd1234"),
        ]);
        let parsed = rate_limit(&headers).unwrap();
        assert_eq!(parsed.limit, 5);
        assert_eq!(parsed.remaining, 4);
        assert_eq!(parsed.reset_after, Duration::from_millis(1500));
        assert_eq!(parsed.bucket, "abcd1234");
        assert!(!parsed.global);
        assert!(parsed.scope.is_none());
    }

    #[test]
    fn missing_bucket_means_no_bucket() {
        let headers = map(&[(LIMIT, "5"), (REMAINING, "4")]);
        assert!(rate_limit(&headers).is_none());
    }

    #[rstest]
    #[case(&[(LIMIT, "five"), (REMAINING, "4"), (BUCKET, "x")])]
    #[case(&[(LIMIT, "0"), (REMAINING, "0"), (BUCKET, "x")])]
    #[case(&[(LIMIT, "5"), (REMAINING, "-1"), (BUCKET, "x")])]
    #[case(&[(LIMIT, "5"), (REMAINING, "4"), (RESET_AFTER, "-3"), (BUCKET, "x")])]
    #[case(&[(REMAINING, "4"), (BUCKET, "x")])]
    fn untrusted_numbers_mean_no_bucket(#[case] pairs: &[(&'static str, &'static str)]) {
        assert!(rate_limit(&map(pairs)).is_none());
    }

    #[test]
    fn missing_reset_after_reads_as_zero() {
        let headers = map(&[(LIMIT, "5"), (REMAINING, "4"), (BUCKET, "x")]);
        assert_eq!(rate_limit(&headers).unwrap().reset_after, Duration::ZERO);
    }

    #[rstest]
    #[case("global", Some(Scope::Global))]
    #[case("user", Some(Scope::User))]
    #[case("shared", Some(Scope::Shared))]
    #[case("Shared", Some(Scope::Shared))]
    #[case("bogus", None)]
    fn scope_values(#[case] raw: &'static str, #[case] expected: Option<Scope>) {
        assert_eq!(scope(&map(&[(SCOPE, raw)])), expected);
    }

    #[rstest]
    #[case("true", true)]
    #[case("True", true)]
    #[case("false", false)]
    fn global_flag(#[case] raw: &'static str, #[case] expected: bool) {
        assert_eq!(is_global(&map(&[(GLOBAL, raw)])), expected);
    }

    #[rstest]
    #[case("2", Some(Duration::from_secs(2)))]
    #[case("0.25", Some(Duration::from_millis(250)))]
    #[case("soon", None)]
    #[case("NaN", None)]
    fn retry_after_values(#[case] raw: &'static str, #[case] expected: Option<Duration>) {
        assert_eq!(retry_after(&map(&[(RETRY_AFTER, raw)])), expected);
    }

    #[test]
    fn http_date_parses() {
        let parsed = date(&map(&[(DATE, "Tue, 15 Nov 1994 08:12:31 GMT")])).unwrap();
        assert_eq!(parsed.year(), 1994);
        assert_eq!(parsed.hour(), 8);
        assert_eq!(parsed.second(), 31);
        assert!(date(&map(&[(DATE, "yesterday")])).is_none());
    }

    #[test]
    fn correlation_prefers_request_id() {
        let headers = map(&[("cf-ray", "ray-1"), ("x-request-id", "req-9")]);
        assert_eq!(correlation(&headers).as_deref(), Some("req-9"));
        assert!(correlation(&HeaderMap::new()).is_none());
    }
}
