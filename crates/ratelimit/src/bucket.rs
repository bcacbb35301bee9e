use std::time::Duration;

use {
    chrono::{DateTime, TimeDelta, Utc},
    serde::{Deserialize, Serialize},
};

use crate::pool::Recycle;

/// Refresh window used when the client resets a bucket on its own.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

// ── Template ─────────────────────────────────────────────────────────

/// Shape of a bucket before the server has told us anything about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketTemplate {
    /// Requests allowed per window.
    pub limit: i64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl BucketTemplate {
    pub const fn new(limit: i64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for BucketTemplate {
    fn default() -> Self {
        Self::new(1, DEFAULT_WINDOW)
    }
}

// ── Response headers ─────────────────────────────────────────────────

/// Scope reported by the server alongside a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Limit applied to every request made with this token.
    Global,
    /// Limit applied to the route's bucket.
    User,
    /// Another caller exhausted a resource-level limit we share.
    Shared,
}

impl Scope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "user" => Some(Self::User),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Rate-limit state reported on a single HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeader {
    pub limit: i64,
    pub remaining: i64,
    pub reset_after: Duration,
    pub bucket: String,
    pub global: bool,
    pub scope: Option<Scope>,
}

// ── Bucket ───────────────────────────────────────────────────────────

/// Which branch a confirmation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The response belongs to the window we already track.
    Unchanged,
    /// The response opened a new window.
    Advanced,
    /// The response belongs to an older window; its token was refunded.
    Refunded,
}

/// A token bucket for the global scope or one server-assigned route group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    id: String,
    limit: i64,
    remaining: i64,
    pending: i64,
    date: Option<DateTime<Utc>>,
    expiry: Option<DateTime<Utc>>,
    window: Duration,
    /// Whether `expiry` came from the server rather than our own reset.
    confirmed: bool,
}

impl Bucket {
    pub(crate) fn init(&mut self, id: &str, template: &BucketTemplate) {
        self.id.clear();
        self.id.push_str(id);
        self.limit = template.limit;
        self.remaining = template.limit;
        self.pending = 0;
        self.date = None;
        self.expiry = None;
        self.window = template.window();
        self.confirmed = false;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn set_id(&mut self, id: &str) {
        self.id.clear();
        self.id.push_str(id);
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn pending(&self) -> i64 {
        self.pending
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_empty(&self) -> bool {
        self.remaining <= 0
    }

    /// A bucket that never had an expiry is treated as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_none_or(|expiry| expiry <= now)
    }

    /// Take `amount` tokens for requests that are about to be sent.
    pub fn use_tokens(&mut self, amount: i64) {
        self.remaining -= amount;
        self.pending += amount;
    }

    /// Start a new window ending at `expiry`, as guessed by the client.
    pub fn reset(&mut self, expiry: DateTime<Utc>) {
        self.remaining = self.limit - self.pending;
        self.expiry = Some(expiry);
        self.confirmed = false;
    }

    /// Reset to a window of the bucket's own length starting at `now`.
    pub fn reset_from(&mut self, now: DateTime<Utc>) {
        self.reset(after(now, self.window));
    }

    /// Mark the bucket empty until `expiry`.
    pub fn exhaust_until(&mut self, expiry: DateTime<Utc>) {
        self.remaining = 0;
        self.expiry = Some(expiry);
        self.confirmed = true;
    }

    /// Confirm in-flight uses without touching the window.
    pub fn settle(&mut self, amount: i64) {
        self.pending = (self.pending - amount).max(0);
    }

    /// Give back in-flight uses that never reached the server.
    pub fn refund(&mut self, amount: i64) {
        self.settle(amount);
        self.remaining = (self.remaining + amount).min(self.limit);
    }

    /// Confirm `amount` uses against the server's `Date` header.
    ///
    /// Responses within one second share a window; a later date starts a new
    /// one, an earlier date means the response raced an already-advanced
    /// window and its token is refunded.
    pub fn confirm_date(
        &mut self,
        amount: i64,
        date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Confirmation {
        self.settle(amount);
        match self.date {
            Some(last) if date == last => Confirmation::Unchanged,
            Some(last) if date < last => {
                self.remaining = (self.remaining + amount).min(self.limit);
                Confirmation::Refunded
            },
            _ => {
                self.date = Some(date);
                self.reset_from(now);
                Confirmation::Advanced
            },
        }
    }

    /// Confirm `amount` uses against the route's rate-limit headers.
    ///
    /// Until the server has confirmed a window, the expiry is only our own
    /// guess and the first header always replaces it. A non-positive limit
    /// is never adopted.
    pub fn confirm_header(
        &mut self,
        amount: i64,
        header: &RateLimitHeader,
        now: DateTime<Utc>,
    ) -> Confirmation {
        self.settle(amount);
        if header.limit > 0 {
            self.limit = header.limit;
            self.remaining = self.remaining.min(self.limit);
        }
        let reset = after(now, header.reset_after);
        match self.expiry {
            Some(expiry) if self.confirmed && reset == expiry => Confirmation::Unchanged,
            Some(expiry) if self.confirmed && reset < expiry => {
                self.remaining = (self.remaining + amount).min(self.limit);
                Confirmation::Refunded
            },
            _ => {
                self.remaining = header.remaining.min(self.limit);
                self.expiry = Some(reset);
                self.confirmed = true;
                Confirmation::Advanced
            },
        }
    }

    pub(crate) fn add_pending(&mut self, amount: i64) {
        self.pending += amount;
    }
}

impl Recycle for Bucket {
    fn recycle(&mut self) {
        self.id.clear();
        self.limit = 0;
        self.remaining = 0;
        self.pending = 0;
        self.date = None;
        self.expiry = None;
        self.window = Duration::ZERO;
        self.confirmed = false;
    }
}

/// `now + duration`, saturating at the latest representable instant.
pub fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bucket(limit: i64) -> Bucket {
        let mut b = Bucket::default();
        b.init("abc", &BucketTemplate::new(limit, DEFAULT_WINDOW));
        b
    }

    fn header(limit: i64, remaining: i64, reset_after_ms: u64) -> RateLimitHeader {
        RateLimitHeader {
            limit,
            remaining,
            reset_after: Duration::from_millis(reset_after_ms),
            bucket: "abc".into(),
            global: false,
            scope: None,
        }
    }

    #[test]
    fn use_moves_tokens_to_pending() {
        let mut b = bucket(5);
        b.use_tokens(2);
        assert_eq!(b.pending(), 2);
        assert_eq!(b.remaining(), 3);
    }

    #[test]
    fn reset_accounts_for_pending() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.use_tokens(3);
        b.reset(now);
        assert_eq!(b.remaining(), 2);
        assert_eq!(b.expiry(), Some(now));
    }

    #[test]
    fn never_reset_bucket_is_expired() {
        let b = bucket(1);
        assert!(b.is_expired(Utc::now()));
    }

    #[test]
    fn confirm_date_first_response_advances() {
        let now = Utc::now();
        let mut b = bucket(50);
        b.use_tokens(1);
        assert_eq!(b.confirm_date(1, now, now), Confirmation::Advanced);
        assert_eq!(b.pending(), 0);
        assert_eq!(b.remaining(), 50);
        assert_eq!(b.date(), Some(now));
    }

    #[test]
    fn confirm_date_same_window_is_noop() {
        let now = Utc::now();
        let mut b = bucket(50);
        b.use_tokens(1);
        b.confirm_date(1, now, now);
        b.use_tokens(1);
        assert_eq!(b.confirm_date(1, now, now), Confirmation::Unchanged);
        assert_eq!(b.pending(), 0);
        assert_eq!(b.remaining(), 49);
    }

    #[test]
    fn confirm_date_stale_window_refunds() {
        let now = Utc::now();
        let mut b = bucket(50);
        b.use_tokens(1);
        b.confirm_date(1, now, now);
        b.use_tokens(1);
        let earlier = now - TimeDelta::seconds(1);
        assert_eq!(b.confirm_date(1, earlier, now), Confirmation::Refunded);
        assert_eq!(b.pending(), 0);
        assert_eq!(b.remaining(), 50);
        assert_eq!(b.date(), Some(now));
    }

    #[test]
    fn confirm_date_later_window_resets_expiry() {
        let now = Utc::now();
        let mut b = bucket(50);
        b.use_tokens(1);
        b.confirm_date(1, now, now);
        b.use_tokens(2);
        let later = now + TimeDelta::seconds(1);
        assert_eq!(b.confirm_date(1, later, later), Confirmation::Advanced);
        assert_eq!(b.pending(), 1);
        assert_eq!(b.remaining(), 49);
        assert_eq!(b.expiry(), Some(later + TimeDelta::seconds(1)));
    }

    #[test]
    fn confirm_header_adopts_server_values() {
        let now = Utc::now();
        let mut b = bucket(1);
        b.reset_from(now);
        b.use_tokens(1);
        let result = b.confirm_header(1, &header(5, 4, 5_000), now);
        assert_eq!(result, Confirmation::Advanced);
        assert_eq!(b.limit(), 5);
        assert_eq!(b.remaining(), 4);
        assert_eq!(b.pending(), 0);
        assert_eq!(b.expiry(), Some(now + TimeDelta::seconds(5)));
    }

    #[test]
    fn confirm_header_same_reset_is_noop() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.confirm_header(0, &header(5, 4, 1_000), now);
        b.use_tokens(1);
        assert_eq!(
            b.confirm_header(1, &header(5, 2, 1_000), now),
            Confirmation::Unchanged
        );
        assert_eq!(b.remaining(), 3);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn confirm_header_earlier_reset_refunds() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.confirm_header(0, &header(5, 4, 2_000), now);
        b.use_tokens(1);
        assert_eq!(
            b.confirm_header(1, &header(5, 0, 500), now),
            Confirmation::Refunded
        );
        assert_eq!(b.remaining(), 4);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn first_header_replaces_guessed_window() {
        let now = Utc::now();
        let mut b = bucket(1);
        b.reset_from(now);
        b.use_tokens(1);
        let result = b.confirm_header(1, &header(5, 4, 500), now);
        assert_eq!(result, Confirmation::Advanced);
        assert_eq!(b.limit(), 5);
        assert_eq!(b.remaining(), 4);
        assert_eq!(b.expiry(), Some(now + TimeDelta::milliseconds(500)));
    }

    #[test]
    fn client_reset_lets_next_header_advance() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.confirm_header(0, &header(5, 4, 500), now);
        let later = now + TimeDelta::milliseconds(600);
        b.reset_from(later);
        b.use_tokens(1);
        assert_eq!(
            b.confirm_header(1, &header(5, 3, 400), later),
            Confirmation::Advanced
        );
        assert_eq!(b.remaining(), 3);
        assert_eq!(b.expiry(), Some(later + TimeDelta::milliseconds(400)));
    }

    #[test]
    fn refunded_header_still_updates_limit() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.confirm_header(0, &header(5, 4, 2_000), now);
        b.use_tokens(1);
        assert_eq!(
            b.confirm_header(1, &header(3, 0, 500), now),
            Confirmation::Refunded
        );
        assert_eq!(b.limit(), 3);
        assert_eq!(b.remaining(), 3);
    }

    #[test]
    fn zero_limit_header_is_not_adopted() {
        let now = Utc::now();
        let mut b = bucket(2);
        b.use_tokens(1);
        b.confirm_header(1, &header(0, 0, 1_000), now);
        assert_eq!(b.limit(), 2);
        b.reset_from(now + TimeDelta::seconds(2));
        assert_eq!(b.remaining(), 2);
        assert!(!b.is_empty());
    }

    #[test]
    fn refund_never_exceeds_limit() {
        let mut b = bucket(2);
        b.use_tokens(1);
        b.refund(3);
        assert_eq!(b.remaining(), 2);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn recycle_zeroes_everything() {
        let now = Utc::now();
        let mut b = bucket(5);
        b.use_tokens(2);
        b.confirm_date(1, now, now);
        b.recycle();
        assert_eq!(b, Bucket::default());
    }

    #[test]
    fn scope_parses_case_insensitively() {
        assert_eq!(Scope::parse("Shared"), Some(Scope::Shared));
        assert_eq!(Scope::parse("global"), Some(Scope::Global));
        assert_eq!(Scope::parse("user"), Some(Scope::User));
        assert_eq!(Scope::parse("bogus"), None);
    }

    #[test]
    fn template_deserializes_with_defaults() {
        let t: BucketTemplate = serde_json::from_value(serde_json::json!({ "limit": 5 })).unwrap();
        assert_eq!(t.limit, 5);
        assert_eq!(t.window(), DEFAULT_WINDOW);
    }
}
