//! Rate-limit store and the admission loop.
//!
//! Two locks guard the store:
//! - the admission lock (async) serializes the "may I send now?" decision;
//! - the table lock (sync, never held across `.await`) guards the
//!   `ids`/`buckets`/`entries` maps and is exposed as [`BucketTx`].
//!
//! The I/O itself runs outside both locks.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard},
};

use {
    chrono::{DateTime, Utc},
    tokio::sync::Mutex as AsyncMutex,
    tracing::{debug, trace},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    bucket::{Bucket, BucketTemplate},
    pool::Pool,
};

/// Route ID of the global scope.
pub const GLOBAL_ROUTE_ID: &str = "0";

/// Bucket ID of the global bucket.
pub const GLOBAL_BUCKET_ID: &str = "global";

/// Bucket ID marking a key that is not rate limited at all.
pub const NIL_BUCKET_ID: &str = "NIL";

/// Prefix of client-assigned bucket IDs (server IDs are hex digests).
const SYNTHETIC_PREFIX: char = '~';

// ── Keys ─────────────────────────────────────────────────────────────

/// Composite key of a Route ID and a Resource ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    route: String,
    resource: String,
}

impl RequestKey {
    pub fn new(route: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            resource: resource.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(GLOBAL_ROUTE_ID, "")
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn synthetic_id(&self) -> String {
        format!("{SYNTHETIC_PREFIX}{}:{}", self.route, self.resource)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resource.is_empty() {
            f.write_str(&self.route)
        } else {
            write!(f, "{}/{}", self.route, self.resource)
        }
    }
}

// ── Options ──────────────────────────────────────────────────────────

/// Construction parameters for [`RateLimit`].
#[derive(Debug, Clone, Default)]
pub struct RateLimitOptions {
    /// Shape of the global bucket; `None` disables global accounting.
    pub global: Option<BucketTemplate>,
    /// Template used the first time any key is seen.
    pub default_bucket: Option<BucketTemplate>,
    /// Per-route templates that override `default_bucket`.
    pub route_defaults: HashMap<String, BucketTemplate>,
    /// Idle buckets kept for reuse.
    pub pool_capacity: usize,
}

// ── Tables ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    ids: HashMap<RequestKey, String>,
    buckets: HashMap<String, Box<Bucket>>,
    entries: HashMap<String, usize>,
}

/// Rate-limit state for one client, shared by every REST call and every
/// gateway command send made with it.
pub struct RateLimit {
    admission: AsyncMutex<()>,
    tables: Mutex<Tables>,
    pool: Pool<Bucket>,
    default_bucket: Option<BucketTemplate>,
    route_defaults: HashMap<String, BucketTemplate>,
}

/// Outcome of one pass over the buckets during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was taken from every applicable bucket.
    Admitted,
    /// The named bucket is empty until `until`.
    Wait {
        scope: WaitScope,
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitScope {
    Global,
    Route,
}

impl WaitScope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Route => "route",
        }
    }
}

impl RateLimit {
    pub fn new(options: RateLimitOptions) -> Self {
        let capacity = if options.pool_capacity == 0 {
            64
        } else {
            options.pool_capacity
        };
        let limiter = Self {
            admission: AsyncMutex::new(()),
            tables: Mutex::new(Tables::default()),
            pool: Pool::new(capacity),
            default_bucket: options.default_bucket,
            route_defaults: options.route_defaults,
        };
        if let Some(global) = options.global {
            limiter
                .start_tx()
                .insert_bucket(&RequestKey::global(), GLOBAL_BUCKET_ID, &global);
        }
        limiter
    }

    /// Acquire the admission lock. Held only while deciding, never during I/O.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    /// Start a table transaction. Dropping the guard ends it.
    pub fn start_tx(&self) -> BucketTx<'_> {
        BucketTx {
            tables: self.tables.lock().unwrap_or_else(|e| e.into_inner()),
            limiter: self,
        }
    }

    /// Wait until one token can be taken from both the `global` bucket and
    /// the bucket behind `route`, then take it.
    ///
    /// Keys without a bucket (unknown with no default template, or marked
    /// unlimited) are skipped.
    pub async fn admit(&self, global: &RequestKey, route: &RequestKey) {
        loop {
            let admission = self.lock().await;
            let decision = self.start_tx().try_consume(global, route, Utc::now());
            drop(admission);

            match decision {
                Decision::Admitted => return,
                Decision::Wait { scope, until } => {
                    debug!(
                        key = %route,
                        scope = scope.as_str(),
                        until = %until,
                        "rate limit: waiting for bucket to refill"
                    );
                    #[cfg(feature = "metrics")]
                    counter!("ratelimit_waits_total", "scope" => scope.as_str()).increment(1);
                    sleep_until(until).await;
                },
            }
        }
    }

    /// Confirm `amount` in-flight uses on every given key without touching
    /// their windows. Used for sends that carry no rate-limit headers.
    pub fn settle(&self, keys: &[&RequestKey], amount: i64) {
        let mut tx = self.start_tx();
        for key in keys {
            if let Some(bucket) = tx.get_bucket(key) {
                bucket.settle(amount);
            }
        }
    }

    /// Idle buckets currently held by the pool.
    pub fn pooled(&self) -> usize {
        self.pool.idle()
    }

    fn template_for(&self, key: &RequestKey) -> Option<BucketTemplate> {
        if key.route() == GLOBAL_ROUTE_ID {
            return None;
        }
        self.route_defaults
            .get(key.route())
            .or(self.default_bucket.as_ref())
            .copied()
    }
}

async fn sleep_until(until: DateTime<Utc>) {
    let wait = (until - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(wait).await;
}

// ── Transactions ─────────────────────────────────────────────────────

/// Exclusive access to the bucket tables.
pub struct BucketTx<'a> {
    tables: MutexGuard<'a, Tables>,
    limiter: &'a RateLimit,
}

impl BucketTx<'_> {
    /// ID of the bucket currently backing `key`, if any is assigned.
    pub fn bucket_id(&self, key: &RequestKey) -> Option<&str> {
        self.tables.ids.get(key).map(String::as_str)
    }

    /// Number of keys pointing at bucket `id`.
    pub fn references(&self, id: &str) -> usize {
        self.tables.entries.get(id).copied().unwrap_or(0)
    }

    /// Bucket backing `key`.
    ///
    /// The first lookup of an unknown key allocates a bucket from the
    /// route's default template (or the client default), filed under a
    /// synthetic ID until the server names the real bucket. Keys marked
    /// unlimited, and unknown keys with no template, return `None`.
    pub fn get_bucket(&mut self, key: &RequestKey) -> Option<&mut Bucket> {
        let id = match self.tables.ids.get(key) {
            Some(id) if id == NIL_BUCKET_ID => return None,
            Some(id) => id.clone(),
            None => {
                let template = self.limiter.template_for(key)?;
                let id = key.synthetic_id();
                trace!(key = %key, bucket = %id, "rate limit: allocating default bucket");
                self.insert_bucket(key, &id, &template);
                id
            },
        };
        self.tables.buckets.get_mut(&id).map(Box::as_mut)
    }

    /// Point `key` at a bucket built from `template` under `id`, replacing
    /// whatever bucket was filed under `id` before.
    pub fn insert_bucket(&mut self, key: &RequestKey, id: &str, template: &BucketTemplate) {
        let mut bucket = self.limiter.pool.get();
        bucket.init(id, template);
        if let Some(old) = self.tables.buckets.insert(id.to_string(), bucket) {
            self.limiter.pool.put(old);
        }
        self.set_bucket_id(key, id);
    }

    /// Repoint `key` at bucket `id`.
    ///
    /// The old bucket loses a reference and is recycled when nothing points
    /// at it anymore. When no bucket exists under `id` yet, one is created
    /// from the key's default template.
    pub fn set_bucket_id(&mut self, key: &RequestKey, id: &str) {
        let old = self.tables.ids.insert(key.clone(), id.to_string());
        if old.as_deref() == Some(id) {
            return;
        }
        if let Some(old) = old {
            self.release_reference(&old);
        }
        if id == NIL_BUCKET_ID {
            return;
        }
        *self.tables.entries.entry(id.to_string()).or_default() += 1;
        if !self.tables.buckets.contains_key(id) {
            let template = self.limiter.template_for(key).unwrap_or_default();
            let mut bucket = self.limiter.pool.get();
            bucket.init(id, &template);
            self.tables.buckets.insert(id.to_string(), bucket);
        }
    }

    /// Move `key` onto the server-reported bucket `id`, carrying its
    /// in-flight uses along.
    ///
    /// A bucket only `key` references is renamed in place. Otherwise the
    /// key's `amount` pending uses (or all of them, when the old bucket is
    /// evicted by the move) are transferred to the new bucket.
    pub fn rehome(&mut self, key: &RequestKey, id: &str, amount: i64) {
        let Some(old) = self.tables.ids.get(key).cloned() else {
            self.set_bucket_id(key, id);
            return;
        };
        if old == id {
            return;
        }
        if old == NIL_BUCKET_ID {
            self.set_bucket_id(key, id);
            return;
        }

        let sole_owner = self.references(&old) == 1;
        if sole_owner
            && !self.tables.buckets.contains_key(id)
            && let Some(mut bucket) = self.tables.buckets.remove(&old)
        {
            debug!(key = %key, from = %old, to = %id, "rate limit: renaming bucket");
            bucket.set_id(id);
            self.tables.buckets.insert(id.to_string(), bucket);
            self.tables.entries.remove(&old);
            self.tables.entries.insert(id.to_string(), 1);
            self.tables.ids.insert(key.clone(), id.to_string());
            return;
        }

        let carried = match self.tables.buckets.get_mut(&old) {
            Some(bucket) => {
                let carried = if sole_owner {
                    bucket.pending()
                } else {
                    amount.min(bucket.pending())
                };
                bucket.settle(carried);
                carried
            },
            None => 0,
        };
        debug!(key = %key, from = %old, to = %id, carried, "rate limit: re-homing key");
        self.set_bucket_id(key, id);
        if let Some(bucket) = self.tables.buckets.get_mut(id) {
            bucket.add_pending(carried);
        }
    }

    /// Mark `key` as not rate limited; later lookups bypass accounting.
    pub fn mark_unlimited(&mut self, key: &RequestKey) {
        self.set_bucket_id(key, NIL_BUCKET_ID);
    }

    /// One admission pass: refresh expired buckets and take a token from
    /// both scopes, or report which bucket to wait for.
    pub fn try_consume(
        &mut self,
        global: &RequestKey,
        route: &RequestKey,
        now: DateTime<Utc>,
    ) -> Decision {
        if let Some(bucket) = self.get_bucket(global) {
            if bucket.is_expired(now) {
                bucket.reset_from(now);
            }
            if bucket.is_empty() {
                return Decision::Wait {
                    scope: WaitScope::Global,
                    until: bucket.expiry().unwrap_or(now),
                };
            }
        }

        let same_bucket =
            self.bucket_id(global).is_some() && self.bucket_id(global) == self.bucket_id(route);
        if !same_bucket && let Some(bucket) = self.get_bucket(route) {
            if bucket.is_expired(now) {
                bucket.reset_from(now);
            }
            if bucket.is_empty() {
                return Decision::Wait {
                    scope: WaitScope::Route,
                    until: bucket.expiry().unwrap_or(now),
                };
            }
            bucket.use_tokens(1);
        }

        if let Some(bucket) = self.get_bucket(global) {
            bucket.use_tokens(1);
        }
        Decision::Admitted
    }

    fn release_reference(&mut self, id: &str) {
        let Some(count) = self.tables.entries.get_mut(id) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        self.tables.entries.remove(id);
        if let Some(bucket) = self.tables.buckets.remove(id) {
            trace!(bucket = %id, "rate limit: recycling unreferenced bucket");
            self.limiter.pool.put(bucket);
        }
    }
}
