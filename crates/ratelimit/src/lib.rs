//! Token-bucket admission engine.
//!
//! A [`RateLimit`] tracks one global bucket plus any number of route buckets,
//! keyed by a Route ID and a Resource ID. Unknown keys get a conservative
//! default bucket until the server reports the real one. Callers take
//! tokens through [`RateLimit::admit`] and reconcile the tables from
//! responses inside a [`BucketTx`].
//!
//! Feature flags:
//! - `metrics`: wait counters via the `metrics` crate

pub mod bucket;
pub mod pool;
pub mod store;

pub use {
    bucket::{Bucket, BucketTemplate, Confirmation, DEFAULT_WINDOW, RateLimitHeader, Scope, after},
    pool::{Pool, Recycle},
    store::{
        BucketTx, Decision, GLOBAL_BUCKET_ID, GLOBAL_ROUTE_ID, NIL_BUCKET_ID, RateLimit,
        RateLimitOptions, RequestKey, WaitScope,
    },
};
