//! Rate-limited REST request dispatch.
//!
//! Every request runs through [`RateLimit::admit`] for its route key and the
//! global key, performs the HTTP round-trip outside every lock, then feeds
//! the response headers back into the store in a fresh transaction.

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    bytes::Bytes,
    chrono::Utc,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, de::DeserializeOwned},
    tracing::{debug, instrument, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use {
    ferrule_config::ClientConfig,
    ferrule_ratelimit::{RateLimit, RequestKey, Scope, after},
};

use crate::{
    error::{Error, Result},
    headers,
};

/// Wait applied to a 429 that names no retry interval at all.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// A completed HTTP exchange with a 2xx status.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// JSON error body returned with non-2xx statuses.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: String,
    code: Option<u64>,
    /// Seconds, fractional.
    retry_after: Option<f64>,
    global: bool,
}

impl ErrorBody {
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Sends REST requests on behalf of one client.
pub struct Dispatcher {
    http: reqwest::Client,
    api_url: String,
    authorization: Secret<String>,
    limiter: Arc<RateLimit>,
    max_retries: u32,
    retry_shared: bool,
    exempt_routes: HashSet<String>,
}

impl Dispatcher {
    /// Build a dispatcher with its own rate-limit store.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimit::new(config.rate_limit_options()));
        Self::with_rate_limit(config, limiter)
    }

    /// Build a dispatcher over an existing store, e.g. one shared with a
    /// gateway session.
    pub fn with_rate_limit(config: &ClientConfig, limiter: Arc<RateLimit>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.rest.timeout())
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url(),
            authorization: Secret::new(config.authorization()),
            limiter,
            max_retries: config.rest.max_retries,
            retry_shared: config.rest.retry_shared,
            exempt_routes: config.rest.exempt_routes.iter().cloned().collect(),
        })
    }

    pub fn rate_limit(&self) -> &Arc<RateLimit> {
        &self.limiter
    }

    /// Perform `method endpoint` under the rate limits of
    /// `route`/`resource`, retrying 429s and 502s up to the configured
    /// bound.
    ///
    /// `endpoint` is relative to the versioned API base and starts with `/`.
    #[instrument(skip(self, method, content_type, body), fields(method = %method))]
    pub async fn send(
        &self,
        route: &str,
        resource: &str,
        method: Method,
        endpoint: &str,
        content_type: Option<&str>,
        body: Option<Bytes>,
    ) -> Result<RestResponse> {
        let global = RequestKey::global();
        let key = RequestKey::new(route, resource);
        let exempt = self.exempt_routes.contains(route);
        let url = format!("{}{}", self.api_url, endpoint);
        let mut retries = 0u32;

        loop {
            if !exempt {
                self.limiter.admit(&global, &key).await;
            }

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(
                    header::AUTHORIZATION,
                    HeaderValue::from_str(self.authorization.expose_secret())?,
                );
            if let Some(content_type) = content_type {
                request = request.header(header::CONTENT_TYPE, HeaderValue::from_str(content_type)?);
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    if !exempt {
                        self.refund(&global, &key);
                    }
                    return Err(Error::Transport {
                        route: route.to_string(),
                        resource: resource.to_string(),
                        source,
                    });
                },
            };
            let status = response.status();
            let response_headers = response.headers().clone();
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(source) => {
                    if !exempt {
                        self.limiter.settle(&[&global, &key], 1);
                    }
                    return Err(Error::Transport {
                        route: route.to_string(),
                        resource: resource.to_string(),
                        source,
                    });
                },
            };

            #[cfg(feature = "metrics")]
            counter!("rest_requests_total", "status" => status.as_u16().to_string()).increment(1);

            if status.is_success() {
                if !exempt {
                    self.reconcile(&global, &key, &response_headers);
                }
                return Ok(RestResponse {
                    status,
                    headers: response_headers,
                    body: bytes,
                });
            }

            let error = ErrorBody::parse(&bytes);
            let can_retry = retries < self.max_retries;

            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    if headers::scope(&response_headers) == Some(Scope::Shared) {
                        if !exempt {
                            self.limiter.settle(&[&global, &key], 1);
                        }
                        if self.retry_shared && can_retry {
                            retries += 1;
                            debug!(route, resource, retries, "shared rate limit hit, retrying");
                            #[cfg(feature = "metrics")]
                            counter!("rest_retries_total", "reason" => "shared").increment(1);
                            continue;
                        }
                    } else {
                        let wait = error
                            .retry_after()
                            .or_else(|| headers::retry_after(&response_headers))
                            .unwrap_or(FALLBACK_RETRY_AFTER);
                        let is_global = error.global || headers::is_global(&response_headers);
                        warn!(
                            route,
                            resource,
                            global = is_global,
                            retry_after_ms = wait.as_millis() as u64,
                            "rate limited"
                        );
                        if !exempt {
                            self.exhaust(&global, &key, &response_headers, is_global, wait);
                        }
                        if can_retry {
                            retries += 1;
                            #[cfg(feature = "metrics")]
                            counter!("rest_retries_total", "reason" => "rate_limited").increment(1);
                            if exempt {
                                tokio::time::sleep(wait).await;
                            }
                            continue;
                        }
                    }
                },
                StatusCode::BAD_GATEWAY => {
                    if !exempt {
                        self.refund(&global, &key);
                    }
                    if can_retry {
                        retries += 1;
                        debug!(route, resource, retries, "bad gateway, retrying");
                        #[cfg(feature = "metrics")]
                        counter!("rest_retries_total", "reason" => "bad_gateway").increment(1);
                        continue;
                    }
                },
                _ if status.is_server_error() => {
                    if !exempt {
                        self.refund(&global, &key);
                    }
                },
                _ => {
                    if !exempt {
                        self.reconcile(&global, &key, &response_headers);
                    }
                },
            }

            return Err(Error::Request {
                status,
                route: route.to_string(),
                resource: resource.to_string(),
                message: if error.message.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    error.message
                },
                code: error.code,
                correlation: headers::correlation(&response_headers),
            });
        }
    }

    /// Fold a response's headers back into the global and route buckets.
    fn reconcile(&self, global: &RequestKey, key: &RequestKey, response: &HeaderMap) {
        let now = Utc::now();
        let mut tx = self.limiter.start_tx();

        if let Some(bucket) = tx.get_bucket(global) {
            match headers::date(response) {
                Some(date) => {
                    bucket.confirm_date(1, date, now);
                },
                None => bucket.settle(1),
            }
        }

        let Some(header) = headers::rate_limit(response) else {
            if let Some(bucket) = tx.get_bucket(key) {
                bucket.settle(1);
            }
            debug!(key = %key, "no bucket header, route marked unlimited");
            tx.mark_unlimited(key);
            return;
        };
        if tx.bucket_id(key) != Some(header.bucket.as_str()) {
            tx.rehome(key, &header.bucket, 1);
        }
        if let Some(bucket) = tx.get_bucket(key) {
            let outcome = bucket.confirm_header(1, &header, now);
            debug!(
                key = %key,
                bucket = %header.bucket,
                remaining = bucket.remaining(),
                ?outcome,
                "route bucket confirmed"
            );
        }
    }

    /// Mark the bucket a 429 names empty for `wait`.
    fn exhaust(
        &self,
        global: &RequestKey,
        key: &RequestKey,
        response: &HeaderMap,
        is_global: bool,
        wait: Duration,
    ) {
        let until = after(Utc::now(), wait);
        let mut tx = self.limiter.start_tx();
        if let Some(bucket) = tx.get_bucket(global) {
            bucket.settle(1);
        }
        if let Some(header) = headers::rate_limit(response)
            && tx.bucket_id(key) != Some(header.bucket.as_str())
        {
            tx.rehome(key, &header.bucket, 1);
        }
        if let Some(bucket) = tx.get_bucket(key) {
            bucket.settle(1);
        }
        let target = if is_global {
            global
        } else {
            key
        };
        if let Some(bucket) = tx.get_bucket(target) {
            bucket.exhaust_until(until);
        }
    }

    /// Return the token of a request the server never counted.
    fn refund(&self, global: &RequestKey, key: &RequestKey) {
        let mut tx = self.limiter.start_tx();
        for k in [global, key] {
            if let Some(bucket) = tx.get_bucket(k) {
                bucket.refund(1);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn error_body_parses_rate_limit_fields() {
        let body = ErrorBody::parse(
            br#"{"message":"You are being rate limited.","retry_after":0.5,"global":true}"#,
        );
        assert_eq!(body.message, "You are being rate limited.");
        assert_eq!(body.retry_after(), Some(Duration::from_millis(500)));
        assert!(body.global);
    }

    #[test]
    fn error_body_tolerates_garbage() {
        let body = ErrorBody::parse(b"<html>bad gateway</html>");
        assert!(body.message.is_empty());
        assert!(body.retry_after().is_none());
        assert!(!body.global);
    }

    #[test]
    fn error_body_rejects_negative_retry_after() {
        let body = ErrorBody::parse(br#"{"retry_after":-1}"#);
        assert!(body.retry_after().is_none());
    }

    #[test]
    fn response_json_helper() {
        let response = RestResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"id":"1"}"#),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], "1");
    }
}
