//! Client configuration.
//!
//! Loaded from TOML (every field optional, see [`ClientConfig::default`]);
//! the bot token may also come from the `FERRULE_TOKEN` environment
//! variable.

pub mod error;

use std::{collections::HashMap, path::Path, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use ferrule_ratelimit::{BucketTemplate, RateLimitOptions};

pub use error::{Error, Result};

/// Environment variable consulted for the bot token.
pub const TOKEN_ENV: &str = "FERRULE_TOKEN";

pub const DEFAULT_API_BASE: &str = "https://discord.com/api";

/// Route ID of the interaction callback endpoint, which is exempt from
/// the global limit.
pub const INTERACTION_CALLBACK_ROUTE: &str = "interaction_callback";

// ── Top level ────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bot token, without the `Bot ` prefix.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// REST base URL, without the version segment.
    pub api_base: String,

    /// API version used for REST paths and the gateway query string.
    pub api_version: u8,

    /// `User-Agent` sent with every REST request.
    pub user_agent: String,

    pub rest: RestConfig,

    pub rate_limit: RateLimitConfig,

    pub gateway: GatewayConfig,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("user_agent", &self.user_agent)
            .field("rest", &self.rest)
            .field("rate_limit", &self.rate_limit)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            api_base: DEFAULT_API_BASE.to_string(),
            api_version: ferrule_protocol::API_VERSION,
            user_agent: format!(
                "DiscordBot (https://github.com/ferrule-rs/ferrule, {})",
                env!("CARGO_PKG_VERSION")
            ),
            rest: RestConfig::default(),
            rate_limit: RateLimitConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)?;
        Ok(cfg)
    }

    /// Read `path`, apply the environment override, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading client config");
        let raw = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_toml_str(&raw)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Take the token from [`TOKEN_ENV`] when it is set and non-empty.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            self.token = Secret::new(token.trim().to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.expose_secret().trim().is_empty() {
            return Err(Error::invalid("bot token is required"));
        }
        if self.rest.global_limit <= 0 {
            return Err(Error::invalid("rest.global_limit must be positive"));
        }
        if self.rate_limit.default_bucket.limit <= 0 {
            return Err(Error::invalid(
                "rate_limit.default_bucket.limit must be positive",
            ));
        }
        if self.gateway.queue_capacity == 0 {
            return Err(Error::invalid("gateway.queue_capacity must be non-zero"));
        }
        Ok(())
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.token.expose_secret())
    }

    /// Versioned REST base, e.g. `https://discord.com/api/v10`.
    pub fn api_url(&self) -> String {
        format!(
            "{}/v{}",
            self.api_base.trim_end_matches('/'),
            self.api_version
        )
    }

    /// Options for the shared rate-limit store.
    pub fn rate_limit_options(&self) -> RateLimitOptions {
        RateLimitOptions {
            global: Some(BucketTemplate::new(self.rest.global_limit, Duration::from_secs(1))),
            default_bucket: Some(self.rate_limit.default_bucket),
            route_defaults: self.rate_limit.route_defaults.clone(),
            pool_capacity: self.rate_limit.pool_capacity,
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

// ── REST ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Retries after a 429 or 502 before the error is returned.
    pub max_retries: u32,

    /// Retry 429s with the `shared` scope.
    pub retry_shared: bool,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Requests per second across every route.
    pub global_limit: i64,

    /// Route IDs that skip rate-limit admission.
    pub exempt_routes: Vec<String>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_shared: true,
            timeout_secs: 30,
            global_limit: 50,
            exempt_routes: vec![INTERACTION_CALLBACK_ROUTE.to_string()],
        }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Rate limits ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket used for a route until the server names its real bucket.
    pub default_bucket: BucketTemplate,

    /// Per-route overrides of `default_bucket`, keyed by Route ID.
    pub route_defaults: HashMap<String, BucketTemplate>,

    /// Idle buckets kept for reuse.
    pub pool_capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_bucket: BucketTemplate::default(),
            route_defaults: HashMap::new(),
            pool_capacity: 64,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway intents bitfield.
    pub intents: u64,

    /// `[shard_id, shard_count]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    /// Members above which a guild is considered large (50–250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,

    /// Pause before re-identifying after an invalid session.
    pub invalid_session_cooldown_ms: u64,

    /// Capacity of the pending-heartbeat queue.
    pub queue_capacity: usize,

    /// How long to wait for `Hello` and each handshake reply.
    pub handshake_timeout_secs: u64,

    /// Identify connection properties.
    pub properties: ferrule_protocol::IdentifyProperties,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            intents: 0,
            shard: None,
            large_threshold: None,
            invalid_session_cooldown_ms: 5_000,
            queue_capacity: 8,
            handshake_timeout_secs: 30,
            properties: ferrule_protocol::IdentifyProperties::default(),
        }
    }
}

impl GatewayConfig {
    pub fn invalid_session_cooldown(&self) -> Duration {
        Duration::from_millis(self.invalid_session_cooldown_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
