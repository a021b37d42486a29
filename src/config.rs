//! Configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Only the store settings are used by the
//! library; the rest drive the demo binary.

use std::time::Duration;

use crate::domain::Latency;
use crate::error::CacheError;
use crate::store::StoreKind;

/// Top-level configuration.
///
/// Loaded once at startup via [`CacheConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Which store strategy to build.
    pub store_kind: StoreKind,

    /// Cache size hint; also the command queue depth of the command loop
    /// store.
    pub capacity: usize,

    /// Latency of simulated connections.
    pub latency: Latency,

    /// First address requested by the demo.
    pub first_address: i32,

    /// Last address requested by the demo (inclusive).
    pub last_address: i32,

    /// Delay between two remote pushes in the demo feed.
    pub remote_feed_interval: Duration,

    /// How long the demo keeps the store alive after the last request.
    pub linger: Duration,

    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_kind: StoreKind::CommandLoop,
            capacity: 1024,
            latency: Latency::default(),
            first_address: 100,
            last_address: 200,
            remote_feed_interval: Duration::from_millis(10),
            linger: Duration::from_secs(10),
            log_json: false,
        }
    }
}

impl CacheConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to the [`Default`] values when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if `STORE_KIND` is set to an
    /// unknown strategy.
    pub fn from_env() -> Result<Self, CacheError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Numeric values that fail to parse fall back to their default.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if `STORE_KIND` is set to an
    /// unknown strategy.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CacheError> {
        let defaults = Self::default();

        let store_kind = match lookup("STORE_KIND") {
            Some(raw) => raw.parse()?,
            None => defaults.store_kind,
        };

        let capacity = parse_or(&lookup, "STORE_CAPACITY", defaults.capacity);
        let open_ms = parse_or(
            &lookup,
            "CONNECTION_OPEN_LATENCY_MS",
            duration_ms(defaults.latency.open),
        );
        let close_ms = parse_or(
            &lookup,
            "CONNECTION_CLOSE_LATENCY_MS",
            duration_ms(defaults.latency.close),
        );
        let first_address = parse_or(&lookup, "DEMO_FIRST_ADDRESS", defaults.first_address);
        let last_address = parse_or(&lookup, "DEMO_LAST_ADDRESS", defaults.last_address);
        let feed_ms = parse_or(
            &lookup,
            "REMOTE_FEED_INTERVAL_MS",
            duration_ms(defaults.remote_feed_interval),
        );
        let linger_secs = parse_or(&lookup, "DEMO_LINGER_SECS", defaults.linger.as_secs());
        let log_json = lookup("LOG_FORMAT").map_or(defaults.log_json, |format| {
            format.trim().eq_ignore_ascii_case("json")
        });

        Ok(Self {
            store_kind,
            capacity,
            latency: Latency::new(
                Duration::from_millis(open_ms),
                Duration::from_millis(close_ms),
            ),
            first_address,
            last_address,
            remote_feed_interval: Duration::from_millis(feed_ms),
            linger: Duration::from_secs(linger_secs),
            log_json,
        })
    }
}

/// Parses `key` as `T`, returning `default` on missing or invalid values.
fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
