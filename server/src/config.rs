//! Server Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Maximum participants per voice channel (default: 25)
    pub max_channel_users: usize,

    /// Interval between protocol-level heartbeats (default: 30s)
    pub heartbeat_interval: Duration,

    /// Idle cutoff; three missed heartbeats (default: 90s)
    pub heartbeat_timeout: Duration,

    /// Outbound envelope queue depth per peer before the connection is
    /// closed as a slow consumer (default: 64)
    pub outbound_buffer: usize,

    /// Malformed envelopes tolerated per minute before the connection is
    /// closed for protocol abuse (default: 10)
    pub malformed_per_minute: u32,

    /// Window in which a reconnecting peer may reclaim its peer ID
    /// (default: 10s)
    pub reconnect_grace: Duration,

    /// STUN servers handed to clients (comma-separated)
    pub stun_servers: Vec<String>,

    /// TURN host for ephemeral credentials (optional)
    pub turn_host: Option<String>,

    /// Shared secret for TURN REST credentials (optional)
    pub turn_secret: Option<String>,

    /// Lifetime of minted TURN credentials in seconds (default: 3600)
    pub turn_ttl_secs: i64,

    /// Static bearer tokens ("token:user_id" pairs, comma-separated).
    /// Development fallback when no external validator is wired in.
    pub static_tokens: Vec<(String, String)>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let stun_servers = env::var("STUN_SERVERS")
            .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let static_tokens = env::var("STATIC_TOKENS")
            .ok()
            .map(|raw| parse_token_pairs(&raw))
            .transpose()
            .context("STATIC_TOKENS must be 'token:user_id' pairs")?
            .unwrap_or_default();

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            max_channel_users: parse_env("MAX_CHANNEL_USERS", 25),
            heartbeat_interval: Duration::from_secs(parse_env("HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_timeout: Duration::from_secs(parse_env("HEARTBEAT_TIMEOUT_SECS", 90)),
            outbound_buffer: parse_env("OUTBOUND_BUFFER", 64),
            malformed_per_minute: parse_env("MALFORMED_PER_MINUTE", 10),
            reconnect_grace: Duration::from_secs(parse_env("RECONNECT_GRACE_SECS", 10)),
            stun_servers,
            turn_host: env::var("TURN_HOST").ok(),
            turn_secret: env::var("TURN_SECRET").ok(),
            turn_ttl_secs: parse_env("TURN_TTL_SECS", 3600),
            static_tokens,
        })
    }

    /// Check if TURN credential minting is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_host.is_some() && self.turn_secret.is_some()
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            max_channel_users: 25,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            outbound_buffer: 64,
            malformed_per_minute: 10,
            reconnect_grace: Duration::from_secs(10),
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            turn_host: None,
            turn_secret: None,
            turn_ttl_secs: 3600,
            static_tokens: Vec::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_token_pairs(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(token, user)| (token.to_string(), user.to_string()))
                .context("missing ':' separator")
        })
        .collect()
}
