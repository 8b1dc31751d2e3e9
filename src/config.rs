//! Server configuration: CLI flags + environment variables.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;

/// Default grace period, in milliseconds, a subdomain stays reserved after
/// its last tunnel socket drops.
const DEFAULT_GRACE_PERIOD_MS: u64 = 30_000;
/// Default upper clamp for the grace period.
const DEFAULT_MAX_GRACE_PERIOD_MS: u64 = 300_000;
/// Minimum length for a configured HMAC secret.
const MIN_HMAC_SECRET_LEN: usize = 32;

/// Parse `LT_GRACE_PERIOD`, falling back to the default on anything that
/// isn't a non-negative integer instead of failing startup. A tunnel server
/// should never refuse to boot over a malformed reservation-window knob.
fn parse_grace_period_ms(s: &str) -> Result<u64, std::convert::Infallible> {
    Ok(s.parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_GRACE_PERIOD_MS))
}

/// Reverse-tunnel rendezvous server.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Public plane bind port.
    #[arg(long, env = "LT_PORT", default_value_t = 80)]
    pub port: u16,

    /// Public plane bind address.
    #[arg(long, env = "LT_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Use https:// in generated tunnel URLs.
    #[arg(long, env = "LT_SECURE", default_value_t = false)]
    pub secure: bool,

    /// Base domain used to derive subdomains from the Host header.
    #[arg(long, env = "LT_DOMAIN")]
    pub domain: Option<String>,

    /// Per-tunnel maximum concurrent TCP sockets.
    #[arg(long = "max-sockets", env = "LT_MAX_SOCKETS", default_value_t = 10)]
    pub max_sockets: u32,

    /// If set, the admin plane listens on a separate port.
    #[arg(long = "admin-port", env = "LT_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Admin plane bind address.
    #[arg(long, env = "LT_ADMIN_ADDRESS", default_value = "0.0.0.0")]
    pub admin_address: String,

    /// Start of the per-tunnel port allocation range (inclusive).
    #[arg(long, env = "LT_PORT_RANGE_START")]
    pub port_range_start: Option<u16>,

    /// End of the per-tunnel port allocation range (inclusive).
    #[arg(long, env = "LT_PORT_RANGE_END")]
    pub port_range_end: Option<u16>,

    /// Redirect target for `GET /` on the admin plane.
    #[arg(
        long,
        env = "LT_LANDING",
        default_value = "https://localtunnel.github.io/www/"
    )]
    pub landing: String,

    /// Port embedded in generated tunnel URLs when scheme is http.
    #[arg(long, env = "LT_HTTP_PROXY_PORT")]
    pub http_proxy_port: Option<u16>,

    /// Port embedded in generated tunnel URLs when scheme is https.
    #[arg(long, env = "LT_HTTPS_PROXY_PORT")]
    pub https_proxy_port: Option<u16>,

    /// `Retry-After` seconds sent with 503 responses.
    #[arg(long, env = "LT_RETRY_AFTER", default_value_t = 5)]
    pub retry_after: u64,

    /// Subdomain reservation window, in milliseconds. Negative or
    /// non-numeric input falls back to the default rather than failing
    /// startup (see `parse_grace_period_ms`).
    #[arg(
        long,
        env = "LT_GRACE_PERIOD",
        default_value_t = DEFAULT_GRACE_PERIOD_MS,
        value_parser = parse_grace_period_ms
    )]
    pub grace_period_ms: u64,

    /// Upper clamp for the grace period, in milliseconds.
    #[arg(long, env = "LT_MAX_GRACE_PERIOD", default_value_t = DEFAULT_MAX_GRACE_PERIOD_MS)]
    pub max_grace_period_ms: u64,

    /// Reject reconnects from a different identifier during grace (409)
    /// instead of silently minting a random id.
    #[arg(long, env = "LT_IP_VALIDATION_STRICT", default_value_t = false)]
    pub ip_validation_strict: bool,

    /// Honor `X-Forwarded-For` / `X-Real-IP` for client source IP.
    #[arg(long, env = "LT_TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,

    /// Per-request proxy timeout, in milliseconds.
    #[arg(long, env = "LT_REQUEST_TIMEOUT", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// WebSocket upgrade wait + proxy timeout, in milliseconds.
    #[arg(long, env = "LT_WEBSOCKET_TIMEOUT", default_value_t = 10_000)]
    pub websocket_timeout_ms: u64,

    /// Poll interval while waiting for an available socket on upgrade, in milliseconds.
    #[arg(long, env = "LT_SOCKET_CHECK_INTERVAL", default_value_t = 100)]
    pub socket_check_interval_ms: u64,

    /// HMAC shared secret (enables admin HMAC auth when set).
    #[arg(long, env = "LT_HMAC_SECRET")]
    pub hmac_secret: Option<String>,

    /// Path to a file whose first line is the HMAC shared secret.
    #[arg(long, env = "FILE_LT_HMAC_SECRET")]
    pub hmac_secret_file: Option<String>,

    /// Allowed clock-skew window for HMAC timestamp validation, in seconds.
    #[arg(long, env = "LT_HMAC_TIMESTAMP_TOLERANCE", default_value_t = 60)]
    pub hmac_timestamp_tolerance_secs: u64,

    /// Maximum nonce age accepted, in seconds.
    #[arg(long, env = "LT_HMAC_NONCE_THRESHOLD", default_value_t = 3_600)]
    pub hmac_nonce_threshold_secs: u64,

    /// Replay cache retention, in seconds.
    #[arg(long, env = "LT_HMAC_NONCE_CACHE_TTL", default_value_t = 7_200)]
    pub hmac_nonce_cache_ttl_secs: u64,

    /// Nonce cache sweep interval, in milliseconds.
    #[arg(long, env = "LT_NONCE_CLEANUP_INTERVAL", default_value_t = 60_000)]
    pub nonce_cleanup_interval_ms: u64,

    /// `tracing` EnvFilter directive.
    #[arg(long, env = "LT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit structured JSON logs instead of plain text.
    #[arg(long, env = "LT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Grace period in effect, mutable so tests can shrink it without
    /// re-parsing argv. Initialized from `grace_period_ms` in `validate`.
    #[arg(skip)]
    pub effective_grace_period_ms: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LT_HMAC_SECRET must be at least {min} characters (got {actual})")]
    HmacSecretTooShort { min: usize, actual: usize },
    #[error("failed to read HMAC secret file {path}: {source}")]
    HmacSecretFileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("LT_PORT_RANGE_START must be <= LT_PORT_RANGE_END")]
    InvalidPortRange,
    #[error("LT_HMAC_NONCE_CACHE_TTL must be >= LT_HMAC_NONCE_THRESHOLD")]
    NonceCacheTtlTooSmall,
}

impl Config {
    /// Validate cross-field invariants and resolve the HMAC secret.
    /// Returns the resolved secret (`None` means HMAC auth is disabled).
    pub fn validate(&self) -> Result<Option<String>, ConfigError> {
        if let (Some(start), Some(end)) = (self.port_range_start, self.port_range_end) {
            if start > end {
                return Err(ConfigError::InvalidPortRange);
            }
        }

        if self.hmac_nonce_cache_ttl_secs < self.hmac_nonce_threshold_secs {
            return Err(ConfigError::NonceCacheTtlTooSmall);
        }

        let secret = self.resolve_hmac_secret()?;
        if let Some(ref s) = secret {
            if s.len() < MIN_HMAC_SECRET_LEN {
                return Err(ConfigError::HmacSecretTooShort {
                    min: MIN_HMAC_SECRET_LEN,
                    actual: s.len(),
                });
            }
        }

        self.effective_grace_period_ms
            .store(self.clamp_grace_period(self.grace_period_ms), Ordering::Relaxed);

        Ok(secret)
    }

    fn resolve_hmac_secret(&self) -> Result<Option<String>, ConfigError> {
        if let Some(ref secret) = self.hmac_secret {
            return Ok(Some(secret.clone()));
        }
        if let Some(ref path) = self.hmac_secret_file {
            let content = fs::read_to_string(Path::new(path)).map_err(|e| {
                ConfigError::HmacSecretFileUnreadable {
                    path: path.clone(),
                    source: e,
                }
            })?;
            let first_line = content.lines().next().unwrap_or("").trim().to_string();
            return Ok(Some(first_line));
        }
        Ok(None)
    }

    /// Clamp a requested grace period to `[0, max_grace_period_ms]`, falling
    /// back to the default if the configured maximum itself is nonsensical.
    fn clamp_grace_period(&self, requested_ms: u64) -> u64 {
        let max = if self.max_grace_period_ms == 0 {
            DEFAULT_MAX_GRACE_PERIOD_MS
        } else {
            self.max_grace_period_ms
        };
        requested_ms.min(max)
    }

    /// Current grace period in milliseconds, read lazily so tests can mutate
    /// it at runtime (see `set_grace_period_ms_for_test`).
    pub fn grace_period_ms(&self) -> u64 {
        self.effective_grace_period_ms.load(Ordering::Relaxed)
    }

    /// Test-only hook to change the grace period without re-parsing argv.
    #[cfg(test)]
    pub fn set_grace_period_ms_for_test(&self, ms: u64) {
        self.effective_grace_period_ms
            .store(self.clamp_grace_period(ms), Ordering::Relaxed);
    }

    /// Effective admin bind port: the dedicated admin port if configured,
    /// otherwise the public plane port (single-port deployment).
    pub fn effective_admin_port(&self) -> u16 {
        self.admin_port.unwrap_or(self.port)
    }

    /// Whether the admin plane runs on a socket distinct from the public plane.
    pub fn admin_is_separate(&self) -> bool {
        self.admin_port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["lt-server"])
    }

    #[test]
    fn grace_period_clamps_to_max() {
        let config = base_config();
        config.set_grace_period_ms_for_test(10_000_000);
        assert_eq!(config.grace_period_ms(), DEFAULT_MAX_GRACE_PERIOD_MS);
    }

    #[test]
    fn validate_rejects_short_hmac_secret() {
        let mut config = base_config();
        config.hmac_secret = Some("too-short".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HmacSecretTooShort { .. })
        ));
    }

    #[test]
    fn validate_accepts_long_hmac_secret() {
        let mut config = base_config();
        config.hmac_secret = Some("a".repeat(32));
        assert!(config.validate().unwrap().is_some());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut config = base_config();
        config.port_range_start = Some(9000);
        config.port_range_end = Some(8000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange)
        ));
    }

    #[test]
    fn grace_period_env_falls_back_to_default_on_negative() {
        assert_eq!(parse_grace_period_ms("-5"), Ok(DEFAULT_GRACE_PERIOD_MS));
    }

    #[test]
    fn grace_period_env_falls_back_to_default_on_garbage() {
        assert_eq!(parse_grace_period_ms("not-a-number"), Ok(DEFAULT_GRACE_PERIOD_MS));
    }

    #[test]
    fn grace_period_env_accepts_valid_value() {
        assert_eq!(parse_grace_period_ms("15000"), Ok(15_000));
    }

    #[test]
    fn validate_sets_effective_grace_period() {
        let mut config = base_config();
        config.grace_period_ms = 15_000;
        config.validate().unwrap();
        assert_eq!(config.grace_period_ms(), 15_000);
    }
}
