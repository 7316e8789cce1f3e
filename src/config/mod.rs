//! Manages application configuration loaded from environment variables.
//!
//! Defines the `Config` struct and the `from_env` function that populates it.
//! Supports loading variables from a `.env` file via the `dotenv` crate and
//! falls back to sensible defaults for everything but the database path.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// STARTTLS settings. Both `cert_file` and `key_file` are required when
/// `enabled` is `true`; the server fails fast at startup otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// AUTH PLAIN/LOGIN settings. When `required` is `false` the single
/// configured credential pair is still accepted if offered, but MAIL/RCPT/DATA
/// don't demand it first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub required: bool,
    pub username: String,
    pub password: String,
}

/// Holds the application's runtime configuration settings, loaded via
/// `from_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The IP address the SMTP server should listen on. (Optional: `SMTP_SINK_HOST`, Default: "0.0.0.0")
    pub host: String,

    /// The network port the SMTP server should listen on. (Optional: `SMTP_SINK_PORT`, Default: 2525)
    pub port: u16,

    /// The domain name this server identifies itself as in its greeting and EHLO response. (Optional: `SMTP_SINK_DOMAIN`, Default: "localhost")
    pub domain: String,

    /// Per-read deadline on the client connection. (Optional: `SMTP_SINK_READ_TIMEOUT_SECS`, Default: 300)
    pub read_timeout_seconds: u64,

    /// Per-write deadline on the client connection. (Optional: `SMTP_SINK_WRITE_TIMEOUT_SECS`, Default: 30)
    pub write_timeout_seconds: u64,

    /// Maximum accepted message size in bytes, advertised via EHLO SIZE. (Optional: `SMTP_SINK_MAX_MESSAGE_BYTES`, Default: 10485760)
    pub max_message_bytes: usize,

    /// Maximum RCPT TO recipients accepted per transaction. (Optional: `SMTP_SINK_MAX_RECIPIENTS`, Default: 100)
    pub max_recipients: usize,

    /// STARTTLS settings. (`SMTP_SINK_TLS_*`)
    pub tls: TlsConfig,

    /// AUTH PLAIN/LOGIN settings. (`SMTP_SINK_AUTH_*`)
    pub auth: AuthConfig,

    /// Path to the SQLite database file, or `:memory:`. When unset, an
    /// in-process, non-durable store is used instead. (Optional: `SMTP_SINK_DATABASE_PATH`)
    pub database_path: Option<String>,
}

impl Config {
    /// Loads configuration settings from environment variables prefixed with
    /// `SMTP_SINK_`. Supports loading from a `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a numeric variable is set but cannot be parsed, or
    /// if `SMTP_SINK_TLS_ENABLED=true` without both cert and key files set.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let host = env_or_default("SMTP_SINK_HOST", "0.0.0.0");
        let port = env_parsed_or_default("SMTP_SINK_PORT", 2525u16)?;
        let domain = env_or_default("SMTP_SINK_DOMAIN", "localhost");
        let read_timeout_seconds = env_parsed_or_default("SMTP_SINK_READ_TIMEOUT_SECS", 300u64)?;
        let write_timeout_seconds = env_parsed_or_default("SMTP_SINK_WRITE_TIMEOUT_SECS", 30u64)?;
        let max_message_bytes = env_parsed_or_default("SMTP_SINK_MAX_MESSAGE_BYTES", 10 * 1024 * 1024usize)?;
        let max_recipients = env_parsed_or_default("SMTP_SINK_MAX_RECIPIENTS", 100usize)?;

        let tls_enabled = env_parsed_or_default("SMTP_SINK_TLS_ENABLED", false)?;
        let tls = TlsConfig {
            enabled: tls_enabled,
            cert_file: env::var("SMTP_SINK_TLS_CERT_FILE").ok(),
            key_file: env::var("SMTP_SINK_TLS_KEY_FILE").ok(),
        };
        if tls.enabled && (tls.cert_file.is_none() || tls.key_file.is_none()) {
            return Err(anyhow!(
                "SMTP_SINK_TLS_ENABLED is true but SMTP_SINK_TLS_CERT_FILE and SMTP_SINK_TLS_KEY_FILE must both be set"
            ));
        }

        let auth = AuthConfig {
            required: env_parsed_or_default("SMTP_SINK_AUTH_REQUIRED", false)?,
            username: env_or_default("SMTP_SINK_AUTH_USERNAME", ""),
            password: env_or_default("SMTP_SINK_AUTH_PASSWORD", ""),
        };
        if auth.required && (auth.username.is_empty() || auth.password.is_empty()) {
            return Err(anyhow!(
                "SMTP_SINK_AUTH_REQUIRED is true but SMTP_SINK_AUTH_USERNAME and SMTP_SINK_AUTH_PASSWORD must both be set"
            ));
        }

        let database_path = env::var("SMTP_SINK_DATABASE_PATH").ok();

        let config = Config {
            host,
            port,
            domain,
            read_timeout_seconds,
            write_timeout_seconds,
            max_message_bytes,
            max_recipients,
            tls,
            auth,
            database_path,
        };

        log::info!(
            "Config: listening on {}:{}, domain={}, tls_enabled={}, auth_required={}, database_path={:?}",
            config.host,
            config.port,
            config.domain,
            config.tls.enabled,
            config.auth.required,
            config.database_path
        );

        Ok(config)
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) => val,
        Err(_) => default.to_string(),
    }
}

fn env_parsed_or_default<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow!("{key} ('{val}') is not valid: {e}")),
        Err(_) => Ok(default),
    }
}
