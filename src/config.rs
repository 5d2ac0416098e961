// ABOUTME: Typed configuration loaded from environment variables and CLI flags
// ABOUTME: clap-derived CLI layer for overriding listen addresses, matching hdds-router/hdds-discovery-server style

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

const DEFAULT_SMPP_LISTEN: &str = "0.0.0.0:9550";
const DEFAULT_MM4_LISTEN: &str = "0.0.0.0:2566";
const DEFAULT_WEB_LISTEN: &str = "0.0.0.0:3000";

/// Multi-protocol messaging gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "gateway")]
#[command(about = "Multi-protocol SMS/MMS messaging gateway")]
#[command(version)]
pub struct Cli {
    /// Short-message (binary session) listen address.
    #[arg(long, env = "SMPP_LISTEN", default_value = DEFAULT_SMPP_LISTEN)]
    pub smpp_listen: String,

    /// SMTP-framed MMS listen address.
    #[arg(long, env = "MM4_LISTEN", default_value = DEFAULT_MM4_LISTEN)]
    pub mm4_listen: String,

    /// HTTP admin & client surface listen address.
    #[arg(long, env = "SERVER_ADDRESS", default_value = DEFAULT_WEB_LISTEN)]
    pub web_listen: String,

    /// Path to an optional TOML config file layered under env/CLI overrides.
    #[arg(long)]
    pub config_file: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

/// Fully resolved runtime configuration.
/// Unset variables fall back to the component defaults (15s/5s keepalive,
/// 10s ack timeout, 3 retries, 10 MiB transcode input cap, etc).
#[derive(Debug, Clone)]
pub struct Settings {
    pub smpp_listen: SocketAddr,
    pub mm4_listen: SocketAddr,
    pub web_listen: SocketAddr,

    /// 32-byte key used to encrypt client passwords and carrier credentials
    /// at rest. Persistence itself is out of scope; the
    /// key is only carried here for the repository contract to use.
    pub encryption_key: Option<String>,
    /// Bearer token guarding `GET /health`/`GET /stats`.
    pub api_key: Option<String>,

    pub postgres_url: Option<String>,

    pub webhook_retries: u32,
    pub webhook_timeout: Duration,

    pub smpp_retries: u32,
    pub smpp_timeout: Duration,
    /// enquire-link keepalive tick.
    pub smpp_keepalive_interval: Duration,
    /// enquire-link keepalive timeout.
    pub smpp_keepalive_timeout: Duration,
    /// per-segment outstanding-response wait.
    pub smpp_response_timeout: Duration,

    pub mm4_retries: u32,
    pub mm4_timeout: Duration,
    /// idle SMTP session reap interval.
    pub mm4_idle_timeout: Duration,
    pub mm4_originator_system: String,

    pub notify_sender_on_failure: bool,

    pub transcode_temp_path: std::path::PathBuf,

    pub haproxy_proxy_protocol: bool,

    /// ack-gated conversation timeout.
    pub conversation_ack_timeout: Duration,
    /// idle conversation sweep threshold.
    pub conversation_idle_ttl: Duration,

    /// fixed retry backoff unit.
    pub retry_backoff: Duration,
    pub max_retries: u32,

    /// 10 MiB input cap.
    pub transcode_max_input_size: u64,
    /// 600 KiB animated-GIF pass-through limit.
    pub transcode_gif_pass_limit: u64,
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Resolve a `Settings` value from CLI flags layered over environment
    /// variables, falling back to spec-named defaults.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let smpp_listen = cli
            .smpp_listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("SMPP_LISTEN: {e}")))?;
        let mm4_listen = cli
            .mm4_listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("MM4_LISTEN: {e}")))?;
        let web_listen = cli
            .web_listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("SERVER_ADDRESS: {e}")))?;

        Ok(Settings {
            smpp_listen,
            mm4_listen,
            web_listen,
            encryption_key: std::env::var("ENCRYPTION_KEY").ok(),
            api_key: std::env::var("API_KEY").ok(),
            postgres_url: std::env::var("POSTGRES_URL").ok(),
            webhook_retries: env_u32("WEBHOOK_RETRIES", 3),
            webhook_timeout: Duration::from_secs(env_u64("WEBHOOK_TIMEOUT_SECS", 10)),
            smpp_retries: env_u32("SMPP_RETRIES", 3),
            smpp_timeout: Duration::from_secs(env_u64("SMPP_TIMEOUT_SECS", 5)),
            smpp_keepalive_interval: Duration::from_secs(15),
            smpp_keepalive_timeout: Duration::from_secs(5),
            smpp_response_timeout: Duration::from_secs(5),
            mm4_retries: env_u32("MM4_RETRIES", 3),
            mm4_timeout: Duration::from_secs(env_u64("MM4_TIMEOUT_SECS", 10)),
            mm4_idle_timeout: Duration::from_secs(120),
            mm4_originator_system: std::env::var("MM4_ORIGINATOR_SYSTEM")
                .unwrap_or_else(|_| "gateway".to_string()),
            notify_sender_on_failure: env_bool("NOTIFY_SENDER_ON_FAILURE", true),
            transcode_temp_path: std::env::var("TRANSCODE_TEMP_PATH")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            haproxy_proxy_protocol: env_bool("HAPROXY_PROXY_PROTOCOL", false),
            conversation_ack_timeout: Duration::from_secs(10),
            conversation_idle_ttl: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(crate::envelope::RETRY_BACKOFF_SECS),
            max_retries: crate::envelope::MAX_RETRIES,
            transcode_max_input_size: 10 * 1024 * 1024,
            transcode_gif_pass_limit: 600 * 1024,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Settings::from_cli(&Cli::parse_from(["gateway"])).unwrap()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let settings = Settings::for_tests();
        assert_eq!(settings.smpp_listen.port(), 9550);
        assert_eq!(settings.mm4_listen.port(), 2566);
        assert_eq!(settings.web_listen.port(), 3000);
        assert_eq!(settings.max_retries, 3);
    }
}
