// ABOUTME: Structured log-event emission interface
// ABOUTME: Wraps `tracing` the way the teacher crate already depends on it

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Initializes the process-wide `tracing` subscriber from `RUST_LOG`,
/// defaulting to `info` — mirrors the reference pack's
/// `tracing_subscriber::fmt().with_env_filter(...)` initializers.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// The severity a `LogEvent` is emitted at. Mirrors spec §7's level
/// assignments (WARN for auth/quota, ERROR for internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A structured, externally-observable decision point. The concrete sink
/// (ELK, syslog, a remote collector) is out of scope per spec §2; this
/// struct plus `emit` is the interface a real deployment would wire up to
/// one.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub event: &'static str,
    pub log_id: Option<String>,
    pub client_id: Option<i64>,
    pub detail: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, event: &'static str, detail: impl Into<String>) -> Self {
        LogEvent {
            level,
            event,
            log_id: None,
            client_id: None,
            detail: detail.into(),
        }
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }

    pub fn with_client(mut self, client_id: i64) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// Default emitter: forwards a `LogEvent` to `tracing` at the matching
/// level. A production deployment can swap this for a real sink without
/// touching call sites, since every decision point only depends on `emit`.
pub fn emit(ev: LogEvent) {
    match ev.level {
        LogLevel::Info => {
            tracing::info!(event = ev.event, log_id = ?ev.log_id, client_id = ?ev.client_id, "{}", ev.detail)
        }
        LogLevel::Warn => {
            tracing::warn!(event = ev.event, log_id = ?ev.log_id, client_id = ?ev.client_id, "{}", ev.detail)
        }
        LogLevel::Error => {
            tracing::error!(event = ev.event, log_id = ?ev.log_id, client_id = ?ev.client_id, "{}", ev.detail)
        }
    }
}
