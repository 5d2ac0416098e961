// ABOUTME: The message envelope that flows through both ingress channels and the Router
// ABOUTME: See spec §3 for field semantics and invariants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry ceiling before an envelope is discarded.
pub const MAX_RETRIES: u32 = 3;

/// Fixed retry backoff multiplier, in seconds.
pub const RETRY_BACKOFF_SECS: u64 = 10;

/// A `retry_count` that marks an envelope as "never retry" (synthetic
/// sender notifications, spec §4.2).
pub const RETRY_COUNT_NEVER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Sms,
    Mms,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Sms => "SMS",
            MessageKind::Mms => "MMS",
        }
    }
}

/// A single MMS attachment. `base64_cache` holds a lazily-populated base64
/// encoding of `bytes` so downstream webhook formats that want a data: URL
/// don't re-encode repeatedly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    #[serde(skip)]
    pub base64_cache: Option<String>,
}

impl FileAttachment {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
            base64_cache: None,
        }
    }

    /// Base64-encode `bytes`, memoizing the result.
    pub fn base64(&mut self) -> &str {
        if self.base64_cache.is_none() {
            self.base64_cache = Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                &self.bytes,
            ));
        }
        self.base64_cache.as_deref().unwrap()
    }
}

/// Per-envelope retry/delivery bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryState {
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// The unit of data flowing through the client-origin and carrier-origin
/// ingress channels and the Router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub to: String,
    pub from: String,
    pub kind: MessageKind,
    pub text: String,
    pub files: Vec<FileAttachment>,
    pub log_id: String,
    pub received_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub source_ip: String,
    pub source_carrier: String,
    pub skip_number_check: bool,
    pub delivery: Option<DeliveryState>,
}

impl Envelope {
    /// Construct a new envelope with a fresh `log_id` and `received_at`/
    /// `queued_at` set to now.
    pub fn new(to: impl Into<String>, from: impl Into<String>, kind: MessageKind) -> Self {
        let now = Utc::now();
        Envelope {
            to: to.into(),
            from: from.into(),
            kind,
            text: String::new(),
            files: Vec::new(),
            log_id: Uuid::new_v4().to_string(),
            received_at: now,
            queued_at: now,
            source_ip: String::new(),
            source_carrier: String::new(),
            skip_number_check: false,
            delivery: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_files(mut self, files: Vec<FileAttachment>) -> Self {
        self.files = files;
        self
    }

    /// Invariant check: `files` non-empty iff `kind == Mms`.
    pub fn well_formed(&self) -> bool {
        match self.kind {
            MessageKind::Sms => self.files.is_empty(),
            MessageKind::Mms => !self.files.is_empty() || !self.text.is_empty(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.delivery.as_ref().map(|d| d.retry_count).unwrap_or(0)
    }

    pub fn exhausted(&self) -> bool {
        self.retry_count() >= MAX_RETRIES && self.retry_count() != RETRY_COUNT_NEVER
    }

    /// Mark this envelope as a synthetic sender-notification that must never
    /// be retried.
    pub fn mark_never_retry(&mut self) {
        self.delivery = Some(DeliveryState {
            retry_count: RETRY_COUNT_NEVER,
            ..Default::default()
        });
    }

    /// Apply §4.8 step 6 retry bookkeeping: increment `retry_count`, record
    /// `last_error`, and compute `next_attempt_at` using the fixed backoff.
    pub fn record_retry(&mut self, reason: impl Into<String>) {
        let mut state = self.delivery.take().unwrap_or_default();
        state.retry_count = state.retry_count.saturating_add(1);
        state.last_error = Some(reason.into());
        state.next_attempt_at =
            Some(Utc::now() + chrono::Duration::seconds((RETRY_BACKOFF_SECS * state.retry_count as u64) as i64));
        self.delivery = Some(state);
    }

    /// Build a synthetic inbound SMS back to the original sender, used by
    /// the transcoder (§4.2), the Router's STOP handling (§4.7), and the
    /// retry-exhaustion notifier (§4.8). The notification is addressed
    /// `from -> to` reversed and is marked never-retry.
    pub fn synthetic_notification(original_to: &str, original_from: &str, message: &str) -> Self {
        let mut env = Envelope::new(original_from, original_to, MessageKind::Sms)
            .with_text(message.to_string());
        env.skip_number_check = true;
        env.mark_never_retry();
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sms_must_have_no_files() {
        let env = Envelope::new("+1", "+2", MessageKind::Sms).with_text("hi");
        assert!(env.well_formed());
    }

    #[test]
    fn mms_with_no_files_and_no_text_is_malformed() {
        let env = Envelope::new("+1", "+2", MessageKind::Mms);
        assert!(!env.well_formed());
    }

    #[test]
    fn retry_exhaustion() {
        let mut env = Envelope::new("+1", "+2", MessageKind::Sms);
        for _ in 0..MAX_RETRIES {
            assert!(!env.exhausted());
            env.record_retry("upstream down");
        }
        assert!(env.exhausted());
    }

    #[test]
    fn never_retry_is_never_exhausted_by_count() {
        let mut env = Envelope::new("+1", "+2", MessageKind::Sms);
        env.mark_never_retry();
        assert!(!env.exhausted());
    }
}
