// ABOUTME: Carrier adapter contract — concrete HTTP implementations are out of scope
// ABOUTME: The Conversation Manager correlates against the ack_id an adapter's send returns

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::Envelope;

/// Distinguished ack id meaning the upstream rejected the message due to
/// opt-out; must never be retried.
pub const STOP_MESSAGE_ACK: &str = "STOP_MESSAGE";

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier request failed: {0}")]
    RequestFailed(String),
    #[error("carrier returned a non-success status: {0}")]
    NonSuccessStatus(u16),
}

/// An inbound webhook payload from a carrier, already deserialized by the
/// concrete adapter (out of scope here) into one or more envelopes plus the
/// ack the adapter should send back to the carrier's HTTP layer.
pub struct InboundResult {
    pub envelopes: Vec<Envelope>,
    pub ack_body: serde_json::Value,
}

/// Contract every upstream wireless carrier integration implements. Concrete
/// adapters (Twilio, Bandwidth, a direct SMPP peer, ...) are out of scope —
/// only the operation contract is specified here.
#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Parse an inbound carrier webhook request body into envelope(s).
    async fn inbound(&self, raw_body: &[u8]) -> Result<InboundResult, CarrierError>;

    /// Send an SMS upstream; returns the carrier's ack id, which
    /// the Router registers with the Conversation Manager for SMS sends
    /// that entered via a carrier-origin-less path.
    async fn send_sms(&self, envelope: &Envelope) -> Result<String, CarrierError>;

    /// Send an MMS upstream. Adapters must tolerate media delivered as
    /// either a URL or inline base64.
    async fn send_mms(&self, envelope: &Envelope) -> Result<String, CarrierError>;
}

/// A minimal reference adapter used by tests and examples. It never talks
/// to a real network; `send_sms`/`send_mms` just echo a deterministic ack id
/// unless `fail_next` or `stop_next` has been armed, which is how the STOP
/// and retry-exhaustion test scenarios are driven.
pub struct MockCarrierAdapter {
    pub name: String,
    pub fail_next: std::sync::atomic::AtomicBool,
    pub stop_next: std::sync::atomic::AtomicBool,
}

impl MockCarrierAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        MockCarrierAdapter {
            name: name.into(),
            fail_next: std::sync::atomic::AtomicBool::new(false),
            stop_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn arm_stop(&self) {
        self.stop_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn arm_fail(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl CarrierAdapter for MockCarrierAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn inbound(&self, _raw_body: &[u8]) -> Result<InboundResult, CarrierError> {
        Ok(InboundResult {
            envelopes: Vec::new(),
            ack_body: serde_json::json!({"status": "ok"}),
        })
    }

    async fn send_sms(&self, envelope: &Envelope) -> Result<String, CarrierError> {
        if self.stop_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Ok(STOP_MESSAGE_ACK.to_string());
        }
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(CarrierError::NonSuccessStatus(500));
        }
        Ok(format!("mock-ack-{}", envelope.log_id))
    }

    async fn send_mms(&self, envelope: &Envelope) -> Result<String, CarrierError> {
        self.send_sms(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    #[tokio::test]
    async fn stop_message_is_returned_verbatim() {
        let adapter = MockCarrierAdapter::new("twilio");
        adapter.arm_stop();
        let env = Envelope::new("+1", "+2", MessageKind::Sms);
        let ack = adapter.send_sms(&env).await.unwrap();
        assert_eq!(ack, STOP_MESSAGE_ACK);
    }
}
