// ABOUTME: Normalizes addresses, resolves tenants, enforces quota, and selects a delivery path
// ABOUTME: Two ingress channels mirror the two trust domains; a fair dispatcher spawns a handler per message

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::carrier::{CarrierAdapter, STOP_MESSAGE_ACK};
use crate::config::Settings;
use crate::conversation::{correlation_key, ClientOriginSink, ConversationManager};
use crate::domain::{Client, ClientType, DeliveryMethod, Direction, Number, UsageRecord};
use crate::envelope::{Envelope, MessageKind};
use crate::log::{emit, LogEvent, LogLevel};
use crate::quota::QuotaChecker;
use crate::repository::{CarrierRepository, ClientRepository, NumberRepository, UsageRepository};
use crate::webhook::WebhookDispatcher;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("address could not be normalized to E.164: {0}")]
    InvalidAddress(String),
}

/// Which ingress channel an envelope arrived on. Retries re-enter the same
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ClientOrigin,
    CarrierOrigin,
}

/// Outbound delivery via the short-message session server. Implemented by `smpp::server::SessionRegistry`; the Router only
/// depends on this contract so `router` doesn't depend on `smpp`.
#[async_trait]
pub trait SmppOutbound: Send + Sync {
    async fn has_active_session(&self, username: &str) -> bool;
    async fn send(&self, username: &str, envelope: &Envelope) -> Result<(), String>;
}

/// Outbound delivery via the SMTP-framed MMS peer.
/// Implemented by `mm4::server`.
#[async_trait]
pub trait Mm4Outbound: Send + Sync {
    async fn send(&self, client: &Client, envelope: &Envelope) -> Result<(), String>;
}

/// Normalizes `addr` to E.164: strips annotations like `/TYPE=PLMN`, keeps a
/// leading `+` and digits only.
pub fn normalize_e164(addr: &str) -> Result<String, RouterError> {
    let stripped = addr.split('/').next().unwrap_or(addr).trim();
    if stripped.is_empty() {
        return Err(RouterError::InvalidAddress(addr.to_string()));
    }
    let mut out = String::new();
    let mut chars = stripped.chars().peekable();
    if let Some(&'+') = chars.peek() {
        out.push('+');
        chars.next();
    }
    for c in chars {
        if c.is_ascii_digit() {
            out.push(c);
        } else {
            return Err(RouterError::InvalidAddress(addr.to_string()));
        }
    }
    if out.trim_start_matches('+').is_empty() {
        return Err(RouterError::InvalidAddress(addr.to_string()));
    }
    Ok(out)
}

pub struct Router {
    pub client_repo: Arc<dyn ClientRepository>,
    pub number_repo: Arc<dyn NumberRepository>,
    pub carrier_repo: Arc<dyn CarrierRepository>,
    pub usage_repo: Arc<dyn UsageRepository>,
    pub quota: Arc<QuotaChecker>,
    pub conversation: Arc<ConversationManager>,
    pub webhook: Arc<WebhookDispatcher>,
    pub carriers: DashMap<String, Arc<dyn CarrierAdapter>>,
    pub smpp_outbound: Arc<dyn SmppOutbound>,
    pub mm4_outbound: Arc<dyn Mm4Outbound>,
    pub settings: Arc<Settings>,

    client_origin_tx: mpsc::UnboundedSender<Envelope>,
    client_origin_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    carrier_origin_tx: mpsc::UnboundedSender<Envelope>,
    carrier_origin_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_repo: Arc<dyn ClientRepository>,
        number_repo: Arc<dyn NumberRepository>,
        carrier_repo: Arc<dyn CarrierRepository>,
        usage_repo: Arc<dyn UsageRepository>,
        quota: Arc<QuotaChecker>,
        conversation: Arc<ConversationManager>,
        webhook: Arc<WebhookDispatcher>,
        smpp_outbound: Arc<dyn SmppOutbound>,
        mm4_outbound: Arc<dyn Mm4Outbound>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        let (client_origin_tx, client_origin_rx) = mpsc::unbounded_channel();
        let (carrier_origin_tx, carrier_origin_rx) = mpsc::unbounded_channel();
        Arc::new(Router {
            client_repo,
            number_repo,
            carrier_repo,
            usage_repo,
            quota,
            conversation,
            webhook,
            carriers: DashMap::new(),
            smpp_outbound,
            mm4_outbound,
            settings,
            client_origin_tx,
            client_origin_rx: tokio::sync::Mutex::new(client_origin_rx),
            carrier_origin_tx,
            carrier_origin_rx: tokio::sync::Mutex::new(carrier_origin_rx),
        })
    }

    pub fn register_carrier(&self, adapter: Arc<dyn CarrierAdapter>) {
        self.carriers.insert(adapter.name().to_string(), adapter);
    }

    pub fn client_origin_sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.client_origin_tx.clone()
    }

    pub fn carrier_origin_sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.carrier_origin_tx.clone()
    }

    pub fn submit_client_origin(&self, envelope: Envelope) {
        let _ = self.client_origin_tx.send(envelope);
    }

    pub fn submit_carrier_origin(&self, envelope: Envelope) {
        let _ = self.carrier_origin_tx.send(envelope);
    }

    /// The dispatcher: fairly drains both ingress channels and spawns a
    /// handler per message. Runs until both channels close.
    pub async fn run(self: Arc<Self>) {
        loop {
            let client_msg = {
                let mut rx = self.client_origin_rx.lock().await;
                rx.try_recv().ok()
            };
            if let Some(envelope) = client_msg {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.handle(envelope, Origin::ClientOrigin).await });
                continue;
            }
            let carrier_msg = {
                let mut rx = self.carrier_origin_rx.lock().await;
                rx.try_recv().ok()
            };
            if let Some(envelope) = carrier_msg {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.handle(envelope, Origin::CarrierOrigin).await });
                continue;
            }

            // Both channels empty: block on whichever produces next, or exit
            // if both are closed (graceful shutdown, spec §5).
            let mut client_rx = self.client_origin_rx.lock().await;
            let mut carrier_rx = self.carrier_origin_rx.lock().await;
            tokio::select! {
                envelope = client_rx.recv() => {
                    drop(client_rx);
                    drop(carrier_rx);
                    match envelope {
                        Some(envelope) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.handle(envelope, Origin::ClientOrigin).await });
                        }
                        None => return,
                    }
                }
                envelope = carrier_rx.recv() => {
                    drop(client_rx);
                    drop(carrier_rx);
                    match envelope {
                        Some(envelope) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.handle(envelope, Origin::CarrierOrigin).await });
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, mut envelope: Envelope, origin: Origin) {
        let key = correlation_key(&envelope.from, &envelope.to);
        let sink: Arc<dyn ClientOriginSink> = self.clone();

        // §4.8 step 7: deferred release, guarantees the in-flight slot is
        // never permanently locked when processing does not end in an
        // outstanding carrier ack.
        let mut released = false;

        let to = match normalize_e164(&envelope.to) {
            Ok(v) => v,
            Err(_) => {
                emit(LogEvent::new(
                    LogLevel::Warn,
                    "input_invalid",
                    format!("unparseable to address: {}", envelope.to),
                ).with_log_id(envelope.log_id.clone()));
                if origin == Origin::ClientOrigin {
                    self.conversation.handle_failure(&key, &sink).await;
                }
                return;
            }
        };
        let from = match normalize_e164(&envelope.from) {
            Ok(v) => v,
            Err(_) => {
                emit(LogEvent::new(
                    LogLevel::Warn,
                    "input_invalid",
                    format!("unparseable from address: {}", envelope.from),
                ).with_log_id(envelope.log_id.clone()));
                if origin == Origin::ClientOrigin {
                    self.conversation.handle_failure(&key, &sink).await;
                }
                return;
            }
        };
        envelope.to = to.clone();
        envelope.from = from.clone();

        let to_number = self.number_repo.by_e164(&to).await.ok().flatten();
        let from_number = self.number_repo.by_e164(&from).await.ok().flatten();
        let to_client = match &to_number {
            Some(n) => self.client_repo.by_id(n.client_id).await.ok().flatten(),
            None => None,
        };
        let from_client = match &from_number {
            Some(n) => self.client_repo.by_id(n.client_id).await.ok().flatten(),
            None => None,
        };

        // §4.8 step 3: origin-specific validity.
        if origin == Origin::ClientOrigin && from_client.is_none() && !envelope.skip_number_check {
            emit(LogEvent::new(
                LogLevel::Warn,
                "input_invalid",
                "client-origin message with unknown sending number",
            ).with_log_id(envelope.log_id.clone()));
            self.conversation.handle_failure(&key, &sink).await;
            return;
        }
        if origin == Origin::CarrierOrigin && to_client.is_none() {
            emit(LogEvent::new(
                LogLevel::Warn,
                "input_invalid",
                "carrier-origin message with unknown receiving number",
            ).with_log_id(envelope.log_id.clone()));
            return;
        }

        // §4.8 step 4: quota check on from_client, if any.
        if let Some(client) = &from_client {
            match self
                .quota
                .check(client, from_number.as_ref(), envelope.kind, Direction::Outbound)
                .await
            {
                Ok(check) if !check.allowed => {
                    emit(LogEvent::new(
                        LogLevel::Warn,
                        "limit_exceeded",
                        format!(
                            "limit_type={} limit={} used={} period={}",
                            check.limit_type, check.limit, check.used, check.period
                        ),
                    )
                    .with_log_id(envelope.log_id.clone())
                    .with_client(client.id));
                    self.conversation.handle_failure(&key, &sink).await;
                    return;
                }
                Err(e) => {
                    let gateway_err = crate::error::GatewayError::from(e);
                    emit(LogEvent::new(LogLevel::Error, gateway_err.kind(), gateway_err.to_string())
                        .with_log_id(envelope.log_id.clone()));
                    self.conversation.handle_failure(&key, &sink).await;
                    return;
                }
                _ => {}
            }
        }

        let result = self
            .deliver(&envelope, &to_client, &from_client, &to_number, &from_number, origin)
            .await;

        match result {
            Ok(()) => {
                if let Some(client) = &from_client {
                    self.quota.charge_burst(client.id, envelope.kind);
                }
                released = true;
                self.conversation.handle_failure(&key, &sink).await;
            }
            Err(DeliverOutcome::AwaitingAck) => {
                // A carrier ack (or session response) is outstanding; the
                // Conversation Manager's own timeout will release the slot.
                released = true;
            }
            Err(DeliverOutcome::Stop) => {
                emit(LogEvent::new(LogLevel::Warn, "stop_message", "carrier rejected as opt-out")
                    .with_log_id(envelope.log_id.clone()));
                if self.settings.notify_sender_on_failure {
                    let notice = Envelope::synthetic_notification(
                        &envelope.to,
                        &envelope.from,
                        &format!(
                            "Blocked due to STOP message. Message could not be delivered. ID: {}",
                            envelope.log_id
                        ),
                    );
                    self.submit_client_origin(notice);
                }
            }
            Err(DeliverOutcome::Failed(reason)) => {
                if envelope.retry_count() == crate::envelope::RETRY_COUNT_NEVER {
                    // A never-retry synthetic notification (STOP/transcode/
                    // retry-exhaustion) that itself failed delivery is
                    // terminal: `exhausted()` excludes this sentinel, so
                    // without this check it would re-enqueue forever.
                    emit(LogEvent::new(
                        LogLevel::Error,
                        "notification_delivery_failed",
                        format!("dropping never-retry notification: {reason}"),
                    )
                    .with_log_id(envelope.log_id.clone()));
                } else {
                    envelope.record_retry(reason.clone());
                    if envelope.exhausted() {
                        emit(LogEvent::new(
                            LogLevel::Error,
                            "retry_exhausted",
                            format!("dropping after max retries: {reason}"),
                        )
                        .with_log_id(envelope.log_id.clone()));
                        if self.settings.notify_sender_on_failure && from_client.is_some() {
                            let notice = Envelope::synthetic_notification(
                                &envelope.to,
                                &envelope.from,
                                &format!(
                                    "Your message could not be delivered after {} attempts. ID: {}",
                                    crate::envelope::MAX_RETRIES,
                                    envelope.log_id
                                ),
                            );
                            self.submit_client_origin(notice);
                        }
                    } else {
                        let backoff = self.settings.retry_backoff;
                        let tx = match origin {
                            Origin::ClientOrigin => self.client_origin_tx.clone(),
                            Origin::CarrierOrigin => self.carrier_origin_tx.clone(),
                        };
                        tokio::spawn(async move {
                            tokio::time::sleep(backoff).await;
                            let _ = tx.send(envelope);
                        });
                    }
                }
            }
        }

        if !released && origin == Origin::ClientOrigin {
            self.conversation.handle_failure(&key, &sink).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        envelope: &Envelope,
        to_client: &Option<Client>,
        from_client: &Option<Client>,
        to_number: &Option<Number>,
        from_number: &Option<Number>,
        origin: Origin,
    ) -> Result<(), DeliverOutcome> {
        match to_client {
            Some(client) if client.client_type == ClientType::Web => {
                let password = client.password_encrypted.clone(); // decryption out of scope
                let number_webhook = to_number.as_ref().and_then(|n| n.webhook_url.as_deref());
                self.webhook
                    .send(client, &password, number_webhook, envelope)
                    .await
                    .map_err(|e| DeliverOutcome::Failed(e.to_string()))?;
                self.record_usage(client, envelope, DeliveryMethod::Webhook, None)
                    .await;
                Ok(())
            }
            Some(client) if client.client_type == ClientType::Legacy && envelope.kind == MessageKind::Sms => {
                if !self.smpp_outbound.has_active_session(&client.username).await {
                    return Err(DeliverOutcome::Failed("no active SMPP session".to_string()));
                }
                self.smpp_outbound
                    .send(&client.username, envelope)
                    .await
                    .map_err(DeliverOutcome::Failed)?;
                self.record_usage(client, envelope, DeliveryMethod::SmppSession, None)
                    .await;
                Ok(())
            }
            Some(client) if client.client_type == ClientType::Legacy && envelope.kind == MessageKind::Mms => {
                self.mm4_outbound
                    .send(client, envelope)
                    .await
                    .map_err(DeliverOutcome::Failed)?;
                self.record_usage(client, envelope, DeliveryMethod::Mm4, None)
                    .await;
                Ok(())
            }
            None => {
                let carrier_name = from_number
                    .as_ref()
                    .map(|n| n.carrier_name.clone())
                    .ok_or_else(|| DeliverOutcome::Failed("no source carrier for number".to_string()))?;
                let adapter = self
                    .carriers
                    .get(&carrier_name)
                    .map(|e| e.clone())
                    .ok_or_else(|| DeliverOutcome::Failed(format!("unknown carrier {carrier_name}")))?;

                let ack = match envelope.kind {
                    MessageKind::Sms => adapter.send_sms(envelope).await,
                    MessageKind::Mms => adapter.send_mms(envelope).await,
                }
                .map_err(|e| DeliverOutcome::Failed(e.to_string()))?;

                if ack == STOP_MESSAGE_ACK {
                    return Err(DeliverOutcome::Stop);
                }

                if envelope.kind == MessageKind::Sms {
                    let key = correlation_key(&envelope.from, &envelope.to);
                    let sink: Arc<dyn ClientOriginSink> = Arc::new(NoopSink);
                    self.conversation.set_expected_ack(&key, ack, sink).await;
                }

                if let Some(client) = from_client {
                    self.record_usage(client, envelope, DeliveryMethod::CarrierApi, Some(carrier_name))
                        .await;
                }
                return Err(DeliverOutcome::AwaitingAck);
            }
            _ => Err(DeliverOutcome::Failed("no deliverable path".to_string())),
        }
    }

    async fn record_usage(
        &self,
        client: &Client,
        envelope: &Envelope,
        method: DeliveryMethod,
        carrier: Option<String>,
    ) {
        let usage = UsageRecord {
            client_id: client.id,
            direction: Direction::Outbound,
            from_type: match envelope.kind {
                MessageKind::Sms => "SMS",
                MessageKind::Mms => "MMS",
            },
            to_type: match envelope.kind {
                MessageKind::Sms => "SMS",
                MessageKind::Mms => "MMS",
            },
            delivery_method: method,
            carrier,
            encoding: None,
            segments: 1,
            bytes: envelope.text.len() as u64,
            media_count: envelope.files.len() as u32,
            source_ip: envelope.source_ip.clone(),
            created_at: chrono::Utc::now(),
        };
        let _ = self.usage_repo.record(usage).await;
    }
}

enum DeliverOutcome {
    AwaitingAck,
    Stop,
    Failed(String),
}

#[async_trait]
impl ClientOriginSink for Router {
    async fn dispatch_client_origin(&self, envelope: Envelope) {
        self.submit_client_origin(envelope);
    }
}

/// Used only when registering an ack with the Conversation Manager for a
/// carrier-origin-less send where no separate dispatch callback is needed
/// beyond the Router's own.
struct NoopSink;
#[async_trait]
impl ClientOriginSink for NoopSink {
    async fn dispatch_client_origin(&self, _envelope: Envelope) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiFormat, Client, ClientSettings, ClientType, Number, NumberLimitOverrides};
    use crate::repository::{
        InMemoryCarrierRepository, InMemoryClientRepository, InMemoryNumberRepository, InMemoryUsageRepository,
    };

    #[test]
    fn strips_type_plmn_annotation() {
        assert_eq!(normalize_e164("+12505551234/TYPE=PLMN").unwrap(), "+12505551234");
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(normalize_e164("not-a-number").is_err());
    }

    #[test]
    fn accepts_bare_digits_without_plus() {
        assert_eq!(normalize_e164("12505551234").unwrap(), "12505551234");
    }

    struct NeverUsedSmppOutbound;
    #[async_trait]
    impl SmppOutbound for NeverUsedSmppOutbound {
        async fn has_active_session(&self, _username: &str) -> bool {
            false
        }
        async fn send(&self, _username: &str, _envelope: &Envelope) -> Result<(), String> {
            Err("not reachable in this test".to_string())
        }
    }

    struct NeverUsedMm4Outbound;
    #[async_trait]
    impl Mm4Outbound for NeverUsedMm4Outbound {
        async fn send(&self, _client: &Client, _envelope: &Envelope) -> Result<(), String> {
            Err("not reachable in this test".to_string())
        }
    }

    async fn test_router() -> Arc<Router> {
        let client_repo = Arc::new(InMemoryClientRepository::new());
        let number_repo = Arc::new(InMemoryNumberRepository::new());
        let carrier_repo = Arc::new(InMemoryCarrierRepository::new());
        let usage_repo = Arc::new(InMemoryUsageRepository::default());
        let mut settings = Settings::for_tests();
        settings.retry_backoff = std::time::Duration::from_millis(5);
        let settings = Arc::new(settings);

        // A web client with no webhook configured anywhere: delivery to it
        // always fails with `WebhookError::NoUrlConfigured`, deterministically
        // and without a network call.
        client_repo
            .upsert(Client {
                id: 1,
                username: "nowebhook".to_string(),
                password_encrypted: String::new(),
                name: "No Webhook".to_string(),
                address: None,
                client_type: ClientType::Web,
                timezone: None,
                settings: ClientSettings {
                    api_format: ApiFormat::Generic,
                    default_webhook: None,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        client_repo.reload().await.unwrap();
        number_repo
            .upsert(Number {
                id: 1,
                client_id: 1,
                e164: "+14155559876".to_string(),
                carrier_name: "twilio".to_string(),
                tag: None,
                group: None,
                webhook_url: None,
                suppress_stop_autoreply: false,
                limits: NumberLimitOverrides::default(),
            })
            .await
            .unwrap();
        number_repo.reload().await.unwrap();

        let quota = Arc::new(QuotaChecker::new(usage_repo.clone()));
        let conversation = Arc::new(ConversationManager::new(
            settings.conversation_ack_timeout,
            settings.conversation_idle_ttl,
        ));
        let webhook = Arc::new(WebhookDispatcher::new(settings.webhook_timeout));

        Router::new(
            client_repo,
            number_repo,
            carrier_repo,
            usage_repo,
            quota,
            conversation,
            webhook,
            Arc::new(NeverUsedSmppOutbound),
            Arc::new(NeverUsedMm4Outbound),
            settings,
        )
    }

    /// A never-retry synthetic notification whose own delivery fails must be
    /// dropped, not re-enqueued: `exhausted()` is always `false` for the
    /// `RETRY_COUNT_NEVER` sentinel, so the `Failed` arm must special-case it
    /// or the envelope loops on `client_origin` forever.
    #[tokio::test]
    async fn never_retry_envelope_is_dropped_not_requeued_on_failure() {
        let router = test_router().await;
        // `synthetic_notification(original_to, original_from, _)` addresses
        // the result `to: original_from, from: original_to` (reversed) — to
        // land on the no-webhook client, `original_from` must be its number.
        let notice = Envelope::synthetic_notification(
            "+12505551234",
            "+14155559876",
            "Blocked due to STOP message. ID: test",
        );
        assert_eq!(notice.to, "+14155559876");
        assert_eq!(notice.retry_count(), crate::envelope::RETRY_COUNT_NEVER);

        router.clone().handle(notice, Origin::ClientOrigin).await;

        // If the fix regressed, `handle` would have re-spawned a retry task
        // that re-sends onto `client_origin_tx` after the (5ms) backoff.
        // Give it well over that to run, then assert the channel stayed empty.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let mut rx = router.client_origin_rx.lock().await;
        assert!(rx.try_recv().is_err(), "never-retry envelope was re-enqueued after a failed delivery");
    }
}
