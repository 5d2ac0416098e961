// ABOUTME: Per-connection SMPP v3.4 state machine: bind negotiation, keepalive, message exchange
// ABOUTME: One task per TCP connection, `tokio::select!`-multiplexed like `connection::Connection`'s callers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::Frame;
use crate::config::Settings;
use crate::connection::Connection;
use crate::conversation::{correlation_key, ClientOriginSink, ConversationManager};
use crate::datatypes::{
    BindReceiverResponse, BindTransceiverResponse, BindTransmitterResponse, CommandStatus,
    DeliverSm, EnquireLink, EnquireLinkResponse, EsmClass, GenericNack, MessageId,
    NumericPlanIndicator, SubmitSmResponse, TypeOfNumber, UnbindResponse,
};
use crate::domain::ClientType;
use crate::envelope::{Envelope, MessageKind};
use crate::log::{emit, LogEvent, LogLevel};
use crate::repository::{ClientRepository, NumberRepository};
use crate::router::Router;

use super::registry::{DeliverJob, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Transmitter,
    Receiver,
    Transceiver,
}

impl BindMode {
    fn can_submit(self) -> bool {
        matches!(self, BindMode::Transmitter | BindMode::Transceiver)
    }

    fn can_receive(self) -> bool {
        matches!(self, BindMode::Receiver | BindMode::Transceiver)
    }
}

pub struct SessionDeps {
    pub settings: Arc<Settings>,
    pub client_repo: Arc<dyn ClientRepository>,
    pub number_repo: Arc<dyn NumberRepository>,
    pub router: Arc<Router>,
    pub registry: Arc<SessionRegistry>,
    pub conversation: Arc<ConversationManager>,
}

struct BoundSession {
    system_id: String,
    mode: BindMode,
}

/// Drives one accepted TCP connection end to end: bind negotiation, then the
/// bound message loop, until the peer unbinds or the connection drops.
pub async fn run(stream: tokio::net::TcpStream, peer_addr: SocketAddr, deps: SessionDeps) {
    let mut conn = Connection::new(stream);
    let bound = match negotiate_bind(&mut conn, peer_addr, &deps).await {
        Some(b) => b,
        None => return,
    };

    emit(LogEvent::new(
        LogLevel::Info,
        "smpp_bound",
        format!("{} bound as {:?} from {}", bound.system_id, bound.mode, peer_addr),
    ));

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<DeliverJob>();
    let (evict_tx, mut evict_rx) = oneshot::channel::<()>();
    if bound.mode.can_receive() {
        deps.registry
            .register(bound.system_id.clone(), outbound_tx.clone(), evict_tx);
    } else {
        drop(evict_tx);
    }

    let seq = AtomicU32::new(2); // sequence 1 was spent on the bind response
    let outstanding: DashMap<u32, oneshot::Sender<CommandStatus>> = DashMap::new();
    let mut keepalive = tokio::time::interval(deps.settings.smpp_keepalive_interval);
    keepalive.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            frame = conn.read_frame() => {
                match frame {
                    Ok(Some(f)) => {
                        if !handle_inbound(f, &mut conn, &bound, &deps, &outstanding).await {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            job = outbound_rx.recv(), if bound.mode.can_receive() => {
                match job {
                    Some(job) => deliver(&mut conn, &deps, &seq, &outstanding, job).await,
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                let n = seq.fetch_add(1, Ordering::SeqCst);
                let frame = Frame::EnquireLink(EnquireLink {
                    command_status: CommandStatus::Ok,
                    sequence_number: n,
                });
                if conn.write_frame(&frame).await.is_err() {
                    break;
                }
            }
            // Fires when a newer successful bind for the same system_id
            // evicted us.
            _ = &mut evict_rx, if bound.mode.can_receive() => {
                emit(LogEvent::new(
                    LogLevel::Info,
                    "smpp_evicted",
                    format!("{} evicted by a newer bind", bound.system_id),
                ));
                break;
            }
        }
    }

    if bound.mode.can_receive() {
        deps.registry.deregister(&bound.system_id);
    }
    emit(LogEvent::new(
        LogLevel::Info,
        "smpp_unbound",
        format!("{} session ended", bound.system_id),
    ));
}

/// Reads and validates exactly one bind request, checking credentials and the IP ACL,
/// and writes the matching `_resp`.
async fn negotiate_bind(
    conn: &mut Connection,
    peer_addr: SocketAddr,
    deps: &SessionDeps,
) -> Option<BoundSession> {
    let frame = match conn.read_frame().await {
        Ok(Some(f)) => f,
        _ => return None,
    };

    let (system_id, password, mode, seq) = match frame {
        Frame::BindTransmitter(pdu) => (
            pdu.system_id.as_str().unwrap_or("").to_string(),
            pdu.password.map(|p| p.as_str().unwrap_or("").to_string()).unwrap_or_default(),
            BindMode::Transmitter,
            pdu.sequence_number,
        ),
        Frame::BindReceiver(pdu) => (
            pdu.system_id.as_str().unwrap_or("").to_string(),
            pdu.password.map(|p| p.as_str().unwrap_or("").to_string()).unwrap_or_default(),
            BindMode::Receiver,
            pdu.sequence_number,
        ),
        Frame::BindTransceiver(pdu) => (
            pdu.system_id.as_str().unwrap_or("").to_string(),
            pdu.password.map(|p| p.as_str().unwrap_or("").to_string()).unwrap_or_default(),
            BindMode::Transceiver,
            pdu.sequence_number,
        ),
        _ => {
            let _ = conn
                .write_frame(&Frame::GenericNack(GenericNack::new(CommandStatus::IncorrectBindStatus, 0)))
                .await;
            return None;
        }
    };

    let client = deps.client_repo.by_username(&system_id).await.ok().flatten();
    let status = validate_bind(&client, &password, peer_addr);

    write_bind_response(conn, mode, status, seq, &system_id).await.ok()?;

    if status != CommandStatus::Ok {
        emit(LogEvent::new(
            LogLevel::Warn,
            "auth_failed",
            format!("bind rejected for {system_id} from {peer_addr}: {status:?}"),
        ));
        return None;
    }

    Some(BoundSession { system_id, mode })
}

/// Credential and ACL checks for a bind attempt. Password
/// comparison is against the repository's stored credential; decrypting it
/// at rest happens in the (out-of-scope) repository implementation, not here.
fn validate_bind(client: &Option<crate::domain::Client>, password: &str, peer_addr: SocketAddr) -> CommandStatus {
    let Some(client) = client else {
        return CommandStatus::InvalidSystemId;
    };
    if client.client_type != ClientType::Legacy {
        return CommandStatus::InvalidSystemId;
    }
    if client.password_encrypted != password {
        return CommandStatus::InvalidPassword;
    }
    if let Some(allowed) = &client.address {
        if allowed != &peer_addr.ip().to_string() {
            return CommandStatus::BindFailed;
        }
    }
    CommandStatus::Ok
}

async fn write_bind_response(
    conn: &mut Connection,
    mode: BindMode,
    status: CommandStatus,
    seq: u32,
    system_id: &str,
) -> Result<(), std::io::Error> {
    let sid = crate::datatypes::SystemId::from(system_id);
    let frame = match mode {
        BindMode::Transmitter => Frame::BindTransmitterResp(BindTransmitterResponse {
            command_status: status,
            sequence_number: seq,
            system_id: sid,
            sc_interface_version: None,
        }),
        BindMode::Receiver => Frame::BindReceiverResp(BindReceiverResponse {
            command_status: status,
            sequence_number: seq,
            system_id: sid,
            sc_interface_version: None,
        }),
        BindMode::Transceiver => Frame::BindTransceiverResp(BindTransceiverResponse {
            command_status: status,
            sequence_number: seq,
            system_id: sid,
            sc_interface_version: None,
        }),
    };
    conn.write_frame(&frame).await
}

/// Handle one inbound frame while bound. Returns `false` when the connection
/// should close (unbind or a malformed PDU outside the valid-sequence set).
async fn handle_inbound(
    frame: Frame,
    conn: &mut Connection,
    bound: &BoundSession,
    deps: &SessionDeps,
    outstanding: &DashMap<u32, oneshot::Sender<CommandStatus>>,
) -> bool {
    match frame {
        Frame::EnquireLink(pdu) => {
            let resp = Frame::EnquireLinkResp(EnquireLinkResponse {
                command_status: CommandStatus::Ok,
                sequence_number: pdu.sequence_number,
            });
            conn.write_frame(&resp).await.is_ok()
        }
        Frame::EnquireLinkResp(_) => true,
        Frame::Unbind(pdu) => {
            let resp = Frame::UnbindResp(UnbindResponse::new(pdu.sequence_number));
            let _ = conn.write_frame(&resp).await;
            false
        }
        Frame::SubmitSm(pdu) => {
            if !bound.mode.can_submit() {
                let resp = Frame::GenericNack(GenericNack::new(CommandStatus::IncorrectBindStatus, pdu.sequence_number));
                return conn.write_frame(&resp).await.is_ok();
            }
            let to = pdu.destination_addr.as_str().unwrap_or("").to_string();
            let from = pdu.source_addr.as_str().unwrap_or("").to_string();
            let raw = crate::encoding::decode(pdu.short_message.as_bytes(), pdu.data_coding);
            let text = crate::encoding::clean_control_chars(&raw);

            let suppressed = match deps.number_repo.by_e164(&to).await {
                Ok(Some(number)) => number.suppress_stop_autoreply && looks_like_stop_autoreply(&text),
                _ => false,
            };

            if !suppressed {
                let envelope = Envelope::new(to, from, MessageKind::Sms).with_text(text);
                let key = correlation_key(&envelope.from, &envelope.to);
                let sink: Arc<dyn ClientOriginSink> = deps.router.clone();
                deps.conversation.add(&key, envelope, &sink).await;
            }

            let message_id = MessageId::from(uuid::Uuid::new_v4().to_string().as_str());
            let resp = Frame::SubmitSmResp(SubmitSmResponse {
                command_status: CommandStatus::Ok,
                sequence_number: pdu.sequence_number,
                message_id,
            });
            conn.write_frame(&resp).await.is_ok()
        }
        Frame::DeliverSmResp(pdu) => {
            if let Some((_, tx)) = outstanding.remove(&pdu.sequence_number) {
                let _ = tx.send(pdu.command_status);
            }
            true
        }
        Frame::GenericNack(_) => true,
        _ => true,
    }
}

/// Send one delivery as one or more `deliver_sm` PDUs (segmented per spec
/// §4.1 for long bodies), waiting for each segment's `deliver_sm_resp` with
/// up to `smpp_retries` retries before failing the whole job.
async fn deliver(
    conn: &mut Connection,
    deps: &SessionDeps,
    seq: &AtomicU32,
    outstanding: &DashMap<u32, oneshot::Sender<CommandStatus>>,
    job: DeliverJob,
) {
    let segmented = match crate::encoding::segment(&job.envelope.text, next_reference()) {
        Ok(s) => s,
        Err(e) => {
            let _ = job.respond.send(Err(format!("unencodable text: {e}")));
            return;
        }
    };
    let multipart = segmented.segments.len() > 1;

    for body in &segmented.segments {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let n = seq.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            outstanding.insert(n, tx);

            let mut builder = DeliverSm::builder()
                .sequence_number(n)
                .source_addr_ton(TypeOfNumber::International)
                .dest_addr_ton(TypeOfNumber::International)
                .source_addr_npi(NumericPlanIndicator::Isdn)
                .dest_addr_npi(NumericPlanIndicator::Isdn)
                .source_addr(&job.envelope.from)
                .destination_addr(&job.envelope.to)
                .data_coding(segmented.encoding);
            if multipart {
                builder = builder.esm_class(EsmClass::default().with_udhi());
            }
            let builder = match builder.short_message_bytes(body) {
                Ok(b) => b,
                Err(e) => {
                    outstanding.remove(&n);
                    let _ = job.respond.send(Err(format!("segment too long: {e}")));
                    return;
                }
            };
            let pdu = match builder.build() {
                Ok(pdu) => pdu,
                Err(e) => {
                    outstanding.remove(&n);
                    let _ = job.respond.send(Err(format!("deliver_sm build failed: {e}")));
                    return;
                }
            };

            if conn.write_frame(&Frame::DeliverSm(Box::new(pdu))).await.is_err() {
                outstanding.remove(&n);
                let _ = job.respond.send(Err("connection write failed".to_string()));
                return;
            }

            let timeout = deps.settings.smpp_response_timeout;
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(CommandStatus::Ok)) => break,
                Ok(Ok(status)) => {
                    outstanding.remove(&n);
                    if attempt > deps.settings.smpp_retries {
                        let _ = job.respond.send(Err(format!("deliver_sm_resp status {status:?}")));
                        return;
                    }
                }
                Ok(Err(_)) | Err(_) => {
                    outstanding.remove(&n);
                    if attempt > deps.settings.smpp_retries {
                        let _ = job.respond.send(Err("deliver_sm_resp timeout".to_string()));
                        return;
                    }
                }
            }
        }
    }

    let _ = job.respond.send(Ok(()));
}

/// Heuristic match for a carrier's automated "reply STOP to unsubscribe"
/// footer, so a number can opt out of relaying those back to the client
///.
fn looks_like_stop_autoreply(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("reply stop") || lower.contains("txt stop") || lower.contains("text stop")
}

fn next_reference() -> u8 {
    use std::sync::atomic::AtomicU8;
    static REF: AtomicU8 = AtomicU8::new(0);
    REF.fetch_add(1, Ordering::SeqCst)
}
