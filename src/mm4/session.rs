// ABOUTME: Per-connection SMTP-framed MM4 command loop: HELO/MAIL FROM/RCPT TO/DATA/QUIT
// ABOUTME: Inbound DATA is parsed as MIME multipart via `mail_parser` and handed to the Transcoder

use std::net::SocketAddr;
use std::sync::Arc;

use mail_parser::MessageParser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Settings;
use crate::domain::Client;
use crate::envelope::{Envelope, FileAttachment, MessageKind};
use crate::log::{emit, LogEvent, LogLevel};
use crate::repository::ClientRepository;
use crate::router::Router;
use crate::transcode::TranscodePipeline;

use super::mime::build_multipart;

pub struct SessionDeps {
    pub settings: Arc<Settings>,
    pub client_repo: Arc<dyn ClientRepository>,
    pub router: Arc<Router>,
    pub transcode: Arc<TranscodePipeline>,
}

/// Drive one inbound MM4 peer connection to completion: optional
/// PROXY-protocol prefix, IP ACL, then the SMTP command loop.
pub async fn run(stream: TcpStream, peer_addr: SocketAddr, deps: SessionDeps) {
    let mut io = BufReader::new(stream);
    let idle = deps.settings.mm4_idle_timeout;

    if deps.settings.haproxy_proxy_protocol {
        let mut discard = String::new();
        if timeout(idle, io.read_line(&mut discard)).await.is_err() {
            return;
        }
    }

    let source_ip = peer_addr.ip().to_string();
    let client = match deps.client_repo.by_address(&source_ip).await {
        Ok(Some(c)) => c,
        _ => {
            emit(LogEvent::new(
                LogLevel::Warn,
                "auth_failed",
                format!("mm4 connection from unknown address {source_ip}"),
            ));
            let _ = io.write_all(b"550 not authorized\r\n").await;
            return;
        }
    };

    if io.write_all(b"220 gateway MM4 ready\r\n").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        let read = timeout(idle, io.read_line(&mut line)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 {
            break;
        }
        let cmd = line.trim_end().to_string();
        let upper = cmd.to_ascii_uppercase();

        if upper.starts_with("HELO") || upper.starts_with("EHLO") {
            let _ = io.write_all(b"250 gateway\r\n").await;
        } else if upper.starts_with("MAIL FROM") || upper.starts_with("RCPT TO") {
            let _ = io.write_all(b"250 OK\r\n").await;
        } else if upper.starts_with("DATA") {
            if io.write_all(b"354 start mail input\r\n").await.is_err() {
                break;
            }
            match read_data(&mut io, idle).await {
                Some(body) => match handle_message(&body, &deps, &source_ip).await {
                    Ok(()) => {
                        let _ = io.write_all(b"250 message accepted\r\n").await;
                    }
                    Err(reason) => {
                        emit(LogEvent::new(LogLevel::Warn, "input_invalid", reason).with_client(client.id));
                        let _ = io.write_all(b"554 transaction failed\r\n").await;
                    }
                },
                None => break,
            }
        } else if upper.starts_with("NOOP") {
            let _ = io.write_all(b"250 OK\r\n").await;
        } else if upper.starts_with("QUIT") {
            let _ = io.write_all(b"221 bye\r\n").await;
            break;
        } else {
            let _ = io.write_all(b"500 unrecognized command\r\n").await;
        }
    }
}

/// Read lines until the bare `.` terminator, undoing dot-stuffing
/// (`..` at line start means a literal `.`), per the SMTP DATA grammar.
async fn read_data(io: &mut BufReader<TcpStream>, idle: std::time::Duration) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = match timeout(idle, io.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            _ => return None,
        };
        if n == 0 {
            return None;
        }
        if line == ".\r\n" || line == ".\n" {
            break;
        }
        if let Some(rest) = line.strip_prefix("..") {
            body.extend_from_slice(rest.as_bytes());
        } else {
            body.extend_from_slice(line.as_bytes());
        }
    }
    Some(body)
}

/// Parse the MIME multipart body of a `DATA` transaction and submit the
/// assembled envelope to the Transcoder, then the Router.
async fn handle_message(raw: &[u8], deps: &SessionDeps, source_ip: &str) -> Result<(), String> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| "could not parse MIME message".to_string())?;

    let from = message
        .header("From")
        .and_then(|h| h.as_text())
        .unwrap_or_default()
        .to_string();
    let to = message
        .header("To")
        .and_then(|h| h.as_text())
        .unwrap_or_default()
        .to_string();

    if from.is_empty() || to.is_empty() {
        return Err("missing From/To header".to_string());
    }

    let mut files = Vec::new();
    for part in message.attachments() {
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = part
            .attachment_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.bin", uuid::Uuid::new_v4()));
        files.push(FileAttachment::new(filename, content_type, part.contents().to_vec()));
    }

    let text = message.body_text(0).map(|c| c.to_string()).unwrap_or_default();

    let mut envelope = Envelope::new(to, from, MessageKind::Mms).with_files(files);
    envelope.text = text;
    envelope.source_ip = source_ip.to_string();

    if !envelope.well_formed() {
        return Err("MMS envelope has neither text nor attachments".to_string());
    }

    match deps.transcode.submit(envelope.clone()).await {
        Ok(transcoded) => {
            envelope.files = transcoded;
            deps.router.submit_client_origin(envelope);
            Ok(())
        }
        Err(e) => {
            let notice = Envelope::synthetic_notification(
                &envelope.to,
                &envelope.from,
                &format!("{} ID: {}", e.user_message(), envelope.log_id),
            );
            deps.router.submit_client_origin(notice);
            Err(e.user_message())
        }
    }
}

/// Drive an outbound MM4 session to a legacy peer, mirroring the command
/// sequence a client would issue.
pub async fn send_outbound(settings: &Settings, client: &Client, envelope: &Envelope) -> Result<(), String> {
    let address = client
        .address
        .as_deref()
        .ok_or_else(|| "no MM4 peer address configured for client".to_string())?;

    let stream = timeout(settings.mm4_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| "connect timed out".to_string())?
        .map_err(|e| e.to_string())?;
    let mut io = BufReader::new(stream);

    expect_reply(&mut io, settings.mm4_timeout).await?;
    send_command(&mut io, &format!("EHLO {}\r\n", settings.mm4_originator_system), settings.mm4_timeout).await?;
    send_command(&mut io, &format!("MAIL FROM:<{}>\r\n", envelope.from), settings.mm4_timeout).await?;
    send_command(&mut io, &format!("RCPT TO:<{}>\r\n", envelope.to), settings.mm4_timeout).await?;
    send_command(&mut io, "DATA\r\n", settings.mm4_timeout).await?;

    let (body, content_type) = build_multipart(envelope);
    let headers = format!(
        "From: {}\r\nTo: {}\r\nX-Mms-Message-Type: MM4_forward.REQ\r\nX-Mms-Transaction-Id: {}\r\nX-Mms-Message-Id: {}\r\nMIME-Version: 1.0\r\nContent-Type: {}\r\n\r\n",
        envelope.from, envelope.to, envelope.log_id, envelope.log_id, content_type
    );
    let dotstuffed = dot_stuff(&format!("{headers}{body}"));

    io.write_all(dotstuffed.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    io.write_all(b"\r\n.\r\n").await.map_err(|e| e.to_string())?;
    io.flush().await.map_err(|e| e.to_string())?;
    expect_reply(&mut io, settings.mm4_timeout).await?;

    let _ = io.write_all(b"QUIT\r\n").await;
    Ok(())
}

fn dot_stuff(body: &str) -> String {
    body.lines()
        .map(|l| if let Some(rest) = l.strip_prefix('.') { format!("..{rest}") } else { l.to_string() })
        .collect::<Vec<_>>()
        .join("\r\n")
}

async fn send_command(io: &mut BufReader<TcpStream>, cmd: &str, timeout_dur: std::time::Duration) -> Result<(), String> {
    io.write_all(cmd.as_bytes()).await.map_err(|e| e.to_string())?;
    io.flush().await.map_err(|e| e.to_string())?;
    expect_reply(io, timeout_dur).await
}

async fn expect_reply(io: &mut BufReader<TcpStream>, timeout_dur: std::time::Duration) -> Result<(), String> {
    let mut line = String::new();
    let n = timeout(timeout_dur, io.read_line(&mut line))
        .await
        .map_err(|_| "peer response timed out".to_string())?
        .map_err(|e| e.to_string())?;
    if n == 0 {
        return Err("peer closed connection".to_string());
    }
    let code = line.get(0..1).unwrap_or("5");
    if code == "2" || code == "3" {
        Ok(())
    } else {
        Err(format!("peer rejected with: {}", line.trim_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuff_doubles_leading_dot() {
        let body = "--boundary\r\n.not a terminator\r\nmore text";
        let stuffed = dot_stuff(body);
        assert_eq!(stuffed, "--boundary\r\n..not a terminator\r\nmore text");
    }

    #[test]
    fn dot_stuff_leaves_non_dot_lines_unchanged() {
        let body = "line one\r\nline two";
        assert_eq!(dot_stuff(body), "line one\r\nline two");
    }

    #[test]
    fn dot_stuff_handles_a_bare_dot_line() {
        let body = "before\r\n.\r\nafter";
        assert_eq!(dot_stuff(body), "before\r\n..\r\nafter");
    }
}
