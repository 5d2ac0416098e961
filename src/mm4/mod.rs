// ABOUTME: SMTP-framed MMS relay per spec §4.6/C6 — the gateway accepts inbound MM4 peers and drives outbound to legacy peers
// ABOUTME: One task per TCP connection, matching the accept-loop shape of the short-message session server

mod mime;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::domain::Client;
use crate::envelope::Envelope;
use crate::log::{emit, LogEvent, LogLevel};
use crate::repository::ClientRepository;
use crate::router::{Mm4Outbound, Router};
use crate::transcode::TranscodePipeline;

use session::SessionDeps;

pub struct Mm4Server {
    settings: Arc<Settings>,
    client_repo: Arc<dyn ClientRepository>,
    router: Arc<Router>,
    transcode: Arc<TranscodePipeline>,
}

impl Mm4Server {
    pub fn new(
        settings: Arc<Settings>,
        client_repo: Arc<dyn ClientRepository>,
        router: Arc<Router>,
        transcode: Arc<TranscodePipeline>,
    ) -> Self {
        Mm4Server {
            settings,
            client_repo,
            router,
            transcode,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.settings.mm4_listen).await?;
        emit(LogEvent::new(
            LogLevel::Info,
            "mm4_listening",
            format!("mm4 listening on {}", self.settings.mm4_listen),
        ));

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let deps = SessionDeps {
                settings: self.settings.clone(),
                client_repo: self.client_repo.clone(),
                router: self.router.clone(),
                transcode: self.transcode.clone(),
            };
            tokio::spawn(async move {
                session::run(stream, peer_addr, deps).await;
            });
        }
    }
}

/// Outbound MM4 delivery to a legacy peer.
pub struct Mm4OutboundClient {
    settings: Arc<Settings>,
}

impl Mm4OutboundClient {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Mm4OutboundClient { settings })
    }
}

#[async_trait]
impl Mm4Outbound for Mm4OutboundClient {
    async fn send(&self, client: &Client, envelope: &Envelope) -> Result<(), String> {
        session::send_outbound(&self.settings, client, envelope).await
    }
}
