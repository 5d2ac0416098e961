// ABOUTME: Short-message binary session server per spec §4.5/C5 — the gateway acts as the SMSC
// ABOUTME: Accepts TCP connections and spawns one `session::run` task per peer, mini-redis style

pub mod registry;
pub mod session;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Settings;
use crate::conversation::ConversationManager;
use crate::log::{emit, LogEvent, LogLevel};
use crate::repository::{ClientRepository, NumberRepository};
use crate::router::Router;

pub use registry::SessionRegistry;
use session::SessionDeps;

pub struct SmppServer {
    settings: Arc<Settings>,
    client_repo: Arc<dyn ClientRepository>,
    number_repo: Arc<dyn NumberRepository>,
    router: Arc<Router>,
    registry: Arc<SessionRegistry>,
    conversation: Arc<ConversationManager>,
}

impl SmppServer {
    pub fn new(
        settings: Arc<Settings>,
        client_repo: Arc<dyn ClientRepository>,
        number_repo: Arc<dyn NumberRepository>,
        router: Arc<Router>,
        registry: Arc<SessionRegistry>,
        conversation: Arc<ConversationManager>,
    ) -> Self {
        SmppServer {
            settings,
            client_repo,
            number_repo,
            router,
            registry,
            conversation,
        }
    }

    /// Bind the listen address and accept connections until the process is
    /// shut down. Each connection gets its own task; a slow or wedged peer
    /// never blocks another.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.settings.smpp_listen).await?;
        emit(LogEvent::new(
            LogLevel::Info,
            "smpp_listening",
            format!("smpp listening on {}", self.settings.smpp_listen),
        ));

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let deps = SessionDeps {
                settings: self.settings.clone(),
                client_repo: self.client_repo.clone(),
                number_repo: self.number_repo.clone(),
                router: self.router.clone(),
                registry: self.registry.clone(),
                conversation: self.conversation.clone(),
            };
            tokio::spawn(async move {
                session::run(stream, peer_addr, deps).await;
            });
        }
    }
}
