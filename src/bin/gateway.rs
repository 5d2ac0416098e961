// ABOUTME: Process entry point — wires every component in SPEC_FULL.md/spec.md §2 and runs until shutdown
// ABOUTME: Binary session server, SMTP-framed MMS server, HTTP admin surface and the Router all run concurrently

use std::sync::Arc;

use clap::Parser;

use gateway::carrier::MockCarrierAdapter;
use gateway::config::{Cli, Settings};
use gateway::conversation::ConversationManager;
use gateway::log;
use gateway::mm4::{Mm4OutboundClient, Mm4Server};
use gateway::quota::QuotaChecker;
use gateway::repository::{
    InMemoryCarrierRepository, InMemoryClientRepository, InMemoryMediaRepository, InMemoryNumberRepository,
    InMemoryUsageRepository,
};
use gateway::router::Router;
use gateway::smpp::{SessionRegistry, SmppServer};
use gateway::transcode::{FfmpegCodec, TranscodePipeline};
use gateway::web::{build_router, AppState};
use gateway::webhook::WebhookDispatcher;

#[tokio::main]
async fn main() {
    log::init();

    let cli = Cli::parse();
    let settings = match Settings::from_cli(&cli) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let client_repo = Arc::new(InMemoryClientRepository::new());
    let number_repo = Arc::new(InMemoryNumberRepository::new());
    let carrier_repo = Arc::new(InMemoryCarrierRepository::new());
    let usage_repo = Arc::new(InMemoryUsageRepository::default());
    let media_repo = Arc::new(InMemoryMediaRepository::default());

    let quota = Arc::new(QuotaChecker::new(usage_repo.clone()));
    let conversation = Arc::new(ConversationManager::new(
        settings.conversation_ack_timeout,
        settings.conversation_idle_ttl,
    ));
    let webhook = Arc::new(WebhookDispatcher::new(settings.webhook_timeout));
    let smpp_registry = SessionRegistry::new();
    let mm4_outbound = Mm4OutboundClient::new(settings.clone());

    let router = Router::new(
        client_repo.clone(),
        number_repo.clone(),
        carrier_repo.clone(),
        usage_repo.clone(),
        quota.clone(),
        conversation.clone(),
        webhook,
        smpp_registry.clone(),
        mm4_outbound,
        settings.clone(),
    );

    // Carrier adapters are a contract only; the reference
    // binary registers the mock so `(to_client=nil)` routing and the
    // end-to-end scenarios in spec §8 are exercisable without a real
    // upstream. A production deployment swaps these for real adapters.
    router.register_carrier(Arc::new(MockCarrierAdapter::new("twilio")));

    let transcode = Arc::new(TranscodePipeline::spawn(settings.clone(), Arc::new(FfmpegCodec), 16));

    let smpp_server = SmppServer::new(
        settings.clone(),
        client_repo.clone(),
        number_repo.clone(),
        router.clone(),
        smpp_registry.clone(),
        conversation.clone(),
    );
    let mm4_server = Mm4Server::new(settings.clone(), client_repo.clone(), router.clone(), transcode.clone());

    let web_state = Arc::new(AppState {
        client_repo: client_repo.clone(),
        number_repo: number_repo.clone(),
        carrier_repo: carrier_repo.clone(),
        usage_repo: usage_repo.clone(),
        media_repo: media_repo.clone(),
        quota,
        conversation: conversation.clone(),
        router: router.clone(),
        smpp_registry,
        settings: settings.clone(),
    });
    let web_app = build_router(web_state);

    let web_listener = match tokio::net::TcpListener::bind(settings.web_listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind web listener on {}: {e}", settings.web_listen);
            std::process::exit(1);
        }
    };
    tracing::info!("http admin & client surface listening on {}", settings.web_listen);

    let router_task = tokio::spawn(router.clone().run());
    let smpp_task = tokio::spawn(async move {
        if let Err(e) = smpp_server.run().await {
            tracing::error!("smpp server stopped: {e}");
        }
    });
    let mm4_task = tokio::spawn(async move {
        if let Err(e) = mm4_server.run().await {
            tracing::error!("mm4 server stopped: {e}");
        }
    });
    let web_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(web_listener, web_app).await {
            tracing::error!("web server stopped: {e}");
        }
    });

    // Background sweepers: idle
    // conversations, the defensive ack-table sweep, and expired media.
    let sweep_conversation = conversation.clone();
    let conversation_sweeper = tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tick.tick().await;
            let dropped = sweep_conversation.sweep_idle().await;
            let stale_acks = sweep_conversation.sweep_stale_ack_table();
            if dropped > 0 || stale_acks > 0 {
                tracing::debug!(dropped, stale_acks, "conversation sweep");
            }
        }
    });
    let media_sweeper = tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tick.tick().await;
            match media_repo.sweep_expired().await {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "media sweep"),
                Ok(_) => {}
                Err(e) => tracing::warn!("media sweep failed: {e}"),
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = router_task => tracing::error!("router task exited unexpectedly"),
        _ = smpp_task => tracing::error!("smpp task exited unexpectedly"),
        _ = mm4_task => tracing::error!("mm4 task exited unexpectedly"),
        _ = web_task => tracing::error!("web task exited unexpectedly"),
    }

    conversation_sweeper.abort();
    media_sweeper.abort();
}
