// ABOUTME: axum route table for the HTTP admin & client surface
// ABOUTME: mirrors hdds-gateway's routes.rs/handlers.rs split with CORS + trace layers

use std::sync::Arc;

use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/clients", post(handlers::create_client).get(handlers::list_clients))
        .route("/clients/:id", delete(handlers::delete_client))
        .route("/clients/:id/password", patch(handlers::patch_client_password))
        .route(
            "/clients/:id/settings",
            get(handlers::get_client_settings).put(handlers::put_client_settings),
        )
        .route(
            "/clients/:id/numbers",
            post(handlers::create_number).get(handlers::list_client_numbers),
        )
        .route(
            "/clients/:id/numbers/:nid",
            get(handlers::get_number).put(handlers::put_number).delete(handlers::delete_number),
        )
        .route(
            "/numbers/:id/settings",
            get(handlers::get_number_settings).put(handlers::put_number_settings),
        )
        .route("/carriers", post(handlers::create_carrier).get(handlers::list_carriers))
        .route("/clients/reload", post(handlers::reload_clients))
        .route("/carriers/reload", post(handlers::reload_carriers))
        .route("/messages/send", post(handlers::send_message))
        .route("/messages/usage", get(handlers::messages_usage))
        .route("/inbound/:carrier", post(handlers::inbound_carrier))
        .route("/media/:id", get(handlers::fetch_media))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::conversation::ConversationManager;
    use crate::quota::QuotaChecker;
    use crate::repository::{
        ClientRepository, InMemoryCarrierRepository, InMemoryClientRepository, InMemoryMediaRepository,
        InMemoryNumberRepository, InMemoryUsageRepository,
    };
    use crate::router::{Mm4Outbound, Router as GatewayRouter, SmppOutbound};
    use crate::smpp::SessionRegistry;
    use crate::webhook::WebhookDispatcher;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct NoopSmppOutbound;
    #[async_trait]
    impl SmppOutbound for NoopSmppOutbound {
        async fn has_active_session(&self, _username: &str) -> bool {
            false
        }
        async fn send(&self, _username: &str, _envelope: &crate::envelope::Envelope) -> Result<(), String> {
            Err("no active session".into())
        }
    }

    struct NoopMm4Outbound;
    #[async_trait]
    impl Mm4Outbound for NoopMm4Outbound {
        async fn send(&self, _client: &crate::domain::Client, _envelope: &crate::envelope::Envelope) -> Result<(), String> {
            Err("not configured".into())
        }
    }

    fn test_state() -> Arc<AppState> {
        let settings = Arc::new(Settings::for_tests());
        let client_repo = Arc::new(InMemoryClientRepository::new());
        let number_repo = Arc::new(InMemoryNumberRepository::new());
        let carrier_repo = Arc::new(InMemoryCarrierRepository::new());
        let usage_repo = Arc::new(InMemoryUsageRepository::default());
        let media_repo = Arc::new(InMemoryMediaRepository::default());
        let quota = Arc::new(QuotaChecker::new(usage_repo.clone()));
        let conversation = Arc::new(ConversationManager::new(settings.conversation_ack_timeout, settings.conversation_idle_ttl));
        let webhook = Arc::new(WebhookDispatcher::new(settings.webhook_timeout));
        let router = GatewayRouter::new(
            client_repo.clone(),
            number_repo.clone(),
            carrier_repo.clone(),
            usage_repo.clone(),
            quota.clone(),
            conversation.clone(),
            webhook,
            Arc::new(NoopSmppOutbound),
            Arc::new(NoopMm4Outbound),
            settings.clone(),
        );
        Arc::new(AppState {
            client_repo,
            number_repo,
            carrier_repo,
            usage_repo,
            media_repo,
            quota,
            conversation,
            router,
            smpp_registry: SessionRegistry::new(),
            settings,
        })
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn send_without_auth_is_rejected() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/messages/send")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"from":"+1","to":"+2","text":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_with_valid_auth_is_queued() {
        let state = test_state();
        let client = crate::domain::Client {
            id: 1,
            username: "bicom".into(),
            password_encrypted: "secret".into(),
            name: "Bicom".into(),
            address: None,
            client_type: crate::domain::ClientType::Web,
            timezone: None,
            settings: crate::domain::ClientSettings::default(),
        };
        state.client_repo.upsert(client).await.unwrap();
        state.client_repo.reload().await.unwrap();

        let token = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"bicom:secret");
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/messages/send")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Basic {token}"))
                    .body(Body::from(r#"{"from":"+12505551234","to":"+14155559876","text":"Hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
