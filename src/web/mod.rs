// ABOUTME: HTTP admin & client surface — axum router + shared state
// ABOUTME: Admin CRUD is a reference implementation only; send/usage/media are load-bearing

mod auth;
mod handlers;
mod routes;

use std::sync::Arc;

use crate::config::Settings;
use crate::conversation::ConversationManager;
use crate::quota::QuotaChecker;
use crate::repository::{CarrierRepository, ClientRepository, MediaRepository, NumberRepository, UsageRepository};
use crate::router::Router;
use crate::smpp::SessionRegistry;

pub use routes::build_router;

/// Shared state threaded through every handler via axum's `State` extractor,
/// matching `hdds-gateway`'s `AppState` shape.
pub struct AppState {
    pub client_repo: Arc<dyn ClientRepository>,
    pub number_repo: Arc<dyn NumberRepository>,
    pub carrier_repo: Arc<dyn CarrierRepository>,
    pub usage_repo: Arc<dyn UsageRepository>,
    pub media_repo: Arc<dyn MediaRepository>,
    pub quota: Arc<QuotaChecker>,
    pub conversation: Arc<ConversationManager>,
    pub router: Arc<Router>,
    pub smpp_registry: Arc<SessionRegistry>,
    pub settings: Arc<Settings>,
}
