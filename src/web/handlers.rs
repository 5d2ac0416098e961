// ABOUTME: HTTP handlers for the admin & client surface
// ABOUTME: /messages/send, /messages/usage, /inbound/{carrier}, /media/{id} are real; admin CRUD is a reference impl

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::carrier::CarrierAdapter;
use crate::domain::{Carrier, CarrierType, Client, ClientSettings, ClientType, Number, NumberLimitOverrides};
use crate::envelope::{Envelope, FileAttachment, MessageKind};
use crate::log::{emit, LogEvent, LogLevel};

use super::auth::{api_key_ok, credentials_match, extract_credentials};
use super::AppState;

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    fn status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

fn unauthorized(msg: impl Into<String>) -> Response {
    ApiError { error: msg.into() }.status(StatusCode::UNAUTHORIZED)
}

fn not_found(msg: impl Into<String>) -> Response {
    ApiError { error: msg.into() }.status(StatusCode::NOT_FOUND)
}

fn bad_request(msg: impl Into<String>) -> Response {
    ApiError { error: msg.into() }.status(StatusCode::BAD_REQUEST)
}

// ---------------------------------------------------------------------
// GET /health, GET /stats
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

pub async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

#[derive(Serialize)]
struct StatsBody {
    active_smpp_sessions: usize,
    conversation_idle_swept_total: usize,
}

pub async fn stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !api_key_ok(&headers, state.settings.api_key.as_deref()) {
        return unauthorized("invalid or missing API key");
    }
    let swept = state.conversation.sweep_stale_ack_table();
    Json(StatsBody {
        active_smpp_sessions: state.smpp_registry.active_session_count(),
        conversation_idle_swept_total: swept,
    })
    .into_response()
}

// ---------------------------------------------------------------------
// POST /messages/send, GET /messages/usage
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub log_id: String,
    pub status: &'static str,
}

/// Parse a `data:<mime>;base64,<payload>` URL into a `FileAttachment`
///. URLs that
/// are not inline data (a real CDN reference) are carried through as a
/// zero-byte placeholder with the URL as the filename; carrier adapters are
/// contractually required to tolerate either shape.
fn parse_media_url(url: &str, index: usize) -> FileAttachment {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((header, payload)) = rest.split_once(',') {
            let mime = header.split(';').next().unwrap_or("application/octet-stream");
            if header.ends_with(";base64") {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(payload) {
                    return FileAttachment::new(format!("media-{index}"), mime, bytes);
                }
            }
        }
    }
    FileAttachment::new(url.to_string(), "application/octet-stream", Vec::new())
}

/// `POST /messages/send`. Client auth is HTTP Basic or Bearer
/// `base64(user:pass)`. Quota/routing happens
/// asynchronously in the Router once the envelope is enqueued — spec S4's
/// "HTTP 200 accepting nothing" on over-quota means this handler always
/// returns 200 once the request is well-formed and authenticated; the drop
/// itself is a Router-side, log-only decision.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Response {
    let Some(creds) = extract_credentials(&headers) else {
        return unauthorized("missing Authorization header");
    };
    let client = match state.client_repo.by_username(&creds.username).await {
        Ok(Some(c)) if credentials_match(&c, &creds) => c,
        _ => return unauthorized("invalid client credentials"),
    };

    let kind = if req.media_urls.is_empty() {
        MessageKind::Sms
    } else {
        MessageKind::Mms
    };
    let mut envelope = Envelope::new(req.to, req.from, kind).with_text(req.text);
    envelope.files = req
        .media_urls
        .iter()
        .enumerate()
        .map(|(i, url)| parse_media_url(url, i))
        .collect();

    emit(LogEvent::new(
        LogLevel::Info,
        "rest_send_accepted",
        format!("client={} kind={:?}", client.username, envelope.kind),
    )
    .with_log_id(envelope.log_id.clone())
    .with_client(client.id));

    let log_id = envelope.log_id.clone();
    state.router.submit_client_origin(envelope);

    (StatusCode::OK, Json(SendResponse { log_id, status: "queued" })).into_response()
}

#[derive(Serialize)]
pub struct UsageWindowBody {
    pub kind: &'static str,
    pub period: &'static str,
    pub used: u32,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct UsageResponse {
    pub windows: Vec<UsageWindowBody>,
}

/// `GET /messages/usage` — the client's own rolling-window
/// consumption, built on `QuotaChecker::usage_summary`.
pub async fn messages_usage(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(creds) = extract_credentials(&headers) else {
        return unauthorized("missing Authorization header");
    };
    let client = match state.client_repo.by_username(&creds.username).await {
        Ok(Some(c)) if credentials_match(&c, &creds) => c,
        _ => return unauthorized("invalid client credentials"),
    };
    let summary = state.quota.usage_summary(&client, None).await;
    Json(UsageResponse {
        windows: summary
            .windows
            .into_iter()
            .map(|w| UsageWindowBody {
                kind: w.kind,
                period: w.period,
                used: w.used,
                limit: w.limit,
            })
            .collect(),
    })
    .into_response()
}

// ---------------------------------------------------------------------
// POST /inbound/{carrier}
// ---------------------------------------------------------------------

/// `POST /inbound/{carrier}` — a carrier's webhook,
/// delegated to the matching registered `CarrierAdapter::inbound`. Parsed
/// envelopes are carrier-origin (they never consume the receiving client's
/// quota, spec §4.8 rationale).
pub async fn inbound_carrier(
    State(state): State<Arc<AppState>>,
    Path(carrier): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let Some(adapter) = state.router.carriers.get(&carrier).map(|e| e.clone()) else {
        return not_found(format!("unknown carrier: {carrier}"));
    };
    match adapter.inbound(&body).await {
        Ok(result) => {
            for envelope in result.envelopes {
                state.router.submit_carrier_origin(envelope);
            }
            (StatusCode::OK, Json(result.ack_body)).into_response()
        }
        Err(e) => {
            emit(LogEvent::new(LogLevel::Warn, "carrier_inbound_failed", e.to_string()));
            bad_request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------
// GET /media/{id}
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MediaQuery {
    key: Option<String>,
}

/// `GET /media/{id}`. Reference
/// implementation: the shared secret is the configured `API_KEY` passed as
/// `?key=`, not a full per-resource HMAC signature — a production
/// deployment would sign each URL (e.g. with an HMAC over id+expiry); that
/// scheme is out of scope here the same way persistence is.
pub async fn fetch_media(
    State(state): State<Arc<AppState>>,
    Path(id): Path<uuid::Uuid>,
    Query(query): Query<MediaQuery>,
) -> Response {
    if let Some(expected) = state.settings.api_key.as_deref() {
        if query.key.as_deref() != Some(expected) {
            return unauthorized("invalid or missing signature");
        }
    }
    match state.media_repo.get(id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, record.mime.clone())],
            record.bytes.clone(),
        )
            .into_response(),
        Ok(None) => not_found("media not found or expired"),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ---------------------------------------------------------------------
// Admin CRUD — reference implementation only:
// never a production backend, just enough to exercise the repository
// traits and the admin-reload contract end to end.
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateClientRequest {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub name: String,
    pub address: Option<String>,
    pub client_type: ClientType,
}

pub async fn create_client(State(state): State<Arc<AppState>>, Json(req): Json<CreateClientRequest>) -> Response {
    let client = Client {
        id: req.id,
        username: req.username,
        password_encrypted: req.password,
        name: req.name,
        address: req.address,
        client_type: req.client_type,
        timezone: None,
        settings: ClientSettings::default(),
    };
    match state.client_repo.upsert(client).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn list_clients(State(state): State<Arc<AppState>>) -> Response {
    match state.client_repo.list().await {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn delete_client(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.client_repo.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Deserialize)]
pub struct PasswordPatch {
    pub password: String,
}

pub async fn patch_client_password(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PasswordPatch>,
) -> Response {
    let Ok(Some(mut client)) = state.client_repo.by_id(id).await else {
        return not_found("client not found");
    };
    client.password_encrypted = req.password;
    match state.client_repo.upsert(client).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn get_client_settings(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.client_repo.by_id(id).await {
        Ok(Some(client)) => Json(client.settings).into_response(),
        Ok(None) => not_found("client not found"),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn put_client_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(settings): Json<ClientSettings>,
) -> Response {
    let Ok(Some(mut client)) = state.client_repo.by_id(id).await else {
        return not_found("client not found");
    };
    client.settings = settings;
    match state.client_repo.upsert(client).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Deserialize)]
pub struct CreateNumberRequest {
    pub id: i64,
    pub e164: String,
    pub carrier_name: String,
    pub tag: Option<String>,
    pub group: Option<String>,
    pub webhook_url: Option<String>,
}

pub async fn create_number(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<i64>,
    Json(req): Json<CreateNumberRequest>,
) -> Response {
    let number = Number {
        id: req.id,
        client_id,
        e164: req.e164,
        carrier_name: req.carrier_name,
        tag: req.tag,
        group: req.group,
        webhook_url: req.webhook_url,
        suppress_stop_autoreply: false,
        limits: NumberLimitOverrides::default(),
    };
    match state.number_repo.upsert(number).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn list_client_numbers(State(state): State<Arc<AppState>>, Path(client_id): Path<i64>) -> Response {
    match state.number_repo.for_client(client_id).await {
        Ok(numbers) => Json(numbers).into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn get_number(State(state): State<Arc<AppState>>, Path((_client_id, number_id)): Path<(i64, i64)>) -> Response {
    match state.number_repo.by_id(number_id).await {
        Ok(Some(number)) => Json(number).into_response(),
        Ok(None) => not_found("number not found"),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn put_number(
    State(state): State<Arc<AppState>>,
    Path((client_id, number_id)): Path<(i64, i64)>,
    Json(req): Json<CreateNumberRequest>,
) -> Response {
    let number = Number {
        id: number_id,
        client_id,
        e164: req.e164,
        carrier_name: req.carrier_name,
        tag: req.tag,
        group: req.group,
        webhook_url: req.webhook_url,
        suppress_stop_autoreply: false,
        limits: NumberLimitOverrides::default(),
    };
    match state.number_repo.upsert(number).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn delete_number(State(state): State<Arc<AppState>>, Path((_client_id, number_id)): Path<(i64, i64)>) -> Response {
    match state.number_repo.delete(number_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn get_number_settings(State(state): State<Arc<AppState>>, Path(number_id): Path<i64>) -> Response {
    match state.number_repo.by_id(number_id).await {
        Ok(Some(number)) => Json(number.limits).into_response(),
        Ok(None) => not_found("number not found"),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn put_number_settings(
    State(state): State<Arc<AppState>>,
    Path(number_id): Path<i64>,
    Json(limits): Json<NumberLimitOverrides>,
) -> Response {
    let Ok(Some(mut number)) = state.number_repo.by_id(number_id).await else {
        return not_found("number not found");
    };
    number.limits = limits;
    match state.number_repo.upsert(number).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Deserialize)]
pub struct CreateCarrierRequest {
    pub id: i64,
    pub name: String,
    pub carrier_type: CarrierType,
    pub credentials: String,
    pub profile_id: Option<String>,
}

pub async fn create_carrier(State(state): State<Arc<AppState>>, Json(req): Json<CreateCarrierRequest>) -> Response {
    let carrier = Carrier {
        id: req.id,
        name: req.name,
        carrier_type: req.carrier_type,
        credentials_encrypted: req.credentials,
        profile_id: req.profile_id,
    };
    match state.carrier_repo.upsert(carrier).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn list_carriers(State(state): State<Arc<AppState>>) -> Response {
    match state.carrier_repo.list().await {
        Ok(carriers) => Json(carriers).into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// `POST /clients/reload` / `POST /carriers/reload`.
pub async fn reload_clients(State(state): State<Arc<AppState>>) -> Response {
    match state.client_repo.reload().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn reload_carriers(State(state): State<Arc<AppState>>) -> Response {
    match state.carrier_repo.reload().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => ApiError { error: e.to_string() }.status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
