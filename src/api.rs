//! Token-scoped HTTP API.
//!
//! Every route accepts the tenant token as a path segment, a `token`
//! query parameter, or the `X-QUEPASA-TOKEN` header, in that priority
//! order. `/health` additionally accepts an `X-QUEPASA-USER` +
//! `X-QUEPASA-PASSWORD` pair, scoped to that user's servers. Master
//! operations take `X-QUEPASA-MASTERKEY` or a `masterkey`
//! query parameter. Success bodies are `{"success": true, "status": ..}`
//! envelopes; failures are `{"success": false, "error": ..}` with the
//! status code derived from the error class.

use crate::history;
use crate::presence::PresenceKind;
use crate::qr;
use crate::service::GatewayService;
use crate::tenant::{SendRequest, Tenant};
use axum::body::{Body, Bytes};
use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quepasa_core::error::QpError;
use quepasa_core::message::Poll;
use quepasa_core::options::TriState;
use quepasa_core::state::ConnectionState;
use quepasa_core::wcl::{
    ContactInfo, MarkReadType, ParticipantsAction, QrItem, SendAttachment,
};
use quepasa_dispatch::{DispatchSubscription, SubscriberKind};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tracing::info;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub(crate) type ApiError = (StatusCode, Json<Value>);
pub(crate) type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<GatewayService>,
    /// Outbound fetcher for `/sendurl`.
    fetcher: reqwest::Client,
}

impl ApiState {
    pub fn new(service: Arc<GatewayService>) -> Result<Self, QpError> {
        let fetcher = reqwest::Client::builder()
            .timeout(Duration::from_secs(service.config.http.api_timeout))
            .build()
            .map_err(|e| QpError::Internal(format!("http client: {e}")))?;
        Ok(Self { service, fetcher })
    }

    /// Token resolution: path, then query, then header.
    fn token_of(
        params: &HashMap<String, String>,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Option<String> {
        params
            .get("token")
            .cloned()
            .or_else(|| query.get("token").cloned())
            .or_else(|| {
                headers
                    .get("x-quepasa-token")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .filter(|t| !t.is_empty())
    }

    fn master_key_of(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-quepasa-masterkey")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query.get("masterkey").cloned())
    }

    pub(crate) fn require_tenant(
        &self,
        params: &HashMap<String, String>,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<Arc<Tenant>, ApiError> {
        let token = Self::token_of(params, query, headers)
            .ok_or_else(|| fail(QpError::Auth("missing token".to_string())))?;
        self.service
            .find(&token)
            .ok_or_else(|| fail(QpError::NotFound(format!("server {token}"))))
    }

    fn require_master(
        &self,
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<(), ApiError> {
        self.service
            .check_master_key(Self::master_key_of(query, headers).as_deref())
            .map_err(fail)
    }
}

// ----------------------------------------------------------------------
// Envelopes
// ----------------------------------------------------------------------

pub(crate) fn status_for(err: &QpError) -> StatusCode {
    match err {
        QpError::NotFound(_) => StatusCode::NOT_FOUND,
        QpError::Auth(_) => StatusCode::UNAUTHORIZED,
        QpError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        QpError::Input(_) => StatusCode::BAD_REQUEST,
        QpError::Transport(_) | QpError::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn fail(err: QpError) -> ApiError {
    (
        status_for(&err),
        Json(json!({"success": false, "error": err.to_string()})),
    )
}

pub(crate) fn bad_request(detail: impl Into<String>) -> ApiError {
    fail(QpError::Input(detail.into()))
}

pub(crate) fn server_json(tenant: &Tenant) -> Value {
    let timestamps = tenant.timestamps();
    json!({
        "token": tenant.token,
        "wid": tenant.wid(),
        "user": tenant.user,
        "verified": tenant.verified(),
        "devel": tenant.devel(),
        "state": tenant.state(),
        "healthy": tenant.is_healthy(),
        "options": tenant.options(),
        "created": timestamps.created.map(|t| t.to_rfc3339()),
        "updated": timestamps.update.map(|t| t.to_rfc3339()),
    })
}

fn contact_json(contact: &ContactInfo) -> Value {
    json!({
        "jid": contact.jid,
        "fullname": contact.full_name,
        "pushname": contact.push_name,
        "businessname": contact.business_name,
        "firstname": contact.first_name,
    })
}

fn path_value<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| bad_request(format!("missing path parameter {key}")))
}

fn normalize(chat: &str) -> Result<String, ApiError> {
    quepasa_core::jid::normalize_chat_id(chat).map_err(|e| fail(QpError::Input(e)))
}

// ----------------------------------------------------------------------
// Health & environment
// ----------------------------------------------------------------------

async fn health(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    if state.require_master(&query, &headers).is_ok() {
        let items = state.service.health();
        let healthy = items.iter().filter(|i| i.healthy).count();
        return Json(json!({
            "success": true,
            "status": if healthy == items.len() { "healthy" } else { "degraded" },
            "items": items,
            "stats": {"total": items.len(), "healthy": healthy},
        }));
    }
    // User credentials scope the report to that user's own tenants.
    let user = headers
        .get("x-quepasa-user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let password = headers
        .get("x-quepasa-password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !user.is_empty() && !password.is_empty() {
        return match state.service.store.authenticate(user, password).await {
            Ok(account) => {
                let items = state.service.health_for_user(&account.username);
                let healthy = items.iter().filter(|i| i.healthy).count();
                Json(json!({
                    "success": true,
                    "status": if healthy == items.len() { "healthy" } else { "degraded" },
                    "items": items,
                    "stats": {"total": items.len(), "healthy": healthy},
                }))
            }
            Err(e) => Json(json!({"success": false, "status": e.to_string()})),
        };
    }
    if let Ok(tenant) = state.require_tenant(&params, &query, &headers) {
        return Json(json!({
            "success": true,
            "status": tenant.state(),
            "healthy": tenant.is_healthy(),
        }));
    }
    // Unauthenticated probes get a 200 preview, never an enumeration.
    Json(json!({"success": true, "status": "preview"}))
}

async fn environment(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    if state.require_master(&query, &headers).is_err() {
        return Json(json!({"success": true, "status": "preview"}));
    }
    let config = &state.service.config;
    Json(json!({
        "success": true,
        "status": "environment",
        "environment": {
            "host": config.http.host,
            "port": config.http.port,
            "apiprefix": config.http.api_prefix,
            "apitimeout": config.http.api_timeout,
            "webhooktimeout": config.http.webhook_timeout,
            "cachelength": config.cache.length,
            "cachedays": config.cache.days,
            "synopsislength": config.cache.synopsis_length,
            "historysyncdays": config.whatsapp.history_sync_days,
            "wakeuphour": config.whatsapp.wakeup_hour,
            "wakeupduration": config.whatsapp.wakeup_duration,
            "accountsetup": config.auth.account_setup,
            "spamendpoint": config.auth.spam_endpoint,
        },
    }))
}

// ----------------------------------------------------------------------
// Server info
// ----------------------------------------------------------------------

async fn get_info(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // A master-authenticated miss is a diagnostic 204, distinguishing
    // "no such server" from a bad key.
    if state.require_master(&query, &headers).is_ok() {
        let found = ApiState::token_of(&params, &query, &headers)
            .and_then(|token| state.service.find(&token));
        return match found {
            Some(tenant) => Ok(Json(json!({
                "success": true,
                "status": "server info",
                "server": server_json(&tenant),
            }))
            .into_response()),
            None => Ok(StatusCode::NO_CONTENT.into_response()),
        };
    }

    let tenant = state.require_tenant(&params, &query, &headers)?;
    Ok(Json(json!({
        "success": true,
        "status": "server info",
        "server": server_json(&tenant),
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CreateBody {
    #[serde(default)]
    user: String,
    token: Option<String>,
}

async fn create_info(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.require_master(&query, &headers)?;
    if body.user.trim().is_empty() {
        return Err(bad_request("missing user"));
    }
    let tenant = state
        .service
        .create_tenant(body.user.trim(), body.token)
        .await
        .map_err(fail)?;
    info!("server {} created for {}", tenant.token, tenant.user);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "status": "server created",
            "server": server_json(&tenant),
        })),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct PatchBody {
    groups: Option<TriState>,
    direct: Option<TriState>,
    broadcasts: Option<TriState>,
    #[serde(rename = "readreceipts")]
    read_receipts: Option<TriState>,
    calls: Option<TriState>,
    #[serde(rename = "readupdate")]
    read_update: Option<TriState>,
    devel: Option<bool>,
}

async fn patch_info(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PatchBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;

    let mut options = tenant.options();
    if let Some(v) = body.groups {
        options.groups = v;
    }
    if let Some(v) = body.direct {
        options.direct = v;
    }
    if let Some(v) = body.broadcasts {
        options.broadcasts = v;
    }
    if let Some(v) = body.read_receipts {
        options.read_receipts = v;
    }
    if let Some(v) = body.calls {
        options.calls = v;
    }
    if let Some(v) = body.read_update {
        options.read_update = v;
    }
    tenant.set_options(options);
    if let Some(devel) = body.devel {
        if devel != tenant.devel() {
            tenant.toggle_devel();
        }
    }
    state.service.persist(&tenant).await.map_err(fail)?;

    Ok(Json(json!({
        "success": true,
        "status": "server updated",
        "server": server_json(&tenant),
    })))
}

async fn delete_info(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    state.service.delete_tenant(&tenant.token).await.map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "server deleted"})))
}

// ----------------------------------------------------------------------
// Pairing
// ----------------------------------------------------------------------

async fn scan(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    if tenant.state() == ConnectionState::Ready {
        return Err(bad_request("already connected; stop the server to re-pair"));
    }
    if tenant.client().is_none() {
        state
            .service
            .start_tenant(&tenant.token)
            .await
            .map_err(fail)?;
    }
    let client = tenant
        .client()
        .ok_or_else(|| fail(QpError::NotReady(tenant.state().to_string())))?;

    let mut codes = client.qr_channel().await.map_err(fail)?;
    match codes.recv().await {
        Some(QrItem::Code(code)) => {
            let png = qr::generate_qr_image(&code).map_err(fail)?;
            Ok(Json(json!({
                "success": true,
                "status": "scan the code with the device",
                "qrcode": BASE64.encode(png),
            })))
        }
        _ => Err(fail(QpError::NotReady("qr code timed out".to_string()))),
    }
}

async fn paircode(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let phone = query
        .get("phone")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("missing phone"))?;

    if tenant.client().is_none() {
        state
            .service
            .start_tenant(&tenant.token)
            .await
            .map_err(fail)?;
    }
    let client = tenant
        .client()
        .ok_or_else(|| fail(QpError::NotReady(tenant.state().to_string())))?;
    let code = client.pair_phone(phone).await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": "enter the code on the device",
        "code": code,
    })))
}

// ----------------------------------------------------------------------
// Command
// ----------------------------------------------------------------------

pub(crate) fn toggled(current: TriState) -> TriState {
    match current {
        TriState::True => TriState::False,
        _ => TriState::True,
    }
}

async fn command(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let action = query
        .get("action")
        .map(|a| a.to_ascii_lowercase())
        .unwrap_or_default();

    match action.as_str() {
        "start" => {
            state
                .service
                .start_tenant(&tenant.token)
                .await
                .map_err(fail)?;
            Ok(Json(json!({
                "success": true,
                "status": "starting",
                "state": tenant.state(),
            })))
        }
        "stop" => {
            state
                .service
                .stop_tenant(&tenant.token, "api request")
                .await
                .map_err(fail)?;
            Ok(Json(json!({
                "success": true,
                "status": "stopped",
                "state": tenant.state(),
            })))
        }
        "restart" => {
            state
                .service
                .restart_tenant(&tenant.token)
                .await
                .map_err(fail)?;
            Ok(Json(json!({
                "success": true,
                "status": "restarting",
                "state": tenant.state(),
            })))
        }
        "status" => Ok(Json(json!({
            "success": true,
            "status": tenant.state(),
            "healthy": tenant.is_healthy(),
            "server": server_json(&tenant),
        }))),
        "groups" | "broadcasts" | "readreceipts" | "calls" => {
            let mut options = tenant.options();
            let new = match action.as_str() {
                "groups" => {
                    options.groups = toggled(options.groups);
                    options.groups
                }
                "broadcasts" => {
                    options.broadcasts = toggled(options.broadcasts);
                    options.broadcasts
                }
                "readreceipts" => {
                    options.read_receipts = toggled(options.read_receipts);
                    options.read_receipts
                }
                _ => {
                    options.calls = toggled(options.calls);
                    options.calls
                }
            };
            tenant.set_options(options);
            state.service.persist(&tenant).await.map_err(fail)?;
            Ok(Json(json!({
                "success": true,
                "status": format!("{action} is now {new}"),
                "options": tenant.options(),
            })))
        }
        "" => Err(bad_request("missing action")),
        other => Err(bad_request(format!("unknown action: {other}"))),
    }
}

// ----------------------------------------------------------------------
// Receive
// ----------------------------------------------------------------------

async fn receive(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;

    let since = query
        .get("timestamp")
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<i64>())
        .transpose()
        .map_err(|_| bad_request("timestamp must be unix seconds"))?;
    let dispatch_error = query
        .get("dispatcherror")
        .map(|t| TriState::parse(t))
        .transpose()
        .map_err(|e| fail(QpError::Input(e)))?;

    let mut messages = tenant.cache.list();
    messages.reverse();
    if let Some(since) = since {
        messages.retain(|m| m.timestamp.timestamp() > since);
    }
    if let Some(filter) = dispatch_error {
        if filter.is_set() {
            let want = filter.to_bool(false);
            messages.retain(|m| m.has_dispatch_error() == want);
        }
    }

    Ok(Json(json!({
        "success": true,
        "status": format!("{} messages", messages.len()),
        "server": server_json(&tenant),
        "messages": messages,
    })))
}

// ----------------------------------------------------------------------
// Send family
// ----------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SendBody {
    #[serde(rename = "chatid", default)]
    pub(crate) chat_id: String,
    #[serde(default)]
    text: String,
    #[serde(rename = "trackid", default)]
    track_id: String,
    #[serde(rename = "inreply")]
    in_reply: Option<String>,
    poll: Option<Poll>,
    /// `/sendurl` source.
    url: Option<String>,
    /// Base-64 payload for the encoded variants.
    content: Option<String>,
    mime: Option<String>,
    #[serde(rename = "filename")]
    file_name: Option<String>,
    #[serde(default)]
    ptt: bool,
    seconds: Option<u32>,
}

impl SendBody {
    pub(crate) fn decoded_attachment(&self) -> Result<Option<SendAttachment>, ApiError> {
        let Some(content) = &self.content else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(content)
            .map_err(|e| bad_request(format!("content is not base64: {e}")))?;
        Ok(Some(SendAttachment {
            mime: self
                .mime
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            file_name: self.file_name.clone(),
            content: bytes,
            ptt: self.ptt,
            seconds: self.seconds,
        }))
    }
}

pub(crate) async fn deliver(
    tenant: &Tenant,
    chat_id: String,
    body: SendBody,
    attachment: Option<SendAttachment>,
) -> ApiResult {
    if chat_id.trim().is_empty() {
        return Err(bad_request("missing chatid"));
    }
    if body.text.is_empty() && attachment.is_none() && body.poll.is_none() {
        return Err(bad_request("nothing to send"));
    }
    let message = tenant
        .send(SendRequest {
            chat_id,
            text: body.text,
            track_id: body.track_id,
            attachment,
            poll: body.poll,
            in_reply_id: body.in_reply,
        })
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": "sent",
        "message": message,
    })))
}

async fn send(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let attachment = body.decoded_attachment()?;
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, attachment).await
}

async fn send_to_chat(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let chat_id = path_value(&params, "chatid")?.to_string();
    let attachment = body.decoded_attachment()?;
    deliver(&tenant, chat_id, body, attachment).await
}

async fn send_url(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let url = body
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| bad_request("missing url"))?;

    let response = state
        .fetcher
        .get(&url)
        .send()
        .await
        .map_err(|e| fail(QpError::Upstream(format!("fetch {url}: {e}"))))?;
    if !response.status().is_success() {
        return Err(fail(QpError::Upstream(format!(
            "fetch {url}: status {}",
            response.status()
        ))));
    }
    let header_mime = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(';').next())
        .map(|s| s.trim().to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|e| fail(QpError::Upstream(format!("fetch {url}: {e}"))))?
        .to_vec();

    let mime = header_mime
        .or_else(|| history::sniff_mime(&bytes).map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let file_name = body.file_name.clone().or_else(|| {
        url.split('?')
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    });

    let attachment = Some(SendAttachment {
        mime,
        file_name,
        content: bytes,
        ptt: body.ptt,
        seconds: body.seconds,
    });
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, attachment).await
}

async fn send_encoded(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let attachment = body
        .decoded_attachment()?
        .ok_or_else(|| bad_request("missing content"))?;
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, Some(attachment)).await
}

// Same wire shape as `/sendencoded`; kept as its own route for callers
// that distinguish documents.
async fn send_document(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let attachment = body
        .decoded_attachment()?
        .ok_or_else(|| bad_request("missing content"))?;
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, Some(attachment)).await
}

async fn send_binary(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let chat_id = path_value(&params, "chatid")?.to_string();
    let file_name = path_value(&params, "filename")?.to_string();
    if bytes.is_empty() {
        return Err(bad_request("empty body"));
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(';').next())
        .map(|s| s.trim().to_string())
        .or_else(|| history::sniff_mime(&bytes).map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let attachment = Some(SendAttachment {
        mime,
        file_name: Some(file_name),
        content: bytes.to_vec(),
        ptt: false,
        seconds: None,
    });
    deliver(&tenant, chat_id, SendBody::default(), attachment).await
}

// ----------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------

async fn get_message(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let id = path_value(&params, "id")?;
    let message = tenant
        .cache
        .get(id)
        .ok_or_else(|| fail(QpError::NotFound(format!("message {id}"))))?;
    Ok(Json(json!({
        "success": true,
        "status": "message found",
        "message": message,
    })))
}

/// Revoke for everyone, then drop the cache entry.
async fn delete_message(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let id = path_value(&params, "id")?;
    let message = tenant
        .cache
        .get(id)
        .ok_or_else(|| fail(QpError::NotFound(format!("message {id}"))))?;

    let client = tenant.require_ready().map_err(fail)?;
    client
        .revoke(
            &message.chat.id,
            &message.id,
            message.participant.as_ref().map(|p| p.id.as_str()),
        )
        .await
        .map_err(fail)?;
    tenant.cache.remove(id);
    Ok(Json(json!({"success": true, "status": "message revoked"})))
}

#[derive(Debug, Deserialize)]
struct EditBody {
    id: String,
    text: String,
}

async fn edit_message(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<EditBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let message = tenant
        .cache
        .get(&body.id)
        .ok_or_else(|| fail(QpError::NotFound(format!("message {}", body.id))))?;

    let client = tenant.require_ready().map_err(fail)?;
    client
        .edit(&message.chat.id, &message.id, &body.text)
        .await
        .map_err(fail)?;
    tenant.cache.with_mut(&body.id, |m| {
        m.text = body.text.clone();
        m.edited = true;
    });

    let updated = tenant.cache.get(&body.id);
    Ok(Json(json!({
        "success": true,
        "status": "message edited",
        "message": updated,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ReadBody {
    #[serde(default)]
    ids: Vec<String>,
    id: Option<String>,
    #[serde(rename = "chatid", default)]
    chat_id: String,
    #[serde(default)]
    played: bool,
}

async fn read_message(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ReadBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;

    let mut ids = body.ids;
    if let Some(id) = body.id {
        ids.push(id);
    }
    if ids.is_empty() {
        return Err(bad_request("missing ids"));
    }
    // Chat id falls back to the cached message's chat.
    let chat_id = if body.chat_id.is_empty() {
        tenant
            .cache
            .get(&ids[0])
            .map(|m| m.chat.id)
            .ok_or_else(|| bad_request("missing chatid"))?
    } else {
        normalize(&body.chat_id)?
    };

    let client = tenant.require_ready().map_err(fail)?;
    let receipt = if body.played {
        MarkReadType::Played
    } else {
        MarkReadType::Read
    };
    client
        .mark_read(&ids, &chat_id, None, receipt)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} messages marked", ids.len()),
    })))
}

// ----------------------------------------------------------------------
// Download
// ----------------------------------------------------------------------

pub(crate) fn binary_response(mime: &str, file_name: Option<&str>, bytes: Vec<u8>) -> Response {
    let mut builder = Response::builder().header(header::CONTENT_TYPE, mime);
    if let Some(name) = file_name {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        );
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Fetch attachment bytes for a cached message: straight from the cache
/// when present, otherwise through the WCL using the stored download
/// handle or the history-sync snapshot. `keep` writes the bytes back.
pub(crate) async fn download_bytes(
    tenant: &Tenant,
    id: &str,
    keep: bool,
) -> Result<(String, Option<String>, Vec<u8>), QpError> {
    let message = tenant
        .cache
        .get(id)
        .ok_or_else(|| QpError::NotFound(format!("message {id}")))?;

    // Bytes already in the cache are served directly.
    if let Some(attachment) = &message.attachment {
        if let Some(content) = &attachment.content {
            return Ok((
                attachment.mime.clone(),
                attachment.file_name.clone(),
                content.clone(),
            ));
        }
    }

    let client = tenant.require_ready()?;
    let media = match message.attachment.as_ref().and_then(|a| a.media.clone()) {
        Some(media) => media,
        None => {
            // History-sync notifications keep the raw download fields in
            // the debug snapshot.
            let info = message
                .info_for_history
                .clone()
                .or_else(|| message.debug.as_ref().map(|d| d.info.clone()))
                .ok_or_else(|| QpError::NotFound(format!("message {id} has no media")))?;
            history::envelope_from_info(&info)?
        }
    };

    let bytes = client.download(&media).await?;
    let (mime, file_name) = history::name_downloaded(&media, &bytes);
    let checksum = history::checksum(&bytes);
    if keep {
        tenant.cache.with_mut(id, |m| {
            let attachment = m.attachment.get_or_insert_with(Default::default);
            if attachment.mime.is_empty() {
                attachment.mime = mime.clone();
            }
            if attachment.file_name.is_none() {
                attachment.file_name = Some(file_name.clone());
            }
            attachment.file_length = bytes.len() as u64;
            attachment.content = Some(bytes.clone());
            attachment.checksum = Some(checksum.clone());
        });
    }
    Ok((mime, Some(file_name), bytes))
}

pub(crate) fn parse_cache_flag(query: &HashMap<String, String>) -> Result<bool, ApiError> {
    Ok(query
        .get("cache")
        .map(|t| TriState::parse(t))
        .transpose()
        .map_err(|e| fail(QpError::Input(e)))?
        .map(|t| t.to_bool(true))
        .unwrap_or(true))
}

async fn download(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let id = path_value(&params, "id")?.to_string();
    let keep = parse_cache_flag(&query)?;
    let (mime, file_name, bytes) = download_bytes(&tenant, &id, keep).await.map_err(fail)?;
    Ok(binary_response(&mime, file_name.as_deref(), bytes))
}

/// Pulls history-sync media, attaches it to the cached message, and
/// republishes the updated message so subscribers see the downloadable
/// attachment.
async fn history_download(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let id = path_value(&params, "id")?.to_string();
    let (mime, file_name, bytes) = download_bytes(&tenant, &id, true).await.map_err(fail)?;
    let message = tenant
        .cache
        .get(&id)
        .ok_or_else(|| fail(QpError::NotFound(format!("message {id}"))))?;
    let routed = tenant.dispatch(&message, false, true);
    Ok(Json(json!({
        "success": true,
        "status": "downloaded",
        "mime": mime,
        "filename": file_name,
        "length": bytes.len(),
        "dispatched": routed,
    })))
}

// ----------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------

async fn save_subscription(
    state: &ApiState,
    tenant: &Tenant,
    mut sub: DispatchSubscription,
    kind: SubscriberKind,
) -> ApiResult {
    if sub.connection_string.trim().is_empty() {
        return Err(bad_request("missing url"));
    }
    sub.kind = kind;
    let replaced = state
        .service
        .save_subscription(tenant, sub)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": if replaced { "subscription updated" } else { "subscription created" },
    })))
}

fn list_subscriptions(tenant: &Tenant, kind: SubscriberKind) -> Json<Value> {
    let items = tenant.dispatcher.list_by_kind(kind);
    Json(json!({
        "success": true,
        "status": format!("{} subscriptions", items.len()),
        "items": items,
    }))
}

#[derive(Debug, Deserialize)]
struct RemoveSubscriptionBody {
    url: String,
}

async fn remove_subscription(
    state: &ApiState,
    tenant: &Tenant,
    connection_string: &str,
) -> ApiResult {
    let removed = state
        .service
        .remove_subscription(tenant, connection_string)
        .await
        .map_err(fail)?;
    if !removed {
        return Err(fail(QpError::NotFound(format!(
            "subscription {connection_string}"
        ))));
    }
    Ok(Json(json!({"success": true, "status": "subscription removed"})))
}

async fn set_webhook(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(sub): Json<DispatchSubscription>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    save_subscription(&state, &tenant, sub, SubscriberKind::Webhook).await
}

async fn list_webhooks(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    Ok(list_subscriptions(&tenant, SubscriberKind::Webhook))
}

async fn remove_webhook(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<RemoveSubscriptionBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    remove_subscription(&state, &tenant, &body.url).await
}

async fn set_queue(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(sub): Json<DispatchSubscription>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    save_subscription(&state, &tenant, sub, SubscriberKind::Queue).await
}

async fn list_queues(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    Ok(list_subscriptions(&tenant, SubscriberKind::Queue))
}

async fn remove_queue(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<RemoveSubscriptionBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    remove_subscription(&state, &tenant, &body.url).await
}

async fn redispatch(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let id = path_value(&params, "id")?;
    let delivered = tenant.redispatch(id).map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("routed to {delivered} subscribers"),
    })))
}

// ----------------------------------------------------------------------
// Contacts & identity
// ----------------------------------------------------------------------

async fn contacts(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let contacts = client.all_contacts().await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} contacts", contacts.len()),
        "contacts": contacts.iter().map(contact_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    term: String,
}

async fn contact_search(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let term = body.term.to_lowercase();
    if term.is_empty() {
        return Err(bad_request("missing term"));
    }

    let matched: Vec<Value> = client
        .all_contacts()
        .await
        .map_err(fail)?
        .iter()
        .filter(|c| {
            c.jid.to_lowercase().contains(&term)
                || [&c.full_name, &c.push_name, &c.business_name, &c.first_name]
                    .iter()
                    .any(|name| {
                        name.as_deref()
                            .is_some_and(|n| n.to_lowercase().contains(&term))
                    })
        })
        .map(contact_json)
        .collect();
    Ok(Json(json!({
        "success": true,
        "status": format!("{} contacts", matched.len()),
        "contacts": matched,
    })))
}

#[derive(Debug, Deserialize)]
struct PhonesBody {
    phones: Vec<String>,
}

async fn is_on_whatsapp(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PhonesBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    if body.phones.is_empty() {
        return Err(bad_request("missing phones"));
    }
    let registered = client.is_on_whatsapp(&body.phones).await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} registered", registered.len()),
        "registered": registered,
    })))
}

async fn user_identifier(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let phone = query
        .get("phone")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("missing phone"))?;
    let lid = client
        .lid_for_phone(phone)
        .await
        .map_err(fail)?
        .ok_or_else(|| fail(QpError::NotFound(format!("no identifier for {phone}"))))?;
    Ok(Json(json!({"success": true, "status": "found", "lid": lid})))
}

async fn get_phone(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let lid = query
        .get("lid")
        .filter(|l| !l.is_empty())
        .ok_or_else(|| bad_request("missing lid"))?;
    let phone = client
        .phone_for_lid(lid)
        .await
        .map_err(fail)?
        .ok_or_else(|| fail(QpError::NotFound(format!("no phone for {lid}"))))?;
    Ok(Json(json!({"success": true, "status": "found", "phone": phone})))
}

#[derive(Debug, Deserialize)]
struct JidsBody {
    jids: Vec<String>,
}

async fn user_info(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<JidsBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    if body.jids.is_empty() {
        return Err(bad_request("missing jids"));
    }
    let users = client.get_user_info(&body.jids).await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} users", users.len()),
        "users": users,
    })))
}

async fn invite(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let chat_id = normalize(path_value(&params, "chatid")?)?;
    let url = client.group_invite_link(&chat_id).await.map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "invite link", "url": url})))
}

// ----------------------------------------------------------------------
// Chat state
// ----------------------------------------------------------------------

fn default_presence_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
struct PresenceBody {
    #[serde(rename = "chatid", alias = "chat")]
    chat_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "duration", default = "default_presence_ms")]
    duration_ms: u64,
}

async fn chat_presence(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PresenceBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let chat_id = normalize(&body.chat_id)?;
    let kind = PresenceKind::parse(&body.kind).map_err(fail)?;
    state
        .service
        .presence
        .set(client, &chat_id, kind, Duration::from_millis(body.duration_ms))
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "presence set"})))
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    #[serde(rename = "chatid")]
    chat_id: String,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    played: bool,
}

async fn chat_mark_read(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let chat_id = normalize(&body.chat_id)?;

    // Without explicit ids, acknowledge every cached inbound message of
    // the chat.
    let ids = if body.ids.is_empty() {
        tenant
            .cache
            .list()
            .into_iter()
            .filter(|m| !m.from_me && m.chat.id.eq_ignore_ascii_case(&chat_id))
            .map(|m| m.id)
            .collect()
    } else {
        body.ids
    };
    if ids.is_empty() {
        return Err(bad_request("nothing to mark"));
    }
    let receipt = if body.played {
        MarkReadType::Played
    } else {
        MarkReadType::Read
    };
    client
        .mark_read(&ids, &chat_id, None, receipt)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} messages marked", ids.len()),
    })))
}

async fn chat_mark_unread(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let chat_id = normalize(&body.chat_id)?;
    client.mark_chat_unread(&chat_id).await.map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "chat marked unread"})))
}

#[derive(Debug, Deserialize)]
struct ArchiveBody {
    #[serde(rename = "chatid")]
    chat_id: String,
    #[serde(default = "default_archive")]
    archive: bool,
}

fn default_archive() -> bool {
    true
}

async fn chat_archive(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ArchiveBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let chat_id = normalize(&body.chat_id)?;
    client
        .archive_chat(&chat_id, body.archive)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": if body.archive { "chat archived" } else { "chat unarchived" },
    })))
}

// ----------------------------------------------------------------------
// Groups
// ----------------------------------------------------------------------

fn group_id_of(query: &HashMap<String, String>) -> Result<String, ApiError> {
    query
        .get("groupid")
        .filter(|g| !g.is_empty())
        .cloned()
        .ok_or_else(|| bad_request("missing groupid"))
}

async fn groups_all(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let groups = client.group_list().await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} groups", groups.len()),
        "groups": groups,
    })))
}

async fn groups_get(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let group = client.group_info(&group_id_of(&query)?).await.map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "group info", "group": group})))
}

#[derive(Debug, Deserialize)]
struct GroupCreateBody {
    name: String,
    #[serde(default)]
    participants: Vec<String>,
}

async fn groups_create(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupCreateBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    if body.name.trim().is_empty() {
        return Err(bad_request("missing name"));
    }
    let participants = body
        .participants
        .iter()
        .map(|p| normalize(p))
        .collect::<Result<Vec<_>, _>>()?;
    let group = client
        .group_create(body.name.trim(), &participants)
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "group created", "group": group})))
}

#[derive(Debug, Deserialize)]
struct GroupIdBody {
    #[serde(rename = "groupid")]
    group_id: String,
}

async fn groups_leave(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupIdBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    client.group_leave(&body.group_id).await.map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "left group"})))
}

#[derive(Debug, Deserialize)]
struct GroupNameBody {
    #[serde(rename = "groupid")]
    group_id: String,
    name: String,
}

async fn groups_name(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupNameBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    client
        .group_set_name(&body.group_id, &body.name)
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "group renamed"})))
}

#[derive(Debug, Deserialize)]
struct GroupTopicBody {
    #[serde(rename = "groupid")]
    group_id: String,
    #[serde(alias = "topic")]
    description: String,
}

async fn groups_description(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupTopicBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    client
        .group_set_topic(&body.group_id, &body.description)
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "group description set"})))
}

#[derive(Debug, Deserialize)]
struct GroupPhotoBody {
    #[serde(rename = "groupid")]
    group_id: String,
    /// Base-64 JPEG.
    content: String,
}

async fn groups_photo(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupPhotoBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let jpeg = BASE64
        .decode(&body.content)
        .map_err(|e| bad_request(format!("content is not base64: {e}")))?;
    client
        .group_set_photo(&body.group_id, &jpeg)
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "group photo set"})))
}

#[derive(Debug, Deserialize)]
struct GroupParticipantsBody {
    #[serde(rename = "groupid")]
    group_id: String,
    participants: Vec<String>,
    #[serde(default)]
    action: String,
}

async fn groups_participants(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupParticipantsBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;

    let action = match body.action.to_ascii_lowercase().as_str() {
        "" | "add" => ParticipantsAction::Add,
        "remove" => ParticipantsAction::Remove,
        "promote" => ParticipantsAction::Promote,
        "demote" => ParticipantsAction::Demote,
        other => return Err(bad_request(format!("unknown action: {other}"))),
    };
    let participants = body
        .participants
        .iter()
        .map(|p| normalize(p))
        .collect::<Result<Vec<_>, _>>()?;
    let updated = client
        .group_update_participants(&body.group_id, &participants, action)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} participants updated", updated.len()),
        "participants": updated,
    })))
}

async fn groups_requests(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let requests = client
        .group_join_requests(&group_id_of(&query)?)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} pending requests", requests.len()),
        "requests": requests,
    })))
}

#[derive(Debug, Deserialize)]
struct GroupRequestsBody {
    #[serde(rename = "groupid")]
    group_id: String,
    users: Vec<String>,
    /// `approve` or `reject`.
    action: String,
}

async fn groups_handle_requests(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<GroupRequestsBody>,
) -> ApiResult {
    let tenant = state.require_tenant(&params, &query, &headers)?;
    let client = tenant.require_ready().map_err(fail)?;
    let approve = match body.action.to_ascii_lowercase().as_str() {
        "approve" => true,
        "reject" => false,
        other => return Err(bad_request(format!("unknown action: {other}"))),
    };
    client
        .group_handle_requests(&body.group_id, &body.users, approve)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} requests handled", body.users.len()),
    })))
}

// ----------------------------------------------------------------------
// Spam (master-only, explicitly opt-in)
// ----------------------------------------------------------------------

async fn spam(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    if !state.service.config.auth.spam_endpoint {
        return Err(fail(QpError::Auth("spam endpoint disabled".to_string())));
    }
    state.require_master(&query, &headers)?;
    let tenant = state.service.first_ready().ok_or_else(|| {
        (
            StatusCode::LOCKED,
            Json(json!({"success": false, "error": "no ready server available"})),
        )
    })?;
    let attachment = body.decoded_attachment()?;
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, attachment).await
}

// ----------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------

fn token_routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/environment", get(environment))
        .route(
            "/info",
            get(get_info)
                .post(create_info)
                .patch(patch_info)
                .delete(delete_info),
        )
        .route("/scan", get(scan))
        .route("/paircode", get(paircode))
        .route("/command", get(command))
        .route("/receive", get(receive))
        .route("/send", post(send))
        .route("/send/{chatid}", post(send_to_chat))
        .route("/sendurl", post(send_url))
        .route("/sendencoded", post(send_encoded))
        .route("/senddocument", post(send_document))
        .route("/sendbinary/{chatid}/{filename}", post(send_binary))
        .route("/message/{id}", get(get_message).delete(delete_message))
        .route("/edit", put(edit_message))
        .route("/read", post(read_message))
        .route("/download/{id}", get(download))
        .route("/messages/{id}/history/download", post(history_download))
        .route(
            "/webhook",
            post(set_webhook).get(list_webhooks).delete(remove_webhook),
        )
        .route(
            "/rabbitmq",
            post(set_queue).get(list_queues).delete(remove_queue),
        )
        .route("/redispatch/{id}", post(redispatch))
        .route("/contacts", get(contacts))
        .route("/contact/search", post(contact_search))
        .route("/isonwhatsapp", post(is_on_whatsapp))
        .route("/useridentifier", get(user_identifier))
        .route("/getphone", get(get_phone))
        .route("/userinfo", post(user_info))
        .route("/invite/{chatid}", get(invite))
        .route("/chat/presence", post(chat_presence))
        .route("/chat/markread", post(chat_mark_read))
        .route("/chat/markunread", post(chat_mark_unread))
        .route("/chat/archive", post(chat_archive))
        .route("/groups/getall", get(groups_all))
        .route("/groups/get", get(groups_get))
        .route("/groups/create", post(groups_create))
        .route("/groups/leave", post(groups_leave))
        .route("/groups/name", put(groups_name))
        .route("/groups/description", put(groups_description))
        .route("/groups/photo", put(groups_photo))
        .route("/groups/participants", put(groups_participants))
        .route(
            "/groups/requests",
            get(groups_requests).post(groups_handle_requests),
        )
        .route("/spam", post(spam))
}

/// Full route table, mounted bare and under `/{token}` so the token can
/// travel in the path.
pub fn build_router(state: ApiState) -> Router {
    let timeout = Duration::from_secs(state.service.config.http.api_timeout);
    Router::new()
        .merge(token_routes())
        .nest("/{token}", token_routes())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: tower::BoxError| async {
                    (
                        StatusCode::REQUEST_TIMEOUT,
                        Json(json!({"success": false, "error": "request timed out"})),
                    )
                }))
                .layer(tower::timeout::TimeoutLayer::new(timeout)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(state: ApiState) -> Result<(), QpError> {
    let http = state.service.config.http.clone();
    let mut app = build_router(state.clone()).merge(crate::spa::build_router(state));
    if !http.api_prefix.is_empty() && http.api_prefix != "/" {
        app = Router::new().nest(&http.api_prefix, app);
    }

    let addr = format!("{}:{}", http.host, http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}{}", http.api_prefix);
    axum::serve(listener, app).await?;
    Ok(())
}
