//! Session-scoped API for the management frontend.
//!
//! Everything lives under `/api`. A session is an HS256 JWT carrying the
//! account name as `user_id`, issued by `/api/login` and presented as a
//! bearer token, a `session` cookie or a `session` query parameter (the
//! query form exists for the WebSocket, which cannot set headers).
//! Session routes only ever expose tenants owned by the session user; a
//! known token owned by someone else is a 403 with no tenant data.

use crate::api::{
    bad_request, binary_response, deliver, download_bytes, fail, parse_cache_flag, server_json,
    toggled, ApiError, ApiResult, ApiState, SendBody,
};
use crate::qr;
use crate::service::GatewayService;
use crate::tenant::Tenant;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use quepasa_core::error::QpError;
use quepasa_core::state::ConnectionState;
use quepasa_core::wcl::QrItem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SESSION_DAYS: i64 = 7;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    iat: i64,
    exp: i64,
}

fn issue_session(secret: &str, user: &str) -> Result<String, QpError> {
    let now = Utc::now();
    let claims = Claims {
        user_id: user.to_string(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::days(SESSION_DAYS)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| QpError::Internal(format!("session encode: {e}")))
}

fn verify_session(secret: &str, token: &str) -> Result<Claims, QpError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| QpError::Auth(format!("invalid session: {e}")))
}

/// Session resolution: bearer header, then cookie, then query.
fn session_of(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "session" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    query.get("session").cloned().filter(|s| !s.is_empty())
}

fn require_session(
    state: &ApiState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Claims, ApiError> {
    let secret = state.service.config.auth.signing_secret.as_str();
    if secret.is_empty() {
        return Err(fail(QpError::Auth("sessions disabled".to_string())));
    }
    let token = session_of(headers, query)
        .ok_or_else(|| fail(QpError::Auth("missing session".to_string())))?;
    verify_session(secret, &token).map_err(fail)
}

fn forbidden() -> ApiError {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"success": false, "error": "forbidden"})),
    )
}

fn require_owned(
    state: &ApiState,
    claims: &Claims,
    token: &str,
) -> Result<Arc<Tenant>, ApiError> {
    let tenant = state
        .service
        .find(token)
        .ok_or_else(|| fail(QpError::NotFound(format!("server {token}"))))?;
    if tenant.user != claims.user_id {
        return Err(forbidden());
    }
    Ok(tenant)
}

// ----------------------------------------------------------------------
// Sessions & accounts
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<ApiState>,
    Json(body): Json<CredentialsBody>,
) -> ApiResult {
    let secret = state.service.config.auth.signing_secret.clone();
    if secret.is_empty() {
        return Err(fail(QpError::Auth("sessions disabled".to_string())));
    }
    let user = state
        .service
        .store
        .authenticate(&body.username, &body.password)
        .await
        .map_err(fail)?;
    let session = issue_session(&secret, &user.username).map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": "session issued",
        "token": session,
        "username": user.username,
    })))
}

/// Self-service signup, available only when `ACCOUNTSETUP` is on.
async fn create_account(
    State(state): State<ApiState>,
    Json(body): Json<CredentialsBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.service.config.auth.account_setup {
        return Err(fail(QpError::Auth("account setup disabled".to_string())));
    }
    state
        .service
        .store
        .create_user(&body.username, &body.password)
        .await
        .map_err(fail)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "status": "account created"})),
    ))
}

#[derive(Debug, Deserialize)]
struct PasswordBody {
    password: String,
}

async fn change_password(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<PasswordBody>,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    state
        .service
        .store
        .update_password(&claims.user_id, &body.password)
        .await
        .map_err(fail)?;
    Ok(Json(json!({"success": true, "status": "password updated"})))
}

async fn whoami(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let user = state
        .service
        .store
        .find_user(&claims.user_id)
        .await
        .map_err(fail)?
        .ok_or_else(|| fail(QpError::NotFound(format!("user {}", claims.user_id))))?;
    let servers = state.service.list_for_user(&user.username).len();
    Ok(Json(json!({
        "success": true,
        "status": "account",
        "username": user.username,
        "created": user.timestamp.to_rfc3339(),
        "servers": servers,
    })))
}

async fn environment(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    require_session(&state, &headers, &query)?;
    let config = &state.service.config;
    Ok(Json(json!({
        "success": true,
        "status": "environment",
        "environment": {
            "accountsetup": config.auth.account_setup,
            "historysyncdays": config.whatsapp.history_sync_days,
            "cachelength": config.cache.length,
            "cachedays": config.cache.days,
        },
    })))
}

// ----------------------------------------------------------------------
// Servers
// ----------------------------------------------------------------------

async fn list_servers(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let mut servers: Vec<Value> = state
        .service
        .list_for_user(&claims.user_id)
        .iter()
        .map(|t| server_json(t))
        .collect();
    servers.sort_by(|a, b| a["token"].as_str().cmp(&b["token"].as_str()));
    Ok(Json(json!({
        "success": true,
        "status": format!("{} servers", servers.len()),
        "servers": servers,
    })))
}

async fn get_server(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;
    Ok(Json(json!({
        "success": true,
        "status": "server info",
        "server": server_json(&tenant),
    })))
}

async fn scan(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;
    if tenant.state() == ConnectionState::Ready {
        return Err(bad_request("already connected; stop the server to re-pair"));
    }
    let code = next_qr(&state.service, &tenant).await.map_err(fail)?;
    let png = qr::generate_qr_image(&code).map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": "scan the code with the device",
        "qrcode": BASE64.encode(png),
    })))
}

async fn paircode(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;
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

async fn send(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;
    let attachment = body.decoded_attachment()?;
    let chat_id = body.chat_id.clone();
    deliver(&tenant, chat_id, body, attachment).await
}

const DEFAULT_PAGE_SIZE: usize = 50;

async fn messages(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;

    let page = query
        .get("page")
        .and_then(|p| p.parse::<usize>().ok())
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let size = query
        .get("size")
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|s| *s >= 1)
        .unwrap_or(DEFAULT_PAGE_SIZE);

    let mut all = tenant.cache.list();
    all.reverse();
    let total = all.len();
    let items: Vec<_> = all.into_iter().skip((page - 1) * size).take(size).collect();
    Ok(Json(json!({
        "success": true,
        "status": format!("{} of {total} messages", items.len()),
        "page": page,
        "size": size,
        "total": total,
        "messages": items,
    })))
}

async fn download(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;
    let id = params
        .get("id")
        .ok_or_else(|| bad_request("missing path parameter id"))?;
    let keep = parse_cache_flag(&query)?;
    let (mime, file_name, bytes) = download_bytes(&tenant, id, keep).await.map_err(fail)?;
    Ok(binary_response(&mime, file_name.as_deref(), bytes))
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    option: String,
}

async fn toggle(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ToggleBody>,
) -> ApiResult {
    let claims = require_session(&state, &headers, &query)?;
    let token = params.get("token").cloned().unwrap_or_default();
    let tenant = require_owned(&state, &claims, &token)?;

    let mut options = tenant.options();
    let new = match body.option.to_ascii_lowercase().as_str() {
        "groups" => {
            options.groups = toggled(options.groups);
            options.groups
        }
        "direct" => {
            options.direct = toggled(options.direct);
            options.direct
        }
        "broadcasts" => {
            options.broadcasts = toggled(options.broadcasts);
            options.broadcasts
        }
        "readreceipts" => {
            options.read_receipts = toggled(options.read_receipts);
            options.read_receipts
        }
        "calls" => {
            options.calls = toggled(options.calls);
            options.calls
        }
        "readupdate" => {
            options.read_update = toggled(options.read_update);
            options.read_update
        }
        other => return Err(bad_request(format!("unknown option: {other}"))),
    };
    tenant.set_options(options);
    state.service.persist(&tenant).await.map_err(fail)?;
    Ok(Json(json!({
        "success": true,
        "status": format!("{} is now {new}", body.option.to_ascii_lowercase()),
        "options": tenant.options(),
    })))
}

// ----------------------------------------------------------------------
// QR WebSocket
// ----------------------------------------------------------------------

async fn next_qr(service: &Arc<GatewayService>, tenant: &Arc<Tenant>) -> Result<String, QpError> {
    if tenant.client().is_none() {
        service.start_tenant(&tenant.token).await?;
    }
    let client = tenant
        .client()
        .ok_or_else(|| QpError::NotReady(tenant.state().to_string()))?;
    let mut codes = client.qr_channel().await?;
    match codes.recv().await {
        Some(QrItem::Code(code)) => Ok(code),
        _ => Err(QpError::NotReady("qr code timed out".to_string())),
    }
}

/// `GET /api/verify/ws?token=&session=` upgrades and streams QR payloads
/// until the device pairs or the WCL stops producing codes.
async fn verify_ws(
    State(state): State<ApiState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match require_session(&state, &headers, &query) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };
    let Some(token) = query.get("token").cloned() else {
        return bad_request("missing token").into_response();
    };
    let tenant = match require_owned(&state, &claims, &token) {
        Ok(tenant) => tenant,
        Err(e) => return e.into_response(),
    };
    let service = Arc::clone(&state.service);
    ws.on_upgrade(move |socket| stream_qr(socket, service, tenant))
}

async fn stream_qr(mut socket: WebSocket, service: Arc<GatewayService>, tenant: Arc<Tenant>) {
    async fn emit(socket: &mut WebSocket, payload: Value) -> bool {
        socket
            .send(WsMessage::Text(payload.to_string().into()))
            .await
            .is_ok()
    }

    if tenant.client().is_none() {
        if let Err(e) = service.start_tenant(&tenant.token).await {
            emit(&mut socket, json!({"success": false, "error": e.to_string()})).await;
            return;
        }
    }
    let Some(client) = tenant.client() else {
        return;
    };
    let mut codes = match client.qr_channel().await {
        Ok(codes) => codes,
        Err(e) => {
            emit(&mut socket, json!({"success": false, "error": e.to_string()})).await;
            return;
        }
    };

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            item = codes.recv() => match item {
                Some(QrItem::Code(code)) => {
                    if !emit(&mut socket, json!({"qrcode": code})).await {
                        return;
                    }
                }
                Some(QrItem::Timeout) => {
                    emit(&mut socket, json!({"timeout": true})).await;
                    return;
                }
                None => return,
            },
            _ = poll.tick() => {
                if tenant.state() == ConnectionState::Ready {
                    debug!("tenant {} paired during verify stream", tenant.token);
                    emit(&mut socket, json!({"paired": true, "wid": tenant.wid()})).await;
                    return;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/account", post(create_account))
        .route("/api/password", post(change_password))
        .route("/api/user", get(whoami))
        .route("/api/environment", get(environment))
        .route("/api/servers", get(list_servers))
        .route("/api/servers/{token}", get(get_server))
        .route("/api/servers/{token}/scan", get(scan))
        .route("/api/servers/{token}/paircode", get(paircode))
        .route("/api/servers/{token}/send", post(send))
        .route("/api/servers/{token}/messages", get(messages))
        .route("/api/servers/{token}/download/{id}", get(download))
        .route("/api/servers/{token}/toggle", post(toggle))
        .route("/api/verify/ws", get(verify_ws))
        .with_state(state)
}
