use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::Json,
};
use omnicore_crypto::EncryptedMessage;
use omnicore_federation::{
    ChallengeResponse, KnownServer, PeerChallenge, RegisterOutcome, RegistryStats,
    ServerDescriptor, ServerFilter, SyncRequest, SyncResponse,
};
use omnicore_identity::{ClientKeyRecord, KeyStoreStats, RegistrationState, Session};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry;

type AppStateRef = State<Arc<AppState>>;

fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::MissingToken)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let token = bearer_token(headers)?;
    Ok(state.identity.admin().authorize(token)?)
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_token: String,
    pub subject: String,
    pub expires_at: u64,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            session_token: session.token,
            subject: session.subject,
            expires_at: session.expires_at,
        }
    }
}

// ---- Client registration ----

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub client_id: String,
}

pub async fn register_init(
    State(state): AppStateRef,
    Json(request): Json<InitRequest>,
) -> ApiResult<Json<Value>> {
    let public = state.identity.registration().init(&request.client_id)?;
    Ok(Json(json!({
        "client_id": request.client_id,
        "server_public_key": public.to_hex(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub client_id: String,
    pub client_public_key: String,
    #[serde(default)]
    pub key_confirmation: Option<EncryptedMessage>,
}

pub async fn register_complete(
    State(state): AppStateRef,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.identity.registration().complete(
        &request.client_id,
        &request.client_public_key,
        request.key_confirmation.as_ref(),
    )?;
    telemetry::record_registration();
    Ok(Json(session.into()))
}

// ---- Encrypted messages ----

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub payload: EncryptedMessage,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub payload: EncryptedMessage,
}

/// Open a payload sealed under the caller's shared secret and answer with
/// an acknowledgement sealed under the same secret.
pub async fn send_encrypted(
    State(state): AppStateRef,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> ApiResult<Json<SendResponse>> {
    let session = state.identity.verify_session(bearer_token(&headers)?)?;
    let registration = state.identity.registration();

    let plaintext = registration.open_for_client(&session.subject, &request.payload)?;
    let reply = format!("Received: {}", String::from_utf8_lossy(&plaintext));
    let payload = registration.seal_for_client(&session.subject, reply.as_bytes())?;
    Ok(Json(SendResponse { payload }))
}

// ---- Sessions ----

pub async fn verify_session(
    State(state): AppStateRef,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let session = state.identity.verify_session(bearer_token(&headers)?)?;
    Ok(Json(json!({
        "valid": true,
        "subject": session.subject,
        "expires_at": session.expires_at,
        "is_admin": session.is_admin,
    })))
}

pub async fn logout(State(state): AppStateRef, headers: HeaderMap) -> ApiResult<Json<Value>> {
    state.identity.logout(bearer_token(&headers)?)?;
    Ok(Json(json!({ "status": "logged_out" })))
}

#[derive(Debug, Deserialize)]
pub struct AdminLoginRequest {
    pub admin_key: String,
}

pub async fn admin_login(
    State(state): AppStateRef,
    Json(request): Json<AdminLoginRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.identity.admin().login(&request.admin_key)?;
    Ok(Json(session.into()))
}

// ---- Clients (admin) ----

/// Client record without key material.
#[derive(Debug, Serialize)]
pub struct ClientSummary {
    pub client_id: String,
    pub state: RegistrationState,
    pub server_public_key: String,
    pub client_public_key: Option<String>,
    pub created_at: u64,
    pub last_seen: u64,
}

impl From<ClientKeyRecord> for ClientSummary {
    fn from(record: ClientKeyRecord) -> Self {
        Self {
            state: record.state(),
            client_id: record.client_id,
            server_public_key: record.server_public_key,
            client_public_key: record.client_public_key,
            created_at: record.created_at,
            last_seen: record.last_seen,
        }
    }
}

pub async fn list_clients(
    State(state): AppStateRef,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ClientSummary>>> {
    let records = state.identity.list_clients(bearer_token(&headers)?)?;
    Ok(Json(records.into_iter().map(ClientSummary::from).collect()))
}

pub async fn client_stats(
    State(state): AppStateRef,
    headers: HeaderMap,
) -> ApiResult<Json<KeyStoreStats>> {
    Ok(Json(state.identity.client_stats(bearer_token(&headers)?)?))
}

pub async fn remove_client(
    State(state): AppStateRef,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    if !state
        .identity
        .remove_client(bearer_token(&headers)?, &client_id)?
    {
        return Err(omnicore_identity::KeyStoreError::NotFound(client_id).into());
    }
    Ok(Json(json!({ "status": "removed", "client_id": client_id })))
}

// ---- Federation ----

fn outcome_label(outcome: &RegisterOutcome) -> &'static str {
    match outcome {
        RegisterOutcome::Created => "created",
        RegisterOutcome::Updated => "updated",
        RegisterOutcome::Superseded { .. } => "superseded",
        RegisterOutcome::Rejected(_) => "rejected",
    }
}

pub async fn register_server(
    State(state): AppStateRef,
    Json(descriptor): Json<ServerDescriptor>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .federation
        .register_server(&descriptor)?
        .into_result(&descriptor.server_id)?;
    Ok(Json(json!({
        "outcome": outcome_label(&outcome),
        "server": state.federation.local_descriptor(),
    })))
}

pub async fn server_challenge(
    State(state): AppStateRef,
    Json(challenge): Json<PeerChallenge>,
) -> Json<ChallengeResponse> {
    Json(state.federation.answer_challenge(&challenge))
}

pub async fn server_sync(
    State(state): AppStateRef,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    Ok(Json(state.federation.handle_sync_request(&request)?))
}

pub async fn public_servers(State(state): AppStateRef) -> ApiResult<Json<Vec<ServerDescriptor>>> {
    let servers = state.registry.list(ServerFilter::Public)?;
    Ok(Json(servers.iter().map(KnownServer::descriptor).collect()))
}

pub async fn all_servers(
    State(state): AppStateRef,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<KnownServer>>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.registry.list(ServerFilter::All)?))
}

#[derive(Debug, Serialize)]
pub struct ServerStatsResponse {
    pub server_id: String,
    pub max_known_servers: usize,
    #[serde(flatten)]
    pub registry: RegistryStats,
}

pub async fn server_stats(
    State(state): AppStateRef,
    headers: HeaderMap,
) -> ApiResult<Json<ServerStatsResponse>> {
    require_admin(&state, &headers)?;
    Ok(Json(ServerStatsResponse {
        server_id: state.server.server_id(),
        max_known_servers: state.registry.max_known_servers(),
        registry: state.registry.stats()?,
    }))
}

pub async fn deregister_server(
    State(state): AppStateRef,
    Path(server_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;
    if !state.registry.deregister(&server_id)? {
        return Err(omnicore_federation::FederationError::NotFound(server_id).into());
    }
    info!(server_id = %server_id, "Admin deregistered server");
    Ok(Json(json!({ "status": "removed", "server_id": server_id })))
}

#[derive(Debug, Deserialize)]
pub struct TrustRequest {
    pub trust_level: u8,
}

pub async fn set_trust(
    State(state): AppStateRef,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<TrustRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;
    state
        .registry
        .set_trust_level(&server_id, request.trust_level)?;
    info!(server_id = %server_id, trust_level = request.trust_level, "Admin set trust level");
    Ok(Json(json!({
        "server_id": server_id,
        "trust_level": request.trust_level,
    })))
}

pub async fn health_check(State(state): AppStateRef) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "omnicore-node",
        "server_id": state.server.server_id(),
        "timestamp": state.clock.now_ms(),
    }))
}
