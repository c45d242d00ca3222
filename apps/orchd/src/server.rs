// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn};

use orchard_api::{MachineId, MachinePropertiesPayload, PropertiesMap};

use crate::auth::{Capability, User};
use crate::config::Config;
use crate::services::{CreateMachineSpec, LifecycleError, ModifyMachineSpec, Services};
use crate::state::AppState;
use crate::ws::handler as ws_handler;
use crate::ws::tracker::ConnectionTracker;
use crate::ws::MachineStreams;

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Checks a request Origin against the configured allowlist.
///
/// A pattern is an exact origin, `*` for everything, or `scheme://host:*`
/// accepting any numeric port on that host. The same allowlist gates both
/// CORS preflights and WebSocket upgrades.
fn origin_allowed(origin: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }

        match pattern.strip_suffix(":*") {
            Some(host) => origin
                .strip_prefix(host)
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())),
            None => origin == pattern,
        }
    })
}

fn machine_api_cors(config: &crate::config::CorsConfig) -> CorsLayer {
    use axum::http::{HeaderValue, Method};

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        warn!("CORS allows every origin; pin [server.cors].allowed_origins for production");
        return CorsLayer::permissive();
    }

    info!(origins = config.allowed_origins.len(), "CORS origin allowlist active");

    // An empty allowlist leaves the predicate rejecting everything.
    let patterns = config.allowed_origins.clone();
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        origin.to_str().is_ok_and(|origin| origin_allowed(origin, &patterns))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

#[cfg(test)]
mod origin_tests {
    use super::origin_allowed;

    fn allowed(origin: &str, pattern: &str) -> bool {
        origin_allowed(origin, &[pattern.to_string()])
    }

    #[test]
    fn port_wildcard_requires_a_numeric_port_on_that_host() {
        assert!(allowed("http://localhost:4646", "http://localhost:*"));
        assert!(!allowed("http://localhost", "http://localhost:*"));
        assert!(!allowed("http://localhost:46x6", "http://localhost:*"));
        assert!(!allowed("http://localhost.evil.example:4646", "http://localhost:*"));
        assert!(!allowed("http://127.0.0.1:4646", "http://localhost:*"));
    }

    #[test]
    fn exact_patterns_match_nothing_but_themselves() {
        assert!(allowed("https://studio.example.org", "https://studio.example.org"));
        assert!(!allowed("https://studio.example.org:8443", "https://studio.example.org"));
    }

    #[test]
    fn star_matches_everything_and_an_empty_list_nothing() {
        assert!(origin_allowed("https://anything.example", &["*".to_string()]));
        assert!(!origin_allowed("https://anything.example", &[]));
    }
}

// --- REST error type ---

#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => {
                error!(error = %msg, "Internal error serving machine request");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            },
        };
        (status, msg).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::NotFound(machine) => {
                Self::NotFound(format!("Virtual machine of UUID={machine} could not be found."))
            },
            LifecycleError::Failed(msg) => Self::Internal(msg),
        }
    }
}

const FORBIDDEN_VIEW: &str = "You do not have the necessary permissions to access this resource.";
const FORBIDDEN_MANAGE: &str = "You do not have the necessary permissions to manage this resource.";

// --- REST helpers ---

/// Resolves the request's bearer token to a user.
async fn authenticated_user(headers: &HeaderMap, state: &AppState) -> Result<User, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token.".to_string()))?;

    state
        .services
        .auth
        .authenticate(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired access token.".to_string()))
}

async fn ensure_machine_exists(state: &AppState, machine: MachineId) -> Result<(), ApiError> {
    if state.services.directory.machine_exists(machine).await {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!(
            "Virtual machine of UUID={machine} could not be found."
        )))
    }
}

/// Whether the user is linked to the machine (owner or assigned client).
async fn has_machine_access(state: &AppState, user: &User, machine: MachineId) -> bool {
    state.services.directory.machine_linked_accounts(machine).await.contains(&user.uuid)
}

// --- REST handlers ---

/// Static properties of every managed machine; privileged.
async fn get_all_machines_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PropertiesMap>, ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    if !user.has(Capability::ViewAllVms) {
        return Err(ApiError::Forbidden(FORBIDDEN_VIEW.to_string()));
    }

    let machines = state.services.directory.all_machines().await;
    Ok(Json(state.services.properties_by_uuids(&machines).await))
}

/// Static properties of the caller's machines.
async fn get_account_machines_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PropertiesMap>, ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    let machines = state.services.user_machine_uuids(user.uuid).await;
    Ok(Json(state.services.properties_by_uuids(&machines).await))
}

async fn get_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(machine): Path<MachineId>,
) -> Result<Json<MachinePropertiesPayload>, ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    ensure_machine_exists(&state, machine).await?;

    if !user.has(Capability::ViewAllVms) && !has_machine_access(&state, &user, machine).await {
        return Err(ApiError::Forbidden(FORBIDDEN_VIEW.to_string()));
    }

    let properties = state
        .services
        .payloads
        .properties(machine)
        .await
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    Ok(Json(properties))
}

async fn start_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(machine): Path<MachineId>,
) -> Result<(), ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    ensure_machine_exists(&state, machine).await?;

    if !user.has(Capability::ManageAllVms) && !has_machine_access(&state, &user, machine).await {
        return Err(ApiError::Forbidden(FORBIDDEN_MANAGE.to_string()));
    }

    state.streams.on_machine_bootup_start(machine).await;

    if let Err(error) = state.services.lifecycle.start(machine).await {
        let reason = format!("Virtual machine of UUID={machine} failed to start.");
        warn!(%machine, %error, "Machine start failed");
        state.streams.on_machine_bootup_fail(machine, &reason).await;
        return Err(ApiError::Internal(reason));
    }

    state.streams.on_machine_bootup_success(machine).await;
    Ok(())
}

async fn stop_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(machine): Path<MachineId>,
) -> Result<(), ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    ensure_machine_exists(&state, machine).await?;

    if !user.has(Capability::ManageAllVms) && !has_machine_access(&state, &user, machine).await {
        return Err(ApiError::Forbidden(FORBIDDEN_MANAGE.to_string()));
    }

    state.streams.on_machine_shutdown_start(machine).await;

    if let Err(error) = state.services.lifecycle.stop(machine).await {
        let reason = format!("Virtual machine of UUID={machine} failed to stop.");
        warn!(%machine, %error, "Machine stop failed");
        state.streams.on_machine_shutdown_fail(machine, &reason).await;
        return Err(ApiError::Internal(reason));
    }

    state.streams.on_machine_shutdown_success(machine).await;
    Ok(())
}

async fn create_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(spec): Json<CreateMachineSpec>,
) -> Result<Json<MachineId>, ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    if !user.has(Capability::ManageAllVms) {
        return Err(ApiError::Forbidden(FORBIDDEN_MANAGE.to_string()));
    }

    let machine = state.services.lifecycle.create(spec, user.uuid).await?;
    state.streams.on_machine_create(machine).await;
    Ok(Json(machine))
}

async fn delete_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(machine): Path<MachineId>,
) -> Result<(), ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    ensure_machine_exists(&state, machine).await?;

    if !user.has(Capability::ManageAllVms) && !has_machine_access(&state, &user, machine).await {
        return Err(ApiError::Forbidden(FORBIDDEN_MANAGE.to_string()));
    }

    // Linkage must be read before the resource disappears; the delete event
    // is dispatched with this captured list.
    let linked_accounts = state.services.directory.machine_linked_accounts(machine).await;

    state.services.lifecycle.delete(machine).await?;
    state.streams.on_machine_delete(machine, &linked_accounts).await;
    Ok(())
}

async fn modify_machine_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(machine): Path<MachineId>,
    Json(changes): Json<ModifyMachineSpec>,
) -> Result<(), ApiError> {
    let user = authenticated_user(&headers, &state).await?;
    ensure_machine_exists(&state, machine).await?;

    if !user.has(Capability::ManageAllVms) && !has_machine_access(&state, &user, machine).await {
        return Err(ApiError::Forbidden(FORBIDDEN_MANAGE.to_string()));
    }

    state.services.lifecycle.modify(machine, changes).await?;
    state.streams.on_machine_modify(machine).await;
    Ok(())
}

// --- WebSocket endpoints ---

#[derive(Deserialize)]
struct SubscribedStreamParams {
    machine_uuid: MachineId,
    access_token: String,
}

#[derive(Deserialize)]
struct StreamParams {
    access_token: String,
}

/// Best-effort Origin enforcement for browser security.
///
/// Browsers always send an Origin header for WebSocket connections. If we
/// accept any Origin, any website can connect to a user's Orchard instance
/// and observe machine state. Reuse the configured CORS origin allowlist.
fn reject_disallowed_origin(headers: &HeaderMap, state: &AppState) -> Option<Response> {
    let origin = headers.get(header::ORIGIN).and_then(|value| value.to_str().ok())?;

    if origin_allowed(origin, &state.config.server.cors.allowed_origins) {
        None
    } else {
        warn!(origin = %origin, "Rejected WebSocket connection: Origin not allowed");
        Some((StatusCode::FORBIDDEN, "WebSocket Origin not allowed").into_response())
    }
}

async fn subscribed_stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribedStreamParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(rejection) = reject_disallowed_origin(&headers, &state) {
        return rejection;
    }

    ws.on_upgrade(move |socket| {
        ws_handler::serve_subscribed(socket, state, params.machine_uuid, params.access_token)
    })
}

async fn account_stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(rejection) = reject_disallowed_origin(&headers, &state) {
        return rejection;
    }

    ws.on_upgrade(move |socket| ws_handler::serve_account(socket, state, params.access_token))
}

async fn global_stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(rejection) = reject_disallowed_origin(&headers, &state) {
        return rejection;
    }

    ws.on_upgrade(move |socket| ws_handler::serve_global(socket, state, params.access_token))
}

// --- Application assembly ---

/// Creates the Axum application with all routes and middleware.
pub fn create_app(config: Config, services: Services) -> (Router, Arc<AppState>) {
    let streams = MachineStreams::new(services.clone(), config.websockets);

    let app_state = Arc::new(AppState {
        config: Arc::new(config),
        services,
        streams,
        connections: ConnectionTracker::new(),
    });

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/machines", post(create_machine_handler))
        .route("/api/v1/machines/global", get(get_all_machines_handler))
        .route("/api/v1/machines/account", get(get_account_machines_handler))
        .route("/api/v1/machines/start/{uuid}", post(start_machine_handler))
        .route("/api/v1/machines/stop/{uuid}", post(stop_machine_handler))
        .route(
            "/api/v1/machines/{uuid}",
            get(get_machine_handler).delete(delete_machine_handler).patch(modify_machine_handler),
        )
        .route("/ws/machines/subscribed", get(subscribed_stream_handler))
        .route("/ws/machines/account", get(account_stream_handler))
        .route("/ws/machines/global", get(global_stream_handler));

    let cors_layer = machine_api_cors(&app_state.config.server.cors);

    let router = router
        .with_state(Arc::clone(&app_state))
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        http_method = %request.method(),
                        http_path = %request.uri().path()
                    )
                })
                // Keep per-request logs out of INFO hot paths; surface failures at WARN.
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            header::HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(cors_layer);

    (router, app_state)
}

/// Starts the HTTP/HTTPS server and the broadcast loops.
///
/// # Errors
///
/// Returns an error if:
/// - The server address cannot be parsed
/// - TLS is enabled but certificates cannot be loaded
/// - The server fails to bind to the specified address
/// - The server encounters a runtime error
///
/// # Panics
///
/// Panics if:
/// - The Ctrl+C signal handler cannot be installed (critical OS failure)
/// - The SIGTERM signal handler cannot be installed on Unix systems (critical OS failure)
pub async fn start_server(
    config: &Config,
    services: Services,
) -> Result<(), Box<dyn std::error::Error>> {
    let (app, app_state) = create_app(config.clone(), services);

    let addr: SocketAddr = config.server.address.parse()?;

    app_state.streams.start_all_broadcasts();

    // Set up graceful shutdown signal handler
    // These expect() calls are justified and documented in the function's # Panics section
    #[allow(clippy::expect_used)]
    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL-C signal, initiating graceful shutdown");
            },
            () = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown");
            },
        }
    };

    let handle = axum_server::Handle::new();

    // Spawn a task to listen for shutdown signal
    tokio::spawn({
        let handle = handle.clone();
        let app_state = Arc::clone(&app_state);
        async move {
            shutdown_signal.await;
            app_state.streams.stop_all_broadcasts();
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
        }
    });

    if config.server.tls {
        if config.server.cert_path.is_empty() || config.server.key_path.is_empty() {
            return Err("TLS is enabled but cert_path or key_path is not configured".into());
        }

        info!(
            address = %addr,
            cert_path = %config.server.cert_path,
            key_path = %config.server.key_path,
            "Starting HTTPS API server"
        );

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server.cert_path,
            &config.server.key_path,
        )
        .await
        .map_err(|e| {
            error!(
                error = %e,
                cert_path = %config.server.cert_path,
                key_path = %config.server.key_path,
                "Failed to load TLS certificates"
            );
            e
        })?;

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| {
                error!(error = %e, "API server error");
                e.into()
            })
    } else {
        info!(address = %addr, "Starting HTTP API server");

        axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await.map_err(|e| {
            error!(error = %e, "API server error");
            e.into()
        })
    }
}
