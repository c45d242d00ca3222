// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-scope WebSocket session handlers.
//!
//! A handler owns the transport: it authenticates, registers the session in
//! its scope, pushes the initial snapshot, then consumes the socket for
//! liveness only until the peer goes away.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::StreamExt;
use orchard_api::{MachineId, MessageBody};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::manager::ScopeManager;
use super::metrics::StreamMetrics;
use super::scope::Scope;
use super::session::{
    SessionChannel, CLOSE_FORBIDDEN, CLOSE_UNAUTHENTICATED, SEND_QUEUE_CAPACITY,
};
use crate::auth::{Capability, User};
use crate::state::AppState;

static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);

const UNAUTHENTICATED_REASON: &str = "Authentication required.";
const FORBIDDEN_REASON: &str =
    "You do not have the necessary permissions to access this resource.";

/// Closes a connection that never became a session. No messages are sent.
async fn refuse(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

/// `/ws/machines/subscribed`: follow one specific machine.
pub async fn serve_subscribed(
    socket: WebSocket,
    state: Arc<AppState>,
    machine: MachineId,
    access_token: String,
) {
    let Some(user) = state.services.auth.authenticate(&access_token).await else {
        return refuse(socket, CLOSE_UNAUTHENTICATED, UNAUTHENTICATED_REASON).await;
    };

    run_session(socket, &state, &state.streams.subscribed, user, machine).await;
}

/// `/ws/machines/account`: follow all machines linked to the caller.
pub async fn serve_account(socket: WebSocket, state: Arc<AppState>, access_token: String) {
    let Some(user) = state.services.auth.authenticate(&access_token).await else {
        return refuse(socket, CLOSE_UNAUTHENTICATED, UNAUTHENTICATED_REASON).await;
    };

    let interest = user.uuid;
    run_session(socket, &state, &state.streams.account, user, interest).await;
}

/// `/ws/machines/global`: follow every managed machine. Requires the
/// view-all capability on top of authentication.
pub async fn serve_global(socket: WebSocket, state: Arc<AppState>, access_token: String) {
    let Some(user) = state.services.auth.authenticate(&access_token).await else {
        return refuse(socket, CLOSE_UNAUTHENTICATED, UNAUTHENTICATED_REASON).await;
    };

    if !user.has(Capability::ViewAllVms) {
        return refuse(socket, CLOSE_FORBIDDEN, FORBIDDEN_REASON).await;
    }

    run_session(socket, &state, &state.streams.global, user, ()).await;
}

async fn run_session<S: Scope>(
    socket: WebSocket,
    state: &Arc<AppState>,
    manager: &Arc<ScopeManager<S>>,
    user: User,
    interest: S::Key,
) {
    let metrics = StreamMetrics::shared();
    let active = ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.sessions_gauge.record(active, &[]);

    let (sink, mut stream) = socket.split();
    let session = SessionChannel::new(user, SEND_QUEUE_CAPACITY);
    let writer = tokio::spawn(Arc::clone(&session).run_writer(sink));

    info!(
        scope = S::NAME,
        session = %session.key(),
        user = %session.user().uuid,
        "Machine stream session opened"
    );

    // Queue the whole snapshot before the session becomes visible to any
    // broadcast pass: once `subscribe` returns, a pass on another worker may
    // enqueue a periodic frame, and nothing else orders it behind these.
    let machines = manager.machines_for_interest(&interest).await;
    for body in initial_snapshot::<S>(state, &machines).await {
        // The four snapshot sends are failure-isolated from each other.
        if let Err(error) = session.enqueue(body, true) {
            warn!(
                scope = S::NAME,
                session = %session.key(),
                %error,
                "Failed to queue initial snapshot frame"
            );
        }
    }

    if manager.subscribe(Arc::clone(&session), interest) {
        state.connections.register(&session);

        listen::<S>(&mut stream).await;

        manager.unsubscribe(session.key());
        state.connections.unregister(session.user().uuid, session.key());
    }

    session.mark_closed();
    writer.abort();

    let prev = ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.sessions_gauge.record(prev.saturating_sub(1), &[]);
    info!(scope = S::NAME, session = %session.key(), "Machine stream session closed");
}

/// Initial snapshot bodies, in fixed order: static properties, runtime
/// state, disk usage, and (account/global scopes) active connections.
async fn initial_snapshot<S: Scope>(state: &AppState, machines: &[MachineId]) -> Vec<MessageBody> {
    let services = &state.services;

    let mut bodies = vec![
        MessageBody::DataStatic(services.properties_by_uuids(machines).await),
        MessageBody::DataDynamic(services.states_by_uuids(machines).await),
        MessageBody::DataDynamicDisks(services.disks_by_uuids(machines).await),
    ];

    if S::SNAPSHOT_CONNECTIONS {
        bodies.push(MessageBody::DataDynamicConnections(
            services.connections_by_uuids(machines).await,
        ));
    }

    bodies
}

/// Consumes the transport for liveness only. Inbound payloads are ignored,
/// the channel is server-push only.
async fn listen<S: Scope>(stream: &mut SplitStream<WebSocket>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => {
                debug!(scope = S::NAME, "Peer closed machine stream");
                break;
            },
            Ok(_) => {},
            Err(error) => {
                debug!(scope = S::NAME, %error, "Machine stream transport error");
                break;
            },
        }
    }
}
