// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Generic scope manager: subscriptions, broadcast loops, event dispatch.

use orchard_api::{MachineId, MessageBody, UserId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SubscriptionRegistry;
use super::scope::{AccountScope, BroadcastKind, Scope};
use super::session::{SessionChannel, SessionKey};
use crate::config::WebsocketsConfig;
use crate::services::Services;

struct BroadcastControl {
    running: HashSet<BroadcastKind>,
    cancel: CancellationToken,
}

/// One scope of the machine stream: a subscription registry plus the
/// periodic broadcast loops and event fan-out that feed it.
pub struct ScopeManager<S: Scope> {
    scope: S,
    services: Services,
    registry: SubscriptionRegistry<S::Key>,
    websockets: WebsocketsConfig,
    control: Mutex<BroadcastControl>,
}

impl<S: Scope> ScopeManager<S> {
    pub fn new(scope: S, services: Services, websockets: WebsocketsConfig) -> Arc<Self> {
        Arc::new(Self {
            scope,
            services,
            registry: SubscriptionRegistry::new(),
            websockets,
            control: Mutex::new(BroadcastControl {
                running: HashSet::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Registers the session under its interest key. Refuses sessions that
    /// already observed a close signal; returns whether the session was
    /// registered.
    pub fn subscribe(&self, session: Arc<SessionChannel>, interest: S::Key) -> bool {
        if !session.is_send_capable() {
            debug!(scope = S::NAME, session = %session.key(), "Refusing subscription of closing session");
            return false;
        }
        self.registry.subscribe(session, interest);
        true
    }

    pub fn unsubscribe(&self, key: SessionKey) {
        self.registry.unsubscribe(key);
    }

    /// Number of currently subscribed sessions in this scope.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Machines one subscription's interest key currently covers.
    pub async fn machines_for_interest(&self, interest: &S::Key) -> Vec<MachineId> {
        self.scope.machines_for(&self.services, interest).await
    }

    /// Starts the scope's broadcast loops. Safe to call repeatedly; only one
    /// loop per kind ever runs.
    pub fn start_broadcasts(self: Arc<Self>) {
        let mut control = self.control.lock();
        if control.cancel.is_cancelled() {
            control.cancel = CancellationToken::new();
        }

        for &kind in S::BROADCAST_KINDS {
            if !control.running.insert(kind) {
                continue;
            }
            info!(scope = S::NAME, kind = kind.label(), "Starting broadcast loop");
            tokio::spawn(Arc::clone(&self).run_broadcast_loop(kind, control.cancel.clone()));
        }
    }

    /// Signals all loops to terminate at their next cycle boundary.
    pub fn stop_broadcasts(&self) {
        let mut control = self.control.lock();
        control.cancel.cancel();
        control.running.clear();
    }

    async fn run_broadcast_loop(self: Arc<Self>, kind: BroadcastKind, cancel: CancellationToken) {
        let interval = self.interval_for(kind);
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.broadcast_pass(kind).await;

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {},
            }
        }
        info!(scope = S::NAME, kind = kind.label(), "Broadcast loop stopped");
    }

    const fn interval_for(&self, kind: BroadcastKind) -> Duration {
        match kind {
            BroadcastKind::State => self.websockets.state_interval(),
            BroadcastKind::Disks => self.websockets.disks_interval(),
            BroadcastKind::Connections => self.websockets.connections_interval(),
        }
    }

    /// One pass: snapshot the registry, refresh each live subscription's
    /// payload, and prune subscriptions whose transport went away. A payload
    /// failure for one machine never aborts the pass.
    pub async fn broadcast_pass(&self, kind: BroadcastKind) {
        let entries = self.registry.snapshot();
        if entries.is_empty() {
            return;
        }

        let mut dead: Vec<SessionKey> = Vec::new();

        for (key, subscription) in entries {
            if !subscription.session.is_send_capable() {
                dead.push(key);
                continue;
            }

            let machines = self.scope.machines_for(&self.services, &subscription.interest).await;
            let body = match kind {
                BroadcastKind::State => {
                    MessageBody::DataDynamic(self.services.states_by_uuids(&machines).await)
                },
                BroadcastKind::Disks => {
                    MessageBody::DataDynamicDisks(self.services.disks_by_uuids(&machines).await)
                },
                BroadcastKind::Connections => MessageBody::DataDynamicConnections(
                    self.services.connections_by_uuids(&machines).await,
                ),
            };

            if subscription.session.enqueue(body, false).is_err() {
                dead.push(key);
            }
        }

        if !dead.is_empty() {
            self.registry.prune(&dead);
            info!(scope = S::NAME, kind = kind.label(), pruned = dead.len(), "Pruned dead subscriptions");
        }
    }

    /// Fans an event body out to every session the machine reaches in this
    /// scope. Sends are enqueued without blocking; failing sessions are left
    /// for the next broadcast pass to prune.
    pub async fn dispatch_to_machine(&self, machine: MachineId, body: &MessageBody) {
        let sessions =
            self.scope.sessions_for_machine(&self.services, &self.registry, machine).await;
        self.dispatch_to_sessions(&sessions, body);
    }

    fn dispatch_to_sessions(&self, sessions: &[Arc<SessionChannel>], body: &MessageBody) {
        for session in sessions {
            if session.enqueue(body.clone(), true).is_err() {
                debug!(
                    scope = S::NAME,
                    session = %session.key(),
                    tag = body.tag(),
                    "Skipped event send to closed session"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SubscriptionRegistry<S::Key> {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn running_loop_count(&self) -> usize {
        self.control.lock().running.len()
    }
}

impl ScopeManager<AccountScope> {
    /// Delete fan-out with linkage captured before the machine was removed;
    /// resolving it now would come back empty.
    pub fn dispatch_to_users(&self, users: &[UserId], body: &MessageBody) {
        let targets: HashSet<UserId> = users.iter().copied().collect();
        let sessions = self.registry.sessions_matching(|key| targets.contains(key));
        self.dispatch_to_sessions(&sessions, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;
    use crate::sandbox::{MachineSeed, SandboxBackend};
    use crate::ws::scope::{GlobalScope, MachineScope};
    use crate::ws::session::SEND_QUEUE_CAPACITY;

    fn session() -> Arc<SessionChannel> {
        let user = User {
            uuid: UserId::generate(),
            username: "tester".to_string(),
            capabilities: std::collections::HashSet::new(),
        };
        SessionChannel::new(user, SEND_QUEUE_CAPACITY)
    }

    #[tokio::test]
    async fn pass_delivers_state_snapshot_for_subscribed_machine() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed::default());
        let manager =
            ScopeManager::new(MachineScope, SandboxBackend::services(&backend), WebsocketsConfig::default());

        let s = session();
        assert!(manager.subscribe(Arc::clone(&s), machine));
        manager.broadcast_pass(BroadcastKind::State).await;

        assert_eq!(s.queued_types(), vec!["DATA_DYNAMIC"]);
    }

    #[tokio::test]
    async fn disks_pass_delivers_disks_snapshots() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed::default());
        let manager = ScopeManager::new(
            MachineScope,
            SandboxBackend::services(&backend),
            WebsocketsConfig::default(),
        );

        let s = session();
        assert!(manager.subscribe(Arc::clone(&s), machine));
        manager.broadcast_pass(BroadcastKind::Disks).await;

        assert_eq!(s.queued_types(), vec!["DATA_DYNAMIC_DISKS"]);
        let frame: serde_json::Value =
            serde_json::from_str(&s.queued_texts()[0]).unwrap();
        let disks = &frame["body"][machine.to_string()]["disks"];
        assert!(disks[0]["occupied_bytes"].is_u64());
    }

    #[tokio::test]
    async fn pass_prunes_sessions_that_are_not_send_capable() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed::default());
        let manager =
            ScopeManager::new(MachineScope, SandboxBackend::services(&backend), WebsocketsConfig::default());

        let live = session();
        let dead = session();
        assert!(manager.subscribe(Arc::clone(&live), machine));
        assert!(manager.subscribe(Arc::clone(&dead), machine));
        dead.mark_closed();

        manager.broadcast_pass(BroadcastKind::State).await;

        assert!(manager.registry().contains(live.key()));
        assert!(!manager.registry().contains(dead.key()));
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn pruned_session_receives_nothing_from_later_passes() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed::default());
        let manager =
            ScopeManager::new(MachineScope, SandboxBackend::services(&backend), WebsocketsConfig::default());

        let s = session();
        assert!(manager.subscribe(Arc::clone(&s), machine));
        s.mark_closed();

        manager.broadcast_pass(BroadcastKind::State).await;
        manager.broadcast_pass(BroadcastKind::State).await;

        assert!(s.queued_types().is_empty());
    }

    #[tokio::test]
    async fn closing_sessions_are_refused_subscription() {
        let backend = SandboxBackend::new();
        let manager =
            ScopeManager::new(GlobalScope, SandboxBackend::services(&backend), WebsocketsConfig::default());

        let s = session();
        s.close(super::super::session::CLOSE_ADMINISTRATIVE, "closing");
        assert!(!manager.subscribe(s, ()));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_for_one_machine_does_not_poison_the_pass() {
        let backend = SandboxBackend::new();
        let healthy = backend.add_machine(MachineSeed::default());
        let flaky = backend.add_machine(MachineSeed::default());
        backend.inject_state_read_failures(flaky, 1);

        let manager =
            ScopeManager::new(GlobalScope, SandboxBackend::services(&backend), WebsocketsConfig::default());
        let s = session();
        assert!(manager.subscribe(Arc::clone(&s), ()));

        manager.broadcast_pass(BroadcastKind::State).await;
        manager.broadcast_pass(BroadcastKind::State).await;

        let frames = s.queued_texts();
        assert_eq!(frames.len(), 2);

        let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        let body = first["body"].as_object().unwrap();
        assert!(body.contains_key(&healthy.to_string()));
        assert!(!body.contains_key(&flaky.to_string()));

        // The fault was one-shot; the next tick recovers the machine.
        let second: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
        let body = second["body"].as_object().unwrap();
        assert!(body.contains_key(&healthy.to_string()));
        assert!(body.contains_key(&flaky.to_string()));
    }

    #[tokio::test]
    async fn start_broadcasts_is_idempotent() {
        let backend = SandboxBackend::new();
        let manager =
            ScopeManager::new(GlobalScope, SandboxBackend::services(&backend), WebsocketsConfig::default());

        Arc::clone(&manager).start_broadcasts();
        Arc::clone(&manager).start_broadcasts();

        assert_eq!(manager.running_loop_count(), GlobalScope::BROADCAST_KINDS.len());
        manager.stop_broadcasts();
        assert_eq!(manager.running_loop_count(), 0);
    }
}
