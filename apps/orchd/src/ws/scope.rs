// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The three visibility scopes of the machine stream.
//!
//! The scope managers share one skeleton and differ only in the registry
//! interest key, the machine→sessions lookup and the payload kinds their
//! periodic loops broadcast. That variation lives here; everything else is
//! generic in [`super::manager::ScopeManager`].

use async_trait::async_trait;
use orchard_api::{MachineId, UserId};
use std::collections::HashSet;
use std::sync::Arc;

use super::registry::SubscriptionRegistry;
use super::session::SessionChannel;
use crate::services::Services;

/// One dynamic-data kind a broadcast loop refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastKind {
    State,
    Disks,
    Connections,
}

impl BroadcastKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Disks => "disks",
            Self::Connections => "connections",
        }
    }
}

/// Scope-specific behavior of a scope manager.
#[async_trait]
pub trait Scope: Send + Sync + 'static {
    /// Interest key stored per subscription: a machine, an account, or
    /// nothing for the global scope.
    type Key: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    /// Dynamic-data kinds the periodic loops of this scope broadcast.
    const BROADCAST_KINDS: &'static [BroadcastKind];

    /// Whether the initial snapshot includes the connections payload.
    const SNAPSHOT_CONNECTIONS: bool;

    /// Machines one subscription's interest key covers.
    async fn machines_for(&self, services: &Services, key: &Self::Key) -> Vec<MachineId>;

    /// Sessions a machine-targeted event must reach in this scope.
    async fn sessions_for_machine(
        &self,
        services: &Services,
        registry: &SubscriptionRegistry<Self::Key>,
        machine: MachineId,
    ) -> Vec<Arc<SessionChannel>>;
}

/// Sessions each following one specific machine.
pub struct MachineScope;

#[async_trait]
impl Scope for MachineScope {
    type Key = MachineId;

    const NAME: &'static str = "subscribed";
    const BROADCAST_KINDS: &'static [BroadcastKind] = &[BroadcastKind::State, BroadcastKind::Disks];
    const SNAPSHOT_CONNECTIONS: bool = false;

    async fn machines_for(&self, _services: &Services, key: &MachineId) -> Vec<MachineId> {
        vec![*key]
    }

    async fn sessions_for_machine(
        &self,
        _services: &Services,
        registry: &SubscriptionRegistry<MachineId>,
        machine: MachineId,
    ) -> Vec<Arc<SessionChannel>> {
        registry.sessions_matching(|key| *key == machine)
    }
}

/// Sessions each following all machines linked to one account.
pub struct AccountScope;

#[async_trait]
impl Scope for AccountScope {
    type Key = UserId;

    const NAME: &'static str = "account";
    const BROADCAST_KINDS: &'static [BroadcastKind] =
        &[BroadcastKind::State, BroadcastKind::Disks, BroadcastKind::Connections];
    const SNAPSHOT_CONNECTIONS: bool = true;

    async fn machines_for(&self, services: &Services, key: &UserId) -> Vec<MachineId> {
        services.user_machine_uuids(*key).await
    }

    async fn sessions_for_machine(
        &self,
        services: &Services,
        registry: &SubscriptionRegistry<UserId>,
        machine: MachineId,
    ) -> Vec<Arc<SessionChannel>> {
        let linked: HashSet<UserId> =
            services.directory.machine_linked_accounts(machine).await.into_iter().collect();
        registry.sessions_matching(|key| linked.contains(key))
    }
}

/// Privileged sessions following every managed machine.
pub struct GlobalScope;

#[async_trait]
impl Scope for GlobalScope {
    type Key = ();

    const NAME: &'static str = "global";
    const BROADCAST_KINDS: &'static [BroadcastKind] = &[BroadcastKind::State, BroadcastKind::Disks];
    const SNAPSHOT_CONNECTIONS: bool = true;

    async fn machines_for(&self, services: &Services, _key: &()) -> Vec<MachineId> {
        services.directory.all_machines().await
    }

    async fn sessions_for_machine(
        &self,
        _services: &Services,
        registry: &SubscriptionRegistry<()>,
        _machine: MachineId,
    ) -> Vec<Arc<SessionChannel>> {
        registry.all_sessions()
    }
}
