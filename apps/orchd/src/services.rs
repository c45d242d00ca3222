// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Contracts of the hypervisor-side collaborators.
//!
//! The real-time fabric and the REST surface consume the hypervisor daemon,
//! the user directory and the machine lifecycle engine exclusively through
//! the traits below. Every payload read is per-machine and independently
//! fallible; the aggregation helpers on [`Services`] tolerate per-machine
//! failures by omitting the machine from the resulting snapshot map.

use async_trait::async_trait;
use orchard_api::{
    ConnectionsMap, DisksMap, MachineConnectionsPayload, MachineDisksPayload, MachineId,
    MachinePropertiesPayload, MachineStatePayload, PropertiesMap, StatesMap, UserId,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::auth::Authenticator;

/// Failure of a single per-machine payload read.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The machine is not managed by this server; a server-side invariant
    /// failure when reached from a REST handler.
    #[error("machine {0} is not managed by this server")]
    NotManaged(MachineId),
    #[error("hypervisor query failed: {0}")]
    Hypervisor(String),
}

/// Failure of a machine lifecycle mutation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("machine {0} could not be found")]
    NotFound(MachineId),
    #[error("{0}")]
    Failed(String),
}

/// Linkage queries against the user/machine directory.
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    /// Union of the machine's owner and assigned clients. May be stale for
    /// machines that were just deleted; delete flows capture it beforehand.
    async fn machine_linked_accounts(&self, machine: MachineId) -> Vec<UserId>;

    /// All machines owned by or assigned to the user.
    async fn user_machines(&self, user: UserId) -> HashSet<MachineId>;

    /// All managed machines.
    async fn all_machines(&self) -> Vec<MachineId>;

    async fn machine_exists(&self, machine: MachineId) -> bool;
}

/// Per-machine payload reads against the hypervisor.
///
/// Implementations acquire their hypervisor connection per call in read-only
/// mode and release it on every exit path.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn properties(&self, machine: MachineId)
        -> Result<MachinePropertiesPayload, ProviderError>;

    async fn state(&self, machine: MachineId) -> Result<MachineStatePayload, ProviderError>;

    async fn disks(&self, machine: MachineId) -> Result<MachineDisksPayload, ProviderError>;

    async fn connections(
        &self,
        machine: MachineId,
    ) -> Result<MachineConnectionsPayload, ProviderError>;
}

/// Description of a machine to create.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CreateMachineSpec {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub vcpu: u32,
    /// Maximum memory in KiB.
    pub ram_max: u64,
}

/// Partial update of a machine's static properties.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct ModifyMachineSpec {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Machine lifecycle mutations executed against the hypervisor.
#[async_trait]
pub trait MachineLifecycle: Send + Sync {
    async fn create(&self, spec: CreateMachineSpec, owner: UserId)
        -> Result<MachineId, LifecycleError>;

    async fn delete(&self, machine: MachineId) -> Result<(), LifecycleError>;

    async fn modify(&self, machine: MachineId, changes: ModifyMachineSpec)
        -> Result<(), LifecycleError>;

    async fn start(&self, machine: MachineId) -> Result<(), LifecycleError>;

    async fn stop(&self, machine: MachineId) -> Result<(), LifecycleError>;
}

/// The bundle of collaborator services injected into the application.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn Authenticator>,
    pub directory: Arc<dyn MachineDirectory>,
    pub payloads: Arc<dyn PayloadSource>,
    pub lifecycle: Arc<dyn MachineLifecycle>,
}

impl Services {
    /// Static properties for the given machines; failed machines are omitted.
    pub async fn properties_by_uuids(&self, machines: &[MachineId]) -> PropertiesMap {
        let payloads = Arc::clone(&self.payloads);
        self.collect(machines, "properties", move |machine| {
            let payloads = Arc::clone(&payloads);
            async move { payloads.properties(machine).await }
        })
        .await
    }

    /// Runtime state for the given machines; failed machines are omitted.
    pub async fn states_by_uuids(&self, machines: &[MachineId]) -> StatesMap {
        let payloads = Arc::clone(&self.payloads);
        self.collect(machines, "state", move |machine| {
            let payloads = Arc::clone(&payloads);
            async move { payloads.state(machine).await }
        })
        .await
    }

    /// Disk usage for the given machines; failed machines are omitted.
    pub async fn disks_by_uuids(&self, machines: &[MachineId]) -> DisksMap {
        let payloads = Arc::clone(&self.payloads);
        self.collect(machines, "disks", move |machine| {
            let payloads = Arc::clone(&payloads);
            async move { payloads.disks(machine).await }
        })
        .await
    }

    /// Active connections for the given machines; failed machines are omitted.
    pub async fn connections_by_uuids(&self, machines: &[MachineId]) -> ConnectionsMap {
        let payloads = Arc::clone(&self.payloads);
        self.collect(machines, "connections", move |machine| {
            let payloads = Arc::clone(&payloads);
            async move { payloads.connections(machine).await }
        })
        .await
    }

    /// Machines linked to the user, in stable order.
    pub async fn user_machine_uuids(&self, user: UserId) -> Vec<MachineId> {
        let mut machines: Vec<MachineId> = self.directory.user_machines(user).await.into_iter().collect();
        machines.sort_unstable();
        machines
    }

    // One machine failing must not poison the whole snapshot: the machine is
    // dropped from the map and the failure is logged.
    async fn collect<T, F, Fut>(
        &self,
        machines: &[MachineId],
        kind: &str,
        fetch: F,
    ) -> std::collections::HashMap<MachineId, T>
    where
        F: Fn(MachineId) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut map = std::collections::HashMap::with_capacity(machines.len());

        for &machine in machines {
            if !self.directory.machine_exists(machine).await {
                continue;
            }
            match fetch(machine).await {
                Ok(payload) => {
                    map.insert(machine, payload);
                },
                Err(error) => {
                    warn!(%machine, kind, %error, "Failed to fetch machine payload, omitting from snapshot");
                },
            }
        }

        map
    }
}
