// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A self-contained in-memory backend.
//!
//! Implements every collaborator contract of [`crate::services`] against
//! process-local state. This backs the default deployment mode (no hypervisor
//! attached) and the test suite; production deployments swap in the real
//! hypervisor, directory and lifecycle adapters.

use async_trait::async_trait;
use orchard_api::{
    ActiveConnection, ConnectionProtocol, DiskFormat, DynamicDiskInfo, MachineConnectionsPayload,
    MachineDisksPayload, MachineId, MachinePropertiesPayload, MachineStatePayload, StaticDiskInfo,
    UserId,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{Authenticator, Capability, User};
use crate::services::{
    CreateMachineSpec, LifecycleError, MachineDirectory, MachineLifecycle, ModifyMachineSpec,
    PayloadSource, ProviderError, Services,
};

/// One managed machine and its full observable state.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub owner: Option<UserId>,
    pub assigned_clients: Vec<UserId>,
    pub display_port: Option<u16>,
    pub connections: HashMap<ConnectionProtocol, String>,
    pub disks: Vec<DiskRecord>,
    pub active: bool,
    pub loading: bool,
    pub vcpu: u32,
    pub ram_max: u64,
    pub ram_used: u64,
    pub boot_timestamp: Option<time::OffsetDateTime>,
    pub active_connections: Vec<ActiveConnection>,
}

#[derive(Debug, Clone)]
pub struct DiskRecord {
    pub system: bool,
    pub name: String,
    pub size_bytes: u64,
    pub format: DiskFormat,
    pub occupied_bytes: u64,
}

/// Seed description for [`SandboxBackend::add_machine`].
#[derive(Debug, Clone, Default)]
pub struct MachineSeed {
    pub title: Option<String>,
    pub owner: Option<UserId>,
    pub assigned_clients: Vec<UserId>,
    pub vcpu: u32,
    pub ram_max: u64,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining state reads that fail for this machine.
    state_read_failures: u32,
    fail_next_start: bool,
}

/// In-memory implementation of all collaborator services.
#[derive(Default)]
pub struct SandboxBackend {
    machines: RwLock<HashMap<MachineId, MachineRecord>>,
    users: RwLock<HashMap<UserId, User>>,
    tokens: RwLock<HashMap<String, UserId>>,
    faults: RwLock<HashMap<MachineId, Faults>>,
}

impl SandboxBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundles the backend into the service set the application consumes.
    pub fn services(this: &Arc<Self>) -> Services {
        Services {
            auth: Arc::clone(this) as Arc<dyn Authenticator>,
            directory: Arc::clone(this) as Arc<dyn MachineDirectory>,
            payloads: Arc::clone(this) as Arc<dyn PayloadSource>,
            lifecycle: Arc::clone(this) as Arc<dyn MachineLifecycle>,
        }
    }

    /// Registers a user and returns its id plus a valid access token.
    pub fn add_user(
        &self,
        username: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> (UserId, String) {
        let uuid = UserId::generate();
        let user = User {
            uuid,
            username: username.to_string(),
            capabilities: capabilities.into_iter().collect(),
        };
        let token = Uuid::new_v4().simple().to_string();

        self.users.write().insert(uuid, user);
        self.tokens.write().insert(token.clone(), uuid);
        (uuid, token)
    }

    /// Registers a machine with a boot disk and sensible defaults.
    pub fn add_machine(&self, seed: MachineSeed) -> MachineId {
        let machine = MachineId::generate();
        self.add_machine_with_id(machine, seed);
        machine
    }

    /// Registers a machine under a caller-chosen id (scenario fixtures).
    pub fn add_machine_with_id(&self, machine: MachineId, seed: MachineSeed) {
        let record = MachineRecord {
            title: seed.title,
            description: None,
            tags: Vec::new(),
            owner: seed.owner,
            assigned_clients: seed.assigned_clients,
            display_port: Some(5900),
            connections: HashMap::new(),
            disks: vec![DiskRecord {
                system: true,
                name: "system".to_string(),
                size_bytes: 10 * 1024 * 1024 * 1024,
                format: DiskFormat::Qcow2,
                occupied_bytes: 0,
            }],
            active: false,
            loading: false,
            vcpu: seed.vcpu.max(1),
            ram_max: if seed.ram_max == 0 { 2_097_152 } else { seed.ram_max },
            ram_used: 0,
            boot_timestamp: None,
            active_connections: Vec::new(),
        };
        self.machines.write().insert(machine, record);
    }

    /// Makes the next `count` state reads for the machine fail.
    pub fn inject_state_read_failures(&self, machine: MachineId, count: u32) {
        self.faults.write().entry(machine).or_default().state_read_failures = count;
    }

    /// Makes the next start attempt for the machine fail.
    pub fn inject_start_failure(&self, machine: MachineId) {
        self.faults.write().entry(machine).or_default().fail_next_start = true;
    }

    fn account_ref(&self, user: UserId) -> Option<orchard_api::AccountRef> {
        self.users
            .read()
            .get(&user)
            .map(|u| orchard_api::AccountRef { uuid: u.uuid, username: u.username.clone() })
    }

    fn record(&self, machine: MachineId) -> Result<MachineRecord, ProviderError> {
        self.machines
            .read()
            .get(&machine)
            .cloned()
            .ok_or(ProviderError::NotManaged(machine))
    }
}

#[async_trait]
impl Authenticator for SandboxBackend {
    async fn authenticate(&self, access_token: &str) -> Option<User> {
        let uuid = *self.tokens.read().get(access_token)?;
        self.users.read().get(&uuid).cloned()
    }
}

#[async_trait]
impl MachineDirectory for SandboxBackend {
    async fn machine_linked_accounts(&self, machine: MachineId) -> Vec<UserId> {
        let machines = self.machines.read();
        let Some(record) = machines.get(&machine) else {
            return Vec::new();
        };

        let mut linked: Vec<UserId> = record.owner.into_iter().collect();
        for client in &record.assigned_clients {
            if !linked.contains(client) {
                linked.push(*client);
            }
        }
        linked
    }

    async fn user_machines(&self, user: UserId) -> HashSet<MachineId> {
        self.machines
            .read()
            .iter()
            .filter(|(_, record)| {
                record.owner == Some(user) || record.assigned_clients.contains(&user)
            })
            .map(|(machine, _)| *machine)
            .collect()
    }

    async fn all_machines(&self) -> Vec<MachineId> {
        let mut machines: Vec<MachineId> = self.machines.read().keys().copied().collect();
        machines.sort_unstable();
        machines
    }

    async fn machine_exists(&self, machine: MachineId) -> bool {
        self.machines.read().contains_key(&machine)
    }
}

#[async_trait]
impl PayloadSource for SandboxBackend {
    async fn properties(
        &self,
        machine: MachineId,
    ) -> Result<MachinePropertiesPayload, ProviderError> {
        let record = self.record(machine)?;

        let assigned_clients = record
            .assigned_clients
            .iter()
            .filter_map(|client| self.account_ref(*client).map(|r| (*client, r)))
            .collect();

        Ok(MachinePropertiesPayload {
            uuid: machine,
            title: record.title,
            tags: Some(record.tags),
            description: record.description,
            owner: record.owner.and_then(|owner| self.account_ref(owner)),
            assigned_clients,
            display_port: record.display_port,
            connections: Some(record.connections),
            disks: Some(
                record
                    .disks
                    .iter()
                    .map(|disk| StaticDiskInfo {
                        system: disk.system,
                        name: disk.name.clone(),
                        size_bytes: disk.size_bytes,
                        format: disk.format,
                    })
                    .collect(),
            ),
        })
    }

    async fn state(&self, machine: MachineId) -> Result<MachineStatePayload, ProviderError> {
        {
            let mut faults = self.faults.write();
            if let Some(fault) = faults.get_mut(&machine) {
                if fault.state_read_failures > 0 {
                    fault.state_read_failures -= 1;
                    return Err(ProviderError::Hypervisor("simulated read failure".to_string()));
                }
            }
        }

        let record = self.record(machine)?;
        Ok(MachineStatePayload {
            uuid: machine,
            active: record.active,
            loading: record.loading,
            vcpu: record.vcpu,
            ram_max: Some(record.ram_max),
            ram_used: Some(if record.active { record.ram_used } else { 0 }),
            boot_timestamp: record.boot_timestamp,
        })
    }

    async fn disks(&self, machine: MachineId) -> Result<MachineDisksPayload, ProviderError> {
        let record = self.record(machine)?;
        Ok(MachineDisksPayload {
            uuid: machine,
            disks: Some(
                record
                    .disks
                    .iter()
                    .map(|disk| DynamicDiskInfo {
                        system: disk.system,
                        name: disk.name.clone(),
                        size_bytes: disk.size_bytes,
                        format: disk.format,
                        occupied_bytes: disk.occupied_bytes,
                    })
                    .collect(),
            ),
        })
    }

    async fn connections(
        &self,
        machine: MachineId,
    ) -> Result<MachineConnectionsPayload, ProviderError> {
        let record = self.record(machine)?;
        Ok(MachineConnectionsPayload { active_connections: Some(record.active_connections) })
    }
}

#[async_trait]
impl MachineLifecycle for SandboxBackend {
    async fn create(
        &self,
        spec: CreateMachineSpec,
        owner: UserId,
    ) -> Result<MachineId, LifecycleError> {
        Ok(self.add_machine(MachineSeed {
            title: spec.title,
            owner: Some(owner),
            assigned_clients: Vec::new(),
            vcpu: spec.vcpu,
            ram_max: spec.ram_max,
        }))
    }

    async fn delete(&self, machine: MachineId) -> Result<(), LifecycleError> {
        self.machines
            .write()
            .remove(&machine)
            .map(|_| ())
            .ok_or(LifecycleError::NotFound(machine))
    }

    async fn modify(
        &self,
        machine: MachineId,
        changes: ModifyMachineSpec,
    ) -> Result<(), LifecycleError> {
        let mut machines = self.machines.write();
        let record = machines.get_mut(&machine).ok_or(LifecycleError::NotFound(machine))?;

        if let Some(title) = changes.title {
            record.title = Some(title);
        }
        if let Some(description) = changes.description {
            record.description = Some(description);
        }
        if let Some(tags) = changes.tags {
            record.tags = tags;
        }
        Ok(())
    }

    async fn start(&self, machine: MachineId) -> Result<(), LifecycleError> {
        if self.faults.write().get_mut(&machine).is_some_and(|fault| {
            std::mem::take(&mut fault.fail_next_start)
        }) {
            return Err(LifecycleError::Failed("simulated start failure".to_string()));
        }

        let mut machines = self.machines.write();
        let record = machines.get_mut(&machine).ok_or(LifecycleError::NotFound(machine))?;
        record.active = true;
        record.loading = false;
        record.ram_used = record.ram_max / 4;
        record.boot_timestamp = Some(time::OffsetDateTime::now_utc());
        Ok(())
    }

    async fn stop(&self, machine: MachineId) -> Result<(), LifecycleError> {
        let mut machines = self.machines.write();
        let record = machines.get_mut(&machine).ok_or(LifecycleError::NotFound(machine))?;
        record.active = false;
        record.ram_used = 0;
        record.boot_timestamp = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linkage_unions_owner_and_clients_without_duplicates() {
        let backend = SandboxBackend::new();
        let (owner, _) = backend.add_user("owner", []);
        let (client, _) = backend.add_user("client", []);

        let machine = backend.add_machine(MachineSeed {
            owner: Some(owner),
            assigned_clients: vec![client, owner],
            ..MachineSeed::default()
        });

        let linked = backend.machine_linked_accounts(machine).await;
        assert_eq!(linked.len(), 2);
        assert!(linked.contains(&owner));
        assert!(linked.contains(&client));
    }

    #[tokio::test]
    async fn state_read_faults_are_consumed() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed::default());
        backend.inject_state_read_failures(machine, 1);

        assert!(backend.state(machine).await.is_err());
        assert!(backend.state(machine).await.is_ok());
    }

    #[tokio::test]
    async fn tokens_resolve_to_their_user() {
        let backend = SandboxBackend::new();
        let (uuid, token) = backend.add_user("admin", [Capability::ViewAllVms]);

        let user = backend.authenticate(&token).await.unwrap();
        assert_eq!(user.uuid, uuid);
        assert!(user.has(Capability::ViewAllVms));
        assert!(backend.authenticate("bogus").await.is_none());
    }

    #[tokio::test]
    async fn stopped_machines_report_zero_ram_used() {
        let backend = SandboxBackend::new();
        let machine = backend.add_machine(MachineSeed { vcpu: 2, ..MachineSeed::default() });

        backend.start(machine).await.unwrap();
        let running = backend.state(machine).await.unwrap();
        assert!(running.active);
        assert!(running.boot_timestamp.is_some());

        backend.stop(machine).await.unwrap();
        let stopped = backend.state(machine).await.unwrap();
        assert!(!stopped.active);
        assert_eq!(stopped.ram_used, Some(0));
    }
}
