// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The real-time machine-state stream fabric.
//!
//! Three scope managers keep connected front-end sessions synchronized with
//! machine state: one per followed machine, one per account, one global.
//! [`MachineStreams`] is the single entry point the REST surface talks to.

pub mod handler;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod scope;
pub mod session;
pub mod tracker;

use orchard_api::{MachineEventBody, MachineId, MessageBody, PropertiesMap, UserId};
use std::sync::Arc;
use tracing::warn;

use self::manager::ScopeManager;
use self::scope::{AccountScope, GlobalScope, MachineScope};

use crate::config::WebsocketsConfig;
use crate::services::Services;

/// Orchestrator of the stream fabric. Routes lifecycle events to all scopes
/// and starts/stops the broadcast loops.
///
/// Constructed once at startup and injected into the endpoint handlers; it
/// has no hidden global state.
pub struct MachineStreams {
    pub subscribed: Arc<ScopeManager<MachineScope>>,
    pub account: Arc<ScopeManager<AccountScope>>,
    pub global: Arc<ScopeManager<GlobalScope>>,
    services: Services,
}

impl MachineStreams {
    pub fn new(services: Services, websockets: WebsocketsConfig) -> Arc<Self> {
        Arc::new(Self {
            subscribed: ScopeManager::new(MachineScope, services.clone(), websockets),
            account: ScopeManager::new(AccountScope, services.clone(), websockets),
            global: ScopeManager::new(GlobalScope, services.clone(), websockets),
            services,
        })
    }

    pub fn start_all_broadcasts(&self) {
        Arc::clone(&self.subscribed).start_broadcasts();
        Arc::clone(&self.account).start_broadcasts();
        Arc::clone(&self.global).start_broadcasts();
    }

    pub fn stop_all_broadcasts(&self) {
        self.subscribed.stop_broadcasts();
        self.account.stop_broadcasts();
        self.global.stop_broadcasts();
    }

    /// A machine was created. Not routed to the per-machine scope: no
    /// session can have subscribed to a machine that did not exist yet.
    pub async fn on_machine_create(&self, machine: MachineId) {
        let Ok(properties) = self.services.payloads.properties(machine).await else {
            warn!(%machine, "Skipping CREATE event, machine properties unavailable");
            return;
        };

        let body = MessageBody::Create(properties);
        self.account.dispatch_to_machine(machine, &body).await;
        self.global.dispatch_to_machine(machine, &body).await;
    }

    /// A machine was deleted. `linked_accounts` is captured by the caller
    /// before the underlying resource is removed; resolving it afterwards
    /// would return empty.
    pub async fn on_machine_delete(&self, machine: MachineId, linked_accounts: &[UserId]) {
        let body = MessageBody::Delete(MachineEventBody::ok(machine));
        self.subscribed.dispatch_to_machine(machine, &body).await;
        self.account.dispatch_to_users(linked_accounts, &body);
        self.global.dispatch_to_machine(machine, &body).await;
    }

    /// A machine's static properties changed; affected sessions get a fresh
    /// `DATA_STATIC` for that machine.
    pub async fn on_machine_modify(&self, machine: MachineId) {
        let Ok(properties) = self.services.payloads.properties(machine).await else {
            warn!(%machine, "Skipping modify event, machine properties unavailable");
            return;
        };

        let mut map = PropertiesMap::new();
        map.insert(machine, properties);
        self.dispatch_everywhere(machine, &MessageBody::DataStatic(map)).await;
    }

    pub async fn on_machine_bootup_start(&self, machine: MachineId) {
        self.dispatch_everywhere(machine, &MessageBody::BootupStart(MachineEventBody::ok(machine)))
            .await;
    }

    pub async fn on_machine_bootup_success(&self, machine: MachineId) {
        self.dispatch_everywhere(
            machine,
            &MessageBody::BootupSuccess(MachineEventBody::ok(machine)),
        )
        .await;
    }

    pub async fn on_machine_bootup_fail(&self, machine: MachineId, error: &str) {
        self.dispatch_everywhere(
            machine,
            &MessageBody::BootupFail(MachineEventBody::failed(machine, error)),
        )
        .await;
    }

    pub async fn on_machine_shutdown_start(&self, machine: MachineId) {
        self.dispatch_everywhere(
            machine,
            &MessageBody::ShutdownStart(MachineEventBody::ok(machine)),
        )
        .await;
    }

    pub async fn on_machine_shutdown_success(&self, machine: MachineId) {
        self.dispatch_everywhere(
            machine,
            &MessageBody::ShutdownSuccess(MachineEventBody::ok(machine)),
        )
        .await;
    }

    pub async fn on_machine_shutdown_fail(&self, machine: MachineId, error: &str) {
        self.dispatch_everywhere(
            machine,
            &MessageBody::ShutdownFail(MachineEventBody::failed(machine, error)),
        )
        .await;
    }

    async fn dispatch_everywhere(&self, machine: MachineId, body: &MessageBody) {
        self.subscribed.dispatch_to_machine(machine, body).await;
        self.account.dispatch_to_machine(machine, body).await;
        self.global.dispatch_to_machine(machine, body).await;
    }
}
