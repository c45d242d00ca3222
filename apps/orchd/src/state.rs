// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use crate::config::Config;
use crate::services::Services;
use crate::ws::tracker::ConnectionTracker;
use crate::ws::MachineStreams;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: Services,
    pub streams: Arc<MachineStreams>,
    pub connections: Arc<ConnectionTracker>,
}
