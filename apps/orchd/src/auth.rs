// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Identity resolution and capability checks.
//!
//! Orchard does not implement token issuance itself; it consumes an
//! authentication service through the [`Authenticator`] contract and keeps
//! only the resolved identity plus its capability set.

use async_trait::async_trait;
use orchard_api::UserId;
use std::collections::HashSet;

/// Capabilities gating privileged operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Observe every managed machine, regardless of linkage.
    ViewAllVms,
    /// Create, modify, delete, start and stop any machine.
    ManageAllVms,
}

/// A resolved identity attached to a request or session.
#[derive(Debug, Clone)]
pub struct User {
    pub uuid: UserId,
    pub username: String,
    pub capabilities: HashSet<Capability>,
}

impl User {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Token-to-identity resolution service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves an access token; `None` on invalid or expired tokens.
    async fn authenticate(&self, access_token: &str) -> Option<User>;
}
