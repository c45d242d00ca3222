// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cross-scope bookkeeping of which sessions belong to which user, so an
//! administrative action (account deletion, forced logout) can close every
//! connection of that user at once.

use orchard_api::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::session::{SessionChannel, SessionKey, CLOSE_ADMINISTRATIVE};

#[derive(Default)]
pub struct ConnectionTracker {
    sessions: Mutex<HashMap<UserId, Vec<Arc<SessionChannel>>>>,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session: &Arc<SessionChannel>) {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(session.user().uuid).or_default();
        entry.retain(|s| s.is_send_capable());
        entry.push(Arc::clone(session));
    }

    pub fn unregister(&self, user: UserId, key: SessionKey) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(&user) {
            entry.retain(|s| s.key() != key);
            if entry.is_empty() {
                sessions.remove(&user);
            }
        }
    }

    /// Closes every live session of the user. The close frame is delivered
    /// through each session's queue; registrations arriving after this call
    /// observe the close signal and are refused by the scope managers.
    pub fn disconnect_user(&self, user: UserId, code: u16, reason: &str) {
        let targets = self.sessions.lock().get(&user).cloned().unwrap_or_default();

        if targets.is_empty() {
            return;
        }

        info!(%user, code, sessions = targets.len(), "Administratively disconnecting user sessions");
        for session in targets {
            session.close(code, reason);
        }
    }

    /// `disconnect_user` with the administrative close code.
    pub fn disconnect_user_default(&self, user: UserId, reason: &str) {
        self.disconnect_user(user, CLOSE_ADMINISTRATIVE, reason);
    }
}
