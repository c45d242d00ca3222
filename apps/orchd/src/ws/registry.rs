// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-scope subscription bookkeeping.
//!
//! A registry is the sole owner of its scope's subscription records. All
//! mutation goes through `subscribe`, `unsubscribe` and `prune`; broadcast
//! passes and event dispatch iterate a consistent-at-read snapshot so a
//! concurrent mutation never invalidates an in-flight pass.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::session::{SessionChannel, SessionKey};

/// A registry entry binding one session to its interest key.
pub struct Subscription<K> {
    pub session: Arc<SessionChannel>,
    pub interest: K,
}

impl<K: Clone> Clone for Subscription<K> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session), interest: self.interest.clone() }
    }
}

/// Session-keyed subscription map for one scope.
pub struct SubscriptionRegistry<K> {
    entries: RwLock<HashMap<SessionKey, Subscription<K>>>,
}

impl<K: Clone> SubscriptionRegistry<K> {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Inserts the session; an existing entry under the same session key is
    /// overwritten (idempotent reconnect).
    pub fn subscribe(&self, session: Arc<SessionChannel>, interest: K) {
        let key = session.key();
        self.entries.write().insert(key, Subscription { session, interest });
    }

    /// Removes the session's entry; no-op when absent.
    pub fn unsubscribe(&self, key: SessionKey) {
        self.entries.write().remove(&key);
    }

    /// Bulk-removes entries found dead during a broadcast pass.
    pub fn prune(&self, keys: &[SessionKey]) {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(key);
        }
    }

    /// Consistent-at-read copy of all entries, for pass iteration.
    pub fn snapshot(&self) -> Vec<(SessionKey, Subscription<K>)> {
        self.entries.read().iter().map(|(key, sub)| (*key, sub.clone())).collect()
    }

    /// Sessions whose interest key satisfies the predicate.
    pub fn sessions_matching(&self, pred: impl Fn(&K) -> bool) -> Vec<Arc<SessionChannel>> {
        self.entries
            .read()
            .values()
            .filter(|sub| pred(&sub.interest))
            .map(|sub| Arc::clone(&sub.session))
            .collect()
    }

    /// Every subscribed session.
    pub fn all_sessions(&self) -> Vec<Arc<SessionChannel>> {
        self.entries.read().values().map(|sub| Arc::clone(&sub.session)).collect()
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.entries.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K: Clone> Default for SubscriptionRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;
    use crate::ws::session::SEND_QUEUE_CAPACITY;
    use orchard_api::MachineId;

    fn session() -> Arc<SessionChannel> {
        let user = User {
            uuid: orchard_api::UserId::generate(),
            username: "tester".to_string(),
            capabilities: std::collections::HashSet::new(),
        };
        SessionChannel::new(user, SEND_QUEUE_CAPACITY)
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_previous_state() {
        let registry = SubscriptionRegistry::<MachineId>::new();
        let resident = session();
        registry.subscribe(Arc::clone(&resident), MachineId::generate());

        let transient = session();
        registry.subscribe(Arc::clone(&transient), MachineId::generate());
        assert_eq!(registry.len(), 2);

        registry.unsubscribe(transient.key());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(resident.key()));
        assert!(!registry.contains(transient.key()));
    }

    #[test]
    fn resubscribe_overwrites_instead_of_duplicating() {
        let registry = SubscriptionRegistry::<MachineId>::new();
        let s = session();
        let first = MachineId::generate();
        let second = MachineId::generate();

        registry.subscribe(Arc::clone(&s), first);
        registry.subscribe(Arc::clone(&s), second);

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].1.interest, second);
    }

    #[test]
    fn unsubscribe_of_unknown_key_is_a_noop() {
        let registry = SubscriptionRegistry::<MachineId>::new();
        let s = session();
        registry.unsubscribe(s.key());
        assert!(registry.is_empty());
    }

    #[test]
    fn prune_removes_only_the_given_keys() {
        let registry = SubscriptionRegistry::<()>::new();
        let keep = session();
        let dead_a = session();
        let dead_b = session();
        for s in [&keep, &dead_a, &dead_b] {
            registry.subscribe(Arc::clone(s), ());
        }

        registry.prune(&[dead_a.key(), dead_b.key()]);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(keep.key()));
    }

    #[test]
    fn sessions_matching_filters_by_interest() {
        let registry = SubscriptionRegistry::<MachineId>::new();
        let machine = MachineId::generate();
        let other = MachineId::generate();

        let interested = session();
        registry.subscribe(Arc::clone(&interested), machine);
        registry.subscribe(session(), other);

        let matched = registry.sessions_matching(|m| *m == machine);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].key(), interested.key());
    }
}
