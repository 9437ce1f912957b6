//! Session registry shared by every connection of an acceptor.
//!
//! The registry maps a [`SessionId`] to the [`ConnectionHandle`] that logged
//! it on, and tracks which connections are still open. Both live behind one
//! `watch` channel: every mutation happens inside a single lock acquisition
//! and wakes every waiter, so a waiter that observes a connection as
//! disconnected also observes the registry entries it owned as gone.
//!
//! Mutations that add or drop a session entry return a [`Generation`]. The
//! stamp is taken inside the same lock acquisition, so comparing stamps tells
//! which of two racing changes to one session landed last.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::session::SessionId;

/// Position of a session entry change in the registry's mutation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, ConnectionHandle>,
    connections: HashSet<ConnectionId>,
    generation: u64,
}

impl RegistryState {
    fn next_generation(&mut self) -> Generation {
        self.generation += 1;
        Generation(self.generation)
    }
}

/// Concurrent session map with wait/notify semantics.
#[derive(Debug)]
pub struct SessionRegistry {
    state: watch::Sender<RegistryState>,
}

/// Shared session registry type
pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records an accepted connection as open.
    pub fn register_connection(&self, connection: ConnectionId) {
        self.state.send_modify(|s| {
            s.connections.insert(connection);
        });
    }

    /// Inserts or replaces the entry for `id`, returning the displaced handle.
    pub fn upsert(&self, id: SessionId, handle: ConnectionHandle) -> (Option<ConnectionHandle>, Generation) {
        let mut previous = None;
        let mut generation = Generation(0);
        self.state.send_modify(|s| {
            previous = s.sessions.insert(id, handle);
            generation = s.next_generation();
        });
        (previous, generation)
    }

    /// Removes the entry for `id` regardless of which connection owns it.
    pub fn remove(&self, id: &SessionId) -> Option<ConnectionHandle> {
        let mut removed = None;
        self.state.send_modify(|s| {
            removed = s.sessions.remove(id);
            if removed.is_some() {
                s.next_generation();
            }
        });
        removed
    }

    /// Removes the entry for `id` only if `connection` still owns it.
    pub fn remove_owned(&self, id: &SessionId, connection: ConnectionId) -> Option<Generation> {
        let mut removed = None;
        self.state.send_modify(|s| {
            if s.sessions.get(id).map(ConnectionHandle::id) == Some(connection) {
                s.sessions.remove(id);
                removed = Some(s.next_generation());
            }
        });
        removed
    }

    /// Marks `connection` closed and drops every entry it still owns.
    ///
    /// Returns the sessions that were removed. Calling it twice for the same
    /// connection returns an empty list the second time.
    pub fn disconnect(&self, connection: ConnectionId) -> Vec<(SessionId, Generation)> {
        let mut removed = Vec::new();
        self.state.send_modify(|s| {
            s.connections.remove(&connection);
            let owned: Vec<SessionId> = s
                .sessions
                .iter()
                .filter(|(_, handle)| handle.id() == connection)
                .map(|(id, _)| id.clone())
                .collect();
            for id in owned {
                s.sessions.remove(&id);
                let generation = s.next_generation();
                removed.push((id, generation));
            }
        });
        if !removed.is_empty() {
            debug!(connection = %connection, sessions = removed.len(), "released sessions of closed connection");
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.state.borrow().sessions.contains_key(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<ConnectionHandle> {
        self.state.borrow().sessions.get(id).cloned()
    }

    /// Any session whose counterparty is `comp_id`.
    pub fn find_counterparty(&self, comp_id: &str) -> Option<SessionId> {
        self.state
            .borrow()
            .sessions
            .keys()
            .find(|id| id.counterparty() == comp_id)
            .cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.state.borrow().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().sessions.is_empty()
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.state.borrow().connections.contains(&connection)
    }

    /// Number of connections not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.borrow().connections.len()
    }

    /// Blocks until `id` is present or `timeout` elapses; returns final presence.
    pub async fn wait_for_presence(&self, id: &SessionId, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.sessions.contains_key(id)).await
    }

    /// Blocks until `id` is absent or `timeout` elapses; returns final absence.
    pub async fn wait_for_absence(&self, id: &SessionId, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| !s.sessions.contains_key(id)).await
    }

    /// Blocks until `connection` is closed or `timeout` elapses.
    pub async fn wait_for_disconnect(&self, connection: ConnectionId, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| !s.connections.contains(&connection)).await
    }

    async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&RegistryState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let reached = matches!(time::timeout(timeout, rx.wait_for(|s| predicate(s))).await, Ok(Ok(_)));
        reached || predicate(&self.state.borrow())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        let (state, _) = watch::channel(RegistryState::default());
        Self { state }
    }
}
