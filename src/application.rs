use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time;
use tracing::debug;

use crate::protocol::FixMessage;
use crate::registry::Generation;
use crate::session::SessionId;

/// Callbacks an application receives from the acceptor.
///
/// All methods default to no-ops. They are invoked from connection tasks and
/// never while the session registry is locked, so implementations may call
/// back into the acceptor.
#[async_trait]
pub trait Application: Send + Sync {
    /// A configured session was created by [`crate::Acceptor::new`].
    async fn on_create(&self, _session_id: &SessionId) {}
    /// A counterparty completed its logon.
    async fn on_logon(&self, _session_id: &SessionId) {}
    /// A logged-on counterparty logged out or its connection went away.
    async fn on_logout(&self, _session_id: &SessionId) {}
    /// An admin message is about to be sent; it may be amended.
    async fn to_admin(&self, _message: &mut FixMessage, _session_id: &SessionId) {}
    /// An admin message arrived for a known session.
    async fn from_admin(&self, _message: &FixMessage, _session_id: &SessionId) {}
    /// An application message arrived on a logged-on session.
    async fn from_app(&self, _message: &FixMessage, _session_id: &SessionId) {}
}

/// Application that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplication;

impl Application for NullApplication {}

/// Dispatches session events to the application and keeps the logged-on set.
///
/// The logged-on set is tracked apart from the registry: the registry
/// follows sockets, this set follows what the application was told. Each
/// change carries the [`Generation`] of the registry mutation behind it, and
/// a change older than the last one applied to that session is dropped, so
/// callbacks finishing out of order cannot leave the two views apart.
pub(crate) struct SessionNotifier {
    application: Arc<dyn Application>,
    logged_on: watch::Sender<LoggedOn>,
}

#[derive(Debug, Default)]
struct LoggedOn {
    sessions: HashSet<SessionId>,
    applied: HashMap<SessionId, Generation>,
}

impl LoggedOn {
    /// Returns whether the set changed.
    fn apply(&mut self, id: &SessionId, generation: Generation, present: bool) -> bool {
        if self.applied.get(id).is_some_and(|last| *last >= generation) {
            debug!(session = %id, generation = generation.0, present, "stale session change, skipping");
            return false;
        }
        self.applied.insert(id.clone(), generation);
        if present {
            self.sessions.insert(id.clone())
        } else {
            self.sessions.remove(id)
        }
    }
}

impl SessionNotifier {
    pub(crate) fn new(application: Arc<dyn Application>) -> Self {
        let (logged_on, _) = watch::channel(LoggedOn::default());
        Self { application, logged_on }
    }

    pub(crate) async fn created(&self, id: &SessionId) {
        self.application.on_create(id).await;
    }

    // The callback completes before waiters on the logged-on set wake.
    pub(crate) async fn logon(&self, id: &SessionId, generation: Generation) {
        self.application.on_logon(id).await;
        self.logged_on.send_if_modified(|state| state.apply(id, generation, true));
    }

    pub(crate) async fn logout(&self, id: &SessionId, generation: Generation) {
        self.application.on_logout(id).await;
        self.logged_on.send_if_modified(|state| state.apply(id, generation, false));
    }

    pub(crate) async fn to_admin(&self, message: &mut FixMessage, id: &SessionId) {
        self.application.to_admin(message, id).await;
    }

    pub(crate) async fn from_admin(&self, message: &FixMessage, id: &SessionId) {
        self.application.from_admin(message, id).await;
    }

    pub(crate) async fn from_app(&self, message: &FixMessage, id: &SessionId) {
        self.application.from_app(message, id).await;
    }

    pub(crate) fn is_logged_on(&self) -> bool {
        !self.logged_on.borrow().sessions.is_empty()
    }

    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.logged_on.borrow().sessions.contains(id)
    }

    pub(crate) fn logged_on(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.logged_on.borrow().sessions.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) async fn wait_for(&self, id: &SessionId, present: bool, timeout: Duration) -> bool {
        let mut rx = self.logged_on.subscribe();
        let reached = matches!(
            time::timeout(timeout, rx.wait_for(|state| state.sessions.contains(id) == present)).await,
            Ok(Ok(_))
        );
        reached || self.contains(id) == present
    }
}
