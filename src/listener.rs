//! Listener controller: one bound accept endpoint and its connection tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{self, TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::connection::{
    self, ConnectionCommand, ConnectionHandle, ConnectionHandler, ConnectionId, EndpointContext,
    COMMAND_CHANNEL_CAPACITY,
};
use crate::error::{AcceptorError, Result};
use crate::session::DisconnectReason;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a [`ListenerController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct ConnectionSlot {
    commands: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<DisconnectReason>,
}

type ConnectionSlots = Arc<Mutex<HashMap<ConnectionId, ConnectionSlot>>>;

struct RunningListener {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Owns one listening socket and every connection accepted on it.
///
/// A controller can be started and stopped repeatedly; each start binds a
/// fresh socket. Once disposed it refuses to start again.
pub struct ListenerController {
    ctx: Arc<EndpointContext>,
    state: watch::Sender<ListenerState>,
    running: tokio::sync::Mutex<Option<RunningListener>>,
    // Set while a socket is bound; readable without waiting on `running`.
    bound_addr: Mutex<Option<SocketAddr>>,
    connections: ConnectionSlots,
    next_connection_id: Arc<AtomicU64>,
    disposed: AtomicBool,
}

impl ListenerController {
    pub(crate) fn new(ctx: Arc<EndpointContext>, next_connection_id: Arc<AtomicU64>) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self {
            ctx,
            state,
            running: tokio::sync::Mutex::new(None),
            bound_addr: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id,
            disposed: AtomicBool::new(false),
        }
    }

    /// Configured `host:port` of this endpoint.
    pub fn endpoint(&self) -> String {
        self.ctx.config.address()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// True while the socket is bound and the accept loop is alive.
    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
    }

    /// Address actually bound, from bind until the accept loop has exited.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound_addr)
    }

    /// Number of connection tasks still owned by this controller.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Binds the endpoint and spawns the accept loop.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AcceptorError::Disposed);
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AcceptorError::AlreadyStarted(self.endpoint()));
        }
        self.state.send_replace(ListenerState::Starting);

        let bound = self.bind().await;
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(ListenerState::Stopped);
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state.send_replace(ListenerState::Stopped);
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(
            accept_loop(
                listener,
                shutdown_rx,
                self.ctx.clone(),
                self.connections.clone(),
                self.next_connection_id.clone(),
            )
            .instrument(info_span!("listener", endpoint = %local_addr)),
        );
        *running = Some(RunningListener {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        *lock(&self.bound_addr) = Some(local_addr);
        self.state.send_replace(ListenerState::Running);
        info!(endpoint = %local_addr, sessions = self.ctx.config.sessions.len(), "listening");
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener> {
        let host = self.ctx.config.host.clone();
        let port = self.ctx.config.port;
        let addr = match net::lookup_host((host.as_str(), port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!(host = %host, port, error = %e, "address lookup failed");
                None
            }
        };
        let addr = addr.ok_or(AcceptorError::Address { host, port })?;
        TcpListener::bind(addr)
            .await
            .map_err(|source| AcceptorError::Bind { addr, source })
    }

    /// Stops accepting, releases the port, then closes every connection.
    ///
    /// With `force` the connections are severed at once. Otherwise each
    /// logged-on counterparty is sent Logout and given until the session's
    /// logout timeout to answer before it is severed. A stopped controller
    /// returns immediately.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(listener) = running.take() else {
            return Ok(());
        };
        self.state.send_replace(ListenerState::Stopping);
        info!(endpoint = %listener.local_addr, force, "stopping listener");

        let _ = listener.shutdown_tx.send(());
        if let Err(e) = listener.accept_task.await {
            log_join_error(None, &e);
        }
        *lock(&self.bound_addr) = None;

        let slots: Vec<_> = lock(&self.connections).drain().collect();
        let count = slots.len();
        let grace = if force {
            None
        } else {
            Some(connection::graceful_wait(&self.ctx))
        };
        let ctx = &self.ctx;
        join_all(
            slots
                .into_iter()
                .map(|(id, slot)| close_connection(ctx, id, slot, grace)),
        )
        .await;

        self.state.send_replace(ListenerState::Stopped);
        info!(endpoint = %listener.local_addr, closed = count, "listener stopped");
        Ok(())
    }

    /// Force-stops if running and refuses further starts. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop(true).await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for ListenerController {
    fn drop(&mut self) {
        if let Some(listener) = self.running.get_mut().take() {
            listener.accept_task.abort();
        }
        for (_, slot) in lock(&self.connections).drain() {
            slot.task.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    ctx: Arc<EndpointContext>,
    connections: ConnectionSlots,
    next_connection_id: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("accept loop shutting down");
                break;
            }
            res = listener.accept() => match res {
                Ok((stream, peer_addr)) => {
                    let id = ConnectionId(next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);
                    spawn_connection(&ctx, &connections, id, stream, peer_addr);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

fn spawn_connection(
    ctx: &Arc<EndpointContext>,
    connections: &ConnectionSlots,
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(connection = %id, error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = ConnectionHandle::new(id, peer_addr, &commands);
    ctx.registry.register_connection(id);
    info!(connection = %id, peer = %peer_addr, "connection accepted");

    // The slot is inserted before the task can remove it.
    let mut slots = lock(connections);
    let handler = ConnectionHandler::new(handle, writer, ctx.clone());
    let task = tokio::spawn({
        let connections = connections.clone();
        async move {
            let reason = connection::run(handler, reader, commands_rx).await;
            lock(&connections).remove(&id);
            reason
        }
        .instrument(info_span!("connection", connection = %id, peer = %peer_addr))
    });
    slots.insert(id, ConnectionSlot { commands, task });
}

/// Closes one connection within bounded time; never fails.
async fn close_connection(ctx: &EndpointContext, id: ConnectionId, slot: ConnectionSlot, grace: Option<Duration>) {
    let ConnectionSlot { commands, mut task } = slot;

    if let Some(grace) = grace {
        if commands.try_send(ConnectionCommand::Logout { text: None }).is_err() {
            trace!(connection = %id, "logout request not delivered");
        }
        match time::timeout(grace, &mut task).await {
            Ok(joined) => {
                log_join(id, joined);
                return;
            }
            Err(_) => debug!(connection = %id, "logout not completed in time, forcing close"),
        }
    }

    let closed = time::timeout(FORCE_CLOSE_TIMEOUT, async {
        let _ = commands.send(ConnectionCommand::ForceClose).await;
        (&mut task).await
    })
    .await;
    match closed {
        Ok(joined) => log_join(id, joined),
        Err(_) => {
            warn!(connection = %id, "connection task did not exit, aborting");
            task.abort();
            if let Err(e) = task.await {
                log_join_error(Some(id), &e);
            }
            connection::release(ctx, id).await;
        }
    }
}

fn log_join(id: ConnectionId, joined: std::result::Result<DisconnectReason, JoinError>) {
    match joined {
        Ok(reason) => trace!(connection = %id, reason = ?reason, "connection task finished"),
        Err(e) => log_join_error(Some(id), &e),
    }
}

fn log_join_error(id: Option<ConnectionId>, e: &JoinError) {
    if e.is_cancelled() {
        trace!(connection = ?id, "task cancelled");
    } else {
        warn!(connection = ?id, error = %e, "task panicked");
    }
}
