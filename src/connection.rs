//! One accepted socket: frame extraction, logon/logout handling and teardown.
//!
//! Each connection runs as its own task. The task owns both socket halves
//! and takes [`ConnectionCommand`]s from its listener, so the registry only
//! ever holds a non-owning [`ConnectionHandle`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::application::SessionNotifier;
use crate::config::EndpointConfig;
use crate::error::AcceptorError;
use crate::messages::{HandshakeKind, HandshakeMessage};
use crate::protocol::{self, FixMessage, FrameBuffer, ParseError};
use crate::registry::SharedSessionRegistry;
use crate::session::{DisconnectReason, SessionId};

const RX_BUFFER_LEN: usize = 1024;
const SENDING_TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Process-unique id of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instructions a listener sends to one of its connection tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Send Logout and wait for the counterparty's answer
    Logout { text: Option<String> },
    /// Close the socket now
    ForceClose,
}

/// Non-owning reference to a live connection.
///
/// Holding a handle never keeps the connection open; once the task exits,
/// [`ConnectionHandle::request_close`] returns `false`.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    commands: mpsc::WeakSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, peer_addr: SocketAddr, commands: &mpsc::Sender<ConnectionCommand>) -> Self {
        Self {
            id,
            peer_addr,
            commands: commands.downgrade(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Asks the connection task to close its socket.
    pub fn request_close(&self) -> bool {
        match self.commands.upgrade() {
            Some(tx) => tx.try_send(ConnectionCommand::ForceClose).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// State shared by every connection of one listener.
pub(crate) struct EndpointContext {
    pub(crate) config: EndpointConfig,
    pub(crate) registry: SharedSessionRegistry,
    pub(crate) notifier: Arc<SessionNotifier>,
}

/// What the connection loop does after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(DisconnectReason),
}

pub(crate) struct ConnectionHandler<W> {
    handle: ConnectionHandle,
    writer: W,
    frames: FrameBuffer,
    ctx: Arc<EndpointContext>,
    session: Option<SessionId>,
    out_seq_num: u32,
    logout_deadline: Option<Instant>,
}

impl<W> ConnectionHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(handle: ConnectionHandle, writer: W, ctx: Arc<EndpointContext>) -> Self {
        Self {
            handle,
            writer,
            frames: FrameBuffer::new(),
            ctx,
            session: None,
            out_seq_num: 1,
            logout_deadline: None,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Appends one received chunk and handles every complete frame in it.
    ///
    /// An empty chunk means the peer closed its side.
    pub(crate) async fn on_bytes_received(&mut self, chunk: &[u8]) -> Flow {
        if chunk.is_empty() {
            return Flow::Close(DisconnectReason::PeerClosed);
        }
        self.frames.extend_from_slice(chunk);
        while let Some(extracted) = self.frames.next_frame() {
            match extracted {
                Ok(frame) => {
                    if let Flow::Close(reason) = self.dispatch(&frame).await {
                        return Flow::Close(reason);
                    }
                }
                Err(e @ ParseError::Oversized(_)) => {
                    warn!(connection = %self.id(), error = %AcceptorError::from(e), "peer sent an oversized message");
                }
                Err(e) => {
                    let err = AcceptorError::from(e);
                    debug!(connection = %self.id(), error = %err, "discarded bytes while framing");
                }
            }
        }
        Flow::Continue
    }

    async fn dispatch(&mut self, frame: &[u8]) -> Flow {
        let msg = match protocol::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(connection = %self.id(), error = %AcceptorError::from(e), "dropping invalid message");
                return Flow::Continue;
            }
        };
        let handshake = match HandshakeMessage::try_from(&msg) {
            Ok(h) => h,
            Err(e) => {
                warn!(connection = %self.id(), error = %AcceptorError::from(e), "dropping message without session header");
                return Flow::Continue;
            }
        };
        trace!(connection = %self.id(), msg_type = ?msg.msg_type, "received");
        match handshake.kind {
            HandshakeKind::Logon => self.on_logon(&handshake, &msg).await,
            HandshakeKind::Logout => self.on_logout(&handshake, &msg).await,
            HandshakeKind::Other => {
                self.on_other(&handshake, &msg).await;
                Flow::Continue
            }
        }
    }

    async fn on_logon(&mut self, logon: &HandshakeMessage, msg: &FixMessage) -> Flow {
        let session_id = logon.session_id();
        let Some(heartbeat_interval_secs) = self.ctx.config.session(&session_id).map(|s| s.heartbeat_interval_secs)
        else {
            warn!(connection = %self.id(), session = %session_id, "logon for unknown session, rejecting");
            let reject = protocol::build_logout(Some("Unknown session"), &logon.local, &logon.counterparty)
                .with_begin_string(logon.begin_string.clone());
            if let Err(e) = self.send(reject, None).await {
                debug!(connection = %self.id(), error = %e, "failed to send reject");
            }
            return Flow::Close(DisconnectReason::Rejected);
        };
        if let Some(bound) = &self.session {
            if bound != &session_id {
                warn!(connection = %self.id(), bound = %bound, session = %session_id, "second session on one connection, ignoring logon");
                return Flow::Continue;
            }
        }

        self.ctx.notifier.from_admin(msg, &session_id).await;
        self.session = Some(session_id.clone());
        let (previous, generation) = self.ctx.registry.upsert(session_id.clone(), self.handle.clone());
        match previous {
            None => {
                info!(connection = %self.id(), peer = %self.handle.peer_addr(), session = %session_id, "session logged on");
                self.ctx.notifier.logon(&session_id, generation).await;
            }
            Some(previous) if previous.id() == self.id() => {
                debug!(connection = %self.id(), session = %session_id, "repeated logon");
            }
            Some(previous) => {
                warn!(connection = %self.id(), previous = %previous.id(), session = %session_id, "logon took over session from another connection");
            }
        }

        let hb = logon.heart_bt_int_secs.unwrap_or(heartbeat_interval_secs);
        let reply = protocol::build_logon(hb, &session_id.sender_comp_id, &session_id.target_comp_id)
            .with_begin_string(session_id.begin_string.clone());
        match self.send(reply, Some(&session_id)).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!(connection = %self.id(), error = %e, "failed to send logon reply");
                Flow::Close(DisconnectReason::IoError)
            }
        }
    }

    async fn on_logout(&mut self, logout: &HandshakeMessage, msg: &FixMessage) -> Flow {
        let session_id = logout.session_id();
        let bound = self.session.as_ref() == Some(&session_id);
        if bound {
            self.ctx.notifier.from_admin(msg, &session_id).await;
        }

        let initiated_here = self.logout_deadline.is_some();
        if !initiated_here {
            let ack = protocol::build_logout(None, &session_id.sender_comp_id, &session_id.target_comp_id)
                .with_begin_string(session_id.begin_string.clone());
            let owner = if bound { Some(&session_id) } else { None };
            if let Err(e) = self.send(ack, owner).await {
                debug!(connection = %self.id(), error = %e, "failed to acknowledge logout");
            }
        }

        if let Some(generation) = self.ctx.registry.remove_owned(&session_id, self.id()) {
            info!(connection = %self.id(), session = %session_id, text = ?logout.text, "session logged out");
            self.ctx.notifier.logout(&session_id, generation).await;
        }
        if bound {
            self.session = None;
        }
        if initiated_here {
            Flow::Close(DisconnectReason::LogoutComplete)
        } else {
            Flow::Close(DisconnectReason::Logout)
        }
    }

    async fn on_other(&mut self, hs: &HandshakeMessage, msg: &FixMessage) {
        let session_id = hs.session_id();
        if self.session.as_ref() != Some(&session_id) {
            debug!(connection = %self.id(), session = %session_id, msg_type = ?msg.msg_type, "message before logon, ignoring");
            return;
        }
        if msg.msg_type.is_admin() {
            self.ctx.notifier.from_admin(msg, &session_id).await;
        } else {
            self.ctx.notifier.from_app(msg, &session_id).await;
        }
    }

    /// Sends Logout for the bound session and arms the logout deadline.
    ///
    /// A connection that never logged on has nothing to log out and closes.
    pub(crate) async fn initiate_logout(&mut self, text: Option<String>) -> Flow {
        let Some(session_id) = self.session.clone() else {
            return Flow::Close(DisconnectReason::Shutdown);
        };
        if self.logout_deadline.is_some() {
            return Flow::Continue;
        }
        let timeout = self
            .ctx
            .config
            .session(&session_id)
            .map(|s| s.logout_timeout)
            .unwrap_or_else(|| self.ctx.config.logout_timeout());
        let logout = protocol::build_logout(text.as_deref(), &session_id.sender_comp_id, &session_id.target_comp_id)
            .with_begin_string(session_id.begin_string.clone());
        if let Err(e) = self.send(logout, Some(&session_id)).await {
            warn!(connection = %self.id(), error = %e, "failed to send logout");
            return Flow::Close(DisconnectReason::IoError);
        }
        debug!(connection = %self.id(), session = %session_id, timeout_ms = timeout.as_millis() as u64, "logout sent");
        self.logout_deadline = Some(Instant::now() + timeout);
        Flow::Continue
    }

    async fn send(&mut self, mut msg: FixMessage, session: Option<&SessionId>) -> io::Result<()> {
        msg.set_field(34, self.out_seq_num.to_string());
        self.out_seq_num += 1;
        msg.set_field(52, chrono::Utc::now().format(SENDING_TIME_FORMAT).to_string());
        if let Some(id) = session {
            self.ctx.notifier.to_admin(&mut msg, id).await;
        }
        let bytes = protocol::encode(&msg);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }

    /// Releases the registry entries of this connection and closes the writer.
    pub(crate) async fn finish(mut self, reason: DisconnectReason) {
        let released = release(&self.ctx, self.id()).await;
        if let Err(e) = self.writer.shutdown().await {
            trace!(connection = %self.id(), error = %e, "shutdown after close");
        }
        info!(
            connection = %self.id(),
            peer = %self.handle.peer_addr(),
            reason = ?reason,
            released = released.len(),
            "connection closed"
        );
    }
}

/// Marks `connection` closed and notifies logout for every session it owned.
///
/// Safe to call more than once; later calls release nothing.
pub(crate) async fn release(ctx: &EndpointContext, connection: ConnectionId) -> Vec<SessionId> {
    let mut released = Vec::new();
    for (id, generation) in ctx.registry.disconnect(connection) {
        info!(connection = %connection, session = %id, "session dropped with its connection");
        ctx.notifier.logout(&id, generation).await;
        released.push(id);
    }
    released
}

/// Drives one connection until it closes.
pub(crate) async fn run<R, W>(
    mut handler: ConnectionHandler<W>,
    mut reader: R,
    mut commands: mpsc::Receiver<ConnectionCommand>,
) -> DisconnectReason
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut rx_buf = [0u8; RX_BUFFER_LEN];
    let reason = loop {
        let logout_deadline = handler.logout_deadline;
        let flow = tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(ConnectionCommand::Logout { text }) => handler.initiate_logout(text).await,
                Some(ConnectionCommand::ForceClose) | None => Flow::Close(DisconnectReason::Forced),
            },
            res = reader.read(&mut rx_buf) => match res {
                Ok(n) => handler.on_bytes_received(&rx_buf[..n]).await,
                Err(source) => {
                    let err = AcceptorError::Receive { connection: handler.id(), source };
                    warn!(error = %err, "closing connection");
                    Flow::Close(DisconnectReason::IoError)
                }
            },
            _ = time::sleep_until(logout_deadline.unwrap_or_else(Instant::now)), if logout_deadline.is_some() => {
                warn!(connection = %handler.id(), "no logout answer before deadline");
                Flow::Close(DisconnectReason::LogoutTimeout)
            }
        };
        if let Flow::Close(reason) = flow {
            break reason;
        }
    };
    handler.finish(reason).await;
    reason
}

/// Upper bound for the graceful phase of a listener stop.
pub(crate) fn graceful_wait(ctx: &EndpointContext) -> Duration {
    ctx.config.logout_timeout() + Duration::from_millis(500)
}
