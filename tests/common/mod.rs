#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use fixg_acceptor::config::{self, Dictionary, SessionSettings};
use fixg_acceptor::protocol::{self, FixMessage, FixMsgType};
use fixg_acceptor::{Application, SessionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing_subscriber::EnvFilter;

pub const BEGIN_STRING: &str = "FIX.4.2";
pub const SERVER_COMP_ID: &str = "dummy";
pub const ACC01: &str = "acc01";
pub const ACC02: &str = "acc02";
pub const WAIT: Duration = Duration::from_secs(10);

static PORT: AtomicU16 = AtomicU16::new(55101);
static TRACING: Once = Once::new();

/// Each test gets its own accept port so tests can run in parallel.
pub fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

pub fn session_id(comp_id: &str) -> SessionId {
    SessionId::new(BEGIN_STRING, SERVER_COMP_ID, comp_id)
}

/// Two acceptor sessions, acc01 and acc02, sharing one endpoint.
pub fn settings(port: u16) -> SessionSettings {
    let mut defaults = Dictionary::new();
    defaults.set_string(config::CONNECTION_TYPE, "acceptor");
    defaults.set_string(config::SOCKET_ACCEPT_HOST, "127.0.0.1");
    defaults.set_int(config::SOCKET_ACCEPT_PORT, port as i64);
    defaults.set_int(config::HEARTBTINT, 300);
    defaults.set_int(config::LOGOUT_TIMEOUT, 2);
    defaults.set_string(config::START_TIME, "00:00:00");
    defaults.set_string(config::END_TIME, "00:00:00");
    defaults.set_bool(config::USE_DATA_DICTIONARY, false);

    let mut settings = SessionSettings::new();
    settings.set_defaults(defaults);
    settings.set(session_id(ACC01), Dictionary::new());
    settings.set(session_id(ACC02), Dictionary::new());
    settings
}

/// Application that records what it was told.
#[derive(Default)]
pub struct RecordingApp {
    created: StdMutex<Vec<SessionId>>,
    logons: StdMutex<Vec<SessionId>>,
    logouts: StdMutex<Vec<SessionId>>,
    logout_delay: Option<Duration>,
}

impl RecordingApp {
    /// Records like the default app but holds every `on_logout` for `delay`.
    pub fn with_logout_delay(delay: Duration) -> Self {
        Self {
            logout_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<SessionId> {
        self.created.lock().unwrap().clone()
    }

    pub fn logons(&self) -> Vec<SessionId> {
        self.logons.lock().unwrap().clone()
    }

    pub fn logouts(&self) -> Vec<SessionId> {
        self.logouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Application for RecordingApp {
    async fn on_create(&self, session_id: &SessionId) {
        self.created.lock().unwrap().push(session_id.clone());
    }

    async fn on_logon(&self, session_id: &SessionId) {
        self.logons.lock().unwrap().push(session_id.clone());
    }

    async fn on_logout(&self, session_id: &SessionId) {
        if let Some(delay) = self.logout_delay {
            time::sleep(delay).await;
        }
        self.logouts.lock().unwrap().push(session_id.clone());
    }
}

/// Test-side initiator speaking just enough FIX to log on and off.
///
/// A comp id counts as logged on once the acceptor's Logon reply arrives.
/// A Logout the acceptor starts is answered automatically.
pub struct Counterparty {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    seq: Arc<AtomicU32>,
    pending_logout: Arc<StdMutex<HashSet<String>>>,
    logged_on: watch::Receiver<HashSet<String>>,
    connected: watch::Receiver<bool>,
    received: watch::Receiver<Vec<FixMessage>>,
    reader: JoinHandle<()>,
}

impl Counterparty {
    pub async fn connect(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let seq = Arc::new(AtomicU32::new(1));
        let pending_logout = Arc::new(StdMutex::new(HashSet::new()));
        let (logged_on_tx, logged_on) = watch::channel(HashSet::new());
        let (connected_tx, connected) = watch::channel(true);
        let (received_tx, received) = watch::channel(Vec::new());

        let reader = tokio::spawn({
            let writer = writer.clone();
            let seq = seq.clone();
            let pending_logout = pending_logout.clone();
            async move {
                let mut buf = BytesMut::with_capacity(4096);
                loop {
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    while let Some(frame) = protocol::try_extract_one(&mut buf) {
                        let Ok(msg) = frame.and_then(|f| protocol::decode(&f)) else {
                            continue;
                        };
                        let comp_id = msg.field(56).unwrap_or_default().to_string();
                        match msg.msg_type {
                            FixMsgType::Logon => {
                                logged_on_tx.send_modify(|s| {
                                    s.insert(comp_id);
                                });
                            }
                            FixMsgType::Logout => {
                                logged_on_tx.send_modify(|s| {
                                    s.remove(&comp_id);
                                });
                                let ours = pending_logout.lock().unwrap().remove(&comp_id);
                                if !ours {
                                    let reply = protocol::build_logout(None, &comp_id, SERVER_COMP_ID);
                                    let _ = send(&writer, &seq, reply).await;
                                }
                            }
                            _ => {}
                        }
                        received_tx.send_modify(|v| v.push(msg));
                    }
                }
                logged_on_tx.send_modify(HashSet::clear);
                connected_tx.send_replace(false);
            }
        });

        Ok(Self {
            writer,
            seq,
            pending_logout,
            logged_on,
            connected,
            received,
            reader,
        })
    }

    /// Connects, retrying while the acceptor is still coming up.
    pub async fn connect_with_retry(port: u16) -> io::Result<Self> {
        let mut last_err = None;
        for _ in 0..5 {
            match Self::connect(port).await {
                Ok(c) => return Ok(c),
                Err(e) => last_err = Some(e),
            }
            time::sleep(Duration::from_millis(100)).await;
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempt made")))
    }

    pub async fn send_logon(&self, comp_id: &str) -> io::Result<()> {
        send(&self.writer, &self.seq, protocol::build_logon(300, comp_id, SERVER_COMP_ID)).await
    }

    pub async fn send_logout(&self, comp_id: &str) -> io::Result<()> {
        self.pending_logout.lock().unwrap().insert(comp_id.to_string());
        send(&self.writer, &self.seq, protocol::build_logout(None, comp_id, SERVER_COMP_ID)).await
    }

    pub async fn wait_for_logon(&self, comp_id: &str, timeout: Duration) -> bool {
        wait(&self.logged_on, timeout, |s| s.contains(comp_id)).await
    }

    pub async fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        wait(&self.connected, timeout, |c| !*c).await
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn received_types(&self) -> Vec<FixMsgType> {
        self.received.borrow().iter().map(|m| m.msg_type.clone()).collect()
    }

    pub fn received(&self) -> Vec<FixMessage> {
        self.received.borrow().clone()
    }
}

impl Drop for Counterparty {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn send(writer: &Mutex<OwnedWriteHalf>, seq: &AtomicU32, mut msg: FixMessage) -> io::Result<()> {
    msg.set_field(34, seq.fetch_add(1, Ordering::SeqCst).to_string());
    let bytes = protocol::encode(&msg.with_begin_string(BEGIN_STRING));
    writer.lock().await.write_all(&bytes).await
}

async fn wait<T>(rx: &watch::Receiver<T>, timeout: Duration, predicate: impl FnMut(&T) -> bool) -> bool {
    let mut rx = rx.clone();
    let reached = matches!(time::timeout(timeout, rx.wait_for(predicate)).await, Ok(Ok(_)));
    reached
}
