use crate::error::{AcceptorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a FIX session as seen from the acceptor.
///
/// `sender_comp_id` is the local identity, `target_comp_id` the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
}

impl SessionId {
    pub fn new(begin_string: &str, sender_comp_id: &str, target_comp_id: &str) -> Self {
        Self {
            begin_string: begin_string.to_string(),
            sender_comp_id: sender_comp_id.to_string(),
            target_comp_id: target_comp_id.to_string(),
        }
    }

    pub fn counterparty(&self) -> &str {
        &self.target_comp_id
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.begin_string, self.sender_comp_id, self.target_comp_id)
    }
}

/// Reasons why a connection was closed.
///
/// This enum categorizes the different conditions that can lead
/// to a connection teardown for logging and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote peer closed the connection
    PeerClosed,
    /// The counterparty logged out and was acknowledged
    Logout,
    /// The counterparty answered an acceptor-initiated logout
    LogoutComplete,
    /// The counterparty did not answer an acceptor-initiated logout in time
    LogoutTimeout,
    /// The controller severed the connection
    Forced,
    /// Stopped before any session was established
    Shutdown,
    /// Logon for a session that is not configured
    Rejected,
    /// Socket read or write failed
    IoError,
}

/// Configuration of one acceptor session.
///
/// Produced by [`crate::config::AcceptorConfig`] from a settings object, or
/// built directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_id: SessionId,
    /// Host the acceptor binds for this session
    pub accept_host: String,
    /// Port the acceptor binds for this session
    pub accept_port: u16,
    /// Heartbeat interval in seconds, echoed in the Logon reply
    pub heartbeat_interval_secs: u32,
    /// How long an acceptor-initiated logout waits for the counterparty
    pub logout_timeout: Duration,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder pattern implementation for constructing SessionConfig instances.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    begin_string: Option<String>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    accept_host: Option<String>,
    accept_port: Option<u16>,
    heartbeat_interval_secs: Option<u32>,
    logout_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    pub fn begin_string(mut self, v: impl Into<String>) -> Self {
        self.begin_string = Some(v.into());
        self
    }
    pub fn sender_comp_id(mut self, v: impl Into<String>) -> Self {
        self.sender_comp_id = Some(v.into());
        self
    }
    pub fn target_comp_id(mut self, v: impl Into<String>) -> Self {
        self.target_comp_id = Some(v.into());
        self
    }
    pub fn accept_host(mut self, host: impl Into<String>) -> Self {
        self.accept_host = Some(host.into());
        self
    }
    pub fn accept_port(mut self, port: u16) -> Self {
        self.accept_port = Some(port);
        self
    }
    pub fn heartbeat_interval_secs(mut self, v: u32) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }
    pub fn logout_timeout(mut self, v: Duration) -> Self {
        self.logout_timeout = Some(v);
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let begin_string = self
            .begin_string
            .ok_or_else(|| AcceptorError::InvalidConfig("begin_string missing".into()))?;
        let sender_comp_id = self
            .sender_comp_id
            .ok_or_else(|| AcceptorError::InvalidConfig("sender_comp_id missing".into()))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or_else(|| AcceptorError::InvalidConfig("target_comp_id missing".into()))?;
        Ok(SessionConfig {
            session_id: SessionId {
                begin_string,
                sender_comp_id,
                target_comp_id,
            },
            accept_host: self.accept_host.unwrap_or_else(|| "0.0.0.0".to_string()),
            accept_port: self
                .accept_port
                .ok_or_else(|| AcceptorError::InvalidConfig("accept_port missing".into()))?,
            heartbeat_interval_secs: self.heartbeat_interval_secs.unwrap_or(30),
            logout_timeout: self.logout_timeout.unwrap_or(Duration::from_secs(2)),
        })
    }
}
