use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{AcceptorError, Result};
use crate::session::{SessionConfig, SessionId};

pub const CONNECTION_TYPE: &str = "ConnectionType";
pub const BEGIN_STRING: &str = "BeginString";
pub const SENDER_COMP_ID: &str = "SenderCompID";
pub const TARGET_COMP_ID: &str = "TargetCompID";
pub const SOCKET_ACCEPT_HOST: &str = "SocketAcceptHost";
pub const SOCKET_ACCEPT_PORT: &str = "SocketAcceptPort";
pub const SOCKET_CONNECT_HOST: &str = "SocketConnectHost";
pub const SOCKET_CONNECT_PORT: &str = "SocketConnectPort";
pub const HEARTBTINT: &str = "HeartBtInt";
pub const LOGOUT_TIMEOUT: &str = "LogoutTimeout";
pub const SOCKET_NODELAY: &str = "SocketNodelay";
pub const START_TIME: &str = "StartTime";
pub const END_TIME: &str = "EndTime";
pub const USE_DATA_DICTIONARY: &str = "UseDataDictionary";

const DEFAULT_ACCEPT_HOST: &str = "0.0.0.0";
const DEFAULT_HEARTBTINT: u32 = 30;
const DEFAULT_LOGOUT_TIMEOUT_SECS: u64 = 2;

/// Flat string key/value settings, one per session plus a default section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dictionary {
    values: BTreeMap<String, String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set_string(key, value.to_string());
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_string(key, if value { "Y" } else { "N" });
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Result<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| AcceptorError::InvalidConfig(format!("{} missing", key)))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        let raw = self.get_string(key)?;
        raw.trim()
            .parse()
            .map_err(|_| AcceptorError::InvalidConfig(format!("{}={} is not an integer", key, raw)))
    }

    pub fn get_u16(&self, key: &str) -> Result<u16> {
        let v = self.get_int(key)?;
        u16::try_from(v).map_err(|_| AcceptorError::InvalidConfig(format!("{}={} out of range", key, v)))
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let v = self.get_int(key)?;
        u32::try_from(v).map_err(|_| AcceptorError::InvalidConfig(format!("{}={} out of range", key, v)))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get_string(key)? {
            "Y" | "y" => Ok(true),
            "N" | "n" => Ok(false),
            other => Err(AcceptorError::InvalidConfig(format!("{}={} is not Y or N", key, other))),
        }
    }

    /// `self` layered over `defaults`.
    pub fn merged_over(&self, defaults: &Dictionary) -> Dictionary {
        let mut values = defaults.values.clone();
        values.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Dictionary { values }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    default: Dictionary,
    #[serde(default)]
    sessions: Vec<Dictionary>,
}

/// Default section plus one dictionary per session.
///
/// On disk this is JSON:
///
/// ```json
/// { "default": { "ConnectionType": "acceptor", "SocketAcceptPort": "55101" },
///   "sessions": [ { "BeginString": "FIX.4.2", "SenderCompID": "dummy", "TargetCompID": "acc01" } ] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    defaults: Dictionary,
    sessions: BTreeMap<SessionId, Dictionary>,
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_defaults(&mut self, defaults: Dictionary) {
        self.defaults = defaults;
    }

    pub fn defaults(&self) -> &Dictionary {
        &self.defaults
    }

    /// Adds or replaces a session. The identity keys are written into the dictionary.
    pub fn set(&mut self, id: SessionId, mut settings: Dictionary) {
        settings.set_string(BEGIN_STRING, id.begin_string.clone());
        settings.set_string(SENDER_COMP_ID, id.sender_comp_id.clone());
        settings.set_string(TARGET_COMP_ID, id.target_comp_id.clone());
        self.sessions.insert(id, settings);
    }

    /// Session settings merged over the default section.
    pub fn get(&self, id: &SessionId) -> Option<Dictionary> {
        self.sessions.get(id).map(|d| d.merged_over(&self.defaults))
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.keys()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: SettingsFile = serde_json::from_str(json)
            .map_err(|e| AcceptorError::InvalidConfig(format!("settings: {}", e)))?;
        let mut settings = SessionSettings::new();
        for dict in file.sessions {
            let merged = dict.merged_over(&file.default);
            let id = SessionId::new(
                merged.get_string(BEGIN_STRING)?,
                merged.get_string(SENDER_COMP_ID)?,
                merged.get_string(TARGET_COMP_ID)?,
            );
            if settings.sessions.contains_key(&id) {
                return Err(AcceptorError::InvalidConfig(format!("duplicate session {}", id)));
            }
            settings.set(id, dict);
        }
        settings.defaults = file.default;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let file = SettingsFile {
            default: self.defaults.clone(),
            sessions: self.sessions.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| AcceptorError::InvalidConfig(format!("settings: {}", e)))
    }
}

/// One accept endpoint and the sessions reachable through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub sessions: Vec<SessionConfig>,
}

impl EndpointConfig {
    pub fn session(&self, id: &SessionId) -> Option<&SessionConfig> {
        self.sessions.iter().find(|s| &s.session_id == id)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Longest logout timeout among this endpoint's sessions.
    pub fn logout_timeout(&self) -> Duration {
        self.sessions
            .iter()
            .map(|s| s.logout_timeout)
            .max()
            .unwrap_or(Duration::from_secs(DEFAULT_LOGOUT_TIMEOUT_SECS))
    }
}

/// Validated acceptor configuration, grouped by accept endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorConfig {
    pub endpoints: Vec<EndpointConfig>,
}

impl AcceptorConfig {
    /// Picks the `ConnectionType=acceptor` sessions out of `settings`.
    pub fn from_settings(settings: &SessionSettings) -> Result<Self> {
        let mut sessions = Vec::new();
        for id in settings.session_ids() {
            let dict = settings
                .get(id)
                .ok_or_else(|| AcceptorError::InvalidConfig(format!("session {} vanished", id)))?;
            match dict.get_string(CONNECTION_TYPE)? {
                "acceptor" => {}
                "initiator" => {
                    tracing::debug!(session = %id, "skipping initiator session");
                    continue;
                }
                other => {
                    return Err(AcceptorError::InvalidConfig(format!(
                        "{}: unknown {} {}",
                        id, CONNECTION_TYPE, other
                    )))
                }
            }
            sessions.push(session_config(id, &dict)?);
        }
        Self::from_sessions(sessions)
    }

    /// Groups sessions by (host, port), keeping first-seen endpoint order.
    pub fn from_sessions(sessions: Vec<SessionConfig>) -> Result<Self> {
        if sessions.is_empty() {
            return Err(AcceptorError::InvalidConfig("no acceptor sessions configured".into()));
        }
        let mut endpoints: Vec<EndpointConfig> = Vec::new();
        for session in sessions {
            match endpoints
                .iter_mut()
                .find(|e| e.host == session.accept_host && e.port == session.accept_port)
            {
                Some(endpoint) => {
                    if endpoint.session(&session.session_id).is_some() {
                        return Err(AcceptorError::InvalidConfig(format!(
                            "duplicate session {}",
                            session.session_id
                        )));
                    }
                    endpoint.sessions.push(session);
                }
                None => endpoints.push(EndpointConfig {
                    host: session.accept_host.clone(),
                    port: session.accept_port,
                    sessions: vec![session],
                }),
            }
        }
        Ok(Self { endpoints })
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.endpoints
            .iter()
            .flat_map(|e| e.sessions.iter().map(|s| &s.session_id))
    }
}

fn session_config(id: &SessionId, dict: &Dictionary) -> Result<SessionConfig> {
    let mut builder = SessionConfig::builder()
        .begin_string(id.begin_string.clone())
        .sender_comp_id(id.sender_comp_id.clone())
        .target_comp_id(id.target_comp_id.clone())
        .accept_port(dict.get_u16(SOCKET_ACCEPT_PORT)?)
        .accept_host(if dict.has(SOCKET_ACCEPT_HOST) {
            dict.get_string(SOCKET_ACCEPT_HOST)?
        } else {
            DEFAULT_ACCEPT_HOST
        });
    builder = builder.heartbeat_interval_secs(if dict.has(HEARTBTINT) {
        dict.get_u32(HEARTBTINT)?
    } else {
        DEFAULT_HEARTBTINT
    });
    if dict.has(LOGOUT_TIMEOUT) {
        builder = builder.logout_timeout(Duration::from_secs(dict.get_u32(LOGOUT_TIMEOUT)? as u64));
    }
    builder.build()
}

/// Backoff used by [`crate::Acceptor::start_with_retry`] while the OS releases a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}
