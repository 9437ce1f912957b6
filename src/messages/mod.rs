use std::convert::TryFrom;

use crate::protocol::{FixMessage, FixMsgType, ParseError};
use crate::session::SessionId;

/// The only distinction the acceptor core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Logon,
    Logout,
    Other,
}

impl From<&FixMsgType> for HandshakeKind {
    fn from(mt: &FixMsgType) -> Self {
        match mt {
            FixMsgType::Logon => HandshakeKind::Logon,
            FixMsgType::Logout => HandshakeKind::Logout,
            _ => HandshakeKind::Other,
        }
    }
}

/// Minimal view of an inbound message: its kind and the identities in the header.
///
/// `counterparty` is the sender of the message (tag 49) and `local` the
/// target (tag 56), so the session it belongs to is `begin/local->counterparty`
/// from the acceptor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub kind: HandshakeKind,
    pub begin_string: String,
    pub counterparty: String,
    pub local: String,
    pub heart_bt_int_secs: Option<u32>,
    pub text: Option<String>,
}

impl HandshakeMessage {
    pub fn session_id(&self) -> SessionId {
        SessionId::new(&self.begin_string, &self.local, &self.counterparty)
    }
}

impl TryFrom<&FixMessage> for HandshakeMessage {
    type Error = ParseError;

    fn try_from(msg: &FixMessage) -> Result<Self, Self::Error> {
        let counterparty = msg.field(49).ok_or(ParseError::MissingField(49))?;
        let local = msg.field(56).ok_or(ParseError::MissingField(56))?;
        let heart_bt_int_secs = match msg.field(108) {
            Some(v) => Some(v.parse::<u32>().map_err(|_| ParseError::InvalidValue(108))?),
            None => None,
        };
        Ok(HandshakeMessage {
            kind: HandshakeKind::from(&msg.msg_type),
            begin_string: msg.begin_string.clone(),
            counterparty: counterparty.to_string(),
            local: local.to_string(),
            heart_bt_int_secs,
            text: msg.field(58).map(str::to_string),
        })
    }
}
