#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod acceptor;
pub mod application;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod session;

pub use acceptor::Acceptor;
pub use application::{Application, NullApplication};
pub use config::{AcceptorConfig, Dictionary, EndpointConfig, RetryPolicy, SessionSettings};
pub use connection::{ConnectionHandle, ConnectionId};
pub use error::{AcceptorError, Result};
pub use listener::{ListenerController, ListenerState};
pub use registry::{Generation, SessionRegistry, SharedSessionRegistry};
pub use session::{DisconnectReason, SessionConfig, SessionId};
