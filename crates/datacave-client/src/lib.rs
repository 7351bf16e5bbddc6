pub mod config;
pub mod connection;
pub mod session;
pub mod statement;
pub mod transport;

mod actor;
mod exchange;
mod frame;
mod queue;
mod timer;

pub use config::{ConnectOptions, SocketKind, TextDecoder, ValueDecoder};
pub use connection::{Connection, Handshake, QueryOptions};
pub use datacave_core::{DataValue, DatacaveError, QueryResult, Result};
pub use session::{BackendKey, ConnectionParameters, Notification, SessionState};
pub use statement::Statement;

#[cfg(test)]
mod tests;
