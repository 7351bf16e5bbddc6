use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a connection, as seen from outside the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Handshake,
    Running,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Handshake => "handshake",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret: i32,
}

/// Session parameters reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub server: BTreeMap<String, String>,
    pub backend_key: Option<BackendKey>,
}

impl ConnectionParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.server.get(name).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.get("server_version")
    }

    pub fn client_encoding(&self) -> Option<&str> {
        self.get("client_encoding")
    }
}

/// Payload of a `NOTIFY` delivered to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}
