use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = DatacaveError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum DatacaveError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server error: {0}")]
    Server(ServerError),
    #[error("invalid usage: {0}")]
    Usage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("request discarded by connection shutdown")]
    Discarded,
}

impl DatacaveError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Server errors are reported per command and the session keeps serving,
    /// unless the server itself flagged the error as `FATAL` or `PANIC`.
    /// A timeout is only fatal when the command was already on the wire, which
    /// the connection decides for itself, so it is classified as non-fatal here.
    pub fn is_fatal(&self) -> bool {
        match self {
            DatacaveError::Transport(_)
            | DatacaveError::ConnectionClosed
            | DatacaveError::Protocol(_) => true,
            DatacaveError::Server(err) => err.is_fatal(),
            DatacaveError::Timeout(_)
            | DatacaveError::Usage(_)
            | DatacaveError::Config(_)
            | DatacaveError::Discarded => false,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        DatacaveError::Protocol(message.into())
    }
}

impl From<std::io::Error> for DatacaveError {
    fn from(err: std::io::Error) -> Self {
        DatacaveError::Transport(err.to_string())
    }
}

/// Fields of an `ErrorResponse` or `NoticeResponse` sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".into(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.severity, self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " (detail: {detail})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}
