use datacave_core::ServerError;
use std::collections::HashMap;

/// Protocol version 3.0 as sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 196608;
/// Magic version number of an `SSLRequest` packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    Startup { params: HashMap<String, String> },
    SslRequest,
    Query { sql: String },
    Password { password: String },
    Terminate,
    Unsupported { code: u8 },
    /// Extended query: Parse (P)
    Parse {
        statement_name: String,
        query: String,
        param_oids: Vec<i32>,
    },
    /// Extended query: Bind (B)
    Bind {
        portal_name: String,
        statement_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    /// Extended query: Describe (D)
    Describe {
        target: DescribeTarget,
        name: String,
    },
    /// Extended query: Execute (E)
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    /// Extended query: Sync (S)
    Sync,
    /// Extended query: Flush (H) - request backend to flush output buffer
    Flush,
    /// Extended query: Close (C) - close portal or statement
    Close {
        target: CloseTarget,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    Statement,
    Portal,
}

/// Target selector byte shared by Describe and Close.
pub(crate) fn target_byte(statement: bool) -> u8 {
    if statement {
        b'S'
    } else {
        b'P'
    }
}

/// Transaction state for ReadyForQuery (PostgreSQL wire protocol).
/// - Idle: not in transaction block
/// - Transaction: in transaction block (after BEGIN)
/// - Error: in failed transaction, must ROLLBACK before new commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Transaction,
    Error,
}

impl TransactionState {
    pub fn wire_byte(self) -> u8 {
        match self {
            TransactionState::Idle => b'I',
            TransactionState::Transaction => b'T',
            TransactionState::Error => b'E',
        }
    }

    pub fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionState::Idle),
            b'T' => Some(TransactionState::Transaction),
            b'E' => Some(TransactionState::Error),
            _ => None,
        }
    }
}

/// A single field in a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptionField {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl RowDescriptionField {
    /// Text-format field with no originating table.
    pub fn new(name: impl Into<String>, type_oid: i32) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl { mechanisms: Vec<String> },
    /// Any authentication request this client does not speak.
    AuthenticationOther { code: i32 },
    ParameterStatus { key: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    ReadyForQuery { state: TransactionState },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<i32> },
    RowDescription { fields: Vec<RowDescriptionField> },
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { tag: String },
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    NotificationResponse { pid: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Short name used in log lines and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMd5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSasl { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationOther { .. } => "Authentication",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}
