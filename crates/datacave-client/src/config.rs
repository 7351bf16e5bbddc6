use datacave_core::{Column, DataValue, DatacaveError, Result};
use datacave_protocol::backend::DEFAULT_MAX_MESSAGE_LEN;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Startup keys the connection sets itself.
const RESERVED_PARAMETERS: &[&str] = &["user", "database", "client_encoding"];

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Tcp,
    Tls,
    Unix,
}

/// Hook for turning a text-format column value into a [`DataValue`].
pub trait ValueDecoder: Send + Sync {
    fn decode(&self, column: &Column, raw: &[u8]) -> Result<DataValue>;
}

/// Decodes values by their type OID.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDecoder;

impl ValueDecoder for TextDecoder {
    fn decode(&self, column: &Column, raw: &[u8]) -> Result<DataValue> {
        DataValue::from_text(column.type_oid, raw)
    }
}

#[derive(Clone)]
pub struct DecoderHook(pub Arc<dyn ValueDecoder>);

impl Default for DecoderHook {
    fn default() -> Self {
        Self(Arc::new(TextDecoder))
    }
}

impl fmt::Debug for DecoderHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecoderHook")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub socket: SocketKind,
    /// PEM bundle trusted for `tls` sockets instead of the web PKI roots.
    pub tls_ca_file: Option<String>,
    pub unix_socket_dir: String,
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub max_message_bytes: usize,
    pub application_name: Option<String>,
    /// Extra session parameters sent in the startup packet.
    pub parameters: HashMap<String, String>,
    #[serde(skip)]
    pub decoder: DecoderHook,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            user: "postgres".into(),
            password: None,
            database: None,
            socket: SocketKind::Tcp,
            tls_ca_file: None,
            unix_socket_dir: "/tmp".into(),
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            query_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_LEN,
            application_name: Some("datacave".into()),
            parameters: HashMap::new(),
            decoder: DecoderHook::default(),
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overridden by the standard `PG*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(host) = lookup("PGHOST") {
            options.host = host;
        }
        if let Some(port) = lookup("PGPORT") {
            options.port = port
                .parse()
                .map_err(|_| DatacaveError::Config(format!("invalid PGPORT {port:?}")))?;
        }
        if let Some(user) = lookup("PGUSER") {
            options.user = user;
        }
        options.password = lookup("PGPASSWORD").or(options.password);
        options.database = lookup("PGDATABASE").or(options.database);
        Ok(options)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_socket(mut self, socket: SocketKind) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ValueDecoder>) -> Self {
        self.decoder = DecoderHook(decoder);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket != SocketKind::Unix && self.host.is_empty() {
            return Err(DatacaveError::Config("host is empty".into()));
        }
        if self.port == 0 {
            return Err(DatacaveError::Config("port must be non-zero".into()));
        }
        if self.user.is_empty() {
            return Err(DatacaveError::Config("user is empty".into()));
        }
        if self.connect_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(DatacaveError::Config("timeouts must be non-zero".into()));
        }
        if self.max_message_bytes < datacave_protocol::HEADER_LEN {
            return Err(DatacaveError::Config(format!(
                "max_message_bytes {} is smaller than a message header",
                self.max_message_bytes
            )));
        }
        if let Some(key) = self
            .parameters
            .keys()
            .find(|key| RESERVED_PARAMETERS.contains(&key.as_str()))
        {
            return Err(DatacaveError::Config(format!(
                "startup parameter {key} is set by the connection itself"
            )));
        }
        Ok(())
    }

    pub(crate) fn startup_params(&self) -> HashMap<String, String> {
        let mut params = self.parameters.clone();
        params.insert("user".into(), self.user.clone());
        params.insert("client_encoding".into(), "UTF8".into());
        if let Some(database) = &self.database {
            params.insert("database".into(), database.clone());
        }
        if let Some(name) = &self.application_name {
            params.entry("application_name".into()).or_insert_with(|| name.clone());
        }
        params
    }

    pub(crate) fn address(&self) -> String {
        match self.socket {
            SocketKind::Unix => format!("{}/.s.PGSQL.{}", self.unix_socket_dir, self.port),
            SocketKind::Tcp | SocketKind::Tls => format!("{}:{}", self.host, self.port),
        }
    }
}
