use crate::actor::{self, ActorMessage, Published};
use crate::config::ConnectOptions;
use crate::exchange::{Reply, Request};
use crate::session::{ConnectionParameters, Notification, SessionState};
use crate::statement::Statement;
use crate::transport;
use datacave_core::{DataValue, DatacaveError, QueryResult, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const MAILBOX_CAPACITY: usize = 256;
const NOTIFICATION_CAPACITY: usize = 64;

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Deadline for this command, counted from submission. Defaults to the
    /// connection's query timeout.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Completes when the startup exchange does.
#[derive(Debug)]
pub struct Handshake {
    connected: oneshot::Receiver<Result<Reply>>,
}

impl Handshake {
    pub async fn wait(self) -> Result<()> {
        match self.connected.await {
            Ok(Ok(Reply::Connected)) => Ok(()),
            Ok(Ok(other)) => Err(unexpected(other)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DatacaveError::ConnectionClosed),
        }
    }
}

struct Inner {
    mailbox: mpsc::Sender<ActorMessage>,
    state: watch::Receiver<SessionState>,
    parameters: watch::Receiver<ConnectionParameters>,
    notifications: broadcast::Sender<Notification>,
    statement_ids: AtomicU64,
    connect_timeout: Duration,
}

/// Handle to a connection actor. Clones share the connection; the actor stops
/// once the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Open a transport per `options` and complete the handshake.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let (connection, handshake) = Self::spawn(options)?;
        connection.finish_connect(handshake).await
    }

    /// Run the protocol over an already established stream.
    pub async fn connect_with_stream<S>(stream: S, options: ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, handshake) = Self::spawn_with_stream(stream, options)?;
        connection.finish_connect(handshake).await
    }

    /// Start connecting without waiting. Commands submitted before the
    /// handshake finishes are held and sent once the session is running.
    pub fn spawn(options: ConnectOptions) -> Result<(Self, Handshake)> {
        options.validate()?;
        let open_options = options.clone();
        Ok(Self::start(
            async move { transport::open(&open_options).await },
            options,
        ))
    }

    pub fn spawn_with_stream<S>(stream: S, options: ConnectOptions) -> Result<(Self, Handshake)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        options.validate()?;
        Ok(Self::start(async move { Ok(stream) }, options))
    }

    pub(crate) fn start<S, F>(open: F, options: ConnectOptions) -> (Self, Handshake)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: std::future::Future<Output = Result<S>> + Send + 'static,
    {
        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let (connected_tx, connected) = oneshot::channel();
        let (state_tx, state) = watch::channel(SessionState::Init);
        let (parameters_tx, parameters) = watch::channel(ConnectionParameters::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let connect_timeout = options.connect_timeout();

        actor::spawn(
            open,
            options,
            inbox,
            connected_tx,
            Published {
                state: state_tx,
                parameters: parameters_tx,
                notifications: notifications.clone(),
            },
        );

        let connection = Self {
            inner: Arc::new(Inner {
                mailbox,
                state,
                parameters,
                notifications,
                statement_ids: AtomicU64::new(1),
                connect_timeout,
            }),
        };
        (connection, Handshake { connected })
    }

    async fn finish_connect(self, handshake: Handshake) -> Result<Self> {
        let timeout = self.inner.connect_timeout;
        match tokio::time::timeout(timeout, handshake.wait()).await {
            Ok(Ok(())) => Ok(self),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                let _ = self.stop().await;
                Err(DatacaveError::Timeout(timeout))
            }
        }
    }

    /// Run `sql` as a simple query.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.query_with(sql, &[], QueryOptions::default()).await
    }

    /// Run `sql` with `$n` placeholders bound to `params`.
    ///
    /// Values travel separately from the statement text.
    pub async fn query_with(
        &self,
        sql: &str,
        params: &[DataValue],
        options: QueryOptions,
    ) -> Result<QueryResult> {
        check_sql(sql)?;
        check_param_count(params.len())?;
        let request = Request::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        match self.submit(request, options.timeout).await? {
            Reply::Rows(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Parse `sql` into a named statement. `param_types` may be empty or
    /// contain zeros to let the server infer types.
    pub async fn prepare(&self, sql: &str, param_types: &[i32]) -> Result<Statement> {
        check_sql(sql)?;
        check_param_count(param_types.len())?;
        let name = format!(
            "s{}",
            self.inner.statement_ids.fetch_add(1, Ordering::Relaxed)
        );
        let request = Request::Prepare {
            name,
            sql: sql.to_string(),
            param_types: param_types.to_vec(),
        };
        match self.submit(request, None).await? {
            Reply::Prepared(statement) => Ok(statement),
            other => Err(unexpected(other)),
        }
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[DataValue],
        options: QueryOptions,
    ) -> Result<QueryResult> {
        if params.len() != statement.param_types.len() {
            return Err(DatacaveError::Usage(format!(
                "statement {} takes {} parameters, got {}",
                statement.name,
                statement.param_types.len(),
                params.len()
            )));
        }
        check_param_count(params.len())?;
        let request = Request::Execute {
            statement: statement.name.clone(),
            params: params.to_vec(),
        };
        match self.submit(request, options.timeout).await? {
            Reply::Rows(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close_statement(&self, statement: Statement) -> Result<()> {
        let request = Request::CloseStatement {
            name: statement.name,
        };
        match self.submit(request, None).await? {
            Reply::Closed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Close the connection. Queued commands are dropped without a reply;
    /// their callers observe [`DatacaveError::Discarded`].
    pub async fn stop(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self
            .inner
            .mailbox
            .send(ActorMessage::Stop { reply })
            .await
            .is_err()
        {
            // Already gone.
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait until the session reaches `Closed` or `Error`.
    pub async fn closed(&self) -> SessionState {
        let mut state = self.inner.state.clone();
        if let Ok(terminal) = state.wait_for(|s| s.is_terminal()).await {
            return *terminal;
        }
        let last = *state.borrow();
        last
    }

    pub fn parameters(&self) -> ConnectionParameters {
        self.inner.parameters.borrow().clone()
    }

    pub fn server_parameter(&self, name: &str) -> Option<String> {
        self.inner.parameters.borrow().get(name).map(str::to_string)
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    async fn submit(&self, request: Request, timeout: Option<Duration>) -> Result<Reply> {
        let (reply, response) = oneshot::channel();
        self.inner
            .mailbox
            .send(ActorMessage::Submit {
                request,
                timeout,
                reply,
            })
            .await
            .map_err(|_| DatacaveError::ConnectionClosed)?;
        response.await.map_err(|_| DatacaveError::Discarded)?
    }
}

/// Statement text travels as a C string.
fn check_sql(sql: &str) -> Result<()> {
    if sql.contains('\0') {
        return Err(DatacaveError::Usage(
            "statement text contains a NUL byte".into(),
        ));
    }
    Ok(())
}

/// Bind and Parse carry parameter counts as 16-bit integers.
fn check_param_count(count: usize) -> Result<()> {
    if count > i16::MAX as usize {
        return Err(DatacaveError::Usage(format!(
            "{count} parameters exceed the protocol limit of {}",
            i16::MAX
        )));
    }
    Ok(())
}

fn unexpected(reply: Reply) -> DatacaveError {
    DatacaveError::protocol(format!("unexpected reply {reply:?}"))
}
