//! The task that owns one server connection.
//!
//! Every mutation of the session happens here, one event at a time: commands
//! from handles, transport events from the reader and writer tasks, and
//! deadline expiries. Handling an event never waits on the socket.
//! Commands are replied to in submission order because the server answers in
//! that order and only the queue head is ever on the wire.

use crate::config::ConnectOptions;
use crate::exchange::{Exchange, Reply, Request, Step};
use crate::frame::FrameBuffer;
use crate::queue::{CommandQueue, PendingCommand, ReplySender};
use crate::session::{BackendKey, ConnectionParameters, Notification, SessionState};
use crate::timer::DeadlineTimer;
use crate::transport::{spawn_reader, spawn_writer, TransportEvent};
use bytes::{Bytes, BytesMut};
use datacave_core::{DatacaveError, Result};
use datacave_protocol::frontend::encode_message;
use datacave_protocol::{BackendMessage, FrontendMessage};
use metrics::counter;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on the goodbye sent when the connection is stopped.
const TERMINATE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Submit {
        request: Request,
        /// Falls back to the configured query timeout.
        timeout: Option<Duration>,
        reply: ReplySender,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Channels through which the actor publishes session state to handles.
pub(crate) struct Published {
    pub(crate) state: watch::Sender<SessionState>,
    pub(crate) parameters: watch::Sender<ConnectionParameters>,
    pub(crate) notifications: broadcast::Sender<Notification>,
}

enum Exit {
    Stopped(oneshot::Sender<()>),
    /// Every handle is gone.
    Abandoned,
    PeerClosed(Option<String>),
    Failed(DatacaveError),
}

/// Start the actor. `open` produces the byte stream; the handshake result is
/// delivered on `connected`.
pub(crate) fn spawn<S, F>(
    open: F,
    options: ConnectOptions,
    mailbox: mpsc::Receiver<ActorMessage>,
    connected: ReplySender,
    published: Published,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = Result<S>> + Send + 'static,
{
    tokio::spawn(run(open, options, mailbox, connected, published));
}

async fn run<S, F>(
    open: F,
    options: ConnectOptions,
    mut mailbox: mpsc::Receiver<ActorMessage>,
    connected: ReplySender,
    published: Published,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = Result<S>> + Send + 'static,
{
    let id = Uuid::new_v4();
    published.state.send_replace(SessionState::Connecting);
    debug!(connection = %id, addr = %options.address(), "connecting");

    let stream = match open.await {
        Ok(stream) => stream,
        Err(err) => {
            error!(connection = %id, "connect failed: {err}");
            counter!("client_connections_failed_total").increment(1);
            published.state.send_replace(SessionState::Error);
            let _ = connected.send(Err(err));
            refuse_pending(&mut mailbox, true);
            return;
        }
    };

    let (reader, writer) = tokio::io::split(stream);
    let (event_tx, mut events) = mpsc::channel(1);
    let (outbound, queued) = mpsc::unbounded_channel();
    let writer_task = spawn_writer(writer, queued, event_tx.clone());
    let reader_task = spawn_reader(reader, event_tx);
    let (timer_tx, mut timers) = mpsc::unbounded_channel();

    let mut actor = Actor {
        id,
        state: SessionState::Connecting,
        frames: FrameBuffer::new(options.max_message_bytes),
        options,
        queue: CommandQueue::new(),
        exchange: None,
        outbound: Some(outbound),
        writer_task,
        next_id: 1,
        timer_tx,
        published,
    };
    actor
        .queue
        .push(PendingCommand::new(0, Request::Startup, connected, None));
    actor.set_state(SessionState::Handshake);

    let exit = match actor.dispatch_next() {
        Ok(()) => {
            actor
                .event_loop(&mut mailbox, &mut events, &mut timers)
                .await
        }
        Err(err) => Exit::Failed(err),
    };
    let failed = !matches!(exit, Exit::Stopped(_) | Exit::Abandoned);
    actor.shutdown(exit).await;
    reader_task.abort();
    refuse_pending(&mut mailbox, failed);
}

/// Answer whatever reached the mailbox after the actor stopped reading it.
fn refuse_pending(mailbox: &mut mpsc::Receiver<ActorMessage>, failed: bool) {
    mailbox.close();
    while let Ok(message) = mailbox.try_recv() {
        match message {
            ActorMessage::Submit { reply, .. } if failed => {
                let _ = reply.send(Err(DatacaveError::ConnectionClosed));
            }
            ActorMessage::Submit { .. } => {}
            ActorMessage::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

struct Actor {
    id: Uuid,
    state: SessionState,
    options: ConnectOptions,
    queue: CommandQueue,
    frames: FrameBuffer,
    exchange: Option<Exchange>,
    /// Buffers for the writer task; `None` once the connection is closing.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    writer_task: JoinHandle<()>,
    next_id: u64,
    timer_tx: mpsc::UnboundedSender<u64>,
    published: Published,
}

impl Actor {
    async fn event_loop(
        &mut self,
        mailbox: &mut mpsc::Receiver<ActorMessage>,
        events: &mut mpsc::Receiver<TransportEvent>,
        timers: &mut mpsc::UnboundedReceiver<u64>,
    ) -> Exit {
        loop {
            let outcome = tokio::select! {
                message = mailbox.recv() => match message {
                    Some(ActorMessage::Submit { request, timeout, reply }) => {
                        self.submit(request, timeout, reply)
                    }
                    Some(ActorMessage::Stop { reply }) => return Exit::Stopped(reply),
                    None => return Exit::Abandoned,
                },
                event = events.recv() => match event {
                    Some(TransportEvent::Data(bytes)) => self.receive(&bytes),
                    Some(TransportEvent::Closed(reason)) => return Exit::PeerClosed(reason),
                    Some(TransportEvent::WriteFailed(reason)) => Err(DatacaveError::Transport(
                        format!("write failed: {reason}"),
                    )),
                    None => return Exit::PeerClosed(None),
                },
                Some(id) = timers.recv() => self.deadline_elapsed(id),
            };
            if let Err(err) = outcome {
                return Exit::Failed(err);
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(connection = %self.id, from = %self.state, to = %state, "state change");
            self.state = state;
            self.published.state.send_replace(state);
        }
    }

    fn submit(
        &mut self,
        request: Request,
        timeout: Option<Duration>,
        reply: ReplySender,
    ) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;
        let timeout = timeout.unwrap_or_else(|| self.options.query_timeout());
        let timer = DeadlineTimer::arm(id, timeout, self.timer_tx.clone());
        debug!(
            connection = %self.id,
            command = id,
            request = %request.describe(),
            queued = self.queue.len(),
            "submit"
        );
        counter!("client_requests_total").increment(1);
        self.queue
            .push(PendingCommand::new(id, request, reply, Some(timer)));
        self.dispatch_next()
    }

    /// Send the queue head if nothing is in flight and the session accepts it.
    fn dispatch_next(&mut self) -> Result<()> {
        if !self.queue.is_idle() {
            return Ok(());
        }
        let Some(head) = self.queue.peek() else {
            return Ok(());
        };
        let startup = matches!(head.request, Request::Startup);
        if !startup && self.state != SessionState::Running {
            return Ok(());
        }
        let command = head.id;
        let (exchange, bytes) = Exchange::start(&head.request, &self.options);
        debug!(connection = %self.id, command, "dispatch");
        self.queue.mark_in_flight();
        self.exchange = Some(exchange);
        self.write(bytes)
    }

    /// Hand `bytes` to the writer task. Failures surface later as a
    /// `WriteFailed` event.
    fn write(&mut self, bytes: BytesMut) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(DatacaveError::ConnectionClosed)?;
        outbound
            .send(bytes.freeze())
            .map_err(|_| DatacaveError::Transport("writer task has exited".into()))
    }

    /// Feed one delivery through the frame buffer and handle every complete message.
    fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        self.frames.push(bytes);
        while let Some(message) = self.frames.next_message()? {
            self.handle_message(message)?;
        }
        if self.frames.pending_bytes() > 0 {
            debug!(
                connection = %self.id,
                pending = self.frames.pending_bytes(),
                "partial message buffered"
            );
        }
        Ok(())
    }

    fn handle_message(&mut self, message: BackendMessage) -> Result<()> {
        let message = match message {
            BackendMessage::ParameterStatus { key, value } => {
                debug!(connection = %self.id, %key, %value, "server parameter");
                self.published.parameters.send_modify(|params| {
                    params.server.insert(key, value);
                });
                return Ok(());
            }
            BackendMessage::BackendKeyData { pid, secret } => {
                self.published.parameters.send_modify(|params| {
                    params.backend_key = Some(BackendKey {
                        process_id: pid,
                        secret,
                    });
                });
                return Ok(());
            }
            BackendMessage::NoticeResponse(notice) => {
                warn!(connection = %self.id, code = %notice.code, "{}", notice.message);
                return Ok(());
            }
            BackendMessage::NotificationResponse {
                pid,
                channel,
                payload,
            } => {
                // No subscribers is not an error.
                let _ = self.published.notifications.send(Notification {
                    process_id: pid,
                    channel,
                    payload,
                });
                return Ok(());
            }
            message => message,
        };

        let Some(exchange) = self.exchange.as_mut() else {
            return match message {
                BackendMessage::ErrorResponse(err) => Err(DatacaveError::Server(err)),
                message => Err(DatacaveError::protocol(format!(
                    "unexpected {} with no request in flight",
                    message.name()
                ))),
            };
        };
        match exchange.step(message)? {
            Step::Pending => Ok(()),
            Step::Write(bytes) => self.write(bytes),
            Step::Done(result) => self.complete(result),
        }
    }

    fn complete(&mut self, result: Result<Reply>) -> Result<()> {
        let handshake = self
            .exchange
            .take()
            .is_some_and(|exchange| exchange.is_startup());
        let command = self
            .queue
            .pop_in_flight()
            .ok_or_else(|| DatacaveError::protocol("reply with no request in flight"))?;
        match &result {
            Ok(_) => debug!(connection = %self.id, command = command.id, "reply"),
            Err(err) => {
                counter!("client_request_errors_total").increment(1);
                debug!(connection = %self.id, command = command.id, "request failed: {err}");
            }
        }
        // Publish Running before the connect caller can observe the reply.
        if handshake {
            self.set_state(SessionState::Running);
            counter!("client_connections_total").increment(1);
            info!(connection = %self.id, user = %self.options.user, "connection ready");
        }
        command.reply(result);
        self.dispatch_next()
    }

    /// A deadline fired. Late events for commands already answered are ignored.
    fn deadline_elapsed(&mut self, id: u64) -> Result<()> {
        if self.queue.is_head_in_flight(id) {
            // The reply is still owed on the wire; the stream cannot be resynchronised.
            let timeout = self
                .queue
                .head_mut()
                .and_then(PendingCommand::timer_fired)
                .unwrap_or_default();
            counter!("client_timeouts_total").increment(1);
            warn!(connection = %self.id, command = id, ?timeout, "in-flight request timed out");
            return Err(DatacaveError::Timeout(timeout));
        }
        if let Some(mut command) = self.queue.remove_waiting(id) {
            let timeout = command.timer_fired().unwrap_or_default();
            counter!("client_timeouts_total").increment(1);
            debug!(connection = %self.id, command = id, ?timeout, "queued request timed out");
            command.reply(Err(DatacaveError::Timeout(timeout)));
        }
        Ok(())
    }

    async fn shutdown(mut self, exit: Exit) {
        match exit {
            Exit::Stopped(reply) => {
                self.discard_all();
                self.terminate().await;
                self.set_state(SessionState::Closed);
                info!(connection = %self.id, "connection stopped");
                let _ = reply.send(());
            }
            Exit::Abandoned => {
                self.discard_all();
                self.terminate().await;
                self.set_state(SessionState::Closed);
                debug!(connection = %self.id, "all handles dropped");
            }
            Exit::PeerClosed(reason) => {
                let clean = reason.is_none() && self.queue.is_empty();
                match reason {
                    Some(reason) => warn!(connection = %self.id, "connection lost: {reason}"),
                    None => info!(connection = %self.id, "server closed the connection"),
                }
                self.set_state(if clean {
                    SessionState::Closed
                } else {
                    SessionState::Error
                });
                self.fail_all(None);
                self.abort_writer();
            }
            Exit::Failed(err) => {
                error!(connection = %self.id, "connection failed: {err}");
                if self.state == SessionState::Handshake {
                    counter!("client_connections_failed_total").increment(1);
                }
                self.set_state(SessionState::Error);
                self.fail_all(Some(err));
                self.abort_writer();
            }
        }
    }

    fn discard_all(&mut self) {
        self.exchange = None;
        let discarded = self.queue.len();
        for command in self.queue.drain() {
            command.discard();
        }
        if discarded > 0 {
            debug!(connection = %self.id, discarded, "queued requests discarded");
        }
    }

    /// The in-flight head receives `err`; everything else sees the connection close.
    fn fail_all(&mut self, err: Option<DatacaveError>) {
        self.exchange = None;
        let mut head_error = if self.queue.is_in_flight() { err } else { None };
        for command in self.queue.drain() {
            let err = head_error.take().unwrap_or(DatacaveError::ConnectionClosed);
            command.reply(Err(err));
        }
    }

    /// Queue `Terminate` and give the writer a short grace period to deliver
    /// it. A peer that is not reading cannot hold the shutdown up.
    async fn terminate(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let mut buf = BytesMut::new();
            encode_message(&mut buf, &FrontendMessage::Terminate);
            let _ = outbound.send(buf.freeze());
        }
        if tokio::time::timeout(TERMINATE_GRACE, &mut self.writer_task)
            .await
            .is_err()
        {
            debug!(connection = %self.id, "terminate not delivered");
            self.writer_task.abort();
        }
    }

    fn abort_writer(&mut self) {
        self.outbound = None;
        self.writer_task.abort();
    }
}
