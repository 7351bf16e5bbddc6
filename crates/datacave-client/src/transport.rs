//! Byte transport under a connection.
//!
//! Neither half is touched by the actor directly. The read half lives in a
//! reader task that forwards every chunk it reads as a [`TransportEvent`]; the
//! channel holds a single event, so the next read is only armed once the actor
//! has taken the previous delivery. The write half lives in a writer task fed
//! over an unbounded channel, so a peer that stops reading can never stall the
//! actor.

use crate::config::{ConnectOptions, SocketKind};
use bytes::{Bytes, BytesMut};
use datacave_core::{DatacaveError, Result};
use datacave_protocol::frontend::encode_message;
use datacave_protocol::FrontendMessage;
use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub enum TransportEvent {
    Data(Bytes),
    /// The peer closed the stream, with the I/O error if it did not close cleanly.
    Closed(Option<String>),
    WriteFailed(String),
}

pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Open the socket described by `options`, bounded by the connect timeout.
pub async fn open(options: &ConnectOptions) -> Result<Transport> {
    let timeout = options.connect_timeout();
    match tokio::time::timeout(timeout, open_inner(options)).await {
        Ok(result) => result,
        Err(_) => Err(DatacaveError::Transport(format!(
            "connect to {} timed out after {timeout:?}",
            options.address()
        ))),
    }
}

async fn open_inner(options: &ConnectOptions) -> Result<Transport> {
    let addr = options.address();
    match options.socket {
        SocketKind::Tcp => Ok(Transport::Tcp(connect_tcp(&addr).await?)),
        SocketKind::Tls => {
            let mut tcp = connect_tcp(&addr).await?;
            negotiate_tls(&mut tcp).await?;
            let roots = root_store(options.tls_ca_file.as_deref())?;
            let tls = tls_handshake(tcp, &options.host, roots).await?;
            Ok(Transport::Tls(Box::new(tls)))
        }
        #[cfg(unix)]
        SocketKind::Unix => {
            let stream = tokio::net::UnixStream::connect(&addr)
                .await
                .map_err(|e| DatacaveError::Transport(format!("failed to connect to {addr}: {e}")))?;
            Ok(Transport::Unix(stream))
        }
        #[cfg(not(unix))]
        SocketKind::Unix => Err(DatacaveError::Config(
            "unix sockets are not available on this platform".into(),
        )),
    }
}

async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| DatacaveError::Transport(format!("failed to connect to {addr}: {e}")))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Ask the server to switch to TLS; it answers with a single `S` or `N` byte.
async fn negotiate_tls(stream: &mut TcpStream) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_message(&mut buf, &FrontendMessage::SslRequest);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    match stream.read_u8().await? {
        b'S' => Ok(()),
        b'N' => Err(DatacaveError::Transport("server does not accept TLS connections".into())),
        other => Err(DatacaveError::protocol(format!(
            "unexpected SSLRequest response {:?}",
            other as char
        ))),
    }
}

/// Trust anchors for the server certificate: the PEM bundle at `ca_file`, or
/// the bundled web PKI roots.
fn root_store(ca_file: Option<&str>) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    let Some(path) = ca_file else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };
    let file = File::open(path)
        .map_err(|e| DatacaveError::Config(format!("cannot open CA file {path}: {e}")))?;
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert
            .map_err(|e| DatacaveError::Config(format!("invalid certificate in {path}: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| DatacaveError::Config(format!("rejected certificate in {path}: {e}")))?;
    }
    if roots.is_empty() {
        return Err(DatacaveError::Config(format!("no certificates found in {path}")));
    }
    Ok(roots)
}

async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    roots: rustls::RootCertStore,
) -> Result<TlsStream<TcpStream>> {
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let domain = rustls::pki_types::ServerName::try_from(host)
        .map_err(|_| DatacaveError::Config(format!("invalid TLS server name {host:?}")))?
        .to_owned();
    connector
        .connect(domain, stream)
        .await
        .map_err(|e| DatacaveError::Transport(format!("TLS handshake failed: {e}")))
}

/// Spawn the task that turns reads into [`TransportEvent`]s.
pub(crate) fn spawn_reader<R>(mut reader: R, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let event = match reader.read_buf(&mut buf).await {
                Ok(0) => TransportEvent::Closed(None),
                Ok(n) => {
                    debug!(bytes = n, "transport read");
                    TransportEvent::Data(buf.split().freeze())
                }
                Err(err) => TransportEvent::Closed(Some(err.to_string())),
            };
            let closed = matches!(event, TransportEvent::Closed(_));
            if events.send(event).await.is_err() || closed {
                break;
            }
        }
    })
}

/// Spawn the task that writes queued buffers in order. Dropping every sender
/// flushes what is queued and shuts the stream down.
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            let written = match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = events.send(TransportEvent::WriteFailed(err.to_string())).await;
                return;
            }
            debug!(bytes = bytes.len(), "transport write");
        }
        let _ = writer.shutdown().await;
    })
}
