//! TCP transport for the RPC server.
//!
//! Newline-delimited JSON framing. Each connection runs in its own task:
//! handshake first, then one request at a time until EOF, an empty line, an
//! I/O error or server shutdown.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::logging::LogThrottle;

use super::dispatcher::Dispatcher;
use super::error::ProtocolError;
use super::protocol::{Handshake, Request, Response, secrets_match};

/// Longest handshake line accepted from an unauthenticated peer.
pub const MAX_HANDSHAKE_LEN: u64 = 4096;

/// Which interface the server listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BindMode {
    /// 127.0.0.1 only.
    #[default]
    Loopback,
    /// The address of the interface used for outbound traffic.
    Public,
    /// 0.0.0.0.
    AllInterfaces,
}

impl BindMode {
    pub fn ip(self) -> IpAddr {
        match self {
            BindMode::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            BindMode::AllInterfaces => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            BindMode::Public => outbound_ip().unwrap_or_else(|e| {
                warn!(error = %e, "No public interface found, falling back to loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }),
        }
    }
}

// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(std::io::Error::other("no route to a public address"));
    }
    Ok(ip)
}

/// Client connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { peer: SocketAddr },
    Disconnected { peer: SocketAddr },
}

/// State shared by every connection of one server.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub secret: Arc<str>,
    pub handshake_timeout: Duration,
    pub dispatcher: Dispatcher,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub active: Arc<AtomicUsize>,
}

pub(crate) struct Transport {
    listener: TcpListener,
    context: ConnectionContext,
}

impl Transport {
    pub fn new(listener: TcpListener, context: ConnectionContext) -> Self {
        Self { listener, context }
    }

    /// Accept connections until `shutdown` fires. Connection tasks are spawned
    /// on `tracker` and get a child of `shutdown`.
    pub async fn serve(self, shutdown: CancellationToken, tracker: TaskTracker) {
        let accept_errors = LogThrottle::new(Duration::from_secs(5));
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("RPC server no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_errors.reset();
                        let context = self.context.clone();
                        let token = shutdown.child_token();
                        tracker.spawn(run_connection(stream, peer, context, token));
                    }
                    Err(e) => {
                        if accept_errors.should_log() {
                            error!(error = %e, "Failed to accept connection");
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

struct ConnectionGuard {
    peer: SocketAddr,
    active: Arc<AtomicUsize>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionGuard {
    fn open(peer: SocketAddr, context: &ConnectionContext) -> Self {
        context.active.fetch_add(1, Ordering::SeqCst);
        let _ = context.events.send(ConnectionEvent::Connected { peer });
        Self {
            peer,
            active: Arc::clone(&context.active),
            events: context.events.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self
            .events
            .send(ConnectionEvent::Disconnected { peer: self.peer });
    }
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ConnectionContext,
    shutdown: CancellationToken,
) {
    let _guard = ConnectionGuard::open(peer, &context);
    debug!(peer = %peer, "Client connected");

    match handle_connection(stream, peer, &context, &shutdown).await {
        Ok(()) => debug!(peer = %peer, "Client disconnected"),
        Err(ProtocolError::Io(e)) => debug!(peer = %peer, error = %e, "Connection error"),
        Err(e @ ProtocolError::ClosedBeforeHandshake) => debug!(peer = %peer, "{}", e),
        Err(e) => warn!(peer = %peer, error = %e, "Closing connection"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: &ConnectionContext,
    shutdown: &CancellationToken,
) -> Result<(), ProtocolError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        result = authenticate(&mut reader, &mut writer, context) => result?,
    }
    debug!(peer = %peer, "Handshake accepted");

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_line(&mut line) => read?,
        };

        let trimmed = line.trim();
        if read == 0 || trimmed.is_empty() {
            break;
        }

        let request: Request = serde_json::from_str(trimmed).map_err(ProtocolError::Malformed)?;
        debug!(peer = %peer, id = request.id, method = %request.method, "Request received");

        // In-flight requests run to completion even if shutdown fires.
        let response = context.dispatcher.dispatch(request).await;
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn authenticate<W>(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut W,
    context: &ConnectionContext,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    let mut bounded = (&mut *reader).take(MAX_HANDSHAKE_LEN);
    let read = tokio::time::timeout(context.handshake_timeout, bounded.read_line(&mut line))
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout(context.handshake_timeout))??;
    if read == 0 {
        return Err(ProtocolError::ClosedBeforeHandshake);
    }
    if !line.ends_with('\n') && read as u64 >= MAX_HANDSHAKE_LEN {
        warn!(limit = MAX_HANDSHAKE_LEN, "Handshake line too long");
        return Err(ProtocolError::HandshakeRejected);
    }

    let handshake = Handshake::parse(&line).ok_or(ProtocolError::HandshakeRejected)?;
    let accepted = handshake
        .secret()
        .is_some_and(|presented| secrets_match(&context.secret, presented));

    if let Handshake::Authenticate { id, .. } = handshake {
        let response = if accepted {
            Response::success(id, Value::Bool(true))
        } else {
            Response::error(id, "Authentication failed")
        };
        write_response(writer, &response).await?;
    }

    if accepted {
        Ok(())
    } else {
        Err(ProtocolError::HandshakeRejected)
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(response).map_err(ProtocolError::Encode)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_all_interfaces() {
        assert_eq!(BindMode::Loopback.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(BindMode::AllInterfaces.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(BindMode::default(), BindMode::Loopback);
    }

    #[test]
    fn public_never_resolves_to_unspecified() {
        assert!(!BindMode::Public.ip().is_unspecified());
    }

    #[test]
    fn bind_mode_names() {
        let mode: BindMode = serde_json::from_str(r#""all-interfaces""#).unwrap();
        assert_eq!(mode, BindMode::AllInterfaces);
        assert_eq!(serde_json::to_string(&BindMode::Public).unwrap(), r#""public""#);
    }

    #[tokio::test]
    async fn write_response_appends_newline() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::success(1, Value::from("pong")))
            .await
            .unwrap();
        assert_eq!(out, b"{\"id\":1,\"result\":\"pong\",\"error\":null}\n");
    }
}
