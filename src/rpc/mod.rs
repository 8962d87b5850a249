//! JSON-RPC bridge between interpreter processes and receivers.
//!
//! ## Architecture
//!
//! - `params`: parameter specs and wire value conversion
//! - `registry`: method descriptors and the name → method table
//! - `receiver`: the `Receiver` trait and per-session lifecycle management
//! - `events`: session event queue for callback-driven receivers
//! - `dispatcher`: resolve, convert, invoke, respond
//! - `protocol`: wire envelopes and the handshake
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `client`: client for connecting to a running server
//!
//! All connections to one [`RpcServer`] share a single set of receiver
//! instances; `stop` shuts them down.

pub mod client;
mod dispatcher;
pub mod error;
pub mod events;
pub mod params;
mod protocol;
pub mod receiver;
pub mod registry;
mod transport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::launcher::ProxyEnv;
use transport::{ConnectionContext, Transport};

pub use client::{ClientError, RpcClient};
pub use dispatcher::Dispatcher;
pub use error::{ConversionError, DispatchError, ProtocolError, ReceiverError, RegistryError};
pub use events::{Event, EventQueue};
pub use params::{Arg, Args, ParamSpec, ParamType};
pub use protocol::{AUTHENTICATE_METHOD, Handshake, Request, Response};
pub use receiver::{
    Receiver, ReceiverManager, ReceiverState, ReceiverType, SessionContext, ShutdownReport,
};
pub use registry::{MethodDescriptor, MethodRegistry, MethodSpec};
pub use transport::{BindMode, ConnectionEvent, MAX_HANDSHAKE_LEN};

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// 0 picks a free port.
    pub port: u16,
    /// Handshake secret. A random UUID is generated when unset.
    pub secret: Option<String>,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub event_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 0,
            secret: None,
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            event_queue_capacity: events::DEFAULT_CAPACITY,
        }
    }
}

/// RPC server exposing registered receiver methods to interpreter processes.
pub struct RpcServer {
    settings: ServerSettings,
    secret: Arc<str>,
    dispatcher: Dispatcher,
    receivers: Arc<ReceiverManager>,
    connections: broadcast::Sender<ConnectionEvent>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: OnceLock<SocketAddr>,
}

impl RpcServer {
    /// Build the method registry and receiver manager. Fails on duplicate
    /// method or receiver names and on invalid default literals.
    pub fn new(
        settings: ServerSettings,
        receiver_types: Vec<ReceiverType>,
    ) -> Result<Self, RegistryError> {
        let registry = Arc::new(MethodRegistry::from_types(&receiver_types)?);
        let context = SessionContext::new(EventQueue::new(settings.event_queue_capacity));
        let receivers = Arc::new(ReceiverManager::new(&receiver_types, context)?);

        let secret: Arc<str> = match &settings.secret {
            Some(secret) => Arc::from(secret.as_str()),
            None => Arc::from(uuid::Uuid::new_v4().to_string()),
        };
        let (connections, _) = broadcast::channel(64);

        Ok(Self {
            settings,
            secret,
            dispatcher: Dispatcher::new(registry, Arc::clone(&receivers)),
            receivers,
            connections,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: OnceLock::new(),
        })
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        self.dispatcher.registry()
    }

    pub fn receivers(&self) -> &Arc<ReceiverManager> {
        &self.receivers
    }

    /// Session-wide event queue.
    pub fn events(&self) -> &EventQueue {
        self.receivers.context().events()
    }

    /// Bind and start accepting connections in the background. Returns the
    /// bound address.
    pub async fn start(&self, bind: BindMode) -> anyhow::Result<SocketAddr> {
        if self.shutdown.is_cancelled() {
            bail!("RPC server has been stopped and cannot be restarted");
        }
        if self.local_addr.get().is_some() {
            bail!("RPC server is already running");
        }

        let ip = bind.ip();
        let listener = TcpListener::bind((ip, self.settings.port))
            .await
            .with_context(|| {
                format!("Failed to bind RPC server to {}:{}", ip, self.settings.port)
            })?;
        let addr = listener.local_addr()?;
        if self.local_addr.set(addr).is_err() {
            bail!("RPC server is already running");
        }

        let context = ConnectionContext {
            secret: Arc::clone(&self.secret),
            handshake_timeout: self.settings.handshake_timeout,
            dispatcher: self.dispatcher.clone(),
            events: self.connections.clone(),
            active: Arc::clone(&self.active),
        };
        let transport = Transport::new(listener, context);
        self.tracker
            .spawn(transport.serve(self.shutdown.clone(), self.tracker.clone()));

        info!(addr = %addr, methods = self.registry().len(), "RPC server started");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Connection details for an interpreter process, once started.
    pub fn proxy_env(&self) -> Option<ProxyEnv> {
        self.local_addr()
            .map(|addr| ProxyEnv::new(addr.ip().to_string(), addr.port(), self.secret.to_string()))
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Stop accepting, let connections wind down for up to the grace period,
    /// then shut down every constructed receiver. Safe to call repeatedly;
    /// only the first call returns a non-empty report.
    pub async fn stop(&self) -> ShutdownReport {
        self.shutdown.cancel();
        self.tracker.close();

        let grace = self.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "Connections still busy after {:?}, abandoning them", grace
            );
        }

        self.receivers.shutdown_all().await
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
