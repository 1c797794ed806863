//! Transport backends: how backend sockets are configured and opened.
//!
//! Exactly one variant is selected per [`crate::PoolManager::start`]:
//!
//! - [`NativeTransport`]: Linux only. Uses kernel-level socket options,
//!   including `TCP_CORK` to coalesce small, frequent writes.
//! - [`PortableTransport`]: any host. Keep-alive, `TCP_NODELAY`, and a short
//!   bounded connect timeout.
//!
//! Selection checks the host once by creating a throwaway socket and applying
//! the variant's options to it. There is no switching between variants after
//! selection.
//!
//! # Architecture
//!
//! ```text
//! select_backend(settings)
//!   → TransportPreference::Auto && NativeTransport::detect() ok → NativeTransport
//!   → PortableTransport::detect() ok                            → PortableTransport
//!   → otherwise                                                 → TransportInitError
//! ```

pub mod native;
pub mod portable;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use shardgate_core::{BackendSettings, DataSourceDescriptor, TransportPreference};
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};

use crate::error::TransportInitError;

pub use native::NativeTransport;
pub use portable::PortableTransport;

/// Listen backlog carried by both variants.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Boxed future alias for transport connect results.
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;

/// Which transport variant is in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Native,
    Portable,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Native => write!(f, "native"),
            TransportKind::Portable => write!(f, "portable"),
        }
    }
}

/// How socket buffers are sized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Leave kernel defaults (and autotuning) in place.
    #[default]
    Default,
    /// Fixed `SO_SNDBUF` / `SO_RCVBUF` sizes in bytes.
    Fixed { send: usize, recv: usize },
}

/// Immutable socket tuning shared by every pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// `SO_KEEPALIVE`.
    pub keep_alive: bool,
    /// `TCP_NODELAY`.
    pub no_delay: bool,
    /// `TCP_CORK`. Only honoured on Linux.
    pub cork: bool,
    /// Listen backlog for listeners sharing this configuration.
    pub backlog: u32,
    /// Bound on a single socket connect.
    pub connect_timeout: Duration,
    pub buffer: BufferStrategy,
    /// Threads in the worker group driving backend I/O.
    pub worker_threads: usize,
}

impl TransportConfig {
    /// Option set of the kernel-level variant.
    pub fn native(worker_threads: usize) -> Self {
        Self {
            keep_alive: true,
            no_delay: false,
            cork: true,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: Duration::from_secs(30),
            buffer: BufferStrategy::Default,
            worker_threads,
        }
    }

    /// Option set of the portable variant.
    pub fn portable(worker_threads: usize) -> Self {
        Self {
            keep_alive: true,
            no_delay: true,
            cork: false,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: Duration::from_millis(100),
            buffer: BufferStrategy::Default,
            worker_threads,
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    pub fn with_buffer(self, buffer: BufferStrategy) -> Self {
        Self { buffer, ..self }
    }
}

/// A non-blocking transport facility that opens backend connections.
///
/// Implementations must be cheap to share; the pool manager hands one
/// `Arc<dyn TransportBackend>` to every pool.
pub trait TransportBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn config(&self) -> &TransportConfig;

    /// Open a configured TCP connection to `target`.
    fn connect<'a>(&'a self, target: &'a DataSourceDescriptor) -> ConnectFuture<'a>;
}

/// Check the host and pick the transport variant for this process.
pub fn select_backend(
    settings: &BackendSettings,
) -> Result<Arc<dyn TransportBackend>, TransportInitError> {
    if settings.transport == TransportPreference::Auto {
        let mut config = TransportConfig::native(settings.worker_threads);
        if let Some(timeout) = settings.connect_timeout {
            config = config.with_connect_timeout(timeout);
        }
        match NativeTransport::detect(config) {
            Ok(native) => {
                log_selected(native.config(), TransportKind::Native);
                return Ok(Arc::new(native));
            }
            Err(e) => {
                tracing::debug!(error = %e, "native transport unavailable, using portable");
            }
        }
    }

    let mut config = TransportConfig::portable(settings.worker_threads);
    if let Some(timeout) = settings.connect_timeout {
        config = config.with_connect_timeout(timeout);
    }
    let portable = PortableTransport::detect(config).map_err(TransportInitError::Unsupported)?;
    log_selected(portable.config(), TransportKind::Portable);
    Ok(Arc::new(portable))
}

fn log_selected(config: &TransportConfig, kind: TransportKind) {
    tracing::info!(
        transport = %kind,
        keep_alive = config.keep_alive,
        no_delay = config.no_delay,
        cork = config.cork,
        backlog = config.backlog,
        connect_timeout = ?config.connect_timeout,
        worker_threads = config.worker_threads,
        "selected backend transport"
    );
}

/// Resolve, configure and connect. Shared by both variants.
pub(crate) async fn establish(
    config: &TransportConfig,
    target: &DataSourceDescriptor,
) -> io::Result<TcpStream> {
    let addr_str = target.address();
    let addr = tokio::net::lookup_host(addr_str.as_str())
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address found for {addr_str}"))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_options(&SockRef::from(&socket), config)?;

    let stream = tokio::time::timeout(config.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {:?}", config.connect_timeout),
            )
        })??;

    tracing::debug!(
        datasource = %target.name,
        host = %target.host,
        port = target.port,
        "established backend connection"
    );
    Ok(stream)
}

/// Apply `config` to a socket that has not connected yet.
pub(crate) fn apply_options(socket: &SockRef<'_>, config: &TransportConfig) -> io::Result<()> {
    socket.set_keepalive(config.keep_alive)?;
    socket.set_nodelay(config.no_delay)?;
    #[cfg(target_os = "linux")]
    {
        if config.cork {
            socket.set_cork(true)?;
        }
    }
    if let BufferStrategy::Fixed { send, recv } = config.buffer {
        socket.set_send_buffer_size(send)?;
        socket.set_recv_buffer_size(recv)?;
    }
    Ok(())
}

/// Create an unconnected TCP socket and apply `config` to it.
pub(crate) fn check_socket_options(config: &TransportConfig) -> io::Result<()> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    apply_options(&SockRef::from(&socket), config)
}
