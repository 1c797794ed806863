//! Per-data-source bounded connection pool.
//!
//! A [`ConnectionPool`] holds up to `capacity` live TCP connections to one
//! data source. Capacity is enforced by a semaphore: a caller holds a permit
//! while it has a connection checked out, and idle connections hold none.
//!
//! ```text
//! acquire(timeout)
//!   → pool closed                          → AcquireError::Closed
//!   → no permit before timeout             → AcquireError::Exhausted
//!   → idle connection available            → reuse it
//!   → otherwise connect on the worker group
//!       → connect outlives timeout         → AcquireError::Timeout
//!       → connect fails                    → AcquireError::Connect
//! release(conn)
//!   → back to idle, permit returned
//! ```
//!
//! Every outstanding connection leaves a duplicated socket handle with the
//! pool, which is how [`ConnectionPool::close`] shuts down sockets that are
//! still in a caller's hands.

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use shardgate_core::DataSourceDescriptor;
use socket2::{SockRef, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::AcquireError;
use crate::transport::TransportBackend;

/// How often `drain` checks whether checked-out connections came back.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pool lifecycle. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Warming,
    Ready,
    Closed,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Uninitialized => write!(f, "uninitialized"),
            PoolState::Warming => write!(f, "warming"),
            PoolState::Ready => write!(f, "ready"),
            PoolState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time statistics for one pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub datasource: String,
    pub capacity: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently checked out.
    pub outstanding: usize,
    /// Sockets this pool has ever established.
    pub total_created: u64,
    pub state: PoolState,
}

struct IdleConnection {
    id: u64,
    stream: TcpStream,
    closer: Socket,
    created_at: Instant,
}

struct Slots {
    state: PoolState,
    idle: Vec<IdleConnection>,
    /// Duplicated handles of checked-out sockets, keyed by connection id.
    outstanding: HashMap<u64, Socket>,
    total_created: u64,
}

pub(crate) struct PoolShared {
    descriptor: DataSourceDescriptor,
    capacity: usize,
    transport: Arc<dyn TransportBackend>,
    worker: Handle,
    permits: Semaphore,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Forget a checked-out connection that was dropped instead of released.
    fn discard(&self, id: u64) {
        let mut slots = self.slots();
        if slots.outstanding.remove(&id).is_none() {
            return;
        }
        let closed = slots.state == PoolState::Closed;
        drop(slots);
        if !closed {
            self.permits.add_permits(1);
        }
        tracing::debug!(
            datasource = %self.name(),
            connection_id = id,
            "discarded connection dropped without release"
        );
    }
}

/// A bounded pool of reusable connections to one data source.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are established on `worker`.
    pub fn new(
        descriptor: DataSourceDescriptor,
        capacity: usize,
        transport: Arc<dyn TransportBackend>,
        worker: Handle,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(PoolShared {
                descriptor,
                capacity,
                transport,
                worker,
                permits: Semaphore::new(capacity),
                slots: Mutex::new(Slots {
                    state: PoolState::Uninitialized,
                    idle: Vec::with_capacity(capacity),
                    outstanding: HashMap::with_capacity(capacity),
                    total_created: 0,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn descriptor(&self) -> &DataSourceDescriptor {
        &self.shared.descriptor
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn state(&self) -> PoolState {
        self.shared.slots().state
    }

    pub fn idle_count(&self) -> usize {
        self.shared.slots().idle.len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.shared.slots().outstanding.len()
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots();
        PoolStats {
            datasource: self.name().to_string(),
            capacity: self.shared.capacity,
            idle: slots.idle.len(),
            outstanding: slots.outstanding.len(),
            total_created: slots.total_created,
            state: slots.state,
        }
    }

    /// Move the pool forward to `next`. Returns `false` if the pool is
    /// already at or past that state.
    pub(crate) fn advance(&self, next: PoolState) -> bool {
        let mut slots = self.shared.slots();
        if next > slots.state {
            slots.state = next;
            true
        } else {
            false
        }
    }

    /// Check out a connection, waiting at most `timeout` in total.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, AcquireError> {
        let shared = &self.shared;
        if self.state() == PoolState::Closed {
            return Err(self.closed_error());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let permit = match tokio::time::timeout_at(deadline, shared.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                return Err(AcquireError::Exhausted {
                    datasource: self.name().to_string(),
                    capacity: shared.capacity,
                    waited: timeout,
                });
            }
        };

        // Reuse an idle connection first.
        {
            let mut slots = shared.slots();
            if slots.state == PoolState::Closed {
                return Err(self.closed_error());
            }
            if let Some(idle) = slots.idle.pop() {
                slots.outstanding.insert(idle.id, idle.closer);
                permit.forget();
                tracing::debug!(
                    datasource = %self.name(),
                    connection_id = idle.id,
                    idle = slots.idle.len(),
                    outstanding = slots.outstanding.len(),
                    "reused idle connection"
                );
                return Ok(self.checkout(idle.id, idle.stream, idle.created_at));
            }
        }

        // Establish a new one on the worker group.
        let transport = Arc::clone(&shared.transport);
        let descriptor = shared.descriptor.clone();
        let mut task = shared
            .worker
            .spawn(async move { transport.connect(&descriptor).await });

        let stream = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(stream))) => stream,
            // The transport's own connect bound fired first.
            Ok(Ok(Err(source))) if source.kind() == io::ErrorKind::TimedOut => {
                return Err(AcquireError::Timeout {
                    datasource: self.name().to_string(),
                    timeout: shared.transport.config().connect_timeout.min(timeout),
                });
            }
            Ok(Ok(Err(source))) => {
                return Err(AcquireError::Connect {
                    datasource: self.name().to_string(),
                    source,
                });
            }
            Ok(Err(join_error)) => {
                return Err(AcquireError::Connect {
                    datasource: self.name().to_string(),
                    source: io::Error::other(join_error),
                });
            }
            Err(_) => {
                task.abort();
                return Err(AcquireError::Timeout {
                    datasource: self.name().to_string(),
                    timeout,
                });
            }
        };

        let closer = SockRef::from(&stream)
            .try_clone()
            .map_err(|source| AcquireError::Connect {
                datasource: self.name().to_string(),
                source,
            })?;

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut slots = shared.slots();
        if slots.state == PoolState::Closed {
            return Err(self.closed_error());
        }
        slots.outstanding.insert(id, closer);
        slots.total_created += 1;
        permit.forget();
        tracing::debug!(
            datasource = %self.name(),
            connection_id = id,
            outstanding = slots.outstanding.len(),
            total_created = slots.total_created,
            "created new connection"
        );
        drop(slots);
        Ok(self.checkout(id, stream, Instant::now()))
    }

    fn checkout(&self, id: u64, stream: TcpStream, created_at: Instant) -> PooledConnection {
        PooledConnection {
            id,
            stream,
            created_at,
            datasource: self.name().to_string(),
            lease: Lease {
                pool: Arc::downgrade(&self.shared),
                id,
                armed: true,
            },
        }
    }

    fn closed_error(&self) -> AcquireError {
        AcquireError::Closed {
            datasource: self.name().to_string(),
        }
    }

    /// Return a checked-out connection to the idle set.
    ///
    /// A connection from another pool, or one this pool no longer tracks, is
    /// logged and not added. Into a closed pool the socket is closed instead.
    pub fn release(&self, conn: PooledConnection) {
        let PooledConnection {
            id,
            stream,
            created_at,
            datasource,
            mut lease,
        } = conn;

        if !std::ptr::eq(Weak::as_ptr(&lease.pool), Arc::as_ptr(&self.shared)) {
            // The lease stays armed so the owning pool frees the slot.
            tracing::warn!(
                datasource = %self.name(),
                owner = %datasource,
                connection_id = id,
                "released connection belongs to another pool; ignoring"
            );
            return;
        }
        lease.armed = false;

        let mut slots = self.shared.slots();
        let Some(closer) = slots.outstanding.remove(&id) else {
            if slots.state == PoolState::Closed {
                tracing::debug!(
                    datasource = %self.name(),
                    connection_id = id,
                    "connection released after pool was force-closed"
                );
            } else {
                tracing::warn!(
                    datasource = %self.name(),
                    connection_id = id,
                    "released connection is not checked out; ignoring"
                );
            }
            return;
        };

        if slots.state == PoolState::Closed {
            drop(slots);
            shutdown_socket(self.name(), id, &closer);
            tracing::debug!(
                datasource = %self.name(),
                connection_id = id,
                "closed connection released into closed pool"
            );
            return;
        }

        slots.idle.push(IdleConnection {
            id,
            stream,
            closer,
            created_at,
        });
        let idle = slots.idle.len();
        let outstanding = slots.outstanding.len();
        drop(slots);
        self.shared.permits.add_permits(1);

        tracing::debug!(
            datasource = %self.name(),
            connection_id = id,
            idle,
            outstanding,
            "returned connection to pool"
        );
    }

    /// Close every idle and checked-out connection and move to `Closed`.
    ///
    /// Waiters in `acquire` wake with [`AcquireError::Closed`]. Returns the
    /// number of sockets closed.
    pub fn close(&self) -> usize {
        let (idle, outstanding) = {
            let mut slots = self.shared.slots();
            slots.state = PoolState::Closed;
            (
                std::mem::take(&mut slots.idle),
                std::mem::take(&mut slots.outstanding),
            )
        };
        self.shared.permits.close();

        for conn in &idle {
            shutdown_socket(self.name(), conn.id, &conn.closer);
        }
        for (id, closer) in &outstanding {
            shutdown_socket(self.name(), *id, closer);
        }

        let closed = idle.len() + outstanding.len();
        if closed > 0 {
            tracing::info!(
                datasource = %self.name(),
                idle = idle.len(),
                outstanding = outstanding.len(),
                "closed connection pool"
            );
        } else {
            tracing::debug!(datasource = %self.name(), "closed empty connection pool");
        }
        closed
    }

    /// Stop handing out connections, wait up to `grace` for checked-out ones
    /// to come back, then close everything.
    ///
    /// Returns how many checked-out connections had to be force-closed.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.shared.slots().state = PoolState::Closed;
        self.shared.permits.close();
        tracing::debug!(datasource = %self.name(), grace = ?grace, "draining connection pool");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let outstanding = self.outstanding_count();
            if outstanding == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    datasource = %self.name(),
                    remaining = outstanding,
                    "drain grace period expired, force-closing checked-out connections"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let forced = self.outstanding_count();
        self.close();
        forced
    }
}

fn shutdown_socket(datasource: &str, id: u64, socket: &Socket) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::warn!(
                datasource = %datasource,
                connection_id = id,
                error = %e,
                "failed to shut down backend socket"
            );
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("datasource", &self.name())
            .field("capacity", &self.shared.capacity)
            .field("transport", &self.shared.transport.kind())
            .finish_non_exhaustive()
    }
}

// ── PooledConnection ────────────────────────────────────────────────

/// Frees the pool slot if a connection is dropped without being released.
struct Lease {
    pool: Weak<PoolShared>,
    id: u64,
    armed: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pool) = self.pool.upgrade() {
                pool.discard(self.id);
            }
        }
    }
}

/// A live connection checked out of a [`ConnectionPool`].
///
/// Return it with [`PooledConnection::release`]. Dropping it instead closes
/// the socket and frees its slot in the pool.
pub struct PooledConnection {
    id: u64,
    stream: TcpStream,
    created_at: Instant,
    datasource: String,
    lease: Lease,
}

impl PooledConnection {
    /// Unique id within the owning pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    /// Time since the underlying socket was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Return this connection to the pool it came from.
    pub fn release(self) {
        match self.lease.pool.upgrade() {
            Some(shared) => ConnectionPool { shared }.release(self),
            None => {
                tracing::debug!(
                    datasource = %self.datasource,
                    connection_id = self.id,
                    "owning pool is gone; closing connection"
                );
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("datasource", &self.datasource)
            .field("age", &self.age())
            .finish()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
