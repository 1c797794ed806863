//! shardgate-backend: backend connection layer of the shardgate proxy.
//!
//! Keeps one bounded pool of live TCP connections per downstream data source
//! and takes those pools from cold to warm at startup and back down at stop.
//!
//! - **transport**: picks the native (kernel-level options) or portable socket
//!   configuration once per start, and opens connections with it
//! - **worker**: the dedicated runtime every backend connect runs on
//! - **pool**: `ConnectionPool` with bounded async acquire/release
//! - **registry**: lazily populated data-source name → pool map
//! - **warmup**: pre-establishes every pool to capacity and reports per-slot failures
//! - **manager**: `PoolManager` with `start()` / `stop()` / `get_pool()`
//!
//! # Architecture
//!
//! ```text
//! PoolManager::start()
//!   → DescriptorSource::descriptors()
//!   → select_backend() → NativeTransport | PortableTransport
//!   → WorkerGroup (worker_threads)
//!   → PoolRegistry::get(name) for each descriptor → ConnectionPool
//!   → warm_up(): capacity × acquire, then release all → WarmupReport
//! PoolManager::stop()
//!   → ConnectionPool::drain(grace) for each pool → WorkerGroup shutdown
//! ```

pub mod error;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod warmup;
pub mod worker;

pub use error::{AcquireError, AcquireErrorKind, ManagerError, RegistryError, TransportInitError};
pub use manager::PoolManager;
pub use pool::{ConnectionPool, PoolState, PoolStats, PooledConnection};
pub use registry::PoolRegistry;
pub use transport::{
    BufferStrategy, NativeTransport, PortableTransport, TransportBackend, TransportConfig,
    TransportKind, select_backend,
};
pub use warmup::{DataSourceWarmup, WarmupFailure, WarmupReport};
pub use worker::WorkerGroup;
