//! Backend connection layer error types.

use std::time::Duration;

use serde::Serialize;
use shardgate_core::ConfigError;
use thiserror::Error;

/// Neither transport variant could be constructed on this host.
#[derive(Debug, Error)]
pub enum TransportInitError {
    #[error("no transport backend could be constructed: {0}")]
    Unsupported(#[source] std::io::Error),
}

/// Errors returned by [`crate::ConnectionPool::acquire`].
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Establishing a new connection exceeded the acquire timeout.
    #[error("connection to {datasource} timed out after {timeout:?}")]
    Timeout { datasource: String, timeout: Duration },

    /// Every slot stayed checked out for the whole acquire timeout.
    #[error("connection pool exhausted for {datasource} (capacity {capacity}, waited {waited:?})")]
    Exhausted {
        datasource: String,
        capacity: usize,
        waited: Duration,
    },

    /// The pool was closed before or while waiting.
    #[error("connection pool for {datasource} is closed")]
    Closed { datasource: String },

    /// The downstream node refused or the connect failed outright.
    #[error("failed to connect to {datasource}: {source}")]
    Connect {
        datasource: String,
        #[source]
        source: std::io::Error,
    },
}

/// Discriminant of an [`AcquireError`], for reports and assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireErrorKind {
    Timeout,
    Exhausted,
    Closed,
    Connect,
}

impl AcquireError {
    pub fn kind(&self) -> AcquireErrorKind {
        match self {
            AcquireError::Timeout { .. } => AcquireErrorKind::Timeout,
            AcquireError::Exhausted { .. } => AcquireErrorKind::Exhausted,
            AcquireError::Closed { .. } => AcquireErrorKind::Closed,
            AcquireError::Connect { .. } => AcquireErrorKind::Connect,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, AcquireError::Closed { .. })
    }
}

/// Errors from [`crate::PoolRegistry`] lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("pool registry is retired; no pool exists for {0}")]
    Retired(String),

    #[error("descriptor source failed: {0}")]
    Source(#[from] ConfigError),
}

/// Errors from the [`crate::PoolManager`] lifecycle.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportInitError),

    #[error("failed to build worker group: {0}")]
    WorkerGroup(#[source] std::io::Error),

    #[error("pool manager already started")]
    AlreadyStarted,

    #[error("pool manager not started")]
    NotStarted,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
