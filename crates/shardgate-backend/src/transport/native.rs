//! Kernel-level transport variant (Linux).
//!
//! Applies `TCP_CORK` on top of keep-alive so the kernel coalesces the many
//! small writes a database wire protocol produces into full segments.

use std::io;

use shardgate_core::DataSourceDescriptor;

use super::{ConnectFuture, TransportBackend, TransportConfig, TransportKind};

#[derive(Debug)]
pub struct NativeTransport {
    config: TransportConfig,
}

impl NativeTransport {
    /// Construct the native variant if the host supports its option set.
    ///
    /// Fails with `Unsupported` off Linux, or with the `setsockopt` error when
    /// a scratch socket rejects the options.
    pub fn detect(config: TransportConfig) -> io::Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "native transport requires linux",
            ));
        }
        super::check_socket_options(&config)?;
        Ok(Self { config })
    }
}

impl TransportBackend for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn connect<'a>(&'a self, target: &'a DataSourceDescriptor) -> ConnectFuture<'a> {
        Box::pin(super::establish(&self.config, target))
    }
}
