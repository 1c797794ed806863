//! Portable transport variant.

use std::io;

use shardgate_core::DataSourceDescriptor;

use super::{ConnectFuture, TransportBackend, TransportConfig, TransportKind};

/// Generic option set usable on any host: keep-alive, no-delay, fixed
/// backlog, bounded connect timeout.
#[derive(Debug)]
pub struct PortableTransport {
    config: TransportConfig,
}

impl PortableTransport {
    /// Build without checking the host. Used when the caller already knows sockets work.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Construct after checking a scratch socket accepts the option set.
    pub fn detect(config: TransportConfig) -> io::Result<Self> {
        super::check_socket_options(&config)?;
        Ok(Self { config })
    }
}

impl TransportBackend for PortableTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Portable
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn connect<'a>(&'a self, target: &'a DataSourceDescriptor) -> ConnectFuture<'a> {
        Box::pin(super::establish(&self.config, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use socket2::SockRef;
    use tokio::net::TcpListener;

    fn descriptor(port: u16) -> DataSourceDescriptor {
        DataSourceDescriptor::new("ds_0", "127.0.0.1", port, "demo", "root", "")
    }

    #[tokio::test]
    async fn connect_applies_nodelay_and_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = PortableTransport::detect(TransportConfig::portable(1)).unwrap();

        let stream = transport.connect(&descriptor(port)).await.unwrap();
        let sock = SockRef::from(&stream);
        assert!(sock.nodelay().unwrap());
        assert!(sock.keepalive().unwrap());
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        // Bind then drop to get a port with no listener.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = PortableTransport::new(
            TransportConfig::portable(1).with_connect_timeout(Duration::from_secs(1)),
        );

        let result = transport.connect(&descriptor(port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        let transport = PortableTransport::new(TransportConfig::portable(1));
        let target = DataSourceDescriptor::new("ds_0", "no-such-host.invalid", 3306, "d", "u", "");
        assert!(transport.connect(&target).await.is_err());
    }
}
