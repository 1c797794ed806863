//! Startup warm-up: pre-establish every pool to capacity.
//!
//! Each pool gets `capacity` concurrent acquires, each bounded by the
//! connection timeout. Successful connections are held until every slot
//! attempt has finished and are then all released, so the pool ends with one
//! idle socket per successful slot. A failed slot is logged and recorded in
//! the report; it never fails the warm-up as a whole.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::AcquireErrorKind;
use crate::pool::{ConnectionPool, PoolState};

/// One slot that could not be filled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WarmupFailure {
    pub slot: usize,
    pub kind: AcquireErrorKind,
    pub message: String,
}

/// Warm-up outcome for one data source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DataSourceWarmup {
    pub datasource: String,
    pub capacity: usize,
    pub established: usize,
    pub failures: Vec<WarmupFailure>,
}

impl DataSourceWarmup {
    /// Every slot was filled.
    pub fn is_complete(&self) -> bool {
        self.established == self.capacity
    }

    pub fn failures_of(&self, kind: AcquireErrorKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}

/// Warm-up outcome for every data source, sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub datasources: Vec<DataSourceWarmup>,
}

impl WarmupReport {
    pub fn get(&self, datasource: &str) -> Option<&DataSourceWarmup> {
        self.datasources.iter().find(|d| d.datasource == datasource)
    }

    /// Data sources left with fewer idle connections than capacity.
    pub fn degraded(&self) -> impl Iterator<Item = &DataSourceWarmup> {
        self.datasources.iter().filter(|d| !d.is_complete())
    }

    pub fn total_established(&self) -> usize {
        self.datasources.iter().map(|d| d.established).sum()
    }
}

/// Warm every pool concurrently.
pub async fn warm_up(pools: Vec<ConnectionPool>, timeout: Duration) -> WarmupReport {
    let mut tasks = JoinSet::new();
    for pool in pools {
        tasks.spawn(warm_pool(pool, timeout));
    }

    let mut datasources = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => datasources.push(outcome),
            Err(e) => tracing::error!(error = %e, "warm-up task failed"),
        }
    }
    datasources.sort_by(|a, b| a.datasource.cmp(&b.datasource));
    WarmupReport { datasources }
}

/// Fill one pool to capacity, then release everything back into it.
pub async fn warm_pool(pool: ConnectionPool, timeout: Duration) -> DataSourceWarmup {
    pool.advance(PoolState::Warming);
    let capacity = pool.capacity();

    let mut slots = JoinSet::new();
    for slot in 0..capacity {
        let pool = pool.clone();
        slots.spawn(async move { (slot, pool.acquire(timeout).await) });
    }

    let mut acquired = Vec::with_capacity(capacity);
    let mut failures = Vec::new();
    while let Some(joined) = slots.join_next().await {
        match joined {
            Ok((_, Ok(conn))) => acquired.push(conn),
            Ok((slot, Err(e))) => {
                tracing::warn!(
                    datasource = %pool.name(),
                    slot,
                    error = %e,
                    "warm-up slot left unfilled"
                );
                failures.push(WarmupFailure {
                    slot,
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            Err(e) => tracing::error!(datasource = %pool.name(), error = %e, "warm-up slot task failed"),
        }
    }
    failures.sort_by_key(|f| f.slot);

    let established = acquired.len();
    for conn in acquired {
        pool.release(conn);
    }
    pool.advance(PoolState::Ready);

    if failures.is_empty() {
        tracing::info!(datasource = %pool.name(), established, "connection pool warmed");
    } else {
        tracing::warn!(
            datasource = %pool.name(),
            established,
            capacity,
            failed = failures.len(),
            "connection pool warmed partially"
        );
    }

    DataSourceWarmup {
        datasource: pool.name().to_string(),
        capacity,
        established,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shardgate_core::DataSourceDescriptor;
    use tokio::net::TcpListener;

    use crate::transport::{PortableTransport, TransportConfig};
    use crate::worker::WorkerGroup;

    /// Listener that accepts and holds connections open.
    async fn start_sink_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    fn pool(worker: &WorkerGroup, name: &str, port: u16, capacity: usize) -> ConnectionPool {
        let transport = Arc::new(PortableTransport::new(
            TransportConfig::portable(1).with_connect_timeout(Duration::from_secs(1)),
        ));
        ConnectionPool::new(
            DataSourceDescriptor::new(name, "127.0.0.1", port, "demo", "root", ""),
            capacity,
            transport,
            worker.handle(),
        )
    }

    fn refused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn warm_pool_fills_to_capacity() {
        let port = start_sink_server().await;
        let worker = WorkerGroup::new(2).unwrap();
        let pool = pool(&worker, "ds_0", port, 4);

        let outcome = warm_pool(pool.clone(), Duration::from_secs(2)).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.established, 4);

        let stats = pool.stats();
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.total_created, 4);
        assert_eq!(stats.state, PoolState::Ready);
    }

    #[tokio::test]
    async fn refused_slots_are_recorded_not_fatal() {
        let worker = WorkerGroup::new(1).unwrap();
        let pool = pool(&worker, "ds_down", refused_port(), 2);

        let outcome = warm_pool(pool.clone(), Duration::from_secs(2)).await;
        assert_eq!(outcome.established, 0);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures_of(AcquireErrorKind::Connect), 2);
        assert_eq!(outcome.failures[0].slot, 0);
        assert_eq!(pool.state(), PoolState::Ready);
        assert_eq!(pool.idle_count(), 0);
    }

    /// Loopback port whose accept queue is full; connects to it never finish.
    fn black_holed_port() -> (u16, Vec<socket2::Socket>) {
        use socket2::{Domain, Protocol, Socket, Type};

        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&addr.into()).unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut held = vec![listener];
        for _ in 0..2 {
            let filler = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
            if filler
                .connect_timeout(&addr.into(), Duration::from_millis(200))
                .is_ok()
            {
                held.push(filler);
            }
        }
        (addr.port(), held)
    }

    #[tokio::test]
    async fn silent_node_fails_every_slot_with_timeout() {
        let (port, _held) = black_holed_port();
        let worker = WorkerGroup::new(2).unwrap();
        let pool = ConnectionPool::new(
            DataSourceDescriptor::new("ds2", "127.0.0.1", port, "demo", "root", ""),
            3,
            Arc::new(PortableTransport::new(TransportConfig::portable(2))),
            worker.handle(),
        );

        let outcome = warm_pool(pool.clone(), Duration::from_secs(5)).await;
        assert_eq!(outcome.established, 0);
        assert_eq!(outcome.failures_of(AcquireErrorKind::Timeout), 3);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.state(), PoolState::Ready);
    }

    #[tokio::test]
    async fn warm_up_reports_every_pool_sorted() {
        let port = start_sink_server().await;
        let worker = WorkerGroup::new(2).unwrap();
        let pools = vec![
            pool(&worker, "ds_b", refused_port(), 1),
            pool(&worker, "ds_a", port, 2),
        ];

        let report = warm_up(pools, Duration::from_secs(2)).await;
        let names: Vec<_> = report.datasources.iter().map(|d| d.datasource.as_str()).collect();
        assert_eq!(names, vec!["ds_a", "ds_b"]);
        assert_eq!(report.total_established(), 2);
        assert_eq!(report.degraded().count(), 1);
        assert!(report.get("ds_a").unwrap().is_complete());
    }

    #[test]
    fn report_serializes_failure_kind() {
        let report = WarmupReport {
            datasources: vec![DataSourceWarmup {
                datasource: "ds_2".to_string(),
                capacity: 1,
                established: 0,
                failures: vec![WarmupFailure {
                    slot: 0,
                    kind: AcquireErrorKind::Timeout,
                    message: "timed out".to_string(),
                }],
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"kind\":\"timeout\""));
    }
}
