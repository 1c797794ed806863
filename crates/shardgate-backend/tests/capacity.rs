//! Integration tests for pool capacity under concurrent load.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use shardgate_backend::{ConnectionPool, PortableTransport, TransportConfig, WorkerGroup};
use shardgate_core::DataSourceDescriptor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn start_echo_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (port, accepted)
}

fn pool(worker: &WorkerGroup, port: u16, capacity: usize) -> ConnectionPool {
    let transport = Arc::new(PortableTransport::new(
        TransportConfig::portable(2).with_connect_timeout(Duration::from_secs(1)),
    ));
    ConnectionPool::new(
        DataSourceDescriptor::new("ds_0", "127.0.0.1", port, "demo_ds_0", "root", ""),
        capacity,
        transport,
        worker.handle(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_never_exceeds_capacity() {
    let (port, accepted) = start_echo_server().await;
    let worker = WorkerGroup::new(2).unwrap();
    let pool = pool(&worker, port, 3);
    let peak_live = Arc::new(AtomicUsize::new(0));
    let peak_accepted = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    // Samples the pool and the node for the whole burst.
    let monitor = {
        let pool = pool.clone();
        let accepted = Arc::clone(&accepted);
        let (peak_live, peak_accepted) = (Arc::clone(&peak_live), Arc::clone(&peak_accepted));
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let stats = pool.stats();
                peak_live.fetch_max(stats.idle + stats.outstanding, Ordering::SeqCst);
                peak_accepted.fetch_max(accepted.load(Ordering::SeqCst), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut tasks = Vec::new();
    for i in 0..20u8 {
        let pool = pool.clone();
        let peak_live = Arc::clone(&peak_live);
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
            let stats = pool.stats();
            peak_live.fetch_max(stats.idle + stats.outstanding, Ordering::SeqCst);

            conn.write_all(&[i]).await.unwrap();
            let mut echoed = [0u8; 1];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed[0], i);

            tokio::time::sleep(Duration::from_millis(10)).await;
            conn.release();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    monitor.await.unwrap();

    assert!(peak_live.load(Ordering::SeqCst) <= 3);
    assert!(peak_accepted.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert!(stats.total_created <= 3);
    assert_eq!(stats.idle as u64, stats.total_created);
    assert!(accepted.load(Ordering::SeqCst) <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_cycles_reuse_sockets() {
    let (port, accepted) = start_echo_server().await;
    let worker = WorkerGroup::new(1).unwrap();
    let pool = pool(&worker, port, 2);

    for _ in 0..10 {
        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(a.id(), b.id());
        a.release();
        b.release();
    }

    assert_eq!(pool.stats().total_created, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}
