//! Worker group: the dedicated runtime that drives backend socket I/O.
//!
//! Every connect issued by any pool is spawned onto this runtime, so backend
//! sockets are registered with its reactor and live exactly as long as the
//! group does. Shutting the group down is what finally releases them.

use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

pub struct WorkerGroup {
    runtime: Option<Runtime>,
    handle: Handle,
    threads: usize,
}

impl WorkerGroup {
    /// Build a multi-threaded runtime with `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("shardgate-backend")
            .enable_all()
            .build()?;
        tracing::debug!(threads, "worker group started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Handle for spawning onto the group.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the runtime without blocking the caller.
    ///
    /// Pools must already be drained; anything still running on the group is
    /// cancelled.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            tracing::debug!(threads = self.threads, "worker group shut down");
        }
    }
}

// Dropping a `Runtime` from async code panics; always shut down in the background.
impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("threads", &self.threads)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}
