//! Pool manager: brings the backend connection layer up and down.
//!
//! The manager is explicit process-scoped state: build one, call
//! [`PoolManager::start`], hand `&PoolManager` (or an `Arc`) to the routing
//! layer, and call [`PoolManager::stop`] at shutdown. Tests build isolated
//! instances the same way.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──start()──▶ running ──stop()──▶ stopped ──start()──▶ running …
//!            │                                │
//!            └─ AlreadyStarted if running     └─ no-op if not running
//! ```
//!
//! After `stop()` the retired registry stays published: `get_pool` still
//! returns the (closed) pools it knew, so late callers get
//! [`crate::AcquireError::Closed`] rather than a lookup failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use shardgate_core::{BackendSettings, ConfigError, DataSourceDescriptor, DescriptorSource};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::{ManagerError, ManagerResult, RegistryError};
use crate::pool::{ConnectionPool, PoolState, PoolStats};
use crate::registry::PoolRegistry;
use crate::transport::{TransportBackend, TransportKind, select_backend};
use crate::warmup::{WarmupReport, warm_up};
use crate::worker::WorkerGroup;

/// Everything that exists only between `start()` and `stop()`.
struct Running {
    worker: WorkerGroup,
    registry: Arc<PoolRegistry>,
    transport: Arc<dyn TransportBackend>,
    report: WarmupReport,
}

pub struct PoolManager {
    source: Arc<dyn DescriptorSource>,
    settings: BackendSettings,
    /// Replaces transport selection when set.
    transport_override: Option<Arc<dyn TransportBackend>>,
    running: Mutex<Option<Running>>,
    /// Published registry; kept (retired) after stop.
    registry: RwLock<Option<Arc<PoolRegistry>>>,
}

impl PoolManager {
    pub fn new(source: Arc<dyn DescriptorSource>, settings: BackendSettings) -> Self {
        Self {
            source,
            settings,
            transport_override: None,
            running: Mutex::new(None),
            registry: RwLock::new(None),
        }
    }

    /// Use `transport` instead of selecting one from the host at start.
    pub fn with_transport(self, transport: Arc<dyn TransportBackend>) -> Self {
        Self {
            transport_override: Some(transport),
            ..self
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Pull descriptors, select the transport, build the pools and warm them.
    ///
    /// Returns once every pool has finished its warm-up pass. Slot failures
    /// are in the returned report; they do not fail `start()`.
    pub async fn start(&self) -> ManagerResult<WarmupReport> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!("start called on a running pool manager");
            return Err(ManagerError::AlreadyStarted);
        }

        let descriptors = self.load_descriptors()?;
        let transport = match &self.transport_override {
            Some(transport) => Arc::clone(transport),
            None => select_backend(&self.settings)?,
        };
        let worker =
            WorkerGroup::new(self.settings.worker_threads).map_err(ManagerError::WorkerGroup)?;

        tracing::info!(
            datasources = descriptors.len(),
            transport = %transport.kind(),
            worker_threads = worker.threads(),
            max_connections = self.settings.max_connections,
            connection_timeout = ?self.settings.connection_timeout,
            "starting backend connection pools"
        );

        let mut names: Vec<String> = descriptors.keys().cloned().collect();
        names.sort();

        let warmed = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(PoolRegistry::new(pool_factory(
            descriptors,
            Arc::clone(&self.source),
            &self.settings,
            Arc::clone(&transport),
            &worker,
            Arc::clone(&warmed),
        )));

        let mut pools = Vec::with_capacity(names.len());
        for name in &names {
            pools.push(registry.get(name)?);
        }
        let report = warm_up(pools, self.settings.connection_timeout).await;
        warmed.store(true, Ordering::Release);

        tracing::info!(
            datasources = report.datasources.len(),
            established = report.total_established(),
            degraded = report.degraded().count(),
            "backend connection pools ready"
        );

        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&registry));
        *running = Some(Running {
            worker,
            registry,
            transport,
            report: report.clone(),
        });
        Ok(report)
    }

    fn load_descriptors(&self) -> Result<HashMap<String, DataSourceDescriptor>, ConfigError> {
        let descriptors = self.source.descriptors()?;
        if descriptors.is_empty() && !self.settings.allow_empty {
            return Err(ConfigError::NoDataSources);
        }
        let mut map = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if map.insert(name.clone(), descriptor).is_some() {
                return Err(ConfigError::DuplicateDataSource(name));
            }
        }
        Ok(map)
    }

    /// Drain every pool, close what is left, and shut the worker group down.
    ///
    /// A no-op when not running. Checked-out connections get
    /// `shutdown_grace` to come back before they are force-closed.
    pub async fn stop(&self) -> ManagerResult<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            tracing::debug!("stop called on a pool manager that is not running");
            return Ok(());
        };

        run.registry.retire();
        let grace = self.settings.shutdown_grace;
        let mut drains = JoinSet::new();
        for pool in run.registry.all() {
            drains.spawn(async move {
                let forced = pool.drain(grace).await;
                (pool.name().to_string(), forced)
            });
        }

        let mut forced_total = 0;
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((datasource, forced)) => {
                    if forced > 0 {
                        tracing::warn!(
                            datasource = %datasource,
                            forced,
                            "force-closed checked-out connections on stop"
                        );
                    }
                    forced_total += forced;
                }
                Err(e) => tracing::error!(error = %e, "pool drain task failed"),
            }
        }

        run.worker.shutdown();
        tracing::info!(
            pools = run.registry.len(),
            force_closed = forced_total,
            "backend connection pools stopped"
        );
        Ok(())
    }

    /// Pool for `name`, created cold if it has not been created yet.
    ///
    /// Pools created after `start()` finished are not warmed. Fails with
    /// [`ManagerError::NotStarted`] before the first start, and for names the
    /// last run never created once it has been stopped.
    pub fn get_pool(&self, name: &str) -> ManagerResult<ConnectionPool> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ManagerError::NotStarted)?;

        match registry.get(name) {
            Ok(pool) => Ok(pool),
            Err(RegistryError::Retired(_)) => Err(ManagerError::NotStarted),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Report from the current run's warm-up.
    pub async fn warmup_report(&self) -> Option<WarmupReport> {
        self.running.lock().await.as_ref().map(|r| r.report.clone())
    }

    /// Transport selected for the current run.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.running.lock().await.as_ref().map(|r| r.transport.kind())
    }

    /// Statistics for every pool in the published registry.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.stats())
            .unwrap_or_default()
    }

    /// Log pool statistics for all pools at `info` level.
    pub fn log_stats(&self) {
        for stats in self.stats() {
            tracing::info!(
                datasource = %stats.datasource,
                capacity = stats.capacity,
                idle = stats.idle,
                outstanding = stats.outstanding,
                total_created = stats.total_created,
                state = %stats.state,
                "pool statistics"
            );
        }
    }
}

/// Minimum time between descriptor source queries triggered by lookups.
const DESCRIPTOR_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Last descriptor list pulled from the source.
struct DescriptorCache {
    known: HashMap<String, DataSourceDescriptor>,
    refreshed_at: Instant,
}

/// Factory the registry calls on a missing key.
///
/// Names outside the cached descriptor list are looked up in the source
/// again, at most once per [`DESCRIPTOR_REFRESH_INTERVAL`], so a data source
/// added after start gets a pool on first use. Pools created once warm-up has
/// finished go straight to `Ready` with no idle connections.
fn pool_factory(
    descriptors: HashMap<String, DataSourceDescriptor>,
    source: Arc<dyn DescriptorSource>,
    settings: &BackendSettings,
    transport: Arc<dyn TransportBackend>,
    worker: &WorkerGroup,
    warmed: Arc<AtomicBool>,
) -> crate::registry::PoolFactory {
    let settings = settings.clone();
    let handle = worker.handle();
    let cache = std::sync::Mutex::new(DescriptorCache {
        known: descriptors,
        refreshed_at: Instant::now(),
    });
    Box::new(move |name: &str| {
        let descriptor = resolve_descriptor(&cache, source.as_ref(), name)?;
        let pool = ConnectionPool::new(
            descriptor,
            settings.capacity_for(name),
            Arc::clone(&transport),
            handle.clone(),
        );
        if warmed.load(Ordering::Acquire) {
            pool.advance(PoolState::Ready);
            tracing::info!(datasource = %name, "created cold pool after warm-up");
        }
        Ok(pool)
    })
}

fn resolve_descriptor(
    cache: &std::sync::Mutex<DescriptorCache>,
    source: &dyn DescriptorSource,
    name: &str,
) -> Result<DataSourceDescriptor, RegistryError> {
    {
        let cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(descriptor) = cache.known.get(name) {
            return Ok(descriptor.clone());
        }
        if cache.refreshed_at.elapsed() < DESCRIPTOR_REFRESH_INTERVAL {
            return Err(RegistryError::UnknownDataSource(name.to_string()));
        }
    }

    // Queried without the cache lock held.
    let fresh: HashMap<_, _> = source
        .descriptors()?
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect();
    tracing::debug!(datasource = %name, known = fresh.len(), "refreshed data-source descriptors");

    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache.known = fresh;
    cache.refreshed_at = Instant::now();
    cache
        .known
        .get(name)
        .cloned()
        .ok_or_else(|| RegistryError::UnknownDataSource(name.to_string()))
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
