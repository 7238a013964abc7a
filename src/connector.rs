//! The session object: owns the worker pool, the scheduler and every connection.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::{
    cache::ConnectionCache,
    config::{ConnectorConfig, ConnectorSettings},
    connection::{Connection, ConnectionInner},
    data_type::{DataType, Value},
    error::{Error, Result},
    metadata::MetaData,
    providers::ChannelProvider,
    scheduler::{ScheduledTask, Scheduler},
};

/// Assemble a [`Connector`] from a provider, configuration and cache choice
pub struct ConnectorBuilder {
    provider: Arc<dyn ChannelProvider>,
    config: ConnectorConfig,
    settings: Option<ConnectorSettings>,
    cache: bool,
    name: String,
}

impl ConnectorBuilder {
    pub fn new<P: ChannelProvider>(provider: P) -> ConnectorBuilder {
        ConnectorBuilder::from_arc(Arc::new(provider))
    }

    /// Use a provider that is shared with something else
    pub fn from_arc(provider: Arc<dyn ChannelProvider>) -> ConnectorBuilder {
        ConnectorBuilder {
            provider,
            config: ConnectorConfig::default(),
            settings: None,
            cache: false,
            name: "epicars".to_owned(),
        }
    }

    /// Settings to resolve against the environment at build time
    pub fn config(mut self, config: ConnectorConfig) -> ConnectorBuilder {
        self.config = config;
        self
    }

    /// Settings used without consulting the environment. Inconsistent pool sizes
    /// are still corrected.
    pub fn settings(mut self, settings: ConnectorSettings) -> ConnectorBuilder {
        self.settings = Some(settings);
        self
    }

    /// Share one connection per name through a [`ConnectionCache`]
    pub fn cache(mut self, enabled: bool) -> ConnectorBuilder {
        self.cache = enabled;
        self
    }

    /// Prefix for the names of the threads this connector starts
    pub fn name(mut self, name: &str) -> ConnectorBuilder {
        self.name = name.to_owned();
        self
    }

    pub fn build(self) -> Connector {
        let settings = match self.settings {
            Some(settings) => settings.corrected(),
            None => self.config.resolve(),
        };
        debug!("Starting connector with {settings:?}");
        Connector {
            inner: Arc::new(ConnectorInner {
                name: self.name,
                settings,
                provider: self.provider,
                alive: AtomicBool::new(true),
                pool: Mutex::new(None),
                pool_handle: OnceLock::new(),
                scheduler: Mutex::new(None),
                cache: self.cache.then(ConnectionCache::new),
                default_metadata: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }
}

pub(crate) struct ConnectorInner {
    name: String,
    settings: ConnectorSettings,
    provider: Arc<dyn ChannelProvider>,
    alive: AtomicBool,
    pool: Mutex<Option<Runtime>>,
    pool_handle: OnceLock<Handle>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    cache: Option<ConnectionCache>,
    default_metadata: Mutex<HashMap<String, MetaData>>,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
}

impl ConnectorInner {
    pub(crate) fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.provider
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::LifecycleViolation("connector has been shut down".into()))
        }
    }

    fn executor(&self) -> Result<Handle> {
        self.check_alive()?;
        if self.settings.pool_disabled() {
            return Err(Error::LifecycleViolation(
                "worker pool is disabled (max threads 0)".into(),
            ));
        }
        if let Some(handle) = self.pool_handle.get() {
            return Ok(handle.clone());
        }
        let mut pool = self.pool.lock().unwrap();
        // Re-check under the lock; shutdown may have happened, or another
        // caller may have built the pool
        self.check_alive()?;
        if let Some(handle) = self.pool_handle.get() {
            return Ok(handle.clone());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.settings.core_threads)
            .max_blocking_threads(self.settings.max_threads)
            .thread_name(format!("{}-worker", self.name))
            .enable_all()
            .build()
            .map_err(|e| Error::LifecycleViolation(format!("could not start worker pool: {e}")))?;
        debug!(
            "Started worker pool with {} core, {} max threads",
            self.settings.core_threads, self.settings.max_threads
        );
        let handle = runtime.handle().clone();
        *pool = Some(runtime);
        let _ = self.pool_handle.set(handle.clone());
        Ok(handle)
    }

    fn scheduler(&self) -> Result<Arc<Scheduler>> {
        self.check_alive()?;
        let mut scheduler = self.scheduler.lock().unwrap();
        if let Some(scheduler) = scheduler.as_ref() {
            return Ok(scheduler.clone());
        }
        let pool = if self.settings.pool_disabled() {
            None
        } else {
            Some(self.executor()?)
        };
        let started = Arc::new(
            Scheduler::start(&self.name, pool)
                .map_err(|e| Error::LifecycleViolation(format!("could not start scheduler: {e}")))?,
        );
        *scheduler = Some(started.clone());
        Ok(started)
    }

    /// Where connection dispatch tasks run: the pool, or the scheduler runtime
    /// when the pool is disabled
    pub(crate) fn dispatch_handle(&self) -> Result<Handle> {
        if self.settings.pool_disabled() {
            Ok(self.scheduler()?.handle().clone())
        } else {
            self.executor()
        }
    }

    pub(crate) fn schedule<F>(
        &self,
        task: F,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Ok(self.scheduler()?.schedule(task, delay, period))
    }

    pub(crate) fn default_metadata(&self, name: &str) -> Option<MetaData> {
        self.default_metadata.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn register(&self, connection: &Arc<ConnectionInner>) {
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(connection));
    }

    fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down connector");
        let connections: Vec<_> = std::mem::take(&mut *self.connections.lock().unwrap())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for connection in &connections {
            Connection::from_inner(connection.clone()).destroy();
        }
        // Listeners must see CLOSED before the pool stops. A dispatch thread
        // cannot wait on its own queue.
        if Handle::try_current().is_err() {
            let deadline = Instant::now() + self.settings.shutdown_grace;
            for connection in &connections {
                connection.drain(deadline.saturating_duration_since(Instant::now()));
            }
        }
        if let Some(cache) = &self.cache {
            cache.cleanup();
        }
        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        let pool = self.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            // Blocking to drain is not allowed from inside a runtime
            if Handle::try_current().is_ok() {
                pool.shutdown_background();
            } else {
                pool.shutdown_timeout(self.settings.shutdown_grace);
            }
        }
    }
}

/// Creates and owns [`Connection`]s onto the channels of one provider
///
/// The worker pool and scheduler start on first use. Dropping the connector
/// shuts it down. Share it between threads by wrapping it in an [`Arc`].
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    /// A connector with default configuration, resolved against the environment
    pub fn new<P: ChannelProvider>(provider: P) -> Connector {
        ConnectorBuilder::new(provider).build()
    }

    pub fn builder<P: ChannelProvider>(provider: P) -> ConnectorBuilder {
        ConnectorBuilder::new(provider)
    }

    /// Open a connection, or return the cached one for `name`
    pub fn new_connection(&self, name: &str, data_type: DataType) -> Result<Connection> {
        self.inner.check_alive()?;
        if let Some(cache) = &self.inner.cache
            && let Some(connection) = cache.get(name)
        {
            if connection.data_type() != data_type {
                debug!(
                    "Returning cached {name} as {}, not {data_type}",
                    connection.data_type()
                );
            }
            return Ok(connection);
        }
        let connection = Connection::open(&self.inner, name, data_type)?;
        if let Some(cache) = &self.inner.cache {
            cache.add(name, &connection);
        }
        Ok(connection)
    }

    /// Read one value through a temporary connection
    ///
    /// Bypasses the cache, and always destroys the connection afterwards.
    pub fn get_value(&self, name: &str, data_type: DataType) -> Result<Value> {
        self.inner.check_alive()?;
        let connection = Connection::open(&self.inner, name, data_type)?;
        let result = if connection.wait_till_connected() {
            connection.get_value()
        } else {
            Err(Error::not_connected(
                name,
                format!("not connected after {:?}", self.inner.settings.timeout),
            ))
        };
        connection.destroy();
        result
    }

    /// Run `task` after `delay`, then every `period` if given
    pub fn schedule<F>(
        &self,
        task: F,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.schedule(task, delay, period)
    }

    /// Handle to the worker pool, started on first use
    pub fn executor(&self) -> Result<Handle> {
        self.inner.executor()
    }

    /// Metadata to use for `name` when fetching it fails
    pub fn put_default_metadata(&self, name: &str, meta: MetaData) {
        self.inner
            .default_metadata
            .lock()
            .unwrap()
            .insert(name.to_owned(), meta);
    }

    pub fn default_metadata(&self, name: &str) -> Option<MetaData> {
        self.inner.default_metadata(name)
    }

    pub fn config(&self) -> &ConnectorSettings {
        &self.inner.settings
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.settings.read_only
    }

    pub fn timeout(&self) -> Duration {
        self.inner.settings.timeout
    }

    pub fn cache(&self) -> Option<&ConnectionCache> {
        self.inner.cache.as_ref()
    }

    pub fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.inner.provider
    }

    /// Destroy every connection and stop the scheduler and worker pool
    ///
    /// Outside an async context this waits, up to the shutdown grace, for the
    /// CLOSED notifications to reach listeners. Calling this more than once has
    /// no further effect.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryProvider;

    fn settings(core: usize, max: usize) -> ConnectorSettings {
        ConnectorConfig {
            core_threads: Some(core),
            max_threads: Some(max),
            ..Default::default()
        }
        .resolve_with(|_| None)
    }

    #[test]
    fn disabled_pool_refuses_executor() {
        let connector = ConnectorBuilder::new(MemoryProvider::new())
            .settings(settings(5, 0))
            .build();
        assert_eq!(connector.config().core_threads, 0);
        assert!(matches!(
            connector.executor(),
            Err(Error::LifecycleViolation(_))
        ));
        // Scheduling still works, on the timer thread
        assert!(connector.schedule(|| (), Duration::ZERO, None).is_ok());
    }

    #[test]
    fn supplied_settings_are_corrected() {
        let provider = MemoryProvider::new();
        provider.add_pv("X", 1i32).unwrap();
        let connector = ConnectorBuilder::new(provider)
            .settings(ConnectorSettings {
                core_threads: 0,
                max_threads: 4,
                request_capacity: 0,
                ..ConnectorSettings::default()
            })
            .build();
        assert_eq!(connector.config().core_threads, 1);
        assert_eq!(connector.config().max_threads, 4);
        assert_eq!(connector.config().request_capacity, 1);
        let connection = connector.new_connection("X", DataType::Long).unwrap();
        assert!(connection.wait_till_connected());
    }

    #[test]
    fn executor_is_created_once() {
        let connector = ConnectorBuilder::new(MemoryProvider::new())
            .settings(settings(1, 2))
            .build();
        assert!(connector.inner.pool.lock().unwrap().is_none());
        connector.executor().unwrap();
        connector.executor().unwrap();
        assert!(connector.inner.pool.lock().unwrap().is_some());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let connector = ConnectorBuilder::new(MemoryProvider::new())
            .settings(settings(1, 2))
            .build();
        connector.executor().unwrap();
        connector.shutdown();
        connector.shutdown();
        assert!(!connector.is_alive());
        assert!(matches!(
            connector.new_connection("X", DataType::Double),
            Err(Error::LifecycleViolation(_))
        ));
        assert!(connector.schedule(|| (), Duration::ZERO, None).is_err());
    }
}
