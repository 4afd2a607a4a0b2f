//! Connection cache and channel management.
//!
//! Keeps one lazily-connecting tonic [`Channel`] per cluster endpoint so that
//! gossip calls and application RPCs reuse HTTP/2 connections across
//! discovery cycles.
//!
//! # Architecture
//!
//! The [`ConnectionCache`] maps [`EndPoint`] to [`ConnectionHandle`]:
//! - **Lazy connection**: handles are built by a [`ChannelFactory`] without network I/O, so
//!   construction can happen under the cache lock
//! - **Reconciliation**: after each successful discovery the key set is replaced by the
//!   discovered endpoints; dropped handles are disposed on a spawned task once the lock is
//!   released
//! - **Disposal**: [`ConnectionCache::dispose`] empties the cache permanently
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use evdb_client::{ChannelSettings, ConnectionCache, EndPoint, LazyChannelFactory};
//! # fn example() -> evdb_client::Result<()> {
//! let cache = ConnectionCache::new(Arc::new(LazyChannelFactory::new(ChannelSettings::default())));
//! let seeds = [EndPoint::new("node-1", 2113), EndPoint::new("node-2", 2113)];
//! cache.reconcile(&seeds)?;
//! let handle = cache.get_or_create(&seeds[0])?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use snafu::{ResultExt, ensure};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::{
    endpoint::EndPoint,
    error::{DisposedSnafu, Result, TransportSnafu},
    metrics::{ConnectionEvent, SdkMetrics, default_metrics},
};

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default HTTP/2 keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Default HTTP/2 keep-alive timeout.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const COMPONENT: &str = "connection cache";

/// One transport connection to a cluster endpoint.
///
/// Cheap to clone; all clones share the same HTTP/2 connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    endpoint: EndPoint,
    channel: Channel,
    tls: bool,
    created_at: Instant,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Wraps an already-configured channel.
    #[must_use]
    pub fn new(endpoint: EndPoint, channel: Channel, tls: bool) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                endpoint,
                channel,
                tls,
                created_at: Instant::now(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the endpoint this handle connects to.
    #[must_use]
    pub fn endpoint(&self) -> &EndPoint {
        &self.inner.endpoint
    }

    /// Returns a clone of the underlying channel.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.inner.channel.clone()
    }

    /// Returns whether the channel was built with TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.inner.tls
    }

    /// Returns when the handle was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Returns whether the handle has been evicted and disposed.
    ///
    /// A closed handle still works for callers that hold it; the cache just
    /// no longer hands it out.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Marks the handle as disposed.
    pub fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Returns true if both handles share the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.inner.endpoint)
            .field("tls", &self.inner.tls)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builds and disposes connection handles.
///
/// `create` runs under the cache lock and must not perform network I/O.
#[tonic::async_trait]
pub trait ChannelFactory: Send + Sync + fmt::Debug {
    /// Builds a handle for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be turned into a channel.
    fn create(&self, endpoint: &EndPoint) -> Result<ConnectionHandle>;

    /// Releases a handle evicted from the cache.
    async fn dispose(&self, handle: ConnectionHandle) {
        handle.mark_closed();
    }
}

/// Transport settings applied to every channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// HTTP/2 keep-alive ping interval.
    pub keep_alive_interval: Duration,
    /// HTTP/2 keep-alive ping timeout.
    pub keep_alive_timeout: Duration,
    /// TLS configuration; plaintext when `None`.
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            tls: None,
        }
    }
}

/// Default factory producing lazily-connecting tonic channels.
#[derive(Debug, Clone, Default)]
pub struct LazyChannelFactory {
    settings: ChannelSettings,
}

impl LazyChannelFactory {
    /// Creates a factory applying `settings` to every channel.
    #[must_use]
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }

    /// Applies configuration settings to an endpoint.
    fn configure_endpoint(&self, endpoint: Endpoint) -> Endpoint {
        endpoint
            .connect_timeout(self.settings.connect_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(TCP_KEEPALIVE_INTERVAL))
            .http2_keep_alive_interval(self.settings.keep_alive_interval)
            .keep_alive_timeout(self.settings.keep_alive_timeout)
            .keep_alive_while_idle(true)
    }
}

#[tonic::async_trait]
impl ChannelFactory for LazyChannelFactory {
    fn create(&self, endpoint: &EndPoint) -> Result<ConnectionHandle> {
        let tls = self.settings.tls.is_some();
        let mut target = Endpoint::from_shared(endpoint.uri(tls)).context(TransportSnafu)?;
        if let Some(tls_config) = self.settings.tls.clone() {
            target = target.tls_config(tls_config).context(TransportSnafu)?;
        }

        let channel = self.configure_endpoint(target).connect_lazy();
        Ok(ConnectionHandle::new(endpoint.clone(), channel, tls))
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<EndPoint, ConnectionHandle>,
    disposed: bool,
}

/// Keyed cache of reusable connections, shared by discovery and the
/// connection provider.
pub struct ConnectionCache {
    state: Mutex<CacheState>,
    factory: Arc<dyn ChannelFactory>,
    metrics: Arc<dyn SdkMetrics>,
}

impl ConnectionCache {
    /// Creates an empty cache backed by `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self::with_metrics(factory, default_metrics())
    }

    /// Creates an empty cache that reports connection events to `metrics`.
    #[must_use]
    pub fn with_metrics(factory: Arc<dyn ChannelFactory>, metrics: Arc<dyn SdkMetrics>) -> Self {
        Self { state: Mutex::new(CacheState::default()), factory, metrics }
    }

    /// Returns the cached handle for `endpoint`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Disposed` after [`dispose`](Self::dispose), or the
    /// factory's error if the handle cannot be built.
    pub fn get_or_create(&self, endpoint: &EndPoint) -> Result<ConnectionHandle> {
        let mut state = self.state.lock();
        ensure!(!state.disposed, DisposedSnafu { component: COMPONENT });

        if let Some(handle) = state.entries.get(endpoint) {
            return Ok(handle.clone());
        }

        let handle = self.factory.create(endpoint)?;
        state.entries.insert(endpoint.clone(), handle.clone());
        self.metrics.record_connection(&endpoint.to_string(), ConnectionEvent::Created);
        tracing::debug!(endpoint = %endpoint, "Created cached connection");
        Ok(handle)
    }

    /// Returns every cached entry in random order.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Disposed` after [`dispose`](Self::dispose).
    pub fn snapshot_random_order(&self) -> Result<Vec<(EndPoint, ConnectionHandle)>> {
        let mut snapshot: Vec<_> = {
            let state = self.state.lock();
            ensure!(!state.disposed, DisposedSnafu { component: COMPONENT });
            state.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        snapshot.shuffle(&mut rand::rng());
        Ok(snapshot)
    }

    /// Makes the cached key set exactly `wanted`.
    ///
    /// Missing endpoints are added through the factory; endpoints not in
    /// `wanted` are removed and disposed after the lock is released. Existing
    /// handles for wanted endpoints are kept as they are. Nothing changes if
    /// any new handle fails to build.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Disposed` after [`dispose`](Self::dispose), or the
    /// factory's error.
    pub fn reconcile(&self, wanted: &[EndPoint]) -> Result<()> {
        let wanted: HashSet<&EndPoint> = wanted.iter().collect();

        let removed = {
            let mut state = self.state.lock();
            ensure!(!state.disposed, DisposedSnafu { component: COMPONENT });

            let mut created = Vec::new();
            for endpoint in &wanted {
                if !state.entries.contains_key(*endpoint) {
                    created.push(((*endpoint).clone(), self.factory.create(endpoint)?));
                }
            }

            let stale: Vec<EndPoint> =
                state.entries.keys().filter(|k| !wanted.contains(k)).cloned().collect();
            let removed: Vec<ConnectionHandle> =
                stale.iter().filter_map(|k| state.entries.remove(k)).collect();

            for (endpoint, handle) in created {
                self.metrics.record_connection(&endpoint.to_string(), ConnectionEvent::Created);
                state.entries.insert(endpoint, handle);
            }
            removed
        };

        if !removed.is_empty() {
            tracing::debug!(
                evicted = removed.len(),
                remaining = wanted.len(),
                "Reconciled connection cache"
            );
        }
        self.dispose_detached(removed);
        Ok(())
    }

    /// Removes a single endpoint, disposing its handle.
    ///
    /// Returns whether the endpoint was cached.
    pub fn evict(&self, endpoint: &EndPoint) -> bool {
        let removed = self.state.lock().entries.remove(endpoint);
        let found = removed.is_some();
        self.dispose_detached(removed.into_iter().collect());
        found
    }

    /// Evicts and disposes every entry; all later operations fail with
    /// `SdkError::Disposed`. Calling it again does nothing.
    pub fn dispose(&self) {
        let removed: Vec<ConnectionHandle> = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.entries.drain().map(|(_, handle)| handle).collect()
        };
        tracing::debug!(evicted = removed.len(), "Disposed connection cache");
        self.dispose_detached(removed);
    }

    /// Returns the cached endpoints.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndPoint> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Returns whether `endpoint` is cached.
    #[must_use]
    pub fn contains(&self, endpoint: &EndPoint) -> bool {
        self.state.lock().entries.contains_key(endpoint)
    }

    /// Returns the number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the cache has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Hands evicted handles to the factory off the caller's path.
    fn dispose_detached(&self, handles: Vec<ConnectionHandle>) {
        if handles.is_empty() {
            return;
        }

        for handle in &handles {
            self.metrics.record_connection(&handle.endpoint().to_string(), ConnectionEvent::Evicted);
        }

        let factory = Arc::clone(&self.factory);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for handle in handles {
                        factory.dispose(handle).await;
                    }
                });
            },
            // Outside a runtime the channels can only be dropped.
            Err(_) => handles.iter().for_each(ConnectionHandle::mark_closed),
        }
    }
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionCache")
            .field("endpoints", &state.entries.keys().collect::<Vec<_>>())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::SdkError;

    /// Factory that counts constructions and disposals.
    #[derive(Debug, Default)]
    pub(crate) struct CountingFactory {
        inner: LazyChannelFactory,
        pub(crate) created: AtomicUsize,
        pub(crate) disposed: AtomicUsize,
    }

    #[tonic::async_trait]
    impl ChannelFactory for CountingFactory {
        fn create(&self, endpoint: &EndPoint) -> Result<ConnectionHandle> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.inner.create(endpoint)
        }

        async fn dispose(&self, handle: ConnectionHandle) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            handle.mark_closed();
        }
    }

    fn ep(port: u16) -> EndPoint {
        EndPoint::new("127.0.0.1", port)
    }

    fn sorted(mut endpoints: Vec<EndPoint>) -> Vec<EndPoint> {
        endpoints.sort_by_key(EndPoint::port);
        endpoints
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_handle() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ConnectionCache::new(factory.clone());

        let a = cache.get_or_create(&ep(1)).unwrap();
        let b = cache.get_or_create(&EndPoint::new("127.0.0.1", 1)).unwrap();

        assert!(a.same_connection(&b));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_sets_exact_key_set() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ConnectionCache::new(factory.clone());

        cache.reconcile(&[ep(1), ep(2), ep(3)]).unwrap();
        assert_eq!(sorted(cache.endpoints()), vec![ep(1), ep(2), ep(3)]);

        cache.reconcile(&[ep(2), ep(4)]).unwrap();
        assert_eq!(sorted(cache.endpoints()), vec![ep(2), ep(4)]);
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);

        assert!(
            evdb_test_utils::assert_eventually(Duration::from_secs(1), || {
                factory.disposed.load(Ordering::SeqCst) == 2
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ConnectionCache::new(factory.clone());
        let wanted = [ep(1), ep(2), ep(2)];

        cache.reconcile(&wanted).unwrap();
        let first = cache.get_or_create(&ep(1)).unwrap();
        cache.reconcile(&wanted).unwrap();
        let second = cache.get_or_create(&ep(1)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(first.same_connection(&second));
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_removed_handles_are_closed() {
        let cache = ConnectionCache::new(Arc::new(CountingFactory::default()));
        let handle = cache.get_or_create(&ep(1)).unwrap();

        cache.reconcile(&[ep(2)]).unwrap();

        assert!(!cache.contains(&ep(1)));
        assert!(
            evdb_test_utils::assert_eventually(Duration::from_secs(1), || handle.is_closed()).await
        );
    }

    #[tokio::test]
    async fn test_snapshot_contains_every_entry() {
        let cache = ConnectionCache::new(Arc::new(LazyChannelFactory::default()));
        cache.reconcile(&[ep(1), ep(2), ep(3), ep(4)]).unwrap();

        let snapshot = cache.snapshot_random_order().unwrap();
        let endpoints = snapshot.into_iter().map(|(e, _)| e).collect();
        assert_eq!(sorted(endpoints), vec![ep(1), ep(2), ep(3), ep(4)]);
    }

    #[tokio::test]
    async fn test_dispose_rejects_further_use() {
        let factory = Arc::new(CountingFactory::default());
        let cache = ConnectionCache::new(factory.clone());
        cache.reconcile(&[ep(1), ep(2)]).unwrap();

        cache.dispose();
        cache.dispose();

        assert!(cache.is_disposed());
        assert!(cache.is_empty());
        assert!(matches!(cache.get_or_create(&ep(1)), Err(SdkError::Disposed { .. })));
        assert!(matches!(cache.reconcile(&[ep(1)]), Err(SdkError::Disposed { .. })));
        assert!(matches!(cache.snapshot_random_order(), Err(SdkError::Disposed { .. })));
        assert!(
            evdb_test_utils::assert_eventually(Duration::from_secs(1), || {
                factory.disposed.load(Ordering::SeqCst) == 2
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_evict_single_endpoint() {
        let cache = ConnectionCache::new(Arc::new(LazyChannelFactory::default()));
        cache.reconcile(&[ep(1), ep(2)]).unwrap();

        assert!(cache.evict(&ep(1)));
        assert!(!cache.evict(&ep(1)));
        assert_eq!(cache.endpoints(), vec![ep(2)]);
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected_by_factory() {
        let cache = ConnectionCache::new(Arc::new(LazyChannelFactory::default()));
        let result = cache.get_or_create(&EndPoint::new("bad host", 1));
        assert!(matches!(result, Err(SdkError::Transport { .. })));
        assert!(cache.is_empty());
    }
}
