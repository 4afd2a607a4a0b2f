//! Gossip-based cluster discovery.
//!
//! The [`GossipResolver`] asks known nodes for the cluster member table, one
//! endpoint at a time, until one answers with a non-empty list:
//!
//! ```text
//! snapshot cache (random order)
//!       │
//!       ▼
//! Gossip/Read per endpoint ── timeout / error / empty ──▶ next endpoint
//!       │ members
//!       ▼
//! reconcile cache to members ──▶ publish Resolution
//! ```
//!
//! When every endpoint of an attempt fails the cache is reseeded and the
//! attempt is retried after a backoff delay, up to `max_discover_attempts`.
//! Concurrent callers share one in-flight resolution.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use snafu::ensure;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{debug, info, warn};

use super::{ClusterNode, TopologyClient};
use crate::{
    backoff::{Backoff, BackoffConfig, sleep_cancellable},
    connection::{ConnectionCache, ConnectionHandle},
    endpoint::EndPoint,
    error::{
        CancelledSnafu, ConfigSnafu, ConnectionSnafu, DisposedSnafu, Result, SdkError,
        UnavailableSnafu,
    },
    metrics::{SdkMetrics, default_metrics},
};

/// Default deadline for a single gossip call.
pub const DEFAULT_GOSSIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of discovery attempts before giving up.
pub const DEFAULT_MAX_DISCOVER_ATTEMPTS: u32 = 10;

const COMPONENT: &str = "gossip resolver";

/// Tuning for a [`GossipResolver`].
#[derive(Debug, Clone, bon::Builder)]
#[builder(derive(Debug))]
pub struct ResolverSettings {
    /// Deadline for each gossip call.
    #[builder(default = DEFAULT_GOSSIP_TIMEOUT)]
    pub gossip_timeout: Duration,

    /// Attempts per resolution; each attempt tries every cached endpoint once.
    #[builder(default = DEFAULT_MAX_DISCOVER_ATTEMPTS)]
    pub max_discover_attempts: u32,

    /// Delay between failed attempts.
    #[builder(default)]
    pub backoff: BackoffConfig,

    /// Period of the background refresh; `None` disables it.
    pub discovery_interval: Option<Duration>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Members reported by `source`, unfiltered.
    pub members: Vec<ClusterNode>,
    /// Endpoint that answered.
    pub source: EndPoint,
    /// Attempts used, counting the successful one.
    pub attempts: u32,
    /// Time from the start of the resolution to the answer.
    pub elapsed: Duration,
}

/// Classified result of one gossip call.
#[derive(Debug, Clone)]
pub enum GossipOutcome {
    /// The node answered with at least one member.
    Success(Vec<ClusterNode>),
    /// The node did not answer within the gossip timeout.
    Timeout,
    /// The node answered with an empty member table.
    NoViableEndpoints,
    /// The call failed for any other reason.
    Failed(SdkError),
}

impl GossipOutcome {
    /// Short label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout => "timeout",
            Self::NoViableEndpoints => "no_viable_endpoints",
            Self::Failed(_) => "failed",
        }
    }
}

enum AttemptResult {
    Found { source: EndPoint, members: Vec<ClusterNode> },
    Exhausted(String),
}

type SharedResolution = Shared<BoxFuture<'static, Result<Resolution>>>;

struct InFlight {
    id: u64,
    resolution: SharedResolution,
    token: CancellationToken,
    waiters: usize,
}

/// Leaves the in-flight resolution when dropped; the last waiter to leave
/// before it completes cancels it.
struct Waiter {
    resolver: Arc<GossipResolver>,
    id: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.resolver.leave(self.id);
    }
}

#[derive(Default)]
struct ResolverState {
    next_id: u64,
    in_flight: Option<InFlight>,
    last_result: Option<Result<Resolution>>,
    refresh_task: Option<JoinHandle<()>>,
}

/// Multi-endpoint topology discovery with timeout, retry and reseeding.
///
/// Shares its [`ConnectionCache`] with the connection provider: after a
/// successful resolution the cache holds exactly the discovered endpoints,
/// after a failed attempt exactly the seeds.
pub struct GossipResolver {
    seeds: Vec<EndPoint>,
    cache: Arc<ConnectionCache>,
    topology: Arc<dyn TopologyClient>,
    settings: ResolverSettings,
    state: Mutex<ResolverState>,
    lifetime: CancellationToken,
    metrics: Arc<dyn SdkMetrics>,
}

impl GossipResolver {
    /// Creates a resolver and seeds `cache` with `seeds`.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` for an empty seed list or invalid settings,
    /// and `SdkError::Disposed` if the cache was already disposed.
    pub fn new(
        seeds: Vec<EndPoint>,
        cache: Arc<ConnectionCache>,
        topology: Arc<dyn TopologyClient>,
        settings: ResolverSettings,
    ) -> Result<Arc<Self>> {
        Self::with_metrics(seeds, cache, topology, settings, default_metrics())
    }

    /// Same as [`new`](Self::new), reporting to `metrics`.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_metrics(
        seeds: Vec<EndPoint>,
        cache: Arc<ConnectionCache>,
        topology: Arc<dyn TopologyClient>,
        settings: ResolverSettings,
        metrics: Arc<dyn SdkMetrics>,
    ) -> Result<Arc<Self>> {
        ensure!(!seeds.is_empty(), ConfigSnafu { message: "at least one gossip seed is required" });
        ensure!(
            settings.max_discover_attempts > 0,
            ConfigSnafu { message: "max_discover_attempts must be at least 1" }
        );
        ensure!(
            !settings.gossip_timeout.is_zero(),
            ConfigSnafu { message: "gossip_timeout cannot be zero" }
        );
        if let Some(interval) = settings.discovery_interval {
            ensure!(!interval.is_zero(), ConfigSnafu { message: "discovery_interval cannot be zero" });
        }
        settings.backoff.validate()?;

        cache.reconcile(&seeds)?;

        Ok(Arc::new(Self {
            seeds,
            cache,
            topology,
            settings,
            state: Mutex::new(ResolverState::default()),
            lifetime: CancellationToken::new(),
            metrics,
        }))
    }

    /// Resolves the current member table.
    ///
    /// Joins the in-flight resolution if there is one. Cancelling `token`
    /// ends this caller's wait; once every waiter has gone the resolution
    /// itself is cancelled and publishes no result.
    ///
    /// # Errors
    ///
    /// - `SdkError::Cancelled` if `token` fires first (never `Unavailable`)
    /// - `SdkError::Unavailable` once every attempt failed
    /// - `SdkError::Disposed` after [`shutdown`](Self::shutdown)
    pub async fn refresh(self: &Arc<Self>, token: &CancellationToken) -> Result<Resolution> {
        ensure!(!token.is_cancelled(), CancelledSnafu);
        let (resolution, _waiter) = self.join_or_start()?;

        tokio::select! {
            biased;
            () = token.cancelled() => CancelledSnafu.fail(),
            result = resolution => result,
        }
    }

    fn join_or_start(self: &Arc<Self>) -> Result<(SharedResolution, Waiter)> {
        ensure!(!self.lifetime.is_cancelled(), DisposedSnafu { component: COMPONENT });

        let mut state = self.state.lock();
        if let Some(in_flight) = state.in_flight.as_mut() {
            debug!(waiters = in_flight.waiters + 1, "Joining in-flight gossip resolution");
            in_flight.waiters += 1;
            let waiter = Waiter { resolver: Arc::clone(self), id: in_flight.id };
            return Ok((in_flight.resolution.clone(), waiter));
        }

        let id = state.next_id;
        state.next_id += 1;

        let token = self.lifetime.child_token();
        let resolver = Arc::clone(self);
        let run_token = token.clone();
        let task = tokio::spawn(async move { resolver.resolve(id, run_token).await });
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => ConnectionSnafu { message: format!("gossip resolution task failed: {e}") }.fail(),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight { id, resolution: shared.clone(), token, waiters: 1 });
        Ok((shared, Waiter { resolver: Arc::clone(self), id }))
    }

    fn leave(&self, id: u64) {
        let mut state = self.state.lock();
        let abandoned = match state.in_flight.as_mut() {
            Some(in_flight) if in_flight.id == id => {
                in_flight.waiters = in_flight.waiters.saturating_sub(1);
                in_flight.waiters == 0
            },
            _ => false,
        };
        if !abandoned {
            return;
        }
        if let Some(in_flight) = state.in_flight.take() {
            debug!(id = in_flight.id, "Every waiter left, cancelling gossip resolution");
            in_flight.token.cancel();
        }
    }

    async fn resolve(self: Arc<Self>, id: u64, token: CancellationToken) -> Result<Resolution> {
        let started = Instant::now();
        let (result, attempts) = self.run_attempts(started, &token).await;

        {
            let mut state = self.state.lock();
            if state.in_flight.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                state.in_flight = None;
            }
            if !matches!(result, Err(SdkError::Cancelled)) {
                state.last_result = Some(result.clone());
            }
        }

        if !matches!(result, Err(SdkError::Cancelled)) {
            self.metrics.record_discovery(started.elapsed(), attempts, result.is_ok());
        }
        result
    }

    async fn run_attempts(&self, started: Instant, token: &CancellationToken) -> (Result<Resolution>, u32) {
        let mut backoff = Backoff::new(self.settings.backoff);
        let max_attempts = self.settings.max_discover_attempts;
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(token).await {
                Ok(AttemptResult::Found { source, members }) => {
                    let resolution =
                        Resolution { members, source, attempts: attempt, elapsed: started.elapsed() };
                    info!(
                        source = %resolution.source,
                        members = resolution.members.len(),
                        attempts = attempt,
                        elapsed_ms = resolution.elapsed.as_millis() as u64,
                        "Discovered cluster topology"
                    );
                    return (Ok(resolution), attempt);
                },
                Ok(AttemptResult::Exhausted(summary)) => last_failure = summary,
                Err(e) => return (Err(e), attempt),
            }

            if attempt < max_attempts {
                let delay = backoff.next_backoff();
                debug!(
                    attempt = attempt,
                    backoff_ms = delay.as_millis() as u64,
                    last_failure = %last_failure,
                    "Discovery attempt failed, retrying after backoff"
                );
                if let Err(e) = sleep_cancellable(delay, token).await {
                    return (Err(e), attempt);
                }
            }
        }

        warn!(attempts = max_attempts, last_failure = %last_failure, "Cluster discovery exhausted");
        let err = UnavailableSnafu {
            message: format!("discovery exhausted after {max_attempts} attempts: {last_failure}"),
        }
        .build();
        (Err(err), max_attempts)
    }

    async fn attempt(&self, token: &CancellationToken) -> Result<AttemptResult> {
        let snapshot = self.cache.snapshot_random_order()?;
        let mut failures = Vec::with_capacity(snapshot.len());

        for (endpoint, handle) in snapshot {
            let outcome = self.query(&handle, token).await?;
            self.metrics.record_gossip_call(&endpoint.to_string(), outcome.label());

            match outcome {
                GossipOutcome::Success(members) => {
                    let mut discovered: Vec<EndPoint> = Vec::with_capacity(members.len());
                    for member in &members {
                        if !discovered.contains(&member.endpoint) {
                            discovered.push(member.endpoint.clone());
                        }
                    }
                    self.cache.reconcile(&discovered)?;
                    return Ok(AttemptResult::Found { source: endpoint, members });
                },
                GossipOutcome::NoViableEndpoints => {
                    debug!(endpoint = %endpoint, "Gossip returned an empty member table");
                    failures.push(format!("{endpoint}: empty member table"));
                },
                GossipOutcome::Timeout => {
                    debug!(
                        endpoint = %endpoint,
                        timeout_ms = self.settings.gossip_timeout.as_millis() as u64,
                        "Gossip call timed out"
                    );
                    failures.push(format!("{endpoint}: timed out"));
                },
                GossipOutcome::Failed(err) => {
                    debug!(endpoint = %endpoint, error = %err, "Gossip call failed");
                    failures.push(format!("{endpoint}: {err}"));
                },
            }
        }

        self.cache.reconcile(&self.seeds)?;
        let summary = if failures.is_empty() {
            "no endpoints to query".to_owned()
        } else {
            failures.join("; ")
        };
        Ok(AttemptResult::Exhausted(summary))
    }

    /// Issues one gossip call and classifies it.
    ///
    /// # Errors
    ///
    /// Only cancellation is an error; every call failure becomes an outcome.
    pub(crate) async fn query(
        &self,
        handle: &ConnectionHandle,
        token: &CancellationToken,
    ) -> Result<GossipOutcome> {
        let timeout = self.settings.gossip_timeout;
        let call = tokio::time::timeout(timeout, self.topology.get_topology(handle, timeout));

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => return CancelledSnafu.fail(),
            result = call => match result {
                Err(_elapsed) => GossipOutcome::Timeout,
                Ok(Ok(members)) if members.is_empty() => GossipOutcome::NoViableEndpoints,
                Ok(Ok(members)) => GossipOutcome::Success(members),
                Ok(Err(SdkError::Timeout { .. } | SdkError::Rpc { code: Code::DeadlineExceeded, .. })) => {
                    GossipOutcome::Timeout
                },
                Ok(Err(err)) => GossipOutcome::Failed(err),
            },
        };
        Ok(outcome)
    }

    /// Starts the background refresh if a discovery interval is configured.
    ///
    /// Returns whether a new task was started. Failures are logged and never
    /// stop the task; [`shutdown`](Self::shutdown) does.
    pub fn start_periodic_refresh(self: &Arc<Self>) -> bool {
        let Some(period) = self.settings.discovery_interval else {
            debug!("Discovery interval is infinite, not starting periodic refresh");
            return false;
        };
        if self.lifetime.is_cancelled() {
            return false;
        }

        let mut state = self.state.lock();
        if state.refresh_task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Periodic discovery already running");
            return false;
        }

        let resolver: Weak<Self> = Arc::downgrade(self);
        let token = self.lifetime.clone();
        state.refresh_task = Some(tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Starting periodic discovery");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Periodic discovery shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        let Some(resolver) = resolver.upgrade() else { return };
                        if let Err(e) = resolver.refresh(&token).await {
                            warn!(error = %e, "Periodic discovery failed");
                        }
                    }
                }
            }
        }));
        true
    }

    /// Stops the background refresh and cancels any in-flight resolution.
    ///
    /// Later calls to [`refresh`](Self::refresh) fail with `SdkError::Disposed`.
    pub fn shutdown(&self) {
        self.lifetime.cancel();
        if let Some(task) = self.state.lock().refresh_task.take() {
            task.abort();
        }
    }

    /// Returns the result of the most recent completed resolution.
    ///
    /// Cancelled resolutions are never recorded.
    #[must_use]
    pub fn last_result(&self) -> Option<Result<Resolution>> {
        self.state.lock().last_result.clone()
    }

    /// Returns whether a resolution is in flight.
    #[must_use]
    pub fn is_resolving(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Returns the seed endpoints.
    #[must_use]
    pub fn seeds(&self) -> &[EndPoint] {
        &self.seeds
    }

    /// Returns the shared connection cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Returns the resolver settings.
    #[must_use]
    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }
}

impl Drop for GossipResolver {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl fmt::Debug for GossipResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipResolver")
            .field("seeds", &self.seeds)
            .field("settings", &self.settings)
            .field("resolving", &self.is_resolving())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        connection::{LazyChannelFactory, tests::CountingFactory},
        server::NodeState,
    };

    /// Scripted reply of a fake gossip endpoint.
    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Members(Vec<ClusterNode>),
        Fail,
        TimedOut,
        Delay(Duration, Vec<ClusterNode>),
    }

    /// Topology client answering from a per-endpoint script.
    #[derive(Debug, Default)]
    pub(crate) struct FakeTopology {
        replies: parking_lot::Mutex<HashMap<EndPoint, Reply>>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeTopology {
        pub(crate) fn set(&self, endpoint: EndPoint, reply: Reply) {
            self.replies.lock().insert(endpoint, reply);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tonic::async_trait]
    impl TopologyClient for FakeTopology {
        async fn get_topology(
            &self,
            handle: &ConnectionHandle,
            _deadline: Duration,
        ) -> Result<Vec<ClusterNode>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().get(handle.endpoint()).cloned();
            match reply {
                Some(Reply::Members(members)) => Ok(members),
                Some(Reply::Delay(delay, members)) => {
                    tokio::time::sleep(delay).await;
                    Ok(members)
                },
                Some(Reply::TimedOut) => Err(SdkError::Timeout { duration_ms: 200 }),
                Some(Reply::Fail) | None => Err(SdkError::Rpc {
                    code: Code::Unavailable,
                    message: format!("{} is down", handle.endpoint()),
                }),
            }
        }
    }

    pub(crate) fn ep(port: u16) -> EndPoint {
        EndPoint::new("127.0.0.1", port)
    }

    pub(crate) fn member(port: u16, state: NodeState) -> ClusterNode {
        ClusterNode::new(format!("node-{port}"), ep(port), state, true)
    }

    pub(crate) fn fast_settings() -> ResolverSettings {
        ResolverSettings::builder()
            .gossip_timeout(Duration::from_millis(200))
            .max_discover_attempts(2)
            .backoff(BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(10)))
            .build()
    }

    fn resolver(
        seeds: Vec<EndPoint>,
        topology: Arc<FakeTopology>,
        settings: ResolverSettings,
    ) -> Arc<GossipResolver> {
        let cache = Arc::new(ConnectionCache::new(Arc::new(LazyChannelFactory::default())));
        GossipResolver::new(seeds, cache, topology, settings).unwrap()
    }

    fn sorted(mut endpoints: Vec<EndPoint>) -> Vec<EndPoint> {
        endpoints.sort_by_key(EndPoint::port);
        endpoints
    }

    #[tokio::test]
    async fn test_seeds_reporting_same_topology_populate_cache() {
        let topology = Arc::new(FakeTopology::default());
        let members = vec![member(20, NodeState::Leader), member(21, NodeState::Follower)];
        topology.set(ep(10), Reply::Members(members.clone()));
        topology.set(ep(11), Reply::Members(members));

        let resolver = resolver(vec![ep(10), ep(11)], topology, fast_settings());
        let resolution = resolver.refresh(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolution.members.len(), 2);
        assert_eq!(resolution.attempts, 1);
        assert_eq!(sorted(resolver.cache().endpoints()), vec![ep(20), ep(21)]);
        assert!(resolver.last_result().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_all_seeds_failing_yields_unavailable_and_reseeds() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Fail);
        topology.set(ep(11), Reply::Fail);

        let resolver = resolver(vec![ep(10), ep(11)], topology.clone(), fast_settings());
        let err = resolver.refresh(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, SdkError::Unavailable { .. }), "got {err:?}");
        assert!(err.to_string().contains("2 attempts"));
        assert_eq!(sorted(resolver.cache().endpoints()), vec![ep(10), ep(11)]);
        // Two attempts over two seeds.
        assert_eq!(topology.calls(), 4);
        assert!(matches!(resolver.last_result(), Some(Err(SdkError::Unavailable { .. }))));
    }

    #[tokio::test]
    async fn test_cache_is_reseeded_after_discovered_nodes_vanish() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Members(vec![member(20, NodeState::Leader)]));

        let resolver = resolver(vec![ep(10)], topology.clone(), fast_settings());
        resolver.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolver.cache().endpoints(), vec![ep(20)]);

        // Node 20 was never scripted, so it fails; the attempt reseeds and the
        // second attempt reaches the seed again.
        resolver.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolver.cache().endpoints(), vec![ep(20)]);
        assert_eq!(topology.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_seed_is_skipped_after_gossip_timeout() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Delay(Duration::from_secs(30), vec![member(30, NodeState::Leader)]));
        topology.set(ep(11), Reply::Members(vec![member(20, NodeState::Leader)]));

        let settings = ResolverSettings::builder()
            .gossip_timeout(Duration::from_millis(100))
            .max_discover_attempts(1)
            .build();
        let resolver = resolver(vec![ep(10), ep(11)], topology, settings);

        let started = Instant::now();
        let resolution = resolver.refresh(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolution.source, ep(11));
        assert!(started.elapsed() < Duration::from_millis(100) + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_empty_topology_counts_as_no_viable_endpoints() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Members(Vec::new()));

        let resolver = resolver(vec![ep(10)], topology, fast_settings());
        let handle = resolver.cache().get_or_create(&ep(10)).unwrap();
        let outcome = resolver.query(&handle, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, GossipOutcome::NoViableEndpoints));

        let err = resolver.refresh(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("empty member table"));
    }

    #[tokio::test]
    async fn test_topology_timeout_is_classified_as_timeout() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::TimedOut);
        topology.set(ep(11), Reply::Members(vec![member(20, NodeState::Leader)]));

        let resolver = resolver(vec![ep(10), ep(11)], topology, fast_settings());
        let handle = resolver.cache().get_or_create(&ep(10)).unwrap();
        let outcome = resolver.query(&handle, &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, GossipOutcome::Timeout));

        let resolution = resolver.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(resolution.source, ep(11));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_reported_as_unavailable() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Delay(Duration::from_secs(30), vec![member(20, NodeState::Leader)]));

        let settings = ResolverSettings::builder().gossip_timeout(Duration::from_secs(60)).build();
        let resolver = resolver(vec![ep(10)], topology, settings);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = resolver.refresh(&token).await.unwrap_err();
        assert!(matches!(err, SdkError::Cancelled));
        assert!(resolver.last_result().is_none());
    }

    #[tokio::test]
    async fn test_cancelling_only_waiter_stops_discovery() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Fail);
        topology.set(ep(11), Reply::Fail);

        let settings = ResolverSettings::builder()
            .gossip_timeout(Duration::from_millis(200))
            .max_discover_attempts(10)
            .backoff(BackoffConfig::new(Duration::from_millis(20), Duration::from_millis(50)))
            .build();
        let resolver = resolver(vec![ep(10), ep(11)], topology.clone(), settings);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = resolver.refresh(&token).await.unwrap_err();
        assert!(matches!(err, SdkError::Cancelled));
        let calls_at_cancel = topology.calls();
        assert!(!resolver.is_resolving());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(topology.calls(), calls_at_cancel);
        assert!(resolver.last_result().is_none());
    }

    #[tokio::test]
    async fn test_resolution_continues_while_a_waiter_remains() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Delay(Duration::from_millis(150), vec![member(20, NodeState::Leader)]));

        let resolver = resolver(vec![ep(10)], topology.clone(), fast_settings());
        let impatient = CancellationToken::new();
        let canceller = impatient.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let patient = CancellationToken::new();
        let (first, second) = tokio::join!(resolver.refresh(&impatient), resolver.refresh(&patient));

        assert!(matches!(first, Err(SdkError::Cancelled)));
        assert_eq!(second.unwrap().source, ep(10));
        assert_eq!(topology.calls(), 1);
        assert!(resolver.last_result().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_already_cancelled_token_fails_fast() {
        let topology = Arc::new(FakeTopology::default());
        let resolver = resolver(vec![ep(10)], topology.clone(), fast_settings());

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(resolver.refresh(&token).await, Err(SdkError::Cancelled)));
        assert_eq!(topology.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_resolution() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Delay(Duration::from_millis(100), vec![member(10, NodeState::Leader)]));

        let resolver = resolver(vec![ep(10)], topology.clone(), fast_settings());
        let token = CancellationToken::new();

        let results = futures::future::join_all((0..10).map(|_| resolver.refresh(&token))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(topology.calls(), 1);
        assert!(!resolver.is_resolving());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_refresh() {
        let topology = Arc::new(FakeTopology::default());
        let resolver = resolver(vec![ep(10)], topology, fast_settings());
        resolver.shutdown();

        let err = resolver.refresh(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SdkError::Disposed { .. }));
    }

    #[tokio::test]
    async fn test_periodic_refresh_keeps_running_after_failures() {
        let topology = Arc::new(FakeTopology::default());
        topology.set(ep(10), Reply::Fail);

        let settings = ResolverSettings::builder()
            .gossip_timeout(Duration::from_millis(50))
            .max_discover_attempts(1)
            .discovery_interval(Duration::from_millis(20))
            .build();
        let resolver = resolver(vec![ep(10)], topology.clone(), settings);

        assert!(resolver.start_periodic_refresh());
        assert!(!resolver.start_periodic_refresh());

        assert!(
            evdb_test_utils::assert_eventually(Duration::from_secs(2), || topology.calls() >= 3).await
        );

        resolver.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_shutdown = topology.calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(topology.calls(), after_shutdown);
    }

    #[tokio::test]
    async fn test_periodic_refresh_disabled_without_interval() {
        let resolver = resolver(vec![ep(10)], Arc::new(FakeTopology::default()), fast_settings());
        assert!(!resolver.start_periodic_refresh());
    }

    #[tokio::test]
    async fn test_constructor_validation() {
        let cache = Arc::new(ConnectionCache::new(Arc::new(CountingFactory::default())));
        let topology = Arc::new(FakeTopology::default());

        let err = GossipResolver::new(Vec::new(), cache.clone(), topology.clone(), fast_settings())
            .unwrap_err();
        assert!(matches!(err, SdkError::Config { .. }));

        let settings = ResolverSettings { max_discover_attempts: 0, ..fast_settings() };
        assert!(GossipResolver::new(vec![ep(1)], cache.clone(), topology.clone(), settings).is_err());

        let resolver = GossipResolver::new(vec![ep(1), ep(2)], cache.clone(), topology, fast_settings())
            .unwrap();
        assert_eq!(resolver.seeds().len(), 2);
        assert_eq!(cache.len(), 2);
    }
}
