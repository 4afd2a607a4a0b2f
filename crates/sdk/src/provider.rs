//! Single-flight connection provider.
//!
//! Hands out the current [`ConnectionInfo`] to every RPC caller. Concurrent
//! callers share one factory run; a reset starts a new run for a newer
//! generation without disturbing callers that already hold older info.
//!
//! # State Machine
//!
//! ```text
//!            current()                 factory ok
//! ┌───────┐ ──────────▶ ┌─────────┐ ─────────────▶ ┌───────┐
//! │ Empty │             │ Pending │                │ Ready │
//! └───────┘             └─────────┘ ─────┐         └───────┘
//!     ▲                   ▲   ▲          │ factory err   │
//!     │ dispose()         │   │          ▼               │
//!     │          current()│   │     ┌────────┐           │
//!     │      after retry_at   └──── │ Failed │           │
//!     │                       │     └────────┘           │
//!     │                       └────────── reset() ───────┘
//! ```

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
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::{Backoff, BackoffConfig},
    capabilities::ServerCapabilities,
    connection::ConnectionHandle,
    detector::{CallInvoker, LeaderChangeDetector},
    endpoint::EndPoint,
    error::{ConnectionSnafu, DisposedSnafu, Result, SdkError},
    metrics::{SdkMetrics, default_metrics},
};

const COMPONENT: &str = "connection provider";

/// Ceiling for the fail-fast window when a backoff delay cannot be added to `now`.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Why the provider is (re)computing its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionTrigger {
    /// Run discovery and pick a node by preference.
    Rediscover,
    /// Connect straight to the named leader.
    NewLeader(EndPoint),
}

impl ReconnectionTrigger {
    /// Short label used for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rediscover => "rediscover",
            Self::NewLeader(_) => "new_leader",
        }
    }
}

impl fmt::Display for ReconnectionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rediscover => write!(f, "rediscover"),
            Self::NewLeader(leader) => write!(f, "new_leader({leader})"),
        }
    }
}

/// Output of a [`ConnectionFactory`] run.
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    /// Connection to the chosen node.
    pub handle: ConnectionHandle,
    /// Features the chosen node advertised.
    pub capabilities: ServerCapabilities,
}

/// Computes a connection for a trigger.
#[tonic::async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Resolves a connection for `trigger`.
    ///
    /// `token` is cancelled when the run is superseded or the provider is
    /// disposed.
    ///
    /// # Errors
    ///
    /// Returns an error if no node can be reached.
    async fn connect(
        &self,
        trigger: &ReconnectionTrigger,
        token: &CancellationToken,
    ) -> Result<ResolvedConnection>;
}

/// The connection RPC callers use.
///
/// Immutable; a reset produces a new value with a higher generation.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    handle: ConnectionHandle,
    capabilities: ServerCapabilities,
    invoker: CallInvoker,
    trigger: ReconnectionTrigger,
    generation: u64,
}

impl ConnectionInfo {
    /// Returns the underlying connection.
    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Returns the endpoint of the connected node.
    #[must_use]
    pub fn endpoint(&self) -> &EndPoint {
        self.handle.endpoint()
    }

    /// Returns the negotiated server capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Returns the invoker that routes call failures to the detector.
    #[must_use]
    pub fn invoker(&self) -> &CallInvoker {
        &self.invoker
    }

    /// Returns the trigger that produced this connection.
    #[must_use]
    pub fn trigger(&self) -> &ReconnectionTrigger {
        &self.trigger
    }

    /// Returns the provider generation that produced this connection.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// `None` means the run was superseded by a newer generation.
type SharedConnect = Shared<BoxFuture<'static, Option<Result<ConnectionInfo>>>>;

enum Slot {
    Empty,
    Pending(SharedConnect),
    Ready(ConnectionInfo),
    Failed { error: SdkError, retry_at: Instant },
}

struct ProviderState {
    generation: u64,
    trigger: ReconnectionTrigger,
    slot: Slot,
    run_token: Option<CancellationToken>,
    backoff: Backoff,
    disposed: bool,
}

/// Shares one connection computation between all callers.
pub struct ConnectionProvider {
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<ProviderState>,
    lifetime: CancellationToken,
    metrics: Arc<dyn SdkMetrics>,
    this: Weak<Self>,
}

impl ConnectionProvider {
    /// Creates a provider; nothing runs until the first [`current`](Self::current).
    ///
    /// `backoff` paces factory re-runs after failures.
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>, backoff: BackoffConfig) -> Arc<Self> {
        Self::with_metrics(factory, backoff, default_metrics())
    }

    /// Same as [`new`](Self::new), reporting to `metrics`.
    #[must_use]
    pub fn with_metrics(
        factory: Arc<dyn ConnectionFactory>,
        backoff: BackoffConfig,
        metrics: Arc<dyn SdkMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            factory,
            state: Mutex::new(ProviderState {
                generation: 0,
                trigger: ReconnectionTrigger::Rediscover,
                slot: Slot::Empty,
                run_token: None,
                backoff: Backoff::new(backoff),
                disposed: false,
            }),
            lifetime: CancellationToken::new(),
            metrics,
            this: this.clone(),
        })
    }

    /// Returns the current connection, computing it if needed.
    ///
    /// # Errors
    ///
    /// - the factory's error, for the callers of the failing run and for every
    ///   call until the retry delay has passed
    /// - `SdkError::Disposed` after [`dispose`](Self::dispose)
    pub async fn current(&self) -> Result<ConnectionInfo> {
        loop {
            let pending = {
                let mut state = self.state.lock();
                ensure!(!state.disposed, DisposedSnafu { component: COMPONENT });

                let joined = match &state.slot {
                    Slot::Ready(info) => return Ok(info.clone()),
                    Slot::Pending(pending) => Some(pending.clone()),
                    Slot::Failed { error, retry_at } if Instant::now() < *retry_at => {
                        return Err(error.clone());
                    },
                    Slot::Failed { .. } | Slot::Empty => None,
                };
                match joined {
                    Some(pending) => pending,
                    None => self.start_locked(&mut state),
                }
            };

            if let Some(result) = pending.await {
                return result;
            }
            // Superseded; wait for the newest generation instead.
        }
    }

    /// Replaces the connection for later callers.
    ///
    /// Never blocks. Callers holding an older [`ConnectionInfo`] keep it.
    pub fn reset(&self, trigger: ReconnectionTrigger) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        self.reset_locked(&mut state, trigger);
    }

    /// Resets only if `generation` is still current.
    ///
    /// Returns whether a reset happened.
    pub(crate) fn reset_from(&self, generation: u64, trigger: ReconnectionTrigger) -> bool {
        let mut state = self.state.lock();
        if state.disposed || state.generation != generation {
            debug!(
                generation = generation,
                current = state.generation,
                "Ignoring reconnection signal from a replaced connection"
            );
            return false;
        }
        self.reset_locked(&mut state, trigger);
        true
    }

    /// Resets and waits for the new connection.
    ///
    /// # Errors
    ///
    /// See [`current`](Self::current).
    pub async fn force(&self, trigger: ReconnectionTrigger) -> Result<ConnectionInfo> {
        self.reset(trigger);
        self.current().await
    }

    /// Cancels any factory run; every later call fails with `SdkError::Disposed`.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.slot = Slot::Empty;
            if let Some(token) = state.run_token.take() {
                token.cancel();
            }
        }
        self.lifetime.cancel();
        debug!("Disposed connection provider");
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Returns the trigger of the current generation.
    #[must_use]
    pub fn trigger(&self) -> ReconnectionTrigger {
        self.state.lock().trigger.clone()
    }

    /// Returns the connection if one is ready, without starting a run.
    #[must_use]
    pub fn peek(&self) -> Option<ConnectionInfo> {
        match &self.state.lock().slot {
            Slot::Ready(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Returns whether the provider has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn reset_locked(&self, state: &mut ProviderState, trigger: ReconnectionTrigger) {
        state.generation += 1;
        state.trigger = trigger;
        if let Some(token) = state.run_token.take() {
            token.cancel();
        }

        self.metrics.record_reconnect(state.trigger.label());
        info!(generation = state.generation, trigger = %state.trigger, "Connection reset");

        // Start eagerly so the next caller finds the run in progress.
        if tokio::runtime::Handle::try_current().is_ok() {
            let _ = self.start_locked(state);
        } else {
            state.slot = Slot::Empty;
        }
    }

    fn start_locked(&self, state: &mut ProviderState) -> SharedConnect {
        let generation = state.generation;
        let trigger = state.trigger.clone();
        let token = self.lifetime.child_token();
        state.run_token = Some(token.clone());

        debug!(generation = generation, trigger = %trigger, "Starting connection factory");

        let factory = Arc::clone(&self.factory);
        let provider = self.this.clone();
        let trigger_for_join = trigger.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let result = factory.connect(&trigger, &token).await;
            let provider = provider.upgrade()?;
            provider.metrics.record_connect(started.elapsed(), result.is_ok());
            provider.complete(generation, trigger, result)
        });

        let provider = self.this.clone();
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let error = ConnectionSnafu { message: format!("connection task failed: {e}") }.build();
                    match provider.upgrade() {
                        Some(provider) => provider.complete(generation, trigger_for_join, Err(error)),
                        None => Some(Err(error)),
                    }
                },
            }
        }
        .boxed()
        .shared();

        state.slot = Slot::Pending(shared.clone());
        shared
    }

    fn complete(
        &self,
        generation: u64,
        trigger: ReconnectionTrigger,
        result: Result<ResolvedConnection>,
    ) -> Option<Result<ConnectionInfo>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Some(DisposedSnafu { component: COMPONENT }.fail());
        }
        if state.generation != generation {
            debug!(
                generation = generation,
                current = state.generation,
                "Discarding superseded connection result"
            );
            return None;
        }
        state.run_token = None;

        match result {
            Ok(resolved) => {
                let detector = LeaderChangeDetector::new(self.this.clone(), generation);
                let invoker = CallInvoker::new(resolved.handle.channel(), detector);
                let info = ConnectionInfo {
                    handle: resolved.handle,
                    capabilities: resolved.capabilities,
                    invoker,
                    trigger,
                    generation,
                };
                state.backoff.reset();
                state.slot = Slot::Ready(info.clone());
                info!(
                    generation = generation,
                    endpoint = %info.endpoint(),
                    trigger = %info.trigger,
                    "Connection ready"
                );
                Some(Ok(info))
            },
            Err(error) => {
                let delay: Duration = state.backoff.next_backoff();
                warn!(
                    generation = generation,
                    trigger = %trigger,
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connection attempt failed"
                );
                let now = Instant::now();
                let retry_at =
                    now.checked_add(delay).or_else(|| now.checked_add(MAX_RETRY_DELAY)).unwrap_or(now);
                state.slot = Slot::Failed { error: error.clone(), retry_at };
                Some(Err(error))
            },
        }
    }
}

impl Drop for ConnectionProvider {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let slot = match &state.slot {
            Slot::Empty => "empty",
            Slot::Pending(_) => "pending",
            Slot::Ready(_) => "ready",
            Slot::Failed { .. } => "failed",
        };
        f.debug_struct("ConnectionProvider")
            .field("generation", &state.generation)
            .field("trigger", &state.trigger)
            .field("slot", &slot)
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}
