//! Lifecycle coordinator for the marimo server.
//!
//! Owns the server's lifecycle state and the single in-flight start. Any
//! number of tasks may call [`ServerLifecycleCoordinator::start`]
//! concurrently; they all share one start cycle (one process spawn) and
//! observe the same result or the same error.
//!
//! ```text
//! stopped --start()--> starting --ok--> started --stop/unhealthy--> stopped
//!                         |                 \--start() & healthy--/ (self loop)
//!                         \--error/cancel--> stopped
//! ```
//!
//! Each start cycle runs under a generation number. Stopping, restarting
//! and cancelling all bump the generation, so a cycle that finishes late
//! can tell it was superseded and leaves the newer state alone.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use kernel_launch::port::{is_free, try_port};
use kernel_launch::{LaunchError, PortError, ProcessTransport};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::health::HealthProbe;
use crate::negotiator::{NegotiationError, StartupNegotiator, StartupResult, StartupValues};
use crate::sessions::{Session, SessionsClient};
use crate::settings::{RecoveryPolicy, ServerSettings};
use crate::state::{scope_key, StateStore};

/// Delay between `/health` polls while waiting for a fresh server.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Landing page fetch attempts per start cycle.
const NEGOTIATE_ATTEMPTS: u32 = 3;

/// Base of the linear back-off between negotiation attempts.
const NEGOTIATE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Started,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Started => write!(f, "started"),
        }
    }
}

/// Why a start cycle was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A restart replaced the cycle with a new one.
    Superseded,
    /// The server was stopped while starting.
    Stopped,
    /// The caller's cancellation signal fired.
    Caller,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Superseded => write!(f, "superseded by a restart"),
            CancelReason::Stopped => write!(f, "server was stopped"),
            CancelReason::Caller => write!(f, "cancelled by caller"),
        }
    }
}

/// Errors from a start cycle.
///
/// Cloneable so that one error instance reaches every awaiter of the cycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartError {
    #[error("Could not find a free port: {0}")]
    Port(#[from] PortError),

    #[error("Failed to launch marimo: {0}")]
    Launch(Arc<LaunchError>),

    #[error("marimo exited before it became healthy on port {0}")]
    Exited(u16),

    #[error("marimo did not become healthy on port {port} after {attempts} attempts")]
    NotReady { port: u16, attempts: u32 },

    #[error(transparent)]
    Negotiation(Arc<NegotiationError>),

    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Start cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("Coordinator is starting but has no pending start")]
    InvalidState,
}

impl StartError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StartError::Cancelled(_))
    }

    /// The port is held by a server this host did not launch.
    pub fn is_foreign_server(&self) -> bool {
        matches!(self, StartError::Negotiation(e) if matches!(**e, NegotiationError::ForeignServer { .. }))
    }
}

impl From<LaunchError> for StartError {
    fn from(e: LaunchError) -> Self {
        StartError::Launch(Arc::new(e))
    }
}

impl From<NegotiationError> for StartError {
    fn from(e: NegotiationError) -> Self {
        StartError::Negotiation(Arc::new(e))
    }
}

type StartOutcome = Result<Arc<StartupResult>, StartError>;

/// The single in-flight start cycle. Cloning shares the same outcome.
#[derive(Clone)]
struct PendingStart {
    generation: u64,
    outcome: Shared<BoxFuture<'static, StartOutcome>>,
}

enum Acquired {
    Ready(Arc<StartupResult>),
    Pending(PendingStart),
}

/// Result of looking for a server left over from a previous run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Nothing was recorded, or the recorded process is gone.
    NothingToRecover,
    /// A leftover server was found and stopped.
    Stopped { pid: u32 },
    /// A leftover server was healthy and has been adopted.
    Reused { pid: u32, port: u16 },
}

struct Lifecycle {
    state: LifecycleState,
    generation: u64,
    pending: Option<PendingStart>,
    cancel: Option<oneshot::Sender<CancelReason>>,
    result: Option<Arc<StartupResult>>,
}

struct Inner {
    settings: ServerSettings,
    target: PathBuf,
    scope: String,
    transport: Arc<dyn ProcessTransport>,
    store: Arc<StateStore>,
    negotiator: StartupNegotiator,
    health: HealthProbe,
    sessions: SessionsClient,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to the coordinator. Clones share the same state; the host's
/// composition point creates one and hands clones to consumers.
#[derive(Clone)]
pub struct ServerLifecycleCoordinator {
    inner: Arc<Inner>,
}

impl ServerLifecycleCoordinator {
    /// Create a coordinator for the workspace or notebook at `target`.
    pub fn new(
        settings: ServerSettings,
        target: PathBuf,
        transport: Arc<dyn ProcessTransport>,
        store: Arc<StateStore>,
    ) -> Result<Self, reqwest::Error> {
        let negotiator = StartupNegotiator::new(settings.fetch_timeout())?;
        let health = HealthProbe::new(settings.health_timeout())?;
        let sessions = SessionsClient::new(settings.fetch_timeout())?;
        let scope = scope_key(&target);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                target,
                scope,
                transport,
                store,
                negotiator,
                health,
                sessions,
                lifecycle: Mutex::new(Lifecycle {
                    state: LifecycleState::Stopped,
                    generation: 0,
                    pending: None,
                    cancel: None,
                    result: None,
                }),
            }),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    pub fn target(&self) -> &Path {
        &self.inner.target
    }

    /// Key of this coordinator's scope in the [`StateStore`].
    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn negotiator(&self) -> &StartupNegotiator {
        &self.inner.negotiator
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    /// Current start generation. Pass to [`Self::cancel`] to cancel exactly
    /// the cycle observed here.
    pub fn generation(&self) -> u64 {
        self.lifecycle().generation
    }

    /// Port of the running server, if started.
    pub fn port(&self) -> Option<u16> {
        self.lifecycle().result.as_ref().map(|r| r.port)
    }

    /// Result of the last successful start, if still started.
    pub fn current_result(&self) -> Option<Arc<StartupResult>> {
        self.lifecycle().result.clone()
    }

    // =========================================================================
    // Start / stop / restart
    // =========================================================================

    /// Start the server, or join the start already in flight, or return the
    /// current result when the running server is healthy.
    pub async fn start(&self) -> Result<Arc<StartupResult>, StartError> {
        debug!("[coordinator] start() in state {}", self.state());
        match self.acquire().await? {
            Acquired::Ready(result) => Ok(result),
            Acquired::Pending(pending) => pending.outcome.await,
        }
    }

    /// Like [`Self::start`], but cancels the start cycle when `cancelled`
    /// completes first. Every awaiter of that cycle then sees
    /// [`CancelReason::Caller`].
    pub async fn start_until<C>(&self, cancelled: C) -> Result<Arc<StartupResult>, StartError>
    where
        C: Future<Output = ()>,
    {
        let pending = match self.acquire().await? {
            Acquired::Ready(result) => return Ok(result),
            Acquired::Pending(pending) => pending,
        };
        tokio::select! {
            outcome = pending.outcome.clone() => outcome,
            () = cancelled => {
                self.cancel(pending.generation).await;
                // The cycle may have settled in the meantime.
                match pending.outcome.peek() {
                    Some(outcome) => outcome.clone(),
                    None => Err(StartError::Cancelled(CancelReason::Caller)),
                }
            }
        }
    }

    /// Cancel the start cycle of `generation`. Returns `false` if that cycle
    /// is no longer the current one, in which case nothing changes.
    pub async fn cancel(&self, generation: u64) -> bool {
        let cancel = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.generation != generation || lifecycle.state != LifecycleState::Starting {
                debug!(
                    "[coordinator] Ignoring stale cancel for generation {} (current {})",
                    generation, lifecycle.generation
                );
                return false;
            }
            lifecycle.generation += 1;
            lifecycle.state = LifecycleState::Stopped;
            lifecycle.pending = None;
            lifecycle.result = None;
            lifecycle.cancel.take()
        };
        info!("[coordinator] Cancelling start generation {}", generation);
        if let Some(tx) = cancel {
            let _ = tx.send(CancelReason::Caller);
        }
        self.stop_process().await;
        true
    }

    /// Stop the server. Rejects an unsettled start with
    /// [`CancelReason::Stopped`]. A no-op when already stopped.
    pub async fn stop_server(&self) {
        self.stop_with(CancelReason::Stopped).await;
    }

    /// Stop and start again. Awaiters of an in-flight start receive
    /// [`CancelReason::Superseded`]; this call joins the new cycle.
    pub async fn restart(&self) -> Result<Arc<StartupResult>, StartError> {
        info!("[coordinator] Restarting marimo server");
        self.stop_with(CancelReason::Superseded).await;
        self.start().await
    }

    async fn stop_with(&self, reason: CancelReason) {
        let cancel = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == LifecycleState::Stopped {
                debug!("[coordinator] Already stopped");
                return;
            }
            lifecycle.generation += 1;
            lifecycle.state = LifecycleState::Stopped;
            lifecycle.pending = None;
            lifecycle.result = None;
            lifecycle.cancel.take()
        };
        info!("[coordinator] Stopping marimo server");
        if let Some(tx) = cancel {
            let _ = tx.send(reason);
        }
        self.stop_process().await;
    }

    /// Decide how this call gets its result. Holds the lock only between
    /// suspension points.
    async fn acquire(&self) -> Result<Acquired, StartError> {
        loop {
            let (generation, current) = {
                let mut lifecycle = self.lifecycle();
                match lifecycle.state {
                    LifecycleState::Stopped => {
                        return Ok(Acquired::Pending(self.begin_cycle(&mut lifecycle)));
                    }
                    LifecycleState::Starting => {
                        return lifecycle
                            .pending
                            .clone()
                            .map(Acquired::Pending)
                            .ok_or(StartError::InvalidState);
                    }
                    LifecycleState::Started => (lifecycle.generation, lifecycle.result.clone()),
                }
            };

            let healthy = match &current {
                Some(result) => self.probe(result.port).await,
                None => false,
            };

            let mut lifecycle = self.lifecycle();
            if lifecycle.generation != generation {
                // Someone stopped or restarted while we probed; look again.
                continue;
            }
            if let (true, Some(result)) = (healthy, current) {
                return Ok(Acquired::Ready(result));
            }
            warn!("[coordinator] marimo server is unhealthy, restarting");
            return Ok(Acquired::Pending(self.begin_cycle(&mut lifecycle)));
        }
    }

    /// Register a new start cycle and drive it on a background task so it
    /// makes progress even if every caller drops its future.
    fn begin_cycle(&self, lifecycle: &mut Lifecycle) -> PendingStart {
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let this = self.clone();
        let outcome = async move {
            let cancelled = async move {
                match cancel_rx.await {
                    Ok(reason) => reason,
                    // Sender dropped without cancelling; never fire.
                    Err(_) => futures::future::pending().await,
                }
            };
            let outcome = tokio::select! {
                outcome = this.run_cycle(generation) => outcome,
                reason = cancelled => Err(StartError::Cancelled(reason)),
            };
            this.finish_cycle(generation, &outcome);
            outcome
        }
        .boxed()
        .shared();

        let pending = PendingStart {
            generation,
            outcome,
        };
        lifecycle.state = LifecycleState::Starting;
        lifecycle.pending = Some(pending.clone());
        lifecycle.cancel = Some(cancel_tx);
        lifecycle.result = None;

        tokio::spawn(pending.outcome.clone().map(|_| ()));
        info!("[coordinator] Start cycle {} begun", generation);
        pending
    }

    fn finish_cycle(&self, generation: u64, outcome: &StartOutcome) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation {
            debug!(
                "[coordinator] Start cycle {} finished after being superseded",
                generation
            );
            return;
        }
        lifecycle.pending = None;
        lifecycle.cancel = None;
        match outcome {
            Ok(result) => {
                info!(
                    "[coordinator] marimo {} started on port {}",
                    result.version, result.port
                );
                lifecycle.state = LifecycleState::Started;
                lifecycle.result = Some(result.clone());
            }
            Err(e) => {
                error!("[coordinator] Start cycle {} failed: {}", generation, e);
                lifecycle.state = LifecycleState::Stopped;
                lifecycle.result = None;
            }
        }
    }

    async fn run_cycle(&self, generation: u64) -> StartOutcome {
        match self.launch(generation).await {
            Ok(result) => Ok(Arc::new(result)),
            Err(e) => {
                if !e.is_cancelled() {
                    self.stop_process().await;
                }
                Err(e)
            }
        }
    }

    async fn launch(&self, generation: u64) -> Result<StartupResult, StartError> {
        let transport = &self.inner.transport;
        transport.stop().await?;

        let port = try_port(self.inner.settings.port).await?;
        let command = self.inner.settings.command(&self.inner.target, port);
        let pid = transport.spawn(&command).await?;
        info!(
            "[coordinator] Spawned marimo (pid {}) on port {} for cycle {}",
            pid, port, generation
        );
        if let Err(e) = self.inner.store.record_server(&self.inner.scope, pid, port) {
            warn!("[coordinator] Failed to persist server pid: {}", e);
        }

        self.wait_until_healthy(port).await?;
        let values = self.negotiate(port).await?;
        Ok(StartupResult::new(port, values))
    }

    async fn wait_until_healthy(&self, port: u16) -> Result<(), StartError> {
        let attempts = self.inner.settings.startup_attempts.max(1);
        info!("[coordinator] Waiting for marimo to become healthy...");
        for attempt in 1..=attempts {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            if self.probe(port).await {
                info!(
                    "[coordinator] marimo healthy on port {} (waited {}ms)",
                    port,
                    u64::from(attempt) * STARTUP_POLL_INTERVAL.as_millis() as u64
                );
                return Ok(());
            }
            if !self.inner.transport.is_running().await {
                return Err(StartError::Exited(port));
            }
        }
        Err(StartError::NotReady { port, attempts })
    }

    /// Fetch startup values, retrying transient failures with linear
    /// back-off.
    async fn negotiate(&self, port: u16) -> Result<StartupValues, StartError> {
        let url = self.inner.settings.landing_url(port)?;
        let mut attempt = 1;
        loop {
            match self.inner.negotiator.fetch(&url).await {
                Ok(values) => return Ok(values),
                Err(e) if e.is_retryable() && attempt < NEGOTIATE_ATTEMPTS => {
                    warn!(
                        "[coordinator] Negotiation attempt {}/{} failed: {}",
                        attempt, NEGOTIATE_ATTEMPTS, e
                    );
                    tokio::time::sleep(NEGOTIATE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn probe(&self, port: u16) -> bool {
        match self.inner.settings.base_url(port) {
            Ok(url) => self.inner.health.is_healthy(&url).await,
            Err(_) => false,
        }
    }

    /// Best-effort stop of the process and its persisted record.
    async fn stop_process(&self) {
        if let Err(e) = self.inner.transport.stop().await {
            warn!("[coordinator] Failed to stop marimo: {}", e);
        }
        if let Err(e) = self.inner.store.clear_server(&self.inner.scope) {
            warn!("[coordinator] Failed to clear persisted server: {}", e);
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe the running server without side effects. `false` when not
    /// started.
    pub async fn check_health(&self) -> bool {
        let port = {
            let lifecycle = self.lifecycle();
            if lifecycle.state != LifecycleState::Started {
                return false;
            }
            lifecycle.result.as_ref().map(|r| r.port)
        };
        match port {
            Some(port) => self.probe(port).await,
            None => false,
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// List the server's running notebook sessions. Empty when stopped (no
    /// network call is made) or when anything fails.
    pub async fn get_active_sessions(&self) -> Vec<Session> {
        if self.state() == LifecycleState::Stopped {
            return Vec::new();
        }
        let result = match self.start().await {
            Ok(result) => result,
            Err(e) => {
                warn!("[coordinator] Cannot list sessions: {}", e);
                return Vec::new();
            }
        };
        let listed = match self.inner.settings.base_url(result.port) {
            Ok(base) => self.inner.sessions.list(&base, &result.skew_token).await,
            Err(e) => Err(e.into()),
        };
        listed.unwrap_or_else(|e| {
            warn!("[coordinator] Failed to list sessions: {}", e);
            Vec::new()
        })
    }

    /// Ask the server to shut down one session. Failures are logged.
    pub async fn shutdown_session(&self, session_id: &str) {
        info!("[coordinator] Shutting down session {}", session_id);
        let result = match self.start().await {
            Ok(result) => result,
            Err(e) => {
                warn!("[coordinator] Cannot shut down session {}: {}", session_id, e);
                return;
            }
        };
        let shutdown = match self.inner.settings.base_url(result.port) {
            Ok(base) => {
                self.inner
                    .sessions
                    .shutdown(&base, &result.skew_token, session_id)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = shutdown {
            warn!("[coordinator] Failed to shut down session {}: {}", session_id, e);
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Deal with a server left behind by a previous run of the host,
    /// according to [`ServerSettings::recovery`]. Call once, before the
    /// first start.
    pub async fn recover(&self) -> RecoveryOutcome {
        let persisted = self.inner.store.get(&self.inner.scope);
        let Some(pid) = persisted.server_pid else {
            return RecoveryOutcome::NothingToRecover;
        };

        // A live pid alone may belong to an unrelated process after a reboot
        // or pid reuse; only touch it if something still holds our port.
        let port_in_use = match persisted.server_port {
            Some(port) => !is_free(port).await,
            None => false,
        };
        if !port_in_use {
            info!(
                "[coordinator] Recorded server {} no longer holds its port, forgetting it",
                pid
            );
            self.forget_server();
            return RecoveryOutcome::NothingToRecover;
        }

        match self.inner.transport.attach(pid).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("[coordinator] Recorded server {} is gone", pid);
                self.forget_server();
                return RecoveryOutcome::NothingToRecover;
            }
            Err(e) => {
                warn!("[coordinator] Failed to attach to server {}: {}", pid, e);
                self.forget_server();
                return RecoveryOutcome::NothingToRecover;
            }
        }

        if self.inner.settings.recovery == RecoveryPolicy::Reuse {
            if let Some(port) = persisted.server_port {
                if let Some(outcome) = self.try_reuse(pid, port).await {
                    return outcome;
                }
            }
        }

        info!("[coordinator] Stopping leftover marimo server {}", pid);
        self.stop_process().await;
        RecoveryOutcome::Stopped { pid }
    }

    async fn try_reuse(&self, pid: u32, port: u16) -> Option<RecoveryOutcome> {
        if !self.probe(port).await {
            info!("[coordinator] Leftover server {} is unhealthy", pid);
            return None;
        }
        let values = match self.negotiate(port).await {
            Ok(values) => values,
            Err(e) => {
                info!("[coordinator] Cannot reuse leftover server {}: {}", pid, e);
                return None;
            }
        };

        let mut lifecycle = self.lifecycle();
        if lifecycle.state != LifecycleState::Stopped {
            // A start raced ahead of recovery; leave it in charge.
            return None;
        }
        lifecycle.generation += 1;
        lifecycle.state = LifecycleState::Started;
        lifecycle.result = Some(Arc::new(StartupResult::new(port, values)));
        info!("[coordinator] Reusing marimo server {} on port {}", pid, port);
        Some(RecoveryOutcome::Reused { pid, port })
    }

    fn forget_server(&self) {
        if let Err(e) = self.inner.store.clear_server(&self.inner.scope) {
            warn!("[coordinator] Failed to clear persisted server: {}", e);
        }
    }
}
