//! Background health watchdog.
//!
//! Re-probes the server on a fixed interval while it is started. A failed
//! probe never restarts anything on its own: the user is asked first.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::coordinator::{LifecycleState, ServerLifecycleCoordinator};
use crate::prompt::Prompter;

pub const RESTART_CHOICE: &str = "Restart";
pub const IGNORE_CHOICE: &str = "Ignore";

/// What one watchdog tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTick {
    /// The server is not started; nothing was probed.
    Idle,
    Healthy,
    /// Unhealthy, and the user chose to leave it alone (or dismissed).
    Ignored,
    /// Unhealthy, and the user chose to restart.
    Restarted,
}

/// Probe once and act on the result.
pub async fn check_once(
    coordinator: &ServerLifecycleCoordinator,
    prompter: &dyn Prompter,
) -> WatchdogTick {
    if coordinator.state() != LifecycleState::Started {
        return WatchdogTick::Idle;
    }
    if coordinator.check_health().await {
        debug!("[watchdog] marimo server is healthy");
        return WatchdogTick::Healthy;
    }

    warn!("[watchdog] marimo server failed its health check");
    let choice = prompter
        .choose(
            "The marimo server is not responding. Restart it?",
            &[RESTART_CHOICE, IGNORE_CHOICE],
        )
        .await;
    if choice != Some(0) {
        return WatchdogTick::Ignored;
    }

    if let Err(e) = coordinator.restart().await {
        warn!("[watchdog] Restart failed: {}", e);
    }
    WatchdogTick::Restarted
}

/// Handle to a running watchdog task. Dropping it stops the watchdog.
pub struct Watchdog {
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn the watchdog on the coordinator's configured interval.
    pub fn spawn(coordinator: ServerLifecycleCoordinator, prompter: Arc<dyn Prompter>) -> Self {
        let period = coordinator.settings().health_interval();
        info!("[watchdog] Checking health every {:?}", period);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A slow probe must not cause a burst of catch-up ticks.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                check_once(&coordinator, prompter.as_ref()).await;
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
