//! Supervision of an external marimo server.
//!
//! The [`ServerLifecycleCoordinator`] starts the server exactly once no
//! matter how many tasks ask for it, checks its health, recovers a server
//! left over from a previous run, and lists or shuts down the notebook
//! sessions running on it.
//!
//! Process spawning and port probing live in `kernel-launch`; this crate
//! decides when to use them.

pub mod coordinator;
pub mod health;
pub mod negotiator;
pub mod prompt;
pub mod sessions;
pub mod settings;
pub mod state;
pub mod watchdog;

pub use coordinator::{
    CancelReason, LifecycleState, RecoveryOutcome, ServerLifecycleCoordinator, StartError,
};
pub use negotiator::{NegotiationError, StartupNegotiator, StartupResult, StartupValues};
pub use prompt::{DismissPrompter, FixedPrompter, Prompter};
pub use sessions::{Session, SERVER_TOKEN_HEADER};
pub use settings::{BrowserPreference, RecoveryPolicy, ServerSettings};
pub use state::{StateError, StateStore};
pub use watchdog::{Watchdog, WatchdogTick};
