//! Named mutual-exclusion gates.
//!
//! Unlike a mutex, a gate never waits: a second caller for the same name is
//! turned away while the first holds it. Used to keep at most one flow of a
//! given purpose (for example a reconnect prompt) in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Default)]
pub struct NamedGate {
    held: Arc<Mutex<HashSet<String>>>,
}

impl NamedGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate for `name`, or `None` if it is already held.
    pub fn try_enter(&self, name: &str) -> Option<GateGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(GateGuard {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases its gate when dropped.
pub struct GateGuard {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
