//! Correlation of out-of-band requests with their responses.
//!
//! A request is sent with a fresh opaque id; the response arrives later on
//! a different channel carrying the same id. The registry parks the caller
//! on a oneshot channel until [`RequestRegistry::resolve`] or
//! [`RequestRegistry::reject`] is called with that id.
//!
//! The pending map is only touched inside synchronous methods, never across
//! an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use log::debug;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Disconnected")]
    Disconnected,

    #[error("Failed to send request: {0}")]
    Send(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Request was dropped without a response")]
    Dropped,
}

/// Sends one request. Receives the generated id and the payload.
pub type SendFn<P> =
    Box<dyn Fn(String, P) -> BoxFuture<'static, Result<(), RegistryError>> + Send + Sync>;

type Pending<R> = HashMap<String, oneshot::Sender<Result<R, RegistryError>>>;

/// Owns one pending entry for the lifetime of a `request` call.
struct EntryGuard<'a, R> {
    pending: &'a Mutex<Pending<R>>,
    id: String,
}

impl<R> Drop for EntryGuard<'_, R> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct RequestRegistry<P, R> {
    send: SendFn<P>,
    pending: Mutex<Pending<R>>,
    /// When set, every new request first resolves all outstanding ones
    /// with this value.
    drain_with: Option<R>,
}

impl<P, R> RequestRegistry<P, R>
where
    R: Clone,
{
    pub fn new(send: SendFn<P>) -> Self {
        Self {
            send,
            pending: Mutex::new(HashMap::new()),
            drain_with: None,
        }
    }

    /// A registry where each new request supersedes all outstanding ones,
    /// which resolve with `default`.
    pub fn with_eager_drain(send: SendFn<P>, default: R) -> Self {
        Self {
            send,
            pending: Mutex::new(HashMap::new()),
            drain_with: Some(default),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending<R>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `payload` and wait for the matching response.
    pub async fn request(&self, payload: P) -> Result<R, RegistryError> {
        if let Some(default) = &self.drain_with {
            let drained: Vec<_> = self.pending().drain().collect();
            for (_, tx) in drained {
                let _ = tx.send(Ok(default.clone()));
            }
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);
        // Removes the entry however this future ends, including being dropped.
        let _entry = EntryGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        (self.send)(id, payload).await?;
        rx.await.unwrap_or(Err(RegistryError::Dropped))
    }

    /// Settle `id` with a response. Unknown ids are ignored; returns whether
    /// a request was waiting.
    pub fn resolve(&self, id: &str, response: R) -> bool {
        match self.pending().remove(id) {
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => {
                debug!("[registry] No pending request {}", id);
                false
            }
        }
    }

    /// Settle `id` with an error. Unknown ids are ignored.
    pub fn reject(&self, id: &str, error: RegistryError) -> bool {
        match self.pending().remove(id) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request. Returns how many were pending.
    pub fn reject_all(&self, error: RegistryError) -> usize {
        let drained: Vec<_> = self.pending().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("[registry] Rejected {} pending request(s): {}", count, error);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}
