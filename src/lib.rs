//! livesync: realtime resource synchronization for the site builder client
//!
//! Multiplexes live subscriptions onto shared transport channels, recovers
//! failed channels with backoff, and reconciles snapshot fetches with the live
//! increment stream for every resource the UI shows.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod resource;
pub mod resources;
pub mod retry;
pub mod session;
pub mod timeline;
pub mod transport;

pub use channel::*;
pub use registry::{RealtimeClient, SubscribeRequest, SubscriptionHandle};
pub use resource::{RealtimeResource, ResourceChange, ResourceConfig, ResourceView};
pub use session::TransportSession;

/// Lock a mutex, recovering the data if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns background work for callbacks that may run outside a runtime
/// context, such as a backend reporting status from its own thread.
#[derive(Debug, Clone)]
pub(crate) struct Spawner {
    captured: Option<Handle>,
}

impl Spawner {
    /// Remember the runtime this is created in, if any.
    pub(crate) fn capture() -> Self {
        Self {
            captured: Handle::try_current().ok(),
        }
    }

    /// Spawn on the current runtime, or on the captured one from outside a
    /// runtime. Returns `None` when neither exists.
    pub(crate) fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match Handle::try_current().ok().or_else(|| self.captured.clone()) {
            Some(handle) => Some(handle.spawn(future)),
            None => {
                tracing::warn!("no tokio runtime available, background task not started");
                None
            }
        }
    }
}
