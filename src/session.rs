//! Transport session: connectivity and the session generation counter
//!
//! The generation is bumped on every intentional teardown (logout, explicit
//! cleanup, visibility-regain reset). Async work captures it when it starts and
//! compares on resumption; a mismatch means the work belongs to a previous
//! connection epoch and must not touch state.

use crate::error::TransportError;
use crate::lock;
use crate::transport::TransportBackend;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

/// Options for [`TransportSession::ensure_connected`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Tear the connection down and reconnect even if it looks healthy
    pub force_reconnect: bool,
    /// Only connect when disconnected; never tear down a working connection
    pub ensure_only: bool,
}

impl ConnectOptions {
    pub fn ensure_only() -> Self {
        Self {
            force_reconnect: false,
            ensure_only: true,
        }
    }

    pub fn force() -> Self {
        Self {
            force_reconnect: true,
            ensure_only: false,
        }
    }
}

/// Owner of the physical connection and the generation counter.
pub struct TransportSession {
    backend: Arc<dyn TransportBackend>,
    generation: AtomicU64,
    /// Last generation announced to watchers; trails `generation` during a reset
    announced: watch::Sender<u64>,
    credential: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl TransportSession {
    pub fn new(backend: Arc<dyn TransportBackend>) -> Self {
        let (announced, _rx) = watch::channel(0);
        Self {
            backend,
            generation: AtomicU64::new(0),
            announced,
            credential: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TransportBackend> {
        &self.backend
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new generation and announce it. Returns the new value.
    pub fn increment_generation(&self) -> u64 {
        let generation = self.advance_generation();
        self.announce_generation();
        generation
    }

    /// Start a new generation without waking watchers yet. Work stamped with
    /// the old generation is invalid from here on.
    pub(crate) fn advance_generation(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "session generation advanced");
        generation
    }

    /// Wake generation watchers if the generation moved since the last
    /// announcement.
    pub(crate) fn announce_generation(&self) {
        let generation = self.generation();
        self.announced.send_if_modified(|announced| {
            if *announced == generation {
                return false;
            }
            *announced = generation;
            true
        });
    }

    pub fn is_generation_valid(&self, generation: u64) -> bool {
        generation == self.generation()
    }

    /// Receiver that wakes whenever a new generation is announced.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.announced.subscribe()
    }

    /// A credential has been obtained and pushed to the transport.
    pub fn is_auth_ready(&self) -> bool {
        lock(&self.credential).is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.backend.is_connected()
    }

    pub(crate) fn mark_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Refresh the credential and make sure the transport is connected.
    ///
    /// A changed credential is pushed to the live connection in place. The
    /// generation is left alone even on a forced reconnect; callers that reset
    /// intentionally bump it themselves.
    pub async fn ensure_connected(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        let token = self.backend.credential().await?;

        let changed = {
            let mut current = lock(&self.credential);
            if *current != token {
                *current = token.clone();
                true
            } else {
                false
            }
        };
        if changed && let Some(token) = &token {
            debug!("pushing refreshed credential to transport");
            self.backend.set_auth(token);
        }

        if opts.force_reconnect && !opts.ensure_only {
            info!("forcing transport reconnect");
            self.mark_connected(false);
            self.backend.disconnect().await;
            self.backend.connect().await?;
            self.mark_connected(true);
            return Ok(());
        }

        if !self.backend.is_connected() {
            debug!("transport not connected, connecting");
            self.backend.connect().await?;
        }
        self.mark_connected(true);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.mark_connected(false);
        self.backend.disconnect().await;
    }
}
