//! In-process transport backend
//!
//! Keeps every channel in memory and lets the caller push row changes and
//! status transitions by hand. Channels answer `subscribe()` with
//! `SUBSCRIBED` synchronously unless a failure was queued with
//! [`MemoryBackend::fail_next_subscribe`].

use super::{EventListener, RawChannel, RawStatusListener, TransportBackend};
use crate::channel::{ChangeEvent, ChannelKey, ChannelStatus, EventKind};
use crate::error::TransportError;
use crate::lock;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

#[derive(Default)]
struct ChannelSlot {
    id: u64,
    key: Option<ChannelKey>,
    listeners: Vec<(EventKind, EventListener)>,
    on_status: Option<RawStatusListener>,
    live: bool,
    /// Reported a terminal status or was torn down
    closed: bool,
    unsubscribed: bool,
}

#[derive(Default)]
struct MemoryState {
    credential: Option<String>,
    credential_error: Option<String>,
    auth_token: Option<String>,
    connected: bool,
    connects: usize,
    disconnects: usize,
    next_channel: u64,
    channels: Vec<ChannelSlot>,
    queued_failures: VecDeque<(ChannelStatus, Option<String>)>,
    teardowns: usize,
}

impl MemoryState {
    fn slot_mut(&mut self, id: u64) -> Option<&mut ChannelSlot> {
        self.channels.iter_mut().find(|slot| slot.id == id)
    }

    fn is_open(slot: &ChannelSlot, key: &ChannelKey) -> bool {
        slot.live && !slot.closed && slot.key.as_ref() == Some(key)
    }
}

/// Transport backend that lives entirely in the current process.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that already hands out `token`.
    pub fn with_credential(token: impl Into<String>) -> Self {
        let backend = Self::new();
        backend.set_credential(Some(token.into()));
        backend
    }

    pub fn set_credential(&self, token: Option<String>) {
        let mut state = lock(&self.state);
        state.credential = token;
        state.credential_error = None;
    }

    /// Make the next credential lookups fail with `message`.
    pub fn fail_credential(&self, message: impl Into<String>) {
        lock(&self.state).credential_error = Some(message.into());
    }

    /// Credential last pushed through `set_auth`.
    pub fn auth_token(&self) -> Option<String> {
        lock(&self.state).auth_token.clone()
    }

    /// Simulate the physical connection dropping or coming back.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Queue a status that the next channel reports instead of `SUBSCRIBED`.
    pub fn fail_next_subscribe(&self, status: ChannelStatus, error: Option<String>) {
        lock(&self.state)
            .queued_failures
            .push_back((status, error));
    }

    /// Number of channels ever told to go live.
    pub fn opened_channel_count(&self) -> usize {
        lock(&self.state).channels.iter().filter(|s| s.live).count()
    }

    /// Number of live channels currently open on `key`.
    pub fn open_channel_count(&self, key: &ChannelKey) -> usize {
        lock(&self.state)
            .channels
            .iter()
            .filter(|slot| MemoryState::is_open(slot, key))
            .count()
    }

    /// Number of `unsubscribe()` calls that tore a channel down.
    pub fn teardown_count(&self) -> usize {
        lock(&self.state).teardowns
    }

    /// Deliver `event` to every open channel on `key`. Returns the number of
    /// listeners invoked.
    pub fn emit(&self, key: &ChannelKey, event: ChangeEvent) -> usize {
        let listeners: Vec<EventListener> = {
            let state = lock(&self.state);
            state
                .channels
                .iter()
                .filter(|slot| MemoryState::is_open(slot, key))
                .flat_map(|slot| slot.listeners.iter())
                .filter(|(kind, _)| kind.accepts(event.kind))
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        trace!(channel = %key, listeners = listeners.len(), "memory emit");
        for listener in &listeners {
            listener(&event);
        }
        listeners.len()
    }

    /// Report `status` on every open channel on `key`.
    pub fn emit_status(&self, key: &ChannelKey, status: ChannelStatus, error: Option<String>) {
        let targets: Vec<RawStatusListener> = {
            let mut state = lock(&self.state);
            state
                .channels
                .iter_mut()
                .filter(|slot| MemoryState::is_open(slot, key))
                .filter_map(|slot| {
                    if status.is_terminal() {
                        slot.closed = true;
                    }
                    slot.on_status.clone()
                })
                .collect()
        };
        for on_status in targets {
            on_status(status, error.clone());
        }
    }
}

#[async_trait]
impl TransportBackend for MemoryBackend {
    async fn credential(&self) -> Result<Option<String>, TransportError> {
        let state = lock(&self.state);
        match &state.credential_error {
            Some(message) => Err(TransportError::Auth(message.clone())),
            None => Ok(state.credential.clone()),
        }
    }

    fn set_auth(&self, token: &str) {
        lock(&self.state).auth_token = Some(token.to_string());
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn channel(&self, key: &ChannelKey) -> Box<dyn RawChannel> {
        let mut state = lock(&self.state);
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.push(ChannelSlot {
            id,
            key: Some(key.clone()),
            ..ChannelSlot::default()
        });
        Box::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl RawChannel for MemoryChannel {
    fn on_event(&mut self, kind: EventKind, listener: EventListener) {
        let mut state = lock(&self.state);
        let Some(slot) = state.slot_mut(self.id) else {
            return;
        };
        if slot.live {
            warn!(channel = self.id, "listener attached after subscribe, it will not be called");
            return;
        }
        slot.listeners.push((kind, listener));
    }

    fn subscribe(&mut self, on_status: RawStatusListener) {
        let outcome = {
            let mut state = lock(&self.state);
            let outcome = state
                .queued_failures
                .pop_front()
                .unwrap_or((ChannelStatus::Subscribed, None));
            let Some(slot) = state.slot_mut(self.id) else {
                return;
            };
            slot.live = true;
            slot.on_status = Some(Arc::clone(&on_status));
            if outcome.0.is_terminal() {
                slot.closed = true;
            }
            outcome
        };
        on_status(outcome.0, outcome.1);
    }

    fn unsubscribe(&mut self) {
        let on_status = {
            let mut state = lock(&self.state);
            let Some(slot) = state.slot_mut(self.id) else {
                return;
            };
            if slot.unsubscribed {
                return;
            }
            slot.unsubscribed = true;
            let was_open = slot.live && !slot.closed;
            slot.closed = true;
            let on_status = slot.on_status.take();
            state.teardowns += 1;
            on_status.filter(|_| was_open)
        };
        if let Some(on_status) = on_status {
            on_status(ChannelStatus::Closed, None);
        }
    }
}
