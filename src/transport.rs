//! Backend collaborator interface
//!
//! The realtime layer treats the backend-as-a-service as an external
//! collaborator: it hands out a credential, keeps one physical connection and
//! opens logical channels on `(table, filter)` pairs. Anything speaking this
//! interface can drive the multiplexer; [`memory::MemoryBackend`] is the
//! in-process implementation used by the CLI and the tests.

use crate::channel::{ChangeEvent, ChannelKey, ChannelStatus, EventKind};
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;

/// Listener for row changes on a raw channel.
pub type EventListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Listener for lifecycle changes of a raw channel.
pub type RawStatusListener = Arc<dyn Fn(ChannelStatus, Option<String>) + Send + Sync>;

/// The physical realtime connection and its channel factory.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Fetch the current auth credential (`None` when signed out).
    async fn credential(&self) -> Result<Option<String>, TransportError>;

    /// Push a credential to the live connection without reconnecting.
    fn set_auth(&self, token: &str);

    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Create a channel for `key`. The channel is inert until
    /// [`RawChannel::subscribe`] is called.
    fn channel(&self, key: &ChannelKey) -> Box<dyn RawChannel>;
}

/// One logical channel on the physical connection.
///
/// Listeners must be attached with [`RawChannel::on_event`] before
/// [`RawChannel::subscribe`]; listeners attached to a live channel may never
/// see a delivery.
pub trait RawChannel: Send {
    fn on_event(&mut self, kind: EventKind, listener: EventListener);

    /// Tell the channel to go live. Status changes (including the initial
    /// `SUBSCRIBED`) are reported to `on_status`, possibly before this returns.
    fn subscribe(&mut self, on_status: RawStatusListener);

    /// Tear the channel down. May report a final `CLOSED`.
    fn unsubscribe(&mut self);
}
