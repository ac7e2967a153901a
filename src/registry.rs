//! Channel multiplexer and subscription registry
//!
//! Many logical subscriptions share one raw channel per [`ChannelKey`]. The
//! registry owns two maps: channels by key and subscription records by id.
//! Both are only mutated while the registry lock is held, and callbacks are
//! never invoked under that lock: targets are collected first, the lock is
//! released, then every callback runs behind its own panic guard.

use crate::channel::{
    ChangeEvent, ChannelKey, ChannelStatus, CloseReason, EventKind, StatusChangeMeta,
    StatusUpdate,
};
use crate::config::RealtimeConfig;
use crate::error::TransportError;
use crate::retry::{CancelFlag, RetryController, RetryDecision, RetryPolicy};
use crate::session::{ConnectOptions, TransportSession};
use crate::transport::{RawChannel, TransportBackend};
use crate::{Spawner, lock};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub type SubscriptionId = u64;

/// Receives every matching row change.
pub type DeliverFn = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Receives every status change of the subscription's channel.
pub type StatusFn = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Error text reported once a subscription runs out of retries.
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// Arguments for [`RealtimeClient::subscribe`].
#[derive(Clone)]
pub struct SubscribeRequest {
    pub key: ChannelKey,
    pub kind: EventKind,
    pub deliver: DeliverFn,
    pub on_status: StatusFn,
}

impl SubscribeRequest {
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            kind: EventKind::All,
            deliver: Arc::new(|_: &ChangeEvent| {}),
            on_status: Arc::new(|_: &StatusUpdate| {}),
        }
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn on_event(mut self, deliver: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.deliver = Arc::new(deliver);
        self
    }

    pub fn on_status(mut self, on_status: impl Fn(&StatusUpdate) + Send + Sync + 'static) -> Self {
        self.on_status = Arc::new(on_status);
        self
    }
}

/// Read-only view of one multiplexed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel_id: u64,
    pub ref_count: usize,
    pub last_status: Option<ChannelStatus>,
    pub last_error: Option<String>,
    pub closed: bool,
}

struct ChannelInfo {
    channel_id: u64,
    /// `None` while the channel is being opened
    raw: Option<Box<dyn RawChannel>>,
    subscriber_ids: BTreeSet<SubscriptionId>,
    last_status: Option<ChannelStatus>,
    last_error: Option<String>,
    /// Set once, when the first terminal status is processed
    closed: bool,
}

impl ChannelInfo {
    fn ref_count(&self) -> usize {
        self.subscriber_ids.len()
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id,
            ref_count: self.ref_count(),
            last_status: self.last_status,
            last_error: self.last_error.clone(),
            closed: self.closed,
        }
    }
}

struct SubscriptionRecord {
    key: ChannelKey,
    kind: EventKind,
    deliver: DeliverFn,
    on_status: StatusFn,
    /// Channel currently serving this subscription; `None` while awaiting a retry
    channel_id: Option<u64>,
    attempt: u32,
    cancel: CancelFlag,
}

struct Registry {
    channels: HashMap<ChannelKey, ChannelInfo>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
    next_subscription: SubscriptionId,
    next_channel: u64,
    hidden: bool,
}

impl Registry {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
            next_channel: 0,
            hidden: false,
        }
    }

    /// Live channel for `key`, provided it is still the one with `channel_id`.
    fn channel_mut(&mut self, key: &ChannelKey, channel_id: u64) -> Option<&mut ChannelInfo> {
        self.channels
            .get_mut(key)
            .filter(|info| info.channel_id == channel_id)
    }

    fn status_targets(&self, ids: &[SubscriptionId]) -> Vec<(SubscriptionId, StatusFn)> {
        ids.iter()
            .filter_map(|id| {
                self.subscriptions
                    .get(id)
                    .map(|rec| (*id, Arc::clone(&rec.on_status)))
            })
            .collect()
    }
}

struct ClientInner {
    session: TransportSession,
    retries: RetryController,
    registry: Mutex<Registry>,
    spawner: Spawner,
}

/// Entry point to the realtime layer: session, multiplexer and retries.
///
/// Cheap to clone; all clones share the same channels and subscriptions.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

/// Keeps a subscription alive. Unsubscribes on [`unsubscribe`] or drop.
///
/// [`unsubscribe`]: SubscriptionHandle::unsubscribe
pub struct SubscriptionHandle {
    id: SubscriptionId,
    client: Weak<ClientInner>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

/// Run one subscriber callback; a panic is logged and contained.
fn guarded(what: &'static str, id: SubscriptionId, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            subscription = id,
            "{what} callback panicked: {}",
            panic_message(&*payload)
        );
    }
}

fn notify(targets: &[(SubscriptionId, StatusFn)], update: &StatusUpdate) {
    for (id, on_status) in targets {
        guarded("status", *id, || on_status(update));
    }
}

impl RealtimeClient {
    pub fn new(backend: Arc<dyn TransportBackend>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session: TransportSession::new(backend),
                retries: RetryController::new(policy),
                registry: Mutex::new(Registry::new()),
                spawner: Spawner::capture(),
            }),
        }
    }

    pub fn from_config(backend: Arc<dyn TransportBackend>, config: &RealtimeConfig) -> Self {
        Self::new(backend, config.retry_policy())
    }

    /// Run background work for resources on the client's runtime.
    pub(crate) fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.spawner.spawn(future)
    }

    pub fn session(&self) -> &TransportSession {
        &self.inner.session
    }

    pub fn generation(&self) -> u64 {
        self.inner.session.generation()
    }

    pub fn increment_generation(&self) -> u64 {
        self.inner.session.increment_generation()
    }

    pub fn is_generation_valid(&self, generation: u64) -> bool {
        self.inner.session.is_generation_valid(generation)
    }

    pub async fn ensure_connected(&self, opts: ConnectOptions) -> Result<(), TransportError> {
        self.inner.session.ensure_connected(opts).await
    }

    /// Register a subscription, opening the channel for its key if needed.
    ///
    /// A subscriber joining a channel that already reported a status gets that
    /// status replayed immediately.
    pub fn subscribe(&self, request: SubscribeRequest) -> SubscriptionHandle {
        let id = {
            let mut reg = lock(&self.inner.registry);
            reg.next_subscription += 1;
            let id = reg.next_subscription;
            reg.subscriptions.insert(
                id,
                SubscriptionRecord {
                    key: request.key,
                    kind: request.kind,
                    deliver: request.deliver,
                    on_status: request.on_status,
                    channel_id: None,
                    attempt: 0,
                    cancel: CancelFlag::new(),
                },
            );
            id
        };
        ClientInner::attach(&self.inner, id);
        SubscriptionHandle {
            id,
            client: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Remove a subscription by id. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    pub fn channel(&self, key: &ChannelKey) -> Option<ChannelSnapshot> {
        lock(&self.inner.registry)
            .channels
            .get(key)
            .map(ChannelInfo::snapshot)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.registry).channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.registry).subscriptions.len()
    }

    /// Number of subscriptions waiting on a retry timer.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.pending_count()
    }

    /// Tear everything down with an expected close and start a new generation.
    pub fn cleanup(&self) {
        self.inner.teardown_all(CloseReason::Cleanup);
        self.inner.session.announce_generation();
    }

    /// Intentional reset: tear down with `reason`, start a new generation and
    /// force a fresh connection. Mounted resources resubscribe on their own
    /// once the new connection is up.
    pub async fn reset(&self, reason: CloseReason) -> Result<(), TransportError> {
        self.inner.teardown_all(reason);
        let result = self
            .inner
            .session
            .ensure_connected(ConnectOptions::force())
            .await;
        self.inner.session.announce_generation();
        result
    }

    pub async fn handle_auth_change(&self) -> Result<(), TransportError> {
        info!("auth changed, resetting realtime channels");
        self.reset(CloseReason::AuthChange).await
    }

    /// Page visibility changed. Regaining visibility with a dead transport
    /// triggers a full reset.
    pub async fn handle_visibility(&self, visible: bool) -> Result<(), TransportError> {
        let was_hidden = {
            let mut reg = lock(&self.inner.registry);
            std::mem::replace(&mut reg.hidden, !visible)
        };
        if visible && was_hidden && !self.inner.session.is_connected() {
            info!("visible again with a dead transport, resetting");
            return self.reset(CloseReason::Cleanup).await;
        }
        Ok(())
    }

    /// Cleanup followed by a transport disconnect.
    pub async fn dispose(&self) {
        self.cleanup();
        self.inner.session.disconnect().await;
    }
}

impl ClientInner {
    /// Point subscription `id` at the channel for its key, creating the
    /// channel if none is live.
    fn attach(self: &Arc<Self>, id: SubscriptionId) {
        let generation = self.session.generation();
        let mut reg = lock(&self.registry);
        let Some(key) = reg.subscriptions.get(&id).map(|rec| rec.key.clone()) else {
            return;
        };

        if let Some(info) = reg.channels.get_mut(&key) {
            info.subscriber_ids.insert(id);
            let channel_id = info.channel_id;
            let ref_count = info.ref_count();
            let replay = info
                .last_status
                .filter(|s| *s == ChannelStatus::Subscribed || s.is_terminal())
                .map(|status| StatusUpdate {
                    status,
                    error: info.last_error.clone(),
                    meta: if status.is_terminal() {
                        StatusChangeMeta::closed(generation, CloseReason::Unexpected)
                    } else {
                        StatusChangeMeta::live(generation)
                    },
                });
            let on_status = reg.subscriptions.get_mut(&id).map(|rec| {
                rec.channel_id = Some(channel_id);
                if replay.as_ref().is_some_and(|u| u.status == ChannelStatus::Subscribed) {
                    rec.attempt = 0;
                }
                Arc::clone(&rec.on_status)
            });
            drop(reg);

            debug!(channel = %key, subscription = id, ref_count, "joined shared channel");
            if let (Some(update), Some(on_status)) = (replay, on_status) {
                trace!(channel = %key, status = %update.status, "replaying status to late joiner");
                guarded("status", id, || on_status(&update));
            }
            return;
        }

        reg.next_channel += 1;
        let channel_id = reg.next_channel;
        reg.channels.insert(
            key.clone(),
            ChannelInfo {
                channel_id,
                raw: None,
                subscriber_ids: BTreeSet::from([id]),
                last_status: None,
                last_error: None,
                closed: false,
            },
        );
        if let Some(rec) = reg.subscriptions.get_mut(&id) {
            rec.channel_id = Some(channel_id);
        }
        drop(reg);
        self.open_channel(key, channel_id);
    }

    /// Create the raw channel, attach the single fan-out listener, then go live.
    fn open_channel(self: &Arc<Self>, key: ChannelKey, channel_id: u64) {
        let mut raw = self.session.backend().channel(&key);

        let weak = Arc::downgrade(self);
        let event_key = key.clone();
        raw.on_event(
            EventKind::All,
            Arc::new(move |event: &ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_event(&event_key, channel_id, event);
                }
            }),
        );

        let weak = Arc::downgrade(self);
        let status_key = key.clone();
        raw.subscribe(Arc::new(move |status: ChannelStatus, error: Option<String>| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_status(&status_key, channel_id, status, error);
            }
        }));

        let leftover = {
            let mut reg = lock(&self.registry);
            match reg.channel_mut(&key, channel_id) {
                Some(info) => {
                    info.raw = Some(raw);
                    None
                }
                None => Some(raw),
            }
        };
        match leftover {
            Some(mut raw) => {
                debug!(channel = %key, channel_id, "channel went away while opening");
                raw.unsubscribe();
            }
            None => info!(channel = %key, channel_id, "channel opened"),
        }
    }

    fn dispatch_event(&self, key: &ChannelKey, channel_id: u64, event: &ChangeEvent) {
        let targets: Vec<(SubscriptionId, DeliverFn)> = {
            let mut reg = lock(&self.registry);
            let ids: Vec<SubscriptionId> = match reg.channel_mut(key, channel_id) {
                Some(info) if !info.closed => info.subscriber_ids.iter().copied().collect(),
                _ => return,
            };
            ids.into_iter()
                .filter_map(|id| {
                    reg.subscriptions
                        .get(&id)
                        .filter(|rec| rec.kind.accepts(event.kind))
                        .map(|rec| (id, Arc::clone(&rec.deliver)))
                })
                .collect()
        };
        trace!(channel = %key, kind = ?event.kind, subscribers = targets.len(), "delivering event");
        for (id, deliver) in &targets {
            guarded("deliver", *id, || deliver(event));
        }
    }

    fn handle_status(
        self: &Arc<Self>,
        key: &ChannelKey,
        channel_id: u64,
        status: ChannelStatus,
        error: Option<String>,
    ) {
        if status.is_terminal() {
            self.handle_terminal(key, channel_id, status, error);
            return;
        }

        let targets = {
            let mut reg = lock(&self.registry);
            let Some(info) = reg.channel_mut(key, channel_id) else {
                trace!(channel = %key, channel_id, %status, "status for retired channel ignored");
                return;
            };
            if info.closed {
                return;
            }
            info.last_status = Some(status);
            info.last_error = error.clone();
            let ids: Vec<SubscriptionId> = info.subscriber_ids.iter().copied().collect();
            if status == ChannelStatus::Subscribed {
                for id in &ids {
                    if let Some(rec) = reg.subscriptions.get_mut(id) {
                        rec.attempt = 0;
                    }
                }
            }
            reg.status_targets(&ids)
        };

        if status == ChannelStatus::Subscribed {
            self.session.mark_connected(true);
        }
        debug!(channel = %key, %status, subscribers = targets.len(), "channel status");
        let update = StatusUpdate {
            status,
            error,
            meta: StatusChangeMeta::live(self.session.generation()),
        };
        notify(&targets, &update);
    }

    /// CLOSED / CHANNEL_ERROR / TIMED_OUT reported by the transport.
    fn handle_terminal(
        self: &Arc<Self>,
        key: &ChannelKey,
        channel_id: u64,
        status: ChannelStatus,
        error: Option<String>,
    ) {
        let targets = {
            let mut reg = lock(&self.registry);
            let Some(info) = reg.channel_mut(key, channel_id) else {
                trace!(channel = %key, channel_id, %status, "terminal status for retired channel ignored");
                return;
            };
            if info.closed {
                return;
            }
            info.closed = true;
            info.last_status = Some(status);
            info.last_error = error.clone();
            let ids: Vec<SubscriptionId> = info.subscriber_ids.iter().copied().collect();
            reg.status_targets(&ids)
        };

        warn!(channel = %key, %status, error = error.as_deref().unwrap_or(""), "channel failed");
        self.session.mark_connected(false);
        let generation = self.session.generation();
        let update = StatusUpdate {
            status,
            error,
            meta: StatusChangeMeta::closed(generation, CloseReason::Unexpected),
        };
        notify(&targets, &update);

        // Retire the channel so the next subscribe() builds a fresh one.
        // Anyone who joined during the broadcast is retired along with it.
        let (raw, detached) = {
            let mut reg = lock(&self.registry);
            if reg.channel_mut(key, channel_id).is_none() {
                return;
            }
            let Some(info) = reg.channels.remove(key) else {
                return;
            };
            let detached: Vec<(SubscriptionId, u32, CancelFlag, StatusFn)> = info
                .subscriber_ids
                .iter()
                .filter_map(|id| {
                    let rec = reg.subscriptions.get_mut(id)?;
                    rec.channel_id = None;
                    rec.attempt += 1;
                    Some((*id, rec.attempt, rec.cancel.clone(), Arc::clone(&rec.on_status)))
                })
                .collect();
            (info.raw, detached)
        };
        if let Some(mut raw) = raw {
            raw.unsubscribe();
        }

        for (id, attempt, cancel, on_status) in detached {
            self.schedule_retry(id, attempt, generation, &cancel, &on_status);
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        id: SubscriptionId,
        attempt: u32,
        generation: u64,
        cancel: &CancelFlag,
        on_status: &StatusFn,
    ) {
        let weak = Arc::downgrade(self);
        let decision = self.retries.schedule(id, attempt, cancel, move || {
            if let Some(inner) = weak.upgrade() {
                inner.retry_fired(id, generation);
            }
        });
        let update = match decision {
            RetryDecision::Scheduled { attempt, .. } => StatusUpdate {
                status: ChannelStatus::Retrying,
                error: None,
                meta: StatusChangeMeta {
                    attempt,
                    ..StatusChangeMeta::live(generation)
                },
            },
            RetryDecision::Exhausted => {
                warn!(subscription = id, attempt, "giving up on channel");
                StatusUpdate {
                    status: ChannelStatus::ChannelError,
                    error: Some(RETRIES_EXHAUSTED.to_string()),
                    meta: StatusChangeMeta {
                        attempt,
                        retries_exhausted: true,
                        ..StatusChangeMeta::closed(generation, CloseReason::Unexpected)
                    },
                }
            }
            RetryDecision::Cancelled => return,
        };
        guarded("status", id, || on_status(&update));
    }

    fn retry_fired(self: &Arc<Self>, id: SubscriptionId, generation: u64) {
        if !self.session.is_generation_valid(generation) {
            debug!(subscription = id, generation, "retry from previous generation dropped");
            return;
        }
        let current = {
            let reg = lock(&self.registry);
            reg.subscriptions.get(&id).map(|rec| {
                !rec.cancel.is_cancelled() && rec.channel_id.is_none()
            })
        };
        if current != Some(true) {
            trace!(subscription = id, "retry target no longer waiting");
            return;
        }
        debug!(subscription = id, "retrying subscription");
        self.attach(id);
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let raw = {
            let mut reg = lock(&self.registry);
            let Some(rec) = reg.subscriptions.remove(&id) else {
                return false;
            };
            rec.cancel.cancel();
            self.retries.cancel(id);

            let Some(channel_id) = rec.channel_id else {
                debug!(subscription = id, "unsubscribed while detached");
                return true;
            };
            let Some(info) = reg.channel_mut(&rec.key, channel_id) else {
                return true;
            };
            info.subscriber_ids.remove(&id);
            if info.ref_count() > 0 {
                debug!(channel = %rec.key, ref_count = info.ref_count(), "subscriber left shared channel");
                return true;
            }
            reg.channels
                .remove(&rec.key)
                .map(|info| (rec.key, info.raw))
        };

        if let Some((key, raw)) = raw {
            info!(channel = %key, "last subscriber left, closing channel");
            if let Some(mut raw) = raw {
                raw.unsubscribe();
            }
        }
        true
    }

    /// Drop every channel and subscription and advance the generation.
    /// Generation watchers are woken by the caller.
    fn teardown_all(&self, reason: CloseReason) {
        let (channels, records) = {
            let mut reg = lock(&self.registry);
            let channels: Vec<(ChannelKey, ChannelInfo)> = reg.channels.drain().collect();
            let records: Vec<(SubscriptionId, SubscriptionRecord)> =
                reg.subscriptions.drain().collect();
            (channels, records)
        };
        for (_, rec) in &records {
            rec.cancel.cancel();
        }
        self.retries.cancel_all();

        let generation = self.session.generation();
        info!(
            ?reason,
            generation,
            channels = channels.len(),
            subscriptions = records.len(),
            "tearing down realtime channels"
        );
        let update = StatusUpdate {
            status: ChannelStatus::Closed,
            error: None,
            meta: StatusChangeMeta::closed(generation, reason),
        };
        for (id, rec) in &records {
            guarded("status", *id, || (rec.on_status)(&update));
        }
        for (_, info) in channels {
            if let Some(mut raw) = info.raw {
                raw.unsubscribe();
            }
        }
        self.session.mark_connected(false);
        self.session.advance_generation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Memory backend whose disconnect takes a while.
    struct SlowDisconnect(MemoryBackend);

    #[async_trait]
    impl TransportBackend for SlowDisconnect {
        async fn credential(&self) -> Result<Option<String>, TransportError> {
            self.0.credential().await
        }

        fn set_auth(&self, token: &str) {
            self.0.set_auth(token);
        }

        async fn connect(&self) -> Result<(), TransportError> {
            self.0.connect().await
        }

        async fn disconnect(&self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.disconnect().await;
        }

        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }

        fn channel(&self, key: &ChannelKey) -> Box<dyn RawChannel> {
            self.0.channel(key)
        }
    }

    fn key() -> ChannelKey {
        ChannelKey::eq("chat_messages", "project_id", "P1")
    }

    fn client(backend: &MemoryBackend) -> RealtimeClient {
        RealtimeClient::new(
            Arc::new(backend.clone()),
            RetryPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(400),
                max_retries: 2,
            },
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<StatusUpdate>>>, impl Fn(&StatusUpdate) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |update: &StatusUpdate| {
            sink.lock().unwrap().push(update.clone())
        })
    }

    fn statuses(seen: &Arc<Mutex<Vec<StatusUpdate>>>) -> Vec<ChannelStatus> {
        seen.lock().unwrap().iter().map(|u| u.status).collect()
    }

    fn counting(hits: &Arc<AtomicUsize>) -> impl Fn(&ChangeEvent) + Send + Sync + 'static {
        let hits = Arc::clone(hits);
        move |_: &ChangeEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn shared_channel_ref_counting() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let first = client.subscribe(SubscribeRequest::new(key()).on_event(counting(&first_hits)));
        let second = client.subscribe(SubscribeRequest::new(key()).on_event(counting(&second_hits)));

        assert_eq!(backend.opened_channel_count(), 1);
        assert_eq!(client.channel(&key()).unwrap().ref_count, 2);

        first.unsubscribe();
        assert_eq!(client.channel(&key()).unwrap().ref_count, 1);
        assert_eq!(backend.teardown_count(), 0);

        backend.emit(&key(), ChangeEvent::insert("chat_messages", json!({"id": "m1"})));
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);

        second.unsubscribe();
        assert!(client.channel(&key()).is_none());
        assert_eq!(backend.teardown_count(), 1);
        assert_eq!(client.subscription_count(), 0);
    }

    #[test]
    fn drop_unsubscribes_once() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let handle = client.subscribe(SubscribeRequest::new(key()));
        let id = handle.id();
        drop(handle);
        assert!(client.channel(&key()).is_none());
        assert!(!client.unsubscribe(id));
        assert_eq!(backend.teardown_count(), 1);
    }

    #[test]
    fn event_kind_filtering() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let inserts = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        let _a = client.subscribe(
            SubscribeRequest::new(key())
                .kind(EventKind::Insert)
                .on_event(counting(&inserts)),
        );
        let _b = client.subscribe(
            SubscribeRequest::new(key())
                .kind(EventKind::Delete)
                .on_event(counting(&deletes)),
        );
        assert_eq!(backend.opened_channel_count(), 1);

        backend.emit(&key(), ChangeEvent::insert("chat_messages", json!({"id": "1"})));
        backend.emit(&key(), ChangeEvent::delete("chat_messages", json!({"id": "1"})));
        backend.emit(&key(), ChangeEvent::update("chat_messages", json!({"id": "1"})));
        assert_eq!(inserts.load(Ordering::SeqCst), 1);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = client.subscribe(
            SubscribeRequest::new(key()).on_event(|_| panic!("subscriber bug")),
        );
        let _good = client.subscribe(SubscribeRequest::new(key()).on_event(counting(&hits)));

        backend.emit(&key(), ChangeEvent::insert("chat_messages", json!({"id": "1"})));
        backend.emit(&key(), ChangeEvent::insert("chat_messages", json!({"id": "2"})));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_joiner_gets_subscribed_replay() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (first_seen, first_cb) = recorder();
        let _first = client.subscribe(SubscribeRequest::new(key()).on_status(first_cb));
        assert_eq!(statuses(&first_seen), vec![ChannelStatus::Subscribed]);

        let (late_seen, late_cb) = recorder();
        let _late = client.subscribe(SubscribeRequest::new(key()).on_status(late_cb));
        assert_eq!(statuses(&late_seen), vec![ChannelStatus::Subscribed]);
        // The first subscriber is not notified again.
        assert_eq!(statuses(&first_seen).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_latches_and_retires_channel() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));
        let first_id = client.channel(&key()).unwrap().channel_id;

        backend.emit_status(&key(), ChannelStatus::ChannelError, Some("boom".into()));
        assert!(client.channel(&key()).is_none());

        let updates = seen.lock().unwrap().clone();
        assert_eq!(updates[1].status, ChannelStatus::ChannelError);
        assert_eq!(updates[1].error.as_deref(), Some("boom"));
        assert_eq!(updates[1].meta.close_reason, Some(CloseReason::Unexpected));
        assert!(!updates[1].meta.is_expected_close);
        assert_eq!(updates[2].status, ChannelStatus::Retrying);
        assert_eq!(updates[2].meta.attempt, 1);
        // The teardown of the dead channel reports nothing further.
        assert_eq!(updates.len(), 3);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = client.channel(&key()).unwrap();
        assert_ne!(fresh.channel_id, first_id);
        assert_eq!(fresh.last_status, Some(ChannelStatus::Subscribed));
        assert_eq!(statuses(&seen).last(), Some(&ChannelStatus::Subscribed));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_terminal_status_processed_once() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        let channel_id = client.channel(&key()).unwrap().channel_id;
        client.inner.handle_status(&key(), channel_id, ChannelStatus::Closed, None);
        client.inner.handle_status(&key(), channel_id, ChannelStatus::Closed, None);

        let closed = statuses(&seen)
            .into_iter()
            .filter(|s| *s == ChannelStatus::Closed)
            .count();
        assert_eq!(closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_terminal_error() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        // Every reconnect attempt fails.
        for _ in 0..3 {
            backend.fail_next_subscribe(ChannelStatus::TimedOut, None);
        }
        backend.emit_status(&key(), ChannelStatus::Closed, None);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let updates = seen.lock().unwrap().clone();
        let last = updates.last().unwrap();
        assert_eq!(last.status, ChannelStatus::ChannelError);
        assert_eq!(last.error.as_deref(), Some(RETRIES_EXHAUSTED));
        assert!(last.meta.retries_exhausted);
        let retrying = updates
            .iter()
            .filter(|u| u.status == ChannelStatus::Retrying)
            .count();
        assert_eq!(retrying, 2);
        assert_eq!(client.pending_retries(), 0);
        assert_eq!(client.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_cancels_pending_retry() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let sub = client.subscribe(SubscribeRequest::new(key()));
        backend.emit_status(&key(), ChannelStatus::TimedOut, None);
        assert_eq!(client.pending_retries(), 1);

        sub.unsubscribe();
        assert_eq!(client.pending_retries(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.channel(&key()).is_none());
        assert_eq!(backend.opened_channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_reports_expected_close_and_bumps_generation() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        client.cleanup();
        assert_eq!(client.generation(), 1);
        assert_eq!(client.channel_count(), 0);
        assert_eq!(client.subscription_count(), 0);
        assert_eq!(backend.teardown_count(), 1);

        let updates = seen.lock().unwrap().clone();
        let last = updates.last().unwrap();
        assert_eq!(last.status, ChannelStatus::Closed);
        assert_eq!(last.meta.close_reason, Some(CloseReason::Cleanup));
        assert!(last.meta.is_expected_close);
        assert_eq!(last.meta.generation, 0);
    }

    #[tokio::test]
    async fn visibility_regain_resets_dead_transport() {
        let backend = MemoryBackend::with_credential("tok");
        let client = client(&backend);
        client
            .ensure_connected(ConnectOptions::ensure_only())
            .await
            .unwrap();
        let _sub = client.subscribe(SubscribeRequest::new(key()));

        client.handle_visibility(false).await.unwrap();
        backend.set_connected(false);
        client.handle_visibility(true).await.unwrap();

        assert_eq!(client.generation(), 1);
        assert_eq!(client.channel_count(), 0);
        assert!(client.session().is_connected());

        // Visible again while healthy: no reset.
        client.handle_visibility(false).await.unwrap();
        client.handle_visibility(true).await.unwrap();
        assert_eq!(client.generation(), 1);
    }

    #[test]
    fn unsubscribe_from_inside_callback() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let reentrant = client.clone();
        let target = Arc::clone(&slot);
        let handle = client.subscribe(SubscribeRequest::new(key()).on_event(move |_| {
            if let Some(id) = *target.lock().unwrap() {
                reentrant.unsubscribe(id);
            }
        }));
        *slot.lock().unwrap() = Some(handle.id());

        backend.emit(&key(), ChangeEvent::insert("chat_messages", json!({"id": "1"})));
        assert!(client.channel(&key()).is_none());
        drop(handle);
        assert_eq!(backend.teardown_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_survives_generation_bump() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        client.increment_generation();
        backend.emit_status(&key(), ChannelStatus::Closed, None);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.opened_channel_count(), 2);
        assert_eq!(client.channel(&key()).unwrap().ref_count, 1);
        assert_eq!(statuses(&seen).last(), Some(&ChannelStatus::Subscribed));
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_during_failure_broadcast_gets_terminal_replay() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (late_seen, late_cb) = recorder();
        let late_cb = Arc::new(late_cb);
        let joined: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let reentrant = client.clone();
        let slot = Arc::clone(&joined);
        let _first = client.subscribe(SubscribeRequest::new(key()).on_status(move |update| {
            if !update.status.is_terminal() {
                return;
            }
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                let cb = Arc::clone(&late_cb);
                *slot = Some(reentrant.subscribe(
                    SubscribeRequest::new(key()).on_status(move |u: &StatusUpdate| cb(u)),
                ));
            }
        }));

        backend.emit_status(&key(), ChannelStatus::ChannelError, Some("boom".into()));
        assert!(joined.lock().unwrap().is_some());
        let updates = late_seen.lock().unwrap().clone();
        assert_eq!(updates[0].status, ChannelStatus::ChannelError);
        assert_eq!(updates[0].error.as_deref(), Some("boom"));
        assert!(!updates[0].meta.is_expected_close);
        assert_eq!(updates[1].status, ChannelStatus::Retrying);
        assert!(client.channel(&key()).is_none());
        assert_eq!(client.pending_retries(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.opened_channel_count(), 2);
        assert_eq!(client.channel(&key()).unwrap().ref_count, 2);
        assert_eq!(statuses(&late_seen).last(), Some(&ChannelStatus::Subscribed));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_announces_generation_after_reconnect() {
        let backend = MemoryBackend::with_credential("tok");
        let client = RealtimeClient::new(
            Arc::new(SlowDisconnect(backend.clone())),
            RetryPolicy::default(),
        );
        let mut generations = client.session().watch_generation();

        let resetting = client.clone();
        let task = tokio::spawn(async move { resetting.reset(CloseReason::AuthChange).await });
        tokio::task::yield_now().await;

        // Torn down and invalidated, but watchers wait for the new connection.
        assert_eq!(client.generation(), 1);
        assert!(!client.is_generation_valid(0));
        assert!(!generations.has_changed().unwrap());
        assert_eq!(backend.connect_count(), 0);

        task.await.unwrap().unwrap();
        assert!(generations.has_changed().unwrap());
        assert_eq!(*generations.borrow_and_update(), 1);
        assert_eq!(backend.connect_count(), 1);
        assert!(client.session().is_connected());
    }

    #[test]
    fn retry_from_outside_runtime_uses_captured_handle() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let backend = MemoryBackend::new();
        let client = {
            let _guard = rt.enter();
            client(&backend)
        };
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        backend.emit_status(&key(), ChannelStatus::ChannelError, None);
        assert_eq!(client.pending_retries(), 1);
        assert_eq!(statuses(&seen).last(), Some(&ChannelStatus::Retrying));

        rt.block_on(async { tokio::time::sleep(Duration::from_millis(150)).await });
        assert_eq!(backend.opened_channel_count(), 2);
        assert_eq!(statuses(&seen).last(), Some(&ChannelStatus::Subscribed));
    }

    #[test]
    fn retry_without_any_runtime_gives_up() {
        let backend = MemoryBackend::new();
        let client = client(&backend);
        let (seen, cb) = recorder();
        let _sub = client.subscribe(SubscribeRequest::new(key()).on_status(cb));

        backend.emit_status(&key(), ChannelStatus::TimedOut, None);
        let updates = seen.lock().unwrap().clone();
        let last = updates.last().unwrap();
        assert_eq!(last.status, ChannelStatus::ChannelError);
        assert!(last.meta.retries_exhausted);
        assert_eq!(client.pending_retries(), 0);
    }
}
