//! Resource reconciliation engine
//!
//! A [`RealtimeResource`] keeps one id-keyed list consistent with the backend
//! by combining an authoritative snapshot fetch with the live increment stream
//! of its channel. Fetches are throttled, guarded by an in-flight flag and
//! versioned; every async resumption point (fetch completion, catch-up timer,
//! status callback) re-checks the active flag and the session generation
//! before touching state.

pub mod state;

pub use state::{Record, ResourceAction, ResourceState};

use crate::channel::{ChangeEvent, ChannelKey, ChannelStatus, EventKind, StatusUpdate};
use crate::config::RealtimeConfig;
use crate::error::{FetchError, TransportError};
use crate::lock;
use crate::registry::{RETRIES_EXHAUSTED, RealtimeClient, SubscribeRequest, SubscriptionHandle};
use crate::session::ConnectOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Snapshot fetching
// ---------------------------------------------------------------------------

/// Source of authoritative snapshots for one resource.
#[async_trait]
pub trait SnapshotFetcher<T>: Send + Sync {
    async fn fetch(&self, scope_id: Option<&str>) -> Result<Vec<T>, FetchError>;
}

/// Adapts an async closure into a [`SnapshotFetcher`].
pub struct FnFetcher<F>(F);

#[async_trait]
impl<T, F, Fut> SnapshotFetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
{
    async fn fetch(&self, scope_id: Option<&str>) -> Result<Vec<T>, FetchError> {
        (self.0)(scope_id.map(str::to_owned)).await
    }
}

pub fn fetch_fn<T, F, Fut>(f: F) -> Arc<dyn SnapshotFetcher<T>>
where
    T: Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Predicate deciding whether a decoded row belongs to the resource.
pub type AcceptFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Describes one live resource: where its rows live and how to fetch them.
pub struct ResourceConfig<T> {
    pub table: String,
    /// Column the scope id filters on (`project_id`, `task_id`, ...)
    pub scope_column: Option<String>,
    pub scope_id: Option<String>,
    /// Event kinds to subscribe to; one logical subscription per kind
    pub events: Vec<EventKind>,
    pub throttle: Duration,
    pub catch_up_delay: Duration,
    pub fetcher: Arc<dyn SnapshotFetcher<T>>,
    /// Rows rejected here are dropped (or removed if already present)
    pub accept: Option<AcceptFn<T>>,
}

impl<T> Clone for ResourceConfig<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            scope_column: self.scope_column.clone(),
            scope_id: self.scope_id.clone(),
            events: self.events.clone(),
            throttle: self.throttle,
            catch_up_delay: self.catch_up_delay,
            fetcher: Arc::clone(&self.fetcher),
            accept: self.accept.clone(),
        }
    }
}

impl<T> ResourceConfig<T> {
    pub fn new(table: impl Into<String>, fetcher: Arc<dyn SnapshotFetcher<T>>) -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            table: table.into(),
            scope_column: None,
            scope_id: None,
            events: vec![EventKind::All],
            throttle: defaults.throttle(),
            catch_up_delay: defaults.catch_up_delay(),
            fetcher,
            accept: None,
        }
    }

    pub fn scoped(mut self, column: impl Into<String>, scope_id: Option<String>) -> Self {
        self.scope_column = Some(column.into());
        self.scope_id = scope_id;
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn catch_up_delay(mut self, delay: Duration) -> Self {
        self.catch_up_delay = delay;
        self
    }

    /// Take throttle and catch-up timings from a loaded config.
    pub fn tuned(self, config: &RealtimeConfig) -> Self {
        self.throttle(config.throttle())
            .catch_up_delay(config.catch_up_delay())
    }

    pub fn accept(mut self, accept: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.accept = Some(Arc::new(accept));
        self
    }

    /// Channel serving `scope_id`. Without a scope column the whole table is
    /// subscribed.
    pub fn channel_key(&self, scope_id: Option<&str>) -> ChannelKey {
        match (&self.scope_column, scope_id) {
            (Some(column), Some(scope)) => ChannelKey::eq(&self.table, column, scope),
            _ => ChannelKey::new(&self.table, None),
        }
    }
}

// ---------------------------------------------------------------------------
// Refresh options and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    /// Runs even while another fetch is in flight
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Bypass the throttle window
    pub force: bool,
    pub priority: Priority,
}

impl RefreshOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            priority: Priority::Normal,
        }
    }

    /// Options used for the refresh that follows `SUBSCRIBED`.
    pub fn catch_up() -> Self {
        Self {
            force: true,
            priority: Priority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    InFlight,
    Throttled,
}

/// What a [`RealtimeResource::refresh`] call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Snapshot applied; `items` is the number of rows received
    Applied { items: usize },
    Skipped(SkipReason),
    /// A newer fetch started, the generation moved or the resource unmounted
    Discarded,
    Failed,
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Everything a view renders for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceView<T> {
    pub data: Vec<T>,
    pub is_loading: bool,
    pub is_connected: bool,
    /// Last snapshot fetch error
    pub error: Option<String>,
    /// Set once the channel gave up retrying
    pub connection_error: Option<String>,
}

impl<T> Default for ResourceView<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            is_loading: false,
            is_connected: false,
            error: None,
            connection_error: None,
        }
    }
}

/// One change to a resource's item set, reported in the order it was applied.
#[derive(Debug)]
pub enum ResourceChange<'a, T> {
    /// A snapshot replaced every item
    Snapshot(&'a [T]),
    /// One item was inserted or modified
    Upsert(&'a T),
    Remove(&'a str),
}

impl<T> Clone for ResourceChange<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceChange<'_, T> {}

/// Observer of applied changes; runs outside the engine lock.
pub type ChangeFn<T> = Arc<dyn Fn(ResourceChange<'_, T>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine<T> {
    resource: ResourceState<T>,
    scope_id: Option<String>,
    mounted: bool,
    subscriptions: Vec<SubscriptionHandle>,
    is_connected: bool,
    connection_error: Option<String>,
    /// Set by the first unexpected terminal status, cleared by `SUBSCRIBED`.
    /// `RETRYING` in between does not clear it.
    failing: bool,
    catch_up_pending: bool,
    catch_up: Option<JoinHandle<()>>,
    generation_watch: Option<JoinHandle<()>>,
    in_flight: bool,
    last_fetch_started: Option<Instant>,
}

impl<T> Engine<T> {
    fn cancel_catch_up(&mut self) {
        self.catch_up_pending = false;
        if let Some(task) = self.catch_up.take() {
            task.abort();
        }
    }
}

enum StatusFollowUp {
    None,
    CatchUp,
    Fallback,
}

struct Inner<T> {
    client: RealtimeClient,
    config: ResourceConfig<T>,
    engine: Mutex<Engine<T>>,
    active: AtomicBool,
    version: AtomicU64,
    view: watch::Sender<ResourceView<T>>,
    observers: Mutex<Vec<ChangeFn<T>>>,
}

/// Snapshot-plus-increments state for one `(resource, scope)` pair.
///
/// Cheap to clone; clones share the same state.
pub struct RealtimeResource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RealtimeResource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record> RealtimeResource<T> {
    pub fn new(client: RealtimeClient, config: ResourceConfig<T>) -> Self {
        let (view, _rx) = watch::channel(ResourceView::default());
        let scope_id = config.scope_id.clone();
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                engine: Mutex::new(Engine {
                    resource: ResourceState::new(),
                    scope_id,
                    mounted: false,
                    subscriptions: Vec::new(),
                    is_connected: false,
                    connection_error: None,
                    failing: false,
                    catch_up_pending: false,
                    catch_up: None,
                    generation_watch: None,
                    in_flight: false,
                    last_fetch_started: None,
                }),
                active: AtomicBool::new(true),
                version: AtomicU64::new(0),
                view,
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn table(&self) -> &str {
        &self.inner.config.table
    }

    pub fn scope_id(&self) -> Option<String> {
        lock(&self.inner.engine).scope_id.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn view(&self) -> ResourceView<T> {
        self.inner.view.borrow().clone()
    }

    pub fn data(&self) -> Vec<T> {
        lock(&self.inner.engine).resource.data()
    }

    /// Receiver that sees every published view.
    pub fn watch(&self) -> watch::Receiver<ResourceView<T>> {
        self.inner.view.subscribe()
    }

    /// Observe every applied snapshot and increment as it lands.
    ///
    /// Unlike [`watch`](Self::watch), which coalesces, each change is
    /// reported once and in order.
    pub fn on_change(&self, f: impl Fn(ResourceChange<'_, T>) + Send + Sync + 'static) {
        lock(&self.inner.observers).push(Arc::new(f));
    }

    /// Connect, subscribe and load the first snapshot.
    ///
    /// Nothing is subscribed while the session has no credential; the
    /// resource picks up once the generation moves after sign-in.
    pub async fn mount(&self) -> Result<(), TransportError> {
        self.inner.active.store(true, Ordering::SeqCst);
        lock(&self.inner.engine).mounted = true;
        self.inner.start_generation_watch();
        self.inner
            .connect_and_subscribe(RefreshOptions::default())
            .await
    }

    /// Unsubscribe and stop accepting state changes.
    pub fn unmount(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.version.fetch_add(1, Ordering::SeqCst);
        let (subscriptions, watcher) = {
            let mut eng = lock(&self.inner.engine);
            eng.mounted = false;
            eng.cancel_catch_up();
            eng.is_connected = false;
            eng.failing = false;
            eng.in_flight = false;
            (
                std::mem::take(&mut eng.subscriptions),
                eng.generation_watch.take(),
            )
        };
        if let Some(task) = watcher {
            task.abort();
        }
        drop(subscriptions);
        debug!(table = %self.inner.config.table, "resource unmounted");
    }

    /// Switch to another scope: clear local state, move the subscription and
    /// fetch the new scope's snapshot.
    pub async fn set_scope(&self, scope_id: Option<String>) -> Result<(), TransportError> {
        let (subscriptions, mounted) = {
            let mut eng = lock(&self.inner.engine);
            if eng.scope_id == scope_id {
                return Ok(());
            }
            eng.scope_id = scope_id;
            eng.resource.apply(ResourceAction::Clear);
            eng.resource.is_loading = false;
            eng.resource.error = None;
            eng.cancel_catch_up();
            eng.is_connected = false;
            eng.connection_error = None;
            eng.failing = false;
            eng.in_flight = false;
            eng.last_fetch_started = None;
            (std::mem::take(&mut eng.subscriptions), eng.mounted)
        };
        self.inner.version.fetch_add(1, Ordering::SeqCst);
        drop(subscriptions);
        self.inner.publish();
        debug!(table = %self.inner.config.table, scope = ?self.scope_id(), "scope changed");

        if mounted && self.inner.is_active() {
            self.inner
                .connect_and_subscribe(RefreshOptions::default())
                .await?;
        }
        Ok(())
    }

    pub async fn refresh(&self, opts: RefreshOptions) -> RefreshOutcome {
        self.inner.refresh(opts).await
    }

    /// Feed one status update through the connection state machine.
    pub fn handle_status(&self, update: &StatusUpdate) {
        self.inner.handle_status(update);
    }

    /// Apply one row change from the live stream.
    pub fn apply_change(&self, event: &ChangeEvent) -> bool {
        self.inner.apply_change(event)
    }

    pub fn append_item(&self, item: T) -> bool {
        let changed = self
            .inner
            .mutate(|resource| resource.apply(ResourceAction::Upsert(item.clone())));
        if changed {
            self.inner.notify(ResourceChange::Upsert(&item));
        }
        changed
    }

    /// Modify the item with `id`. Returns `false` if it is unknown or `f`
    /// left it unchanged.
    pub fn update_item(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        let mut updated = None;
        let changed = self.inner.mutate(|resource| {
            let Some(mut item) = resource.get(id).cloned() else {
                return false;
            };
            f(&mut item);
            let changed = resource.upsert(item.clone());
            updated = Some(item);
            changed
        });
        if let (true, Some(item)) = (changed, &updated) {
            self.inner.notify(ResourceChange::Upsert(item));
        }
        changed
    }

    pub fn remove_item(&self, id: &str) -> bool {
        let changed = self
            .inner
            .mutate(|resource| resource.apply(ResourceAction::Delete(id.to_string())));
        if changed {
            self.inner.notify(ResourceChange::Remove(id));
        }
        changed
    }

    pub fn set_data(&self, items: Vec<T>) -> bool {
        let changed = self
            .inner
            .mutate(|resource| resource.apply(ResourceAction::Set(items.clone())));
        if changed {
            self.inner.notify(ResourceChange::Snapshot(&items));
        }
        changed
    }
}

impl<T: Record> Inner<T> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn publish(&self) {
        let view = {
            let eng = lock(&self.engine);
            ResourceView {
                data: eng.resource.data(),
                is_loading: eng.resource.is_loading,
                is_connected: eng.is_connected,
                error: eng.resource.error.clone(),
                connection_error: eng.connection_error.clone(),
            }
        };
        self.view.send_replace(view);
    }

    fn notify(&self, change: ResourceChange<'_, T>) {
        let observers = lock(&self.observers).clone();
        for observer in &observers {
            observer(change);
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut ResourceState<T>) -> bool) -> bool {
        if !self.is_active() {
            trace!(table = %self.config.table, "mutation on inactive resource ignored");
            return false;
        }
        let changed = f(&mut lock(&self.engine).resource);
        if changed {
            self.publish();
        }
        changed
    }

    fn start_generation_watch(self: &Arc<Self>) {
        let mut rx = self.client.session().watch_generation();
        let weak = Arc::downgrade(self);
        let task = self.client.spawn(async move {
            while rx.changed().await.is_ok() {
                let generation = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.is_active() {
                    continue;
                }
                debug!(table = %inner.config.table, generation, "session generation moved, resubscribing");
                {
                    let mut eng = lock(&inner.engine);
                    eng.cancel_catch_up();
                    eng.failing = false;
                    eng.is_connected = false;
                }
                if let Err(error) = inner.connect_and_subscribe(RefreshOptions::forced()).await {
                    warn!(table = %inner.config.table, %error, "resubscribe failed");
                }
            }
        });
        let previous = std::mem::replace(&mut lock(&self.engine).generation_watch, task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn connect_and_subscribe(
        self: &Arc<Self>,
        opts: RefreshOptions,
    ) -> Result<(), TransportError> {
        if let Err(error) = self
            .client
            .ensure_connected(ConnectOptions::ensure_only())
            .await
        {
            warn!(table = %self.config.table, %error, "could not connect");
            lock(&self.engine).connection_error = Some(error.to_string());
            self.publish();
            return Err(error);
        }
        if !self.is_active() {
            return Ok(());
        }
        if !self.client.session().is_auth_ready() {
            debug!(table = %self.config.table, "auth not ready, subscription deferred");
            let stale = std::mem::take(&mut lock(&self.engine).subscriptions);
            drop(stale);
            return Ok(());
        }
        self.subscribe();
        self.refresh(opts).await;
        Ok(())
    }

    /// Register one logical subscription per configured event kind.
    ///
    /// The new handles are registered before the old ones are dropped so a
    /// shared channel on an unchanged key stays open.
    fn subscribe(self: &Arc<Self>) {
        let scope_id = lock(&self.engine).scope_id.clone();
        let key = self.config.channel_key(scope_id.as_deref());
        let handles: Vec<SubscriptionHandle> = self
            .config
            .events
            .iter()
            .map(|kind| {
                let deliver = Arc::downgrade(self);
                let status = Arc::downgrade(self);
                self.client.subscribe(
                    SubscribeRequest::new(key.clone())
                        .kind(*kind)
                        .on_event(move |event: &ChangeEvent| {
                            if let Some(inner) = deliver.upgrade() {
                                inner.apply_change(event);
                            }
                        })
                        .on_status(move |update: &StatusUpdate| {
                            if let Some(inner) = status.upgrade() {
                                inner.handle_status(update);
                            }
                        }),
                )
            })
            .collect();
        debug!(channel = %key, subscriptions = handles.len(), "resource subscribed");
        let previous = std::mem::replace(&mut lock(&self.engine).subscriptions, handles);
        drop(previous);
    }

    fn handle_status(self: &Arc<Self>, update: &StatusUpdate) {
        if !self.client.is_generation_valid(update.meta.generation) {
            trace!(
                table = %self.config.table,
                generation = update.meta.generation,
                status = %update.status,
                "stale status ignored"
            );
            return;
        }
        if !self.is_active() {
            return;
        }

        let follow_up = {
            let mut eng = lock(&self.engine);
            match update.status {
                ChannelStatus::Subscribed => {
                    eng.failing = false;
                    eng.is_connected = true;
                    eng.connection_error = None;
                    if eng.catch_up_pending {
                        StatusFollowUp::None
                    } else {
                        eng.catch_up_pending = true;
                        StatusFollowUp::CatchUp
                    }
                }
                ChannelStatus::Retrying => {
                    eng.is_connected = false;
                    StatusFollowUp::None
                }
                _ => {
                    eng.is_connected = false;
                    if update.meta.retries_exhausted {
                        eng.connection_error = Some(
                            update
                                .error
                                .clone()
                                .unwrap_or_else(|| RETRIES_EXHAUSTED.to_string()),
                        );
                    }
                    if update.meta.expected() {
                        StatusFollowUp::None
                    } else if std::mem::replace(&mut eng.failing, true) {
                        debug!(table = %self.config.table, status = %update.status, "already failing, no fallback refresh");
                        StatusFollowUp::None
                    } else {
                        StatusFollowUp::Fallback
                    }
                }
            }
        };
        self.publish();

        match follow_up {
            StatusFollowUp::None => {}
            StatusFollowUp::CatchUp => self.schedule_catch_up(update.meta.generation),
            StatusFollowUp::Fallback => {
                debug!(table = %self.config.table, status = %update.status, "fallback refresh");
                let inner = Arc::clone(self);
                self.client.spawn(async move {
                    inner.refresh(RefreshOptions::forced()).await;
                });
            }
        }
    }

    /// One forced, high-priority refresh shortly after `SUBSCRIBED`, no matter
    /// how many of this resource's subscriptions report it.
    fn schedule_catch_up(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let delay = self.config.catch_up_delay;
        let task = self.client.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.engine).catch_up_pending = false;
            if !inner.is_active() || !inner.client.is_generation_valid(generation) {
                trace!(table = %inner.config.table, generation, "catch-up dropped");
                return;
            }
            debug!(table = %inner.config.table, "catch-up refresh");
            inner.refresh(RefreshOptions::catch_up()).await;
        });
        let mut eng = lock(&self.engine);
        if task.is_none() {
            eng.catch_up_pending = false;
        }
        let previous = std::mem::replace(&mut eng.catch_up, task);
        drop(eng);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn refresh(self: &Arc<Self>, opts: RefreshOptions) -> RefreshOutcome {
        if !self.is_active() {
            return RefreshOutcome::Skipped(SkipReason::Inactive);
        }
        let (version, generation, scope_id) = {
            let mut eng = lock(&self.engine);
            if eng.in_flight && !opts.force && opts.priority != Priority::High {
                trace!(table = %self.config.table, "refresh dropped, fetch in flight");
                return RefreshOutcome::Skipped(SkipReason::InFlight);
            }
            let now = Instant::now();
            if !opts.force
                && eng
                    .last_fetch_started
                    .is_some_and(|started| now.duration_since(started) < self.config.throttle)
            {
                trace!(table = %self.config.table, "refresh throttled");
                return RefreshOutcome::Skipped(SkipReason::Throttled);
            }
            eng.in_flight = true;
            eng.last_fetch_started = Some(now);
            eng.resource.is_loading = true;
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            (version, self.client.generation(), eng.scope_id.clone())
        };
        self.publish();
        debug!(table = %self.config.table, version, generation, "fetching snapshot");

        let result = self.config.fetcher.fetch(scope_id.as_deref()).await;

        let latest = self.version.load(Ordering::SeqCst) == version;
        if !latest || !self.client.is_generation_valid(generation) || !self.is_active() {
            debug!(table = %self.config.table, version, "stale snapshot discarded");
            if latest {
                let mut eng = lock(&self.engine);
                eng.in_flight = false;
                eng.resource.is_loading = false;
            }
            return RefreshOutcome::Discarded;
        }

        let (outcome, applied) = {
            let mut eng = lock(&self.engine);
            eng.in_flight = false;
            eng.resource.is_loading = false;
            match result {
                Ok(items) => {
                    let count = items.len();
                    let items: Vec<T> = match &self.config.accept {
                        Some(accept) => items.into_iter().filter(|item| accept(item)).collect(),
                        None => items,
                    };
                    eng.resource.apply(ResourceAction::Set(items.clone()));
                    eng.resource.error = None;
                    (RefreshOutcome::Applied { items: count }, Some(items))
                }
                Err(error) => {
                    warn!(table = %self.config.table, version, %error, "snapshot fetch failed");
                    eng.resource.error = Some(error.to_string());
                    (RefreshOutcome::Failed, None)
                }
            }
        };
        self.publish();
        if let Some(items) = applied {
            self.notify(ResourceChange::Snapshot(&items));
        }
        outcome
    }

    fn apply_change(&self, event: &ChangeEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        trace!(table = %self.config.table, kind = ?event.kind, "applying change");
        match event.kind {
            EventKind::Delete => {
                let Some(id) = event.old.as_ref().and_then(record_id) else {
                    debug!(table = %self.config.table, "delete without id ignored");
                    return false;
                };
                let changed = lock(&self.engine).resource.remove(&id);
                if changed {
                    self.publish();
                    self.notify(ResourceChange::Remove(&id));
                }
                changed
            }
            _ => {
                let Some(record) = event.new.clone() else {
                    return false;
                };
                let item: T = match serde_json::from_value(record) {
                    Ok(item) => item,
                    Err(error) => {
                        warn!(table = %self.config.table, %error, "undecodable row ignored");
                        return false;
                    }
                };
                let accepted = self.config.accept.as_ref().is_none_or(|accept| accept(&item));
                let changed = {
                    let mut eng = lock(&self.engine);
                    if accepted {
                        eng.resource.upsert(item.clone())
                    } else {
                        eng.resource.remove(item.id())
                    }
                };
                if changed {
                    self.publish();
                    if accepted {
                        self.notify(ResourceChange::Upsert(&item));
                    } else {
                        self.notify(ResourceChange::Remove(item.id()));
                    }
                }
                changed
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let eng = self
            .engine
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = eng.catch_up.take() {
            task.abort();
        }
        if let Some(task) = eng.generation_watch.take() {
            task.abort();
        }
    }
}

/// Id of a raw row, accepting string and numeric ids.
fn record_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CloseReason, StatusChangeMeta};
    use crate::retry::RetryPolicy;
    use crate::transport::memory::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Item {
        id: String,
        #[serde(default)]
        v: u32,
    }

    impl Record for Item {
        fn id(&self) -> &str {
            &self.id
        }
        fn sort_key(&self) -> &str {
            &self.id
        }
    }

    fn client() -> RealtimeClient {
        RealtimeClient::new(
            Arc::new(MemoryBackend::with_credential("tok")),
            RetryPolicy::default(),
        )
    }

    fn counting_fetcher(calls: &Arc<AtomicUsize>) -> Arc<dyn SnapshotFetcher<Item>> {
        let calls = Arc::clone(calls);
        fetch_fn(move |_scope: Option<String>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Item {
                    id: "s".into(),
                    v: 0,
                }])
            }
        })
    }

    fn resource(calls: &Arc<AtomicUsize>) -> RealtimeResource<Item> {
        RealtimeResource::new(
            client(),
            ResourceConfig::new("items", counting_fetcher(calls))
                .throttle(Duration::from_millis(1000))
                .catch_up_delay(Duration::from_secs(60)),
        )
    }

    fn update(status: ChannelStatus, meta: StatusChangeMeta) -> StatusUpdate {
        StatusUpdate {
            status,
            error: None,
            meta,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_drops_unforced_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);

        assert_eq!(
            res.refresh(RefreshOptions::default()).await,
            RefreshOutcome::Applied { items: 1 }
        );
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(
            res.refresh(RefreshOptions::default()).await,
            RefreshOutcome::Skipped(SkipReason::Throttled)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        res.refresh(RefreshOptions::forced()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_window_expires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        res.refresh(RefreshOptions::default()).await;
        tokio::time::advance(Duration::from_millis(1001)).await;
        res.refresh(RefreshOptions::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_status_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        for _ in 0..5 {
            res.inner.client.increment_generation();
        }
        res.handle_status(&update(ChannelStatus::Subscribed, StatusChangeMeta::live(4)));
        assert!(!res.view().is_connected);

        res.handle_status(&update(ChannelStatus::Subscribed, StatusChangeMeta::live(5)));
        assert!(res.view().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_unexpected_close_refreshes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        let closed = || {
            update(
                ChannelStatus::Closed,
                StatusChangeMeta::closed(0, CloseReason::Unexpected),
            )
        };

        res.handle_status(&update(ChannelStatus::Subscribed, StatusChangeMeta::live(0)));
        res.handle_status(&closed());
        res.handle_status(&closed());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!res.view().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn expected_close_never_refreshes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        res.handle_status(&update(ChannelStatus::Subscribed, StatusChangeMeta::live(0)));
        res.handle_status(&update(
            ChannelStatus::Closed,
            StatusChangeMeta::closed(0, CloseReason::Unsubscribe),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_connection_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        res.handle_status(&StatusUpdate {
            status: ChannelStatus::ChannelError,
            error: Some(RETRIES_EXHAUSTED.into()),
            meta: StatusChangeMeta {
                retries_exhausted: true,
                ..StatusChangeMeta::closed(0, CloseReason::Unexpected)
            },
        });
        assert_eq!(res.view().connection_error.as_deref(), Some(RETRIES_EXHAUSTED));
    }

    #[tokio::test(start_paused = true)]
    async fn changes_are_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        let insert = ChangeEvent::insert("items", json!({"id": "1", "v": 1}));
        assert!(res.apply_change(&insert));
        let once = res.view();
        assert!(!res.apply_change(&insert));
        assert_eq!(res.view(), once);

        assert!(!res.apply_change(&ChangeEvent::delete("items", json!({"id": "2"}))));
        assert!(res.apply_change(&ChangeEvent::delete("items", json!({"id": "1"}))));
        assert!(res.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_row_is_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        assert!(!res.apply_change(&ChangeEvent::insert("items", json!({"v": 1}))));
        assert!(res.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_filter_removes_rows_that_leave() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = RealtimeResource::new(
            client(),
            ResourceConfig::new("items", counting_fetcher(&calls)).accept(|item: &Item| item.v > 0),
        );
        res.apply_change(&ChangeEvent::insert("items", json!({"id": "1", "v": 1})));
        assert_eq!(res.data().len(), 1);
        res.apply_change(&ChangeEvent::update("items", json!({"id": "1", "v": 0})));
        assert!(res.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_mutations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        assert!(res.append_item(Item {
            id: "a".into(),
            v: 1
        }));
        assert!(res.update_item("a", |item| item.v = 7));
        assert!(!res.update_item("missing", |item| item.v = 7));
        assert!(!res.update_item("a", |item| item.v = 7));
        assert_eq!(res.data()[0].v, 7);
        assert!(res.remove_item("a"));
        assert!(res.set_data(vec![Item {
            id: "b".into(),
            v: 0
        }]));
        assert_eq!(res.view().data.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_each_change_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        res.on_change(move |change| {
            let entry = match change {
                ResourceChange::Snapshot(items) => format!("snapshot:{}", items.len()),
                ResourceChange::Upsert(item) => format!("upsert:{}:{}", item.id, item.v),
                ResourceChange::Remove(id) => format!("remove:{id}"),
            };
            lock(&sink).push(entry);
        });

        res.refresh(RefreshOptions::default()).await;
        res.apply_change(&ChangeEvent::insert("items", json!({"id": "2", "v": 1})));
        res.apply_change(&ChangeEvent::insert("items", json!({"id": "1", "v": 1})));
        // No-ops are not reported.
        res.apply_change(&ChangeEvent::insert("items", json!({"id": "1", "v": 1})));
        res.update_item("2", |item| item.v = 5);
        res.apply_change(&ChangeEvent::delete("items", json!({"id": "1"})));

        assert_eq!(
            *lock(&seen),
            vec!["snapshot:1", "upsert:2:1", "upsert:1:1", "upsert:2:5", "remove:1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unmounted_resource_rejects_mutations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let res = resource(&calls);
        res.unmount();
        assert!(!res.append_item(Item {
            id: "a".into(),
            v: 1
        }));
        assert_eq!(
            res.refresh(RefreshOptions::forced()).await,
            RefreshOutcome::Skipped(SkipReason::Inactive)
        );
        assert!(!res.apply_change(&ChangeEvent::insert("items", json!({"id": "1"}))));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_surfaces_in_view() {
        let res: RealtimeResource<Item> = RealtimeResource::new(
            client(),
            ResourceConfig::new(
                "items",
                fetch_fn(|_scope: Option<String>| async {
                    Err(FetchError::Backend("offline".into()))
                }),
            ),
        );
        assert_eq!(res.refresh(RefreshOptions::default()).await, RefreshOutcome::Failed);
        let view = res.view();
        assert_eq!(view.error.as_deref(), Some("snapshot query failed: offline"));
        assert!(!view.is_loading);
    }

    #[test]
    fn channel_key_follows_scope() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ResourceConfig::new("chat_messages", counting_fetcher(&calls))
            .scoped("project_id", Some("P1".into()));
        assert_eq!(
            config.channel_key(Some("P1")),
            ChannelKey::eq("chat_messages", "project_id", "P1")
        );
        assert_eq!(config.channel_key(None), ChannelKey::new("chat_messages", None));
    }

    #[test]
    fn record_id_accepts_numbers() {
        assert_eq!(record_id(&json!({"id": 7})), Some("7".to_string()));
        assert_eq!(record_id(&json!({"id": "x"})), Some("x".to_string()));
        assert_eq!(record_id(&json!({})), None);
    }
}
