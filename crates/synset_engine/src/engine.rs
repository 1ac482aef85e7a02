//! The replicated set.

use crate::config::SetConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::health::ConnectionHealth;
use crate::inbound::InboundBuffer;
use crate::outbound::OutboundBuffer;
use crate::state::{Action, Directed, Listener, StateContainer};
use crate::transport::{Broadcaster, SharedStore, StoreWrite, TransportEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use synset_protocol::{Member, MemberSet, Operation, ValueRecognizer};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Callback invoked with every reported failure.
pub type FailureListener = Arc<dyn Fn(&ReplicationError) + Send + Sync>;

type InitCallback<T> = Box<dyn FnOnce(&MemberSet<T>) + Send>;

/// Counters describing replication activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Operations issued through the local API.
    pub local_operations: u64,
    /// Operations applied from peers, including seed baselines.
    pub remote_operations: u64,
    /// Operations written to the store and broadcast.
    pub forwarded: u64,
    /// Payloads or stored members that were not recognized.
    pub dropped_payloads: u64,
    /// Seed loads that completed successfully.
    pub seed_loads: u64,
    /// Seed loads that gave up.
    pub seed_failures: u64,
    /// Last reported failure.
    pub last_error: Option<String>,
}

struct Inner<T> {
    container: StateContainer<T>,
    health: ConnectionHealth,
    outbound: OutboundBuffer<T>,
    inbound: InboundBuffer<T>,
    stats: ReplicationStats,
    failure_listeners: Vec<FailureListener>,
    members_initialized: bool,
    init_callbacks: Vec<InitCallback<T>>,
}

/// Work produced under the lock and carried out after it is released.
struct Effects<T> {
    changes: Vec<MemberSet<T>>,
    failures: Vec<ReplicationError>,
    members_init: Vec<(InitCallback<T>, MemberSet<T>)>,
    start_seed: Option<u64>,
    seed_finished: bool,
}

impl<T> Default for Effects<T> {
    fn default() -> Self {
        Self {
            changes: Vec::new(),
            failures: Vec::new(),
            members_init: Vec::new(),
            start_seed: None,
            seed_finished: false,
        }
    }
}

/// One queued callback invocation, bound to the listeners registered when
/// it was produced.
enum Delivery<T> {
    Changed(MemberSet<T>, Vec<Listener<T>>),
    Initialized(InitCallback<T>, MemberSet<T>),
    Failed(ReplicationError, Vec<FailureListener>),
    SeedFinished,
}

/// Deliveries in the order they were produced under the state lock.
///
/// Only one caller drains at a time. Callers that find a drain in progress,
/// including listeners calling back into the set, leave their deliveries to
/// it, so every listener observes states in production order.
struct Outbox<T> {
    queue: VecDeque<Delivery<T>>,
    delivering: bool,
}

/// Clears the drain flag if a callback panics mid-drain.
struct DrainGuard<'a, T>(&'a Mutex<Outbox<T>>);

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

struct Shared<T> {
    config: SetConfig,
    store: Arc<dyn SharedStore>,
    broadcaster: Arc<dyn Broadcaster>,
    recognizer: Arc<dyn ValueRecognizer<T>>,
    inner: Mutex<Inner<T>>,
    outbox: Mutex<Outbox<T>>,
    seeds: watch::Sender<u64>,
}

/// A set kept eventually consistent across nodes.
///
/// Local mutations are applied immediately, then written to the shared
/// store and broadcast. Broadcasts from peers are applied as they arrive.
/// After every confirmed (re)subscription the full membership is fetched
/// from the store and replaces local state, with broadcasts received during
/// the fetch replayed on top.
///
/// Handles are cheap to clone and share one replica.
///
/// # Example
///
/// ```
/// use synset_engine::{MemoryBroker, ReplicatedSet, SetConfig};
/// use synset_protocol::CborRecognizer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = MemoryBroker::new();
/// let (conn, events) = broker.connect();
/// let set = ReplicatedSet::<i64>::from_connection(
///     SetConfig::new("numbers"),
///     conn,
///     CborRecognizer::new(),
/// )
/// .unwrap();
///
/// set.subscribe(|members| println!("now {} members", members.len()));
/// set.add(1).unwrap();
/// tokio::spawn({
///     let set = set.clone();
///     async move { set.drive(events).await }
/// });
/// # }
/// ```
pub struct ReplicatedSet<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ReplicatedSet<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> ReplicatedSet<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    /// Creates a replica and subscribes to the set's channel.
    pub fn new<R>(
        config: SetConfig,
        store: Arc<dyn SharedStore>,
        broadcaster: Arc<dyn Broadcaster>,
        recognizer: R,
    ) -> ReplicationResult<Self>
    where
        R: ValueRecognizer<T> + 'static,
    {
        broadcaster.subscribe(&config.channel)?;

        let inner = Inner {
            container: StateContainer::new(),
            health: ConnectionHealth::new(),
            outbound: OutboundBuffer::new(config.queue_warn_threshold),
            inbound: InboundBuffer::new(config.queue_warn_threshold),
            stats: ReplicationStats::default(),
            failure_listeners: Vec::new(),
            members_initialized: false,
            init_callbacks: Vec::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                broadcaster,
                recognizer: Arc::new(recognizer),
                inner: Mutex::new(inner),
                outbox: Mutex::new(Outbox {
                    queue: VecDeque::new(),
                    delivering: false,
                }),
                seeds: watch::Sender::new(0),
            }),
        })
    }

    /// Creates a replica over a connection that serves as both store and
    /// broadcaster.
    pub fn from_connection<C, R>(config: SetConfig, connection: C, recognizer: R) -> ReplicationResult<Self>
    where
        C: SharedStore + Broadcaster + Clone + 'static,
        R: ValueRecognizer<T> + 'static,
    {
        let store: Arc<dyn SharedStore> = Arc::new(connection.clone());
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(connection);
        Self::new(config, store, broadcaster, recognizer)
    }

    /// Adds a value.
    pub fn add(&self, value: T) -> ReplicationResult<()> {
        self.dispatch(Operation::add(value)?);
        Ok(())
    }

    /// Removes a value.
    pub fn remove(&self, value: T) -> ReplicationResult<()> {
        self.dispatch(Operation::remove(value)?);
        Ok(())
    }

    /// Adds every value.
    pub fn add_all(&self, values: impl IntoIterator<Item = T>) -> ReplicationResult<()> {
        self.dispatch(Operation::add_all(values)?);
        Ok(())
    }

    /// Removes every value.
    pub fn clear(&self) {
        self.dispatch(Operation::Clear);
    }

    /// Replaces the membership with `values`.
    pub fn replace_all(&self, values: impl IntoIterator<Item = T>) -> ReplicationResult<()> {
        self.dispatch(Operation::replace_all(values)?);
        Ok(())
    }

    /// Applies a local operation and sends it to peers, or queues it while
    /// the publish connection is down. Never waits on the broker.
    pub fn dispatch(&self, op: Operation<T>) {
        self.shared
            .transact(|shared, inner, fx| shared.submit_local(inner, fx, op));
    }

    /// Registers a listener called with the membership after each change.
    pub fn subscribe(&self, listener: impl Fn(&MemberSet<T>) + Send + Sync + 'static) {
        let listener: Listener<T> = Arc::new(listener);
        self.shared
            .transact(|_, inner, _| inner.container.subscribe(listener));
    }

    /// Calls `callback` once with the membership after the first successful
    /// seed load, immediately if it already happened.
    pub fn on_members_init(&self, callback: impl FnOnce(&MemberSet<T>) + Send + 'static) {
        let callback: InitCallback<T> = Box::new(callback);
        self.shared.transact(|_, inner, fx| {
            if inner.members_initialized {
                let state = inner.container.state().clone();
                fx.members_init.push((callback, state));
            } else {
                inner.init_callbacks.push(callback);
            }
        });
    }

    /// Registers a listener for failures that happen off the caller's path:
    /// seed fetches, store writes and publishes.
    pub fn on_failure(&self, listener: impl Fn(&ReplicationError) + Send + Sync + 'static) {
        let listener: FailureListener = Arc::new(listener);
        self.shared
            .transact(|_, inner, _| inner.failure_listeners.push(listener));
    }

    /// Feeds one transport event into the engine.
    pub fn handle(&self, event: TransportEvent) {
        self.shared
            .transact(|shared, inner, fx| shared.handle_event(inner, fx, event));
    }

    /// Feeds events until the sender side is dropped.
    pub async fn drive(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
    }

    /// Retries queued outbound operations if the publish side is usable.
    pub fn flush(&self) {
        self.shared.transact(|shared, inner, fx| {
            if inner.health.publish_usable() {
                shared.flush_outbound(inner, fx);
            }
        });
    }

    /// Returns the current membership.
    pub fn members(&self) -> MemberSet<T> {
        self.shared.inner.lock().container.state().clone()
    }

    /// Returns the usability of both connections.
    pub fn health(&self) -> ConnectionHealth {
        self.shared.inner.lock().health
    }

    /// Returns replication counters.
    pub fn stats(&self) -> ReplicationStats {
        self.shared.inner.lock().stats.clone()
    }

    /// Returns true while a seed load is in flight.
    pub fn is_loading_seed(&self) -> bool {
        self.shared.inner.lock().inbound.is_loading()
    }

    /// Returns the number of operations waiting for the publish side.
    pub fn outbound_len(&self) -> usize {
        self.shared.inner.lock().outbound.len()
    }

    /// Returns the number of remote operations held behind a seed load.
    pub fn inbound_len(&self) -> usize {
        self.shared.inner.lock().inbound.len()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SetConfig {
        &self.shared.config
    }

    /// Returns how many seed loads have finished, successfully or not.
    pub fn seed_generation(&self) -> u64 {
        *self.shared.seeds.borrow()
    }

    /// Waits until at least `generation` seed loads have finished.
    pub async fn wait_for_seed(&self, generation: u64) {
        let mut seeds = self.shared.seeds.subscribe();
        let _ = seeds.wait_for(|finished| *finished >= generation).await;
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Runs `f` under the lock, queues its effects before releasing it,
    /// then delivers them outside it.
    fn transact<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Self, &mut Inner<T>, &mut Effects<T>) -> R,
    ) -> R {
        let mut fx = Effects::default();
        let (result, start_seed) = {
            let mut inner = self.inner.lock();
            let result = f(&**self, &mut *inner, &mut fx);
            (result, self.enqueue(&inner, fx))
        };
        self.drain_outbox();
        if let Some(epoch) = start_seed {
            self.spawn_seed(epoch);
        }
        result
    }

    /// Moves effects into the outbox. Must be called with the state lock
    /// held so the outbox order matches the order states were produced.
    fn enqueue(&self, inner: &Inner<T>, fx: Effects<T>) -> Option<u64> {
        let Effects {
            changes,
            failures,
            members_init,
            start_seed,
            seed_finished,
        } = fx;
        if changes.is_empty() && failures.is_empty() && members_init.is_empty() && !seed_finished {
            return start_seed;
        }

        let mut outbox = self.outbox.lock();
        if !changes.is_empty() {
            let listeners = inner.container.listeners();
            outbox.queue.extend(
                changes
                    .into_iter()
                    .map(|state| Delivery::Changed(state, listeners.clone())),
            );
        }
        outbox.queue.extend(
            members_init
                .into_iter()
                .map(|(callback, state)| Delivery::Initialized(callback, state)),
        );
        if !failures.is_empty() {
            let listeners = inner.failure_listeners.clone();
            outbox.queue.extend(
                failures
                    .into_iter()
                    .map(|error| Delivery::Failed(error, listeners.clone())),
            );
        }
        if seed_finished {
            outbox.queue.push_back(Delivery::SeedFinished);
        }
        start_seed
    }

    fn drain_outbox(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.delivering {
                return;
            }
            outbox.delivering = true;
        }

        let _guard = DrainGuard(&self.outbox);
        loop {
            let delivery = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        outbox.delivering = false;
                        return;
                    }
                }
            };
            self.deliver(delivery);
        }
    }

    fn deliver(&self, delivery: Delivery<T>) {
        match delivery {
            Delivery::Changed(state, listeners) => {
                for listener in &listeners {
                    listener(&state);
                }
            }
            Delivery::Initialized(callback, state) => callback(&state),
            Delivery::Failed(error, listeners) => {
                for listener in &listeners {
                    listener(&error);
                }
            }
            Delivery::SeedFinished => self.seeds.send_modify(|finished| *finished += 1),
        }
    }

    fn spawn_seed(self: &Arc<Self>, epoch: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(load_seed(Arc::clone(self), epoch));
            }
            Err(e) => {
                let error = ReplicationError::SeedLoadFailed {
                    key: self.config.key.clone(),
                    attempts: 0,
                    message: e.to_string(),
                };
                self.transact(|shared, inner, fx| shared.finish_seed(inner, fx, epoch, Err(error)));
            }
        }
    }

    fn seed_is_current(&self, epoch: u64) -> bool {
        self.inner.lock().inbound.is_current(epoch)
    }

    fn handle_event(&self, inner: &mut Inner<T>, fx: &mut Effects<T>, event: TransportEvent) {
        let key = &self.config.key;
        match event {
            TransportEvent::Publisher(signal) => {
                if inner.health.on_publisher(&signal) {
                    debug!(key = %key, "publish connection ready");
                    self.flush_outbound(inner, fx);
                } else if signal.is_degraded() {
                    debug!(key = %key, ?signal, "publish connection degraded");
                }
            }
            TransportEvent::Subscriber(signal) => {
                if signal.is_degraded() {
                    debug!(key = %key, ?signal, "subscribe connection degraded");
                }
                inner.health.on_subscriber(&signal);
            }
            TransportEvent::Subscribed { channel } => {
                if channel != self.config.channel {
                    return;
                }
                inner.health.on_subscribed();
                let epoch = inner.inbound.begin_seed();
                debug!(key = %key, epoch, "subscription confirmed, loading seed");
                fx.start_seed = Some(epoch);
            }
            TransportEvent::Message { channel, payload } => {
                if channel == self.config.channel {
                    self.receive(inner, fx, &payload);
                }
            }
        }
    }

    fn receive(&self, inner: &mut Inner<T>, fx: &mut Effects<T>, payload: &[u8]) {
        if !inner.health.subscribe_usable() {
            trace!(key = %self.config.key, "ignoring message before subscription is confirmed");
            return;
        }

        match Operation::<T>::recognize(payload, self.recognizer.as_ref()) {
            Some(op) => {
                if let Some(op) = inner.inbound.accept(op) {
                    self.apply_remote(inner, fx, op);
                }
            }
            None => {
                trace!(key = %self.config.key, len = payload.len(), "dropping unrecognized payload");
                inner.stats.dropped_payloads += 1;
                let dispatched = inner.container.dispatch(Action::Unrecognized);
                fx.changes.extend(dispatched.changed);
            }
        }
    }

    fn apply_remote(&self, inner: &mut Inner<T>, fx: &mut Effects<T>, op: Operation<T>) {
        trace!(key = %self.config.key, kind = %op.kind(), "applying remote operation");
        inner.stats.remote_operations += 1;
        let dispatched = inner
            .container
            .dispatch(Action::Apply(Directed::Remote(op)));
        fx.changes.extend(dispatched.changed);
    }

    fn submit_local(&self, inner: &mut Inner<T>, fx: &mut Effects<T>, op: Operation<T>) {
        inner.stats.local_operations += 1;
        let dispatched = inner
            .container
            .dispatch(Action::Apply(Directed::Local(op)));
        fx.changes.extend(dispatched.changed);

        let Some(op) = dispatched.forward else {
            return;
        };

        if inner.health.publish_usable() {
            self.flush_outbound(inner, fx);
        }

        // Anything still queued must go out first.
        if inner.health.publish_usable() && inner.outbound.is_empty() {
            if let Err(op) = self.try_forward(inner, fx, op) {
                inner.outbound.push(op);
            }
        } else {
            trace!(key = %self.config.key, kind = %op.kind(), "queueing operation");
            inner.outbound.push(op);
        }
    }

    fn flush_outbound(&self, inner: &mut Inner<T>, fx: &mut Effects<T>) {
        if inner.outbound.is_empty() {
            return;
        }

        let queued = inner.outbound.drain();
        debug!(key = %self.config.key, queued = queued.len(), "flushing outbound queue");

        let mut pending = queued.into_iter();
        while let Some(op) = pending.next() {
            let dispatched = inner.container.dispatch(Action::Forward(op));
            fx.changes.extend(dispatched.changed);
            let Some(op) = dispatched.forward else {
                continue;
            };

            if let Err(op) = self.try_forward(inner, fx, op) {
                let mut remaining = vec![op];
                remaining.extend(pending.by_ref());
                inner.outbound.requeue_front(remaining);
                return;
            }
        }
    }

    /// Forwards one operation. Gives the operation back if it should be
    /// retried later.
    fn try_forward(
        &self,
        inner: &mut Inner<T>,
        fx: &mut Effects<T>,
        op: Operation<T>,
    ) -> Result<(), Operation<T>> {
        match self.forward(&op) {
            Ok(()) => {
                inner.stats.forwarded += 1;
                Ok(())
            }
            Err(error @ ReplicationError::Protocol(_)) => {
                // Encoding is deterministic; retrying cannot help.
                self.report(inner, fx, error);
                Ok(())
            }
            Err(error) => {
                self.report(inner, fx, error);
                Err(op)
            }
        }
    }

    fn forward(&self, op: &Operation<T>) -> ReplicationResult<()> {
        let payload = op.encode()?;
        if let Some(write) = StoreWrite::from_operation(op) {
            self.store.write(&self.config.key, write)?;
        }
        self.broadcaster.publish(&self.config.channel, payload)?;
        trace!(key = %self.config.key, kind = %op.kind(), "forwarded operation");
        Ok(())
    }

    fn finish_seed(
        &self,
        inner: &mut Inner<T>,
        fx: &mut Effects<T>,
        epoch: u64,
        result: ReplicationResult<Vec<Vec<u8>>>,
    ) {
        let key = &self.config.key;
        if !inner.inbound.is_current(epoch) {
            debug!(key = %key, epoch, "discarding superseded seed load");
            return;
        }

        let seeded = match result {
            Ok(raw) => {
                let mut members = Vec::with_capacity(raw.len());
                for bytes in raw {
                    match self.recognizer.recognize(&bytes) {
                        Ok(value) => members.push(Member::from_parts(bytes, value)),
                        Err(error) => {
                            warn!(key = %key, %error, "skipping unrecognized stored member");
                            inner.stats.dropped_payloads += 1;
                        }
                    }
                }
                debug!(key = %key, epoch, members = members.len(), "seed loaded");
                self.apply_remote(inner, fx, Operation::ReplaceAll(members));
                inner.stats.seed_loads += 1;
                true
            }
            Err(error) => {
                inner.stats.seed_failures += 1;
                self.report(inner, fx, error);
                false
            }
        };

        let queued = inner.inbound.finish();
        if !queued.is_empty() {
            debug!(key = %key, replayed = queued.len(), "replaying operations received during seed load");
        }
        for op in queued {
            self.apply_remote(inner, fx, op);
        }

        if seeded && !inner.members_initialized {
            inner.members_initialized = true;
            let state = inner.container.state().clone();
            fx.members_init
                .extend(inner.init_callbacks.drain(..).map(|cb| (cb, state.clone())));
        }
        fx.seed_finished = true;
    }

    fn report(&self, inner: &mut Inner<T>, fx: &mut Effects<T>, error: ReplicationError) {
        warn!(key = %self.config.key, %error, "replication failure");
        inner.stats.last_error = Some(error.to_string());
        fx.failures.push(error);
    }
}

/// Fetches the membership for seed load `epoch`, retrying per the
/// configured policy while the load is still current.
async fn load_seed<T>(shared: Arc<Shared<T>>, epoch: u64)
where
    T: Clone + Send + Sync + 'static,
{
    let retry = shared.config.seed_retry.clone();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if attempt > 0 {
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        }
        if !shared.seed_is_current(epoch) {
            debug!(key = %shared.config.key, epoch, "seed load superseded before fetch");
            return;
        }

        let result = shared.store.members(&shared.config.key).await;
        attempt += 1;

        match result {
            Ok(raw) => {
                shared.transact(|s, inner, fx| s.finish_seed(inner, fx, epoch, Ok(raw)));
                return;
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                shared.transact(|s, inner, fx| {
                    if inner.inbound.is_current(epoch) {
                        s.report(inner, fx, error);
                    }
                });
            }
            Err(error) => {
                let failure = ReplicationError::SeedLoadFailed {
                    key: shared.config.key.clone(),
                    attempts: attempt,
                    message: error.to_string(),
                };
                shared.transact(|s, inner, fx| s.finish_seed(inner, fx, epoch, Err(failure)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryBroker;
    use crate::transport::ConnectionSignal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use synset_protocol::CborRecognizer;

    const KEY: &str = "numbers";

    type Events = mpsc::UnboundedReceiver<TransportEvent>;

    fn node_with(broker: &MemoryBroker, config: SetConfig) -> (ReplicatedSet<i64>, Events) {
        let (conn, rx) = broker.connect();
        let set = ReplicatedSet::from_connection(config, conn, CborRecognizer::new()).unwrap();
        (set, rx)
    }

    fn node(broker: &MemoryBroker) -> (ReplicatedSet<i64>, Events) {
        node_with(
            broker,
            SetConfig::new(KEY).with_seed_retry(RetryConfig::no_retry()),
        )
    }

    fn pump(set: &ReplicatedSet<i64>, rx: &mut Events) -> usize {
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            set.handle(event);
            handled += 1;
        }
        handled
    }

    async fn settle(set: &ReplicatedSet<i64>, rx: &mut Events) {
        for _ in 0..500 {
            let handled = pump(set, rx);
            if handled == 0 && !set.is_loading_seed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("node did not settle");
    }

    fn values(set: &ReplicatedSet<i64>) -> Vec<i64> {
        let mut values = set.members().to_values();
        values.sort();
        values
    }

    fn sorted(set: &MemberSet<i64>) -> Vec<i64> {
        let mut values = set.to_values();
        values.sort();
        values
    }

    fn record_changes(set: &ReplicatedSet<i64>) -> Arc<parking_lot::Mutex<Vec<Vec<i64>>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set.subscribe(move |members| sink.lock().push(sorted(members)));
        seen
    }

    fn record_failures(set: &ReplicatedSet<i64>) -> Arc<parking_lot::Mutex<Vec<ReplicationError>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set.on_failure(move |error| sink.lock().push(error.clone()));
        seen
    }

    fn decode_published(broker: &MemoryBroker) -> Vec<Operation<i64>> {
        broker
            .published(KEY)
            .iter()
            .map(|payload| Operation::decode(payload, &CborRecognizer::new()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn adds_are_observed_in_order() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;
        let seen = record_changes(&set);

        set.add(1).unwrap();
        set.add(2).unwrap();

        assert_eq!(values(&set), vec![1, 2]);
        assert_eq!(*seen.lock(), vec![vec![1], vec![1, 2]]);
    }

    #[tokio::test]
    async fn replace_all_overwrites() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;

        set.add_all([1, 2, 3]).unwrap();
        set.replace_all([5, 6, 7]).unwrap();

        assert_eq!(values(&set), vec![5, 6, 7]);
        assert_eq!(broker.stored_members(KEY).len(), 3);
    }

    #[tokio::test]
    async fn operations_buffer_while_publish_is_down() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;

        set.handle(TransportEvent::Publisher(ConnectionSignal::Error("reset".into())));
        set.add(10).unwrap();

        // Applied locally, not forwarded.
        assert_eq!(values(&set), vec![10]);
        assert_eq!(set.outbound_len(), 1);
        assert!(broker.published(KEY).is_empty());

        set.handle(TransportEvent::Publisher(ConnectionSignal::Ready));

        assert_eq!(set.outbound_len(), 0);
        assert_eq!(decode_published(&broker), vec![Operation::add(10).unwrap()]);
        assert_eq!(broker.stored_members(KEY).len(), 1);
        assert_eq!(set.stats().forwarded, 1);
    }

    #[tokio::test]
    async fn buffered_operations_flush_in_issue_order() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;

        set.handle(TransportEvent::Publisher(ConnectionSignal::Reconnecting));
        set.add(1).unwrap();
        set.remove(1).unwrap();
        set.add_all([2, 3]).unwrap();
        set.clear();
        set.add(4).unwrap();
        set.handle(TransportEvent::Publisher(ConnectionSignal::Ready));

        assert_eq!(
            decode_published(&broker),
            vec![
                Operation::add(1).unwrap(),
                Operation::remove(1).unwrap(),
                Operation::add_all([2, 3]).unwrap(),
                Operation::Clear,
                Operation::add(4).unwrap(),
            ]
        );
        assert_eq!(broker.stored_members(KEY), vec![Member::new(4i64).unwrap().as_bytes().to_vec()]);
    }

    #[tokio::test]
    async fn messages_during_seed_load_replay_after_baseline() {
        let broker = MemoryBroker::new();
        let (writer, _writer_rx) = broker.connect();
        writer
            .write(
                KEY,
                StoreWrite::Add(
                    [1i64, 2, 3]
                        .iter()
                        .map(|v| Member::new(*v).unwrap().as_bytes().to_vec())
                        .collect(),
                ),
            )
            .unwrap();

        broker.pause_fetches();
        let (set, mut rx) = node(&broker);
        pump(&set, &mut rx);
        tokio::task::yield_now().await;
        assert!(set.is_loading_seed());

        broker
            .inject(KEY, Operation::add(99i64).unwrap().encode().unwrap())
            .unwrap();
        pump(&set, &mut rx);
        assert_eq!(set.inbound_len(), 1);
        assert!(set.members().is_empty());

        broker.resume_fetches();
        settle(&set, &mut rx).await;

        assert_eq!(values(&set), vec![1, 2, 3, 99]);
        assert_eq!(set.inbound_len(), 0);
        assert_eq!(set.stats().seed_loads, 1);
    }

    #[tokio::test]
    async fn members_init_fires_exactly_once() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);

        let early = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&early);
        set.on_members_init(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(early.load(Ordering::SeqCst), 0);

        settle(&set, &mut rx).await;
        set.add(5).unwrap();
        assert_eq!(early.load(Ordering::SeqCst), 1);

        let late = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&late);
        set.on_members_init(move |members| sink.lock().push(sorted(members)));
        // Seed already loaded: called synchronously.
        assert_eq!(*late.lock(), vec![vec![5]]);

        broker.resubscribe_all();
        settle(&set, &mut rx).await;
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_op_operations_do_not_notify() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;
        let seen = record_changes(&set);

        set.remove(42).unwrap();
        assert!(seen.lock().is_empty());

        set.add(1).unwrap();
        set.add(1).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_seed_is_reported_and_retried_on_resubscribe() {
        let broker = MemoryBroker::new();
        let (writer, _writer_rx) = broker.connect();
        writer
            .write(KEY, StoreWrite::Add(vec![Member::new(7i64).unwrap().as_bytes().to_vec()]))
            .unwrap();

        broker.fail_fetches(1);
        let (set, mut rx) = node(&broker);
        let failures = record_failures(&set);
        let initialized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&initialized);
        set.on_members_init(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        settle(&set, &mut rx).await;

        assert!(matches!(
            failures.lock().as_slice(),
            [ReplicationError::SeedLoadFailed { attempts: 1, .. }]
        ));
        assert_eq!(set.stats().seed_failures, 1);
        assert!(set.members().is_empty());
        assert_eq!(initialized.load(Ordering::SeqCst), 0);
        assert_eq!(set.seed_generation(), 1);

        broker.resubscribe_all();
        settle(&set, &mut rx).await;

        assert_eq!(values(&set), vec![7]);
        assert_eq!(initialized.load(Ordering::SeqCst), 1);
        assert_eq!(set.stats().seed_loads, 1);
    }

    #[tokio::test]
    async fn seed_fetch_retries_with_backoff() {
        let broker = MemoryBroker::new();
        broker.fail_fetches(2);
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let (set, mut rx) = node_with(&broker, SetConfig::new(KEY).with_seed_retry(retry));
        let failures = record_failures(&set);

        pump(&set, &mut rx);
        tokio::time::timeout(Duration::from_secs(5), set.wait_for_seed(1))
            .await
            .unwrap();

        assert_eq!(failures.lock().len(), 2);
        assert!(failures
            .lock()
            .iter()
            .all(|e| matches!(e, ReplicationError::Store(_))));
        assert_eq!(set.stats().seed_loads, 1);
        assert_eq!(set.stats().seed_failures, 0);
    }

    #[tokio::test]
    async fn superseded_seed_is_discarded() {
        let broker = MemoryBroker::new();
        broker.pause_fetches();
        let (set, mut rx) = node(&broker);
        pump(&set, &mut rx);
        tokio::task::yield_now().await;

        broker.resubscribe_all();
        pump(&set, &mut rx);
        tokio::task::yield_now().await;

        broker.resume_fetches();
        settle(&set, &mut rx).await;

        assert_eq!(set.stats().seed_loads, 1);
        assert_eq!(set.seed_generation(), 1);
    }

    #[tokio::test]
    async fn failed_writes_stay_queued_in_order() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;
        let failures = record_failures(&set);

        broker.fail_writes(true);
        set.add(1).unwrap();
        assert_eq!(set.outbound_len(), 1);
        assert_eq!(failures.lock().len(), 1);
        assert!(set.stats().last_error.is_some());

        broker.fail_writes(false);
        set.add(2).unwrap();

        assert_eq!(set.outbound_len(), 0);
        assert_eq!(
            decode_published(&broker),
            vec![Operation::add(1).unwrap(), Operation::add(2).unwrap()]
        );
    }

    #[tokio::test]
    async fn manual_flush_retries_queue() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;

        broker.fail_writes(true);
        set.add(1).unwrap();
        set.flush();
        assert_eq!(set.outbound_len(), 1);

        broker.fail_writes(false);
        set.flush();
        assert_eq!(set.outbound_len(), 0);
        assert_eq!(decode_published(&broker).len(), 1);
    }

    #[tokio::test]
    async fn remote_operations_are_applied_not_forwarded() {
        let broker = MemoryBroker::new();
        let (a, mut rx_a) = node(&broker);
        let (b, mut rx_b) = node(&broker);
        settle(&a, &mut rx_a).await;
        settle(&b, &mut rx_b).await;

        a.add(3).unwrap();
        pump(&b, &mut rx_b);

        assert_eq!(values(&b), vec![3]);
        assert_eq!(b.stats().remote_operations, 2); // baseline + Add(3)
        assert_eq!(b.stats().forwarded, 0);
        assert_eq!(broker.published(KEY).len(), 1);
    }

    #[tokio::test]
    async fn unrecognized_payloads_are_dropped() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;
        let seen = record_changes(&set);

        broker.inject(KEY, b"garbage".to_vec()).unwrap();
        broker
            .inject(KEY, Operation::add("text".to_string()).unwrap().encode().unwrap())
            .unwrap();
        pump(&set, &mut rx);

        assert!(set.members().is_empty());
        assert!(seen.lock().is_empty());
        assert_eq!(set.stats().dropped_payloads, 2);
    }

    #[tokio::test]
    async fn messages_before_subscription_are_ignored() {
        let broker = MemoryBroker::new();
        let (set, _rx) = node(&broker);

        set.handle(TransportEvent::Message {
            channel: KEY.into(),
            payload: Operation::add(1i64).unwrap().encode().unwrap(),
        });
        assert!(set.members().is_empty());
    }

    #[tokio::test]
    async fn other_channels_are_ignored() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        settle(&set, &mut rx).await;

        set.handle(TransportEvent::Message {
            channel: "elsewhere".into(),
            payload: Operation::add(1i64).unwrap().encode().unwrap(),
        });
        set.handle(TransportEvent::Subscribed {
            channel: "elsewhere".into(),
        });
        assert!(set.members().is_empty());
        assert!(!set.is_loading_seed());
    }

    #[test]
    fn reentrant_listener_keeps_notifications_ordered() {
        let broker = MemoryBroker::new();
        let (set, _rx) = node(&broker);

        let handle = set.clone();
        set.subscribe(move |members| {
            if sorted(members) == vec![1] {
                handle.add(2).unwrap();
            }
        });
        let seen = record_changes(&set);

        set.add(1).unwrap();

        assert_eq!(*seen.lock(), vec![vec![1], vec![1, 2]]);
        assert_eq!(seen.lock().last(), Some(&values(&set)));
    }

    #[test]
    fn concurrent_writers_notify_in_state_order() {
        let broker = MemoryBroker::new();
        let (set, _rx) = node(&broker);

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = parking_lot::Mutex::new(entered_tx);
        set.subscribe(move |members| {
            if sorted(members) == vec![1] {
                let _ = entered_tx.lock().send(());
                std::thread::sleep(Duration::from_millis(50));
            }
        });
        let seen = record_changes(&set);

        let writer = set.clone();
        let first = std::thread::spawn(move || writer.add(1).unwrap());
        // The first writer is now inside a listener with {1}.
        entered_rx.recv().unwrap();
        set.add(2).unwrap();
        first.join().unwrap();

        assert_eq!(*seen.lock(), vec![vec![1], vec![1, 2]]);
        assert_eq!(seen.lock().last(), Some(&values(&set)));
    }

    #[test]
    fn panicking_listener_does_not_stall_later_notifications() {
        let broker = MemoryBroker::new();
        let (set, _rx) = node(&broker);

        set.subscribe(|members| {
            if members.len() == 1 {
                panic!("listener failure");
            }
        });
        let seen = record_changes(&set);

        let panicking = set.clone();
        assert!(std::thread::spawn(move || panicking.add(1)).join().is_err());
        set.add(2).unwrap();

        assert_eq!(seen.lock().last(), Some(&vec![1, 2]));
    }

    #[test]
    fn seed_without_runtime_is_reported() {
        let broker = MemoryBroker::new();
        let (set, mut rx) = node(&broker);
        let failures = record_failures(&set);

        pump(&set, &mut rx);

        assert!(!set.is_loading_seed());
        assert!(matches!(
            failures.lock().as_slice(),
            [ReplicationError::SeedLoadFailed { attempts: 0, .. }]
        ));
    }
}
