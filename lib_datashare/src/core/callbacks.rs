//! # Callbacks Manager
//!
//! Thread-safe bookkeeping of `key -> [ObserverNode]` with first-registrant /
//! last-unregistrant edge detection. The manager never talks to the remote
//! service itself. Every operation does its local bookkeeping under one table
//! mutex, releases it, and only then hands the keys that crossed an edge to a
//! [`SubscriptionPort`], which performs the (slow, blocking) remote call and
//! appends one [`OperationResult`] per key.
//!
//! Whenever the port reports a failure for a key whose local state was already
//! changed, the manager compensates locally so the table never claims a
//! subscription the service does not have (and vice versa):
//!
//! | operation | edge                 | compensation on remote failure |
//! |-----------|----------------------|--------------------------------|
//! | add       | zero → one enabled   | remove the node just added     |
//! | delete    | one → zero nodes     | re-insert the removed nodes    |
//! | enable    | zero → one enabled   | disable the nodes again        |
//! | disable   | one → zero enabled   | enable the nodes again         |
//!
//! A key that the port left out of its results counts as succeeded.
//!
//! Keys that compare equal share one table entry. The keys handed to the port
//! and the keys of the returned results are always the ones the caller passed,
//! never the stored key of an earlier registrant.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::{ErrCode, OperationResult};

/// # Subscriber Id
///
/// Opaque, process-local identity of a caller that owns a set of observers.
/// It is only ever compared, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocates a fresh, never reused id.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        SubscriberId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// A subscription target stored in a [`CallbacksManager`].
///
/// The `Ord` implementation defines key identity; `uri()` is the string used
/// when the key is sent to the service and when results are correlated back.
pub trait ObserverKey: Ord + Clone + fmt::Debug {
    fn uri(&self) -> &str;
}

/// One registration of an observer for a key.
pub struct ObserverNode<O> {
    pub observer: Arc<O>,
    pub subscriber: SubscriberId,
    pub enabled: bool,
    /// Set when a change was delivered to the key while this node was disabled;
    /// the node then gets one replay when it is enabled again.
    pub notify_on_enabled: bool,
}

impl<O> ObserverNode<O> {
    fn new(observer: Arc<O>, subscriber: SubscriberId) -> Self {
        Self {
            observer,
            subscriber,
            enabled: true,
            notify_on_enabled: false,
        }
    }
}

impl<O> Clone for ObserverNode<O> {
    fn clone(&self) -> Self {
        Self {
            observer: Arc::clone(&self.observer),
            subscriber: self.subscriber,
            enabled: self.enabled,
            notify_on_enabled: self.notify_on_enabled,
        }
    }
}

/// An observer that was just enabled, with its pending-replay flag as it was
/// at the moment of enabling.
pub struct ObserverNodeOnEnabled<O> {
    pub observer: Arc<O>,
    pub notify_on_enabled: bool,
}

impl<O> Clone for ObserverNodeOnEnabled<O> {
    fn clone(&self) -> Self {
        Self {
            observer: Arc::clone(&self.observer),
            notify_on_enabled: self.notify_on_enabled,
        }
    }
}

/// # Subscription Port
///
/// The remote side of a [`CallbacksManager`] operation. Every hook is called
/// after the table lock has been released and only with a non-empty key list.
/// Hooks that receive `results` must append one [`OperationResult`] per key,
/// keyed by [`ObserverKey::uri`].
pub trait SubscriptionPort<K, O> {
    /// Keys that already had enabled observers before `observer` was added.
    /// No remote call is needed; this is the place to replay cached values.
    fn on_local_added(&self, _keys: &[K], _observer: &Arc<O>) {}

    /// Keys that had no enabled observer before `observer` was added.
    fn on_first_added(&self, _keys: &[K], _observer: &Arc<O>, _results: &mut Vec<OperationResult>) {}

    /// Keys whose last node was removed.
    fn on_last_removed(&self, _keys: &[K], _results: &mut Vec<OperationResult>) {}

    /// Keys whose enabled count went from zero to at least one.
    fn on_first_enabled(&self, _keys: &[K], _results: &mut Vec<OperationResult>) {}

    /// Observers that were enabled by the call, per key, minus keys rolled back.
    fn on_local_enabled(&self, _enabled: &BTreeMap<K, Vec<ObserverNodeOnEnabled<O>>>) {}

    /// Keys whose enabled count went from at least one to zero.
    fn on_last_disabled(&self, _keys: &[K], _results: &mut Vec<OperationResult>) {}

    /// Re-issue remote state after a reconnect. `enabled` keys have at least one
    /// enabled observer, `disabled` keys have observers that are all disabled.
    fn on_recover(&self, _enabled: &[K], _disabled: &[K]) {}
}

/// A port that performs no remote work. Useful for purely local bookkeeping.
pub struct LocalOnly;

impl<K, O> SubscriptionPort<K, O> for LocalOnly {}

type CallbackTable<K, O> = BTreeMap<K, Vec<ObserverNode<O>>>;

/// # Callbacks Manager
///
/// See the module documentation for the edge-detection and rollback rules.
pub struct CallbacksManager<K, O> {
    callbacks: Mutex<CallbackTable<K, O>>,
}

impl<K: ObserverKey, O> Default for CallbacksManager<K, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ObserverKey, O> CallbacksManager<K, O> {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallbackTable<K, O>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true unless `results` holds a failure for `key`.
    pub fn are_all_ops_succeeded(results: &[OperationResult], key: &K) -> bool {
        !results
            .iter()
            .any(|result| result.key == key.uri() && !result.err_code.is_ok())
    }

    fn failed_keys(keys: &[K], remote_results: &[OperationResult]) -> Vec<K> {
        let mut failed = Vec::new();
        for key in keys {
            if !remote_results.iter().any(|result| result.key == key.uri()) {
                log::debug!("No remote result reported for {:?}, treating as succeeded", key);
                continue;
            }
            if !Self::are_all_ops_succeeded(remote_results, key) {
                failed.push(key.clone());
            }
        }
        failed
    }

    /// # Add Observers
    ///
    /// Appends `(observer, subscriber, enabled)` to every key. Keys that already
    /// had an enabled observer succeed immediately and are passed to
    /// [`SubscriptionPort::on_local_added`]; the rest are passed to
    /// [`SubscriptionPort::on_first_added`]. A key the port reports as failed
    /// loses the node added here.
    pub fn add_observers<P>(
        &self,
        keys: &[K],
        subscriber: SubscriberId,
        observer: Arc<O>,
        port: &P,
    ) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let mut results = Vec::with_capacity(keys.len());
        let mut first_add_keys = Vec::new();
        let mut local_add_keys = Vec::new();
        {
            let mut table = self.lock();
            for key in keys {
                let stored = table.get_key_value(key).map(|(k, _)| k.clone()).unwrap_or_else(|| key.clone());
                let nodes = table.entry(stored.clone()).or_default();
                let had_enabled = nodes.iter().any(|node| node.enabled);
                nodes.push(ObserverNode::new(Arc::clone(&observer), subscriber));
                if had_enabled {
                    local_add_keys.push(key.clone());
                    results.push(OperationResult::ok(key.uri()));
                } else {
                    first_add_keys.push(key.clone());
                }
            }
        }

        if !local_add_keys.is_empty() {
            port.on_local_added(&local_add_keys, &observer);
        }
        if first_add_keys.is_empty() {
            return results;
        }

        let remote_start = results.len();
        port.on_first_added(&first_add_keys, &observer, &mut results);
        let failed = Self::failed_keys(&first_add_keys, &results[remote_start..]);
        if !failed.is_empty() {
            self.rollback_add(&failed, subscriber, &observer);
        }
        results
    }

    fn rollback_add(&self, keys: &[K], subscriber: SubscriberId, observer: &Arc<O>) {
        let mut table = self.lock();
        for key in keys {
            log::warn!("Remote register failed for {:?}, removing local observer", key);
            let now_empty = match table.get_mut(key) {
                Some(nodes) => {
                    if let Some(pos) = nodes
                        .iter()
                        .rposition(|node| node.subscriber == subscriber && Arc::ptr_eq(&node.observer, observer))
                    {
                        nodes.remove(pos);
                    }
                    nodes.is_empty()
                }
                None => false,
            };
            if now_empty {
                table.remove(key);
            }
        }
    }

    /// # Delete Observers
    ///
    /// Removes every node of `subscriber` under each key. Keys left without
    /// nodes are erased and passed to [`SubscriptionPort::on_last_removed`];
    /// keys the port reports as failed get their nodes back.
    pub fn del_observers<P>(&self, keys: &[K], subscriber: SubscriberId, port: &P) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let mut results = Vec::with_capacity(keys.len());
        let mut last_del_keys = Vec::new();
        let mut removed = BTreeMap::new();
        {
            let mut table = self.lock();
            for key in keys {
                Self::del_local_observers(&mut table, key, subscriber, &mut last_del_keys, &mut results, &mut removed);
            }
        }
        self.finish_del(last_del_keys, removed, results, port)
    }

    /// Removes every node owned by `subscriber`, under any key.
    pub fn del_observers_of<P>(&self, subscriber: SubscriberId, port: &P) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let mut results = Vec::new();
        let mut last_del_keys = Vec::new();
        let mut removed = BTreeMap::new();
        {
            let mut table = self.lock();
            let owned: Vec<K> = table
                .iter()
                .filter(|(_, nodes)| nodes.iter().any(|node| node.subscriber == subscriber))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &owned {
                Self::del_local_observers(&mut table, key, subscriber, &mut last_del_keys, &mut results, &mut removed);
            }
        }
        self.finish_del(last_del_keys, removed, results, port)
    }

    fn del_local_observers(
        table: &mut CallbackTable<K, O>,
        key: &K,
        subscriber: SubscriberId,
        last_del_keys: &mut Vec<K>,
        results: &mut Vec<OperationResult>,
        removed: &mut BTreeMap<K, Vec<ObserverNode<O>>>,
    ) {
        let stored = match table.get_key_value(key) {
            Some((stored, _)) => stored.clone(),
            None => {
                results.push(OperationResult::new(key.uri(), ErrCode::UnregisteredEmpty));
                return;
            }
        };
        let Some(nodes) = table.get_mut(&stored) else {
            return;
        };
        let (gone, kept): (Vec<_>, Vec<_>) = nodes.drain(..).partition(|node| node.subscriber == subscriber);
        *nodes = kept;
        if !nodes.is_empty() {
            results.push(OperationResult::ok(key.uri()));
            return;
        }
        table.remove(&stored);
        removed.entry(key.clone()).or_insert_with(Vec::new).extend(gone);
        last_del_keys.push(key.clone());
    }

    fn finish_del<P>(
        &self,
        last_del_keys: Vec<K>,
        removed: BTreeMap<K, Vec<ObserverNode<O>>>,
        mut results: Vec<OperationResult>,
        port: &P,
    ) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        if last_del_keys.is_empty() {
            return results;
        }
        let remote_start = results.len();
        port.on_last_removed(&last_del_keys, &mut results);
        self.recover_local_observers(removed, &results[remote_start..]);
        results
    }

    fn recover_local_observers(&self, removed: BTreeMap<K, Vec<ObserverNode<O>>>, remote_results: &[OperationResult]) {
        let failed = Self::failed_keys(&removed.keys().cloned().collect::<Vec<_>>(), remote_results);
        if failed.is_empty() {
            return;
        }
        let mut table = self.lock();
        for (key, nodes) in removed {
            if !failed.contains(&key) {
                continue;
            }
            log::warn!("Remote unregister failed for {:?}, restoring {} local observer(s)", key, nodes.len());
            table.entry(key).or_default().extend(nodes);
        }
    }

    /// # Enable Observers
    ///
    /// Enables the disabled nodes of `subscriber`. Keys whose enabled count
    /// leaves zero go to [`SubscriptionPort::on_first_enabled`]; failures are
    /// disabled again. All nodes enabled for good are then handed to
    /// [`SubscriptionPort::on_local_enabled`] for replay.
    pub fn enable_observers<P>(&self, keys: &[K], subscriber: SubscriberId, port: &P) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let mut results = Vec::with_capacity(keys.len());
        let mut send_service_keys = Vec::new();
        let mut refreshed: BTreeMap<K, Vec<ObserverNodeOnEnabled<O>>> = BTreeMap::new();
        {
            let mut table = self.lock();
            for key in keys {
                let stored = match table.get_key_value(key) {
                    Some((stored, _)) => stored.clone(),
                    None => {
                        results.push(OperationResult::new(key.uri(), ErrCode::SubscriberNotExist));
                        continue;
                    }
                };
                let Some(nodes) = table.get_mut(&stored) else {
                    continue;
                };
                if !nodes.iter().any(|node| node.subscriber == subscriber) {
                    results.push(OperationResult::new(key.uri(), ErrCode::SubscriberNotExist));
                    continue;
                }
                if !nodes.iter().any(|node| node.subscriber == subscriber && !node.enabled) {
                    results.push(OperationResult::ok(key.uri()));
                    continue;
                }
                let had_enabled = nodes.iter().any(|node| node.enabled);
                let entry = refreshed.entry(key.clone()).or_default();
                for node in nodes.iter_mut().filter(|node| node.subscriber == subscriber && !node.enabled) {
                    entry.push(ObserverNodeOnEnabled {
                        observer: Arc::clone(&node.observer),
                        notify_on_enabled: node.notify_on_enabled,
                    });
                    node.enabled = true;
                    node.notify_on_enabled = false;
                }
                if had_enabled {
                    results.push(OperationResult::ok(key.uri()));
                } else {
                    send_service_keys.push(key.clone());
                }
            }
        }

        if !send_service_keys.is_empty() {
            let remote_start = results.len();
            port.on_first_enabled(&send_service_keys, &mut results);
            for key in Self::failed_keys(&send_service_keys, &results[remote_start..]) {
                if let Some(enabled) = refreshed.remove(&key) {
                    self.rollback_enable(&key, subscriber, &enabled);
                }
            }
        }
        if !refreshed.is_empty() {
            port.on_local_enabled(&refreshed);
        }
        results
    }

    fn rollback_enable(&self, key: &K, subscriber: SubscriberId, enabled: &[ObserverNodeOnEnabled<O>]) {
        log::warn!("Remote enable failed for {:?}, disabling local observers again", key);
        let mut table = self.lock();
        let Some(nodes) = table.get_mut(key) else {
            return;
        };
        for node in nodes.iter_mut().filter(|node| node.subscriber == subscriber) {
            if let Some(before) = enabled.iter().find(|e| Arc::ptr_eq(&e.observer, &node.observer)) {
                node.enabled = false;
                node.notify_on_enabled = before.notify_on_enabled;
            }
        }
    }

    /// # Disable Observers
    ///
    /// Disables every node of `subscriber`. Keys whose enabled count reaches
    /// zero go to [`SubscriptionPort::on_last_disabled`]; failures are enabled
    /// again. The remote registration itself is kept.
    pub fn disable_observers<P>(&self, keys: &[K], subscriber: SubscriberId, port: &P) -> Vec<OperationResult>
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let mut results = Vec::with_capacity(keys.len());
        let mut last_disabled_keys = Vec::new();
        let mut flipped: BTreeMap<K, Vec<Arc<O>>> = BTreeMap::new();
        {
            let mut table = self.lock();
            for key in keys {
                let stored = match table.get_key_value(key) {
                    Some((stored, _)) => stored.clone(),
                    None => {
                        results.push(OperationResult::new(key.uri(), ErrCode::SubscriberNotExist));
                        continue;
                    }
                };
                let Some(nodes) = table.get_mut(&stored) else {
                    continue;
                };
                if !nodes.iter().any(|node| node.enabled) {
                    results.push(OperationResult::new(key.uri(), ErrCode::SubscriberNotExist));
                    continue;
                }
                let mut has_disabled = false;
                for node in nodes.iter_mut().filter(|node| node.subscriber == subscriber) {
                    if node.enabled {
                        flipped.entry(key.clone()).or_default().push(Arc::clone(&node.observer));
                    }
                    node.enabled = false;
                    node.notify_on_enabled = false;
                    has_disabled = true;
                }
                if !has_disabled {
                    results.push(OperationResult::new(key.uri(), ErrCode::SubscriberNotExist));
                    continue;
                }
                if nodes.iter().any(|node| node.enabled) {
                    results.push(OperationResult::ok(key.uri()));
                    continue;
                }
                last_disabled_keys.push(key.clone());
            }
        }

        if last_disabled_keys.is_empty() {
            return results;
        }
        let remote_start = results.len();
        port.on_last_disabled(&last_disabled_keys, &mut results);
        for key in Self::failed_keys(&last_disabled_keys, &results[remote_start..]) {
            if let Some(observers) = flipped.get(&key) {
                self.rollback_disable(&key, subscriber, observers);
            }
        }
        results
    }

    fn rollback_disable(&self, key: &K, subscriber: SubscriberId, observers: &[Arc<O>]) {
        log::warn!("Remote disable failed for {:?}, enabling local observers again", key);
        let mut table = self.lock();
        let Some(nodes) = table.get_mut(key) else {
            return;
        };
        for node in nodes.iter_mut().filter(|node| node.subscriber == subscriber) {
            if observers.iter().any(|observer| Arc::ptr_eq(observer, &node.observer)) {
                node.enabled = true;
            }
        }
    }

    /// Snapshot of the enabled observers of `key`, in registration order.
    pub fn get_enabled_observers(&self, key: &K) -> Vec<Arc<O>> {
        let table = self.lock();
        table
            .get(key)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|node| node.enabled)
                    .map(|node| Arc::clone(&node.observer))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of enabled nodes over all keys.
    pub fn enabled_subscriber_size(&self) -> usize {
        let table = self.lock();
        table
            .values()
            .map(|nodes| nodes.iter().filter(|node| node.enabled).count())
            .sum()
    }

    /// Number of enabled nodes of `key`.
    pub fn enabled_subscriber_size_for(&self, key: &K) -> usize {
        let table = self.lock();
        table
            .get(key)
            .map(|nodes| nodes.iter().filter(|node| node.enabled).count())
            .unwrap_or(0)
    }

    /// All keys currently holding at least one node.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Marks the disabled nodes of `key` as having missed a delivery.
    ///
    /// Called right after a live delivery to the enabled nodes; the marked
    /// nodes get exactly one replay of the cached change when re-enabled.
    pub fn set_observers_notified_on_enabled(&self, key: &K) {
        let mut table = self.lock();
        let Some(nodes) = table.get_mut(key) else {
            return;
        };
        let mut pending = 0usize;
        for node in nodes.iter_mut().filter(|node| !node.enabled) {
            node.notify_on_enabled = true;
            pending += 1;
        }
        if pending > 0 {
            log::info!("total {}, not refreshed {}", nodes.len(), pending);
        }
    }

    /// # Recover Observers
    ///
    /// Hands every key to [`SubscriptionPort::on_recover`], split by whether it
    /// still has an enabled observer. Used after the service connection was
    /// re-established.
    pub fn recover_observers<P>(&self, port: &P)
    where
        P: SubscriptionPort<K, O> + ?Sized,
    {
        let (enabled, disabled): (Vec<K>, Vec<K>) = {
            let table = self.lock();
            let (enabled, disabled): (Vec<_>, Vec<_>) = table
                .iter()
                .partition(|(_, nodes)| nodes.iter().any(|node| node.enabled));
            (
                enabled.into_iter().map(|(key, _)| key.clone()).collect(),
                disabled.into_iter().map(|(key, _)| key.clone()).collect(),
            )
        };
        if enabled.is_empty() && disabled.is_empty() {
            return;
        }
        port.on_recover(&enabled, &disabled);
    }
}
