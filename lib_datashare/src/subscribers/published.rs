//! # Published Data Subscriber Manager
//!
//! Subscriptions to values published by other bundles, keyed by clean URI and
//! the subscriber id the value is published for. A single push may carry items
//! for many keys; every enabled observer receives one change node holding just
//! the items it subscribed to, in push order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::callbacks::{CallbacksManager, ObserverKey, ObserverNodeOnEnabled, SubscriberId, SubscriptionPort};
use crate::core::template::{anonymous, clean_uri, PublishedDataChangeNode, PublishedDataItem};
use crate::errors::OperationResult;
use crate::proxy::service::DataShareService;
use crate::proxy::stub::{PublishedDataDispatch, PublishedDataObserverStub};
use crate::subscribers::{lock, log_remote_failures, merge_remote_results};

/// Subscription target of a published data item.
#[derive(Debug, Clone)]
pub struct PublishedObserverMapKey {
    uri: String,
    clean_uri: String,
    subscriber_id: i64,
}

impl PublishedObserverMapKey {
    pub fn new(uri: &str, subscriber_id: i64) -> Self {
        Self {
            uri: uri.to_string(),
            clean_uri: clean_uri(uri).to_string(),
            subscriber_id,
        }
    }

    pub fn subscriber_id(&self) -> i64 {
        self.subscriber_id
    }
}

impl PartialEq for PublishedObserverMapKey {
    fn eq(&self, other: &Self) -> bool {
        self.clean_uri == other.clean_uri && self.subscriber_id == other.subscriber_id
    }
}

impl Eq for PublishedObserverMapKey {}

impl PartialOrd for PublishedObserverMapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublishedObserverMapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clean_uri
            .cmp(&other.clean_uri)
            .then_with(|| self.subscriber_id.cmp(&other.subscriber_id))
    }
}

impl ObserverKey for PublishedObserverMapKey {
    fn uri(&self) -> &str {
        &self.uri
    }
}

pub struct PublishedDataObserver {
    callback: Box<dyn Fn(&PublishedDataChangeNode) + Send + Sync>,
}

impl PublishedDataObserver {
    pub fn new(callback: impl Fn(&PublishedDataChangeNode) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn on_change(&self, change_node: &PublishedDataChangeNode) {
        (self.callback)(change_node);
    }
}

type Callbacks = CallbacksManager<PublishedObserverMapKey, PublishedDataObserver>;

fn group_by_subscriber(keys: &[PublishedObserverMapKey]) -> BTreeMap<i64, Vec<String>> {
    let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for key in keys {
        groups.entry(key.subscriber_id).or_default().push(key.uri.clone());
    }
    groups
}

/// Adds `item` to the node of `owner`, creating the node on first use.
fn push_item(nodes: &mut Vec<PublishedDataChangeNode>, owner: &str, item: PublishedDataItem) {
    match nodes.iter_mut().find(|node| node.owner_bundle_name == owner) {
        Some(node) => node.datas.push(item),
        None => nodes.push(PublishedDataChangeNode {
            owner_bundle_name: owner.to_string(),
            datas: vec![item],
        }),
    }
}

/// # Published Data Subscriber Manager
pub struct PublishedDataSubscriberManager {
    callbacks: Callbacks,
    /// Last item pushed per key, with the bundle that published it.
    last_change: Mutex<BTreeMap<PublishedObserverMapKey, (String, PublishedDataItem)>>,
    service_callback: Mutex<Option<Arc<PublishedDataObserverStub>>>,
    weak_self: Weak<PublishedDataSubscriberManager>,
}

impl PublishedDataSubscriberManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            callbacks: CallbacksManager::new(),
            last_change: Mutex::new(BTreeMap::new()),
            service_callback: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn keys_of<S: AsRef<str>>(uris: &[S], subscriber_id: i64) -> Vec<PublishedObserverMapKey> {
        uris.iter()
            .map(|uri| PublishedObserverMapKey::new(uri.as_ref(), subscriber_id))
            .collect()
    }

    pub fn add_observers<S, F>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        subscriber_id: i64,
        callback: F,
    ) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&PublishedDataChangeNode) + Send + Sync + 'static,
    {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, published data subscribe skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, subscriber_id);
        let port = PublishedRemote { manager: self, proxy };
        let results = self
            .callbacks
            .add_observers(&keys, subscriber, Arc::new(PublishedDataObserver::new(callback)), &port);
        self.destroy();
        results
    }

    /// An empty `uris` removes every published data subscription of `subscriber`.
    pub fn del_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        subscriber_id: i64,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, published data unsubscribe skipped");
            return Vec::new();
        };
        if uris.is_empty() {
            return self.del_observers_of(subscriber, Some(proxy));
        }
        let keys = Self::keys_of(uris, subscriber_id);
        let results = self
            .callbacks
            .del_observers(&keys, subscriber, &PublishedRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn del_observers_of(&self, subscriber: SubscriberId, proxy: Option<&dyn DataShareService>) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, published data unsubscribe skipped");
            return Vec::new();
        };
        let results = self
            .callbacks
            .del_observers_of(subscriber, &PublishedRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn enable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        subscriber_id: i64,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, published data enable skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, subscriber_id);
        let results = self
            .callbacks
            .enable_observers(&keys, subscriber, &PublishedRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn disable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        subscriber_id: i64,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, published data disable skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, subscriber_id);
        let results = self
            .callbacks
            .disable_observers(&keys, subscriber, &PublishedRemote { manager: self, proxy });
        self.destroy();
        results
    }

    /// Re-registers every known key, one batch per subscriber id.
    pub fn recover_observers(&self, proxy: &dyn DataShareService) {
        self.callbacks.recover_observers(&PublishedRemote { manager: self, proxy });
        self.destroy();
    }

    /// Entry point for pushes from the service.
    pub fn emit(&self, change_node: &PublishedDataChangeNode) {
        let mut grouped: Vec<(Arc<PublishedDataObserver>, PublishedDataChangeNode)> = Vec::new();
        let mut touched = Vec::with_capacity(change_node.datas.len());
        for data in &change_node.datas {
            let key = PublishedObserverMapKey::new(&data.key, data.subscriber_id);
            if self.callbacks.contains(&key) {
                lock(&self.last_change).insert(key.clone(), (change_node.owner_bundle_name.clone(), data.clone()));
            }
            let observers = self.callbacks.get_enabled_observers(&key);
            if observers.is_empty() {
                log::warn!("{} nobody subscribe, but still notify", anonymous(&data.key));
            }
            for observer in observers {
                match grouped.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &observer)) {
                    Some((_, node)) => node.datas.push(data.clone()),
                    None => grouped.push((
                        observer,
                        PublishedDataChangeNode {
                            owner_bundle_name: change_node.owner_bundle_name.clone(),
                            datas: vec![data.clone()],
                        },
                    )),
                }
            }
            touched.push(key);
        }
        for (observer, node) in &grouped {
            observer.on_change(node);
        }
        for key in &touched {
            self.callbacks.set_observers_notified_on_enabled(key);
        }
    }

    pub fn enabled_subscriber_size(&self) -> usize {
        self.callbacks.enabled_subscriber_size()
    }

    pub fn enabled_observers(&self, uri: &str, subscriber_id: i64) -> usize {
        self.callbacks
            .enabled_subscriber_size_for(&PublishedObserverMapKey::new(uri, subscriber_id))
    }

    pub fn has_service_callback(&self) -> bool {
        lock(&self.service_callback)
            .as_ref()
            .is_some_and(|stub| stub.is_attached())
    }

    /// Cached items for `keys`, one node per publishing bundle.
    fn replay_nodes<'k>(&self, keys: impl IntoIterator<Item = &'k PublishedObserverMapKey>) -> Vec<PublishedDataChangeNode> {
        let last_change = lock(&self.last_change);
        let mut nodes = Vec::new();
        for key in keys {
            if let Some((owner, item)) = last_change.get(key) {
                push_item(&mut nodes, owner, item.clone());
            }
        }
        nodes
    }

    fn forget(&self, keys: &[PublishedObserverMapKey], remote_results: &[OperationResult]) {
        let mut last_change = lock(&self.last_change);
        for key in keys {
            if Callbacks::are_all_ops_succeeded(remote_results, key) {
                last_change.remove(key);
            }
        }
    }

    fn dispatch(&self) -> PublishedDataDispatch {
        let weak_self = self.weak_self.clone();
        Arc::new(move |change_node: &PublishedDataChangeNode| {
            if let Some(manager) = weak_self.upgrade() {
                manager.emit(change_node);
            }
        })
    }

    fn init(&self) -> Arc<PublishedDataObserverStub> {
        let mut slot = lock(&self.service_callback);
        if let Some(stub) = slot.as_ref() {
            if !stub.is_attached() {
                log::info!("published data callback reattached");
                stub.set_callback(self.dispatch());
            }
            return Arc::clone(stub);
        }
        log::info!("published data callback init");
        let stub = Arc::new(PublishedDataObserverStub::new(self.dispatch()));
        *slot = Some(Arc::clone(&stub));
        stub
    }

    fn destroy(&self) {
        let mut slot = lock(&self.service_callback);
        if self.callbacks.enabled_subscriber_size() != 0 {
            return;
        }
        if let Some(stub) = slot.as_ref() {
            if stub.is_attached() {
                stub.clear_callback();
                log::info!("no valid published data subscriber, delete callback");
            }
        }
        if self.callbacks.is_empty() {
            *slot = None;
        }
    }
}

struct PublishedRemote<'a> {
    manager: &'a PublishedDataSubscriberManager,
    proxy: &'a dyn DataShareService,
}

impl SubscriptionPort<PublishedObserverMapKey, PublishedDataObserver> for PublishedRemote<'_> {
    fn on_local_added(&self, keys: &[PublishedObserverMapKey], observer: &Arc<PublishedDataObserver>) {
        for node in self.manager.replay_nodes(keys) {
            observer.on_change(&node);
        }
    }

    fn on_first_added(
        &self,
        keys: &[PublishedObserverMapKey],
        _: &Arc<PublishedDataObserver>,
        results: &mut Vec<OperationResult>,
    ) {
        let stub = self.manager.init();
        for (subscriber_id, uris) in group_by_subscriber(keys) {
            let remote = self.proxy.subscribe_published_data(&uris, subscriber_id, Arc::clone(&stub));
            merge_remote_results("published data subscribe", remote, results);
        }
    }

    fn on_last_removed(&self, keys: &[PublishedObserverMapKey], results: &mut Vec<OperationResult>) {
        let remote_start = results.len();
        for (subscriber_id, uris) in group_by_subscriber(keys) {
            let remote = self.proxy.unsubscribe_published_data(&uris, subscriber_id);
            merge_remote_results("published data unsubscribe", remote, results);
        }
        self.manager.forget(keys, &results[remote_start..]);
    }

    fn on_first_enabled(&self, keys: &[PublishedObserverMapKey], results: &mut Vec<OperationResult>) {
        self.manager.init();
        for (subscriber_id, uris) in group_by_subscriber(keys) {
            let remote = self.proxy.enable_subscribe_published_data(&uris, subscriber_id);
            merge_remote_results("published data enable", remote, results);
        }
    }

    fn on_local_enabled(
        &self,
        enabled: &BTreeMap<PublishedObserverMapKey, Vec<ObserverNodeOnEnabled<PublishedDataObserver>>>,
    ) {
        // Group the pending keys per observer so each gets one replay per bundle.
        let mut pending: Vec<(Arc<PublishedDataObserver>, Vec<&PublishedObserverMapKey>)> = Vec::new();
        for (key, nodes) in enabled {
            for node in nodes.iter().filter(|node| node.notify_on_enabled) {
                match pending.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &node.observer)) {
                    Some((_, keys)) => keys.push(key),
                    None => pending.push((Arc::clone(&node.observer), vec![key])),
                }
            }
        }
        for (observer, keys) in pending {
            for node in self.manager.replay_nodes(keys) {
                observer.on_change(&node);
            }
        }
    }

    fn on_last_disabled(&self, keys: &[PublishedObserverMapKey], results: &mut Vec<OperationResult>) {
        for (subscriber_id, uris) in group_by_subscriber(keys) {
            let remote = self.proxy.disable_subscribe_published_data(&uris, subscriber_id);
            merge_remote_results("published data disable", remote, results);
        }
    }

    fn on_recover(&self, enabled: &[PublishedObserverMapKey], disabled: &[PublishedObserverMapKey]) {
        let stub = self.manager.init();
        let all: Vec<PublishedObserverMapKey> = enabled.iter().chain(disabled).cloned().collect();
        for (subscriber_id, uris) in group_by_subscriber(&all) {
            log::info!("recover {} published data subscription(s) for {}", uris.len(), subscriber_id);
            let remote = self.proxy.subscribe_published_data(&uris, subscriber_id, Arc::clone(&stub));
            log_remote_failures("published data recover", &remote);
        }
        for (subscriber_id, uris) in group_by_subscriber(disabled) {
            let remote = self.proxy.disable_subscribe_published_data(&uris, subscriber_id);
            log_remote_failures("published data recover disable", &remote);
        }
    }
}
