//! # RDB Subscriber Manager
//!
//! Template query subscriptions. A key is a URI plus the [`TemplateId`] the
//! query runs under; URIs that differ only in their query string address the
//! same subscription. The last change delivered for a key is cached and
//! replayed to observers that join an already subscribed key or come back from
//! being disabled.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::callbacks::{CallbacksManager, ObserverKey, ObserverNodeOnEnabled, SubscriberId, SubscriptionPort};
use crate::core::template::{clean_uri, RdbChangeNode, TemplateId};
use crate::errors::OperationResult;
use crate::proxy::service::DataShareService;
use crate::proxy::stub::{RdbDispatch, RdbObserverStub};
use crate::subscribers::{lock, log_remote_failures, merge_remote_results};

/// Subscription target of an RDB template query.
#[derive(Debug, Clone)]
pub struct RdbObserverMapKey {
    uri: String,
    clean_uri: String,
    template_id: TemplateId,
}

impl RdbObserverMapKey {
    pub fn new(uri: &str, template_id: &TemplateId) -> Self {
        Self {
            uri: uri.to_string(),
            clean_uri: clean_uri(uri).to_string(),
            template_id: template_id.clone(),
        }
    }

    pub fn template_id(&self) -> &TemplateId {
        &self.template_id
    }

    pub fn clean_uri(&self) -> &str {
        &self.clean_uri
    }
}

impl PartialEq for RdbObserverMapKey {
    fn eq(&self, other: &Self) -> bool {
        self.clean_uri == other.clean_uri && self.template_id == other.template_id
    }
}

impl Eq for RdbObserverMapKey {}

impl PartialOrd for RdbObserverMapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RdbObserverMapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clean_uri
            .cmp(&other.clean_uri)
            .then_with(|| self.template_id.cmp(&other.template_id))
    }
}

impl ObserverKey for RdbObserverMapKey {
    fn uri(&self) -> &str {
        &self.uri
    }
}

/// Wraps the consumer callback of one RDB subscription.
pub struct RdbObserver {
    callback: Box<dyn Fn(&RdbChangeNode) + Send + Sync>,
}

impl RdbObserver {
    pub fn new(callback: impl Fn(&RdbChangeNode) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn on_change(&self, change_node: &RdbChangeNode) {
        (self.callback)(change_node);
    }
}

type Callbacks = CallbacksManager<RdbObserverMapKey, RdbObserver>;

fn group_by_template(keys: &[RdbObserverMapKey]) -> BTreeMap<TemplateId, Vec<String>> {
    let mut groups: BTreeMap<TemplateId, Vec<String>> = BTreeMap::new();
    for key in keys {
        groups.entry(key.template_id.clone()).or_default().push(key.uri.clone());
    }
    groups
}

/// # RDB Subscriber Manager
pub struct RdbSubscriberManager {
    callbacks: Callbacks,
    last_change: Mutex<BTreeMap<RdbObserverMapKey, RdbChangeNode>>,
    service_callback: Mutex<Option<Arc<RdbObserverStub>>>,
    weak_self: Weak<RdbSubscriberManager>,
}

impl RdbSubscriberManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            callbacks: CallbacksManager::new(),
            last_change: Mutex::new(BTreeMap::new()),
            service_callback: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn keys_of<S: AsRef<str>>(uris: &[S], template_id: &TemplateId) -> Vec<RdbObserverMapKey> {
        uris.iter()
            .map(|uri| RdbObserverMapKey::new(uri.as_ref(), template_id))
            .collect()
    }

    /// Subscribes `callback` to every URI under `template_id`.
    pub fn add_observers<S, F>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        template_id: &TemplateId,
        callback: F,
    ) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&RdbChangeNode) + Send + Sync + 'static,
    {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, rdb subscribe skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, template_id);
        let port = RdbRemote { manager: self, proxy };
        let results = self
            .callbacks
            .add_observers(&keys, subscriber, Arc::new(RdbObserver::new(callback)), &port);
        self.destroy();
        results
    }

    /// Unsubscribes `subscriber` from every URI. An empty `uris` removes all
    /// RDB subscriptions of `subscriber`, whatever their template.
    pub fn del_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        template_id: &TemplateId,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, rdb unsubscribe skipped");
            return Vec::new();
        };
        if uris.is_empty() {
            return self.del_observers_of(subscriber, Some(proxy));
        }
        let keys = Self::keys_of(uris, template_id);
        let results = self
            .callbacks
            .del_observers(&keys, subscriber, &RdbRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn del_observers_of(&self, subscriber: SubscriberId, proxy: Option<&dyn DataShareService>) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, rdb unsubscribe skipped");
            return Vec::new();
        };
        let results = self
            .callbacks
            .del_observers_of(subscriber, &RdbRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn enable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        template_id: &TemplateId,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, rdb enable skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, template_id);
        let results = self
            .callbacks
            .enable_observers(&keys, subscriber, &RdbRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn disable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        template_id: &TemplateId,
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, rdb disable skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris, template_id);
        let results = self
            .callbacks
            .disable_observers(&keys, subscriber, &RdbRemote { manager: self, proxy });
        self.destroy();
        results
    }

    /// Re-registers every known key with a freshly connected service, one
    /// batch per template. Keys whose observers are all disabled are
    /// re-registered and then disabled again.
    pub fn recover_observers(&self, proxy: &dyn DataShareService) {
        self.callbacks.recover_observers(&RdbRemote { manager: self, proxy });
        self.destroy();
    }

    /// Entry point for pushes from the service.
    pub fn emit(&self, change_node: &RdbChangeNode) {
        let key = RdbObserverMapKey::new(&change_node.uri, &change_node.template_id);
        if self.callbacks.contains(&key) {
            lock(&self.last_change).insert(key.clone(), change_node.clone());
        }
        for observer in self.callbacks.get_enabled_observers(&key) {
            observer.on_change(change_node);
        }
        self.callbacks.set_observers_notified_on_enabled(&key);
    }

    pub fn enabled_subscriber_size(&self) -> usize {
        self.callbacks.enabled_subscriber_size()
    }

    pub fn enabled_observers(&self, uri: &str, template_id: &TemplateId) -> usize {
        self.callbacks
            .enabled_subscriber_size_for(&RdbObserverMapKey::new(uri, template_id))
    }

    /// True while a stub exists and forwards pushes to this manager.
    pub fn has_service_callback(&self) -> bool {
        lock(&self.service_callback)
            .as_ref()
            .is_some_and(|stub| stub.is_attached())
    }

    fn cached(&self, key: &RdbObserverMapKey) -> Option<RdbChangeNode> {
        lock(&self.last_change).get(key).cloned()
    }

    fn forget(&self, keys: &[RdbObserverMapKey], remote_results: &[OperationResult]) {
        let mut last_change = lock(&self.last_change);
        for key in keys {
            if Callbacks::are_all_ops_succeeded(remote_results, key) {
                last_change.remove(key);
            }
        }
    }

    fn dispatch(&self) -> RdbDispatch {
        let weak_self = self.weak_self.clone();
        Arc::new(move |change_node: &RdbChangeNode| {
            if let Some(manager) = weak_self.upgrade() {
                manager.emit(change_node);
            }
        })
    }

    fn init(&self) -> Arc<RdbObserverStub> {
        let mut slot = lock(&self.service_callback);
        if let Some(stub) = slot.as_ref() {
            if !stub.is_attached() {
                log::info!("rdb callback reattached");
                stub.set_callback(self.dispatch());
            }
            return Arc::clone(stub);
        }
        log::info!("rdb callback init");
        let stub = Arc::new(RdbObserverStub::new(self.dispatch()));
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
                log::info!("no valid rdb subscriber, delete callback");
            }
        }
        if self.callbacks.is_empty() {
            *slot = None;
        }
    }
}

/// Remote half of every RDB table operation.
struct RdbRemote<'a> {
    manager: &'a RdbSubscriberManager,
    proxy: &'a dyn DataShareService,
}

impl SubscriptionPort<RdbObserverMapKey, RdbObserver> for RdbRemote<'_> {
    fn on_local_added(&self, keys: &[RdbObserverMapKey], observer: &Arc<RdbObserver>) {
        for key in keys {
            if let Some(change_node) = self.manager.cached(key) {
                observer.on_change(&change_node);
            }
        }
    }

    fn on_first_added(&self, keys: &[RdbObserverMapKey], _: &Arc<RdbObserver>, results: &mut Vec<OperationResult>) {
        let stub = self.manager.init();
        for (template_id, uris) in group_by_template(keys) {
            let remote = self.proxy.subscribe_rdb_data(&uris, &template_id, Arc::clone(&stub));
            merge_remote_results("rdb subscribe", remote, results);
        }
    }

    fn on_last_removed(&self, keys: &[RdbObserverMapKey], results: &mut Vec<OperationResult>) {
        let remote_start = results.len();
        for (template_id, uris) in group_by_template(keys) {
            let remote = self.proxy.unsubscribe_rdb_data(&uris, &template_id);
            merge_remote_results("rdb unsubscribe", remote, results);
        }
        self.manager.forget(keys, &results[remote_start..]);
    }

    fn on_first_enabled(&self, keys: &[RdbObserverMapKey], results: &mut Vec<OperationResult>) {
        self.manager.init();
        for (template_id, uris) in group_by_template(keys) {
            let remote = self.proxy.enable_subscribe_rdb_data(&uris, &template_id);
            merge_remote_results("rdb enable", remote, results);
        }
    }

    fn on_local_enabled(&self, enabled: &BTreeMap<RdbObserverMapKey, Vec<ObserverNodeOnEnabled<RdbObserver>>>) {
        for (key, nodes) in enabled {
            let Some(change_node) = self.manager.cached(key) else {
                continue;
            };
            for node in nodes.iter().filter(|node| node.notify_on_enabled) {
                node.observer.on_change(&change_node);
            }
        }
    }

    fn on_last_disabled(&self, keys: &[RdbObserverMapKey], results: &mut Vec<OperationResult>) {
        for (template_id, uris) in group_by_template(keys) {
            let remote = self.proxy.disable_subscribe_rdb_data(&uris, &template_id);
            merge_remote_results("rdb disable", remote, results);
        }
    }

    fn on_recover(&self, enabled: &[RdbObserverMapKey], disabled: &[RdbObserverMapKey]) {
        let stub = self.manager.init();
        let all: Vec<RdbObserverMapKey> = enabled.iter().chain(disabled).cloned().collect();
        for (template_id, uris) in group_by_template(&all) {
            log::info!("recover {} rdb subscription(s) for {}", uris.len(), template_id.bundle_name);
            let remote = self.proxy.subscribe_rdb_data(&uris, &template_id, Arc::clone(&stub));
            log_remote_failures("rdb recover", &remote);
        }
        for (template_id, uris) in group_by_template(disabled) {
            let remote = self.proxy.disable_subscribe_rdb_data(&uris, &template_id);
            log_remote_failures("rdb recover disable", &remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrCode;
    use crate::proxy::loopback::{LoopbackService, RemoteCall, RemoteOp};

    fn template() -> TemplateId {
        TemplateId::new(100, "com.example.app")
    }

    fn change(uri: &str, row: &str) -> RdbChangeNode {
        RdbChangeNode {
            uri: uri.to_string(),
            template_id: template(),
            data: vec![row.to_string()],
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&RdbChangeNode) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |node: &RdbChangeNode| {
            sink.lock().unwrap().push(node.data.join(","));
        })
    }

    #[test]
    fn test_key_ignores_query_string() {
        let a = RdbObserverMapKey::new("uri://x?a=1", &template());
        let b = RdbObserverMapKey::new("uri://x?b=2", &template());
        assert_eq!(a, b);
        assert_eq!(a.uri(), "uri://x?a=1");
        assert_ne!(a, RdbObserverMapKey::new("uri://x", &TemplateId::new(101, "com.example.app")));
    }

    #[test]
    fn test_query_variants_share_one_remote_subscription() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();

        manager.add_observers(SubscriberId::next(), Some(&service), &["uri://x?a=1"], &template(), cb1);
        let results = manager.add_observers(SubscriberId::next(), Some(&service), &["uri://x?b=2"], &template(), cb2);

        assert_eq!(results, vec![OperationResult::ok("uri://x?b=2")]);
        assert_eq!(service.calls().len(), 1);
        assert_eq!(manager.enabled_observers("uri://x", &template()), 2);
    }

    #[test]
    fn test_last_unsubscribe_sends_the_requested_query_variant() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let first = SubscriberId::next();
        let second = SubscriberId::next();
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();
        manager.add_observers(first, Some(&service), &["uri://x?a=1"], &template(), cb1);
        manager.add_observers(second, Some(&service), &["uri://x?b=2"], &template(), cb2);
        manager.del_observers(first, Some(&service), &["uri://x?a=1"], &template());
        service.clear_calls();

        let results = manager.del_observers(second, Some(&service), &["uri://x?b=2"], &template());

        assert_eq!(results, vec![OperationResult::ok("uri://x?b=2")]);
        assert_eq!(
            service.calls(),
            vec![RemoteCall {
                op: RemoteOp::UnsubscribeRdb,
                uris: vec!["uri://x?b=2".to_string()],
            }]
        );
        assert_eq!(service.rdb_registration("uri://x", &template()), None);
    }

    #[test]
    fn test_missing_proxy_returns_nothing() {
        let manager = RdbSubscriberManager::new();
        let (_, cb) = recorder();
        let results = manager.add_observers(SubscriberId::next(), None, &["uri://x"], &template(), cb);
        assert!(results.is_empty());
        assert_eq!(manager.enabled_subscriber_size(), 0);
        assert!(!manager.has_service_callback());
    }

    #[test]
    fn test_new_observer_of_subscribed_key_gets_cached_change() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let (_, first) = recorder();
        let (late_seen, late) = recorder();

        manager.add_observers(SubscriberId::next(), Some(&service), &["uri://x"], &template(), first);
        assert_eq!(service.push_rdb_change(&change("uri://x", "v1")), 1);
        manager.add_observers(SubscriberId::next(), Some(&service), &["uri://x"], &template(), late);

        assert_eq!(*late_seen.lock().unwrap(), vec!["v1".to_string()]);
    }

    #[test]
    fn test_reenabled_observer_gets_one_replay() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let (s1, s2) = (SubscriberId::next(), SubscriberId::next());
        let (seen1, cb1) = recorder();
        let (seen2, cb2) = recorder();
        manager.add_observers(s1, Some(&service), &["uri://x"], &template(), cb1);
        manager.add_observers(s2, Some(&service), &["uri://x"], &template(), cb2);

        manager.disable_observers(s1, Some(&service), &["uri://x"], &template());
        service.push_rdb_change(&change("uri://x", "v1"));
        assert!(seen1.lock().unwrap().is_empty());
        assert_eq!(seen2.lock().unwrap().len(), 1);

        manager.enable_observers(s1, Some(&service), &["uri://x"], &template());
        manager.enable_observers(s1, Some(&service), &["uri://x"], &template());
        assert_eq!(*seen1.lock().unwrap(), vec!["v1".to_string()]);
    }

    #[test]
    fn test_cache_is_dropped_with_last_observer() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let subscriber = SubscriberId::next();
        let (_, cb) = recorder();
        manager.add_observers(subscriber, Some(&service), &["uri://x"], &template(), cb);
        service.push_rdb_change(&change("uri://x", "v1"));
        manager.del_observers(subscriber, Some(&service), &["uri://x"], &template());
        assert!(!manager.has_service_callback());

        // Re-subscribing needs a fresh remote registration and replays nothing.
        let (seen, cb) = recorder();
        manager.add_observers(subscriber, Some(&service), &["uri://x"], &template(), cb);
        assert_eq!(service.count(RemoteOp::SubscribeRdb, "uri://x"), 2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stub_detaches_when_everything_is_disabled() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let subscriber = SubscriberId::next();
        let (seen, cb) = recorder();
        manager.add_observers(subscriber, Some(&service), &["uri://x"], &template(), cb);
        assert!(manager.has_service_callback());

        manager.disable_observers(subscriber, Some(&service), &["uri://x"], &template());
        assert!(!manager.has_service_callback());
        assert_eq!(service.rdb_registration("uri://x", &template()), Some(false));

        manager.enable_observers(subscriber, Some(&service), &["uri://x"], &template());
        assert!(manager.has_service_callback());
        service.push_rdb_change(&change("uri://x", "v2"));
        assert_eq!(*seen.lock().unwrap(), vec!["v2".to_string()]);
    }

    #[test]
    fn test_failed_remote_subscribe_leaves_no_observer() {
        let service = LoopbackService::new();
        service.fail_uri("uri://bad");
        let manager = RdbSubscriberManager::new();
        let (_, cb) = recorder();

        let results = manager.add_observers(SubscriberId::next(), Some(&service), &["uri://ok", "uri://bad"], &template(), cb);

        assert!(results[0].err_code.is_ok());
        assert!(matches!(results[1].err_code, ErrCode::Remote(_)));
        assert_eq!(manager.enabled_observers("uri://bad", &template()), 0);
        assert_eq!(manager.enabled_observers("uri://ok", &template()), 1);
    }

    #[test]
    fn test_empty_uris_unsubscribes_every_template() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let subscriber = SubscriberId::next();
        let other = TemplateId::new(200, "com.example.other");
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();
        manager.add_observers(subscriber, Some(&service), &["uri://x"], &template(), cb1);
        manager.add_observers(subscriber, Some(&service), &["uri://y"], &other, cb2);

        let results = manager.del_observers::<&str>(subscriber, Some(&service), &[], &template());

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.err_code.is_ok()));
        assert_eq!(service.rdb_registration("uri://x", &template()), None);
        assert_eq!(service.rdb_registration("uri://y", &other), None);
        assert_eq!(manager.enabled_subscriber_size(), 0);
    }

    #[test]
    fn test_recover_restores_enabled_and_disabled_registrations() {
        let service = LoopbackService::new();
        let manager = RdbSubscriberManager::new();
        let subscriber = SubscriberId::next();
        let (_, cb) = recorder();
        manager.add_observers(subscriber, Some(&service), &["uri://on", "uri://off"], &template(), cb);
        manager.disable_observers(subscriber, Some(&service), &["uri://off"], &template());

        service.kill();
        service.revive();
        manager.recover_observers(&service);

        assert_eq!(service.rdb_registration("uri://on", &template()), Some(true));
        assert_eq!(service.rdb_registration("uri://off", &template()), Some(false));
        assert!(manager.has_service_callback());
    }
}
