//! # Proxy Data Subscriber Manager
//!
//! Subscriptions to shared proxy data entries. Keys are plain URIs with no
//! query-string folding, and nothing is cached: observers only ever see fresh
//! pushes.

use std::sync::{Arc, Mutex, Weak};

use crate::core::callbacks::{CallbacksManager, ObserverKey, SubscriberId, SubscriptionPort};
use crate::core::template::ProxyDataChangeInfo;
use crate::errors::OperationResult;
use crate::proxy::service::DataShareService;
use crate::proxy::stub::{ProxyDataDispatch, ProxyDataObserverStub};
use crate::subscribers::{lock, log_remote_failures, merge_remote_results};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProxyDataObserverMapKey {
    uri: String,
}

impl ProxyDataObserverMapKey {
    pub fn new(uri: &str) -> Self {
        Self { uri: uri.to_string() }
    }
}

impl ObserverKey for ProxyDataObserverMapKey {
    fn uri(&self) -> &str {
        &self.uri
    }
}

pub struct ProxyDataObserver {
    callback: Box<dyn Fn(&[ProxyDataChangeInfo]) + Send + Sync>,
}

impl ProxyDataObserver {
    pub fn new(callback: impl Fn(&[ProxyDataChangeInfo]) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn on_change(&self, changes: &[ProxyDataChangeInfo]) {
        (self.callback)(changes);
    }
}

fn uris_of(keys: &[ProxyDataObserverMapKey]) -> Vec<String> {
    keys.iter().map(|key| key.uri.clone()).collect()
}

/// # Proxy Data Subscriber Manager
pub struct ProxyDataSubscriberManager {
    callbacks: CallbacksManager<ProxyDataObserverMapKey, ProxyDataObserver>,
    service_callback: Mutex<Option<Arc<ProxyDataObserverStub>>>,
    weak_self: Weak<ProxyDataSubscriberManager>,
}

impl ProxyDataSubscriberManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            callbacks: CallbacksManager::new(),
            service_callback: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn keys_of<S: AsRef<str>>(uris: &[S]) -> Vec<ProxyDataObserverMapKey> {
        uris.iter()
            .map(|uri| ProxyDataObserverMapKey::new(uri.as_ref()))
            .collect()
    }

    pub fn add_observers<S, F>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
        callback: F,
    ) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&[ProxyDataChangeInfo]) + Send + Sync + 'static,
    {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, proxy data subscribe skipped");
            return Vec::new();
        };
        let keys = Self::keys_of(uris);
        let port = ProxyDataRemote { manager: self, proxy };
        let results = self
            .callbacks
            .add_observers(&keys, subscriber, Arc::new(ProxyDataObserver::new(callback)), &port);
        self.destroy();
        results
    }

    /// An empty `uris` removes every proxy data subscription of `subscriber`.
    pub fn del_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, proxy data unsubscribe skipped");
            return Vec::new();
        };
        let port = ProxyDataRemote { manager: self, proxy };
        let results = if uris.is_empty() {
            self.callbacks.del_observers_of(subscriber, &port)
        } else {
            self.callbacks.del_observers(&Self::keys_of(uris), subscriber, &port)
        };
        self.destroy();
        results
    }

    pub fn enable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, proxy data enable skipped");
            return Vec::new();
        };
        let results = self
            .callbacks
            .enable_observers(&Self::keys_of(uris), subscriber, &ProxyDataRemote { manager: self, proxy });
        self.destroy();
        results
    }

    pub fn disable_observers<S: AsRef<str>>(
        &self,
        subscriber: SubscriberId,
        proxy: Option<&dyn DataShareService>,
        uris: &[S],
    ) -> Vec<OperationResult> {
        let Some(proxy) = proxy else {
            log::error!("proxy is null, proxy data disable skipped");
            return Vec::new();
        };
        let results = self
            .callbacks
            .disable_observers(&Self::keys_of(uris), subscriber, &ProxyDataRemote { manager: self, proxy });
        self.destroy();
        results
    }

    /// Re-registers every known key in a single batch.
    pub fn recover_observers(&self, proxy: &dyn DataShareService) {
        self.callbacks.recover_observers(&ProxyDataRemote { manager: self, proxy });
        self.destroy();
    }

    /// Entry point for pushes from the service. Every enabled observer gets
    /// one call with the changes of the URIs it subscribed to.
    pub fn emit(&self, changes: &[ProxyDataChangeInfo]) {
        let mut grouped: Vec<(Arc<ProxyDataObserver>, Vec<ProxyDataChangeInfo>)> = Vec::new();
        for change in changes {
            let key = ProxyDataObserverMapKey::new(&change.uri);
            for observer in self.callbacks.get_enabled_observers(&key) {
                match grouped.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &observer)) {
                    Some((_, batch)) => batch.push(change.clone()),
                    None => grouped.push((observer, vec![change.clone()])),
                }
            }
        }
        for (observer, batch) in &grouped {
            observer.on_change(batch);
        }
    }

    pub fn enabled_subscriber_size(&self) -> usize {
        self.callbacks.enabled_subscriber_size()
    }

    pub fn enabled_observers(&self, uri: &str) -> usize {
        self.callbacks
            .enabled_subscriber_size_for(&ProxyDataObserverMapKey::new(uri))
    }

    pub fn has_service_callback(&self) -> bool {
        lock(&self.service_callback)
            .as_ref()
            .is_some_and(|stub| stub.is_attached())
    }

    fn dispatch(&self) -> ProxyDataDispatch {
        let weak_self = self.weak_self.clone();
        Arc::new(move |changes: &[ProxyDataChangeInfo]| {
            if let Some(manager) = weak_self.upgrade() {
                manager.emit(changes);
            }
        })
    }

    fn init(&self) -> Arc<ProxyDataObserverStub> {
        let mut slot = lock(&self.service_callback);
        if let Some(stub) = slot.as_ref() {
            if !stub.is_attached() {
                stub.set_callback(self.dispatch());
            }
            return Arc::clone(stub);
        }
        log::info!("proxy data callback init");
        let stub = Arc::new(ProxyDataObserverStub::new(self.dispatch()));
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
                log::info!("no valid proxy data subscriber, delete callback");
            }
        }
        if self.callbacks.is_empty() {
            *slot = None;
        }
    }
}

struct ProxyDataRemote<'a> {
    manager: &'a ProxyDataSubscriberManager,
    proxy: &'a dyn DataShareService,
}

impl SubscriptionPort<ProxyDataObserverMapKey, ProxyDataObserver> for ProxyDataRemote<'_> {
    fn on_first_added(
        &self,
        keys: &[ProxyDataObserverMapKey],
        _: &Arc<ProxyDataObserver>,
        results: &mut Vec<OperationResult>,
    ) {
        let stub = self.manager.init();
        let remote = self.proxy.subscribe_proxy_data(&uris_of(keys), stub);
        merge_remote_results("proxy data subscribe", remote, results);
    }

    fn on_last_removed(&self, keys: &[ProxyDataObserverMapKey], results: &mut Vec<OperationResult>) {
        let remote = self.proxy.unsubscribe_proxy_data(&uris_of(keys));
        merge_remote_results("proxy data unsubscribe", remote, results);
    }

    fn on_first_enabled(&self, keys: &[ProxyDataObserverMapKey], results: &mut Vec<OperationResult>) {
        self.manager.init();
        let remote = self.proxy.enable_subscribe_proxy_data(&uris_of(keys));
        merge_remote_results("proxy data enable", remote, results);
    }

    fn on_last_disabled(&self, keys: &[ProxyDataObserverMapKey], results: &mut Vec<OperationResult>) {
        let remote = self.proxy.disable_subscribe_proxy_data(&uris_of(keys));
        merge_remote_results("proxy data disable", remote, results);
    }

    fn on_recover(&self, enabled: &[ProxyDataObserverMapKey], disabled: &[ProxyDataObserverMapKey]) {
        let stub = self.manager.init();
        let mut uris = uris_of(enabled);
        uris.extend(uris_of(disabled));
        log::info!("recover {} proxy data subscription(s)", uris.len());
        log_remote_failures("proxy data recover", &self.proxy.subscribe_proxy_data(&uris, stub));
        if !disabled.is_empty() {
            let remote = self.proxy.disable_subscribe_proxy_data(&uris_of(disabled));
            log_remote_failures("proxy data recover disable", &remote);
        }
    }
}
