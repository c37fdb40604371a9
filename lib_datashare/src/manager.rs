//! # DataShare Manager
//!
//! The per-process context of the client subscription layer. It owns the
//! three subscriber managers and the connection to the service, and is handed
//! to every [`crate::helper::DataShareHelper`] explicitly instead of living in
//! a global.
//!
//! ## Service death
//!
//! [`DataShareManager::on_remote_died`] drops the cached service handle and
//! starts a recovery worker, unless one is already running. The worker
//! reconnects under the configured [`ReconnectPolicy`] and then replays every
//! subscription: RDB first, then published data, then proxy data. A death
//! reported while a worker runs marks the recovery pending. Each connect
//! attempt clears the mark, and the worker checks it under the recovery lock
//! before it finishes, running another round if it is set. A death in the
//! middle of a replay is therefore never lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::proxy::service::{DataShareService, ServiceConnector};
use crate::subscribers::{lock, ProxyDataSubscriberManager, PublishedDataSubscriberManager, RdbSubscriberManager};

/// How [`DataShareManager`] retries the service after it died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Sleep before every attempt.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

pub struct DataShareManager {
    connector: Arc<dyn ServiceConnector>,
    policy: ReconnectPolicy,
    service: Mutex<Option<Arc<dyn DataShareService>>>,
    rdb: Arc<RdbSubscriberManager>,
    published: Arc<PublishedDataSubscriberManager>,
    proxy_data: Arc<ProxyDataSubscriberManager>,
    recovering: AtomicBool,
    /// Set when a death is reported after the running round connected. Written under `recovery`.
    pending: AtomicBool,
    recovery: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<DataShareManager>,
}

impl DataShareManager {
    pub fn new(connector: Arc<dyn ServiceConnector>, policy: ReconnectPolicy) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            connector,
            policy,
            service: Mutex::new(None),
            rdb: RdbSubscriberManager::new(),
            published: PublishedDataSubscriberManager::new(),
            proxy_data: ProxyDataSubscriberManager::new(),
            recovering: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            recovery: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Returns the connected service, connecting on first use.
    pub fn get_service(&self) -> Option<Arc<dyn DataShareService>> {
        let mut service = lock(&self.service);
        if let Some(connected) = service.as_ref() {
            return Some(Arc::clone(connected));
        }
        match self.connector.connect() {
            Ok(connected) => {
                log::info!("DataShare service connected");
                *service = Some(Arc::clone(&connected));
                Some(connected)
            }
            Err(e) => {
                log::warn!("DataShare service connect failed: {}", e);
                None
            }
        }
    }

    pub fn rdb_subscriber_manager(&self) -> &Arc<RdbSubscriberManager> {
        &self.rdb
    }

    pub fn published_data_subscriber_manager(&self) -> &Arc<PublishedDataSubscriberManager> {
        &self.published
    }

    pub fn proxy_data_subscriber_manager(&self) -> &Arc<ProxyDataSubscriberManager> {
        &self.proxy_data
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Called when the service connection is lost.
    pub fn on_remote_died(&self) {
        log::warn!("DataShare service died");
        *lock(&self.service) = None;

        let mut recovery = lock(&self.recovery);
        if self.recovering.swap(true, Ordering::SeqCst) {
            log::info!("Recovery already running, another round scheduled");
            self.pending.store(true, Ordering::SeqCst);
            return;
        }
        // A finished worker from an earlier death is reaped here.
        if let Some(finished) = recovery.take() {
            if finished.join().is_err() {
                log::error!("Previous recovery worker panicked");
            }
        }

        let weak_self = self.weak_self.clone();
        let policy = self.policy;
        let spawned = thread::Builder::new()
            .name("datashare-recovery".to_string())
            .spawn(move || Self::recovery_worker(weak_self, policy));
        match spawned {
            Ok(handle) => *recovery = Some(handle),
            Err(e) => {
                log::error!("Failed to start recovery worker: {}", e);
                self.recovering.store(false, Ordering::SeqCst);
            }
        }
    }

    fn recovery_worker(weak_self: Weak<DataShareManager>, policy: ReconnectPolicy) {
        let mut round = 1u32;
        loop {
            if !Self::recovery_round(&weak_self, policy) {
                log::error!("Giving up on service recovery after {} attempt(s)", policy.max_attempts);
            }
            let Some(manager) = weak_self.upgrade() else {
                return;
            };
            // No lock is held during a round; `pending` is only settled here.
            let _recovery = lock(&manager.recovery);
            if !manager.pending.swap(false, Ordering::SeqCst) {
                manager.recovering.store(false, Ordering::SeqCst);
                return;
            }
            round += 1;
            log::warn!("Service died again during recovery, starting round {}", round);
        }
    }

    /// One reconnect-and-replay pass. Returns false when every attempt failed.
    fn recovery_round(weak_self: &Weak<DataShareManager>, policy: ReconnectPolicy) -> bool {
        for attempt in 1..=policy.max_attempts {
            thread::sleep(policy.delay);
            let Some(manager) = weak_self.upgrade() else {
                return true;
            };
            // Deaths reported so far are covered by this connect.
            {
                let _recovery = lock(&manager.recovery);
                manager.pending.store(false, Ordering::SeqCst);
            }
            match manager.get_service() {
                Some(service) => {
                    log::info!("Service reconnected on attempt {}, recovering observers", attempt);
                    manager.recover_observers(service.as_ref());
                    return true;
                }
                None => log::warn!("Reconnect attempt {}/{} failed", attempt, policy.max_attempts),
            }
        }
        false
    }

    fn recover_observers(&self, service: &dyn DataShareService) {
        self.rdb.recover_observers(service);
        self.published.recover_observers(service);
        self.proxy_data.recover_observers(service);
    }

    /// Blocks until the current recovery worker, if any, has finished.
    pub fn wait_for_recovery(&self) {
        let handle = lock(&self.recovery).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Recovery worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::callbacks::SubscriberId;
    use crate::core::template::{PublishedData, Template, TemplateId};
    use crate::errors::{DataShareError, ErrCode, OperationResult};
    use crate::proxy::loopback::{LoopbackConnector, LoopbackService};
    use crate::proxy::stub::{ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[test]
    fn test_connects_lazily_once() {
        let service = Arc::new(LoopbackService::new());
        let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
        let manager = DataShareManager::new(connector.clone(), fast_policy(1));

        assert_eq!(connector.attempts(), 0);
        assert!(manager.get_service().is_some());
        assert!(manager.get_service().is_some());
        assert_eq!(connector.attempts(), 1);
    }

    #[test]
    fn test_recovery_resubscribes_after_death() {
        let service = Arc::new(LoopbackService::new());
        let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
        let manager = DataShareManager::new(connector, fast_policy(50));
        let template_id = TemplateId::new(1, "bundle");
        let proxy = manager.get_service();
        manager
            .rdb_subscriber_manager()
            .add_observers(SubscriberId::next(), proxy.as_deref(), &["r://a"], &template_id, |_| {});

        service.kill();
        manager.on_remote_died();
        manager.on_remote_died();
        assert!(manager.is_recovering());
        service.revive();
        manager.wait_for_recovery();

        assert!(!manager.is_recovering());
        assert_eq!(service.rdb_registration("r://a", &template_id), Some(true));
    }

    #[test]
    fn test_recovery_gives_up_after_max_attempts() {
        let service = Arc::new(LoopbackService::new());
        let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
        let manager = DataShareManager::new(connector.clone(), fast_policy(3));

        service.kill();
        manager.on_remote_died();
        manager.wait_for_recovery();

        assert_eq!(connector.attempts(), 3);
        assert!(!manager.is_recovering());
        assert!(manager.get_service().is_none());
    }

    /// Loopback wrapper that dies once in the middle of an RDB subscribe and
    /// reports the death before the call returns.
    struct FlakyService {
        inner: Arc<LoopbackService>,
        manager: Mutex<Weak<DataShareManager>>,
        armed: AtomicBool,
    }

    impl DataShareService for FlakyService {
        fn subscribe_rdb_data(
            &self,
            uris: &[String],
            template_id: &TemplateId,
            observer: Arc<RdbObserverStub>,
        ) -> Vec<OperationResult> {
            if !self.armed.swap(false, Ordering::SeqCst) {
                return self.inner.subscribe_rdb_data(uris, template_id, observer);
            }
            self.inner.kill();
            let manager = self.manager.lock().unwrap().upgrade();
            if let Some(manager) = manager {
                manager.on_remote_died();
            }
            let results = self.inner.subscribe_rdb_data(uris, template_id, observer);
            self.inner.revive();
            results
        }
        fn unsubscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
            self.inner.unsubscribe_rdb_data(uris, template_id)
        }
        fn enable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
            self.inner.enable_subscribe_rdb_data(uris, template_id)
        }
        fn disable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
            self.inner.disable_subscribe_rdb_data(uris, template_id)
        }
        fn subscribe_published_data(
            &self,
            uris: &[String],
            subscriber_id: i64,
            observer: Arc<PublishedDataObserverStub>,
        ) -> Vec<OperationResult> {
            self.inner.subscribe_published_data(uris, subscriber_id, observer)
        }
        fn unsubscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
            self.inner.unsubscribe_published_data(uris, subscriber_id)
        }
        fn enable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
            self.inner.enable_subscribe_published_data(uris, subscriber_id)
        }
        fn disable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
            self.inner.disable_subscribe_published_data(uris, subscriber_id)
        }
        fn subscribe_proxy_data(&self, uris: &[String], observer: Arc<ProxyDataObserverStub>) -> Vec<OperationResult> {
            self.inner.subscribe_proxy_data(uris, observer)
        }
        fn unsubscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
            self.inner.unsubscribe_proxy_data(uris)
        }
        fn enable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
            self.inner.enable_subscribe_proxy_data(uris)
        }
        fn disable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
            self.inner.disable_subscribe_proxy_data(uris)
        }
        fn add_query_template(&self, uri: &str, subscriber_id: i64, template: &Template) -> ErrCode {
            self.inner.add_query_template(uri, subscriber_id, template)
        }
        fn del_query_template(&self, uri: &str, subscriber_id: i64) -> ErrCode {
            self.inner.del_query_template(uri, subscriber_id)
        }
        fn publish(&self, data: &PublishedData, bundle_name: &str) -> Vec<OperationResult> {
            self.inner.publish(data, bundle_name)
        }
        fn get_published_data(&self, bundle_name: &str) -> (PublishedData, ErrCode) {
            self.inner.get_published_data(bundle_name)
        }
    }

    struct FlakyConnector(Arc<FlakyService>);

    impl ServiceConnector for FlakyConnector {
        fn connect(&self) -> Result<Arc<dyn DataShareService>, DataShareError> {
            if !self.0.inner.is_alive() {
                return Err(DataShareError::ServiceUnavailable("flaky service is down".to_string()));
            }
            let service: Arc<dyn DataShareService> = self.0.clone();
            Ok(service)
        }
    }

    #[test]
    fn test_death_during_recovery_runs_another_round() {
        let inner = Arc::new(LoopbackService::new());
        let flaky = Arc::new(FlakyService {
            inner: Arc::clone(&inner),
            manager: Mutex::new(Weak::new()),
            armed: AtomicBool::new(false),
        });
        let manager = DataShareManager::new(Arc::new(FlakyConnector(Arc::clone(&flaky))), fast_policy(50));
        *flaky.manager.lock().unwrap() = Arc::downgrade(&manager);
        let template_id = TemplateId::new(1, "bundle");
        let proxy = manager.get_service();
        manager
            .rdb_subscriber_manager()
            .add_observers(SubscriberId::next(), proxy.as_deref(), &["r://a"], &template_id, |_| {});
        assert_eq!(inner.rdb_registration("r://a", &template_id), Some(true));

        // The replay of the first round hits a second death.
        flaky.armed.store(true, Ordering::SeqCst);
        inner.kill();
        manager.on_remote_died();
        inner.revive();
        manager.wait_for_recovery();

        assert!(!flaky.armed.load(Ordering::SeqCst));
        assert!(!manager.is_recovering());
        assert_eq!(inner.rdb_registration("r://a", &template_id), Some(true));
    }
}
