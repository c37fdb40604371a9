//! # DataShare Helper
//!
//! The consumer-facing facade. Each helper is one subscriber: every
//! subscription it makes is tagged with its own [`SubscriberId`], so
//! unsubscribing (or dropping the helper) only ever touches what this helper
//! registered. All subscription calls return one [`OperationResult`] per URI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::callbacks::SubscriberId;
use crate::core::template::{
    PublishedData, PublishedDataChangeNode, ProxyDataChangeInfo, RdbChangeNode, Template, TemplateId,
};
use crate::errors::{ErrCode, OperationResult};
use crate::manager::DataShareManager;

/// Code returned by pass-through calls when no service is reachable.
pub const E_SERVICE_UNAVAILABLE: i32 = -1;

pub struct DataShareHelper {
    manager: Arc<DataShareManager>,
    subscriber: SubscriberId,
    released: AtomicBool,
}

impl DataShareHelper {
    pub fn new(manager: Arc<DataShareManager>) -> Self {
        Self {
            manager,
            subscriber: SubscriberId::next(),
            released: AtomicBool::new(false),
        }
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn manager(&self) -> &Arc<DataShareManager> {
        &self.manager
    }

    // --- RDB template queries ---

    pub fn subscribe_rdb_data<S, F>(&self, uris: &[S], template_id: &TemplateId, callback: F) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&RdbChangeNode) + Send + Sync + 'static,
    {
        let service = self.manager.get_service();
        self.manager
            .rdb_subscriber_manager()
            .add_observers(self.subscriber, service.as_deref(), uris, template_id, callback)
    }

    /// An empty `uris` drops every RDB subscription of this helper.
    pub fn unsubscribe_rdb_data<S: AsRef<str>>(&self, uris: &[S], template_id: &TemplateId) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .rdb_subscriber_manager()
            .del_observers(self.subscriber, service.as_deref(), uris, template_id)
    }

    pub fn enable_rdb_subs<S: AsRef<str>>(&self, uris: &[S], template_id: &TemplateId) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .rdb_subscriber_manager()
            .enable_observers(self.subscriber, service.as_deref(), uris, template_id)
    }

    pub fn disable_rdb_subs<S: AsRef<str>>(&self, uris: &[S], template_id: &TemplateId) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .rdb_subscriber_manager()
            .disable_observers(self.subscriber, service.as_deref(), uris, template_id)
    }

    // --- Published data ---

    pub fn subscribe_published_data<S, F>(&self, uris: &[S], subscriber_id: i64, callback: F) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&PublishedDataChangeNode) + Send + Sync + 'static,
    {
        let service = self.manager.get_service();
        self.manager
            .published_data_subscriber_manager()
            .add_observers(self.subscriber, service.as_deref(), uris, subscriber_id, callback)
    }

    /// An empty `uris` drops every published data subscription of this helper.
    pub fn unsubscribe_published_data<S: AsRef<str>>(&self, uris: &[S], subscriber_id: i64) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .published_data_subscriber_manager()
            .del_observers(self.subscriber, service.as_deref(), uris, subscriber_id)
    }

    pub fn enable_pub_subs<S: AsRef<str>>(&self, uris: &[S], subscriber_id: i64) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .published_data_subscriber_manager()
            .enable_observers(self.subscriber, service.as_deref(), uris, subscriber_id)
    }

    pub fn disable_pub_subs<S: AsRef<str>>(&self, uris: &[S], subscriber_id: i64) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .published_data_subscriber_manager()
            .disable_observers(self.subscriber, service.as_deref(), uris, subscriber_id)
    }

    // --- Proxy data ---

    pub fn subscribe_proxy_data<S, F>(&self, uris: &[S], callback: F) -> Vec<OperationResult>
    where
        S: AsRef<str>,
        F: Fn(&[ProxyDataChangeInfo]) + Send + Sync + 'static,
    {
        let service = self.manager.get_service();
        self.manager
            .proxy_data_subscriber_manager()
            .add_observers(self.subscriber, service.as_deref(), uris, callback)
    }

    /// An empty `uris` drops every proxy data subscription of this helper.
    pub fn unsubscribe_proxy_data<S: AsRef<str>>(&self, uris: &[S]) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .proxy_data_subscriber_manager()
            .del_observers(self.subscriber, service.as_deref(), uris)
    }

    pub fn enable_proxy_subs<S: AsRef<str>>(&self, uris: &[S]) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .proxy_data_subscriber_manager()
            .enable_observers(self.subscriber, service.as_deref(), uris)
    }

    pub fn disable_proxy_subs<S: AsRef<str>>(&self, uris: &[S]) -> Vec<OperationResult> {
        let service = self.manager.get_service();
        self.manager
            .proxy_data_subscriber_manager()
            .disable_observers(self.subscriber, service.as_deref(), uris)
    }

    // --- Pass-through calls ---

    pub fn add_query_template(&self, uri: &str, subscriber_id: i64, template: &Template) -> ErrCode {
        match self.manager.get_service() {
            Some(service) => service.add_query_template(uri, subscriber_id, template),
            None => ErrCode::Remote(E_SERVICE_UNAVAILABLE),
        }
    }

    pub fn del_query_template(&self, uri: &str, subscriber_id: i64) -> ErrCode {
        match self.manager.get_service() {
            Some(service) => service.del_query_template(uri, subscriber_id),
            None => ErrCode::Remote(E_SERVICE_UNAVAILABLE),
        }
    }

    pub fn publish(&self, data: &PublishedData, bundle_name: &str) -> Vec<OperationResult> {
        match self.manager.get_service() {
            Some(service) => service.publish(data, bundle_name),
            None => Vec::new(),
        }
    }

    pub fn get_published_data(&self, bundle_name: &str) -> (PublishedData, ErrCode) {
        match self.manager.get_service() {
            Some(service) => service.get_published_data(bundle_name),
            None => (PublishedData::default(), ErrCode::Remote(E_SERVICE_UNAVAILABLE)),
        }
    }

    /// Drops every subscription this helper owns, in all three domains.
    /// Later calls are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.manager.get_service();
        let proxy = service.as_deref();
        self.manager.rdb_subscriber_manager().del_observers_of(self.subscriber, proxy);
        self.manager
            .published_data_subscriber_manager()
            .del_observers_of(self.subscriber, proxy);
        self.manager
            .proxy_data_subscriber_manager()
            .del_observers::<&str>(self.subscriber, proxy, &[]);
        log::debug!("{} released", self.subscriber);
    }
}

impl Drop for DataShareHelper {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ReconnectPolicy;
    use crate::core::template::{PublishedDataItem, PublishedValue};
    use crate::proxy::loopback::{LoopbackConnector, LoopbackService};

    fn setup() -> (Arc<LoopbackService>, Arc<DataShareManager>) {
        let service = Arc::new(LoopbackService::new());
        let connector = Arc::new(LoopbackConnector::new(Arc::clone(&service)));
        (service, DataShareManager::new(connector, ReconnectPolicy::default()))
    }

    #[test]
    fn test_drop_releases_all_domains() {
        let (service, manager) = setup();
        let template_id = TemplateId::new(1, "bundle");
        {
            let helper = DataShareHelper::new(Arc::clone(&manager));
            helper.subscribe_rdb_data(&["r://a"], &template_id, |_| {});
            helper.subscribe_published_data(&["p://a"], 1, |_| {});
            helper.subscribe_proxy_data(&["d://a"], |_| {});
            assert_eq!(manager.rdb_subscriber_manager().enabled_subscriber_size(), 1);
        }
        assert_eq!(service.rdb_registration("r://a", &template_id), None);
        assert_eq!(service.published_registration("p://a", 1), None);
        assert_eq!(service.proxy_registration("d://a"), None);
        assert_eq!(manager.proxy_data_subscriber_manager().enabled_subscriber_size(), 0);
    }

    #[test]
    fn test_release_leaves_other_helpers_alone() {
        let (service, manager) = setup();
        let keep = DataShareHelper::new(Arc::clone(&manager));
        let leave = DataShareHelper::new(Arc::clone(&manager));
        keep.subscribe_proxy_data(&["d://a"], |_| {});
        leave.subscribe_proxy_data(&["d://a"], |_| {});

        leave.release();
        leave.release();

        assert_eq!(manager.proxy_data_subscriber_manager().enabled_observers("d://a"), 1);
        assert_eq!(service.proxy_registration("d://a"), Some(true));
    }

    #[test]
    fn test_pass_through_calls() {
        let (service, manager) = setup();
        let helper = DataShareHelper::new(manager);
        let template = Template {
            predicates: vec![],
            scheduler: "select 1".to_string(),
        };

        assert!(helper.add_query_template("r://a", 5, &template).is_ok());
        assert_eq!(service.query_template("r://a", 5), Some(template));
        assert!(helper.del_query_template("r://a", 5).is_ok());

        let data = PublishedData {
            datas: vec![PublishedDataItem::new("p://a", 5, PublishedValue::Bytes(vec![1, 2]))],
            version: 1,
        };
        assert_eq!(helper.publish(&data, "owner").len(), 1);
        assert_eq!(helper.get_published_data("owner").0, data);
    }

    #[test]
    fn test_dead_service_yields_empty_results() {
        let (service, manager) = setup();
        service.kill();
        let helper = DataShareHelper::new(manager);

        assert!(helper.subscribe_proxy_data(&["d://a"], |_| {}).is_empty());
        assert_eq!(
            helper.add_query_template("r://a", 1, &Template::default()),
            ErrCode::Remote(E_SERVICE_UNAVAILABLE)
        );
        assert!(helper.publish(&PublishedData::default(), "owner").is_empty());
    }
}
