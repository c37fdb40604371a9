//! # DataShare Service Boundary
//!
//! The calls the subscriber managers make on the remote DataShare service.
//! Every batched call answers with one [`OperationResult`] per requested URI,
//! in request order, keyed by the URI exactly as it was sent. Calls block the
//! calling thread for the duration of the round trip.
//!
//! Pushes travel the other way: the service keeps the stub handed to a
//! `subscribe_*` call and invokes it from its own threads, possibly while a
//! subscribe or unsubscribe on the same manager is in progress.

use std::sync::Arc;

use crate::core::template::{PublishedData, Template, TemplateId};
use crate::errors::{DataShareError, ErrCode, OperationResult};
use crate::proxy::stub::{ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};

/// # DataShare Service
///
/// A connected handle to the remote service.
pub trait DataShareService: Send + Sync {
    fn subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: Arc<RdbObserverStub>,
    ) -> Vec<OperationResult>;
    fn unsubscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult>;
    fn enable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult>;
    fn disable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult>;

    fn subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: Arc<PublishedDataObserverStub>,
    ) -> Vec<OperationResult>;
    fn unsubscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult>;
    fn enable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult>;
    fn disable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult>;

    fn subscribe_proxy_data(&self, uris: &[String], observer: Arc<ProxyDataObserverStub>) -> Vec<OperationResult>;
    fn unsubscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult>;
    fn enable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult>;
    fn disable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult>;

    /// Registers the query template evaluated for `uri` on behalf of `subscriber_id`.
    fn add_query_template(&self, uri: &str, subscriber_id: i64, template: &Template) -> ErrCode;
    fn del_query_template(&self, uri: &str, subscriber_id: i64) -> ErrCode;

    /// Publishes `data` as `bundle_name`. One result per item.
    fn publish(&self, data: &PublishedData, bundle_name: &str) -> Vec<OperationResult>;
    /// Everything currently published by `bundle_name`, plus the outcome.
    fn get_published_data(&self, bundle_name: &str) -> (PublishedData, ErrCode);
}

/// Establishes a connection to the service.
pub trait ServiceConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn DataShareService>, DataShareError>;
}
