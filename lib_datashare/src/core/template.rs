//! # Subscription Payload Types
//!
//! Value types exchanged with the DataShare service: template identifiers,
//! query templates, and the change nodes the service pushes back to
//! subscribers.

use serde::{Deserialize, Serialize};

/// Returns `uri` with any query-string suffix removed.
///
/// Subscriptions for RDB and published data are keyed on this "clean" URI so
/// that query parameters do not fragment a subscription target.
pub fn clean_uri(uri: &str) -> &str {
    match uri.find('?') {
        Some(pos) => &uri[..pos],
        None => uri,
    }
}

/// Shortens a URI for log output.
pub fn anonymous(uri: &str) -> String {
    const KEEP: usize = 12;
    if uri.chars().count() <= KEEP {
        return uri.to_string();
    }
    let head: String = uri.chars().take(KEEP).collect();
    format!("{}***", head)
}

/// # Template Id
///
/// Identifies a query template registered with the service. Ordered by
/// subscriber id first, then bundle name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateId {
    /// The id of the subscriber owning the template.
    pub subscriber_id: i64,
    /// The bundle name of the template owner.
    pub bundle_name: String,
}

impl TemplateId {
    pub fn new(subscriber_id: i64, bundle_name: impl Into<String>) -> Self {
        Self {
            subscriber_id,
            bundle_name: bundle_name.into(),
        }
    }
}

/// One named predicate of a query template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateTemplateNode {
    pub key: String,
    pub select_sql: String,
}

/// # Template
///
/// A set of predicates plus an optional scheduler statement. The service
/// evaluates the template whenever the underlying store changes and pushes the
/// results as an [`RdbChangeNode`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub predicates: Vec<PredicateTemplateNode>,
    pub scheduler: String,
}

/// Change pushed for an RDB template subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdbChangeNode {
    pub uri: String,
    pub template_id: TemplateId,
    /// Query results, one serialized row set per predicate.
    pub data: Vec<String>,
}

/// Payload of a published data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishedValue {
    Text(String),
    Bytes(Vec<u8>),
}

/// # Published Data Item
///
/// One keyed value published by a data provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedDataItem {
    /// The URI the value is published under.
    pub key: String,
    pub subscriber_id: i64,
    pub value: PublishedValue,
}

impl PublishedDataItem {
    pub fn new(key: impl Into<String>, subscriber_id: i64, value: PublishedValue) -> Self {
        Self {
            key: key.into(),
            subscriber_id,
            value,
        }
    }
}

/// A batch of items to publish, with a version (larger is newer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedData {
    pub datas: Vec<PublishedDataItem>,
    pub version: i32,
}

/// Change pushed for published data subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedDataChangeNode {
    pub owner_bundle_name: String,
    pub datas: Vec<PublishedDataItem>,
}

/// Kind of change carried by a [`ProxyDataChangeInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Value of a shared proxy data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyValue {
    Int(i64),
    Double(f64),
    Str(String),
    Bool(bool),
}

/// One change of a shared proxy data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDataChangeInfo {
    pub change_type: ChangeType,
    pub uri: String,
    pub value: ProxyValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_uri_truncates_query() {
        assert_eq!(clean_uri("datashare:///a/b?user=100"), "datashare:///a/b");
        assert_eq!(clean_uri("datashare:///a/b"), "datashare:///a/b");
        assert_eq!(clean_uri("?x=1"), "");
    }

    #[test]
    fn test_template_id_orders_by_subscriber_then_bundle() {
        let a = TemplateId::new(1, "z");
        let b = TemplateId::new(2, "a");
        let c = TemplateId::new(2, "b");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_anonymous_keeps_short_uris() {
        assert_eq!(anonymous("short"), "short");
        assert_eq!(anonymous("datashare:///com.example/table"), "datashare://***");
    }
}
