//! # Subscription Core
//!
//! The domain-independent half of the DataShare client subscription layer.
//!
//! ## Components:
//!
//! - **`callbacks`**: The generic `CallbacksManager`. It owns the table of
//!   `key -> [observer node]`, detects the first-registrant and
//!   last-unregistrant edges that require a remote call, and compensates
//!   locally when that remote call fails.
//!
//! - **`template`**: Plain value types that travel between the service and
//!   the subscribers (template ids, change nodes, published items).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic observer table with edge detection and rollback.
pub mod callbacks;
/// Payload and identifier types of the subscription API.
pub mod template;

// --- Public API Re-exports ---
pub use callbacks::{
    CallbacksManager, LocalOnly, ObserverKey, ObserverNode, ObserverNodeOnEnabled, SubscriberId, SubscriptionPort,
};
pub use template::{
    anonymous, clean_uri, ChangeType, PredicateTemplateNode, ProxyDataChangeInfo, ProxyValue, PublishedData,
    PublishedDataChangeNode, PublishedDataItem, PublishedValue, RdbChangeNode, Template, TemplateId,
};
