//! # Subscriber Managers
//!
//! One manager per subscription domain. Each wraps a generic
//! `CallbacksManager` with its own key type, owns the single stub the service
//! pushes into, and turns the manager's edge notifications into batched
//! service calls.
//!
//! - **`rdb`**: template query results, keyed by clean URI and template id.
//! - **`published`**: published data items, keyed by clean URI and subscriber id.
//! - **`proxy_data`**: shared proxy data, keyed by the URI alone.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::template::anonymous;
use crate::errors::OperationResult;

pub mod proxy_data;
pub mod published;
pub mod rdb;

pub use proxy_data::{ProxyDataObserver, ProxyDataObserverMapKey, ProxyDataSubscriberManager};
pub use published::{PublishedDataObserver, PublishedDataSubscriberManager, PublishedObserverMapKey};
pub use rdb::{RdbObserver, RdbObserverMapKey, RdbSubscriberManager};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Appends `remote` to `results`, logging every failed URI.
pub(crate) fn merge_remote_results(action: &str, remote: Vec<OperationResult>, results: &mut Vec<OperationResult>) {
    log_remote_failures(action, &remote);
    results.extend(remote);
}

pub(crate) fn log_remote_failures(action: &str, remote: &[OperationResult]) {
    for result in remote.iter().filter(|result| !result.err_code.is_ok()) {
        log::warn!(
            "{} failed, uri is {}, errCode is {}",
            action,
            anonymous(&result.key),
            result.err_code.code()
        );
    }
}
