//! # Loopback Service
//!
//! An in-process [`DataShareService`]. It keeps registrations the way the real
//! service does, records every batched call, and lets a driver inject per-URI
//! failures, push changes to registered stubs, and simulate service death.
//! The demo binary and the test suites run against it.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::template::{
    clean_uri, ProxyDataChangeInfo, PublishedData, PublishedDataChangeNode, RdbChangeNode, Template, TemplateId,
};
use crate::errors::{DataShareError, ErrCode, OperationResult};
use crate::proxy::service::{DataShareService, ServiceConnector};
use crate::proxy::stub::{ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};

/// Code returned for URIs registered with [`LoopbackService::fail_uri`].
pub const E_INJECTED_FAILURE: i32 = -1;
/// Code returned by every call while the service is down.
pub const E_SERVICE_DIED: i32 = -2;
/// Code returned when a call refers to a registration that does not exist.
pub const E_NOT_REGISTERED: i32 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    SubscribeRdb,
    UnsubscribeRdb,
    EnableRdb,
    DisableRdb,
    SubscribePublished,
    UnsubscribePublished,
    EnablePublished,
    DisablePublished,
    SubscribeProxy,
    UnsubscribeProxy,
    EnableProxy,
    DisableProxy,
}

/// One recorded batched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub uris: Vec<String>,
}

struct Registration<S> {
    stub: Arc<S>,
    enabled: bool,
}

impl<S> Registration<S> {
    fn new(stub: Arc<S>) -> Self {
        Self { stub, enabled: true }
    }
}

#[derive(Default)]
struct LoopbackState {
    alive: bool,
    calls: Vec<RemoteCall>,
    failing: HashSet<String>,
    rdb: BTreeMap<(String, TemplateId), Registration<RdbObserverStub>>,
    published: BTreeMap<(String, i64), Registration<PublishedDataObserverStub>>,
    proxy: BTreeMap<String, Registration<ProxyDataObserverStub>>,
    templates: BTreeMap<(String, i64), Template>,
    store: BTreeMap<String, PublishedData>,
}

fn set_enabled<K: Ord, S>(map: &mut BTreeMap<K, Registration<S>>, key: &K, enabled: bool) -> ErrCode {
    match map.get_mut(key) {
        Some(registration) => {
            registration.enabled = enabled;
            ErrCode::Ok
        }
        None => ErrCode::Remote(E_NOT_REGISTERED),
    }
}

fn remove<K: Ord, S>(map: &mut BTreeMap<K, Registration<S>>, key: &K) -> ErrCode {
    match map.remove(key) {
        Some(_) => ErrCode::Ok,
        None => ErrCode::Remote(E_NOT_REGISTERED),
    }
}

fn push_unique<S>(stubs: &mut Vec<Arc<S>>, stub: &Arc<S>) {
    if !stubs.iter().any(|known| Arc::ptr_eq(known, stub)) {
        stubs.push(Arc::clone(stub));
    }
}

/// # Loopback Service
pub struct LoopbackService {
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                alive: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn batch<F>(&self, op: RemoteOp, uris: &[String], mut apply: F) -> Vec<OperationResult>
    where
        F: FnMut(&mut LoopbackState, &str) -> ErrCode,
    {
        let mut state = self.lock();
        state.calls.push(RemoteCall { op, uris: uris.to_vec() });
        let mut results = Vec::with_capacity(uris.len());
        for uri in uris {
            let code = if !state.alive {
                ErrCode::Remote(E_SERVICE_DIED)
            } else if state.failing.contains(uri) {
                ErrCode::Remote(E_INJECTED_FAILURE)
            } else {
                apply(&mut *state, uri)
            };
            results.push(OperationResult::new(uri.clone(), code));
        }
        results
    }

    // --- Driver controls ---

    /// Every later call naming `uri` fails with [`E_INJECTED_FAILURE`].
    pub fn fail_uri(&self, uri: &str) {
        self.lock().failing.insert(uri.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Simulates a service crash: every registration is lost and calls fail
    /// until [`LoopbackService::revive`].
    pub fn kill(&self) {
        let mut state = self.lock();
        state.alive = false;
        state.rdb.clear();
        state.published.clear();
        state.proxy.clear();
        state.templates.clear();
    }

    pub fn revive(&self) {
        self.lock().alive = true;
    }

    pub fn is_alive(&self) -> bool {
        self.lock().alive
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of recorded `op` calls that named `uri`.
    pub fn count(&self, op: RemoteOp, uri: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.op == op && call.uris.iter().any(|u| u == uri))
            .count()
    }

    /// `Some(enabled)` if `uri` is registered for `template_id`.
    pub fn rdb_registration(&self, uri: &str, template_id: &TemplateId) -> Option<bool> {
        self.lock()
            .rdb
            .get(&(clean_uri(uri).to_string(), template_id.clone()))
            .map(|registration| registration.enabled)
    }

    pub fn published_registration(&self, uri: &str, subscriber_id: i64) -> Option<bool> {
        self.lock()
            .published
            .get(&(clean_uri(uri).to_string(), subscriber_id))
            .map(|registration| registration.enabled)
    }

    pub fn proxy_registration(&self, uri: &str) -> Option<bool> {
        self.lock().proxy.get(uri).map(|registration| registration.enabled)
    }

    pub fn query_template(&self, uri: &str, subscriber_id: i64) -> Option<Template> {
        self.lock().templates.get(&(uri.to_string(), subscriber_id)).cloned()
    }

    // --- Pushes ---
    // Stubs are collected under the lock and invoked after it is released, so
    // a callback may call back into the service.

    /// Delivers `node` to the enabled registration of its key. Returns the
    /// number of stubs reached.
    pub fn push_rdb_change(&self, node: &RdbChangeNode) -> usize {
        let stub = {
            let state = self.lock();
            state
                .rdb
                .get(&(clean_uri(&node.uri).to_string(), node.template_id.clone()))
                .filter(|registration| registration.enabled)
                .map(|registration| Arc::clone(&registration.stub))
        };
        match stub {
            Some(stub) => {
                stub.on_change(node);
                1
            }
            None => 0,
        }
    }

    /// Delivers the whole `node` once to every stub with an enabled
    /// registration for at least one of its items.
    pub fn push_published_change(&self, node: &PublishedDataChangeNode) -> usize {
        let stubs = {
            let state = self.lock();
            let mut stubs = Vec::new();
            for item in &node.datas {
                if let Some(registration) = state.published.get(&(clean_uri(&item.key).to_string(), item.subscriber_id)) {
                    if registration.enabled {
                        push_unique(&mut stubs, &registration.stub);
                    }
                }
            }
            stubs
        };
        for stub in &stubs {
            stub.on_change(node);
        }
        stubs.len()
    }

    pub fn push_proxy_change(&self, changes: &[ProxyDataChangeInfo]) -> usize {
        let stubs = {
            let state = self.lock();
            let mut stubs = Vec::new();
            for change in changes {
                if let Some(registration) = state.proxy.get(&change.uri) {
                    if registration.enabled {
                        push_unique(&mut stubs, &registration.stub);
                    }
                }
            }
            stubs
        };
        for stub in &stubs {
            stub.on_change(changes);
        }
        stubs.len()
    }
}

impl DataShareService for LoopbackService {
    fn subscribe_rdb_data(
        &self,
        uris: &[String],
        template_id: &TemplateId,
        observer: Arc<RdbObserverStub>,
    ) -> Vec<OperationResult> {
        self.batch(RemoteOp::SubscribeRdb, uris, |state, uri| {
            let key = (clean_uri(uri).to_string(), template_id.clone());
            state.rdb.insert(key, Registration::new(Arc::clone(&observer)));
            ErrCode::Ok
        })
    }

    fn unsubscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
        self.batch(RemoteOp::UnsubscribeRdb, uris, |state, uri| {
            remove(&mut state.rdb, &(clean_uri(uri).to_string(), template_id.clone()))
        })
    }

    fn enable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
        self.batch(RemoteOp::EnableRdb, uris, |state, uri| {
            set_enabled(&mut state.rdb, &(clean_uri(uri).to_string(), template_id.clone()), true)
        })
    }

    fn disable_subscribe_rdb_data(&self, uris: &[String], template_id: &TemplateId) -> Vec<OperationResult> {
        self.batch(RemoteOp::DisableRdb, uris, |state, uri| {
            set_enabled(&mut state.rdb, &(clean_uri(uri).to_string(), template_id.clone()), false)
        })
    }

    fn subscribe_published_data(
        &self,
        uris: &[String],
        subscriber_id: i64,
        observer: Arc<PublishedDataObserverStub>,
    ) -> Vec<OperationResult> {
        self.batch(RemoteOp::SubscribePublished, uris, |state, uri| {
            let key = (clean_uri(uri).to_string(), subscriber_id);
            state.published.insert(key, Registration::new(Arc::clone(&observer)));
            ErrCode::Ok
        })
    }

    fn unsubscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
        self.batch(RemoteOp::UnsubscribePublished, uris, |state, uri| {
            remove(&mut state.published, &(clean_uri(uri).to_string(), subscriber_id))
        })
    }

    fn enable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
        self.batch(RemoteOp::EnablePublished, uris, |state, uri| {
            set_enabled(&mut state.published, &(clean_uri(uri).to_string(), subscriber_id), true)
        })
    }

    fn disable_subscribe_published_data(&self, uris: &[String], subscriber_id: i64) -> Vec<OperationResult> {
        self.batch(RemoteOp::DisablePublished, uris, |state, uri| {
            set_enabled(&mut state.published, &(clean_uri(uri).to_string(), subscriber_id), false)
        })
    }

    fn subscribe_proxy_data(&self, uris: &[String], observer: Arc<ProxyDataObserverStub>) -> Vec<OperationResult> {
        self.batch(RemoteOp::SubscribeProxy, uris, |state, uri| {
            state.proxy.insert(uri.to_string(), Registration::new(Arc::clone(&observer)));
            ErrCode::Ok
        })
    }

    fn unsubscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
        self.batch(RemoteOp::UnsubscribeProxy, uris, |state, uri| remove(&mut state.proxy, &uri.to_string()))
    }

    fn enable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
        self.batch(RemoteOp::EnableProxy, uris, |state, uri| {
            set_enabled(&mut state.proxy, &uri.to_string(), true)
        })
    }

    fn disable_subscribe_proxy_data(&self, uris: &[String]) -> Vec<OperationResult> {
        self.batch(RemoteOp::DisableProxy, uris, |state, uri| {
            set_enabled(&mut state.proxy, &uri.to_string(), false)
        })
    }

    fn add_query_template(&self, uri: &str, subscriber_id: i64, template: &Template) -> ErrCode {
        let mut state = self.lock();
        if !state.alive {
            return ErrCode::Remote(E_SERVICE_DIED);
        }
        state.templates.insert((uri.to_string(), subscriber_id), template.clone());
        ErrCode::Ok
    }

    fn del_query_template(&self, uri: &str, subscriber_id: i64) -> ErrCode {
        let mut state = self.lock();
        if !state.alive {
            return ErrCode::Remote(E_SERVICE_DIED);
        }
        match state.templates.remove(&(uri.to_string(), subscriber_id)) {
            Some(_) => ErrCode::Ok,
            None => ErrCode::Remote(E_NOT_REGISTERED),
        }
    }

    fn publish(&self, data: &PublishedData, bundle_name: &str) -> Vec<OperationResult> {
        let results = {
            let mut state = self.lock();
            let code = if state.alive { ErrCode::Ok } else { ErrCode::Remote(E_SERVICE_DIED) };
            if code.is_ok() {
                let stored = state.store.entry(bundle_name.to_string()).or_default();
                stored.version = data.version;
                for item in &data.datas {
                    stored.datas.retain(|known| !(known.key == item.key && known.subscriber_id == item.subscriber_id));
                    stored.datas.push(item.clone());
                }
            }
            data.datas
                .iter()
                .map(|item| OperationResult::new(item.key.clone(), code))
                .collect::<Vec<_>>()
        };
        if results.iter().all(|result| result.err_code.is_ok()) && !data.datas.is_empty() {
            self.push_published_change(&PublishedDataChangeNode {
                owner_bundle_name: bundle_name.to_string(),
                datas: data.datas.clone(),
            });
        }
        results
    }

    fn get_published_data(&self, bundle_name: &str) -> (PublishedData, ErrCode) {
        let state = self.lock();
        if !state.alive {
            return (PublishedData::default(), ErrCode::Remote(E_SERVICE_DIED));
        }
        (state.store.get(bundle_name).cloned().unwrap_or_default(), ErrCode::Ok)
    }
}

/// Hands out a shared [`LoopbackService`] while it is alive.
pub struct LoopbackConnector {
    service: Arc<LoopbackService>,
    attempts: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new(service: Arc<LoopbackService>) -> Self {
        Self {
            service,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ServiceConnector for LoopbackConnector {
    fn connect(&self) -> Result<Arc<dyn DataShareService>, DataShareError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.service.is_alive() {
            return Err(DataShareError::ServiceUnavailable("loopback service is down".to_string()));
        }
        let service: Arc<dyn DataShareService> = self.service.clone();
        Ok(service)
    }
}
