//! # Observer Stubs
//!
//! The service-side end of a subscription. The service keeps an `Arc` to the
//! stub it was handed on subscribe and calls `on_change` whenever it pushes a
//! notification. Each domain manager owns exactly one stub and detaches it with
//! `clear_callback` once nobody is listening, so pushes still in flight after
//! teardown are dropped instead of reaching a manager that no longer expects
//! them.

use std::sync::{Arc, Mutex, PoisonError};

use crate::core::template::{ProxyDataChangeInfo, PublishedDataChangeNode, RdbChangeNode};

pub type RdbDispatch = Arc<dyn Fn(&RdbChangeNode) + Send + Sync>;
pub type PublishedDataDispatch = Arc<dyn Fn(&PublishedDataChangeNode) + Send + Sync>;
pub type ProxyDataDispatch = Arc<dyn Fn(&[ProxyDataChangeInfo]) + Send + Sync>;

/// A detachable dispatch slot.
struct CallbackSlot<F: ?Sized> {
    callback: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    fn new(callback: Arc<F>) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// The callback is cloned out so that it runs without the slot locked.
    fn current(&self) -> Option<Arc<F>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, callback: Arc<F>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn clear(&self) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn is_attached(&self) -> bool {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Receives RDB template change pushes.
pub struct RdbObserverStub {
    slot: CallbackSlot<dyn Fn(&RdbChangeNode) + Send + Sync>,
}

impl RdbObserverStub {
    pub fn new(callback: RdbDispatch) -> Self {
        Self {
            slot: CallbackSlot::new(callback),
        }
    }

    pub fn on_change(&self, change_node: &RdbChangeNode) {
        match self.slot.current() {
            Some(callback) => callback(change_node),
            None => log::debug!("Rdb stub detached, dropping change for {}", crate::anonymous(&change_node.uri)),
        }
    }

    pub fn set_callback(&self, callback: RdbDispatch) {
        self.slot.set(callback);
    }

    pub fn clear_callback(&self) {
        self.slot.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.slot.is_attached()
    }
}

/// Receives published data pushes.
pub struct PublishedDataObserverStub {
    slot: CallbackSlot<dyn Fn(&PublishedDataChangeNode) + Send + Sync>,
}

impl PublishedDataObserverStub {
    pub fn new(callback: PublishedDataDispatch) -> Self {
        Self {
            slot: CallbackSlot::new(callback),
        }
    }

    pub fn on_change(&self, change_node: &PublishedDataChangeNode) {
        match self.slot.current() {
            Some(callback) => callback(change_node),
            None => log::debug!(
                "Published data stub detached, dropping {} item(s) from {}",
                change_node.datas.len(),
                change_node.owner_bundle_name
            ),
        }
    }

    pub fn set_callback(&self, callback: PublishedDataDispatch) {
        self.slot.set(callback);
    }

    pub fn clear_callback(&self) {
        self.slot.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.slot.is_attached()
    }
}

/// Receives proxy data change pushes.
pub struct ProxyDataObserverStub {
    slot: CallbackSlot<dyn Fn(&[ProxyDataChangeInfo]) + Send + Sync>,
}

impl ProxyDataObserverStub {
    pub fn new(callback: ProxyDataDispatch) -> Self {
        Self {
            slot: CallbackSlot::new(callback),
        }
    }

    pub fn on_change(&self, changes: &[ProxyDataChangeInfo]) {
        match self.slot.current() {
            Some(callback) => callback(changes),
            None => log::debug!("Proxy data stub detached, dropping {} change(s)", changes.len()),
        }
    }

    pub fn set_callback(&self, callback: ProxyDataDispatch) {
        self.slot.set(callback);
    }

    pub fn clear_callback(&self) {
        self.slot.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.slot.is_attached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::TemplateId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cleared_stub_drops_pushes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let stub = RdbObserverStub::new(Arc::new(move |_: &RdbChangeNode| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let node = RdbChangeNode {
            uri: "datashare:///a".into(),
            template_id: TemplateId::new(1, "b"),
            data: vec![],
        };

        stub.on_change(&node);
        stub.clear_callback();
        stub.on_change(&node);
        assert!(!stub.is_attached());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_clear_its_own_stub() {
        let stub = Arc::new(ProxyDataObserverStub::new(Arc::new(|_: &[ProxyDataChangeInfo]| {})));
        let weak = Arc::downgrade(&stub);
        stub.set_callback(Arc::new(move |_: &[ProxyDataChangeInfo]| {
            if let Some(stub) = weak.upgrade() {
                stub.clear_callback();
            }
        }));
        stub.on_change(&[]);
        assert!(!stub.is_attached());
    }
}
