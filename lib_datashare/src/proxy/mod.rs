//! # Service Proxy Boundary
//!
//! What the subscriber managers need from the remote DataShare service: the
//! batched call surface, the stubs that receive pushes, and an in-process
//! loopback implementation of both.

/// The `DataShareService` call surface and the `ServiceConnector` that yields it.
pub mod service;
/// Detachable push receivers, one per subscription domain.
pub mod stub;
pub mod loopback;

pub use loopback::{LoopbackConnector, LoopbackService, RemoteCall, RemoteOp};
pub use service::{DataShareService, ServiceConnector};
pub use stub::{ProxyDataObserverStub, PublishedDataObserverStub, RdbObserverStub};
