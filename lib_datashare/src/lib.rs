//! # lib_datashare
//!
//! Client-side subscription core of DataShare: observers of RDB template
//! queries, published data and proxy data, multiplexed onto one remote
//! registration per key.

#[cfg(feature = "configs")]
pub mod configs;
pub mod core;
pub mod errors;
pub mod helper;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod manager;
pub mod proxy;
pub mod subscribers;

// Re-export the everyday surface
pub use crate::core::callbacks::{CallbacksManager, SubscriberId};
pub use crate::core::template::*;
#[cfg(feature = "configs")]
pub use configs::{load_config, load_config_from, DataShareConfig};
pub use errors::{DataShareError, ErrCode, OperationResult};
pub use helper::DataShareHelper;
pub use manager::{DataShareManager, ReconnectPolicy};
pub use proxy::{DataShareService, LoopbackConnector, LoopbackService, ServiceConnector};
