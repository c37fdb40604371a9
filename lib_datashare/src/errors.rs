//! # Error Codes and Operation Results
//!
//! Subscription calls cross a process boundary, so they never fail as a whole.
//! Every requested URI gets its own [`OperationResult`] carrying an [`ErrCode`].
//! Ambient operations (configuration, logging, connecting to the service) are
//! ordinary fallible Rust calls returning [`DataShareError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer value of a successful operation.
pub const E_OK: i32 = 0;
/// Integer value reported when a subscriber enables or disables a key it never added.
pub const E_SUBSCRIBER_NOT_EXIST: i32 = 1049;
/// Integer value reported when unregistering a key that has no entries at all.
pub const E_UNREGISTERED_EMPTY: i32 = 1052;

/// # Error Code
///
/// Closed set of per-key outcomes. Codes produced by the remote service are
/// not interpreted beyond "zero means success" and travel verbatim in
/// [`ErrCode::Remote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrCode {
    /// The operation succeeded.
    #[default]
    Ok,
    /// Enable/disable was requested by a subscriber that never added the key.
    SubscriberNotExist,
    /// Unregister was requested on a key with no entries at all.
    UnregisteredEmpty,
    /// Any other code, as reported by the remote service.
    Remote(i32),
}

impl ErrCode {
    /// Maps a raw integer code onto the closed enumeration.
    pub fn from_code(code: i32) -> Self {
        match code {
            E_OK => ErrCode::Ok,
            E_SUBSCRIBER_NOT_EXIST => ErrCode::SubscriberNotExist,
            E_UNREGISTERED_EMPTY => ErrCode::UnregisteredEmpty,
            other => ErrCode::Remote(other),
        }
    }

    /// Returns the raw integer code.
    pub fn code(&self) -> i32 {
        match self {
            ErrCode::Ok => E_OK,
            ErrCode::SubscriberNotExist => E_SUBSCRIBER_NOT_EXIST,
            ErrCode::UnregisteredEmpty => E_UNREGISTERED_EMPTY,
            ErrCode::Remote(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ErrCode::Ok)
    }
}

impl From<i32> for ErrCode {
    fn from(code: i32) -> Self {
        ErrCode::from_code(code)
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrCode::Ok => write!(f, "ok"),
            ErrCode::SubscriberNotExist => write!(f, "subscriber not exist ({})", E_SUBSCRIBER_NOT_EXIST),
            ErrCode::UnregisteredEmpty => write!(f, "unregistered empty ({})", E_UNREGISTERED_EMPTY),
            ErrCode::Remote(code) => write!(f, "remote error ({})", code),
        }
    }
}

/// # Operation Result
///
/// Outcome of one subscription operation for one URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// The URI the result refers to.
    pub key: String,
    /// Outcome for that URI.
    pub err_code: ErrCode,
}

impl OperationResult {
    pub fn new(key: impl Into<String>, err_code: ErrCode) -> Self {
        Self {
            key: key.into(),
            err_code,
        }
    }

    pub fn ok(key: impl Into<String>) -> Self {
        Self::new(key, ErrCode::Ok)
    }
}

/// # DataShare Error
///
/// Failures of the ambient layers around the subscription core.
#[derive(Debug, Error)]
pub enum DataShareError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logger setup failed: {0}")]
    Logger(#[from] log::SetLoggerError),

    #[error("DataShare service is unavailable: {0}")]
    ServiceUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_code_round_trips_known_and_remote_codes() {
        assert_eq!(ErrCode::from_code(0), ErrCode::Ok);
        assert_eq!(ErrCode::from_code(1049), ErrCode::SubscriberNotExist);
        assert_eq!(ErrCode::from_code(1052), ErrCode::UnregisteredEmpty);
        assert_eq!(ErrCode::from_code(-1), ErrCode::Remote(-1));
        assert_eq!(ErrCode::Remote(-1).code(), -1);
        assert!(!ErrCode::Remote(7).is_ok());
    }

    #[test]
    fn test_default_err_code_is_ok() {
        assert_eq!(ErrCode::default(), ErrCode::Ok);
        assert_eq!(OperationResult::default().err_code.code(), E_OK);
    }

    #[test]
    fn test_operation_result_serializes() {
        let result = OperationResult::new("datashare:///a", ErrCode::Remote(3));
        let json = serde_json::to_string(&result).unwrap();
        let back: OperationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
