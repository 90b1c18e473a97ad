// src/error.rs

use crate::store::StoreError;
use thiserror::Error;

/// Why an in-flight transfer failed.
///
/// They travel inside the `TransferResult` of the final Error update and
/// reach the delegate.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Transient network failure that outlived the retry budget.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    HttpStatus(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    /// Platform transfer service failure with the native cause attached.
    #[error("adapter fault: {0}")]
    Adapter(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransferError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Network(e) => !e.is_builder(),
            TransferError::HttpStatus(code) => matches!(code, 408 | 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gateway_style_statuses_are_transient() {
        assert!(TransferError::HttpStatus(503).is_transient());
        assert!(TransferError::HttpStatus(429).is_transient());
        assert!(!TransferError::HttpStatus(404).is_transient());
        assert!(!TransferError::HttpStatus(500).is_transient());
    }

    #[test]
    fn local_failures_are_not_retried() {
        let io = TransferError::Io(std::io::Error::other("disk full"));
        assert!(!io.is_transient());
        assert!(!TransferError::Adapter("boom".into()).is_transient());
    }

    #[test]
    fn messages_carry_the_cause() {
        let err = TransferError::Adapter("service went away".into());
        assert_eq!(err.to_string(), "adapter fault: service went away");
        assert_eq!(TransferError::HttpStatus(404).to_string(), "server responded with status 404");
    }
}
