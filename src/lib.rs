pub mod adapter;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
mod machine;
pub mod manager;
pub mod models;
pub mod progress;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::adapter::{AdapterEvents, StateHint, TerminalOutcome, TransferAdapter, TransferStart};
    pub use crate::config::{RetentionPolicy, TransferConfig};
    pub use crate::error::TransferError;
    pub use crate::manager::{ManagerError, TransferDelegate, TransferManager};
    pub use crate::models::{
        NetworkAccess, Transfer, TransferDirection, TransferHttpContent, TransferRequest, TransferResult,
        TransferState,
    };
    pub use crate::progress::TransferProgress;
    pub use crate::store::{MemoryStore, SqliteStore, TransferStore};
}
