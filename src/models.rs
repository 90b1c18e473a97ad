// src/models.rs

use crate::error::TransferError;
use crate::progress::TransferProgress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Whether a transfer pushes a local file up or pulls a remote one down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// Request body descriptor sent along with a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferHttpContent {
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_content_type() -> String {
    "text/plain".into()
}

fn default_encoding() -> String {
    "utf-8".into()
}

impl TransferHttpContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: default_content_type(),
            encoding: default_encoding(),
        }
    }

    /// Serializes `value` as a JSON body.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content: serde_json::to_string(value)?,
            content_type: "application/json".into(),
            encoding: default_encoding(),
        })
    }

    /// `Content-Type` header value, including the charset.
    pub fn mime(&self) -> String {
        format!("{}; charset={}", self.content_type, self.encoding)
    }
}

/// Immutable, caller-supplied description of one transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    /// Caller-chosen key, unique among active transfers.
    pub identifier: String,
    pub uri: String,
    pub direction: TransferDirection,
    pub local_file_path: PathBuf,
    /// `None` defers to the manager's configured default.
    #[serde(default)]
    pub use_metered_connection: Option<bool>,
    #[serde(default)]
    pub http_content: Option<TransferHttpContent>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl TransferRequest {
    pub fn new(
        identifier: impl Into<String>,
        uri: impl Into<String>,
        direction: TransferDirection,
        local_file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            uri: uri.into(),
            direction,
            local_file_path: local_file_path.into(),
            use_metered_connection: None,
            http_content: None,
            http_method: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn download(identifier: impl Into<String>, uri: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(identifier, uri, TransferDirection::Download, path)
    }

    pub fn upload(identifier: impl Into<String>, uri: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(identifier, uri, TransferDirection::Upload, path)
    }

    pub fn with_metered(mut self, allowed: bool) -> Self {
        self.use_metered_connection = Some(allowed);
        self
    }

    pub fn with_content(mut self, content: TransferHttpContent) -> Self {
        self.http_content = Some(content);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_upload(&self) -> bool {
        self.direction == TransferDirection::Upload
    }

    /// Metered-network permission, falling back to `default` when unset.
    pub fn allows_metered(&self, default: bool) -> bool {
        self.use_metered_connection.unwrap_or(default)
    }

    /// The override if present, otherwise POST for uploads and GET for downloads.
    pub fn http_method(&self) -> Result<reqwest::Method, TransferError> {
        let fallback = if self.is_upload() { "POST" } else { "GET" };
        let name = self.http_method.as_deref().unwrap_or(fallback);
        reqwest::Method::from_bytes(name.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransferError::InvalidRequest(format!("invalid http method {name:?}")))
    }

    /// Checks the request before anything is persisted.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.identifier.trim().is_empty() {
            return Err(TransferError::InvalidRequest("identifier must not be empty".into()));
        }
        let url = reqwest::Url::parse(&self.uri)
            .map_err(|e| TransferError::InvalidRequest(format!("invalid uri {:?}: {e}", self.uri)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidRequest(format!(
                "unsupported uri scheme {:?}",
                url.scheme()
            )));
        }
        if self.local_file_path.as_os_str().is_empty() {
            return Err(TransferError::InvalidRequest("local file path must not be empty".into()));
        }
        self.http_method()?;
        Ok(())
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Unknown,
    Pending,
    Paused,
    PausedByNoNetwork,
    PausedByCostedNetwork,
    InProgress,
    Error,
    Canceled,
    Completed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Canceled | TransferState::Error)
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            TransferState::Paused | TransferState::PausedByNoNetwork | TransferState::PausedByCostedNetwork
        )
    }

    /// The allowed edges of the transfer lifecycle.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            Unknown | Pending => false,
            Error | Canceled | Completed => true,
            InProgress => matches!(self, Unknown | Pending | Paused | PausedByNoNetwork | PausedByCostedNetwork),
            Paused => matches!(self, Pending | InProgress | PausedByNoNetwork | PausedByCostedNetwork),
            PausedByNoNetwork => matches!(self, InProgress | Paused | PausedByCostedNetwork),
            PausedByCostedNetwork => matches!(self, InProgress | Paused | PausedByNoNetwork),
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::Unknown => "unknown",
            TransferState::Pending => "pending",
            TransferState::Paused => "paused",
            TransferState::PausedByNoNetwork => "paused_by_no_network",
            TransferState::PausedByCostedNetwork => "paused_by_costed_network",
            TransferState::InProgress => "in_progress",
            TransferState::Error => "error",
            TransferState::Canceled => "canceled",
            TransferState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Connectivity as reported by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAccess {
    Disconnected,
    Metered,
    #[default]
    Unmetered,
}

impl NetworkAccess {
    pub fn permits(self, allow_metered: bool) -> bool {
        match self {
            NetworkAccess::Disconnected => false,
            NetworkAccess::Metered => allow_metered,
            NetworkAccess::Unmetered => true,
        }
    }

    /// The paused state a transfer waits in while this network is unusable to it.
    pub fn blocked_state(self) -> TransferState {
        match self {
            NetworkAccess::Disconnected => TransferState::PausedByNoNetwork,
            NetworkAccess::Metered | NetworkAccess::Unmetered => TransferState::PausedByCostedNetwork,
        }
    }
}

/// The persisted record of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub request: TransferRequest,
    /// `None` while the payload size is unknown or streamed.
    pub bytes_to_transfer: Option<u64>,
    pub bytes_transferred: u64,
    pub state: TransferState,
    pub created_at: DateTime<Utc>,
    /// Native handle of a platform service transfer, if the adapter has one.
    #[serde(default)]
    pub adapter_handle: Option<String>,
}

impl Transfer {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            request,
            bytes_to_transfer: None,
            bytes_transferred: 0,
            state: TransferState::Pending,
            created_at: Utc::now(),
            adapter_handle: None,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.request.identifier
    }

    pub fn is_deterministic(&self) -> bool {
        self.bytes_to_transfer.is_some()
    }

    /// True once a known payload size has been fully moved.
    pub fn is_fully_transferred(&self) -> bool {
        matches!(self.bytes_to_transfer, Some(total) if self.bytes_transferred >= total)
    }
}

/// One update as seen by subscribers and the delegate.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub request: TransferRequest,
    pub state: TransferState,
    pub progress: TransferProgress,
    pub error: Option<Arc<TransferError>>,
}

impl TransferResult {
    pub fn identifier(&self) -> &str {
        &self.request.identifier
    }

    pub fn is_deterministic(&self) -> bool {
        self.progress.is_deterministic()
    }
}
