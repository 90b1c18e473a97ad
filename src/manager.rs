// src/manager.rs

use crate::adapter::TransferAdapter;
use crate::config::{ConfigError, RetentionPolicy, TransferConfig};
use crate::error::TransferError;
use crate::http::HttpAdapter;
use crate::machine::{restored_result, Command, Context, Registry, Start, StateMachine};
use crate::models::{NetworkAccess, Transfer, TransferRequest, TransferResult, TransferState};
use crate::store::{SqliteStore, StoreError, TransferStore};
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("transfer {0} is already active")]
    DuplicateIdentifier(String),
    #[error("transfer {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("adapter error: {0}")]
    Adapter(TransferError),
}

/// Host callbacks fired once per transfer, after its final update is broadcast.
///
/// Canceled transfers get neither callback. Implementations run on the
/// transfer's task and should return quickly.
pub trait TransferDelegate: Send + Sync + 'static {
    fn on_completed(&self, request: &TransferRequest);

    fn on_error(&self, request: &TransferRequest, error: &TransferError);
}

/// The façade hosts talk to.
///
/// Cloning is cheap; every clone drives the same set of transfers.
pub struct TransferManager<S = SqliteStore> {
    ctx: Arc<Context<S>>,
}

impl<S> Clone for TransferManager<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl TransferManager<SqliteStore> {
    /// A manager backed by the SQLite file and the streaming HTTP adapter
    /// described by `config`.
    pub async fn open(config: TransferConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let store = SqliteStore::open(&config.database_path).await?;
        let adapter = HttpAdapter::new(config.http_options()).map_err(ManagerError::Adapter)?;
        Self::new(store, Arc::new(adapter), config, None).await
    }
}

impl<S: TransferStore> TransferManager<S> {
    /// Builds a manager and restores the transfers persisted in `store`.
    ///
    /// Non-terminal records are handed back to the adapter at their persisted
    /// offset, except Paused ones which wait for `resume`. Terminal records are
    /// dropped or kept according to the retention policy.
    pub async fn new(
        store: S,
        adapter: Arc<dyn TransferAdapter>,
        config: TransferConfig,
        delegate: Option<Arc<dyn TransferDelegate>>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let (updates, _) = broadcast::channel(config.broadcast_capacity);
        let (network, _) = watch::channel(NetworkAccess::default());
        let registry = Mutex::new(Registry::new(config.finished_history));
        let ctx = Arc::new(Context {
            store,
            adapter,
            config,
            delegate,
            registry,
            updates,
            network,
        });

        let (unfinished, finished): (Vec<_>, Vec<_>) = ctx
            .store
            .get_all()
            .await?
            .into_iter()
            .partition(|transfer| !transfer.state.is_terminal());
        if ctx.config.retention == RetentionPolicy::Delete {
            for transfer in &finished {
                ctx.store.remove(transfer.identifier()).await?;
            }
        }

        let restored = unfinished.len();
        let machines: Vec<_> = {
            let mut registry = ctx.registry.lock().await;
            if ctx.config.retention == RetentionPolicy::Keep {
                for transfer in &finished {
                    registry.finished.record(restored_result(transfer));
                }
            }
            unfinished
                .into_iter()
                .map(|transfer| StateMachine::register(&ctx, &mut registry, transfer))
                .collect()
        };
        for machine in machines {
            machine.start(Start::Restored);
        }
        info!(restored, "transfer manager ready");

        Ok(Self { ctx })
    }

    /// Validates and persists `request`, then starts its transfer.
    ///
    /// The identifier may be reused once its previous transfer is terminal.
    pub async fn queue(&self, mut request: TransferRequest) -> Result<Transfer, ManagerError> {
        request
            .validate()
            .map_err(|e| ManagerError::InvalidRequest(e.to_string()))?;
        let allow_metered = request.allows_metered(self.ctx.config.allow_metered_by_default);
        request.use_metered_connection = Some(allow_metered);

        // Registering first reserves the identifier while the record is written.
        let machine = loop {
            let retiring = {
                let mut registry = self.ctx.registry.lock().await;
                if registry.active.contains_key(&request.identifier) {
                    return Err(ManagerError::DuplicateIdentifier(request.identifier));
                }
                match registry.retiring(&request.identifier) {
                    Some(retiring) => retiring,
                    None => {
                        registry.finished.forget(&request.identifier);
                        break StateMachine::register(&self.ctx, &mut registry, Transfer::new(request));
                    }
                }
            };
            // The previous transfer's record is still being removed.
            retiring.cancelled().await;
        };
        let transfer = machine.transfer().clone();
        if let Err(cause) = self.ctx.store.set(&transfer).await {
            machine.withdraw(&mut *self.ctx.registry.lock().await);
            return Err(cause.into());
        }
        machine.start(Start::Fresh);

        info!(
            identifier = %transfer.identifier(),
            direction = ?transfer.request.direction,
            uri = %transfer.request.uri,
            "transfer queued"
        );
        Ok(transfer)
    }

    /// Asks the active transfer to stop. Completion is observed through updates.
    pub async fn cancel(&self, identifier: &str) -> Result<(), ManagerError> {
        self.send(identifier, Command::Cancel).await
    }

    /// Cancels every transfer active at the time of the call.
    pub async fn cancel_all(&self) {
        let commands: Vec<_> = {
            let registry = self.ctx.registry.lock().await;
            registry.active.values().map(|handle| handle.commands.clone()).collect()
        };
        info!(count = commands.len(), "cancelling all transfers");
        for tx in commands {
            let _ = tx.send(Command::Cancel);
        }
    }

    pub async fn pause(&self, identifier: &str) -> Result<(), ManagerError> {
        self.send(identifier, Command::Pause).await
    }

    pub async fn resume(&self, identifier: &str) -> Result<(), ManagerError> {
        self.send(identifier, Command::Resume).await
    }

    async fn send(&self, identifier: &str, command: Command) -> Result<(), ManagerError> {
        let registry = self.ctx.registry.lock().await;
        let handle = registry
            .active
            .get(identifier)
            .ok_or_else(|| ManagerError::NotFound(identifier.to_owned()))?;
        debug!(identifier, ?command, "sending command");
        // A closed channel means the transfer is finishing right now.
        let _ = handle.commands.send(command);
        Ok(())
    }

    /// Snapshot of every stored record, ordered by identifier.
    pub async fn get_transfers(&self) -> Result<Vec<Transfer>, ManagerError> {
        Ok(self.ctx.store.get_all().await?)
    }

    pub async fn get_transfer(&self, identifier: &str) -> Result<Transfer, ManagerError> {
        self.ctx
            .store
            .get(identifier)
            .await?
            .ok_or_else(|| ManagerError::NotFound(identifier.to_owned()))
    }

    /// Every update of every transfer from now on.
    ///
    /// A subscriber that falls more than `broadcast_capacity` updates behind
    /// loses the oldest ones; nobody else is slowed down.
    pub fn when_update_received(&self) -> BoxStream<'static, TransferResult> {
        let rx = self.ctx.updates.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(result) => return Some((result, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "update subscriber lagged, oldest updates dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Updates of one transfer, ending after its terminal update.
    ///
    /// Error updates arrive as `Err` with the cause. If the transfer already
    /// finished, the stream yields its terminal update and ends. That update
    /// comes from the finished log, or from the stored record once the log has
    /// evicted it. Under `Delete` retention an evicted result is gone, and the
    /// stream waits for the identifier to be queued again.
    pub async fn watch_transfer(
        &self,
        identifier: &str,
    ) -> BoxStream<'static, Result<TransferResult, Arc<TransferError>>> {
        // Subscribe before looking at the registry so nothing falls in between.
        let rx = self.ctx.updates.subscribe();
        let (active, finished) = {
            let registry = self.ctx.registry.lock().await;
            (
                registry.active.contains_key(identifier),
                registry.finished.get(identifier).cloned(),
            )
        };
        if let (false, Some(result)) = (active, finished.as_ref()) {
            return stream::once(future::ready(outcome(result.clone()))).boxed();
        }
        if !active && finished.is_none() {
            if let Some(result) = self.stored_result(identifier).await {
                return stream::once(future::ready(outcome(result))).boxed();
            }
        }

        let ctx = Arc::clone(&self.ctx);
        let identifier = identifier.to_owned();
        stream::unfold(Some(rx), move |rx| {
            let ctx = Arc::clone(&ctx);
            let identifier = identifier.clone();
            async move {
                let mut rx = rx?;
                loop {
                    let result = match rx.recv().await {
                        Ok(result) if result.identifier() == identifier => result,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(identifier = %identifier, skipped, "watcher lagged");
                            // The terminal update may have been among the skipped ones.
                            let registry = ctx.registry.lock().await;
                            match registry.finished.get(&identifier) {
                                Some(result) if !registry.active.contains_key(&identifier) => {
                                    return Some((outcome(result.clone()), None));
                                }
                                _ => continue,
                            }
                        }
                        Err(RecvError::Closed) => return None,
                    };
                    let next = if result.state.is_terminal() { None } else { Some(rx) };
                    return Some((outcome(result), next));
                }
            }
        })
        .boxed()
    }

    /// The terminal result of a stored record, unless the identifier is active.
    async fn stored_result(&self, identifier: &str) -> Option<TransferResult> {
        let transfer = match self.ctx.store.get(identifier).await {
            Ok(transfer) => transfer?,
            Err(cause) => {
                warn!(identifier, error = %cause, "could not read record for watcher");
                return None;
            }
        };
        if !transfer.state.is_terminal() || self.ctx.registry.lock().await.active.contains_key(identifier) {
            return None;
        }
        Some(restored_result(&transfer))
    }

    /// Reports a connectivity change; transfers pause or resume accordingly.
    pub fn set_network_access(&self, access: NetworkAccess) {
        let previous = self.ctx.network.send_replace(access);
        if previous != access {
            info!(?previous, ?access, "network access changed");
        }
    }

    pub fn network_access(&self) -> NetworkAccess {
        *self.ctx.network.borrow()
    }
}

fn outcome(result: TransferResult) -> Result<TransferResult, Arc<TransferError>> {
    if result.state != TransferState::Error {
        return Ok(result);
    }
    Err(result
        .error
        .unwrap_or_else(|| Arc::new(TransferError::Adapter("transfer failed".into()))))
}
