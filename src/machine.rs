// src/machine.rs

//! One task per active transfer.
//!
//! The task owns the [`Transfer`] record. Commands from the manager, events
//! from the adapter and connectivity changes are handled one at a time, so
//! every update is persisted before it is broadcast and nothing can be
//! broadcast after the terminal update.

use crate::adapter::{AdapterEvent, AdapterEvents, StateHint, TerminalOutcome, TransferAdapter, TransferStart};
use crate::config::{RetentionPolicy, TransferConfig};
use crate::error::TransferError;
use crate::manager::TransferDelegate;
use crate::models::{NetworkAccess, Transfer, TransferResult, TransferState};
use crate::progress::{ThroughputMeter, TransferProgress};
use crate::store::TransferStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume,
    Cancel,
}

/// How a machine came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Start {
    /// Queued by the caller; the Pending record is announced first.
    Fresh,
    /// Loaded from the store at startup.
    Restored,
}

pub(crate) struct MachineHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    generation: u64,
}

/// Terminal results kept for late `watch_transfer` subscribers.
pub(crate) struct FinishedLog {
    capacity: usize,
    order: VecDeque<String>,
    results: HashMap<String, TransferResult>,
}

impl FinishedLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            results: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, result: TransferResult) {
        if self.capacity == 0 {
            return;
        }
        let identifier = result.identifier().to_owned();
        if self.results.insert(identifier.clone(), result).is_none() {
            self.order.push_back(identifier);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    pub(crate) fn forget(&mut self, identifier: &str) {
        if self.results.remove(identifier).is_some() {
            self.order.retain(|id| id != identifier);
        }
    }

    pub(crate) fn get(&self, identifier: &str) -> Option<&TransferResult> {
        self.results.get(identifier)
    }
}

pub(crate) struct Registry {
    pub(crate) active: HashMap<String, MachineHandle>,
    pub(crate) finished: FinishedLog,
    /// Finished identifiers whose records are still being removed. The token
    /// is cancelled once the record is gone.
    retiring: HashMap<String, CancellationToken>,
    next_generation: u64,
}

impl Registry {
    pub(crate) fn new(finished_history: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: FinishedLog::new(finished_history),
            retiring: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Resolves once the previous record of `identifier` has been removed.
    pub(crate) fn retiring(&self, identifier: &str) -> Option<CancellationToken> {
        self.retiring.get(identifier).cloned()
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Removes the active entry for `identifier` if it still belongs to
    /// `generation`.
    fn deregister(&mut self, identifier: &str, generation: u64) -> bool {
        let registered = self
            .active
            .get(identifier)
            .is_some_and(|handle| handle.generation == generation);
        if registered {
            self.active.remove(identifier);
        }
        registered
    }
}

/// State shared by the manager and every machine it spawned.
pub(crate) struct Context<S> {
    pub(crate) store: S,
    pub(crate) adapter: Arc<dyn TransferAdapter>,
    pub(crate) config: TransferConfig,
    pub(crate) delegate: Option<Arc<dyn TransferDelegate>>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) updates: broadcast::Sender<TransferResult>,
    pub(crate) network: watch::Sender<NetworkAccess>,
}

pub(crate) struct StateMachine<S> {
    ctx: Arc<Context<S>>,
    transfer: Transfer,
    generation: u64,
    allow_metered: bool,
    meter: ThroughputMeter,
    commands: mpsc::UnboundedReceiver<Command>,
    sink: AdapterEvents,
    events: mpsc::UnboundedReceiver<AdapterEvent>,
    network: watch::Receiver<NetworkAccess>,
    started: bool,
    cancel_deadline: Option<Instant>,
}

impl<S: TransferStore> StateMachine<S> {
    /// Registers `transfer` as active. Commands sent before [`start`](Self::start)
    /// wait in the channel.
    pub(crate) fn register(ctx: &Arc<Context<S>>, registry: &mut Registry, transfer: Transfer) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (sink, events) = AdapterEvents::channel();
        let generation = registry.next_generation();
        let allow_metered = transfer.request.allows_metered(ctx.config.allow_metered_by_default);
        let identifier = transfer.identifier().to_owned();

        let machine = StateMachine {
            ctx: Arc::clone(ctx),
            transfer,
            generation,
            allow_metered,
            meter: ThroughputMeter::new(ctx.config.throughput_window(), now()),
            commands,
            sink,
            events,
            network: ctx.network.subscribe(),
            started: false,
            cancel_deadline: None,
        };
        registry.active.insert(
            identifier,
            MachineHandle {
                commands: commands_tx,
                generation,
            },
        );
        machine
    }

    pub(crate) fn start(self, start: Start) {
        tokio::spawn(self.run(start));
    }

    /// Undoes [`register`](Self::register) for a machine that never started.
    pub(crate) fn withdraw(self, registry: &mut Registry) {
        registry.deregister(self.transfer.identifier(), self.generation);
    }

    pub(crate) fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    async fn run(mut self, start: Start) {
        debug!(
            identifier = %self.transfer.identifier(),
            state = %self.transfer.state,
            ?start,
            "state machine started"
        );
        if start == Start::Fresh {
            self.publish();
        }
        let access = *self.network.borrow_and_update();
        self.on_network(access).await;

        while !self.transfer.state.is_terminal() {
            let deadline = self.cancel_deadline;
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(event) = self.events.recv() => self.on_event(event).await,
                Ok(()) = self.network.changed() => {
                    let access = *self.network.borrow_and_update();
                    self.on_network(access).await;
                }
                _ = cancel_timer(deadline) => {
                    warn!(
                        identifier = %self.transfer.identifier(),
                        "adapter did not acknowledge cancel in time"
                    );
                    self.finish(TransferState::Canceled, None).await;
                }
            }
        }
        debug!(identifier = %self.transfer.identifier(), "state machine stopped");
    }

    fn identifier(&self) -> &str {
        self.transfer.identifier()
    }

    async fn on_command(&mut self, command: Command) {
        if self.cancel_deadline.is_some() {
            return;
        }
        let state = self.transfer.state;
        match command {
            Command::Pause => {
                if !state.can_transition_to(TransferState::Paused) {
                    debug!(identifier = %self.identifier(), %state, "pause ignored");
                    return;
                }
                if self.started {
                    self.ctx.adapter.pause(self.identifier());
                }
                self.transition(TransferState::Paused).await;
            }
            Command::Resume => {
                if state != TransferState::Paused {
                    debug!(identifier = %self.identifier(), %state, "resume ignored");
                    return;
                }
                let access = *self.network.borrow();
                if !access.permits(self.allow_metered) {
                    self.transition(access.blocked_state()).await;
                    return;
                }
                if self.started {
                    self.ctx.adapter.resume(self.identifier());
                } else {
                    self.begin().await;
                }
                self.transition(TransferState::InProgress).await;
            }
            Command::Cancel => {
                if !self.started {
                    self.finish(TransferState::Canceled, None).await;
                    return;
                }
                info!(identifier = %self.identifier(), "cancelling transfer");
                self.cancel_deadline = Some(Instant::now() + self.ctx.config.cancel_timeout());
                self.ctx.adapter.cancel(self.identifier());
            }
        }
    }

    async fn on_event(&mut self, event: AdapterEvent) {
        if self.cancel_deadline.is_some() {
            // Whatever the adapter reports last, the caller asked for a cancel.
            if let AdapterEvent::Terminal(_) = event {
                self.finish(TransferState::Canceled, None).await;
            }
            return;
        }
        match event {
            AdapterEvent::BytesDelta { bytes, total } => self.on_bytes(bytes, total).await,
            AdapterEvent::StateHint(hint) => self.on_hint(hint).await,
            AdapterEvent::Handle(handle) => {
                debug!(identifier = %self.identifier(), %handle, "adapter assigned native handle");
                self.transfer.adapter_handle = Some(handle);
                self.persist().await;
            }
            AdapterEvent::Terminal(TerminalOutcome::Completed) => {
                self.finish(TransferState::Completed, None).await;
            }
            AdapterEvent::Terminal(TerminalOutcome::Failed(cause)) => {
                self.finish(TransferState::Error, Some(cause)).await;
            }
            AdapterEvent::Terminal(TerminalOutcome::Stopped) => {
                warn!(identifier = %self.identifier(), "adapter stopped a transfer nobody cancelled");
                self.finish(TransferState::Canceled, None).await;
            }
        }
    }

    async fn on_bytes(&mut self, bytes: u64, total: Option<u64>) {
        let total_changed = total.is_some() && total != self.transfer.bytes_to_transfer;
        if let Some(total) = total {
            self.transfer.bytes_to_transfer = Some(total);
        }
        self.transfer.bytes_transferred += bytes;
        self.meter.record(bytes, now());

        if bytes > 0 && self.transfer.is_fully_transferred() {
            self.finish(TransferState::Completed, None).await;
            return;
        }
        let state = self.transfer.state;
        if bytes > 0 && matches!(state, TransferState::Unknown | TransferState::Pending) {
            self.transition(TransferState::InProgress).await;
        } else if bytes > 0 || total_changed || state == TransferState::InProgress {
            self.commit().await;
        }
    }

    async fn on_hint(&mut self, hint: StateHint) {
        let next = match hint {
            StateHint::Running => TransferState::InProgress,
            StateHint::Paused => TransferState::Paused,
            StateHint::WaitingForNetwork => TransferState::PausedByNoNetwork,
            StateHint::WaitingForUnmeteredNetwork => TransferState::PausedByCostedNetwork,
            StateHint::Restarted => {
                debug!(identifier = %self.identifier(), "payload restarted from zero");
                self.transfer.bytes_transferred = 0;
                self.meter.reset(now());
                return;
            }
        };
        if self.transfer.state.can_transition_to(next) {
            self.transition(next).await;
        }
    }

    async fn on_network(&mut self, access: NetworkAccess) {
        let state = self.transfer.state;
        if state.is_terminal() || self.cancel_deadline.is_some() {
            return;
        }
        let waiting = matches!(
            state,
            TransferState::PausedByNoNetwork | TransferState::PausedByCostedNetwork
        );

        if access.permits(self.allow_metered) {
            let was_started = self.started;
            if !was_started && state != TransferState::Paused {
                self.begin().await;
            }
            if waiting && !self.transfer.state.is_terminal() {
                if was_started {
                    self.ctx.adapter.resume(self.identifier());
                }
                self.transition(TransferState::InProgress).await;
            }
            return;
        }

        let blocked = access.blocked_state();
        let affected = waiting || matches!(state, TransferState::InProgress | TransferState::Paused);
        if !affected || state == blocked {
            // A Pending transfer simply does not begin yet.
            return;
        }
        debug!(identifier = %self.identifier(), ?access, "network not usable");
        if state == TransferState::InProgress && self.started {
            self.ctx.adapter.pause(self.identifier());
        }
        self.transition(blocked).await;
    }

    async fn begin(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.meter.reset(now());
        let start = TransferStart {
            request: self.transfer.request.clone(),
            offset: self.transfer.bytes_transferred,
            handle: self.transfer.adapter_handle.clone(),
        };
        debug!(identifier = %self.identifier(), offset = start.offset, "beginning transfer");
        if let Err(cause) = self.ctx.adapter.begin(start, self.sink.clone()) {
            self.finish(TransferState::Error, Some(cause)).await;
        }
    }

    async fn transition(&mut self, next: TransferState) {
        let from = self.transfer.state;
        if !from.can_transition_to(next) {
            debug!(identifier = %self.identifier(), %from, to = %next, "transition rejected");
            return;
        }
        debug!(identifier = %self.identifier(), %from, to = %next, "transition");
        self.transfer.state = next;
        self.commit().await;
    }

    /// Persists the current record, then broadcasts it.
    async fn commit(&mut self) {
        if self.persist().await {
            self.publish();
        }
    }

    /// Writes the current record. A failure ends the transfer with a storage
    /// error and returns false.
    async fn persist(&mut self) -> bool {
        let Err(cause) = self.ctx.store.set(&self.transfer).await else {
            return true;
        };
        error!(identifier = %self.identifier(), error = %cause, "failed to persist transfer");
        if self.started {
            self.ctx.adapter.cancel(self.identifier());
        }
        self.finish(TransferState::Error, Some(TransferError::Storage(cause)))
            .await;
        false
    }

    async fn finish(&mut self, state: TransferState, cause: Option<TransferError>) {
        if self.transfer.state.is_terminal() {
            return;
        }
        let from = self.transfer.state;
        self.transfer.state = state;
        let mut cause = cause.map(Arc::new);

        if let Err(store_error) = self.ctx.store.set(&self.transfer).await {
            error!(
                identifier = %self.identifier(),
                error = %store_error,
                "failed to persist final state"
            );
            if state != TransferState::Error {
                self.transfer.state = TransferState::Error;
                cause = Some(Arc::new(TransferError::Storage(store_error)));
            }
        }

        let result = self.result(cause.clone());
        let retired = CancellationToken::new();
        let delete = self.ctx.config.retention == RetentionPolicy::Delete;
        {
            let mut registry = self.ctx.registry.lock().await;
            registry.deregister(self.identifier(), self.generation);
            registry.finished.record(result.clone());
            if delete {
                registry.retiring.insert(self.identifier().to_owned(), retired.clone());
            }
        }

        match &cause {
            Some(cause) => warn!(
                identifier = %self.identifier(),
                %from,
                state = %self.transfer.state,
                error = %cause,
                "transfer finished"
            ),
            None => info!(
                identifier = %self.identifier(),
                %from,
                state = %self.transfer.state,
                bytes = self.transfer.bytes_transferred,
                "transfer finished"
            ),
        }
        let _ = self.ctx.updates.send(result);

        if let Some(delegate) = &self.ctx.delegate {
            match (self.transfer.state, &cause) {
                (TransferState::Completed, _) => delegate.on_completed(&self.transfer.request),
                (TransferState::Error, Some(cause)) => delegate.on_error(&self.transfer.request, cause),
                _ => {}
            }
        }

        if delete {
            self.retire(retired).await;
        }
    }

    /// Removes the finished record. `queue` waits on `retired` before it
    /// writes a new record under the same identifier.
    async fn retire(&self, retired: CancellationToken) {
        if let Err(cause) = self.ctx.store.remove(self.identifier()).await {
            warn!(identifier = %self.identifier(), error = %cause, "failed to remove finished transfer");
        }
        self.ctx.registry.lock().await.retiring.remove(self.identifier());
        retired.cancel();
    }

    fn publish(&self) {
        // No receivers is fine.
        let _ = self.ctx.updates.send(self.result(None));
    }

    fn result(&self, error: Option<Arc<TransferError>>) -> TransferResult {
        TransferResult {
            request: self.transfer.request.clone(),
            state: self.transfer.state,
            progress: TransferProgress::new(
                self.meter.bytes_per_second(now()),
                self.transfer.bytes_to_transfer,
                self.transfer.bytes_transferred,
            ),
            error,
        }
    }
}

/// Builds the result a late subscriber sees for a record that finished
/// before this process started.
pub(crate) fn restored_result(transfer: &Transfer) -> TransferResult {
    TransferResult {
        request: transfer.request.clone(),
        state: transfer.state,
        progress: TransferProgress::new(0, transfer.bytes_to_transfer, transfer.bytes_transferred),
        error: None,
    }
}

async fn cancel_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
