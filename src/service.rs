// src/service.rs

//! Adapter for platform background-transfer services.
//!
//! Services such as a system download manager keep transfers alive while the
//! app is suspended, but only expose cumulative status on request. The
//! [`ServiceAdapter`] enqueues work with a [`BackgroundService`] binding, polls
//! it, and turns the cumulative counters into deltas, hints and outcomes.

use crate::adapter::{
    AdapterEvents, ByteCounter, DeltaReporter, ReportPolicy, StateHint, TerminalOutcome, TransferAdapter,
    TransferStart,
};
use crate::error::TransferError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Native state as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Queued,
    Running,
    Paused,
    WaitingForNetwork,
    WaitingForUnmeteredNetwork,
    Successful,
    Failed(String),
}

/// Cumulative status snapshot of one service-side transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

/// Binding to one platform's background-transfer service.
pub trait BackgroundService: Send + Sync + 'static {
    /// Hands the transfer to the service and returns the service's handle for it.
    fn enqueue(&self, start: &TransferStart) -> Result<String, TransferError>;

    fn status(&self, handle: &str) -> Result<ServiceStatus, TransferError>;

    fn pause(&self, handle: &str) -> Result<(), TransferError>;

    fn resume(&self, handle: &str) -> Result<(), TransferError>;

    /// Stops the transfer and forgets it.
    fn remove(&self, handle: &str) -> Result<(), TransferError>;

    /// How often the service refreshes its status.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

struct Poll {
    handle: String,
    events: AdapterEvents,
    token: CancellationToken,
}

/// Drives transfers through a [`BackgroundService`].
pub struct ServiceAdapter<S> {
    service: Arc<S>,
    policy: ReportPolicy,
    polls: Arc<Mutex<HashMap<String, Poll>>>,
}

impl<S: BackgroundService> ServiceAdapter<S> {
    pub fn new(service: S, policy: ReportPolicy) -> Self {
        Self {
            service: Arc::new(service),
            policy,
            polls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn polls(&self) -> MutexGuard<'_, HashMap<String, Poll>> {
        lock(&self.polls)
    }

    fn handle_of(&self, identifier: &str) -> Option<String> {
        self.polls().get(identifier).map(|p| p.handle.clone())
    }
}

fn lock(polls: &Mutex<HashMap<String, Poll>>) -> MutexGuard<'_, HashMap<String, Poll>> {
    polls.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: BackgroundService> TransferAdapter for ServiceAdapter<S> {
    fn begin(&self, start: TransferStart, events: AdapterEvents) -> Result<(), TransferError> {
        let identifier = start.request.identifier.clone();
        if self.polls().contains_key(&identifier) {
            return Err(TransferError::Adapter(format!("transfer {identifier} already enqueued")));
        }
        // A transfer restored after a restart may still be running natively.
        let known = start
            .handle
            .as_deref()
            .filter(|handle| self.service.status(handle).is_ok())
            .map(str::to_owned);
        let handle = match known {
            Some(handle) => {
                debug!(identifier = %identifier, handle = %handle, "reattached to background service");
                handle
            }
            None => {
                let handle = self.service.enqueue(&start)?;
                debug!(identifier = %identifier, handle = %handle, "enqueued with background service");
                events.handle(handle.clone());
                handle
            }
        };

        let token = CancellationToken::new();
        self.polls().insert(
            identifier.clone(),
            Poll {
                handle: handle.clone(),
                events: events.clone(),
                token: token.clone(),
            },
        );

        let poller = Poller {
            service: self.service.clone(),
            polls: self.polls.clone(),
            policy: self.policy,
            identifier,
            handle,
            events,
            token,
            last_bytes: start.offset,
            last_total: None,
            last_state: None,
        };
        tokio::spawn(poller.run());
        Ok(())
    }

    fn pause(&self, identifier: &str) {
        if let Some(handle) = self.handle_of(identifier) {
            if let Err(e) = self.service.pause(&handle) {
                warn!(identifier, error = %e, "background service refused pause");
            }
        }
    }

    fn resume(&self, identifier: &str) {
        if let Some(handle) = self.handle_of(identifier) {
            if let Err(e) = self.service.resume(&handle) {
                warn!(identifier, error = %e, "background service refused resume");
            }
        }
    }

    fn cancel(&self, identifier: &str) {
        let Some(poll) = self.polls().remove(identifier) else {
            return;
        };
        poll.token.cancel();
        if let Err(e) = self.service.remove(&poll.handle) {
            warn!(identifier, error = %e, "background service failed to remove transfer");
        }
        poll.events.finish(TerminalOutcome::Stopped);
    }
}

struct Poller<S> {
    service: Arc<S>,
    polls: Arc<Mutex<HashMap<String, Poll>>>,
    policy: ReportPolicy,
    identifier: String,
    handle: String,
    events: AdapterEvents,
    token: CancellationToken,
    last_bytes: u64,
    last_total: Option<u64>,
    last_state: Option<ServiceState>,
}

impl<S: BackgroundService> Poller<S> {
    async fn run(mut self) {
        let counter = ByteCounter::default();
        let reporter_stop = CancellationToken::new();
        let reporter = DeltaReporter::new(counter.clone(), self.events.clone(), self.policy);
        let reporter_task = tokio::spawn(reporter.run(reporter_stop.clone()));

        let mut ticker = tokio::time::interval(self.policy.clamp(self.service.poll_interval()));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.token.cancelled() => break None,
            }
            match self.service.status(&self.handle) {
                Ok(status) => {
                    if let Some(outcome) = self.observe(status, &counter) {
                        break Some(outcome);
                    }
                }
                Err(e) => break Some(TerminalOutcome::Failed(e)),
            }
        };

        reporter_stop.cancel();
        let _ = reporter_task.await;

        // Canceled pollers were already removed and acknowledged by `cancel`.
        if let Some(outcome) = outcome {
            lock(&self.polls).remove(&self.identifier);
            if let TerminalOutcome::Failed(e) = &outcome {
                warn!(identifier = %self.identifier, error = %e, "background transfer failed");
            }
            self.events.finish(outcome);
        }
    }

    /// Folds one status snapshot into the counter; returns the outcome once
    /// the service reports a final state.
    fn observe(&mut self, status: ServiceStatus, counter: &ByteCounter) -> Option<TerminalOutcome> {
        if status.bytes_transferred < self.last_bytes {
            counter.restart();
            self.last_bytes = 0;
        }
        counter.add(status.bytes_transferred - self.last_bytes);
        self.last_bytes = status.bytes_transferred;
        if status.total_bytes != self.last_total {
            if let Some(total) = status.total_bytes {
                counter.announce_total(total);
            }
            self.last_total = status.total_bytes;
        }

        if self.last_state.as_ref() == Some(&status.state) {
            return None;
        }
        self.last_state = Some(status.state.clone());
        match status.state {
            ServiceState::Queued => None,
            ServiceState::Running => {
                self.events.hint(StateHint::Running);
                None
            }
            ServiceState::Paused => {
                self.events.hint(StateHint::Paused);
                None
            }
            ServiceState::WaitingForNetwork => {
                self.events.hint(StateHint::WaitingForNetwork);
                None
            }
            ServiceState::WaitingForUnmeteredNetwork => {
                self.events.hint(StateHint::WaitingForUnmeteredNetwork);
                None
            }
            ServiceState::Successful => Some(TerminalOutcome::Completed),
            ServiceState::Failed(reason) => Some(TerminalOutcome::Failed(TransferError::Adapter(reason))),
        }
    }
}
