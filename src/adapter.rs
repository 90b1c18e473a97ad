// src/adapter.rs

//! The contract between the state machine and whatever moves the bytes.
//!
//! An adapter either performs the network I/O itself ([`crate::http::HttpAdapter`])
//! or hands the request to a platform background-transfer service and relays
//! its status ([`crate::service::ServiceAdapter`]). Either way it reports back
//! through the [`AdapterEvents`] sink it was given in `begin`, and nothing else
//! talks to the state machine.

use crate::error::TransferError;
use crate::models::TransferRequest;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What the adapter needs to start (or resume) one transfer.
#[derive(Debug, Clone)]
pub struct TransferStart {
    pub request: TransferRequest,
    /// Bytes already on disk (downloads) or already accepted (uploads).
    pub offset: u64,
    /// Native handle reported through [`AdapterEvents::handle`] by an earlier
    /// `begin`, so a restored transfer can reattach instead of starting over.
    pub handle: Option<String>,
}

impl TransferStart {
    pub fn new(request: TransferRequest, offset: u64) -> Self {
        Self {
            request,
            offset,
            handle: None,
        }
    }
}

/// Non-byte status changes an adapter may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateHint {
    Running,
    Paused,
    WaitingForNetwork,
    WaitingForUnmeteredNetwork,
    /// The payload restarted from byte 0.
    Restarted,
}

#[derive(Debug)]
pub enum TerminalOutcome {
    Completed,
    Failed(TransferError),
    /// Acknowledges a `cancel`.
    Stopped,
}

#[derive(Debug)]
pub enum AdapterEvent {
    BytesDelta {
        bytes: u64,
        /// Updates the expected total when `Some`.
        total: Option<u64>,
    },
    StateHint(StateHint),
    /// The adapter's native handle for the transfer, persisted with the record.
    Handle(String),
    Terminal(TerminalOutcome),
}

/// Per-transfer event sink handed to the adapter.
///
/// Sends after the transfer has finished are dropped.
#[derive(Debug, Clone)]
pub struct AdapterEvents {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterEvents {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn bytes(&self, bytes: u64, total: Option<u64>) {
        let _ = self.tx.send(AdapterEvent::BytesDelta { bytes, total });
    }

    pub fn hint(&self, hint: StateHint) {
        let _ = self.tx.send(AdapterEvent::StateHint(hint));
    }

    pub fn handle(&self, handle: impl Into<String>) {
        let _ = self.tx.send(AdapterEvent::Handle(handle.into()));
    }

    pub fn finish(&self, outcome: TerminalOutcome) {
        let _ = self.tx.send(AdapterEvent::Terminal(outcome));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drives or delegates the I/O of transfers.
///
/// Methods must not block: long-running work belongs in tasks the adapter
/// spawns itself. `pause`, `resume` and `cancel` for an identifier the adapter
/// does not know are no-ops.
pub trait TransferAdapter: Send + Sync + 'static {
    fn begin(&self, start: TransferStart, events: AdapterEvents) -> Result<(), TransferError>;

    fn pause(&self, identifier: &str);

    fn resume(&self, identifier: &str);

    fn cancel(&self, identifier: &str);
}

/// Bounds on how often byte deltas are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPolicy {
    /// Deltas are never sent more often than this.
    pub min_interval: Duration,
    /// A (possibly zero) delta is sent at least this often.
    pub max_interval: Duration,
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl ReportPolicy {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        let min_interval = min_interval.max(Duration::from_millis(1));
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
        }
    }

    /// Clamps a service's native polling period into the policy bounds.
    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_interval, self.max_interval)
    }
}

#[derive(Debug, Default)]
struct Pending {
    moved: u64,
    total: Option<u64>,
    restarted: bool,
}

/// Shared tally that I/O code bumps and a [`DeltaReporter`] drains.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<Mutex<Pending>>);

impl ByteCounter {
    pub fn add(&self, bytes: u64) {
        self.lock().moved += bytes;
    }

    /// Attaches the expected total to the next delta.
    pub fn announce_total(&self, total: u64) {
        self.lock().total = Some(total);
    }

    /// Discards unreported bytes and reports a restart from byte 0.
    pub fn restart(&self) {
        let mut pending = self.lock();
        pending.moved = 0;
        pending.restarted = true;
    }

    fn take(&self) -> Pending {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Converts counter bumps into events on the policy's schedule.
pub struct DeltaReporter {
    counter: ByteCounter,
    events: AdapterEvents,
    policy: ReportPolicy,
    last_sent: Instant,
}

impl DeltaReporter {
    pub fn new(counter: ByteCounter, events: AdapterEvents, policy: ReportPolicy) -> Self {
        Self {
            counter,
            events,
            policy,
            last_sent: Instant::now(),
        }
    }

    /// Sends moved bytes, or a heartbeat once the maximum interval has passed
    /// without one.
    pub fn tick(&mut self) {
        let heartbeat_due = self.last_sent.elapsed() >= self.policy.max_interval;
        self.send(heartbeat_due);
    }

    /// Sends whatever is left, regardless of timing.
    pub fn flush(&mut self) {
        self.send(false);
    }

    fn send(&mut self, heartbeat: bool) {
        let pending = self.counter.take();
        if pending.restarted {
            self.events.hint(StateHint::Restarted);
        }
        if pending.moved > 0 || pending.total.is_some() || heartbeat {
            self.events.bytes(pending.moved, pending.total);
            self.last_sent = Instant::now();
        }
    }

    /// Ticks every `min_interval` until `stop` fires, then flushes.
    pub async fn run(mut self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.min_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = stop.cancelled() => break,
            }
        }
        self.flush();
    }
}
