// src/testing.rs

use crate::adapter::{AdapterEvents, TerminalOutcome, TransferAdapter, TransferStart};
use crate::error::TransferError;
use crate::manager::TransferDelegate;
use crate::models::TransferRequest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(2);
const PATIENCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Begin(String, u64),
    Pause(String),
    Resume(String),
    Cancel(String),
}

/// Records every call and hands the event sinks to the test.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    sinks: Mutex<HashMap<String, AdapterEvents>>,
    calls: Mutex<Vec<Call>>,
    ignore_cancel: bool,
    begin_error: Option<String>,
}

impl ScriptedAdapter {
    /// Acknowledges every cancel immediately.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn ignoring_cancel() -> Arc<Self> {
        Arc::new(Self {
            ignore_cancel: true,
            ..Self::default()
        })
    }

    pub(crate) fn failing_begin(message: &str) -> Arc<Self> {
        Arc::new(Self {
            begin_error: Some(message.to_owned()),
            ..Self::default()
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn begin_count(&self, identifier: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Begin(id, _) if id == identifier))
            .count()
    }

    pub(crate) async fn wait_begun(&self, identifier: &str) -> AdapterEvents {
        self.wait_begins(identifier, 1).await
    }

    /// Waits for the `count`th begin of `identifier` and returns its sink.
    pub(crate) async fn wait_begins(&self, identifier: &str, count: usize) -> AdapterEvents {
        let found = tokio::time::timeout(PATIENCE, async {
            loop {
                if self.begin_count(identifier) >= count {
                    if let Some(sink) = self.sinks.lock().unwrap().get(identifier) {
                        return sink.clone();
                    }
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("{identifier} was never begun {count} time(s)"))
    }

    pub(crate) async fn wait_for_call(&self, call: &Call) {
        let found = tokio::time::timeout(PATIENCE, async {
            while !self.calls().contains(call) {
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        assert!(found.is_ok(), "adapter never saw {call:?}");
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TransferAdapter for ScriptedAdapter {
    fn begin(&self, start: TransferStart, events: AdapterEvents) -> Result<(), TransferError> {
        let identifier = start.request.identifier.clone();
        self.record(Call::Begin(identifier.clone(), start.offset));
        if let Some(message) = &self.begin_error {
            return Err(TransferError::Adapter(message.clone()));
        }
        self.sinks.lock().unwrap().insert(identifier, events);
        Ok(())
    }

    fn pause(&self, identifier: &str) {
        self.record(Call::Pause(identifier.to_owned()));
    }

    fn resume(&self, identifier: &str) {
        self.record(Call::Resume(identifier.to_owned()));
    }

    fn cancel(&self, identifier: &str) {
        self.record(Call::Cancel(identifier.to_owned()));
        if self.ignore_cancel {
            return;
        }
        if let Some(sink) = self.sinks.lock().unwrap().remove(identifier) {
            sink.finish(TerminalOutcome::Stopped);
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingDelegate {
    completed: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingDelegate {
    pub(crate) fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }

    /// Waits until `count` callbacks of either kind have fired.
    pub(crate) async fn wait_for(&self, count: usize) {
        let reached = tokio::time::timeout(PATIENCE, async {
            while self.completed().len() + self.errors().len() < count {
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "delegate saw fewer than {count} callbacks");
    }
}

impl TransferDelegate for RecordingDelegate {
    fn on_completed(&self, request: &TransferRequest) {
        self.completed.lock().unwrap().push(request.identifier.clone());
    }

    fn on_error(&self, request: &TransferRequest, error: &TransferError) {
        self.errors
            .lock()
            .unwrap()
            .push((request.identifier.clone(), error.to_string()));
    }
}
