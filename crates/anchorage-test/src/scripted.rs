//! Scripted backend for deterministic session tests
//!
//! Records every call the session makes into a shared [`Journal`] and lets
//! the test push backend events in any order, including orders a real
//! service only produces under races.

use std::sync::Arc;

use parking_lot::Mutex;

use anchorage_backend::LocalizationBackend;
use anchorage_core::{
    AnchorId, AnchorPayload, AnchorStatus, BackendEvent, EventSink, FailureReason,
    LocalizationConfig, LocalizationState, Pose, VpsError, VpsResult,
};

/// Backend call as seen by the scripted backend
#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    Start,
    Stop,
    Create(Vec<AnchorId>),
    Restore(AnchorId),
    StartResolving(Vec<AnchorId>),
    StopResolving(Vec<AnchorId>),
    Release(Vec<AnchorId>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    Call(BackendCall),
    /// A state change observed by a session subscriber
    Observed(LocalizationState),
}

/// Ordered record of backend calls and observed states
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Call(call) => Some(call.clone()),
                JournalEntry::Observed(_) => None,
            })
            .collect()
    }

    /// Positions of every entry equal to `entry`
    pub fn positions(&self, entry: &JournalEntry) -> Vec<usize> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == entry)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Test-side handle: inject events and inspect the journal
#[derive(Clone, Debug)]
pub struct Script {
    journal: Journal,
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl Script {
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Push an event as if the backend delivered it. False before the
    /// backend is attached to a session.
    pub fn send(&self, event: BackendEvent) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    pub fn state(&self, state: LocalizationState, reason: FailureReason) -> bool {
        self.send(BackendEvent::state(state, reason))
    }

    /// `Localizing` followed by `Localized`
    pub fn localize(&self) -> bool {
        self.state(LocalizationState::Localizing, FailureReason::None)
            && self.state(LocalizationState::Localized, FailureReason::None)
    }

    pub fn created(&self, ids: &[AnchorId]) -> bool {
        self.send(BackendEvent::CreatedBatch { ids: ids.to_vec() })
    }

    pub fn status(&self, id: AnchorId, status: AnchorStatus) -> bool {
        self.send(BackendEvent::StatusUpdated {
            statuses: vec![(id, status)],
        })
    }

    pub fn pose(&self, id: AnchorId, pose: Pose) -> bool {
        self.send(BackendEvent::Resolved {
            poses: vec![(id, pose)],
        })
    }
}

/// Backend driven entirely by the test
pub struct ScriptedBackend {
    journal: Journal,
    sink: Arc<Mutex<Option<EventSink>>>,
    auto_localize: bool,
    available: bool,
    next_id: u128,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Script) {
        let journal = Journal::new();
        let sink = Arc::new(Mutex::new(None));
        let backend = ScriptedBackend {
            journal: journal.clone(),
            sink: Arc::clone(&sink),
            auto_localize: false,
            available: true,
            next_id: 0x1000,
        };
        (backend, Script { journal, sink })
    }

    /// Report `Localizing` and `Localized` as soon as a run starts
    pub fn auto_localize(mut self) -> Self {
        self.auto_localize = true;
        self
    }

    /// Behave like a platform without the native library
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn sink(&self) -> Option<EventSink> {
        self.sink.lock().clone()
    }

    fn call(&self, call: BackendCall) {
        self.journal.record(JournalEntry::Call(call));
    }
}

impl LocalizationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn attach(&mut self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn start(&mut self, _config: &LocalizationConfig) -> VpsResult<()> {
        let sink = self.sink().ok_or(VpsError::BackendUnavailable)?;
        self.call(BackendCall::Start);
        if self.auto_localize {
            sink.send(BackendEvent::state(
                LocalizationState::Localizing,
                FailureReason::None,
            ));
            sink.send(BackendEvent::state(
                LocalizationState::Localized,
                FailureReason::None,
            ));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.call(BackendCall::Stop);
    }

    fn create(&mut self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>> {
        let ids: Vec<AnchorId> = poses
            .iter()
            .map(|_| {
                self.next_id += 1;
                AnchorId::new(self.next_id)
            })
            .collect();
        self.call(BackendCall::Create(ids.clone()));
        Ok(ids)
    }

    fn restore(&mut self, payload: &AnchorPayload) -> VpsResult<AnchorId> {
        let id = payload.anchor_id()?;
        self.call(BackendCall::Restore(id));
        Ok(id)
    }

    fn start_resolving(&mut self, ids: &[AnchorId]) {
        self.call(BackendCall::StartResolving(ids.to_vec()));
    }

    fn stop_resolving(&mut self, ids: &[AnchorId]) {
        self.call(BackendCall::StopResolving(ids.to_vec()));
    }

    fn release(&mut self, ids: &[AnchorId]) {
        self.call(BackendCall::Release(ids.to_vec()));
    }
}
