//! Backend events and the delivery queue
//!
//! Backends deliver events from threads this crate does not control.
//! Every event is pushed through one [`EventSink`] into one [`EventQueue`];
//! the single consumer of that queue is the only place session, registry
//! and anchor state change. "Before" and "after" between two events are
//! therefore a total order: the order of arrival in the queue.

use tokio::sync::{mpsc, oneshot};

use crate::{AnchorId, AnchorStatus, FailureReason, LocalizationState, Pose, SessionStatus};

/// Inbound event from a localization backend
#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    StateChanged {
        state: LocalizationState,
        reason: FailureReason,
    },
    /// Backend-side creation finished for these identities
    CreatedBatch { ids: Vec<AnchorId> },
    Resolved { poses: Vec<(AnchorId, Pose)> },
    StatusUpdated {
        statuses: Vec<(AnchorId, AnchorStatus)>,
    },
}

impl BackendEvent {
    pub fn state(state: LocalizationState, reason: FailureReason) -> Self {
        BackendEvent::StateChanged { state, reason }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendEvent::StateChanged { .. } => "state_changed",
            BackendEvent::CreatedBatch { .. } => "created_batch",
            BackendEvent::Resolved { .. } => "resolved",
            BackendEvent::StatusUpdated { .. } => "status_updated",
        }
    }
}

/// Item travelling through the delivery queue
#[derive(Debug)]
pub enum Delivery {
    Backend(BackendEvent),
    /// Last handle to an anchor's backend resource was dropped
    Release(AnchorId),
    /// Localization deadline for the given run elapsed
    Deadline { run: u64 },
    /// Session-originated state change, already applied; publish only
    Transition(SessionStatus),
    /// Anchor status change made by a caller operation, already applied;
    /// publish only
    StatusChanged {
        id: AnchorId,
        old: AnchorStatus,
        new: AnchorStatus,
    },
    /// Signalled once everything queued before it has been applied
    Barrier(oneshot::Sender<()>),
}

/// Producer side of the delivery queue. Cheap to clone, usable from any thread.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Consumer side of the delivery queue
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

/// Create a connected sink/queue pair
pub fn delivery_queue() -> (EventSink, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventQueue { rx })
}

impl EventSink {
    /// Push a backend event. Returns false once the consumer is gone.
    pub fn send(&self, event: BackendEvent) -> bool {
        self.tx.send(Delivery::Backend(event)).is_ok()
    }

    pub fn release(&self, id: AnchorId) -> bool {
        self.tx.send(Delivery::Release(id)).is_ok()
    }

    pub fn deadline(&self, run: u64) -> bool {
        self.tx.send(Delivery::Deadline { run }).is_ok()
    }

    pub fn transition(&self, status: SessionStatus) -> bool {
        self.tx.send(Delivery::Transition(status)).is_ok()
    }

    pub fn status_changed(&self, id: AnchorId, old: AnchorStatus, new: AnchorStatus) -> bool {
        self.tx.send(Delivery::StatusChanged { id, old, new }).is_ok()
    }

    /// Wait until every item pushed before this call has been consumed
    pub async fn barrier(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Delivery::Barrier(done_tx)).is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventQueue {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}
