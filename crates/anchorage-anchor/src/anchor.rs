//! Spatial anchor entity and race-safe status application
//!
//! A backend may report `Success`/`Limited` for an anchor before the
//! anchor's backend handle exists locally, or before its first pose is
//! known. Such a status is held back (latest value wins) and applied the
//! moment both a handle and a pose are present. All other statuses apply
//! immediately.
//!
//! Mutators return the resulting [`AnchorChange`]s instead of notifying
//! observers directly; the session fires them once its own locks are
//! released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use anchorage_core::{AnchorId, AnchorPayload, AnchorStatus, EventSink, Pose, VpsError, VpsResult};

/// Backend-side resource of one anchor. Dropping it asks the backend to release the anchor.
pub struct AnchorHandle {
    id: AnchorId,
    sink: EventSink,
}

impl AnchorHandle {
    pub fn new(id: AnchorId, sink: EventSink) -> Self {
        AnchorHandle { id, sink }
    }

    pub fn id(&self) -> AnchorId {
        self.id
    }
}

impl Drop for AnchorHandle {
    fn drop(&mut self) {
        if !self.sink.release(self.id) {
            debug!(anchor = %self.id, "release after session teardown");
        }
    }
}

impl fmt::Debug for AnchorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnchorHandle({})", self.id)
    }
}

/// Observable change to an anchor
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AnchorChange {
    PoseChanged {
        id: AnchorId,
        pose: Pose,
    },
    StatusChanged {
        id: AnchorId,
        old: AnchorStatus,
        new: AnchorStatus,
    },
}

impl AnchorChange {
    pub fn anchor_id(&self) -> AnchorId {
        match self {
            AnchorChange::PoseChanged { id, .. } | AnchorChange::StatusChanged { id, .. } => *id,
        }
    }
}

/// Result of offering a status to an anchor
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusOutcome {
    Applied(AnchorChange),
    /// Held back until the anchor has a handle and a pose
    Queued,
    Unchanged,
}

/// Registration token returned by [`SpatialAnchor::observe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&SpatialAnchor, &AnchorChange) + Send + Sync>;

/// Materialised copy of an anchor's state
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnchorSnapshot {
    pub id: AnchorId,
    pub status: AnchorStatus,
    /// Present only while the status carries a pose
    pub pose: Option<Pose>,
    pub tracking: bool,
    pub resolving: bool,
}

struct AnchorState {
    status: AnchorStatus,
    /// `None` until a pose has been set
    pose: Option<Pose>,
    tracking: bool,
    resolving: bool,
    handle: Option<AnchorHandle>,
    queued_status: Option<AnchorStatus>,
}

impl AnchorState {
    fn can_apply_pose_status(&self) -> bool {
        self.handle.is_some() && self.pose.is_some()
    }

    fn take_ready_queued(&mut self, id: AnchorId) -> Option<AnchorChange> {
        if !self.can_apply_pose_status() {
            return None;
        }
        let queued = self.queued_status.take()?;
        if queued == self.status {
            return None;
        }
        let old = self.status;
        self.status = queued;
        Some(AnchorChange::StatusChanged {
            id,
            old,
            new: queued,
        })
    }
}

pub(crate) struct AnchorCell {
    id: AnchorId,
    state: RwLock<AnchorState>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

/// Shared handle to a spatial anchor
///
/// Clones refer to the same anchor. The registry only holds weak
/// references; the anchor lives as long as any handle does.
#[derive(Clone)]
pub struct SpatialAnchor {
    inner: Arc<AnchorCell>,
}

impl SpatialAnchor {
    pub(crate) fn new(id: AnchorId, pose: Option<Pose>) -> Self {
        SpatialAnchor {
            inner: Arc::new(AnchorCell {
                id,
                state: RwLock::new(AnchorState {
                    status: AnchorStatus::Pending,
                    pose,
                    tracking: true,
                    resolving: false,
                    handle: None,
                    queued_status: None,
                }),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_cell(inner: Arc<AnchorCell>) -> Self {
        SpatialAnchor { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<AnchorCell> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> AnchorId {
        self.inner.id
    }

    pub fn status(&self) -> AnchorStatus {
        self.inner.state.read().status
    }

    /// Current pose, if the status vouches for it
    pub fn pose(&self) -> Option<Pose> {
        let state = self.inner.state.read();
        if state.status.carries_pose() {
            state.pose
        } else {
            None
        }
    }

    /// Last pose set on the anchor regardless of status
    pub fn last_known_pose(&self) -> Option<Pose> {
        self.inner.state.read().pose
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.state.read().tracking
    }

    pub fn is_resolving(&self) -> bool {
        self.inner.state.read().resolving
    }

    pub fn has_handle(&self) -> bool {
        self.inner.state.read().handle.is_some()
    }

    pub fn queued_status(&self) -> Option<AnchorStatus> {
        self.inner.state.read().queued_status
    }

    pub fn snapshot(&self) -> AnchorSnapshot {
        let state = self.inner.state.read();
        AnchorSnapshot {
            id: self.inner.id,
            status: state.status,
            pose: if state.status.carries_pose() {
                state.pose
            } else {
                None
            },
            tracking: state.tracking,
            resolving: state.resolving,
        }
    }

    /// Serialize for restoration in a later session
    pub fn payload(&self) -> VpsResult<AnchorPayload> {
        let state = self.inner.state.read();
        match (state.status.carries_pose(), state.pose) {
            (true, Some(pose)) => Ok(AnchorPayload::encode(self.inner.id, &pose)),
            _ => Err(VpsError::NotReady {
                id: self.inner.id,
                status: state.status,
            }),
        }
    }

    /// True if both handles point at the same anchor
    pub fn ptr_eq(a: &SpatialAnchor, b: &SpatialAnchor) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Register an observer for pose and status changes.
    ///
    /// Observers run on the delivery task, in arrival order. They must not
    /// register or remove observers on the same anchor.
    pub fn observe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&SpatialAnchor, &AnchorChange) + Send + Sync + 'static,
    {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.inner.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Fire observers for a change produced by one of the mutators below
    pub fn notify(&self, change: &AnchorChange) {
        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(self, change);
        }
    }

    // ------------------------------------------------------------------
    // Session-driven mutation. Called only from the delivery task.
    // ------------------------------------------------------------------

    /// Bind the backend resource. Sets `initial_pose` if no pose is known yet.
    pub fn attach_handle(
        &self,
        handle: AnchorHandle,
        initial_pose: Option<Pose>,
    ) -> Option<AnchorChange> {
        let mut state = self.inner.state.write();
        state.handle = Some(handle);
        if state.pose.is_none() {
            state.pose = initial_pose;
        }
        state.take_ready_queued(self.inner.id)
    }

    pub fn apply_status(&self, status: AnchorStatus) -> StatusOutcome {
        let mut state = self.inner.state.write();

        if status.carries_pose() && !state.can_apply_pose_status() {
            debug!(anchor = %self.inner.id, ?status, "status queued until pose and handle are known");
            state.queued_status = Some(status);
            return StatusOutcome::Queued;
        }

        // A newer word from the backend supersedes anything held back
        state.queued_status = None;
        if status == state.status {
            return StatusOutcome::Unchanged;
        }

        let old = state.status;
        state.status = status;
        StatusOutcome::Applied(AnchorChange::StatusChanged {
            id: self.inner.id,
            old,
            new: status,
        })
    }

    /// Apply a resolved pose. Identical poses produce no changes.
    pub fn update_pose(&self, pose: Pose) -> Vec<AnchorChange> {
        let mut state = self.inner.state.write();
        if state.pose == Some(pose) {
            return Vec::new();
        }

        state.pose = Some(pose);
        let mut changes = vec![AnchorChange::PoseChanged {
            id: self.inner.id,
            pose,
        }];
        changes.extend(state.take_ready_queued(self.inner.id));
        changes
    }

    /// Force the anchor back to `Pending`, dropping any held-back status
    pub fn reset_pending(&self) -> Option<AnchorChange> {
        let mut state = self.inner.state.write();
        state.queued_status = None;
        if state.status == AnchorStatus::Pending {
            return None;
        }
        let old = state.status;
        state.status = AnchorStatus::Pending;
        Some(AnchorChange::StatusChanged {
            id: self.inner.id,
            old,
            new: AnchorStatus::Pending,
        })
    }

    pub fn set_resolving(&self, resolving: bool) -> bool {
        let mut state = self.inner.state.write();
        let changed = state.resolving != resolving;
        state.resolving = resolving;
        changed
    }

    /// Set the caller-visible tracking flag and the backend subscription
    /// flag together, under one lock.
    pub fn set_tracking(&self, tracking: bool) -> bool {
        let mut state = self.inner.state.write();
        let changed = state.tracking != tracking || state.resolving != tracking;
        state.tracking = tracking;
        state.resolving = tracking;
        changed
    }

    /// Drop the backend resource now rather than with the last handle
    pub fn detach_handle(&self) -> Option<AnchorHandle> {
        let mut state = self.inner.state.write();
        state.resolving = false;
        state.handle.take()
    }
}

impl fmt::Debug for SpatialAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SpatialAnchor")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("pose", &state.pose)
            .field("tracking", &state.tracking)
            .field("resolving", &state.resolving)
            .field("queued_status", &state.queued_status)
            .finish()
    }
}
