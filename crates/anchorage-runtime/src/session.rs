//! Localization session - state machine and delivery loop
//!
//! The session owns one [`LocalizationBackend`]. Backend callbacks arrive
//! on arbitrary threads and are pushed into a single delivery queue; one
//! task drains that queue, applies each item to the session, registry and
//! anchors, and then publishes the resulting changes. Caller operations
//! take the same core lock, so the state seen by an event is always the
//! state left by everything queued before it.
//!
//! State changes the session makes on its own behalf (start, stop,
//! deadline) take effect immediately and are published through the queue,
//! so observers see every transition in one total order. Backend state
//! events queued ahead of such a change belong to the earlier run and are
//! dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use anchorage_anchor::{AnchorChange, AnchorHandle, AnchorRegistry, SpatialAnchor, StatusOutcome};
use anchorage_backend::LocalizationBackend;
use anchorage_core::{
    delivery_queue, AnchorId, AnchorPayload, AnchorStatus, BackendEvent, Delivery, EventQueue,
    EventSink, FailureReason, LocalizationConfig, LocalizationState, Pose, SessionStatus,
    VpsError, VpsResult,
};

use crate::PoseSource;

/// Session options
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Capacity of the broadcast channel behind [`LocalizationSession::subscribe`]
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            event_capacity: 256,
        }
    }
}

/// Event published to session subscribers, in delivery order
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    LocalizationStateChanged {
        state: LocalizationState,
        reason: FailureReason,
    },
    /// Backend confirmed creation; the anchors are now in the registry
    AnchorsCreated { ids: Vec<AnchorId> },
    AnchorChanged(AnchorChange),
}

/// Registration token returned by [`LocalizationSession::observe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub events_delivered: u64,
    pub transitions_published: u64,
    pub duplicate_states_dropped: u64,
    /// Events for destroyed anchors, state events from an earlier run and
    /// transitions the state machine refused
    pub stale_events_ignored: u64,
    pub statuses_queued: u64,
    pub statuses_applied_late: u64,
    pub poses_applied: u64,
    pub poses_unchanged: u64,
    pub poses_dropped_paused: u64,
    /// Non-finite poses from the backend
    pub poses_rejected: u64,
    pub releases: u64,
}

impl SessionStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

enum Notice {
    State(SessionStatus),
    Created(Vec<AnchorId>),
    Anchor(SpatialAnchor, AnchorChange),
}

type Observer = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Publisher {
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
    next_observer: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
}

impl Publisher {
    fn publish(&self, notices: Vec<Notice>) {
        for notice in notices {
            let event = match notice {
                Notice::State(status) => {
                    self.status.send_replace(status);
                    SessionEvent::LocalizationStateChanged {
                        state: status.state,
                        reason: status.reason,
                    }
                }
                Notice::Created(ids) => SessionEvent::AnchorsCreated { ids },
                Notice::Anchor(anchor, change) => {
                    anchor.notify(&change);
                    SessionEvent::AnchorChanged(change)
                }
            };

            let observers: Vec<Observer> = self
                .observers
                .lock()
                .iter()
                .map(|(_, o)| Arc::clone(o))
                .collect();
            for observer in observers {
                observer(&event);
            }
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }
}

struct SessionCore {
    backend: Box<dyn LocalizationBackend>,
    registry: AnchorRegistry,
    sink: EventSink,
    runtime: Handle,
    status: SessionStatus,
    config: Option<LocalizationConfig>,
    run: u64,
    backend_running: bool,
    watchdog: Option<JoinHandle<()>>,
    pose_source: Option<Arc<dyn PoseSource>>,
    /// Anchors this session manages; kept alive until destroyed or torn down
    anchors: HashMap<AnchorId, SpatialAnchor>,
    /// Requested poses of creations the backend has not confirmed yet
    pending_creates: HashMap<AnchorId, Pose>,
    /// Anchors to resolve whenever the session is localized
    resolving: Vec<AnchorId>,
    destroyed: HashSet<AnchorId>,
    /// Session-originated transitions queued but not yet published. Backend
    /// state events dequeued before them belong to an earlier run.
    unpublished: usize,
    stats: SessionStats,
}

impl SessionCore {
    fn apply(&mut self, item: Delivery) -> Vec<Notice> {
        let mut notices = Vec::new();
        match item {
            Delivery::Backend(event) => {
                self.stats.events_delivered += 1;
                debug!(kind = event.kind(), "backend event");
                match event {
                    BackendEvent::StateChanged { state, .. } if self.unpublished > 0 => {
                        self.stats.stale_events_ignored += 1;
                        debug!(%state, "state event from before the last start or stop");
                    }
                    // Only `start` enters Initializing
                    BackendEvent::StateChanged {
                        state: LocalizationState::Initializing,
                        ..
                    } if self.status.state != LocalizationState::Initializing => {
                        self.stats.stale_events_ignored += 1;
                        warn!(from = %self.status.state, "backend tried to re-enter initializing");
                    }
                    BackendEvent::StateChanged { state, reason } => {
                        if let Some(status) = self.transition(state, reason) {
                            notices.push(Notice::State(status));
                        }
                    }
                    BackendEvent::CreatedBatch { ids } => self.on_created(ids, &mut notices),
                    BackendEvent::StatusUpdated { statuses } => {
                        self.on_statuses(statuses, &mut notices)
                    }
                    BackendEvent::Resolved { poses } => self.on_poses(poses, &mut notices),
                }
            }
            Delivery::Release(id) => self.on_release(id),
            Delivery::Deadline { run } => {
                if let Some(status) = self.on_deadline(run) {
                    notices.push(Notice::State(status));
                }
            }
            Delivery::Transition(status) => {
                self.unpublished = self.unpublished.saturating_sub(1);
                notices.push(Notice::State(status));
            }
            Delivery::StatusChanged { id, old, new } => {
                if let Some(anchor) = self.anchors.get(&id) {
                    let change = AnchorChange::StatusChanged { id, old, new };
                    notices.push(Notice::Anchor(anchor.clone(), change));
                }
            }
            Delivery::Barrier(done) => {
                let _ = done.send(());
            }
        }
        notices
    }

    /// Move to `state` if it differs from the current one and the state
    /// machine allows it. Returns the published status.
    fn transition(
        &mut self,
        state: LocalizationState,
        reason: FailureReason,
    ) -> Option<SessionStatus> {
        let current = self.status.state;
        if state == current {
            self.stats.duplicate_states_dropped += 1;
            debug!(%state, "duplicate state dropped");
            return None;
        }

        let continuous = self
            .config
            .as_ref()
            .is_some_and(|c| c.continuous_localization_enabled);
        if !current.permits(state, continuous) {
            self.stats.stale_events_ignored += 1;
            warn!(from = %current, to = %state, "transition refused");
            return None;
        }

        let reason = match state {
            LocalizationState::Stopped if reason == FailureReason::Canceled => {
                FailureReason::for_stop(current)
            }
            LocalizationState::Failed | LocalizationState::Stopped => reason,
            _ => FailureReason::None,
        };

        self.status = SessionStatus::new(state, reason);
        self.stats.transitions_published += 1;
        info!(from = %current, to = %state, ?reason, "localization state changed");

        match state {
            LocalizationState::Localized => {
                self.disarm_watchdog();
                self.resume_resolving();
            }
            LocalizationState::Failed | LocalizationState::Stopped => self.disarm_watchdog(),
            _ => {}
        }
        Some(self.status)
    }

    /// Transition made on the session's own behalf; published via the queue
    fn transition_now(&mut self, state: LocalizationState, reason: FailureReason) {
        if let Some(status) = self.transition(state, reason) {
            if self.sink.transition(status) {
                self.unpublished += 1;
            } else {
                debug!(%state, "transition after delivery stopped");
            }
        }
    }

    fn arm_watchdog(&mut self, config: &LocalizationConfig) {
        self.disarm_watchdog();
        let sink = self.sink.clone();
        let run = self.run;
        let timeout = config.localization_timeout();
        self.watchdog = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            sink.deadline(run);
        }));
    }

    fn disarm_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    fn halt_backend(&mut self) {
        if self.backend_running {
            self.backend.stop();
            self.backend_running = false;
        }
    }

    fn on_deadline(&mut self, run: u64) -> Option<SessionStatus> {
        if run != self.run || !self.status.state.is_attempting() {
            debug!(run, "stale deadline");
            return None;
        }
        warn!(run, state = %self.status.state, "localization deadline elapsed");
        self.halt_backend();
        self.transition(LocalizationState::Failed, FailureReason::Timeout)
    }

    /// Re-issue resolution for every wanted anchor
    fn resume_resolving(&mut self) {
        if self.resolving.is_empty() {
            return;
        }
        debug!(count = self.resolving.len(), "resuming anchor resolution");
        let ids = self.resolving.clone();
        self.backend.start_resolving(&ids);
    }

    fn want_resolving(&mut self, anchor: &SpatialAnchor) {
        anchor.set_resolving(true);
        if !self.resolving.contains(&anchor.id()) {
            self.resolving.push(anchor.id());
        }
    }

    /// The anchor for an identity named by a backend event, constructing a
    /// `Pending` one if the registry has none
    fn adopt(&mut self, id: AnchorId) -> SpatialAnchor {
        if let Some(anchor) = self.anchors.get(&id) {
            return anchor.clone();
        }
        let (anchor, created) = self.registry.get_or_create(id, None);
        if created {
            debug!(anchor = %id, "anchor constructed from backend event");
        }
        self.anchors.insert(id, anchor.clone());
        anchor
    }

    fn is_destroyed(&mut self, id: AnchorId) -> bool {
        if self.destroyed.contains(&id) {
            self.stats.stale_events_ignored += 1;
            debug!(anchor = %id, "event for destroyed anchor ignored");
            return true;
        }
        false
    }

    fn on_created(&mut self, ids: Vec<AnchorId>, notices: &mut Vec<Notice>) {
        let mut confirmed = Vec::with_capacity(ids.len());
        for id in ids {
            if self.is_destroyed(id) {
                continue;
            }
            let requested = self.pending_creates.remove(&id);
            if requested.is_none() && !self.anchors.contains_key(&id) {
                warn!(anchor = %id, "creation confirmed for anchor this session never requested");
            }

            let anchor = self.adopt(id);
            if !anchor.has_handle() {
                let handle = AnchorHandle::new(id, self.sink.clone());
                if let Some(change) = anchor.attach_handle(handle, requested) {
                    self.stats.statuses_applied_late += 1;
                    notices.push(Notice::Anchor(anchor.clone(), change));
                }
            }
            if anchor.is_tracking() {
                self.want_resolving(&anchor);
            }
            confirmed.push(id);
        }

        if confirmed.is_empty() {
            return;
        }
        if self.status.state == LocalizationState::Localized {
            let wanted: Vec<AnchorId> = confirmed
                .iter()
                .filter(|id| self.resolving.contains(*id))
                .copied()
                .collect();
            if !wanted.is_empty() {
                self.backend.start_resolving(&wanted);
            }
        }
        info!(count = confirmed.len(), "anchor creation confirmed");
        notices.push(Notice::Created(confirmed));
    }

    fn on_statuses(&mut self, statuses: Vec<(AnchorId, AnchorStatus)>, notices: &mut Vec<Notice>) {
        for (id, status) in statuses {
            if self.is_destroyed(id) {
                continue;
            }
            let anchor = self.adopt(id);
            match anchor.apply_status(status) {
                StatusOutcome::Applied(change) => notices.push(Notice::Anchor(anchor, change)),
                StatusOutcome::Queued => self.stats.statuses_queued += 1,
                StatusOutcome::Unchanged => {}
            }
        }
    }

    fn on_poses(&mut self, poses: Vec<(AnchorId, Pose)>, notices: &mut Vec<Notice>) {
        for (id, pose) in poses {
            if self.is_destroyed(id) {
                continue;
            }
            if !pose.is_finite() {
                self.stats.poses_rejected += 1;
                warn!(anchor = %id, "non-finite pose dropped");
                continue;
            }
            let anchor = self.adopt(id);
            if !anchor.is_resolving() {
                self.stats.poses_dropped_paused += 1;
                continue;
            }

            let changes = anchor.update_pose(pose);
            if changes.is_empty() {
                self.stats.poses_unchanged += 1;
                continue;
            }
            self.stats.poses_applied += 1;
            for change in changes {
                if matches!(change, AnchorChange::StatusChanged { .. }) {
                    self.stats.statuses_applied_late += 1;
                }
                notices.push(Notice::Anchor(anchor.clone(), change));
            }
        }
    }

    fn on_release(&mut self, id: AnchorId) {
        // A restore may have bound a new handle since this one was dropped
        if self.anchors.get(&id).is_some_and(|a| a.has_handle()) {
            debug!(anchor = %id, "superseded release ignored");
            return;
        }
        self.stats.releases += 1;
        self.resolving.retain(|r| *r != id);
        self.backend.release(&[id]);
    }

    fn teardown(&mut self) {
        self.disarm_watchdog();
        self.halt_backend();

        let ids: Vec<AnchorId> = self.anchors.keys().copied().collect();
        for (id, anchor) in self.anchors.drain() {
            self.registry.remove(id);
            drop(anchor.detach_handle());
        }
        if !ids.is_empty() {
            self.backend.release(&ids);
        }
        self.pending_creates.clear();
        self.resolving.clear();
        self.status = SessionStatus::default();
        info!(released = ids.len(), "localization session torn down");
    }
}

async fn deliver(core: Arc<Mutex<SessionCore>>, publisher: Arc<Publisher>, mut queue: EventQueue) {
    while let Some(item) = queue.recv().await {
        let notices = core.lock().apply(item);
        publisher.publish(notices);
    }
    debug!("delivery queue closed");
}

/// Localization session
///
/// Must be created inside a tokio runtime; the delivery task and the
/// localization deadline run on that runtime.
pub struct LocalizationSession {
    core: Arc<Mutex<SessionCore>>,
    publisher: Arc<Publisher>,
    sink: EventSink,
    delivery: JoinHandle<()>,
}

impl LocalizationSession {
    pub fn new<B>(backend: B, registry: AnchorRegistry) -> Self
    where
        B: LocalizationBackend + 'static,
    {
        Self::with_options(backend, registry, SessionOptions::default())
    }

    pub fn with_options<B>(mut backend: B, registry: AnchorRegistry, options: SessionOptions) -> Self
    where
        B: LocalizationBackend + 'static,
    {
        let runtime = Handle::current();
        let (sink, queue) = delivery_queue();
        backend.attach(sink.clone());
        info!(backend = backend.name(), "localization session created");

        let core = Arc::new(Mutex::new(SessionCore {
            backend: Box::new(backend),
            registry,
            sink: sink.clone(),
            runtime: runtime.clone(),
            status: SessionStatus::default(),
            config: None,
            run: 0,
            backend_running: false,
            watchdog: None,
            pose_source: None,
            anchors: HashMap::new(),
            pending_creates: HashMap::new(),
            resolving: Vec::new(),
            destroyed: HashSet::new(),
            unpublished: 0,
            stats: SessionStats::default(),
        }));

        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (status, _) = watch::channel(SessionStatus::default());
        let publisher = Arc::new(Publisher {
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            events,
            status,
        });

        let delivery = runtime.spawn(deliver(Arc::clone(&core), Arc::clone(&publisher), queue));

        LocalizationSession {
            core,
            publisher,
            sink,
            delivery,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.lock().backend.name()
    }

    /// Attach (or detach, with `None`) the device pose feed
    pub fn set_pose_source(&self, source: Option<Arc<dyn PoseSource>>) {
        self.core.lock().pose_source = source;
    }

    pub fn state(&self) -> LocalizationState {
        self.core.lock().status.state
    }

    pub fn status(&self) -> SessionStatus {
        self.core.lock().status
    }

    /// Configuration of the current or most recent run
    pub fn config(&self) -> Option<LocalizationConfig> {
        self.core.lock().config.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.core.lock().stats.clone()
    }

    pub fn registry(&self) -> AnchorRegistry {
        self.core.lock().registry.clone()
    }

    /// Begin localizing. Each call starts a fresh backend-side run.
    pub fn start(&self, config: LocalizationConfig) -> VpsResult<()> {
        config.validate()?;
        let mut core = self.core.lock();

        let state = core.status.state;
        if state.is_active() {
            return Err(VpsError::SessionActive(state));
        }
        match &core.pose_source {
            Some(source) if source.is_attached() => {}
            _ => {
                return Err(VpsError::InvalidPrerequisite(
                    "no pose source attached".into(),
                ))
            }
        }
        if !core.backend.is_available() {
            warn!(backend = core.backend.name(), "localization backend unavailable");
            return Err(VpsError::BackendUnavailable);
        }

        // A failed run may still hold backend resources
        core.halt_backend();
        core.run += 1;
        core.config = Some(config.clone());
        core.transition_now(LocalizationState::Initializing, FailureReason::None);

        match core.backend.start(&config) {
            Ok(()) => {
                core.backend_running = true;
                core.arm_watchdog(&config);
                info!(run = core.run, backend = core.backend.name(), "localization started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "backend refused to start");
                let (state, reason) = match e {
                    VpsError::BackendUnavailable => {
                        (LocalizationState::Stopped, FailureReason::None)
                    }
                    _ => (LocalizationState::Failed, FailureReason::Unknown),
                };
                core.transition_now(state, reason);
                Err(e)
            }
        }
    }

    /// Stop localizing. In-flight anchors stay `Pending`.
    pub fn stop(&self) {
        let mut core = self.core.lock();
        core.disarm_watchdog();
        let state = core.status.state;
        if state != LocalizationState::Stopped {
            core.transition_now(LocalizationState::Stopped, FailureReason::for_stop(state));
        }
        core.halt_backend();
    }

    /// Fail the current run, e.g. when a caller's wait timed out
    pub fn fail(&self, reason: FailureReason) {
        let mut core = self.core.lock();
        core.halt_backend();
        core.transition_now(LocalizationState::Failed, reason);
    }

    /// Identifier of the current run, bumped by every accepted `start`
    pub fn run(&self) -> u64 {
        self.core.lock().run
    }

    /// Fail `run` only while it is still current and still attempting.
    /// Returns false if a stop or a newer start got there first.
    pub fn fail_run(&self, run: u64, reason: FailureReason) -> bool {
        let mut core = self.core.lock();
        if core.run != run || !core.status.state.is_attempting() {
            debug!(run, current = core.run, state = %core.status.state, "run already settled");
            return false;
        }
        core.halt_backend();
        core.transition_now(LocalizationState::Failed, reason);
        true
    }

    /// Request one anchor per pose. Identities come from the backend; the
    /// anchors enter the registry once creation is confirmed.
    pub fn create(&self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>> {
        let mut core = self.core.lock();
        let state = core.status.state;
        if state != LocalizationState::Localized {
            return Err(VpsError::NotLocalized { state });
        }
        if poses.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(i) = poses.iter().position(|p| !p.is_finite()) {
            return Err(VpsError::InvalidPose(format!("pose {} is not finite", i)));
        }

        let ids = core.backend.create(poses)?;
        for (id, pose) in ids.iter().zip(poses) {
            core.destroyed.remove(id);
            core.pending_creates.insert(*id, *pose);
        }
        info!(count = ids.len(), "anchor creation requested");
        Ok(ids)
    }

    pub fn start_resolving(&self, ids: &[AnchorId]) -> VpsResult<()> {
        let mut core = self.core.lock();
        let state = core.status.state;
        if state != LocalizationState::Localized {
            return Err(VpsError::NotLocalized { state });
        }
        let anchors = ids
            .iter()
            .map(|id| core.anchors.get(id).cloned().ok_or(VpsError::UnknownAnchor(*id)))
            .collect::<VpsResult<Vec<_>>>()?;

        for anchor in &anchors {
            core.want_resolving(anchor);
        }
        core.backend.start_resolving(ids);
        Ok(())
    }

    pub fn stop_resolving(&self, ids: &[AnchorId]) {
        let mut core = self.core.lock();
        for id in ids {
            if let Some(anchor) = core.anchors.get(id) {
                anchor.set_resolving(false);
            }
        }
        core.resolving.retain(|r| !ids.contains(r));
        core.backend.stop_resolving(ids);
    }

    /// Set the caller-visible tracking flag together with the backend
    /// subscription. Resumed anchors resolve once the session is localized.
    pub fn set_tracking(&self, anchors: &[SpatialAnchor], tracking: bool) {
        let mut core = self.core.lock();
        let mut ids = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            anchor.set_tracking(tracking);
            let id = anchor.id();
            if !core.anchors.contains_key(&id) {
                continue;
            }
            if tracking {
                if !core.resolving.contains(&id) {
                    core.resolving.push(id);
                }
            } else {
                core.resolving.retain(|r| *r != id);
            }
            ids.push(id);
        }

        if ids.is_empty() {
            return;
        }
        debug!(count = ids.len(), tracking, "tracking updated");
        if !tracking {
            core.backend.stop_resolving(&ids);
        } else if core.status.state == LocalizationState::Localized {
            core.backend.start_resolving(&ids);
        }
    }

    /// Serialize a resolved anchor
    pub fn serialize(&self, anchor: &SpatialAnchor) -> VpsResult<AnchorPayload> {
        anchor.payload()
    }

    /// Restore an anchor from a payload. An identity that is already
    /// registered yields the existing anchor unchanged.
    pub fn restore(&self, payload: &AnchorPayload) -> VpsResult<AnchorId> {
        let id = payload.anchor_id()?;
        let mut core = self.core.lock();
        core.destroyed.remove(&id);

        let existing = core.anchors.get(&id).cloned().or_else(|| core.registry.get(id));
        if let Some(anchor) = existing {
            if anchor.has_handle() {
                info!(anchor = %id, "restored anchor already registered");
                core.anchors.insert(id, anchor);
                return Ok(id);
            }
        }

        let id = core.backend.restore(payload)?;
        let (anchor, created) = core.registry.get_or_create(id, None);
        if !anchor.has_handle() {
            // Anything the identity saw before this restore is stale
            if let Some(AnchorChange::StatusChanged { old, new, .. }) = anchor.reset_pending() {
                debug!(anchor = %id, ?old, "restored anchor reset to pending");
                core.sink.status_changed(id, old, new);
            }
            let handle = AnchorHandle::new(id, core.sink.clone());
            let _ = anchor.attach_handle(handle, None);
        }
        core.anchors.insert(id, anchor.clone());
        if anchor.is_tracking() {
            core.want_resolving(&anchor);
            if core.status.state == LocalizationState::Localized {
                core.backend.start_resolving(&[id]);
            }
        }

        info!(anchor = %id, created, "anchor restored");
        Ok(id)
    }

    /// Remove an anchor from the registry and release its backend resource.
    /// Later backend events for the identity are ignored.
    pub fn destroy(&self, anchor: &SpatialAnchor) -> VpsResult<()> {
        let id = anchor.id();
        let mut core = self.core.lock();
        let managed = core.anchors.remove(&id).is_some();
        if !managed && !core.registry.contains(id) {
            return Err(VpsError::UnknownAnchor(id));
        }

        core.registry.remove(id);
        core.pending_creates.remove(&id);
        core.resolving.retain(|r| *r != id);
        core.destroyed.insert(id);
        core.backend.stop_resolving(&[id]);
        // Dropping the handle queues the backend release
        drop(anchor.detach_handle());
        info!(anchor = %id, "anchor destroyed");
        Ok(())
    }

    /// Anchors resolution is currently requested for
    pub fn resolving(&self) -> Vec<AnchorId> {
        self.core.lock().resolving.clone()
    }

    /// Register a synchronous observer. It runs on the delivery task, in
    /// event order, and must not block.
    pub fn observe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.publisher.next_observer.fetch_add(1, Ordering::Relaxed));
        self.publisher.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        let mut observers = self.publisher.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Async stream of session events. Slow receivers may lag.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.publisher.events.subscribe()
    }

    /// Latest published status
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.publisher.status.subscribe()
    }

    /// Wait until everything queued so far has been applied and published
    pub async fn settle(&self) {
        if !self.sink.barrier().await {
            debug!("settle after delivery stopped");
        }
    }

    /// Tear the session down: stop the backend and release every anchor
    /// it manages
    pub fn shutdown(&self) {
        self.delivery.abort();
        self.core.lock().teardown();
    }
}

impl Drop for LocalizationSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LocalizationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("LocalizationSession")
            .field("backend", &core.backend.name())
            .field("status", &core.status)
            .field("run", &core.run)
            .field("anchors", &core.anchors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticPoseSource;
    use anchorage_backend::{SimulatedBackend, SimulatorConfig};
    use std::time::Duration;

    fn session_with(backend: SimulatedBackend) -> LocalizationSession {
        let session = LocalizationSession::new(backend, AnchorRegistry::new());
        session.set_pose_source(Some(Arc::new(StaticPoseSource::new(Pose::identity()))));
        session
    }

    fn recorder(session: &LocalizationSession) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.observe(move |event| sink.lock().push(event.clone()));
        seen
    }

    fn states(events: &[SessionEvent]) -> Vec<LocalizationState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::LocalizationStateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_start_requires_pose_source() {
        let session = LocalizationSession::new(SimulatedBackend::new(), AnchorRegistry::new());
        assert!(matches!(
            session.start(LocalizationConfig::default()),
            Err(VpsError::InvalidPrerequisite(_))
        ));
        assert_eq!(session.state(), LocalizationState::Stopped);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let session = session_with(SimulatedBackend::new());
        let config = LocalizationConfig {
            requests_per_second: 4.0,
            ..LocalizationConfig::default()
        };
        assert!(matches!(
            session.start(config),
            Err(VpsError::InvalidConfig(_))
        ));
        assert_eq!(session.state(), LocalizationState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_unrepresentable_timeout() {
        let session = session_with(SimulatedBackend::new());
        let config = LocalizationConfig {
            localization_timeout_s: 1.0e30,
            ..LocalizationConfig::default()
        };
        assert!(matches!(
            session.start(config),
            Err(VpsError::InvalidConfig(_))
        ));
        session.settle().await;
        assert_eq!(session.state(), LocalizationState::Stopped);
        assert_eq!(session.config(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_session_localizes() {
        let session = session_with(SimulatedBackend::new());
        let seen = recorder(&session);

        session.start(LocalizationConfig::default()).unwrap();
        assert_eq!(session.state(), LocalizationState::Initializing);
        assert!(matches!(
            session.start(LocalizationConfig::default()),
            Err(VpsError::SessionActive(LocalizationState::Initializing))
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        session.settle().await;

        assert_eq!(session.state(), LocalizationState::Localized);
        assert_eq!(
            states(&seen.lock()),
            vec![
                LocalizationState::Initializing,
                LocalizationState::Localizing,
                LocalizationState::Localized
            ]
        );
        assert_eq!(*session.watch_status().borrow(), session.status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_localizing_is_canceled() {
        let session = session_with(SimulatedBackend::new());
        session.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        session.settle().await;
        assert_eq!(session.state(), LocalizationState::Localizing);

        session.stop();
        session.settle().await;
        assert_eq!(
            session.status(),
            SessionStatus::new(LocalizationState::Stopped, FailureReason::Canceled)
        );

        // The old run never reports back
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.settle().await;
        assert_eq!(session.state(), LocalizationState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_fix_carries_no_reason() {
        let session = session_with(SimulatedBackend::new());
        session.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.settle().await;
        session.stop();
        session.settle().await;
        assert_eq!(
            session.status(),
            SessionStatus::new(LocalizationState::Stopped, FailureReason::None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_slow_localization() {
        let sim = SimulatorConfig {
            localize_delay: Duration::from_secs(60),
            ..SimulatorConfig::default()
        };
        let session = session_with(SimulatedBackend::with_config(sim));
        let config = LocalizationConfig {
            localization_timeout_s: 5.0,
            ..LocalizationConfig::default()
        };
        session.start(config).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        session.settle().await;
        assert_eq!(
            session.status(),
            SessionStatus::new(LocalizationState::Failed, FailureReason::Timeout)
        );

        // A failed session may be started again
        assert!(session.start(LocalizationConfig::default()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_reason_is_published() {
        let session = session_with(SimulatedBackend::with_config(SimulatorConfig::failing(
            FailureReason::LocalizationFailed,
        )));
        let mut events = session.subscribe();
        session.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.settle().await;

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(SessionEvent::LocalizationStateChanged {
                state: LocalizationState::Failed,
                reason: FailureReason::LocalizationFailed,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_anchor_enters_registry_on_confirmation() {
        let session = session_with(SimulatedBackend::new());
        session.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.settle().await;

        let pose = Pose::at(0.5, 0.0, -2.0);
        let ids = session.create(&[pose]).unwrap();
        assert!(session.registry().get(ids[0]).is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.settle().await;

        let anchor = session.registry().get(ids[0]).unwrap();
        assert_eq!(anchor.status(), AnchorStatus::Success);
        assert_eq!(anchor.pose(), Some(pose));
        assert_eq!(session.resolving(), ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_anchor_is_not_resurrected() {
        let session = session_with(SimulatedBackend::new());
        session.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.settle().await;
        let ids = session.create(&[Pose::identity()]).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        session.settle().await;

        let anchor = session.registry().get(ids[0]).unwrap();
        session.destroy(&anchor).unwrap();
        assert!(!anchor.has_handle());

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.settle().await;
        assert!(session.registry().get(ids[0]).is_none());
        assert_eq!(session.stats().releases, 1);
        assert_eq!(
            session.destroy(&anchor),
            Err(VpsError::UnknownAnchor(ids[0]))
        );
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let session = session_with(SimulatedBackend::new());
        let json = session.stats().to_json();
        assert_eq!(json["transitions_published"], 0);
    }
}
