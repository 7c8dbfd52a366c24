//! Simulated localization backend for tests and offline development
//!
//! Fabricates `Localizing → Localized` after fixed delays, confirms
//! creations after a short delay and echoes back resolutions with the pose
//! supplied at create (or restore) time. Each `start` begins a new run;
//! work belonging to an older run is discarded before it is delivered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use anchorage_core::{
    AnchorId, AnchorPayload, AnchorStatus, BackendEvent, EventSink, FailureReason,
    LocalizationConfig, LocalizationState, Pose, VpsError, VpsResult,
};

use crate::{LocalizationBackend, ResolutionBudget};

/// Simulator configuration
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Time spent `Localizing` before the fix
    pub localize_delay: Duration,
    /// Delay between `create` and the creation confirmation
    pub create_delay: Duration,
    /// Resolution tick
    pub resolve_interval: Duration,
    /// Status reported for created and resolved anchors
    pub reported_status: AnchorStatus,
    /// Fail localization with this reason instead of localizing
    pub failure: Option<FailureReason>,
    /// Re-localization period when continuous localization is enabled
    pub relocalize_interval: Option<Duration>,
    /// Report statuses before the creation confirmation
    pub status_before_construction: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            localize_delay: Duration::from_secs(1),
            create_delay: Duration::from_millis(250),
            resolve_interval: Duration::from_millis(100),
            reported_status: AnchorStatus::Success,
            failure: None,
            relocalize_interval: Some(Duration::from_secs(10)),
            status_before_construction: false,
        }
    }
}

impl SimulatorConfig {
    /// Coarse (non-VPS) localization: anchors come back `Limited`
    pub fn limited() -> Self {
        SimulatorConfig {
            reported_status: AnchorStatus::Limited,
            ..Self::default()
        }
    }

    /// Localization that always fails with `reason`
    pub fn failing(reason: FailureReason) -> Self {
        SimulatorConfig {
            failure: Some(reason),
            ..Self::default()
        }
    }
}

/// Simulated world: the anchors the "service" knows about
#[derive(Debug, Default)]
struct SimWorld {
    anchors: HashMap<AnchorId, Pose>,
    pending_creates: Vec<(AnchorId, Instant)>,
    resolving: Vec<AnchorId>,
    reported: HashSet<AnchorId>,
}

impl SimWorld {
    /// Produce the events due at `now`
    fn step(
        &mut self,
        now: Instant,
        elapsed: Duration,
        budget: &mut ResolutionBudget,
        sim: &SimulatorConfig,
    ) -> Vec<BackendEvent> {
        let mut events = Vec::new();

        let (due, waiting): (Vec<_>, Vec<_>) =
            self.pending_creates.drain(..).partition(|(_, at)| *at <= now);
        self.pending_creates = waiting;

        if !due.is_empty() {
            let ids: Vec<AnchorId> = due.into_iter().map(|(id, _)| id).collect();
            let statuses = BackendEvent::StatusUpdated {
                statuses: ids.iter().map(|id| (*id, sim.reported_status)).collect(),
            };
            let created = BackendEvent::CreatedBatch { ids: ids.clone() };
            if sim.status_before_construction {
                events.push(statuses);
                events.push(created);
            } else {
                events.push(created);
                events.push(statuses);
            }
            self.reported.extend(ids);
        }

        let candidates: Vec<AnchorId> = self
            .resolving
            .iter()
            .filter(|id| self.anchors.contains_key(id))
            .filter(|id| !self.pending_creates.iter().any(|(p, _)| p == *id))
            .copied()
            .collect();
        let chosen = budget.take(&candidates, elapsed);
        if chosen.is_empty() {
            return events;
        }

        let unreported: Vec<(AnchorId, AnchorStatus)> = chosen
            .iter()
            .filter(|id| !self.reported.contains(id))
            .map(|id| (*id, sim.reported_status))
            .collect();
        if !unreported.is_empty() {
            self.reported.extend(unreported.iter().map(|(id, _)| *id));
            events.push(BackendEvent::StatusUpdated {
                statuses: unreported,
            });
        }

        events.push(BackendEvent::Resolved {
            poses: chosen
                .iter()
                .filter_map(|id| self.anchors.get(id).map(|pose| (*id, *pose)))
                .collect(),
        });
        events
    }
}

/// Self-contained simulator backend
pub struct SimulatedBackend {
    config: SimulatorConfig,
    sink: Option<EventSink>,
    run: Arc<AtomicU64>,
    world: Arc<Mutex<SimWorld>>,
    driver: Option<JoinHandle<()>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::with_config(SimulatorConfig::default())
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        SimulatedBackend {
            config,
            sink: None,
            run: Arc::new(AtomicU64::new(0)),
            world: Arc::new(Mutex::new(SimWorld::default())),
            driver: None,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Anchors the simulated service knows about
    pub fn known_anchors(&self) -> usize {
        self.world.lock().anchors.len()
    }

    fn halt_driver(&mut self) {
        self.run.fetch_add(1, Ordering::SeqCst);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.halt_driver();
    }
}

impl LocalizationBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn attach(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn start(&mut self, config: &LocalizationConfig) -> VpsResult<()> {
        let sink = self.sink.clone().ok_or(VpsError::BackendUnavailable)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VpsError::Backend(format!("simulator needs a tokio runtime: {e}")))?;

        self.halt_driver();
        let run = self.run.load(Ordering::SeqCst);
        {
            let mut world = self.world.lock();
            world.resolving.clear();
            world.reported.clear();
        }

        info!(run, "simulated localization started");
        self.driver = Some(runtime.spawn(drive(
            Arc::clone(&self.world),
            Arc::clone(&self.run),
            run,
            sink,
            self.config.clone(),
            config.clone(),
        )));
        Ok(())
    }

    fn stop(&mut self) {
        self.halt_driver();
        self.world.lock().resolving.clear();
        debug!("simulated localization stopped");
    }

    fn create(&mut self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>> {
        if self.sink.is_none() {
            return Err(VpsError::BackendUnavailable);
        }

        let due = Instant::now() + self.config.create_delay;
        let mut world = self.world.lock();
        let ids: Vec<AnchorId> = poses
            .iter()
            .map(|pose| {
                let id = AnchorId::random();
                world.anchors.insert(id, *pose);
                world.pending_creates.push((id, due));
                id
            })
            .collect();
        Ok(ids)
    }

    fn restore(&mut self, payload: &AnchorPayload) -> VpsResult<AnchorId> {
        let (id, pose) = payload.decode()?;
        self.world.lock().anchors.entry(id).or_insert(pose);
        Ok(id)
    }

    fn start_resolving(&mut self, ids: &[AnchorId]) {
        let mut world = self.world.lock();
        for id in ids {
            if !world.anchors.contains_key(id) {
                warn!(anchor = %id, "resolve requested for anchor unknown to simulator");
                continue;
            }
            if !world.resolving.contains(id) {
                world.resolving.push(*id);
            }
        }
    }

    fn stop_resolving(&mut self, ids: &[AnchorId]) {
        self.world.lock().resolving.retain(|id| !ids.contains(id));
    }

    fn release(&mut self, ids: &[AnchorId]) {
        let mut world = self.world.lock();
        world.resolving.retain(|id| !ids.contains(id));
        world.pending_creates.retain(|(id, _)| !ids.contains(id));
        for id in ids {
            world.reported.remove(id);
        }
    }
}

async fn drive(
    world: Arc<Mutex<SimWorld>>,
    runs: Arc<AtomicU64>,
    run: u64,
    sink: EventSink,
    sim: SimulatorConfig,
    config: LocalizationConfig,
) {
    let current = || runs.load(Ordering::SeqCst) == run;

    sleep(config.good_tracking_wait()).await;
    if !current() {
        return;
    }
    sink.send(BackendEvent::state(
        LocalizationState::Localizing,
        FailureReason::None,
    ));

    sleep(sim.localize_delay).await;
    if !current() {
        return;
    }
    if let Some(reason) = sim.failure {
        sink.send(BackendEvent::state(LocalizationState::Failed, reason));
        return;
    }
    sink.send(BackendEvent::state(
        LocalizationState::Localized,
        FailureReason::None,
    ));

    let mut budget = ResolutionBudget::new(config.max_resolutions_per_second);
    let mut ticker = tokio::time::interval(sim.resolve_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut last = Instant::now();
    let mut last_fix = last;
    loop {
        ticker.tick().await;
        if !current() {
            return;
        }
        let now = Instant::now();

        if config.continuous_localization_enabled {
            if let Some(every) = sim.relocalize_interval {
                if now.duration_since(last_fix) >= every {
                    sink.send(BackendEvent::state(
                        LocalizationState::Localizing,
                        FailureReason::None,
                    ));
                    sleep(sim.localize_delay).await;
                    if !current() {
                        return;
                    }
                    sink.send(BackendEvent::state(
                        LocalizationState::Localized,
                        FailureReason::None,
                    ));
                    last_fix = Instant::now();
                    last = last_fix;
                    continue;
                }
            }
        }

        let elapsed = now.duration_since(last);
        last = now;
        let events = world.lock().step(now, elapsed, &mut budget, &sim);
        for event in events {
            if !sink.send(event) {
                return;
            }
        }
    }
}
