//! Event Fuzzer - Randomized backend event streams against a live session
//!
//! Checks:
//! - Published transitions respect the localization state machine
//! - No state is published twice in a row
//! - `Initializing` is only entered through `start`
//! - No anchor reports a pose-bearing status without a pose

use anchorage_core::{
    AnchorId, AnchorPayload, AnchorStatus, FailureReason, LocalizationConfig, LocalizationState,
    Pose, VpsResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::integration::ScriptedHarness;
use crate::scripted::JournalEntry;

const STATES: [LocalizationState; 5] = [
    LocalizationState::Initializing,
    LocalizationState::Localizing,
    LocalizationState::Localized,
    LocalizationState::Failed,
    LocalizationState::Stopped,
];

const STATUSES: [AnchorStatus; 5] = [
    AnchorStatus::Pending,
    AnchorStatus::Success,
    AnchorStatus::Limited,
    AnchorStatus::Failed,
    AnchorStatus::Invalid,
];

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of backend events to inject
    pub event_count: usize,
    /// Number of restored anchors events are aimed at
    pub anchor_count: usize,
    /// Probability an event is a state change
    pub state_prob: f64,
    /// Probability an event is a status update (poses take the rest)
    pub status_prob: f64,
    /// Probability of a caller-side stop and start between events
    pub restart_prob: f64,
    /// Run with continuous localization
    pub continuous: bool,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            event_count: 1000,
            anchor_count: 8,
            state_prob: 0.2,
            status_prob: 0.3,
            restart_prob: 0.02,
            continuous: false,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            event_count: 100,
            anchor_count: 3,
            ..Self::default()
        }
    }

    /// Continuous localization, state-heavy stream
    pub fn continuous() -> Self {
        FuzzerConfig {
            state_prob: 0.5,
            continuous: true,
            ..Self::default()
        }
    }
}

/// Fuzz run outcome
#[derive(Debug, Default)]
pub struct FuzzResult {
    pub events_sent: usize,
    pub starts: usize,
    pub transitions_observed: usize,
    pub transition_violations: usize,
    pub duplicate_notifications: usize,
    pub premature_statuses: usize,
    pub final_state: LocalizationState,
}

impl FuzzResult {
    pub fn is_valid(&self) -> bool {
        self.transition_violations == 0
            && self.duplicate_notifications == 0
            && self.premature_statuses == 0
    }
}

/// Randomized event driver
pub struct EventFuzzer {
    config: FuzzerConfig,
    rng: StdRng,
}

impl EventFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        EventFuzzer { config, rng }
    }

    fn session_config(&self) -> LocalizationConfig {
        LocalizationConfig {
            continuous_localization_enabled: self.config.continuous,
            ..LocalizationConfig::default()
        }
    }

    fn random_pose(&mut self) -> Pose {
        Pose::at(
            self.rng.gen_range(-5.0..5.0),
            self.rng.gen_range(-5.0..5.0),
            self.rng.gen_range(-5.0..5.0),
        )
    }

    /// Run the fuzzer. Must be called inside a tokio runtime.
    pub async fn run(&mut self) -> VpsResult<FuzzResult> {
        let harness = ScriptedHarness::new();
        let mut result = FuzzResult::default();

        harness.service.start(self.session_config())?;
        result.starts += 1;
        harness.script.localize();
        harness.service.settle().await;

        let mut ids = Vec::with_capacity(self.config.anchor_count);
        for n in 0..self.config.anchor_count {
            let payload = AnchorPayload::encode(AnchorId::new(n as u128 + 1), &Pose::identity());
            ids.push(harness.service.restore(&payload)?);
        }

        for _ in 0..self.config.event_count {
            if self.rng.gen_bool(self.config.restart_prob) {
                harness.service.stop();
                harness.service.start(self.session_config())?;
                result.starts += 1;
            }

            let roll: f64 = self.rng.gen();
            if roll < self.config.state_prob {
                let state = STATES[self.rng.gen_range(0..STATES.len())];
                let reason = FailureReason::from_byte(self.rng.gen_range(0..6));
                harness.script.state(state, reason);
            } else if ids.is_empty() {
                continue;
            } else if roll < self.config.state_prob + self.config.status_prob {
                let id = ids[self.rng.gen_range(0..ids.len())];
                let status = STATUSES[self.rng.gen_range(0..STATUSES.len())];
                harness.script.status(id, status);
            } else {
                let id = ids[self.rng.gen_range(0..ids.len())];
                let pose = self.random_pose();
                harness.script.pose(id, pose);
            }
            result.events_sent += 1;
        }
        harness.service.settle().await;

        self.check_transitions(&harness, &mut result);
        result.premature_statuses = harness
            .service
            .get_all()
            .iter()
            .filter(|a| a.status().carries_pose() && a.last_known_pose().is_none())
            .count();
        result.final_state = harness.state();
        Ok(result)
    }

    fn check_transitions(&self, harness: &ScriptedHarness, result: &mut FuzzResult) {
        let observed: Vec<LocalizationState> = harness
            .journal()
            .entries()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Observed(state) => Some(state),
                JournalEntry::Call(_) => None,
            })
            .collect();
        result.transitions_observed = observed.len();

        let mut initializing = 0;
        let mut prev = LocalizationState::Stopped;
        for next in observed {
            if next == prev {
                result.duplicate_notifications += 1;
            } else if !prev.permits(next, self.config.continuous) {
                result.transition_violations += 1;
            }
            if next == LocalizationState::Initializing {
                initializing += 1;
            }
            prev = next;
        }
        if initializing != result.starts {
            result.transition_violations += 1;
        }
    }
}
