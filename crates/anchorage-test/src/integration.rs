//! End-to-end session scenarios
//!
//! Drives a [`LocalizationService`] against the scripted backend (for
//! exact event orders) or the simulator (for the timed happy path) and
//! checks the lifecycle properties callers rely on:
//! - payload round trip
//! - one live anchor per identity
//! - held-back statuses
//! - no duplicate state notifications
//! - restart ordering
//! - pause and resume

use std::sync::Arc;

use anchorage_core::{LocalizationConfig, LocalizationState, Pose, VpsResult};
use anchorage_runtime::{LocalizationService, SessionEvent, StaticPoseSource};

use crate::scripted::{Journal, JournalEntry, Script, ScriptedBackend};

/// Service wired to a scripted backend, with every observed state change
/// recorded into the backend's journal
pub struct ScriptedHarness {
    pub service: LocalizationService,
    pub script: Script,
}

impl ScriptedHarness {
    pub fn new() -> Self {
        Self::with_backend(|backend| backend)
    }

    /// Build around a customised backend, e.g. `ScriptedBackend::auto_localize`
    pub fn with_backend<F>(configure: F) -> Self
    where
        F: FnOnce(ScriptedBackend) -> ScriptedBackend,
    {
        let (backend, script) = ScriptedBackend::new();
        let service = LocalizationService::new(configure(backend));
        service.attach_pose_source(Arc::new(StaticPoseSource::new(Pose::identity())));

        let journal = script.journal().clone();
        service.observe(move |event| {
            if let SessionEvent::LocalizationStateChanged { state, .. } = event {
                journal.record(JournalEntry::Observed(*state));
            }
        });
        ScriptedHarness { service, script }
    }

    pub fn journal(&self) -> &Journal {
        self.script.journal()
    }

    pub fn start(&self) -> VpsResult<()> {
        self.service.start(LocalizationConfig::default())
    }

    /// Start and drive the session to `Localized`
    pub async fn localized(&self) -> VpsResult<()> {
        self.start()?;
        self.script.localize();
        self.service.settle().await;
        Ok(())
    }

    pub fn state(&self) -> LocalizationState {
        self.service.state()
    }
}

impl Default for ScriptedHarness {
    fn default() -> Self {
        Self::new()
    }
}
