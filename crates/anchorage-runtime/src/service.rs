//! Localization service - application-facing facade
//!
//! Wraps one [`LocalizationSession`] and the process-wide
//! [`AnchorRegistry`]: anchor CRUD, restart, pause/resume and identity to
//! anchor lookups.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use anchorage_anchor::{AnchorRegistry, SpatialAnchor};
use anchorage_backend::{LocalizationBackend, SimulatedBackend, SimulatorConfig};
use anchorage_core::{
    AnchorId, AnchorPayload, FailureReason, LocalizationConfig, LocalizationState, Pose,
    SessionStatus, VpsError, VpsResult,
};

use crate::{LocalizationSession, PoseSource, SessionEvent, SessionOptions, SessionStats};

/// Localization service
///
/// The session holds every anchor it manages strongly, so an anchor stays
/// live (and keeps its backend resource) until `destroy` or until the
/// service is dropped, even if the caller lets go of it.
///
/// [`LocalizationService::new`] gives the service a registry of its own. To
/// share identity lookups across services, build each one with
/// [`LocalizationService::with_registry`] and the same registry.
pub struct LocalizationService {
    session: LocalizationSession,
    registry: AnchorRegistry,
}

impl LocalizationService {
    pub fn new<B>(backend: B) -> Self
    where
        B: LocalizationBackend + 'static,
    {
        Self::with_registry(backend, AnchorRegistry::new(), SessionOptions::default())
    }

    /// Service sharing an existing registry
    pub fn with_registry<B>(backend: B, registry: AnchorRegistry, options: SessionOptions) -> Self
    where
        B: LocalizationBackend + 'static,
    {
        let session = LocalizationSession::with_options(backend, registry.clone(), options);
        LocalizationService { session, registry }
    }

    /// Service running against the offline simulator
    pub fn simulated(config: SimulatorConfig) -> Self {
        Self::new(SimulatedBackend::with_config(config))
    }

    pub fn session(&self) -> &LocalizationSession {
        &self.session
    }

    pub fn registry(&self) -> &AnchorRegistry {
        &self.registry
    }

    pub fn attach_pose_source(&self, source: Arc<dyn PoseSource>) {
        self.session.set_pose_source(Some(source));
    }

    pub fn detach_pose_source(&self) {
        self.session.set_pose_source(None);
    }

    pub fn state(&self) -> LocalizationState {
        self.session.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn start(&self, config: LocalizationConfig) -> VpsResult<()> {
        self.session.start(config)
    }

    pub fn stop(&self) {
        self.session.stop()
    }

    /// Stop, wait for `Stopped`, start again with the last configuration and
    /// wait for the outcome. Both waits are bounded by the localization
    /// timeout; exceeding it fails the new run with `Timeout`.
    ///
    /// A `stop` issued while the new run is attempting ends the wait: the
    /// returned status is then `Stopped` and the session is left stopped.
    /// Previously known anchors resume resolving when the new run localizes.
    pub async fn restart(&self) -> VpsResult<SessionStatus> {
        let config = self.session.config().ok_or_else(|| {
            VpsError::InvalidConfig("restart requires a previous start".into())
        })?;
        let limit = config.localization_timeout();
        let mut status = self.session.watch_status();

        self.session.stop();
        self.session.settle().await;
        if let Err(e) = wait_for(&mut status, limit, |s| {
            s.state == LocalizationState::Stopped
        })
        .await
        {
            warn!(error = %e, "previous session did not confirm stop");
            self.session.fail(FailureReason::Timeout);
            return Err(e);
        }

        self.session.start(config)?;
        let run = self.session.run();
        // Publish `Initializing` so the stale `Stopped` cannot end the wait
        self.session.settle().await;
        match wait_for(&mut status, limit, |s| !s.state.is_attempting()).await {
            Ok(outcome) if outcome.reason == FailureReason::Timeout => {
                warn!("restart hit the localization deadline");
                Err(VpsError::Timeout(limit))
            }
            Ok(outcome) if outcome.state == LocalizationState::Stopped => {
                info!(reason = ?outcome.reason, "restart interrupted by stop");
                Ok(outcome)
            }
            Ok(outcome) => {
                info!(state = %outcome.state, reason = ?outcome.reason, "restart finished");
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "restart did not localize in time");
                self.session.fail_run(run, FailureReason::Timeout);
                Err(e)
            }
        }
    }

    /// Request anchors at the given poses. Fails as a whole unless localized.
    pub fn create(&self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>> {
        self.session.create(poses)
    }

    pub fn get(&self, id: AnchorId) -> Option<SpatialAnchor> {
        self.registry.get(id)
    }

    /// Snapshot of every live anchor
    pub fn get_all(&self) -> Vec<SpatialAnchor> {
        self.registry.all()
    }

    /// Live anchors for a set of identities; unknown identities are skipped
    pub fn anchors_for(&self, ids: &[AnchorId]) -> Vec<SpatialAnchor> {
        self.registry.resolve_many(ids)
    }

    pub fn destroy(&self, anchor: &SpatialAnchor) -> VpsResult<()> {
        self.session.destroy(anchor)
    }

    pub fn serialize(&self, anchor: &SpatialAnchor) -> VpsResult<AnchorPayload> {
        self.session.serialize(anchor)
    }

    pub fn restore(&self, payload: &AnchorPayload) -> VpsResult<AnchorId> {
        self.session.restore(payload)
    }

    pub fn start_resolving(&self, ids: &[AnchorId]) -> VpsResult<()> {
        self.session.start_resolving(ids)
    }

    pub fn stop_resolving(&self, ids: &[AnchorId]) {
        self.session.stop_resolving(ids)
    }

    pub fn pause_tracking(&self, anchors: &[SpatialAnchor]) {
        self.session.set_tracking(anchors, false)
    }

    pub fn resume_tracking(&self, anchors: &[SpatialAnchor]) {
        self.session.set_tracking(anchors, true)
    }

    pub fn observe<F>(&self, observer: F) -> crate::SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.session.observe(observer)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub async fn settle(&self) {
        self.session.settle().await
    }
}

impl std::fmt::Debug for LocalizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalizationService")
            .field("session", &self.session)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Wait until the published status satisfies `done`, yielding to the
/// delivery task while waiting
async fn wait_for<F>(
    status: &mut watch::Receiver<SessionStatus>,
    limit: Duration,
    done: F,
) -> VpsResult<SessionStatus>
where
    F: FnMut(&SessionStatus) -> bool,
{
    match tokio::time::timeout(limit, status.wait_for(done)).await {
        Ok(Ok(status)) => Ok(*status),
        Ok(Err(_)) => Err(VpsError::Backend("session closed".into())),
        Err(_) => Err(VpsError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticPoseSource;

    fn service() -> LocalizationService {
        let service = LocalizationService::simulated(SimulatorConfig::default());
        service.attach_pose_source(Arc::new(StaticPoseSource::new(Pose::identity())));
        service
    }

    async fn localized() -> LocalizationService {
        let service = service();
        service.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        service.settle().await;
        assert_eq!(service.state(), LocalizationState::Localized);
        service
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_requires_previous_start() {
        let service = service();
        assert!(matches!(
            service.restart().await,
            Err(VpsError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_relocalizes() {
        let service = localized().await;
        let status = service.restart().await.unwrap();
        assert_eq!(status.state, LocalizationState::Localized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_times_out() {
        let service = LocalizationService::simulated(SimulatorConfig {
            localize_delay: Duration::from_secs(60),
            ..SimulatorConfig::default()
        });
        service.attach_pose_source(Arc::new(StaticPoseSource::new(Pose::identity())));
        service
            .start(LocalizationConfig {
                localization_timeout_s: 5.0,
                ..LocalizationConfig::default()
            })
            .unwrap();

        assert_eq!(
            service.restart().await,
            Err(VpsError::Timeout(Duration::from_secs(5)))
        );
        service.settle().await;
        assert_eq!(
            service.status(),
            SessionStatus::new(LocalizationState::Failed, FailureReason::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_all_and_anchors_for() {
        let service = localized().await;
        let ids = service
            .create(&[Pose::at(1.0, 0.0, 0.0), Pose::at(2.0, 0.0, 0.0)])
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        service.settle().await;

        assert_eq!(service.get_all().len(), 2);
        let missing = AnchorId::new(0xdead);
        let found = service.anchors_for(&[ids[1], missing]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), ids[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_anchor_lives_until_destroy() {
        let service = localized().await;
        let id = service
            .restore(&AnchorPayload::encode(AnchorId::new(6), &Pose::identity()))
            .unwrap();
        // No caller reference survives this statement
        assert!(service.get(id).is_some());
        service.settle().await;
        let anchor = service.get(id).unwrap();
        service.destroy(&anchor).unwrap();
        drop(anchor);
        assert!(service.get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_share_registry_only_when_asked() {
        let registry = AnchorRegistry::new();
        let shared = LocalizationService::with_registry(
            SimulatedBackend::new(),
            registry.clone(),
            SessionOptions::default(),
        );
        shared.attach_pose_source(Arc::new(StaticPoseSource::new(Pose::identity())));
        shared.start(LocalizationConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        shared.settle().await;
        let id = shared
            .restore(&AnchorPayload::encode(AnchorId::new(7), &Pose::identity()))
            .unwrap();

        assert!(registry.get(id).is_some());
        assert!(service().get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialize_requires_resolved_anchor() {
        let service = localized().await;
        let pose = Pose::at(3.0, 0.0, 1.0);
        let payload = AnchorPayload::encode(AnchorId::new(5), &pose);

        let id = service.restore(&payload).unwrap();
        let anchor = service.get(id).unwrap();
        assert!(matches!(
            service.serialize(&anchor),
            Err(VpsError::NotReady { .. })
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        service.settle().await;
        assert_eq!(service.serialize(&anchor), Ok(payload));
    }
}
