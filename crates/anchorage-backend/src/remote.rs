//! Remote VPS backend
//!
//! Adapts a positioning-service client to [`LocalizationBackend`]. The
//! client owns the network side and pushes its callbacks into the sink it
//! receives on connect; this adapter maps client errors onto the session's
//! error and event model.

use thiserror::Error;
use tracing::{debug, info, warn};

use anchorage_core::{
    AnchorId, AnchorPayload, BackendEvent, EventSink, FailureReason, LocalizationConfig,
    LocalizationState, Pose, VpsError, VpsResult,
};

use crate::LocalizationBackend;

/// Error reported by a VPS client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("VPS service unavailable")]
    Unavailable,

    #[error("network error: {0}")]
    Network(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl From<ClientError> for VpsError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unavailable => VpsError::BackendUnavailable,
            ClientError::Network(msg) | ClientError::Rejected(msg) => VpsError::Backend(msg),
        }
    }
}

/// Client for a remote positioning service
pub trait VpsClient: Send {
    /// Hand the client the sink its callbacks must be pushed into
    fn connect(&mut self, sink: EventSink);

    fn start_localization(&mut self, config: &LocalizationConfig) -> Result<(), ClientError>;

    fn stop_localization(&mut self);

    fn create_anchors(&mut self, poses: &[Pose]) -> Result<Vec<AnchorId>, ClientError>;

    fn restore_anchor(&mut self, payload: &[u8]) -> Result<AnchorId, ClientError>;

    fn set_tracking(&mut self, ids: &[AnchorId], enabled: bool);

    fn release_anchors(&mut self, ids: &[AnchorId]);
}

/// Backend backed by a [`VpsClient`]
pub struct RemoteBackend<C> {
    client: Option<C>,
    sink: Option<EventSink>,
}

impl<C: VpsClient> RemoteBackend<C> {
    pub fn new(client: C) -> Self {
        RemoteBackend {
            client: Some(client),
            sink: None,
        }
    }

    /// Backend for a platform without a VPS client
    pub fn unavailable() -> Self {
        RemoteBackend {
            client: None,
            sink: None,
        }
    }

    pub fn client(&self) -> Option<&C> {
        self.client.as_ref()
    }

    fn client_mut(&mut self) -> VpsResult<&mut C> {
        self.client.as_mut().ok_or(VpsError::BackendUnavailable)
    }
}

impl<C: VpsClient> LocalizationBackend for RemoteBackend<C> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn attach(&mut self, sink: EventSink) {
        if let Some(client) = self.client.as_mut() {
            client.connect(sink.clone());
        }
        self.sink = Some(sink);
    }

    fn is_available(&self) -> bool {
        self.client.is_some()
    }

    fn start(&mut self, config: &LocalizationConfig) -> VpsResult<()> {
        let sink = self.sink.clone().ok_or(VpsError::BackendUnavailable)?;
        match self.client_mut()?.start_localization(config) {
            Ok(()) => {
                info!(
                    rate = config.requests_per_second,
                    continuous = config.continuous_localization_enabled,
                    "remote localization requested"
                );
                Ok(())
            }
            // The attempt was made; it failed on the wire
            Err(ClientError::Network(msg)) => {
                warn!(error = %msg, "remote localization failed to start");
                sink.send(BackendEvent::state(
                    LocalizationState::Failed,
                    FailureReason::NetworkError,
                ));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stop(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.stop_localization();
        }
    }

    fn create(&mut self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>> {
        let ids = self.client_mut()?.create_anchors(poses)?;
        if ids.len() != poses.len() {
            return Err(VpsError::Backend(format!(
                "client returned {} identities for {} poses",
                ids.len(),
                poses.len()
            )));
        }
        Ok(ids)
    }

    fn restore(&mut self, payload: &AnchorPayload) -> VpsResult<AnchorId> {
        let expected = payload.anchor_id()?;
        let id = self.client_mut()?.restore_anchor(payload.as_bytes())?;
        if id != expected {
            debug!(anchor = %id, payload = %expected, "client re-keyed restored anchor");
        }
        Ok(id)
    }

    fn start_resolving(&mut self, ids: &[AnchorId]) {
        if let Some(client) = self.client.as_mut() {
            client.set_tracking(ids, true);
        }
    }

    fn stop_resolving(&mut self, ids: &[AnchorId]) {
        if let Some(client) = self.client.as_mut() {
            client.set_tracking(ids, false);
        }
    }

    fn release(&mut self, ids: &[AnchorId]) {
        if let Some(client) = self.client.as_mut() {
            client.release_anchors(ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_core::{delivery_queue, Delivery};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeClient {
        start_error: Option<ClientError>,
        calls: Arc<Mutex<Vec<String>>>,
        sink: Option<EventSink>,
        next: u128,
    }

    impl VpsClient for FakeClient {
        fn connect(&mut self, sink: EventSink) {
            self.sink = Some(sink);
        }

        fn start_localization(&mut self, _config: &LocalizationConfig) -> Result<(), ClientError> {
            self.calls.lock().push("start".into());
            match self.start_error.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn stop_localization(&mut self) {
            self.calls.lock().push("stop".into());
        }

        fn create_anchors(&mut self, poses: &[Pose]) -> Result<Vec<AnchorId>, ClientError> {
            Ok(poses
                .iter()
                .map(|_| {
                    self.next += 1;
                    AnchorId::new(self.next)
                })
                .collect())
        }

        fn restore_anchor(&mut self, payload: &[u8]) -> Result<AnchorId, ClientError> {
            AnchorPayload::from_bytes(payload.to_vec())
                .and_then(|p| p.anchor_id())
                .map_err(|e| ClientError::Rejected(e.to_string()))
        }

        fn set_tracking(&mut self, ids: &[AnchorId], enabled: bool) {
            self.calls.lock().push(format!("track {} {}", ids.len(), enabled));
        }

        fn release_anchors(&mut self, ids: &[AnchorId]) {
            self.calls.lock().push(format!("release {}", ids.len()));
        }
    }

    #[test]
    fn test_unavailable_backend() {
        let mut backend = RemoteBackend::<FakeClient>::unavailable();
        let (sink, _queue) = delivery_queue();
        backend.attach(sink);

        assert!(!backend.is_available());
        assert_eq!(
            backend.start(&LocalizationConfig::default()),
            Err(VpsError::BackendUnavailable)
        );
        assert_eq!(
            backend.create(&[Pose::identity()]),
            Err(VpsError::BackendUnavailable)
        );
    }

    #[test]
    fn test_network_error_becomes_failed_event() {
        let mut backend = RemoteBackend::new(FakeClient {
            start_error: Some(ClientError::Network("timeout".into())),
            ..FakeClient::default()
        });
        let (sink, mut queue) = delivery_queue();
        backend.attach(sink);

        assert!(backend.start(&LocalizationConfig::default()).is_ok());
        match queue.try_recv() {
            Some(Delivery::Backend(event)) => assert_eq!(
                event,
                BackendEvent::state(LocalizationState::Failed, FailureReason::NetworkError)
            ),
            other => panic!("expected failure event, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_start_is_call_error() {
        let mut backend = RemoteBackend::new(FakeClient {
            start_error: Some(ClientError::Rejected("bad key".into())),
            ..FakeClient::default()
        });
        let (sink, mut queue) = delivery_queue();
        backend.attach(sink);

        assert_eq!(
            backend.start(&LocalizationConfig::default()),
            Err(VpsError::Backend("bad key".into()))
        );
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_forwards_tracking_and_release() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = RemoteBackend::new(FakeClient {
            calls: Arc::clone(&calls),
            ..FakeClient::default()
        });
        let (sink, _queue) = delivery_queue();
        backend.attach(sink);

        let ids = backend.create(&[Pose::identity(), Pose::at(1.0, 0.0, 0.0)]).unwrap();
        backend.start_resolving(&ids);
        backend.stop_resolving(&ids[..1]);
        backend.release(&ids);

        assert_eq!(
            *calls.lock(),
            vec!["track 2 true", "track 1 false", "release 2"]
        );
    }

    #[test]
    fn test_restore_passes_payload_bytes() {
        let mut backend = RemoteBackend::new(FakeClient::default());
        let id = AnchorId::new(77);
        let payload = AnchorPayload::encode(id, &Pose::identity());
        assert_eq!(backend.restore(&payload), Ok(id));
    }
}
