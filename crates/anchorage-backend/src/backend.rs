//! Localization backend contract
//!
//! A backend performs the actual start/stop/create/resolve work against a
//! positioning service. Calls return immediately; results come back as
//! [`BackendEvent`](anchorage_core::BackendEvent)s pushed into the sink
//! handed over by [`LocalizationBackend::attach`], from whatever thread the
//! backend runs its callbacks on.

use anchorage_core::{AnchorId, AnchorPayload, EventSink, LocalizationConfig, Pose, VpsResult};

/// Backend driven by a localization session
pub trait LocalizationBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Connect the backend's event stream to a delivery queue
    fn attach(&mut self, sink: EventSink);

    /// False when the underlying service or native library is absent
    fn is_available(&self) -> bool {
        true
    }

    /// Begin a fresh backend-side session
    fn start(&mut self, config: &LocalizationConfig) -> VpsResult<()>;

    fn stop(&mut self);

    /// Reserve one identity per pose and begin creation asynchronously
    fn create(&mut self, poses: &[Pose]) -> VpsResult<Vec<AnchorId>>;

    /// Make a previously serialized anchor known to the backend
    fn restore(&mut self, payload: &AnchorPayload) -> VpsResult<AnchorId>;

    fn start_resolving(&mut self, ids: &[AnchorId]);

    fn stop_resolving(&mut self, ids: &[AnchorId]);

    /// Free backend-side resources held for these anchors
    fn release(&mut self, ids: &[AnchorId]);
}
