//! Pose source prerequisite
//!
//! The AR tracking feed is an upstream dependency. The session only needs
//! to know that one is attached before it starts localizing.

use parking_lot::RwLock;

use anchorage_core::Pose;

/// Upstream device pose feed
pub trait PoseSource: Send + Sync {
    /// Latest device pose, `None` while the feed has nothing to offer
    fn current_pose(&self) -> Option<Pose>;

    /// Whether the feed is connected. Defaults to "has produced a pose".
    fn is_attached(&self) -> bool {
        self.current_pose().is_some()
    }
}

/// Pose source fed by the host, e.g. once per camera frame
#[derive(Debug, Default)]
pub struct StaticPoseSource {
    pose: RwLock<Option<Pose>>,
}

impl StaticPoseSource {
    pub fn new(pose: Pose) -> Self {
        StaticPoseSource {
            pose: RwLock::new(Some(pose)),
        }
    }

    /// Source with no pose yet
    pub fn detached() -> Self {
        StaticPoseSource::default()
    }

    pub fn set(&self, pose: Pose) {
        *self.pose.write() = Some(pose);
    }

    pub fn clear(&self) {
        *self.pose.write() = None;
    }
}

impl PoseSource for StaticPoseSource {
    fn current_pose(&self) -> Option<Pose> {
        *self.pose.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attached_follows_feed() {
        let source = StaticPoseSource::detached();
        assert!(!source.is_attached());

        source.set(Pose::at(0.0, 1.6, 0.0));
        assert!(source.is_attached());
        assert_eq!(source.current_pose(), Some(Pose::at(0.0, 1.6, 0.0)));

        source.clear();
        assert!(!source.is_attached());
    }
}
