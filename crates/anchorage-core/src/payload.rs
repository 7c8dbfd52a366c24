//! Anchor payload - opaque blob that restores an anchor in a later session
//!
//! Callers must treat the payload as opaque. Internal layout (44 bytes):
//! - Bytes 0-15: Anchor ID (LE)
//! - Bytes 16-27: Position x, y, z (f32 LE)
//! - Bytes 28-43: Rotation w, x, y, z (f32 LE)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AnchorId, Pose, Position3D, Rotation3D, VpsError, VpsResult};

/// Encoded payload size
pub const PAYLOAD_SIZE: usize = 16 + 3 * 4 + 4 * 4;

/// Opaque serialized anchor
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnchorPayload(Bytes);

impl AnchorPayload {
    /// Encode an anchor's identity and pose
    pub fn encode(id: AnchorId, pose: &Pose) -> Self {
        let mut buf = BytesMut::with_capacity(PAYLOAD_SIZE);
        buf.put_u128_le(id.0);
        buf.put_f32_le(pose.position.x);
        buf.put_f32_le(pose.position.y);
        buf.put_f32_le(pose.position.z);
        buf.put_f32_le(pose.rotation.w);
        buf.put_f32_le(pose.rotation.x);
        buf.put_f32_le(pose.rotation.y);
        buf.put_f32_le(pose.rotation.z);
        AnchorPayload(buf.freeze())
    }

    /// Wrap bytes received from storage; the layout is checked on decode
    pub fn from_bytes(bytes: impl Into<Bytes>) -> VpsResult<Self> {
        let bytes = bytes.into();
        if bytes.len() != PAYLOAD_SIZE {
            return Err(VpsError::InvalidPayload {
                expected: PAYLOAD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(AnchorPayload(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Identity embedded in the payload
    pub fn anchor_id(&self) -> VpsResult<AnchorId> {
        self.decode().map(|(id, _)| id)
    }

    pub fn decode(&self) -> VpsResult<(AnchorId, Pose)> {
        if self.0.len() != PAYLOAD_SIZE {
            return Err(VpsError::InvalidPayload {
                expected: PAYLOAD_SIZE,
                actual: self.0.len(),
            });
        }

        let mut buf = self.0.clone();
        let id = AnchorId(buf.get_u128_le());
        let position = Position3D::new(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le());
        let rotation = Rotation3D {
            w: buf.get_f32_le(),
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            z: buf.get_f32_le(),
        };
        let pose = Pose::new(position, rotation);
        if !pose.is_finite() {
            return Err(VpsError::InvalidPose(format!("payload for {} is not finite", id)));
        }
        Ok((id, pose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_payload_size() {
        let payload = AnchorPayload::encode(AnchorId::new(7), &Pose::identity());
        assert_eq!(payload.as_bytes().len(), PAYLOAD_SIZE);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let payload = AnchorPayload::encode(AnchorId::new(7), &Pose::identity());
        let err = AnchorPayload::from_bytes(payload.as_bytes()[..20].to_vec()).unwrap_err();
        assert_eq!(
            err,
            VpsError::InvalidPayload {
                expected: PAYLOAD_SIZE,
                actual: 20
            }
        );
    }

    #[test]
    fn test_non_finite_pose_rejected_on_decode() {
        let payload = AnchorPayload::encode(AnchorId::new(3), &Pose::at(f32::NAN, 0.0, 0.0));
        assert!(matches!(payload.decode(), Err(VpsError::InvalidPose(_))));
        assert!(payload.anchor_id().is_err());
    }

    proptest! {
        #[test]
        fn prop_identity_and_pose_survive(
            id in any::<u128>(),
            x in -1.0e4f32..1.0e4,
            y in -1.0e4f32..1.0e4,
            z in -1.0e4f32..1.0e4,
            yaw in -3.14f32..3.14,
        ) {
            let pose = Pose::new(Position3D::new(x, y, z), Rotation3D::from_euler(yaw, 0.0, 0.0));
            let payload = AnchorPayload::encode(AnchorId(id), &pose);
            let stored = AnchorPayload::from_bytes(payload.to_vec()).unwrap();
            let (rid, rpose) = stored.decode().unwrap();
            prop_assert_eq!(rid, AnchorId(id));
            prop_assert_eq!(rpose, pose);
        }

        #[test]
        fn prop_decode_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), PAYLOAD_SIZE)) {
            let payload = AnchorPayload::from_bytes(bytes).unwrap();
            if let Ok((_, pose)) = payload.decode() {
                prop_assert!(pose.is_finite());
            }
        }
    }
}
