//! Pose primitives - position and orientation in the persistent frame
//!
//! Poses are compared exactly: a backend reporting on a fixed tick emits
//! bit-identical poses for a resting anchor, and those must be recognised
//! as "no change".

use serde::{Deserialize, Serialize};

/// 3D position in meters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position3D {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Orientation (unit quaternion)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation3D {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Rotation3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Rotation3D {
    pub fn identity() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Rotation from yaw (about the vertical axis), pitch and roll, in radians
    pub fn from_euler(yaw: f32, pitch: f32, roll: f32) -> Self {
        let cy = (yaw * 0.5).cos();
        let sy = (yaw * 0.5).sin();
        let cp = (pitch * 0.5).cos();
        let sp = (pitch * 0.5).sin();
        let cr = (roll * 0.5).cos();
        let sr = (roll * 0.5).sin();

        Self {
            w: cr * cp * cy + sr * sp * sy,
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
        }
    }
}

/// Rigid pose: where an anchor sits and how it is oriented
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position3D,
    pub rotation: Rotation3D,
}

impl Pose {
    pub fn new(position: Position3D, rotation: Rotation3D) -> Self {
        Self { position, rotation }
    }

    /// Pose at a position with identity rotation
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Position3D::new(x, y, z),
            rotation: Rotation3D::identity(),
        }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    /// True if every component is finite. Non-finite poses never compare
    /// equal to themselves and would defeat pose de-duplication.
    pub fn is_finite(&self) -> bool {
        let p = &self.position;
        let r = &self.rotation;
        [p.x, p.y, p.z, r.w, r.x, r.y, r.z]
            .iter()
            .all(|v| v.is_finite())
    }
}
