//! Landmark and observation value types.

use nalgebra::{Vector2, Vector4};

use crate::geometry::stereographic;

/// Identifier assigned to a keypoint track by the optical-flow front-end.
pub type KeypointId = u64;

/// One image of one camera: frame timestamp plus camera index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameCamId {
    pub frame_id: i64,
    pub cam_id: usize,
}

impl FrameCamId {
    pub fn new(frame_id: i64, cam_id: usize) -> Self {
        Self { frame_id, cam_id }
    }
}

/// Landmark parameterized in its host camera: a stereographic bearing and an
/// inverse depth. The host is always camera 0 of a keyframe.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub host: FrameCamId,
    pub dir: Vector2<f64>,
    pub inv_depth: f64,
}

impl Landmark {
    /// Homogeneous position in the host camera: unit bearing with the
    /// inverse depth in the scale slot.
    pub fn position_homogeneous(&self) -> Vector4<f64> {
        let mut p = stereographic::unproject(&self.dir);
        p[3] = self.inv_depth;
        p
    }
}

/// 2D measurement of a landmark in some target image.
#[derive(Debug, Clone, Copy)]
pub struct KeypointObservation {
    pub kpt_id: KeypointId,
    pub pos: Vector2<f64>,
}
