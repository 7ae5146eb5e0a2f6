//! Messages crossing the estimator's queue boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector2, Vector3, Vector4};

use crate::estimator::state::{PoseStateWithLin, PoseVelBiasStateWithLin};
use crate::geometry::SE3;
use crate::map::KeypointId;
use crate::optimizer::StateOrdering;

/// Per-frame keypoint tracks from the optical-flow front-end. One map per
/// camera, keyed by track id; the value is the track's pixel position (the
/// translation part of the front-end's affine patch transform).
#[derive(Debug, Clone)]
pub struct OpticalFlowResult {
    pub t_ns: i64,
    pub observations: Vec<BTreeMap<KeypointId, Vector2<f64>>>,
}

/// Estimate published after each processed frame.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub t_ns: i64,
    pub t_w_i: SE3,
    pub vel_w_i: Vector3<f64>,
    pub bias_gyro: Vector3<f64>,
    pub bias_accel: Vector3<f64>,
}

/// Payload for the visualization sink.
#[derive(Debug, Clone)]
pub struct VisualizationData {
    pub t_ns: i64,
    /// Poses of the active pose-velocity-bias states.
    pub states: Vec<SE3>,
    /// Poses of the retained keyframes.
    pub frames: Vec<SE3>,
    /// Landmark positions in the world frame with their ids.
    pub points: Vec<Vector3<f64>>,
    pub point_ids: Vec<KeypointId>,
    /// Per-camera reprojections `[u, v, inverse depth, keypoint id]`.
    pub projections: Vec<Vec<Vector4<f64>>>,
    pub opt_flow_res: Arc<OpticalFlowResult>,
}

/// Full record of one marginalization event.
#[derive(Debug, Clone)]
pub struct MargData {
    pub aom: StateOrdering,
    pub abs_h: DMatrix<f64>,
    pub abs_b: DVector<f64>,
    pub frame_poses: BTreeMap<i64, PoseStateWithLin>,
    pub frame_states: BTreeMap<i64, PoseVelBiasStateWithLin>,
    /// Keyframes alive when the event started.
    pub kfs_all: BTreeSet<i64>,
    /// Keyframes removed by the event.
    pub kfs_to_marg: BTreeSet<i64>,
    /// Optical-flow results of the keyframes in `kfs_all`.
    pub opt_flow_res: Vec<Arc<OpticalFlowResult>>,
}
