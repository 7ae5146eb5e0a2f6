//! Flat estimator configuration record.

use serde::{Deserialize, Serialize};

/// Tuning knobs of the sliding-window estimator. Field names follow the
/// `vio_` prefix convention of the configuration files they are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VioConfig {
    /// Lower damping bound, also the Gauss-Newton damping floor.
    pub vio_lm_lambda_min: f64,
    /// Upper damping bound.
    pub vio_lm_lambda_max: f64,

    /// Information assigned to the initial position/yaw prior.
    pub vio_init_pose_weight: f64,
    /// Information assigned to the initial accelerometer-bias prior.
    pub vio_init_ba_weight: f64,
    /// Information assigned to the initial gyroscope-bias prior.
    pub vio_init_bg_weight: f64,

    /// Observation standard deviation in pixels.
    pub vio_obs_std_dev: f64,
    /// Huber kernel threshold in pixels.
    pub vio_obs_huber_thresh: f64,

    /// Maximum number of pose-velocity-bias states in the window.
    pub vio_max_states: usize,
    /// Maximum number of keyframes in the window.
    pub vio_max_kfs: usize,

    /// Keyframe trigger: fraction of camera-0 keypoints still connected.
    pub vio_new_kf_keypoints_thresh: f64,
    /// Keyframe trigger: minimum frames since the last keyframe.
    pub vio_min_frames_after_kf: usize,

    /// Minimum stereo baseline (meters) accepted for triangulation.
    pub vio_min_triangulation_dist: f64,

    /// Optimizer iteration cap per frame.
    pub vio_max_iterations: usize,
    /// Iteration index at which outlier filtering runs.
    pub vio_filter_iteration: usize,
    /// Reprojection residual (pixels) above which an observation is dropped.
    pub vio_outlier_threshold: f64,

    /// Levenberg-Marquardt when true, plain Gauss-Newton otherwise.
    pub vio_use_lm: bool,
    /// Drop stale frames and always process the newest available one.
    pub vio_enforce_realtime: bool,
    /// Verbose per-iteration reporting.
    pub vio_debug: bool,
}

impl Default for VioConfig {
    fn default() -> Self {
        Self {
            vio_lm_lambda_min: 1e-32,
            vio_lm_lambda_max: 1e2,
            vio_init_pose_weight: 1e8,
            vio_init_ba_weight: 1e1,
            vio_init_bg_weight: 1e2,
            vio_obs_std_dev: 0.5,
            vio_obs_huber_thresh: 1.0,
            vio_max_states: 3,
            vio_max_kfs: 7,
            vio_new_kf_keypoints_thresh: 0.7,
            vio_min_frames_after_kf: 5,
            vio_min_triangulation_dist: 0.05,
            vio_max_iterations: 7,
            vio_filter_iteration: 4,
            vio_outlier_threshold: 3.0,
            vio_use_lm: false,
            vio_enforce_realtime: false,
            vio_debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: VioConfig =
            serde_json::from_str(r#"{"vio_max_kfs": 3, "vio_use_lm": true}"#).unwrap();
        assert_eq!(cfg.vio_max_kfs, 3);
        assert!(cfg.vio_use_lm);
        assert_eq!(cfg.vio_max_states, 3);
    }
}
