//! Frame states of the sliding window.
//!
//! A state is either *live* (re-linearized every iteration) or *linearized*
//! (its linearization point is frozen because it entered the marginalization
//! prior). Both kinds keep accepting increments; a linearized state applies
//! the accumulated tangent delta to the frozen point so Jacobians stay
//! consistent with the prior while the value keeps moving.

use nalgebra::{Vector3, Vector6};

use crate::geometry::SE3;
use crate::imu::types::Vector15;
use crate::imu::PoseVelState;

/// Plain pose-velocity-bias value.
#[derive(Debug, Clone)]
pub struct PoseVelBiasState {
    pub t_ns: i64,
    pub t_w_i: SE3,
    pub vel_w_i: Vector3<f64>,
    pub bias_accel: Vector3<f64>,
    pub bias_gyro: Vector3<f64>,
}

impl PoseVelBiasState {
    /// Tangent layout: [δp, δθ, δv, δb_a, δb_g].
    pub fn apply_inc(&mut self, inc: &Vector15) {
        let pose_inc: Vector6<f64> = inc.fixed_rows::<6>(0).into_owned();
        self.t_w_i.apply_inc(&pose_inc);
        self.vel_w_i += inc.fixed_rows::<3>(6).into_owned();
        self.bias_accel += inc.fixed_rows::<3>(9).into_owned();
        self.bias_gyro += inc.fixed_rows::<3>(12).into_owned();
    }

    pub fn pose_vel(&self) -> PoseVelState {
        PoseVelState {
            t_w_i: self.t_w_i.clone(),
            vel_w_i: self.vel_w_i,
        }
    }
}

/// Keyframe pose that may carry a frozen linearization point.
#[derive(Debug, Clone)]
pub struct PoseStateWithLin {
    pub t_ns: i64,
    pose: SE3,
    pose_lin: SE3,
    delta: Vector6<f64>,
    linearized: bool,
}

impl PoseStateWithLin {
    pub fn new(t_ns: i64, pose: SE3) -> Self {
        Self {
            t_ns,
            pose_lin: pose.clone(),
            pose,
            delta: Vector6::zeros(),
            linearized: false,
        }
    }

    /// Demote a full state whose velocity and biases were marginalized.
    /// The linearization status carries over with the pose components of the
    /// accumulated delta.
    pub fn from_state(state: &PoseVelBiasStateWithLin) -> Self {
        Self {
            t_ns: state.t_ns,
            pose: state.state().t_w_i.clone(),
            pose_lin: state.state_lin().t_w_i.clone(),
            delta: state.delta().fixed_rows::<6>(0).into_owned(),
            linearized: state.is_linearized(),
        }
    }

    /// Current value.
    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    /// Value Jacobians are evaluated at.
    pub fn pose_lin(&self) -> &SE3 {
        if self.linearized {
            &self.pose_lin
        } else {
            &self.pose
        }
    }

    /// Tangent deviation from the linearization point; zero for live states.
    pub fn delta(&self) -> Vector6<f64> {
        self.delta
    }

    pub fn is_linearized(&self) -> bool {
        self.linearized
    }

    pub fn apply_inc(&mut self, inc: &Vector6<f64>) {
        if self.linearized {
            self.delta += inc;
            let mut pose = self.pose_lin.clone();
            pose.apply_inc(&self.delta);
            self.pose = pose;
        } else {
            self.pose.apply_inc(inc);
        }
    }
}

/// Active window state: pose, velocity and biases, with the same
/// live/linearized behavior as [`PoseStateWithLin`].
#[derive(Debug, Clone)]
pub struct PoseVelBiasStateWithLin {
    pub t_ns: i64,
    state: PoseVelBiasState,
    state_lin: PoseVelBiasState,
    delta: Vector15,
    linearized: bool,
}

impl PoseVelBiasStateWithLin {
    pub fn new(
        t_ns: i64,
        t_w_i: SE3,
        vel_w_i: Vector3<f64>,
        bias_gyro: Vector3<f64>,
        bias_accel: Vector3<f64>,
        linearized: bool,
    ) -> Self {
        let state = PoseVelBiasState {
            t_ns,
            t_w_i,
            vel_w_i,
            bias_accel,
            bias_gyro,
        };
        Self {
            t_ns,
            state_lin: state.clone(),
            state,
            delta: Vector15::zeros(),
            linearized,
        }
    }

    pub fn from_state(state: PoseVelBiasState) -> Self {
        Self {
            t_ns: state.t_ns,
            state_lin: state.clone(),
            state,
            delta: Vector15::zeros(),
            linearized: false,
        }
    }

    pub fn state(&self) -> &PoseVelBiasState {
        &self.state
    }

    pub fn state_lin(&self) -> &PoseVelBiasState {
        if self.linearized {
            &self.state_lin
        } else {
            &self.state
        }
    }

    pub fn delta(&self) -> Vector15 {
        self.delta
    }

    pub fn is_linearized(&self) -> bool {
        self.linearized
    }

    /// Freeze the linearization point at the current value.
    pub fn set_lin_true(&mut self) {
        if !self.linearized {
            self.linearized = true;
            self.state_lin = self.state.clone();
            self.delta = Vector15::zeros();
        }
    }

    pub fn apply_inc(&mut self, inc: &Vector15) {
        if self.linearized {
            self.delta += inc;
            let mut state = self.state_lin.clone();
            state.apply_inc(&self.delta);
            self.state = state;
        } else {
            self.state.apply_inc(inc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn sample_state() -> PoseVelBiasStateWithLin {
        PoseVelBiasStateWithLin::new(
            1000,
            SE3::new(
                UnitQuaternion::from_euler_angles(0.1, 0.2, -0.3),
                Vector3::new(1.0, 0.0, -0.5),
            ),
            Vector3::new(0.3, -0.1, 0.2),
            Vector3::new(0.01, 0.02, -0.01),
            Vector3::new(-0.05, 0.03, 0.04),
            false,
        )
    }

    #[test]
    fn test_live_state_linearizes_at_current_value() {
        let mut state = sample_state();
        let mut inc = Vector15::zeros();
        inc[0] = 0.1;
        inc[7] = -0.2;
        state.apply_inc(&inc);

        assert_relative_eq!(
            state.state().t_w_i.translation,
            state.state_lin().t_w_i.translation,
            epsilon = 1e-15
        );
        assert_relative_eq!(state.delta().norm(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_frozen_point_survives_increments() {
        let mut state = sample_state();
        state.set_lin_true();
        let lin_before = state.state_lin().clone();

        let mut inc = Vector15::zeros();
        inc[1] = 0.05;
        inc[4] = 0.01;
        inc[13] = -0.002;
        state.apply_inc(&inc);
        state.apply_inc(&inc);

        // Value moved, frozen point did not.
        assert!((state.state().t_w_i.translation - lin_before.t_w_i.translation).norm() > 1e-3);
        assert_relative_eq!(
            state.state_lin().t_w_i.translation,
            lin_before.t_w_i.translation,
            epsilon = 1e-15
        );
        assert_relative_eq!(
            state.state_lin().t_w_i.rotation_matrix(),
            lin_before.t_w_i.rotation_matrix(),
            epsilon = 1e-15
        );

        // Delta accumulates both increments.
        assert_relative_eq!(state.delta()[1], 0.1, epsilon = 1e-15);
        assert_relative_eq!(state.delta()[13], -0.004, epsilon = 1e-15);
    }

    #[test]
    fn test_demotion_preserves_linearization() {
        let mut state = sample_state();
        state.set_lin_true();
        let mut inc = Vector15::zeros();
        inc[2] = 0.03;
        state.apply_inc(&inc);

        let pose = PoseStateWithLin::from_state(&state);

        assert!(pose.is_linearized());
        assert_relative_eq!(
            pose.pose().translation,
            state.state().t_w_i.translation,
            epsilon = 1e-15
        );
        assert_relative_eq!(
            pose.pose_lin().translation,
            state.state_lin().t_w_i.translation,
            epsilon = 1e-15
        );
        assert_relative_eq!(pose.delta()[2], 0.03, epsilon = 1e-15);
    }
}
