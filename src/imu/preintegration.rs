//! Pre-integrated inertial measurement between two frame timestamps.
//!
//! The measurement accumulates rotation, velocity and position increments in
//! the body frame of the interval start, together with the covariance of the
//! 9-dof transition and its Jacobians w.r.t. the biases the interval was
//! integrated at. A bias change after the fact is absorbed to first order in
//! the residual instead of re-integrating, following Forster et al.

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3};

use super::sample::ImuData;
use super::types::{Matrix9, Matrix9x6, Matrix9x15, Vector9};
use crate::geometry::{right_jacobian_so3, right_jacobian_so3_inv, skew, SE3};

/// Pose and velocity of one frame, the part of the state the IMU factor
/// constrains directly.
#[derive(Debug, Clone)]
pub struct PoseVelState {
    pub t_w_i: SE3,
    pub vel_w_i: Vector3<f64>,
}

/// Accumulated IMU interval starting at a frame timestamp.
#[derive(Debug, Clone)]
pub struct PreintegratedImu {
    start_t_ns: i64,
    delta_t_ns: i64,

    /// Biases the interval was integrated at.
    bias_gyro_lin: Vector3<f64>,
    bias_accel_lin: Vector3<f64>,

    delta_r: UnitQuaternion<f64>,
    delta_v: Vector3<f64>,
    delta_p: Vector3<f64>,

    /// Covariance of [δθ, δv, δp].
    cov: Matrix9,

    d_r_d_bg: Matrix3<f64>,
    d_v_d_bg: Matrix3<f64>,
    d_v_d_ba: Matrix3<f64>,
    d_p_d_bg: Matrix3<f64>,
    d_p_d_ba: Matrix3<f64>,
}

impl PreintegratedImu {
    pub fn new(start_t_ns: i64, bias_gyro: Vector3<f64>, bias_accel: Vector3<f64>) -> Self {
        Self {
            start_t_ns,
            delta_t_ns: 0,
            bias_gyro_lin: bias_gyro,
            bias_accel_lin: bias_accel,
            delta_r: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            cov: Matrix9::zeros(),
            d_r_d_bg: Matrix3::zeros(),
            d_v_d_bg: Matrix3::zeros(),
            d_v_d_ba: Matrix3::zeros(),
            d_p_d_bg: Matrix3::zeros(),
            d_p_d_ba: Matrix3::zeros(),
        }
    }

    pub fn start_t_ns(&self) -> i64 {
        self.start_t_ns
    }

    pub fn delta_t_ns(&self) -> i64 {
        self.delta_t_ns
    }

    pub fn end_t_ns(&self) -> i64 {
        self.start_t_ns + self.delta_t_ns
    }

    pub fn bias_gyro_lin(&self) -> Vector3<f64> {
        self.bias_gyro_lin
    }

    pub fn bias_accel_lin(&self) -> Vector3<f64> {
        self.bias_accel_lin
    }

    /// Extend the interval up to `data.t_ns`.
    ///
    /// `accel_cov` and `gyro_cov` are discrete-time noise variances per axis.
    /// Samples must arrive in strictly increasing timestamp order.
    pub fn integrate(&mut self, data: &ImuData, accel_cov: &Vector3<f64>, gyro_cov: &Vector3<f64>) {
        let dt_ns = data.t_ns - self.end_t_ns();
        assert!(
            dt_ns > 0,
            "IMU sample at {} precedes integrated interval end {}",
            data.t_ns,
            self.end_t_ns()
        );
        let dt = dt_ns as f64 * 1e-9;

        let accel = data.accel - self.bias_accel_lin;
        let gyro = data.gyro - self.bias_gyro_lin;

        let rot = self.delta_r.to_rotation_matrix().into_inner();
        let angle = gyro * dt;
        let inc_q = UnitQuaternion::from_scaled_axis(angle);
        let inc_r = inc_q.to_rotation_matrix().into_inner();
        let jr = right_jacobian_so3(&angle);
        let skew_accel = skew(&accel);

        // Transition A and noise input B over [δθ, δv, δp], evaluated at the
        // pre-update mean.
        let mut a_mat = Matrix9::identity();
        a_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&inc_r.transpose());
        a_mat
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-rot * skew_accel * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * rot * skew_accel * dt * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut b_mat = Matrix9x6::zeros();
        b_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b_mat.fixed_view_mut::<3, 3>(3, 3).copy_from(&(rot * dt));
        b_mat
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * rot * dt * dt));

        let mut q_mat = Matrix6::<f64>::zeros();
        q_mat
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&Matrix3::from_diagonal(gyro_cov));
        q_mat
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&Matrix3::from_diagonal(accel_cov));

        self.cov = a_mat * self.cov * a_mat.transpose() + b_mat * q_mat * b_mat.transpose();

        // Bias Jacobian recursions, all right-hand sides at the previous step.
        let d_r_d_bg = self.d_r_d_bg;
        let d_v_d_bg = self.d_v_d_bg;
        let d_v_d_ba = self.d_v_d_ba;

        self.d_r_d_bg = inc_r.transpose() * d_r_d_bg - jr * dt;
        self.d_v_d_bg -= rot * skew_accel * d_r_d_bg * dt;
        self.d_v_d_ba -= rot * dt;
        self.d_p_d_bg += d_v_d_bg * dt - 0.5 * rot * skew_accel * d_r_d_bg * dt * dt;
        self.d_p_d_ba += d_v_d_ba * dt - 0.5 * rot * dt * dt;

        // Mean update.
        self.delta_p += self.delta_v * dt + 0.5 * rot * accel * dt * dt;
        self.delta_v += rot * accel * dt;
        self.delta_r *= inc_q;
        self.delta_t_ns += dt_ns;
    }

    /// Apply the mean transition in the world frame.
    pub fn predict_state(&self, state0: &PoseVelState, g: &Vector3<f64>) -> PoseVelState {
        let dt = self.delta_t_ns as f64 * 1e-9;
        let r0 = &state0.t_w_i.rotation;

        let rotation = r0 * self.delta_r;
        let vel_w_i = state0.vel_w_i + g * dt + r0 * self.delta_v;
        let translation = state0.t_w_i.translation
            + state0.vel_w_i * dt
            + 0.5 * g * dt * dt
            + r0 * self.delta_p;

        PoseVelState {
            t_w_i: SE3::new(rotation, translation),
            vel_w_i,
        }
    }

    /// 9-dof residual [r_θ, r_v, r_p] between two states, with the
    /// first-order bias correction for the current bias estimates.
    pub fn residual(
        &self,
        state0: &PoseVelState,
        g: &Vector3<f64>,
        state1: &PoseVelState,
        curr_ba: &Vector3<f64>,
        curr_bg: &Vector3<f64>,
    ) -> Vector9 {
        self.residual_impl(state0, g, state1, curr_ba, curr_bg, None)
    }

    /// Residual plus Jacobians against the 15-dof tangents
    /// [δp, δθ, δv, δb_a, δb_g] of both states.
    pub fn residual_with_jacobians(
        &self,
        state0: &PoseVelState,
        g: &Vector3<f64>,
        state1: &PoseVelState,
        curr_ba: &Vector3<f64>,
        curr_bg: &Vector3<f64>,
    ) -> (Vector9, Matrix9x15, Matrix9x15) {
        let mut d0 = Matrix9x15::zeros();
        let mut d1 = Matrix9x15::zeros();
        let res = self.residual_impl(state0, g, state1, curr_ba, curr_bg, Some((&mut d0, &mut d1)));
        (res, d0, d1)
    }

    fn residual_impl(
        &self,
        state0: &PoseVelState,
        g: &Vector3<f64>,
        state1: &PoseVelState,
        curr_ba: &Vector3<f64>,
        curr_bg: &Vector3<f64>,
        jacobians: Option<(&mut Matrix9x15, &mut Matrix9x15)>,
    ) -> Vector9 {
        let dt = self.delta_t_ns as f64 * 1e-9;

        let dbg = curr_bg - self.bias_gyro_lin;
        let dba = curr_ba - self.bias_accel_lin;

        let r0_inv = state0.t_w_i.rotation.inverse();
        let r0_inv_mat = r0_inv.to_rotation_matrix().into_inner();

        let corrected_delta_r =
            self.delta_r * UnitQuaternion::from_scaled_axis(self.d_r_d_bg * dbg);

        let vel_term = state1.vel_w_i - state0.vel_w_i - g * dt;
        let pos_term = state1.t_w_i.translation
            - state0.t_w_i.translation
            - state0.vel_w_i * dt
            - 0.5 * g * dt * dt;

        let phi = (corrected_delta_r.inverse() * r0_inv * state1.t_w_i.rotation).scaled_axis();

        let mut res = Vector9::zeros();
        res.fixed_rows_mut::<3>(0).copy_from(&phi);
        res.fixed_rows_mut::<3>(3).copy_from(
            &(r0_inv_mat * vel_term - (self.delta_v + self.d_v_d_bg * dbg + self.d_v_d_ba * dba)),
        );
        res.fixed_rows_mut::<3>(6).copy_from(
            &(r0_inv_mat * pos_term - (self.delta_p + self.d_p_d_bg * dbg + self.d_p_d_ba * dba)),
        );

        if let Some((d0, d1)) = jacobians {
            let jr_inv = right_jacobian_so3_inv(&phi);
            let jl_inv = right_jacobian_so3_inv(&(-phi));
            let r1_inv_mat = state1
                .t_w_i
                .rotation
                .inverse()
                .to_rotation_matrix()
                .into_inner();

            // Rotation rows.
            d0.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-jr_inv * r1_inv_mat));
            d0.fixed_view_mut::<3, 3>(0, 12)
                .copy_from(&(-jl_inv * self.d_r_d_bg));
            d1.fixed_view_mut::<3, 3>(0, 3).copy_from(&(jr_inv * r1_inv_mat));

            // Velocity rows.
            d0.fixed_view_mut::<3, 3>(3, 3)
                .copy_from(&(r0_inv_mat * skew(&vel_term)));
            d0.fixed_view_mut::<3, 3>(3, 6).copy_from(&(-r0_inv_mat));
            d0.fixed_view_mut::<3, 3>(3, 9).copy_from(&(-self.d_v_d_ba));
            d0.fixed_view_mut::<3, 3>(3, 12).copy_from(&(-self.d_v_d_bg));
            d1.fixed_view_mut::<3, 3>(3, 6).copy_from(&r0_inv_mat);

            // Position rows.
            d0.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-r0_inv_mat));
            d0.fixed_view_mut::<3, 3>(6, 3)
                .copy_from(&(r0_inv_mat * skew(&pos_term)));
            d0.fixed_view_mut::<3, 3>(6, 6).copy_from(&(-r0_inv_mat * dt));
            d0.fixed_view_mut::<3, 3>(6, 9).copy_from(&(-self.d_p_d_ba));
            d0.fixed_view_mut::<3, 3>(6, 12).copy_from(&(-self.d_p_d_bg));
            d1.fixed_view_mut::<3, 3>(6, 0).copy_from(&r0_inv_mat);
        }

        res
    }

    /// Information matrix of the transition. A tiny regularizer keeps the
    /// inversion defined for very short intervals.
    pub fn cov_inv(&self) -> Matrix9 {
        let regularized = self.cov + Matrix9::identity() * 1e-12;
        regularized
            .try_inverse()
            .expect("regularized pre-integration covariance must be invertible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

    fn synthetic_samples(n: usize, dt_ns: i64) -> Vec<ImuData> {
        (1..=n)
            .map(|i| ImuData {
                t_ns: i as i64 * dt_ns,
                accel: Vector3::new(0.4, -0.2, 9.81 + 0.1),
                gyro: Vector3::new(0.05, -0.03, 0.2),
            })
            .collect()
    }

    fn integrate_all(samples: &[ImuData], start_t_ns: i64) -> PreintegratedImu {
        let accel_cov = Vector3::repeat(1e-4);
        let gyro_cov = Vector3::repeat(1e-6);
        let mut meas = PreintegratedImu::new(start_t_ns, Vector3::zeros(), Vector3::zeros());
        for s in samples {
            meas.integrate(s, &accel_cov, &gyro_cov);
        }
        meas
    }

    #[test]
    fn test_split_interval_composes_to_same_prediction() {
        let samples = synthetic_samples(20, 5_000_000);
        let full = integrate_all(&samples, 0);

        let state0 = PoseVelState {
            t_w_i: SE3::new(
                UnitQuaternion::from_euler_angles(0.1, -0.05, 0.3),
                Vector3::new(1.0, 2.0, 0.5),
            ),
            vel_w_i: Vector3::new(0.2, -0.1, 0.05),
        };

        for split in [1usize, 7, 13, 19] {
            let first = integrate_all(&samples[..split], 0);
            let second = integrate_all(&samples[split..], samples[split - 1].t_ns);

            let direct = full.predict_state(&state0, &GRAVITY);
            let chained = second.predict_state(&first.predict_state(&state0, &GRAVITY), &GRAVITY);

            assert_relative_eq!(direct.t_w_i.translation, chained.t_w_i.translation, epsilon = 1e-9);
            assert_relative_eq!(direct.vel_w_i, chained.vel_w_i, epsilon = 1e-9);
            assert_relative_eq!(
                direct.t_w_i.rotation_matrix(),
                chained.t_w_i.rotation_matrix(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_residual_vanishes_at_predicted_state() {
        let samples = synthetic_samples(50, 2_000_000);
        let meas = integrate_all(&samples, 0);

        let state0 = PoseVelState {
            t_w_i: SE3::new(
                UnitQuaternion::from_euler_angles(-0.2, 0.1, 0.4),
                Vector3::new(0.3, -1.0, 2.0),
            ),
            vel_w_i: Vector3::new(0.5, 0.2, -0.1),
        };
        let state1 = meas.predict_state(&state0, &GRAVITY);

        let res = meas.residual(&state0, &GRAVITY, &state1, &Vector3::zeros(), &Vector3::zeros());
        assert!(res.norm() < 1e-10, "residual at prediction: {}", res.norm());
    }

    #[test]
    fn test_covariance_symmetric_positive_diagonal() {
        let meas = integrate_all(&synthetic_samples(100, 2_000_000), 0);
        let cov = meas.cov;

        for i in 0..9 {
            assert!(cov[(i, i)] > 0.0);
            for j in 0..9 {
                assert_relative_eq!(cov[(i, j)], cov[(j, i)], epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_jacobians_match_central_differences() {
        let samples = synthetic_samples(10, 5_000_000);
        let meas = integrate_all(&samples, 0);

        let state0 = PoseVelState {
            t_w_i: SE3::new(
                UnitQuaternion::from_euler_angles(0.15, -0.1, 0.2),
                Vector3::new(0.5, 0.1, -0.3),
            ),
            vel_w_i: Vector3::new(0.1, 0.3, -0.2),
        };
        let mut state1 = meas.predict_state(&state0, &GRAVITY);
        // Perturb away from the zero-residual point so the Jacobians are
        // exercised at a generic linearization.
        state1.t_w_i.translation += Vector3::new(0.01, -0.02, 0.015);
        state1.vel_w_i += Vector3::new(-0.01, 0.02, 0.005);

        let ba = Vector3::new(0.001, -0.002, 0.0005);
        let bg = Vector3::new(-0.0005, 0.001, 0.002);

        let (_, d0, d1) = meas.residual_with_jacobians(&state0, &GRAVITY, &state1, &ba, &bg);

        let eps = 1e-6;
        let eval = |s0: &PoseVelState, s1: &PoseVelState, ba: &Vector3<f64>, bg: &Vector3<f64>| {
            meas.residual(s0, &GRAVITY, s1, ba, bg)
        };

        // Pose/velocity columns of both states.
        for col in 0..9 {
            let apply = |state: &PoseVelState, sign: f64| {
                let mut s = state.clone();
                let mut inc15 = [0.0f64; 15];
                inc15[col] = sign * eps;
                let mut pose_inc = nalgebra::Vector6::zeros();
                for k in 0..6 {
                    pose_inc[k] = inc15[k];
                }
                s.t_w_i.apply_inc(&pose_inc);
                s.vel_w_i += Vector3::new(inc15[6], inc15[7], inc15[8]);
                s
            };

            let num0 = (eval(&apply(&state0, 1.0), &state1, &ba, &bg)
                - eval(&apply(&state0, -1.0), &state1, &ba, &bg))
                / (2.0 * eps);
            let num1 = (eval(&state0, &apply(&state1, 1.0), &ba, &bg)
                - eval(&state0, &apply(&state1, -1.0), &ba, &bg))
                / (2.0 * eps);

            for row in 0..9 {
                assert_relative_eq!(d0[(row, col)], num0[row], epsilon = 1e-4);
                assert_relative_eq!(d1[(row, col)], num1[row], epsilon = 1e-4);
            }
        }

        // Bias columns (state0 only; state1 biases do not enter the residual).
        for axis in 0..3 {
            let mut step = Vector3::zeros();
            step[axis] = eps;

            let num_ba = (eval(&state0, &state1, &(ba + step), &bg)
                - eval(&state0, &state1, &(ba - step), &bg))
                / (2.0 * eps);
            let num_bg = (eval(&state0, &state1, &ba, &(bg + step))
                - eval(&state0, &state1, &ba, &(bg - step)))
                / (2.0 * eps);

            for row in 0..9 {
                assert_relative_eq!(d0[(row, 9 + axis)], num_ba[row], epsilon = 1e-4);
                assert_relative_eq!(d0[(row, 12 + axis)], num_bg[row], epsilon = 1e-4);
            }
        }
    }
}
