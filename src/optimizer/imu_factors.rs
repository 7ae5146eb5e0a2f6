//! IMU factor linearization: pre-integration residuals between consecutive
//! window states plus bias random-walk residuals, accumulated into the
//! global normal equations.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::estimator::state::PoseVelBiasStateWithLin;
use crate::imu::types::Matrix9x15;
use crate::imu::PreintegratedImu;
use crate::optimizer::{DenseAccumulator, StateOrdering};

/// Offsets of the bias segments inside a 15-dof state block.
const BA_OFFSET: usize = 9;
const BG_OFFSET: usize = 12;

/// Energy split reported by the IMU linearization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuError {
    pub imu: f64,
    pub bg: f64,
    pub ba: f64,
}

impl ImuError {
    pub fn total(&self) -> f64 {
        self.imu + self.bg + self.ba
    }
}

fn dmat(m: &nalgebra::SMatrix<f64, 15, 15>) -> DMatrix<f64> {
    DMatrix::from_iterator(15, 15, m.iter().copied())
}

/// Linearize every retained IMU interval whose endpoints are both in the
/// ordering.
#[allow(clippy::too_many_arguments)]
pub fn linearize_abs_imu(
    ordering: &StateOrdering,
    accum: &mut DenseAccumulator,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    imu_meas: &BTreeMap<i64, PreintegratedImu>,
    gyro_bias_weight: &Vector3<f64>,
    accel_bias_weight: &Vector3<f64>,
    g: &Vector3<f64>,
) -> ImuError {
    let mut error = ImuError::default();

    for meas in imu_meas.values() {
        if meas.delta_t_ns() == 0 {
            continue;
        }
        let start_t = meas.start_t_ns();
        let end_t = meas.end_t_ns();
        if !ordering.contains(start_t) || !ordering.contains(end_t) {
            continue;
        }

        let state0 = &frame_states[&start_t];
        let state1 = &frame_states[&end_t];

        // Jacobians at the frozen linearization points, residual at the
        // current values.
        let (_, d0, d1) = meas.residual_with_jacobians(
            &state0.state_lin().pose_vel(),
            g,
            &state1.state_lin().pose_vel(),
            &state0.state_lin().bias_accel,
            &state0.state_lin().bias_gyro,
        );
        let res = meas.residual(
            &state0.state().pose_vel(),
            g,
            &state1.state().pose_vel(),
            &state0.state().bias_accel,
            &state0.state().bias_gyro,
        );

        let w = meas.cov_inv();
        let (idx0, _) = ordering.block(start_t);
        let (idx1, _) = ordering.block(end_t);

        let d0w: Matrix9x15 = w * d0;
        let d1w: Matrix9x15 = w * d1;

        accum.add_h(idx0, idx0, &dmat(&(d0.transpose() * d0w)));
        accum.add_h(idx0, idx1, &dmat(&(d0.transpose() * d1w)));
        accum.add_h(idx1, idx0, &dmat(&(d1.transpose() * d0w)));
        accum.add_h(idx1, idx1, &dmat(&(d1.transpose() * d1w)));

        accum.add_b(idx0, &DVector::from_iterator(15, (d0.transpose() * w * res).iter().copied()));
        accum.add_b(idx1, &DVector::from_iterator(15, (d1.transpose() * w * res).iter().copied()));

        error.imu += 0.5 * (res.transpose() * w * res)[(0, 0)];

        // Bias random walks between the pair. The residual is the bias
        // difference; Jacobians are ±I, so the blocks are diagonal.
        let w_bg = Matrix3::from_diagonal(gyro_bias_weight);
        let w_ba = Matrix3::from_diagonal(accel_bias_weight);

        let res_bg = state0.state().bias_gyro - state1.state().bias_gyro;
        let res_ba = state0.state().bias_accel - state1.state().bias_accel;

        for (offset, w_bias, res_bias) in
            [(BG_OFFSET, &w_bg, &res_bg), (BA_OFFSET, &w_ba, &res_ba)]
        {
            let w_dense = DMatrix::from_iterator(3, 3, w_bias.iter().copied());
            accum.add_h(idx0 + offset, idx0 + offset, &w_dense);
            accum.add_h(idx1 + offset, idx1 + offset, &w_dense);
            accum.add_h(idx0 + offset, idx1 + offset, &(-w_dense.clone()));
            accum.add_h(idx1 + offset, idx0 + offset, &(-w_dense.clone()));

            let weighted = w_bias * res_bias;
            accum.add_b(idx0 + offset, &DVector::from_iterator(3, weighted.iter().copied()));
            accum.add_b(
                idx1 + offset,
                &DVector::from_iterator(3, weighted.iter().map(|v| -v)),
            );
        }

        error.bg += 0.5 * (res_bg.transpose() * w_bg * res_bg)[(0, 0)];
        error.ba += 0.5 * (res_ba.transpose() * w_ba * res_ba)[(0, 0)];
    }

    error
}

/// Residual-only twin of [`linearize_abs_imu`].
pub fn compute_imu_error(
    ordering: &StateOrdering,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    imu_meas: &BTreeMap<i64, PreintegratedImu>,
    gyro_bias_weight: &Vector3<f64>,
    accel_bias_weight: &Vector3<f64>,
    g: &Vector3<f64>,
) -> ImuError {
    let mut error = ImuError::default();

    for meas in imu_meas.values() {
        if meas.delta_t_ns() == 0 {
            continue;
        }
        let start_t = meas.start_t_ns();
        let end_t = meas.end_t_ns();
        if !ordering.contains(start_t) || !ordering.contains(end_t) {
            continue;
        }

        let state0 = &frame_states[&start_t];
        let state1 = &frame_states[&end_t];

        let res = meas.residual(
            &state0.state().pose_vel(),
            g,
            &state1.state().pose_vel(),
            &state0.state().bias_accel,
            &state0.state().bias_gyro,
        );
        let w = meas.cov_inv();
        error.imu += 0.5 * (res.transpose() * w * res)[(0, 0)];

        let w_bg = Matrix3::from_diagonal(gyro_bias_weight);
        let w_ba = Matrix3::from_diagonal(accel_bias_weight);
        let res_bg = state0.state().bias_gyro - state1.state().bias_gyro;
        let res_ba = state0.state().bias_accel - state1.state().bias_accel;

        error.bg += 0.5 * (res_bg.transpose() * w_bg * res_bg)[(0, 0)];
        error.ba += 0.5 * (res_ba.transpose() * w_ba * res_ba)[(0, 0)];
    }

    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::imu::ImuData;
    use nalgebra::UnitQuaternion;

    const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

    fn window_with_interval() -> (
        BTreeMap<i64, PoseVelBiasStateWithLin>,
        BTreeMap<i64, PreintegratedImu>,
        StateOrdering,
    ) {
        let mut meas = PreintegratedImu::new(0, Vector3::zeros(), Vector3::zeros());
        let accel_cov = Vector3::repeat(1e-4);
        let gyro_cov = Vector3::repeat(1e-6);
        for i in 1..=20 {
            meas.integrate(
                &ImuData::new(
                    i * 5_000_000,
                    Vector3::new(0.1, 0.0, 9.81),
                    Vector3::new(0.0, 0.0, 0.1),
                ),
                &accel_cov,
                &gyro_cov,
            );
        }

        let state0 = PoseVelBiasStateWithLin::new(
            0,
            SE3::new(UnitQuaternion::identity(), Vector3::zeros()),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
            false,
        );
        let predicted = meas.predict_state(&state0.state().pose_vel(), &GRAVITY);
        let state1 = PoseVelBiasStateWithLin::new(
            meas.end_t_ns(),
            predicted.t_w_i,
            predicted.vel_w_i,
            Vector3::zeros(),
            Vector3::zeros(),
            false,
        );

        let mut frame_states = BTreeMap::new();
        frame_states.insert(0, state0);
        frame_states.insert(meas.end_t_ns(), state1);

        let mut imu_meas = BTreeMap::new();
        imu_meas.insert(0, meas);

        let mut ordering = StateOrdering::new();
        ordering.push_state(0);
        ordering.push_state(100_000_000);

        (frame_states, imu_meas, ordering)
    }

    #[test]
    fn test_zero_error_at_predicted_state() {
        let (frame_states, imu_meas, ordering) = window_with_interval();
        let weights = Vector3::repeat(1e4);

        let error = compute_imu_error(
            &ordering,
            &frame_states,
            &imu_meas,
            &weights,
            &weights,
            &GRAVITY,
        );
        assert!(error.total() < 1e-12, "error: {}", error.total());
    }

    #[test]
    fn test_gradient_pulls_back_to_prediction() {
        let (mut frame_states, imu_meas, ordering) = window_with_interval();
        let weights = Vector3::repeat(1e4);

        // Move state1 away from the prediction; the linearized system must
        // produce a positive error and a non-zero gradient at state1.
        let key = 100_000_000;
        let mut inc = crate::imu::types::Vector15::zeros();
        inc[0] = 0.05;
        inc[7] = -0.03;
        frame_states.get_mut(&key).unwrap().apply_inc(&inc);

        let mut accum = DenseAccumulator::new(ordering.total_size);
        let error = linearize_abs_imu(
            &ordering,
            &mut accum,
            &frame_states,
            &imu_meas,
            &weights,
            &weights,
            &GRAVITY,
        );

        assert!(error.imu > 0.0);
        let (idx1, _) = ordering.block(key);
        let grad = accum.b().rows(idx1, 15).norm();
        assert!(grad > 0.0, "gradient vanished: {}", grad);

        // A damped solve applied as -inc must reduce the error.
        let damping = DVector::from_element(ordering.total_size, 1e-6);
        let solved = accum.solve(Some(&damping)).unwrap();
        for (&t_ns, state) in frame_states.iter_mut() {
            let (idx, _) = ordering.block(t_ns);
            let seg: crate::imu::types::Vector15 = solved.fixed_rows::<15>(idx).into_owned();
            state.apply_inc(&(-seg));
        }

        let after = compute_imu_error(
            &ordering,
            &frame_states,
            &imu_meas,
            &weights,
            &weights,
            &GRAVITY,
        );
        assert!(after.total() < error.total());
    }
}
