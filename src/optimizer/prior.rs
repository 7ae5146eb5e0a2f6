//! Marginalization prior: linearization of the Gaussian over retained
//! variables, the Schur-complement reduction, and the null-space diagnostic.

use std::collections::BTreeMap;

use nalgebra::{Cholesky, DMatrix, DVector, Vector3};

use crate::estimator::state::{PoseStateWithLin, PoseVelBiasStateWithLin};
use crate::optimizer::{DenseAccumulator, StateOrdering};
use crate::{POSE_SIZE, POSE_VEL_BIAS_SIZE};

/// Stack the tangent-space deviations of all retained variables from their
/// linearization points. Live states contribute zeros.
pub fn compute_delta(
    order: &StateOrdering,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
) -> DVector<f64> {
    let mut delta = DVector::zeros(order.total_size);

    for (&t_ns, &(idx, size)) in &order.abs_order_map {
        match size {
            POSE_SIZE => {
                let pose = frame_poses
                    .get(&t_ns)
                    .unwrap_or_else(|| panic!("pose {} missing for prior delta", t_ns));
                delta.rows_mut(idx, POSE_SIZE).copy_from(&pose.delta());
            }
            POSE_VEL_BIAS_SIZE => {
                let state = frame_states
                    .get(&t_ns)
                    .unwrap_or_else(|| panic!("state {} missing for prior delta", t_ns));
                delta
                    .rows_mut(idx, POSE_VEL_BIAS_SIZE)
                    .copy_from(&state.delta());
            }
            other => panic!("invalid block size {} in ordering", other),
        }
    }

    delta
}

/// Add the prior contribution `H += H_m`, `b += H_m·δ + b_m` to the leading
/// block of the system and return the prior energy `δᵀ(b_m + ½ H_m δ)`.
#[allow(clippy::too_many_arguments)]
pub fn linearize_marg_prior(
    marg_order: &StateOrdering,
    marg_h: &DMatrix<f64>,
    marg_b: &DVector<f64>,
    aom: &StateOrdering,
    accum: &mut DenseAccumulator,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
) -> f64 {
    // The retained variables must occupy the same leading index ranges in
    // the current ordering.
    for (t_ns, block) in &marg_order.abs_order_map {
        assert_eq!(
            aom.block(*t_ns),
            *block,
            "prior ordering diverged at frame {}",
            t_ns
        );
    }

    let delta = compute_delta(marg_order, frame_states, frame_poses);

    accum.add_h(0, 0, marg_h);
    accum.add_b(0, &(marg_h * &delta + marg_b));

    delta.dot(marg_b) + 0.5 * delta.dot(&(marg_h * &delta))
}

/// Prior energy at the current deviation, without touching the system.
pub fn compute_marg_prior_error(
    marg_order: &StateOrdering,
    marg_h: &DMatrix<f64>,
    marg_b: &DVector<f64>,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
) -> f64 {
    let delta = compute_delta(marg_order, frame_states, frame_poses);
    delta.dot(marg_b) + 0.5 * delta.dot(&(marg_h * &delta))
}

fn gather(h: &DMatrix<f64>, b: &DVector<f64>, rows: &[usize], cols: &[usize]) -> (DMatrix<f64>, DVector<f64>) {
    let mut h_out = DMatrix::zeros(rows.len(), cols.len());
    let mut b_out = DVector::zeros(rows.len());
    for (i, &r) in rows.iter().enumerate() {
        b_out[i] = b[r];
        for (j, &c) in cols.iter().enumerate() {
            h_out[(i, j)] = h[(r, c)];
        }
    }
    (h_out, b_out)
}

/// Schur-complement elimination of the `marg` index set:
///
/// ```text
/// H_keep = H_kk − H_km · H_mm⁻¹ · H_mk
/// b_keep = b_k  − H_km · H_mm⁻¹ · b_m
/// ```
///
/// `H_mm` is inverted by Cholesky; if the factorization fails a small
/// diagonal regularizer is added and the solve falls back to LU. Empty
/// `marg` leaves the gathered system untouched (marginalization idempotence
/// on the empty set).
pub fn marginalize_helper(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    idx_to_keep: &[usize],
    idx_to_marg: &[usize],
) -> (DMatrix<f64>, DVector<f64>) {
    let (h_kk, b_k) = gather(h, b, idx_to_keep, idx_to_keep);
    if idx_to_marg.is_empty() {
        return (h_kk, b_k);
    }

    let (h_km, _) = gather(h, b, idx_to_keep, idx_to_marg);
    let (h_mk, b_m) = gather(h, b, idx_to_marg, idx_to_keep);
    let (h_mm, _) = gather(h, b, idx_to_marg, idx_to_marg);

    let (h_mm_inv_h_mk, h_mm_inv_b_m) = match Cholesky::new(h_mm.clone()) {
        Some(chol) => (chol.solve(&h_mk), chol.solve(&b_m)),
        None => {
            let scale = h_mm.diagonal().amax().max(1.0);
            let regularized = h_mm + DMatrix::identity(idx_to_marg.len(), idx_to_marg.len())
                * (1e-9 * scale);
            let lu = regularized.lu();
            (
                lu.solve(&h_mk).expect("regularized H_mm must be solvable"),
                lu.solve(&b_m).expect("regularized H_mm must be solvable"),
            )
        }
    };

    let mut h_keep = h_kk - &h_km * h_mm_inv_h_mk;
    let b_keep = b_k - &h_km * h_mm_inv_b_m;

    // Force exact symmetry; the subtraction leaves rounding skew behind.
    for i in 0..h_keep.nrows() {
        for j in (i + 1)..h_keep.ncols() {
            let avg = 0.5 * (h_keep[(i, j)] + h_keep[(j, i)]);
            h_keep[(i, j)] = avg;
            h_keep[(j, i)] = avg;
        }
    }

    (h_keep, b_keep)
}

/// Energies `vᵀ H_m v` of the four global gauge directions (x/y/z
/// translation and yaw about the world z-axis) the prior is expected not to
/// constrain when no absolute prior is active.
pub fn marg_nullspace_energies(
    marg_h: &DMatrix<f64>,
    marg_order: &StateOrdering,
    frame_states: &BTreeMap<i64, PoseVelBiasStateWithLin>,
    frame_poses: &BTreeMap<i64, PoseStateWithLin>,
) -> [f64; 4] {
    let size = marg_order.total_size;
    let mut generators = [
        DVector::zeros(size),
        DVector::zeros(size),
        DVector::zeros(size),
        DVector::zeros(size),
    ];

    for (&t_ns, &(idx, size)) in &marg_order.abs_order_map {
        let translation = frame_poses
            .get(&t_ns)
            .map(|p| p.pose().translation)
            .or_else(|| frame_states.get(&t_ns).map(|s| s.state().t_w_i.translation))
            .unwrap_or_else(|| panic!("frame {} missing for nullspace check", t_ns));

        for axis in 0..3 {
            generators[axis][idx + axis] = 1.0;
        }

        // Yaw gauge: rotate every position (and velocity, for full states)
        // about the world z axis while adding the same yaw to each attitude.
        let z = Vector3::z();
        let yaw_trans = z.cross(&translation);
        for k in 0..3 {
            generators[3][idx + k] = yaw_trans[k];
        }
        generators[3][idx + 5] = 1.0;

        if size == POSE_VEL_BIAS_SIZE {
            let vel = frame_states[&t_ns].state().vel_w_i;
            let yaw_vel = z.cross(&vel);
            for k in 0..3 {
                generators[3][idx + 6 + k] = yaw_vel[k];
            }
        }
    }

    let mut energies = [0.0; 4];
    for (i, v) in generators.iter().enumerate() {
        let n = v.norm();
        if n > 0.0 {
            let unit = v / n;
            energies[i] = unit.dot(&(marg_h * &unit));
        }
    }
    energies
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_system(n: usize) -> (DMatrix<f64>, DVector<f64>) {
        // A deterministic strictly diagonally dominant symmetric matrix.
        let mut h = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                h[(i, j)] = 1.0 / (1.0 + (i as f64 - j as f64).abs());
            }
            h[(i, i)] += n as f64;
        }
        let b = DVector::from_fn(n, |i, _| (i as f64 * 0.37).sin());
        (h, b)
    }

    #[test]
    fn test_empty_marg_set_is_identity() {
        let (h, b) = spd_system(6);
        let keep: Vec<usize> = (0..6).collect();

        let (h_keep, b_keep) = marginalize_helper(&h, &b, &keep, &[]);

        assert_relative_eq!(h_keep, h, epsilon = 1e-15);
        assert_relative_eq!(b_keep, b, epsilon = 1e-15);
    }

    #[test]
    fn test_schur_preserves_solution_of_kept_variables() {
        // Solving the full system and solving the reduced system must give
        // the same values for the kept variables.
        let (h, b) = spd_system(8);
        let keep: Vec<usize> = vec![0, 1, 2, 3];
        let marg: Vec<usize> = vec![4, 5, 6, 7];

        let full = Cholesky::new(h.clone()).unwrap().solve(&b);
        let (h_keep, b_keep) = marginalize_helper(&h, &b, &keep, &marg);
        let reduced = Cholesky::new(h_keep).unwrap().solve(&b_keep);

        for (i, &k) in keep.iter().enumerate() {
            assert_relative_eq!(reduced[i], full[k], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_schur_result_is_symmetric() {
        let (h, b) = spd_system(10);
        let keep: Vec<usize> = (0..4).collect();
        let marg: Vec<usize> = (4..10).collect();

        let (h_keep, _) = marginalize_helper(&h, &b, &keep, &marg);

        for i in 0..h_keep.nrows() {
            for j in 0..h_keep.ncols() {
                assert_relative_eq!(h_keep[(i, j)], h_keep[(j, i)], epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_singular_marg_block_is_regularized() {
        // A zero H_mm block cannot be Cholesky-factorized; the helper must
        // still produce finite output through the regularized path.
        let mut h = DMatrix::zeros(4, 4);
        h[(0, 0)] = 2.0;
        h[(1, 1)] = 3.0;
        let b = DVector::from_vec(vec![1.0, -1.0, 0.0, 0.0]);

        let (h_keep, b_keep) = marginalize_helper(&h, &b, &[0, 1], &[2, 3]);

        assert!(h_keep.iter().all(|v| v.is_finite()));
        assert!(b_keep.iter().all(|v| v.is_finite()));
        assert_relative_eq!(h_keep[(0, 0)], 2.0, epsilon = 1e-9);
    }
}
