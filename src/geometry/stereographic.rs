//! Stereographic bearing parameterization.
//!
//! Landmarks are stored as a 2-parameter stereographic image of their unit
//! bearing in the host camera plus a separate inverse depth. The chart is
//! centered on the forward axis, so bearings anywhere in front of the camera
//! stay well away from the parameterization's singularity at `z = -1`.

use nalgebra::{SMatrix, Vector2, Vector4};

/// Map a homogeneous direction to its 2-parameter stereographic image.
///
/// Only the direction of the first three components matters; the scale
/// component is ignored.
pub fn project(p: &Vector4<f64>) -> Vector2<f64> {
    let norm = p.fixed_rows::<3>(0).norm();
    let denom = norm + p[2];
    Vector2::new(p[0] / denom, p[1] / denom)
}

/// Inverse chart: recover the unit bearing `[x, y, z, 0]` from its
/// stereographic parameters.
pub fn unproject(dir: &Vector2<f64>) -> Vector4<f64> {
    let r2 = dir.norm_squared();
    let s = 1.0 + r2;
    Vector4::new(2.0 * dir.x / s, 2.0 * dir.y / s, (1.0 - r2) / s, 0.0)
}

/// Inverse chart together with its 4×2 Jacobian, consumed by the visual
/// residual linearization.
pub fn unproject_with_jacobian(dir: &Vector2<f64>) -> (Vector4<f64>, SMatrix<f64, 4, 2>) {
    let r2 = dir.norm_squared();
    let s = 1.0 + r2;
    let s2 = s * s;

    let p = Vector4::new(2.0 * dir.x / s, 2.0 * dir.y / s, (1.0 - r2) / s, 0.0);

    let mut jac = SMatrix::<f64, 4, 2>::zeros();
    jac[(0, 0)] = (2.0 * s - 4.0 * dir.x * dir.x) / s2;
    jac[(0, 1)] = -4.0 * dir.x * dir.y / s2;
    jac[(1, 0)] = -4.0 * dir.x * dir.y / s2;
    jac[(1, 1)] = (2.0 * s - 4.0 * dir.y * dir.y) / s2;
    jac[(2, 0)] = -4.0 * dir.x / s2;
    jac[(2, 1)] = -4.0 * dir.y / s2;

    (p, jac)
}
