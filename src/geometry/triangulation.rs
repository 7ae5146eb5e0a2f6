//! Two-view DLT triangulation in inverse-depth form.

use nalgebra::{Matrix3x4, Matrix4, Vector3, Vector4};

use super::SE3;

/// Triangulate a point from two bearing vectors.
///
/// `f0` is the bearing in camera 0, `f1` the bearing in camera 1, and
/// `t_0_1` the pose of camera 1 in camera 0. The result is expressed in
/// camera 0 as a unit-norm direction with the inverse depth in the fourth
/// component, the representation landmarks are created from. Components may
/// be non-finite or the inverse depth non-positive for degenerate geometry;
/// callers are expected to validate before accepting the point.
pub fn triangulate(f0: &Vector3<f64>, f1: &Vector3<f64>, t_0_1: &SE3) -> Vector4<f64> {
    let p0 = Matrix3x4::<f64>::identity();

    let t_1_0 = t_0_1.inverse();
    let mut p1 = Matrix3x4::<f64>::zeros();
    p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&t_1_0.rotation_matrix());
    p1.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_1_0.translation);

    let mut a = Matrix4::<f64>::zeros();
    a.set_row(0, &(f0[0] * p0.row(2) - f0[2] * p0.row(0)));
    a.set_row(1, &(f0[1] * p0.row(2) - f0[2] * p0.row(1)));
    a.set_row(2, &(f1[0] * p1.row(2) - f1[2] * p1.row(0)));
    a.set_row(3, &(f1[1] * p1.row(2) - f1[2] * p1.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t.expect("SVD of a 4x4 system always yields V^T");

    // Null-space direction: right singular vector of the smallest singular
    // value (nalgebra does not guarantee ordering).
    let mut min_idx = 0;
    for i in 1..4 {
        if svd.singular_values[i] < svd.singular_values[min_idx] {
            min_idx = i;
        }
    }
    let mut point: Vector4<f64> = v_t.row(min_idx).transpose();

    point /= point.fixed_rows::<3>(0).norm();
    if f0.dot(&point.fixed_rows::<3>(0)) < 0.0 {
        point = -point;
    }

    point
}
