//! Rigid transform on SE(3).
//!
//! The estimator updates pose states with a *decoupled* tangent increment
//! `[δp, δθ]`: translation is bumped additively while rotation is retracted
//! with the SO(3) exponential on the left. Relative-pose Jacobians in the
//! vision kernel use the group adjoint to move between parameterizations.

use nalgebra::{Matrix3, Matrix4, Matrix6, UnitQuaternion, Vector3, Vector4, Vector6};

use super::so3::skew;

/// Rigid-body transform `T = [R | t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Inverse transform: `T⁻¹ = [Rᵀ | -Rᵀ t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition `self ∘ other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Transform a homogeneous point `[x, y, z, w]` where `w` carries the
    /// inverse depth: the first three components map as `R·p + t·w`, the
    /// scale component is untouched.
    pub fn transform_homogeneous(&self, p: &Vector4<f64>) -> Vector4<f64> {
        let head = self.rotation * p.fixed_rows::<3>(0).into_owned() + self.translation * p[3];
        Vector4::new(head.x, head.y, head.z, p[3])
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Group adjoint mapping left tangent increments through composition:
    ///
    /// ```text
    /// Adj(T) = | R  [t]× R |
    ///          | 0      R  |
    /// ```
    pub fn adjoint(&self) -> Matrix6<f64> {
        let r = self.rotation_matrix();
        let mut adj = Matrix6::zeros();
        adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        adj.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * r));
        adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        adj
    }

    /// Decoupled retraction: `t += δp`, `R ← Exp(δθ)·R`.
    pub fn apply_inc(&mut self, inc: &Vector6<f64>) {
        self.translation += inc.fixed_rows::<3>(0).into_owned();
        let dtheta: Vector3<f64> = inc.fixed_rows::<3>(3).into_owned();
        self.rotation = UnitQuaternion::from_scaled_axis(dtheta) * self.rotation;
    }
}
