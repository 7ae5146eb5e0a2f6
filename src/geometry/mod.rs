//! Geometry primitives: SE(3) transforms, SO(3) Jacobians, stereographic
//! bearings and two-view triangulation.

pub mod se3;
pub mod so3;
pub mod stereographic;
pub mod triangulation;

pub use se3::SE3;
pub use so3::{right_jacobian_so3, right_jacobian_so3_inv, skew};
pub use triangulation::triangulate;
