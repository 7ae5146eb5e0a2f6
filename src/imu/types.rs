//! Fixed-size matrix aliases for the 9-dof pre-integration state
//! [δθ, δv, δp] and the 15-dof frame-state tangent [δp, δθ, δv, δb_a, δb_g].

use nalgebra::{SMatrix, SVector};

pub type Vector9 = SVector<f64, 9>;
pub type Vector15 = SVector<f64, 15>;
pub type Matrix9 = SMatrix<f64, 9, 9>;
pub type Matrix9x6 = SMatrix<f64, 9, 6>;
pub type Matrix9x15 = SMatrix<f64, 9, 15>;
