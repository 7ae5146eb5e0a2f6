//! Residual linearization kernels, the stacked-state ordering, and the dense
//! normal-equation accumulator shared by the optimizer driver and the
//! marginalization engine.

pub mod accumulator;
pub mod imu_factors;
pub mod ordering;
pub mod prior;
pub mod vision;

pub use accumulator::DenseAccumulator;
pub use ordering::StateOrdering;
