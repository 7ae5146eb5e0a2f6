//! The sliding-window estimator core: frame states with frozen linearization
//! points and the per-frame measure → optimize → marginalize pipeline.

pub mod state;
pub mod vio;

pub use state::{PoseStateWithLin, PoseVelBiasState, PoseVelBiasStateWithLin};
pub use vio::VioEstimator;
