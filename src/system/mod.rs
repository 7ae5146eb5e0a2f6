//! Queue message types and the worker-thread wrapper around the estimator.

pub mod messages;
pub mod vio_system;

pub use messages::{MargData, OpticalFlowResult, StateSnapshot, VisualizationData};
pub use vio_system::{OutputQueues, VioSystem};
