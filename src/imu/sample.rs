//! Raw inertial samples as they arrive from the driver queue.

use nalgebra::Vector3;

/// Single IMU measurement, already corrected for the static bias
/// calibration by the time it reaches the estimator core.
#[derive(Debug, Clone, Copy)]
pub struct ImuData {
    pub t_ns: i64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuData {
    pub fn new(t_ns: i64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { t_ns, accel, gyro }
    }
}
