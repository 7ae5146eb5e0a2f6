//! Rig calibration: camera intrinsics and extrinsics, IMU noise densities,
//! static bias calibration, gravity. Immutable after construction; the
//! estimator threads every linearization kernel through a shared reference.

use nalgebra::{UnitQuaternion, Vector3};

use crate::camera::{GenericCamera, PinholeCamera};
use crate::geometry::SE3;

/// Static sensor bias estimated offline. Applied to every raw sample before
/// it enters the pre-integration.
#[derive(Debug, Clone)]
pub struct StaticBias {
    pub bias: Vector3<f64>,
}

impl StaticBias {
    pub fn zero() -> Self {
        Self {
            bias: Vector3::zeros(),
        }
    }

    pub fn new(bias: Vector3<f64>) -> Self {
        Self { bias }
    }

    pub fn correct(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        raw - self.bias
    }
}

/// Multi-camera + IMU rig calibration.
#[derive(Debug, Clone)]
pub struct Calibration {
    /// Per-camera intrinsic models.
    pub intrinsics: Vec<GenericCamera>,
    /// Per-camera extrinsics `T_i_c` (camera in IMU frame).
    pub t_i_c: Vec<SE3>,

    pub calib_accel_bias: StaticBias,
    pub calib_gyro_bias: StaticBias,

    /// Continuous-time white-noise densities (per axis).
    pub accel_noise_std: Vector3<f64>,
    pub gyro_noise_std: Vector3<f64>,

    /// Bias random-walk standard deviations (per axis).
    pub accel_bias_std: Vector3<f64>,
    pub gyro_bias_std: Vector3<f64>,

    /// Nominal IMU sample rate in Hz, used to discretize the noise densities.
    pub imu_update_rate: f64,

    /// Gravity in the world frame.
    pub g: Vector3<f64>,
}

impl Calibration {
    pub fn num_cams(&self) -> usize {
        self.intrinsics.len()
    }

    /// Discrete-time accelerometer noise standard deviation.
    pub fn discrete_time_accel_noise_std(&self) -> Vector3<f64> {
        self.accel_noise_std * self.imu_update_rate.sqrt()
    }

    /// Discrete-time gyroscope noise standard deviation.
    pub fn discrete_time_gyro_noise_std(&self) -> Vector3<f64> {
        self.gyro_noise_std * self.imu_update_rate.sqrt()
    }

    /// Canonical synthetic stereo rig: two identical pinhole cameras with a
    /// 20 cm baseline, both aligned with the IMU axes. Used by tests and
    /// examples that need a rig without loading real calibration.
    pub fn synthetic_stereo() -> Self {
        let cam = PinholeCamera::new(420.0, 420.0, 376.0, 240.0);
        Self {
            intrinsics: vec![
                GenericCamera::Pinhole(cam.clone()),
                GenericCamera::Pinhole(cam),
            ],
            t_i_c: vec![
                SE3::identity(),
                SE3::new(UnitQuaternion::identity(), Vector3::new(0.2, 0.0, 0.0)),
            ],
            calib_accel_bias: StaticBias::zero(),
            calib_gyro_bias: StaticBias::zero(),
            accel_noise_std: Vector3::repeat(2.0e-3),
            gyro_noise_std: Vector3::repeat(1.7e-4),
            accel_bias_std: Vector3::repeat(1e-2),
            gyro_bias_std: Vector3::repeat(1e-3),
            imu_update_rate: 200.0,
            g: Vector3::new(0.0, 0.0, -9.81),
        }
    }
}
