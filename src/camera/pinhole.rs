//! Ideal pinhole model.

use nalgebra::{Matrix2x4, Vector2, Vector4};

/// Minimum forward distance accepted by the projection.
const MIN_Z: f64 = 1e-8;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    pub fn project(&self, p: &Vector4<f64>) -> Option<(Vector2<f64>, Matrix2x4<f64>)> {
        let (x, y, z) = (p[0], p[1], p[2]);
        if z < MIN_Z {
            return None;
        }

        let inv_z = 1.0 / z;
        let uv = Vector2::new(
            self.fx * x * inv_z + self.cx,
            self.fy * y * inv_z + self.cy,
        );

        let inv_z2 = inv_z * inv_z;
        let mut jac = Matrix2x4::zeros();
        jac[(0, 0)] = self.fx * inv_z;
        jac[(0, 2)] = -self.fx * x * inv_z2;
        jac[(1, 1)] = self.fy * inv_z;
        jac[(1, 2)] = -self.fy * y * inv_z2;

        Some((uv, jac))
    }

    pub fn unproject(&self, uv: &Vector2<f64>) -> Option<Vector4<f64>> {
        let mx = (uv.x - self.cx) / self.fx;
        let my = (uv.y - self.cy) / self.fy;

        let norm = (mx * mx + my * my + 1.0).sqrt();
        Some(Vector4::new(mx / norm, my / norm, 1.0 / norm, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_principal_point_maps_to_center() {
        let cam = PinholeCamera::new(400.0, 400.0, 320.0, 240.0);
        let (uv, _) = cam.project(&Vector4::new(0.0, 0.0, 2.0, 0.0)).unwrap();

        assert_relative_eq!(uv, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_point_behind_camera_rejected() {
        let cam = PinholeCamera::new(400.0, 400.0, 320.0, 240.0);
        assert!(cam.project(&Vector4::new(0.1, 0.1, -1.0, 0.0)).is_none());
    }
}
