//! Double sphere model for wide-angle and fisheye lenses.
//!
//! Parameters are the usual `fx, fy, cx, cy` plus the sphere offset `xi` and
//! the blending factor `alpha`.

use nalgebra::{Matrix2x4, Vector2, Vector4};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DoubleSphereCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub xi: f64,
    pub alpha: f64,
}

impl DoubleSphereCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, xi: f64, alpha: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            xi,
            alpha,
        }
    }

    pub fn project(&self, p: &Vector4<f64>) -> Option<(Vector2<f64>, Matrix2x4<f64>)> {
        let (x, y, z) = (p[0], p[1], p[2]);
        let xi = self.xi;
        let alpha = self.alpha;

        let d1 = (x * x + y * y + z * z).sqrt();
        if d1 < 1e-12 {
            return None;
        }

        // Field-of-view domain check.
        let w1 = if alpha > 0.5 {
            (1.0 - alpha) / alpha
        } else {
            alpha / (1.0 - alpha)
        };
        let w2 = (w1 + xi) / (2.0 * w1 * xi + xi * xi + 1.0).sqrt();
        if z <= -w2 * d1 {
            return None;
        }

        let k = xi * d1 + z;
        let d2 = (x * x + y * y + k * k).sqrt();
        let denom = alpha * d2 + (1.0 - alpha) * k;
        if denom < 1e-12 {
            return None;
        }

        let uv = Vector2::new(
            self.fx * x / denom + self.cx,
            self.fy * y / denom + self.cy,
        );

        let dk = Vector2::new(xi * x / d1, xi * y / d1);
        let dk_z = xi * z / d1 + 1.0;

        let dd2_x = (x + k * dk.x) / d2;
        let dd2_y = (y + k * dk.y) / d2;
        let dd2_z = k * dk_z / d2;

        let ddenom_x = alpha * dd2_x + (1.0 - alpha) * dk.x;
        let ddenom_y = alpha * dd2_y + (1.0 - alpha) * dk.y;
        let ddenom_z = alpha * dd2_z + (1.0 - alpha) * dk_z;

        let inv_denom2 = 1.0 / (denom * denom);
        let mut jac = Matrix2x4::zeros();
        jac[(0, 0)] = self.fx * (denom - x * ddenom_x) * inv_denom2;
        jac[(0, 1)] = -self.fx * x * ddenom_y * inv_denom2;
        jac[(0, 2)] = -self.fx * x * ddenom_z * inv_denom2;
        jac[(1, 0)] = -self.fy * y * ddenom_x * inv_denom2;
        jac[(1, 1)] = self.fy * (denom - y * ddenom_y) * inv_denom2;
        jac[(1, 2)] = -self.fy * y * ddenom_z * inv_denom2;

        Some((uv, jac))
    }

    pub fn unproject(&self, uv: &Vector2<f64>) -> Option<Vector4<f64>> {
        let xi = self.xi;
        let alpha = self.alpha;

        let mx = (uv.x - self.cx) / self.fx;
        let my = (uv.y - self.cy) / self.fy;
        let r2 = mx * mx + my * my;

        if alpha > 0.5 && r2 > 1.0 / (2.0 * alpha - 1.0) {
            return None;
        }

        let mz_num = 1.0 - alpha * alpha * r2;
        let mz_den = alpha * (1.0 - (2.0 * alpha - 1.0) * r2).sqrt() + 1.0 - alpha;
        let mz = mz_num / mz_den;

        let scale = (mz * xi + (mz * mz + (1.0 - xi * xi) * r2).sqrt()) / (mz * mz + r2);

        let dir = nalgebra::Vector3::new(scale * mx, scale * my, scale * mz - xi).normalize();
        Some(Vector4::new(dir.x, dir.y, dir.z, 0.0))
    }
}
