//! Visual reprojection linearization.
//!
//! Residuals are formed against the relative pose `T_t_h` between the host
//! and target cameras, then lifted to the absolute pose blocks of both frames
//! through the chain rule. Landmark blocks are Schur-eliminated locally (one
//! 3×3 inversion per landmark) so only pose-sized contributions reach the
//! global system; the landmark increments are recovered afterwards by
//! back-substitution.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix2x4, Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector4};

use crate::calib::Calibration;
use crate::camera::{DoubleSphereCamera, GenericCamera, PinholeCamera};
use crate::geometry::stereographic;
use crate::geometry::{skew, SE3};
use crate::map::{FrameCamId, KeypointId, KeypointObservation, Landmark, LandmarkDatabase};
use crate::optimizer::{DenseAccumulator, StateOrdering};
use crate::POSE_SIZE;

/// Pose lookup by frame timestamp. The caller provides one for the frozen
/// linearization points (Jacobians) and one for the current values
/// (residuals).
pub type PoseLookup<'a> = &'a dyn Fn(i64) -> SE3;

fn rot_block_diag(r: &Matrix3<f64>) -> Matrix6<f64> {
    let mut m = Matrix6::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(r);
    m
}

/// Relative pose of the host camera in the target camera,
/// `T_t_h = T_i_c(t)⁻¹ · T_w_i(t)⁻¹ · T_w_i(h) · T_i_c(h)`,
/// with 6×6 Jacobians of its left tangent w.r.t. the decoupled absolute
/// increments of host and target IMU poses.
pub fn compute_rel_pose(
    t_w_i_h: &SE3,
    t_i_c_h: &SE3,
    t_w_i_t: &SE3,
    t_i_c_t: &SE3,
) -> (SE3, Matrix6<f64>, Matrix6<f64>) {
    let t_c_i_t = t_i_c_t.inverse();
    let t_t_i_h_i = t_w_i_t.inverse().compose(t_w_i_h);
    let tmp = t_c_i_t.compose(&t_t_i_h_i);
    let t_t_h = tmp.compose(t_i_c_h);

    let r_h_inv = t_w_i_h.rotation.inverse().to_rotation_matrix().into_inner();
    let r_t_inv = t_w_i_t.rotation.inverse().to_rotation_matrix().into_inner();

    let d_rel_d_h = tmp.adjoint() * rot_block_diag(&r_h_inv);
    let d_rel_d_t = -t_c_i_t.adjoint() * rot_block_diag(&r_t_inv);

    (t_t_h, d_rel_d_h, d_rel_d_t)
}

/// Linearization of a single observation.
pub struct PointLin {
    pub res: Vector2<f64>,
    /// ∂res/∂ξ for the left tangent of `T_t_h`.
    pub d_res_d_xi: SMatrix<f64, 2, 6>,
    /// ∂res/∂(bearing, inverse depth).
    pub d_res_d_p: SMatrix<f64, 2, 3>,
    /// Projection in the target camera with the target-frame inverse depth.
    pub proj: Vector4<f64>,
}

trait ProjectHomogeneous {
    fn project_hom(&self, p: &Vector4<f64>) -> Option<(Vector2<f64>, Matrix2x4<f64>)>;
}

impl ProjectHomogeneous for PinholeCamera {
    fn project_hom(&self, p: &Vector4<f64>) -> Option<(Vector2<f64>, Matrix2x4<f64>)> {
        self.project(p)
    }
}

impl ProjectHomogeneous for DoubleSphereCamera {
    fn project_hom(&self, p: &Vector4<f64>) -> Option<(Vector2<f64>, Matrix2x4<f64>)> {
        self.project(p)
    }
}

fn linearize_point_impl<C: ProjectHomogeneous>(
    obs_pos: &Vector2<f64>,
    landmark: &Landmark,
    t_t_h: &SE3,
    cam: &C,
) -> Option<PointLin> {
    let (mut p_h, jup) = stereographic::unproject_with_jacobian(&landmark.dir);
    p_h[3] = landmark.inv_depth;

    let p_t = t_t_h.transform_homogeneous(&p_h);

    let (uv, jp) = cam.project_hom(&p_t)?;
    if !uv.x.is_finite() || !uv.y.is_finite() {
        return None;
    }

    let p_t_head: Vector3<f64> = p_t.fixed_rows::<3>(0).into_owned();

    // ∂p_t/∂ξ for a left increment of T_t_h acting on [dir; ρ].
    let mut d_point_d_xi = SMatrix::<f64, 4, 6>::zeros();
    d_point_d_xi
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(Matrix3::identity() * landmark.inv_depth));
    d_point_d_xi
        .fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-skew(&p_t_head)));

    // ∂p_t/∂(bearing params, inverse depth).
    let mut d_point_d_p = SMatrix::<f64, 4, 3>::zeros();
    let rot = t_t_h.rotation_matrix();
    for col in 0..2 {
        let dir_col: Vector3<f64> = jup.fixed_view::<3, 1>(0, col).into_owned();
        d_point_d_p
            .fixed_view_mut::<3, 1>(0, col)
            .copy_from(&(rot * dir_col));
    }
    d_point_d_p
        .fixed_view_mut::<3, 1>(0, 2)
        .copy_from(&t_t_h.translation);
    d_point_d_p[(3, 2)] = 1.0;

    let norm = p_t_head.norm();
    let proj = Vector4::new(uv.x, uv.y, if norm > 0.0 { p_t[3] / norm } else { 0.0 }, 0.0);

    Some(PointLin {
        res: uv - obs_pos,
        d_res_d_xi: jp * d_point_d_xi,
        d_res_d_p: jp * d_point_d_p,
        proj,
    })
}

/// Linearize one observation of `landmark` seen in the target camera `cam`.
pub fn linearize_point(
    obs_pos: &Vector2<f64>,
    landmark: &Landmark,
    t_t_h: &SE3,
    cam: &GenericCamera,
) -> Option<PointLin> {
    match cam {
        GenericCamera::Pinhole(c) => linearize_point_impl(obs_pos, landmark, t_t_h, c),
        GenericCamera::DoubleSphere(c) => linearize_point_impl(obs_pos, landmark, t_t_h, c),
    }
}

/// Huber weight at threshold `huber_thresh` for a residual of norm `e`.
fn huber_weight(e: f64, huber_thresh: f64) -> f64 {
    if e < huber_thresh {
        1.0
    } else {
        huber_thresh / e
    }
}

/// Per-landmark blocks of one host's local system.
pub struct LandmarkBlocks {
    pub h_ll: Matrix3<f64>,
    pub h_ll_inv: Matrix3<f64>,
    pub b_l: Vector3<f64>,
    /// Local pose block index → pose-landmark coupling.
    pub h_pl: BTreeMap<usize, SMatrix<f64, 6, 3>>,
}

impl LandmarkBlocks {
    fn new() -> Self {
        Self {
            h_ll: Matrix3::zeros(),
            h_ll_inv: Matrix3::zeros(),
            b_l: Vector3::zeros(),
            h_pl: BTreeMap::new(),
        }
    }
}

/// Local linearization of every observation hosted by one keyframe camera.
///
/// Pose blocks are already in absolute coordinates; block 0 is the host
/// frame, further blocks are target frames in order of first appearance.
pub struct HostLinData {
    pub host: FrameCamId,
    pub frame_ids: Vec<i64>,
    pub h_pp: DMatrix<f64>,
    pub b_p: DVector<f64>,
    pub landmarks: BTreeMap<KeypointId, LandmarkBlocks>,
    pub error: f64,
}

impl HostLinData {
    fn block_index(frame_ids: &mut Vec<i64>, frame_id: i64) -> usize {
        match frame_ids.iter().position(|&f| f == frame_id) {
            Some(idx) => idx,
            None => {
                frame_ids.push(frame_id);
                frame_ids.len() - 1
            }
        }
    }

    /// Invert the per-landmark 3×3 Hessians ahead of the Schur elimination.
    pub fn invert_landmark_hessians(&mut self) {
        for blocks in self.landmarks.values_mut() {
            let regularized = blocks.h_ll + Matrix3::identity() * 1e-12;
            blocks.h_ll_inv = regularized
                .try_inverse()
                .expect("regularized landmark Hessian must be invertible");
        }
    }

    /// Schur-eliminate the landmarks and scatter the pose-only remainder
    /// into the global system.
    pub fn add_to_system(&self, ordering: &StateOrdering, accum: &mut DenseAccumulator) {
        let nb = self.frame_ids.len();
        let mut h = self.h_pp.clone();
        let mut b = self.b_p.clone();

        for blocks in self.landmarks.values() {
            let hll_inv_bl = blocks.h_ll_inv * blocks.b_l;
            for (&bi, h_pl_i) in &blocks.h_pl {
                let mut b_seg = b.rows_mut(bi * POSE_SIZE, POSE_SIZE);
                b_seg -= h_pl_i * hll_inv_bl;

                for (&bj, h_pl_j) in &blocks.h_pl {
                    let reduced = h_pl_i * blocks.h_ll_inv * h_pl_j.transpose();
                    let mut h_block = h.view_mut((bi * POSE_SIZE, bj * POSE_SIZE), (POSE_SIZE, POSE_SIZE));
                    h_block -= reduced;
                }
            }
        }

        for bi in 0..nb {
            let (abs_i, _) = ordering.block(self.frame_ids[bi]);
            accum.add_b(abs_i, &b.rows(bi * POSE_SIZE, POSE_SIZE).into_owned());
            for bj in 0..nb {
                let (abs_j, _) = ordering.block(self.frame_ids[bj]);
                let block = h
                    .view((bi * POSE_SIZE, bj * POSE_SIZE), (POSE_SIZE, POSE_SIZE))
                    .into_owned();
                accum.add_h(abs_i, abs_j, &block);
            }
        }
    }

    /// Back-substitute the landmark increments from the solved pose
    /// increment and apply them (negated, like the pose update).
    pub fn update_landmarks(
        &self,
        ordering: &StateOrdering,
        inc: &DVector<f64>,
        lmdb: &mut LandmarkDatabase,
    ) {
        for (&kpt_id, blocks) in &self.landmarks {
            let mut rhs = blocks.b_l;
            for (&bi, h_pl) in &blocks.h_pl {
                let (abs_i, _) = ordering.block(self.frame_ids[bi]);
                let pose_inc: nalgebra::Vector6<f64> =
                    inc.fixed_rows::<6>(abs_i).into_owned();
                rhs -= h_pl.transpose() * pose_inc;
            }
            let delta = blocks.h_ll_inv * rhs;

            let landmark = lmdb.get_landmark_mut(kpt_id);
            landmark.dir -= Vector2::new(delta[0], delta[1]);
            landmark.inv_depth -= delta[2];
        }
    }
}

/// Linearize all observations of one host over the given target map.
///
/// `pose_lin` supplies the frozen linearization points for Jacobians;
/// `pose_cur` supplies the current values for residuals. They coincide for
/// states that are not linearized.
#[allow(clippy::too_many_arguments)]
pub fn linearize_host_block(
    host: FrameCamId,
    targets: &BTreeMap<FrameCamId, Vec<KeypointObservation>>,
    lmdb: &LandmarkDatabase,
    calib: &Calibration,
    pose_lin: PoseLookup,
    pose_cur: PoseLookup,
    obs_std_dev: f64,
    huber_thresh: f64,
) -> HostLinData {
    let obs_weight = 1.0 / (obs_std_dev * obs_std_dev);

    let mut frame_ids = vec![host.frame_id];
    let mut landmarks: BTreeMap<KeypointId, LandmarkBlocks> = BTreeMap::new();
    let mut contribs: Vec<(KeypointId, Vec<(usize, SMatrix<f64, 2, 6>)>, SMatrix<f64, 2, 3>, Vector2<f64>, f64)> =
        Vec::new();
    let mut error = 0.0;

    for (target, observations) in targets {
        let same_image = *target == host;

        let (t_t_h_cur, d_rel_d_h, d_rel_d_t) = if same_image {
            // Host and target are the same image: the residual only depends
            // on the landmark.
            (SE3::identity(), Matrix6::zeros(), Matrix6::zeros())
        } else {
            let (_, d_rel_d_h, d_rel_d_t) = compute_rel_pose(
                &pose_lin(host.frame_id),
                &calib.t_i_c[host.cam_id],
                &pose_lin(target.frame_id),
                &calib.t_i_c[target.cam_id],
            );
            let (t_t_h_cur, _, _) = compute_rel_pose(
                &pose_cur(host.frame_id),
                &calib.t_i_c[host.cam_id],
                &pose_cur(target.frame_id),
                &calib.t_i_c[target.cam_id],
            );
            (t_t_h_cur, d_rel_d_h, d_rel_d_t)
        };

        let cam = &calib.intrinsics[target.cam_id];

        for obs in observations {
            let landmark = lmdb.get_landmark(obs.kpt_id);
            let Some(pl) = linearize_point(&obs.pos, landmark, &t_t_h_cur, cam) else {
                continue;
            };

            let e = pl.res.norm();
            let hw = huber_weight(e, huber_thresh);
            let w = hw * obs_weight;
            error += 0.5 * (2.0 - hw) * obs_weight * hw * e * e;

            let mut pose_jacs: Vec<(usize, SMatrix<f64, 2, 6>)> = Vec::new();
            if !same_image {
                let host_idx = HostLinData::block_index(&mut frame_ids, host.frame_id);
                let target_idx = HostLinData::block_index(&mut frame_ids, target.frame_id);

                let j_h = pl.d_res_d_xi * d_rel_d_h;
                let j_t = pl.d_res_d_xi * d_rel_d_t;
                if host_idx == target_idx {
                    pose_jacs.push((host_idx, j_h + j_t));
                } else {
                    pose_jacs.push((host_idx, j_h));
                    pose_jacs.push((target_idx, j_t));
                }
            }

            contribs.push((obs.kpt_id, pose_jacs, pl.d_res_d_p, pl.res, w));
        }
    }

    let nb = frame_ids.len();
    let mut h_pp = DMatrix::zeros(nb * POSE_SIZE, nb * POSE_SIZE);
    let mut b_p = DVector::zeros(nb * POSE_SIZE);

    for (kpt_id, pose_jacs, j_l, res, w) in contribs {
        let blocks = landmarks.entry(kpt_id).or_insert_with(LandmarkBlocks::new);
        blocks.h_ll += w * j_l.transpose() * j_l;
        blocks.b_l += w * j_l.transpose() * res;

        for (bi, j_i) in &pose_jacs {
            let h_pl = blocks
                .h_pl
                .entry(*bi)
                .or_insert_with(SMatrix::<f64, 6, 3>::zeros);
            *h_pl += w * j_i.transpose() * j_l;

            let mut b_seg = b_p.rows_mut(bi * POSE_SIZE, POSE_SIZE);
            b_seg += w * j_i.transpose() * res;

            for (bj, j_j) in &pose_jacs {
                let mut h_block =
                    h_pp.view_mut((bi * POSE_SIZE, bj * POSE_SIZE), (POSE_SIZE, POSE_SIZE));
                h_block += w * j_i.transpose() * j_j;
            }
        }
    }

    HostLinData {
        host,
        frame_ids,
        h_pp,
        b_p,
        landmarks,
        error,
    }
}

/// Residual-only pass over the full observation table.
///
/// When `outliers` is provided, observations whose residual norm exceeds
/// `outlier_threshold` (or that fail to project) are collected for the
/// filtering step.
#[allow(clippy::too_many_arguments)]
pub fn compute_error(
    lmdb: &LandmarkDatabase,
    calib: &Calibration,
    pose_cur: PoseLookup,
    obs_std_dev: f64,
    huber_thresh: f64,
    mut outliers: Option<&mut Vec<(KeypointId, FrameCamId)>>,
    outlier_threshold: f64,
) -> f64 {
    let obs_weight = 1.0 / (obs_std_dev * obs_std_dev);
    let mut error = 0.0;

    for (host, targets) in lmdb.observations() {
        for (target, observations) in targets {
            let t_t_h = if target == host {
                SE3::identity()
            } else {
                let (t_t_h, _, _) = compute_rel_pose(
                    &pose_cur(host.frame_id),
                    &calib.t_i_c[host.cam_id],
                    &pose_cur(target.frame_id),
                    &calib.t_i_c[target.cam_id],
                );
                t_t_h
            };

            let cam = &calib.intrinsics[target.cam_id];
            for obs in observations {
                let landmark = lmdb.get_landmark(obs.kpt_id);
                match linearize_point(&obs.pos, landmark, &t_t_h, cam) {
                    Some(pl) => {
                        let e = pl.res.norm();
                        let hw = huber_weight(e, huber_thresh);
                        error += 0.5 * (2.0 - hw) * obs_weight * hw * e * e;

                        if let Some(out) = outliers.as_mut() {
                            if e > outlier_threshold {
                                out.push((obs.kpt_id, *target));
                            }
                        }
                    }
                    None => {
                        if let Some(out) = outliers.as_mut() {
                            out.push((obs.kpt_id, *target));
                        }
                    }
                }
            }
        }
    }

    error
}

/// Reprojections of all landmarks into the cameras of `target_frame`, as
/// `[u, v, target-frame inverse depth, keypoint id]` per camera.
pub fn compute_projections(
    lmdb: &LandmarkDatabase,
    calib: &Calibration,
    pose_cur: PoseLookup,
    target_frame: i64,
) -> Vec<Vec<Vector4<f64>>> {
    let mut projections = vec![Vec::new(); calib.intrinsics.len()];

    for (host, targets) in lmdb.observations() {
        for (target, observations) in targets {
            if target.frame_id != target_frame {
                continue;
            }

            let t_t_h = if target == host {
                SE3::identity()
            } else {
                let (t_t_h, _, _) = compute_rel_pose(
                    &pose_cur(host.frame_id),
                    &calib.t_i_c[host.cam_id],
                    &pose_cur(target.frame_id),
                    &calib.t_i_c[target.cam_id],
                );
                t_t_h
            };

            let cam = &calib.intrinsics[target.cam_id];
            for obs in observations {
                let landmark = lmdb.get_landmark(obs.kpt_id);
                if let Some(pl) = linearize_point(&obs.pos, landmark, &t_t_h, cam) {
                    let mut proj = pl.proj;
                    proj[3] = obs.kpt_id as f64;
                    projections[target.cam_id].push(proj);
                }
            }
        }
    }

    projections
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn test_calib() -> Calibration {
        Calibration::synthetic_stereo()
    }

    fn poses() -> BTreeMap<i64, SE3> {
        let mut map = BTreeMap::new();
        map.insert(0, SE3::identity());
        map.insert(
            100,
            SE3::new(
                UnitQuaternion::from_euler_angles(0.01, -0.02, 0.03),
                Vector3::new(0.15, -0.05, 0.1),
            ),
        );
        map
    }

    fn landmarks_seen_everywhere(
        calib: &Calibration,
        poses: &BTreeMap<i64, SE3>,
    ) -> LandmarkDatabase {
        // A small cloud a couple of meters ahead of the host camera.
        let cloud = [
            Vector3::new(0.2, -0.1, 2.0),
            Vector3::new(-0.4, 0.3, 2.5),
            Vector3::new(0.6, 0.5, 3.0),
            Vector3::new(-0.2, -0.6, 2.2),
            Vector3::new(0.0, 0.1, 2.8),
            Vector3::new(0.5, -0.4, 3.4),
        ];
        let host = FrameCamId::new(0, 0);
        let host_cam_pose = poses[&0].compose(&calib.t_i_c[0]);

        let mut db = LandmarkDatabase::new();
        for (kpt_id, p_world) in cloud.iter().enumerate() {
            let kpt_id = kpt_id as u64;
            let p_host = host_cam_pose.inverse().transform_point(p_world);
            let bearing = p_host.normalize();

            db.add_landmark(
                kpt_id,
                Landmark {
                    host,
                    dir: stereographic::project(&Vector4::new(
                        bearing.x, bearing.y, bearing.z, 0.0,
                    )),
                    inv_depth: 1.0 / p_host.norm(),
                },
            );

            for (&frame, pose) in poses {
                for cam_id in 0..calib.intrinsics.len() {
                    let cam_pose = pose.compose(&calib.t_i_c[cam_id]);
                    let p_cam = cam_pose.inverse().transform_point(p_world);
                    let uv = calib.intrinsics[cam_id]
                        .project(&Vector4::new(p_cam.x, p_cam.y, p_cam.z, 0.0))
                        .unwrap();
                    db.add_observation(
                        FrameCamId::new(frame, cam_id),
                        KeypointObservation { kpt_id, pos: uv },
                    );
                }
            }
        }

        db
    }

    #[test]
    fn test_perfect_observations_have_zero_residual() {
        let calib = test_calib();
        let poses = poses();
        let db = landmarks_seen_everywhere(&calib, &poses);

        let lookup = |t: i64| poses[&t].clone();
        let error = compute_error(&db, &calib, &lookup, 0.5, 1.0, None, 3.0);

        assert!(error < 1e-16, "error on perfect data: {}", error);
    }

    #[test]
    fn test_negative_inverse_depth_alone_is_not_flagged() {
        // Outlier collection goes by residual norm only: a landmark whose
        // inverse depth went negative mid-optimization but whose residuals
        // are under the threshold must survive the filtering pass.
        let calib = test_calib();
        let poses = poses();
        let lookup = |t: i64| poses[&t].clone();

        let host = FrameCamId::new(0, 0);
        let mut db = LandmarkDatabase::new();
        db.add_landmark(
            9,
            Landmark {
                host,
                dir: Vector2::new(0.02, -0.01),
                inv_depth: -0.05,
            },
        );

        // Observations placed exactly at the reprojections of the current
        // (negative-depth) parameterization, so every residual is zero.
        for &frame in poses.keys() {
            for cam_id in 0..calib.intrinsics.len() {
                let target = FrameCamId::new(frame, cam_id);
                let t_t_h = if target == host {
                    SE3::identity()
                } else {
                    let (t_t_h, _, _) = compute_rel_pose(
                        &lookup(host.frame_id),
                        &calib.t_i_c[host.cam_id],
                        &lookup(target.frame_id),
                        &calib.t_i_c[target.cam_id],
                    );
                    t_t_h
                };
                let p_t = t_t_h.transform_homogeneous(&db.get_landmark(9).position_homogeneous());
                let uv = calib.intrinsics[cam_id]
                    .project(&p_t)
                    .expect("bearing stays in front of every camera");
                db.add_observation(target, KeypointObservation { kpt_id: 9, pos: uv });
            }
        }

        let mut flagged = Vec::new();
        compute_error(&db, &calib, &lookup, 0.5, 1.0, Some(&mut flagged), 3.0);
        assert!(
            flagged.is_empty(),
            "sub-threshold observations flagged: {:?}",
            flagged
        );

        // A genuinely large residual on the same landmark is still caught.
        db.add_observation(
            FrameCamId::new(100, 0),
            KeypointObservation {
                kpt_id: 9,
                pos: Vector2::new(-500.0, -500.0),
            },
        );
        let mut flagged = Vec::new();
        compute_error(&db, &calib, &lookup, 0.5, 1.0, Some(&mut flagged), 3.0);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].0, 9);
    }

    #[test]
    fn test_rel_pose_jacobians_match_central_differences() {
        let calib = test_calib();
        let poses = poses();

        let t_w_h = poses[&0].clone();
        let t_w_t = poses[&100].clone();
        let (t_t_h, d_rel_d_h, d_rel_d_t) =
            compute_rel_pose(&t_w_h, &calib.t_i_c[0], &t_w_t, &calib.t_i_c[1]);

        // Compare through the action on a fixed homogeneous point.
        let p = Vector4::new(0.1, -0.2, 1.0, 0.4);
        let eps = 1e-7;

        for col in 0..6 {
            let mut inc = nalgebra::Vector6::<f64>::zeros();
            inc[col] = eps;

            let mut h_plus = t_w_h.clone();
            h_plus.apply_inc(&inc);
            let mut h_minus = t_w_h.clone();
            h_minus.apply_inc(&(-inc));
            let (t_plus, _, _) = compute_rel_pose(&h_plus, &calib.t_i_c[0], &t_w_t, &calib.t_i_c[1]);
            let (t_minus, _, _) =
                compute_rel_pose(&h_minus, &calib.t_i_c[0], &t_w_t, &calib.t_i_c[1]);

            let num = (t_plus.transform_homogeneous(&p) - t_minus.transform_homogeneous(&p))
                / (2.0 * eps);

            // Analytic: δ(T p) = [ρ I | -[p_t]×] · (d_rel_d_h · inc)
            let p_t = t_t_h.transform_homogeneous(&p);
            let mut lift = SMatrix::<f64, 3, 6>::zeros();
            lift.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(Matrix3::identity() * p[3]));
            lift.fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-skew(&p_t.fixed_rows::<3>(0).into_owned())));
            let analytic = lift * d_rel_d_h.column(col);

            for row in 0..3 {
                assert_relative_eq!(analytic[row], num[row], epsilon = 1e-5);
            }

            // Same check for the target-side Jacobian.
            let mut t_plus_pose = t_w_t.clone();
            t_plus_pose.apply_inc(&inc);
            let mut t_minus_pose = t_w_t.clone();
            t_minus_pose.apply_inc(&(-inc));
            let (tt_plus, _, _) =
                compute_rel_pose(&t_w_h, &calib.t_i_c[0], &t_plus_pose, &calib.t_i_c[1]);
            let (tt_minus, _, _) =
                compute_rel_pose(&t_w_h, &calib.t_i_c[0], &t_minus_pose, &calib.t_i_c[1]);

            let num_t = (tt_plus.transform_homogeneous(&p) - tt_minus.transform_homogeneous(&p))
                / (2.0 * eps);
            let analytic_t = lift * d_rel_d_t.column(col);

            for row in 0..3 {
                assert_relative_eq!(analytic_t[row], num_t[row], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_host_block_gauss_newton_step_reduces_error() {
        let calib = test_calib();
        let mut poses = poses();
        let mut db = landmarks_seen_everywhere(&calib, &poses);

        // Perturb the target pose so there is something to correct.
        let true_poses = poses.clone();
        poses.get_mut(&100).unwrap().translation += Vector3::new(0.02, -0.01, 0.015);

        let lookup = |t: i64| poses[&t].clone();
        let before = compute_error(&db, &calib, &lookup, 0.5, 1e9, None, 1e9);

        let mut ordering = StateOrdering::new();
        ordering.push_pose(0);
        ordering.push_pose(100);

        let host = FrameCamId::new(0, 0);
        let mut rld = linearize_host_block(
            host,
            db.observations().get(&host).unwrap(),
            &db,
            &calib,
            &lookup,
            &lookup,
            0.5,
            1e9,
        );
        rld.invert_landmark_hessians();

        let mut accum = DenseAccumulator::new(ordering.total_size);
        rld.add_to_system(&ordering, &mut accum);

        // Anchor the host pose with a strong prior so the gauge is fixed.
        let anchor = DMatrix::<f64>::identity(6, 6) * 1e8;
        accum.add_h(0, 0, &anchor);

        let damping = DVector::from_element(ordering.total_size, 1e-9);
        let inc = accum.solve(Some(&damping)).unwrap();

        let mut updated = poses.clone();
        {
            let pose = updated.get_mut(&100).unwrap();
            let (idx, _) = ordering.block(100);
            let seg: nalgebra::Vector6<f64> = inc.fixed_rows::<6>(idx).into_owned();
            pose.apply_inc(&(-seg));
        }
        rld.update_landmarks(&ordering, &inc, &mut db);

        let lookup_after = |t: i64| updated[&t].clone();
        let after = compute_error(&db, &calib, &lookup_after, 0.5, 1e9, None, 1e9);

        assert!(
            after < before * 0.1,
            "gauss-newton step barely helped: before {} after {}",
            before,
            after
        );

        // And the corrected pose should move towards the truth.
        let err_before = (poses[&100].translation - true_poses[&100].translation).norm();
        let err_after = (updated[&100].translation - true_poses[&100].translation).norm();
        assert!(err_after < err_before);
    }
}
