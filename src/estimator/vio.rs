//! The sliding-window estimator: per-frame measurement fusion, the damped
//! iterative refinement, and the marginalization engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3, Vector6};
use tracing::debug;

use crate::calib::Calibration;
use crate::config::VioConfig;
use crate::estimator::state::{PoseStateWithLin, PoseVelBiasStateWithLin};
use crate::geometry::{stereographic, triangulate, SE3};
use crate::imu::types::Vector15;
use crate::imu::{ImuData, PreintegratedImu};
use crate::map::{FrameCamId, KeypointId, KeypointObservation, Landmark, LandmarkDatabase};
use crate::optimizer::vision::HostLinData;
use crate::optimizer::{imu_factors, prior, vision, DenseAccumulator, StateOrdering};
use crate::system::messages::{MargData, OpticalFlowResult, StateSnapshot, VisualizationData};
use crate::{POSE_SIZE, POSE_VEL_BIAS_SIZE};

/// Increment infinity-norm below which an iteration counts as converged.
const CONVERGENCE_EPS: f64 = 1e-4;

/// Minimum surviving observations for a landmark to outlive filtering.
const MIN_OBS_AFTER_FILTER: usize = 4;

/// Inner accept/reject trials per Levenberg-Marquardt iteration.
const MAX_LM_TRIALS: usize = 10;

/// Snapshot of everything a rejected step has to roll back.
struct WindowBackup {
    frame_poses: BTreeMap<i64, PoseStateWithLin>,
    frame_states: BTreeMap<i64, PoseVelBiasStateWithLin>,
    landmarks: Vec<(KeypointId, nalgebra::Vector2<f64>, f64)>,
}

/// Sliding-window visual-inertial estimator.
pub struct VioEstimator {
    calib: Calibration,
    config: VioConfig,

    frame_states: BTreeMap<i64, PoseVelBiasStateWithLin>,
    frame_poses: BTreeMap<i64, PoseStateWithLin>,
    imu_meas: BTreeMap<i64, PreintegratedImu>,
    lmdb: LandmarkDatabase,
    kf_ids: BTreeSet<i64>,
    num_points_kf: BTreeMap<i64, usize>,
    prev_opt_flow_res: BTreeMap<i64, Arc<OpticalFlowResult>>,

    take_kf: bool,
    frames_after_kf: usize,
    last_state_t_ns: i64,
    initialized: bool,
    opt_started: bool,

    lambda: f64,
    min_lambda: f64,
    max_lambda: f64,
    lambda_vee: f64,

    marg_h: DMatrix<f64>,
    marg_b: DVector<f64>,
    marg_order: StateOrdering,

    gyro_bias_weight: Vector3<f64>,
    accel_bias_weight: Vector3<f64>,

    init_bg: Vector3<f64>,
    init_ba: Vector3<f64>,

    pending_marg_data: Option<MargData>,
}

impl VioEstimator {
    pub fn new(calib: Calibration, config: VioConfig) -> Self {
        // Initial prior: position and yaw pinned, roll/pitch observable
        // through gravity, biases weakly held near zero.
        let mut marg_h = DMatrix::zeros(POSE_VEL_BIAS_SIZE, POSE_VEL_BIAS_SIZE);
        for i in 0..3 {
            marg_h[(i, i)] = config.vio_init_pose_weight;
        }
        marg_h[(5, 5)] = config.vio_init_pose_weight;
        for i in 9..12 {
            marg_h[(i, i)] = config.vio_init_ba_weight;
        }
        for i in 12..15 {
            marg_h[(i, i)] = config.vio_init_bg_weight;
        }

        let gyro_bias_weight = calib.gyro_bias_std.map(|s| 1.0 / (s * s));
        let accel_bias_weight = calib.accel_bias_std.map(|s| 1.0 / (s * s));

        Self {
            lambda: config.vio_lm_lambda_min,
            min_lambda: config.vio_lm_lambda_min,
            max_lambda: config.vio_lm_lambda_max,
            lambda_vee: 2.0,
            frame_states: BTreeMap::new(),
            frame_poses: BTreeMap::new(),
            imu_meas: BTreeMap::new(),
            lmdb: LandmarkDatabase::new(),
            kf_ids: BTreeSet::new(),
            num_points_kf: BTreeMap::new(),
            prev_opt_flow_res: BTreeMap::new(),
            take_kf: true,
            frames_after_kf: 0,
            last_state_t_ns: 0,
            initialized: false,
            opt_started: false,
            marg_h,
            marg_b: DVector::zeros(POSE_VEL_BIAS_SIZE),
            marg_order: StateOrdering::new(),
            gyro_bias_weight,
            accel_bias_weight,
            init_bg: Vector3::zeros(),
            init_ba: Vector3::zeros(),
            pending_marg_data: None,
            calib,
            config,
        }
    }

    /// Biases to seed the first state with (zero unless calibrated values
    /// are known up front).
    pub fn set_initial_biases(&mut self, bg: Vector3<f64>, ba: Vector3<f64>) {
        self.init_bg = bg;
        self.init_ba = ba;
    }

    /// Seed the window from a known state instead of the gravity-alignment
    /// path.
    pub fn initialize_at(
        &mut self,
        t_ns: i64,
        t_w_i: SE3,
        vel_w_i: Vector3<f64>,
        bg: Vector3<f64>,
        ba: Vector3<f64>,
    ) {
        self.initialized = true;
        self.last_state_t_ns = t_ns;

        self.imu_meas.insert(t_ns, PreintegratedImu::new(t_ns, bg, ba));
        self.frame_states.insert(
            t_ns,
            PoseVelBiasStateWithLin::new(t_ns, t_w_i, vel_w_i, bg, ba, true),
        );

        self.marg_order = StateOrdering::new();
        self.marg_order.push_state(t_ns);

        debug!(t_ns, "window seeded");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_state_t_ns(&self) -> i64 {
        self.last_state_t_ns
    }

    pub fn frame_states(&self) -> &BTreeMap<i64, PoseVelBiasStateWithLin> {
        &self.frame_states
    }

    pub fn frame_poses(&self) -> &BTreeMap<i64, PoseStateWithLin> {
        &self.frame_poses
    }

    pub fn kf_ids(&self) -> &BTreeSet<i64> {
        &self.kf_ids
    }

    pub fn landmark_db(&self) -> &LandmarkDatabase {
        &self.lmdb
    }

    pub fn marg_order(&self) -> &StateOrdering {
        &self.marg_order
    }

    pub fn marg_prior(&self) -> (&DMatrix<f64>, &DVector<f64>) {
        (&self.marg_h, &self.marg_b)
    }

    /// Current pose of a live frame, wherever it is stored.
    fn pose_of(&self, t_ns: i64) -> SE3 {
        if let Some(pose) = self.frame_poses.get(&t_ns) {
            pose.pose().clone()
        } else if let Some(state) = self.frame_states.get(&t_ns) {
            state.state().t_w_i.clone()
        } else {
            panic!("frame {} not in window", t_ns)
        }
    }

    /// Linearization-point pose of a live frame.
    fn pose_lin_of(&self, t_ns: i64) -> SE3 {
        if let Some(pose) = self.frame_poses.get(&t_ns) {
            pose.pose_lin().clone()
        } else if let Some(state) = self.frame_states.get(&t_ns) {
            state.state_lin().t_w_i.clone()
        } else {
            panic!("frame {} not in window", t_ns)
        }
    }

    /// Run the full per-frame pipeline.
    ///
    /// `samples` are the IMU samples in `(previous frame, frame]`;
    /// `straddling` is the first sample past the frame timestamp, used to
    /// close the interval when no sample lands on the boundary.
    pub fn process_frame(
        &mut self,
        frame: Arc<OpticalFlowResult>,
        samples: &[ImuData],
        straddling: Option<&ImuData>,
    ) {
        if !self.initialized {
            let align_sample = straddling
                .or_else(|| samples.last())
                .expect("IMU data must be available before the first frame");

            // World frame: gravity along -z, so the measured specific force
            // maps onto +z.
            let rotation = UnitQuaternion::rotation_between(&align_sample.accel, &Vector3::z())
                .unwrap_or_else(|| {
                    UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
                });

            let (bg, ba) = (self.init_bg, self.init_ba);
            self.initialize_at(
                frame.t_ns,
                SE3::new(rotation, Vector3::zeros()),
                Vector3::zeros(),
                bg,
                ba,
            );
        } else if frame.t_ns > self.last_state_t_ns {
            let last_state = self.frame_states[&self.last_state_t_ns].state().clone();

            let accel_cov = self
                .calib
                .discrete_time_accel_noise_std()
                .map(|s| s * s);
            let gyro_cov = self.calib.discrete_time_gyro_noise_std().map(|s| s * s);

            let mut meas = PreintegratedImu::new(
                self.last_state_t_ns,
                last_state.bias_gyro,
                last_state.bias_accel,
            );
            for sample in samples {
                if sample.t_ns <= meas.end_t_ns() || sample.t_ns > frame.t_ns {
                    continue;
                }
                meas.integrate(sample, &accel_cov, &gyro_cov);
            }

            // No sample landed on the frame boundary: repeat the straddling
            // (or last) sample re-stamped to the frame timestamp.
            if meas.end_t_ns() < frame.t_ns {
                let closing = straddling
                    .or_else(|| samples.last())
                    .expect("cannot close IMU interval without samples");
                let mut shifted = *closing;
                shifted.t_ns = frame.t_ns;
                meas.integrate(&shifted, &accel_cov, &gyro_cov);
            }

            assert_eq!(
                meas.start_t_ns(),
                self.last_state_t_ns,
                "pre-integration start must match the previous state"
            );
            assert_eq!(
                meas.end_t_ns(),
                frame.t_ns,
                "pre-integration must end at the frame timestamp"
            );

            let predicted = meas.predict_state(&last_state.pose_vel(), &self.calib.g);
            self.last_state_t_ns = frame.t_ns;
            self.frame_states.insert(
                frame.t_ns,
                PoseVelBiasStateWithLin::new(
                    frame.t_ns,
                    predicted.t_w_i,
                    predicted.vel_w_i,
                    last_state.bias_gyro,
                    last_state.bias_accel,
                    false,
                ),
            );
            self.imu_meas.insert(meas.start_t_ns(), meas);
        }

        self.prev_opt_flow_res.insert(frame.t_ns, frame.clone());

        // Data association: connect tracked keypoints to the landmark
        // database, collect fresh camera-0 tracks.
        let mut connected0 = 0usize;
        let mut num_points_connected: BTreeMap<i64, usize> = BTreeMap::new();
        let mut unconnected_obs0: BTreeSet<KeypointId> = BTreeSet::new();

        for (cam_id, cam_obs) in frame.observations.iter().enumerate() {
            let tcid_target = FrameCamId::new(frame.t_ns, cam_id);
            for (&kpt_id, &pos) in cam_obs {
                if self.lmdb.landmark_exists(kpt_id) {
                    let host_frame = self.lmdb.get_landmark(kpt_id).host.frame_id;
                    self.lmdb
                        .add_observation(tcid_target, KeypointObservation { kpt_id, pos });
                    *num_points_connected.entry(host_frame).or_insert(0) += 1;
                    if cam_id == 0 {
                        connected0 += 1;
                    }
                } else if cam_id == 0 {
                    unconnected_obs0.insert(kpt_id);
                }
            }
        }

        let connected_ratio = connected0 as f64 / (connected0 + unconnected_obs0.len()) as f64;
        if connected_ratio < self.config.vio_new_kf_keypoints_thresh
            && self.frames_after_kf > self.config.vio_min_frames_after_kf
        {
            self.take_kf = true;
        }

        if self.config.vio_debug {
            debug!(
                connected0,
                unconnected0 = unconnected_obs0.len(),
                take_kf = self.take_kf,
                "data association"
            );
        }

        if self.take_kf {
            self.take_kf = false;
            self.frames_after_kf = 0;
            self.kf_ids.insert(self.last_state_t_ns);

            let num_points_added = self.triangulate_new_landmarks(&frame, &unconnected_obs0);
            self.num_points_kf.insert(frame.t_ns, num_points_added);

            debug!(
                t_ns = frame.t_ns,
                num_points_added,
                total_landmarks = self.lmdb.num_landmarks(),
                "keyframe taken"
            );
        } else {
            self.frames_after_kf += 1;
        }

        self.optimize();
        self.marginalize(&num_points_connected);
    }

    /// Triangulate fresh camera-0 tracks against any earlier view with
    /// enough baseline; accept finite points with inverse depth in (0, 3).
    fn triangulate_new_landmarks(
        &mut self,
        frame: &OpticalFlowResult,
        unconnected_obs0: &BTreeSet<KeypointId>,
    ) -> usize {
        let tcidl = FrameCamId::new(frame.t_ns, 0);
        let min_dist2 =
            self.config.vio_min_triangulation_dist * self.config.vio_min_triangulation_dist;
        let mut num_points_added = 0;

        for &lm_id in unconnected_obs0 {
            // All recorded views of this track, over the cached flow results.
            let mut kp_obs: BTreeMap<FrameCamId, KeypointObservation> = BTreeMap::new();
            for (&f_t, res) in &self.prev_opt_flow_res {
                for (cam_id, cam_obs) in res.observations.iter().enumerate() {
                    if let Some(&pos) = cam_obs.get(&lm_id) {
                        kp_obs.insert(
                            FrameCamId::new(f_t, cam_id),
                            KeypointObservation { kpt_id: lm_id, pos },
                        );
                    }
                }
            }

            let p0_px = frame.observations[0][&lm_id];
            let mut valid_kp = false;

            for tcido in kp_obs.keys() {
                if valid_kp {
                    break;
                }

                let p1_px = self.prev_opt_flow_res[&tcido.frame_id].observations[tcido.cam_id]
                    [&lm_id];

                let Some(p0_3d) = self.calib.intrinsics[0].unproject(&p0_px) else {
                    continue;
                };
                let Some(p1_3d) = self.calib.intrinsics[tcido.cam_id].unproject(&p1_px) else {
                    continue;
                };

                let t_i0_i1 = self
                    .pose_of(tcidl.frame_id)
                    .inverse()
                    .compose(&self.pose_of(tcido.frame_id));
                let t_0_1 = self.calib.t_i_c[0]
                    .inverse()
                    .compose(&t_i0_i1)
                    .compose(&self.calib.t_i_c[tcido.cam_id]);

                if t_0_1.translation.norm_squared() < min_dist2 {
                    continue;
                }

                let p0_triangulated = triangulate(
                    &p0_3d.fixed_rows::<3>(0).into_owned(),
                    &p1_3d.fixed_rows::<3>(0).into_owned(),
                    &t_0_1,
                );

                if p0_triangulated.iter().all(|v| v.is_finite())
                    && p0_triangulated[3] > 0.0
                    && p0_triangulated[3] < 3.0
                {
                    self.lmdb.add_landmark(
                        lm_id,
                        Landmark {
                            host: tcidl,
                            dir: stereographic::project(&p0_triangulated),
                            inv_depth: p0_triangulated[3],
                        },
                    );
                    num_points_added += 1;
                    valid_kp = true;
                }
            }

            if valid_kp {
                for (tcido, obs) in kp_obs {
                    self.lmdb.add_observation(tcido, obs);
                }
            }
        }

        num_points_added
    }

    fn build_ordering(&self) -> StateOrdering {
        let mut aom = StateOrdering::new();

        for &t_ns in self.frame_poses.keys() {
            aom.push_pose(t_ns);
            assert_eq!(
                self.marg_order.block(t_ns),
                aom.block(t_ns),
                "keyframe {} ordered differently than in the prior",
                t_ns
            );
        }

        for &t_ns in self.frame_states.keys() {
            let covered_by_prior = aom.items < self.marg_order.items;
            aom.push_state(t_ns);
            if covered_by_prior {
                assert_eq!(
                    self.marg_order.block(t_ns),
                    aom.block(t_ns),
                    "state {} ordered differently than in the prior",
                    t_ns
                );
            }
        }

        aom
    }

    fn backup(&self) -> WindowBackup {
        WindowBackup {
            frame_poses: self.frame_poses.clone(),
            frame_states: self.frame_states.clone(),
            landmarks: self
                .lmdb
                .landmarks()
                .map(|(&id, lm)| (id, lm.dir, lm.inv_depth))
                .collect(),
        }
    }

    fn restore(&mut self, backup: WindowBackup) {
        self.frame_poses = backup.frame_poses;
        self.frame_states = backup.frame_states;
        for (id, dir, inv_depth) in backup.landmarks {
            let lm = self.lmdb.get_landmark_mut(id);
            lm.dir = dir;
            lm.inv_depth = inv_depth;
        }
    }

    fn apply_increment(&mut self, aom: &StateOrdering, inc: &DVector<f64>, rld_vec: &[HostLinData]) {
        for (t_ns, pose) in self.frame_poses.iter_mut() {
            let (idx, _) = aom.block(*t_ns);
            let seg: Vector6<f64> = inc.fixed_rows::<6>(idx).into_owned();
            pose.apply_inc(&(-seg));
        }
        for (t_ns, state) in self.frame_states.iter_mut() {
            let (idx, _) = aom.block(*t_ns);
            let seg: Vector15 = inc.fixed_rows::<15>(idx).into_owned();
            state.apply_inc(&(-seg));
        }
        for rld in rld_vec {
            rld.update_landmarks(aom, inc, &mut self.lmdb);
        }
    }

    fn compute_total_error(&self, aom: &StateOrdering) -> f64 {
        let pose_cur = |t: i64| self.pose_of(t);
        let vision_error = vision::compute_error(
            &self.lmdb,
            &self.calib,
            &pose_cur,
            self.config.vio_obs_std_dev,
            self.config.vio_obs_huber_thresh,
            None,
            f64::INFINITY,
        );
        let imu_error = imu_factors::compute_imu_error(
            aom,
            &self.frame_states,
            &self.imu_meas,
            &self.gyro_bias_weight,
            &self.accel_bias_weight,
            &self.calib.g,
        );
        let marg_error = prior::compute_marg_prior_error(
            &self.marg_order,
            &self.marg_h,
            &self.marg_b,
            &self.frame_states,
            &self.frame_poses,
        );
        vision_error + imu_error.total() + marg_error
    }

    /// Drop observations whose reprojection residual exceeds `threshold`;
    /// landmarks left with too few observations are deleted outright.
    fn filter_outliers(&mut self, threshold: f64, min_obs: usize) {
        let mut flagged: Vec<(KeypointId, FrameCamId)> = Vec::new();
        {
            let pose_cur = |t: i64| self.pose_of(t);
            vision::compute_error(
                &self.lmdb,
                &self.calib,
                &pose_cur,
                self.config.vio_obs_std_dev,
                self.config.vio_obs_huber_thresh,
                Some(&mut flagged),
                threshold,
            );
        }

        let mut by_landmark: BTreeMap<KeypointId, Vec<FrameCamId>> = BTreeMap::new();
        for (id, target) in flagged {
            by_landmark.entry(id).or_default().push(target);
        }

        for (id, targets) in by_landmark {
            let num_obs = self.lmdb.num_observations(id);
            if num_obs.saturating_sub(targets.len()) < min_obs {
                debug!(id, num_obs, outliers = targets.len(), "dropping landmark");
                self.lmdb.remove_landmark(id);
            } else {
                for target in targets {
                    self.lmdb.remove_observation(id, target);
                }
            }
        }
    }

    /// Iterative refinement of all window variables (§ optimizer driver).
    pub fn optimize(&mut self) {
        if !self.opt_started && self.frame_states.len() <= 4 {
            return;
        }
        self.opt_started = true;

        let aom = self.build_ordering();

        for iter in 0..self.config.vio_max_iterations {
            // Linearize vision, IMU and the prior into H, b.
            let (mut rld_vec, vision_error) = {
                let pose_lin = |t: i64| self.pose_lin_of(t);
                let pose_cur = |t: i64| self.pose_of(t);

                let mut rld_vec: Vec<HostLinData> = Vec::new();
                let mut vision_error = 0.0;
                for (host, targets) in self.lmdb.observations() {
                    let rld = vision::linearize_host_block(
                        *host,
                        targets,
                        &self.lmdb,
                        &self.calib,
                        &pose_lin,
                        &pose_cur,
                        self.config.vio_obs_std_dev,
                        self.config.vio_obs_huber_thresh,
                    );
                    vision_error += rld.error;
                    rld_vec.push(rld);
                }
                (rld_vec, vision_error)
            };

            let mut accum = DenseAccumulator::new(aom.total_size);
            for rld in &mut rld_vec {
                rld.invert_landmark_hessians();
            }
            for rld in &rld_vec {
                rld.add_to_system(&aom, &mut accum);
            }

            let imu_error = imu_factors::linearize_abs_imu(
                &aom,
                &mut accum,
                &self.frame_states,
                &self.imu_meas,
                &self.gyro_bias_weight,
                &self.accel_bias_weight,
                &self.calib.g,
            );
            let marg_error = prior::linearize_marg_prior(
                &self.marg_order,
                &self.marg_h,
                &self.marg_b,
                &aom,
                &mut accum,
                &self.frame_states,
                &self.frame_poses,
            );

            let error_total = vision_error + imu_error.total() + marg_error;
            if self.config.vio_debug {
                debug!(
                    iter,
                    vision_error,
                    imu_error = imu_error.imu,
                    bg_error = imu_error.bg,
                    ba_error = imu_error.ba,
                    marg_error,
                    error_total,
                    "linearized"
                );
            }

            let h_diag = accum.h_diagonal();
            let mut converged = false;

            if self.config.vio_use_lm {
                let mut step = false;
                let mut trials = MAX_LM_TRIALS;

                while !step && trials > 0 && !converged {
                    trials -= 1;

                    let mut damping = &h_diag * self.lambda;
                    for v in damping.iter_mut() {
                        *v = v.max(self.min_lambda);
                    }

                    let Some(inc) = accum.solve(Some(&damping)) else {
                        // Degenerate solve counts as a rejected step.
                        self.lambda = self.max_lambda.min(self.lambda_vee * self.lambda);
                        self.lambda_vee *= 2.0;
                        continue;
                    };

                    if inc.amax() < CONVERGENCE_EPS {
                        converged = true;
                    }

                    let backup = self.backup();
                    self.apply_increment(&aom, &inc, &rld_vec);
                    let error_after = self.compute_total_error(&aom);

                    if error_after <= error_total {
                        if self.config.vio_debug {
                            debug!(lambda = self.lambda, error_after, "step accepted");
                        }
                        self.lambda = self.min_lambda.max(self.lambda / 3.0);
                        self.lambda_vee = 2.0;
                        step = true;
                    } else {
                        if self.config.vio_debug {
                            debug!(lambda = self.lambda, error_after, "step rejected");
                        }
                        self.restore(backup);
                        self.lambda = self.max_lambda.min(self.lambda_vee * self.lambda);
                        self.lambda_vee *= 2.0;
                    }
                }
            } else {
                let mut damping = &h_diag * self.min_lambda;
                for v in damping.iter_mut() {
                    *v = v.max(self.min_lambda);
                }

                if let Some(inc) = accum.solve(Some(&damping)) {
                    if inc.amax() < CONVERGENCE_EPS {
                        converged = true;
                    }
                    self.apply_increment(&aom, &inc, &rld_vec);
                }
            }

            if iter == self.config.vio_filter_iteration {
                self.filter_outliers(self.config.vio_outlier_threshold, MIN_OBS_AFTER_FILTER);
            }

            if converged {
                if self.config.vio_debug {
                    debug!(iter, "converged");
                }
                break;
            }
        }
    }

    /// Window reduction (§ marginalization engine).
    pub fn marginalize(&mut self, num_points_connected: &BTreeMap<i64, usize>) {
        if !self.opt_started {
            return;
        }
        if self.frame_poses.len() <= self.config.vio_max_kfs
            && self.frame_states.len() < self.config.vio_max_states
        {
            return;
        }

        let states_to_remove =
            (self.frame_states.len() + 1).saturating_sub(self.config.vio_max_states);
        let last_state_to_marg = *self
            .frame_states
            .keys()
            .nth(states_to_remove)
            .expect("window must hold more states than are being removed");

        // Ordering over keyframe poses and the states up to and including
        // the last one to marginalize; newer states stay out of the event.
        let mut aom = StateOrdering::new();
        let mut poses_to_marg: BTreeSet<i64> = BTreeSet::new();

        for &t_ns in self.frame_poses.keys() {
            aom.push_pose(t_ns);
            if !self.kf_ids.contains(&t_ns) {
                poses_to_marg.insert(t_ns);
            }
            assert_eq!(
                self.marg_order.block(t_ns),
                aom.block(t_ns),
                "keyframe {} ordered differently than in the prior",
                t_ns
            );
        }

        let mut states_to_marg_vel_bias: BTreeSet<i64> = BTreeSet::new();
        let mut states_to_marg_all: BTreeSet<i64> = BTreeSet::new();

        for &t_ns in self.frame_states.keys() {
            if t_ns > last_state_to_marg {
                break;
            }
            if t_ns != last_state_to_marg {
                if self.kf_ids.contains(&t_ns) {
                    states_to_marg_vel_bias.insert(t_ns);
                } else {
                    states_to_marg_all.insert(t_ns);
                }
            }

            let covered_by_prior = aom.items < self.marg_order.items;
            aom.push_state(t_ns);
            if covered_by_prior {
                assert_eq!(
                    self.marg_order.block(t_ns),
                    aom.block(t_ns),
                    "state {} ordered differently than in the prior",
                    t_ns
                );
            }
        }

        // Keyframe culling: covisibility rule first, spatial fallback second.
        let kf_ids_all = self.kf_ids.clone();
        let mut kfs_to_marg: BTreeSet<i64> = BTreeSet::new();

        while self.kf_ids.len() > self.config.vio_max_kfs && !states_to_marg_vel_bias.is_empty() {
            let ids: Vec<i64> = self.kf_ids.iter().copied().collect();
            let mut id_to_marg: Option<i64> = None;

            // Keyframes sharing (almost) nothing with the current frame go
            // first; the two newest keyframes are never candidates.
            for &id in &ids[..ids.len() - 2] {
                let connected = num_points_connected.get(&id).copied().unwrap_or(0);
                let added = self.num_points_kf.get(&id).copied().unwrap_or(0);
                if connected == 0 || added == 0 || (connected as f64 / added as f64) < 0.05 {
                    id_to_marg = Some(id);
                    break;
                }
            }

            // Fallback: drop the keyframe that is close to many others and
            // far from the newest one.
            if id_to_marg.is_none() {
                let last_kf = *self.kf_ids.iter().next_back().unwrap();
                let t_last = self.pose_of(last_kf).translation;

                let mut min_score = f64::MAX;
                let mut min_score_id = None;

                for &id_i in &ids[..ids.len() - 2] {
                    let t_i = self.pose_of(id_i).translation;
                    let mut denom = 0.0;
                    for &id_j in &ids[..ids.len() - 2] {
                        let t_j = self.pose_of(id_j).translation;
                        denom += 1.0 / ((t_i - t_j).norm() + 1e-5);
                    }
                    let score = (t_i - t_last).norm().sqrt() * denom;
                    if score < min_score {
                        min_score = score;
                        min_score_id = Some(id_i);
                    }
                }

                id_to_marg = min_score_id;
            }

            let Some(id) = id_to_marg else { break };
            kfs_to_marg.insert(id);
            poses_to_marg.insert(id);
            self.kf_ids.remove(&id);
        }

        if self.config.vio_debug {
            debug!(
                states_to_remove,
                last_state_to_marg,
                poses_to_marg = poses_to_marg.len(),
                states_all = states_to_marg_all.len(),
                states_vel_bias = states_to_marg_vel_bias.len(),
                kfs_to_marg = kfs_to_marg.len(),
                "marginalizing"
            );
        }

        // Re-linearize the observations hosted by dropped keyframes whose
        // targets stay within the marginalized part of the window, so their
        // information survives in the prior.
        let mut accum = DenseAccumulator::new(aom.total_size);
        {
            let mut obs_to_lin: BTreeMap<FrameCamId, BTreeMap<FrameCamId, Vec<KeypointObservation>>> =
                BTreeMap::new();
            for (host, targets) in self.lmdb.observations() {
                if !kfs_to_marg.contains(&host.frame_id) {
                    continue;
                }
                for (target, observations) in targets {
                    if target.frame_id <= last_state_to_marg {
                        obs_to_lin
                            .entry(*host)
                            .or_default()
                            .insert(*target, observations.clone());
                    }
                }
            }

            let pose_lin = |t: i64| self.pose_lin_of(t);
            let pose_cur = |t: i64| self.pose_of(t);
            for (host, targets) in &obs_to_lin {
                let mut rld = vision::linearize_host_block(
                    *host,
                    targets,
                    &self.lmdb,
                    &self.calib,
                    &pose_lin,
                    &pose_cur,
                    self.config.vio_obs_std_dev,
                    self.config.vio_obs_huber_thresh,
                );
                rld.invert_landmark_hessians();
                rld.add_to_system(&aom, &mut accum);
            }
        }

        imu_factors::linearize_abs_imu(
            &aom,
            &mut accum,
            &self.frame_states,
            &self.imu_meas,
            &self.gyro_bias_weight,
            &self.accel_bias_weight,
            &self.calib.g,
        );
        prior::linearize_marg_prior(
            &self.marg_order,
            &self.marg_h,
            &self.marg_b,
            &aom,
            &mut accum,
            &self.frame_states,
            &self.frame_poses,
        );

        if !kfs_to_marg.is_empty() {
            self.pending_marg_data = Some(MargData {
                aom: aom.clone(),
                abs_h: accum.h().clone(),
                abs_b: accum.b().clone(),
                frame_poses: self.frame_poses.clone(),
                frame_states: self.frame_states.clone(),
                kfs_all: kf_ids_all.clone(),
                kfs_to_marg: kfs_to_marg.clone(),
                opt_flow_res: kf_ids_all
                    .iter()
                    .filter_map(|t| self.prev_opt_flow_res.get(t).cloned())
                    .collect(),
            });
        }

        // Classify every index of the ordering as kept or marginalized.
        let mut idx_to_keep: Vec<usize> = Vec::new();
        let mut idx_to_marg: Vec<usize> = Vec::new();

        for (&t_ns, &(start, size)) in &aom.abs_order_map {
            match size {
                POSE_SIZE => {
                    let bucket = if poses_to_marg.contains(&t_ns) {
                        &mut idx_to_marg
                    } else {
                        &mut idx_to_keep
                    };
                    bucket.extend(start..start + POSE_SIZE);
                }
                POSE_VEL_BIAS_SIZE => {
                    if states_to_marg_all.contains(&t_ns) {
                        idx_to_marg.extend(start..start + POSE_VEL_BIAS_SIZE);
                    } else if states_to_marg_vel_bias.contains(&t_ns) {
                        if poses_to_marg.contains(&t_ns) {
                            // Culled keyframe that never reached the pose
                            // window: the whole state leaves.
                            idx_to_marg.extend(start..start + POSE_VEL_BIAS_SIZE);
                        } else {
                            idx_to_keep.extend(start..start + POSE_SIZE);
                            idx_to_marg.extend(start + POSE_SIZE..start + POSE_VEL_BIAS_SIZE);
                        }
                    } else {
                        assert_eq!(
                            t_ns, last_state_to_marg,
                            "unclassified state {} in marginalization",
                            t_ns
                        );
                        idx_to_keep.extend(start..start + POSE_VEL_BIAS_SIZE);
                    }
                }
                other => panic!("invalid block size {}", other),
            }
        }

        let (marg_h_new, marg_b_new) =
            prior::marginalize_helper(accum.h(), accum.b(), &idx_to_keep, &idx_to_marg);

        {
            let state = self.frame_states.get_mut(&last_state_to_marg).unwrap();
            assert!(
                !state.is_linearized(),
                "state {} already linearized before marginalization",
                last_state_to_marg
            );
            state.set_lin_true();
        }

        for &t_ns in &states_to_marg_all {
            self.frame_states.remove(&t_ns);
            self.imu_meas.remove(&t_ns);
            self.prev_opt_flow_res.remove(&t_ns);
        }

        for &t_ns in &states_to_marg_vel_bias {
            let state = self.frame_states.remove(&t_ns).unwrap();
            self.frame_poses
                .insert(t_ns, PoseStateWithLin::from_state(&state));
            self.imu_meas.remove(&t_ns);
        }

        for &t_ns in &poses_to_marg {
            self.frame_poses.remove(&t_ns);
            self.prev_opt_flow_res.remove(&t_ns);
            self.num_points_kf.remove(&t_ns);
        }

        self.lmdb
            .remove_keyframes(&kfs_to_marg, &poses_to_marg, &states_to_marg_all);

        let mut marg_order_new = StateOrdering::new();
        for &t_ns in self.frame_poses.keys() {
            marg_order_new.push_pose(t_ns);
        }
        marg_order_new.push_state(last_state_to_marg);

        self.marg_h = marg_h_new;
        self.marg_b = marg_b_new;
        self.marg_order = marg_order_new;

        assert_eq!(
            self.marg_h.ncols(),
            self.marg_order.total_size,
            "prior size diverged from retained ordering"
        );

        // Rebase the prior onto the current deviation from the
        // linearization points so later optimizer updates stay consistent.
        let delta = prior::compute_delta(&self.marg_order, &self.frame_states, &self.frame_poses);
        self.marg_b -= &self.marg_h * delta;

        if self.config.vio_debug {
            let energies = self.check_marg_nullspace();
            debug!(?energies, "marginalization nullspace energies");
        }
    }

    /// Energies of the four expected gauge directions in the current prior.
    pub fn check_marg_nullspace(&self) -> [f64; 4] {
        prior::marg_nullspace_energies(
            &self.marg_h,
            &self.marg_order,
            &self.frame_states,
            &self.frame_poses,
        )
    }

    /// Estimate of the newest state, for the state output queue.
    pub fn state_snapshot(&self) -> StateSnapshot {
        let state = self.frame_states[&self.last_state_t_ns].state();
        StateSnapshot {
            t_ns: state.t_ns,
            t_w_i: state.t_w_i.clone(),
            vel_w_i: state.vel_w_i,
            bias_gyro: state.bias_gyro,
            bias_accel: state.bias_accel,
        }
    }

    /// Landmarks in world coordinates with their ids.
    pub fn current_points(&self) -> (Vec<Vector3<f64>>, Vec<KeypointId>) {
        let mut points = Vec::new();
        let mut ids = Vec::new();

        for (&id, lm) in self.lmdb.landmarks() {
            if lm.inv_depth <= 0.0 {
                continue;
            }
            let t_w_cam = self
                .pose_of(lm.host.frame_id)
                .compose(&self.calib.t_i_c[lm.host.cam_id]);
            let p_hom = lm.position_homogeneous();
            let p_cam = p_hom.fixed_rows::<3>(0).into_owned() / lm.inv_depth;
            let p_world = t_w_cam.transform_point(&p_cam);
            if p_world.iter().all(|v| v.is_finite()) {
                points.push(p_world);
                ids.push(id);
            }
        }

        (points, ids)
    }

    /// Payload for the visualization queue.
    pub fn visualization_data(&self, frame: &Arc<OpticalFlowResult>) -> VisualizationData {
        let (points, point_ids) = self.current_points();
        let pose_cur = |t: i64| self.pose_of(t);

        VisualizationData {
            t_ns: self.last_state_t_ns,
            states: self
                .frame_states
                .values()
                .map(|s| s.state().t_w_i.clone())
                .collect(),
            frames: self.frame_poses.values().map(|p| p.pose().clone()).collect(),
            points,
            point_ids,
            projections: vision::compute_projections(
                &self.lmdb,
                &self.calib,
                &pose_cur,
                self.last_state_t_ns,
            ),
            opt_flow_res: frame.clone(),
        }
    }

    /// Marginalization payload produced by the latest event, if any.
    pub fn take_marg_data(&mut self) -> Option<MargData> {
        self.pending_marg_data.take()
    }
}
