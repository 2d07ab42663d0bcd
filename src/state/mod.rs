use crate::dimensions::{DMatrix, DVector, UnitQuaternion, Vector3};
use crate::types::{VarKey, VarValue, Variable};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provides the state-manager primitives (propagation, update, cloning,
/// marginalization, delayed initialization).
pub mod helper;

/// Timestamps are integer nanoseconds so they can key the clone window
/// exactly; unit conversion is the sensor drivers' concern.
pub type TimeNs = i64;

/// Identifier a tracker assigns to a SLAM landmark.
pub type FeatureId = usize;

/// Options describing which blocks the estimator carries and calibrates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateOptions {
    /// Number of cameras rigidly attached to the IMU
    pub num_cameras: usize,
    /// Number of cloned poses to keep in the sliding window
    pub max_clone_size: usize,
    /// Number of ArUco landmarks, which are protected from marginalization
    pub max_aruco_features: usize,
    /// Estimate the camera-to-IMU rigid transform online
    pub do_calib_camera_pose: bool,
    /// Estimate the camera-to-IMU time offset online
    pub do_calib_camera_timeoffset: bool,
    /// Estimate the camera intrinsics online
    pub do_calib_camera_intrinsics: bool,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            num_cameras: 1,
            max_clone_size: 11,
            max_aruco_features: 1024,
            do_calib_camera_pose: false,
            do_calib_camera_timeoffset: false,
            do_calib_camera_intrinsics: false,
        }
    }
}

/// Interface object mirroring the estimated intrinsics of one camera.
///
/// Measurement builders read these instead of digging into the state vector;
/// after every update that calibrates intrinsics the estimated values are
/// copied back in.
#[derive(Debug, Clone)]
pub struct Camera {
    values: DVector<f64>,
}

impl Camera {
    fn new(size: usize) -> Self {
        Self {
            values: DVector::zeros(size),
        }
    }

    /// Current intrinsic parameters, `[fx, fy, cx, cy, d0, d1, d2, d3]`.
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    fn set_values(&mut self, values: &DVector<f64>) {
        self.values.copy_from(values);
    }
}

/// Owns the aggregate error-state: the ordered variables, their covariance,
/// the sliding window of cloned poses, the SLAM landmarks and the calibration
/// blocks.
///
/// All mutation goes through `&mut State`, which statically serializes
/// structural changes (cloning, marginalization, initialization) against any
/// reader; the algebraic primitives themselves live in [`helper`].
#[derive(Debug, Clone)]
pub struct State {
    /// Current time of the active inertial state
    pub timestamp: TimeNs,
    /// Estimator options, fixed at construction
    pub options: StateOptions,
    pub(crate) cov: DMatrix<f64>,
    /// Arena of every variable ever attached; detached entries keep their value
    pub(crate) vars: Vec<Variable>,
    /// Attached variables, in covariance order
    pub(crate) order: Vec<VarKey>,
    /// Sliding window of cloned IMU poses, keyed by their clone time
    pub(crate) clones: BTreeMap<TimeNs, VarKey>,
    /// SLAM landmarks currently maintained in the state
    pub(crate) features: BTreeMap<FeatureId, VarKey>,
    imu: VarKey,
    calib_dt: VarKey,
    calib_imu_to_cam: BTreeMap<usize, VarKey>,
    cam_intrinsics: BTreeMap<usize, VarKey>,
    cameras: BTreeMap<usize, Camera>,
}

impl State {
    /// Builds a state holding the inertial block plus whichever calibration
    /// blocks the options request.
    ///
    /// The IMU is always variable zero. Calibration variables that are not
    /// being estimated online still exist, detached, so that their fixed
    /// values can be read uniformly. The covariance starts at `(1e-3)^2 * I`.
    pub fn new(options: StateOptions) -> Self {
        let mut state = Self {
            timestamp: 0,
            options,
            cov: DMatrix::zeros(0, 0),
            vars: Vec::new(),
            order: Vec::new(),
            clones: BTreeMap::new(),
            features: BTreeMap::new(),
            imu: VarKey(0),
            calib_dt: VarKey(0),
            calib_imu_to_cam: BTreeMap::new(),
            cam_intrinsics: BTreeMap::new(),
            cameras: BTreeMap::new(),
        };

        state.imu = state.push_raw(
            VarValue::Imu {
                q: UnitQuaternion::identity(),
                p: Vector3::zeros(),
                v: Vector3::zeros(),
                bg: Vector3::zeros(),
                ba: Vector3::zeros(),
            },
            true,
        );

        state.calib_dt = state.push_raw(
            VarValue::Vector(DVector::zeros(1)),
            options.do_calib_camera_timeoffset,
        );

        for cam_id in 0..options.num_cameras {
            let extrinsic = state.push_raw(
                VarValue::Pose {
                    q: UnitQuaternion::identity(),
                    p: Vector3::zeros(),
                },
                options.do_calib_camera_pose,
            );
            let intrinsic = state.push_raw(
                VarValue::Vector(DVector::zeros(8)),
                options.do_calib_camera_intrinsics,
            );
            state.calib_imu_to_cam.insert(cam_id, extrinsic);
            state.cam_intrinsics.insert(cam_id, intrinsic);
            state.cameras.insert(cam_id, Camera::new(8));
        }

        let n = state.attached_size();
        state.cov = DMatrix::identity(n, n) * 1e-3_f64.powi(2);
        state
    }

    /// Inserts a variable into the arena, attaching it at the end of the
    /// ordering when requested.
    fn push_raw(&mut self, value: VarValue, attach: bool) -> VarKey {
        if attach {
            self.push_attached(value)
        } else {
            let key = VarKey(self.vars.len());
            self.vars.push(Variable::new(value));
            key
        }
    }

    /// Attaches a variable at the end of the ordering. The covariance must
    /// already have room for it.
    pub(crate) fn push_attached(&mut self, value: VarValue) -> VarKey {
        let id = self.attached_size();
        let key = VarKey(self.vars.len());
        self.vars.push(Variable {
            id: Some(id),
            value,
        });
        self.order.push(key);
        key
    }

    /// Attaches a caller-built variable with zero prior covariance.
    ///
    /// The usual follow-up is [`helper::set_initial_covariance`] over the new
    /// variable; until then its rows and columns are zero.
    pub fn append_variable(&mut self, value: VarValue) -> VarKey {
        let n = self.cov.nrows();
        let grown = n + value.size();
        self.cov = self.cov.clone().resize(grown, grown, 0.0);
        self.push_attached(value)
    }

    pub fn var(&self, key: VarKey) -> &Variable {
        &self.vars[key.0]
    }

    pub(crate) fn var_mut(&mut self, key: VarKey) -> &mut Variable {
        &mut self.vars[key.0]
    }

    /// Attached variables in covariance order.
    pub fn variables(&self) -> &[VarKey] {
        &self.order
    }

    /// Sum of the minimal dimensions of all attached variables, which equals
    /// the covariance side at all times.
    pub fn attached_size(&self) -> usize {
        self.order.iter().map(|k| self.vars[k.0].size()).sum()
    }

    /// Side of the covariance matrix.
    pub fn cov_side(&self) -> usize {
        self.cov.nrows()
    }

    pub fn imu_key(&self) -> VarKey {
        self.imu
    }

    /// The active inertial state value.
    pub fn imu(&self) -> &VarValue {
        self.vars[self.imu.0].value()
    }

    /// Overwrites the inertial state value, typically after kinematic
    /// propagation by the IMU integrator.
    pub fn set_imu_state(
        &mut self,
        q: UnitQuaternion<f64>,
        p: Vector3<f64>,
        v: Vector3<f64>,
        bg: Vector3<f64>,
        ba: Vector3<f64>,
    ) {
        self.vars[self.imu.0].value = VarValue::Imu { q, p, v, bg, ba };
    }

    pub(crate) fn imu_velocity(&self) -> Vector3<f64> {
        match self.imu() {
            VarValue::Imu { v, .. } => *v,
            // The IMU slot is constructed as an Imu kind and never reassigned
            _ => unreachable!("imu slot holds a non-imu kind"),
        }
    }

    pub fn calib_dt_key(&self) -> VarKey {
        self.calib_dt
    }

    pub fn calib_extrinsic_key(&self, cam_id: usize) -> Option<VarKey> {
        self.calib_imu_to_cam.get(&cam_id).copied()
    }

    pub fn calib_intrinsics_key(&self, cam_id: usize) -> Option<VarKey> {
        self.cam_intrinsics.get(&cam_id).copied()
    }

    /// The mirror object carrying the estimated intrinsics of a camera.
    pub fn camera(&self, cam_id: usize) -> Option<&Camera> {
        self.cameras.get(&cam_id)
    }

    /// Seeds the calibration values of one camera (fixed or initial guess).
    pub fn set_camera_calibration(
        &mut self,
        cam_id: usize,
        intrinsics: &DVector<f64>,
        extrinsic_q: UnitQuaternion<f64>,
        extrinsic_p: Vector3<f64>,
    ) {
        if let Some(key) = self.cam_intrinsics.get(&cam_id).copied() {
            self.vars[key.0].value = VarValue::Vector(intrinsics.clone());
        }
        if let Some(key) = self.calib_imu_to_cam.get(&cam_id).copied() {
            self.vars[key.0].value = VarValue::Pose {
                q: extrinsic_q,
                p: extrinsic_p,
            };
        }
        if let Some(camera) = self.cameras.get_mut(&cam_id) {
            camera.set_values(intrinsics);
        }
    }

    /// Copies the estimated intrinsic vectors back into the camera mirrors.
    pub(crate) fn sync_cameras(&mut self) {
        for (cam_id, key) in &self.cam_intrinsics {
            if let VarValue::Vector(values) = self.vars[key.0].value() {
                if let Some(camera) = self.cameras.get_mut(cam_id) {
                    camera.values.copy_from(values);
                }
            }
        }
    }

    /// Cloned pose registered at the provided time, if any.
    pub fn clone_at(&self, timestamp: TimeNs) -> Option<VarKey> {
        self.clones.get(&timestamp).copied()
    }

    /// Number of clones in the sliding window.
    pub fn n_clones(&self) -> usize {
        self.clones.len()
    }

    /// Timestamp of the clone that would be marginalized next, i.e. the
    /// oldest one in the window.
    pub fn margtimestep(&self) -> Option<TimeNs> {
        self.clones.keys().next().copied()
    }

    /// Registers an initialized landmark under its feature id.
    pub fn insert_feature(&mut self, feature_id: FeatureId, key: VarKey) {
        self.features.insert(feature_id, key);
    }

    pub fn feature(&self, feature_id: FeatureId) -> Option<VarKey> {
        self.features.get(&feature_id).copied()
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    /// Marks a landmark so the next [`helper::marginalize_slam`] pass removes
    /// it, unless it is a protected ArUco landmark.
    pub fn flag_feature_for_marg(&mut self, feature_id: FeatureId) {
        if let Some(key) = self.features.get(&feature_id).copied() {
            if let VarValue::Landmark { should_marg, .. } = &mut self.vars[key.0].value {
                *should_marg = true;
            }
        }
    }
}

#[test]
fn construction_layout() {
    let state = State::new(StateOptions::default());
    assert_eq!(state.cov_side(), 15);
    assert_eq!(state.attached_size(), 15);
    assert_eq!(state.var(state.imu_key()).id(), Some(0));
    // Non-calibrated blocks exist but are detached
    assert_eq!(state.var(state.calib_dt_key()).id(), None);
    assert!(state.margtimestep().is_none());
}

#[test]
fn construction_layout_full_calibration() {
    let options = StateOptions {
        num_cameras: 2,
        do_calib_camera_pose: true,
        do_calib_camera_timeoffset: true,
        do_calib_camera_intrinsics: true,
        ..Default::default()
    };
    let state = State::new(options);
    // imu + dt + 2 * (extrinsic pose + intrinsic 8-vector)
    assert_eq!(state.cov_side(), 15 + 1 + 2 * (6 + 8));
    assert_eq!(state.var(state.calib_dt_key()).id(), Some(15));
    let first_extrinsic = state.calib_extrinsic_key(0).unwrap();
    assert_eq!(state.var(first_extrinsic).id(), Some(16));
}
