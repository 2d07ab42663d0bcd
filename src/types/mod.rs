use crate::dimensions::{DVector, DVectorSlice, UnitQuaternion, Vector3};

/// Stable handle to a variable owned by a `State` arena.
///
/// Keys are never invalidated: a marginalized variable stays in the arena in
/// detached form so that its last value remains readable, and every map kept
/// by the state (clone window, landmark registry, calibration registries)
/// stores keys rather than references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarKey(pub(crate) usize);

/// Addresses a block inside a composite variable kind.
///
/// `Whole` addresses the variable itself and is valid for every kind; the
/// remaining blocks are resolved through an explicit kind match and only
/// exist for the composite kinds that carry them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBlock {
    Whole,
    Pose,
    Orientation,
    Position,
    Velocity,
    BiasGyro,
    BiasAccel,
}

/// A variable, or a sub-block of a composite variable, to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarRef {
    pub key: VarKey,
    pub block: SubBlock,
}

impl VarRef {
    /// References the whole variable.
    pub fn whole(key: VarKey) -> Self {
        Self {
            key,
            block: SubBlock::Whole,
        }
    }

    /// References a sub-block of a composite variable.
    pub fn sub(key: VarKey, block: SubBlock) -> Self {
        Self { key, block }
    }
}

/// The closed set of variable kinds the estimator can carry.
///
/// The value is the over-parameterized representation; the state manager only
/// ever relies on the *minimal* dimension reported by [`VarValue::size`] for
/// covariance indexing, and on [`VarValue::update`] to fold a minimal-space
/// correction back into the value.
///
/// Orientation corrections are applied on the left, `q <- exp(dtheta) * q`.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    /// A plain vector with additive updates (biases, time offsets, camera
    /// intrinsics, and any other calibration block)
    Vector(DVector<f64>),
    /// A unit quaternion with a 3-dof tangent-space update
    Quat(UnitQuaternion<f64>),
    /// An orientation and position pair, 6-dof error state
    Pose {
        q: UnitQuaternion<f64>,
        p: Vector3<f64>,
    },
    /// The inertial state: pose, velocity and the two IMU biases, 15-dof
    /// error state ordered `[dtheta, dp, dv, dbg, dba]`
    Imu {
        q: UnitQuaternion<f64>,
        p: Vector3<f64>,
        v: Vector3<f64>,
        bg: Vector3<f64>,
        ba: Vector3<f64>,
    },
    /// A SLAM landmark position, flagged when it should leave the state
    Landmark { p: Vector3<f64>, should_marg: bool },
}

impl VarValue {
    /// Minimal (error-state) dimension of this kind.
    pub fn size(&self) -> usize {
        match self {
            VarValue::Vector(v) => v.nrows(),
            VarValue::Quat(_) => 3,
            VarValue::Pose { .. } => 6,
            VarValue::Imu { .. } => 15,
            VarValue::Landmark { .. } => 3,
        }
    }

    /// Applies a minimal-dimension correction to this value.
    ///
    /// The caller guarantees that `dx` has exactly [`VarValue::size`] rows;
    /// the slice is addressed with the block layout documented on each kind.
    pub fn update(&mut self, dx: DVectorSlice<f64>) {
        debug_assert_eq!(dx.nrows(), self.size());
        match self {
            VarValue::Vector(v) => {
                for i in 0..v.nrows() {
                    v[i] += dx[i];
                }
            }
            VarValue::Quat(q) => {
                *q = boxplus(q, dx[0], dx[1], dx[2]);
            }
            VarValue::Pose { q, p } => {
                *q = boxplus(q, dx[0], dx[1], dx[2]);
                *p += Vector3::new(dx[3], dx[4], dx[5]);
            }
            VarValue::Imu { q, p, v, bg, ba } => {
                *q = boxplus(q, dx[0], dx[1], dx[2]);
                *p += Vector3::new(dx[3], dx[4], dx[5]);
                *v += Vector3::new(dx[6], dx[7], dx[8]);
                *bg += Vector3::new(dx[9], dx[10], dx[11]);
                *ba += Vector3::new(dx[12], dx[13], dx[14]);
            }
            VarValue::Landmark { p, .. } => {
                *p += Vector3::new(dx[0], dx[1], dx[2]);
            }
        }
    }

    /// Locates a sub-block inside this kind.
    ///
    /// Returns the offset of the block within the parent's minimal
    /// parameterization together with an independent copy of its value, or
    /// `None` when this kind does not carry the requested block.
    pub fn sub_value(&self, block: SubBlock) -> Option<(usize, VarValue)> {
        match (self, block) {
            (value, SubBlock::Whole) => Some((0, value.clone())),
            (VarValue::Imu { q, p, .. }, SubBlock::Pose) => {
                Some((0, VarValue::Pose { q: *q, p: *p }))
            }
            (VarValue::Imu { q, .. }, SubBlock::Orientation) => Some((0, VarValue::Quat(*q))),
            (VarValue::Imu { p, .. }, SubBlock::Position) => {
                Some((3, VarValue::Vector(DVector::from_column_slice(p.as_slice()))))
            }
            (VarValue::Imu { v, .. }, SubBlock::Velocity) => {
                Some((6, VarValue::Vector(DVector::from_column_slice(v.as_slice()))))
            }
            (VarValue::Imu { bg, .. }, SubBlock::BiasGyro) => {
                Some((9, VarValue::Vector(DVector::from_column_slice(bg.as_slice()))))
            }
            (VarValue::Imu { ba, .. }, SubBlock::BiasAccel) => Some((
                12,
                VarValue::Vector(DVector::from_column_slice(ba.as_slice())),
            )),
            (VarValue::Pose { q, .. }, SubBlock::Orientation) => Some((0, VarValue::Quat(*q))),
            (VarValue::Pose { p, .. }, SubBlock::Position) => {
                Some((3, VarValue::Vector(DVector::from_column_slice(p.as_slice()))))
            }
            _ => None,
        }
    }
}

/// Left-multiplicative quaternion retraction.
fn boxplus(q: &UnitQuaternion<f64>, dx: f64, dy: f64, dz: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(Vector3::new(dx, dy, dz)) * q
}

/// A named, addressable block of the aggregate error state.
///
/// While attached, `id` is the starting row/column of the block in the
/// covariance. A detached variable (`id == None`) keeps its value but takes
/// no part in any covariance operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub(crate) id: Option<usize>,
    pub(crate) value: VarValue,
}

impl Variable {
    /// A fresh detached variable carrying the provided value.
    pub fn new(value: VarValue) -> Self {
        Self { id: None, value }
    }

    /// Starting row/column in the covariance, `None` when detached.
    pub fn id(&self) -> Option<usize> {
        self.id
    }

    /// Minimal (error-state) dimension.
    pub fn size(&self) -> usize {
        self.value.size()
    }

    pub fn value(&self) -> &VarValue {
        &self.value
    }

    pub(crate) fn update(&mut self, dx: DVectorSlice<f64>) {
        self.value.update(dx);
    }
}

#[test]
fn minimal_sizes() {
    let v = VarValue::Vector(DVector::zeros(8));
    assert_eq!(v.size(), 8);
    assert_eq!(VarValue::Quat(UnitQuaternion::identity()).size(), 3);
    let pose = VarValue::Pose {
        q: UnitQuaternion::identity(),
        p: Vector3::zeros(),
    };
    assert_eq!(pose.size(), 6);
    let imu = VarValue::Imu {
        q: UnitQuaternion::identity(),
        p: Vector3::zeros(),
        v: Vector3::zeros(),
        bg: Vector3::zeros(),
        ba: Vector3::zeros(),
    };
    assert_eq!(imu.size(), 15);
    assert_eq!(
        VarValue::Landmark {
            p: Vector3::zeros(),
            should_marg: false
        }
        .size(),
        3
    );
}

#[test]
fn imu_sub_blocks() {
    let imu = VarValue::Imu {
        q: UnitQuaternion::identity(),
        p: Vector3::new(1.0, 2.0, 3.0),
        v: Vector3::new(4.0, 5.0, 6.0),
        bg: Vector3::zeros(),
        ba: Vector3::zeros(),
    };
    let (off, pose) = imu.sub_value(SubBlock::Pose).unwrap();
    assert_eq!(off, 0);
    assert_eq!(pose.size(), 6);
    let (off, vel) = imu.sub_value(SubBlock::Velocity).unwrap();
    assert_eq!(off, 6);
    match vel {
        VarValue::Vector(v) => assert_eq!(v[1], 5.0),
        _ => panic!("expected a vector sub-value"),
    }
    let (off, _) = imu.sub_value(SubBlock::BiasAccel).unwrap();
    assert_eq!(off, 12);
    // A landmark has no pose to extract
    let lm = VarValue::Landmark {
        p: Vector3::zeros(),
        should_marg: false,
    };
    assert!(lm.sub_value(SubBlock::Pose).is_none());
}

#[test]
fn pose_boxplus_small_angle() {
    use approx::assert_relative_eq;
    let mut pose = VarValue::Pose {
        q: UnitQuaternion::identity(),
        p: Vector3::zeros(),
    };
    let dx = DVector::from_column_slice(&[1e-4, 0.0, 0.0, 1.0, -2.0, 0.5]);
    pose.update(dx.rows(0, 6));
    match pose {
        VarValue::Pose { q, p } => {
            assert_relative_eq!(q.scaled_axis()[0], 1e-4, max_relative = 1e-9);
            assert_relative_eq!(p[0], 1.0);
            assert_relative_eq!(p[1], -2.0);
            assert_relative_eq!(p[2], 0.5);
        }
        _ => panic!("update must preserve the kind"),
    }
}
