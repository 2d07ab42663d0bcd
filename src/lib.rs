//! msckf-core is the state-management core of a sliding-window
//! visual-inertial extended Kalman filter.
//!
//! It maintains the aggregate error-state: an ordered set of variables (the
//! inertial block, cloned poses, SLAM landmarks, calibration blocks), their
//! dense covariance, and the indexing invariants that tie the two together.
//! On top of that it provides the four algebraic primitives every EKF-based
//! estimator needs, plus delayed initialization of new variables:
//!
//! - covariance **propagation** against a supplied state-transition matrix,
//! - the **measurement update** in compressed (block-sparse) gain form,
//! - **augmentation**, cloning a pose into the state for delayed fusion,
//! - **marginalization**, removing a variable and its covariance stripes,
//! - **delayed initialization** via Givens QR nullspace projection guarded
//!   by a Mahalanobis gate.
//!
//! Jacobians, residuals and noise models are supplied by the surrounding
//! collaborators (IMU integrator, feature tracker, measurement builders);
//! this crate owns the bookkeeping and the numerics, nothing else.

#[macro_use]
extern crate log;

/// Re-exports the nalgebra types the state manager is built on.
///
/// The covariance and all interchanged Jacobians are dynamically sized since
/// the state grows and shrinks at runtime.
pub mod dimensions {
    pub use nalgebra::linalg::givens::GivensRotation;
    pub use nalgebra::linalg::Cholesky;
    pub use nalgebra::{DMatrix, DVector, DVectorSlice, UnitQuaternion, Vector3, U1, U2};
}

/// Provides the error kinds reported by the state manager.
pub mod errors;

/// Provides the chi-squared quantiles backing the Mahalanobis gate.
pub mod stats;

/// Provides the variable kinds and their tangent-space update rules.
pub mod types;

/// Provides the `State` container and the state-manager primitives.
pub mod state;

pub use crate::errors::StateError;
pub use crate::state::{helper, Camera, FeatureId, State, StateOptions, TimeNs};
pub use crate::types::{SubBlock, VarKey, VarRef, VarValue, Variable};
