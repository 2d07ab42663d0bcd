use std::error::Error;
use std::fmt;

/// Stores the different kinds of errors the state manager can report.
///
/// Every variant is terminal for the operation that returned it: the manager
/// performs no recovery on its own, and it is up to the caller to decide
/// whether the filter must be reset. The only recoverable signal in the API,
/// a rejected Mahalanobis gate during delayed initialization, is *not* an
/// error and is reported as `Ok(None)` by `helper::initialize`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateError {
    /// A variable ordering passed to an operation was empty
    EmptyOrder,
    /// The rows predicted by the state-transition matrix must map onto a
    /// contiguous stripe of the covariance
    NonContiguousOrder,
    /// Matrix dimensions do not line up with the provided variable ordering
    DimensionMismatch,
    /// An operation referenced a variable that is detached from the state
    DetachedVariable,
    /// The requested sub-variable does not exist inside the parent kind
    UnknownSubVariable,
    /// A clone is already registered at the current state timestamp
    DuplicateClone,
    /// The cloned variable was expected to be a pose but is not
    NotAPose,
    /// Delayed initialization requires isotropic measurement noise
    NoiseNotIsotropic,
    /// H * P * H^T + R is singular, the Kalman gain cannot be computed
    GainSingular,
    /// The Jacobian with respect to the new variable is not invertible
    JacobianNotInvertible,
    /// A negative variance appeared on the covariance diagonal
    NegativeDiagonal,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StateError::EmptyOrder => write!(f, "the provided variable ordering is empty"),
            StateError::NonContiguousOrder => write!(
                f,
                "the predicted variables do not form a contiguous stripe of the covariance"
            ),
            StateError::DimensionMismatch => write!(
                f,
                "matrix dimensions do not match the provided variable ordering"
            ),
            StateError::DetachedVariable => {
                write!(f, "a referenced variable is detached from the state")
            }
            StateError::UnknownSubVariable => {
                write!(f, "the requested sub-variable could not be located")
            }
            StateError::DuplicateClone => {
                write!(f, "a clone already exists at the current timestamp")
            }
            StateError::NotAPose => write!(f, "the cloned variable is not a pose"),
            StateError::NoiseNotIsotropic => write!(
                f,
                "delayed initialization requires an isotropic diagonal measurement noise"
            ),
            StateError::GainSingular => write!(
                f,
                "gain could not be computed because H*P*H^T + R is singular"
            ),
            StateError::JacobianNotInvertible => {
                write!(f, "the new-variable Jacobian is singular")
            }
            StateError::NegativeDiagonal => {
                write!(f, "the covariance diagonal has a negative entry")
            }
        }
    }
}

impl Error for StateError {}
