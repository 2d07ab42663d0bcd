//! The state-manager primitives.
//!
//! Every operation here is a stateless service over a [`State`]: covariance
//! propagation and update, covariance bookkeeping, pose cloning,
//! marginalization, and the two landmark initialization paths. Collaborators
//! (the IMU integrator, the measurement builders, the clone scheduler, the
//! SLAM manager) supply the Jacobians, residuals and noise; this module owns
//! the indexing and the numerics.
//!
//! Layout invariants maintained across all operations: the first attached
//! variable starts at row zero, adjacent variables concatenate without gaps,
//! and the total attached size equals the covariance side. The covariance is
//! kept symmetric by writing the upper triangle and reflecting it, and any
//! negative diagonal entry after a write-back is reported as
//! [`StateError::NegativeDiagonal`].

use crate::dimensions::{Cholesky, DMatrix, DVector, GivensRotation, Vector3, U1, U2};
use crate::errors::StateError;
use crate::state::{FeatureId, State};
use crate::stats::chi_squared_quantile_95;
use crate::types::{SubBlock, VarKey, VarRef, VarValue};
use approx::relative_eq;

/// Resolves an ordering into `(id, size)` pairs, failing on any detached
/// variable.
fn layout(state: &State, order: &[VarKey]) -> Result<Vec<(usize, usize)>, StateError> {
    let mut blocks = Vec::with_capacity(order.len());
    for &key in order {
        let var = state.var(key);
        match var.id() {
            Some(id) => blocks.push((id, var.size())),
            None => return Err(StateError::DetachedVariable),
        }
    }
    Ok(blocks)
}

/// Copies the upper triangle over the lower one, making `m` exactly
/// symmetric. The upper triangle is always the authoritative half.
fn reflect_upper(m: &mut DMatrix<f64>) {
    for i in 1..m.nrows() {
        for j in 0..i {
            m[(i, j)] = m[(j, i)];
        }
    }
}

/// A negative variance after a covariance write-back means the filter has
/// diverged beyond repair; the caller decides whether to reset.
fn check_diagonal(state: &State) -> Result<(), StateError> {
    for i in 0..state.cov.nrows() {
        if state.cov[(i, i)] < 0.0 {
            error!(
                "negative variance {:.3e} at index {} after covariance write-back",
                state.cov[(i, i)],
                i
            );
            return Err(StateError::NegativeDiagonal);
        }
    }
    Ok(())
}

/// Performs the covariance time update with a state-transition matrix whose
/// rows predict `order_new` and whose columns reference `order_old`.
///
/// `order_new` must be a contiguous stripe of the covariance; `order_old` may
/// reference any attached variables. `phi` is `rows(order_new) x
/// cols(order_old)` and `q` is the (symmetric) process noise of the predicted
/// stripe. Only the rows and columns of the predicted stripe are rewritten.
pub fn propagate(
    state: &mut State,
    order_new: &[VarKey],
    order_old: &[VarKey],
    phi: &DMatrix<f64>,
    q: &DMatrix<f64>,
) -> Result<(), StateError> {
    if order_new.is_empty() || order_old.is_empty() {
        return Err(StateError::EmptyOrder);
    }
    let new = layout(state, order_new)?;
    let old = layout(state, order_old)?;

    // The predicted rows must form one contiguous stripe
    let mut expected = new[0].0;
    for &(id, size) in &new {
        if id != expected {
            return Err(StateError::NonContiguousOrder);
        }
        expected += size;
    }

    let size_new: usize = new.iter().map(|b| b.1).sum();
    let size_old: usize = old.iter().map(|b| b.1).sum();
    if phi.nrows() != size_new
        || phi.ncols() != size_old
        || q.nrows() != size_new
        || q.ncols() != size_new
    {
        return Err(StateError::DimensionMismatch);
    }

    let n = state.cov.nrows();
    let m = phi.nrows();

    // Cov * Phi^T, accumulated stripe by stripe so that only the columns Phi
    // actually references are ever touched
    let mut cov_phit = DMatrix::<f64>::zeros(n, m);
    let mut col = 0;
    for &(id, size) in &old {
        cov_phit += state.cov.slice((0, id), (n, size))
            * phi.slice((0, col), (m, size)).transpose();
        col += size;
    }

    // Phi * (rows of Cov * Phi^T) + Q for the predicted block
    let mut phi_cov_phit = q.clone();
    let mut col = 0;
    for &(id, size) in &old {
        phi_cov_phit += phi.slice((0, col), (m, size)) * cov_phit.slice((id, 0), (size, m));
        col += size;
    }
    reflect_upper(&mut phi_cov_phit);

    let start = new[0].0;
    state
        .cov
        .slice_mut((start, 0), (m, n))
        .copy_from(&cov_phit.transpose());
    state.cov.slice_mut((0, start), (n, m)).copy_from(&cov_phit);
    state
        .cov
        .slice_mut((start, start), (m, m))
        .copy_from(&phi_cov_phit);

    check_diagonal(state)
}

/// Performs the EKF measurement update with a stacked Jacobian referencing
/// the variables of `h_order`.
///
/// The gain is formed in compressed form: `Cov * H^T` is accumulated block by
/// block against the covariance columns of the measured variables only, so
/// the full `rows(r) x N` Jacobian is never materialized.
pub fn update(
    state: &mut State,
    h_order: &[VarKey],
    h: &DMatrix<f64>,
    res: &DVector<f64>,
    r: &DMatrix<f64>,
) -> Result<(), StateError> {
    if h_order.is_empty() {
        return Err(StateError::EmptyOrder);
    }
    let meas = layout(state, h_order)?;
    let meas_size: usize = meas.iter().map(|b| b.1).sum();
    let rows = res.nrows();
    if h.ncols() != meas_size
        || h.nrows() != rows
        || r.nrows() != rows
        || r.ncols() != rows
    {
        return Err(StateError::DimensionMismatch);
    }

    let n = state.cov.nrows();

    // M = Cov * H^T, block-sparse over the measured variables
    let mut m_a = DMatrix::<f64>::zeros(n, rows);
    let mut col = 0;
    for &(id, size) in &meas {
        m_a += state.cov.slice((0, id), (n, size))
            * h.slice((0, col), (rows, size)).transpose();
        col += size;
    }

    // Innovation covariance S = H * P_small * H^T + R
    let p_small = get_marginal_covariance(state, h_order)?;
    let mut s = h * &p_small * h.transpose() + r;
    reflect_upper(&mut s);

    let chol = match Cholesky::new(s) {
        Some(chol) => chol,
        None => {
            error!("innovation covariance is not positive definite, rejecting update");
            return Err(StateError::GainSingular);
        }
    };
    let k = &m_a * chol.inverse();

    // Cov <- Cov - K * M^T, upper triangle authoritative
    state.cov -= &k * m_a.transpose();
    reflect_upper(&mut state.cov);
    check_diagonal(state)?;

    // Fold dx = K * r into every attached variable through its retraction
    let dx = k * res;
    let order: Vec<VarKey> = state.order.clone();
    for key in order {
        if let Some(id) = state.var(key).id() {
            let size = state.var(key).size();
            state.var_mut(key).update(dx.rows(id, size));
        }
    }

    if state.options.do_calib_camera_intrinsics {
        state.sync_cameras();
    }
    Ok(())
}

/// Overwrites the covariance blocks of the listed variables with the
/// provided matrix.
///
/// The caller lays `covariance` out in the same variable order; blocks
/// between listed and unlisted variables are assumed block-diagonal at
/// initialization time. Finishes by reflecting the upper triangle so the
/// stored covariance is exactly symmetric.
pub fn set_initial_covariance(
    state: &mut State,
    order: &[VarKey],
    covariance: &DMatrix<f64>,
) -> Result<(), StateError> {
    if order.is_empty() {
        return Err(StateError::EmptyOrder);
    }
    let blocks = layout(state, order)?;
    let total: usize = blocks.iter().map(|b| b.1).sum();
    if covariance.nrows() != total || covariance.ncols() != total {
        return Err(StateError::DimensionMismatch);
    }

    let mut i_off = 0;
    for &(id_i, size_i) in &blocks {
        let mut k_off = 0;
        for &(id_k, size_k) in &blocks {
            state
                .cov
                .slice_mut((id_i, id_k), (size_i, size_k))
                .copy_from(&covariance.slice((i_off, k_off), (size_i, size_k)));
            k_off += size_k;
        }
        i_off += size_i;
    }
    reflect_upper(&mut state.cov);
    Ok(())
}

/// Assembles the marginal covariance of the listed variables, in order.
///
/// Pure block gather, no symmetrization.
pub fn get_marginal_covariance(
    state: &State,
    order: &[VarKey],
) -> Result<DMatrix<f64>, StateError> {
    let blocks = layout(state, order)?;
    let total: usize = blocks.iter().map(|b| b.1).sum();
    let mut small = DMatrix::<f64>::zeros(total, total);
    let mut i_off = 0;
    for &(id_i, size_i) in &blocks {
        let mut k_off = 0;
        for &(id_k, size_k) in &blocks {
            small
                .slice_mut((i_off, k_off), (size_i, size_k))
                .copy_from(&state.cov.slice((id_i, id_k), (size_i, size_k)));
            k_off += size_k;
        }
        i_off += size_i;
    }
    Ok(small)
}

/// A copy of the full covariance, for consumers outside the hot path
/// (debugging, visualization, consistency checks).
pub fn get_full_covariance(state: &State) -> DMatrix<f64> {
    state.cov.clone()
}

/// Removes an attached variable and its rows/columns from the covariance.
///
/// The surviving blocks keep their relative order and every id above the
/// removed stripe shifts down. The variable itself stays in the arena,
/// detached, so its last value remains readable. Callers owning map entries
/// pointing at the variable (clone window, feature registry) erase those
/// entries themselves.
pub fn marginalize(state: &mut State, key: VarKey) -> Result<(), StateError> {
    let position = match state.order.iter().position(|&k| k == key) {
        Some(position) => position,
        None => return Err(StateError::DetachedVariable),
    };
    let id = match state.var(key).id() {
        Some(id) => id,
        None => return Err(StateError::DetachedVariable),
    };
    let size = state.var(key).size();

    let n = state.cov.nrows();
    let before = id;
    let after = n - id - size;

    let mut cov = DMatrix::<f64>::zeros(n - size, n - size);
    cov.slice_mut((0, 0), (before, before))
        .copy_from(&state.cov.slice((0, 0), (before, before)));
    cov.slice_mut((0, before), (before, after))
        .copy_from(&state.cov.slice((0, id + size), (before, after)));
    let upper_right = cov.slice((0, before), (before, after)).into_owned();
    cov.slice_mut((before, 0), (after, before))
        .copy_from(&upper_right.transpose());
    cov.slice_mut((before, before), (after, after))
        .copy_from(&state.cov.slice((id + size, id + size), (after, after)));
    state.cov = cov;

    // Re-index the survivors and detach the marginalized variable
    state.order.remove(position);
    let survivors: Vec<VarKey> = state.order.clone();
    for survivor in survivors {
        let var = state.var_mut(survivor);
        if let Some(var_id) = var.id {
            if var_id > id {
                var.id = Some(var_id - size);
            }
        }
    }
    state.var_mut(key).id = None;

    debug!(
        "marginalized a {}-dof variable at index {}, covariance side now {}",
        size,
        id,
        state.cov.nrows()
    );
    Ok(())
}

/// Duplicates a variable, or a sub-variable of a composite, and appends the
/// copy at the end of the state.
///
/// The new rows and columns replicate the source stripe of the covariance,
/// so immediately after the call the clone and its source are perfectly
/// correlated and share the same marginal.
pub fn clone_variable(state: &mut State, target: VarRef) -> Result<VarKey, StateError> {
    let parent = state.var(target.key);
    let parent_id = match parent.id() {
        Some(id) => id,
        None => return Err(StateError::DetachedVariable),
    };
    let (offset, value) = match parent.value().sub_value(target.block) {
        Some(sub) => sub,
        None => return Err(StateError::UnknownSubVariable),
    };
    let src = parent_id + offset;
    let size = value.size();

    let old_n = state.cov.nrows();
    state.cov = state.cov.clone().resize(old_n + size, old_n + size, 0.0);

    let col_stripe = state.cov.slice((0, src), (old_n, size)).into_owned();
    let row_stripe = state.cov.slice((src, 0), (size, old_n)).into_owned();
    let diag = state.cov.slice((src, src), (size, size)).into_owned();
    state
        .cov
        .slice_mut((0, old_n), (old_n, size))
        .copy_from(&col_stripe);
    state
        .cov
        .slice_mut((old_n, 0), (size, old_n))
        .copy_from(&row_stripe);
    state
        .cov
        .slice_mut((old_n, old_n), (size, size))
        .copy_from(&diag);

    let key = state.push_attached(value);
    debug!(
        "cloned a {}-dof block from index {}, covariance side now {}",
        size,
        src,
        state.cov.nrows()
    );
    Ok(key)
}

/// Clones the active IMU pose and registers it in the clone window under the
/// current state timestamp.
///
/// `last_w` is the most recent angular velocity estimate from the IMU
/// integrator. When the camera-to-IMU time offset is being calibrated, the
/// covariance of the new clone is corrected for its first-order dependence on
/// the offset estimate through the Jacobian `[w; v]`.
pub fn augment_clone(state: &mut State, last_w: &Vector3<f64>) -> Result<VarKey, StateError> {
    if state.clones.contains_key(&state.timestamp) {
        return Err(StateError::DuplicateClone);
    }

    let pose_key = clone_variable(state, VarRef::sub(state.imu_key(), SubBlock::Pose))?;
    match state.var(pose_key).value() {
        VarValue::Pose { .. } => {}
        _ => return Err(StateError::NotAPose),
    }
    state.clones.insert(state.timestamp, pose_key);
    debug!(
        "augmented clone at t = {} ns, window size {}",
        state.timestamp,
        state.clones.len()
    );

    if state.options.do_calib_camera_timeoffset {
        let dt_id = match state.var(state.calib_dt_key()).id() {
            Some(id) => id,
            None => return Err(StateError::DetachedVariable),
        };
        // Attached just above; the id is the old covariance side
        let pose_id = match state.var(pose_key).id() {
            Some(id) => id,
            None => return Err(StateError::DetachedVariable),
        };

        let vel = state.imu_velocity();
        let mut dnc_dt = DMatrix::<f64>::zeros(6, 1);
        for i in 0..3 {
            dnc_dt[(i, 0)] = last_w[i];
            dnc_dt[(i + 3, 0)] = vel[i];
        }

        let n = state.cov.nrows();
        let dt_col = state.cov.slice((0, dt_id), (n, 1)).into_owned();
        {
            let mut cols = state.cov.slice_mut((0, pose_id), (n, 6));
            cols += &dt_col * dnc_dt.transpose();
        }
        // Read the offset row after the column write so both stripes agree
        let dt_row = state.cov.slice((dt_id, 0), (1, n)).into_owned();
        {
            let mut rows = state.cov.slice_mut((pose_id, 0), (6, n));
            rows += &dnc_dt * dt_row;
        }
    }

    Ok(pose_key)
}

/// Marginalizes the oldest clone once the window exceeds its configured
/// size, and erases it from the clone window.
pub fn marginalize_old_clone(state: &mut State) -> Result<(), StateError> {
    if state.clones.len() > state.options.max_clone_size {
        if let Some(marg_time) = state.margtimestep() {
            if let Some(key) = state.clones.get(&marg_time).copied() {
                info!("marginalizing clone at t = {} ns", marg_time);
                marginalize(state, key)?;
                state.clones.remove(&marg_time);
            }
        }
    }
    Ok(())
}

/// Marginalizes every SLAM landmark flagged for removal, skipping the
/// protected ArUco id range.
pub fn marginalize_slam(state: &mut State) -> Result<(), StateError> {
    let protected = 4 * state.options.max_aruco_features;
    let doomed: Vec<(FeatureId, VarKey)> = state
        .features
        .iter()
        .filter(|(feature_id, key)| {
            **feature_id > protected
                && matches!(
                    state.var(**key).value(),
                    VarValue::Landmark {
                        should_marg: true,
                        ..
                    }
                )
        })
        .map(|(feature_id, key)| (*feature_id, *key))
        .collect();
    for (feature_id, key) in doomed {
        marginalize(state, key)?;
        state.features.remove(&feature_id);
    }
    Ok(())
}

/// Delayed initialization of a new variable from a measurement whose
/// Jacobian splits into a state part `h_r` and a new-variable part `h_l`.
///
/// The system is rotated by Givens QR so that the top `size(new_value)` rows
/// carry all the information about the new variable; the remaining rows are
/// its nullspace projection and must pass a Mahalanobis gate before anything
/// is touched. On rejection the state is left untouched and `Ok(None)` is
/// returned; on success the new variable's key is returned after the
/// invertible initialization and the projected update have both been applied.
///
/// The measurement noise must be isotropic diagonal so that it stays
/// invariant under the orthogonal rotation.
#[allow(clippy::too_many_arguments)]
pub fn initialize(
    state: &mut State,
    new_value: VarValue,
    h_order: &[VarKey],
    mut h_r: DMatrix<f64>,
    mut h_l: DMatrix<f64>,
    r: DMatrix<f64>,
    mut res: DVector<f64>,
    chi_2_mult: f64,
) -> Result<Option<VarKey>, StateError> {
    let new_size = new_value.size();
    let rows = res.nrows();
    if h_l.nrows() != rows
        || h_r.nrows() != rows
        || r.nrows() != rows
        || r.ncols() != rows
        || h_l.ncols() != new_size
        || rows < new_size
    {
        return Err(StateError::DimensionMismatch);
    }

    // The QR rotation below only leaves R invariant if R = sigma^2 * I
    let sigma_sq = r[(0, 0)];
    for i in 0..rows {
        for j in 0..rows {
            let expected = if i == j { sigma_sq } else { 0.0 };
            if !relative_eq!(r[(i, j)], expected) {
                return Err(StateError::NoiseNotIsotropic);
            }
        }
    }

    // Givens QR from the bottom of h_l up: triangularize the new-variable
    // Jacobian while carrying h_r and the residual along
    let cols_l = h_l.ncols();
    let cols_r = h_r.ncols();
    for n_col in 0..cols_l {
        let mut m_row = rows - 1;
        while m_row > n_col {
            let rot = {
                let pivot = h_l.fixed_slice::<U2, U1>(m_row - 1, n_col);
                GivensRotation::cancel_y(&pivot).map(|(rot, _)| rot)
            };
            if let Some(rot) = rot {
                rot.rotate(&mut h_l.slice_mut((m_row - 1, n_col), (2, cols_l - n_col)));
                rot.rotate(&mut h_r.slice_mut((m_row - 1, 0), (2, cols_r)));
                rot.rotate(&mut res.slice_mut((m_row - 1, 0), (2, 1)));
            }
            m_row -= 1;
        }
    }

    // Top rows initialize the new variable, the rest is its nullspace
    // projection
    let hx_init = h_r.slice((0, 0), (new_size, cols_r)).into_owned();
    let h_finit = h_l.slice((0, 0), (new_size, new_size)).into_owned();
    let res_init = res.rows(0, new_size).into_owned();
    let r_init = r.slice((0, 0), (new_size, new_size)).into_owned();

    let dof = rows - new_size;
    let h_up = h_r.slice((new_size, 0), (dof, cols_r)).into_owned();
    let res_up = res.rows(new_size, dof).into_owned();
    let r_up = r.slice((new_size, new_size), (dof, dof)).into_owned();

    if dof > 0 {
        let p_up = get_marginal_covariance(state, h_order)?;
        let s = &h_up * &p_up * h_up.transpose() + &r_up;
        let chol = match Cholesky::new(s) {
            Some(chol) => chol,
            None => return Err(StateError::GainSingular),
        };
        let chi2 = res_up.dot(&chol.solve(&res_up));
        let threshold = chi_2_mult * chi_squared_quantile_95(dof);
        if chi2 > threshold {
            debug!(
                "delayed initialization rejected, chi2 {:.3} above gate {:.3} (dof {})",
                chi2, threshold, dof
            );
            return Ok(None);
        }
    }

    let key = initialize_invertible(state, new_value, h_order, &hx_init, &h_finit, &r_init, &res_init)?;

    // The projected residual is independent of the new variable by
    // construction, so the pre-initialization ordering still applies
    if dof > 0 {
        update(state, h_order, &h_up, &res_up, &r_up)?;
    }
    Ok(Some(key))
}

/// Direct initialization of a new variable whose Jacobian `h_l` is square
/// and invertible.
///
/// Grows the covariance by the new variable's size, writes the cross terms
/// `-Cov * H_R^T * H_L^{-T}` and the new marginal
/// `H_L^{-1} (H_R P H_R^T + R) H_L^{-T}`, corrects the value by
/// `H_L^{-1} r`, and attaches the variable at the end of the state.
pub fn initialize_invertible(
    state: &mut State,
    new_value: VarValue,
    h_order: &[VarKey],
    h_r: &DMatrix<f64>,
    h_l: &DMatrix<f64>,
    r: &DMatrix<f64>,
    res: &DVector<f64>,
) -> Result<VarKey, StateError> {
    if h_order.is_empty() {
        return Err(StateError::EmptyOrder);
    }
    let new_size = new_value.size();
    let rows = res.nrows();
    if h_l.nrows() != h_l.ncols()
        || h_l.nrows() != new_size
        || h_l.nrows() != rows
        || h_r.nrows() != rows
        || r.nrows() != rows
        || r.ncols() != rows
    {
        return Err(StateError::DimensionMismatch);
    }
    let meas = layout(state, h_order)?;
    let meas_size: usize = meas.iter().map(|b| b.1).sum();
    if h_r.ncols() != meas_size {
        return Err(StateError::DimensionMismatch);
    }

    let n = state.cov.nrows();

    // M_a = Cov * H_R^T, block-sparse as in `update`
    let mut m_a = DMatrix::<f64>::zeros(n, rows);
    let mut col = 0;
    for &(id, size) in &meas {
        m_a += state.cov.slice((0, id), (n, size))
            * h_r.slice((0, col), (rows, size)).transpose();
        col += size;
    }

    // M = H_R * P_small * H_R^T + R
    let p_small = get_marginal_covariance(state, h_order)?;
    let mut m = h_r * &p_small * h_r.transpose() + r;
    reflect_upper(&mut m);

    let h_linv = match h_l.clone().try_inverse() {
        Some(inv) => inv,
        None => {
            error!("new-variable Jacobian is singular, cannot initialize");
            return Err(StateError::JacobianNotInvertible);
        }
    };
    let p_ll = &h_linv * m * h_linv.transpose();

    // Grow the covariance and write the new stripes
    state.cov = state.cov.clone().resize(n + new_size, n + new_size, 0.0);
    let cross = -(&m_a * h_linv.transpose());
    state
        .cov
        .slice_mut((0, n), (n, new_size))
        .copy_from(&cross);
    state
        .cov
        .slice_mut((n, 0), (new_size, n))
        .copy_from(&cross.transpose());
    state
        .cov
        .slice_mut((n, n), (new_size, new_size))
        .copy_from(&p_ll);

    // An invertible system can only correct the new variable itself; the
    // correction is near zero when the caller already solved for the value
    let mut value = new_value;
    let dx = &h_linv * res;
    value.update(dx.rows(0, new_size));

    let key = state.push_attached(value);
    info!(
        "initialized a {}-dof variable, covariance side now {}",
        new_size,
        state.cov.nrows()
    );
    Ok(key)
}
