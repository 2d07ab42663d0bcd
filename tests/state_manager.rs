extern crate msckf_core;
extern crate nalgebra as na;

use approx::assert_relative_eq;
use msckf_core::state::helper;
use msckf_core::{State, StateError, StateOptions, SubBlock, VarRef, VarValue};
use na::{DMatrix, DVector, Vector3};
use rand::prelude::*;
use rand_distr::StandardNormal;

/// A random symmetric positive definite matrix with a deterministic seed.
fn random_psd(side: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = DMatrix::<f64>::from_fn(side, side, |_, _| rng.sample(StandardNormal));
    &a * a.transpose() + DMatrix::<f64>::identity(side, side) * 0.1
}

fn assert_symmetric(cov: &DMatrix<f64>) {
    for i in 0..cov.nrows() {
        for j in 0..cov.ncols() {
            assert!(
                (cov[(i, j)] - cov[(j, i)]).abs() < 1e-9,
                "covariance not symmetric at ({}, {}): {} vs {}",
                i,
                j,
                cov[(i, j)],
                cov[(j, i)]
            );
        }
    }
}

fn assert_diag_nonneg(cov: &DMatrix<f64>) {
    for i in 0..cov.nrows() {
        assert!(
            cov[(i, i)] >= 0.0,
            "negative variance {} at index {}",
            cov[(i, i)],
            i
        );
    }
}

/// The ids of the attached variables must concatenate from zero and cover the
/// covariance exactly.
fn assert_layout(state: &State) {
    let mut expected = 0;
    for &key in state.variables() {
        let var = state.var(key);
        assert_eq!(var.id(), Some(expected), "variable id out of order");
        expected += var.size();
    }
    assert_eq!(expected, state.cov_side(), "attached sizes do not cover the covariance");
}

#[test]
fn propagation_identity_is_noop() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 1)).unwrap();
    let before = helper::get_full_covariance(&state);

    let phi = DMatrix::<f64>::identity(15, 15);
    let q = DMatrix::<f64>::zeros(15, 15);
    helper::propagate(&mut state, &[imu], &[imu], &phi, &q).unwrap();

    let after = helper::get_full_covariance(&state);
    for i in 0..15 {
        for j in 0..15 {
            assert_relative_eq!(before[(i, j)], after[(i, j)], epsilon = 1e-12);
        }
    }
}

#[test]
fn propagation_with_dynamics_keeps_invariants() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 2)).unwrap();

    let mut rng = StdRng::seed_from_u64(3);
    let phi = DMatrix::<f64>::from_fn(15, 15, |_, _| rng.sample(StandardNormal));
    let q = random_psd(15, 4) * 0.01;
    helper::propagate(&mut state, &[imu], &[imu], &phi, &q).unwrap();

    let cov = helper::get_full_covariance(&state);
    assert_symmetric(&cov);
    assert_diag_nonneg(&cov);
    assert_layout(&state);
}

#[test]
fn propagation_rejects_non_contiguous_new_order() {
    let options = StateOptions {
        do_calib_camera_pose: true,
        do_calib_camera_timeoffset: true,
        ..Default::default()
    };
    let mut state = State::new(options);
    let imu = state.imu_key();
    let extrinsic = state.calib_extrinsic_key(0).unwrap();
    // imu covers [0, 15), the extrinsic starts at 16: there is a gap
    let phi = DMatrix::<f64>::identity(21, 21);
    let q = DMatrix::<f64>::zeros(21, 21);
    assert_eq!(
        helper::propagate(&mut state, &[imu, extrinsic], &[imu, extrinsic], &phi, &q),
        Err(StateError::NonContiguousOrder)
    );
}

#[test]
fn propagation_rejects_bad_dimensions() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    let phi = DMatrix::<f64>::identity(14, 15);
    let q = DMatrix::<f64>::zeros(14, 14);
    assert_eq!(
        helper::propagate(&mut state, &[imu], &[imu], &phi, &q),
        Err(StateError::DimensionMismatch)
    );
    assert_eq!(
        helper::propagate(&mut state, &[], &[imu], &phi, &q),
        Err(StateError::EmptyOrder)
    );
}

#[test]
fn scalar_update_matches_closed_form() {
    let mut state = State::new(StateOptions::default());
    let v1 = state.append_variable(VarValue::Vector(DVector::zeros(1)));
    let v2 = state.append_variable(VarValue::Vector(DVector::zeros(1)));
    let prior = DMatrix::<f64>::from_diagonal(&DVector::from_column_slice(&[4.0, 1.0]));
    helper::set_initial_covariance(&mut state, &[v1, v2], &prior).unwrap();

    let h = DMatrix::<f64>::from_row_slice(1, 2, &[1.0, 0.0]);
    let res = DVector::from_column_slice(&[2.0]);
    let r = DMatrix::<f64>::from_element(1, 1, 1.0);
    helper::update(&mut state, &[v1, v2], &h, &res, &r).unwrap();

    // S = 4 + 1, K = [0.8, 0], post covariance diag(0.8, 1), dx = [1.6, 0]
    let marg = helper::get_marginal_covariance(&state, &[v1, v2]).unwrap();
    assert_relative_eq!(marg[(0, 0)], 0.8, epsilon = 1e-12);
    assert_relative_eq!(marg[(1, 1)], 1.0, epsilon = 1e-12);
    assert_relative_eq!(marg[(0, 1)], 0.0, epsilon = 1e-12);

    match state.var(v1).value() {
        VarValue::Vector(v) => assert_relative_eq!(v[0], 1.6, epsilon = 1e-12),
        _ => panic!("expected a vector variable"),
    }
    match state.var(v2).value() {
        VarValue::Vector(v) => assert_relative_eq!(v[0], 0.0, epsilon = 1e-12),
        _ => panic!("expected a vector variable"),
    }

    // The uncorrelated inertial block is untouched
    let imu_marg = helper::get_marginal_covariance(&state, &[state.imu_key()]).unwrap();
    for i in 0..15 {
        assert_relative_eq!(imu_marg[(i, i)], 1e-6, epsilon = 1e-15);
    }
}

#[test]
fn update_never_increases_trace() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 5)).unwrap();
    let trace_before = helper::get_full_covariance(&state).trace();

    let mut rng = StdRng::seed_from_u64(6);
    let h = DMatrix::<f64>::from_fn(3, 15, |_, _| rng.sample(StandardNormal));
    let res = DVector::<f64>::from_fn(3, |_, _| rng.sample(StandardNormal));
    let r = DMatrix::<f64>::identity(3, 3) * 0.5;
    helper::update(&mut state, &[imu], &h, &res, &r).unwrap();

    let cov = helper::get_full_covariance(&state);
    assert!(
        cov.trace() <= trace_before + 1e-9,
        "update increased the trace: {} -> {}",
        trace_before,
        cov.trace()
    );
    assert_symmetric(&cov);
    assert_diag_nonneg(&cov);
}

#[test]
fn update_with_singular_innovation_fails() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    let h = DMatrix::<f64>::zeros(1, 15);
    let res = DVector::<f64>::zeros(1);
    let r = DMatrix::<f64>::zeros(1, 1);
    assert_eq!(
        helper::update(&mut state, &[imu], &h, &res, &r),
        Err(StateError::GainSingular)
    );
}

#[test]
fn initial_covariance_round_trip() {
    let mut state = State::new(StateOptions::default());
    let va = state.append_variable(VarValue::Vector(DVector::zeros(3)));
    let vb = state.append_variable(VarValue::Vector(DVector::zeros(2)));

    // Block-diagonal input over the two new variables
    let mut prior = DMatrix::<f64>::zeros(5, 5);
    prior
        .slice_mut((0, 0), (3, 3))
        .copy_from(&random_psd(3, 7));
    prior
        .slice_mut((3, 3), (2, 2))
        .copy_from(&random_psd(2, 8));

    helper::set_initial_covariance(&mut state, &[va, vb], &prior).unwrap();
    let marg = helper::get_marginal_covariance(&state, &[va, vb]).unwrap();
    assert_eq!(marg, prior);
}

#[test]
fn initial_covariance_rejects_bad_dimensions() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    let wrong = DMatrix::<f64>::zeros(14, 14);
    assert_eq!(
        helper::set_initial_covariance(&mut state, &[imu], &wrong),
        Err(StateError::DimensionMismatch)
    );
    assert_eq!(
        helper::set_initial_covariance(&mut state, &[], &wrong),
        Err(StateError::EmptyOrder)
    );
}

#[test]
fn cloning_replicates_the_source_stripes() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 9)).unwrap();

    let pose = helper::clone_variable(&mut state, VarRef::sub(imu, SubBlock::Pose)).unwrap();
    assert_eq!(state.cov_side(), 21);
    assert_eq!(state.var(pose).id(), Some(15));
    assert_layout(&state);

    // The IMU pose occupies rows [0, 6); the clone must replicate its
    // stripes exactly
    let cov = helper::get_full_covariance(&state);
    for i in 0..6 {
        for j in 0..15 {
            assert_eq!(cov[(15 + i, j)], cov[(i, j)], "row stripe differs");
            assert_eq!(cov[(j, 15 + i)], cov[(j, i)], "column stripe differs");
        }
    }
    for i in 0..6 {
        for j in 0..6 {
            assert_eq!(cov[(15 + i, 15 + j)], cov[(i, j)], "diagonal block differs");
            assert_eq!(cov[(i, 15 + j)], cov[(i, j)], "cross block differs");
        }
    }
    assert_symmetric(&cov);

    // The clone carries the same value as the source pose
    let (_, source_pose) = state.imu().sub_value(SubBlock::Pose).unwrap();
    assert_eq!(*state.var(pose).value(), source_pose);
}

#[test]
fn cloning_a_detached_variable_fails() {
    let mut state = State::new(StateOptions::default());
    // The time offset exists but is not attached under default options
    let dt = state.calib_dt_key();
    assert_eq!(
        helper::clone_variable(&mut state, VarRef::whole(dt)),
        Err(StateError::DetachedVariable)
    );
}

#[test]
fn marginalizing_the_middle_variable_deletes_its_stripe() {
    let mut state = State::new(StateOptions::default());
    let va = state.append_variable(VarValue::Vector(DVector::zeros(3)));
    let vb = state.append_variable(VarValue::Vector(DVector::zeros(3)));
    let vc = state.append_variable(VarValue::Vector(DVector::zeros(3)));
    helper::set_initial_covariance(&mut state, &[va, vb, vc], &random_psd(9, 10)).unwrap();
    assert_eq!(state.cov_side(), 24);

    let before = helper::get_marginal_covariance(&state, &[va, vc]).unwrap();
    helper::marginalize(&mut state, vb).unwrap();

    assert_eq!(state.cov_side(), 21);
    assert_eq!(state.var(va).id(), Some(15));
    assert_eq!(state.var(vc).id(), Some(18));
    assert_eq!(state.var(vb).id(), None);
    assert_layout(&state);

    // Deleting the middle rows/columns must not disturb the survivors
    let after = helper::get_marginal_covariance(&state, &[va, vc]).unwrap();
    assert_eq!(before, after);

    // Operating on a detached variable now fails
    assert_eq!(
        helper::marginalize(&mut state, vb),
        Err(StateError::DetachedVariable)
    );
    assert_eq!(
        helper::clone_variable(&mut state, VarRef::whole(vb)),
        Err(StateError::DetachedVariable)
    );
}

#[test]
fn marginalization_is_consistent_with_never_cloning() {
    // Cloning a pose and marginalizing it right away must leave the exact
    // same covariance behind
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 11)).unwrap();
    let before = helper::get_full_covariance(&state);

    let pose = helper::clone_variable(&mut state, VarRef::sub(imu, SubBlock::Pose)).unwrap();
    helper::marginalize(&mut state, pose).unwrap();

    let after = helper::get_full_covariance(&state);
    assert_eq!(before, after);
    assert_layout(&state);
}

#[test]
fn augmenting_registers_the_clone() {
    let mut state = State::new(StateOptions::default());
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 12)).unwrap();
    state.timestamp = 1_000_000;

    let pose = helper::augment_clone(&mut state, &Vector3::zeros()).unwrap();
    assert_eq!(state.n_clones(), 1);
    assert_eq!(state.clone_at(1_000_000), Some(pose));
    assert_eq!(state.margtimestep(), Some(1_000_000));
    assert_eq!(state.cov_side(), 21);

    // A second clone at the same timestamp is a contract violation
    assert_eq!(
        helper::augment_clone(&mut state, &Vector3::zeros()),
        Err(StateError::DuplicateClone)
    );
}

#[test]
fn augmenting_with_time_offset_calibration() {
    let options = StateOptions {
        num_cameras: 0,
        do_calib_camera_timeoffset: true,
        ..Default::default()
    };
    let mut state = State::new(options);
    let imu = state.imu_key();
    let dt = state.calib_dt_key();
    assert_eq!(state.cov_side(), 16);

    // Identity prior except a distinctive time-offset variance
    let mut prior = DMatrix::<f64>::identity(16, 16);
    prior[(15, 15)] = 9.0;
    helper::set_initial_covariance(&mut state, &[imu, dt], &prior).unwrap();

    state.set_imu_state(
        na::UnitQuaternion::identity(),
        Vector3::zeros(),
        Vector3::new(4.0, 5.0, 6.0),
        Vector3::zeros(),
        Vector3::zeros(),
    );
    state.timestamp = 42;
    let pose = helper::augment_clone(&mut state, &Vector3::new(1.0, 2.0, 3.0)).unwrap();
    assert_eq!(state.var(pose).id(), Some(16));

    // dnew/ddt = [w; v]; with a diagonal prior the only correction flows
    // through the offset variance
    let jac = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let cov = helper::get_full_covariance(&state);
    for (j, jac_j) in jac.iter().enumerate() {
        assert_relative_eq!(cov[(15, 16 + j)], 9.0 * jac_j, epsilon = 1e-12);
        assert_relative_eq!(cov[(16 + j, 15)], 9.0 * jac_j, epsilon = 1e-12);
        for (k, jac_k) in jac.iter().enumerate() {
            let base = if j == k { 1.0 } else { 0.0 };
            assert_relative_eq!(
                cov[(16 + j, 16 + k)],
                base + 9.0 * jac_j * jac_k,
                epsilon = 1e-12
            );
        }
    }
    assert_symmetric(&cov);
    assert_diag_nonneg(&cov);
}

#[test]
fn old_clones_leave_once_the_window_is_full() {
    let options = StateOptions {
        max_clone_size: 2,
        ..Default::default()
    };
    let mut state = State::new(options);
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 13)).unwrap();

    for t in &[100_i64, 200, 300] {
        state.timestamp = *t;
        helper::augment_clone(&mut state, &Vector3::zeros()).unwrap();
    }
    assert_eq!(state.n_clones(), 3);
    assert_eq!(state.cov_side(), 33);

    helper::marginalize_old_clone(&mut state).unwrap();
    assert_eq!(state.n_clones(), 2);
    assert_eq!(state.clone_at(100), None);
    assert_eq!(state.margtimestep(), Some(200));
    assert_eq!(state.cov_side(), 27);
    assert_layout(&state);

    // The window fits now, nothing else is removed
    helper::marginalize_old_clone(&mut state).unwrap();
    assert_eq!(state.n_clones(), 2);
}

#[test]
fn slam_marginalization_protects_aruco_ids() {
    let options = StateOptions {
        max_aruco_features: 1,
        ..Default::default()
    };
    let mut state = State::new(options);
    let protected = state.append_variable(VarValue::Landmark {
        p: Vector3::new(1.0, 0.0, 0.0),
        should_marg: false,
    });
    let doomed = state.append_variable(VarValue::Landmark {
        p: Vector3::new(0.0, 1.0, 0.0),
        should_marg: false,
    });
    state.insert_feature(3, protected);
    state.insert_feature(10, doomed);
    helper::set_initial_covariance(
        &mut state,
        &[protected, doomed],
        &(DMatrix::<f64>::identity(6, 6) * 0.2),
    )
    .unwrap();

    state.flag_feature_for_marg(3);
    state.flag_feature_for_marg(10);
    helper::marginalize_slam(&mut state).unwrap();

    // Feature 3 sits inside the protected ArUco range (ids up to 4)
    assert_eq!(state.n_features(), 1);
    assert!(state.feature(3).is_some());
    assert!(state.feature(10).is_none());
    assert_eq!(state.var(doomed).id(), None);
    assert_eq!(state.cov_side(), 18);
    assert_layout(&state);
}

#[test]
fn lifecycle_preserves_invariants() {
    let options = StateOptions {
        max_clone_size: 1,
        ..Default::default()
    };
    let mut state = State::new(options);
    let imu = state.imu_key();
    helper::set_initial_covariance(&mut state, &[imu], &random_psd(15, 14)).unwrap();

    let mut rng = StdRng::seed_from_u64(15);
    for step in 0_i64..4 {
        state.timestamp = 1_000 * (step + 1);

        let phi = DMatrix::<f64>::from_fn(15, 15, |i, j| {
            if i == j {
                1.0
            } else {
                0.01 * rng.sample::<f64, _>(StandardNormal)
            }
        });
        let q = random_psd(15, 20 + step as u64) * 0.001;
        helper::propagate(&mut state, &[imu], &[imu], &phi, &q).unwrap();

        let pose = helper::augment_clone(&mut state, &Vector3::zeros()).unwrap();
        let h = DMatrix::<f64>::from_fn(2, 6, |_, _| rng.sample(StandardNormal));
        let res = DVector::<f64>::from_fn(2, |_, _| 0.01 * rng.sample::<f64, _>(StandardNormal));
        let r = DMatrix::<f64>::identity(2, 2) * 0.1;
        helper::update(&mut state, &[pose], &h, &res, &r).unwrap();

        helper::marginalize_old_clone(&mut state).unwrap();

        let cov = helper::get_full_covariance(&state);
        assert_symmetric(&cov);
        assert_diag_nonneg(&cov);
        assert_layout(&state);
        assert!(state.n_clones() <= 2);
    }
}
