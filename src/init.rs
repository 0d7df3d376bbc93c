//! Trajectory initialization: chordal relaxation and odometry integration.
//!
//! The chordal initialization pins the first rotation to the identity, solves
//! the reduced `B₃` least-squares system for the remaining rotation blocks,
//! projects each block back to `SO(d)`, and finally recovers translations
//! from `B₁` and `B₂`. The sparse least-squares solves go through the normal
//! equations with an LDLᵀ factorization; after pinning the first pose the
//! reduced systems are positive definite on connected graphs.

use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;
use tracing::debug;

use crate::error::{PgoError, PgoResult};
use crate::graph::construct_b_matrices;
use crate::graph::matrices::{csc_times_vec, csc_transpose_times_vec};
use crate::manifold::project_to_rotation_group;
use crate::measurement::RelativePoseMeasurement;
use crate::pose::{Pose, PoseArray};

/// Solve the symmetric positive definite sparse system `A·x = b`.
fn solve_spd(a: &CsMat<f64>, b: &DVector<f64>) -> PgoResult<DVector<f64>> {
    let ldl = Ldl::new()
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(a.view())
        .map_err(|e| PgoError::LinearSolve(format!("LDL factorization failed: {e:?}")))?;
    let rhs: Vec<f64> = b.iter().copied().collect();
    let solution = ldl.solve(&rhs);
    Ok(DVector::from_vec(solution))
}

/// Least-squares solve `min ‖A·x + c‖` through the normal equations
/// `(AᵀA)·x = -Aᵀc`.
fn solve_least_squares(a: &CsMat<f64>, c: &DVector<f64>) -> PgoResult<DVector<f64>> {
    let at = a.clone().transpose_into();
    let gram = (&at * a).to_csc();
    let rhs = -csc_transpose_times_vec(a, c);
    solve_spd(&gram, &rhs)
}

/// Chordal initialization of `n` poses from intra-robot measurements.
///
/// The first pose is pinned to the origin; the result is expressed in that
/// pose's frame.
pub fn chordal_initialization(
    d: usize,
    n: usize,
    measurements: &[RelativePoseMeasurement],
) -> PgoResult<PoseArray> {
    if n == 0 {
        return Err(PgoError::DataMatrix("no poses to initialize".to_string()));
    }
    if n == 1 {
        return Ok(PoseArray::new(d, 1));
    }
    let d2 = d * d;
    let (b1, b2, b3) = construct_b_matrices(measurements, d, n)?;

    // Split B3 into the pinned first block-column (multiplied by vec(I_d))
    // and the reduced system over the remaining rotations.
    let mut reduced = TriMat::new((b3.rows(), d2 * (n - 1)));
    let mut pinned_rhs = DVector::zeros(b3.rows());
    for (&v, (row, col)) in b3.iter() {
        if col < d2 {
            // vec(I_d) is 1 at column-major indices d·k + k
            let (k, r) = (col / d, col % d);
            if k == r {
                pinned_rhs[row] += v;
            }
        } else {
            reduced.add_triplet(row, col - d2, v);
        }
    }
    let reduced = reduced.to_csc();
    let rotation_vec = solve_least_squares(&reduced, &pinned_rhs)?;

    // Reassemble the stacked rotation matrix [R_0 | R_1 | ... | R_{n-1}]
    // and project every block back onto SO(d).
    let mut rotations = DMatrix::zeros(d, d * n);
    rotations.view_mut((0, 0), (d, d)).fill_with_identity();
    for p in 1..n {
        for k in 0..d {
            for r in 0..d {
                rotations[(r, p * d + k)] = rotation_vec[d2 * (p - 1) + d * k + r];
            }
        }
    }
    for p in 0..n {
        let block = rotations.view((0, p * d), (d, d)).into_owned();
        rotations
            .view_mut((0, p * d), (d, d))
            .copy_from(&project_to_rotation_group(&block));
    }

    let translations = recover_translations(&b1, &b2, &rotations)?;

    let mut out = PoseArray::new(d, n);
    for p in 0..n {
        out.set_rotation(p, &rotations.view((0, p * d), (d, d)).into_owned());
        out.set_translation(p, &translations.column(p).into_owned());
    }
    debug!(poses = n, "chordal initialization complete");
    Ok(out)
}

/// Recover translations from the rotation estimate:
/// `t = [0 | -(B₁ʳᵉᵈ)⁺ · B₂ · vec(R)]`, with the first pose pinned to the
/// origin.
pub fn recover_translations(
    b1: &CsMat<f64>,
    b2: &CsMat<f64>,
    rotations: &DMatrix<f64>,
) -> PgoResult<DMatrix<f64>> {
    let d = rotations.nrows();
    let n = rotations.ncols() / d;

    // Column-major flattening of each d x d block.
    let mut rotation_vec = DVector::zeros(d * d * n);
    for p in 0..n {
        for k in 0..d {
            for r in 0..d {
                rotation_vec[d * d * p + d * k + r] = rotations[(r, p * d + k)];
            }
        }
    }
    let c = csc_times_vec(b2, &rotation_vec);

    // Drop the first pose's columns of B1 (its translation is pinned to 0).
    let mut reduced = TriMat::new((b1.rows(), d * (n - 1)));
    for (&v, (row, col)) in b1.iter() {
        if col >= d {
            reduced.add_triplet(row, col - d, v);
        }
    }
    let reduced = reduced.to_csc();
    let t_reduced = solve_least_squares(&reduced, &c)?;

    let mut t = DMatrix::zeros(d, n);
    for p in 1..n {
        for r in 0..d {
            t[(r, p)] = t_reduced[d * (p - 1) + r];
        }
    }
    Ok(t)
}

/// Integrate the odometry chain from the identity.
pub fn odometry_initialization(
    d: usize,
    n: usize,
    odometry: &[RelativePoseMeasurement],
) -> PgoResult<PoseArray> {
    let mut by_tail: Vec<Option<&RelativePoseMeasurement>> = vec![None; n];
    for m in odometry {
        if m.p2 != m.p1 + 1 || m.p1 >= n {
            return Err(PgoError::DataMatrix(format!(
                "not an odometry edge: {} -> {}",
                m.tail_id(),
                m.head_id()
            )));
        }
        by_tail[m.p1] = Some(m);
    }

    let mut out = PoseArray::new(d, n);
    let mut current = Pose::identity(d);
    for i in 0..n.saturating_sub(1) {
        let m = by_tail[i].ok_or_else(|| {
            PgoError::DataMatrix(format!("odometry chain has no edge leaving pose {i}"))
        })?;
        let step = Pose::from_parts(m.rotation.clone(), m.translation.clone())?;
        current = current.compose(&step);
        out.set_pose(i + 1, &current);
    }
    Ok(out)
}
