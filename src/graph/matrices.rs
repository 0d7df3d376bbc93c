//! Sparse matrix assembly for the pose-graph quadratic cost.
//!
//! The quadratic cost of a set of relative pose measurements decomposes into
//! per-edge connection-Laplacian blocks over the homogeneous `(d+1)`-blocks
//! of each pose, and into the `B₁`, `B₂`, `B₃` factors used by the chordal
//! initialization.

use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, TriMat};

use crate::error::{PgoError, PgoResult};
use crate::measurement::RelativePoseMeasurement;

/// Copy a dense block into a triplet matrix at the given offsets, skipping
/// exact zeros.
pub(crate) fn add_block(tri: &mut TriMat<f64>, row0: usize, col0: usize, block: &DMatrix<f64>) {
    for c in 0..block.ncols() {
        for r in 0..block.nrows() {
            let v = block[(r, c)];
            if v != 0.0 {
                tri.add_triplet(row0 + r, col0 + c, v);
            }
        }
    }
}

/// The three `(d+1) x (d+1)` connection-Laplacian blocks contributed by a
/// single edge: `(L_tail_tail, L_head_head, L_tail_head)`.
///
/// With `T̂ = [R̂ t̂; 0 1]` and `Ω = w·diag(κI_d, τ)`, these are `T̂ΩT̂ᵀ`, `Ω`,
/// and `−T̂Ω` respectively.
pub(crate) fn edge_laplacian_blocks(
    m: &RelativePoseMeasurement,
) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
    let d = m.dimension();
    let kappa = m.weight * m.kappa;
    let tau = m.weight * m.tau;

    let mut l_tail = DMatrix::zeros(d + 1, d + 1);
    l_tail
        .view_mut((0, 0), (d, d))
        .copy_from(&(DMatrix::identity(d, d) * kappa + &m.translation * m.translation.transpose() * tau));
    l_tail
        .view_mut((0, d), (d, 1))
        .copy_from(&(&m.translation * tau));
    l_tail
        .view_mut((d, 0), (1, d))
        .copy_from(&(m.translation.transpose() * tau));
    l_tail[(d, d)] = tau;

    let mut l_head = DMatrix::zeros(d + 1, d + 1);
    l_head
        .view_mut((0, 0), (d, d))
        .copy_from(&(DMatrix::identity(d, d) * kappa));
    l_head[(d, d)] = tau;

    let mut l_cross = DMatrix::zeros(d + 1, d + 1);
    l_cross
        .view_mut((0, 0), (d, d))
        .copy_from(&(&m.rotation * (-kappa)));
    l_cross
        .view_mut((0, d), (d, 1))
        .copy_from(&(&m.translation * (-tau)));
    l_cross[(d, d)] = -tau;

    (l_tail, l_head, l_cross)
}

/// Connection Laplacian `L = A·Ω·Aᵀ` of a set of intra-robot measurements
/// over `n` poses, as an `n(d+1) x n(d+1)` sparse matrix.
///
/// Pose indices in the measurements are interpreted as local frame ids.
pub fn connection_laplacian(
    measurements: &[RelativePoseMeasurement],
    d: usize,
    n: usize,
) -> PgoResult<CsMat<f64>> {
    let dim = n * (d + 1);
    let mut tri = TriMat::new((dim, dim));
    for m in measurements {
        if m.dimension() != d {
            return Err(PgoError::dims(format!("dimension {d}"), format!("{}", m.dimension())));
        }
        if m.p1 >= n || m.p2 >= n {
            return Err(PgoError::DataMatrix(format!(
                "measurement ({}, {}) out of range for {n} poses",
                m.p1, m.p2
            )));
        }
        let (l_tail, l_head, l_cross) = edge_laplacian_blocks(m);
        let (bi, bj) = (m.p1 * (d + 1), m.p2 * (d + 1));
        add_block(&mut tri, bi, bi, &l_tail);
        add_block(&mut tri, bj, bj, &l_head);
        add_block(&mut tri, bi, bj, &l_cross);
        add_block(&mut tri, bj, bi, &l_cross.transpose());
    }
    Ok(tri.to_csc())
}

/// The sparse factors `(B₁, B₂, B₃)` of the pose-graph cost over `n` poses:
///
/// * `B₁ ∈ ℝ^{dm x dn}`: `(ed+l, p₁d+l) = -√τ_e`, `(ed+l, p₂d+l) = +√τ_e`;
/// * `B₂ ∈ ℝ^{dm x d²n}`: `(de+r, d²p₁+dk+r) = -√τ_e · t̂_e(k)`;
/// * `B₃ ∈ ℝ^{d²m x d²n}`: `-√κ_e · R̂ᵀ ⊗ I_d` at the tail block and
///   `+√κ_e · I_{d²}` at the head block.
pub fn construct_b_matrices(
    measurements: &[RelativePoseMeasurement],
    d: usize,
    n: usize,
) -> PgoResult<(CsMat<f64>, CsMat<f64>, CsMat<f64>)> {
    let m_count = measurements.len();
    if m_count == 0 {
        return Err(PgoError::DataMatrix("no measurements".to_string()));
    }
    let d2 = d * d;

    let mut b1 = TriMat::new((d * m_count, d * n));
    let mut b2 = TriMat::new((d * m_count, d2 * n));
    let mut b3 = TriMat::new((d2 * m_count, d2 * n));

    for (e, m) in measurements.iter().enumerate() {
        if m.dimension() != d {
            return Err(PgoError::dims(format!("dimension {d}"), format!("{}", m.dimension())));
        }
        if m.p1 >= n || m.p2 >= n {
            return Err(PgoError::DataMatrix(format!(
                "measurement ({}, {}) out of range for {n} poses",
                m.p1, m.p2
            )));
        }
        let (i, j) = (m.p1, m.p2);
        let sqrt_tau = m.tau.sqrt();
        let sqrt_kappa = m.kappa.sqrt();

        for l in 0..d {
            b1.add_triplet(e * d + l, i * d + l, -sqrt_tau);
            b1.add_triplet(e * d + l, j * d + l, sqrt_tau);
        }

        for k in 0..d {
            for r in 0..d {
                b2.add_triplet(d * e + r, d2 * i + d * k + r, -sqrt_tau * m.translation[k]);
            }
        }

        for r in 0..d {
            for c in 0..d {
                for l in 0..d {
                    b3.add_triplet(
                        e * d2 + d * r + l,
                        i * d2 + d * c + l,
                        -sqrt_kappa * m.rotation[(c, r)],
                    );
                }
            }
        }
        for l in 0..d2 {
            b3.add_triplet(e * d2 + l, j * d2 + l, sqrt_kappa);
        }
    }

    Ok((b1.to_csc(), b2.to_csc(), b3.to_csc()))
}

/// `y = A·x` for a CSC matrix and a dense vector.
pub(crate) fn csc_times_vec(a: &CsMat<f64>, x: &DVector<f64>) -> DVector<f64> {
    debug_assert!(a.is_csc());
    debug_assert_eq!(a.cols(), x.len());
    let mut y = DVector::zeros(a.rows());
    for (j, col) in a.outer_iterator().enumerate() {
        let xj = x[j];
        if xj != 0.0 {
            for (i, &v) in col.iter() {
                y[i] += v * xj;
            }
        }
    }
    y
}

/// `y = Aᵀ·x` for a CSC matrix and a dense vector.
pub(crate) fn csc_transpose_times_vec(a: &CsMat<f64>, x: &DVector<f64>) -> DVector<f64> {
    debug_assert!(a.is_csc());
    debug_assert_eq!(a.rows(), x.len());
    let mut y = DVector::zeros(a.cols());
    for (j, col) in a.outer_iterator().enumerate() {
        let mut acc = 0.0;
        for (i, &v) in col.iter() {
            acc += v * x[i];
        }
        y[j] = acc;
    }
    y
}

/// `Y = X·A` for a dense matrix and a CSC matrix.
pub(crate) fn dense_times_csc(x: &DMatrix<f64>, a: &CsMat<f64>) -> DMatrix<f64> {
    debug_assert!(a.is_csc());
    debug_assert_eq!(x.ncols(), a.rows());
    let mut y = DMatrix::zeros(x.nrows(), a.cols());
    for (j, col) in a.outer_iterator().enumerate() {
        for (i, &v) in col.iter() {
            y.column_mut(j).axpy(v, &x.column(i), 1.0);
        }
    }
    y
}
