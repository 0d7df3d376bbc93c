//! The local Riemannian quadratic subproblem of one agent.
//!
//! Given the cached data matrices `Q` (sparse, own block) and `G` (the
//! neighbor coupling already contracted with the current neighbor snapshot),
//! the local cost over the iterate `X ∈ (St(d, r) × ℝʳ)ⁿ` is
//!
//! ```text
//! f(X) = tr(X·Q·Xᵀ) + 2·tr(X·Gᵀ)
//! ```
//!
//! with Euclidean gradient `2(XQ + G)` and Euclidean Hessian-vector product
//! `2·V·Q`. The Riemannian quantities are obtained through the manifold's
//! tangent projection, with the usual Stiefel curvature correction for the
//! Hessian.

use nalgebra::DMatrix;
use sprs::CsMat;

use crate::error::{PgoError, PgoResult};
use crate::graph::matrices::dense_times_csc;
use crate::manifold::LiftedPoseManifold;

/// Quadratic cost over one agent's block, with fixed neighbor data.
pub struct QuadraticProblem<'a> {
    quadratic: &'a CsMat<f64>,
    linear: &'a DMatrix<f64>,
    manifold: LiftedPoseManifold,
}

impl<'a> QuadraticProblem<'a> {
    pub fn new(
        quadratic: &'a CsMat<f64>,
        linear: &'a DMatrix<f64>,
        manifold: LiftedPoseManifold,
    ) -> PgoResult<Self> {
        let dim = manifold.num_poses() * (manifold.dimension() + 1);
        if quadratic.rows() != dim || quadratic.cols() != dim {
            return Err(PgoError::dims(
                format!("{dim}x{dim}"),
                format!("{}x{}", quadratic.rows(), quadratic.cols()),
            ));
        }
        if linear.nrows() != manifold.relaxation_rank() || linear.ncols() != dim {
            return Err(PgoError::dims(
                format!("{}x{dim}", manifold.relaxation_rank()),
                format!("{}x{}", linear.nrows(), linear.ncols()),
            ));
        }
        Ok(QuadraticProblem {
            quadratic,
            linear,
            manifold,
        })
    }

    pub fn manifold(&self) -> &LiftedPoseManifold {
        &self.manifold
    }

    pub fn cost(&self, x: &DMatrix<f64>) -> f64 {
        let xq = dense_times_csc(x, self.quadratic);
        xq.dot(x) + 2.0 * self.linear.dot(x)
    }

    pub fn euclidean_gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        (dense_times_csc(x, self.quadratic) + self.linear) * 2.0
    }

    pub fn euclidean_hessian_vec(&self, v: &DMatrix<f64>) -> DMatrix<f64> {
        dense_times_csc(v, self.quadratic) * 2.0
    }

    pub fn riemannian_gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.manifold.tangent_project(x, &self.euclidean_gradient(x))
    }

    /// Riemannian Hessian-vector product at `x` along the tangent vector `v`.
    ///
    /// `egrad` must be the Euclidean gradient at `x`; passing it in avoids
    /// recomputation inside the inner solver loop.
    pub fn riemannian_hessian_vec(
        &self,
        x: &DMatrix<f64>,
        egrad: &DMatrix<f64>,
        v: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        let mut w = self.euclidean_hessian_vec(v);
        let (r, d) = (self.manifold.relaxation_rank(), self.manifold.dimension());
        for i in 0..self.manifold.num_poses() {
            let start = i * (d + 1);
            let y = x.view((0, start), (r, d));
            let gy = egrad.view((0, start), (r, d));
            let vy = v.view((0, start), (r, d));
            let a = y.transpose() * gy;
            let sym = (&a + a.transpose()) * 0.5;
            let correction = vy * sym;
            let mut target = w.view_mut((0, start), (r, d));
            target -= &correction;
        }
        self.manifold.tangent_project(x, &w)
    }

    pub fn gradient_norm(&self, x: &DMatrix<f64>) -> f64 {
        self.riemannian_gradient(x).norm()
    }
}
