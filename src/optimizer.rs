//! Riemannian solvers for the local quadratic subproblem.
//!
//! Two algorithms are available per agent:
//! - **Trust region** (the default): outer accept/reject iterations around a
//!   Steihaug–Toint truncated conjugate gradient subproblem solver.
//! - **Gradient descent** with Armijo backtracking or a fixed step.
//!
//! Both are pure drivers over the problem seam `{cost, gradient,
//! Hessian-vector, retract, tangent-project}`; neither ever fails — when the
//! iteration budget runs out the best iterate found so far is returned.

use std::fmt;
use std::time::Instant;

use nalgebra::DMatrix;
use tracing::{debug, trace};

use crate::problem::QuadraticProblem;

/// Riemannian optimization algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiemannianAlgorithm {
    /// Riemannian trust region with a truncated-CG subproblem solver.
    #[default]
    TrustRegion,
    /// Riemannian gradient descent.
    GradientDescent,
}

impl fmt::Display for RiemannianAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiemannianAlgorithm::TrustRegion => write!(f, "RTR"),
            RiemannianAlgorithm::GradientDescent => write!(f, "RGD"),
        }
    }
}

/// Configuration of the quadratic optimizer.
///
/// The defaults are the settings of the distributed loop: a single outer
/// trust-region iteration with a small inner budget, enough to guarantee
/// forward progress at every tick. [`OptimizerParams::local_bootstrap`] is
/// the more patient configuration used for the rank-`d` chordal polish.
#[derive(Debug, Clone)]
pub struct OptimizerParams {
    pub algorithm: RiemannianAlgorithm,
    pub gradient_tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub initial_radius: f64,
    pub rgd_step_size: f64,
    pub rgd_use_line_search: bool,
    pub verbose: bool,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        OptimizerParams {
            algorithm: RiemannianAlgorithm::TrustRegion,
            gradient_tolerance: 1e-2,
            max_outer_iterations: 1,
            max_inner_iterations: 10,
            initial_radius: 100.0,
            rgd_step_size: 1e-2,
            rgd_use_line_search: true,
            verbose: false,
        }
    }
}

impl OptimizerParams {
    /// Settings for the local chordal bootstrap solve.
    pub fn local_bootstrap() -> Self {
        OptimizerParams {
            gradient_tolerance: 1e-1,
            max_outer_iterations: 10,
            max_inner_iterations: 50,
            initial_radius: 10.0,
            ..OptimizerParams::default()
        }
    }
}

/// Summary of one optimizer run.
#[derive(Debug, Clone)]
pub struct OptResult {
    pub f_init: f64,
    pub f_opt: f64,
    pub grad_norm_init: f64,
    pub grad_norm_opt: f64,
    pub outer_iterations: usize,
    pub elapsed: std::time::Duration,
}

impl fmt::Display for OptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "df: {:.6e}, |g0|: {:.6e}, |g1|: {:.6e}, iters: {}, elapsed: {:?}",
            self.f_init - self.f_opt,
            self.grad_norm_init,
            self.grad_norm_opt,
            self.outer_iterations,
            self.elapsed
        )
    }
}

// Trust-region ratio thresholds and radius update factors.
const RHO_ACCEPT: f64 = 0.1;
const RHO_SHRINK: f64 = 0.25;
const RHO_GROW: f64 = 0.75;
const RADIUS_SHRINK_FACTOR: f64 = 0.25;
const RADIUS_GROW_FACTOR: f64 = 2.0;
const MAX_RADIUS_FACTOR: f64 = 1e4;

/// Driver for the Riemannian solvers over one [`QuadraticProblem`].
pub struct QuadraticOptimizer<'a> {
    problem: &'a QuadraticProblem<'a>,
    params: OptimizerParams,
}

impl<'a> QuadraticOptimizer<'a> {
    pub fn new(problem: &'a QuadraticProblem<'a>) -> Self {
        QuadraticOptimizer {
            problem,
            params: OptimizerParams::default(),
        }
    }

    pub fn with_params(mut self, params: OptimizerParams) -> Self {
        self.params = params;
        self
    }

    /// Minimize the problem starting from the manifold point `x0`.
    ///
    /// Never fails: if the budget is exhausted the best iterate is returned.
    pub fn optimize(&self, x0: &DMatrix<f64>) -> (DMatrix<f64>, OptResult) {
        let start = Instant::now();
        let f_init = self.problem.cost(x0);
        let grad_norm_init = self.problem.gradient_norm(x0);

        let (x, outer_iterations) = match self.params.algorithm {
            RiemannianAlgorithm::TrustRegion => self.trust_region(x0),
            RiemannianAlgorithm::GradientDescent => self.gradient_descent(x0),
        };

        let result = OptResult {
            f_init,
            f_opt: self.problem.cost(&x),
            grad_norm_init,
            grad_norm_opt: self.problem.gradient_norm(&x),
            outer_iterations,
            elapsed: start.elapsed(),
        };
        if self.params.verbose {
            debug!(algorithm = %self.params.algorithm, %result, "optimizer finished");
        }
        (x, result)
    }

    fn trust_region(&self, x0: &DMatrix<f64>) -> (DMatrix<f64>, usize) {
        let manifold = self.problem.manifold();
        let mut x = x0.clone();
        let mut fx = self.problem.cost(&x);
        let mut radius = self.params.initial_radius;
        let max_radius = self.params.initial_radius * MAX_RADIUS_FACTOR;
        let mut iterations = 0;

        for _ in 0..self.params.max_outer_iterations {
            iterations += 1;
            let egrad = self.problem.euclidean_gradient(&x);
            let grad = manifold.tangent_project(&x, &egrad);
            if grad.norm() <= self.params.gradient_tolerance {
                break;
            }

            let eta = self.truncated_cg(&x, &egrad, &grad, radius);
            let eta_norm = eta.norm();

            let candidate = manifold.retract(&x, &eta);
            let f_candidate = self.problem.cost(&candidate);

            // Model reduction: m(0) - m(eta) = -<g, eta> - 0.5 <eta, H eta>
            let h_eta = self.problem.riemannian_hessian_vec(&x, &egrad, &eta);
            let predicted = -grad.dot(&eta) - 0.5 * eta.dot(&h_eta);
            let actual = fx - f_candidate;
            let rho = if predicted.abs() > f64::EPSILON {
                actual / predicted
            } else {
                -1.0
            };

            trace!(rho, radius, eta_norm, "trust-region step");
            if rho > RHO_ACCEPT && actual > 0.0 {
                x = candidate;
                fx = f_candidate;
            }
            if rho < RHO_SHRINK {
                radius *= RADIUS_SHRINK_FACTOR;
            } else if rho > RHO_GROW && eta_norm >= 0.99 * radius {
                radius = (radius * RADIUS_GROW_FACTOR).min(max_radius);
            }
        }
        (x, iterations)
    }

    /// Steihaug–Toint truncated conjugate gradient on the trust-region
    /// subproblem at `x`.
    fn truncated_cg(
        &self,
        x: &DMatrix<f64>,
        egrad: &DMatrix<f64>,
        grad: &DMatrix<f64>,
        radius: f64,
    ) -> DMatrix<f64> {
        // Residual-reduction targets (theta = 1 gives superlinear behaviour).
        const KAPPA: f64 = 0.1;
        const THETA: f64 = 1.0;

        let mut eta = DMatrix::zeros(grad.nrows(), grad.ncols());
        let mut residual = grad.clone();
        let mut delta = -residual.clone();
        let r0_norm = residual.norm();
        if r0_norm == 0.0 {
            return eta;
        }
        let target = r0_norm * KAPPA.min(r0_norm.powf(THETA));

        for _ in 0..self.params.max_inner_iterations {
            let h_delta = self.problem.riemannian_hessian_vec(x, egrad, &delta);
            let curvature = delta.dot(&h_delta);
            let rr = residual.dot(&residual);

            if curvature <= 0.0 {
                let tau = boundary_step(&eta, &delta, radius);
                return eta + delta * tau;
            }

            let alpha = rr / curvature;
            let eta_next = &eta + &delta * alpha;
            if eta_next.norm() >= radius {
                let tau = boundary_step(&eta, &delta, radius);
                return eta + delta * tau;
            }

            let residual_next = &residual + h_delta * alpha;
            let rr_next = residual_next.dot(&residual_next);
            if rr_next.sqrt() <= target {
                return eta_next;
            }

            delta = -&residual_next + delta * (rr_next / rr);
            eta = eta_next;
            residual = residual_next;
        }
        eta
    }

    fn gradient_descent(&self, x0: &DMatrix<f64>) -> (DMatrix<f64>, usize) {
        const ARMIJO_SLOPE: f64 = 1e-4;
        const MAX_BACKTRACKS: usize = 20;

        let manifold = self.problem.manifold();
        let mut x = x0.clone();
        let mut iterations = 0;

        for _ in 0..self.params.max_outer_iterations {
            iterations += 1;
            let grad = self.problem.riemannian_gradient(&x);
            let grad_norm_sq = grad.norm_squared();
            if grad_norm_sq.sqrt() <= self.params.gradient_tolerance {
                break;
            }

            if self.params.rgd_use_line_search {
                let fx = self.problem.cost(&x);
                let mut step = self.params.rgd_step_size;
                let mut accepted = false;
                for _ in 0..MAX_BACKTRACKS {
                    let candidate = manifold.retract(&x, &(&grad * -step));
                    if self.problem.cost(&candidate) <= fx - ARMIJO_SLOPE * step * grad_norm_sq {
                        x = candidate;
                        accepted = true;
                        break;
                    }
                    step *= 0.5;
                }
                if !accepted {
                    break;
                }
            } else {
                x = manifold.retract(&x, &(&grad * -self.params.rgd_step_size));
            }
        }
        (x, iterations)
    }
}

/// Step length `tau >= 0` such that `‖eta + tau·delta‖ = radius`.
fn boundary_step(eta: &DMatrix<f64>, delta: &DMatrix<f64>, radius: f64) -> f64 {
    let ed = eta.dot(delta);
    let dd = delta.dot(delta);
    let ee = eta.dot(eta);
    if dd == 0.0 {
        return 0.0;
    }
    let discriminant = (ed * ed + dd * (radius * radius - ee)).max(0.0);
    (-ed + discriminant.sqrt()) / dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PoseGraph;
    use crate::manifold::LiftedPoseManifold;
    use crate::measurement::RelativePoseMeasurement;
    use nalgebra::{DMatrix, DVector};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn chain_graph(n: usize) -> PoseGraph {
        let mut graph = PoseGraph::new(0, 4, 3);
        for i in 0..n - 1 {
            graph
                .add_measurement(RelativePoseMeasurement::new(
                    0,
                    i,
                    0,
                    i + 1,
                    DMatrix::identity(3, 3),
                    DVector::from_vec(vec![1.0, 0.5, 0.0]),
                    1.0,
                    1.0,
                ))
                .unwrap();
        }
        graph.construct_data_matrices().unwrap();
        graph
    }

    #[test]
    fn test_trust_region_reduces_cost() {
        let graph = chain_graph(4);
        let (q, g) = graph.quadratic_matrices().unwrap();
        let manifold = LiftedPoseManifold::new(4, 3, 4);
        let problem = QuadraticProblem::new(q, g, manifold).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let x0 = manifold.random_sample(&mut rng);
        let params = OptimizerParams {
            max_outer_iterations: 60,
            max_inner_iterations: 50,
            gradient_tolerance: 1e-6,
            initial_radius: 10.0,
            ..OptimizerParams::default()
        };
        let (x, result) = QuadraticOptimizer::new(&problem)
            .with_params(params)
            .optimize(&x0);

        assert!(result.f_opt <= result.f_init);
        assert!(problem.gradient_norm(&x) < 1e-4);
    }

    #[test]
    fn test_gradient_descent_reduces_cost() {
        let graph = chain_graph(3);
        let (q, g) = graph.quadratic_matrices().unwrap();
        let manifold = LiftedPoseManifold::new(4, 3, 3);
        let problem = QuadraticProblem::new(q, g, manifold).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let x0 = manifold.random_sample(&mut rng);
        let params = OptimizerParams {
            algorithm: RiemannianAlgorithm::GradientDescent,
            max_outer_iterations: 200,
            gradient_tolerance: 1e-6,
            rgd_step_size: 0.1,
            ..OptimizerParams::default()
        };
        let (_, result) = QuadraticOptimizer::new(&problem)
            .with_params(params)
            .optimize(&x0);

        assert!(result.f_opt < result.f_init);
    }

    #[test]
    fn test_single_outer_iteration_makes_progress() {
        // The distributed loop calls RTR with one outer iteration; from the
        // kind of moderately-off start the block update sees (an iterate
        // whose translations lag the odometry), it must strictly reduce the
        // cost.
        let graph = chain_graph(4);
        let (q, g) = graph.quadratic_matrices().unwrap();
        let manifold = LiftedPoseManifold::new(4, 3, 4);
        let problem = QuadraticProblem::new(q, g, manifold).unwrap();

        // Identity-lifted blocks with all translations at zero.
        let x0 = crate::pose::LiftedPoseArray::new(4, 3, 4).matrix().clone();
        let (_, result) = QuadraticOptimizer::new(&problem).optimize(&x0);
        assert!(result.f_opt < result.f_init);
        assert!(result.grad_norm_opt < result.grad_norm_init);
    }
}
