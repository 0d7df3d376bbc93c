//! Robust cost kernels for loop-closure outlier rejection.
//!
//! Every kernel maps a per-edge residual to a reweighting factor in `[0, 1]`.
//! The graduated non-convexity (GNC) schedule anneals the truncated
//! least-squares surrogate from its smooth form toward the hard TLS cost by
//! growing the control parameter `μ` one step per outer round: as `μ → ∞`
//! the weights become the binary inlier indicator `‖r‖ ≤ ε̄`.
//!
//! # Weight functions
//!
//! With residual `r ≥ 0`:
//! - **L2**: `w = 1`
//! - **Huber**: `w = 1` for `r ≤ δ`, `δ/r` beyond
//! - **Tukey**: `w = (1 − r²/c²)²` for `r ≤ c`, `0` beyond
//! - **Geman–McClure**: `w = 1/(1 + r²/c²)²`
//! - **GNC-TLS**: `w = 1` for `r² ≤ μ/(μ+1)·ε̄²`, `0` for `r² ≥ (μ+1)/μ·ε̄²`,
//!   and `ε̄√(μ(μ+1))/r − μ` in between

pub mod averaging;

use std::fmt;

/// Robust kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobustCostType {
    /// Plain least squares (no reweighting).
    #[default]
    L2,
    /// Truncated least squares under a graduated non-convexity schedule.
    GncTls,
    Huber,
    Tukey,
    GemanMcClure,
}

impl fmt::Display for RobustCostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobustCostType::L2 => write!(f, "L2"),
            RobustCostType::GncTls => write!(f, "GNC-TLS"),
            RobustCostType::Huber => write!(f, "Huber"),
            RobustCostType::Tukey => write!(f, "Tukey"),
            RobustCostType::GemanMcClure => write!(f, "Geman-McClure"),
        }
    }
}

/// Parameters of the robust kernels and the GNC schedule.
#[derive(Debug, Clone)]
pub struct RobustCostParams {
    pub cost_type: RobustCostType,
    /// Maximum admissible residual of the TLS cost (`ε̄`).
    pub gnc_barc: f64,
    /// Initial value of the GNC control parameter `μ`.
    pub gnc_init_mu: f64,
    /// Multiplicative step applied to `μ` each outer round.
    pub gnc_mu_step: f64,
    /// Number of GNC rounds after which `μ` stops growing.
    pub gnc_max_iterations: usize,
    pub huber_threshold: f64,
    pub tukey_threshold: f64,
    pub gm_shape: f64,
}

impl Default for RobustCostParams {
    fn default() -> Self {
        RobustCostParams {
            cost_type: RobustCostType::L2,
            gnc_barc: 5.0,
            gnc_init_mu: 1e-4,
            gnc_mu_step: 1.4,
            gnc_max_iterations: 100,
            huber_threshold: 1.345,
            tukey_threshold: 4.685,
            gm_shape: 1.0,
        }
    }
}

impl RobustCostParams {
    pub fn with_type(cost_type: RobustCostType) -> Self {
        RobustCostParams {
            cost_type,
            ..RobustCostParams::default()
        }
    }
}

/// Stateful robust kernel: holds the GNC scale evolving across outer rounds.
#[derive(Debug, Clone)]
pub struct RobustCost {
    params: RobustCostParams,
    mu: f64,
    round: usize,
}

impl RobustCost {
    pub fn new(params: RobustCostParams) -> Self {
        let mu = params.gnc_init_mu;
        RobustCost {
            params,
            mu,
            round: 0,
        }
    }

    pub fn cost_type(&self) -> RobustCostType {
        self.params.cost_type
    }

    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Reweighting factor in `[0, 1]` for the given non-negative residual.
    pub fn weight(&self, residual: f64) -> f64 {
        let r = residual.abs();
        match self.params.cost_type {
            RobustCostType::L2 => 1.0,
            RobustCostType::Huber => {
                let delta = self.params.huber_threshold;
                if r <= delta {
                    1.0
                } else {
                    delta / r
                }
            }
            RobustCostType::Tukey => {
                let c = self.params.tukey_threshold;
                if r <= c {
                    let ratio = 1.0 - (r * r) / (c * c);
                    ratio * ratio
                } else {
                    0.0
                }
            }
            RobustCostType::GemanMcClure => {
                let c2 = self.params.gm_shape * self.params.gm_shape;
                let denom = 1.0 + (r * r) / c2;
                1.0 / (denom * denom)
            }
            RobustCostType::GncTls => {
                let mu = self.mu;
                let barc2 = self.params.gnc_barc * self.params.gnc_barc;
                let r2 = r * r;
                if r2 <= mu / (mu + 1.0) * barc2 {
                    1.0
                } else if r2 >= (mu + 1.0) / mu * barc2 {
                    0.0
                } else {
                    let w = self.params.gnc_barc * (mu * (mu + 1.0)).sqrt() / r - mu;
                    w.clamp(0.0, 1.0)
                }
            }
        }
    }

    /// Advance the GNC schedule by one outer round.
    pub fn update(&mut self) {
        if self.params.cost_type == RobustCostType::GncTls
            && self.round < self.params.gnc_max_iterations
        {
            self.mu *= self.params.gnc_mu_step;
            self.round += 1;
        }
    }

    /// Restore the initial schedule state.
    pub fn reset(&mut self) {
        self.mu = self.params.gnc_init_mu;
        self.round = 0;
    }
}

/// Quantile of the chi-squared distribution with `dof` degrees of freedom,
/// through the Wilson–Hilferty transformation.
pub fn chi2_quantile(quantile: f64, dof: usize) -> f64 {
    let k = dof as f64;
    let z = standard_normal_quantile(quantile);
    let term = 1.0 - 2.0 / (9.0 * k) + z * (2.0 / (9.0 * k)).sqrt();
    k * term * term * term
}

/// Inverse standard normal CDF (Acklam's rational approximation; absolute
/// error below 1.2e-9 over (0, 1)).
fn standard_normal_quantile(p: f64) -> f64 {
    assert!(p > 0.0 && p < 1.0, "quantile must be in (0, 1)");

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_bounded_and_monotone() {
        for cost_type in [
            RobustCostType::Huber,
            RobustCostType::Tukey,
            RobustCostType::GemanMcClure,
            RobustCostType::GncTls,
        ] {
            let cost = RobustCost::new(RobustCostParams::with_type(cost_type));
            let mut previous = f64::INFINITY;
            for i in 0..200 {
                let r = i as f64 * 0.1;
                let w = cost.weight(r);
                assert!((0.0..=1.0).contains(&w), "{cost_type}: w = {w}");
                assert!(w <= previous + 1e-12, "{cost_type} not monotone at r = {r}");
                previous = w;
            }
        }
    }

    #[test]
    fn test_l2_never_reweights() {
        let cost = RobustCost::new(RobustCostParams::default());
        assert_eq!(cost.weight(0.0), 1.0);
        assert_eq!(cost.weight(1e6), 1.0);
    }

    #[test]
    fn test_gnc_tls_becomes_binary() {
        let params = RobustCostParams {
            cost_type: RobustCostType::GncTls,
            gnc_barc: 1.0,
            ..RobustCostParams::default()
        };
        let mut cost = RobustCost::new(params);
        for _ in 0..60 {
            cost.update();
        }
        // After many rounds mu is large: inliers keep full weight, outliers
        // are suppressed entirely.
        assert!(cost.weight(0.5) > 0.99);
        assert!(cost.weight(2.0) < 0.01);
    }

    #[test]
    fn test_gnc_reset_restores_schedule() {
        let params = RobustCostParams::with_type(RobustCostType::GncTls);
        let mut cost = RobustCost::new(params.clone());
        cost.update();
        cost.update();
        assert!(cost.mu() > params.gnc_init_mu);
        cost.reset();
        assert_eq!(cost.mu(), params.gnc_init_mu);
    }

    #[test]
    fn test_chi2_quantile_against_tables() {
        // Reference values from standard chi-squared tables.
        assert!((chi2_quantile(0.9, 3) - 6.2514).abs() < 0.1);
        assert!((chi2_quantile(0.95, 3) - 7.8147).abs() < 0.1);
        assert!((chi2_quantile(0.5, 1) - 0.4549).abs() < 0.05);
    }
}
