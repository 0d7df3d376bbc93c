//! Operations on the product manifold `M = (St(d, r) × ℝʳ)ⁿ`.
//!
//! The manifold is exposed as a minimal capability set — projection,
//! retraction, tangent projection, and random sampling — implemented once for
//! the whole product. The optimizer only ever touches these four operations.
//!
//! # Mathematical background
//!
//! A point of `St(d, r)` is an `r x d` matrix `Y` with `YᵀY = I_d`. The
//! projection of an arbitrary matrix onto the Stiefel manifold is `UVᵀ` from
//! the thin SVD `UΣVᵀ`; the retraction used throughout is the QR retraction
//! `R_Y(H) = qf(Y + H)`, and the tangent projection at `Y` is
//! `P_Y(Z) = Z − Y·sym(YᵀZ)`. Euclidean components pass through unchanged.

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::warn;

/// Seed used for the deterministic Stiefel sample shared by the whole team.
const FIXED_STIEFEL_SEED: u64 = 1;

/// Project an arbitrary `r x d` matrix (`r >= d`) onto the Stiefel manifold.
///
/// Computes the thin SVD `UΣVᵀ` and returns `UVᵀ`, the closest point in
/// Frobenius norm.
pub fn project_to_stiefel(m: &DMatrix<f64>) -> DMatrix<f64> {
    let svd = m.clone().svd(true, true);
    let u = svd.u.expect("SVD was requested with U");
    let v_t = svd.v_t.expect("SVD was requested with Vᵀ");
    u * v_t
}

/// Project a square matrix onto `SO(d)`.
///
/// As [`project_to_stiefel`], but when `det(U)·det(V) < 0` the last column of
/// `U` is negated so the result has determinant `+1`.
pub fn project_to_rotation_group(m: &DMatrix<f64>) -> DMatrix<f64> {
    let svd = m.clone().svd(true, true);
    let mut u = svd.u.expect("SVD was requested with U");
    let v_t = svd.v_t.expect("SVD was requested with Vᵀ");
    // det(V) = det(Vᵀ)
    if u.determinant() * v_t.determinant() < 0.0 {
        let last = u.ncols() - 1;
        u.column_mut(last).neg_mut();
    }
    u * v_t
}

/// Log a warning if `R` is not a rotation matrix to within `1e-5`.
pub fn check_rotation(r: &DMatrix<f64>) {
    let d = r.nrows();
    let err_det = (r.determinant() - 1.0).abs();
    let err_norm = (r.transpose() * r - DMatrix::identity(d, d)).norm();
    if err_det > 1e-5 || err_norm > 1e-5 {
        warn!(err_det, err_norm, "matrix is not a valid rotation");
    }
}

/// Map an angular distance (radians) to the equivalent chordal distance on
/// `SO(3)`: `2√2 · sin(θ/2)`.
pub fn angular_to_chordal_so3(rad: f64) -> f64 {
    2.0 * 2.0_f64.sqrt() * (rad / 2.0).sin()
}

/// Q factor of the thin QR decomposition, with the sign convention that the
/// diagonal of R is non-negative (making the factorization, and hence the
/// retraction, unique).
fn qf(m: DMatrix<f64>) -> DMatrix<f64> {
    let ncols = m.ncols();
    let qr = m.qr();
    let r = qr.r();
    let mut q = qr.q();
    for j in 0..ncols {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    q
}

fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    // Box-Muller transform over two uniforms
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn random_gaussian_matrix<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| standard_normal(rng))
}

/// A uniformly random `r x d` Stiefel point drawn from the given generator.
pub fn random_stiefel_sample<R: Rng>(r: usize, d: usize, rng: &mut R) -> DMatrix<f64> {
    qf(random_gaussian_matrix(r, d, rng))
}

/// The deterministic `r x d` Stiefel point used as the team's lifting matrix.
///
/// Robot 0 computes this once and broadcasts it; every call returns the same
/// matrix for the same `(r, d)`.
pub fn fixed_stiefel_sample(r: usize, d: usize) -> DMatrix<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(FIXED_STIEFEL_SEED);
    random_stiefel_sample(r, d, &mut rng)
}

/// The product manifold `(St(d, r) × ℝʳ)ⁿ` of `n` lifted poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiftedPoseManifold {
    r: usize,
    d: usize,
    n: usize,
}

impl LiftedPoseManifold {
    pub fn new(r: usize, d: usize, n: usize) -> Self {
        assert!(r >= d, "relaxation rank must be at least the dimension");
        LiftedPoseManifold { r, d, n }
    }

    pub fn relaxation_rank(&self) -> usize {
        self.r
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn num_poses(&self) -> usize {
        self.n
    }

    fn block(&self, i: usize) -> (usize, usize) {
        (i * (self.d + 1), self.d + 1)
    }

    /// Project an arbitrary `r x n(d+1)` matrix onto the manifold.
    ///
    /// Each Stiefel block is SVD-projected; translation columns pass through.
    pub fn project(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = m.clone();
        for i in 0..self.n {
            let (start, _) = self.block(i);
            let y = m.view((0, start), (self.r, self.d)).into_owned();
            out.view_mut((0, start), (self.r, self.d))
                .copy_from(&project_to_stiefel(&y));
        }
        out
    }

    /// QR retraction `R_X(H)` of a tangent matrix `H` at the point `X`.
    pub fn retract(&self, x: &DMatrix<f64>, h: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = x + h;
        for i in 0..self.n {
            let (start, _) = self.block(i);
            let moved = out.view((0, start), (self.r, self.d)).into_owned();
            out.view_mut((0, start), (self.r, self.d))
                .copy_from(&qf(moved));
        }
        out
    }

    /// Orthogonal projection of an ambient matrix `Z` onto the tangent space
    /// of the manifold at `X`.
    pub fn tangent_project(&self, x: &DMatrix<f64>, z: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = z.clone();
        for i in 0..self.n {
            let (start, _) = self.block(i);
            let y = x.view((0, start), (self.r, self.d));
            let zy = z.view((0, start), (self.r, self.d));
            let a = y.transpose() * zy;
            let sym = (&a + a.transpose()) * 0.5;
            let projected = zy.into_owned() - y * sym;
            out.view_mut((0, start), (self.r, self.d))
                .copy_from(&projected);
        }
        out
    }

    /// A random point on the manifold; Stiefel blocks are uniform, Euclidean
    /// components standard normal.
    pub fn random_sample<R: Rng>(&self, rng: &mut R) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.r, self.n * (self.d + 1));
        for i in 0..self.n {
            let (start, _) = self.block(i);
            out.view_mut((0, start), (self.r, self.d))
                .copy_from(&random_stiefel_sample(self.r, self.d, rng));
            for row in 0..self.r {
                out[(row, start + self.d)] = standard_normal(rng);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        random_gaussian_matrix(rows, cols, &mut rng)
    }

    #[test]
    fn test_stiefel_projection_idempotent() {
        let m = random_matrix(5, 3, 7);
        let p1 = project_to_stiefel(&m);
        let p2 = project_to_stiefel(&p1);
        assert!((&p1 - &p2).norm() < 1e-10);
        assert!((p1.transpose() * &p1 - DMatrix::identity(3, 3)).norm() < 1e-10);
    }

    #[test]
    fn test_rotation_projection_determinant() {
        for seed in 0..20 {
            let m = random_matrix(3, 3, seed);
            let r = project_to_rotation_group(&m);
            assert!((r.determinant() - 1.0).abs() < 1e-8);
            assert!((r.transpose() * &r - DMatrix::identity(3, 3)).norm() < 1e-8);
        }
    }

    #[test]
    fn test_fixed_stiefel_sample_deterministic() {
        let a = fixed_stiefel_sample(5, 3);
        let b = fixed_stiefel_sample(5, 3);
        assert_eq!(a, b);
        assert!((a.transpose() * &a - DMatrix::identity(3, 3)).norm() < 1e-10);
    }

    #[test]
    fn test_retraction_stays_on_manifold() {
        let manifold = LiftedPoseManifold::new(4, 2, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let x = manifold.random_sample(&mut rng);
        let z = random_matrix(4, 9, 11) * 0.1;
        let h = manifold.tangent_project(&x, &z);
        let moved = manifold.retract(&x, &h);
        for i in 0..3 {
            let y = moved.view((0, i * 3), (4, 2)).into_owned();
            assert!((y.transpose() * &y - DMatrix::identity(2, 2)).norm() < 1e-9);
        }
    }

    #[test]
    fn test_tangent_projection_is_idempotent() {
        let manifold = LiftedPoseManifold::new(5, 3, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let x = manifold.random_sample(&mut rng);
        let z = random_matrix(5, 8, 17);
        let p1 = manifold.tangent_project(&x, &z);
        let p2 = manifold.tangent_project(&x, &p1);
        assert!((&p1 - &p2).norm() < 1e-9);
    }

    #[test]
    fn test_angular_to_chordal() {
        assert!((angular_to_chordal_so3(std::f64::consts::PI) - 2.0 * 2.0_f64.sqrt()).abs() < 1e-12);
        assert!(angular_to_chordal_so3(0.0).abs() < 1e-12);
    }
}
