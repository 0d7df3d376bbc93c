//! Relative pose measurements between trajectory frames.

use nalgebra::{DMatrix, DVector};

use crate::pose::PoseId;

/// A relative rigid-body measurement from frame `(r1, p1)` to frame
/// `(r2, p2)`.
///
/// `kappa` and `tau` are the rotation and translation precisions derived from
/// the measurement's information matrix. `weight` is the current robust
/// reweighting factor in `[0, 1]`; `fixed_weight` pins it (odometry edges),
/// and `known_inlier` exempts the edge from reweighting altogether.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePoseMeasurement {
    pub r1: usize,
    pub p1: usize,
    pub r2: usize,
    pub p2: usize,
    pub rotation: DMatrix<f64>,
    pub translation: DVector<f64>,
    pub kappa: f64,
    pub tau: f64,
    pub weight: f64,
    pub fixed_weight: bool,
    pub known_inlier: bool,
}

impl RelativePoseMeasurement {
    /// Build a measurement with unit weight.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        r1: usize,
        p1: usize,
        r2: usize,
        p2: usize,
        rotation: DMatrix<f64>,
        translation: DVector<f64>,
        kappa: f64,
        tau: f64,
    ) -> Self {
        RelativePoseMeasurement {
            r1,
            p1,
            r2,
            p2,
            rotation,
            translation,
            kappa,
            tau,
            weight: 1.0,
            fixed_weight: false,
            known_inlier: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.translation.len()
    }

    pub fn tail_id(&self) -> PoseId {
        PoseId::new(self.r1, self.p1)
    }

    pub fn head_id(&self) -> PoseId {
        PoseId::new(self.r2, self.p2)
    }

    /// True when both endpoints belong to the same robot.
    pub fn is_intra_robot(&self) -> bool {
        self.r1 == self.r2
    }

    /// Squared measurement error under the given (possibly lifted) rotation
    /// and translation estimates of the two endpoints:
    ///
    /// `κ‖R₁R̂ − R₂‖² + τ‖t₂ − t₁ − R₁t̂‖²`
    pub fn error(
        &self,
        r1: &DMatrix<f64>,
        t1: &DVector<f64>,
        r2: &DMatrix<f64>,
        t2: &DVector<f64>,
    ) -> f64 {
        let rotation_error = (r1 * &self.rotation - r2).norm_squared();
        let translation_error = (t2 - t1 - r1 * &self.translation).norm_squared();
        self.kappa * rotation_error + self.tau * translation_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_zero_for_consistent_estimates() {
        let theta: f64 = 0.4;
        let rotation = DMatrix::from_row_slice(
            2,
            2,
            &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()],
        );
        let translation = DVector::from_vec(vec![0.5, -0.1]);
        let m =
            RelativePoseMeasurement::new(0, 0, 0, 1, rotation.clone(), translation.clone(), 1.0, 1.0);

        let r1 = DMatrix::identity(2, 2);
        let t1 = DVector::zeros(2);
        let r2 = rotation;
        let t2 = translation;
        assert!(m.error(&r1, &t1, &r2, &t2) < 1e-12);

        let t2_perturbed = &t2 + DVector::from_vec(vec![0.1, 0.0]);
        assert!(m.error(&r1, &t1, &r2, &t2_perturbed) > 1e-4);
    }
}
