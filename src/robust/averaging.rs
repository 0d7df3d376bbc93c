//! Robust single rotation, translation, and pose averaging.
//!
//! Given a set of candidate estimates of one rotation (or pose), the robust
//! variants run a fixed number of GNC-TLS reweighting rounds over the chordal
//! mean and report the surviving inlier set. They are the workhorse of the
//! multi-robot frame alignment.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::error::{PgoError, PgoResult};
use crate::manifold::project_to_rotation_group;
use crate::robust::{RobustCost, RobustCostParams, RobustCostType};

/// Number of reweighting rounds of the robust averaging loops. The GNC
/// schedule is fully annealed well before this many steps.
const GNC_ROUNDS: usize = 100;

/// Chordal mean of rotations: project the weighted sum onto `SO(d)`.
pub fn single_rotation_averaging(
    rotations: &[DMatrix<f64>],
    weights: Option<&[f64]>,
) -> PgoResult<DMatrix<f64>> {
    if rotations.is_empty() {
        return Err(PgoError::InvalidInput(
            "rotation averaging needs at least one candidate".to_string(),
        ));
    }
    let d = rotations[0].nrows();
    let mut sum = DMatrix::zeros(d, d);
    for (i, rotation) in rotations.iter().enumerate() {
        let w = weights.map_or(1.0, |ws| ws[i]);
        sum += rotation * w;
    }
    Ok(project_to_rotation_group(&sum))
}

/// Weighted mean of translations.
pub fn single_translation_averaging(
    translations: &[DVector<f64>],
    weights: Option<&[f64]>,
) -> PgoResult<DVector<f64>> {
    if translations.is_empty() {
        return Err(PgoError::InvalidInput(
            "translation averaging needs at least one candidate".to_string(),
        ));
    }
    let d = translations[0].len();
    let mut sum = DVector::zeros(d);
    let mut total = 0.0;
    for (i, t) in translations.iter().enumerate() {
        let w = weights.map_or(1.0, |ws| ws[i]);
        sum += t * w;
        total += w;
    }
    if total <= f64::EPSILON {
        return Err(PgoError::InvalidInput(
            "translation averaging weights sum to zero".to_string(),
        ));
    }
    Ok(sum / total)
}

/// Robust single rotation averaging with GNC-TLS inlier selection.
///
/// `kappa` holds the per-candidate rotation precisions; `max_error` is the
/// inlier threshold on the chordal residual `‖R_i − R‖_F`.
///
/// Returns the averaged rotation and the indices of the surviving inliers.
pub fn robust_single_rotation_averaging(
    rotations: &[DMatrix<f64>],
    kappa: &[f64],
    max_error: f64,
) -> PgoResult<(DMatrix<f64>, Vec<usize>)> {
    if rotations.len() != kappa.len() {
        return Err(PgoError::dims(
            format!("{} precisions", rotations.len()),
            format!("{}", kappa.len()),
        ));
    }
    let m = rotations.len();
    let mut cost = RobustCost::new(RobustCostParams {
        cost_type: RobustCostType::GncTls,
        gnc_barc: max_error,
        ..RobustCostParams::default()
    });

    let mut weights: Vec<f64> = kappa.to_vec();
    let mut r_opt = single_rotation_averaging(rotations, Some(&weights))?;
    for round in 0..GNC_ROUNDS {
        for i in 0..m {
            let residual = (&rotations[i] - &r_opt).norm();
            weights[i] = kappa[i] * cost.weight(residual);
        }
        r_opt = single_rotation_averaging(rotations, Some(&weights))?;
        cost.update();
        trace!(round, "robust rotation averaging round");
    }

    let inliers = (0..m)
        .filter(|&i| (&rotations[i] - &r_opt).norm() < max_error)
        .collect();
    Ok((r_opt, inliers))
}

/// Robust single pose averaging with GNC-TLS inlier selection.
///
/// The residual of candidate `i` is `√(κ_i‖R_i − R‖² + τ_i‖t_i − t‖²)` and
/// `cbar` is the inlier threshold on that residual.
#[allow(clippy::type_complexity)]
pub fn robust_single_pose_averaging(
    rotations: &[DMatrix<f64>],
    translations: &[DVector<f64>],
    kappa: &[f64],
    tau: &[f64],
    cbar: f64,
) -> PgoResult<(DMatrix<f64>, DVector<f64>, Vec<usize>)> {
    let m = rotations.len();
    if translations.len() != m || kappa.len() != m || tau.len() != m {
        return Err(PgoError::dims(
            format!("{m} candidates"),
            format!(
                "{} translations, {} kappa, {} tau",
                translations.len(),
                kappa.len(),
                tau.len()
            ),
        ));
    }
    let mut cost = RobustCost::new(RobustCostParams {
        cost_type: RobustCostType::GncTls,
        gnc_barc: cbar,
        ..RobustCostParams::default()
    });

    let residual = |i: usize, r: &DMatrix<f64>, t: &DVector<f64>| -> f64 {
        (kappa[i] * (&rotations[i] - r).norm_squared()
            + tau[i] * (&translations[i] - t).norm_squared())
        .sqrt()
    };

    let mut rotation_weights: Vec<f64> = kappa.to_vec();
    let mut translation_weights: Vec<f64> = tau.to_vec();
    let mut r_opt = single_rotation_averaging(rotations, Some(&rotation_weights))?;
    let mut t_opt = single_translation_averaging(translations, Some(&translation_weights))?;

    for _ in 0..GNC_ROUNDS {
        for i in 0..m {
            let w = cost.weight(residual(i, &r_opt, &t_opt));
            rotation_weights[i] = kappa[i] * w;
            translation_weights[i] = tau[i] * w;
        }
        if translation_weights.iter().sum::<f64>() <= f64::EPSILON {
            // Every candidate rejected: stop annealing and keep the current
            // estimate; the caller sees an empty inlier set.
            break;
        }
        r_opt = single_rotation_averaging(rotations, Some(&rotation_weights))?;
        t_opt = single_translation_averaging(translations, Some(&translation_weights))?;
        cost.update();
    }

    let inliers = (0..m)
        .filter(|&i| residual(i, &r_opt, &t_opt) < cbar)
        .collect();
    Ok((r_opt, t_opt, inliers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::angular_to_chordal_so3;

    fn rotation_z(theta: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[
                theta.cos(),
                -theta.sin(),
                0.0,
                theta.sin(),
                theta.cos(),
                0.0,
                0.0,
                0.0,
                1.0,
            ],
        )
    }

    #[test]
    fn test_rotation_averaging_of_identical_candidates() {
        let r = rotation_z(0.7);
        let avg = single_rotation_averaging(&[r.clone(), r.clone(), r.clone()], None).unwrap();
        assert!((avg - r).norm() < 1e-10);
    }

    #[test]
    fn test_robust_rotation_averaging_rejects_outlier() {
        let inlier = rotation_z(0.02);
        let candidates = vec![
            rotation_z(0.0),
            inlier.clone(),
            rotation_z(-0.02),
            rotation_z(1.5), // outlier, ~86 degrees away
        ];
        let kappa = vec![1.0; candidates.len()];
        let max_error = angular_to_chordal_so3(0.5);

        let (r_opt, inliers) =
            robust_single_rotation_averaging(&candidates, &kappa, max_error).unwrap();

        assert_eq!(inliers, vec![0, 1, 2]);
        assert!((&r_opt - rotation_z(0.0)).norm() < 0.1);
    }

    #[test]
    fn test_robust_pose_averaging_rejects_outlier() {
        let rotations = vec![
            rotation_z(0.0),
            rotation_z(0.01),
            rotation_z(-0.01),
            rotation_z(0.005),
            rotation_z(2.0), // outlier
        ];
        let translations = vec![
            DVector::from_vec(vec![0.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.1, 0.0, 0.0]),
            DVector::from_vec(vec![-0.1, 0.0, 0.0]),
            DVector::from_vec(vec![0.0, 0.1, 0.0]),
            DVector::from_vec(vec![10.0, -10.0, 3.0]), // outlier
        ];
        let kappa = vec![1.82; rotations.len()];
        let tau = vec![0.01; rotations.len()];
        let cbar = crate::robust::chi2_quantile(0.9, 3).sqrt();

        let (r_opt, t_opt, inliers) =
            robust_single_pose_averaging(&rotations, &translations, &kappa, &tau, cbar).unwrap();

        assert_eq!(inliers, vec![0, 1, 2, 3]);
        assert!((&r_opt - rotation_z(0.0)).norm() < 0.1);
        assert!(t_opt.norm() < 0.2);
    }

    #[test]
    fn test_single_candidate_is_inlier() {
        let candidates = vec![rotation_z(0.3)];
        let (r_opt, inliers) =
            robust_single_rotation_averaging(&candidates, &[1.0], angular_to_chordal_so3(0.5))
                .unwrap();
        assert_eq!(inliers, vec![0]);
        assert!((&r_opt - rotation_z(0.3)).norm() < 1e-8);
    }
}
