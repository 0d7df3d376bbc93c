//! g2o text-format loader for 2D and 3D pose graphs.
//!
//! Supports `EDGE_SE2` and `EDGE_SE3:QUAT` measurements. Vertex lines carry
//! only initialization hints and are skipped; `FIX` lines are rejected with a
//! warning; any other token aborts loading. Pose ids must form a consecutive
//! integer range and are re-indexed to start at zero when needed.
//!
//! Rotation and translation precisions are the information-divergence-
//! minimizing scalars of the measurement's information matrix:
//! `κ = d/(2·tr(Σᵣ))` and `τ = d/tr(Σₜ)` with `Σ = I⁻¹` (for `d = 2` the
//! rotation information is already scalar).

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Quaternion, Rotation2, UnitQuaternion};
use rayon::prelude::*;
use tracing::warn;

use super::GraphIoError;
use crate::measurement::RelativePoseMeasurement;

/// Above this many lines the file is parsed in parallel.
const PARALLEL_THRESHOLD: usize = 5000;

/// Load a g2o file into a measurement list.
///
/// Returns the measurements (all attributed to robot 0) and the number of
/// poses. The first pose id is re-indexed to 0 when the file starts at a
/// different id.
pub fn load_g2o<P: AsRef<Path>>(
    path: P,
) -> Result<(Vec<RelativePoseMeasurement>, usize), GraphIoError> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let content = std::str::from_utf8(&mmap).map_err(|e| GraphIoError::Parse {
        line: 0,
        message: format!("invalid UTF-8: {e}"),
    })?;
    parse_content(content)
}

/// Parse g2o content from a string.
pub fn parse_content(
    content: &str,
) -> Result<(Vec<RelativePoseMeasurement>, usize), GraphIoError> {
    let lines: Vec<&str> = content.lines().collect();

    let parsed: Result<Vec<Option<RelativePoseMeasurement>>, GraphIoError> =
        if lines.len() > PARALLEL_THRESHOLD {
            lines
                .par_iter()
                .enumerate()
                .map(|(i, line)| parse_line(line, i + 1))
                .collect()
        } else {
            lines
                .iter()
                .enumerate()
                .map(|(i, line)| parse_line(line, i + 1))
                .collect()
        };

    let mut measurements: Vec<RelativePoseMeasurement> = parsed?.into_iter().flatten().collect();
    if measurements.is_empty() {
        return Err(GraphIoError::Empty);
    }

    let mut pose_ids = BTreeSet::new();
    for m in &measurements {
        pose_ids.insert(m.p1);
        pose_ids.insert(m.p2);
    }

    let first = *pose_ids.iter().next().expect("non-empty id set");
    let mut prev = first;
    for &id in pose_ids.iter().skip(1) {
        if id != prev + 1 {
            return Err(GraphIoError::NonConsecutiveIds { prev, next: id });
        }
        prev = id;
    }

    if first != 0 {
        warn!(first, "pose ids do not start at zero, re-indexing");
        for m in &mut measurements {
            m.p1 -= first;
            m.p2 -= first;
        }
    }

    Ok((measurements, pose_ids.len()))
}

fn parse_line(
    line: &str,
    line_num: usize,
) -> Result<Option<RelativePoseMeasurement>, GraphIoError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&token) = parts.first() else {
        return Ok(None);
    };

    match token {
        "EDGE_SE2" => parse_edge_se2(&parts, line_num).map(Some),
        "EDGE_SE3:QUAT" => parse_edge_se3(&parts, line_num).map(Some),
        "VERTEX_SE2" | "VERTEX_SE3:QUAT" => Ok(None),
        "FIX" => {
            warn!(line = line_num, "FIX is not supported, skipping line");
            Ok(None)
        }
        other => Err(GraphIoError::UnsupportedToken {
            line: line_num,
            token: other.to_string(),
        }),
    }
}

fn parse_usize(parts: &[&str], idx: usize, line: usize) -> Result<usize, GraphIoError> {
    parts[idx]
        .parse::<usize>()
        .map_err(|_| GraphIoError::InvalidNumber {
            line,
            value: parts[idx].to_string(),
        })
}

fn parse_f64(parts: &[&str], idx: usize, line: usize) -> Result<f64, GraphIoError> {
    parts[idx]
        .parse::<f64>()
        .map_err(|_| GraphIoError::InvalidNumber {
            line,
            value: parts[idx].to_string(),
        })
}

/// `EDGE_SE2 id1 id2 dx dy dtheta I11 I12 I13 I22 I23 I33`
fn parse_edge_se2(
    parts: &[&str],
    line: usize,
) -> Result<RelativePoseMeasurement, GraphIoError> {
    if parts.len() < 12 {
        return Err(GraphIoError::MissingFields { line });
    }
    let p1 = parse_usize(parts, 1, line)?;
    let p2 = parse_usize(parts, 2, line)?;
    let dx = parse_f64(parts, 3, line)?;
    let dy = parse_f64(parts, 4, line)?;
    let dtheta = parse_f64(parts, 5, line)?;
    let info: Vec<f64> = (6..12)
        .map(|i| parse_f64(parts, i, line))
        .collect::<Result<_, _>>()?;

    let translation_information = Matrix2::new(info[0], info[1], info[1], info[3]);
    let translation_covariance =
        translation_information
            .try_inverse()
            .ok_or_else(|| GraphIoError::Parse {
                line,
                message: "singular translation information matrix".to_string(),
            })?;
    let tau = 2.0 / translation_covariance.trace();
    let kappa = info[5];

    let rotation2 = Rotation2::new(dtheta);
    let rotation = DMatrix::from_fn(2, 2, |i, j| rotation2.matrix()[(i, j)]);

    let mut m = RelativePoseMeasurement::new(
        0,
        p1,
        0,
        p2,
        rotation,
        DVector::from_vec(vec![dx, dy]),
        kappa,
        tau,
    );
    m.fixed_weight = p1 + 1 == p2;
    Ok(m)
}

/// `EDGE_SE3:QUAT id1 id2 dx dy dz qx qy qz qw` followed by the upper
/// triangle of the 6x6 information matrix.
fn parse_edge_se3(
    parts: &[&str],
    line: usize,
) -> Result<RelativePoseMeasurement, GraphIoError> {
    if parts.len() < 30 {
        return Err(GraphIoError::MissingFields { line });
    }
    let p1 = parse_usize(parts, 1, line)?;
    let p2 = parse_usize(parts, 2, line)?;
    let coords: Vec<f64> = (3..9)
        .map(|i| parse_f64(parts, i, line))
        .collect::<Result<_, _>>()?;
    let qw = parse_f64(parts, 9, line)?;
    let info: Vec<f64> = (10..31.min(parts.len()))
        .map(|i| parse_f64(parts, i, line))
        .collect::<Result<_, _>>()?;
    if info.len() < 21 {
        return Err(GraphIoError::MissingFields { line });
    }

    // Upper-triangular order: I11 I12 I13 I14 I15 I16 I22 I23 ... I66
    let translation_information = Matrix3::new(
        info[0], info[1], info[2], info[1], info[6], info[7], info[2], info[7], info[11],
    );
    let rotation_information = Matrix3::new(
        info[15], info[16], info[17], info[16], info[18], info[19], info[17], info[19], info[20],
    );
    let translation_covariance =
        translation_information
            .try_inverse()
            .ok_or_else(|| GraphIoError::Parse {
                line,
                message: "singular translation information matrix".to_string(),
            })?;
    let rotation_covariance =
        rotation_information
            .try_inverse()
            .ok_or_else(|| GraphIoError::Parse {
                line,
                message: "singular rotation information matrix".to_string(),
            })?;
    let tau = 3.0 / translation_covariance.trace();
    let kappa = 3.0 / (2.0 * rotation_covariance.trace());

    let quaternion = Quaternion::new(qw, coords[3], coords[4], coords[5]);
    let rotation3 = UnitQuaternion::from_quaternion(quaternion).to_rotation_matrix();
    let rotation = DMatrix::from_fn(3, 3, |i, j| rotation3.matrix()[(i, j)]);

    let mut m = RelativePoseMeasurement::new(
        0,
        p1,
        0,
        p2,
        rotation,
        DVector::from_vec(vec![coords[0], coords[1], coords[2]]),
        kappa,
        tau,
    );
    m.fixed_weight = p1 + 1 == p2;
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY_INFO_2D: &str = "1.0 0.0 0.0 1.0 0.0 1.0";

    #[test]
    fn test_parse_edge_se2() {
        let content = format!("EDGE_SE2 0 1 1.0 2.0 0.5 {IDENTITY_INFO_2D}\n");
        let (measurements, num_poses) = parse_content(&content).unwrap();
        assert_eq!(num_poses, 2);
        assert_eq!(measurements.len(), 1);
        let m = &measurements[0];
        assert_eq!((m.p1, m.p2), (0, 1));
        assert!(m.fixed_weight);
        assert!((m.translation[0] - 1.0).abs() < 1e-12);
        // Identity information: tau = 2 / tr(I) = 1, kappa = I33 = 1.
        assert!((m.tau - 1.0).abs() < 1e-12);
        assert!((m.kappa - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_edge_se3_identity_information() {
        let mut line = "EDGE_SE3:QUAT 0 1 1.0 0.0 0.0 0.0 0.0 0.0 1.0".to_string();
        // Upper triangle of the 6x6 identity.
        for i in 0..6 {
            for j in i..6 {
                line.push_str(if i == j { " 1.0" } else { " 0.0" });
            }
        }
        line.push('\n');
        let (measurements, num_poses) = parse_content(&line).unwrap();
        assert_eq!(num_poses, 2);
        let m = &measurements[0];
        // tau = 3 / tr(I3) = 1, kappa = 3 / (2 tr(I3)) = 0.5
        assert!((m.tau - 1.0).abs() < 1e-12);
        assert!((m.kappa - 0.5).abs() < 1e-12);
        assert!((&m.rotation - DMatrix::identity(3, 3)).norm() < 1e-12);
    }

    #[test]
    fn test_reindexing_from_nonzero_first_id() {
        let mut content = String::new();
        for i in 5..8 {
            content.push_str(&format!(
                "EDGE_SE2 {} {} 1.0 0.0 0.0 {IDENTITY_INFO_2D}\n",
                i,
                i + 1
            ));
        }
        let (measurements, num_poses) = parse_content(&content).unwrap();
        assert_eq!(num_poses, 4);
        assert_eq!(measurements[0].p1, 0);
        assert_eq!(measurements[2].p2, 3);
    }

    #[test]
    fn test_non_consecutive_ids_rejected() {
        let content = format!(
            "EDGE_SE2 0 1 1.0 0.0 0.0 {IDENTITY_INFO_2D}\nEDGE_SE2 3 4 1.0 0.0 0.0 {IDENTITY_INFO_2D}\n"
        );
        assert!(matches!(
            parse_content(&content),
            Err(GraphIoError::NonConsecutiveIds { prev: 1, next: 3 })
        ));
    }

    #[test]
    fn test_vertex_and_fix_lines_skipped() {
        let content = format!(
            "VERTEX_SE2 0 0.0 0.0 0.0\nFIX 0\nEDGE_SE2 0 1 1.0 0.0 0.0 {IDENTITY_INFO_2D}\n"
        );
        let (measurements, num_poses) = parse_content(&content).unwrap();
        assert_eq!(measurements.len(), 1);
        assert_eq!(num_poses, 2);
    }

    #[test]
    fn test_unknown_token_is_fatal() {
        let content = "EDGE_WEIRD 0 1\n";
        assert!(matches!(
            parse_content(content),
            Err(GraphIoError::UnsupportedToken { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("swarm_pgo_g2o_loader_test.g2o");
        std::fs::write(
            &path,
            format!("EDGE_SE2 0 1 1.0 0.0 0.1 {IDENTITY_INFO_2D}\n"),
        )
        .unwrap();
        let (measurements, num_poses) = load_g2o(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(measurements.len(), 1);
        assert_eq!(num_poses, 2);
    }
}
