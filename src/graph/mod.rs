//! The per-robot pose graph: measurement store, neighbor bookkeeping, and
//! assembly of the local quadratic data matrices.

use std::collections::{HashMap, HashSet};

use nalgebra::DMatrix;
use sprs::{CsMat, TriMat};
use tracing::{debug, warn};

use crate::error::{PgoError, PgoResult};
use crate::measurement::RelativePoseMeasurement;
use crate::pose::{LiftedPose, PoseId};

pub mod matrices;

pub use matrices::{connection_laplacian, construct_b_matrices};

use matrices::{add_block, edge_laplacian_blocks};

/// Weight margin below / above which a loop closure counts as rejected /
/// accepted. GNC-TLS weights converge to {0, 1}, so any small margin is
/// equivalent in the limit.
const WEIGHT_DECISION_MARGIN: f64 = 1e-2;

/// Counts of loop closures by robust-weight classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStatistics {
    pub total_loop_closures: usize,
    pub accepted_loop_closures: usize,
    pub rejected_loop_closures: usize,
}

impl GraphStatistics {
    pub fn undecided_loop_closures(&self) -> usize {
        self.total_loop_closures - self.accepted_loop_closures - self.rejected_loop_closures
    }

    /// Fraction of loop closures that are either accepted or rejected.
    /// Returns 1 when the graph has no loop closures.
    pub fn converged_ratio(&self) -> f64 {
        if self.total_loop_closures == 0 {
            1.0
        } else {
            (self.accepted_loop_closures + self.rejected_loop_closures) as f64
                / self.total_loop_closures as f64
        }
    }
}

/// Measurement store of a single robot, partitioned into odometry, private
/// loop closures, and shared (inter-robot) loop closures.
///
/// The graph owns its measurements by value and caches the quadratic data
/// matrices `Q` and `G`; the cache is invalidated whenever weights or
/// measurements change.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    robot_id: usize,
    r: usize,
    d: usize,
    n: usize,
    odometry: Vec<RelativePoseMeasurement>,
    private_loop_closures: Vec<RelativePoseMeasurement>,
    shared_loop_closures: Vec<RelativePoseMeasurement>,
    edge_ids: HashSet<(PoseId, PoseId)>,
    my_public_pose_ids: HashSet<PoseId>,
    neighbor_public_pose_ids: HashSet<PoseId>,
    neighbor_ids: HashSet<usize>,
    neighbor_poses: HashMap<PoseId, LiftedPose>,
    quadratic: Option<CsMat<f64>>,
    linear: Option<DMatrix<f64>>,
}

impl PoseGraph {
    pub fn new(robot_id: usize, r: usize, d: usize) -> Self {
        assert!(r >= d, "relaxation rank must be at least the dimension");
        PoseGraph {
            robot_id,
            r,
            d,
            n: 0,
            odometry: Vec::new(),
            private_loop_closures: Vec::new(),
            shared_loop_closures: Vec::new(),
            edge_ids: HashSet::new(),
            my_public_pose_ids: HashSet::new(),
            neighbor_public_pose_ids: HashSet::new(),
            neighbor_ids: HashSet::new(),
            neighbor_poses: HashMap::new(),
            quadratic: None,
            linear: None,
        }
    }

    pub fn robot_id(&self) -> usize {
        self.robot_id
    }

    pub fn relaxation_rank(&self) -> usize {
        self.r
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    /// Number of poses owned by this robot.
    pub fn num_poses(&self) -> usize {
        self.n
    }

    /// Insert one measurement, classifying it by its endpoints.
    pub fn add_measurement(&mut self, m: RelativePoseMeasurement) -> PgoResult<()> {
        if m.dimension() != self.d {
            return Err(PgoError::dims(
                format!("dimension {}", self.d),
                format!("{}", m.dimension()),
            ));
        }
        if !m.is_intra_robot() && m.r1 != self.robot_id && m.r2 != self.robot_id {
            return Err(PgoError::InvalidInput(format!(
                "measurement {} -> {} does not involve robot {}",
                m.tail_id(),
                m.head_id(),
                self.robot_id
            )));
        }
        let key = (m.tail_id(), m.head_id());
        if !self.edge_ids.insert(key) {
            warn!(tail = %key.0, head = %key.1, "ignoring duplicate measurement");
            return Ok(());
        }

        if m.is_intra_robot() && m.r1 == self.robot_id {
            self.n = self.n.max(m.p1 + 1).max(m.p2 + 1);
            if m.p2 == m.p1 + 1 {
                self.odometry.push(m);
            } else {
                self.private_loop_closures.push(m);
            }
        } else {
            let (own, other) = if m.r1 == self.robot_id {
                (m.tail_id(), m.head_id())
            } else {
                (m.head_id(), m.tail_id())
            };
            self.n = self.n.max(own.frame_id + 1);
            self.my_public_pose_ids.insert(own);
            self.neighbor_public_pose_ids.insert(other);
            self.neighbor_ids.insert(other.robot_id);
            self.shared_loop_closures.push(m);
        }
        self.clear_data_matrices();
        Ok(())
    }

    /// Replace the graph contents with the given measurements.
    pub fn set_measurements(&mut self, measurements: Vec<RelativePoseMeasurement>) -> PgoResult<()> {
        *self = PoseGraph::new(self.robot_id, self.r, self.d);
        for m in measurements {
            self.add_measurement(m)?;
        }
        Ok(())
    }

    pub fn odometry(&self) -> &[RelativePoseMeasurement] {
        &self.odometry
    }

    pub fn private_loop_closures(&self) -> &[RelativePoseMeasurement] {
        &self.private_loop_closures
    }

    pub fn shared_loop_closures(&self) -> &[RelativePoseMeasurement] {
        &self.shared_loop_closures
    }

    pub(crate) fn private_loop_closures_mut(&mut self) -> &mut [RelativePoseMeasurement] {
        &mut self.private_loop_closures
    }

    pub(crate) fn shared_loop_closures_mut(&mut self) -> &mut [RelativePoseMeasurement] {
        &mut self.shared_loop_closures
    }

    /// All measurements with both endpoints on this robot.
    pub fn local_measurements(&self) -> Vec<RelativePoseMeasurement> {
        let mut out = self.odometry.clone();
        out.extend(self.private_loop_closures.iter().cloned());
        out
    }

    /// All measurements in the graph.
    pub fn measurements(&self) -> Vec<RelativePoseMeasurement> {
        let mut out = self.local_measurements();
        out.extend(self.shared_loop_closures.iter().cloned());
        out
    }

    /// Own poses referenced by at least one inter-robot edge.
    pub fn my_public_pose_ids(&self) -> &HashSet<PoseId> {
        &self.my_public_pose_ids
    }

    /// Foreign poses referenced by this robot's inter-robot edges.
    pub fn neighbor_public_pose_ids(&self) -> &HashSet<PoseId> {
        &self.neighbor_public_pose_ids
    }

    pub fn neighbor_ids(&self) -> &HashSet<usize> {
        &self.neighbor_ids
    }

    pub fn has_neighbor(&self, robot_id: usize) -> bool {
        self.neighbor_ids.contains(&robot_id)
    }

    pub fn has_neighbor_pose(&self, id: PoseId) -> bool {
        self.neighbor_public_pose_ids.contains(&id)
    }

    pub fn shared_loop_closures_with(&self, robot_id: usize) -> Vec<&RelativePoseMeasurement> {
        self.shared_loop_closures
            .iter()
            .filter(|m| m.r1 == robot_id || m.r2 == robot_id)
            .collect()
    }

    /// Replace the cached snapshot of neighbor public poses used when
    /// contracting the coupling term `G`.
    pub fn set_neighbor_poses(&mut self, poses: &HashMap<PoseId, LiftedPose>) {
        self.neighbor_poses = poses.clone();
        self.quadratic = None;
        self.linear = None;
    }

    /// Drop the cached `Q` and `G`; must be called whenever any measurement
    /// weight changes.
    pub fn clear_data_matrices(&mut self) {
        self.quadratic = None;
        self.linear = None;
    }

    /// The cached `(Q, G)` pair, if constructed.
    pub fn quadratic_matrices(&self) -> Option<(&CsMat<f64>, &DMatrix<f64>)> {
        match (&self.quadratic, &self.linear) {
            (Some(q), Some(g)) => Some((q, g)),
            _ => None,
        }
    }

    /// Assemble and cache the data matrices of the local quadratic problem.
    ///
    /// `Q` collects the connection-Laplacian blocks of every intra-robot edge
    /// plus the own-side diagonal block of every shared edge; `G` is the
    /// shared-edge cross block contracted with the neighbor pose snapshot, so
    /// that the local cost reads `tr(XQXᵀ) + 2·tr(XGᵀ)`.
    ///
    /// Fails when a shared edge references a neighbor pose that is missing
    /// from the snapshot.
    pub fn construct_data_matrices(&mut self) -> PgoResult<()> {
        if self.quadratic.is_some() && self.linear.is_some() {
            return Ok(());
        }
        if self.n == 0 {
            return Err(PgoError::DataMatrix("pose graph is empty".to_string()));
        }
        let d = self.d;
        let dim = self.n * (d + 1);

        // Intra-robot edges contribute their full connection Laplacian;
        // shared edges add their own-side diagonal block below.
        let laplacian = connection_laplacian(&self.local_measurements(), d, self.n)?;
        let mut tri = TriMat::new((dim, dim));

        let mut linear = DMatrix::zeros(self.r, dim);
        for m in &self.shared_loop_closures {
            let (l_tail, l_head, l_cross) = edge_laplacian_blocks(m);
            if m.r1 == self.robot_id {
                // Outgoing edge: this robot owns the tail.
                let neighbor = self
                    .neighbor_poses
                    .get(&m.head_id())
                    .ok_or_else(|| {
                        PgoError::DataMatrix(format!("missing neighbor pose {}", m.head_id()))
                    })?;
                let base = m.p1 * (d + 1);
                add_block(&mut tri, base, base, &l_tail);
                let coupling = neighbor.matrix() * l_cross.transpose();
                let mut target = linear.view_mut((0, base), (self.r, d + 1));
                target += &coupling;
            } else {
                // Incoming edge: this robot owns the head.
                let neighbor = self
                    .neighbor_poses
                    .get(&m.tail_id())
                    .ok_or_else(|| {
                        PgoError::DataMatrix(format!("missing neighbor pose {}", m.tail_id()))
                    })?;
                let base = m.p2 * (d + 1);
                add_block(&mut tri, base, base, &l_head);
                let coupling = neighbor.matrix() * &l_cross;
                let mut target = linear.view_mut((0, base), (self.r, d + 1));
                target += &coupling;
            }
        }

        let shared_diagonal: CsMat<f64> = tri.to_csc();
        self.quadratic = Some(&laplacian + &shared_diagonal);
        self.linear = Some(linear);
        debug!(
            robot = self.robot_id,
            poses = self.n,
            "constructed quadratic data matrices"
        );
        Ok(())
    }

    /// Classify loop closures by their current robust weights.
    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics::default();
        for m in self
            .private_loop_closures
            .iter()
            .chain(self.shared_loop_closures.iter())
        {
            stats.total_loop_closures += 1;
            if m.weight < WEIGHT_DECISION_MARGIN {
                stats.rejected_loop_closures += 1;
            } else if m.weight > 1.0 - WEIGHT_DECISION_MARGIN {
                stats.accepted_loop_closures += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::RelativePoseMeasurement;
    use nalgebra::{DMatrix, DVector};

    fn measurement(r1: usize, p1: usize, r2: usize, p2: usize) -> RelativePoseMeasurement {
        RelativePoseMeasurement::new(
            r1,
            p1,
            r2,
            p2,
            DMatrix::identity(3, 3),
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
            1.0,
            1.0,
        )
    }

    #[test]
    fn test_measurement_classification() {
        let mut graph = PoseGraph::new(0, 5, 3);
        graph.add_measurement(measurement(0, 0, 0, 1)).unwrap();
        graph.add_measurement(measurement(0, 1, 0, 2)).unwrap();
        graph.add_measurement(measurement(0, 0, 0, 2)).unwrap();
        graph.add_measurement(measurement(0, 2, 1, 0)).unwrap();

        assert_eq!(graph.odometry().len(), 2);
        assert_eq!(graph.private_loop_closures().len(), 1);
        assert_eq!(graph.shared_loop_closures().len(), 1);
        assert_eq!(graph.num_poses(), 3);
        assert!(graph.has_neighbor(1));
        assert!(graph.has_neighbor_pose(PoseId::new(1, 0)));
        assert!(graph.my_public_pose_ids().contains(&PoseId::new(0, 2)));
    }

    #[test]
    fn test_duplicate_measurements_ignored() {
        let mut graph = PoseGraph::new(0, 3, 3);
        graph.add_measurement(measurement(0, 0, 0, 1)).unwrap();
        graph.add_measurement(measurement(0, 0, 0, 1)).unwrap();
        assert_eq!(graph.odometry().len(), 1);
    }

    #[test]
    fn test_data_matrices_require_neighbor_poses() {
        let mut graph = PoseGraph::new(0, 3, 3);
        graph.add_measurement(measurement(0, 0, 0, 1)).unwrap();
        graph.add_measurement(measurement(0, 1, 1, 0)).unwrap();

        // Shared edge with no neighbor snapshot: construction must fail.
        assert!(graph.construct_data_matrices().is_err());

        let mut poses = HashMap::new();
        poses.insert(
            PoseId::new(1, 0),
            LiftedPose::from_matrix(3, {
                let mut m = DMatrix::zeros(3, 4);
                m.view_mut((0, 0), (3, 3)).fill_with_identity();
                m
            })
            .unwrap(),
        );
        graph.set_neighbor_poses(&poses);
        graph.construct_data_matrices().unwrap();

        let (q, g) = graph.quadratic_matrices().unwrap();
        assert_eq!(q.shape(), (8, 8));
        assert_eq!(g.shape(), (3, 8));
    }

    #[test]
    fn test_statistics_classification() {
        let mut graph = PoseGraph::new(0, 3, 3);
        graph.add_measurement(measurement(0, 0, 0, 1)).unwrap();
        let mut accepted = measurement(0, 0, 0, 2);
        accepted.weight = 1.0;
        let mut rejected = measurement(0, 1, 0, 3);
        rejected.weight = 0.0;
        let mut undecided = measurement(0, 0, 0, 3);
        undecided.weight = 0.5;
        graph.add_measurement(accepted).unwrap();
        graph.add_measurement(rejected).unwrap();
        graph.add_measurement(undecided).unwrap();

        let stats = graph.statistics();
        assert_eq!(stats.total_loop_closures, 3);
        assert_eq!(stats.accepted_loop_closures, 1);
        assert_eq!(stats.rejected_loop_closures, 1);
        assert_eq!(stats.undecided_loop_closures(), 1);
        assert!((stats.converged_ratio() - 2.0 / 3.0).abs() < 1e-12);
    }
}
