//! Pose value types: rigid transforms, lifted poses, and their array forms.
//!
//! A rigid pose in dimension `d` is stored as the `d x (d+1)` block `[R | t]`
//! with `R ∈ SO(d)` and `t ∈ ℝᵈ`. A lifted pose relaxes the rotation onto the
//! Stiefel manifold `St(d, r)` with `r ≥ d`, giving an `r x (d+1)` block
//! `[Y | p]`. Arrays concatenate `n` such blocks column-wise; they are the
//! agent's iterate, momentum, and auxiliary variables.
//!
//! There is deliberately no class hierarchy here: a pose is a value, and all
//! manifold behaviour lives in stateless operators (`crate::manifold`).

use nalgebra::{DMatrix, DVector};

use crate::error::{PgoError, PgoResult};

/// Globally unique identifier of a pose: which robot owns it and the index of
/// the frame along that robot's trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoseId {
    pub robot_id: usize,
    pub frame_id: usize,
}

impl PoseId {
    pub fn new(robot_id: usize, frame_id: usize) -> Self {
        PoseId { robot_id, frame_id }
    }
}

impl std::fmt::Display for PoseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.robot_id, self.frame_id)
    }
}

/// A rigid transform `[R | t]` in dimension `d`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    d: usize,
    matrix: DMatrix<f64>,
}

impl Pose {
    /// The identity transform in dimension `d`.
    pub fn identity(d: usize) -> Self {
        let mut matrix = DMatrix::zeros(d, d + 1);
        matrix.view_mut((0, 0), (d, d)).fill_with_identity();
        Pose { d, matrix }
    }

    /// Build a pose from its `d x (d+1)` matrix form.
    pub fn from_matrix(matrix: DMatrix<f64>) -> PgoResult<Self> {
        let d = matrix.nrows();
        if matrix.ncols() != d + 1 {
            return Err(PgoError::dims(
                format!("{d}x{}", d + 1),
                format!("{}x{}", matrix.nrows(), matrix.ncols()),
            ));
        }
        Ok(Pose { d, matrix })
    }

    /// Build a pose from a rotation and a translation.
    pub fn from_parts(rotation: DMatrix<f64>, translation: DVector<f64>) -> PgoResult<Self> {
        let d = rotation.nrows();
        if rotation.ncols() != d || translation.len() != d {
            return Err(PgoError::dims(
                format!("{d}x{d} rotation with length-{d} translation"),
                format!(
                    "{}x{} rotation with length-{} translation",
                    rotation.nrows(),
                    rotation.ncols(),
                    translation.len()
                ),
            ));
        }
        let mut matrix = DMatrix::zeros(d, d + 1);
        matrix.view_mut((0, 0), (d, d)).copy_from(&rotation);
        matrix.set_column(d, &translation);
        Ok(Pose { d, matrix })
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn rotation(&self) -> DMatrix<f64> {
        self.matrix.view((0, 0), (self.d, self.d)).into_owned()
    }

    pub fn translation(&self) -> DVector<f64> {
        self.matrix.column(self.d).into_owned()
    }

    pub fn set_rotation(&mut self, rotation: &DMatrix<f64>) {
        self.matrix
            .view_mut((0, 0), (self.d, self.d))
            .copy_from(rotation);
    }

    pub fn set_translation(&mut self, translation: &DVector<f64>) {
        self.matrix.set_column(self.d, translation);
    }

    /// Group composition: `self * other`.
    pub fn compose(&self, other: &Pose) -> Pose {
        let r1 = self.rotation();
        let r = &r1 * other.rotation();
        let t = &r1 * other.translation() + self.translation();
        let mut matrix = DMatrix::zeros(self.d, self.d + 1);
        matrix.view_mut((0, 0), (self.d, self.d)).copy_from(&r);
        matrix.set_column(self.d, &t);
        Pose { d: self.d, matrix }
    }

    /// Group inverse: `[Rᵀ | -Rᵀt]`.
    pub fn inverse(&self) -> Pose {
        let rt = self.rotation().transpose();
        let t = -(&rt * self.translation());
        let mut matrix = DMatrix::zeros(self.d, self.d + 1);
        matrix.view_mut((0, 0), (self.d, self.d)).copy_from(&rt);
        matrix.set_column(self.d, &t);
        Pose { d: self.d, matrix }
    }
}

/// A lifted pose `[Y | p]` with `Y ∈ St(d, r)` and `p ∈ ℝʳ`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedPose {
    r: usize,
    d: usize,
    matrix: DMatrix<f64>,
}

impl LiftedPose {
    /// Build a lifted pose from its `r x (d+1)` matrix form.
    pub fn from_matrix(d: usize, matrix: DMatrix<f64>) -> PgoResult<Self> {
        let r = matrix.nrows();
        if matrix.ncols() != d + 1 || r < d {
            return Err(PgoError::dims(
                format!("rx{} with r >= {d}", d + 1),
                format!("{}x{}", matrix.nrows(), matrix.ncols()),
            ));
        }
        Ok(LiftedPose { r, d, matrix })
    }

    pub fn relaxation_rank(&self) -> usize {
        self.r
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// The Stiefel component `Y` (`r x d`).
    pub fn rotation(&self) -> DMatrix<f64> {
        self.matrix.view((0, 0), (self.r, self.d)).into_owned()
    }

    /// The Euclidean component `p` (`r`).
    pub fn translation(&self) -> DVector<f64> {
        self.matrix.column(self.d).into_owned()
    }
}

/// Column concatenation of `n` rigid poses: a `d x n(d+1)` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseArray {
    d: usize,
    n: usize,
    data: DMatrix<f64>,
}

impl PoseArray {
    /// An array of `n` identity poses.
    pub fn new(d: usize, n: usize) -> Self {
        let mut data = DMatrix::zeros(d, n * (d + 1));
        for i in 0..n {
            data.view_mut((0, i * (d + 1)), (d, d)).fill_with_identity();
        }
        PoseArray { d, n, data }
    }

    pub fn from_matrix(d: usize, n: usize, data: DMatrix<f64>) -> PgoResult<Self> {
        if data.nrows() != d || data.ncols() != n * (d + 1) {
            return Err(PgoError::dims(
                format!("{d}x{}", n * (d + 1)),
                format!("{}x{}", data.nrows(), data.ncols()),
            ));
        }
        Ok(PoseArray { d, n, data })
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn num_poses(&self) -> usize {
        self.n
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn pose(&self, i: usize) -> Pose {
        let block = self
            .data
            .view((0, i * (self.d + 1)), (self.d, self.d + 1))
            .into_owned();
        Pose {
            d: self.d,
            matrix: block,
        }
    }

    pub fn set_pose(&mut self, i: usize, pose: &Pose) {
        self.data
            .view_mut((0, i * (self.d + 1)), (self.d, self.d + 1))
            .copy_from(pose.matrix());
    }

    pub fn rotation(&self, i: usize) -> DMatrix<f64> {
        self.data
            .view((0, i * (self.d + 1)), (self.d, self.d))
            .into_owned()
    }

    pub fn set_rotation(&mut self, i: usize, rotation: &DMatrix<f64>) {
        self.data
            .view_mut((0, i * (self.d + 1)), (self.d, self.d))
            .copy_from(rotation);
    }

    pub fn translation(&self, i: usize) -> DVector<f64> {
        self.data.column(i * (self.d + 1) + self.d).into_owned()
    }

    pub fn set_translation(&mut self, i: usize, translation: &DVector<f64>) {
        self.data
            .set_column(i * (self.d + 1) + self.d, translation);
    }
}

/// Column concatenation of `n` lifted poses: an `r x n(d+1)` matrix.
///
/// Used as the agent's iterate `X`, the Nesterov auxiliaries `Y` and `V`, and
/// the previous iterate.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedPoseArray {
    r: usize,
    d: usize,
    n: usize,
    data: DMatrix<f64>,
}

impl LiftedPoseArray {
    /// An array of `n` identity-lifted poses: `Y` is the first `d` columns of
    /// `I_r` and `p = 0`, which lies on the manifold.
    pub fn new(r: usize, d: usize, n: usize) -> Self {
        assert!(r >= d, "relaxation rank must be at least the dimension");
        let mut data = DMatrix::zeros(r, n * (d + 1));
        for i in 0..n {
            data.view_mut((0, i * (d + 1)), (d, d)).fill_with_identity();
        }
        LiftedPoseArray { r, d, n, data }
    }

    pub fn from_matrix(r: usize, d: usize, n: usize, data: DMatrix<f64>) -> PgoResult<Self> {
        if data.nrows() != r || data.ncols() != n * (d + 1) {
            return Err(PgoError::dims(
                format!("{r}x{}", n * (d + 1)),
                format!("{}x{}", data.nrows(), data.ncols()),
            ));
        }
        Ok(LiftedPoseArray { r, d, n, data })
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

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn set_matrix(&mut self, data: DMatrix<f64>) -> PgoResult<()> {
        if data.nrows() != self.r || data.ncols() != self.n * (self.d + 1) {
            return Err(PgoError::dims(
                format!("{}x{}", self.r, self.n * (self.d + 1)),
                format!("{}x{}", data.nrows(), data.ncols()),
            ));
        }
        self.data = data;
        Ok(())
    }

    pub fn pose(&self, i: usize) -> LiftedPose {
        let block = self
            .data
            .view((0, i * (self.d + 1)), (self.r, self.d + 1))
            .into_owned();
        LiftedPose {
            r: self.r,
            d: self.d,
            matrix: block,
        }
    }

    /// The Stiefel component of pose `i` (`r x d`).
    pub fn rotation(&self, i: usize) -> DMatrix<f64> {
        self.data
            .view((0, i * (self.d + 1)), (self.r, self.d))
            .into_owned()
    }

    /// The Euclidean component of pose `i` (`r`).
    pub fn translation(&self, i: usize) -> DVector<f64> {
        self.data.column(i * (self.d + 1) + self.d).into_owned()
    }

    /// Mean Euclidean distance between corresponding translation components.
    ///
    /// This is the `relativeChange` statistic driving local termination.
    pub fn average_translation_distance(a: &LiftedPoseArray, b: &LiftedPoseArray) -> PgoResult<f64> {
        if a.r != b.r || a.d != b.d || a.n != b.n {
            return Err(PgoError::dims(
                format!("({}, {}, {})", a.r, a.d, a.n),
                format!("({}, {}, {})", b.r, b.d, b.n),
            ));
        }
        if a.n == 0 {
            return Ok(0.0);
        }
        let total: f64 = (0..a.n)
            .map(|i| (a.translation(i) - b.translation(i)).norm())
            .sum();
        Ok(total / a.n as f64)
    }
}
