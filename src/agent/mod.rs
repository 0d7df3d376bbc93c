//! The per-robot optimization agent: state machine, iterate loop, Nesterov
//! acceleration, robust frame alignment, and the stochastic executor.
//!
//! Each agent owns one trajectory segment of the team. It exchanges public
//! poses and status messages with its neighbors through an external transport
//! (out of scope here), and advances the distributed optimization one block
//! update at a time.
//!
//! # State machine
//!
//! ```text
//! WaitForData
//!   -- add_measurement / set_measurements --> (self)
//!   -- initialize() + (id == 0 or single-robot init) --> Initialized
//!   -- initialize() otherwise --> WaitForInitialization
//! WaitForInitialization
//!   -- update_neighbor_poses and robust alignment succeeds --> Initialized
//! Initialized
//!   -- reset() --> WaitForData
//! ```
//!
//! # Locking
//!
//! Three ordered locks guard disjoint regions: poses (iterate and
//! auxiliaries), measurements (pose graph and cached data matrices), and
//! neighbor poses (peer snapshots). They are always acquired in that order;
//! debug builds enforce it (see [`sync`]).

mod sync;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::error::{PgoError, PgoResult};
use crate::graph::PoseGraph;
use crate::init::{chordal_initialization, odometry_initialization};
use crate::manifold::{
    angular_to_chordal_so3, check_rotation, fixed_stiefel_sample, LiftedPoseManifold,
};
use crate::measurement::RelativePoseMeasurement;
use crate::optimizer::{OptimizerParams, QuadraticOptimizer, RiemannianAlgorithm};
use crate::pose::{LiftedPose, LiftedPoseArray, Pose, PoseArray, PoseId};
use crate::problem::QuadraticProblem;
use crate::robust::averaging::{
    robust_single_pose_averaging, robust_single_rotation_averaging, single_translation_averaging,
};
use crate::robust::{chi2_quantile, RobustCost, RobustCostParams, RobustCostType};

use sync::OrderedMutex;

/// Lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    WaitForData = 0,
    WaitForInitialization = 1,
    Initialized = 2,
}

impl AgentState {
    fn from_u8(value: u8) -> AgentState {
        match value {
            0 => AgentState::WaitForData,
            1 => AgentState::WaitForInitialization,
            _ => AgentState::Initialized,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::WaitForData => write!(f, "WAIT_FOR_DATA"),
            AgentState::WaitForInitialization => write!(f, "WAIT_FOR_INITIALIZATION"),
            AgentState::Initialized => write!(f, "INITIALIZED"),
        }
    }
}

/// Wire status of one agent, exchanged with the whole team.
///
/// A status is valid for the instance number it reports; receivers ignore
/// statuses from older instances.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub agent_id: usize,
    pub state: AgentState,
    pub instance_number: usize,
    pub iteration_number: usize,
    pub ready_to_terminate: bool,
    pub relative_change: f64,
}

impl AgentStatus {
    fn new(agent_id: usize, state: AgentState, instance_number: usize) -> Self {
        AgentStatus {
            agent_id,
            state,
            instance_number,
            iteration_number: 0,
            ready_to_terminate: false,
            relative_change: 0.0,
        }
    }
}

/// Strategy for the robust multi-robot frame alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobustInitMethod {
    /// Robust rotation averaging followed by translation averaging over the
    /// rotation inliers.
    #[default]
    TwoStage,
    /// Robust single pose averaging on the full candidate transforms.
    OneStage,
}

/// Configuration of one agent.
#[derive(Debug, Clone)]
pub struct AgentParams {
    /// Problem dimension `d` (2 or 3).
    pub dimension: usize,
    /// Relaxation rank `r >= d` of the lifted iterate.
    pub relaxation_rank: usize,
    /// Team size; drives the Nesterov momentum schedule and termination.
    pub num_robots: usize,
    /// Riemannian algorithm used by the per-tick block update.
    pub algorithm: RiemannianAlgorithm,
    /// Nesterov acceleration. Mutually exclusive with the background
    /// executor.
    pub acceleration: bool,
    /// Restart the momentum every this many iterations when accelerated.
    pub restart_interval: usize,
    /// Iteration cap after which the team terminates unconditionally.
    pub max_iterations: usize,
    /// Local termination threshold on the average translation change.
    pub rel_change_tol: f64,
    /// Robust kernel and GNC schedule for loop-closure reweighting.
    pub robust_cost: RobustCostParams,
    /// Reweight loop closures every this many iterations (non-L2 costs).
    pub robust_opt_inner_iters: usize,
    /// Keep the current iterate across reweighting rounds; when false the
    /// iterate is reset to the initial guess after every round.
    pub robust_opt_warm_start: bool,
    /// Minimum fraction of decided (accepted or rejected) loop closures
    /// required before reporting readiness to terminate.
    pub robust_opt_min_convergence_ratio: f64,
    /// Minimum inlier count for the robust frame alignment to succeed.
    pub robust_init_min_inliers: usize,
    /// Alignment strategy.
    pub robust_init_method: RobustInitMethod,
    /// Rotation scale of the one-stage pose averaging. Empirical constant;
    /// tune together with `robust_init_tau`.
    pub robust_init_kappa: f64,
    /// Translation scale of the one-stage pose averaging.
    pub robust_init_tau: f64,
    /// When false, every robot initializes its own global frame immediately
    /// instead of aligning against its neighbors.
    pub multirobot_initialization: bool,
    pub verbose: bool,
}

impl AgentParams {
    pub fn new(dimension: usize, relaxation_rank: usize) -> Self {
        assert!(dimension == 2 || dimension == 3, "dimension must be 2 or 3");
        assert!(relaxation_rank >= dimension);
        AgentParams {
            dimension,
            relaxation_rank,
            num_robots: 1,
            algorithm: RiemannianAlgorithm::TrustRegion,
            acceleration: false,
            restart_interval: 30,
            max_iterations: 1000,
            rel_change_tol: 1e-3,
            robust_cost: RobustCostParams::default(),
            robust_opt_inner_iters: 30,
            robust_opt_warm_start: true,
            robust_opt_min_convergence_ratio: 0.8,
            robust_init_min_inliers: 2,
            robust_init_method: RobustInitMethod::default(),
            robust_init_kappa: 1.82,
            robust_init_tau: 0.01,
            multirobot_initialization: true,
            verbose: false,
        }
    }
}

impl Default for AgentParams {
    fn default() -> Self {
        AgentParams::new(3, 5)
    }
}

/// Region guarded by the poses lock.
struct PoseState {
    x: LiftedPoseArray,
    y: LiftedPoseArray,
    v: LiftedPoseArray,
    x_prev: LiftedPoseArray,
    x_init: Option<LiftedPoseArray>,
    t_local_init: Option<PoseArray>,
    global_anchor: Option<LiftedPose>,
    gamma: f64,
    alpha: f64,
}

impl PoseState {
    fn new(r: usize, d: usize) -> Self {
        let x = LiftedPoseArray::new(r, d, 1);
        PoseState {
            y: x.clone(),
            v: x.clone(),
            x_prev: x.clone(),
            x,
            x_init: None,
            t_local_init: None,
            global_anchor: None,
            gamma: 0.0,
            alpha: 0.0,
        }
    }
}

fn initialize_acceleration(poses: &mut PoseState) {
    poses.x_prev = poses.x.clone();
    poses.v = poses.x.clone();
    poses.y = poses.x.clone();
    poses.gamma = 0.0;
    poses.alpha = 0.0;
}

/// Region guarded by the measurements lock.
struct GraphState {
    graph: PoseGraph,
    robust_cost: RobustCost,
}

/// Region guarded by the neighbor-poses lock.
#[derive(Default)]
struct NeighborState {
    pose_dict: HashMap<PoseId, LiftedPose>,
    aux_pose_dict: HashMap<PoseId, LiftedPose>,
    num_poses_received: usize,
}

/// A distributed pose-graph optimization agent.
///
/// Create with [`PgoAgent::new`], which returns an `Arc` so the optional
/// background executor can reference the agent from its own thread.
pub struct PgoAgent {
    id: usize,
    d: usize,
    r: usize,
    params: AgentParams,
    state: AtomicU8,
    instance_number: AtomicUsize,
    iteration_number: AtomicUsize,
    lifting_matrix: Mutex<Option<DMatrix<f64>>>,
    poses: OrderedMutex<PoseState>,
    measurements: OrderedMutex<GraphState>,
    neighbor_poses: OrderedMutex<NeighborState>,
    status: Mutex<AgentStatus>,
    team_status: Mutex<HashMap<usize, AgentStatus>>,
    stop_requested: AtomicBool,
    loop_rate: Mutex<f64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<PgoAgent>,
}

impl PgoAgent {
    /// Create a new agent. Robot 0 seeds the team's lifting matrix; every
    /// other robot must receive it through [`PgoAgent::set_lifting_matrix`]
    /// before initialization.
    pub fn new(id: usize, params: AgentParams) -> Arc<Self> {
        let d = params.dimension;
        let r = params.relaxation_rank;
        let lifting = if id == 0 {
            Some(fixed_stiefel_sample(r, d))
        } else {
            None
        };
        if params.verbose {
            info!(robot = id, d, r, "initializing agent");
        }
        Arc::new_cyclic(|weak| PgoAgent {
            id,
            d,
            r,
            state: AtomicU8::new(AgentState::WaitForData as u8),
            instance_number: AtomicUsize::new(0),
            iteration_number: AtomicUsize::new(0),
            lifting_matrix: Mutex::new(lifting),
            poses: OrderedMutex::new(0, "poses", PoseState::new(r, d)),
            measurements: OrderedMutex::new(
                1,
                "measurements",
                GraphState {
                    graph: PoseGraph::new(id, r, d),
                    robust_cost: RobustCost::new(params.robust_cost.clone()),
                },
            ),
            neighbor_poses: OrderedMutex::new(2, "neighbor-poses", NeighborState::default()),
            status: Mutex::new(AgentStatus::new(id, AgentState::WaitForData, 0)),
            team_status: Mutex::new(HashMap::new()),
            stop_requested: AtomicBool::new(false),
            loop_rate: Mutex::new(10.0),
            worker: Mutex::new(None),
            self_weak: weak.clone(),
            params,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn dimension(&self) -> usize {
        self.d
    }

    pub fn relaxation_rank(&self) -> usize {
        self.r
    }

    pub fn num_poses(&self) -> usize {
        self.measurements.lock().graph.num_poses()
    }

    pub fn instance_number(&self) -> usize {
        self.instance_number.load(Ordering::SeqCst)
    }

    pub fn iteration_number(&self) -> usize {
        self.iteration_number.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Provide the team's lifting matrix (an `r x d` Stiefel point). Once
    /// set, further calls are ignored; `reset` keeps it.
    pub fn set_lifting_matrix(&self, matrix: DMatrix<f64>) -> PgoResult<()> {
        if matrix.nrows() != self.r || matrix.ncols() != self.d {
            return Err(PgoError::dims(
                format!("{}x{}", self.r, self.d),
                format!("{}x{}", matrix.nrows(), matrix.ncols()),
            ));
        }
        let mut lifting = self.lifting_matrix.lock().unwrap();
        if lifting.is_some() {
            warn!(robot = self.id, "lifting matrix already set; ignoring");
            return Ok(());
        }
        *lifting = Some(matrix);
        Ok(())
    }

    /// The lifting matrix, if available. Robot 0 broadcasts this to the team.
    pub fn lifting_matrix(&self) -> Option<DMatrix<f64>> {
        self.lifting_matrix.lock().unwrap().clone()
    }

    /// Add one measurement. Only valid in `WaitForData`.
    pub fn add_measurement(&self, m: RelativePoseMeasurement) -> PgoResult<()> {
        if self.state() != AgentState::WaitForData {
            return Err(PgoError::InvalidState(format!(
                "add_measurement requires WAIT_FOR_DATA, agent is {}",
                self.state()
            )));
        }
        self.measurements.lock().graph.add_measurement(m)
    }

    /// Replace the pose graph with the given partitioned measurements.
    pub fn set_measurements(
        &self,
        odometry: Vec<RelativePoseMeasurement>,
        private_loop_closures: Vec<RelativePoseMeasurement>,
        shared_loop_closures: Vec<RelativePoseMeasurement>,
    ) -> PgoResult<()> {
        if self.is_optimization_running() {
            return Err(PgoError::InvalidState(
                "cannot replace measurements while the executor is running".to_string(),
            ));
        }
        if self.state() != AgentState::WaitForData {
            return Err(PgoError::InvalidState(format!(
                "set_measurements requires WAIT_FOR_DATA, agent is {}",
                self.state()
            )));
        }
        if odometry.is_empty() {
            warn!(robot = self.id, "set_measurements called without odometry");
            return Ok(());
        }
        let mut all = odometry;
        all.extend(private_loop_closures);
        all.extend(shared_loop_closures);
        self.measurements.lock().graph.set_measurements(all)
    }

    fn compute_local_init(&self, graph: &PoseGraph) -> PgoResult<PoseArray> {
        let n = graph.num_poses();
        if self.params.robust_cost.cost_type == RobustCostType::L2 {
            chordal_initialization(self.d, n, &graph.local_measurements())
        } else {
            // Robust mode: loop closures are not trusted yet, integrate
            // odometry instead.
            odometry_initialization(self.d, n, graph.odometry())
        }
    }

    /// Compute the local trajectory initialization and advance the state
    /// machine. Robot 0 (or any robot when multi-robot initialization is
    /// off) also fixes its global frame immediately.
    pub fn initialize(&self, t_init: Option<&PoseArray>) -> PgoResult<()> {
        if self.state() != AgentState::WaitForData {
            return Err(PgoError::InvalidState(format!(
                "initialize requires WAIT_FOR_DATA, agent is {}",
                self.state()
            )));
        }
        if self.is_optimization_running() {
            return Err(PgoError::InvalidState(
                "executor must not run during initialization".to_string(),
            ));
        }

        let (n, local_init) = {
            let meas = self.measurements.lock();
            let n = meas.graph.num_poses();
            if n == 0 {
                info!(robot = self.id, "local pose graph is empty, skipping initialization");
                return Ok(());
            }
            let local_init = match t_init {
                Some(t) if t.dimension() == self.d && t.num_poses() == n => t.clone(),
                Some(_) => {
                    warn!(
                        robot = self.id,
                        "provided initial trajectory has wrong shape; falling back to internal initialization"
                    );
                    self.compute_local_init(&meas.graph)?
                }
                None => self.compute_local_init(&meas.graph)?,
            };
            (n, local_init)
        };

        {
            let mut poses = self.poses.lock();
            poses.x = LiftedPoseArray::new(self.r, self.d, n);
            poses.t_local_init = Some(local_init);
        }
        self.set_state(AgentState::WaitForInitialization);

        if self.id == 0 || !self.params.multirobot_initialization {
            self.initialize_in_global_frame(&Pose::identity(self.d))?;
        }
        Ok(())
    }

    /// Apply a world-frame transform to the local initialization, lift the
    /// result through the lifting matrix, and mark the agent initialized.
    pub fn initialize_in_global_frame(&self, t_world_robot: &Pose) -> PgoResult<()> {
        if t_world_robot.dimension() != self.d {
            return Err(PgoError::dims(
                format!("dimension {}", self.d),
                format!("{}", t_world_robot.dimension()),
            ));
        }
        let y_lift = self
            .lifting_matrix
            .lock()
            .unwrap()
            .clone()
            .ok_or(PgoError::LiftingMatrixUnset)?;
        check_rotation(&t_world_robot.rotation());

        let halted = self.is_optimization_running();
        if halted {
            debug!(robot = self.id, "halting executor for global-frame initialization");
            self.end_optimization_loop();
        }

        {
            let mut poses = self.poses.lock();
            let _meas = self.measurements.lock();
            let mut neighbors = self.neighbor_poses.lock();
            neighbors.pose_dict.clear();
            neighbors.aux_pose_dict.clear();

            let local = poses.t_local_init.clone().ok_or_else(|| {
                PgoError::InvalidState("global-frame initialization requires a local initialization".to_string())
            })?;
            let n = local.num_poses();
            let mut aligned = local.clone();
            for i in 0..n {
                aligned.set_pose(i, &t_world_robot.compose(&local.pose(i)));
            }

            let lifted = &y_lift * aligned.matrix();
            poses.x = LiftedPoseArray::from_matrix(self.r, self.d, n, lifted)?;
            poses.x_init = Some(poses.x.clone());
            if self.params.acceleration {
                initialize_acceleration(&mut poses);
            }
        }

        if self.state() == AgentState::Initialized {
            info!(robot = self.id, "re-initialized in global frame");
        } else {
            info!(robot = self.id, "initialized in global frame");
            self.set_state(AgentState::Initialized);
        }

        if halted {
            let rate = *self.loop_rate.lock().unwrap();
            self.start_optimization_loop(rate)?;
        }
        Ok(())
    }

    /// Record the latest status received from a teammate. Statuses reporting
    /// an older instance than the cached one are ignored.
    pub fn set_neighbor_status(&self, status: AgentStatus) {
        let mut team = self.team_status.lock().unwrap();
        match team.get(&status.agent_id) {
            Some(existing) if existing.instance_number > status.instance_number => {
                debug!(
                    robot = self.id,
                    neighbor = status.agent_id,
                    "ignoring stale neighbor status"
                );
            }
            _ => {
                team.insert(status.agent_id, status);
            }
        }
    }

    fn neighbor_state(&self, neighbor_id: usize) -> Option<AgentState> {
        self.team_status
            .lock()
            .unwrap()
            .get(&neighbor_id)
            .map(|s| s.state)
    }

    /// Ingest a snapshot of a neighbor's public poses. While waiting for
    /// initialization this also attempts the robust frame alignment.
    pub fn update_neighbor_poses(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<()> {
        self.validate_neighbor_dict(neighbor_id, poses)?;
        let Some(neighbor_state) = self.neighbor_state(neighbor_id) else {
            return Ok(());
        };

        if self.state() == AgentState::WaitForInitialization {
            let alignment = match self.params.robust_init_method {
                RobustInitMethod::TwoStage => {
                    self.robust_neighbor_transform_two_stage(neighbor_id, poses)?
                }
                RobustInitMethod::OneStage => {
                    self.robust_neighbor_transform_one_stage(neighbor_id, poses)?
                }
            };
            if let Some(t_world_robot) = alignment {
                self.initialize_in_global_frame(&t_world_robot)?;
            }
        }

        let meas = self.measurements.lock();
        let mut neighbors = self.neighbor_poses.lock();
        for (id, pose) in poses {
            neighbors.num_poses_received += 1;
            if !meas.graph.has_neighbor_pose(*id) {
                continue;
            }
            // Cache only when both ends of the exchange are initialized.
            if self.state() == AgentState::Initialized && neighbor_state == AgentState::Initialized
            {
                neighbors.pose_dict.insert(*id, pose.clone());
            }
        }
        Ok(())
    }

    /// Ingest a snapshot of a neighbor's auxiliary (momentum) poses.
    pub fn update_aux_neighbor_poses(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<()> {
        if !self.params.acceleration {
            return Err(PgoError::InvalidState(
                "auxiliary poses are only exchanged under acceleration".to_string(),
            ));
        }
        self.validate_neighbor_dict(neighbor_id, poses)?;
        let Some(neighbor_state) = self.neighbor_state(neighbor_id) else {
            return Ok(());
        };

        let meas = self.measurements.lock();
        let mut neighbors = self.neighbor_poses.lock();
        for (id, pose) in poses {
            neighbors.num_poses_received += 1;
            if !meas.graph.has_neighbor_pose(*id) {
                continue;
            }
            if self.state() == AgentState::Initialized && neighbor_state == AgentState::Initialized
            {
                neighbors.aux_pose_dict.insert(*id, pose.clone());
            }
        }
        Ok(())
    }

    fn validate_neighbor_dict(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<()> {
        if neighbor_id == self.id {
            return Err(PgoError::InvalidInput(
                "neighbor pose update from self".to_string(),
            ));
        }
        for (id, pose) in poses {
            if id.robot_id != neighbor_id {
                return Err(PgoError::InvalidInput(format!(
                    "pose {id} in an update attributed to robot {neighbor_id}"
                )));
            }
            if pose.relaxation_rank() != self.r || pose.dimension() != self.d {
                return Err(PgoError::dims(
                    format!("{}x{}", self.r, self.d + 1),
                    format!("{}x{}", pose.relaxation_rank(), pose.dimension() + 1),
                ));
            }
        }
        Ok(())
    }

    /// Candidate world-frame transforms implied by each shared loop closure
    /// with the given neighbor that has a pose in the snapshot.
    fn alignment_candidates(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<(Vec<DMatrix<f64>>, Vec<nalgebra::DVector<f64>>)> {
        let y_lift = self
            .lifting_matrix
            .lock()
            .unwrap()
            .clone()
            .ok_or(PgoError::LiftingMatrixUnset)?;
        let agent_poses = self.poses.lock();
        let meas = self.measurements.lock();
        let local = agent_poses.t_local_init.as_ref().ok_or_else(|| {
            PgoError::InvalidState("frame alignment requires a local initialization".to_string())
        })?;

        let mut rotations = Vec::new();
        let mut translations = Vec::new();
        for m in meas.graph.shared_loop_closures_with(neighbor_id) {
            let frame = if m.r1 == neighbor_id { m.p1 } else { m.p2 };
            if let Some(neighbor_pose) = poses.get(&PoseId::new(neighbor_id, frame)) {
                let t = compute_neighbor_transform(self.id, m, neighbor_pose, local, &y_lift)?;
                rotations.push(t.rotation());
                translations.push(t.translation());
            }
        }
        Ok((rotations, translations))
    }

    /// Two-stage alignment: robust rotation averaging, then translation
    /// averaging over the rotation inliers.
    fn robust_neighbor_transform_two_stage(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<Option<Pose>> {
        let (rotations, translations) = self.alignment_candidates(neighbor_id, poses)?;
        if rotations.is_empty() {
            return Ok(None);
        }
        let kappa = vec![1.0; rotations.len()];
        let max_rotation_error = angular_to_chordal_so3(0.5); // about 30 degrees
        let (r_opt, inliers) =
            robust_single_rotation_averaging(&rotations, &kappa, max_rotation_error)?;
        info!(
            robot = self.id,
            neighbor = neighbor_id,
            inliers = inliers.len(),
            candidates = rotations.len(),
            "robust frame alignment attempt"
        );
        if inliers.len() < self.params.robust_init_min_inliers {
            return Ok(None);
        }
        let inlier_translations: Vec<_> =
            inliers.iter().map(|&i| translations[i].clone()).collect();
        let t_opt = single_translation_averaging(&inlier_translations, None)?;
        Ok(Some(Pose::from_parts(r_opt, t_opt)?))
    }

    /// One-stage alignment: robust single pose averaging on the candidates.
    fn robust_neighbor_transform_one_stage(
        &self,
        neighbor_id: usize,
        poses: &HashMap<PoseId, LiftedPose>,
    ) -> PgoResult<Option<Pose>> {
        let (rotations, translations) = self.alignment_candidates(neighbor_id, poses)?;
        if rotations.is_empty() {
            return Ok(None);
        }
        let m = rotations.len();
        let kappa = vec![self.params.robust_init_kappa; m];
        let tau = vec![self.params.robust_init_tau; m];
        let cbar = chi2_quantile(0.9, 3).sqrt();
        let (r_opt, t_opt, inliers) =
            robust_single_pose_averaging(&rotations, &translations, &kappa, &tau, cbar)?;
        info!(
            robot = self.id,
            neighbor = neighbor_id,
            inliers = inliers.len(),
            candidates = m,
            "robust frame alignment attempt"
        );
        if inliers.len() < self.params.robust_init_min_inliers {
            return Ok(None);
        }
        Ok(Some(Pose::from_parts(r_opt, t_opt)?))
    }

    /// Advance the distributed optimization by one round.
    ///
    /// `do_optimization = false` performs a "dry" tick that only advances the
    /// momentum variables.
    pub fn iterate(&self, do_optimization: bool) -> PgoResult<()> {
        let iteration = self.iteration_number.fetch_add(1, Ordering::SeqCst) + 1;

        let mut poses_guard = self.poses.lock();
        let mut meas_guard = self.measurements.lock();
        let neighbors_guard = self.neighbor_poses.lock();
        let poses = &mut *poses_guard;
        let meas = &mut *meas_guard;
        let neighbors = &*neighbors_guard;

        if self.state() == AgentState::Initialized
            && self.should_update_loop_closure_weights(iteration)
        {
            self.update_loop_closure_weights(poses, meas, neighbors);
            meas.robust_cost.update();
            if !self.params.robust_opt_warm_start {
                let x_init = poses.x_init.clone().ok_or_else(|| {
                    PgoError::InvalidState("robust restart requires an initial iterate".to_string())
                })?;
                info!(robot = self.id, "warm start disabled, resetting trajectory estimate");
                poses.x = x_init;
            }
            meas.graph.clear_data_matrices();
            if self.params.acceleration {
                initialize_acceleration(poses);
            }
        }

        if self.state() == AgentState::Initialized {
            poses.x_prev = poses.x.clone();

            let success = if self.params.acceleration {
                let team = self.params.num_robots as f64;
                poses.gamma =
                    (1.0 + (1.0 + 4.0 * team * team * poses.gamma * poses.gamma).sqrt())
                        / (2.0 * team);
                poses.alpha = 1.0 / (poses.gamma * team);

                let manifold =
                    LiftedPoseManifold::new(self.r, self.d, poses.x.num_poses());
                let blended =
                    poses.x.matrix() * (1.0 - poses.alpha) + poses.v.matrix() * poses.alpha;
                poses.y.set_matrix(manifold.project(&blended))?;

                let success = self.update_x(poses, meas, neighbors, do_optimization, true);

                let momentum = poses.v.matrix()
                    + (poses.x.matrix() - poses.y.matrix()) * poses.gamma;
                poses.v.set_matrix(manifold.project(&momentum))?;

                if (iteration + 1) % self.params.restart_interval.max(1) == 0 {
                    debug!(robot = self.id, iteration, "restarting Nesterov acceleration");
                    poses.x = poses.x_prev.clone();
                    self.update_x(poses, meas, neighbors, do_optimization, false);
                    poses.v = poses.x.clone();
                    poses.y = poses.x.clone();
                    poses.gamma = 0.0;
                    poses.alpha = 0.0;
                }
                success
            } else {
                self.update_x(poses, meas, neighbors, do_optimization, false)
            };

            if do_optimization {
                let relative_change =
                    LiftedPoseArray::average_translation_distance(&poses.x, &poses.x_prev)?;
                let converged_ratio = meas.graph.statistics().converged_ratio();
                let ready_to_terminate = success
                    && relative_change <= self.params.rel_change_tol
                    && converged_ratio >= self.params.robust_opt_min_convergence_ratio;

                let mut status = self.status.lock().unwrap();
                *status = AgentStatus {
                    agent_id: self.id,
                    state: self.state(),
                    instance_number: self.instance_number(),
                    iteration_number: iteration,
                    ready_to_terminate,
                    relative_change,
                };
            }
        }
        Ok(())
    }

    fn should_update_loop_closure_weights(&self, iteration: usize) -> bool {
        if self.params.robust_cost.cost_type == RobustCostType::L2 {
            return false;
        }
        (iteration + 1) % self.params.robust_opt_inner_iters.max(1) == 0
    }

    /// Recompute robust weights of every undecided loop closure.
    ///
    /// For shared edges, only the robot with the smaller id performs the
    /// update (the transport propagates the result); edges whose neighbor
    /// pose is missing from the cache are skipped this round.
    fn update_loop_closure_weights(
        &self,
        poses: &PoseState,
        meas: &mut GraphState,
        neighbors: &NeighborState,
    ) {
        let robot_id = self.id;
        let GraphState { graph, robust_cost } = meas;

        for m in graph.private_loop_closures_mut() {
            if m.known_inlier || m.fixed_weight {
                continue;
            }
            let residual = m
                .error(
                    &poses.x.rotation(m.p1),
                    &poses.x.translation(m.p1),
                    &poses.x.rotation(m.p2),
                    &poses.x.translation(m.p2),
                )
                .sqrt();
            m.weight = robust_cost.weight(residual);
            debug!(
                robot = robot_id,
                edge = %format!("({}, {}) -> ({}, {})", m.r1, m.p1, m.r2, m.p2),
                residual,
                weight = m.weight,
                "updated private loop closure weight"
            );
        }

        for m in graph.shared_loop_closures_mut() {
            if m.known_inlier || m.fixed_weight {
                continue;
            }
            let residual = if m.r1 == robot_id {
                if m.r2 < robot_id {
                    continue;
                }
                let Some(neighbor) = neighbors.pose_dict.get(&m.head_id()) else {
                    debug!(robot = robot_id, edge = %m.head_id(), "neighbor pose missing, skipping weight update");
                    continue;
                };
                m.error(
                    &poses.x.rotation(m.p1),
                    &poses.x.translation(m.p1),
                    &neighbor.rotation(),
                    &neighbor.translation(),
                )
                .sqrt()
            } else {
                if m.r1 < robot_id {
                    continue;
                }
                let Some(neighbor) = neighbors.pose_dict.get(&m.tail_id()) else {
                    debug!(robot = robot_id, edge = %m.tail_id(), "neighbor pose missing, skipping weight update");
                    continue;
                };
                m.error(
                    &neighbor.rotation(),
                    &neighbor.translation(),
                    &poses.x.rotation(m.p2),
                    &poses.x.translation(m.p2),
                )
                .sqrt()
            };
            m.weight = robust_cost.weight(residual);
            debug!(
                robot = robot_id,
                residual,
                weight = m.weight,
                "updated shared loop closure weight"
            );
        }
    }

    /// One block update of the iterate. Returns false (leaving `X`
    /// unchanged) when the data matrices cannot be constructed.
    fn update_x(
        &self,
        poses: &mut PoseState,
        meas: &mut GraphState,
        neighbors: &NeighborState,
        do_optimization: bool,
        accelerated: bool,
    ) -> bool {
        if !do_optimization {
            if accelerated {
                poses.x = poses.y.clone();
            }
            return true;
        }

        let dict = if accelerated {
            &neighbors.aux_pose_dict
        } else {
            &neighbors.pose_dict
        };
        meas.graph.set_neighbor_poses(dict);
        if let Err(e) = meas.graph.construct_data_matrices() {
            warn!(robot = self.id, error = %e, "cannot construct data matrices, skipping optimization");
            return false;
        }
        let n = meas.graph.num_poses();
        if n != poses.x.num_poses() {
            warn!(robot = self.id, "iterate and graph disagree on pose count, skipping optimization");
            return false;
        }
        let Some((q, g)) = meas.graph.quadratic_matrices() else {
            return false;
        };

        let manifold = LiftedPoseManifold::new(self.r, self.d, n);
        let problem = match QuadraticProblem::new(q, g, manifold) {
            Ok(problem) => problem,
            Err(e) => {
                warn!(robot = self.id, error = %e, "quadratic problem rejected data matrices");
                return false;
            }
        };

        let params = OptimizerParams {
            algorithm: self.params.algorithm,
            verbose: self.params.verbose,
            ..OptimizerParams::default()
        };
        let x0 = if accelerated {
            poses.y.matrix().clone()
        } else {
            poses.x.matrix().clone()
        };
        let (x_opt, result) = QuadraticOptimizer::new(&problem)
            .with_params(params)
            .optimize(&x0);
        debug!(robot = self.id, %result, "block update");

        poses.x.set_matrix(x_opt).is_ok()
    }

    /// Rank-`d` trust-region polish of the local (intra-robot) pose graph,
    /// used to bootstrap the chordal initialization.
    pub fn local_pose_graph_optimization(&self) -> PgoResult<DMatrix<f64>> {
        let (t0, local) = {
            let mut poses = self.poses.lock();
            let meas = self.measurements.lock();
            if meas.graph.num_poses() == 0 {
                return Err(PgoError::DataMatrix("pose graph is empty".to_string()));
            }
            if poses.t_local_init.is_none() {
                poses.t_local_init = Some(self.compute_local_init(&meas.graph)?);
            }
            (
                poses.t_local_init.clone().unwrap(),
                meas.graph.local_measurements(),
            )
        };

        let mut local_graph = PoseGraph::new(self.id, self.d, self.d);
        local_graph.set_measurements(local)?;
        local_graph.construct_data_matrices()?;
        let (q, g) = local_graph
            .quadratic_matrices()
            .ok_or_else(|| PgoError::DataMatrix("missing data matrices".to_string()))?;

        let manifold = LiftedPoseManifold::new(self.d, self.d, t0.num_poses());
        let problem = QuadraticProblem::new(q, g, manifold)?;
        let (x_opt, result) = QuadraticOptimizer::new(&problem)
            .with_params(OptimizerParams::local_bootstrap())
            .optimize(t0.matrix());
        debug!(robot = self.id, %result, "local pose graph optimization");
        Ok(x_opt)
    }

    /// Snapshot of the agent's full lifted iterate.
    pub fn x(&self) -> DMatrix<f64> {
        self.poses.lock().x.matrix().clone()
    }

    /// Overwrite the iterate (orchestrator/testing hook). Not valid in
    /// `WaitForData`.
    pub fn set_x(&self, data: DMatrix<f64>) -> PgoResult<()> {
        if self.state() == AgentState::WaitForData {
            return Err(PgoError::InvalidState(
                "set_x is not valid before measurements are loaded".to_string(),
            ));
        }
        let mut poses = self.poses.lock();
        if data.nrows() != self.r || data.ncols() % (self.d + 1) != 0 {
            return Err(PgoError::dims(
                format!("{}x k({})", self.r, self.d + 1),
                format!("{}x{}", data.nrows(), data.ncols()),
            ));
        }
        let n = data.ncols() / (self.d + 1);
        poses.x = LiftedPoseArray::from_matrix(self.r, self.d, n, data)?;
        if self.params.acceleration {
            initialize_acceleration(&mut poses);
        }
        drop(poses);
        self.set_state(AgentState::Initialized);
        Ok(())
    }

    /// One public pose of this agent's iterate.
    pub fn shared_pose(&self, index: usize) -> PgoResult<LiftedPose> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "shared poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        if index >= poses.x.num_poses() {
            return Err(PgoError::InvalidInput(format!(
                "pose index {index} out of range"
            )));
        }
        Ok(poses.x.pose(index))
    }

    /// One auxiliary (momentum) pose of this agent's iterate.
    pub fn aux_shared_pose(&self, index: usize) -> PgoResult<LiftedPose> {
        if !self.params.acceleration {
            return Err(PgoError::InvalidState(
                "auxiliary poses are only available under acceleration".to_string(),
            ));
        }
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "shared poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        if index >= poses.y.num_poses() {
            return Err(PgoError::InvalidInput(format!(
                "pose index {index} out of range"
            )));
        }
        Ok(poses.y.pose(index))
    }

    /// Outbound snapshot of this agent's public poses.
    pub fn shared_pose_dict(&self) -> PgoResult<HashMap<PoseId, LiftedPose>> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "shared poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let meas = self.measurements.lock();
        let mut dict = HashMap::new();
        for id in meas.graph.my_public_pose_ids() {
            debug_assert_eq!(id.robot_id, self.id);
            dict.insert(*id, poses.x.pose(id.frame_id));
        }
        Ok(dict)
    }

    /// Outbound snapshot of this agent's auxiliary (momentum) public poses.
    pub fn aux_shared_pose_dict(&self) -> PgoResult<HashMap<PoseId, LiftedPose>> {
        if !self.params.acceleration {
            return Err(PgoError::InvalidState(
                "auxiliary poses are only available under acceleration".to_string(),
            ));
        }
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "shared poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let meas = self.measurements.lock();
        let mut dict = HashMap::new();
        for id in meas.graph.my_public_pose_ids() {
            dict.insert(*id, poses.y.pose(id.frame_id));
        }
        Ok(dict)
    }

    /// Anchor pose shared by the whole team, provided by the orchestrator.
    pub fn set_global_anchor(&self, matrix: DMatrix<f64>) -> PgoResult<()> {
        let anchor = LiftedPose::from_matrix(self.d, matrix)?;
        if anchor.relaxation_rank() != self.r {
            return Err(PgoError::dims(
                format!("{}x{}", self.r, self.d + 1),
                format!("{}x{}", anchor.relaxation_rank(), anchor.dimension() + 1),
            ));
        }
        self.poses.lock().global_anchor = Some(anchor);
        Ok(())
    }

    /// Rounded SE(d) trajectory in the agent's own frame: the first pose's
    /// rotation is the identity and its translation is zero.
    pub fn trajectory_in_local_frame(&self) -> PgoResult<PoseArray> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "trajectory unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let rotation0 = poses.x.rotation(0);
        let data = rotation0.transpose() * poses.x.matrix();
        Self::round_trajectory(self.d, poses.x.num_poses(), data, None)
    }

    /// Rounded SE(d) trajectory in the team's global frame. Requires the
    /// global anchor.
    pub fn trajectory_in_global_frame(&self) -> PgoResult<PoseArray> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "trajectory unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let anchor = poses.global_anchor.clone().ok_or_else(|| {
            PgoError::InvalidState("global anchor has not been set".to_string())
        })?;
        let anchor_rotation = anchor.rotation();
        let t0 = anchor_rotation.transpose() * anchor.translation();
        let data = anchor_rotation.transpose() * poses.x.matrix();
        Self::round_trajectory(self.d, poses.x.num_poses(), data, Some(t0))
    }

    fn round_trajectory(
        d: usize,
        n: usize,
        data: DMatrix<f64>,
        origin: Option<nalgebra::DVector<f64>>,
    ) -> PgoResult<PoseArray> {
        let mut trajectory = PoseArray::from_matrix(d, n, data)?;
        let t0 = origin.unwrap_or_else(|| trajectory.translation(0));
        for i in 0..n {
            let rounded = crate::manifold::project_to_rotation_group(&trajectory.rotation(i));
            trajectory.set_rotation(i, &rounded);
            let shifted = trajectory.translation(i) - &t0;
            trajectory.set_translation(i, &shifted);
        }
        Ok(trajectory)
    }

    /// One own pose expressed in the global frame.
    pub fn pose_in_global_frame(&self, index: usize) -> PgoResult<Pose> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let anchor = poses.global_anchor.clone().ok_or_else(|| {
            PgoError::InvalidState("global anchor has not been set".to_string())
        })?;
        if index >= poses.x.num_poses() {
            return Err(PgoError::InvalidInput(format!(
                "pose index {index} out of range"
            )));
        }
        let anchor_rotation = anchor.rotation();
        let t0 = anchor_rotation.transpose() * anchor.translation();
        let mut block = anchor_rotation.transpose() * poses.x.pose(index).matrix();
        let shifted = block.column(self.d) - t0;
        block.set_column(self.d, &shifted);
        Pose::from_matrix(block)
    }

    /// One cached neighbor pose expressed in the global frame.
    pub fn neighbor_pose_in_global_frame(
        &self,
        neighbor_id: usize,
        frame_id: usize,
    ) -> PgoResult<Pose> {
        if self.state() != AgentState::Initialized {
            return Err(PgoError::InvalidState(format!(
                "poses unavailable in {}",
                self.state()
            )));
        }
        let poses = self.poses.lock();
        let anchor = poses.global_anchor.clone().ok_or_else(|| {
            PgoError::InvalidState("global anchor has not been set".to_string())
        })?;
        let neighbors = self.neighbor_poses.lock();
        let id = PoseId::new(neighbor_id, frame_id);
        let neighbor = neighbors.pose_dict.get(&id).ok_or_else(|| {
            PgoError::InvalidInput(format!("no cached pose for {id}"))
        })?;
        let anchor_rotation = anchor.rotation();
        let t0 = anchor_rotation.transpose() * anchor.translation();
        let mut block = anchor_rotation.transpose() * neighbor.matrix();
        let shifted = block.column(self.d) - t0;
        block.set_column(self.d, &shifted);
        Pose::from_matrix(block)
    }

    /// Ids of the robots this agent shares loop closures with.
    pub fn neighbors(&self) -> Vec<usize> {
        let meas = self.measurements.lock();
        let mut ids: Vec<usize> = meas.graph.neighbor_ids().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Frame ids of the given neighbor's poses referenced by this agent.
    pub fn neighbor_public_poses(&self, neighbor_id: usize) -> Vec<usize> {
        let meas = self.measurements.lock();
        let mut frames: Vec<usize> = meas
            .graph
            .neighbor_public_pose_ids()
            .iter()
            .filter(|id| id.robot_id == neighbor_id)
            .map(|id| id.frame_id)
            .collect();
        frames.sort_unstable();
        frames
    }

    /// Loop-closure classification counts under the current robust weights.
    pub fn graph_statistics(&self) -> crate::graph::GraphStatistics {
        self.measurements.lock().graph.statistics()
    }

    /// Snapshot of all measurements, including their current robust weights.
    pub fn measurements(&self) -> Vec<RelativePoseMeasurement> {
        self.measurements.lock().graph.measurements()
    }

    /// Latest status of this agent.
    pub fn status(&self) -> AgentStatus {
        let mut status = self.status.lock().unwrap();
        status.agent_id = self.id;
        status.state = self.state();
        status.instance_number = self.instance_number();
        status.clone()
    }

    /// Team termination: every robot reports `Initialized` and ready, or the
    /// iteration cap is exceeded.
    pub fn should_terminate(&self) -> bool {
        if self.iteration_number() > self.params.max_iterations {
            info!(robot = self.id, "reached maximum iterations");
            return true;
        }
        let own = self.status();
        let team = self.team_status.lock().unwrap();
        for robot in 0..self.params.num_robots {
            let status = if robot == self.id {
                Some(&own)
            } else {
                team.get(&robot)
            };
            match status {
                Some(s) if s.state == AgentState::Initialized && s.ready_to_terminate => {}
                _ => return false,
            }
        }
        true
    }

    /// Start the background executor: one optimization tick per
    /// exponentially distributed interval with the given rate (Hz).
    ///
    /// Incompatible with Nesterov acceleration.
    pub fn start_optimization_loop(&self, rate_hz: f64) -> PgoResult<()> {
        if self.params.acceleration {
            return Err(PgoError::Executor(
                "acceleration and the background executor are mutually exclusive".to_string(),
            ));
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(PgoError::InvalidInput(format!(
                "executor rate must be positive, got {rate_hz}"
            )));
        }
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!(robot = self.id, "executor already running");
            return Ok(());
        }
        *self.loop_rate.lock().unwrap() = rate_hz;
        self.stop_requested.store(false, Ordering::SeqCst);

        let weak = self.self_weak.clone();
        let robot = self.id;
        let handle = thread::Builder::new()
            .name(format!("pgo-agent-{robot}"))
            .spawn(move || {
                debug!(robot, rate_hz, "executor running");
                let mut rng = ChaCha8Rng::from_entropy();
                loop {
                    // Poisson cadence decorrelates iterates across agents.
                    let u: f64 = rng.gen();
                    let interval = -(1.0 - u).ln() / rate_hz;
                    thread::sleep(Duration::from_secs_f64(interval));

                    let Some(agent) = weak.upgrade() else { break };
                    if agent.stop_requested.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = agent.iterate(true) {
                        warn!(robot, error = %e, "iteration failed");
                    }
                }
                debug!(robot, "executor exited");
            })
            .map_err(|e| PgoError::Executor(e.to_string()))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Signal the executor to stop after its current tick and join it.
    pub fn end_optimization_loop(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            self.stop_requested.store(true, Ordering::SeqCst);
            if handle.join().is_err() {
                warn!(robot = self.id, "executor thread panicked");
            }
            self.stop_requested.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_optimization_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Return to `WaitForData`: increments the instance number, zeroes the
    /// iteration counter, clears all cached state, and keeps the lifting
    /// matrix.
    pub fn reset(&self) {
        self.end_optimization_loop();

        let instance = self.instance_number.fetch_add(1, Ordering::SeqCst) + 1;
        self.iteration_number.store(0, Ordering::SeqCst);
        self.set_state(AgentState::WaitForData);

        *self.poses.lock() = PoseState::new(self.r, self.d);
        {
            let mut meas = self.measurements.lock();
            meas.graph = PoseGraph::new(self.id, self.r, self.d);
            meas.robust_cost.reset();
        }
        {
            let mut neighbors = self.neighbor_poses.lock();
            neighbors.pose_dict.clear();
            neighbors.aux_pose_dict.clear();
            neighbors.num_poses_received = 0;
        }
        *self.status.lock().unwrap() =
            AgentStatus::new(self.id, AgentState::WaitForData, instance);
        self.team_status.lock().unwrap().clear();
        info!(robot = self.id, instance, "agent reset");
    }
}

impl Drop for PgoAgent {
    fn drop(&mut self) {
        self.end_optimization_loop();
    }
}

/// Candidate world-frame transform implied by one shared loop closure.
///
/// The neighbor's lifted pose is unlifted through `YLiftᵀ`, composed with the
/// edge transform (or its inverse for incoming edges), and referred back
/// through the local initialization of the own endpoint.
fn compute_neighbor_transform(
    my_id: usize,
    m: &RelativePoseMeasurement,
    neighbor_pose: &LiftedPose,
    local_init: &PoseArray,
    y_lift: &DMatrix<f64>,
) -> PgoResult<Pose> {
    let edge = Pose::from_parts(m.rotation.clone(), m.translation.clone())?;
    let t_world2_frame2 = Pose::from_matrix(y_lift.transpose() * neighbor_pose.matrix())?;
    check_rotation(&t_world2_frame2.rotation());

    let (t_frame1_frame2, t_world1_frame1) = if m.r2 == my_id {
        // Incoming edge: the neighbor owns the tail.
        (edge.inverse(), local_init.pose(m.p2))
    } else {
        // Outgoing edge: the neighbor owns the head.
        (edge, local_init.pose(m.p1))
    };
    let t_world2_frame1 = t_world2_frame2.compose(&t_frame1_frame2.inverse());
    let t_world2_world1 = t_world2_frame1.compose(&t_world1_frame1.inverse());
    check_rotation(&t_world2_world1.rotation());
    Ok(t_world2_world1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn odometry_edge(robot: usize, i: usize, t: &DVector<f64>) -> RelativePoseMeasurement {
        let d = t.len();
        let mut m = RelativePoseMeasurement::new(
            robot,
            i,
            robot,
            i + 1,
            DMatrix::identity(d, d),
            t.clone(),
            1.0,
            1.0,
        );
        m.fixed_weight = true;
        m
    }

    fn line_graph_agent(n: usize) -> Arc<PgoAgent> {
        let agent = PgoAgent::new(0, AgentParams::new(3, 3));
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for i in 0..n - 1 {
            let t = DVector::from_fn(3, |_, _| rng.gen::<f64>() - 0.5);
            agent.add_measurement(odometry_edge(0, i, &t)).unwrap();
        }
        agent
    }

    #[test]
    fn test_state_machine_transitions() {
        let agent = line_graph_agent(5);
        assert_eq!(agent.state(), AgentState::WaitForData);

        agent.initialize(None).unwrap();
        // Robot 0 initializes its own global frame immediately.
        assert_eq!(agent.state(), AgentState::Initialized);
        assert_eq!(agent.num_poses(), 5);

        // Adding measurements is no longer allowed.
        assert!(agent
            .add_measurement(odometry_edge(0, 5, &DVector::zeros(3)))
            .is_err());

        for _ in 0..3 {
            agent.iterate(true).unwrap();
        }
        assert_eq!(agent.iteration_number(), 3);
    }

    #[test]
    fn test_iterate_preserves_stiefel_blocks() {
        let agent = line_graph_agent(4);
        agent.initialize(None).unwrap();
        for _ in 0..5 {
            agent.iterate(true).unwrap();
        }
        let x = agent.x();
        for i in 0..4 {
            let y = x.view((0, i * 4), (3, 3)).into_owned();
            assert!((y.transpose() * &y - DMatrix::identity(3, 3)).norm() < 1e-5);
        }
    }

    #[test]
    fn test_reset_semantics() {
        let agent = line_graph_agent(4);
        agent.initialize(None).unwrap();
        agent.iterate(true).unwrap();
        let lifting = agent.lifting_matrix().unwrap();

        agent.reset();
        assert_eq!(agent.state(), AgentState::WaitForData);
        assert_eq!(agent.instance_number(), 1);
        assert_eq!(agent.iteration_number(), 0);
        assert_eq!(agent.num_poses(), 0);
        assert_eq!(agent.lifting_matrix().unwrap(), lifting);

        let neighbors = agent.neighbor_poses.lock();
        assert!(neighbors.pose_dict.is_empty());
        assert!(neighbors.aux_pose_dict.is_empty());
        assert_eq!(neighbors.num_poses_received, 0);
    }

    #[test]
    fn test_lifting_matrix_is_immutable_once_set() {
        let agent = PgoAgent::new(1, AgentParams::new(3, 5));
        assert!(agent.lifting_matrix().is_none());

        let lifting = fixed_stiefel_sample(5, 3);
        agent.set_lifting_matrix(lifting.clone()).unwrap();

        let other = crate::manifold::random_stiefel_sample(
            5,
            3,
            &mut ChaCha8Rng::seed_from_u64(99),
        );
        agent.set_lifting_matrix(other).unwrap();
        assert_eq!(agent.lifting_matrix().unwrap(), lifting);
    }

    #[test]
    fn test_nesterov_restart_clears_momentum() {
        let mut params = AgentParams::new(3, 3);
        params.acceleration = true;
        params.restart_interval = 3;
        let agent = PgoAgent::new(0, params);
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        for i in 0..3 {
            let t = DVector::from_fn(3, |_, _| rng.gen::<f64>() - 0.5);
            agent.add_measurement(odometry_edge(0, i, &t)).unwrap();
        }
        agent.initialize(None).unwrap();

        // Iterations 1 and 2; (2 + 1) % 3 == 0 triggers the restart.
        agent.iterate(true).unwrap();
        agent.iterate(true).unwrap();

        let poses = agent.poses.lock();
        assert_eq!(poses.gamma, 0.0);
        assert_eq!(poses.alpha, 0.0);
        assert_eq!(poses.v, poses.x);
        assert_eq!(poses.y, poses.x);
    }

    #[test]
    fn test_update_x_failure_leaves_iterate_unchanged() {
        // A shared loop closure with no cached neighbor pose: the block
        // update must fail gracefully and keep X as it was.
        let mut params = AgentParams::new(3, 3);
        params.num_robots = 2;
        let agent = PgoAgent::new(0, params);
        agent
            .add_measurement(odometry_edge(0, 0, &DVector::from_vec(vec![1.0, 0.0, 0.0])))
            .unwrap();
        agent
            .add_measurement(RelativePoseMeasurement::new(
                0,
                1,
                1,
                0,
                DMatrix::identity(3, 3),
                DVector::zeros(3),
                1.0,
                1.0,
            ))
            .unwrap();
        agent.initialize(None).unwrap();

        let x_before = agent.x();
        agent.iterate(true).unwrap();
        assert_eq!(agent.x(), x_before);
        assert!(!agent.status().ready_to_terminate);
    }

    #[test]
    fn test_local_pose_graph_optimization() {
        let agent = line_graph_agent(5);
        let solution = agent.local_pose_graph_optimization().unwrap();
        assert_eq!(solution.nrows(), 3);
        assert_eq!(solution.ncols(), 5 * 4);
        // Rank-d blocks remain orthogonal after the polish.
        for i in 0..5 {
            let y = solution.view((0, i * 4), (3, 3)).into_owned();
            assert!((y.transpose() * &y - DMatrix::identity(3, 3)).norm() < 1e-6);
        }
    }

    #[test]
    fn test_aux_poses_require_acceleration() {
        let agent = line_graph_agent(3);
        agent.initialize(None).unwrap();
        assert!(agent.aux_shared_pose_dict().is_err());
        assert!(agent
            .update_aux_neighbor_poses(1, &HashMap::new())
            .is_err());
    }

    #[test]
    fn test_executor_rejects_acceleration() {
        let mut params = AgentParams::new(3, 3);
        params.acceleration = true;
        let agent = PgoAgent::new(0, params);
        assert!(agent.start_optimization_loop(10.0).is_err());
    }

    #[test]
    fn test_executor_start_stop() {
        let agent = line_graph_agent(4);
        agent.initialize(None).unwrap();
        agent.start_optimization_loop(200.0).unwrap();
        assert!(agent.is_optimization_running());
        thread::sleep(Duration::from_millis(100));
        agent.end_optimization_loop();
        assert!(!agent.is_optimization_running());
        assert!(agent.iteration_number() > 0);
    }
}
