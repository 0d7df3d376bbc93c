//! # swarm-pgo
//!
//! Distributed pose-graph optimization agents on the lifted Stiefel
//! manifold. Each robot of a team runs one [`agent::PgoAgent`] that owns its
//! own trajectory segment, exchanges a small set of public poses with its
//! neighbors, and iterates a Riemannian block-coordinate descent on the
//! rank-relaxed manifold `(St(d, r) × ℝʳ)ⁿ` until the team collectively
//! converges.
//!
//! ## Features
//!
//! - **Lifted pose representation**: rotations relaxed onto `St(d, r)` with
//!   an exact rounding back to `SO(d)` for trajectory output
//! - **Riemannian solvers**: trust region (truncated-CG subproblem) and
//!   gradient descent over a shared problem seam
//! - **Nesterov acceleration** with periodic restarts for the synchronous
//!   update schedule
//! - **Robust optimization**: graduated non-convexity (TLS) plus Huber,
//!   Tukey, and Geman-McClure kernels for loop-closure outliers
//! - **Robust multi-robot initialization**: GNC-based rotation / pose
//!   averaging over per-edge frame-alignment candidates
//! - **Asynchronous execution**: optional per-agent executor ticking at a
//!   Poisson cadence
//! - **g2o loading** for 2D (`EDGE_SE2`) and 3D (`EDGE_SE3:QUAT`) datasets
//!
//! ## Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use swarm_pgo::agent::{AgentParams, PgoAgent};
//! use swarm_pgo::measurement::RelativePoseMeasurement;
//!
//! let agent = PgoAgent::new(0, AgentParams::new(3, 5));
//! for i in 0..4 {
//!     let mut m = RelativePoseMeasurement::new(
//!         0,
//!         i,
//!         0,
//!         i + 1,
//!         DMatrix::identity(3, 3),
//!         DVector::from_vec(vec![1.0, 0.0, 0.0]),
//!         1.0,
//!         1.0,
//!     );
//!     m.fixed_weight = true;
//!     agent.add_measurement(m).unwrap();
//! }
//! agent.initialize(None).unwrap();
//! for _ in 0..10 {
//!     agent.iterate(true).unwrap();
//! }
//! let trajectory = agent.trajectory_in_local_frame().unwrap();
//! assert_eq!(trajectory.num_poses(), 5);
//! ```

pub mod agent;
pub mod error;
pub mod graph;
pub mod init;
pub mod io;
pub mod logger;
pub mod manifold;
pub mod measurement;
pub mod optimizer;
pub mod pose;
pub mod problem;
pub mod robust;

pub use agent::{AgentParams, AgentState, AgentStatus, PgoAgent, RobustInitMethod};
pub use error::{PgoError, PgoResult};
pub use graph::PoseGraph;
pub use logger::init_logger;
pub use measurement::RelativePoseMeasurement;
pub use optimizer::RiemannianAlgorithm;
pub use pose::{LiftedPose, LiftedPoseArray, Pose, PoseArray, PoseId};
pub use robust::{RobustCost, RobustCostParams, RobustCostType};
