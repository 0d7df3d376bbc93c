//! Line-graph end-to-end scenario: a single robot with identity-rotation
//! odometry must reproduce the integrated chain exactly.

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use swarm_pgo::agent::{AgentParams, AgentState, PgoAgent};
use swarm_pgo::measurement::RelativePoseMeasurement;

#[test]
fn line_graph_converges_to_integrated_odometry() {
    let d = 3;
    let params = AgentParams::new(d, 3);
    let agent = PgoAgent::new(0, params);

    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let step = DVector::from_fn(d, |_, _| rng.gen::<f64>() - 0.5);
    for i in 0..4 {
        let mut m = RelativePoseMeasurement::new(
            0,
            i,
            0,
            i + 1,
            DMatrix::identity(d, d),
            step.clone(),
            1.0,
            1.0,
        );
        m.fixed_weight = true;
        agent.add_measurement(m).unwrap();
    }

    agent.initialize(None).unwrap();
    for _ in 0..10 {
        agent.iterate(true).unwrap();
    }

    assert_eq!(agent.num_poses(), 5);
    assert_eq!(agent.state(), AgentState::Initialized);

    let trajectory = agent.trajectory_in_local_frame().unwrap();
    assert_eq!(trajectory.num_poses(), 5);

    // First pose is [I | 0].
    assert!((trajectory.rotation(0) - DMatrix::identity(d, d)).norm() < 1e-6);
    assert!(trajectory.translation(0).norm() < 1e-6);

    // Consecutive translations differ by the odometry step.
    for i in 0..4 {
        let diff = trajectory.translation(i + 1) - trajectory.translation(i);
        assert!(
            (diff - &step).norm() < 1e-6,
            "consecutive translation difference deviates at pose {i}"
        );
    }

    // Rounded rotations satisfy the SO(d) invariants.
    for i in 0..5 {
        let r = trajectory.rotation(i);
        assert!((r.transpose() * &r - DMatrix::identity(d, d)).norm() < 1e-5);
        assert!((r.determinant() - 1.0).abs() < 1e-5);
    }
}
