//! Two-robot scenario: robot 1 aligns its frame from a single shared loop
//! closure and the team then converges jointly.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use swarm_pgo::agent::{AgentParams, AgentState, PgoAgent};
use swarm_pgo::measurement::RelativePoseMeasurement;

fn odometry_edge(robot: usize, i: usize, t: &DVector<f64>) -> RelativePoseMeasurement {
    let d = t.len();
    let mut m =
        RelativePoseMeasurement::new(robot, i, robot, i + 1, DMatrix::identity(d, d), t.clone(), 1.0, 1.0);
    m.fixed_weight = true;
    m
}

fn exchange(a: &Arc<PgoAgent>, b: &Arc<PgoAgent>) {
    b.set_neighbor_status(a.status());
    a.set_neighbor_status(b.status());
    if let Ok(dict) = a.shared_pose_dict() {
        b.update_neighbor_poses(a.id(), &dict).unwrap();
    }
    if let Ok(dict) = b.shared_pose_dict() {
        a.update_neighbor_poses(b.id(), &dict).unwrap();
    }
}

#[test]
fn two_robot_alignment_and_convergence() {
    let d = 3;
    let mut params = AgentParams::new(d, 5);
    params.num_robots = 2;
    params.robust_init_min_inliers = 1;
    params.rel_change_tol = 1e-4;

    let agent0 = PgoAgent::new(0, params.clone());
    let agent1 = PgoAgent::new(1, params);

    let step = DVector::from_vec(vec![1.0, 0.0, 0.0]);
    // One shared loop closure: robot 0's pose 1 coincides with robot 1's
    // pose 0 (identity measurement).
    let shared = RelativePoseMeasurement::new(
        0,
        1,
        1,
        0,
        DMatrix::identity(d, d),
        DVector::zeros(d),
        1.0,
        1.0,
    );

    for agent in [&agent0, &agent1] {
        agent
            .add_measurement(odometry_edge(agent.id(), 0, &step))
            .unwrap();
        agent.add_measurement(shared.clone()).unwrap();
    }

    // Robot 0 seeds the lifting matrix and broadcasts it.
    agent1
        .set_lifting_matrix(agent0.lifting_matrix().unwrap())
        .unwrap();

    agent0.initialize(None).unwrap();
    assert_eq!(agent0.state(), AgentState::Initialized);

    agent1.initialize(None).unwrap();
    assert_eq!(agent1.state(), AgentState::WaitForInitialization);

    // A single public-pose exchange lets robot 1 align its frame.
    exchange(&agent0, &agent1);
    assert_eq!(agent1.state(), AgentState::Initialized);

    let mut converged_at = None;
    for tick in 0..200 {
        exchange(&agent0, &agent1);
        agent0.iterate(true).unwrap();
        agent1.iterate(true).unwrap();

        let s0 = agent0.status();
        let s1 = agent1.status();
        if tick > 0 && s0.relative_change <= 1e-4 && s1.relative_change <= 1e-4 {
            converged_at = Some(tick);
            break;
        }
    }
    let tick = converged_at.expect("team did not converge within 200 ticks");
    assert!(tick < 200);

    // With statuses exchanged once more, both agents agree on termination.
    exchange(&agent0, &agent1);
    assert!(agent0.should_terminate());
    assert!(agent1.should_terminate());

    // Robot 1's frame agrees with robot 0's: the shared pose pair coincides
    // in the global frame anchored at robot 0's first pose.
    let anchor = agent0.shared_pose(0).unwrap().matrix().clone();
    agent0.set_global_anchor(anchor.clone()).unwrap();
    agent1.set_global_anchor(anchor).unwrap();
    let t0 = agent0.trajectory_in_global_frame().unwrap();
    let t1 = agent1.trajectory_in_global_frame().unwrap();
    let shared_from_0 = t0.translation(1);
    let shared_from_1 = t1.translation(0);
    assert!(
        (shared_from_0 - shared_from_1).norm() < 1e-2,
        "shared pose disagrees between robots"
    );
}
