//! Closed-loop scenario: a single robot with one consistent loop closure
//! must reach (numerically) zero cost under the L2 objective.

use nalgebra::{DMatrix, DVector};
use swarm_pgo::agent::{AgentParams, PgoAgent};
use swarm_pgo::measurement::RelativePoseMeasurement;

fn square_loop_measurements() -> Vec<RelativePoseMeasurement> {
    let quarter_turn = DMatrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]);
    let forward = DVector::from_vec(vec![1.0, 0.0]);
    let mut measurements: Vec<_> = (0..3)
        .map(|i| {
            let mut m = RelativePoseMeasurement::new(
                0,
                i,
                0,
                i + 1,
                quarter_turn.clone(),
                forward.clone(),
                1.0,
                1.0,
            );
            m.fixed_weight = true;
            m
        })
        .collect();
    // Consistent closing edge 3 -> 0.
    measurements.push(RelativePoseMeasurement::new(
        0,
        3,
        0,
        0,
        quarter_turn,
        forward,
        1.0,
        1.0,
    ));
    measurements
}

#[test]
fn consistent_loop_reaches_zero_cost() {
    let params = AgentParams::new(2, 3);
    let agent = PgoAgent::new(0, params);
    for m in square_loop_measurements() {
        agent.add_measurement(m).unwrap();
    }

    agent.initialize(None).unwrap();
    for _ in 0..20 {
        agent.iterate(true).unwrap();
    }

    let trajectory = agent.trajectory_in_local_frame().unwrap();
    let cost: f64 = agent
        .measurements()
        .iter()
        .map(|m| {
            m.error(
                &trajectory.rotation(m.p1),
                &trajectory.translation(m.p1),
                &trajectory.rotation(m.p2),
                &trajectory.translation(m.p2),
            )
        })
        .sum();
    assert!(cost <= 1e-6, "final cost {cost} above threshold");
}
