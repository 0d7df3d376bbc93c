//! Loader-to-agent pipeline: a g2o square loop parses, partitions, and
//! optimizes to zero cost.

use swarm_pgo::agent::{AgentParams, PgoAgent};
use swarm_pgo::io::g2o::parse_content;

const INFO_2D: &str = "1.0 0.0 0.0 1.0 0.0 1.0";

#[test]
fn g2o_square_loop_optimizes() {
    let half_pi = std::f64::consts::FRAC_PI_2;
    let mut content = String::new();
    for i in 0..3 {
        content.push_str(&format!(
            "EDGE_SE2 {} {} 1.0 0.0 {half_pi} {INFO_2D}\n",
            i,
            i + 1
        ));
    }
    content.push_str(&format!("EDGE_SE2 3 0 1.0 0.0 {half_pi} {INFO_2D}\n"));

    let (measurements, num_poses) = parse_content(&content).unwrap();
    assert_eq!(num_poses, 4);
    assert_eq!(measurements.len(), 4);

    let (odometry, loop_closures): (Vec<_>, Vec<_>) =
        measurements.into_iter().partition(|m| m.fixed_weight);
    assert_eq!(odometry.len(), 3);
    assert_eq!(loop_closures.len(), 1);

    let agent = PgoAgent::new(0, AgentParams::new(2, 3));
    agent
        .set_measurements(odometry, loop_closures, Vec::new())
        .unwrap();
    agent.initialize(None).unwrap();
    for _ in 0..10 {
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
    assert!(cost < 1e-6, "pipeline cost {cost}");
}
