//! AIMD limiters driven by real traffic

use mesh_components::{
    AlwaysFail, ErrorRateLimit, FailurePolicy, LatencyLimit, Limiter, MeshBuilder, NeverFail,
    Node, NodeConfig, Reaction, TrafficConfig, TrafficGenerator,
};
use mesh_core::{Executor, SimTime, Simulation};
use std::time::Duration;

/// Floods a single leaf and samples its limit half way through every control interval.
fn limit_history(limiter: Limiter, failure: Box<dyn FailurePolicy>, seconds: u64) -> Vec<usize> {
    let mut sim = Simulation::default();
    let mut mesh = MeshBuilder::new(&mut sim);
    let config = NodeConfig::new("leaf")
        .with_available_concurrency(1000)
        .with_compute_time(Duration::from_millis(10));
    let leaf = mesh.node(Node::new(config, limiter, failure, None).unwrap());
    let traffic = TrafficConfig::new("flood").with_rate(20, Duration::from_millis(1));
    mesh.generator(TrafficGenerator::new(traffic, vec![leaf]).unwrap());

    let mut history = Vec::new();
    for second in 0..seconds {
        sim.execute(Executor::timed(SimTime::from_millis(second * 1000 + 500)));
        let node: &Node = sim.get_component(leaf).unwrap();
        history.push(node.limiter().limit().unwrap());
    }
    history
}

#[test]
fn test_saturated_healthy_node_crawls_up_to_the_top() {
    let limiter = Limiter::new(Reaction::Discard, Box::new(ErrorRateLimit::new(30)));
    let history = limit_history(limiter, Box::new(NeverFail), 20);
    println!("limit per second: {history:?}");

    assert_eq!(history[0], 15);
    assert!(history.windows(2).all(|w| w[1] == (w[0] + 1).min(30)));
    assert_eq!(*history.last().unwrap(), 30);
}

#[test]
fn test_failing_node_backs_off_to_one() {
    let limiter = Limiter::new(Reaction::Discard, Box::new(ErrorRateLimit::new(200)));
    let history = limit_history(limiter, Box::new(AlwaysFail), 30);
    println!("limit per second: {history:?}");

    assert_eq!(history[0], 100);
    for w in history.windows(2) {
        assert_eq!(w[1], (w[0] * 9 / 10).max(1));
    }
    assert_eq!(*history.last().unwrap(), 1);
}

#[test]
fn test_slow_node_is_held_back_by_latency() {
    // Every request takes 10ms; a 5ms decrease trigger keeps cutting.
    let strategy =
        LatencyLimit::new(50, Duration::from_millis(5), Duration::from_millis(1)).unwrap();
    let limiter = Limiter::new(Reaction::Discard, Box::new(strategy));
    let history = limit_history(limiter, Box::new(NeverFail), 5);
    assert_eq!(history, vec![25, 22, 19, 17, 15]);
}

#[test]
fn test_fast_node_grows_under_latency_control() {
    let strategy =
        LatencyLimit::new(50, Duration::from_millis(100), Duration::from_millis(50)).unwrap();
    let limiter = Limiter::new(Reaction::Discard, Box::new(strategy));
    let history = limit_history(limiter, Box::new(NeverFail), 5);
    assert_eq!(history, vec![25, 26, 27, 28, 29]);
}

#[test]
fn test_discards_do_not_leak_slots() {
    let mut sim = Simulation::default();
    let mut mesh = MeshBuilder::new(&mut sim);
    let config = NodeConfig::new("leaf")
        .with_available_concurrency(4)
        .with_compute_time(Duration::from_millis(20));
    let limiter = Limiter::new(Reaction::Discard, Box::new(ErrorRateLimit::new(8)));
    let leaf = mesh.node(Node::new(config, limiter, Box::new(NeverFail), None).unwrap());
    let traffic = TrafficConfig::new("flood")
        .with_rate(5, Duration::from_millis(1))
        .with_max_requests(3000);
    let driver = mesh.generator(TrafficGenerator::new(traffic, vec![leaf]).unwrap());

    sim.execute(Executor::timed(SimTime::from_secs(3)));

    let node: &Node = sim.get_component(leaf).unwrap();
    assert!(node.stats().discarded > 0);
    assert_eq!(node.in_flight(), 0);
    assert_eq!(node.limiter().in_flight(), 0);

    let generator: &TrafficGenerator = sim.get_component(driver).unwrap();
    assert_eq!(generator.totals().sent, 3000);
    assert_eq!(generator.totals().answered(), 3000);
    assert_eq!(generator.totals().discarded, node.stats().discarded);
    assert_eq!(generator.totals().error, 0);
}
