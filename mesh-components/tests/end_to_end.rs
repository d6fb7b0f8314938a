//! Whole meshes: conservation, path integrity, reporting and configuration loading

mod common;

use common::{inject, probe, Probe, Reply};
use mesh_components::{
    Balancing, Limiter, MeshBuilder, NeverFail, Node, NodeConfig, Reaction, ResponseStatus,
    Router, Scenario, StaticLimit, TrafficGenerator,
};
use mesh_core::{init_simulation_logging_with_level, Executor, SimTime, Simulation, SimulationConfig};
use std::time::Duration;

fn run(scenario: &Scenario, until: SimTime) -> (Simulation, mesh_components::Mesh) {
    let mut sim = Simulation::new(SimulationConfig {
        seed: scenario.seed,
    });
    let mesh = scenario.build(&mut sim).unwrap();
    sim.execute(Executor::timed(until));
    (sim, mesh)
}

#[test]
fn test_every_request_gets_exactly_one_answer() {
    init_simulation_logging_with_level("warn");

    let mut scenario = Scenario::small();
    scenario.traffic = scenario.traffic.clone().with_max_requests(2000);
    let (sim, mesh) = run(&scenario, SimTime::from_secs(6));

    let totals = mesh.generator(&sim).unwrap().totals().clone();
    println!("totals: {totals:?}");
    assert_eq!(totals.sent, 2000);
    assert_eq!(totals.answered(), totals.sent);
    assert_eq!(mesh.generator(&sim).unwrap().outstanding(), 0);

    for &address in mesh.leaves.iter().chain(&mesh.fronts) {
        let node = mesh.node(&sim, address).unwrap();
        assert_eq!(node.in_flight(), 0, "{} still busy", node.name());
        assert_eq!(node.limiter().in_flight(), 0, "{} leaked a slot", node.name());
    }
    for (router, pool) in [(mesh.leaf_router, &mesh.leaves), (mesh.front_router, &mesh.fronts)] {
        let router: &Router = sim.get_component(router).unwrap();
        for &member in pool {
            assert_eq!(router.in_flight(member), Some(0));
        }
    }
}

#[test]
fn test_return_path_grows_one_hop_at_a_time_and_unwinds_fully() {
    let mut sim = Simulation::default();
    let client = sim.add_component(Probe::silent());
    let leaf = sim.add_component(Probe::answering(Reply::now(ResponseStatus::Ok)));
    let mut mesh = MeshBuilder::new(&mut sim);
    let leaf_router = mesh.router(Router::new("inner", vec![leaf], Balancing::RoundRobin).unwrap());
    let config = NodeConfig::new("front").with_compute_time(Duration::from_millis(2));
    let front = mesh.node(Node::new(config, Limiter::unlimited(), Box::new(NeverFail), Some(leaf_router)).unwrap());
    let front_router = mesh.router(Router::new("outer", vec![front], Balancing::LeastBusy).unwrap());

    inject(&mut sim, client, front_router, 1);
    sim.execute(Executor::timed(SimTime::from_millis(20)));

    let (_, deepest, _) = &probe(&sim, leaf).requests[0];
    assert_eq!(
        deepest.return_path.hops(),
        &[client, front_router, front, leaf_router]
    );

    let client = probe(&sim, client);
    assert_eq!(client.statuses(), vec![ResponseStatus::Ok]);
    assert!(client.responses[0].1.request.return_path.is_empty());
}

#[test]
fn test_cpu_contention_halves_the_speed_of_two_requests() {
    let mut sim = Simulation::default();
    let client = sim.add_component(Probe::silent());
    let config = NodeConfig::new("single-core")
        .with_available_concurrency(1)
        .with_compute_time(Duration::from_millis(10));
    let node = MeshBuilder::new(&mut sim).node(Node::leaf(config).unwrap());
    inject(&mut sim, client, node, 1);
    inject(&mut sim, client, node, 2);

    sim.execute(Executor::timed(SimTime::from_millis(50)));

    let finished: Vec<u64> = probe(&sim, client)
        .responses
        .iter()
        .map(|(at, _)| at.as_millis())
        .collect();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|ms| (19..=21).contains(ms)), "{finished:?}");
}

#[test]
fn test_wait_reaction_queues_instead_of_discarding() {
    let mut sim = Simulation::default();
    let client = sim.add_component(Probe::silent());
    let config = NodeConfig::new("queued")
        .with_available_concurrency(4)
        .with_compute_time(Duration::from_millis(10));
    let limiter = Limiter::new(Reaction::Wait, Box::new(StaticLimit::new(1)));
    let node = MeshBuilder::new(&mut sim).node(Node::new(config, limiter, Box::new(NeverFail), None).unwrap());
    for n in 0..3 {
        inject(&mut sim, client, node, n);
    }

    sim.execute(Executor::timed(SimTime::from_millis(5)));
    let busy: &Node = sim.get_component(node).unwrap();
    assert_eq!(busy.limiter().queued(), 2);

    sim.execute(Executor::timed(SimTime::from_millis(50)));
    let client = probe(&sim, client);
    let finished: Vec<(u64, ResponseStatus)> = client
        .responses
        .iter()
        .map(|(at, r)| (at.as_millis(), r.status))
        .collect();
    assert_eq!(
        finished,
        vec![
            (10, ResponseStatus::Ok),
            (20, ResponseStatus::Ok),
            (30, ResponseStatus::Ok)
        ]
    );
}

#[test]
fn test_generator_reports_once_per_second() {
    let (sim, mesh) = run(&Scenario::small(), SimTime::from_millis(5500));

    let generator = mesh.generator(&sim).unwrap();
    let reports = generator.reports();
    for report in reports {
        println!("{report}");
    }
    assert_eq!(reports.len(), 5);
    assert_eq!(reports[1].sent, 2000);
    assert!(reports.iter().skip(1).all(|r| r.succeeded > 0));
    assert!(reports[1].success_latency_ms >= 200);
}

#[test]
fn test_runs_with_the_same_seed_are_identical() {
    let mut scenario = Scenario::small();
    scenario.faulty_leaf = Some(mesh_components::FailureConfig::Random {
        share: 0.2,
        seed: 5,
    });
    let (a, mesh_a) = run(&scenario, SimTime::from_secs(3));
    let (b, mesh_b) = run(&scenario, SimTime::from_secs(3));

    let generator_a: &TrafficGenerator = mesh_a.generator(&a).unwrap();
    let generator_b: &TrafficGenerator = mesh_b.generator(&b).unwrap();
    assert_eq!(generator_a.reports(), generator_b.reports());
    assert_eq!(generator_a.totals(), generator_b.totals());
    assert_eq!(a.steps_taken(), b.steps_taken());
}

#[test]
fn test_scenario_loads_from_json() {
    let json = r#"{
        "seed": 7,
        "leaves": {
            "prefix": "leaf",
            "size": 2,
            "node": { "available_concurrency": 10, "compute_time": 20 },
            "limiter": { "kind": "static", "limit": 5 }
        },
        "faulty_leaf": { "kind": "always" },
        "fronts": {
            "prefix": "front",
            "size": 2,
            "node": { "available_concurrency": 10, "compute_time": 5, "downstream_retries": 0 },
            "limiter": { "kind": "by_latency", "top_limit": 40,
                         "decrease_trigger": 200, "increase_trigger": 100 },
            "balancing": "round_robin"
        },
        "traffic": { "name": "json-driver", "per_tick": 1, "interval": 2 }
    }"#;
    let scenario: Scenario = serde_json::from_str(json).unwrap();
    assert_eq!(scenario.fronts.node.downstream_retries, 0);
    assert_eq!(scenario.fronts.node.downstream_timeout, Duration::from_secs(1));
    assert_eq!(scenario.fronts.balancing, Balancing::RoundRobin);

    let (sim, mesh) = run(&scenario, SimTime::from_secs(2));
    assert_eq!(mesh.leaves.len(), 3);
    let generator = mesh.generator(&sim).unwrap();
    assert_eq!(generator.name(), "json-driver");
    assert!(generator.totals().ok > 0);
    assert!(generator.totals().downstream_error > 0);
}

#[test]
fn test_invalid_scenario_is_rejected_before_running() {
    let mut scenario = Scenario::small();
    scenario.fronts.node.available_concurrency = 0;
    let mut sim = Simulation::default();
    assert!(scenario.build(&mut sim).is_err());
}
