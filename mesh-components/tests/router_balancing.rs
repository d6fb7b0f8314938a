//! Router balancing strategies against probe downstreams

mod common;

use common::{inject, probe, request_id, Probe, Reply};
use mesh_components::{
    Address, Balancing, MeshBuilder, MeshEvent, Request, Response, ResponseStatus, Router,
};
use mesh_core::{Executor, SimTime, Simulation};
use std::time::Duration;

struct Setup {
    sim: Simulation,
    client: Address,
    pool: Vec<Address>,
    router: Address,
}

fn setup(balancing: Balancing, pool: Vec<Probe>) -> Setup {
    let mut sim = Simulation::default();
    let client = sim.add_component(Probe::silent());
    let pool: Vec<Address> = pool.into_iter().map(|p| sim.add_component(p)).collect();
    let router = MeshBuilder::new(&mut sim).router(Router::new("envoy", pool.clone(), balancing).unwrap());
    Setup {
        sim,
        client,
        pool,
        router,
    }
}

fn silent_pool(size: usize) -> Vec<Probe> {
    (0..size).map(|_| Probe::silent()).collect()
}

fn received(sim: &Simulation, pool: &[Address]) -> Vec<usize> {
    pool.iter().map(|&a| probe(sim, a).requests.len()).collect()
}

#[test]
fn test_least_busy_spreads_over_idle_members_first() {
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::LeastBusy, silent_pool(4));

    for n in 0..4 {
        inject(&mut sim, client, router, n);
    }
    sim.execute(Executor::timed(SimTime::from_millis(1)));
    assert_eq!(received(&sim, &pool), vec![1, 1, 1, 1]);

    for n in 4..8 {
        inject(&mut sim, client, router, n);
    }
    sim.execute(Executor::timed(SimTime::from_millis(2)));
    assert_eq!(received(&sim, &pool), vec![2, 2, 2, 2]);

    let router: &Router = sim.get_component(router).unwrap();
    for &member in &pool {
        assert_eq!(router.in_flight(member), Some(2));
    }
    assert_eq!(router.stats().forwarded, 8);
}

#[test]
fn test_least_busy_steers_around_a_slow_member() {
    // The first member holds on to its requests, the others answer at once.
    let mut members = vec![Probe::silent()];
    members.extend((0..2).map(|_| Probe::answering(Reply::now(ResponseStatus::Ok))));
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::LeastBusy, members);

    for n in 0..10 {
        inject(&mut sim, client, router, n);
        sim.execute(Executor::timed(SimTime::from_millis(n as u64 + 1)));
    }

    assert_eq!(received(&sim, &pool), vec![1, 9, 0]);
    assert_eq!(probe(&sim, client).responses.len(), 9);
}

#[test]
fn test_round_robin_cycles_in_pool_order() {
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::RoundRobin, silent_pool(3));

    for n in 0..7 {
        inject(&mut sim, client, router, n);
    }
    sim.execute(Executor::timed(SimTime::from_millis(1)));

    assert_eq!(received(&sim, &pool), vec![3, 2, 2]);
    let first = &probe(&sim, pool[0]).requests;
    let ids: Vec<_> = first.iter().map(|(_, r, _)| r.id).collect();
    assert_eq!(ids, vec![request_id(0), request_id(3), request_id(6)]);
}

#[test]
fn test_cluster_ip_pins_senders_regardless_of_load() {
    let Setup {
        mut sim,
        client: _,
        pool,
        router,
    } = setup(Balancing::ClusterIp, silent_pool(3));
    let clients: Vec<Address> = (0..4).map(|_| sim.add_component(Probe::silent())).collect();

    for &c in &clients {
        sim.schedule(SimTime::zero(), router, MeshEvent::Connect { from: c });
    }
    for n in 0..10 {
        inject(&mut sim, clients[0], router, n);
    }
    inject(&mut sim, clients[1], router, 100);
    sim.execute(Executor::timed(SimTime::from_millis(1)));

    assert_eq!(received(&sim, &pool), vec![10, 1, 0]);

    let r: &Router = sim.get_component(router).unwrap();
    assert_eq!(r.assignment(clients[0]), Some(pool[0]));
    assert_eq!(r.assignment(clients[1]), Some(pool[1]));
    assert_eq!(r.assignment(clients[2]), Some(pool[2]));
    assert_eq!(r.assignment(clients[3]), Some(pool[0]));
    assert_eq!(r.in_flight(pool[0]), Some(10));
}

#[test]
fn test_cluster_ip_treats_first_request_as_connect() {
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::ClusterIp, silent_pool(2));

    for n in 0..3 {
        inject(&mut sim, client, router, n);
    }
    sim.execute(Executor::timed(SimTime::from_millis(1)));

    assert_eq!(received(&sim, &pool), vec![3, 0]);
    let r: &Router = sim.get_component(router).unwrap();
    assert_eq!(r.stats().connects, 1);
}

#[test]
fn test_responses_travel_back_through_the_router() {
    let pool = (0..2)
        .map(|_| Probe::answering(Reply::After(Duration::from_millis(3), ResponseStatus::Error)))
        .collect();
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::LeastBusy, pool);

    inject(&mut sim, client, router, 1);
    sim.execute(Executor::timed(SimTime::from_millis(10)));

    // What the member saw: client, then router.
    let (_, request, from) = &probe(&sim, pool[0]).requests[0];
    assert_eq!(request.return_path.hops(), &[client, router]);
    assert_eq!(*from, router);

    let client_probe = probe(&sim, client);
    assert_eq!(client_probe.statuses(), vec![ResponseStatus::Error]);
    assert_eq!(client_probe.responses[0].0, SimTime::from_millis(3));

    let r: &Router = sim.get_component(router).unwrap();
    assert_eq!(r.in_flight(pool[0]), Some(0));
    assert_eq!(r.stats().returned, 1);
}

#[test]
#[should_panic(expected = "not in its pool")]
fn test_response_from_outside_the_pool_is_fatal() {
    let Setup {
        mut sim,
        client,
        pool: _,
        router,
    } = setup(Balancing::LeastBusy, silent_pool(2));
    let response = Response::new(
        Request::new(request_id(1), SimTime::zero()).via(client).via(router),
        ResponseStatus::Ok,
    );
    sim.schedule(
        SimTime::zero(),
        router,
        MeshEvent::Response {
            response,
            from: client,
        },
    );
    sim.execute(Executor::timed(SimTime::from_millis(1)));
}

#[test]
#[should_panic(expected = "would go negative")]
fn test_unsolicited_response_underflows_the_counter() {
    let Setup {
        mut sim,
        client,
        pool,
        router,
    } = setup(Balancing::LeastBusy, silent_pool(2));
    let response = Response::new(
        Request::new(request_id(1), SimTime::zero()).via(client).via(router),
        ResponseStatus::Ok,
    );
    sim.schedule(
        SimTime::zero(),
        router,
        MeshEvent::Response {
            response,
            from: pool[1],
        },
    );
    sim.execute(Executor::timed(SimTime::from_millis(1)));
}
