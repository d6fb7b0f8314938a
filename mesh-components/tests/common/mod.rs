//! Probe component shared by the integration tests.

#![allow(dead_code)]

use mesh_components::{Address, MeshEvent, Request, RequestId, Response, ResponseStatus};
use mesh_core::{Component, Scheduler, SimTime, Simulation};
use std::time::Duration;
use uuid::Uuid;

/// What a probe does with a request it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Never,
    After(Duration, ResponseStatus),
}

impl Reply {
    pub fn now(status: ResponseStatus) -> Self {
        Reply::After(Duration::ZERO, status)
    }
}

/// Stands in for a client or a downstream service and records everything it sees.
pub struct Probe {
    script: Box<dyn FnMut(&Request) -> Reply>,
    /// Requests received: arrival time, request as received, sender.
    pub requests: Vec<(SimTime, Request, Address)>,
    /// Responses received, after popping the probe off the return path.
    pub responses: Vec<(SimTime, Response)>,
    pub connects: Vec<Address>,
}

impl Probe {
    /// A probe that never answers.
    pub fn silent() -> Self {
        Self::scripted(|_| Reply::Never)
    }

    pub fn answering(reply: Reply) -> Self {
        Self::scripted(move |_| reply)
    }

    pub fn scripted(script: impl FnMut(&Request) -> Reply + 'static) -> Self {
        Self {
            script: Box::new(script),
            requests: Vec::new(),
            responses: Vec::new(),
            connects: Vec::new(),
        }
    }

    pub fn send_times(&self) -> Vec<u64> {
        self.requests.iter().map(|(at, _, _)| at.as_millis()).collect()
    }

    pub fn statuses(&self) -> Vec<ResponseStatus> {
        self.responses.iter().map(|(_, r)| r.status).collect()
    }
}

impl Component for Probe {
    type Event = MeshEvent;

    fn process_event(&mut self, self_id: Address, event: &MeshEvent, scheduler: &mut Scheduler) {
        match event {
            MeshEvent::Request { request, from } => {
                self.requests.push((scheduler.time(), request.clone(), *from));
                if let Reply::After(delay, status) = (self.script)(request) {
                    let (next, response) = Response::new(request.via(self_id), status)
                        .unwind(self_id)
                        .expect("probe is on top of its own path");
                    scheduler.schedule(
                        SimTime::from_duration(delay),
                        next,
                        MeshEvent::Response {
                            response,
                            from: self_id,
                        },
                    );
                }
            }
            MeshEvent::Response { response, .. } => {
                let response = response
                    .clone()
                    .arrive(self_id)
                    .expect("response came back to its origin");
                self.responses.push((scheduler.time(), response));
            }
            MeshEvent::Connect { from } => self.connects.push(*from),
            MeshEvent::Tick | MeshEvent::SendDownstream { .. } => {}
        }
    }
}

pub fn request_id(n: u128) -> RequestId {
    RequestId(Uuid::from_u128(n))
}

/// Sends a fresh request from `client` to `target` at the current instant.
pub fn inject(sim: &mut Simulation, client: Address, target: Address, n: u128) {
    let request = Request::new(request_id(n), sim.time()).via(client);
    sim.schedule(
        SimTime::zero(),
        target,
        MeshEvent::Request {
            request,
            from: client,
        },
    );
}

pub fn probe<'s>(sim: &'s Simulation, address: Address) -> &'s Probe {
    sim.get_component(address).expect("probe registered")
}
