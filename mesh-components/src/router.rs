//! Load-balancing router
//!
//! A [`Router`] forwards each request to one member of its pool and passes the
//! response back to whoever sent the request. It keeps an in-flight count per pool
//! member whatever the balancing strategy, and is the only writer of those counts.

use crate::error::{ConfigError, ConfigResult, MeshError};
use crate::message::{send_request, send_response, Address, MeshEvent};
use crate::request::{Request, Response};
use mesh_core::{component_span, Component, Scheduler};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, trace, warn};

/// How a router picks the pool member for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Balancing {
    /// Fewest requests in flight; the first such member in pool order wins ties.
    #[default]
    LeastBusy,
    /// Cycle through the pool, one step per request.
    RoundRobin,
    /// Pin every sender to the member it was assigned, round robin, when it connected.
    ClusterIp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub forwarded: u64,
    pub returned: u64,
    pub connects: u64,
}

#[derive(Debug, Clone)]
struct PoolMember {
    address: Address,
    in_flight: usize,
}

pub struct Router {
    name: String,
    balancing: Balancing,
    pool: Vec<PoolMember>,
    /// Next pool index for round-robin picks, sticky assignments included.
    next: usize,
    /// Sender to pool index, for `ClusterIp`.
    assignments: HashMap<Address, usize>,
    stats: RouterStats,
}

impl Router {
    pub fn new(
        name: impl Into<String>,
        pool: Vec<Address>,
        balancing: Balancing,
    ) -> ConfigResult<Self> {
        let name = name.into();
        if pool.is_empty() {
            return Err(ConfigError::EmptyPool { router: name });
        }
        Ok(Self {
            name,
            balancing,
            pool: pool
                .into_iter()
                .map(|address| PoolMember {
                    address,
                    in_flight: 0,
                })
                .collect(),
            next: 0,
            assignments: HashMap::new(),
            stats: RouterStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn balancing(&self) -> Balancing {
        self.balancing
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Requests forwarded to `downstream` and not answered yet. `None` if it is not
    /// in the pool.
    pub fn in_flight(&self, downstream: Address) -> Option<usize> {
        self.pool
            .iter()
            .find(|member| member.address == downstream)
            .map(|member| member.in_flight)
    }

    /// Pool member a `ClusterIp` router pinned `sender` to.
    pub fn assignment(&self, sender: Address) -> Option<Address> {
        self.assignments
            .get(&sender)
            .map(|&index| self.pool[index].address)
    }

    fn fatal(&self, err: MeshError) -> ! {
        error!(router = %self.name, error = %err, "Invariant violated");
        panic!("router {}: {err}", self.name);
    }

    fn least_busy(&self) -> usize {
        let mut best = 0;
        for (index, member) in self.pool.iter().enumerate().skip(1) {
            if member.in_flight < self.pool[best].in_flight {
                best = index;
            }
        }
        best
    }

    fn round_robin(&mut self) -> usize {
        let index = self.next;
        self.next = (self.next + 1) % self.pool.len();
        index
    }

    fn connect(&mut self, sender: Address) -> usize {
        if let Some(&index) = self.assignments.get(&sender) {
            return index;
        }
        let index = self.round_robin();
        self.assignments.insert(sender, index);
        self.stats.connects += 1;
        debug!(
            router = %self.name,
            sender = %sender,
            downstream = %self.pool[index].address,
            "Sender pinned"
        );
        index
    }

    fn pick(&mut self, sender: Address) -> usize {
        match self.balancing {
            Balancing::LeastBusy => self.least_busy(),
            Balancing::RoundRobin => self.round_robin(),
            Balancing::ClusterIp => self.connect(sender),
        }
    }

    fn route(&mut self, self_id: Address, request: &Request, from: Address, scheduler: &mut Scheduler) {
        let index = self.pick(from);
        let member = &mut self.pool[index];
        member.in_flight += 1;
        let target = member.address;
        self.stats.forwarded += 1;

        trace!(
            router = %self.name,
            request = %request.id,
            downstream = %target,
            "Forwarding request"
        );
        counter!("mesh_router_forwarded_total", "router" => self.name.clone()).increment(1);
        send_request(scheduler, self_id, target, request.via(self_id));
    }

    fn return_response(
        &mut self,
        self_id: Address,
        response: &Response,
        from: Address,
        scheduler: &mut Scheduler,
    ) {
        let Some(index) = self.pool.iter().position(|member| member.address == from) else {
            self.fatal(MeshError::UnknownResponder {
                router: self.name.clone(),
                sender: from.to_string(),
            });
        };
        if self.pool[index].in_flight == 0 {
            self.fatal(MeshError::InFlightUnderflow {
                router: self.name.clone(),
                downstream: from.to_string(),
            });
        }
        self.pool[index].in_flight -= 1;

        match response.clone().unwind(self_id) {
            Ok((next, response)) => {
                self.stats.returned += 1;
                send_response(scheduler, self_id, next, response);
            }
            Err(err) => self.fatal(err),
        }
    }
}

impl Component for Router {
    type Event = MeshEvent;

    fn process_event(&mut self, self_id: Address, event: &MeshEvent, scheduler: &mut Scheduler) {
        let _span = component_span("router", &self.name).entered();
        match event {
            MeshEvent::Request { request, from } => self.route(self_id, request, *from, scheduler),
            MeshEvent::Response { response, from } => {
                self.return_response(self_id, response, *from, scheduler)
            }
            MeshEvent::Connect { from } => {
                if self.balancing == Balancing::ClusterIp {
                    self.connect(*from);
                }
            }
            MeshEvent::Tick => {}
            MeshEvent::SendDownstream { request } => {
                warn!(router = %self.name, request = %request.id, "Unexpected downstream send");
            }
        }
    }
}
