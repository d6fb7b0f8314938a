//! Simulated service
//!
//! A [`Node`] admits requests through its [`Limiter`] and then either computes locally
//! or, when it has a downstream, calls the downstream first and computes once the call
//! succeeds. Everything happens on events:
//!
//! - `Request`: push self onto the return path, offer to the limiter, answer
//!   `Discarded` straight away if rejected.
//! - `SendDownstream`: one send of one attempt, scheduled by the node itself.
//! - `Response`: the downstream answered; start computing, retry, or give up.
//! - `Tick`: advance every computation, time out overdue downstream calls, start
//!   whatever the limiter lets through.
//!
//! # CPU contention
//!
//! Up to `available_concurrency` computations run at full speed. Beyond that the
//! elapsed time between ticks is shared fairly: each of `n` computations progresses by
//! `elapsed * available_concurrency / n`. Requests waiting on the downstream do not
//! count against the available concurrency.
//!
//! # Downstream retries
//!
//! Each call starts at attempt 0 with a deadline of `now + downstream_timeout`. When a
//! deadline passes or the downstream answers with anything but `Ok`, the node either
//! gives up with `DownstreamError` (attempt budget spent) or resends after
//! `min(max_backoff, min_backoff * 2^attempt)`. The retried call's deadline is
//! `now + backoff + downstream_timeout`, so the backoff never eats into the timeout.
//!
//! Only the outstanding attempt counts: a response or a scheduled resend for an older
//! attempt is dropped.

use crate::config::{millis, validate_non_empty, validate_ordered, validate_positive};
use crate::error::{ConfigResult, MeshError};
use crate::failure::{FailurePolicy, NeverFail};
use crate::limiter::Limiter;
use crate::message::{send_request, send_response, Address, MeshEvent};
use crate::request::{Request, RequestId, Response, ResponseStatus};
use mesh_core::{component_span, Component, Scheduler, SimTime};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Static settings of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Computations that can run at full speed at the same time.
    pub available_concurrency: usize,
    /// Local work per request.
    #[serde(with = "millis")]
    pub compute_time: Duration,
    #[serde(with = "millis")]
    pub downstream_timeout: Duration,
    /// Resends after the first attempt before giving up.
    pub downstream_retries: u32,
    #[serde(with = "millis")]
    pub min_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            available_concurrency: 1,
            compute_time: Duration::from_millis(100),
            downstream_timeout: Duration::from_secs(1),
            downstream_retries: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            tick_interval: Duration::from_millis(1),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_available_concurrency(mut self, available_concurrency: usize) -> Self {
        self.available_concurrency = available_concurrency;
        self
    }

    pub fn with_compute_time(mut self, compute_time: Duration) -> Self {
        self.compute_time = compute_time;
        self
    }

    pub fn with_downstream_timeout(mut self, timeout: Duration) -> Self {
        self.downstream_timeout = timeout;
        self
    }

    pub fn with_downstream_retries(mut self, retries: u32) -> Self {
        self.downstream_retries = retries;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        validate_non_empty("name", &self.name)?;
        validate_positive("available_concurrency", self.available_concurrency)?;
        validate_positive("downstream_timeout", self.downstream_timeout)?;
        validate_positive("tick_interval", self.tick_interval)?;
        validate_ordered("min_backoff", self.min_backoff, "max_backoff", self.max_backoff)
    }

    /// Delay before resending after `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.min_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |backoff| backoff.min(self.max_backoff))
    }
}

/// Lifetime counters of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub received: u64,
    pub discarded: u64,
    pub completed_ok: u64,
    pub completed_error: u64,
    /// Downstream sends, first attempts included.
    pub downstream_sends: u64,
    pub downstream_retries: u64,
    pub downstream_errors: u64,
    /// Downstream responses for an attempt that was no longer outstanding.
    pub stale_responses: u64,
}

#[derive(Debug, Clone)]
struct Computation {
    request: Request,
    remaining: Duration,
}

#[derive(Debug, Clone)]
struct DownstreamCall {
    /// The request as this node received it; what it answers with eventually.
    request: Request,
    attempt: u32,
    deadline: SimTime,
}

pub struct Node {
    config: NodeConfig,
    limiter: Limiter,
    failure: Box<dyn FailurePolicy>,
    downstream: Option<Address>,
    computing: Vec<Computation>,
    awaiting: BTreeMap<RequestId, DownstreamCall>,
    last_tick: Option<SimTime>,
    stats: NodeStats,
}

impl Node {
    /// Create a node. Without a `downstream` it is a leaf and only computes.
    pub fn new(
        config: NodeConfig,
        limiter: Limiter,
        failure: Box<dyn FailurePolicy>,
        downstream: Option<Address>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            limiter,
            failure,
            downstream,
            computing: Vec::new(),
            awaiting: BTreeMap::new(),
            last_tick: None,
            stats: NodeStats::default(),
        })
    }

    /// A leaf node with an unlimited limiter that never fails.
    pub fn leaf(config: NodeConfig) -> ConfigResult<Self> {
        Self::new(config, Limiter::unlimited(), Box::new(NeverFail), None)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn downstream(&self) -> Option<Address> {
        self.downstream
    }

    /// Admitted requests without a terminal response yet.
    pub fn in_flight(&self) -> usize {
        self.computing.len() + self.awaiting.len()
    }

    pub fn computing(&self) -> usize {
        self.computing.len()
    }

    pub fn awaiting_downstream(&self) -> usize {
        self.awaiting.len()
    }

    fn fatal(&self, err: MeshError) -> ! {
        error!(node = %self.config.name, error = %err, "Invariant violated");
        panic!("node {}: {err}", self.config.name);
    }

    fn handle_request(&mut self, self_id: Address, request: &Request, scheduler: &mut Scheduler) {
        self.stats.received += 1;
        let request = request.via(self_id);
        trace!(node = %self.config.name, request = %request.id, "Request received");

        match self.limiter.offer(request) {
            Ok(()) => self.start_admitted(self_id, scheduler),
            Err(rejected) => {
                self.stats.discarded += 1;
                self.respond(self_id, rejected, ResponseStatus::Discarded, scheduler);
            }
        }
    }

    fn start_admitted(&mut self, self_id: Address, scheduler: &mut Scheduler) {
        while let Some(request) = self.limiter.poll() {
            self.dispatch(self_id, request, scheduler);
        }
    }

    fn dispatch(&mut self, self_id: Address, request: Request, scheduler: &mut Scheduler) {
        if self.downstream.is_none() {
            self.start_computation(request);
            return;
        }

        let outgoing = request.descend(0);
        self.awaiting.insert(
            request.id,
            DownstreamCall {
                request,
                attempt: 0,
                deadline: scheduler.time() + self.config.downstream_timeout,
            },
        );
        scheduler.schedule_now(self_id, MeshEvent::SendDownstream { request: outgoing });
    }

    fn start_computation(&mut self, request: Request) {
        self.computing.push(Computation {
            request,
            remaining: self.config.compute_time,
        });
    }

    fn send_downstream(&mut self, self_id: Address, request: &Request, scheduler: &mut Scheduler) {
        let Some(downstream) = self.downstream else {
            return;
        };
        let outstanding = self.awaiting.get(&request.id).map(|call| call.attempt);
        if outstanding != Some(request.attempt) {
            trace!(
                node = %self.config.name,
                request = %request.id,
                attempt = request.attempt,
                "Dropping superseded resend"
            );
            return;
        }
        self.stats.downstream_sends += 1;
        send_request(scheduler, self_id, downstream, request.clone());
    }

    fn handle_downstream_response(
        &mut self,
        self_id: Address,
        response: &Response,
        scheduler: &mut Scheduler,
    ) {
        if let Err(err) = response.check_top(self_id) {
            self.fatal(err);
        }

        let id = response.request.id;
        let outstanding = self.awaiting.get(&id).map(|call| call.attempt);
        if outstanding != Some(response.request.attempt) {
            self.stats.stale_responses += 1;
            debug!(
                node = %self.config.name,
                request = %id,
                attempt = response.request.attempt,
                outstanding = ?outstanding,
                "Ignoring stale downstream response"
            );
            return;
        }

        if response.status.is_ok() {
            if let Some(call) = self.awaiting.remove(&id) {
                self.start_computation(call.request);
            }
        } else {
            self.retry_or_give_up(self_id, id, scheduler);
        }
    }

    fn retry_or_give_up(&mut self, self_id: Address, id: RequestId, scheduler: &mut Scheduler) {
        let now = scheduler.time();
        let retries = self.config.downstream_retries;
        let Some(call) = self.awaiting.get(&id) else {
            return;
        };

        if call.attempt >= retries {
            let Some(call) = self.awaiting.remove(&id) else {
                return;
            };
            self.stats.downstream_errors += 1;
            debug!(
                node = %self.config.name,
                request = %id,
                attempts = call.attempt + 1,
                "Downstream retries exhausted"
            );
            self.respond(self_id, call.request, ResponseStatus::DownstreamError, scheduler);
            return;
        }

        let backoff = self.config.backoff(call.attempt);
        let timeout = self.config.downstream_timeout;
        let Some(call) = self.awaiting.get_mut(&id) else {
            return;
        };
        call.attempt += 1;
        call.deadline = now + backoff + timeout;
        let outgoing = call.request.descend(call.attempt);

        self.stats.downstream_retries += 1;
        counter!("mesh_node_downstream_retries_total", "node" => self.config.name.clone())
            .increment(1);
        debug!(
            node = %self.config.name,
            request = %id,
            attempt = outgoing.attempt,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "Retrying downstream call"
        );
        scheduler.schedule(
            SimTime::from_duration(backoff),
            self_id,
            MeshEvent::SendDownstream { request: outgoing },
        );
    }

    fn on_tick(&mut self, self_id: Address, scheduler: &mut Scheduler) {
        let now = scheduler.time();
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_tick = Some(now);

        self.limiter.on_tick(now);
        if let Some(limit) = self.limiter.limit() {
            gauge!("mesh_node_concurrency_limit", "node" => self.config.name.clone())
                .set(limit as f64);
        }

        self.advance_computations(self_id, elapsed, scheduler);

        let expired: Vec<RequestId> = self
            .awaiting
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            trace!(node = %self.config.name, request = %id, "Downstream call timed out");
            self.retry_or_give_up(self_id, id, scheduler);
        }

        self.start_admitted(self_id, scheduler);
    }

    fn advance_computations(&mut self, self_id: Address, elapsed: Duration, scheduler: &mut Scheduler) {
        let running = self.computing.len();
        if running == 0 {
            return;
        }

        let available = self.config.available_concurrency;
        let progress = if running > available {
            let nanos = elapsed.as_nanos() * available as u128 / running as u128;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        } else {
            elapsed
        };

        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.computing)
            .into_iter()
            .map(|mut computation| {
                computation.remaining = computation.remaining.saturating_sub(progress);
                computation
            })
            .partition(|computation| computation.remaining.is_zero());
        self.computing = running;

        let now = scheduler.time();
        for Computation { request, .. } in finished {
            let status = if self.failure.should_fail(&request, now) {
                self.stats.completed_error += 1;
                ResponseStatus::Error
            } else {
                self.stats.completed_ok += 1;
                ResponseStatus::Ok
            };
            self.respond(self_id, request, status, scheduler);
        }
    }

    /// Sends the terminal response for `request` back along its path and, unless it
    /// was discarded, frees its limiter slot.
    fn respond(
        &mut self,
        self_id: Address,
        request: Request,
        status: ResponseStatus,
        scheduler: &mut Scheduler,
    ) {
        let now = scheduler.time();
        let response = Response::new(request, status);
        if let Err(err) = self.limiter.on_outcome(&response, now) {
            self.fatal(err);
        }
        counter!(
            "mesh_node_responses_total",
            "node" => self.config.name.clone(),
            "status" => status.as_str()
        )
        .increment(1);

        match response.unwind(self_id) {
            Ok((next, response)) => {
                trace!(
                    node = %self.config.name,
                    request = %response.request.id,
                    status = %status,
                    to = %next,
                    "Responding"
                );
                send_response(scheduler, self_id, next, response);
            }
            Err(err) => self.fatal(err),
        }
    }
}

impl Component for Node {
    type Event = MeshEvent;

    fn process_event(&mut self, self_id: Address, event: &MeshEvent, scheduler: &mut Scheduler) {
        let _span = component_span("node", &self.config.name).entered();
        match event {
            MeshEvent::Request { request, .. } => self.handle_request(self_id, request, scheduler),
            MeshEvent::Response { response, .. } => {
                self.handle_downstream_response(self_id, response, scheduler)
            }
            MeshEvent::SendDownstream { request } => {
                self.send_downstream(self_id, request, scheduler)
            }
            MeshEvent::Tick => {
                self.on_tick(self_id, scheduler);
                scheduler.schedule(
                    SimTime::from_duration(self.config.tick_interval),
                    self_id,
                    MeshEvent::Tick,
                );
            }
            MeshEvent::Connect { from } => {
                trace!(node = %self.config.name, from = %from, "Ignoring connect");
            }
        }
    }
}
