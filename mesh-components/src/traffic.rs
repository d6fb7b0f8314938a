//! Traffic generator
//!
//! A [`TrafficGenerator`] drives a mesh from the outside: every `interval` it sends
//! `per_tick` new requests, spread round robin over its targets, and it is the first
//! hop of every request it creates. It tallies the responses and, once per
//! `report_interval`, closes an [`IntervalReport`] and logs it.

use crate::config::{millis, validate_non_empty, validate_positive};
use crate::error::{ConfigError, ConfigResult};
use crate::message::{send_request, Address, MeshEvent};
use crate::request::{Request, RequestId, Response, ResponseStatus};
use mesh_core::{component_span, Component, Scheduler, SimTime};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub name: String,
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Requests sent on every tick.
    pub per_tick: usize,
    /// Closed loop: no new request while this many are unanswered.
    pub max_outstanding: Option<usize>,
    /// Stop sending after this many requests. Ticks and reports carry on.
    pub max_requests: Option<u64>,
    /// Send `Connect` to every target before the first request.
    pub connect_on_start: bool,
    #[serde(with = "millis")]
    pub report_interval: Duration,
    /// Seed for request ids.
    pub seed: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            name: "driver".to_string(),
            interval: Duration::from_millis(1),
            per_tick: 1,
            max_outstanding: None,
            max_requests: None,
            connect_on_start: false,
            report_interval: Duration::from_secs(1),
            seed: 0,
        }
    }
}

impl TrafficConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_rate(mut self, per_tick: usize, interval: Duration) -> Self {
        self.per_tick = per_tick;
        self.interval = interval;
        self
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = Some(max_outstanding);
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn with_connect_on_start(mut self, connect: bool) -> Self {
        self.connect_on_start = connect;
        self
    }

    pub fn with_report_interval(mut self, report_interval: Duration) -> Self {
        self.report_interval = report_interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        validate_non_empty("name", &self.name)?;
        validate_positive("interval", self.interval)?;
        validate_positive("report_interval", self.report_interval)
    }
}

/// Traffic seen during one report interval. Latencies are averages in whole
/// milliseconds, 0 when there was nothing to average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalReport {
    /// When the interval was closed.
    pub at: SimTime,
    pub sent: u64,
    pub succeeded: u64,
    pub success_latency_ms: u64,
    pub failed: u64,
    pub failure_latency_ms: u64,
}

impl fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sent {}; succeeded {} (latency {}); failed {} (latency {}).",
            self.sent,
            self.succeeded,
            self.success_latency_ms,
            self.failed,
            self.failure_latency_ms
        )
    }
}

/// Lifetime counters, by terminal status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficTotals {
    pub sent: u64,
    pub ok: u64,
    pub discarded: u64,
    pub error: u64,
    pub downstream_error: u64,
}

impl TrafficTotals {
    /// Terminal responses received so far.
    pub fn answered(&self) -> u64 {
        self.ok + self.discarded + self.error + self.downstream_error
    }

    fn record(&mut self, status: ResponseStatus) {
        match status {
            ResponseStatus::Ok => self.ok += 1,
            ResponseStatus::Discarded => self.discarded += 1,
            ResponseStatus::Error => self.error += 1,
            ResponseStatus::DownstreamError => self.downstream_error += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    sent: u64,
    succeeded: u64,
    success_latency: Duration,
    failed: u64,
    failure_latency: Duration,
}

fn average_ms(total: Duration, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    u64::try_from(total.as_millis() / u128::from(count)).unwrap_or(u64::MAX)
}

impl Accumulator {
    fn close(self, at: SimTime) -> IntervalReport {
        IntervalReport {
            at,
            sent: self.sent,
            succeeded: self.succeeded,
            success_latency_ms: average_ms(self.success_latency, self.succeeded),
            failed: self.failed,
            failure_latency_ms: average_ms(self.failure_latency, self.failed),
        }
    }
}

pub struct TrafficGenerator {
    config: TrafficConfig,
    targets: Vec<Address>,
    next_target: usize,
    rng: ChaCha8Rng,
    started: bool,
    outstanding: usize,
    next_report: SimTime,
    current: Accumulator,
    totals: TrafficTotals,
    reports: Vec<IntervalReport>,
}

impl TrafficGenerator {
    pub fn new(config: TrafficConfig, targets: Vec<Address>) -> ConfigResult<Self> {
        config.validate()?;
        if targets.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "targets".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            targets,
            next_target: 0,
            rng,
            started: false,
            outstanding: 0,
            next_report: SimTime::zero(),
            current: Accumulator::default(),
            totals: TrafficTotals::default(),
            reports: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn totals(&self) -> &TrafficTotals {
        &self.totals
    }

    /// Closed report intervals, oldest first.
    pub fn reports(&self) -> &[IntervalReport] {
        &self.reports
    }

    /// Requests sent and not answered yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn may_send(&self) -> bool {
        let below_cap = self
            .config
            .max_outstanding
            .map_or(true, |max| self.outstanding < max);
        let budget_left = self
            .config
            .max_requests
            .map_or(true, |max| self.totals.sent < max);
        below_cap && budget_left
    }

    fn start(&mut self, self_id: Address, scheduler: &mut Scheduler) {
        self.started = true;
        self.next_report = scheduler.time() + self.config.report_interval;
        if self.config.connect_on_start {
            for &target in &self.targets {
                scheduler.schedule_now(target, MeshEvent::Connect { from: self_id });
            }
        }
    }

    fn send_batch(&mut self, self_id: Address, scheduler: &mut Scheduler) {
        for _ in 0..self.config.per_tick {
            if !self.may_send() {
                break;
            }
            let request =
                Request::new(RequestId::from_rng(&mut self.rng), scheduler.time()).via(self_id);
            let target = self.targets[self.next_target];
            self.next_target = (self.next_target + 1) % self.targets.len();

            trace!(generator = %self.config.name, request = %request.id, to = %target, "Sending");
            send_request(scheduler, self_id, target, request);
            self.outstanding += 1;
            self.current.sent += 1;
            self.totals.sent += 1;
        }
    }

    fn maybe_report(&mut self, now: SimTime) {
        if now < self.next_report {
            return;
        }
        self.next_report = self.next_report + self.config.report_interval;
        let report = std::mem::take(&mut self.current).close(now);
        info!(generator = %self.config.name, "{report}");
        self.reports.push(report);
    }

    fn receive(&mut self, self_id: Address, response: &Response, now: SimTime) {
        let response = match response.clone().arrive(self_id) {
            Ok(response) => response,
            Err(err) => {
                error!(generator = %self.config.name, error = %err, "Invariant violated");
                panic!("generator {}: {err}", self.config.name);
            }
        };

        self.outstanding = self.outstanding.saturating_sub(1);
        self.totals.record(response.status);
        let latency = response.latency(now);
        if response.status.is_ok() {
            self.current.succeeded += 1;
            self.current.success_latency += latency;
        } else {
            self.current.failed += 1;
            self.current.failure_latency += latency;
        }
    }
}

impl Component for TrafficGenerator {
    type Event = MeshEvent;

    fn process_event(&mut self, self_id: Address, event: &MeshEvent, scheduler: &mut Scheduler) {
        let _span = component_span("generator", &self.config.name).entered();
        match event {
            MeshEvent::Tick => {
                if !self.started {
                    self.start(self_id, scheduler);
                }
                self.send_batch(self_id, scheduler);
                self.maybe_report(scheduler.time());
                scheduler.schedule(
                    SimTime::from_duration(self.config.interval),
                    self_id,
                    MeshEvent::Tick,
                );
            }
            MeshEvent::Response { response, .. } => {
                self.receive(self_id, response, scheduler.time())
            }
            other => trace!(generator = %self.config.name, kind = other.kind(), "Ignoring event"),
        }
    }
}
