//! Admission control
//!
//! A [`Limiter`] sits in front of a node's work. It pairs one [`AdmissionLimit`]
//! strategy, which decides how many requests may be in flight, with a [`Reaction`]
//! that says what happens to a request arriving while the node is at its limit:
//! turned away on the spot, or parked in a FIFO until a slot frees up.
//!
//! The adaptive strategies ([`ErrorRateLimit`], [`LatencyLimit`]) share one
//! additive-increase/multiplicative-decrease loop, [`AimdControl`]. Once per control
//! interval they turn the statistics gathered since the previous evaluation into an
//! [`Adjustment`]:
//!
//! - `Decrease`: the limit becomes `floor(0.9 * limit)`, never below 1.
//! - `Increase`: the limit grows by one, never above the top limit.
//! - `Hold`: nothing changes.
//!
//! # Example
//!
//! ```rust
//! use mesh_components::limiter::{ErrorRateLimit, Limiter, Reaction};
//! use mesh_components::request::{Request, RequestId};
//! use mesh_core::SimTime;
//!
//! let mut limiter = Limiter::new(Reaction::Discard, Box::new(ErrorRateLimit::new(4)));
//! assert_eq!(limiter.limit(), Some(2));
//!
//! let request = || Request::new(RequestId::random(), SimTime::zero());
//! assert!(limiter.offer(request()).is_ok());
//! assert!(limiter.offer(request()).is_ok());
//! assert!(limiter.offer(request()).is_err());
//! ```

use crate::config::{millis, validate_positive};
use crate::error::{ConfigError, ConfigResult, MeshError};
use crate::request::{Request, Response, ResponseStatus};
use mesh_core::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// What a limiter does with a request it cannot admit right away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    /// Queue it until a slot frees up.
    Wait,
    /// Reject it immediately; the node answers `Discarded`.
    #[default]
    Discard,
}

/// A strategy that hands out concurrency slots.
///
/// Every `true` from [`try_acquire`](AdmissionLimit::try_acquire) must be matched by
/// exactly one [`release`](AdmissionLimit::release).
pub trait AdmissionLimit {
    /// Takes a slot if one is free.
    fn try_acquire(&mut self) -> bool;

    /// Gives a slot back and records the outcome of the request that held it.
    fn release(&mut self, outcome: &Response, now: SimTime) -> Result<(), MeshError>;

    /// Runs the periodic control loop, if the strategy has one.
    fn on_tick(&mut self, now: SimTime);

    /// Current concurrency limit; `None` when unbounded.
    fn limit(&self) -> Option<usize>;

    fn in_flight(&self) -> usize;
}

fn take_slot(in_flight: &mut usize) -> Result<(), MeshError> {
    match in_flight.checked_sub(1) {
        Some(remaining) => {
            *in_flight = remaining;
            Ok(())
        }
        None => Err(MeshError::SlotOverRelease { in_flight: 0 }),
    }
}

/// A fixed number of slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLimit {
    limit: usize,
    in_flight: usize,
}

impl StaticLimit {
    pub fn new(limit: usize) -> Self {
        Self { limit, in_flight: 0 }
    }
}

impl AdmissionLimit for StaticLimit {
    fn try_acquire(&mut self) -> bool {
        if self.in_flight < self.limit {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self, _outcome: &Response, _now: SimTime) -> Result<(), MeshError> {
        take_slot(&mut self.in_flight)
    }

    fn on_tick(&mut self, _now: SimTime) {}

    fn limit(&self) -> Option<usize> {
        Some(self.limit)
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Admits everything. Still counts slots so a double release is caught.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unlimited {
    in_flight: usize,
}

impl Unlimited {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdmissionLimit for Unlimited {
    fn try_acquire(&mut self) -> bool {
        self.in_flight += 1;
        true
    }

    fn release(&mut self, _outcome: &Response, _now: SimTime) -> Result<(), MeshError> {
        take_slot(&mut self.in_flight)
    }

    fn on_tick(&mut self, _now: SimTime) {}

    fn limit(&self) -> Option<usize> {
        None
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Direction of one AIMD step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Decrease,
    Hold,
    Increase,
}

/// The shared additive-increase/multiplicative-decrease loop.
///
/// Owns the current limit, the in-flight count and the "reached ceiling" flag, and
/// decides when the next evaluation is due. The strategies built on it only supply
/// the [`Adjustment`] for each interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AimdControl {
    top_limit: usize,
    current_limit: usize,
    in_flight: usize,
    /// Set when an admission attempt came within one slot of the current limit.
    reached_ceiling: bool,
    interval: Duration,
    next_check: SimTime,
}

impl AimdControl {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// Starts at half of `top_limit`, and at least 1.
    pub fn new(top_limit: usize, interval: Duration) -> Self {
        Self {
            top_limit,
            current_limit: (top_limit / 2).max(1),
            in_flight: 0,
            reached_ceiling: false,
            interval,
            next_check: SimTime::zero() + interval,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.in_flight + 1 >= self.current_limit {
            self.reached_ceiling = true;
        }
        if self.in_flight < self.current_limit {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) -> Result<(), MeshError> {
        take_slot(&mut self.in_flight)
    }

    /// Whether an evaluation is due at `now`. Re-arms the timer when it is.
    pub fn due(&mut self, now: SimTime) -> bool {
        if now < self.next_check {
            return false;
        }
        self.next_check = now + self.interval;
        true
    }

    /// Applies one step and clears the ceiling flag for the next interval.
    pub fn apply(&mut self, adjustment: Adjustment) {
        self.reached_ceiling = false;
        let before = self.current_limit;
        match adjustment {
            Adjustment::Hold => return,
            Adjustment::Decrease => {
                self.current_limit = (self.current_limit * 9 / 10).max(1);
            }
            Adjustment::Increase => {
                if self.current_limit < self.top_limit {
                    self.current_limit += 1;
                }
            }
        }
        if before != self.current_limit {
            debug!(
                from = before,
                to = self.current_limit,
                top = self.top_limit,
                in_flight = self.in_flight,
                "Concurrency limit adjusted"
            );
        }
    }

    pub fn reached_ceiling(&self) -> bool {
        self.reached_ceiling
    }

    pub fn current_limit(&self) -> usize {
        self.current_limit
    }

    pub fn top_limit(&self) -> usize {
        self.top_limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// AIMD driven by errors: any non-`Ok` outcome in an interval cuts the limit, a
/// clean interval that reached the ceiling raises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRateLimit {
    control: AimdControl,
    errors: u64,
}

impl ErrorRateLimit {
    pub fn new(top_limit: usize) -> Self {
        Self::with_interval(top_limit, AimdControl::DEFAULT_INTERVAL)
    }

    pub fn with_interval(top_limit: usize, interval: Duration) -> Self {
        Self {
            control: AimdControl::new(top_limit, interval),
            errors: 0,
        }
    }

    pub fn control(&self) -> &AimdControl {
        &self.control
    }

    fn adjustment(&mut self) -> Adjustment {
        let errors = std::mem::take(&mut self.errors);
        if errors > 0 {
            Adjustment::Decrease
        } else if self.control.reached_ceiling() {
            Adjustment::Increase
        } else {
            Adjustment::Hold
        }
    }
}

impl AdmissionLimit for ErrorRateLimit {
    fn try_acquire(&mut self) -> bool {
        self.control.try_acquire()
    }

    fn release(&mut self, outcome: &Response, _now: SimTime) -> Result<(), MeshError> {
        if !outcome.status.is_ok() {
            self.errors += 1;
        }
        self.control.release()
    }

    fn on_tick(&mut self, now: SimTime) {
        if self.control.due(now) {
            let adjustment = self.adjustment();
            self.control.apply(adjustment);
        }
    }

    fn limit(&self) -> Option<usize> {
        Some(self.control.current_limit())
    }

    fn in_flight(&self) -> usize {
        self.control.in_flight()
    }
}

/// AIMD driven by the average end-to-end latency of the interval's outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyLimit {
    control: AimdControl,
    responses: u32,
    latency_sum: Duration,
    /// Average latency above this cuts the limit.
    decrease_trigger: Duration,
    /// Average latency below this, with the ceiling reached, raises the limit.
    increase_trigger: Duration,
}

impl LatencyLimit {
    /// Fails if `increase_trigger` exceeds `decrease_trigger`.
    pub fn new(
        top_limit: usize,
        decrease_trigger: Duration,
        increase_trigger: Duration,
    ) -> ConfigResult<Self> {
        Self::with_interval(
            top_limit,
            decrease_trigger,
            increase_trigger,
            AimdControl::DEFAULT_INTERVAL,
        )
    }

    pub fn with_interval(
        top_limit: usize,
        decrease_trigger: Duration,
        increase_trigger: Duration,
        interval: Duration,
    ) -> ConfigResult<Self> {
        if increase_trigger > decrease_trigger {
            return Err(ConfigError::InvertedLatencyTriggers {
                decrease: decrease_trigger,
                increase: increase_trigger,
            });
        }
        Ok(Self {
            control: AimdControl::new(top_limit, interval),
            responses: 0,
            latency_sum: Duration::ZERO,
            decrease_trigger,
            increase_trigger,
        })
    }

    pub fn control(&self) -> &AimdControl {
        &self.control
    }

    fn adjustment(&mut self) -> Adjustment {
        let responses = std::mem::take(&mut self.responses);
        let sum = std::mem::take(&mut self.latency_sum);
        let average = if responses == 0 {
            Duration::ZERO
        } else {
            sum / responses
        };

        if average > self.decrease_trigger {
            Adjustment::Decrease
        } else if self.control.reached_ceiling() && average < self.increase_trigger {
            Adjustment::Increase
        } else {
            Adjustment::Hold
        }
    }
}

impl AdmissionLimit for LatencyLimit {
    fn try_acquire(&mut self) -> bool {
        self.control.try_acquire()
    }

    fn release(&mut self, outcome: &Response, now: SimTime) -> Result<(), MeshError> {
        self.responses = self.responses.saturating_add(1);
        self.latency_sum += outcome.latency(now);
        self.control.release()
    }

    fn on_tick(&mut self, now: SimTime) {
        if self.control.due(now) {
            let adjustment = self.adjustment();
            self.control.apply(adjustment);
        }
    }

    fn limit(&self) -> Option<usize> {
        Some(self.control.current_limit())
    }

    fn in_flight(&self) -> usize {
        self.control.in_flight()
    }
}

/// One strategy plus the reaction to a full house.
pub struct Limiter {
    reaction: Reaction,
    strategy: Box<dyn AdmissionLimit>,
    /// Requests accepted by [`offer`](Limiter::offer) and not yet handed out by
    /// [`poll`](Limiter::poll). In discard mode every entry already holds a slot.
    queue: VecDeque<Request>,
}

impl Limiter {
    pub fn new(reaction: Reaction, strategy: Box<dyn AdmissionLimit>) -> Self {
        Self {
            reaction,
            strategy,
            queue: VecDeque::new(),
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(Reaction::Discard, Box::new(Unlimited::new()))
    }

    /// Accepts `request` for later [`poll`](Limiter::poll)ing, or hands it back if it
    /// has to be discarded.
    ///
    /// In `Wait` mode every request is accepted.
    pub fn offer(&mut self, request: Request) -> Result<(), Request> {
        match self.reaction {
            Reaction::Discard => {
                if !self.strategy.try_acquire() {
                    trace!(request = %request.id, in_flight = self.in_flight(), "Rejected by limiter");
                    return Err(request);
                }
                self.queue.push_back(request);
            }
            Reaction::Wait => self.queue.push_back(request),
        }
        Ok(())
    }

    /// Next request that holds a slot and may start.
    pub fn poll(&mut self) -> Option<Request> {
        match self.reaction {
            Reaction::Discard => self.queue.pop_front(),
            Reaction::Wait => {
                if self.queue.is_empty() || !self.strategy.try_acquire() {
                    return None;
                }
                self.queue.pop_front()
            }
        }
    }

    /// Releases the slot held by the request `response` answers.
    ///
    /// `Discarded` responses never held a slot and are ignored, so they leave both
    /// the in-flight count and the control statistics alone.
    pub fn on_outcome(&mut self, response: &Response, now: SimTime) -> Result<(), MeshError> {
        if response.status == ResponseStatus::Discarded {
            return Ok(());
        }
        self.strategy.release(response, now).map_err(|_| MeshError::SlotOverRelease {
            in_flight: self.strategy.in_flight(),
        })
    }

    pub fn on_tick(&mut self, now: SimTime) {
        self.strategy.on_tick(now);
    }

    pub fn reaction(&self) -> Reaction {
        self.reaction
    }

    pub fn limit(&self) -> Option<usize> {
        self.strategy.limit()
    }

    pub fn in_flight(&self) -> usize {
        self.strategy.in_flight()
    }

    /// Requests waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("reaction", &self.reaction)
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queue.len())
            .finish()
    }
}

fn default_interval() -> Duration {
    AimdControl::DEFAULT_INTERVAL
}

/// Serializable description of a [`Limiter`].
///
/// ```rust
/// use mesh_components::limiter::LimiterConfig;
///
/// let config: LimiterConfig =
///     serde_json::from_str(r#"{"kind": "by_errors", "top_limit": 200}"#).unwrap();
/// let limiter = config.build().unwrap();
/// assert_eq!(limiter.limit(), Some(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterConfig {
    Static {
        limit: usize,
        #[serde(default)]
        reaction: Reaction,
    },
    Unlimited {
        #[serde(default)]
        reaction: Reaction,
    },
    ByErrors {
        top_limit: usize,
        #[serde(default)]
        reaction: Reaction,
        #[serde(default = "default_interval", with = "millis")]
        interval: Duration,
    },
    ByLatency {
        top_limit: usize,
        #[serde(with = "millis")]
        decrease_trigger: Duration,
        #[serde(with = "millis")]
        increase_trigger: Duration,
        #[serde(default)]
        reaction: Reaction,
        #[serde(default = "default_interval", with = "millis")]
        interval: Duration,
    },
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig::Unlimited {
            reaction: Reaction::Discard,
        }
    }
}

impl LimiterConfig {
    pub fn by_errors(top_limit: usize) -> Self {
        LimiterConfig::ByErrors {
            top_limit,
            reaction: Reaction::Discard,
            interval: AimdControl::DEFAULT_INTERVAL,
        }
    }

    pub fn build(&self) -> ConfigResult<Limiter> {
        match *self {
            LimiterConfig::Static { limit, reaction } => {
                validate_positive("limit", limit)?;
                Ok(Limiter::new(reaction, Box::new(StaticLimit::new(limit))))
            }
            LimiterConfig::Unlimited { reaction } => match reaction {
                Reaction::Discard => Ok(Limiter::unlimited()),
                Reaction::Wait => Err(ConfigError::WaitOnUnlimited),
            },
            LimiterConfig::ByErrors {
                top_limit,
                reaction,
                interval,
            } => {
                validate_positive("top_limit", top_limit)?;
                validate_positive("interval", interval)?;
                Ok(Limiter::new(
                    reaction,
                    Box::new(ErrorRateLimit::with_interval(top_limit, interval)),
                ))
            }
            LimiterConfig::ByLatency {
                top_limit,
                decrease_trigger,
                increase_trigger,
                reaction,
                interval,
            } => {
                validate_positive("top_limit", top_limit)?;
                validate_positive("interval", interval)?;
                let strategy = LatencyLimit::with_interval(
                    top_limit,
                    decrease_trigger,
                    increase_trigger,
                    interval,
                )?;
                Ok(Limiter::new(reaction, Box::new(strategy)))
            }
        }
    }
}
