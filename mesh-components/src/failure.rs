//! Failure injection
//!
//! A node asks its [`FailurePolicy`] once per finished computation whether the result
//! should be an `Error` instead of `Ok`.

use crate::config::{millis, validate_positive, validate_range};
use crate::error::ConfigResult;
use crate::request::Request;
use mesh_core::SimTime;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub trait FailurePolicy {
    /// Decides whether the computation for `request`, finishing at `now`, fails.
    fn should_fail(&mut self, request: &Request, now: SimTime) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFail;

impl FailurePolicy for NeverFail {
    fn should_fail(&mut self, _request: &Request, _now: SimTime) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFail;

impl FailurePolicy for AlwaysFail {
    fn should_fail(&mut self, _request: &Request, _now: SimTime) -> bool {
        true
    }
}

/// Each computation fails independently with probability `share`.
#[derive(Debug, Clone)]
pub struct RandomPercentage {
    share: f64,
    rng: ChaCha8Rng,
}

impl RandomPercentage {
    pub fn new(share: f64, seed: u64) -> Self {
        Self {
            share,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl FailurePolicy for RandomPercentage {
    fn should_fail(&mut self, _request: &Request, _now: SimTime) -> bool {
        self.rng.gen::<f64>() < self.share
    }
}

/// Fails once every `period`: the first computation finishing at or after the
/// deadline fails and pushes the deadline one period past its own finish time.
#[derive(Debug, Clone)]
pub struct Periodic {
    period: Duration,
    next_fire: SimTime,
}

impl Periodic {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_fire: SimTime::zero() + period,
        }
    }
}

impl FailurePolicy for Periodic {
    fn should_fail(&mut self, _request: &Request, now: SimTime) -> bool {
        if now < self.next_fire {
            return false;
        }
        self.next_fire = now + self.period;
        true
    }
}

/// Serializable description of a [`FailurePolicy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureConfig {
    #[default]
    Never,
    Always,
    Random {
        share: f64,
        #[serde(default)]
        seed: u64,
    },
    Periodic {
        #[serde(with = "millis")]
        period: Duration,
    },
}

impl FailureConfig {
    pub fn build(&self) -> ConfigResult<Box<dyn FailurePolicy>> {
        Ok(match *self {
            FailureConfig::Never => Box::new(NeverFail),
            FailureConfig::Always => Box::new(AlwaysFail),
            FailureConfig::Random { share, seed } => {
                validate_range("share", share, 0.0, 1.0)?;
                Box::new(RandomPercentage::new(share, seed))
            }
            FailureConfig::Periodic { period } => {
                validate_positive("period", period)?;
                Box::new(Periodic::new(period))
            }
        })
    }
}
