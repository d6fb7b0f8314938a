//! Simulated time
//!
//! Every timestamp in the mesh is a [`SimTime`]: nanoseconds elapsed since the
//! simulation started. Durations between instants are plain [`std::time::Duration`]s,
//! so compute times, timeouts and backoffs share one unit with the clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point in simulated time with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// The instant the simulation starts at.
    pub const fn zero() -> Self {
        SimTime(0)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        SimTime(micros * 1_000)
    }

    pub const fn from_millis(millis: u64) -> Self {
        SimTime(millis * 1_000_000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        SimTime(secs * 1_000_000_000)
    }

    /// Interpret a duration as an offset from the simulation start.
    ///
    /// Durations beyond `u64::MAX` nanoseconds saturate.
    pub fn from_duration(duration: Duration) -> Self {
        SimTime(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Offset of this instant from the simulation start.
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Whole milliseconds since the simulation start.
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn duration_since(&self, earlier: SimTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> Self::Output {
        self + SimTime::from_duration(rhs)
    }
}

impl Add<SimTime> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Self::Output {
        self.duration_since(rhs)
    }
}

impl Sub<Duration> for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        SimTime(self.0.saturating_sub(SimTime::from_duration(rhs).0))
    }
}

impl From<Duration> for SimTime {
    fn from(duration: Duration) -> Self {
        SimTime::from_duration(duration)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.as_duration();
        let secs = d.as_secs();
        let millis = d.subsec_millis();
        let micros = d.subsec_micros() % 1000;

        if secs > 0 {
            write!(f, "{secs}.{millis:03}s")
        } else if millis > 0 {
            write!(f, "{millis}.{micros:03}ms")
        } else if micros > 0 {
            write!(f, "{micros}µs")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}
