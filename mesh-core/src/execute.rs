use crate::{SimTime, Simulation};

/// Simulation execution trait.
pub trait Execute {
    /// Executes the simulation until some stopping condition is reached.
    /// The condition is implementation-specific.
    fn execute(self, sim: &mut Simulation);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndCondition {
    Time(SimTime),
    NoEvents,
    Steps(usize),
}

/// Runs a simulation until its end condition holds.
///
/// Mesh components re-arm their periodic ticks forever, so runs involving them should
/// use [`Executor::timed`] or [`Executor::steps`]; [`Executor::unbound`] only
/// terminates once the event queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executor {
    end_condition: EndCondition,
}

impl Executor {
    /// Run until there are no events left.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            end_condition: EndCondition::NoEvents,
        }
    }

    /// Process every event scheduled at or before `time`, then leave the clock at
    /// `time`.
    #[must_use]
    pub fn timed(time: SimTime) -> Self {
        Self {
            end_condition: EndCondition::Time(time),
        }
    }

    /// Process at most this many events.
    #[must_use]
    pub fn steps(steps: usize) -> Self {
        Self {
            end_condition: EndCondition::Steps(steps),
        }
    }
}

impl Execute for Executor {
    fn execute(self, sim: &mut Simulation) {
        match self.end_condition {
            EndCondition::NoEvents => while sim.step() {},
            EndCondition::Time(time) => {
                while sim.peek_next_event_time().is_some_and(|t| t <= time) {
                    sim.step();
                }
                sim.scheduler_mut().advance_to(time);
            }
            EndCondition::Steps(steps) => {
                for _ in 0..steps {
                    if !sim.step() {
                        break;
                    }
                }
            }
        }
    }
}
