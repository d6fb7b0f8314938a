//! Discrete-event simulation kernel for the service-mesh simulator.
//!
//! The kernel knows nothing about requests or limiters. It provides:
//!
//! - [`SimTime`]: simulated time with nanosecond precision.
//! - [`Scheduler`]: the clock plus a queue of pending events, delivered in
//!   `(time, scheduling order)` order.
//! - [`Component`]: a single-threaded reactive process that handles one event at a
//!   time, to completion, and talks to others only by scheduling events.
//! - [`Simulation`]: owns the scheduler and every registered component.
//!
//! # Basic Usage
//!
//! ```rust
//! use mesh_core::{Component, Executor, Key, Scheduler, SimTime, Simulation};
//!
//! struct Counter {
//!     fired: u32,
//! }
//!
//! impl Component for Counter {
//!     type Event = ();
//!
//!     fn process_event(&mut self, self_id: Key<()>, _event: &(), scheduler: &mut Scheduler) {
//!         self.fired += 1;
//!         scheduler.schedule(SimTime::from_millis(10), self_id, ());
//!     }
//! }
//!
//! let mut sim = Simulation::default();
//! let key = sim.add_component(Counter { fired: 0 });
//! sim.schedule(SimTime::zero(), key, ());
//! sim.execute(Executor::timed(SimTime::from_millis(95)));
//!
//! let counter: Counter = sim.remove_component(key).unwrap();
//! assert_eq!(counter.fired, 10);
//! ```

pub mod error;
pub mod execute;
pub mod ids;
pub mod logging;
pub mod scheduler;
pub mod time;
pub mod types;

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

pub use error::SimError;
pub use execute::{Execute, Executor};
pub use logging::{
    component_span, init_detailed_simulation_logging, init_simulation_logging,
    init_simulation_logging_with_level, simulation_span,
};
pub use scheduler::{EventEntry, Scheduler};
pub use time::SimTime;
pub use types::EventId;

/// Typed address of a registered component.
///
/// The type parameter is the component's event type, so a key can only be used to
/// schedule events the component understands.
pub struct Key<T> {
    id: Uuid,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub fn new_with_id(id: Uuid) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the UUID of this key
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.id)
    }
}

impl<T> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The low 32 bits are enough to tell components apart in logs.
        write!(f, "{:08x}", self.id.as_u128() as u32)
    }
}

/// Object-safe bridge between the type-erased registry and typed components.
pub trait ProcessEventEntry: Any {
    fn process_event_entry(&mut self, entry: EventEntry, scheduler: &mut Scheduler);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A simulated process.
///
/// `process_event` runs to completion for every delivered event; a component never
/// blocks and never runs concurrently with itself. Anything that has to happen later
/// is expressed by scheduling another event.
pub trait Component: ProcessEventEntry {
    type Event: 'static;

    fn process_event(
        &mut self,
        self_id: Key<Self::Event>,
        event: &Self::Event,
        scheduler: &mut Scheduler,
    );
}

impl<E, C> ProcessEventEntry for C
where
    E: 'static,
    C: Component<Event = E> + 'static,
{
    fn process_event_entry(&mut self, entry: EventEntry, scheduler: &mut Scheduler) {
        let typed_entry = entry
            .downcast::<E>()
            .expect("event scheduled with a key of a different component type");
        self.process_event(typed_entry.component_key, typed_entry.event, scheduler);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Container holding type-erased components.
#[derive(Default)]
pub struct Components {
    components: HashMap<Uuid, Box<dyn ProcessEventEntry>>,
}

impl Components {
    /// Delivers the event to its target. Events addressed to a component that has
    /// been removed are dropped.
    pub fn process_event_entry(&mut self, entry: EventEntry, scheduler: &mut Scheduler) {
        match self.components.get_mut(&entry.component) {
            Some(component) => component.process_event_entry(entry, scheduler),
            None => warn!(
                component_id = %entry.component,
                event_time = %entry.time(),
                "Dropping event for unknown component"
            ),
        }
    }

    fn insert<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        id: Uuid,
        component: C,
    ) -> Key<E> {
        self.components.insert(id, Box::new(component));
        Key::new_with_id(id)
    }

    pub fn remove<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        key: Key<E>,
    ) -> Option<C> {
        self.components.remove(&key.id).and_then(|boxed| {
            let boxed_any: Box<dyn Any> = boxed;
            boxed_any.downcast::<C>().ok().map(|c| *c)
        })
    }

    pub fn get<E: 'static, C: Component<Event = E> + 'static>(&self, key: Key<E>) -> Option<&C> {
        self.components
            .get(&key.id)
            .and_then(|boxed| boxed.as_any().downcast_ref::<C>())
    }

    pub fn get_mut<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        key: Key<E>,
    ) -> Option<&mut C> {
        self.components
            .get_mut(&key.id)
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<C>())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.components.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Settings that make a run reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed for component addresses.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

/// Puts the scheduler and the components together.
///
/// See the [crate-level documentation](index.html) for an example.
pub struct Simulation {
    scheduler: Scheduler,
    pub components: Components,
    config: SimulationConfig,
    next_component: u64,
    steps: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            scheduler: Scheduler::default(),
            components: Components::default(),
            config,
            next_component: 0,
            steps: 0,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Returns the current simulation time.
    #[must_use]
    pub fn time(&self) -> SimTime {
        self.scheduler.time()
    }

    /// Number of events processed so far.
    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Processes the next event. Returns `false` once the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(entry) = self.scheduler.pop() else {
            return false;
        };
        trace!(event_id = %entry.id(), event_time = %entry.time(), "Processing simulation step");
        self.components.process_event_entry(entry, &mut self.scheduler);
        self.steps += 1;
        true
    }

    /// Runs the simulation. The stopping condition depends on the executor.
    #[instrument(skip(self, executor), fields(initial_time = %self.time()))]
    pub fn execute<E: Execute>(&mut self, executor: E) {
        info!("Starting simulation execution");
        executor.execute(self);
        info!(
            final_time = %self.time(),
            steps = self.steps,
            "Simulation execution completed"
        );
    }

    /// Registers a component and returns its address.
    #[must_use]
    pub fn add_component<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        component: C,
    ) -> Key<E> {
        self.next_component += 1;
        let id = ids::deterministic_uuid(
            self.config.seed,
            ids::UUID_DOMAIN_COMPONENT,
            self.next_component,
        );
        let key = self.components.insert(id, component);
        debug!(
            component_id = %key,
            component_type = std::any::type_name::<C>(),
            "Added component to simulation"
        );
        key
    }

    /// Removes a component, usually at the end of a run to inspect its final state.
    #[must_use]
    pub fn remove_component<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        key: Key<E>,
    ) -> Option<C> {
        let removed = self.components.remove(key);
        if removed.is_none() {
            warn!(component_id = %key, "Attempted to remove non-existent component");
        }
        removed
    }

    pub fn get_component<E: 'static, C: Component<Event = E> + 'static>(
        &self,
        key: Key<E>,
    ) -> Option<&C> {
        self.components.get(key)
    }

    pub fn get_component_mut<E: 'static, C: Component<Event = E> + 'static>(
        &mut self,
        key: Key<E>,
    ) -> Option<&mut C> {
        self.components.get_mut(key)
    }

    /// Like [`Simulation::get_component`], but says why the lookup failed.
    pub fn component<E: 'static, C: Component<Event = E> + 'static>(
        &self,
        key: Key<E>,
    ) -> Result<&C, SimError> {
        if !self.components.contains(key.id()) {
            return Err(SimError::ComponentNotFound {
                id: key.to_string(),
            });
        }
        self.components
            .get(key)
            .ok_or(SimError::ComponentTypeMismatch {
                id: key.to_string(),
                expected: std::any::type_name::<C>(),
            })
    }

    /// Schedules `event` for `component` at `self.time() + delay`.
    pub fn schedule<E: 'static>(&mut self, delay: SimTime, component: Key<E>, event: E) {
        self.scheduler.schedule(delay, component, event);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Returns the time of the next scheduled event, or None if no events are scheduled.
    pub fn peek_next_event_time(&self) -> Option<SimTime> {
        self.scheduler.peek().map(EventEntry::time)
    }

    pub fn has_pending_events(&self) -> bool {
        self.scheduler.peek().is_some()
    }
}
