use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use uuid::Uuid;

use crate::types::EventId;
use crate::{Key, SimTime};

/// A pending event: the target component, the instant it fires, and the type-erased
/// event value.
///
/// Entries are ordered by time and then by the order they were scheduled in, so two
/// events for the same instant are always delivered first-in first-out.
pub struct EventEntry {
    id: EventId,
    time: SimTime,
    pub(crate) component: Uuid,
    inner: Box<dyn Any>,
}

impl EventEntry {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Borrow the event as an `E`, or `None` if it holds another type.
    #[must_use]
    pub fn downcast<E: 'static>(&self) -> Option<EventEntryTyped<'_, E>> {
        self.inner.downcast_ref::<E>().map(|event| EventEntryTyped {
            id: self.id,
            time: self.time,
            component_key: Key::new_with_id(self.component),
            event,
        })
    }
}

impl fmt::Debug for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEntry")
            .field("id", &self.id)
            .field("time", &self.time)
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl PartialEq for EventEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for EventEntry {}

impl PartialOrd for EventEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse both keys to pop the earliest event first.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A typed view of an [`EventEntry`].
#[derive(Debug)]
pub struct EventEntryTyped<'e, E> {
    pub id: EventId,
    pub time: SimTime,
    pub component_key: Key<E>,
    pub event: &'e E,
}

/// Owns the simulation clock and the queue of pending events.
///
/// The clock only moves forward, and only when an event is popped.
#[derive(Default)]
pub struct Scheduler {
    next_event_id: u64,
    events: BinaryHeap<EventEntry>,
    clock: SimTime,
}

impl Scheduler {
    /// Schedules `event` for `component` at `self.time() + delay`.
    ///
    /// A zero delay delivers the event at the current instant, after every event that
    /// was already scheduled for it.
    pub fn schedule<E: 'static>(&mut self, delay: SimTime, component: Key<E>, event: E) {
        self.next_event_id += 1;
        let entry = EventEntry {
            id: EventId(self.next_event_id),
            time: self.clock + delay,
            component: component.id(),
            inner: Box::new(event),
        };
        self.events.push(entry);
    }

    /// Schedules `event` for `component` at the current instant.
    pub fn schedule_now<E: 'static>(&mut self, component: Key<E>, event: E) {
        self.schedule(SimTime::zero(), component, event);
    }

    /// Returns the current simulation time.
    #[must_use]
    pub fn time(&self) -> SimTime {
        self.clock
    }

    /// Number of events still waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    pub fn peek(&self) -> Option<&EventEntry> {
        self.events.peek()
    }

    /// Removes the next event and advances the clock to its time.
    pub fn pop(&mut self) -> Option<EventEntry> {
        let entry = self.events.pop()?;
        self.clock = entry.time;
        Some(entry)
    }

    /// Moves the clock forward to `time` without firing anything. Used by timed
    /// executors once the queue holds nothing at or before `time`.
    pub(crate) fn advance_to(&mut self, time: SimTime) {
        if time > self.clock {
            self.clock = time;
        }
    }
}
