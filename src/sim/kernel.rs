//! The event-driven simulation kernel.
//!
//! Pops events in (tick, insertion) order, advances the clock
//! monotonically, and hands each event to the driver. Execution may
//! schedule further events; scheduling into the past is an internal error
//! and the event is rejected. The run ends when the queue drains or the
//! clock passes the horizon. The horizon check happens *after* the
//! crossing event executes.

use tracing::{error, trace};

use crate::core::event::{Event, EventQueue};
use crate::core::request::Tick;

/// Event loop state for one simulation run.
#[derive(Debug)]
pub struct Kernel {
    queue: EventQueue,
    clock: Tick,
    horizon: Option<Tick>,
}

impl Kernel {
    pub fn new(horizon: Option<Tick>) -> Self {
        Self {
            queue: EventQueue::new(),
            clock: 0,
            horizon,
        }
    }

    pub fn clock(&self) -> Tick {
        self.clock
    }

    /// Schedule an event. Past timestamps are rejected and logged; the
    /// simulation continues without the event.
    pub fn schedule(&mut self, tick: Tick, event: Event) {
        if tick < self.clock {
            error!(
                tick,
                clock = self.clock,
                ?event,
                "rejected event scheduled in the past"
            );
            return;
        }
        self.queue.push(tick, event);
    }

    /// Drain the queue through `handler`, which returns follow-up events.
    /// Returns the final clock value.
    pub fn run<F>(&mut self, mut handler: F) -> Tick
    where
        F: FnMut(Tick, Event) -> Vec<(Tick, Event)>,
    {
        while let Some((tick, event)) = self.queue.pop() {
            self.clock = self.clock.max(tick);
            trace!(tick = self.clock, ?event, "executing event");

            for (when, follow_up) in handler(self.clock, event) {
                self.schedule(when, follow_up);
            }

            if let Some(horizon) = self.horizon {
                if self.clock > horizon {
                    trace!(clock = self.clock, horizon, "horizon reached");
                    break;
                }
            }
        }
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::Event;

    #[test]
    fn test_clock_monotone_and_follow_ups_execute() {
        let mut kernel = Kernel::new(None);
        kernel.schedule(100, Event::Step(0));

        let mut seen = Vec::new();
        kernel.run(|now, event| {
            seen.push((now, event));
            if seen.len() == 1 {
                vec![(now + 50, Event::Step(1))]
            } else {
                Vec::new()
            }
        });

        assert_eq!(seen, vec![(100, Event::Step(0)), (150, Event::Step(1))]);
        assert_eq!(kernel.clock(), 150);
    }

    #[test]
    fn test_horizon_stops_after_crossing_event() {
        let mut kernel = Kernel::new(Some(120));
        kernel.schedule(100, Event::Step(0));
        kernel.schedule(130, Event::Step(1));
        kernel.schedule(140, Event::Step(2));

        let mut seen = Vec::new();
        kernel.run(|now, event| {
            seen.push((now, event));
            Vec::new()
        });

        // The event at 130 crosses the horizon and still executes; 140
        // does not.
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (130, Event::Step(1)));
    }

    #[test]
    fn test_past_event_rejected() {
        let mut kernel = Kernel::new(None);
        kernel.schedule(100, Event::Step(0));

        let mut count = 0;
        kernel.run(|now, _event| {
            count += 1;
            if count == 1 {
                // Scheduling before `now` must be refused.
                vec![(now - 1, Event::Step(9))]
            } else {
                Vec::new()
            }
        });
        assert_eq!(count, 1);
    }
}
