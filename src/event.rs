use crate::{request::RequestId, Cycle};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Completion continuation of a request.
pub struct Callback(Box<dyn FnOnce(Cycle) + Send>);

impl Callback {
    pub fn new(f: impl FnOnce(Cycle) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn call(self, cycle: Cycle) {
        (self.0)(cycle);
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

#[derive(Debug)]
pub enum Event {
    /// Deliver a message to the entry point of the object it was routed to.
    Start(RequestId),
    /// Run the message handler of the object currently holding the request.
    Redo(RequestId),
    Callback(Callback),
}

#[derive(Debug)]
struct Entry {
    when: Cycle,
    seq: u64,
    event: Event,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.when, self.seq) == (other.when, other.seq)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

/// Time ordered event queue.
///
/// Events scheduled for the same cycle run in the order they were scheduled.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: Cycle,
    seq: u64,
    queue: BinaryHeap<Reverse<Entry>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn schedule(&mut self, delay: Cycle, event: Event) {
        self.schedule_at(self.now + delay, event);
    }

    pub fn schedule_at(&mut self, when: Cycle, event: Event) {
        assert!(
            when >= self.now,
            "cannot schedule {event:?} at {when} in the past (now={})",
            self.now
        );
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(Entry { when, seq, event }));
    }

    /// Cycle of the next pending event.
    #[must_use]
    pub fn next_cycle(&self) -> Option<Cycle> {
        self.queue.peek().map(|Reverse(entry)| entry.when)
    }

    /// Removes the next event and advances the clock to its cycle.
    pub fn pop(&mut self) -> Option<(Cycle, Event)> {
        let Reverse(Entry { when, event, .. }) = self.queue.pop()?;
        debug_assert!(when >= self.now);
        self.now = when;
        Some((when, event))
    }

    /// Moves the clock forward without running anything.
    pub fn advance_to(&mut self, cycle: Cycle) {
        if let Some(next) = self.next_cycle() {
            assert!(
                next >= cycle,
                "advancing to {cycle} would skip events at {next}"
            );
        }
        self.now = self.now.max(cycle);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Callback, Event, Scheduler};
    use crate::sync::{Arc, Mutex};
    use pretty_assertions_sorted as diff;

    fn record(log: &Arc<Mutex<Vec<(u64, &'static str)>>>, name: &'static str) -> Event {
        let log = Arc::clone(log);
        Event::Callback(Callback::new(move |cycle| log.lock().push((cycle, name))))
    }

    #[test]
    fn runs_events_in_time_then_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.schedule(3, record(&log, "late"));
        scheduler.schedule(1, record(&log, "first"));
        scheduler.schedule(1, record(&log, "second"));
        scheduler.schedule_at(0, record(&log, "now"));

        while let Some((cycle, event)) = scheduler.pop() {
            diff::assert_eq!(scheduler.now(), cycle);
            match event {
                Event::Callback(callback) => callback.call(cycle),
                other => panic!("unexpected event {other:?}"),
            }
        }
        diff::assert_eq!(
            *log.lock(),
            vec![(0, "now"), (1, "first"), (1, "second"), (3, "late")]
        );
        assert!(scheduler.is_empty());
    }

    #[test]
    #[should_panic(expected = "in the past")]
    fn rejects_events_in_the_past() {
        let mut scheduler = Scheduler::new();
        scheduler.advance_to(10);
        scheduler.schedule_at(5, Event::Callback(Callback::new(|_| {})));
    }
}
