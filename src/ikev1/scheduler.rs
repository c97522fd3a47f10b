use std::{
    cell::Cell,
    collections::BTreeMap,
    rc::Rc,
    time::{Duration, Instant},
};

use super::session::{Phase1Id, Phase2Id, SessionId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerEvent {
    Phase1Cleanup(Phase1Id),
    Phase1Delete(Phase1Id),
    Phase1Rekey(Phase1Id),
    Phase2Cleanup(Phase2Id),
    Phase2Delete(Phase2Id),
    TrafficMonitor(SessionId),
    IdleTimeout(SessionId),
    XauthTimeout(SessionId),
}

/// Owning handle of a scheduled event; dropping it cancels the event.
pub struct TimerHandle {
    deadline: Instant,
    active: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.is_active() {
            Some(self.deadline.saturating_duration_since(now))
        } else {
            None
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.active.set(false);
    }
}

struct Entry {
    event: TimerEvent,
    active: Rc<Cell<bool>>,
}

/// Single-threaded timer queue; ties on the same deadline fire in scheduling order.
#[derive(Default)]
pub struct Scheduler {
    entries: BTreeMap<(Instant, u64), Entry>,
    sequence: u64,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            entries: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, event: TimerEvent) -> TimerHandle {
        let deadline = now + delay;
        let active = Rc::new(Cell::new(true));
        self.sequence += 1;
        self.entries.insert(
            (deadline, self.sequence),
            Entry {
                event,
                active: active.clone(),
            },
        );
        TimerHandle { deadline, active }
    }

    fn prune(&mut self) {
        while let Some(entry) = self.entries.first_entry() {
            if entry.get().active.get() {
                break;
            }
            entry.remove();
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns the earliest active event due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerEvent> {
        self.prune();
        let entry = self.entries.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        let entry = entry.remove();
        entry.active.set(false);
        Some(entry.event)
    }

    pub fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.active.get())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let id = SessionId::from_u64(1);
        let _late = scheduler.schedule(now, Duration::from_secs(7), TimerEvent::IdleTimeout(id));
        let _early = scheduler.schedule(now, Duration::from_secs(5), TimerEvent::XauthTimeout(id));
        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(scheduler.pop_expired(now + Duration::from_secs(4)), None);
        assert_eq!(
            scheduler.pop_expired(now + Duration::from_secs(10)),
            Some(TimerEvent::XauthTimeout(id))
        );
        assert_eq!(
            scheduler.pop_expired(now + Duration::from_secs(10)),
            Some(TimerEvent::IdleTimeout(id))
        );
        assert_eq!(scheduler.pop_expired(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn dropped_handle_cancels() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let id = SessionId::from_u64(1);
        let handle = scheduler.schedule(now, Duration::from_secs(1), TimerEvent::IdleTimeout(id));
        assert_eq!(handle.remaining(now), Some(Duration::from_secs(1)));
        assert_eq!(scheduler.pending(), 1);
        drop(handle);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(scheduler.pop_expired(now + Duration::from_secs(2)), None);
    }

    #[test]
    fn popped_handle_is_inactive() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        let id = SessionId::from_u64(1);
        let handle = scheduler.schedule(now, Duration::ZERO, TimerEvent::TrafficMonitor(id));
        assert!(scheduler.pop_expired(now).is_some());
        assert!(!handle.is_active());
        assert_eq!(handle.remaining(now), None);
    }
}
