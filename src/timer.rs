//! # Timer service
//!
//! Monotonic, cancellable millisecond timers. The service is a pure state
//! machine: the host asks [`TimerService::next_expiry`] when to wake up
//! and calls [`TimerService::pop_expired`] with the current time; fired
//! timers are returned as keys for the owner to dispatch.

use slab::Slab;

use crate::types::Timestamp;

/// What a per-session timer drives when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Inactivity timeout; firing silently closes the session.
    Idle,
    /// Loss-detection / ack-delay timer.
    Retransmit,
    /// Closing or draining period expiry; firing destroys the session.
    Drain,
}

/// Identifies the session slot and timer kind a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    pub session: usize,
    pub kind: TimerKind,
}

/// Opaque handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

#[derive(Debug)]
struct TimerEntry {
    key: TimerKey,
    deadline: Option<Timestamp>,
}

/// Slot-keyed timer table.
#[derive(Debug, Default)]
pub struct TimerService {
    entries: Slab<TimerEntry>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: TimerKey) -> TimerHandle {
        TimerHandle(self.entries.insert(TimerEntry {
            key,
            deadline: None,
        }))
    }

    /// Arm or move a timer; `None` cancels it.
    pub fn set(&mut self, handle: TimerHandle, deadline: Option<Timestamp>) {
        if let Some(entry) = self.entries.get_mut(handle.0) {
            entry.deadline = deadline;
        }
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        self.set(handle, None);
    }

    /// Unregister a timer entirely (session teardown).
    pub fn remove(&mut self, handle: TimerHandle) {
        if self.entries.contains(handle.0) {
            self.entries.remove(handle.0);
        }
    }

    /// Earliest armed deadline, if any.
    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.entries
            .iter()
            .filter_map(|(_, e)| e.deadline)
            .min()
    }

    /// Disarm and return all timers with `deadline <= now`.
    pub fn pop_expired(&mut self, now: Timestamp) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        for (_, entry) in self.entries.iter_mut() {
            if let Some(deadline) = entry.deadline {
                if deadline <= now {
                    entry.deadline = None;
                    fired.push(entry.key);
                }
            }
        }
        fired
    }

    pub fn armed_count(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.deadline.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(session: usize, kind: TimerKind) -> TimerKey {
        TimerKey { session, kind }
    }

    #[test]
    fn next_expiry_is_minimum() {
        let mut svc = TimerService::new();
        let a = svc.register(key(0, TimerKind::Idle));
        let b = svc.register(key(0, TimerKind::Retransmit));
        svc.set(a, Some(Timestamp::from_millis(500)));
        svc.set(b, Some(Timestamp::from_millis(120)));
        assert_eq!(svc.next_expiry(), Some(Timestamp::from_millis(120)));
    }

    #[test]
    fn pop_expired_disarms() {
        let mut svc = TimerService::new();
        let a = svc.register(key(3, TimerKind::Idle));
        svc.set(a, Some(Timestamp::from_millis(100)));

        assert!(svc.pop_expired(Timestamp::from_millis(99)).is_empty());
        let fired = svc.pop_expired(Timestamp::from_millis(100));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].session, 3);
        // One-shot: does not fire again until re-armed.
        assert!(svc.pop_expired(Timestamp::from_millis(1000)).is_empty());
        assert_eq!(svc.next_expiry(), None);
    }

    #[test]
    fn cancel_and_remove() {
        let mut svc = TimerService::new();
        let a = svc.register(key(1, TimerKind::Drain));
        svc.set(a, Some(Timestamp::from_millis(10)));
        svc.cancel(a);
        assert_eq!(svc.armed_count(), 0);
        svc.remove(a);
        // Setting a removed handle is a no-op.
        svc.set(a, Some(Timestamp::from_millis(10)));
        assert_eq!(svc.next_expiry(), None);
    }
}
