// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadline set: an ordered collection keyed by absolute deadline, used by
//! the scheduler to compute its next poll timeout and to fire timed-out
//! waiters. The usual sentinel values for "never" and "immediate" become
//! `None` and `Some(Instant::now())` respectively in [`Deadline`].

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
    task::Waker,
    time::{Duration, Instant},
};

/// An absolute deadline, or `None` for "never".
pub type Deadline = Option<Instant>;

/// Builds a deadline `dur` from now. A zero duration is "immediate".
pub fn after(dur: Duration) -> Deadline {
    Some(Instant::now() + dur)
}

pub fn immediate() -> Deadline {
    Some(Instant::now())
}

pub fn never() -> Deadline {
    None
}

pub fn is_due(deadline: Deadline, now: Instant) -> bool {
    matches!(deadline, Some(at) if at <= now)
}

/// Key type giving deadlines a total order with insertion-order tie-break.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct Key(Instant, u64);

/// A registration in the timer set; removing it before it fires is a no-op
/// if it already fired.
pub struct TimerToken {
    key: Key,
}

struct Inner {
    entries: BTreeMap<Key, Waker>,
    next_seq: u64,
}

/// Ordered-by-deadline set of parked wakers. O(log n) insert/remove, O(log
/// n) peek-minimum.
#[derive(Clone)]
pub struct TimerSet {
    inner: Rc<RefCell<Inner>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: BTreeMap::new(),
                next_seq: 0,
            })),
        }
    }

    /// Registers `waker` to fire at `at`. Returns a token usable to cancel
    /// the registration (e.g. when the owning future is dropped or wins a
    /// choose on a different clause).
    pub fn insert(&self, at: Instant, waker: Waker) -> TimerToken {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = Key(at, seq);
        inner.entries.insert(key, waker);
        TimerToken { key }
    }

    pub fn remove(&self, token: &TimerToken) {
        self.inner.borrow_mut().entries.remove(&token.key);
    }

    /// The earliest pending deadline, if any.
    pub fn min(&self) -> Option<Instant> {
        self.inner
            .borrow()
            .entries
            .keys()
            .next()
            .map(|k| k.0)
    }

    /// How long the scheduler should block in its next poll wait, given
    /// `now`, so that no timer fires late.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.min().map(|at| at.saturating_duration_since(now))
    }

    /// Wakes and removes every entry due at or before `now`.
    pub fn pop_due(&self, now: Instant) -> usize {
        let mut inner = self.inner.borrow_mut();
        let due: Vec<Key> = inner
            .entries
            .range(..=Key(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let mut fired = 0;
        for key in due {
            if let Some(waker) = inner.entries.remove(&key) {
                waker.wake();
                fired += 1;
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_raw_waker() -> RawWaker {
        fn clone(_: *const ()) -> RawWaker {
            noop_raw_waker()
        }
        fn noop(_: *const ()) {}
        let vtable = &RawWakerVTable::new(clone, noop, noop, noop);
        RawWaker::new(std::ptr::null(), vtable)
    }

    fn noop_waker() -> Waker {
        unsafe { Waker::from_raw(noop_raw_waker()) }
    }

    #[test]
    fn fires_in_deadline_order() {
        let set = TimerSet::new();
        let now = Instant::now();
        let _t1 = set.insert(now + Duration::from_millis(50), noop_waker());
        let _t2 = set.insert(now + Duration::from_millis(10), noop_waker());
        assert_eq!(set.min(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn pop_due_removes_expired_only() {
        let set = TimerSet::new();
        let now = Instant::now();
        let _t1 = set.insert(now, noop_waker());
        let _t2 = set.insert(now + Duration::from_secs(60), noop_waker());
        assert_eq!(set.pop_due(now), 1);
        assert!(!set.is_empty());
    }

    #[test]
    fn remove_before_fire_is_silent() {
        let set = TimerSet::new();
        let now = Instant::now();
        let token = set.insert(now + Duration::from_secs(60), noop_waker());
        set.remove(&token);
        assert!(set.is_empty());
    }
}
