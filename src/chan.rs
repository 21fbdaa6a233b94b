// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Typed rendezvous channels and `choose`, the non-deterministic multi-way
//! select. `send`/`recv` are implemented as a one-clause `choose` so the two
//! share one matching engine.
//!
//! Because the scheduler is strictly single-threaded and cooperative, the
//! usual CAS-guarded "claim a winner" dance a multi-threaded select needs
//! degenerates to a plain `RefCell` check: nothing else can run between a
//! clause being matched and its siblings being marked stale, so there is
//! no race to guard against,
//! only bookkeeping. A matched clause's siblings are not eagerly unlinked
//! from their channels' wait queues; instead they are recognised as stale
//! (the shared outcome cell is already filled) and dropped the next time
//! some operation walks that queue. This trades a few lingering `Rc`s for a
//! simpler implementation.

use crate::{
    fail::Fail,
    sched::{current_cancel, current_timers},
    timer::{Deadline, TimerToken},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    task::Waker,
    time::Instant,
};

struct ChooseShared {
    outcome: RefCell<Option<Result<usize, Fail>>>,
    waker: RefCell<Option<Waker>>,
}

impl ChooseShared {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            outcome: RefCell::new(None),
            waker: RefCell::new(None),
        })
    }

    /// Attempts to claim this choose for clause `index`. Returns `true` only
    /// for the first caller; every later caller sees a stale clause.
    fn try_claim(&self, index: usize) -> bool {
        let mut o = self.outcome.borrow_mut();
        if o.is_none() {
            *o = Some(Ok(index));
            true
        } else {
            false
        }
    }

    fn try_fail(&self, err: Fail) -> bool {
        let mut o = self.outcome.borrow_mut();
        if o.is_none() {
            *o = Some(Err(err));
            true
        } else {
            false
        }
    }

    fn wake(&self) {
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

struct ClauseState<T> {
    shared: Rc<ChooseShared>,
    index: usize,
    value: RefCell<Option<T>>,
}

struct ChannelInner<T> {
    senders: VecDeque<Rc<ClauseState<T>>>,
    receivers: VecDeque<Rc<ClauseState<T>>>,
    done: bool,
    closed: bool,
}

/// A typed rendezvous (unbuffered) channel: a send and a receive only ever
/// complete as a pair.
pub struct Channel<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                done: false,
                closed: false,
            })),
        }
    }

    /// Outbound half-close: a one-shot latch after which every future and
    /// currently-parked send/receive fails with [`Fail::ConnectionAborted`]
    /// (the crate's EPIPE).
    pub fn done(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.done {
            return;
        }
        inner.done = true;
        let receivers = std::mem::take(&mut inner.receivers);
        let senders = std::mem::take(&mut inner.senders);
        drop(inner);
        for w in receivers.iter().chain(senders.iter()) {
            if w.shared.try_fail(Fail::ConnectionAborted) {
                w.shared.wake();
            }
        }
    }

    /// Wakes every parked endpoint with [`Fail::Cancelled`] (the crate's
    /// ECANCELED) and marks the channel closed; new operations fail
    /// immediately afterward.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        let receivers = std::mem::take(&mut inner.receivers);
        let senders = std::mem::take(&mut inner.senders);
        drop(inner);
        for w in receivers.iter().chain(senders.iter()) {
            if w.shared.try_fail(Fail::Cancelled) {
                w.shared.wake();
            }
        }
    }

    pub fn send_clause(&self, value: T) -> SendClause<T> {
        SendClause {
            chan: self.clone(),
            value: RefCell::new(Some(value)),
        }
    }

    pub fn recv_clause(&self, slot: Rc<RefCell<Option<T>>>) -> RecvClause<T> {
        RecvClause {
            chan: self.clone(),
            slot,
            parked: RefCell::new(None),
        }
    }
}

impl<T: 'static> Channel<T> {
    pub async fn send(&self, value: T, deadline: Deadline) -> Result<(), Fail> {
        Choose::new()
            .deadline(deadline)
            .clause(Box::new(self.send_clause(value)))
            .run()
            .await
            .map(|_| ())
    }

    pub async fn recv(&self, deadline: Deadline) -> Result<T, Fail> {
        let slot = Rc::new(RefCell::new(None));
        Choose::new()
            .deadline(deadline)
            .clause(Box::new(self.recv_clause(slot.clone())))
            .run()
            .await?;
        Ok(slot.borrow_mut().take().expect("recv clause won without a value"))
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One arm of a [`Choose`]. Implemented by [`SendClause`] and [`RecvClause`];
/// type-erased so a single choose can span channels of different element
/// types.
pub trait Clause {
    /// Attempts an immediate, synchronous match against a waiter already
    /// parked on the other side. Performs the transfer and returns `true`
    /// on success.
    fn try_now(&self) -> Result<bool, Fail>;

    /// Parks this clause so a counterparty's `try_now` can match it later.
    fn park(&self, shared: Rc<ChooseShared>, index: usize);

    /// Called once, after this clause has won a choose that went through
    /// the parked path, to move any matched value into its final
    /// destination (a no-op for clauses that already did so in `try_now`).
    fn finish(&self) {}
}

pub struct SendClause<T> {
    chan: Channel<T>,
    value: RefCell<Option<T>>,
}

impl<T> Clause for SendClause<T> {
    fn try_now(&self) -> Result<bool, Fail> {
        let mut inner = self.chan.inner.borrow_mut();
        if inner.closed {
            return Err(Fail::Cancelled);
        }
        if inner.done {
            return Err(Fail::ConnectionAborted);
        }
        while let Some(r) = inner.receivers.pop_front() {
            if r.shared.try_claim(r.index) {
                *r.value.borrow_mut() = self.value.borrow_mut().take();
                r.shared.wake();
                return Ok(true);
            }
            // stale sibling of an already-resolved choose: drop and retry
        }
        Ok(false)
    }

    fn park(&self, shared: Rc<ChooseShared>, index: usize) {
        let mut inner = self.chan.inner.borrow_mut();
        inner.senders.push_back(Rc::new(ClauseState {
            shared,
            index,
            value: RefCell::new(self.value.borrow_mut().take()),
        }));
    }
}

pub struct RecvClause<T> {
    chan: Channel<T>,
    slot: Rc<RefCell<Option<T>>>,
    parked: RefCell<Option<Rc<ClauseState<T>>>>,
}

impl<T> Clause for RecvClause<T> {
    fn try_now(&self) -> Result<bool, Fail> {
        let mut inner = self.chan.inner.borrow_mut();
        if inner.closed {
            return Err(Fail::Cancelled);
        }
        while let Some(s) = inner.senders.pop_front() {
            if s.shared.try_claim(s.index) {
                *self.slot.borrow_mut() = s.value.borrow_mut().take();
                s.shared.wake();
                return Ok(true);
            }
        }
        if inner.done {
            return Err(Fail::ConnectionAborted);
        }
        Ok(false)
    }

    fn park(&self, shared: Rc<ChooseShared>, index: usize) {
        let mut inner = self.chan.inner.borrow_mut();
        let waiter = Rc::new(ClauseState {
            shared,
            index,
            value: RefCell::new(None),
        });
        inner.receivers.push_back(waiter.clone());
        *self.parked.borrow_mut() = Some(waiter);
    }

    fn finish(&self) {
        if let Some(waiter) = self.parked.borrow_mut().take() {
            *self.slot.borrow_mut() = waiter.value.borrow_mut().take();
        }
    }
}

/// Builds and runs a non-deterministic multi-way select across any number
/// of send/recv clauses on any number of channels, following a
/// scan-then-park-then-match algorithm:
/// 1. scan every clause in order for an immediate match; the first ready
///    clause wins;
/// 2. if `deadline` is already due, fail with `Timedout`;
/// 3. otherwise park every clause and suspend until one of them is matched,
///    the deadline fires, or the task is cancelled.
pub struct Choose {
    clauses: Vec<Box<dyn Clause>>,
    deadline: Deadline,
}

impl Choose {
    pub fn new() -> Self {
        Self {
            clauses: Vec::new(),
            deadline: None,
        }
    }

    pub fn clause(mut self, c: Box<dyn Clause>) -> Self {
        self.clauses.push(c);
        self
    }

    pub fn deadline(mut self, d: Deadline) -> Self {
        self.deadline = d;
        self
    }

    pub async fn run(self) -> Result<usize, Fail> {
        use std::future::poll_fn;
        use std::task::Poll;

        if self.clauses.is_empty() {
            return Err(Fail::Invalid {
                details: "choose with no clauses blocks forever",
            });
        }

        let cancel = current_cancel();
        let shared = ChooseShared::new();
        let mut parked = false;
        let mut timer_token: Option<TimerToken> = None;

        let result = poll_fn(move |cx| {
            if let Some(outcome) = shared.outcome.borrow_mut().take() {
                return Poll::Ready(outcome);
            }
            if cancel.is_cancelled() {
                return Poll::Ready(Err(Fail::Cancelled));
            }
            if !parked {
                for (i, clause) in self.clauses.iter().enumerate() {
                    match clause.try_now() {
                        Ok(true) => return Poll::Ready(Ok(i)),
                        Ok(false) => continue,
                        Err(e) => return Poll::Ready(Err(e)),
                    }
                }
                if matches!(self.deadline, Some(at) if at <= Instant::now()) {
                    return Poll::Ready(Err(Fail::Timedout));
                }
                shared.waker.replace(Some(cx.waker().clone()));
                for (i, clause) in self.clauses.iter().enumerate() {
                    clause.park(shared.clone(), i);
                }
                if let Some(at) = self.deadline {
                    timer_token = Some(current_timers().insert(at, cx.waker().clone()));
                }
                parked = true;
                return Poll::Pending;
            }
            if matches!(self.deadline, Some(at) if at <= Instant::now()) && shared.try_fail(Fail::Timedout) {
                return Poll::Ready(Err(Fail::Timedout));
            }
            shared.waker.replace(Some(cx.waker().clone()));
            Poll::Pending
        })
        .await;

        if let Some(t) = &timer_token {
            current_timers().remove(t);
        }
        if let Ok(i) = result {
            self.clauses[i].finish();
        }
        result
    }
}

impl Default for Choose {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;

    #[test]
    fn send_then_recv_rendezvous() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let chan: Channel<i32> = Channel::new();
            let chan2 = chan.clone();
            let h = crate::sched::go(async move {
                chan2.send(7, None).await.unwrap();
            });
            let v = chan.recv(None).await.unwrap();
            assert_eq!(v, 7);
            h.wait().await;
        });
    }

    #[test]
    fn recv_after_done_fails_with_eof() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let chan: Channel<i32> = Channel::new();
            chan.done();
            let err = chan.recv(None).await.unwrap_err();
            assert_eq!(err, Fail::ConnectionAborted);
        });
    }

    #[test]
    fn choose_picks_first_ready_clause_in_order() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let a: Channel<i32> = Channel::new();
            let b: Channel<i32> = Channel::new();
            // Park a sender on each channel, then choose between their
            // receives -- clause 0 (channel a) must win since it is
            // scanned first and both are ready.
            let a2 = a.clone();
            let b2 = b.clone();
            let ha = crate::sched::go(async move {
                let _ = a2.send(1, None).await;
            });
            let hb = crate::sched::go(async move {
                let _ = b2.send(2, None).await;
            });
            // Let both sends park.
            crate::sched::yield_now().await;
            let slot_a = Rc::new(RefCell::new(None));
            let slot_b = Rc::new(RefCell::new(None));
            let idx = Choose::new()
                .clause(Box::new(a.recv_clause(slot_a.clone())))
                .clause(Box::new(b.recv_clause(slot_b.clone())))
                .run()
                .await
                .unwrap();
            assert_eq!(idx, 0);
            assert_eq!(slot_a.borrow_mut().take(), Some(1));
            ha.wait().await;
            hb.close();
        });
    }
}
