// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The scheduler: a single-threaded, cooperative executor built directly on
//! `Future`/`async`-`await`. There is no hand-rolled stack switching here --
//! `async fn` compilation already gives every task its own suspended call
//! stack. What remains to build is the ready queue, the
//! fd-readiness/timer-driven park-and-wake loop, and per-task cancellation.

use crate::{fail::Fail, poll::Poller, timer::{Deadline, TimerSet}};
use crossbeam_channel::{Receiver, Sender};
use futures::task::{waker, ArcWake};
use slab::Slab;
use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Instant,
};

/// A task's cancellation flag. Every blocking primitive checks this before
/// parking and returns [`Fail::Cancelled`] immediately if set; once set it
/// never clears.
#[derive(Clone)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }

    fn cancel(&self) {
        self.0.set(true);
    }
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
    static CURRENT_CANCEL: RefCell<Vec<CancelToken>> = RefCell::new(Vec::new());
}

/// The timer set of the scheduler currently driving this thread. Panics if
/// called outside [`Scheduler::block_on`] -- every suspension point in this
/// crate is only ever reached from inside a running scheduler.
pub fn current_timers() -> TimerSet {
    CURRENT_SCHEDULER.with(|s| {
        s.borrow()
            .as_ref()
            .expect("no scheduler is driving this thread")
            .timers()
    })
}

pub fn current_poller() -> Poller {
    CURRENT_SCHEDULER.with(|s| {
        s.borrow()
            .as_ref()
            .expect("no scheduler is driving this thread")
            .poller()
    })
}

/// The cancellation token of the task currently being polled. Outside of any
/// task (e.g. the top-level future passed to `block_on`) this is a token
/// that is never cancelled by the scheduler itself, but can still be
/// cancelled explicitly by closing that top-level "task".
pub fn current_cancel() -> CancelToken {
    CURRENT_CANCEL.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(CancelToken::new)
    })
}

struct DoneInner {
    fired: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
}

/// A one-shot completion latch. Used both for a task's own "done channel"
/// and, in [`crate::chan`], for a channel's `done()`/`close()` latches --
/// task completion and channel closure are the same event from a waiter's
/// point of view, so they share this primitive.
#[derive(Clone)]
pub struct DoneLatch(Rc<DoneInner>);

impl DoneLatch {
    pub fn new() -> Self {
        Self(Rc::new(DoneInner {
            fired: Cell::new(false),
            wakers: RefCell::new(Vec::new()),
        }))
    }

    pub fn fire(&self) {
        if !self.0.fired.replace(true) {
            for w in self.0.wakers.borrow_mut().drain(..) {
                w.wake();
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        self.0.fired.get()
    }

    pub fn wait(&self) -> DoneFuture {
        DoneFuture(self.clone())
    }
}

pub struct DoneFuture(DoneLatch);

impl Future for DoneFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.0 .0.fired.get() {
            Poll::Ready(())
        } else {
            self.0 .0.wakers.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct TaskSlot {
    future: Pin<Box<dyn Future<Output = ()>>>,
    cancel: CancelToken,
    done: DoneLatch,
}

struct Inner {
    tasks: RefCell<Slab<TaskSlot>>,
    ready_tx: Sender<usize>,
    ready_rx: Receiver<usize>,
    poller: Poller,
    timers: TimerSet,
}

/// Single-threaded cooperative executor. Not `Send`/`Sync`: every handle and
/// channel created through one `Scheduler` holds an `Rc` back into it, so
/// the type system itself keeps a scheduler's state off other threads.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

struct TaskWaker {
    id: usize,
    tx: Sender<usize>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let _ = arc_self.tx.send(arc_self.id);
    }
}

impl Scheduler {
    pub fn new() -> std::io::Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            inner: Rc::new(Inner {
                tasks: RefCell::new(Slab::new()),
                ready_tx,
                ready_rx,
                poller: Poller::new()?,
                timers: TimerSet::new(),
            }),
        })
    }

    pub fn timers(&self) -> TimerSet {
        self.inner.timers.clone()
    }

    pub fn poller(&self) -> Poller {
        self.inner.poller.clone()
    }

    /// Spawns `fut` as an independent task, returning a handle whose
    /// `done()` latch fires when the task completes (normally or via
    /// cancellation).
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskHandle {
        let cancel = CancelToken::new();
        let done = DoneLatch::new();
        let done2 = done.clone();
        let wrapped = async move {
            fut.await;
            done2.fire();
        };
        let mut tasks = self.inner.tasks.borrow_mut();
        let id = tasks.insert(TaskSlot {
            future: Box::pin(wrapped),
            cancel: cancel.clone(),
            done: done.clone(),
        });
        drop(tasks);
        let _ = self.inner.ready_tx.send(id);
        TaskHandle {
            scheduler: self.clone(),
            id,
            cancel,
            done,
        }
    }

    /// Forces task `id` back onto the ready queue, e.g. so it notices a
    /// cancellation request the next time it is polled.
    fn wake_task(&self, id: usize) {
        let _ = self.inner.ready_tx.send(id);
    }

    /// Cancels and removes task `id`'s slot bookkeeping once it terminates.
    /// `hclose` on a task is exactly `CancelToken::cancel` plus a wakeup.
    ///
    /// `current_cancel`/`current_timers` are only ever read synchronously
    /// from inside a `Future::poll` call, so the "current task" context is
    /// pushed and popped around exactly that call -- never around a task's
    /// whole lifetime, which (since polls of different tasks interleave
    /// across each other's suspensions) would leave the thread-local stack
    /// unbalanced.
    fn poll_task(&self, id: usize) -> bool {
        let waker = waker(Arc::new(TaskWaker {
            id,
            tx: self.inner.ready_tx.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        let mut tasks = self.inner.tasks.borrow_mut();
        let slot = match tasks.get_mut(id) {
            Some(s) => s,
            None => return true,
        };
        let cancel = slot.cancel.clone();
        // SAFETY: the future is always stored pinned in a Box and never
        // moved out of the slab entry until it resolves.
        let fut = slot.future.as_mut();
        CURRENT_CANCEL.with(|s| s.borrow_mut().push(cancel));
        let poll = Future::poll(fut, &mut cx);
        CURRENT_CANCEL.with(|s| {
            s.borrow_mut().pop();
        });
        match poll {
            Poll::Ready(()) => {
                tasks.remove(id);
                true
            }
            Poll::Pending => false,
        }
    }

    /// Polls every currently-ready task until none remain ready (all are
    /// parked on a timer, fd wait, or channel clause).
    fn run_ready(&self) {
        while let Ok(id) = self.inner.ready_rx.try_recv() {
            self.poll_task(id);
        }
    }

    /// Drives `driver` to completion, servicing all spawned tasks
    /// cooperatively alongside it. This is the crate's top-level entry
    /// point, analogous to the reference stack's per-engine event loop.
    pub fn block_on<F: Future>(&self, driver: F) -> F::Output {
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let handle = self.spawn(async move {
            let v = driver.await;
            *result2.borrow_mut() = Some(v);
        });
        loop {
            self.run_ready();
            if handle.done.is_fired() {
                break;
            }
            let now = Instant::now();
            let fired = self.inner.timers.pop_due(now);
            if fired > 0 {
                continue;
            }
            let timeout = self.inner.timers.poll_timeout(now);
            let _ = self.inner.poller.wait(timeout);
        }
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = None);
        Rc::try_unwrap(result)
            .ok()
            .unwrap()
            .into_inner()
            .expect("driver task finished without producing a value")
    }

    /// Number of tasks currently tracked (ready or parked). Exposed for
    /// tests and for bundle-close bookkeeping.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Runs ready tasks and services one round of timers/fd events without
    /// blocking indefinitely -- used by `Bundle::close` to pump cancelled
    /// children to completion synchronously.
    pub fn pump_once(&self, timeout: Option<std::time::Duration>) {
        self.run_ready();
        let now = Instant::now();
        self.inner.timers.pop_due(now);
        let _ = self.inner.poller.wait(timeout);
        self.run_ready();
    }
}

/// Handle to a spawned task. `close()` cancels it; awaiting `done()` blocks
/// until it (normally or via cancellation) terminates -- the same
/// receive-on-completion shape as waiting on a channel the task closes
/// when it finishes.
pub struct TaskHandle {
    scheduler: Scheduler,
    id: usize,
    cancel: CancelToken,
    done: DoneLatch,
}

impl TaskHandle {
    /// Requests cancellation and forces the task to be polled again so it
    /// observes the request promptly, rather than only the next time
    /// something else happens to wake it.
    pub fn close(&self) {
        self.cancel.cancel();
        self.scheduler.wake_task(self.id);
    }

    pub fn is_done(&self) -> bool {
        self.done.is_fired()
    }

    pub async fn wait(&self) {
        self.done.wait().await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Clones the underlying completion latch, so a caller (e.g.
    /// [`crate::bundle::Bundle::wait`]) can await every child's completion
    /// without holding a borrow on whatever collection the handles
    /// themselves live in.
    pub(crate) fn done_latch(&self) -> DoneLatch {
        self.done.clone()
    }
}

/// Spawns `fut` on the scheduler currently driving this thread.
pub fn go(fut: impl Future<Output = ()> + 'static) -> TaskHandle {
    CURRENT_SCHEDULER.with(|s| {
        s.borrow()
            .as_ref()
            .expect("go() called outside of Scheduler::block_on")
            .spawn(fut)
    })
}

/// Cooperative sleep: suspends the current task until `deadline`, returning
/// [`Fail::Cancelled`] immediately if the task is cancelled either before or
/// during the sleep.
pub async fn sleep_until(deadline: Deadline) -> Result<(), Fail> {
    struct Sleep {
        deadline: Deadline,
        token: Option<crate::timer::TimerToken>,
    }
    impl Future for Sleep {
        type Output = Result<(), Fail>;
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Fail>> {
            if current_cancel().is_cancelled() {
                return Poll::Ready(Err(Fail::Cancelled));
            }
            match self.deadline {
                None => Poll::Pending,
                Some(at) => {
                    if at <= Instant::now() {
                        return Poll::Ready(Ok(()));
                    }
                    if self.token.is_none() {
                        self.token = Some(current_timers().insert(at, cx.waker().clone()));
                    }
                    Poll::Pending
                }
            }
        }
    }
    impl Drop for Sleep {
        fn drop(&mut self) {
            if let Some(t) = self.token.take() {
                // The scheduler may already have stopped driving this
                // thread (e.g. this future is being dropped along with the
                // whole scheduler) -- in that case there is no timer set
                // left to clean up.
                let timers = CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().map(Scheduler::timers));
                if let Some(timers) = timers {
                    timers.remove(&t);
                }
            }
        }
    }
    Sleep {
        deadline,
        token: None,
    }
    .await
}

/// Yields control back to the scheduler once, letting any other ready
/// tasks run before this one resumes.
pub async fn yield_now() {
    struct YieldNow(bool);
    impl Future for YieldNow {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
    YieldNow(false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn block_on_returns_driver_output() {
        let sched = Scheduler::new().unwrap();
        let v = sched.block_on(async { 41 + 1 });
        assert_eq!(v, 42);
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let sched = Scheduler::new().unwrap();
        let flag = Rc::new(Cell::new(false));
        let flag2 = flag.clone();
        sched.block_on(async move {
            let h = go(async move {
                flag2.set(true);
            });
            h.wait().await;
        });
        assert!(flag.get());
    }

    #[test]
    fn cancelling_a_task_wakes_its_sleep() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async move {
            let h = go(async move {
                let r = sleep_until(crate::timer::after(Duration::from_secs(100))).await;
                assert_eq!(r, Err(Fail::Cancelled));
            });
            h.close();
            h.wait().await;
        });
    }
}
