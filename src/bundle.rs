// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bundles: the structured-concurrency scope. A bundle owns every task
//! spawned into it; closing the bundle cancels all of them and waits for
//! every one to actually terminate before returning, so a parent can never
//! observe "closed" while a child is still touching shared state.

use crate::{
    fail::Fail,
    sched::{go, sleep_until, DoneLatch, Scheduler, TaskHandle},
    timer::Deadline,
};
use futures::future::{select, Either};
use std::{cell::RefCell, future::Future, pin::Pin};

/// A structured-concurrency scope. Dropping a `Bundle` without calling
/// [`Bundle::close`] cancels its children as a safety net, but does not
/// wait for them -- Rust has no async `Drop`, so callers that need the
/// "cancelled and fully torn down" guarantee must `.close().await`
/// explicitly, same as the rest of this crate's fallible teardown paths.
pub struct Bundle {
    children: RefCell<Vec<TaskHandle>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            children: RefCell::new(Vec::new()),
        }
    }

    /// Spawns `fut` as a child of this bundle.
    pub fn go(&self, fut: impl Future<Output = ()> + 'static) {
        let handle = go(fut);
        self.children.borrow_mut().push(handle);
    }

    /// Spawns `fut` onto `scheduler` explicitly, for use outside of an
    /// already-running task (e.g. wiring up the top-level bundle a
    /// `LibOs` owns).
    pub fn go_on(&self, scheduler: &Scheduler, fut: impl Future<Output = ()> + 'static) {
        let handle = scheduler.spawn(fut);
        self.children.borrow_mut().push(handle);
    }

    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }

    /// Waits for every child currently in the bundle to finish on its own,
    /// without cancelling any of them -- the opposite of [`Bundle::close`].
    /// Returns `Fail::Timedout` if `deadline` elapses first, or
    /// `Fail::Cancelled` if the waiting task itself is cancelled while
    /// waiting; either way, the children are left running untouched.
    pub async fn wait(&self, deadline: Deadline) -> Result<(), Fail> {
        let dones: Vec<DoneLatch> = self
            .children
            .borrow()
            .iter()
            .map(TaskHandle::done_latch)
            .collect();
        let all_done: Pin<Box<dyn Future<Output = ()>>> = Box::pin(async move {
            futures::future::join_all(dones.iter().map(DoneLatch::wait)).await;
        });
        let timeout: Pin<Box<dyn Future<Output = Result<(), Fail>>>> = Box::pin(sleep_until(deadline));
        match select(all_done, timeout).await {
            Either::Left(((), _)) => Ok(()),
            Either::Right((Ok(()), _)) => Err(Fail::Timedout),
            Either::Right((Err(e), _)) => Err(e),
        }
    }

    /// Cancels every child and waits for all of them to terminate. Safe to
    /// call repeatedly; subsequent calls are no-ops.
    pub async fn close(&self) {
        let children: Vec<TaskHandle> = self.children.borrow_mut().drain(..).collect();
        for c in &children {
            c.close();
        }
        for c in &children {
            c.wait().await;
        }
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        for c in self.children.borrow().iter() {
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn close_cancels_and_waits_for_every_child() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let bundle = Bundle::new();
            let finished = Rc::new(Cell::new(0));
            for _ in 0..3 {
                let finished = finished.clone();
                bundle.go(async move {
                    crate::sched::sleep_until(crate::timer::never()).await.ok();
                    finished.set(finished.get() + 1);
                });
            }
            assert_eq!(bundle.len(), 3);
            bundle.close().await;
            assert_eq!(finished.get(), 3);
            assert!(bundle.is_empty());
        });
    }

    #[test]
    fn wait_resolves_once_every_child_finishes_on_its_own() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let bundle = Bundle::new();
            let finished = Rc::new(Cell::new(0));
            for i in 0u64..3 {
                let finished = finished.clone();
                bundle.go(async move {
                    crate::sched::sleep_until(crate::timer::after(std::time::Duration::from_millis(i * 5)))
                        .await
                        .ok();
                    finished.set(finished.get() + 1);
                });
            }
            bundle.wait(crate::timer::never()).await.unwrap();
            assert_eq!(finished.get(), 3);
            // wait() never touched the bundle's own bookkeeping.
            assert_eq!(bundle.len(), 3);
        });
    }

    #[test]
    fn wait_times_out_without_cancelling_children() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let bundle = Bundle::new();
            let cancelled = Rc::new(Cell::new(false));
            let cancelled2 = cancelled.clone();
            bundle.go(async move {
                let res = crate::sched::sleep_until(crate::timer::never()).await;
                if res.is_err() {
                    cancelled2.set(true);
                }
            });
            let err = bundle
                .wait(crate::timer::after(std::time::Duration::from_millis(10)))
                .await
                .unwrap_err();
            assert_eq!(err, Fail::Timedout);
            assert!(!cancelled.get());
            assert_eq!(bundle.len(), 1);
            bundle.close().await;
            assert!(cancelled.get());
        });
    }
}
