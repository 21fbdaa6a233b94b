// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `apoll`: the file-descriptor readiness backend, and `Poller`, the
//! userspace wrapper that caches which direction(s) of each fd a task is
//! actually waiting on so spurious wakeups are discarded rather than
//! delivered. Backed by `mio`, which multiplexes epoll/kqueue/poll behind
//! one portable interface.

use mio::{event::Source, Events, Interest, Poll, Token};
use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    rc::Rc,
    task::Waker,
    time::Duration,
};

struct Registration {
    want_read: Option<Waker>,
    want_write: Option<Waker>,
    /// The interest mask actually registered with the kernel right now,
    /// kept in sync with `want_read`/`want_write` so a fd that only ever
    /// waits on one direction stops generating events for the other.
    registered: Interest,
}

impl Registration {
    fn new(registered: Interest) -> Self {
        Self {
            want_read: None,
            want_write: None,
            registered,
        }
    }

    /// The interest this registration currently wants, or `None` if
    /// neither direction is armed. Mio has no "empty" interest, so a
    /// caller seeing `None` should leave the last registered mask alone
    /// rather than try to register nothing.
    fn desired(&self) -> Option<Interest> {
        match (self.want_read.is_some(), self.want_write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct Inner {
    poll: Poll,
    events: Events,
    regs: HashMap<Token, Registration>,
    next_token: usize,
}

/// The shared, per-executor fd-readiness pollset. One instance is owned by
/// the `Scheduler`; transports register their raw sources with it at
/// construction and deregister them on close.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<RefCell<Inner>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                poll: Poll::new()?,
                events: Events::with_capacity(256),
                regs: HashMap::new(),
                next_token: 0,
            })),
        })
    }

    /// Registers `source` for both readability and writability and returns
    /// the [`Token`] identifying it. Both directions start out registered
    /// since nothing has asked to wait on either yet; the first `want_read`
    /// or `want_write` call that narrows the picture reregisters the source
    /// with only the directions actually wanted.
    pub fn register(&self, source: &mut dyn Source) -> io::Result<Token> {
        let mut inner = self.inner.borrow_mut();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        let both = Interest::READABLE | Interest::WRITABLE;
        inner.poll.registry().register(source, token, both)?;
        inner.regs.insert(token, Registration::new(both));
        Ok(token)
    }

    pub fn deregister(&self, token: Token, source: &mut dyn Source) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.regs.remove(&token);
        inner.poll.registry().deregister(source)
    }

    /// Arms the waker for the read direction of `token`; it fires (and is
    /// consumed) the next time the fd is reported readable. Reregisters
    /// `source` with the kernel if this narrows (or widens) the interest
    /// mask actually being watched.
    pub fn want_read(&self, token: Token, source: &mut dyn Source, waker: Waker) {
        self.rearm(token, source, waker, true);
    }

    pub fn want_write(&self, token: Token, source: &mut dyn Source, waker: Waker) {
        self.rearm(token, source, waker, false);
    }

    fn rearm(&self, token: Token, source: &mut dyn Source, waker: Waker, read: bool) {
        let mut inner = self.inner.borrow_mut();
        let Inner { poll, regs, .. } = &mut *inner;
        let reg = match regs.get_mut(&token) {
            Some(reg) => reg,
            None => return,
        };
        if read {
            reg.want_read = Some(waker);
        } else {
            reg.want_write = Some(waker);
        }
        if let Some(want) = reg.desired() {
            if want != reg.registered {
                if poll.registry().reregister(source, token, want).is_ok() {
                    reg.registered = want;
                }
            }
        }
    }

    pub fn clear_read(&self, token: Token, source: &mut dyn Source) {
        self.disarm(token, source, true);
    }

    pub fn clear_write(&self, token: Token, source: &mut dyn Source) {
        self.disarm(token, source, false);
    }

    fn disarm(&self, token: Token, source: &mut dyn Source, read: bool) {
        let mut inner = self.inner.borrow_mut();
        let Inner { poll, regs, .. } = &mut *inner;
        let reg = match regs.get_mut(&token) {
            Some(reg) => reg,
            None => return,
        };
        if read {
            reg.want_read = None;
        } else {
            reg.want_write = None;
        }
        if let Some(want) = reg.desired() {
            if want != reg.registered {
                if poll.registry().reregister(source, token, want).is_ok() {
                    reg.registered = want;
                }
            }
        }
    }

    /// Blocks up to `timeout` waiting for at least one readiness event, then
    /// drains and dispatches every event. Returns the number of armed
    /// wakers that fired.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let Inner {
            ref mut poll,
            ref mut events,
            ref mut regs,
            ..
        } = *inner;
        poll.poll(events, timeout)?;
        let mut fired = 0;
        for event in events.iter() {
            if let Some(reg) = regs.get_mut(&event.token()) {
                if event.is_readable() {
                    if let Some(w) = reg.want_read.take() {
                        w.wake();
                        fired += 1;
                    }
                }
                if event.is_writable() {
                    if let Some(w) = reg.want_write.take() {
                        w.wake();
                        fired += 1;
                    }
                }
            }
        }
        Ok(fired)
    }
}
