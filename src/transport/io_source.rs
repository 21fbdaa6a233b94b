// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared plumbing for registering a `mio` source with the scheduler's
//! [`Poller`] and turning `WouldBlock` into a parked, wakeable future. Every
//! transport (`tcp`, `udp`, `ipc`) is a thin wrapper around this.

use crate::poll::Poller;
use mio::event::Source;
use std::{
    io::{self, ErrorKind},
    task::{Context, Poll},
};

pub struct Registered<S: Source> {
    poller: Poller,
    token: mio::Token,
    source: S,
}

impl<S: Source> Registered<S> {
    pub fn new(poller: Poller, mut source: S) -> io::Result<Self> {
        let token = poller.register(&mut source)?;
        Ok(Self {
            poller,
            token,
            source,
        })
    }

    pub fn get(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Runs `op` against the underlying source; if it would block, arms the
    /// read waker and returns `Pending`.
    pub fn poll_read<T>(
        &mut self,
        cx: &mut Context,
        mut op: impl FnMut(&mut S) -> io::Result<T>,
    ) -> Poll<io::Result<T>> {
        match op(&mut self.source) {
            Ok(v) => Poll::Ready(Ok(v)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.poller.want_read(self.token, &mut self.source, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    pub fn poll_write<T>(
        &mut self,
        cx: &mut Context,
        mut op: impl FnMut(&mut S) -> io::Result<T>,
    ) -> Poll<io::Result<T>> {
        match op(&mut self.source) {
            Ok(v) => Poll::Ready(Ok(v)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.poller.want_write(self.token, &mut self.source, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    /// Arms the read waker unconditionally and returns `Pending`, without
    /// attempting any I/O. Used by callers (e.g. TLS) that drive the
    /// underlying source with their own synchronous, non-blocking calls and
    /// only need this crate's fd-readiness wakeups.
    pub fn poll_readable(&mut self, cx: &mut Context) -> Poll<()> {
        self.poller.want_read(self.token, &mut self.source, cx.waker().clone());
        Poll::Pending
    }

    pub fn poll_writable(&mut self, cx: &mut Context) -> Poll<()> {
        self.poller.want_write(self.token, &mut self.source, cx.waker().clone());
        Poll::Pending
    }
}

impl<S: Source> Drop for Registered<S> {
    fn drop(&mut self) {
        let _ = self.poller.deregister(self.token, &mut self.source);
    }
}
