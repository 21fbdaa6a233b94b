// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `term`: layers a graceful termination handshake on top of an inner
//! [`Message`] socket. A designated terminator message marks "no more
//! messages coming"; seeing one on `recv_msg` is reported the same way as
//! the peer closing the connection ([`Fail::ConnectionAborted`]), but an
//! abrupt close *without* ever seeing the terminator -- a bare hangup -- is
//! distinguished by surfacing the inner transport's own error instead of
//! synthesizing one.

use crate::{
    fail::Fail,
    handle::{Donable, DoneFuture},
    sock::{Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use std::io::{IoSlice, IoSliceMut};

/// Default terminator: a single `0xFF` byte, used when the caller doesn't
/// supply its own.
pub const DEFAULT_TERMINATOR: &[u8] = &[0xFF];

pub struct TermSocket<S> {
    inner: S,
    terminator: Vec<u8>,
    out_done: bool,
    peer_terminated: bool,
}

impl<S: Message> TermSocket<S> {
    pub fn new(inner: S) -> Self {
        Self::with_terminator(inner, DEFAULT_TERMINATOR.to_vec())
    }

    pub fn with_terminator(inner: S, terminator: Vec<u8>) -> Self {
        Self {
            inner,
            terminator,
            out_done: false,
            peer_terminated: false,
        }
    }

    /// Sends the terminator message. The caller is still free to close the
    /// underlying transport afterwards; `done` only performs the protocol
    /// handshake, not the socket teardown. Fails with
    /// `Fail::ConnectionAborted` if the terminator was already sent.
    pub async fn done(&mut self, deadline: Deadline) -> Result<(), Fail> {
        if self.out_done {
            return Err(Fail::ConnectionAborted);
        }
        let terminator = self.terminator.clone();
        self.inner
            .send_msg(&[IoSlice::new(&terminator)], deadline)
            .await?;
        self.out_done = true;
        Ok(())
    }

    /// True once a terminator message has been received from the peer --
    /// a graceful hangup, as opposed to the connection simply dropping.
    pub fn peer_terminated(&self) -> bool {
        self.peer_terminated
    }

    /// Unwraps back to the underlying socket: sends our own terminator if
    /// it hasn't gone out yet, then drains and discards inbound messages
    /// until the peer's terminator arrives (or an error does).
    pub async fn detach(mut self, deadline: Deadline) -> Result<S, Fail> {
        if !self.out_done {
            self.done(deadline).await?;
        }
        if !self.peer_terminated {
            loop {
                let mut buf = [0u8; 256];
                match self
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], deadline)
                    .await
                {
                    Ok(_) => continue,
                    Err(Fail::ConnectionAborted) if self.peer_terminated => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(self.inner)
    }
}

impl<S: Message> Donable for TermSocket<S> {
    fn done<'a>(&'a mut self, deadline: Deadline) -> DoneFuture<'a> {
        Box::pin(TermSocket::done(self, deadline))
    }
}

impl<S: Message> Message for TermSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        self.inner.send_msg(iov, deadline)
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            let n = self.inner.recv_msg(iov, deadline).await?;
            let received = &iov_total(iov)[..n.min(self.terminator.len())];
            if n == self.terminator.len() && received == self.terminator.as_slice() {
                self.peer_terminated = true;
                return Err(Fail::ConnectionAborted);
            }
            Ok(n)
        })
    }
}

/// Helper to peek at the bytes `recv_msg` just wrote into `iov` without
/// requiring the caller's buffer be contiguous; only used for the (short)
/// terminator comparison above, so flattening is cheap.
fn iov_total(iov: &[IoSliceMut]) -> Vec<u8> {
    let mut out = Vec::new();
    for slice in iov {
        out.extend_from_slice(slice);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::prefix::{Endian, PrefixSocket};
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn terminator_is_reported_as_connection_aborted() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = TermSocket::new(PrefixSocket::new(stream, 1 << 16, 4, Endian::Big).unwrap());
                let mut buf = [0u8; 16];
                let err = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap_err();
                assert_eq!(err, Fail::ConnectionAborted);
                assert!(sock.peer_terminated());
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = TermSocket::new(PrefixSocket::new(client_stream, 1 << 16, 4, Endian::Big).unwrap());
            client.done(None).await.unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn detach_exchanges_terminators_both_ways() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let sock = TermSocket::new(PrefixSocket::new(stream, 1 << 16, 4, Endian::Big).unwrap());
                let raw = sock.detach(None).await.unwrap();
                raw.into_inner();
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let client = TermSocket::new(PrefixSocket::new(client_stream, 1 << 16, 4, Endian::Big).unwrap());
            let raw = client.detach(None).await.unwrap();
            raw.into_inner();
            server.wait().await;
        });
    }
}
