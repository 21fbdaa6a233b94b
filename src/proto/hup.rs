// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `hup`: [`crate::proto::term::TermSocket`]'s sibling for peers that may
//! never send anything at all. `detach` only performs the terminator
//! handshake if this side ever actually sent a message; a connection that
//! was silent start to finish is handed back to its caller with no
//! terminator sent, rather than forcing one last round-trip a peer that
//! never spoke has no reason to expect.

use crate::{
    fail::Fail,
    handle::{Donable, DoneFuture},
    sock::{Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use std::io::{IoSlice, IoSliceMut};

pub use crate::proto::term::DEFAULT_TERMINATOR;

pub struct HupSocket<S> {
    inner: S,
    terminator: Vec<u8>,
    sent: bool,
    out_done: bool,
    in_done: bool,
}

impl<S: Message> HupSocket<S> {
    pub fn new(inner: S) -> Self {
        Self::with_terminator(inner, DEFAULT_TERMINATOR.to_vec())
    }

    pub fn with_terminator(inner: S, terminator: Vec<u8>) -> Self {
        Self {
            inner,
            terminator,
            sent: false,
            out_done: false,
            in_done: false,
        }
    }

    /// Sends the terminator message. Fails with `Fail::ConnectionAborted`
    /// if it was already sent.
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

    /// Unwraps back to the underlying socket. Sends the terminator first,
    /// but only if this side ever sent a (non-terminator) message over it;
    /// a side that was silent the whole time skips the handshake entirely.
    pub async fn detach(mut self, deadline: Deadline) -> Result<S, Fail> {
        if self.sent && !self.out_done {
            self.done(deadline).await?;
        }
        Ok(self.inner)
    }

    pub fn peer_terminated(&self) -> bool {
        self.in_done
    }
}

impl<S: Message> Donable for HupSocket<S> {
    fn done<'a>(&'a mut self, deadline: Deadline) -> DoneFuture<'a> {
        Box::pin(HupSocket::done(self, deadline))
    }
}

impl<S: Message> Message for HupSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            if self.out_done {
                return Err(Fail::ConnectionAborted);
            }
            self.inner.send_msg(iov, deadline).await?;
            self.sent = true;
            Ok(())
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            if self.in_done {
                return Err(Fail::ConnectionAborted);
            }
            let n = self.inner.recv_msg(iov, deadline).await?;
            let received = iov_total(iov);
            let received = &received[..n.min(self.terminator.len())];
            if n == self.terminator.len() && received == self.terminator.as_slice() {
                self.in_done = true;
                return Err(Fail::ConnectionAborted);
            }
            Ok(n)
        })
    }
}

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
    fn silent_detach_sends_no_terminator() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let framed = PrefixSocket::new(stream, 1 << 16, 4, Endian::Big).unwrap();
                let mut hup = HupSocket::new(framed);
                let mut buf = [0u8; 16];
                // If detach had sent a terminator first, this would be it
                // instead of the raw message sent below.
                let n = hup
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"raw ping");
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let framed = PrefixSocket::new(client_stream, 1 << 16, 4, Endian::Big).unwrap();
            let client = HupSocket::new(framed);
            // Never sent anything, so detach performs no I/O at all.
            let mut raw = client.detach(None).await.unwrap();
            raw.send_msg(&[IoSlice::new(b"raw ping")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn sent_then_detach_emits_terminator() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let framed = PrefixSocket::new(stream, 1 << 16, 4, Endian::Big).unwrap();
                let mut hup = HupSocket::new(framed);
                hup.send_msg(&[IoSlice::new(b"ping")], None).await.unwrap();
                let _ = hup.detach(None).await.unwrap();
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let framed = PrefixSocket::new(client_stream, 1 << 16, 4, Endian::Big).unwrap();
            let mut client = HupSocket::new(framed);
            let mut buf = [0u8; 16];
            let n = client
                .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                .await
                .unwrap();
            assert_eq!(&buf[..n], b"ping");
            let err = client
                .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                .await
                .unwrap_err();
            assert_eq!(err, Fail::ConnectionAborted);
            assert!(client.peer_terminated());
            server.wait().await;
        });
    }
}
