// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! UDP transport: message-oriented, one packet per `send_msg`/`recv_msg`.

use crate::{
    fail::Fail,
    handle::Donable,
    sched::current_poller,
    sock::{Message, RecvFuture, SendFuture},
    timer::Deadline,
    transport::io_source::Registered,
};
use std::{
    future::Future,
    io::{self, IoSlice, IoSliceMut},
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

pub struct UdpSocket {
    inner: Registered<mio::net::UdpSocket>,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self, Fail> {
        let socket = mio::net::UdpSocket::bind(addr).map_err(Fail::from)?;
        Ok(Self {
            inner: Registered::new(current_poller(), socket).map_err(Fail::from)?,
        })
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<(), Fail> {
        self.inner.get().connect(addr).map_err(Fail::from)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get().local_addr()
    }
}

impl Donable for UdpSocket {}

impl Message for UdpSocket {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(SendMsg {
            socket: self,
            buf: crate::sock::flatten(iov),
            deadline,
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(RecvMsg {
            socket: self,
            iov,
            deadline,
        })
    }
}

struct SendMsg<'a> {
    socket: &'a mut UdpSocket,
    buf: Vec<u8>,
    deadline: Deadline,
}

impl<'a> Future for SendMsg<'a> {
    type Output = Result<(), Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let buf = &this.buf;
        match this.socket.inner.poll_write(cx, |s| s.send(buf)) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One UDP `recv` call is one message: if `iov`'s total capacity is
/// smaller than the datagram, the kernel truncates it and we report
/// [`Fail::MessageTooLong`] rather than pretend a truncated read succeeded.
struct RecvMsg<'a> {
    socket: &'a mut UdpSocket,
    iov: &'a mut [IoSliceMut<'a>],
    deadline: Deadline,
}

impl<'a> Future for RecvMsg<'a> {
    type Output = Result<usize, Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<usize, Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let cap: usize = this.iov.iter().map(|s| s.len()).sum();
        let mut scratch = vec![0u8; cap + 1];
        let poll = this.socket.inner.poll_read(cx, |s| s.recv(&mut scratch));
        match poll {
            Poll::Ready(Ok(n)) => {
                if n > cap {
                    return Poll::Ready(Err(Fail::MessageTooLong {
                        details: "datagram larger than the receive buffer",
                    }));
                }
                let copied = crate::sock::copy_into_iov(this.iov, &scratch[..n]);
                Poll::Ready(Ok(copied))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;

    #[test]
    fn send_recv_roundtrip() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut a = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let mut b = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let b_addr = b.local_addr().unwrap();
            a.connect(b_addr).unwrap();
            let a_addr = a.local_addr().unwrap();
            b.connect(a_addr).unwrap();
            a.send_msg(&[IoSlice::new(b"hi")], None).await.unwrap();
            let mut buf = [0u8; 16];
            let n = b
                .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                .await
                .unwrap();
            assert_eq!(&buf[..n], b"hi");
        });
    }
}
