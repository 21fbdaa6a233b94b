// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TCP transport: a connected stream is a [`ByteStream`]; listening accepts
//! connected streams. Both are thin `mio::net` wrappers registered with the
//! scheduler's poller through [`Registered`].

use crate::{
    fail::Fail,
    handle::{Donable, DoneFuture},
    sched::current_poller,
    sock::{ByteStream, RecvFuture, SendFuture},
    timer::Deadline,
    transport::io_source::Registered,
};
use std::{
    future::Future,
    io::{self, IoSlice, IoSliceMut, Read, Write},
    net::SocketAddr,
    os::unix::io::AsRawFd,
    pin::Pin,
    task::{Context, Poll},
};

pub struct TcpStream {
    inner: Registered<mio::net::TcpStream>,
    failed: bool,
    connecting: bool,
}

impl TcpStream {
    fn from_mio(stream: mio::net::TcpStream, connecting: bool) -> io::Result<Self> {
        Ok(Self {
            inner: Registered::new(current_poller(), stream)?,
            failed: false,
            connecting,
        })
    }

    pub async fn connect(addr: SocketAddr, deadline: Deadline) -> Result<Self, Fail> {
        let mio_stream = mio::net::TcpStream::connect(addr).map_err(Fail::from)?;
        let mut stream = Self::from_mio(mio_stream, true)?;
        ConnectFuture {
            stream: Some(&mut stream),
            deadline,
        }
        .await?;
        Ok(stream)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get().peer_addr()
    }

    /// Arms the read/write waker without performing any I/O. Used by
    /// adapters (TLS) that drive this stream with their own synchronous,
    /// non-blocking calls and only need this crate's readiness wakeups.
    pub(crate) fn poll_readable(&mut self, cx: &mut Context) -> Poll<()> {
        self.inner.poll_readable(cx)
    }

    pub(crate) fn poll_writable(&mut self, cx: &mut Context) -> Poll<()> {
        self.inner.poll_writable(cx)
    }

    /// Gracefully closes the connection: shuts down the write half (sending
    /// FIN), then drains and discards inbound bytes until the peer's own
    /// FIN arrives or `deadline` elapses. Distinct from [`Resource::close`],
    /// which must return immediately without waiting on the peer.
    pub async fn close(&mut self, deadline: Deadline) -> Result<(), Fail> {
        self.inner.get().shutdown(std::net::Shutdown::Write).map_err(Fail::from)?;
        let mut scratch = [0u8; 4096];
        loop {
            let n = RecvSome {
                stream: self,
                iov: &mut [IoSliceMut::new(&mut scratch)],
                deadline,
            }
            .await?;
            if n == 0 {
                return Ok(());
            }
        }
    }
}

impl std::os::unix::io::AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.inner.get().as_raw_fd()
    }
}

impl Donable for TcpStream {
    fn done<'a>(&'a mut self, deadline: Deadline) -> DoneFuture<'a> {
        Box::pin(TcpStream::close(self, deadline))
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.get_mut().read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

struct ConnectFuture<'a> {
    stream: Option<&'a mut TcpStream>,
    deadline: Deadline,
}

impl<'a> Future for ConnectFuture<'a> {
    type Output = Result<(), Fail>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let stream = self.stream.take().expect("polled after completion");
        let poll = stream.inner.poll_write(cx, |s| match s.take_error()? {
            Some(e) => Err(e),
            None => s.peer_addr().map(|_| ()),
        });
        match poll {
            Poll::Ready(Ok(())) => {
                stream.connecting = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                stream.failed = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => {
                self.stream = Some(stream);
                Poll::Pending
            }
        }
    }
}

impl ByteStream for TcpStream {
    fn send<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            if self.failed {
                return Err(Fail::ConnectionReset);
            }
            let total: usize = iov.iter().map(|s| s.len()).sum();
            let mut sent = 0usize;
            while sent < total {
                let remaining = subslice_iov(iov, sent);
                let n = SendAll {
                    stream: &mut *self,
                    iov: &remaining,
                    deadline,
                }
                .await
                .map_err(|e| {
                    self.failed = true;
                    e
                })?;
                sent += n;
            }
            Ok(())
        })
    }

    fn recv<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            if self.failed {
                return Err(Fail::ConnectionReset);
            }
            RecvSome {
                stream: self,
                iov,
                deadline,
            }
            .await
        })
    }
}

fn subslice_iov<'a>(iov: &'a [IoSlice<'a>], skip: usize) -> Vec<IoSlice<'a>> {
    let mut skip = skip;
    let mut out = Vec::new();
    for s in iov {
        if skip >= s.len() {
            skip -= s.len();
            continue;
        }
        out.push(IoSlice::new(&s[skip..]));
        skip = 0;
    }
    out
}

struct SendAll<'a, 'b> {
    stream: &'a mut TcpStream,
    iov: &'a [IoSlice<'b>],
    deadline: Deadline,
}

impl<'a, 'b> Future for SendAll<'a, 'b> {
    type Output = Result<usize, Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<usize, Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let iov = this.iov;
        this.stream
            .inner
            .poll_write(cx, |s| s.write_vectored(iov))
            .map_err(Fail::from)
    }
}

struct RecvSome<'a, 'b> {
    stream: &'a mut TcpStream,
    iov: &'a mut [IoSliceMut<'b>],
    deadline: Deadline,
}

impl<'a, 'b> Future for RecvSome<'a, 'b> {
    type Output = Result<usize, Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<usize, Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let stream = &mut this.stream;
        let iov = &mut *this.iov;
        let poll = stream.inner.poll_read(cx, |s| s.read_vectored(iov));
        match poll {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => {
                stream.failed = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TcpListener {
    inner: Registered<mio::net::TcpListener>,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> Result<Self, Fail> {
        let listener = mio::net::TcpListener::bind(addr).map_err(Fail::from)?;
        Ok(Self {
            inner: Registered::new(current_poller(), listener).map_err(Fail::from)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get().local_addr()
    }

    pub async fn accept(&mut self, deadline: Deadline) -> Result<(TcpStream, SocketAddr), Fail> {
        AcceptFuture {
            listener: self,
            deadline,
        }
        .await
    }
}

struct AcceptFuture<'a> {
    listener: &'a mut TcpListener,
    deadline: Deadline,
}

impl<'a> Future for AcceptFuture<'a> {
    type Output = Result<(TcpStream, SocketAddr), Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(TcpStream, SocketAddr), Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        match this.listener.inner.poll_read(cx, |l| l.accept()) {
            Poll::Ready(Ok((stream, addr))) => {
                match TcpStream::from_mio(stream, false) {
                    Ok(s) => Poll::Ready(Ok((s, addr))),
                    Err(e) => Poll::Ready(Err(e.into())),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{go, Scheduler};

    #[test]
    fn connect_accept_roundtrip() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = go(async move {
                let (mut stream, _) = listener.accept(None).await.unwrap();
                let buf = [1u8, 2, 3];
                stream
                    .send(&[IoSlice::new(&buf)], None)
                    .await
                    .unwrap();
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let mut buf = [0u8; 3];
            let n = client
                .recv(&mut [IoSliceMut::new(&mut buf)], None)
                .await
                .unwrap();
            assert_eq!(n, 3);
            assert_eq!(buf, [1, 2, 3]);
            server.wait().await;
        });
    }
}
