// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! IPC transport: Unix domain stream sockets, byte-oriented like TCP but
//! addressed by filesystem path rather than `SocketAddr`.

use crate::{
    fail::Fail,
    handle::Donable,
    sched::current_poller,
    sock::{ByteStream, RecvFuture, SendFuture},
    timer::Deadline,
    transport::io_source::Registered,
};
use std::{
    future::Future,
    io::{self, IoSlice, IoSliceMut, Read, Write},
    mem,
    os::unix::io::{AsRawFd, FromRawFd, RawFd},
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

pub struct IpcStream {
    inner: Registered<mio::net::UnixStream>,
    failed: bool,
}

impl IpcStream {
    fn from_mio(stream: mio::net::UnixStream) -> Result<Self, Fail> {
        Ok(Self {
            inner: Registered::new(current_poller(), stream).map_err(Fail::from)?,
            failed: false,
        })
    }

    pub async fn connect(path: impl AsRef<Path>, deadline: Deadline) -> Result<Self, Fail> {
        let _ = deadline;
        let mio_stream = mio::net::UnixStream::connect(path).map_err(Fail::from)?;
        Self::from_mio(mio_stream)
    }

    /// Sends `payload` plus one open file descriptor to the peer in a
    /// single `SCM_RIGHTS` control message. Used by [`crate::proto::tcpmux`]
    /// to hand a client's connection off to the registered backend without
    /// ever relaying its bytes.
    pub async fn send_fd(&mut self, payload: &[u8], fd: RawFd, deadline: Deadline) -> Result<(), Fail> {
        SendFdFuture { stream: self, payload, fd, deadline }.await
    }

    /// Receives a payload plus, if the peer sent one, a file descriptor
    /// duplicated into this process.
    pub async fn recv_fd(
        &mut self,
        buf: &mut [u8],
        deadline: Deadline,
    ) -> Result<(usize, Option<RawFd>), Fail> {
        RecvFdFuture { stream: self, buf, deadline }.await
    }

    /// Takes ownership of an already-open, already-connected socket fd --
    /// typically one just received via [`IpcStream::recv_fd`] -- and wraps
    /// it the same way an accepted or dialed connection would be.
    ///
    /// # Safety
    /// `fd` must be an open, valid socket descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, Fail> {
        let std_stream = std::os::unix::net::UnixStream::from_raw_fd(fd);
        std_stream.set_nonblocking(true).map_err(Fail::from)?;
        Self::from_mio(mio::net::UnixStream::from_std(std_stream))
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get().as_raw_fd()
    }
}

impl Donable for IpcStream {}

/// Enough room for one `SCM_RIGHTS` message carrying a single fd.
fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }
}

fn sendmsg_fd(sockfd: RawFd, payload: &[u8], fd: RawFd) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut cmsg_buf = vec![0u8; cmsg_space()];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        let n = libc::sendmsg(sockfd, &msg, 0);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

fn recvmsg_fd(sockfd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut cmsg_buf = vec![0u8; cmsg_space()];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;
        let n = libc::recvmsg(sockfd, &mut msg, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut received_fd = None;
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null() && (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            received_fd = Some(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd));
        }
        Ok((n as usize, received_fd))
    }
}

struct SendFdFuture<'a> {
    stream: &'a mut IpcStream,
    payload: &'a [u8],
    fd: RawFd,
    deadline: Deadline,
}

impl<'a> Future for SendFdFuture<'a> {
    type Output = Result<(), Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let payload = this.payload;
        let fd = this.fd;
        match this.stream.inner.poll_write(cx, |s| sendmsg_fd(s.as_raw_fd(), payload, fd)) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct RecvFdFuture<'a> {
    stream: &'a mut IpcStream,
    buf: &'a mut [u8],
    deadline: Deadline,
}

impl<'a> Future for RecvFdFuture<'a> {
    type Output = Result<(usize, Option<RawFd>), Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(usize, Option<RawFd>), Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let buf = &mut *this.buf;
        this.stream.inner.poll_read(cx, |s| recvmsg_fd(s.as_raw_fd(), buf)).map_err_fail()
    }
}

impl ByteStream for IpcStream {
    fn send<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            if self.failed {
                return Err(Fail::ConnectionReset);
            }
            let total: usize = iov.iter().map(|s| s.len()).sum();
            let flat = crate::sock::flatten(iov);
            let mut sent = 0usize;
            while sent < total {
                let chunk = [IoSlice::new(&flat[sent..])];
                let n = WriteSome {
                    stream: &mut *self,
                    iov: &chunk,
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
            ReadSome {
                stream: self,
                iov,
                deadline,
            }
            .await
        })
    }
}

struct WriteSome<'a, 'b> {
    stream: &'a mut IpcStream,
    iov: &'a [IoSlice<'b>],
    deadline: Deadline,
}

impl<'a, 'b> Future for WriteSome<'a, 'b> {
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
            .map_err_fail()
    }
}

struct ReadSome<'a, 'b> {
    stream: &'a mut IpcStream,
    iov: &'a mut [IoSliceMut<'b>],
    deadline: Deadline,
}

impl<'a, 'b> Future for ReadSome<'a, 'b> {
    type Output = Result<usize, Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<usize, Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        let iov = &mut *this.iov;
        match this.stream.inner.poll_read(cx, |s| s.read_vectored(iov)) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => {
                this.stream.failed = true;
                Poll::Ready(Err(e.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

trait PollIoExt<T> {
    fn map_err_fail(self) -> Poll<Result<T, Fail>>;
}

impl<T> PollIoExt<T> for Poll<std::io::Result<T>> {
    fn map_err_fail(self) -> Poll<Result<T, Fail>> {
        match self {
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(v)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct IpcListener {
    inner: Registered<mio::net::UnixListener>,
}

impl IpcListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, Fail> {
        let listener = mio::net::UnixListener::bind(path).map_err(Fail::from)?;
        Ok(Self {
            inner: Registered::new(current_poller(), listener).map_err(Fail::from)?,
        })
    }

    pub async fn accept(&mut self, deadline: Deadline) -> Result<IpcStream, Fail> {
        AcceptFuture {
            listener: self,
            deadline,
        }
        .await
    }
}

struct AcceptFuture<'a> {
    listener: &'a mut IpcListener,
    deadline: Deadline,
}

impl<'a> Future for AcceptFuture<'a> {
    type Output = Result<IpcStream, Fail>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<IpcStream, Fail>> {
        if crate::sched::current_cancel().is_cancelled() {
            return Poll::Ready(Err(Fail::Cancelled));
        }
        if crate::timer::is_due(self.deadline, std::time::Instant::now()) {
            return Poll::Ready(Err(Fail::Timedout));
        }
        let this = self.get_mut();
        match this.listener.inner.poll_read(cx, |l| l.accept().map(|(s, _)| s)) {
            Poll::Ready(Ok(stream)) => Poll::Ready(IpcStream::from_mio(stream)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
