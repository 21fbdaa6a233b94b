// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `crlf`: the `suffix` adapter specialized to a `\r\n` delimiter, the line
//! framing most text protocols (HTTP header lines among them) are built on.
//! Unlike a generic delimiter, CRLF framing also rejects a body that embeds
//! the delimiter itself -- an embedded CRLF is how header-injection and
//! request-smuggling bugs get into text protocols in the first place -- and
//! treats an empty line as the peer hanging up rather than as a zero-length
//! message, since a bare `\r\n` to this day is how an aborted connection
//! over this framing announces itself.

use crate::{
    fail::Fail,
    proto::suffix::SuffixSocket,
    sock::{flatten, ByteStream, Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use std::io::{IoSlice, IoSliceMut};

pub struct CrlfSocket<S> {
    inner: SuffixSocket<S>,
}

impl<S: ByteStream> CrlfSocket<S> {
    pub fn new(inner: S, max_msg_len: usize) -> Self {
        Self {
            inner: SuffixSocket::new(inner, b"\r\n".to_vec(), max_msg_len),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S> crate::handle::Donable for CrlfSocket<S> {}

fn contains_crlf(body: &[u8]) -> bool {
    body.windows(2).any(|w| w == b"\r\n")
}

impl<S: ByteStream> Message for CrlfSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            let body = flatten(iov);
            if contains_crlf(&body) {
                return Err(Fail::Invalid {
                    details: "message body must not contain an embedded CRLF",
                });
            }
            self.inner.send_msg(&[IoSlice::new(&body)], deadline).await
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            let n = self.inner.recv_msg(iov, deadline).await?;
            if n == 0 {
                return Err(Fail::ConnectionAborted);
            }
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn crlf_roundtrip_over_tcp() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = CrlfSocket::new(stream, 64);
                let mut buf = [0u8; 32];
                let n = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"GET / HTTP/1.1");
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = CrlfSocket::new(client_stream, 64);
            client
                .send_msg(&[IoSlice::new(b"GET / HTTP/1.1")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn embedded_crlf_is_rejected() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let _ = listener.accept(None).await.unwrap();
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = CrlfSocket::new(client_stream, 64);
            let err = client
                .send_msg(&[IoSlice::new(b"X-Evil: 1\r\nX-Injected: 2")], None)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                Fail::Invalid {
                    details: "message body must not contain an embedded CRLF"
                }
            );
            server.wait().await;
        });
    }

    #[test]
    fn blank_line_is_connection_aborted() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = CrlfSocket::new(stream, 64);
                let mut buf = [0u8; 32];
                let err = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap_err();
                assert_eq!(err, Fail::ConnectionAborted);
            });
            let mut client_stream = TcpStream::connect(addr, None).await.unwrap();
            client_stream
                .send(&[IoSlice::new(b"\r\n")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }
}
