// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `suffix`: turns a byte stream into a message stream by terminating each
//! message with a caller-supplied delimiter, read back byte-at-a-time via
//! [`read_until`].

use crate::{
    fail::Fail,
    proto::framing::{read_until, write_all},
    sock::{copy_into_iov, flatten, iolist_len, Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use std::io::{IoSlice, IoSliceMut};

pub struct SuffixSocket<S> {
    inner: S,
    delim: Vec<u8>,
    max_msg_len: usize,
}

impl<S: crate::sock::ByteStream> SuffixSocket<S> {
    pub fn new(inner: S, delim: impl Into<Vec<u8>>, max_msg_len: usize) -> Self {
        Self {
            inner,
            delim: delim.into(),
            max_msg_len,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> crate::handle::Donable for SuffixSocket<S> {}

impl<S: crate::sock::ByteStream> Message for SuffixSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            if iolist_len(iov) > self.max_msg_len {
                return Err(Fail::MessageTooLong {
                    details: "message exceeds the configured maximum",
                });
            }
            let mut body = flatten(iov);
            body.extend_from_slice(&self.delim);
            write_all(&mut self.inner, &body, deadline).await
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            let body = read_until(&mut self.inner, &self.delim, self.max_msg_len, deadline).await?;
            let cap: usize = iov.iter().map(|s| s.len()).sum();
            if body.len() > cap {
                return Err(Fail::MessageTooLong {
                    details: "message is larger than the caller's receive buffer",
                });
            }
            Ok(copy_into_iov(iov, &body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn delimited_roundtrip_over_tcp() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = SuffixSocket::new(stream, b"\0".to_vec(), 64);
                let mut buf = [0u8; 32];
                let n = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"world");
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = SuffixSocket::new(client_stream, b"\0".to_vec(), 64);
            client
                .send_msg(&[IoSlice::new(b"world")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }
}
