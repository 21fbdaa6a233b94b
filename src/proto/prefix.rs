// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `prefix`: turns a byte stream into a message stream by prepending each
//! message with a configurable-width, big- or little-endian length header.

use crate::{
    fail::Fail,
    proto::framing::{read_exact, write_all},
    sock::{flatten, iolist_len, Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::{IoSlice, IoSliceMut};

/// Header byte order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endian {
    Big,
    Little,
}

pub struct PrefixSocket<S> {
    inner: S,
    max_msg_len: usize,
    width: usize,
    endian: Endian,
}

impl<S: crate::sock::ByteStream> PrefixSocket<S> {
    /// `width` is the header's length in bytes, 1 through 8. Fails with
    /// `Fail::Invalid` if `width` is out of range, or if `max_msg_len`
    /// cannot be represented in `width` bytes.
    pub fn new(inner: S, max_msg_len: usize, width: usize, endian: Endian) -> Result<Self, Fail> {
        if width == 0 || width > 8 {
            return Err(Fail::Invalid {
                details: "prefix header width must be between 1 and 8 bytes",
            });
        }
        if width < 8 && (max_msg_len as u64) > (1u64 << (width * 8)) - 1 {
            return Err(Fail::Invalid {
                details: "maximum message length does not fit in the configured header width",
            });
        }
        Ok(Self {
            inner,
            max_msg_len,
            width,
            endian,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn write_header(&self, buf: &mut [u8], len: u64) {
        match self.endian {
            Endian::Big => BigEndian::write_uint(buf, len, self.width),
            Endian::Little => LittleEndian::write_uint(buf, len, self.width),
        }
    }

    fn read_header(&self, buf: &[u8]) -> u64 {
        match self.endian {
            Endian::Big => BigEndian::read_uint(buf, self.width),
            Endian::Little => LittleEndian::read_uint(buf, self.width),
        }
    }
}

impl<S> crate::handle::Donable for PrefixSocket<S> {}

impl<S: crate::sock::ByteStream> Message for PrefixSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            let len = iolist_len(iov);
            if len > self.max_msg_len {
                return Err(Fail::MessageTooLong {
                    details: "message exceeds the configured maximum",
                });
            }
            let mut header = [0u8; 8];
            self.write_header(&mut header[..self.width], len as u64);
            write_all(&mut self.inner, &header[..self.width], deadline).await?;
            let body = flatten(iov);
            write_all(&mut self.inner, &body, deadline).await
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            let mut header = [0u8; 8];
            read_exact(&mut self.inner, &mut header[..self.width], deadline).await?;
            let len = self.read_header(&header[..self.width]) as usize;
            if len > self.max_msg_len {
                return Err(Fail::MessageTooLong {
                    details: "peer announced a message exceeding the configured maximum",
                });
            }
            let mut body = vec![0u8; len];
            read_exact(&mut self.inner, &mut body, deadline).await?;
            let cap: usize = iov.iter().map(|s| s.len()).sum();
            if len > cap {
                return Err(Fail::MessageTooLong {
                    details: "message is larger than the caller's receive buffer",
                });
            }
            Ok(crate::sock::copy_into_iov(iov, &body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn framed_roundtrip_over_tcp() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = PrefixSocket::new(stream, 1 << 20, 4, Endian::Big).unwrap();
                let mut buf = [0u8; 32];
                let n = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"hello");
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = PrefixSocket::new(client_stream, 1 << 20, 4, Endian::Big).unwrap();
            client
                .send_msg(&[IoSlice::new(b"hello")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn framed_roundtrip_with_one_byte_big_endian_header() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = PrefixSocket::new(stream, 255, 1, Endian::Big).unwrap();
                let mut buf = [0u8; 32];
                let n = sock
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"hi");
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = PrefixSocket::new(client_stream, 255, 1, Endian::Big).unwrap();
            client
                .send_msg(&[IoSlice::new(b"hi")], None)
                .await
                .unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn width_and_capacity_are_validated() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let _ = listener.accept(None).await.unwrap();
            });
            let stream = TcpStream::connect(addr, None).await.unwrap();
            assert!(PrefixSocket::new(stream, 1 << 20, 9, Endian::Big).is_err());

            let mut listener2 = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr2 = listener2.local_addr().unwrap();
            let server2 = crate::sched::go(async move {
                let _ = listener2.accept(None).await.unwrap();
            });
            let stream2 = TcpStream::connect(addr2, None).await.unwrap();
            assert!(PrefixSocket::new(stream2, 1 << 20, 1, Endian::Big).is_err());

            server.wait().await;
            server2.wait().await;
        });
    }
}
