// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The two socket-shaped interfaces every transport and protocol adapter
//! implements, and the iolist representation used to move data without
//! an intermediate copy.
//!
//! The reference design's iolist is an intrusive cyclic linked list with a
//! reserved "last fragment" bit. Rust's slice-of-`IoSlice` already expresses
//! "an ordered, non-owning run of buffer fragments" without unsafe pointer
//! cycles, so that is what is used here instead.

use crate::{fail::Fail, timer::Deadline};
use std::{
    future::Future,
    io::{IoSlice, IoSliceMut},
    pin::Pin,
};

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Fail>> + 'a>>;
pub type RecvFuture<'a> = Pin<Box<dyn Future<Output = Result<usize, Fail>> + 'a>>;

/// Byte-oriented transfer: `send`/`recv` move an exact number of bytes with
/// no message boundary. A single I/O error on either direction is sticky --
/// every subsequent call returns [`Fail::ConnectionReset`]: an "all or
/// nothing" guarantee where a partial transfer is never reported as success.
pub trait ByteStream {
    fn send<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a>;
    fn recv<'a>(&'a mut self, iov: &'a mut [IoSliceMut<'a>], deadline: Deadline) -> RecvFuture<'a>;
}

/// Message-oriented transfer: one call sends or receives exactly one
/// message. A receive buffer too small for the pending message fails with
/// [`Fail::MessageTooLong`] and discards the message rather than splitting
/// it across calls.
pub trait Message {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a>;
    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a>;
}

/// Total length of an iolist, as used by adapters that need to know a
/// message's size before framing it (e.g. `prefix`, `http`).
pub fn iolist_len(iov: &[IoSlice]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

pub fn iolist_len_mut(iov: &[IoSliceMut]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

/// Copies up to `buf.len()` bytes into `iov`'s fragments in order, returning
/// the number of bytes copied (less than `buf.len()` iff `iov` has less
/// total capacity).
pub fn copy_into_iov(iov: &mut [IoSliceMut], mut buf: &[u8]) -> usize {
    let mut copied = 0;
    for slice in iov.iter_mut() {
        if buf.is_empty() {
            break;
        }
        let n = slice.len().min(buf.len());
        slice[..n].copy_from_slice(&buf[..n]);
        buf = &buf[n..];
        copied += n;
    }
    copied
}

/// Flattens an iolist into an owned buffer. Used by message-oriented
/// adapters (e.g. `ws`, `socks5`) that must frame a whole message at once.
pub fn flatten(iov: &[IoSlice]) -> Vec<u8> {
    let mut out = Vec::with_capacity(iolist_len(iov));
    for slice in iov {
        out.extend_from_slice(slice);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_concatenates_fragments() {
        let a = IoSlice::new(b"hello, ");
        let b = IoSlice::new(b"world");
        assert_eq!(flatten(&[a, b]), b"hello, world");
    }

    #[test]
    fn copy_into_iov_stops_at_capacity() {
        let mut a = [0u8; 3];
        let mut b = [0u8; 3];
        let mut iov = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        let copied = copy_into_iov(&mut iov, b"hello!");
        assert_eq!(copied, 6);
        assert_eq!(&a, b"hel");
        assert_eq!(&b, b"lo!");
    }
}
