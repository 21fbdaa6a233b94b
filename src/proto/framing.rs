// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared helpers for the byte-stream-to-message adapters (`prefix`,
//! `suffix`, `crlf`, `term`): reading an exact byte count, and reading up to
//! a delimiter, both built on [`ByteStream::recv`].

use crate::{fail::Fail, sock::ByteStream, timer::Deadline};
use std::io::{IoSlice, IoSliceMut};

/// Reads exactly `buf.len()` bytes from `stream`, looping over short reads.
/// A clean peer close before `buf` fills is reported as
/// [`Fail::ConnectionAborted`] (EPIPE), matching the done-channel contract
/// the rest of the crate uses for orderly shutdown.
pub async fn read_exact(
    stream: &mut dyn ByteStream,
    buf: &mut [u8],
    deadline: Deadline,
) -> Result<(), Fail> {
    let mut filled = 0;
    while filled < buf.len() {
        let mut iov = [IoSliceMut::new(&mut buf[filled..])];
        let n = stream.recv(&mut iov, deadline).await?;
        if n == 0 {
            return Err(Fail::ConnectionAborted);
        }
        filled += n;
    }
    Ok(())
}

pub async fn write_all(
    stream: &mut dyn ByteStream,
    buf: &[u8],
    deadline: Deadline,
) -> Result<(), Fail> {
    stream.send(&[IoSlice::new(buf)], deadline).await
}

/// Reads one byte at a time until `delim` is seen -- framing is rare enough
/// on the wire that byte-at-a-time reads are not the bottleneck adapters
/// need to optimize. Returns the message with the delimiter stripped.
pub async fn read_until(
    stream: &mut dyn ByteStream,
    delim: &[u8],
    max_len: usize,
    deadline: Deadline,
) -> Result<Vec<u8>, Fail> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let mut iov = [IoSliceMut::new(&mut byte)];
        let n = stream.recv(&mut iov, deadline).await?;
        if n == 0 {
            return Err(Fail::ConnectionAborted);
        }
        out.push(byte[0]);
        if out.len() >= delim.len() && &out[out.len() - delim.len()..] == delim {
            out.truncate(out.len() - delim.len());
            return Ok(out);
        }
        if out.len() > max_len {
            return Err(Fail::MessageTooLong {
                details: "delimiter not found within the maximum message length",
            });
        }
    }
}
