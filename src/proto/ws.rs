// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `ws`/`wsraw`: RFC 6455 websockets. `ws` performs the HTTP upgrade
//! handshake before framing; `wsraw` skips straight to framing, for peers
//! that have already agreed out-of-band to speak websocket frames.
//!
//! Fragmented messages (a text/binary frame with `fin=0` followed by one or
//! more continuation frames) are reassembled transparently; `recv_msg` never
//! hands back a frame, only a complete message.

use crate::{
    fail::Fail,
    proto::http::HttpSocket,
    sock::{copy_into_iov, iolist_len, Message, RecvFuture, SendFuture},
    timer::Deadline,
};
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::io::{IoSlice, IoSliceMut};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Derives the `Sec-WebSocket-Accept` value a server sends back for a given
/// `Sec-WebSocket-Key` request header, per RFC 6455 section 1.3.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

/// Generates a fresh, random `Sec-WebSocket-Key` for a client handshake.
pub fn generate_client_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::encode(nonce)
}

/// Performs the client side of the websocket upgrade handshake over an
/// already-connected byte stream, returning a framed [`WsRawSocket`] ready
/// for message exchange.
pub async fn connect<S: crate::sock::ByteStream>(
    stream: S,
    host: &str,
    resource: &str,
    deadline: Deadline,
) -> Result<WsRawSocket<S>, Fail> {
    let mut http = HttpSocket::new(stream);
    let key = generate_client_key();
    http.send_request("GET", resource, deadline).await?;
    http.send_header("Host", host, deadline).await?;
    http.send_header("Upgrade", "websocket", deadline).await?;
    http.send_header("Connection", "Upgrade", deadline).await?;
    http.send_header("Sec-WebSocket-Key", &key, deadline).await?;
    http.send_header("Sec-WebSocket-Version", "13", deadline)
        .await?;
    http.end_headers(deadline).await?;

    let (code, _reason) = http.recv_status(deadline).await?;
    let headers = http.recv_headers(deadline).await?;
    if code != 101 {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    let accept = headers.get("Sec-WebSocket-Accept").ok_or(Fail::Protocol { details: "protocol violation" })?;
    if accept != compute_accept_key(&key) {
        return Err(Fail::Protocol { details: "protocol violation" });
    }
    Ok(WsRawSocket::new(http.into_inner(), true, 1 << 20))
}

/// Performs the server side of the handshake, returning a framed socket
/// once the upgrade response has been sent.
pub async fn accept<S: crate::sock::ByteStream>(
    stream: S,
    deadline: Deadline,
) -> Result<WsRawSocket<S>, Fail> {
    let mut http = HttpSocket::new(stream);
    let (_method, _resource) = http.recv_request(deadline).await?;
    let headers = http.recv_headers(deadline).await?;
    let client_key = headers
        .get("Sec-WebSocket-Key")
        .ok_or(Fail::Protocol { details: "protocol violation" })?
        .to_string();
    let accept_key = compute_accept_key(&client_key);

    http.send_status(101, "Switching Protocols", deadline)
        .await?;
    http.send_header("Upgrade", "websocket", deadline).await?;
    http.send_header("Connection", "Upgrade", deadline).await?;
    http.send_header("Sec-WebSocket-Accept", &accept_key, deadline)
        .await?;
    http.end_headers(deadline).await?;

    Ok(WsRawSocket::new(http.into_inner(), false, 1 << 20))
}

/// Frame-level websocket socket with no handshake of its own -- the `wsraw`
/// adapter. `ws` (above) layers the HTTP upgrade on top of this.
pub struct WsRawSocket<S> {
    inner: S,
    is_client: bool,
    max_frame_len: usize,
}

impl<S> crate::handle::Donable for WsRawSocket<S> {}

impl<S: crate::sock::ByteStream> WsRawSocket<S> {
    pub fn new(inner: S, is_client: bool, max_frame_len: usize) -> Self {
        Self {
            inner,
            is_client,
            max_frame_len,
        }
    }

    async fn write_frame(&mut self, opcode: u8, payload: &[u8], deadline: Deadline) -> Result<(), Fail> {
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(0x80 | opcode);
        let mask_bit = if self.is_client { 0x80 } else { 0x00 };
        let len = payload.len();
        if len < 126 {
            frame.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(mask_bit | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        if self.is_client {
            let mut mask = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut mask);
            frame.extend_from_slice(&mask);
            let start = frame.len();
            frame.extend_from_slice(payload);
            for (i, byte) in frame[start..].iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        } else {
            frame.extend_from_slice(payload);
        }
        self.inner.send(&[IoSlice::new(&frame)], deadline).await
    }

    async fn read_exact_bytes(&mut self, n: usize, deadline: Deadline) -> Result<Vec<u8>, Fail> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let mut iov = [IoSliceMut::new(&mut buf[filled..])];
            let got = self.inner.recv(&mut iov, deadline).await?;
            if got == 0 {
                return Err(Fail::ConnectionAborted);
            }
            filled += got;
        }
        Ok(buf)
    }

    /// Reads a single frame header plus payload off the wire, applying the
    /// mask if present. Does not interpret the opcode.
    async fn read_raw_frame(&mut self, deadline: Deadline) -> Result<(bool, u8, Vec<u8>), Fail> {
        let header = self.read_exact_bytes(2, deadline).await?;
        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        let masked = header[1] & 0x80 != 0;
        let mut len = (header[1] & 0x7F) as usize;
        if len == 126 {
            let ext = self.read_exact_bytes(2, deadline).await?;
            len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
        } else if len == 127 {
            let ext = self.read_exact_bytes(8, deadline).await?;
            len = u64::from_be_bytes(ext.try_into().unwrap()) as usize;
        }
        if len > self.max_frame_len {
            return Err(Fail::MessageTooLong {
                details: "websocket frame exceeds the configured maximum",
            });
        }
        let mask = if masked {
            Some(self.read_exact_bytes(4, deadline).await?)
        } else {
            None
        };
        let mut payload = self.read_exact_bytes(len, deadline).await?;
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }
        Ok((fin, opcode, payload))
    }

    /// Reads frames until a complete message is assembled, auto-replying to
    /// pings with pongs and surfacing a close frame as
    /// [`Fail::ConnectionAborted`]. A text/binary frame with `fin=0` opens a
    /// fragmented message; subsequent continuation frames are appended until
    /// one arrives with `fin=1`. Control frames (ping/pong/close) may still
    /// appear interleaved between the fragments, per RFC 6455 section 5.4.
    async fn read_frame(&mut self, deadline: Deadline) -> Result<Vec<u8>, Fail> {
        let mut assembling: Option<Vec<u8>> = None;
        loop {
            let (fin, opcode, payload) = self.read_raw_frame(deadline).await?;
            match opcode {
                OPCODE_TEXT | OPCODE_BINARY => {
                    if assembling.is_some() {
                        return Err(Fail::Protocol {
                            details: "new data frame while a fragmented message is in progress",
                        });
                    }
                    if fin {
                        return Ok(payload);
                    }
                    assembling = Some(payload);
                }
                OPCODE_CONTINUATION => {
                    let buf = assembling.as_mut().ok_or(Fail::Protocol {
                        details: "continuation frame with no initiating data frame",
                    })?;
                    if buf.len() + payload.len() > self.max_frame_len {
                        return Err(Fail::MessageTooLong {
                            details: "reassembled websocket message exceeds the configured maximum",
                        });
                    }
                    buf.extend_from_slice(&payload);
                    if fin {
                        return Ok(assembling.take().unwrap());
                    }
                }
                OPCODE_PING => self.write_frame(OPCODE_PONG, &payload, deadline).await?,
                OPCODE_PONG => {}
                OPCODE_CLOSE => return Err(Fail::ConnectionAborted),
                _ => return Err(Fail::Protocol { details: "protocol violation" }),
            }
        }
    }

    /// Closes the connection gracefully: sends a close frame, then drains
    /// and discards any frames the peer sends in reply until its own close
    /// frame arrives (or the connection simply ends), bounded by
    /// `deadline`. Returns the underlying stream either way once the
    /// close frame has gone out.
    pub async fn detach(mut self, deadline: Deadline) -> Result<S, Fail> {
        self.write_frame(OPCODE_CLOSE, &[], deadline).await?;
        loop {
            match self.read_frame(deadline).await {
                Ok(_) => continue,
                Err(Fail::ConnectionAborted) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.inner)
    }
}

impl<S: crate::sock::ByteStream> Message for WsRawSocket<S> {
    fn send_msg<'a>(&'a mut self, iov: &'a [IoSlice<'a>], deadline: Deadline) -> SendFuture<'a> {
        Box::pin(async move {
            if iolist_len(iov) > self.max_frame_len {
                return Err(Fail::MessageTooLong {
                    details: "message exceeds the configured maximum",
                });
            }
            let payload = crate::sock::flatten(iov);
            self.write_frame(OPCODE_BINARY, &payload, deadline).await
        })
    }

    fn recv_msg<'a>(
        &'a mut self,
        iov: &'a mut [IoSliceMut<'a>],
        deadline: Deadline,
    ) -> RecvFuture<'a> {
        Box::pin(async move {
            let payload = self.read_frame(deadline).await?;
            let cap: usize = iov.iter().map(|s| s.len()).sum();
            if payload.len() > cap {
                return Err(Fail::MessageTooLong {
                    details: "message is larger than the caller's receive buffer",
                });
            }
            Ok(copy_into_iov(iov, &payload))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    use crate::sched::Scheduler;
    use crate::sock::ByteStream;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn fragmented_message_is_reassembled() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut ws = WsRawSocket::new(stream, false, 1 << 16);
                let mut buf = [0u8; 32];
                let n = ws
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap();
                assert_eq!(&buf[..n], b"hello world");
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            // fin=0 text "hello ", then fin=1 continuation "world", both unmasked.
            let mut raw = vec![0x01u8, 6];
            raw.extend_from_slice(b"hello ");
            raw.push(0x80);
            raw.push(5);
            raw.extend_from_slice(b"world");
            client.send(&[IoSlice::new(&raw)], None).await.unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn continuation_without_initiating_frame_is_a_protocol_error() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut ws = WsRawSocket::new(stream, false, 1 << 16);
                let mut buf = [0u8; 32];
                let err = ws
                    .recv_msg(&mut [IoSliceMut::new(&mut buf)], None)
                    .await
                    .unwrap_err();
                assert_eq!(
                    err,
                    Fail::Protocol { details: "continuation frame with no initiating data frame" }
                );
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let raw = vec![0x80u8, 0]; // fin=1, opcode=continuation, empty payload
            client.send(&[IoSlice::new(&raw)], None).await.unwrap();
            server.wait().await;
        });
    }

    #[test]
    fn detach_sends_a_close_frame_and_waits_for_the_peers() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let ws = WsRawSocket::new(stream, false, 1 << 16);
                let _raw: TcpStream = ws.detach(None).await.unwrap();
            });
            let mut client = TcpStream::connect(addr, None).await.unwrap();
            let mut header = [0u8; 2];
            client
                .recv(&mut [IoSliceMut::new(&mut header)], None)
                .await
                .unwrap();
            assert_eq!(header, [0x88, 0]); // fin=1, opcode=close, empty payload
            let close = [0x88u8, 0];
            client.send(&[IoSlice::new(&close)], None).await.unwrap();
            server.wait().await;
        });
    }
}
