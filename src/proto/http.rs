// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `http`: request/status line and header operations layered on [`crlf`],
//! enough surface for the websocket handshake (and any other adapter that
//! needs to speak a line-oriented HTTP/1.1 preamble) without pulling in a
//! full HTTP stack.

use crate::{
    fail::Fail,
    proto::crlf::CrlfSocket,
    sock::{ByteStream, Message},
    timer::Deadline,
};
use std::io::{IoSlice, IoSliceMut};

const MAX_LINE_LEN: usize = 8192;

pub struct HttpSocket<S> {
    inner: CrlfSocket<S>,
}

/// A parsed HTTP header field: name comparisons are case-insensitive per
/// RFC 7230, so lookups go through [`HeaderList::get`] rather than direct
/// field access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(pub Vec<Header>);

impl HeaderList {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

impl<S: ByteStream> HttpSocket<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: CrlfSocket::new(inner, MAX_LINE_LEN),
        }
    }

    pub async fn send_request(
        &mut self,
        method: &str,
        resource: &str,
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let line = format!("{method} {resource} HTTP/1.1");
        self.send_line(&line, deadline).await
    }

    pub async fn recv_request(&mut self, deadline: Deadline) -> Result<(String, String), Fail> {
        let line = self.recv_line(deadline).await?;
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().ok_or(Fail::Protocol { details: "protocol violation" })?.to_string();
        let resource = parts.next().ok_or(Fail::Protocol { details: "protocol violation" })?.to_string();
        Ok((method, resource))
    }

    pub async fn send_status(
        &mut self,
        code: u16,
        reason: &str,
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let line = format!("HTTP/1.1 {code} {reason}");
        self.send_line(&line, deadline).await
    }

    pub async fn recv_status(&mut self, deadline: Deadline) -> Result<(u16, String), Fail> {
        let line = self.recv_line(deadline).await?;
        let mut parts = line.splitn(3, ' ');
        let _version = parts.next().ok_or(Fail::Protocol { details: "protocol violation" })?;
        let code: u16 = parts
            .next()
            .ok_or(Fail::Protocol { details: "protocol violation" })?
            .parse()
            .map_err(|_| Fail::Protocol { details: "protocol violation" })?;
        let reason = parts.next().unwrap_or("").to_string();
        Ok((code, reason))
    }

    pub async fn send_header(&mut self, name: &str, value: &str, deadline: Deadline) -> Result<(), Fail> {
        let line = format!("{name}: {value}");
        self.send_line(&line, deadline).await
    }

    /// Reads header lines until the blank line that terminates the block.
    pub async fn recv_headers(&mut self, deadline: Deadline) -> Result<HeaderList, Fail> {
        let mut headers = Vec::new();
        loop {
            let line = self.recv_line(deadline).await?;
            if line.is_empty() {
                return Ok(HeaderList(headers));
            }
            let (name, value) = line.split_once(':').ok_or(Fail::Protocol { details: "protocol violation" })?;
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    /// Sends the blank line that terminates a header block.
    pub async fn end_headers(&mut self, deadline: Deadline) -> Result<(), Fail> {
        self.send_line("", deadline).await
    }

    async fn send_line(&mut self, line: &str, deadline: Deadline) -> Result<(), Fail> {
        self.inner
            .send_msg(&[IoSlice::new(line.as_bytes())], deadline)
            .await
    }

    async fn recv_line(&mut self, deadline: Deadline) -> Result<String, Fail> {
        let mut buf = vec![0u8; MAX_LINE_LEN];
        let n = self
            .inner
            .recv_msg(&mut [IoSliceMut::new(&mut buf)], deadline)
            .await?;
        String::from_utf8(buf[..n].to_vec()).map_err(|_| Fail::Protocol { details: "protocol violation" })
    }

    /// Unwraps the crlf/byte-stream layering to hand the raw transport to a
    /// protocol that takes over after the HTTP preamble (e.g. `ws`'s upgrade
    /// handshake).
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
    use crate::transport::tcp::{TcpListener, TcpStream};

    #[test]
    fn request_status_and_headers_roundtrip() {
        let sched = Scheduler::new().unwrap();
        sched.block_on(async {
            let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let addr = listener.local_addr().unwrap();
            let server = crate::sched::go(async move {
                let (stream, _) = listener.accept(None).await.unwrap();
                let mut sock = HttpSocket::new(stream);
                let (method, resource) = sock.recv_request(None).await.unwrap();
                assert_eq!(method, "GET");
                assert_eq!(resource, "/chat");
                let headers = sock.recv_headers(None).await.unwrap();
                assert_eq!(headers.get("Upgrade"), Some("websocket"));
                sock.send_status(101, "Switching Protocols", None)
                    .await
                    .unwrap();
                sock.send_header("Upgrade", "websocket", None)
                    .await
                    .unwrap();
                sock.end_headers(None).await.unwrap();
            });
            let client_stream = TcpStream::connect(addr, None).await.unwrap();
            let mut client = HttpSocket::new(client_stream);
            client.send_request("GET", "/chat", None).await.unwrap();
            client
                .send_header("Upgrade", "websocket", None)
                .await
                .unwrap();
            client.end_headers(None).await.unwrap();
            let (code, reason) = client.recv_status(None).await.unwrap();
            assert_eq!(code, 101);
            assert_eq!(reason, "Switching Protocols");
            let headers = client.recv_headers(None).await.unwrap();
            assert_eq!(headers.get("upgrade"), Some("websocket"));
            server.wait().await;
        });
    }
}
