// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `LibOs`: the top-level facade an embedding binary actually holds. It
//! owns the scheduler and the handle table and exposes the small,
//! errno-flavored operation set the rest of this crate is built to
//! support -- socket creation, bind/listen/accept/connect, send/recv,
//! close, and the `attach`/`detach` pairing a protocol adapter uses to
//! take over a raw handle and later hand the raw stream back.
//!
//! Listeners (`TcpListener`/`IpcListener`) are not themselves handles:
//! they don't implement [`ByteStream`] or [`Message`], and giving them
//! table entries would mean inventing a third `Resource` interface just
//! for `accept`. Callers hold them directly -- a listening socket is a
//! different kind of thing from a connected one, and doesn't need the
//! same lifecycle.

use crate::{
    fail::Fail,
    handle::{Donable, DoneFuture, Handle, HandleTable, Resource},
    logctx,
    proto::{
        crlf::CrlfSocket,
        http::HttpSocket,
        hup::HupSocket,
        prefix::{Endian, PrefixSocket},
        socks5,
        suffix::SuffixSocket,
        tcpmux,
        term::TermSocket,
        tls::TlsStream,
        ws,
    },
    sched::Scheduler,
    sock::{ByteStream, Message},
    timer::Deadline,
    transport::{
        happy_eyeballs,
        ipc::{IpcListener, IpcStream},
        tcp::{TcpListener, TcpStream},
        udp::UdpSocket,
    },
};
use openssl::ssl::{SslAcceptor, SslConnector, SslFiletype, SslMethod};
use std::{
    io::{IoSlice, IoSliceMut},
    net::SocketAddr,
    path::{Path, PathBuf},
    rc::Rc,
};

/// Certificate/key material for the `tls` adapter's server side. The
/// client side needs none of this -- verification uses the system trust
/// store via `openssl`'s default `SslConnector`.
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

fn build_connector() -> Result<SslConnector, Fail> {
    SslConnector::builder(SslMethod::tls())
        .map(|b| b.build())
        .map_err(|_| Fail::Protocol {
            details: "failed to initialize tls client context",
        })
}

fn build_acceptor(options: &TlsOptions) -> Result<SslAcceptor, Fail> {
    let cert = options.cert_path.as_deref().ok_or(Fail::Invalid {
        details: "tls server requires a certificate path",
    })?;
    let key = options.key_path.as_deref().ok_or(Fail::Invalid {
        details: "tls server requires a private key path",
    })?;
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(|_| {
        Fail::Protocol {
            details: "failed to initialize tls server context",
        }
    })?;
    builder
        .set_private_key_file(key, SslFiletype::PEM)
        .map_err(|_| Fail::Invalid {
            details: "invalid tls private key",
        })?;
    builder
        .set_certificate_chain_file(cert)
        .map_err(|_| Fail::Invalid {
            details: "invalid tls certificate chain",
        })?;
    Ok(builder.build())
}

/// Wraps any [`ByteStream`] as a handle-table resource. Every transport
/// and byte-oriented protocol adapter goes into the table through this
/// rather than each one defining its own [`Resource`] impl.
struct ByteStreamResource<S>(S);

impl<S: ByteStream + Donable + 'static> Resource for ByteStreamResource<S> {
    fn as_bytestream(&mut self) -> Option<&mut dyn ByteStream> {
        Some(&mut self.0)
    }

    fn close(&mut self) -> Result<(), Fail> {
        Ok(())
    }

    fn done<'a>(&'a mut self, deadline: Deadline) -> DoneFuture<'a> {
        Donable::done(&mut self.0, deadline)
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

/// Message-oriented counterpart of [`ByteStreamResource`], for UDP
/// sockets and the framing/websocket/etc. adapters.
struct MessageResource<S>(S);

impl<S: Message + Donable + 'static> Resource for MessageResource<S> {
    fn as_message(&mut self) -> Option<&mut dyn Message> {
        Some(&mut self.0)
    }

    fn close(&mut self) -> Result<(), Fail> {
        Ok(())
    }

    fn done<'a>(&'a mut self, deadline: Deadline) -> DoneFuture<'a> {
        Donable::done(&mut self.0, deadline)
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

/// Construction-time options for a [`LibOs`] instance.
pub struct LibOsOptions {
    /// `flexi_logger` spec string, e.g. `"info"` or
    /// `"warn,nanort::sched=debug"`. Passed straight to [`logctx::init`].
    pub log_spec: String,
}

impl Default for LibOsOptions {
    fn default() -> Self {
        Self {
            log_spec: "info".to_string(),
        }
    }
}

/// The runtime instance. One per thread -- like [`Scheduler`] and
/// [`HandleTable`], it is not `Send`/`Sync`, but is cheaply `Clone`: every
/// clone shares the same underlying scheduler and handle table, the same
/// way cloning a `Scheduler` or `HandleTable` does. Tasks spawned with
/// [`crate::sched::go`] need a `'static` future, so a task that calls back
/// into `LibOs` holds a clone rather than a borrow.
pub struct LibOs {
    scheduler: Scheduler,
    handles: HandleTable,
    _logger: Rc<Option<flexi_logger::LoggerHandle>>,
}

impl Clone for LibOs {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            handles: self.handles.clone(),
            _logger: self._logger.clone(),
        }
    }
}

impl LibOs {
    pub fn new(options: LibOsOptions) -> Result<Self, Fail> {
        let logger = logctx::init(&options.log_spec).ok();
        let scheduler = Scheduler::new().map_err(Fail::from)?;
        Ok(Self {
            scheduler,
            handles: HandleTable::new(),
            _logger: Rc::new(logger),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Drives `fut` to completion on this instance's scheduler, running
    /// every other task spawned against it alongside.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.scheduler.block_on(fut)
    }

    // -- TCP --------------------------------------------------------

    pub fn bind_tcp(&self, addr: SocketAddr) -> Result<TcpListener, Fail> {
        TcpListener::bind(addr)
    }

    pub async fn accept_tcp(
        &self,
        listener: &mut TcpListener,
        deadline: Deadline,
    ) -> Result<(Handle, SocketAddr), Fail> {
        let (stream, addr) = listener.accept(deadline).await?;
        Ok((self.handles.make(Box::new(ByteStreamResource(stream))), addr))
    }

    pub async fn connect_tcp(&self, addr: SocketAddr, deadline: Deadline) -> Result<Handle, Fail> {
        let stream = TcpStream::connect(addr, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(stream))))
    }

    /// Connects to `host:port` via Happy Eyeballs dialing rather than a
    /// single resolved address.
    pub async fn dial_tcp(&self, host: &str, port: u16, deadline: Deadline) -> Result<Handle, Fail> {
        let stream = happy_eyeballs::dial(host, port, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(stream))))
    }

    // -- UDP --------------------------------------------------------

    /// Binds an unconnected datagram socket: `recv_msg` accepts datagrams
    /// from any peer. Returns the bound address alongside the handle since
    /// `local` is commonly "pick any free port" (port `0`).
    pub fn socket_udp(&self, local: SocketAddr) -> Result<(Handle, SocketAddr), Fail> {
        let socket = UdpSocket::bind(local)?;
        let addr = socket.local_addr().map_err(Fail::from)?;
        Ok((self.handles.make(Box::new(MessageResource(socket))), addr))
    }

    /// Binds and connects a datagram socket to a single peer: every
    /// `send_msg` goes to `remote`, and `recv_msg` only returns datagrams
    /// from it.
    pub fn connect_udp(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<(Handle, SocketAddr), Fail> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        let addr = socket.local_addr().map_err(Fail::from)?;
        Ok((self.handles.make(Box::new(MessageResource(socket))), addr))
    }

    // -- IPC --------------------------------------------------------

    pub fn bind_ipc(&self, path: impl AsRef<Path>) -> Result<IpcListener, Fail> {
        IpcListener::bind(path)
    }

    pub async fn accept_ipc(&self, listener: &mut IpcListener, deadline: Deadline) -> Result<Handle, Fail> {
        let stream = listener.accept(deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(stream))))
    }

    pub async fn connect_ipc(&self, path: impl AsRef<Path>, deadline: Deadline) -> Result<Handle, Fail> {
        let stream = IpcStream::connect(path, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(stream))))
    }

    // -- Transfer, teardown, ownership --------------------------------

    pub async fn send(&self, h: Handle, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        self.handles.send(h, &[IoSlice::new(buf)], deadline).await
    }

    pub async fn recv(&self, h: Handle, buf: &mut [u8], deadline: Deadline) -> Result<usize, Fail> {
        self.handles
            .recv(h, &mut [IoSliceMut::new(buf)], deadline)
            .await
    }

    pub async fn send_msg(&self, h: Handle, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        self.handles.send_msg(h, &[IoSlice::new(buf)], deadline).await
    }

    pub async fn recv_msg(&self, h: Handle, buf: &mut [u8], deadline: Deadline) -> Result<usize, Fail> {
        self.handles
            .recv_msg(h, &mut [IoSliceMut::new(buf)], deadline)
            .await
    }

    /// Outbound half-close: sends whatever "no more data/messages coming"
    /// signal the handle's resource defines -- a graceful FIN-and-drain
    /// for a raw TCP handle, a `term`/`hup` terminator message for those
    /// adapters. Not every handle supports this.
    pub async fn done(&self, h: Handle, deadline: Deadline) -> Result<(), Fail> {
        self.handles.done(h, deadline).await
    }

    pub fn close(&self, h: Handle) -> Result<(), Fail> {
        self.handles.close(h)
    }

    /// Transfers ownership of `h`'s object to a fresh handle, invalidating
    /// `h`. Used by callers that hand a socket off to another part of the
    /// program and want the old handle to stop working.
    pub fn hown(&self, h: Handle) -> Result<Handle, Fail> {
        self.handles.hown(h)
    }

    // -- Protocol adapter attach/detach --------------------------------
    //
    // `attach_*`/`detach_*` reach into the handle table via
    // `HandleTable::take`/`make`: take the raw resource out of its slot,
    // wrap (or unwrap) it, and reinsert. `term`/`hup` are generic over the
    // message transport they sit on (typically a framing adapter already
    // attached over TCP or IPC), so their attach/detach pairs carry an
    // explicit type parameter rather than a transport suffix.

    /// Wraps a raw TCP handle with the `prefix` framing adapter, returning
    /// a new handle that speaks [`Message`] instead of [`ByteStream`].
    /// `width` is the length header's size in bytes (1-8); see
    /// [`PrefixSocket::new`] for the failure conditions.
    pub fn attach_prefix_tcp(
        &self,
        h: Handle,
        max_msg_len: usize,
        width: usize,
        endian: Endian,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let framed = PrefixSocket::new(stream.0, max_msg_len, width, endian)?;
        Ok(self.handles.make(Box::new(MessageResource(framed))))
    }

    /// The inverse of [`LibOs::attach_prefix_tcp`]: unwraps the framing
    /// adapter and returns a handle to the raw TCP stream underneath.
    pub fn detach_prefix_tcp(&self, h: Handle) -> Result<Handle, Fail> {
        let framed = self
            .handles
            .take::<MessageResource<PrefixSocket<TcpStream>>>(h)?;
        Ok(self
            .handles
            .make(Box::new(ByteStreamResource(framed.0.into_inner()))))
    }

    /// Wraps a raw TCP handle with the `suffix` (delimiter-terminated)
    /// framing adapter.
    pub fn attach_suffix_tcp(
        &self,
        h: Handle,
        delim: impl Into<Vec<u8>>,
        max_msg_len: usize,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let framed = SuffixSocket::new(stream.0, delim, max_msg_len);
        Ok(self.handles.make(Box::new(MessageResource(framed))))
    }

    pub fn detach_suffix_tcp(&self, h: Handle) -> Result<Handle, Fail> {
        let framed = self
            .handles
            .take::<MessageResource<SuffixSocket<TcpStream>>>(h)?;
        Ok(self
            .handles
            .make(Box::new(ByteStreamResource(framed.0.into_inner()))))
    }

    /// Wraps a raw TCP handle with the `crlf` (line-oriented) framing
    /// adapter.
    pub fn attach_crlf_tcp(&self, h: Handle, max_msg_len: usize) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let framed = CrlfSocket::new(stream.0, max_msg_len);
        Ok(self.handles.make(Box::new(MessageResource(framed))))
    }

    pub fn detach_crlf_tcp(&self, h: Handle) -> Result<Handle, Fail> {
        let framed = self
            .handles
            .take::<MessageResource<CrlfSocket<TcpStream>>>(h)?;
        Ok(self
            .handles
            .make(Box::new(ByteStreamResource(framed.0.into_inner()))))
    }

    /// Layers the `term` terminator-message adapter over an already
    /// message-framed handle `M` (e.g. `PrefixSocket<TcpStream>`).
    pub fn attach_term<M: Message + 'static>(&self, h: Handle) -> Result<Handle, Fail> {
        let inner = self.handles.take::<MessageResource<M>>(h)?;
        Ok(self
            .handles
            .make(Box::new(MessageResource(TermSocket::new(inner.0)))))
    }

    /// The inverse of [`LibOs::attach_term`]: sends the terminator if it
    /// hasn't gone out yet, waits for the peer's own, and returns a handle
    /// to the underlying framed transport.
    pub async fn detach_term<M: Message + 'static>(
        &self,
        h: Handle,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let wrapped = self.handles.take::<MessageResource<TermSocket<M>>>(h)?;
        let inner = wrapped.0.detach(deadline).await?;
        Ok(self.handles.make(Box::new(MessageResource(inner))))
    }

    /// Layers the `hup` adapter (terminator plus an explicit peer-hangup
    /// signal) over an already message-framed handle `M`.
    pub fn attach_hup<M: Message + 'static>(&self, h: Handle) -> Result<Handle, Fail> {
        let inner = self.handles.take::<MessageResource<M>>(h)?;
        Ok(self
            .handles
            .make(Box::new(MessageResource(HupSocket::new(inner.0)))))
    }

    pub async fn detach_hup<M: Message + 'static>(
        &self,
        h: Handle,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let wrapped = self.handles.take::<MessageResource<HupSocket<M>>>(h)?;
        let inner = wrapped.0.detach(deadline).await?;
        Ok(self.handles.make(Box::new(MessageResource(inner))))
    }

    /// Wraps a raw TCP handle with an `http` request/response reader and
    /// writer. Unlike the framing adapters, `HttpSocket` implements
    /// neither [`ByteStream`] nor [`Message`] -- it's a line-oriented
    /// preamble reader, not a full-duration transport -- so it is handed
    /// back to the caller directly rather than through another handle,
    /// the same way a listener is.
    pub fn attach_http_tcp(&self, h: Handle) -> Result<HttpSocket<TcpStream>, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        Ok(HttpSocket::new(stream.0))
    }

    /// The inverse of [`LibOs::attach_http_tcp`]: reclaims the raw TCP
    /// stream underneath an [`HttpSocket`] once the preamble has been
    /// read or written.
    pub fn detach_http_tcp(&self, http: HttpSocket<TcpStream>) -> Handle {
        self.handles.make(Box::new(ByteStreamResource(http.into_inner())))
    }

    /// Runs the client side of the websocket upgrade handshake over a raw
    /// TCP handle, replacing it with a handle to the framed websocket.
    pub async fn attach_ws_client_tcp(
        &self,
        h: Handle,
        host: &str,
        resource: &str,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let socket = ws::connect(stream.0, host, resource, deadline).await?;
        Ok(self.handles.make(Box::new(MessageResource(socket))))
    }

    /// Runs the server side of the handshake.
    pub async fn attach_ws_server_tcp(&self, h: Handle, deadline: Deadline) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let socket = ws::accept(stream.0, deadline).await?;
        Ok(self.handles.make(Box::new(MessageResource(socket))))
    }

    /// Wraps a raw TCP handle directly as the `wsraw` frame-level socket,
    /// with no HTTP upgrade handshake -- for peers that have already
    /// agreed out-of-band to speak websocket frames.
    pub fn attach_wsraw_tcp(
        &self,
        h: Handle,
        is_client: bool,
        max_frame_len: usize,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let socket = ws::WsRawSocket::new(stream.0, is_client, max_frame_len);
        Ok(self.handles.make(Box::new(MessageResource(socket))))
    }

    /// The inverse of both [`LibOs::attach_ws_client_tcp`]/
    /// [`LibOs::attach_ws_server_tcp`] and [`LibOs::attach_wsraw_tcp`]:
    /// sends a close frame, drains the peer's reply frames, and returns a
    /// handle to the raw TCP stream underneath.
    pub async fn detach_ws_tcp(&self, h: Handle, deadline: Deadline) -> Result<Handle, Fail> {
        let wrapped = self
            .handles
            .take::<MessageResource<ws::WsRawSocket<TcpStream>>>(h)?;
        let raw = wrapped.0.detach(deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(raw))))
    }

    /// Runs the client side of a SOCKS5 handshake over an already
    /// connected TCP handle, requesting a `CONNECT` to `target`. Unlike
    /// the framing adapters, this doesn't change what a handle's data
    /// looks like once negotiation finishes -- the same handle carries
    /// the relayed bytes directly -- so there is no attach/detach pair,
    /// just the negotiation itself. Returns the address the proxy bound
    /// on its side.
    pub async fn socks5_client_connect_tcp(
        &self,
        h: Handle,
        target: socks5::Target,
        auth: Option<&socks5::Credentials>,
        deadline: Deadline,
    ) -> Result<SocketAddr, Fail> {
        let resource = self.handles.get_resource(h)?;
        let mut guard = resource.try_borrow_mut().map_err(|_| Fail::ResourceExhausted {
            details: "handle is busy with another operation",
        })?;
        let stream = guard.as_bytestream().ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })?;
        socks5::client_connect(stream, target, auth, deadline).await
    }

    /// Runs the server side: negotiates a method and reads the `CONNECT`
    /// request, returning the requested target. The caller makes the
    /// outbound connection itself and replies with
    /// [`LibOs::socks5_server_reply_tcp`].
    pub async fn socks5_server_negotiate_tcp(
        &self,
        h: Handle,
        authenticator: Option<&dyn Fn(&str, &str) -> bool>,
        deadline: Deadline,
    ) -> Result<socks5::Target, Fail> {
        let resource = self.handles.get_resource(h)?;
        let mut guard = resource.try_borrow_mut().map_err(|_| Fail::ResourceExhausted {
            details: "handle is busy with another operation",
        })?;
        let stream = guard.as_bytestream().ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })?;
        socks5::server_negotiate(stream, authenticator, deadline).await
    }

    pub async fn socks5_server_reply_tcp(
        &self,
        h: Handle,
        result: Result<SocketAddr, u8>,
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let resource = self.handles.get_resource(h)?;
        let mut guard = resource.try_borrow_mut().map_err(|_| Fail::ResourceExhausted {
            details: "handle is busy with another operation",
        })?;
        let stream = guard.as_bytestream().ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })?;
        socks5::server_reply(stream, result, deadline).await
    }

    /// Sends the `tcpmux` client handshake (the requested service name)
    /// over a raw IPC handle, returning a handle to the same connection
    /// ready for the handed-off conversation.
    pub async fn tcpmux_request_ipc(
        &self,
        h: Handle,
        service: &str,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<IpcStream>>(h)?;
        let raw = tcpmux::request(stream.0, service, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(raw))))
    }

    /// Broker side: reads the client's requested service off `h` and
    /// hands its connection off to whichever backend `broker` has
    /// registered for it. `h` is invalidated either way.
    pub async fn tcpmux_serve_one_ipc(
        &self,
        broker: &tcpmux::Broker,
        h: Handle,
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let stream = self.handles.take::<ByteStreamResource<IpcStream>>(h)?;
        tcpmux::serve_one(broker, stream.0, deadline).await
    }

    /// Backend side: accepts one handoff connection on `listener` and
    /// returns the requested service name alongside a handle to the
    /// client's connection.
    pub async fn tcpmux_accept_handoff_ipc(
        &self,
        listener: &mut IpcListener,
        deadline: Deadline,
    ) -> Result<(String, Handle), Fail> {
        let (service, stream) = tcpmux::accept_handoff(listener, deadline).await?;
        Ok((service, self.handles.make(Box::new(ByteStreamResource(stream)))))
    }

    /// Runs a TLS client handshake over a raw, already-connected TCP
    /// handle for the given SNI hostname, replacing it with a handle to
    /// the encrypted stream. There is no `detach_tls_*`: unlike framing,
    /// a TLS session cannot be unwound back to the plaintext stream once
    /// started.
    pub async fn attach_tls_client_tcp(
        &self,
        h: Handle,
        domain: &str,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let connector = build_connector()?;
        let tls = TlsStream::connect(&connector, domain, stream.0, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(tls))))
    }

    /// Runs the server side of the handshake, using `options` for the
    /// certificate chain and private key.
    pub async fn attach_tls_server_tcp(
        &self,
        h: Handle,
        options: &TlsOptions,
        deadline: Deadline,
    ) -> Result<Handle, Fail> {
        let stream = self.handles.take::<ByteStreamResource<TcpStream>>(h)?;
        let acceptor = build_acceptor(options)?;
        let tls = TlsStream::accept(&acceptor, stream.0, deadline).await?;
        Ok(self.handles.make(Box::new(ByteStreamResource(tls))))
    }
}
